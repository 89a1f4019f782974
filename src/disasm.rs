/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The disassembler boundary (§4.J).
//!
//! All use of the `capstone` crate is confined to this module, the same way
//! the teacher confines its wrapped C library to one module: nothing in
//! `analyzer/` ever sees a `capstone::Insn`. Only ARM64 is disassembled;
//! other architectures are structurally parsed by `macho/` but never reach
//! this module.

use capstone::arch::arm64::Arm64OperandType;
use capstone::arch::{self, BuildsCapstone};
use capstone::prelude::*;
use smallvec::SmallVec;

use crate::error::{Error, Result};

/// ARM64 instructions this crate cares about carry at most four operands
/// (e.g. `add x0, x1, x2, lsl #3`); `SmallVec` keeps the common case off the
/// heap without giving up `Vec`'s growth for the rare wider case.
pub type OperandList = SmallVec<[Operand; 4]>;

/// An operand of a [DecodedInsn], reduced to the three shapes the dataflow
/// analyzer's patterns care about (§4.H).
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Reg(String),
    Imm(i64),
    Mem { base: Option<String>, disp: i64 },
}

/// How a decoded instruction affects control flow, the classification
/// `analyzer/function.rs` partitions basic blocks on (§4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Sequential,
    /// `b`, `b.cond`, `cbz`/`cbnz`, `tbz`/`tbnz` -- direct, not a call.
    DirectBranch { conditional: bool },
    /// `bl` -- direct call.
    Call,
    /// `blr` -- indirect call.
    IndirectCall,
    /// `br` -- indirect branch, not a call (e.g. a jump table or tail call).
    IndirectBranch,
    Return,
}

/// One decoded ARM64 instruction, independent of the underlying
/// disassembler's own instruction type (§4.J).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedInsn {
    pub address: u64,
    pub size: u8,
    pub mnemonic: String,
    pub op_str: String,
    pub operands: OperandList,
    pub flow: FlowKind,
    /// Resolved target of a direct branch or call; `None` for indirect
    /// control flow or non-branches.
    pub branch_target: Option<u64>,
}

impl DecodedInsn {
    pub fn is_branch_or_call(&self) -> bool {
        !matches!(self.flow, FlowKind::Sequential)
    }
}

/// Thin wrapper around a `capstone::Capstone` configured for little-endian
/// ARM64 (§4.J).
pub struct Disassembler {
    cs: Capstone,
}

impl Disassembler {
    pub fn new() -> Result<Disassembler> {
        let cs = Capstone::new()
            .arm64()
            .mode(arch::arm64::ArchMode::Arm)
            .detail(true)
            .build()?;
        Ok(Disassembler { cs })
    }

    /// Decodes exactly one instruction at `address`, starting from the front
    /// of `bytes`. `bytes` must contain at least 4 bytes.
    pub fn disassemble_one(&self, bytes: &[u8], address: u64) -> Result<DecodedInsn> {
        let insns = self
            .cs
            .disasm_count(bytes, address, 1)
            .map_err(|e| Error::Disassembly { address, source: e })?;
        let insn = insns
            .iter()
            .next()
            .ok_or(Error::Disassembly { address, source: capstone::Error::CustomError("no instruction decoded") })?;
        self.decode(&insn)
    }

    /// Decodes instructions starting at `address` until `bytes` is
    /// exhausted or a decode fails; used by the function partitioner to walk
    /// forward linearly from an entry-point candidate (§4.G).
    pub fn disassemble_range(&self, bytes: &[u8], address: u64) -> Result<Vec<DecodedInsn>> {
        let insns = self
            .cs
            .disasm_all(bytes, address)
            .map_err(|e| Error::Disassembly { address, source: e })?;
        insns.iter().map(|insn| self.decode(&insn)).collect()
    }

    fn decode(&self, insn: &capstone::Insn<'_>) -> Result<DecodedInsn> {
        let address = insn.address();
        let mnemonic = insn.mnemonic().unwrap_or("").to_ascii_lowercase();
        let op_str = insn.op_str().unwrap_or("").to_string();
        let detail = self
            .cs
            .insn_detail(insn)
            .map_err(|e| Error::Disassembly { address, source: e })?;
        let arch_detail = detail.arch_detail();
        let arm64_detail = arch_detail.arm64().ok_or(Error::Disassembly {
            address,
            source: capstone::Error::CustomError("not an arm64 instruction"),
        })?;

        let mut operands = OperandList::new();
        let mut branch_target = None;
        for op in arm64_detail.operands() {
            match op.op_type {
                Arm64OperandType::Reg(reg) => {
                    let name = self.cs.reg_name(reg).unwrap_or_default();
                    operands.push(Operand::Reg(name));
                }
                Arm64OperandType::Imm(imm) => {
                    operands.push(Operand::Imm(imm));
                    if branch_target.is_none() && Self::is_branch_mnemonic(&mnemonic) {
                        branch_target = Some(imm as u64);
                    }
                }
                Arm64OperandType::Mem(mem) => {
                    let base = if mem.base().0 != 0 {
                        self.cs.reg_name(mem.base())
                    } else {
                        None
                    };
                    operands.push(Operand::Mem {
                        base,
                        disp: mem.disp() as i64,
                    });
                }
                _ => {}
            }
        }
        // Branch-with-link-register immediates and conditional branches put
        // their target as the *last* immediate operand; `cbz`/`tbz` put it
        // after the tested register(s).
        if branch_target.is_none() {
            if let Some(Operand::Imm(v)) = operands.last() {
                if Self::is_branch_mnemonic(&mnemonic) {
                    branch_target = Some(*v as u64);
                }
            }
        }

        let flow = Self::classify(&mnemonic);
        let branch_target = match flow {
            FlowKind::DirectBranch { .. } | FlowKind::Call => branch_target,
            _ => None,
        };

        Ok(DecodedInsn {
            address,
            size: insn.bytes().len() as u8,
            mnemonic,
            op_str,
            operands,
            flow,
            branch_target,
        })
    }

    fn is_branch_mnemonic(mnemonic: &str) -> bool {
        mnemonic == "b"
            || mnemonic.starts_with("b.")
            || mnemonic == "bl"
            || mnemonic == "cbz"
            || mnemonic == "cbnz"
            || mnemonic == "tbz"
            || mnemonic == "tbnz"
    }

    fn classify(mnemonic: &str) -> FlowKind {
        match mnemonic {
            "ret" => FlowKind::Return,
            "bl" => FlowKind::Call,
            "blr" => FlowKind::IndirectCall,
            "br" => FlowKind::IndirectBranch,
            "b" => FlowKind::DirectBranch { conditional: false },
            "cbz" | "cbnz" | "tbz" | "tbnz" => FlowKind::DirectBranch { conditional: true },
            m if m.starts_with("b.") => FlowKind::DirectBranch { conditional: true },
            _ => FlowKind::Sequential,
        }
    }
}
