/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Per-instruction, flow-insensitive constant propagation (§4.H).
//!
//! Deliberately not a fixpoint dataflow: register state resets to
//! [RegisterContents::Unknown] at the top of every basic block except the
//! function's entry block, where `X0..X7` start as
//! [RegisterContents::FunctionArgumentIndex]. This is enough to recover
//! Objective-C call targets and string-literal loads within one block
//! without the complexity (and non-termination risk) of a real fixpoint
//! solver.

use std::collections::HashMap;

use crate::analyzer::function::{BasicBlock, Function};
use crate::disasm::Operand;
use crate::macho::ParsedBinary;
use crate::reader::{ByteView, Endian};

/// What has been proved about a register's contents at a given point (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterContents {
    Unknown,
    Immediate(i64),
    MemoryAddress(u64),
    FunctionArgumentIndex(u8),
}

/// Register file as of one point in a basic block.
#[derive(Debug, Clone, Default)]
struct RegFile(HashMap<String, RegisterContents>);

impl RegFile {
    fn get(&self, reg: &str) -> RegisterContents {
        self.0
            .get(&normalize(reg))
            .copied()
            .unwrap_or(RegisterContents::Unknown)
    }

    fn set(&mut self, reg: &str, value: RegisterContents) {
        self.0.insert(normalize(reg), value);
    }
}

/// `w0` and `x0` name the same architectural register for this analyzer's
/// purposes; writes through either alias the same slot.
fn normalize(reg: &str) -> String {
    if let Some(rest) = reg.strip_prefix('w') {
        if rest.chars().all(|c| c.is_ascii_digit()) {
            return format!("x{rest}");
        }
    }
    match reg {
        "wzr" => "xzr".to_string(),
        other => other.to_string(),
    }
}

fn entry_register_file() -> RegFile {
    let mut file = RegFile::default();
    for i in 0..8u8 {
        file.set(&format!("x{i}"), RegisterContents::FunctionArgumentIndex(i));
    }
    file
}

/// Reads a `u64` from wherever `address` maps to in the binary's segments,
/// used by the `ldr` pattern's generic dereference case (§4.H).
fn read_u64_at(binary: &ParsedBinary, address: u64) -> Option<u64> {
    let bytes = binary.vm_read(address, 8).ok()?;
    ByteView::new(bytes, Endian::Little).read_u64(0).ok()
}

/// Extracts the `lsl #N` shift amount from an operand string such as
/// `"x0, #0x1234, lsl #16"`, defaulting to 0 when absent.
fn shift_amount(op_str: &str) -> u32 {
    let Some(rest) = op_str.split("lsl").nth(1) else {
        return 0;
    };
    let Some(digits) = rest.trim().strip_prefix('#') else {
        return 0;
    };
    let digits = digits.trim_end_matches(|c: char| !c.is_ascii_hexdigit() && c != 'x');
    if let Some(hex) = digits.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).unwrap_or(0)
    } else {
        digits.parse().unwrap_or(0)
    }
}

/// Computes `get_register_contents_at_instruction` (§6): simulates forward
/// from the top of `at_address`'s basic block up to (but not including)
/// that instruction.
pub fn register_contents_at(
    binary: &ParsedBinary,
    function: &Function,
    register: &str,
    at_address: u64,
) -> RegisterContents {
    let Some(block) = function.basic_block_containing(at_address) else {
        return RegisterContents::Unknown;
    };
    let mut file = if block.start == function.entry {
        entry_register_file()
    } else {
        RegFile::default()
    };

    for insn in &function.instructions {
        if insn.address < block.start {
            continue;
        }
        if insn.address >= at_address || insn.address >= block.end {
            break;
        }
        apply(binary, &mut file, insn);
    }

    file.get(register)
}

/// All instructions belonging to `block`, in the order they execute.
pub fn instructions_in_block<'a>(function: &'a Function, block: BasicBlock) -> impl Iterator<Item = &'a crate::disasm::DecodedInsn> {
    function
        .instructions
        .iter()
        .filter(move |i| i.address >= block.start && i.address < block.end)
}

fn apply(binary: &ParsedBinary, file: &mut RegFile, insn: &crate::disasm::DecodedInsn) {
    let ops = &insn.operands;
    match insn.mnemonic.as_str() {
        "mov" => {
            if let [Operand::Reg(d), Operand::Imm(v)] = ops.as_slice() {
                file.set(d, RegisterContents::Immediate(*v));
                return;
            }
            if let [Operand::Reg(d), Operand::Reg(s)] = ops.as_slice() {
                let v = file.get(s);
                file.set(d, v);
                return;
            }
        }
        "movz" => {
            if let [Operand::Reg(d), Operand::Imm(v)] = ops.as_slice() {
                let shift = shift_amount(&insn.op_str);
                file.set(d, RegisterContents::Immediate(v << shift));
                return;
            }
        }
        "movk" => {
            if let [Operand::Reg(d), Operand::Imm(v)] = ops.as_slice() {
                let shift = shift_amount(&insn.op_str);
                let base = match file.get(d) {
                    RegisterContents::Immediate(b) => b,
                    _ => 0,
                };
                let mask = !(0xffffi64 << shift);
                file.set(d, RegisterContents::Immediate((base & mask) | (v << shift)));
                return;
            }
        }
        "adrp" => {
            if let [Operand::Reg(d), Operand::Imm(page)] = ops.as_slice() {
                file.set(d, RegisterContents::MemoryAddress(*page as u64));
                return;
            }
        }
        "adr" => {
            if let [Operand::Reg(d), Operand::Imm(target)] = ops.as_slice() {
                file.set(d, RegisterContents::MemoryAddress(*target as u64));
                return;
            }
        }
        "add" => {
            if let [Operand::Reg(d), Operand::Reg(s), Operand::Imm(off)] = ops.as_slice() {
                if d == s {
                    if let RegisterContents::MemoryAddress(base) = file.get(s) {
                        file.set(d, RegisterContents::MemoryAddress((base as i64 + off) as u64));
                        return;
                    }
                }
            }
        }
        "ldr" => {
            if let [Operand::Reg(d), Operand::Mem { base: Some(b), disp }] = ops.as_slice() {
                if let RegisterContents::MemoryAddress(base) = file.get(b) {
                    let addr = (base as i64 + disp) as u64;
                    match read_u64_at(binary, addr) {
                        Some(value) => file.set(d, RegisterContents::MemoryAddress(value)),
                        None => file.set(d, RegisterContents::MemoryAddress(addr)),
                    }
                    return;
                }
                file.set(d, RegisterContents::Unknown);
                return;
            }
        }
        _ => {}
    }

    // Any other instruction that writes a register invalidates stale
    // contents rather than leaving a prior value that no longer holds.
    if let Some(Operand::Reg(d)) = ops.first() {
        if writes_destination(&insn.mnemonic) {
            file.set(d, RegisterContents::Unknown);
        }
    }
}

fn writes_destination(mnemonic: &str) -> bool {
    !matches!(
        mnemonic,
        "cmp" | "cmn" | "tst" | "str" | "stur" | "stp" | "b" | "bl" | "blr" | "br" | "ret"
            | "nop" | "cbz" | "cbnz" | "tbz" | "tbnz"
    ) && !mnemonic.starts_with("b.")
}
