/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Function boundary detection and basic-block partitioning (§4.G).

use std::collections::BTreeSet;

use crate::disasm::{Disassembler, FlowKind};
use crate::error::{Result, Warning, Warnings};
use crate::macho::ParsedBinary;

pub use crate::disasm::DecodedInsn;

/// A straight-line run of instructions with no internal branch targets or
/// branch instructions except possibly the last (§3: `BasicBlock`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicBlock {
    pub start: u64,
    pub end: u64,
}

/// A disassembled function: its extent, every decoded instruction, and the
/// basic-block partition of that extent (§3: `Function`).
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub entry: u64,
    pub end: u64,
    pub instructions: Vec<DecodedInsn>,
    pub basic_blocks: Vec<BasicBlock>,
}

impl Function {
    pub fn instruction_at(&self, address: u64) -> Option<&DecodedInsn> {
        self.instructions.iter().find(|i| i.address == address)
    }

    pub fn basic_block_containing(&self, address: u64) -> Option<BasicBlock> {
        self.basic_blocks
            .iter()
            .copied()
            .find(|b| address >= b.start && address < b.end)
    }
}

/// Upper bound on instructions scanned for one function, guarding against a
/// pathological or adversarial binary whose branch web never settles.
const MAX_FUNCTION_INSTRUCTIONS: usize = 200_000;

/// Disassembles linearly from `entry`, extending past `ret`/unconditional
/// branches while an earlier forward branch target inside the function has
/// not yet been reached, per §4.G. Returns `Ok(None)` (with a recorded
/// [`Warning::InvalidBytecode`]) if decoding fails mid-function, so the
/// caller can abandon just this function while the rest of the binary
/// proceeds (§7).
pub fn build_function(
    binary: &ParsedBinary,
    disasm: &Disassembler,
    entry: u64,
    warnings: &mut Warnings,
    strict: bool,
) -> Result<Option<Function>> {
    let mut instructions = Vec::new();
    let mut frontier: BTreeSet<u64> = BTreeSet::new();
    let mut cursor = entry;

    loop {
        if instructions.len() >= MAX_FUNCTION_INSTRUCTIONS {
            break;
        }
        let bytes = match binary.vm_read(cursor, 4) {
            Ok(b) => b,
            Err(_) => {
                warnings.push(
                    Warning::InvalidBytecode {
                        function: entry,
                        address: cursor,
                    },
                    strict,
                )?;
                return Ok(None);
            }
        };
        let insn = match disasm.disassemble_one(bytes, cursor) {
            Ok(i) => i,
            Err(_) => {
                warnings.push(
                    Warning::InvalidBytecode {
                        function: entry,
                        address: cursor,
                    },
                    strict,
                )?;
                return Ok(None);
            }
        };

        let next_cursor = cursor + insn.size as u64;

        if let FlowKind::DirectBranch { conditional } = insn.flow {
            if let Some(target) = insn.branch_target {
                if conditional || target != next_cursor {
                    frontier.insert(target);
                }
            }
        }

        let terminates = matches!(insn.flow, FlowKind::Return)
            || matches!(insn.flow, FlowKind::DirectBranch { conditional: false })
            || matches!(insn.flow, FlowKind::IndirectBranch);

        instructions.push(insn);
        cursor = next_cursor;

        if terminates {
            let pending = frontier.iter().any(|&t| t >= cursor);
            if !pending {
                break;
            }
        }
    }

    let end = cursor;
    let basic_blocks = partition_basic_blocks(entry, end, &instructions);

    Ok(Some(Function {
        entry,
        end,
        instructions,
        basic_blocks,
    }))
}

/// Block boundaries are the entry, every address immediately following a
/// branch, and every in-function direct-branch target (never `bl`, a call
/// rather than a block edge) -- §4.G.
fn partition_basic_blocks(entry: u64, end: u64, instructions: &[DecodedInsn]) -> Vec<BasicBlock> {
    let mut boundaries: BTreeSet<u64> = BTreeSet::new();
    boundaries.insert(entry);

    for insn in instructions {
        let next = insn.address + insn.size as u64;
        if insn.is_branch_or_call() && next < end {
            boundaries.insert(next);
        }
        if let FlowKind::DirectBranch { .. } = insn.flow {
            if let Some(target) = insn.branch_target {
                if target >= entry && target < end {
                    boundaries.insert(target);
                }
            }
        }
    }

    let bounds: Vec<u64> = boundaries.into_iter().collect();
    let mut blocks = Vec::with_capacity(bounds.len());
    for (i, &start) in bounds.iter().enumerate() {
        let block_end = bounds.get(i + 1).copied().unwrap_or(end);
        blocks.push(BasicBlock { start, end: block_end });
    }
    blocks
}
