//! Indirect-branch rewriting: ordinary branches become indirect jumps
//! through read-only tables of block addresses.
//!
//! Conditional branches get a private two-entry table indexed by the
//! zero-extended condition, so index 0 is the false successor and index 1
//! the true successor. Simple unconditional branches share one module-wide
//! table of every non-entry block, indexed by a dense integer precomputed
//! per module; targets missing from the shared table (function entries)
//! fall back to a private singleton table. Every rewritten terminator
//! declares exactly the destinations reachable through its table — a
//! mismatch there is a correctness bug, not a recoverable condition.

use crate::{should_obfuscate, Transform};
use murk_core::ir::{
    BlockAddress, BlockId, FuncId, GlobalId, GlobalInit, ModuleIr, OpKind, Operand, Terminator,
};
use murk_utils::errors::PassError;
use murk_utils::prng::Prng;
use std::collections::HashMap;
use tracing::debug;

/// Rewrites branch terminators into table-indexed indirect jumps.
#[derive(Debug)]
pub struct IndirectBranch {
    pub default_on: bool,
}

impl Default for IndirectBranch {
    fn default() -> Self {
        Self { default_on: true }
    }
}

impl IndirectBranch {
    pub fn new(default_on: bool) -> Self {
        Self { default_on }
    }
}

impl Transform for IndirectBranch {
    fn name(&self) -> &'static str {
        "IndirectBranch"
    }

    fn apply(&self, module: &mut ModuleIr, _prng: &mut Prng) -> Result<bool, PassError> {
        let targeted: Vec<FuncId> = module
            .func_ids()
            .into_iter()
            .filter(|&id| should_obfuscate(self.default_on, module.function(id), "indirect"))
            .collect();
        if targeted.is_empty() {
            return Ok(false);
        }

        // Dense per-module index over every non-entry block of the
        // targeted functions. Entry blocks have no address a table may
        // hold, matching the data model.
        let mut entries: Vec<BlockAddress> = Vec::new();
        let mut index_of: HashMap<(FuncId, BlockId), u64> = HashMap::new();
        for &func in &targeted {
            let f = module.function(func);
            let entry = f.entry().ok_or(PassError::MalformedIr(
                "declaration passed the eligibility filter",
            ))?;
            for block in f.block_ids() {
                if block != entry {
                    index_of.insert((func, block), entries.len() as u64);
                    entries.push(BlockAddress { func, block });
                }
            }
        }

        // The shared table is materialized on first use so a module whose
        // unconditional branches all target entries does not grow an
        // unreferenced global.
        let mut shared_table: Option<GlobalId> = None;
        let mut private_count = 0u32;
        let mut changed = false;

        for &func in &targeted {
            let branches: Vec<(BlockId, Terminator)> = {
                let f = module.function(func);
                f.block_ids()
                    .into_iter()
                    .map(|b| (b, f.block(b).term.clone()))
                    .filter(|(_, t)| {
                        matches!(t, Terminator::Br { .. } | Terminator::CondBr { .. })
                    })
                    .collect()
            };
            for (block, term) in branches {
                match term {
                    Terminator::Br { target } => {
                        if let Some(&index) = index_of.get(&(func, target)) {
                            let table = *shared_table.get_or_insert_with(|| {
                                module.add_global(
                                    "branch_table",
                                    GlobalInit::BlockAddrs(entries.clone()),
                                    true,
                                    false,
                                )
                            });
                            let f = module.function_mut(func);
                            let gep = f.push_op(block, OpKind::Gep, vec![
                                Operand::Global(table),
                                Operand::Const(index),
                            ]);
                            let addr = f.push_op(block, OpKind::Load { order: None }, vec![
                                Operand::Value(gep),
                            ]);
                            f.set_term(block, Terminator::IndirectBr {
                                addr: Operand::Value(addr),
                                dests: vec![target],
                            });
                        } else {
                            // Entry-block target: ad-hoc singleton table.
                            let table = module.add_global(
                                format!("br_table_{private_count}"),
                                GlobalInit::BlockAddrs(vec![BlockAddress {
                                    func,
                                    block: target,
                                }]),
                                true,
                                false,
                            );
                            private_count += 1;
                            let f = module.function_mut(func);
                            let gep = f.push_op(block, OpKind::Gep, vec![
                                Operand::Global(table),
                                Operand::Const(0),
                            ]);
                            let addr = f.push_op(block, OpKind::Load { order: None }, vec![
                                Operand::Value(gep),
                            ]);
                            f.set_term(block, Terminator::IndirectBr {
                                addr: Operand::Value(addr),
                                dests: vec![target],
                            });
                        }
                        changed = true;
                    }
                    Terminator::CondBr {
                        cond,
                        then_to,
                        else_to,
                    } => {
                        // False first: the zero-extended condition is the
                        // table index, and false evaluates to 0.
                        let table = module.add_global(
                            format!("br_table_{private_count}"),
                            GlobalInit::BlockAddrs(vec![
                                BlockAddress {
                                    func,
                                    block: else_to,
                                },
                                BlockAddress {
                                    func,
                                    block: then_to,
                                },
                            ]),
                            true,
                            false,
                        );
                        private_count += 1;
                        let f = module.function_mut(func);
                        let index = f.push_op(block, OpKind::ZExt, vec![cond]);
                        let gep = f.push_op(block, OpKind::Gep, vec![
                            Operand::Global(table),
                            Operand::Value(index),
                        ]);
                        let addr = f.push_op(block, OpKind::Load { order: None }, vec![
                            Operand::Value(gep),
                        ]);
                        let mut dests = vec![else_to, then_to];
                        dests.dedup();
                        f.set_term(block, Terminator::IndirectBr {
                            addr: Operand::Value(addr),
                            dests,
                        });
                        changed = true;
                    }
                    _ => {}
                }
            }
        }

        if changed {
            debug!(
                "indirect-branch: rewrote branches in {} function(s), {} private table(s)",
                targeted.len(),
                private_count
            );
        }
        Ok(changed)
    }
}
