//! Bogus control flow: wraps real work in spurious branches guarded by
//! opaque predicates.
//!
//! Injection reshapes each selected block into
//!
//! ```text
//!          header
//!         (true)| \(false)
//!              original <--- altered
//!         (true)| \(false)----^   (or a loop back into original)
//!              tail
//! ```
//!
//! where `altered` is a junk-laden structural duplicate of the real work
//! and both guards are placeholder always-true comparisons. A second phase
//! then visits every placeholder and replaces it with a freshly drawn
//! arithmetic expression over two new global slots, folded off-line to
//! learn which way it branches; the successor order is fixed so the
//! statically-true edge carries the original control flow. The bogus path
//! is unreachable at run time but indistinguishable from a real branch
//! without constant-propagating the same arithmetic.

use crate::{should_obfuscate, Transform};
use murk_core::fold;
use murk_core::ir::{
    BinOp, BlockId, FuncId, Function, GlobalId, GlobalInit, IntWidth, ModuleIr, OpKind, Operand,
    Pred, Terminator,
};
use murk_utils::errors::PassError;
use murk_utils::prng::Prng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const DEFAULT_PROBABILITY: u32 = 70;
const DEFAULT_LOOPS: u32 = 1;
const DEFAULT_CHAIN_LENGTH: u32 = 3;

/// Operators an opaque expression chain may draw from.
const CHAIN_OPS: [BinOp; 5] = [BinOp::Add, BinOp::Sub, BinOp::And, BinOp::Or, BinOp::Xor];
/// Predicates the final comparison may draw from.
const CHAIN_PREDS: [Pred; 6] = [Pred::Eq, Pred::Ne, Pred::Ugt, Pred::Uge, Pred::Ult, Pred::Ule];

/// Knobs for the bogus-flow injector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BogusFlowConfig {
    /// Percentage of eligible blocks to wrap, in `(0, 100]`.
    pub probability: u32,
    /// How many times the per-function loop runs; later rounds see blocks
    /// added by earlier ones.
    pub loops: u32,
    /// Number of chained operators in each resolved opaque expression.
    pub chain_length: u32,
    /// Whether functions without annotations are obfuscated.
    pub default_on: bool,
}

impl Default for BogusFlowConfig {
    fn default() -> Self {
        Self {
            probability: DEFAULT_PROBABILITY,
            loops: DEFAULT_LOOPS,
            chain_length: DEFAULT_CHAIN_LENGTH,
            default_on: true,
        }
    }
}

/// Injects bogus control flow guarded by opaque predicates.
#[derive(Debug, Default)]
pub struct BogusFlow {
    config: BogusFlowConfig,
}

impl BogusFlow {
    pub fn new(config: BogusFlowConfig) -> Self {
        Self { config }
    }

    /// Out-of-range knobs fall back to the documented defaults rather than
    /// failing the run.
    fn sanitized_knobs(&self) -> (u32, u32) {
        let probability = if (1..=100).contains(&self.config.probability) {
            self.config.probability
        } else {
            warn!(
                "bogus-flow probability {} outside (0, 100], using default {}",
                self.config.probability, DEFAULT_PROBABILITY
            );
            DEFAULT_PROBABILITY
        };
        let loops = if self.config.loops >= 1 {
            self.config.loops
        } else {
            warn!(
                "bogus-flow repeat count {} must be at least 1, using default {}",
                self.config.loops, DEFAULT_LOOPS
            );
            DEFAULT_LOOPS
        };
        (probability, loops)
    }

    fn run_on_function(
        &self,
        module: &mut ModuleIr,
        func: FuncId,
        probability: u32,
        loops: u32,
        prng: &mut Prng,
    ) -> bool {
        let mut modified = false;
        for _ in 0..loops {
            // Snapshot the block list: the loop itself adds blocks, and a
            // later round may then select them.
            let blocks: Vec<BlockId> = {
                let f = module.function(func);
                f.block_ids()
                    .into_iter()
                    .filter(|&b| !f.block(b).eh_pad)
                    .collect()
            };
            for block in blocks {
                if prng.next_in_range(0, 100) < probability {
                    add_bogus_flow(module, func, block, prng);
                    modified = true;
                } else {
                    debug!("bogus-flow: block {} not selected", block.index());
                }
            }
        }
        modified
    }
}

impl Transform for BogusFlow {
    fn name(&self) -> &'static str {
        "BogusFlow"
    }

    fn apply(&self, module: &mut ModuleIr, prng: &mut Prng) -> Result<bool, PassError> {
        let (probability, loops) = self.sanitized_knobs();
        let mut changed = false;
        for func in module.func_ids() {
            if !should_obfuscate(self.config.default_on, module.function(func), "bogus") {
                debug!("bogus-flow: skipping {}", module.function(func).name);
                continue;
            }
            debug!("bogus-flow: running on {}", module.function(func).name);
            changed |= self.run_on_function(module, func, probability, loops, prng);
        }

        // Second phase: resolve every placeholder left by the injection
        // loop, across all functions, now that the per-block traversal is
        // over.
        let pending = collect_placeholders(module);
        debug!("bogus-flow: resolving {} placeholder guards", pending.len());
        let mut counter = 0u32;
        for (func, block) in pending {
            resolve_placeholder(
                module,
                func,
                block,
                self.config.chain_length,
                prng,
                &mut counter,
            )?;
        }
        Ok(changed)
    }
}

/// Wraps one block in bogus flow, leaving placeholder guards behind.
fn add_bogus_flow(module: &mut ModuleIr, func: FuncId, block: BlockId, prng: &mut Prng) {
    let f = module.function_mut(func);

    // Split off the real work; the header keeps incoming edges and any
    // leading debug markers.
    let at = f.first_nontrivial_index(block);
    let original = f.split_block(block, at, "original");

    // Structural duplicate of the real work, with junk interleaved, that
    // falls back into the original.
    let (altered, stripped) = create_altered_block(f, original, prng);
    f.set_term(altered, Terminator::Br { target: original });

    // Placeholder guard at the end of the header: original on true, the
    // duplicate on false.
    let cond = f.push_op(
        block,
        OpKind::Cmp {
            pred: Pred::True,
            width: IntWidth::W32,
        },
        vec![Operand::Const(1), Operand::Const(1)],
    );
    f.set_term(block, Terminator::CondBr {
        cond: Operand::Value(cond),
        then_to: original,
        else_to: altered,
    });

    // Isolate the real terminator in its own tail block, then guard it
    // with a second opaque branch. The bogus edge either loops back into
    // the original or detours through the duplicate; the coin is flipped
    // now, at obfuscation time, so the two shapes are interleaved across
    // the output instead of forming a single signature.
    let op_count = f.block(original).ops.len();
    let tail = f.split_block(original, op_count, "tail");
    let cond2 = f.push_op(
        original,
        OpKind::Cmp {
            pred: Pred::True,
            width: IntWidth::W32,
        },
        vec![Operand::Const(1), Operand::Const(1)],
    );
    let else_to = if prng.next_u16() % 2 == 0 {
        original
    } else {
        altered
    };
    f.set_term(original, Terminator::CondBr {
        cond: Operand::Value(cond2),
        then_to: tail,
        else_to,
    });

    // Metadata slots that only the stripped markers referenced go away.
    module.purge_unreferenced_metadata(stripped);
}

/// Clones `original` and mutates the clone: junk operations are randomly
/// interleaved around arithmetic, comparisons are rewritten to an
/// outcome-preserving alternate, and debug markers are stripped.
///
/// Returns the clone and the global slots the stripped markers referenced.
fn create_altered_block(
    f: &mut Function,
    original: BlockId,
    prng: &mut Prng,
) -> (BlockId, Vec<GlobalId>) {
    let (altered, _) = f.clone_block(original, "altered");

    for op_id in f.block(altered).ops.clone() {
        let op = f.op(op_id).clone();
        match op.kind {
            OpKind::Bin { width, .. } => {
                let (Some(&a), Some(&b)) = (op.operands.first(), op.operands.get(1)) else {
                    continue;
                };
                let mut round = prng.next_in_range(0, 10);
                while round < 10 {
                    match prng.next_in_range(0, 4) {
                        0 => {}
                        1 => {
                            // negate-then-add
                            let neg = f.insert_op_before(
                                altered,
                                op_id,
                                OpKind::Neg { width },
                                vec![a],
                            );
                            f.insert_op_before(
                                altered,
                                op_id,
                                OpKind::Bin {
                                    op: BinOp::Add,
                                    width,
                                },
                                vec![Operand::Value(neg), b],
                            );
                        }
                        2 => {
                            // subtract-then-multiply
                            let diff = f.insert_op_before(
                                altered,
                                op_id,
                                OpKind::Bin {
                                    op: BinOp::Sub,
                                    width,
                                },
                                vec![a, b],
                            );
                            f.insert_op_before(
                                altered,
                                op_id,
                                OpKind::Bin {
                                    op: BinOp::Mul,
                                    width,
                                },
                                vec![Operand::Value(diff), b],
                            );
                        }
                        _ => {
                            f.insert_op_before(
                                altered,
                                op_id,
                                OpKind::Bin {
                                    op: BinOp::Shl,
                                    width,
                                },
                                vec![a, b],
                            );
                        }
                    }
                    round += 1;
                }
            }
            OpKind::Cmp { pred, width } => {
                // Only outcome-preserving rewrites are allowed here: the
                // duplicate must compute the same results through different
                // paths. Swapping operands and mirroring the predicate is
                // the one rewrite that qualifies.
                if prng.next_in_range(0, 3) != 0 {
                    let mutated = f.op_mut(op_id);
                    mutated.operands.reverse();
                    mutated.kind = OpKind::Cmp {
                        pred: pred.swapped(),
                        width,
                    };
                }
            }
            _ => {}
        }
    }

    // Strip debug markers from the clone, remembering which slots they
    // referenced so orphaned metadata can be reclaimed.
    let mut stripped = Vec::new();
    for op_id in f.block(altered).ops.clone() {
        if f.op(op_id).is_debug_marker() {
            for operand in &f.op(op_id).operands {
                if let Operand::Global(g) = operand {
                    stripped.push(*g);
                }
            }
            f.remove_op(op_id);
        }
    }
    (altered, stripped)
}

/// Finds every block still terminated by a placeholder guard.
fn collect_placeholders(module: &ModuleIr) -> Vec<(FuncId, BlockId)> {
    let mut pending = Vec::new();
    for func in module.func_ids() {
        let f = module.function(func);
        for block in f.block_ids() {
            if let Terminator::CondBr {
                cond: Operand::Value(op),
                ..
            } = &f.block(block).term
            {
                if matches!(f.op(*op).kind, OpKind::Cmp {
                    pred: Pred::True,
                    ..
                }) {
                    pending.push((func, block));
                }
            }
        }
    }
    pending
}

/// A freshly drawn opaque expression: a chain of binary operators over two
/// 32-bit seeds, compared against a target constant.
///
/// The expression is built once and used twice — folded immediately to
/// learn its truth value, and materialized as real operations in the
/// target function — so the emitted branch direction and the arithmetic
/// agree by construction.
#[derive(Debug, Clone)]
pub struct OpaqueExpr {
    pub lhs: u32,
    pub rhs: u32,
    pub initial: BinOp,
    pub chain: Vec<(BinOp, u32)>,
    pub pred: Pred,
    pub target: u32,
}

impl OpaqueExpr {
    /// Draws a fresh expression of `chain_length` chained operators.
    pub fn draw(prng: &mut Prng, chain_length: u32) -> Self {
        let target = prng.next_u32();
        let lhs = prng.next_u32();
        let rhs = prng.next_u32();
        let initial = CHAIN_OPS[prng.next_in_range(0, CHAIN_OPS.len() as u32) as usize];
        let chain = (0..chain_length)
            .map(|_| {
                let k = prng.next_u32();
                let op = CHAIN_OPS[prng.next_in_range(0, CHAIN_OPS.len() as u32) as usize];
                (op, k)
            })
            .collect();
        let pred = CHAIN_PREDS[prng.next_in_range(0, CHAIN_PREDS.len() as u32) as usize];
        Self {
            lhs,
            rhs,
            initial,
            chain,
            pred,
            target,
        }
    }

    /// Constant-folds the isolated copy of the expression.
    pub fn evaluate(&self) -> bool {
        let mut acc = fold::binop(self.initial, IntWidth::W32, self.lhs.into(), self.rhs.into());
        for &(op, k) in &self.chain {
            acc = fold::binop(op, IntWidth::W32, acc, k.into());
        }
        fold::icmp(self.pred, IntWidth::W32, acc, self.target.into())
    }
}

/// Replaces one placeholder guard with a resolved opaque predicate.
fn resolve_placeholder(
    module: &mut ModuleIr,
    func: FuncId,
    block: BlockId,
    chain_length: u32,
    prng: &mut Prng,
    counter: &mut u32,
) -> Result<(), PassError> {
    let f = module.function(func);
    let Terminator::CondBr {
        cond: Operand::Value(placeholder),
        then_to,
        else_to,
    } = f.block(block).term.clone()
    else {
        return Err(PassError::MalformedPlaceholder(block.index()));
    };
    if !matches!(f.op(placeholder).kind, OpKind::Cmp {
        pred: Pred::True,
        ..
    }) {
        return Err(PassError::MalformedPlaceholder(block.index()));
    }

    let expr = OpaqueExpr::draw(prng, chain_length);
    let truth = expr.evaluate();

    // The seeds live in module globals so the comparison is only decidable
    // by propagating their initializers through the chain.
    let n = *counter;
    *counter += 1;
    let lhs_gv = module.add_global(
        format!("opq_lhs_{n}"),
        GlobalInit::Ints {
            bits: 32,
            values: vec![expr.lhs.into()],
        },
        false,
        false,
    );
    let rhs_gv = module.add_global(
        format!("opq_rhs_{n}"),
        GlobalInit::Ints {
            bits: 32,
            values: vec![expr.rhs.into()],
        },
        false,
        false,
    );

    let f = module.function_mut(func);
    let lhs = f.push_op(block, OpKind::Load { order: None }, vec![Operand::Global(
        lhs_gv,
    )]);
    let rhs = f.push_op(block, OpKind::Load { order: None }, vec![Operand::Global(
        rhs_gv,
    )]);
    let mut last = f.push_op(
        block,
        OpKind::Bin {
            op: expr.initial,
            width: IntWidth::W32,
        },
        vec![Operand::Value(lhs), Operand::Value(rhs)],
    );
    for &(op, k) in &expr.chain {
        last = f.push_op(block, OpKind::Bin {
            op,
            width: IntWidth::W32,
        }, vec![
            Operand::Value(last),
            Operand::Const(k.into()),
        ]);
    }
    let cond = f.push_op(
        block,
        OpKind::Cmp {
            pred: expr.pred,
            width: IntWidth::W32,
        },
        vec![Operand::Value(last), Operand::Const(expr.target.into())],
    );

    // Fix the successor order so the statically-true edge carries the
    // original control flow.
    let term = if truth {
        Terminator::CondBr {
            cond: Operand::Value(cond),
            then_to,
            else_to,
        }
    } else {
        Terminator::CondBr {
            cond: Operand::Value(cond),
            then_to: else_to,
            else_to: then_to,
        }
    };
    f.remove_op(placeholder);
    f.set_term(block, term);
    Ok(())
}
