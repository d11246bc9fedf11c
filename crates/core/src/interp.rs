//! Deterministic interpreter for module functions.
//!
//! Passes promise observational equivalence; this interpreter is how the
//! promise is checked. It executes a function on integer arguments against
//! a mutable snapshot of the module's global memory, so in-place effects
//! like guarded string decryption are observable. Execution is
//! single-threaded; atomic orderings on loads and stores are annotations
//! for the target program and carry no weight here.

use crate::fold;
use crate::ir::{
    BlockAddress, FuncId, GlobalId, GlobalInit, ModuleIr, OpId, OpKind, Operand, Terminator,
};
use murk_utils::errors::{EvalError, IrError};
use std::collections::HashMap;

/// A runtime value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    /// Integer, canonical in 64 bits.
    Int(u64),
    /// Address of one element of a global slot.
    Slot { global: GlobalId, index: usize },
    /// Entry address of a basic block.
    Block(BlockAddress),
}

impl Value {
    fn as_int(self, ctx: &'static str) -> Result<u64, EvalError> {
        match self {
            Self::Int(v) => Ok(v),
            _ => Err(EvalError::TypeMismatch(ctx)),
        }
    }

    fn as_slot(self, ctx: &'static str) -> Result<(GlobalId, usize), EvalError> {
        match self {
            Self::Slot { global, index } => Ok((global, index)),
            _ => Err(EvalError::TypeMismatch(ctx)),
        }
    }
}

#[derive(Debug, Clone)]
enum GlobalCell {
    Ints { mask: u64, values: Vec<u64> },
    Addrs(Vec<BlockAddress>),
    Descriptor { payload: GlobalId },
}

/// Mutable snapshot of every global slot's contents.
#[derive(Debug, Clone)]
pub struct GlobalState {
    cells: HashMap<GlobalId, GlobalCell>,
}

impl GlobalState {
    /// Captures the initializers of every live slot in `module`.
    pub fn snapshot(module: &ModuleIr) -> Self {
        let mut cells = HashMap::new();
        for (id, slot) in module.globals() {
            let cell = match &slot.init {
                GlobalInit::Ints { bits, values } => GlobalCell::Ints {
                    mask: bits_mask(*bits),
                    values: values.clone(),
                },
                GlobalInit::BlockAddrs(addrs) => GlobalCell::Addrs(addrs.clone()),
                GlobalInit::Descriptor { payload, .. } => GlobalCell::Descriptor {
                    payload: *payload,
                },
            };
            cells.insert(id, cell);
        }
        Self { cells }
    }

    /// Follows descriptor payloads down to a storage cell.
    fn resolve(&self, global: GlobalId) -> Result<GlobalId, EvalError> {
        let mut current = global;
        for _ in 0..4 {
            match self.cells.get(&current) {
                Some(GlobalCell::Descriptor { payload }) => current = *payload,
                Some(_) => return Ok(current),
                None => return Err(IrError::UnknownGlobal(current.0).into()),
            }
        }
        Err(EvalError::TypeMismatch("descriptor chain too deep"))
    }

    /// Reads one element of a slot.
    pub fn load(&self, global: GlobalId, index: usize) -> Result<Value, EvalError> {
        let target = self.resolve(global)?;
        match self.cells.get(&target) {
            Some(GlobalCell::Ints { values, .. }) => values
                .get(index)
                .map(|&v| Value::Int(v))
                .ok_or(EvalError::OutOfBounds {
                    global: target.0,
                    index,
                }),
            Some(GlobalCell::Addrs(addrs)) => addrs
                .get(index)
                .map(|&a| Value::Block(a))
                .ok_or(EvalError::OutOfBounds {
                    global: target.0,
                    index,
                }),
            _ => Err(IrError::UnknownGlobal(target.0).into()),
        }
    }

    /// Writes one element of an integer slot, masked to the slot's width.
    pub fn store(&mut self, global: GlobalId, index: usize, value: u64) -> Result<(), EvalError> {
        let target = self.resolve(global)?;
        match self.cells.get_mut(&target) {
            Some(GlobalCell::Ints { mask, values }) => {
                let cell = values.get_mut(index).ok_or(EvalError::OutOfBounds {
                    global: target.0,
                    index,
                })?;
                *cell = value & *mask;
                Ok(())
            }
            Some(GlobalCell::Addrs(_)) => Err(EvalError::TypeMismatch("store to address table")),
            _ => Err(IrError::UnknownGlobal(target.0).into()),
        }
    }

    /// Current integer contents of a slot, if it is an integer slot.
    /// Mostly useful to tests observing in-place decryption.
    pub fn int_values(&self, global: GlobalId) -> Option<&[u64]> {
        let target = self.resolve(global).ok()?;
        match self.cells.get(&target) {
            Some(GlobalCell::Ints { values, .. }) => Some(values),
            _ => None,
        }
    }
}

fn bits_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

const DEFAULT_STEP_LIMIT: usize = 1_000_000;

/// Interpreter over one module.
#[derive(Debug)]
pub struct Interp<'m> {
    module: &'m ModuleIr,
    /// Global memory; shared across calls so process-lifetime effects
    /// (decryption flags, unmasked literals) persist between them.
    pub state: GlobalState,
    step_limit: usize,
}

impl<'m> Interp<'m> {
    pub fn new(module: &'m ModuleIr) -> Self {
        Self {
            module,
            state: GlobalState::snapshot(module),
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    pub fn with_step_limit(mut self, step_limit: usize) -> Self {
        self.step_limit = step_limit;
        self
    }

    /// Runs the named function. See [`Interp::call`].
    pub fn call_by_name(&mut self, name: &str, args: &[u64]) -> Result<Option<Value>, EvalError> {
        let func = self
            .module
            .func_by_name(name)
            .ok_or_else(|| EvalError::NoSuchFunction(name.to_string()))?;
        self.call(func, args)
    }

    /// Runs `func` on `args` and returns its result, mutating global state
    /// in place.
    pub fn call(&mut self, func: FuncId, args: &[u64]) -> Result<Option<Value>, EvalError> {
        let f = self.module.function(func);
        let entry = f.entry().ok_or(IrError::NoEntryBlock)?;
        if args.len() != f.params as usize {
            return Err(EvalError::ArityMismatch {
                expected: f.params,
                got: args.len(),
            });
        }

        let mut values: HashMap<OpId, Value> = HashMap::new();
        let mut block = entry;
        let mut steps = 0usize;

        loop {
            let bb = f.block(block);
            for &op_id in &bb.ops {
                steps += 1;
                if steps > self.step_limit {
                    return Err(EvalError::StepLimit(self.step_limit));
                }
                let result = exec_op(f, op_id, args, &values, &mut self.state)?;
                values.insert(op_id, result);
            }
            steps += 1;
            if steps > self.step_limit {
                return Err(EvalError::StepLimit(self.step_limit));
            }
            match &bb.term {
                Terminator::Br { target } => block = *target,
                Terminator::CondBr {
                    cond,
                    then_to,
                    else_to,
                } => {
                    let taken = eval_operand(cond, args, &values)?.as_int("branch condition")?;
                    block = if taken != 0 { *then_to } else { *else_to };
                }
                Terminator::IndirectBr { addr, dests } => {
                    let value = eval_operand(addr, args, &values)?;
                    let Value::Block(address) = value else {
                        return Err(EvalError::TypeMismatch("indirect branch address"));
                    };
                    if address.func != func || !dests.contains(&address.block) {
                        return Err(EvalError::BadIndirectTarget);
                    }
                    block = address.block;
                }
                Terminator::Ret { value } => {
                    return match value {
                        Some(operand) => Ok(Some(eval_operand(operand, args, &values)?)),
                        None => Ok(None),
                    };
                }
                Terminator::Unreachable => return Err(EvalError::Unreachable),
            }
        }
    }
}

fn eval_operand(
    operand: &Operand,
    args: &[u64],
    values: &HashMap<OpId, Value>,
) -> Result<Value, EvalError> {
    match operand {
        Operand::Const(c) => Ok(Value::Int(*c)),
        Operand::Arg(i) => args
            .get(*i as usize)
            .map(|&v| Value::Int(v))
            .ok_or(EvalError::UndefinedValue),
        Operand::Value(id) => values.get(id).copied().ok_or(EvalError::UndefinedValue),
        Operand::Global(g) => Ok(Value::Slot {
            global: *g,
            index: 0,
        }),
    }
}

fn exec_op(
    f: &crate::ir::Function,
    op_id: OpId,
    args: &[u64],
    values: &HashMap<OpId, Value>,
    state: &mut GlobalState,
) -> Result<Value, EvalError> {
    let op = f.op(op_id);
    let operand = |i: usize| -> Result<Value, EvalError> {
        op.operands
            .get(i)
            .ok_or(EvalError::UndefinedValue)
            .and_then(|o| eval_operand(o, args, values))
    };
    match &op.kind {
        OpKind::Bin { op: bop, width } => {
            let a = operand(0)?.as_int("binary operand")?;
            let b = operand(1)?.as_int("binary operand")?;
            Ok(Value::Int(fold::binop(*bop, *width, a, b)))
        }
        OpKind::Neg { width } => {
            let a = operand(0)?.as_int("negation operand")?;
            Ok(Value::Int(fold::neg(*width, a)))
        }
        OpKind::Cmp { pred, width } => {
            let a = operand(0)?.as_int("comparison operand")?;
            let b = operand(1)?.as_int("comparison operand")?;
            Ok(Value::Int(u64::from(fold::icmp(*pred, *width, a, b))))
        }
        OpKind::ZExt => Ok(Value::Int(operand(0)?.as_int("zext operand")?)),
        OpKind::Gep => {
            let (global, base) = operand(0)?.as_slot("gep base")?;
            let index = operand(1)?.as_int("gep index")? as usize;
            Ok(Value::Slot {
                global,
                index: base + index,
            })
        }
        OpKind::Load { .. } => {
            let (global, index) = operand(0)?.as_slot("load address")?;
            state.load(global, index)
        }
        OpKind::Store { .. } => {
            let value = operand(0)?.as_int("stored value")?;
            let (global, index) = operand(1)?.as_slot("store address")?;
            state.store(global, index, value)?;
            Ok(Value::Int(0))
        }
        // Calls carry no semantics here; debug markers and external stubs
        // evaluate to zero.
        OpKind::Call { .. } => Ok(Value::Int(0)),
    }
}
