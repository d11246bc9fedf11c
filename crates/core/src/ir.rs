//! Module for constructing and mutating the intermediate representation
//! consumed by the obfuscation passes.
//!
//! A module owns named global data slots and a list of functions. Each
//! function is a control-flow graph of basic blocks backed by a
//! `petgraph::DiGraph`, so blocks are addressed by stable `NodeIndex`
//! handles rather than pointers: passes that split, clone and retarget
//! blocks mid-traversal only ever update handle tables, and existing
//! handles stay valid because blocks are added but never removed.
//! Operations live in a per-function arena addressed by [`OpId`]; operand
//! references between operations are handles into that arena, which makes
//! block cloning a remap of handles. Edges are derived from terminators
//! and rebuilt per block whenever a terminator changes.

use indexmap::IndexMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stable handle of a basic block within its function.
pub type BlockId = NodeIndex;

/// Handle of an operation in its function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u32);

/// Handle of a function within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FuncId(pub u32);

/// Handle of a global data slot within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalId(pub u32);

impl std::fmt::Display for GlobalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Width of an integer operation or literal element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
}

impl IntWidth {
    /// Width in bits.
    pub const fn bits(self) -> u32 {
        match self {
            Self::W8 => 8,
            Self::W16 => 16,
            Self::W32 => 32,
            Self::W64 => 64,
        }
    }

    /// Bit mask selecting the value bits of this width.
    pub const fn mask(self) -> u64 {
        match self {
            Self::W8 => 0xff,
            Self::W16 => 0xffff,
            Self::W32 => 0xffff_ffff,
            Self::W64 => u64::MAX,
        }
    }

    /// Maps a raw bit count onto a supported width, if there is one.
    pub const fn try_from_bits(bits: u32) -> Option<Self> {
        match bits {
            8 => Some(Self::W8),
            16 => Some(Self::W16),
            32 => Some(Self::W32),
            64 => Some(Self::W64),
            _ => None,
        }
    }
}

/// Binary integer operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

/// Comparison predicates.
///
/// `True` is the placeholder predicate the bogus-flow injector leaves on
/// its guards between the injection and resolution phases; no branch
/// condition still carries it once the pass completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pred {
    True,
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

impl Pred {
    /// The predicate that yields the same outcome with swapped operands.
    pub const fn swapped(self) -> Self {
        match self {
            Self::Ugt => Self::Ult,
            Self::Ult => Self::Ugt,
            Self::Uge => Self::Ule,
            Self::Ule => Self::Uge,
            Self::Sgt => Self::Slt,
            Self::Slt => Self::Sgt,
            Self::Sge => Self::Sle,
            Self::Sle => Self::Sge,
            Self::True | Self::Eq | Self::Ne => self,
        }
    }
}

/// Memory orderings used by the guarded-decryption protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicOrdering {
    Acquire,
    Release,
}

/// An operand of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// Integer constant.
    Const(u64),
    /// One of the enclosing function's arguments.
    Arg(u32),
    /// Result of another operation in the same function.
    Value(OpId),
    /// Address of a global data slot (element 0).
    Global(GlobalId),
}

/// Opcode of an operation. Arithmetic carries an explicit width so results
/// wrap exactly like the target program's would.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Bin { op: BinOp, width: IntWidth },
    Neg { width: IntWidth },
    Cmp { pred: Pred, width: IntWidth },
    /// Zero-extension; the value is already canonical, so this is a width
    /// annotation for downstream indexing.
    ZExt,
    /// Load through an address operand. `order` is `Some` only for the
    /// decryption-flag protocol.
    Load { order: Option<AtomicOrdering> },
    /// Store; operands are `[value, address]`.
    Store { order: Option<AtomicOrdering> },
    /// Element address of a slot; operands are `[slot, index]`.
    Gep,
    /// Opaque call marker. Callees prefixed `dbg.` are metadata-only debug
    /// markers: block splitting skips them and block cloning strips them.
    Call { callee: String },
}

/// An operation: an opcode plus its ordered operands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub operands: Vec<Operand>,
}

impl Operation {
    /// True for metadata-only debug markers.
    pub fn is_debug_marker(&self) -> bool {
        matches!(&self.kind, OpKind::Call { callee } if callee.starts_with("dbg."))
    }
}

/// The single control transfer ending a basic block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terminator {
    Br {
        target: BlockId,
    },
    CondBr {
        cond: Operand,
        then_to: BlockId,
        else_to: BlockId,
    },
    /// Indirect transfer through a computed block address. `dests` is the
    /// closed set of legal targets; the address must resolve inside it.
    IndirectBr {
        addr: Operand,
        dests: Vec<BlockId>,
    },
    Ret {
        value: Option<Operand>,
    },
    Unreachable,
}

impl Terminator {
    /// All blocks this terminator can transfer control to.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Self::Br { target } => vec![*target],
            Self::CondBr {
                then_to, else_to, ..
            } => vec![*then_to, *else_to],
            Self::IndirectBr { dests, .. } => dests.clone(),
            Self::Ret { .. } | Self::Unreachable => Vec::new(),
        }
    }
}

/// Kind of a control-flow edge, derived from the source terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
    Goto,
    BranchTrue,
    BranchFalse,
    Indirect,
}

/// A straight-line sequence of operations ending in exactly one
/// terminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlock {
    pub name: String,
    pub ops: Vec<OpId>,
    pub term: Terminator,
    /// Exception-handling pad; such blocks are never cloned or split by
    /// the bogus-flow injector.
    pub eh_pad: bool,
}

impl BasicBlock {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ops: Vec::new(),
            term: Terminator::Unreachable,
            eh_pad: false,
        }
    }
}

/// Linkage of a function, as far as pass eligibility cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Linkage {
    Private,
    Internal,
    External,
    AvailableExternally,
}

/// Opaque handle denoting the entry point of a specific basic block. Only
/// ever used as an indirect-branch target, and only through tables built
/// from such handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAddress {
    pub func: FuncId,
    pub block: BlockId,
}

/// A function: an operation arena plus a control-flow graph of basic
/// blocks with a designated entry. A function without blocks is a
/// declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub linkage: Linkage,
    /// Number of integer arguments.
    pub params: u32,
    /// Free-form pass-eligibility annotations (`"<pass>"` forces,
    /// `"no<pass>"` suppresses).
    pub annotations: Vec<String>,
    pub cfg: DiGraph<BasicBlock, EdgeKind>,
    entry: Option<BlockId>,
    ops: Vec<Option<Operation>>,
}

impl Function {
    /// Creates an empty function (a declaration until a block is added).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            linkage: Linkage::External,
            params: 0,
            annotations: Vec::new(),
            cfg: DiGraph::new(),
            entry: None,
            ops: Vec::new(),
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.entry.is_none()
    }

    /// The designated entry block, absent for declarations.
    pub fn entry(&self) -> Option<BlockId> {
        self.entry
    }

    /// Adds an empty block. The first block added becomes the entry.
    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = self.cfg.add_node(BasicBlock::new(name));
        if self.entry.is_none() {
            self.entry = Some(id);
        }
        id
    }

    /// All block handles, in creation order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.cfg.node_indices().collect()
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.cfg[id]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.cfg[id]
    }

    /// Resolves an operation handle.
    ///
    /// # Panics
    /// Panics on a stale or foreign handle; handles are only ever minted by
    /// this function's own mutators.
    pub fn op(&self, id: OpId) -> &Operation {
        self.ops[id.0 as usize]
            .as_ref()
            .expect("stale operation handle")
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut Operation {
        self.ops[id.0 as usize]
            .as_mut()
            .expect("stale operation handle")
    }

    fn alloc_op(&mut self, op: Operation) -> OpId {
        let id = OpId(self.ops.len() as u32);
        self.ops.push(Some(op));
        id
    }

    /// Appends an operation to `block` and returns its handle.
    pub fn push_op(&mut self, block: BlockId, kind: OpKind, operands: Vec<Operand>) -> OpId {
        let id = self.alloc_op(Operation { kind, operands });
        self.cfg[block].ops.push(id);
        id
    }

    /// Inserts an operation at `index` within `block`'s operation list.
    pub fn insert_op(
        &mut self,
        block: BlockId,
        index: usize,
        kind: OpKind,
        operands: Vec<Operand>,
    ) -> OpId {
        let id = self.alloc_op(Operation { kind, operands });
        self.cfg[block].ops.insert(index, id);
        id
    }

    /// Inserts an operation immediately before `before` in `block`.
    pub fn insert_op_before(
        &mut self,
        block: BlockId,
        before: OpId,
        kind: OpKind,
        operands: Vec<Operand>,
    ) -> OpId {
        let index = self.cfg[block]
            .ops
            .iter()
            .position(|&o| o == before)
            .expect("operation not in block");
        self.insert_op(block, index, kind, operands)
    }

    /// Unlinks an operation from whichever block holds it and retires its
    /// arena entry. Splits can move an operation away from the block it was
    /// created in, so the parent is looked up, not assumed.
    pub fn remove_op(&mut self, id: OpId) {
        for block in self.cfg.node_indices().collect::<Vec<_>>() {
            self.cfg[block].ops.retain(|&o| o != id);
        }
        self.ops[id.0 as usize] = None;
    }

    /// Index of the first operation in `block` that is not a metadata-only
    /// marker; `ops.len()` if there is none.
    pub fn first_nontrivial_index(&self, block: BlockId) -> usize {
        let bb = &self.cfg[block];
        bb.ops
            .iter()
            .position(|&id| !self.op(id).is_debug_marker())
            .unwrap_or(bb.ops.len())
    }

    /// Replaces `block`'s terminator and rebuilds its outgoing edges.
    pub fn set_term(&mut self, block: BlockId, term: Terminator) {
        self.cfg[block].term = term;
        self.rebuild_edges(block);
    }

    /// Re-derives `block`'s outgoing edges from its terminator.
    ///
    /// Removes every outgoing edge and adds one per successor, typed after
    /// the terminator kind. Called by every mutator that touches a
    /// terminator; incoming edges are untouched.
    pub fn rebuild_edges(&mut self, block: BlockId) {
        let outgoing: Vec<_> = self
            .cfg
            .edges_directed(block, petgraph::Outgoing)
            .map(|e| e.id())
            .collect();
        for edge in outgoing {
            self.cfg.remove_edge(edge);
        }
        match self.cfg[block].term.clone() {
            Terminator::Br { target } => {
                self.cfg.add_edge(block, target, EdgeKind::Goto);
            }
            Terminator::CondBr {
                then_to, else_to, ..
            } => {
                self.cfg.add_edge(block, then_to, EdgeKind::BranchTrue);
                self.cfg.add_edge(block, else_to, EdgeKind::BranchFalse);
            }
            Terminator::IndirectBr { dests, .. } => {
                for dest in dests {
                    self.cfg.add_edge(block, dest, EdgeKind::Indirect);
                }
            }
            Terminator::Ret { .. } | Terminator::Unreachable => {}
        }
    }

    /// Splits `block` at operation index `at`.
    ///
    /// The new block receives the operations from `at` onward together with
    /// the old terminator (and therefore the outgoing edges); `block` keeps
    /// the leading operations and its incoming edges, and falls through to
    /// the new block. Returns the new block's handle.
    pub fn split_block(&mut self, block: BlockId, at: usize, name: impl Into<String>) -> BlockId {
        let tail_ops = self.cfg[block].ops.split_off(at);
        let term = std::mem::replace(&mut self.cfg[block].term, Terminator::Unreachable);
        let new = self.cfg.add_node(BasicBlock {
            name: name.into(),
            ops: tail_ops,
            term,
            eh_pad: false,
        });
        self.rebuild_edges(new);
        self.set_term(block, Terminator::Br { target: new });
        tracing::debug!(
            "split block {} at {}: tail is block {}",
            block.index(),
            at,
            new.index()
        );
        new
    }

    /// Creates a structural duplicate of `src` with identical control
    /// successors.
    ///
    /// Every operation is re-allocated in the arena; operand references to
    /// operations cloned from `src` are remapped onto the duplicates, while
    /// references to operations outside `src` are left pointing at the
    /// originals. Returns the duplicate's handle and the old-to-new
    /// operation map.
    pub fn clone_block(
        &mut self,
        src: BlockId,
        name: impl Into<String>,
    ) -> (BlockId, HashMap<OpId, OpId>) {
        let src_ops = self.cfg[src].ops.clone();
        let mut term = self.cfg[src].term.clone();
        let mut vmap = HashMap::new();
        let mut new_ops = Vec::with_capacity(src_ops.len());
        for old_id in src_ops {
            let mut op = self.op(old_id).clone();
            for operand in &mut op.operands {
                remap_operand(operand, &vmap);
            }
            let new_id = self.alloc_op(op);
            vmap.insert(old_id, new_id);
            new_ops.push(new_id);
        }
        match &mut term {
            Terminator::CondBr { cond, .. } => remap_operand(cond, &vmap),
            Terminator::IndirectBr { addr, .. } => remap_operand(addr, &vmap),
            Terminator::Ret { value: Some(value) } => remap_operand(value, &vmap),
            _ => {}
        }
        let new = self.cfg.add_node(BasicBlock {
            name: name.into(),
            ops: new_ops,
            term,
            eh_pad: false,
        });
        self.rebuild_edges(new);
        (new, vmap)
    }
}

fn remap_operand(operand: &mut Operand, vmap: &HashMap<OpId, OpId>) {
    if let Operand::Value(id) = operand {
        if let Some(&mapped) = vmap.get(id) {
            *operand = Operand::Value(mapped);
        }
    }
}

/// Statically-initialized contents of a global data slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalInit {
    /// Integer-element sequence (plain string literals included). `bits`
    /// is an open field: widths without an encode/decode routine are
    /// representable and rejected by the encryption pass.
    Ints { bits: u32, values: Vec<u64> },
    /// Read-only table of block entry addresses for indirect branches.
    BlockAddrs(Vec<BlockAddress>),
    /// Boxed-literal descriptor whose payload field points at an `Ints`
    /// slot.
    Descriptor { tag: u64, len: u64, payload: GlobalId },
}

/// A named, statically-initialized global data slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalDataSlot {
    pub name: String,
    pub init: GlobalInit,
    pub immutable: bool,
    /// Runtime-reflection/debug metadata; never selected for encryption.
    pub metadata: bool,
}

/// A module: functions plus global data slots.
///
/// Slots live in an order-preserving map so passes can delete retired
/// slots without disturbing the identity or iteration order of the rest.
/// The map serializes as a pair list since JSON keys must be strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleIr {
    pub name: String,
    pub functions: Vec<Function>,
    #[serde(with = "globals_as_pairs")]
    globals: IndexMap<GlobalId, GlobalDataSlot>,
    next_global: u32,
}

mod globals_as_pairs {
    use super::{GlobalDataSlot, GlobalId};
    use indexmap::IndexMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub(super) fn serialize<S: Serializer>(
        map: &IndexMap<GlobalId, GlobalDataSlot>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(&GlobalId, &GlobalDataSlot)> = map.iter().collect();
        pairs.serialize(serializer)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<IndexMap<GlobalId, GlobalDataSlot>, D::Error> {
        let pairs: Vec<(GlobalId, GlobalDataSlot)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

impl ModuleIr {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            globals: IndexMap::new(),
            next_global: 0,
        }
    }

    pub fn add_function(&mut self, function: Function) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(function);
        id
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn func_ids(&self) -> Vec<FuncId> {
        (0..self.functions.len() as u32).map(FuncId).collect()
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    /// Registers a global data slot and returns its handle.
    pub fn add_global(
        &mut self,
        name: impl Into<String>,
        init: GlobalInit,
        immutable: bool,
        metadata: bool,
    ) -> GlobalId {
        let id = GlobalId(self.next_global);
        self.next_global += 1;
        self.globals.insert(
            id,
            GlobalDataSlot {
                name: name.into(),
                init,
                immutable,
                metadata,
            },
        );
        id
    }

    /// Convenience constructor for a byte-string literal slot.
    pub fn add_byte_string(&mut self, name: impl Into<String>, text: &str) -> GlobalId {
        let values = text.bytes().map(u64::from).collect();
        self.add_global(name, GlobalInit::Ints { bits: 8, values }, true, false)
    }

    pub fn global(&self, id: GlobalId) -> &GlobalDataSlot {
        self.globals.get(&id).expect("stale global handle")
    }

    pub fn global_mut(&mut self, id: GlobalId) -> &mut GlobalDataSlot {
        self.globals.get_mut(&id).expect("stale global handle")
    }

    pub fn try_global(&self, id: GlobalId) -> Option<&GlobalDataSlot> {
        self.globals.get(&id)
    }

    /// Live global slots in registration order.
    pub fn globals(&self) -> impl Iterator<Item = (GlobalId, &GlobalDataSlot)> {
        self.globals.iter().map(|(id, slot)| (*id, slot))
    }

    /// Deletes a slot outright, returning it if it was live.
    pub fn remove_global(&mut self, id: GlobalId) -> Option<GlobalDataSlot> {
        self.globals.shift_remove(&id)
    }

    /// Rewrites every reference to `old` inside one function to `new`.
    pub fn replace_global_refs_in(&mut self, func: FuncId, old: GlobalId, new: GlobalId) {
        let function = &mut self.functions[func.0 as usize];
        for slot in function.ops.iter_mut().flatten() {
            for operand in &mut slot.operands {
                if *operand == Operand::Global(old) {
                    *operand = Operand::Global(new);
                }
            }
        }
    }

    /// Number of places that still reference `id`: operation operands in
    /// any function plus descriptor payload fields of other slots.
    pub fn reference_count(&self, id: GlobalId) -> usize {
        let in_ops = self
            .functions
            .iter()
            .flat_map(|f| f.ops.iter().flatten())
            .flat_map(|op| op.operands.iter())
            .filter(|operand| **operand == Operand::Global(id))
            .count();
        let in_descriptors = self
            .globals
            .iter()
            .filter(|(_, slot)| {
                matches!(&slot.init, GlobalInit::Descriptor { payload, .. } if *payload == id)
            })
            .count();
        in_ops + in_descriptors
    }

    /// Deletes `id` if nothing references it any more. Returns whether the
    /// slot was removed.
    pub fn remove_global_if_unreferenced(&mut self, id: GlobalId) -> bool {
        if self.globals.contains_key(&id) && self.reference_count(id) == 0 {
            self.globals.shift_remove(&id);
            true
        } else {
            false
        }
    }

    /// Deletes metadata slots from `candidates` that lost their last
    /// reference, following descriptor payloads so a descriptor's backing
    /// slot is reclaimed along with it.
    pub fn purge_unreferenced_metadata(&mut self, candidates: Vec<GlobalId>) {
        let mut worklist = candidates;
        while let Some(id) = worklist.pop() {
            let Some(slot) = self.globals.get(&id) else {
                continue;
            };
            if !slot.metadata || self.reference_count(id) > 0 {
                continue;
            }
            if let GlobalInit::Descriptor { payload, .. } = slot.init {
                worklist.push(payload);
            }
            self.globals.shift_remove(&id);
            tracing::debug!("purged unreferenced metadata slot {id}");
        }
    }
}
