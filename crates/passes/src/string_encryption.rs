//! String-literal encryption with lazily-triggered, concurrency-safe
//! in-place decryption.
//!
//! Eligible literal slots are XOR-masked with a one-time pad of matching
//! element width, drawn from the PRNG and kept in a key map built once per
//! run. Every function that uses an encrypted slot gets a process-lifetime
//! decryption flag and a guarded prologue:
//!
//! ```text
//!   entry:   flag ==(acquire) 0 ?
//!     | yes                 | no
//!   decrypt: slot[i] ^= key[i]  (in place, element by element)
//!     |
//!   body:    flag =(release) 1; ...original work...
//! ```
//!
//! The flag only ever moves 0 -> 1 and the decrypt is a pure XOR toggle,
//! so two threads racing through the prologue before either publishes the
//! flag at worst decrypt the same bytes twice with the same key — a benign,
//! idempotent race that is tolerated instead of locked away. Threads that
//! observe the flag as 1 through the acquire load are guaranteed to see
//! the decrypted bytes published by the release store.

use crate::{should_obfuscate, Transform};
use murk_core::ir::{
    AtomicOrdering, BinOp, FuncId, Function, GlobalId, GlobalInit, IntWidth, ModuleIr, OpKind,
    Operand, Pred, Terminator,
};
use murk_utils::errors::PassError;
use murk_utils::prng::Prng;
use std::collections::HashMap;
use tracing::debug;

/// Encrypts literal data slots and installs guarded per-function
/// decryption.
#[derive(Debug)]
pub struct StringEncryption {
    pub default_on: bool,
}

impl Default for StringEncryption {
    fn default() -> Self {
        Self { default_on: true }
    }
}

impl StringEncryption {
    pub fn new(default_on: bool) -> Self {
        Self { default_on }
    }
}

/// One-time pads keyed by the encrypted slot they mask, built once per
/// run and never reused across slots.
type KeyMap = HashMap<GlobalId, (IntWidth, Vec<u64>)>;

impl Transform for StringEncryption {
    fn name(&self) -> &'static str {
        "StringEncryption"
    }

    fn apply(&self, module: &mut ModuleIr, prng: &mut Prng) -> Result<bool, PassError> {
        // The key map spans the whole run; every encrypted slot enters it
        // exactly once and no pad is ever reused across slots.
        let mut keys: KeyMap = HashMap::new();
        let mut slot_count = 0u32;
        let mut changed = false;
        for func in module.func_ids() {
            if !should_obfuscate(self.default_on, module.function(func), "strenc") {
                debug!(
                    "string-encryption: skipping {}",
                    module.function(func).name
                );
                continue;
            }
            changed |= handle_function(module, func, &mut keys, &mut slot_count, prng)?;
        }
        Ok(changed)
    }
}

/// Global slots referenced by the function's operations, in order of first
/// reference.
fn referenced_globals(f: &Function) -> Vec<GlobalId> {
    let mut seen = Vec::new();
    for block in f.block_ids() {
        for &op_id in &f.block(block).ops {
            for operand in &f.op(op_id).operands {
                if let Operand::Global(g) = operand {
                    if !seen.contains(g) {
                        seen.push(*g);
                    }
                }
            }
        }
    }
    seen
}

fn draw_key_element(prng: &mut Prng, width: IntWidth) -> u64 {
    match width {
        IntWidth::W8 => prng.next_u8().into(),
        IntWidth::W16 => prng.next_u16().into(),
        IntWidth::W32 => prng.next_u32().into(),
        IntWidth::W64 => prng.next_u64(),
    }
}

fn handle_function(
    module: &mut ModuleIr,
    func: FuncId,
    keys: &mut KeyMap,
    slot_count: &mut u32,
    prng: &mut Prng,
) -> Result<bool, PassError> {
    // Selection: plain integer-sequence literals referenced by this
    // function, plus payloads of boxed descriptors it references.
    // Reflection metadata is off limits.
    //
    // Each selected function masks its own copies. The decrypt prologue
    // XORs its slots in place under this function's flag, so a copy shared
    // with another guarded function would be re-encrypted by whichever
    // prologue ran second.
    let mut old2new: HashMap<GlobalId, GlobalId> = HashMap::new();
    let referenced = referenced_globals(module.function(func));
    let mut raw: Vec<GlobalId> = Vec::new();
    let mut boxed: Vec<GlobalId> = Vec::new();
    for id in &referenced {
        let Some(slot) = module.try_global(*id) else {
            continue;
        };
        if slot.metadata {
            continue;
        }
        match &slot.init {
            GlobalInit::Ints { .. } => {
                if !raw.contains(id) {
                    raw.push(*id);
                }
            }
            GlobalInit::Descriptor { payload, .. } => {
                let eligible = module.try_global(*payload).is_some_and(|p| {
                    !p.metadata && matches!(p.init, GlobalInit::Ints { .. })
                });
                if eligible {
                    boxed.push(*id);
                    if !raw.contains(payload) {
                        raw.push(*payload);
                    }
                }
            }
            GlobalInit::BlockAddrs(_) => {}
        }
    }

    // Masking: draw a pad per slot, XOR it in, and register the encrypted
    // replacement. All-zero initializers stay put, like empty literals.
    for id in &raw {
        if old2new.contains_key(id) {
            continue;
        }
        let slot = module.global(*id);
        let GlobalInit::Ints { bits, values } = &slot.init else {
            continue;
        };
        if values.iter().all(|&v| v == 0) {
            continue;
        }
        let Some(width) = IntWidth::try_from_bits(*bits) else {
            // No encode/decode routine for this width: corrupting the slot
            // silently is worse than dying.
            return Err(PassError::UnsupportedWidth(*bits));
        };
        let bits = *bits;
        let mut key = Vec::with_capacity(values.len());
        let mut masked = Vec::with_capacity(values.len());
        for &v in values {
            let k = draw_key_element(prng, width);
            key.push(k);
            masked.push((v ^ k) & width.mask());
        }
        // The replacement slot is written back at run time, so it must be
        // mutable regardless of how the original was declared.
        let new = module.add_global(
            format!("enc_str_{}", *slot_count),
            GlobalInit::Ints {
                bits,
                values: masked,
            },
            false,
            false,
        );
        *slot_count += 1;
        old2new.insert(*id, new);
        keys.insert(new, (width, key));
        debug!("string-encryption: masked slot {id} as {new}");
    }

    // Rebuild boxed descriptors to point at the encrypted payloads.
    for id in &boxed {
        if old2new.contains_key(id) {
            continue;
        }
        let GlobalInit::Descriptor { tag, len, payload } = module.global(*id).init.clone() else {
            continue;
        };
        let Some(&new_payload) = old2new.get(&payload) else {
            continue; // all-zero payloads were never masked
        };
        let immutable = module.global(*id).immutable;
        let new = module.add_global(
            format!("enc_box_{}", *slot_count),
            GlobalInit::Descriptor {
                tag,
                len,
                payload: new_payload,
            },
            immutable,
            false,
        );
        *slot_count += 1;
        old2new.insert(*id, new);
    }

    // Swing this function's references onto the encrypted slots, then
    // delete originals that nothing references any more. Descriptors go
    // first: a dead descriptor still pins its payload through the payload
    // field until it is gone.
    for (&old, &new) in old2new.iter() {
        module.replace_global_refs_in(func, old, new);
    }
    let mut retired: Vec<GlobalId> = boxed.clone();
    retired.extend(raw.iter().copied());
    for old in retired {
        if old2new.contains_key(&old) && module.remove_global_if_unreferenced(old) {
            debug!("string-encryption: deleted retired slot {old}");
        }
    }

    // The (slot, key) pairs this function must decrypt: encrypted slots it
    // references directly, plus payloads of encrypted descriptors.
    let mut pairs: Vec<(GlobalId, IntWidth, Vec<u64>)> = Vec::new();
    for id in referenced_globals(module.function(func)) {
        let slot_id = match module.try_global(id).map(|s| &s.init) {
            Some(GlobalInit::Descriptor { payload, .. }) => *payload,
            _ => id,
        };
        if pairs.iter().any(|(s, ..)| *s == slot_id) {
            continue;
        }
        if let Some((width, key)) = keys.get(&slot_id) {
            pairs.push((slot_id, *width, key.clone()));
        }
    }
    if pairs.is_empty() {
        return Ok(false);
    }

    // Per-function decryption flag: 0 = still encrypted, 1 = decrypted,
    // for the lifetime of the process.
    let func_name = module.function(func).name.clone();
    let flag = module.add_global(
        format!("dec_flag_{func_name}"),
        GlobalInit::Ints {
            bits: 32,
            values: vec![0],
        },
        false,
        false,
    );

    let f = module.function_mut(func);
    let entry = f
        .entry()
        .ok_or(PassError::MalformedIr("declaration selected for encryption"))?;

    // Split the entry into check block and body, with the decryption
    // block between them.
    let at = f.first_nontrivial_index(entry);
    let body = f.split_block(entry, at, "body");
    let decrypt = f.add_block("decrypt");

    // Decryption block: walk each slot element by element, XOR the key
    // element in, store back. In place and irreversible.
    for (slot, width, key) in &pairs {
        for (i, &k) in key.iter().enumerate() {
            let gep = f.push_op(decrypt, OpKind::Gep, vec![
                Operand::Global(*slot),
                Operand::Const(i as u64),
            ]);
            let loaded = f.push_op(decrypt, OpKind::Load { order: None }, vec![Operand::Value(
                gep,
            )]);
            let unmasked = f.push_op(
                decrypt,
                OpKind::Bin {
                    op: BinOp::Xor,
                    width: *width,
                },
                vec![Operand::Value(loaded), Operand::Const(k)],
            );
            f.push_op(decrypt, OpKind::Store { order: None }, vec![
                Operand::Value(unmasked),
                Operand::Value(gep),
            ]);
        }
    }
    f.set_term(decrypt, Terminator::Br { target: body });

    // Check block: acquire-load the flag; 0 means decrypt first.
    let status = f.push_op(
        entry,
        OpKind::Load {
            order: Some(AtomicOrdering::Acquire),
        },
        vec![Operand::Global(flag)],
    );
    let still_encrypted = f.push_op(
        entry,
        OpKind::Cmp {
            pred: Pred::Eq,
            width: IntWidth::W32,
        },
        vec![Operand::Value(status), Operand::Const(0)],
    );
    f.set_term(entry, Terminator::CondBr {
        cond: Operand::Value(still_encrypted),
        then_to: decrypt,
        else_to: body,
    });

    // Body start: publish the flag with release ordering no matter which
    // path control arrived on.
    f.insert_op(
        body,
        0,
        OpKind::Store {
            order: Some(AtomicOrdering::Release),
        },
        vec![Operand::Const(1), Operand::Global(flag)],
    );

    debug!(
        "string-encryption: guarded {} with {} slot(s)",
        func_name,
        pairs.len()
    );
    Ok(true)
}
