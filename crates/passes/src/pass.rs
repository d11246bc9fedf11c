use crate::Transform;
use murk_core::ir::ModuleIr;
use murk_utils::errors::PassError;
use murk_utils::prng::Prng;
use tracing::info;

/// Runs a sequence of transforms over the module, in order, logging one
/// line per pass. Returns whether any pass changed the module.
pub fn run(
    module: &mut ModuleIr,
    passes: &[Box<dyn Transform>],
    prng: &mut Prng,
) -> Result<bool, PassError> {
    let mut changed = false;
    for pass in passes {
        let mutated = pass.apply(module, prng)?;
        info!("{:>16} {}", pass.name(), if mutated { "✓" } else { "×" });
        changed |= mutated;
    }
    Ok(changed)
}
