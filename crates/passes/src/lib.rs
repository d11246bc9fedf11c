//! Obfuscation passes over the murk IR.

pub mod bogus_flow;
pub mod indirect_branch;
pub mod obfuscator;
pub mod pass;
pub mod string_encryption;

use murk_core::ir::{Function, Linkage, ModuleIr};
use murk_utils::errors::PassError;
use murk_utils::prng::Prng;

/// Trait for IR obfuscation transforms.
pub trait Transform: Send + Sync {
    /// Returns the transform's name for logging and identification.
    fn name(&self) -> &'static str;
    /// Applies the transform to the module, returning whether changes were
    /// made.
    fn apply(&self, module: &mut ModuleIr, prng: &mut Prng) -> Result<bool, PassError>;
}

/// Decides whether a pass tagged `tag` should run on `func`.
///
/// Declarations and available-externally functions are never obfuscated.
/// A `"no<tag>"` annotation suppresses the pass, a `"<tag>"` annotation
/// forces it, and otherwise `default_on` decides. The suppressing form is
/// checked first since `"<tag>"` is a substring of `"no<tag>"`.
pub fn should_obfuscate(default_on: bool, func: &Function, tag: &str) -> bool {
    if func.is_declaration() {
        return false;
    }
    if func.linkage == Linkage::AvailableExternally {
        return false;
    }
    let suppress = format!("no{tag}");
    if func.annotations.iter().any(|a| a == &suppress) {
        return false;
    }
    if func.annotations.iter().any(|a| a == tag) {
        return true;
    }
    default_on
}
