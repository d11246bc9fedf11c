//! Front door for the pass pipeline: resolves a configuration into a pass
//! list, runs it, and reports what happened.

use crate::bogus_flow::{BogusFlow, BogusFlowConfig};
use crate::indirect_branch::IndirectBranch;
use crate::string_encryption::StringEncryption;
use crate::{pass, Transform};
use murk_core::ir::ModuleIr;
use murk_utils::errors::PassError;
use murk_utils::prng::Prng;
use serde::{Deserialize, Serialize};

/// Configuration for one obfuscation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObfuscationConfig {
    /// Seed for the run; `None` derives one from the clock and logs it.
    pub seed: Option<u64>,
    /// Whether the bogus-flow injector runs.
    pub bogus_flow: bool,
    /// Percentage of blocks the injector wraps, in `(0, 100]`.
    pub bogus_probability: u32,
    /// Repeat count for the injector's per-function loop.
    pub bogus_loops: u32,
    /// Chained-operator count in resolved opaque expressions.
    pub chain_length: u32,
    /// Whether branches are rewritten through address tables.
    pub indirect_branches: bool,
    /// Whether literal slots are encrypted.
    pub string_encryption: bool,
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            seed: None,
            bogus_flow: true,
            bogus_probability: 70,
            bogus_loops: 1,
            chain_length: 3,
            indirect_branches: false,
            string_encryption: false,
        }
    }
}

/// What an obfuscation run did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObfuscationSummary {
    pub passes: Vec<String>,
    pub seed: Option<u64>,
    pub changed: bool,
    pub functions: usize,
    pub blocks_created: usize,
    pub operations_added: usize,
}

/// Runs the configured passes over `module` in place.
pub fn obfuscate_module(
    module: &mut ModuleIr,
    config: &ObfuscationConfig,
) -> Result<ObfuscationSummary, PassError> {
    let mut prng = Prng::unseeded();
    if config.seed.is_some() {
        prng.seed(config.seed);
    }

    let mut passes: Vec<Box<dyn Transform>> = Vec::new();
    if config.bogus_flow {
        passes.push(Box::new(BogusFlow::new(BogusFlowConfig {
            probability: config.bogus_probability,
            loops: config.bogus_loops,
            chain_length: config.chain_length,
            default_on: true,
        })));
    }
    if config.indirect_branches {
        passes.push(Box::new(IndirectBranch::default()));
    }
    if config.string_encryption {
        passes.push(Box::new(StringEncryption::default()));
    }

    let blocks_before = count_blocks(module);
    let ops_before = count_ops(module);
    let changed = pass::run(module, &passes, &mut prng)?;

    Ok(ObfuscationSummary {
        passes: passes.iter().map(|p| p.name().to_string()).collect(),
        seed: config.seed,
        changed,
        functions: module.functions.len(),
        blocks_created: count_blocks(module).saturating_sub(blocks_before),
        operations_added: count_ops(module).saturating_sub(ops_before),
    })
}

fn count_blocks(module: &ModuleIr) -> usize {
    module.functions.iter().map(|f| f.cfg.node_count()).sum()
}

fn count_ops(module: &ModuleIr) -> usize {
    module
        .functions
        .iter()
        .map(|f| {
            f.block_ids()
                .into_iter()
                .map(|b| f.block(b).ops.len())
                .sum::<usize>()
        })
        .sum()
}
