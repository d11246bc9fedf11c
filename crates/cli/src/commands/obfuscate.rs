use crate::commands::{load_module, save_module, Command};
use clap::Args;
use murk_passes::obfuscator::{obfuscate_module, ObfuscationConfig};
use std::error::Error;
use tracing::info;

/// Arguments for the obfuscate subcommand.
#[derive(Args)]
pub struct ObfuscateArgs {
    /// Seed for the run; omitted means derive one from the clock
    #[arg(long)]
    pub seed: Option<u64>,

    /// Percentage of blocks the bogus-flow injector wraps (0-100]
    #[arg(long, default_value_t = 70)]
    pub bogus_prob: u32,

    /// How many times the injector loops over each function
    #[arg(long, default_value_t = 1)]
    pub bogus_loop: u32,

    /// Operator-chain length of resolved opaque expressions
    #[arg(long, default_value_t = 3)]
    pub chain: u32,

    /// Disable the bogus-flow injector
    #[arg(long)]
    pub no_bogus: bool,

    /// Rewrite branches into table-indexed indirect jumps
    #[arg(long)]
    pub indirect: bool,

    /// Encrypt string literals with guarded in-place decryption
    #[arg(long)]
    pub strings: bool,

    /// Output path; defaults to overwriting the input
    #[arg(short, long)]
    pub output: Option<String>,
}

impl Command for ObfuscateArgs {
    fn execute(self, input: &str) -> Result<(), Box<dyn Error>> {
        let mut module = load_module(input)?;

        let config = ObfuscationConfig {
            seed: self.seed,
            bogus_flow: !self.no_bogus,
            bogus_probability: self.bogus_prob,
            bogus_loops: self.bogus_loop,
            chain_length: self.chain,
            indirect_branches: self.indirect,
            string_encryption: self.strings,
        };
        let summary = obfuscate_module(&mut module, &config)?;

        info!(
            "applied {:?}: {} block(s) and {} operation(s) added across {} function(s)",
            summary.passes, summary.blocks_created, summary.operations_added, summary.functions
        );
        if !summary.changed {
            info!("module unchanged");
        }

        let output = self.output.as_deref().unwrap_or(input);
        save_module(&module, output)?;
        info!("wrote {output}");
        Ok(())
    }
}
