/// Entry point for the murk CLI, an IR-level binary-protection toolkit.
///
/// Parses command-line arguments and dispatches to subcommands for
/// obfuscating, inspecting, or interpreting a serialized module. Logging
/// is initialized here and nowhere else.
use clap::Parser;
use murk_cli::commands::{Cmd, Command};
use tracing_subscriber::EnvFilter;

/// Command-line interface for murk.
///
/// Murk mutates a program module's control flow and static data to resist
/// static analysis: bogus control flow behind opaque predicates, indirect
/// branches through address tables, and encrypted string literals with
/// guarded in-place decryption.
#[derive(Parser)]
#[command(name = "murk")]
#[command(about = "murk: control-flow and data obfuscation over a serialized module")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Path to a JSON-serialized module
    input: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    cli.command.execute(&cli.input)
}
