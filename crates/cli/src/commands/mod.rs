use clap::Subcommand;
use murk_core::ir::ModuleIr;
use murk_utils::errors::CliError;
use std::error::Error;
use std::fs;

pub mod dump;
pub mod obfuscate;
pub mod run;

#[derive(Subcommand)]
pub enum Cmd {
    /// Apply obfuscation passes and write the transformed module
    Obfuscate(obfuscate::ObfuscateArgs),

    /// Print a census of the module's functions and global slots
    Dump(dump::DumpArgs),

    /// Interpret a function in the module and print its result
    Run(run::RunArgs),
}

pub trait Command {
    fn execute(self, input: &str) -> Result<(), Box<dyn Error>>;
}

impl Command for Cmd {
    fn execute(self, input: &str) -> Result<(), Box<dyn Error>> {
        match self {
            Self::Obfuscate(args) => args.execute(input),
            Self::Dump(args) => args.execute(input),
            Self::Run(args) => args.execute(input),
        }
    }
}

/// Reads a JSON-serialized module from disk.
pub fn load_module(path: &str) -> Result<ModuleIr, CliError> {
    let text = fs::read_to_string(path).map_err(|source| CliError::FileRead {
        path: path.to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// Writes a module back out as JSON.
pub fn save_module(module: &ModuleIr, path: &str) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(module)?;
    fs::write(path, text).map_err(|source| CliError::FileWrite {
        path: path.to_string(),
        source,
    })
}
