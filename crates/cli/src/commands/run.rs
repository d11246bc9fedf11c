use crate::commands::{load_module, Command};
use clap::Args;
use murk_core::interp::{Interp, Value};
use std::error::Error;

/// Arguments for the run subcommand.
#[derive(Args)]
pub struct RunArgs {
    /// Name of the function to interpret
    #[arg(long, short)]
    pub function: String,

    /// Integer arguments, comma separated
    #[arg(long, value_delimiter = ',')]
    pub args: Vec<u64>,
}

impl Command for RunArgs {
    fn execute(self, input: &str) -> Result<(), Box<dyn Error>> {
        let module = load_module(input)?;
        let mut interp = Interp::new(&module);
        match interp.call_by_name(&self.function, &self.args)? {
            Some(Value::Int(v)) => println!("{v} (0x{v:x})"),
            Some(Value::Slot { global, index }) => println!("&{global}[{index}]"),
            Some(Value::Block(addr)) => {
                println!("blockaddress({:?}, {})", addr.func, addr.block.index())
            }
            None => println!("void"),
        }
        Ok(())
    }
}
