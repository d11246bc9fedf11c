use crate::commands::{load_module, Command};
use clap::Args;
use murk_core::ir::{GlobalInit, Terminator};
use std::error::Error;

/// Arguments for the dump subcommand.
#[derive(Args)]
pub struct DumpArgs {
    /// Also list every block of every function
    #[arg(long)]
    pub blocks: bool,
}

impl Command for DumpArgs {
    fn execute(self, input: &str) -> Result<(), Box<dyn Error>> {
        let module = load_module(input)?;

        println!("module {}", module.name);
        println!("globals:");
        for (id, slot) in module.globals() {
            let init = match &slot.init {
                GlobalInit::Ints { bits, values } => {
                    format!("i{} x {} [{}]", bits, values.len(), preview(*bits, values))
                }
                GlobalInit::BlockAddrs(addrs) => format!("blockaddr x {}", addrs.len()),
                GlobalInit::Descriptor { payload, len, .. } => {
                    format!("descriptor -> {payload} (len {len})")
                }
            };
            let mut attrs = Vec::new();
            if slot.immutable {
                attrs.push("const");
            }
            if slot.metadata {
                attrs.push("metadata");
            }
            println!("  {id} {:24} {init} {}", slot.name, attrs.join(" "));
        }

        println!("functions:");
        for id in module.func_ids() {
            let f = module.function(id);
            if f.is_declaration() {
                println!("  {} (declaration)", f.name);
                continue;
            }
            println!(
                "  {} — {} block(s), {} edge(s)",
                f.name,
                f.cfg.node_count(),
                f.cfg.edge_count()
            );
            if self.blocks {
                for block in f.block_ids() {
                    let bb = f.block(block);
                    println!(
                        "    [{:>3}] {:12} {:3} op(s)  {}",
                        block.index(),
                        bb.name,
                        bb.ops.len(),
                        term_name(&bb.term)
                    );
                }
            }
        }
        Ok(())
    }
}

/// Short hex preview of an integer slot's leading bytes.
fn preview(bits: u32, values: &[u64]) -> String {
    let shown: Vec<u8> = values.iter().take(8).map(|&v| v as u8).collect();
    let mut text = hex::encode(shown);
    if bits != 8 || values.len() > 8 {
        text.push('…');
    }
    text
}

fn term_name(term: &Terminator) -> &'static str {
    match term {
        Terminator::Br { .. } => "br",
        Terminator::CondBr { .. } => "condbr",
        Terminator::IndirectBr { .. } => "indirectbr",
        Terminator::Ret { .. } => "ret",
        Terminator::Unreachable => "unreachable",
    }
}
