//! Store subcommand handlers.

use hearth_core::MemoryStore;

use crate::cli::{GlobalOpts, OutputFormat, StoreArgs, StoreCommand};
use crate::error::CliError;

pub fn handle(args: StoreArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        StoreCommand::Summary { file } => {
            super::require_file(&file)?;
            let summary = MemoryStore::load_from(&file)?.summary();
            match global.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                OutputFormat::Plain => {
                    let rows = [
                        ("devices", summary.devices),
                        ("device variables", summary.device_variables),
                        ("peers", summary.peers),
                        ("parameters", summary.parameters),
                        ("peer variables", summary.peer_variables),
                        ("service messages", summary.service_messages),
                        ("metadata", summary.metadata),
                    ];
                    for (table, count) in rows {
                        println!("{table:<18}{count:>8}");
                    }
                }
            }
            Ok(())
        }
    }
}
