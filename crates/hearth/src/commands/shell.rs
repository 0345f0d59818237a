//! `hearth shell`: load one family from a store snapshot and drive its
//! CLI hook.
//!
//! No family-specific description is available offline, so peers get a
//! description synthesized from their stored parameter rows. Every value
//! is shown as the hex string of its stored bytes.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use hearth_config::Config;
use hearth_core::storage::{DeviceRow, ParameterRow, PeerRow};
use hearth_core::{
    DeviceDescription, DeviceFamily, DeviceHooks, DeviceInit, FamilyHooks, Function, HubContext,
    LogicalDevice, LogicalType, MemoryStore, Parameter, ParameterSetType, Peer, PeerInit, Storage,
    ValueCodec, Variable,
};

use crate::cli::{GlobalOpts, OutputFormat, ShellArgs};
use crate::error::CliError;

pub fn handle(args: ShellArgs, global: &GlobalOpts, config: &Config) -> Result<(), CliError> {
    super::require_file(&args.file)?;
    let store = Arc::new(MemoryStore::load_from(&args.file)?);
    let context = HubContext::new(store.clone(), config.core_config());
    let family = DeviceFamily::new(
        args.family,
        "shell",
        context.as_sink(),
        Arc::new(StoredFamily { store }),
    );
    let loaded = family.load()?;
    tracing::debug!(family = args.family, loaded, "family loaded from snapshot");

    let mut transcript = Vec::with_capacity(args.commands.len());
    for command in &args.commands {
        let output = family.handle_cli_command(command);
        match global.output {
            OutputFormat::Plain => print!("{output}"),
            OutputFormat::Json => transcript.push(Variable::from_pairs([
                ("command", Variable::from(command.as_str())),
                ("output", Variable::String(output)),
            ])),
        }
    }
    if global.output == OutputFormat::Json {
        println!(
            "{}",
            serde_json::to_string_pretty(&Variable::Array(transcript))?
        );
    }

    if let Err(e) = family.dispose() {
        tracing::warn!(error = %e, "family disposed with errors");
    }
    Ok(())
}

// ── Snapshot-backed hooks ───────────────────────────────────────────

struct StoredFamily {
    store: Arc<MemoryStore>,
}

impl FamilyHooks for StoredFamily {
    fn create_device(&self, family: &DeviceFamily, row: &DeviceRow) -> Option<Arc<LogicalDevice>> {
        Some(LogicalDevice::new(
            DeviceInit::from(row),
            family.device_sink(),
            Arc::new(StoredPeers {
                store: Arc::clone(&self.store),
            }),
        ))
    }
}

struct StoredPeers {
    store: Arc<MemoryStore>,
}

impl DeviceHooks for StoredPeers {
    fn create_peer(&self, device: &LogicalDevice, row: &PeerRow) -> Option<Arc<Peer>> {
        let rows = match self.store.get_peer_parameters(row.id) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(peer_id = row.id, error = %e, "cannot read stored parameters");
                return None;
            }
        };
        Some(Peer::new(
            PeerInit {
                id: row.id,
                parent_id: row.parent_id,
                address: row.address,
                serial: row.serial.clone(),
                device_type: 0,
                description: Arc::new(stored_description(&rows)),
            },
            device.peer_owner(),
            None,
        ))
    }
}

/// One function per stored channel, one string parameter per stored row.
fn stored_description(rows: &[ParameterRow]) -> DeviceDescription {
    let codec: Arc<dyn ValueCodec> = Arc::new(HexCodec);
    let mut functions: BTreeMap<u32, Function> = BTreeMap::new();
    for row in rows {
        let function = functions
            .entry(row.channel)
            .or_insert_with(|| Function::new(row.channel, "STORED"));
        let parameter =
            Parameter::new(row.name.as_str(), LogicalType::String).with_codec(Arc::clone(&codec));
        match row.kind {
            ParameterSetType::Config => function.config.insert(parameter),
            ParameterSetType::Values => function.variables.insert(parameter),
            ParameterSetType::Link => function.link.insert(parameter),
            ParameterSetType::None => {}
        }
    }
    functions
        .into_values()
        .fold(DeviceDescription::new(0, "STORED"), DeviceDescription::with_function)
}

/// Stored bytes as lowercase hex.
#[derive(Debug)]
struct HexCodec;

impl ValueCodec for HexCodec {
    fn encode(&self, _logical: &LogicalType, value: &Variable) -> Result<Vec<u8>, String> {
        let text = value.as_str().ok_or_else(|| format!("{value} is not a hex string"))?;
        if text.len() % 2 != 0 {
            return Err(format!("odd number of hex digits in {text:?}"));
        }
        (0..text.len())
            .step_by(2)
            .map(|i| {
                text.get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| format!("invalid hex digits in {text:?}"))
            })
            .collect()
    }

    fn decode(&self, _logical: &LogicalType, data: &[u8]) -> Variable {
        Variable::String(data.iter().fold(
            String::with_capacity(data.len() * 2),
            |mut out, byte| {
                let _ = write!(out, "{byte:02x}");
                out
            },
        ))
    }
}
