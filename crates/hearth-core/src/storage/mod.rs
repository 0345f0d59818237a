// ── Persistence boundary ──
//
// The hub's storage engine is reached only through the `Storage` trait. Rows
// are typed; the engine decides how they map to tables. Every `save_*` call
// returns the row id: a fresh id for inserts, the given id for updates.

mod memory;

pub use memory::{FailPoint, MemoryStore, StoreOp, StoreSummary};

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::description::ParameterSetType;
use crate::error::CoreError;

/// Whether a savepoint is taken on the caller's thread or queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum SavepointMode {
    Sync,
    Async,
}

// ── Rows ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRow {
    /// 0 when the device has never been saved.
    pub id: u64,
    pub family: u32,
    pub address: i32,
    pub serial: String,
    pub device_type: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRow {
    /// 0 when the peer has never been saved.
    pub id: u64,
    pub parent_id: u64,
    pub address: i32,
    pub serial: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterRow {
    pub row_id: Option<u64>,
    pub peer_id: u64,
    pub kind: ParameterSetType,
    pub channel: u32,
    /// Remote endpoint of link parameters; 0 for config and values.
    pub remote_address: i32,
    pub remote_channel: Option<u32>,
    pub name: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    Int(i64),
    Text(String),
    Binary(Vec<u8>),
}

impl StoredValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(v) => Some(v),
            _ => None,
        }
    }
}

/// Indexed variable of a device or peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableRow {
    pub row_id: Option<u64>,
    pub owner_id: u64,
    pub index: u32,
    pub value: StoredValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceMessageValue {
    Flag { value: bool },
    ChannelError { channel: u32, id: String, value: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMessageRow {
    pub row_id: Option<u64>,
    pub peer_id: u64,
    pub index: u32,
    pub value: ServiceMessageValue,
}

// ── Storage trait ───────────────────────────────────────────────────

/// Row-oriented persistence callbacks consumed by the core.
pub trait Storage: Send + Sync {
    fn create_savepoint(&self, name: &str, mode: SavepointMode) -> Result<(), CoreError>;
    fn release_savepoint(&self, name: &str, mode: SavepointMode) -> Result<(), CoreError>;

    fn get_devices(&self, family: u32) -> Result<Vec<DeviceRow>, CoreError>;
    fn save_device(&self, row: &DeviceRow) -> Result<u64, CoreError>;
    fn delete_device(&self, id: u64) -> Result<(), CoreError>;
    fn get_device_variables(&self, device_id: u64) -> Result<Vec<VariableRow>, CoreError>;
    fn save_device_variable(&self, row: &VariableRow) -> Result<u64, CoreError>;

    fn get_peers(&self, device_id: u64) -> Result<Vec<PeerRow>, CoreError>;
    fn save_peer(&self, row: &PeerRow) -> Result<u64, CoreError>;
    /// Delete a peer row together with every row that references it.
    fn delete_peer(&self, id: u64) -> Result<(), CoreError>;
    fn delete_peers(&self, device_id: u64) -> Result<(), CoreError>;
    /// Re-key a peer and its dependent rows. `false` when `new_id` is taken.
    fn set_peer_id(&self, old_id: u64, new_id: u64) -> Result<bool, CoreError>;

    fn get_peer_parameters(&self, peer_id: u64) -> Result<Vec<ParameterRow>, CoreError>;
    fn save_peer_parameter(&self, row: &ParameterRow) -> Result<u64, CoreError>;
    fn delete_peer_parameter(&self, peer_id: u64, row_id: u64) -> Result<(), CoreError>;

    fn get_peer_variables(&self, peer_id: u64) -> Result<Vec<VariableRow>, CoreError>;
    fn save_peer_variable(&self, row: &VariableRow) -> Result<u64, CoreError>;

    fn get_service_messages(&self, peer_id: u64) -> Result<Vec<ServiceMessageRow>, CoreError>;
    fn save_service_message(&self, row: &ServiceMessageRow) -> Result<u64, CoreError>;
    fn delete_service_message(&self, row_id: u64) -> Result<(), CoreError>;

    /// Drop stored metadata of a peer, or only `data_id` when given.
    fn delete_metadata(
        &self,
        peer_id: u64,
        serial: &str,
        data_id: Option<&str>,
    ) -> Result<(), CoreError>;
}
