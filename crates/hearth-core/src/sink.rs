// ── Upward event-sink chain ──
//
// Peer → LogicalDevice → DeviceFamily → HubContext. Every layer implements
// `EventSink` and only names its parent through `upstream()`; the provided
// methods forward unchanged. A layer overrides a method when it needs to
// intercept (the device re-indexes peers on `save_peer`, for example). The
// root overrides everything and talks to `Storage` and the RPC listeners.

use std::sync::Arc;

use tracing::trace;

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::lifecycle::LifecyclePhase;
use crate::storage::{
    DeviceRow, ParameterRow, PeerRow, SavepointMode, ServiceMessageRow, VariableRow,
};
use crate::variable::Variable;

/// Value change notification for RPC consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcEvent {
    pub peer_id: u64,
    pub channel: u32,
    /// `SERIAL:CHANNEL`.
    pub address: String,
    pub keys: Vec<String>,
    pub values: Vec<Variable>,
}

impl RpcEvent {
    pub fn new(peer_id: u64, channel: u32, serial: &str) -> Self {
        Self {
            peer_id,
            channel,
            address: format!("{serial}:{channel}"),
            keys: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Variable>) -> Self {
        self.keys.push(key.into());
        self.values.push(value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Value emitted for `key`, if any.
    pub fn value(&self, key: &str) -> Option<&Variable> {
        self.keys
            .iter()
            .position(|k| k == key)
            .and_then(|i| self.values.get(i))
    }
}

/// External consumer of RPC broadcasts, registered on the `HubContext`.
#[allow(unused_variables)]
pub trait RpcListener: Send + Sync {
    fn on_event(&self, event: &RpcEvent) {}
    fn on_new_devices(&self, descriptions: &[Variable]) {}
    fn on_delete_devices(&self, addresses: &[String], info: &[Variable]) {}
    fn on_update_device(&self, peer_id: u64, channel: u32, address: &str, hint: i32) {}
}

/// One link in the upward persistence and broadcast chain.
pub trait EventSink: Send + Sync {
    /// Name used in log output and `Detached` errors.
    fn sink_name(&self) -> String;

    /// The single parent sink, `None` at the root or once detached.
    fn upstream(&self) -> Option<Arc<dyn EventSink>>;

    fn parent(&self) -> Result<Arc<dyn EventSink>, CoreError> {
        self.upstream().ok_or_else(|| CoreError::Detached {
            entity: self.sink_name(),
        })
    }

    // ── Context ──────────────────────────────────────────────────────

    fn phase(&self) -> LifecyclePhase {
        self.upstream()
            .map_or(LifecyclePhase::Running, |parent| parent.phase())
    }

    fn settings(&self) -> Arc<CoreConfig> {
        self.upstream()
            .map_or_else(|| Arc::new(CoreConfig::default()), |parent| parent.settings())
    }

    // ── Persistence ──────────────────────────────────────────────────

    fn create_savepoint(&self, name: &str, mode: SavepointMode) -> Result<(), CoreError> {
        self.parent()?.create_savepoint(name, mode)
    }

    fn release_savepoint(&self, name: &str, mode: SavepointMode) -> Result<(), CoreError> {
        self.parent()?.release_savepoint(name, mode)
    }

    fn delete_metadata(
        &self,
        peer_id: u64,
        serial: &str,
        data_id: Option<&str>,
    ) -> Result<(), CoreError> {
        self.parent()?.delete_metadata(peer_id, serial, data_id)
    }

    fn get_devices(&self, family: u32) -> Result<Vec<DeviceRow>, CoreError> {
        self.parent()?.get_devices(family)
    }

    fn save_device(&self, row: &DeviceRow) -> Result<u64, CoreError> {
        self.parent()?.save_device(row)
    }

    fn delete_device(&self, id: u64) -> Result<(), CoreError> {
        self.parent()?.delete_device(id)
    }

    fn get_device_variables(&self, device_id: u64) -> Result<Vec<VariableRow>, CoreError> {
        self.parent()?.get_device_variables(device_id)
    }

    fn save_device_variable(&self, row: &VariableRow) -> Result<u64, CoreError> {
        self.parent()?.save_device_variable(row)
    }

    fn get_peers(&self, device_id: u64) -> Result<Vec<PeerRow>, CoreError> {
        self.parent()?.get_peers(device_id)
    }

    fn save_peer(&self, row: &PeerRow) -> Result<u64, CoreError> {
        self.parent()?.save_peer(row)
    }

    fn delete_peer(&self, id: u64) -> Result<(), CoreError> {
        self.parent()?.delete_peer(id)
    }

    fn delete_peers(&self, device_id: u64) -> Result<(), CoreError> {
        self.parent()?.delete_peers(device_id)
    }

    /// Re-key a peer. `false` when `new_id` is already taken.
    fn set_peer_id(&self, old_id: u64, new_id: u64) -> Result<bool, CoreError> {
        self.parent()?.set_peer_id(old_id, new_id)
    }

    fn get_peer_parameters(&self, peer_id: u64) -> Result<Vec<ParameterRow>, CoreError> {
        self.parent()?.get_peer_parameters(peer_id)
    }

    fn save_peer_parameter(&self, row: &ParameterRow) -> Result<u64, CoreError> {
        self.parent()?.save_peer_parameter(row)
    }

    fn delete_peer_parameter(&self, peer_id: u64, row_id: u64) -> Result<(), CoreError> {
        self.parent()?.delete_peer_parameter(peer_id, row_id)
    }

    fn get_peer_variables(&self, peer_id: u64) -> Result<Vec<VariableRow>, CoreError> {
        self.parent()?.get_peer_variables(peer_id)
    }

    fn save_peer_variable(&self, row: &VariableRow) -> Result<u64, CoreError> {
        self.parent()?.save_peer_variable(row)
    }

    fn get_service_messages(&self, peer_id: u64) -> Result<Vec<ServiceMessageRow>, CoreError> {
        self.parent()?.get_service_messages(peer_id)
    }

    fn save_service_message(&self, row: &ServiceMessageRow) -> Result<u64, CoreError> {
        self.parent()?.save_service_message(row)
    }

    fn delete_service_message(&self, row_id: u64) -> Result<(), CoreError> {
        self.parent()?.delete_service_message(row_id)
    }

    // ── RPC broadcast ────────────────────────────────────────────────

    fn rpc_event(&self, event: RpcEvent) {
        match self.upstream() {
            Some(parent) => parent.rpc_event(event),
            None => trace!(sink = %self.sink_name(), "dropping rpc event, no upstream"),
        }
    }

    fn rpc_new_devices(&self, descriptions: Vec<Variable>) {
        if let Some(parent) = self.upstream() {
            parent.rpc_new_devices(descriptions);
        }
    }

    fn rpc_delete_devices(&self, addresses: Vec<String>, info: Vec<Variable>) {
        if let Some(parent) = self.upstream() {
            parent.rpc_delete_devices(addresses, info);
        }
    }

    fn rpc_update_device(&self, peer_id: u64, channel: u32, address: String, hint: i32) {
        if let Some(parent) = self.upstream() {
            parent.rpc_update_device(peer_id, channel, address, hint);
        }
    }
}
