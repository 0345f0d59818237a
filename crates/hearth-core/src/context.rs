// ── Hub context ──
//
// The explicit root of the event-sink chain. Constructed once by the host
// and handed to every family; owns the storage engine, the RPC listener
// registry, the hub lifecycle phase and the core configuration.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::lifecycle::{LifecyclePhase, PhaseCell};
use crate::registry::{EventSinkRegistry, HandlerRef, SinkId};
use crate::sink::{EventSink, RpcEvent, RpcListener};
use crate::storage::{
    DeviceRow, ParameterRow, PeerRow, SavepointMode, ServiceMessageRow, Storage, VariableRow,
};
use crate::variable::Variable;

pub struct HubContext {
    storage: Arc<dyn Storage>,
    listeners: EventSinkRegistry<dyn RpcListener>,
    phase: PhaseCell,
    config: Arc<CoreConfig>,
}

impl HubContext {
    /// New context in the `Booting` phase.
    pub fn new(storage: Arc<dyn Storage>, config: CoreConfig) -> Arc<Self> {
        let listeners = EventSinkRegistry::with_poll_interval(config.unsubscribe_poll_interval);
        Arc::new(Self {
            storage,
            listeners,
            phase: PhaseCell::new(LifecyclePhase::Booting),
            config: Arc::new(config),
        })
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn set_phase(&self, phase: LifecyclePhase) {
        info!(%phase, "hub phase changed");
        self.phase.set(phase);
    }

    pub fn subscribe(
        &self,
        id: impl Into<SinkId>,
        listener: Arc<dyn RpcListener>,
    ) -> HandlerRef<dyn RpcListener> {
        self.listeners.subscribe(id, listener)
    }

    pub fn unsubscribe(&self, handle: &HandlerRef<dyn RpcListener>) {
        self.listeners.unsubscribe(handle);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// This context as the parent of a family.
    pub fn as_sink(self: &Arc<Self>) -> Arc<dyn EventSink> {
        Arc::clone(self) as Arc<dyn EventSink>
    }
}

impl std::fmt::Debug for HubContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubContext")
            .field("phase", &self.phase.get())
            .field("listeners", &self.listeners.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EventSink for HubContext {
    fn sink_name(&self) -> String {
        "hub".into()
    }

    fn upstream(&self) -> Option<Arc<dyn EventSink>> {
        None
    }

    fn phase(&self) -> LifecyclePhase {
        self.phase.get()
    }

    fn settings(&self) -> Arc<CoreConfig> {
        Arc::clone(&self.config)
    }

    // ── Persistence ──────────────────────────────────────────────────

    fn create_savepoint(&self, name: &str, mode: SavepointMode) -> Result<(), CoreError> {
        self.storage.create_savepoint(name, mode)
    }

    fn release_savepoint(&self, name: &str, mode: SavepointMode) -> Result<(), CoreError> {
        self.storage.release_savepoint(name, mode)
    }

    fn delete_metadata(
        &self,
        peer_id: u64,
        serial: &str,
        data_id: Option<&str>,
    ) -> Result<(), CoreError> {
        self.storage.delete_metadata(peer_id, serial, data_id)
    }

    fn get_devices(&self, family: u32) -> Result<Vec<DeviceRow>, CoreError> {
        self.storage.get_devices(family)
    }

    fn save_device(&self, row: &DeviceRow) -> Result<u64, CoreError> {
        self.storage.save_device(row)
    }

    fn delete_device(&self, id: u64) -> Result<(), CoreError> {
        self.storage.delete_device(id)
    }

    fn get_device_variables(&self, device_id: u64) -> Result<Vec<VariableRow>, CoreError> {
        self.storage.get_device_variables(device_id)
    }

    fn save_device_variable(&self, row: &VariableRow) -> Result<u64, CoreError> {
        self.storage.save_device_variable(row)
    }

    fn get_peers(&self, device_id: u64) -> Result<Vec<PeerRow>, CoreError> {
        self.storage.get_peers(device_id)
    }

    fn save_peer(&self, row: &PeerRow) -> Result<u64, CoreError> {
        self.storage.save_peer(row)
    }

    fn delete_peer(&self, id: u64) -> Result<(), CoreError> {
        self.storage.delete_peer(id)
    }

    fn delete_peers(&self, device_id: u64) -> Result<(), CoreError> {
        self.storage.delete_peers(device_id)
    }

    fn set_peer_id(&self, old_id: u64, new_id: u64) -> Result<bool, CoreError> {
        self.storage.set_peer_id(old_id, new_id)
    }

    fn get_peer_parameters(&self, peer_id: u64) -> Result<Vec<ParameterRow>, CoreError> {
        self.storage.get_peer_parameters(peer_id)
    }

    fn save_peer_parameter(&self, row: &ParameterRow) -> Result<u64, CoreError> {
        self.storage.save_peer_parameter(row)
    }

    fn delete_peer_parameter(&self, peer_id: u64, row_id: u64) -> Result<(), CoreError> {
        self.storage.delete_peer_parameter(peer_id, row_id)
    }

    fn get_peer_variables(&self, peer_id: u64) -> Result<Vec<VariableRow>, CoreError> {
        self.storage.get_peer_variables(peer_id)
    }

    fn save_peer_variable(&self, row: &VariableRow) -> Result<u64, CoreError> {
        self.storage.save_peer_variable(row)
    }

    fn get_service_messages(&self, peer_id: u64) -> Result<Vec<ServiceMessageRow>, CoreError> {
        self.storage.get_service_messages(peer_id)
    }

    fn save_service_message(&self, row: &ServiceMessageRow) -> Result<u64, CoreError> {
        self.storage.save_service_message(row)
    }

    fn delete_service_message(&self, row_id: u64) -> Result<(), CoreError> {
        self.storage.delete_service_message(row_id)
    }

    // ── RPC broadcast ────────────────────────────────────────────────

    fn rpc_event(&self, event: RpcEvent) {
        debug!(peer_id = event.peer_id, channel = event.channel, keys = ?event.keys, "rpc event");
        self.listeners.for_each(|_, listener| listener.on_event(&event));
    }

    fn rpc_new_devices(&self, descriptions: Vec<Variable>) {
        self.listeners
            .for_each(|_, listener| listener.on_new_devices(&descriptions));
    }

    fn rpc_delete_devices(&self, addresses: Vec<String>, info: Vec<Variable>) {
        self.listeners
            .for_each(|_, listener| listener.on_delete_devices(&addresses, &info));
    }

    fn rpc_update_device(&self, peer_id: u64, channel: u32, address: String, hint: i32) {
        self.listeners.for_each(|_, listener| {
            listener.on_update_device(peer_id, channel, &address, hint);
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::storage::MemoryStore;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<RpcEvent>>);

    impl RpcListener for Recorder {
        fn on_event(&self, event: &RpcEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[test]
    fn broadcasts_reach_every_listener_until_unsubscribed() {
        let context = HubContext::new(Arc::new(MemoryStore::new()), CoreConfig::default());
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let handle_a = context.subscribe("a", a.clone());
        context.subscribe("b", b.clone());

        context.rpc_event(RpcEvent::new(1, 0, "X").with("UNREACH", true));
        context.unsubscribe(&handle_a);
        context.rpc_event(RpcEvent::new(1, 0, "X").with("UNREACH", false));

        assert_eq!(a.0.lock().len(), 1);
        assert_eq!(b.0.lock().len(), 2);
    }

    #[test]
    fn starts_booting_and_exposes_settings() {
        let context = HubContext::new(Arc::new(MemoryStore::new()), CoreConfig::default());
        assert_eq!(EventSink::phase(&*context), LifecyclePhase::Booting);
        context.set_phase(LifecyclePhase::Running);
        assert_eq!(EventSink::phase(&*context), LifecyclePhase::Running);
        assert_eq!(context.settings().unreach_resend_limit, 3);
    }
}
