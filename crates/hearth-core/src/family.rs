// ── Device family ──
//
// Owns the logical devices of one family and the packet pipelines of its
// physical interfaces. The device list has its own lock, held only while
// the list itself changes; an ArcSwap snapshot of the list serves readers
// that must not wait (the save path after a lock timeout). Removal runs on
// a background thread, one at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write as _};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::device::LogicalDevice;
use crate::error::CoreError;
use crate::lifecycle::DisposeState;
use crate::pipeline::{PacketHandler, PacketPipeline};
use crate::registry::SinkId;
use crate::sink::EventSink;
use crate::storage::DeviceRow;
use crate::variable::Variable;

/// Behaviour supplied by a concrete family implementation.
#[allow(unused_variables)]
pub trait FamilyHooks: Send + Sync {
    /// Build a device for a stored row. `None` skips the row.
    fn create_device(&self, family: &DeviceFamily, row: &DeviceRow) -> Option<Arc<LogicalDevice>>;

    fn hub_started(&self, family: &DeviceFamily) {}

    fn hub_shutting_down(&self, family: &DeviceFamily) {}
}

type Removal = JoinHandle<Result<bool, CoreError>>;

pub struct DeviceFamily {
    me: Weak<DeviceFamily>,
    id: u32,
    name: String,
    parent: Arc<dyn EventSink>,
    hooks: Arc<dyn FamilyHooks>,
    devices: Mutex<Vec<Arc<LogicalDevice>>>,
    snapshot: ArcSwap<Vec<Arc<LogicalDevice>>>,
    interfaces: Mutex<BTreeMap<String, Arc<PacketPipeline>>>,
    removal: Mutex<Option<Removal>>,
    selected: Mutex<Option<Arc<LogicalDevice>>>,
    dispose_state: DisposeState,
}

impl DeviceFamily {
    pub fn new(
        id: u32,
        name: impl Into<String>,
        parent: Arc<dyn EventSink>,
        hooks: Arc<dyn FamilyHooks>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id,
            name: name.into(),
            parent,
            hooks,
            devices: Mutex::new(Vec::new()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            interfaces: Mutex::new(BTreeMap::new()),
            removal: Mutex::new(None),
            selected: Mutex::new(None),
            dispose_state: DisposeState::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent handle for devices of this family.
    pub fn device_sink(&self) -> Weak<dyn EventSink> {
        self.me.clone()
    }

    pub fn is_disposing(&self) -> bool {
        !self.dispose_state.is_active()
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// Snapshot of the device list.
    pub fn get_devices(&self) -> Vec<Arc<LogicalDevice>> {
        self.devices.lock().clone()
    }

    pub fn get_by_id(&self, id: u64) -> Option<Arc<LogicalDevice>> {
        self.find(|device| device.id() == id)
    }

    pub fn get_by_address(&self, address: i32) -> Option<Arc<LogicalDevice>> {
        self.find(|device| device.address() == address)
    }

    pub fn get_by_serial(&self, serial: &str) -> Option<Arc<LogicalDevice>> {
        self.find(|device| device.serial() == serial)
    }

    fn find(&self, predicate: impl Fn(&LogicalDevice) -> bool) -> Option<Arc<LogicalDevice>> {
        self.devices
            .lock()
            .iter()
            .find(|device| predicate(device))
            .cloned()
    }

    /// Save `device` and add it to the family.
    pub fn add(&self, device: Arc<LogicalDevice>) -> Result<(), CoreError> {
        if self.is_disposing() {
            return Err(CoreError::disposing(format!("family {}", self.name)));
        }
        device.save(true)?;
        self.attach(&device);
        let mut devices = self.devices.lock();
        devices.push(device);
        self.snapshot.store(Arc::new(devices.clone()));
        Ok(())
    }

    /// Create every stored device through the family hooks and load it.
    pub fn load(&self) -> Result<usize, CoreError> {
        let rows = EventSink::get_devices(self, self.id)?;
        let mut loaded = Vec::new();
        for row in &rows {
            let Some(device) = self.hooks.create_device(self, row) else {
                warn!(family = %self.name, device_id = row.id, "no device type for stored row");
                continue;
            };
            if let Err(e) = device.load() {
                error!(family = %self.name, device_id = row.id, error = %e, "cannot load device");
                continue;
            }
            self.attach(&device);
            loaded.push(device);
        }
        let count = loaded.len();
        let mut devices = self.devices.lock();
        devices.extend(loaded);
        self.snapshot.store(Arc::new(devices.clone()));
        drop(devices);
        info!(family = %self.name, loaded = count, stored = rows.len(), "devices loaded");
        Ok(count)
    }

    /// Save every device and its peers.
    ///
    /// Waits at most `save_lock_timeout` for the device list; after that
    /// the last published snapshot is saved instead.
    pub fn save(&self, full: bool) -> usize {
        let timeout = self.settings().save_lock_timeout;
        let devices = match self.devices.try_lock_for(timeout) {
            Some(devices) => devices.clone(),
            None => {
                warn!(family = %self.name, ?timeout, "device list busy, saving last snapshot");
                self.snapshot.load_full().as_ref().clone()
            }
        };
        let mut saved = 0;
        for device in devices {
            if let Err(e) = device.save(true) {
                error!(family = %self.name, device_id = device.id(), error = %e, "cannot save device");
                continue;
            }
            saved += device.save_peers(full);
        }
        saved
    }

    /// Remove the device `id` on a background thread.
    ///
    /// A removal still running is joined first. The thread takes the device
    /// out of the list, disposes it, deletes its peers and finally deletes
    /// its row. [`Self::wait_for_removal`] returns the outcome.
    pub fn remove(&self, id: u64) -> Result<(), CoreError> {
        let mut removal = self.removal.lock();
        if let Some(previous) = removal.take() {
            log_removal(&self.name, previous.join());
        }
        let family = self
            .me
            .upgrade()
            .ok_or_else(|| CoreError::disposing(format!("family {}", self.name)))?;
        let handle = thread::Builder::new()
            .name(format!("remove-device-{id}"))
            .spawn(move || family.remove_now(id))
            .map_err(|e| CoreError::Internal(format!("cannot spawn device removal: {e}")))?;
        *removal = Some(handle);
        Ok(())
    }

    /// Join the pending removal. `Ok(false)` when the device was not found
    /// or nothing was pending.
    pub fn wait_for_removal(&self) -> Result<bool, CoreError> {
        let Some(handle) = self.removal.lock().take() else {
            return Ok(false);
        };
        handle.join().unwrap_or_else(|_| {
            Err(CoreError::TaskPanicked {
                task: "device removal".into(),
            })
        })
    }

    fn remove_now(&self, id: u64) -> Result<bool, CoreError> {
        let device = {
            let mut devices = self.devices.lock();
            let Some(position) = devices.iter().position(|device| device.id() == id) else {
                return Ok(false);
            };
            let device = devices.remove(position);
            self.snapshot.store(Arc::new(devices.clone()));
            device
        };
        {
            let mut selected = self.selected.lock();
            if selected.as_ref().is_some_and(|s| Arc::ptr_eq(s, &device)) {
                *selected = None;
            }
        }
        self.detach(&device);

        let peers = device.get_peers(&BTreeSet::new());
        if let Err(e) = device.dispose() {
            warn!(family = %self.name, device_id = id, error = %e, "device disposed with errors");
        }
        device.delete_peer_rows(&peers)?;
        EventSink::delete_device(self, id)?;
        info!(family = %self.name, device_id = id, peers = peers.len(), "device removed");

        if !peers.is_empty() {
            let addresses = peers.iter().map(|peer| peer.serial().to_owned()).collect();
            let info = peers
                .iter()
                .map(|peer| Variable::from_pairs([("ID", Variable::from(peer.id()))]))
                .collect();
            self.rpc_delete_devices(addresses, info);
        }
        Ok(true)
    }

    // ── Physical interfaces ──────────────────────────────────────────

    /// Register the pipeline of one physical interface and subscribe every
    /// current device to it.
    pub fn add_interface(&self, pipeline: Arc<PacketPipeline>) {
        for device in self.snapshot.load().iter() {
            pipeline.subscribe(device_sink_id(device), Arc::clone(device) as Arc<dyn PacketHandler>);
        }
        self.interfaces
            .lock()
            .insert(pipeline.interface_id().to_owned(), pipeline);
    }

    pub fn interface(&self, interface_id: &str) -> Option<Arc<PacketPipeline>> {
        self.interfaces.lock().get(interface_id).cloned()
    }

    pub fn interfaces(&self) -> Vec<Arc<PacketPipeline>> {
        self.interfaces.lock().values().cloned().collect()
    }

    /// Start every interface pipeline. Stops at the first failure.
    pub fn start_listening(&self) -> Result<(), CoreError> {
        for pipeline in self.interfaces() {
            pipeline.start()?;
        }
        Ok(())
    }

    pub fn stop_listening(&self) {
        for pipeline in self.interfaces() {
            pipeline.stop();
        }
    }

    fn attach(&self, device: &Arc<LogicalDevice>) {
        for pipeline in self.interfaces() {
            pipeline.subscribe(device_sink_id(device), Arc::clone(device) as Arc<dyn PacketHandler>);
        }
    }

    fn detach(&self, device: &LogicalDevice) {
        let id = device_sink_id(device);
        for pipeline in self.interfaces() {
            pipeline.unsubscribe_id(&id);
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn hub_started(&self) {
        for device in self.get_devices() {
            device.hub_started();
        }
        self.hooks.hub_started(self);
    }

    pub fn hub_shutting_down(&self) {
        self.hooks.hub_shutting_down(self);
        for device in self.get_devices() {
            device.hub_shutting_down();
        }
    }

    /// Stop listening and dispose every device. Idempotent.
    ///
    /// Every device is disposed even when some fail; the failures are
    /// returned together.
    pub fn dispose(&self) -> Result<(), CoreError> {
        if !self.dispose_state.begin() {
            return Ok(());
        }
        let mut errors = Vec::new();
        if let Err(e) = self.wait_for_removal() {
            errors.push(e);
        }
        self.stop_listening();
        self.selected.lock().take();
        let devices = {
            let mut devices = self.devices.lock();
            self.snapshot.store(Arc::new(Vec::new()));
            std::mem::take(&mut *devices)
        };
        for device in devices {
            self.detach(&device);
            match panic::catch_unwind(AssertUnwindSafe(|| device.dispose())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(family = %self.name, device_id = device.id(), error = %e, "device disposal failed");
                    errors.push(e);
                }
                Err(_) => errors.push(CoreError::TaskPanicked {
                    task: format!("dispose device {}", device.id()),
                }),
            }
        }
        self.interfaces.lock().clear();
        self.dispose_state.finish();
        debug!(family = %self.name, failed = errors.len(), "family disposed");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Disposal { errors })
        }
    }

    // ── CLI ──────────────────────────────────────────────────────────

    pub fn handle_cli_command(&self, command: &str) -> String {
        let command = command.trim();
        let selected = self.selected.lock().clone();
        if let Some(device) = selected {
            if command == "unselect" && !device.has_selection() {
                self.selected.lock().take();
                return "Device unselected.\n".into();
            }
            return device.handle_cli_command(command);
        }

        let words: Vec<&str> = command.split_whitespace().collect();
        let mut out = String::new();
        match words.as_slice() {
            ["help"] | [] => {
                out.push_str("List of commands:\n\n");
                out.push_str("devices list\t\tList all devices\n");
                out.push_str("devices select <id>\tSelect a device by id\n");
                out.push_str("unselect\t\tUnselect the current device\n");
            }
            ["devices", "list"] => {
                let devices = self.get_devices();
                if devices.is_empty() {
                    return "No devices.\n".into();
                }
                let _ = writeln!(out, "{:>8}  {:<8}  {:<12}  Peers", "ID", "Address", "Serial");
                for device in devices {
                    let _ = writeln!(
                        out,
                        "{:>8}  {:06X}    {:<12}  {}",
                        device.id(),
                        device.address(),
                        device.serial(),
                        device.peer_count()
                    );
                }
            }
            ["devices", "select", id] => {
                match id.parse::<u64>().ok().and_then(|id| self.get_by_id(id)) {
                    Some(device) => {
                        let _ = writeln!(out, "Device with id {} selected.", device.id());
                        *self.selected.lock() = Some(device);
                    }
                    None => out.push_str("This device does not exist.\n"),
                }
            }
            ["unselect"] => out.push_str("No device selected.\n"),
            _ => {
                let _ = writeln!(out, "Unknown command: {command}");
            }
        }
        out
    }
}

impl fmt::Debug for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFamily")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("devices", &self.snapshot.load().len())
            .finish_non_exhaustive()
    }
}

impl EventSink for DeviceFamily {
    fn sink_name(&self) -> String {
        format!("family {}", self.name)
    }

    fn upstream(&self) -> Option<Arc<dyn EventSink>> {
        Some(Arc::clone(&self.parent))
    }
}

fn device_sink_id(device: &LogicalDevice) -> SinkId {
    SinkId::new(format!("device-{}", device.serial()))
}

fn log_removal(family: &str, outcome: thread::Result<Result<bool, CoreError>>) {
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(family, error = %e, "previous device removal failed"),
        Err(_) => warn!(family, "previous device removal panicked"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::CoreConfig;
    use crate::context::HubContext;
    use crate::device::{DeviceHooks, DeviceInit};
    use crate::peer::Peer;
    use crate::storage::{MemoryStore, PeerRow, StoreOp};

    struct NoPeers;

    impl DeviceHooks for NoPeers {
        fn create_peer(&self, _: &LogicalDevice, _: &PeerRow) -> Option<Arc<Peer>> {
            None
        }
    }

    struct Factory;

    impl FamilyHooks for Factory {
        fn create_device(&self, family: &DeviceFamily, row: &DeviceRow) -> Option<Arc<LogicalDevice>> {
            Some(LogicalDevice::new(
                DeviceInit::from(row),
                family.device_sink(),
                Arc::new(NoPeers),
            ))
        }
    }

    fn family(store: &Arc<MemoryStore>, config: CoreConfig) -> Arc<DeviceFamily> {
        let context = HubContext::new(store.clone(), config);
        DeviceFamily::new(1, "test", context.as_sink(), Arc::new(Factory))
    }

    fn new_device(family: &DeviceFamily, serial: &str) -> Arc<LogicalDevice> {
        LogicalDevice::new(
            DeviceInit {
                id: 0,
                family_id: family.id(),
                address: 0x100,
                serial: serial.into(),
                device_type: 0xFFFD,
            },
            family.device_sink(),
            Arc::new(NoPeers),
        )
    }

    #[test]
    fn add_saves_before_listing() {
        let store = Arc::new(MemoryStore::new());
        let family = family(&store, CoreConfig::default());
        family.add(new_device(&family, "CENTRAL001")).unwrap();
        let device = family.get_by_serial("CENTRAL001").unwrap();
        assert_ne!(device.id(), 0);
        assert!(store.device(device.id()).is_some());
        assert!(family.get_by_id(device.id()).is_some());
        assert!(family.get_by_address(0x100).is_some());
    }

    #[test]
    fn load_recreates_stored_devices() {
        let store = Arc::new(MemoryStore::new());
        {
            let family = family(&store, CoreConfig::default());
            family.add(new_device(&family, "CENTRAL001")).unwrap();
        }
        let family = family(&store, CoreConfig::default());
        assert_eq!(family.load().unwrap(), 1);
        assert_eq!(family.get_devices()[0].serial(), "CENTRAL001");
    }

    #[test]
    fn removing_unknown_device_reports_false() {
        let store = Arc::new(MemoryStore::new());
        let family = family(&store, CoreConfig::default());
        family.remove(42).unwrap();
        assert!(!family.wait_for_removal().unwrap());
        assert!(!family.wait_for_removal().unwrap());
    }

    #[test]
    fn save_falls_back_to_snapshot_when_list_is_busy() {
        let store = Arc::new(MemoryStore::new());
        let config = CoreConfig {
            save_lock_timeout: Duration::from_millis(20),
            ..CoreConfig::default()
        };
        let family = family(&store, config);
        family.add(new_device(&family, "CENTRAL001")).unwrap();

        store.clear_journal();
        let guard = family.devices.lock();
        let saved = thread::scope(|scope| scope.spawn(|| family.save(false)).join().unwrap());
        drop(guard);
        assert_eq!(saved, 0);
        assert!(
            store
                .journal()
                .iter()
                .any(|op| matches!(op, StoreOp::DeviceSaved { .. }))
        );
    }

    #[test]
    fn dispose_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let family = family(&store, CoreConfig::default());
        family.add(new_device(&family, "CENTRAL001")).unwrap();
        family.dispose().unwrap();
        family.dispose().unwrap();
        assert!(family.get_devices().is_empty());
        assert!(family.add(new_device(&family, "CENTRAL002")).is_err());
    }

    #[test]
    fn cli_walks_down_to_devices() {
        let store = Arc::new(MemoryStore::new());
        let family = family(&store, CoreConfig::default());
        family.add(new_device(&family, "CENTRAL001")).unwrap();
        let id = family.get_devices()[0].id();

        assert!(family.handle_cli_command("devices list").contains("CENTRAL001"));
        assert!(family
            .handle_cli_command(&format!("devices select {id}"))
            .contains("selected"));
        assert!(family.handle_cli_command("peers list").contains("No peers"));
        assert!(family.handle_cli_command("unselect").contains("unselected"));
        assert!(family.handle_cli_command("frobnicate").contains("Unknown command"));
    }
}
