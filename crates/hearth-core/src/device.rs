// ── Logical device ──
//
// The central of one family: owns the peers it has paired, indexed by id,
// address and serial under a single lock so the three views never diverge.
// Sits between its peers and the family in the event-sink chain and
// re-indexes peers when their ids change on the way up.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Write as _};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::error::CoreError;
use crate::lifecycle::DisposeState;
use crate::packet::Packet;
use crate::peer::{Peer, PeerDirectory, PeerHooks, PeerInit, PeerLookup, PeerOwner};
use crate::pipeline::PacketHandler;
use crate::sink::EventSink;
use crate::storage::{DeviceRow, PeerRow, StoredValue, VariableRow};

/// Identity of a device at construction.
#[derive(Debug, Clone)]
pub struct DeviceInit {
    /// 0 for a device that has never been saved.
    pub id: u64,
    pub family_id: u32,
    pub address: i32,
    pub serial: String,
    pub device_type: u32,
}

impl From<&DeviceRow> for DeviceInit {
    fn from(row: &DeviceRow) -> Self {
        Self {
            id: row.id,
            family_id: row.family,
            address: row.address,
            serial: row.serial.clone(),
            device_type: row.device_type,
        }
    }
}

/// Family-specific behaviour of a device.
#[allow(unused_variables)]
pub trait DeviceHooks: Send + Sync {
    /// Build a peer for a stored row. `None` skips the row.
    fn create_peer(&self, device: &LogicalDevice, row: &PeerRow) -> Option<Arc<Peer>>;

    /// Decode one packet. `Ok(true)` when the packet was for this device.
    fn on_packet_received(
        &self,
        device: &LogicalDevice,
        interface_id: &str,
        packet: &Packet,
    ) -> Result<bool, CoreError> {
        Ok(false)
    }

    /// Family-specific CLI commands, tried before reporting an unknown command.
    fn handle_cli_command(&self, device: &LogicalDevice, command: &str) -> Option<String> {
        None
    }

    fn hub_started(&self, device: &LogicalDevice) {}

    fn hub_shutting_down(&self, device: &LogicalDevice) {}
}

#[derive(Default)]
struct PeerIndex {
    by_id: HashMap<u64, Arc<Peer>>,
    by_address: HashMap<i32, Arc<Peer>>,
    by_serial: HashMap<String, Arc<Peer>>,
}

impl PeerIndex {
    fn insert(&mut self, peer: Arc<Peer>) {
        let id = peer.id();
        if id != 0 {
            self.by_id.insert(id, Arc::clone(&peer));
        }
        self.by_serial
            .insert(peer.serial().to_owned(), Arc::clone(&peer));
        self.by_address.insert(peer.address(), peer);
    }

    fn remove(&mut self, peer: &Peer) -> Option<Arc<Peer>> {
        self.by_id.retain(|_, indexed| indexed.serial() != peer.serial());
        self.by_serial.remove(peer.serial());
        self.by_address.remove(&peer.address())
    }

    fn get(&self, lookup: PeerLookup<'_>) -> Option<Arc<Peer>> {
        match lookup {
            PeerLookup::Id(id) => self.by_id.get(&id),
            PeerLookup::Address(address) => self.by_address.get(&address),
            PeerLookup::Serial(serial) => self.by_serial.get(serial),
        }
        .cloned()
    }

    /// Every peer ordered by address.
    fn all(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<_> = self.by_address.values().cloned().collect();
        peers.sort_by_key(|peer| peer.address());
        peers
    }

    fn clear(&mut self) -> Vec<Arc<Peer>> {
        self.by_id.clear();
        self.by_serial.clear();
        self.by_address.drain().map(|(_, peer)| peer).collect()
    }
}

#[derive(Debug, Clone)]
struct DeviceVariable {
    row_id: Option<u64>,
    value: StoredValue,
}

pub struct LogicalDevice {
    me: Weak<LogicalDevice>,
    id: AtomicU64,
    family_id: u32,
    address: i32,
    serial: String,
    device_type: u32,
    parent: Weak<dyn EventSink>,
    hooks: Arc<dyn DeviceHooks>,
    peers: Mutex<PeerIndex>,
    variables: Mutex<BTreeMap<u32, DeviceVariable>>,
    selected_peer: Mutex<Option<Arc<Peer>>>,
    dispose_state: DisposeState,
}

impl LogicalDevice {
    pub fn new(
        init: DeviceInit,
        parent: Weak<dyn EventSink>,
        hooks: Arc<dyn DeviceHooks>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id: AtomicU64::new(init.id),
            family_id: init.family_id,
            address: init.address,
            serial: init.serial,
            device_type: init.device_type,
            parent,
            hooks,
            peers: Mutex::new(PeerIndex::default()),
            variables: Mutex::new(BTreeMap::new()),
            selected_peer: Mutex::new(None),
            dispose_state: DisposeState::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    pub fn family_id(&self) -> u32 {
        self.family_id
    }

    pub fn address(&self) -> i32 {
        self.address
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn device_type(&self) -> u32 {
        self.device_type
    }

    pub fn is_disposing(&self) -> bool {
        !self.dispose_state.is_active()
    }

    /// Owner handle for peers created by this device.
    pub fn peer_owner(&self) -> PeerOwner {
        let sink: Weak<dyn EventSink> = self.me.clone();
        let directory: Weak<dyn PeerDirectory> = self.me.clone();
        PeerOwner { sink, directory }
    }

    // ── Peers ────────────────────────────────────────────────────────

    /// Create a peer owned by this device and index it.
    pub fn create_peer(&self, init: PeerInit, hooks: Option<Arc<dyn PeerHooks>>) -> Arc<Peer> {
        let mut init = init;
        init.parent_id = self.id();
        let peer = Peer::new(init, self.peer_owner(), hooks);
        self.add_peer(Arc::clone(&peer));
        peer
    }

    /// Index `peer`, replacing any peer with the same address.
    pub fn add_peer(&self, peer: Arc<Peer>) {
        let mut peers = self.peers.lock();
        if let Some(previous) = peers.get(PeerLookup::Address(peer.address())) {
            peers.remove(&previous);
        }
        peers.insert(peer);
    }

    /// Drop `lookup` from every index and return it.
    pub fn remove_peer(&self, lookup: PeerLookup<'_>) -> Option<Arc<Peer>> {
        let mut peers = self.peers.lock();
        let peer = peers.get(lookup)?;
        peers.remove(&peer)
    }

    pub fn peer(&self, lookup: PeerLookup<'_>) -> Option<Arc<Peer>> {
        self.peers.lock().get(lookup)
    }

    pub fn peer_exists(&self, lookup: PeerLookup<'_>) -> bool {
        self.peer(lookup).is_some()
    }

    /// Peers ordered by address, leaving out the serials in `known`.
    pub fn get_peers(&self, known: &BTreeSet<String>) -> Vec<Arc<Peer>> {
        let mut peers = self.peers.lock().all();
        peers.retain(|peer| !known.contains(peer.serial()));
        peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().by_address.len()
    }

    // ── Device variables ─────────────────────────────────────────────

    pub fn variable(&self, index: u32) -> Option<StoredValue> {
        self.variables
            .lock()
            .get(&index)
            .map(|variable| variable.value.clone())
    }

    /// Set a device variable. Written immediately once the device row
    /// exists, otherwise on the first `save(true)`.
    pub fn set_variable(&self, index: u32, value: StoredValue) {
        self.variables
            .lock()
            .entry(index)
            .and_modify(|variable| variable.value = value.clone())
            .or_insert(DeviceVariable {
                row_id: None,
                value,
            });
        if self.id() == 0 {
            return;
        }
        if let Err(e) = self.write_variable(index) {
            error!(device_id = self.id(), index, error = %e, "cannot save device variable");
        }
    }

    pub fn load_variables(&self) -> Result<(), CoreError> {
        let id = self.id();
        if id == 0 {
            return Ok(());
        }
        let rows = EventSink::get_device_variables(self, id)?;
        let mut variables = self.variables.lock();
        for row in rows {
            variables.insert(
                row.index,
                DeviceVariable {
                    row_id: row.row_id,
                    value: row.value,
                },
            );
        }
        Ok(())
    }

    pub fn save_variables(&self) -> Result<(), CoreError> {
        if self.id() == 0 {
            return Ok(());
        }
        let indices: Vec<u32> = self.variables.lock().keys().copied().collect();
        for index in indices {
            self.write_variable(index)?;
        }
        Ok(())
    }

    fn write_variable(&self, index: u32) -> Result<(), CoreError> {
        let Some(variable) = self.variables.lock().get(&index).cloned() else {
            return Ok(());
        };
        let row = VariableRow {
            row_id: variable.row_id,
            owner_id: self.id(),
            index,
            value: variable.value,
        };
        let row_id = EventSink::save_device_variable(self, &row)?;
        if let Some(variable) = self.variables.lock().get_mut(&index) {
            variable.row_id = Some(row_id);
        }
        Ok(())
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Restore variables and peers.
    pub fn load(&self) -> Result<usize, CoreError> {
        self.load_variables()?;
        self.load_peers()
    }

    /// Create and load a peer for every stored row. Rows the family cannot
    /// build and peers that fail to load are skipped.
    pub fn load_peers(&self) -> Result<usize, CoreError> {
        let id = self.id();
        if id == 0 {
            return Ok(0);
        }
        let rows = EventSink::get_peers(self, id)?;
        let mut loaded = 0;
        for row in &rows {
            let Some(peer) = self.hooks.create_peer(self, row) else {
                warn!(device_id = id, peer_id = row.id, serial = %row.serial, "no peer type for stored row");
                continue;
            };
            if let Err(e) = peer.load() {
                error!(device_id = id, peer_id = row.id, error = %e, "cannot load peer");
                continue;
            }
            self.add_peer(peer);
            loaded += 1;
        }
        debug!(device_id = id, loaded, stored = rows.len(), "peers loaded");
        Ok(loaded)
    }

    /// Persist the device row (when `save_device`) and its variables.
    pub fn save(&self, save_device: bool) -> Result<(), CoreError> {
        if save_device {
            let old_id = self.id();
            let row = DeviceRow {
                id: old_id,
                family: self.family_id,
                address: self.address,
                serial: self.serial.clone(),
                device_type: self.device_type,
            };
            let new_id = EventSink::save_device(self, &row)?;
            if old_id == 0 && new_id != 0 {
                self.id.store(new_id, Ordering::Release);
                let peers = self.peers.lock().all();
                for peer in peers {
                    peer.set_parent_id(new_id);
                }
                debug!(device_id = new_id, serial = %self.serial, "device saved for the first time");
            }
        }
        self.save_variables()
    }

    /// Save every peer; `full` also writes variables and parameters.
    /// Failures are logged and the remaining peers are still saved.
    pub fn save_peers(&self, full: bool) -> usize {
        let peers = self.peers.lock().all();
        let mut saved = 0;
        for peer in peers {
            match peer.save(true, full, full) {
                Ok(()) => saved += 1,
                Err(e) => error!(device_id = self.id(), peer_id = peer.id(), error = %e, "cannot save peer"),
            }
        }
        saved
    }

    /// Delete every peer row of this device.
    pub fn delete_peers_from_database(&self) -> Result<(), CoreError> {
        let peers = self.peers.lock().all();
        self.delete_peer_rows(&peers)
    }

    /// Delete `peers` one by one, then every remaining peer row of this
    /// device. Used with a snapshot taken before the index was cleared.
    pub(crate) fn delete_peer_rows(&self, peers: &[Arc<Peer>]) -> Result<(), CoreError> {
        for peer in peers {
            if let Err(e) = peer.delete_from_database() {
                warn!(device_id = self.id(), peer_id = peer.id(), error = %e, "cannot delete peer");
            }
        }
        let id = self.id();
        if id == 0 {
            return Ok(());
        }
        EventSink::delete_peers(self, id)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn hub_started(&self) {
        let peers = self.peers.lock().all();
        for peer in peers {
            peer.hub_started();
        }
        self.hooks.hub_started(self);
    }

    pub fn hub_shutting_down(&self) {
        self.hooks.hub_shutting_down(self);
        let peers = self.peers.lock().all();
        for peer in peers {
            peer.hub_shutting_down();
        }
    }

    /// Dispose every peer. Idempotent; a peer whose disposal panics is
    /// reported in the returned error and the rest are still disposed.
    pub fn dispose(&self) -> Result<(), CoreError> {
        if !self.dispose_state.begin() {
            return Ok(());
        }
        self.selected_peer.lock().take();
        let peers = self.peers.lock().clear();
        let mut errors = Vec::new();
        for peer in peers {
            if panic::catch_unwind(AssertUnwindSafe(|| peer.dispose())).is_err() {
                errors.push(CoreError::TaskPanicked {
                    task: format!("dispose peer {}", peer.id()),
                });
            }
        }
        self.dispose_state.finish();
        info!(device_id = self.id(), failed = errors.len(), "device disposed");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Disposal { errors })
        }
    }

    // ── CLI ──────────────────────────────────────────────────────────

    pub fn handle_cli_command(&self, command: &str) -> String {
        let command = command.trim();
        let selected = self.selected_peer.lock().clone();
        if let Some(peer) = selected {
            if command == "unselect" {
                self.selected_peer.lock().take();
                return "Peer unselected.\n".into();
            }
            return peer.handle_cli_command(command);
        }

        let words: Vec<&str> = command.split_whitespace().collect();
        let mut out = String::new();
        match words.as_slice() {
            ["help"] | [] => {
                out.push_str("List of commands:\n\n");
                out.push_str("peers list\t\tList all peers\n");
                out.push_str("peers select <id>\tSelect a peer by id\n");
                out.push_str("unselect\t\tUnselect this device\n");
            }
            ["peers", "list"] => {
                let peers = self.get_peers(&BTreeSet::new());
                if peers.is_empty() {
                    return "No peers are paired to this device.\n".into();
                }
                let _ = writeln!(out, "{:>8}  {:<8}  {:<12}  Type", "ID", "Address", "Serial");
                for peer in peers {
                    let _ = writeln!(
                        out,
                        "{:>8}  {:06X}    {:<12}  {}",
                        peer.id(),
                        peer.address(),
                        peer.serial(),
                        peer.description().type_string
                    );
                }
            }
            ["peers", "select", id] => {
                let peer = id
                    .parse::<u64>()
                    .ok()
                    .and_then(|id| self.peer(PeerLookup::Id(id)));
                match peer {
                    Some(peer) => {
                        let _ = writeln!(out, "Peer with id {} selected.", peer.id());
                        *self.selected_peer.lock() = Some(peer);
                    }
                    None => out.push_str("This peer does not exist.\n"),
                }
            }
            _ => match self.hooks.handle_cli_command(self, command) {
                Some(response) => out = response,
                None => {
                    let _ = writeln!(out, "Unknown command: {command}");
                }
            },
        }
        out
    }

    /// Whether a peer is selected in the CLI.
    pub fn has_selection(&self) -> bool {
        self.selected_peer.lock().is_some()
    }
}

impl fmt::Debug for LogicalDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalDevice")
            .field("id", &self.id())
            .field("family_id", &self.family_id)
            .field("serial", &self.serial)
            .field("peers", &self.peer_count())
            .finish_non_exhaustive()
    }
}

impl PeerDirectory for LogicalDevice {
    fn peer_by_id(&self, id: u64) -> Option<Arc<Peer>> {
        self.peer(PeerLookup::Id(id))
    }

    fn peer_by_address(&self, address: i32) -> Option<Arc<Peer>> {
        self.peer(PeerLookup::Address(address))
    }

    fn peer_by_serial(&self, serial: &str) -> Option<Arc<Peer>> {
        self.peer(PeerLookup::Serial(serial))
    }
}

impl PacketHandler for LogicalDevice {
    fn on_packet_received(&self, interface_id: &str, packet: &Packet) -> Result<bool, CoreError> {
        if self.is_disposing() {
            return Ok(false);
        }
        trace!(device_id = self.id(), interface = interface_id, len = packet.len(), "packet received");
        self.hooks.on_packet_received(self, interface_id, packet)
    }
}

// ── Event sink chain ────────────────────────────────────────────────

impl EventSink for LogicalDevice {
    fn sink_name(&self) -> String {
        format!("device {} ({})", self.id(), self.serial)
    }

    fn upstream(&self) -> Option<Arc<dyn EventSink>> {
        self.parent.upgrade()
    }

    /// Index a peer under the id it acquired on its first save.
    fn save_peer(&self, row: &PeerRow) -> Result<u64, CoreError> {
        let new_id = self.parent()?.save_peer(row)?;
        if row.id == 0 && new_id != 0 {
            let mut peers = self.peers.lock();
            if let Some(peer) = peers.get(PeerLookup::Address(row.address)) {
                peers.by_id.insert(new_id, peer);
            }
        }
        Ok(new_id)
    }

    fn set_peer_id(&self, old_id: u64, new_id: u64) -> Result<bool, CoreError> {
        if self.peer_exists(PeerLookup::Id(new_id)) {
            return Ok(false);
        }
        if !self.parent()?.set_peer_id(old_id, new_id)? {
            return Ok(false);
        }
        let mut peers = self.peers.lock();
        if let Some(peer) = peers.by_id.remove(&old_id) {
            peers.by_id.insert(new_id, peer);
        }
        Ok(true)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::CoreConfig;
    use crate::context::HubContext;
    use crate::description::DeviceDescription;
    use crate::storage::MemoryStore;

    struct Plain;

    impl DeviceHooks for Plain {
        fn create_peer(&self, device: &LogicalDevice, row: &PeerRow) -> Option<Arc<Peer>> {
            Some(Peer::new(
                PeerInit {
                    id: row.id,
                    parent_id: row.parent_id,
                    address: row.address,
                    serial: row.serial.clone(),
                    device_type: 1,
                    description: Arc::new(DeviceDescription::new(1, "TEST")),
                },
                device.peer_owner(),
                None,
            ))
        }
    }

    fn device(context: &Arc<HubContext>) -> Arc<LogicalDevice> {
        let parent: Arc<dyn EventSink> = context.as_sink();
        LogicalDevice::new(
            DeviceInit {
                id: 0,
                family_id: 1,
                address: 0x1,
                serial: "CENTRAL001".into(),
                device_type: 0xFFFD,
            },
            Arc::downgrade(&parent),
            Arc::new(Plain),
        )
    }

    fn peer_init(address: i32, serial: &str) -> PeerInit {
        PeerInit {
            id: 0,
            parent_id: 0,
            address,
            serial: serial.into(),
            device_type: 1,
            description: Arc::new(DeviceDescription::new(1, "TEST")),
        }
    }

    #[test]
    fn first_peer_save_indexes_new_id() {
        let context = HubContext::new(Arc::new(MemoryStore::new()), CoreConfig::default());
        let device = device(&context);
        device.save(true).unwrap();
        let peer = device.create_peer(peer_init(0x10, "PEER000001"), None);
        assert!(!device.peer_exists(PeerLookup::Id(peer.id())));

        peer.save(true, false, false).unwrap();
        let id = peer.id();
        assert_ne!(id, 0);
        let found = device.peer(PeerLookup::Id(id)).unwrap();
        assert!(Arc::ptr_eq(&found, &peer));
        assert_eq!(peer.parent_id(), device.id());
    }

    #[test]
    fn set_id_rekeys_index_and_rejects_taken_ids() {
        let context = HubContext::new(Arc::new(MemoryStore::new()), CoreConfig::default());
        let device = device(&context);
        device.save(true).unwrap();
        let a = device.create_peer(peer_init(0x10, "PEER000001"), None);
        let b = device.create_peer(peer_init(0x11, "PEER000002"), None);
        a.save(true, false, false).unwrap();
        b.save(true, false, false).unwrap();

        let old = a.id();
        a.set_id(500).unwrap();
        assert!(device.peer(PeerLookup::Id(old)).is_none());
        assert!(device.peer_exists(PeerLookup::Id(500)));

        let err = b.set_id(500).unwrap_err();
        assert_eq!(err.code(), -101);
    }

    #[test]
    fn variables_wait_for_device_row() {
        let store = Arc::new(MemoryStore::new());
        let context = HubContext::new(store.clone(), CoreConfig::default());
        let device = device(&context);
        device.set_variable(1, StoredValue::Int(7));
        assert_eq!(store.summary().device_variables, 0);

        device.save(true).unwrap();
        assert_eq!(store.summary().device_variables, 1);
        assert_eq!(device.variable(1), Some(StoredValue::Int(7)));
    }

    #[test]
    fn get_peers_skips_known_serials() {
        let context = HubContext::new(Arc::new(MemoryStore::new()), CoreConfig::default());
        let device = device(&context);
        device.create_peer(peer_init(0x20, "PEER000002"), None);
        device.create_peer(peer_init(0x10, "PEER000001"), None);
        let known = BTreeSet::from(["PEER000001".to_owned()]);
        let serials: Vec<_> = device
            .get_peers(&known)
            .iter()
            .map(|peer| peer.serial().to_owned())
            .collect();
        assert_eq!(serials, vec!["PEER000002".to_owned()]);
    }

    #[test]
    fn dispose_is_idempotent_and_empties_index() {
        let context = HubContext::new(Arc::new(MemoryStore::new()), CoreConfig::default());
        let device = device(&context);
        let peer = device.create_peer(peer_init(0x10, "PEER000001"), None);
        device.dispose().unwrap();
        device.dispose().unwrap();
        assert!(peer.is_disposing());
        assert_eq!(device.peer_count(), 0);
    }

    #[test]
    fn cli_selects_and_unselects_peers() {
        let context = HubContext::new(Arc::new(MemoryStore::new()), CoreConfig::default());
        let device = device(&context);
        device.save(true).unwrap();
        let peer = device.create_peer(peer_init(0x10, "PEER000001"), None);
        peer.save(true, false, false).unwrap();

        let listing = device.handle_cli_command("peers list");
        assert!(listing.contains("PEER000001"));
        let selected = device.handle_cli_command(&format!("peers select {}", peer.id()));
        assert!(selected.contains("selected"));
        assert!(device.has_selection());
        assert!(device.handle_cli_command("servicemessages").contains("No service messages"));
        device.handle_cli_command("unselect");
        assert!(!device.has_selection());
    }
}
