// ── Peer ──
//
// One paired remote endpoint. A peer owns its paramsets, its service
// messages and its link list. Everything it persists or broadcasts goes
// through its owner's `EventSink`; other peers are only ever reached by id
// or address through the owner's `PeerDirectory`, never stored.

mod links;
mod paramset;
mod views;

pub use links::{BasicPeerRef, LinkFlags, PeerLookup};
pub use paramset::{LinkKey, Paramsets, RpcConfigurationParameter};

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::config::CoreConfig;
use crate::description::{DeviceDescription, ParameterSetType};
use crate::error::CoreError;
use crate::lifecycle::{DisposeState, LifecyclePhase};
use crate::service_messages::{ServiceEventSink, ServiceMessages};
use crate::sink::{EventSink, RpcEvent};
use crate::storage::{
    ParameterRow, PeerRow, SavepointMode, ServiceMessageRow, StoredValue, VariableRow,
};
use crate::variable::Variable;

/// Highest peer id accepted by [`Peer::set_id`], exclusive.
pub const MAX_PEER_ID: u64 = 0x4000_0000;

// ── Variable indices ────────────────────────────────────────────────

const VAR_NAME: u32 = 1000;
const VAR_FIRMWARE_VERSION: u32 = 1001;
const VAR_DEVICE_TYPE: u32 = 1002;
const VAR_FIRMWARE_STRING: u32 = 1003;
const VAR_IP_ADDRESS: u32 = 1004;
const VAR_ID_STRING: u32 = 1005;
const VAR_TYPE_STRING: u32 = 1006;
const VAR_LINKS: u32 = 1007;

/// Lookup of sibling peers, implemented by the owning device.
pub trait PeerDirectory: Send + Sync {
    fn peer_by_id(&self, id: u64) -> Option<Arc<Peer>>;
    fn peer_by_address(&self, address: i32) -> Option<Arc<Peer>>;
    fn peer_by_serial(&self, serial: &str) -> Option<Arc<Peer>>;
}

/// Family-specific reactions to peer state changes.
#[allow(unused_variables)]
pub trait PeerHooks: Send + Sync {
    /// Retry pending outgoing work before the peer is declared unreachable.
    fn enqueue_pending_queues(&self, peer: &Peer) {}

    fn config_pending_changed(&self, peer: &Peer, pending: bool) {}

    /// Called after `set_value` committed a new value.
    fn value_set(&self, peer: &Peer, channel: u32, key: &str, value: &Variable) -> Result<(), CoreError> {
        Ok(())
    }

    /// Called after `put_paramset` committed config or link members.
    fn paramset_written(&self, peer: &Peer, channel: u32, kind: ParameterSetType, names: &[String]) {}
}

/// Non-owning references from a peer to its device.
#[derive(Clone)]
pub struct PeerOwner {
    pub sink: Weak<dyn EventSink>,
    pub directory: Weak<dyn PeerDirectory>,
}

impl PeerOwner {
    /// Owner that persists nothing and knows no other peers.
    pub fn detached() -> Self {
        Self {
            sink: Weak::<Nowhere>::new(),
            directory: Weak::<Nowhere>::new(),
        }
    }
}

impl fmt::Debug for PeerOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerOwner")
            .field("attached", &(self.sink.strong_count() > 0))
            .finish()
    }
}

struct Nowhere;

impl EventSink for Nowhere {
    fn sink_name(&self) -> String {
        "nowhere".into()
    }

    fn upstream(&self) -> Option<Arc<dyn EventSink>> {
        None
    }
}

impl PeerDirectory for Nowhere {
    fn peer_by_id(&self, _id: u64) -> Option<Arc<Peer>> {
        None
    }

    fn peer_by_address(&self, _address: i32) -> Option<Arc<Peer>> {
        None
    }

    fn peer_by_serial(&self, _serial: &str) -> Option<Arc<Peer>> {
        None
    }
}

/// Identity of a peer at construction.
#[derive(Debug, Clone)]
pub struct PeerInit {
    /// 0 for a peer that has never been saved.
    pub id: u64,
    pub parent_id: u64,
    pub address: i32,
    pub serial: String,
    pub device_type: u32,
    pub description: Arc<DeviceDescription>,
}

/// Descriptive peer variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub name: String,
    pub firmware_version: i32,
    pub firmware_version_string: String,
    pub ip_address: String,
    pub id_string: String,
    pub type_string: String,
}

#[derive(Debug, Default)]
struct Variables {
    info: PeerInfo,
    row_ids: HashMap<u32, u64>,
}

pub struct Peer {
    id: AtomicU64,
    parent_id: AtomicU64,
    address: i32,
    serial: String,
    device_type: u32,
    description: Arc<DeviceDescription>,
    owner: PeerOwner,
    hooks: Option<Arc<dyn PeerHooks>>,
    central_features: AtomicBool,
    deleting: AtomicBool,
    dispose_state: DisposeState,
    paramsets: Mutex<Paramsets>,
    links: Mutex<BTreeMap<u32, Vec<BasicPeerRef>>>,
    variables: Mutex<Variables>,
    last_packet_received: Mutex<Option<DateTime<Utc>>>,
    service_messages: ServiceMessages,
}

impl Peer {
    pub fn new(init: PeerInit, owner: PeerOwner, hooks: Option<Arc<dyn PeerHooks>>) -> Arc<Self> {
        let resend_limit = owner
            .sink
            .upgrade()
            .map_or_else(|| CoreConfig::default().unreach_resend_limit, |sink| {
                sink.settings().unreach_resend_limit
            });

        Arc::new_cyclic(|me: &Weak<Peer>| {
            let service_sink: Weak<dyn ServiceEventSink> = me.clone();
            Self {
                id: AtomicU64::new(init.id),
                parent_id: AtomicU64::new(init.parent_id),
                address: init.address,
                device_type: init.device_type,
                description: init.description,
                owner,
                hooks,
                central_features: AtomicBool::new(true),
                deleting: AtomicBool::new(false),
                dispose_state: DisposeState::new(),
                paramsets: Mutex::new(Paramsets::default()),
                links: Mutex::new(BTreeMap::new()),
                variables: Mutex::new(Variables::default()),
                last_packet_received: Mutex::new(None),
                service_messages: ServiceMessages::new(
                    init.id,
                    init.serial.clone(),
                    service_sink,
                    resend_limit,
                ),
                serial: init.serial,
            }
        })
    }

    // ── Identity ─────────────────────────────────────────────────────

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    pub fn parent_id(&self) -> u64 {
        self.parent_id.load(Ordering::Acquire)
    }

    pub fn set_parent_id(&self, parent_id: u64) {
        self.parent_id.store(parent_id, Ordering::Release);
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

    pub fn description(&self) -> &Arc<DeviceDescription> {
        &self.description
    }

    pub fn service_messages(&self) -> &ServiceMessages {
        &self.service_messages
    }

    pub fn info(&self) -> PeerInfo {
        self.variables.lock().info.clone()
    }

    /// Whether the hub manages links and paramsets of this peer itself.
    pub fn has_central_features(&self) -> bool {
        self.central_features.load(Ordering::Acquire)
    }

    /// Peers owned by a remote central only expose values; link operations
    /// fail with [`CoreError::NotCentral`].
    pub fn set_central_features(&self, enabled: bool) {
        self.central_features.store(enabled, Ordering::Release);
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::Acquire)
    }

    pub fn is_disposing(&self) -> bool {
        !self.dispose_state.is_active()
    }

    /// Change the peer id. Valid ids are `1..0x40000000`.
    pub fn set_id(&self, new_id: u64) -> Result<(), CoreError> {
        self.ensure_active()?;
        if new_id == 0 || new_id >= MAX_PEER_ID {
            return Err(CoreError::InvalidPeerId { id: new_id });
        }
        let old_id = self.id();
        if new_id == old_id {
            return Ok(());
        }
        if !EventSink::set_peer_id(self, old_id, new_id)? {
            return Err(CoreError::PeerIdInUse { id: new_id });
        }
        self.id.store(new_id, Ordering::Release);
        self.service_messages.set_peer_id(new_id);
        if old_id == 0 {
            self.service_messages.save_all();
        }
        debug!(old_id, new_id, "peer id changed");
        Ok(())
    }

    // ── Descriptive variables ────────────────────────────────────────

    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.variables.lock().info.name.clone_from(&name);
        self.save_variable(VAR_NAME, StoredValue::Text(name));
    }

    pub fn set_firmware_version(&self, version: i32) {
        self.variables.lock().info.firmware_version = version;
        self.save_variable(VAR_FIRMWARE_VERSION, StoredValue::Int(i64::from(version)));
    }

    pub fn set_firmware_version_string(&self, version: impl Into<String>) {
        let version = version.into();
        self.variables
            .lock()
            .info
            .firmware_version_string
            .clone_from(&version);
        self.save_variable(VAR_FIRMWARE_STRING, StoredValue::Text(version));
    }

    pub fn set_ip_address(&self, ip: impl Into<String>) {
        let ip = ip.into();
        self.variables.lock().info.ip_address.clone_from(&ip);
        self.save_variable(VAR_IP_ADDRESS, StoredValue::Text(ip));
    }

    pub fn set_id_string(&self, value: impl Into<String>) {
        let value = value.into();
        self.variables.lock().info.id_string.clone_from(&value);
        self.save_variable(VAR_ID_STRING, StoredValue::Text(value));
    }

    pub fn set_type_string(&self, value: impl Into<String>) {
        let value = value.into();
        self.variables.lock().info.type_string.clone_from(&value);
        self.save_variable(VAR_TYPE_STRING, StoredValue::Text(value));
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Persist the peer row, its variables and its parameters.
    ///
    /// A peer saved for the first time also writes every parameter row,
    /// keyed by the id it just acquired.
    pub fn save(
        &self,
        save_peer: bool,
        save_variables: bool,
        save_central_config: bool,
    ) -> Result<(), CoreError> {
        self.ensure_active()?;
        let mut save_central_config = save_central_config;
        if save_peer {
            let old_id = self.id();
            let row = PeerRow {
                id: old_id,
                parent_id: self.parent_id(),
                address: self.address,
                serial: self.serial.clone(),
            };
            let new_id = EventSink::save_peer(self, &row)?;
            if old_id == 0 && new_id != 0 {
                self.id.store(new_id, Ordering::Release);
                self.service_messages.set_peer_id(new_id);
                debug!(peer_id = new_id, serial = %self.serial, "peer saved for the first time");
                save_central_config = true;
                self.service_messages.save_all();
            }
        }
        if save_variables {
            self.save_variables()?;
        }
        if save_central_config {
            self.save_central_config()?;
        }
        Ok(())
    }

    /// Write every variable row.
    pub fn save_variables(&self) -> Result<(), CoreError> {
        if self.id() == 0 {
            return Ok(());
        }
        let info = self.info();
        let links = self.links_json()?;
        let values = [
            (VAR_NAME, StoredValue::Text(info.name)),
            (VAR_FIRMWARE_VERSION, StoredValue::Int(i64::from(info.firmware_version))),
            (VAR_DEVICE_TYPE, StoredValue::Int(i64::from(self.device_type))),
            (VAR_FIRMWARE_STRING, StoredValue::Text(info.firmware_version_string)),
            (VAR_IP_ADDRESS, StoredValue::Text(info.ip_address)),
            (VAR_ID_STRING, StoredValue::Text(info.id_string)),
            (VAR_TYPE_STRING, StoredValue::Text(info.type_string)),
            (VAR_LINKS, StoredValue::Text(links)),
        ];
        for (index, value) in values {
            self.write_variable(index, value)?;
        }
        Ok(())
    }

    /// Restore the peer from storage: variables, parameters, service messages.
    pub fn load(&self) -> Result<(), CoreError> {
        self.ensure_active()?;
        self.load_variables()?;
        self.load_config()?;
        self.initialize_central_config()?;
        self.service_messages.load()
    }

    pub fn load_variables(&self) -> Result<(), CoreError> {
        let id = self.id();
        if id == 0 {
            return Ok(());
        }
        let rows = EventSink::get_peer_variables(self, id)?;
        let mut links = None;
        {
            let mut variables = self.variables.lock();
            for row in rows {
                if let Some(row_id) = row.row_id {
                    variables.row_ids.insert(row.index, row_id);
                }
                let info = &mut variables.info;
                match (row.index, &row.value) {
                    (VAR_NAME, StoredValue::Text(v)) => info.name.clone_from(v),
                    (VAR_FIRMWARE_VERSION, StoredValue::Int(v)) => {
                        info.firmware_version = i32::try_from(*v).unwrap_or_default();
                    }
                    (VAR_FIRMWARE_STRING, StoredValue::Text(v)) => {
                        info.firmware_version_string.clone_from(v);
                    }
                    (VAR_IP_ADDRESS, StoredValue::Text(v)) => info.ip_address.clone_from(v),
                    (VAR_ID_STRING, StoredValue::Text(v)) => info.id_string.clone_from(v),
                    (VAR_TYPE_STRING, StoredValue::Text(v)) => info.type_string.clone_from(v),
                    (VAR_LINKS, StoredValue::Text(v)) => links = Some(v.clone()),
                    (VAR_DEVICE_TYPE, _) => {}
                    (index, value) => trace!(peer_id = id, index, ?value, "ignoring peer variable"),
                }
            }
        }
        if let Some(json) = links {
            let parsed: BTreeMap<u32, Vec<BasicPeerRef>> = serde_json::from_str(&json)?;
            *self.links.lock() = parsed;
        }
        Ok(())
    }

    /// Delete the peer's rows: metadata first, then the peer and its children.
    pub fn delete_from_database(&self) -> Result<(), CoreError> {
        self.deleting.store(true, Ordering::Release);
        let id = self.id();
        if id == 0 {
            return Ok(());
        }
        EventSink::delete_metadata(self, id, &self.serial, None)?;
        EventSink::delete_peer(self, id)
    }

    // ── Packets and reachability ─────────────────────────────────────

    /// Record receipt of a packet from this peer; ends UNREACH.
    pub fn set_last_packet_received(&self, at: DateTime<Utc>) {
        *self.last_packet_received.lock() = Some(at);
        self.service_messages.end_unreach();
    }

    pub fn last_packet_received(&self) -> Option<DateTime<Utc>> {
        *self.last_packet_received.lock()
    }

    /// Forward to [`ServiceMessages::check_unreach`] with the last receipt time.
    pub fn check_unreach(&self, cyclic_timeout: TimeDelta) {
        let Some(last) = self.last_packet_received() else {
            return;
        };
        self.service_messages.check_unreach(cyclic_timeout, last);
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn hub_started(&self) {
        trace!(peer_id = self.id(), "hub started");
    }

    pub fn hub_shutting_down(&self) {
        if let Err(e) = self.save_variables() {
            warn!(peer_id = self.id(), error = %e, "cannot save variables on shutdown");
        }
    }

    /// Release in-memory state. Idempotent.
    pub fn dispose(&self) {
        if !self.dispose_state.begin() {
            return;
        }
        self.service_messages.dispose();
        self.dispose_state.finish();
        trace!(peer_id = self.id(), "peer disposed");
    }

    // ── CLI ──────────────────────────────────────────────────────────

    pub fn handle_cli_command(&self, command: &str) -> String {
        let mut words = command.split_whitespace();
        let mut out = String::new();
        match words.next() {
            Some("help") | None => {
                out.push_str("List of commands:\n\n");
                out.push_str("servicemessages\tPrints the active service messages\n");
                out.push_str("values <channel>\tPrints the values of a channel\n");
                out.push_str("config <channel>\tPrints the config parameters of a channel\n");
                out.push_str("links\t\tPrints the links of every channel\n");
                out.push_str("unselect\tUnselects this peer\n");
            }
            Some("servicemessages") => {
                let messages = self.service_messages.get(false);
                let list = messages.as_array().unwrap_or_default();
                if list.is_empty() {
                    out.push_str("No service messages.\n");
                }
                for message in list {
                    let _ = writeln!(out, "{message}");
                }
            }
            Some(kind @ ("values" | "config")) => {
                let Some(channel) = words.next().and_then(|w| w.parse::<u32>().ok()) else {
                    return "Invalid channel.\n".into();
                };
                let paramset = if kind == "values" {
                    ParameterSetType::Values
                } else {
                    ParameterSetType::Config
                };
                match self.get_paramset(channel, paramset, 0, None) {
                    Ok(Variable::Struct(values)) => {
                        for (name, value) in values {
                            let _ = writeln!(out, "{name}: {value}");
                        }
                    }
                    Ok(other) => {
                        let _ = writeln!(out, "{other}");
                    }
                    Err(e) => {
                        let _ = writeln!(out, "Error: {e}");
                    }
                }
            }
            Some("links") => {
                for (channel, refs) in self.links.lock().iter() {
                    for link in refs {
                        let _ = writeln!(
                            out,
                            "{channel} -> 0x{:06X}:{}{}",
                            link.address,
                            link.channel,
                            if link.hidden { " (hidden)" } else { "" }
                        );
                    }
                }
                if out.is_empty() {
                    out.push_str("No links.\n");
                }
            }
            Some(other) => {
                let _ = writeln!(out, "Unknown command: {other}");
            }
        }
        out
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn ensure_active(&self) -> Result<(), CoreError> {
        if self.is_deleting() || self.is_disposing() {
            return Err(CoreError::disposing(format!("peer {}", self.id())));
        }
        Ok(())
    }

    fn ensure_central(&self) -> Result<(), CoreError> {
        self.ensure_active()?;
        if !self.has_central_features() {
            return Err(CoreError::NotCentral { peer_id: self.id() });
        }
        Ok(())
    }

    fn directory(&self) -> Option<Arc<dyn PeerDirectory>> {
        self.owner.directory.upgrade()
    }

    /// Persist one variable, logging instead of failing.
    fn save_variable(&self, index: u32, value: StoredValue) {
        if self.id() == 0 {
            return;
        }
        if let Err(e) = self.write_variable(index, value) {
            error!(peer_id = self.id(), index, error = %e, "cannot save peer variable");
        }
    }

    fn write_variable(&self, index: u32, value: StoredValue) -> Result<(), CoreError> {
        let owner_id = self.id();
        let row_id = self.variables.lock().row_ids.get(&index).copied();
        let row = VariableRow {
            row_id,
            owner_id,
            index,
            value,
        };
        let saved = EventSink::save_peer_variable(self, &row)?;
        self.variables.lock().row_ids.insert(index, saved);
        Ok(())
    }

    fn links_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(&*self.links.lock())?)
    }

    fn save_links(&self) {
        match self.links_json() {
            Ok(json) => self.save_variable(VAR_LINKS, StoredValue::Text(json)),
            Err(e) => error!(peer_id = self.id(), error = %e, "cannot encode links"),
        }
    }

    fn savepoint_name(&self) -> String {
        format!("PeerConfig{}", self.id())
    }

    fn with_savepoint<R>(&self, f: impl FnOnce() -> Result<R, CoreError>) -> Result<R, CoreError> {
        if self.id() == 0 {
            return f();
        }
        let name = self.savepoint_name();
        EventSink::create_savepoint(self, &name, SavepointMode::Sync)?;
        let result = f();
        if let Err(e) = EventSink::release_savepoint(self, &name, SavepointMode::Sync) {
            warn!(peer_id = self.id(), error = %e, "cannot release savepoint");
        }
        result
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("address", &format_args!("0x{:06X}", self.address))
            .field("serial", &self.serial)
            .field("device_type", &self.device_type)
            .finish_non_exhaustive()
    }
}

// ── Event sink chain ────────────────────────────────────────────────

impl EventSink for Peer {
    fn sink_name(&self) -> String {
        format!("peer {} ({})", self.id(), self.serial)
    }

    fn upstream(&self) -> Option<Arc<dyn EventSink>> {
        self.owner.sink.upgrade()
    }

    fn save_peer_parameter(&self, row: &ParameterRow) -> Result<u64, CoreError> {
        if self.is_deleting() {
            return Err(CoreError::disposing(format!("peer {}", self.id())));
        }
        self.parent()?.save_peer_parameter(row)
    }
}

impl ServiceEventSink for Peer {
    fn phase(&self) -> LifecyclePhase {
        EventSink::phase(self)
    }

    fn on_config_pending(&self, pending: bool) {
        if let Some(hooks) = &self.hooks {
            hooks.config_pending_changed(self, pending);
        }
    }

    fn on_rpc_event(&self, event: RpcEvent) {
        self.rpc_event(event);
    }

    fn on_save_parameter(&self, name: &str, channel: u32, data: &[u8]) {
        self.store_value_data(channel, name, data);
    }

    fn on_get_service_messages(&self) -> Result<Vec<ServiceMessageRow>, CoreError> {
        let id = self.id();
        if id == 0 {
            return Ok(Vec::new());
        }
        EventSink::get_service_messages(self, id)
    }

    fn on_save_service_message(&self, row: &ServiceMessageRow) -> Result<u64, CoreError> {
        if self.is_deleting() {
            return Err(CoreError::disposing(format!("peer {}", self.id())));
        }
        EventSink::save_service_message(self, row)
    }

    fn on_delete_service_message(&self, row_id: u64) -> Result<(), CoreError> {
        EventSink::delete_service_message(self, row_id)
    }

    fn on_enqueue_pending_queues(&self) {
        if let Some(hooks) = &self.hooks {
            hooks.enqueue_pending_queues(self);
        }
    }
}
