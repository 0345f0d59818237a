// ── In-memory storage engine ──
//
// `DashMap` tables keyed by row id with one monotonic id counter shared by
// every table. Each mutation is appended to an operation journal so callers
// can inspect write order. The whole store round-trips through a JSON
// snapshot file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{
    DeviceRow, ParameterRow, PeerRow, SavepointMode, ServiceMessageRow, Storage, VariableRow,
};
use crate::error::CoreError;
use crate::variable::Variable;

/// One journaled storage mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    SavepointCreated { name: String, mode: SavepointMode },
    SavepointReleased { name: String, mode: SavepointMode },
    DeviceSaved { id: u64 },
    DeviceDeleted { id: u64 },
    DeviceVariableSaved { device_id: u64, index: u32 },
    PeerSaved { id: u64 },
    PeerDeleted { id: u64 },
    PeersDeleted { device_id: u64 },
    PeerIdChanged { old_id: u64, new_id: u64 },
    ParameterSaved { peer_id: u64, row_id: u64, name: String },
    ParameterDeleted { peer_id: u64, row_id: u64 },
    PeerVariableSaved { peer_id: u64, index: u32 },
    ServiceMessageSaved { peer_id: u64, index: u32 },
    ServiceMessageDeleted { row_id: u64 },
    MetadataDeleted { peer_id: u64 },
}

/// Operation that should fail with a storage error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailPoint {
    /// Every write.
    AllWrites,
    /// Parameter saves, optionally only for one parameter name.
    SaveParameter(Option<String>),
    SaveServiceMessage,
    DeletePeers,
    DeleteDevice,
}

/// Row counts of a store, as printed by the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub devices: usize,
    pub device_variables: usize,
    pub peers: usize,
    pub parameters: usize,
    pub peer_variables: usize,
    pub service_messages: usize,
    pub metadata: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    next_id: u64,
    devices: Vec<DeviceRow>,
    device_variables: Vec<VariableRow>,
    peers: Vec<PeerRow>,
    parameters: Vec<ParameterRow>,
    peer_variables: Vec<VariableRow>,
    service_messages: Vec<ServiceMessageRow>,
    #[serde(default)]
    metadata: BTreeMap<u64, BTreeMap<String, Variable>>,
}

/// Thread-safe in-memory [`Storage`] implementation.
#[derive(Debug)]
pub struct MemoryStore {
    next_id: AtomicU64,
    devices: DashMap<u64, DeviceRow>,
    device_variables: DashMap<u64, VariableRow>,
    peers: DashMap<u64, PeerRow>,
    parameters: DashMap<u64, ParameterRow>,
    peer_variables: DashMap<u64, VariableRow>,
    service_messages: DashMap<u64, ServiceMessageRow>,
    metadata: DashMap<u64, BTreeMap<String, Variable>>,
    journal: Mutex<Vec<StoreOp>>,
    fail_points: Mutex<Vec<FailPoint>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            devices: DashMap::new(),
            device_variables: DashMap::new(),
            peers: DashMap::new(),
            parameters: DashMap::new(),
            peer_variables: DashMap::new(),
            service_messages: DashMap::new(),
            metadata: DashMap::new(),
            journal: Mutex::new(Vec::new()),
            fail_points: Mutex::new(Vec::new()),
        }
    }

    // ── Snapshots ────────────────────────────────────────────────────

    pub fn to_json(&self) -> Result<String, CoreError> {
        let snapshot = Snapshot {
            next_id: self.next_id.load(Ordering::Acquire),
            devices: sorted_values(&self.devices, |_| true),
            device_variables: sorted_values(&self.device_variables, |_| true),
            peers: sorted_values(&self.peers, |_| true),
            parameters: sorted_values(&self.parameters, |_| true),
            peer_variables: sorted_values(&self.peer_variables, |_| true),
            service_messages: sorted_values(&self.service_messages, |_| true),
            metadata: self
                .metadata
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let snapshot: Snapshot = serde_json::from_str(json)?;
        let store = Self::new();

        let mut highest = 0;
        for row in snapshot.devices {
            highest = highest.max(row.id);
            store.devices.insert(row.id, row);
        }
        for row in snapshot.peers {
            highest = highest.max(row.id);
            store.peers.insert(row.id, row);
        }
        for (table, rows) in [
            (&store.device_variables, snapshot.device_variables),
            (&store.peer_variables, snapshot.peer_variables),
        ] {
            for row in rows {
                let id = row.row_id.ok_or_else(|| CoreError::storage("variable row without id"))?;
                highest = highest.max(id);
                table.insert(id, row);
            }
        }
        for row in snapshot.parameters {
            let id = row.row_id.ok_or_else(|| CoreError::storage("parameter row without id"))?;
            highest = highest.max(id);
            store.parameters.insert(id, row);
        }
        for row in snapshot.service_messages {
            let id = row
                .row_id
                .ok_or_else(|| CoreError::storage("service message row without id"))?;
            highest = highest.max(id);
            store.service_messages.insert(id, row);
        }
        for (peer_id, entries) in snapshot.metadata {
            store.metadata.insert(peer_id, entries);
        }

        store
            .next_id
            .store(snapshot.next_id.max(highest + 1), Ordering::Release);
        Ok(store)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), CoreError> {
        let json = self.to_json()?;
        fs::write(path, json)
            .map_err(|e| CoreError::storage(format!("cannot write {}: {e}", path.display())))?;
        debug!(path = %path.display(), "store snapshot written");
        Ok(())
    }

    pub fn load_from(path: &Path) -> Result<Self, CoreError> {
        let json = fs::read_to_string(path)
            .map_err(|e| CoreError::storage(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    // ── Inspection ───────────────────────────────────────────────────

    pub fn summary(&self) -> StoreSummary {
        StoreSummary {
            devices: self.devices.len(),
            device_variables: self.device_variables.len(),
            peers: self.peers.len(),
            parameters: self.parameters.len(),
            peer_variables: self.peer_variables.len(),
            service_messages: self.service_messages.len(),
            metadata: self.metadata.iter().map(|entry| entry.value().len()).sum(),
        }
    }

    pub fn journal(&self) -> Vec<StoreOp> {
        self.journal.lock().clone()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    pub fn device(&self, id: u64) -> Option<DeviceRow> {
        self.devices.get(&id).map(|row| row.clone())
    }

    pub fn peer(&self, id: u64) -> Option<PeerRow> {
        self.peers.get(&id).map(|row| row.clone())
    }

    pub fn set_metadata(&self, peer_id: u64, data_id: impl Into<String>, value: Variable) {
        self.metadata
            .entry(peer_id)
            .or_default()
            .insert(data_id.into(), value);
    }

    pub fn metadata(&self, peer_id: u64) -> BTreeMap<String, Variable> {
        self.metadata
            .get(&peer_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    // ── Failure injection ────────────────────────────────────────────

    pub fn fail_on(&self, point: FailPoint) {
        self.fail_points.lock().push(point);
    }

    pub fn clear_failures(&self) {
        self.fail_points.lock().clear();
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn record(&self, op: StoreOp) {
        trace!(?op, "store operation");
        self.journal.lock().push(op);
    }

    fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    fn check(&self, matches: impl Fn(&FailPoint) -> bool) -> Result<(), CoreError> {
        let points = self.fail_points.lock();
        if points
            .iter()
            .any(|point| *point == FailPoint::AllWrites || matches(point))
        {
            return Err(CoreError::storage("injected storage failure"));
        }
        Ok(())
    }

    fn upsert_variable(table: &DashMap<u64, VariableRow>, row: &VariableRow, id: u64) {
        let mut row = row.clone();
        row.row_id = Some(id);
        table.insert(id, row);
    }
}

/// Values of `table` matching `keep`, ordered by row id.
fn sorted_values<T: Clone>(table: &DashMap<u64, T>, keep: impl Fn(&T) -> bool) -> Vec<T> {
    let mut rows: Vec<(u64, T)> = table
        .iter()
        .filter(|entry| keep(entry.value()))
        .map(|entry| (*entry.key(), entry.value().clone()))
        .collect();
    rows.sort_by_key(|(id, _)| *id);
    rows.into_iter().map(|(_, row)| row).collect()
}

impl Storage for MemoryStore {
    fn create_savepoint(&self, name: &str, mode: SavepointMode) -> Result<(), CoreError> {
        self.record(StoreOp::SavepointCreated {
            name: name.to_owned(),
            mode,
        });
        Ok(())
    }

    fn release_savepoint(&self, name: &str, mode: SavepointMode) -> Result<(), CoreError> {
        self.record(StoreOp::SavepointReleased {
            name: name.to_owned(),
            mode,
        });
        Ok(())
    }

    // ── Devices ──────────────────────────────────────────────────────

    fn get_devices(&self, family: u32) -> Result<Vec<DeviceRow>, CoreError> {
        Ok(sorted_values(&self.devices, |row| row.family == family))
    }

    fn save_device(&self, row: &DeviceRow) -> Result<u64, CoreError> {
        self.check(|_| false)?;
        let id = if row.id == 0 { self.allocate() } else { row.id };
        let mut row = row.clone();
        row.id = id;
        self.devices.insert(id, row);
        self.record(StoreOp::DeviceSaved { id });
        Ok(id)
    }

    fn delete_device(&self, id: u64) -> Result<(), CoreError> {
        self.check(|point| *point == FailPoint::DeleteDevice)?;
        self.devices.remove(&id);
        self.device_variables.retain(|_, row| row.owner_id != id);
        self.record(StoreOp::DeviceDeleted { id });
        Ok(())
    }

    fn get_device_variables(&self, device_id: u64) -> Result<Vec<VariableRow>, CoreError> {
        Ok(sorted_values(&self.device_variables, |row| {
            row.owner_id == device_id
        }))
    }

    fn save_device_variable(&self, row: &VariableRow) -> Result<u64, CoreError> {
        self.check(|_| false)?;
        let id = row.row_id.unwrap_or_else(|| self.allocate());
        Self::upsert_variable(&self.device_variables, row, id);
        self.record(StoreOp::DeviceVariableSaved {
            device_id: row.owner_id,
            index: row.index,
        });
        Ok(id)
    }

    // ── Peers ────────────────────────────────────────────────────────

    fn get_peers(&self, device_id: u64) -> Result<Vec<PeerRow>, CoreError> {
        Ok(sorted_values(&self.peers, |row| row.parent_id == device_id))
    }

    fn save_peer(&self, row: &PeerRow) -> Result<u64, CoreError> {
        self.check(|_| false)?;
        let id = if row.id == 0 { self.allocate() } else { row.id };
        let mut row = row.clone();
        row.id = id;
        self.peers.insert(id, row);
        self.record(StoreOp::PeerSaved { id });
        Ok(id)
    }

    fn delete_peer(&self, id: u64) -> Result<(), CoreError> {
        self.check(|_| false)?;
        self.parameters.retain(|_, row| row.peer_id != id);
        self.peer_variables.retain(|_, row| row.owner_id != id);
        self.service_messages.retain(|_, row| row.peer_id != id);
        self.metadata.remove(&id);
        self.peers.remove(&id);
        self.record(StoreOp::PeerDeleted { id });
        Ok(())
    }

    fn delete_peers(&self, device_id: u64) -> Result<(), CoreError> {
        self.check(|point| *point == FailPoint::DeletePeers)?;
        let ids: Vec<u64> = sorted_values(&self.peers, |row| row.parent_id == device_id)
            .into_iter()
            .map(|row| row.id)
            .collect();
        for id in ids {
            self.parameters.retain(|_, row| row.peer_id != id);
            self.peer_variables.retain(|_, row| row.owner_id != id);
            self.service_messages.retain(|_, row| row.peer_id != id);
            self.metadata.remove(&id);
            self.peers.remove(&id);
        }
        self.record(StoreOp::PeersDeleted { device_id });
        Ok(())
    }

    fn set_peer_id(&self, old_id: u64, new_id: u64) -> Result<bool, CoreError> {
        self.check(|_| false)?;
        if self.peers.contains_key(&new_id) {
            return Ok(false);
        }
        if let Some((_, mut row)) = self.peers.remove(&old_id) {
            row.id = new_id;
            self.peers.insert(new_id, row);
        }
        for mut row in self.parameters.iter_mut() {
            if row.peer_id == old_id {
                row.peer_id = new_id;
            }
        }
        for mut row in self.peer_variables.iter_mut() {
            if row.owner_id == old_id {
                row.owner_id = new_id;
            }
        }
        for mut row in self.service_messages.iter_mut() {
            if row.peer_id == old_id {
                row.peer_id = new_id;
            }
        }
        if let Some((_, entries)) = self.metadata.remove(&old_id) {
            self.metadata.insert(new_id, entries);
        }
        self.record(StoreOp::PeerIdChanged { old_id, new_id });
        Ok(true)
    }

    // ── Peer parameters and variables ────────────────────────────────

    fn get_peer_parameters(&self, peer_id: u64) -> Result<Vec<ParameterRow>, CoreError> {
        Ok(sorted_values(&self.parameters, |row| row.peer_id == peer_id))
    }

    fn save_peer_parameter(&self, row: &ParameterRow) -> Result<u64, CoreError> {
        self.check(|point| match point {
            FailPoint::SaveParameter(None) => true,
            FailPoint::SaveParameter(Some(name)) => *name == row.name,
            _ => false,
        })?;
        let id = row.row_id.unwrap_or_else(|| self.allocate());
        let mut stored = row.clone();
        stored.row_id = Some(id);
        self.parameters.insert(id, stored);
        self.record(StoreOp::ParameterSaved {
            peer_id: row.peer_id,
            row_id: id,
            name: row.name.clone(),
        });
        Ok(id)
    }

    fn delete_peer_parameter(&self, peer_id: u64, row_id: u64) -> Result<(), CoreError> {
        self.check(|_| false)?;
        self.parameters.remove(&row_id);
        self.record(StoreOp::ParameterDeleted { peer_id, row_id });
        Ok(())
    }

    fn get_peer_variables(&self, peer_id: u64) -> Result<Vec<VariableRow>, CoreError> {
        Ok(sorted_values(&self.peer_variables, |row| {
            row.owner_id == peer_id
        }))
    }

    fn save_peer_variable(&self, row: &VariableRow) -> Result<u64, CoreError> {
        self.check(|_| false)?;
        let id = row.row_id.unwrap_or_else(|| self.allocate());
        Self::upsert_variable(&self.peer_variables, row, id);
        self.record(StoreOp::PeerVariableSaved {
            peer_id: row.owner_id,
            index: row.index,
        });
        Ok(id)
    }

    // ── Service messages ─────────────────────────────────────────────

    fn get_service_messages(&self, peer_id: u64) -> Result<Vec<ServiceMessageRow>, CoreError> {
        Ok(sorted_values(&self.service_messages, |row| {
            row.peer_id == peer_id
        }))
    }

    fn save_service_message(&self, row: &ServiceMessageRow) -> Result<u64, CoreError> {
        self.check(|point| *point == FailPoint::SaveServiceMessage)?;
        let id = row.row_id.unwrap_or_else(|| self.allocate());
        let mut stored = row.clone();
        stored.row_id = Some(id);
        self.service_messages.insert(id, stored);
        self.record(StoreOp::ServiceMessageSaved {
            peer_id: row.peer_id,
            index: row.index,
        });
        Ok(id)
    }

    fn delete_service_message(&self, row_id: u64) -> Result<(), CoreError> {
        self.check(|_| false)?;
        self.service_messages.remove(&row_id);
        self.record(StoreOp::ServiceMessageDeleted { row_id });
        Ok(())
    }

    fn delete_metadata(
        &self,
        peer_id: u64,
        _serial: &str,
        data_id: Option<&str>,
    ) -> Result<(), CoreError> {
        self.check(|_| false)?;
        match data_id {
            Some(data_id) => {
                if let Some(mut entries) = self.metadata.get_mut(&peer_id) {
                    entries.remove(data_id);
                }
            }
            None => {
                self.metadata.remove(&peer_id);
            }
        }
        self.record(StoreOp::MetadataDeleted { peer_id });
        Ok(())
    }
}
