#![allow(clippy::unwrap_used)]
// Integration tests for device families: persistence round trips, device
// removal order and packet delivery from interface pipelines.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use hearth_core::storage::{DeviceRow, FailPoint, PeerRow, StoreOp};
use hearth_core::{
    CoreConfig, CoreError, DeviceDescription, DeviceFamily, DeviceHooks, DeviceInit, FamilyHooks,
    Function, HubContext, LogicalDevice, LogicalType, MemoryStore, Packet, PacketPipeline,
    Parameter, Peer, PeerInit, PeerLookup, RpcListener, Variable,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn switch() -> Arc<DeviceDescription> {
    Arc::new(
        DeviceDescription::new(0x42, "SWITCH-1").with_function(
            Function::new(1, "SWITCH")
                .with_config(Parameter::new("POWERUP_ON", LogicalType::Boolean))
                .with_value(Parameter::new("STATE", LogicalType::Boolean)),
        ),
    )
}

#[derive(Default)]
struct Switches {
    packets: Mutex<Vec<Bytes>>,
}

impl DeviceHooks for Switches {
    fn create_peer(&self, device: &LogicalDevice, row: &PeerRow) -> Option<Arc<Peer>> {
        Some(Peer::new(
            PeerInit {
                id: row.id,
                parent_id: row.parent_id,
                address: row.address,
                serial: row.serial.clone(),
                device_type: 0x42,
                description: switch(),
            },
            device.peer_owner(),
            None,
        ))
    }

    fn on_packet_received(
        &self,
        _device: &LogicalDevice,
        _interface_id: &str,
        packet: &Packet,
    ) -> Result<bool, CoreError> {
        self.packets.lock().push(packet.payload().clone());
        Ok(true)
    }
}

struct Factory {
    hooks: Arc<Switches>,
}

impl FamilyHooks for Factory {
    fn create_device(&self, family: &DeviceFamily, row: &DeviceRow) -> Option<Arc<LogicalDevice>> {
        Some(LogicalDevice::new(
            DeviceInit::from(row),
            family.device_sink(),
            self.hooks.clone(),
        ))
    }
}

#[derive(Default)]
struct Deletions(Mutex<Vec<String>>);

impl RpcListener for Deletions {
    fn on_delete_devices(&self, addresses: &[String], _info: &[Variable]) {
        self.0.lock().extend_from_slice(addresses);
    }
}

struct Setup {
    store: Arc<MemoryStore>,
    context: Arc<HubContext>,
    hooks: Arc<Switches>,
    family: Arc<DeviceFamily>,
}

fn setup(store: Arc<MemoryStore>) -> Setup {
    let context = HubContext::new(store.clone(), CoreConfig::default());
    let hooks = Arc::new(Switches::default());
    let family = DeviceFamily::new(
        7,
        "switches",
        context.as_sink(),
        Arc::new(Factory {
            hooks: hooks.clone(),
        }),
    );
    Setup {
        store,
        context,
        hooks,
        family,
    }
}

/// Add a central with two saved peers; returns the device.
fn central(setup: &Setup, serial: &str) -> Arc<LogicalDevice> {
    let device = LogicalDevice::new(
        DeviceInit {
            id: 0,
            family_id: setup.family.id(),
            address: 0x1,
            serial: serial.into(),
            device_type: 0xFFFD,
        },
        setup.family.device_sink(),
        setup.hooks.clone(),
    );
    setup.family.add(device.clone()).unwrap();
    for (address, peer_serial) in [(0x10, "SW00000001"), (0x11, "SW00000002")] {
        let peer = device.create_peer(
            PeerInit {
                id: 0,
                parent_id: 0,
                address,
                serial: peer_serial.into(),
                device_type: 0x42,
                description: switch(),
            },
            None,
        );
        peer.initialize_central_config().unwrap();
        peer.save(true, true, true).unwrap();
    }
    device
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    done()
}

// ── Persistence ─────────────────────────────────────────────────────

#[test]
fn snapshot_round_trip_restores_devices_and_peers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hub.json");
    {
        let setup = setup(Arc::new(MemoryStore::new()));
        let device = central(&setup, "CENTRAL007");
        let peer = device.peer(PeerLookup::Serial("SW00000001")).unwrap();
        peer.set_value(1, "STATE", Variable::Bool(true)).unwrap();
        peer.set_name("Kitchen");
        assert_eq!(setup.family.save(true), 2);
        setup.store.save_to(&path).unwrap();
    }

    let setup = setup(Arc::new(MemoryStore::load_from(&path).unwrap()));
    assert_eq!(setup.family.load().unwrap(), 1);
    let device = setup.family.get_by_serial("CENTRAL007").unwrap();
    assert_eq!(device.peer_count(), 2);
    let peer = device.peer(PeerLookup::Serial("SW00000001")).unwrap();
    assert_eq!(peer.get_value(1, "STATE").unwrap(), Variable::Bool(true));
    assert_eq!(peer.info().name, "Kitchen");
    assert!(setup.family.get_by_address(0x1).is_some());
}

// ── Removal ─────────────────────────────────────────────────────────

#[test]
fn removal_deletes_peers_before_device_row() {
    let setup = setup(Arc::new(MemoryStore::new()));
    let deletions = Arc::new(Deletions::default());
    setup.context.subscribe("deletions", deletions.clone());
    let device = central(&setup, "CENTRAL007");
    let id = device.id();
    let peers = device.get_peers(&Default::default());
    let peer_ids: Vec<u64> = peers.iter().map(|peer| peer.id()).collect();
    setup.store.clear_journal();

    setup.family.remove(id).unwrap();
    assert!(setup.family.wait_for_removal().unwrap());

    assert!(setup.family.get_by_id(id).is_none());
    assert!(setup.family.get_by_serial("CENTRAL007").is_none());
    assert!(device.is_disposing());
    assert!(setup.store.device(id).is_none());
    for peer_id in peer_ids {
        assert!(setup.store.peer(peer_id).is_none());
    }

    let journal = setup.store.journal();
    let peers_deleted = journal
        .iter()
        .position(|op| matches!(op, StoreOp::PeersDeleted { device_id } if *device_id == id))
        .unwrap();
    let device_deleted = journal
        .iter()
        .position(|op| matches!(op, StoreOp::DeviceDeleted { id: deleted } if *deleted == id))
        .unwrap();
    assert!(peers_deleted < device_deleted);
    for peer in &peers {
        assert!(peer.is_deleting());
        let peer_deleted = journal
            .iter()
            .position(|op| matches!(op, StoreOp::PeerDeleted { id } if *id == peer.id()))
            .unwrap();
        assert!(peer_deleted < peers_deleted);
        assert!(journal
            .iter()
            .any(|op| matches!(op, StoreOp::MetadataDeleted { peer_id } if *peer_id == peer.id())));
    }

    let mut addresses = deletions.0.lock().clone();
    addresses.sort();
    assert_eq!(addresses, vec!["SW00000001".to_owned(), "SW00000002".to_owned()]);
}

#[test]
fn failed_peer_deletion_keeps_device_row() {
    let setup = setup(Arc::new(MemoryStore::new()));
    let device = central(&setup, "CENTRAL007");
    let id = device.id();
    setup.store.fail_on(FailPoint::DeletePeers);

    setup.family.remove(id).unwrap();
    let err = setup.family.wait_for_removal().unwrap_err();
    assert_eq!(err.code(), -32501);
    assert!(setup.store.device(id).is_some());
    assert!(
        !setup
            .store
            .journal()
            .iter()
            .any(|op| matches!(op, StoreOp::DeviceDeleted { .. }))
    );
}

#[test]
fn second_removal_joins_the_first() {
    let setup = setup(Arc::new(MemoryStore::new()));
    let first = central(&setup, "CENTRAL007").id();
    let second = central(&setup, "CENTRAL008").id();

    setup.family.remove(first).unwrap();
    setup.family.remove(second).unwrap();
    assert!(setup.family.wait_for_removal().unwrap());
    assert!(setup.family.get_devices().is_empty());
    assert!(!setup.family.wait_for_removal().unwrap());
}

// ── Packets ─────────────────────────────────────────────────────────

#[test]
fn interface_packets_reach_devices_in_order() {
    let setup = setup(Arc::new(MemoryStore::new()));
    let pipeline = Arc::new(PacketPipeline::new("rf0", 16));
    setup.family.add_interface(pipeline.clone());
    central(&setup, "CENTRAL007");
    assert_eq!(pipeline.subscriber_count(), 1);

    setup.family.start_listening().unwrap();
    for byte in 1..=5_u8 {
        pipeline.enqueue(Packet::new(vec![byte])).unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || {
        setup.hooks.packets.lock().len() == 5
    }));
    setup.family.stop_listening();
    assert!(!pipeline.is_running());

    let received: Vec<u8> = setup.hooks.packets.lock().iter().map(|p| p[0]).collect();
    assert_eq!(received, vec![1, 2, 3, 4, 5]);
    assert_eq!(pipeline.stats().processed, 5);
}

#[test]
fn dispose_detaches_interfaces_and_devices() {
    let setup = setup(Arc::new(MemoryStore::new()));
    let pipeline = Arc::new(PacketPipeline::new("rf0", 16));
    setup.family.add_interface(pipeline.clone());
    let device = central(&setup, "CENTRAL007");
    setup.family.start_listening().unwrap();

    setup.family.dispose().unwrap();
    setup.family.dispose().unwrap();
    assert!(setup.family.is_disposing());
    assert!(device.is_disposing());
    assert!(!pipeline.is_running());
    assert_eq!(pipeline.subscriber_count(), 0);
}
