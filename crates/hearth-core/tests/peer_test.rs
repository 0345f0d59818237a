#![allow(clippy::unwrap_used)]
// Integration tests for peers: paramsets, values, links and service
// messages, persisted through the in-memory store.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use hearth_core::storage::{FailPoint, ParameterRow, PeerRow, StoreOp};
use hearth_core::{
    BasicPeerRef, CoreConfig, DeviceDescription, DeviceHooks, DeviceInit, EventSink, Function,
    HubContext, LifecyclePhase, LinkFlags, LogicalDevice, LogicalType, MemoryStore, Parameter,
    ParameterSetType, Peer, PeerInit, PeerLookup, RpcEvent, RpcListener, Storage, Variable,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn dimmer() -> Arc<DeviceDescription> {
    Arc::new(
        DeviceDescription::new(0x67, "DIMMER-1")
            .with_function(
                Function::new(0, "MAINTENANCE")
                    .with_value(Parameter::new("UNREACH", LogicalType::Boolean).read_only().service())
                    .with_value(
                        Parameter::new("CONFIG_PENDING", LogicalType::Boolean)
                            .read_only()
                            .service(),
                    ),
            )
            .with_function(
                Function::new(1, "DIMMER")
                    .with_config(Parameter::new("ON_LEVEL", LogicalType::integer(0, 200)).with_default(200))
                    .with_config(Parameter::new("RAMP_TIME", LogicalType::float(0.0, 100.0)).with_default(0.5))
                    .with_config(Parameter::new("STATUS_DELAY", LogicalType::integer(0, 60)))
                    .with_value(Parameter::new("LEVEL", LogicalType::float(0.0, 1.0)))
                    .with_value(Parameter::new("WORKING", LogicalType::Boolean).read_only())
                    .with_link(
                        Parameter::new("SHORT_ON_LEVEL", LogicalType::float(0.0, 1.0)).with_default(1.0),
                    )
                    .link_receiver("SWITCH"),
            )
            .with_function(
                Function::new(2, "KEY")
                    .with_link(
                        Parameter::new("LONG_PRESS_TIME", LogicalType::float(0.3, 1.8)).with_default(0.4),
                    )
                    .link_sender("SWITCH"),
            ),
    )
}

struct Dimmers;

impl DeviceHooks for Dimmers {
    fn create_peer(&self, device: &LogicalDevice, row: &PeerRow) -> Option<Arc<Peer>> {
        Some(Peer::new(
            PeerInit {
                id: row.id,
                parent_id: row.parent_id,
                address: row.address,
                serial: row.serial.clone(),
                device_type: 0x67,
                description: dimmer(),
            },
            device.peer_owner(),
            None,
        ))
    }
}

#[derive(Default)]
struct Events(Mutex<Vec<RpcEvent>>);

impl RpcListener for Events {
    fn on_event(&self, event: &RpcEvent) {
        self.0.lock().push(event.clone());
    }
}

struct Hub {
    store: Arc<MemoryStore>,
    context: Arc<HubContext>,
    device: Arc<LogicalDevice>,
}

fn hub() -> Hub {
    let store = Arc::new(MemoryStore::new());
    let context = HubContext::new(store.clone(), CoreConfig::default());
    context.set_phase(LifecyclePhase::Running);
    let parent: Arc<dyn EventSink> = context.as_sink();
    let device = LogicalDevice::new(
        DeviceInit {
            id: 0,
            family_id: 1,
            address: 0x1,
            serial: "CENTRAL001".into(),
            device_type: 0xFFFD,
        },
        Arc::downgrade(&parent),
        Arc::new(Dimmers),
    );
    device.save(true).unwrap();
    Hub {
        store,
        context,
        device,
    }
}

fn unsaved(hub: &Hub, address: i32, serial: &str) -> Arc<Peer> {
    let peer = hub.device.create_peer(
        PeerInit {
            id: 0,
            parent_id: 0,
            address,
            serial: serial.into(),
            device_type: 0x67,
            description: dimmer(),
        },
        None,
    );
    peer.initialize_central_config().unwrap();
    peer
}

fn paired(hub: &Hub, address: i32, serial: &str) -> Arc<Peer> {
    let peer = unsaved(hub, address, serial);
    peer.save(true, false, false).unwrap();
    peer
}

fn rows(hub: &Hub, peer: &Peer) -> Vec<ParameterRow> {
    hub.store.get_peer_parameters(peer.id()).unwrap()
}

fn row<'a>(rows: &'a [ParameterRow], name: &str) -> &'a ParameterRow {
    rows.iter().find(|row| row.name == name).unwrap()
}

fn members(values: &[(&str, Variable)]) -> BTreeMap<String, Variable> {
    values
        .iter()
        .map(|(name, value)| ((*name).to_owned(), value.clone()))
        .collect()
}

// ── Paramsets ───────────────────────────────────────────────────────

#[test]
fn values_of_unsaved_peer_are_written_on_first_save() {
    let hub = hub();
    let peer = unsaved(&hub, 0x10, "DIM0000001");
    peer.set_value(1, "LEVEL", Variable::Float(0.5)).unwrap();
    assert_eq!(peer.get_value(1, "LEVEL").unwrap(), Variable::Float(0.5));
    assert_eq!(hub.store.summary().parameters, 0);

    peer.save(true, false, false).unwrap();
    let id = peer.id();
    assert_ne!(id, 0);
    let rows = rows(&hub, &peer);
    let level = row(&rows, "LEVEL");
    assert_eq!(level.peer_id, id);
    assert_eq!(level.kind, ParameterSetType::Values);
    assert_eq!(level.value, 0.5_f64.to_be_bytes().to_vec());
}

#[test]
fn initialize_central_config_is_idempotent() {
    let hub = hub();
    let peer = paired(&hub, 0x10, "DIM0000001");
    let stored = rows(&hub, &peer).len();
    assert!(stored > 0);

    peer.put_paramset(
        1,
        ParameterSetType::Config,
        0,
        None,
        &members(&[("ON_LEVEL", Variable::Integer(120))]),
    )
    .unwrap();
    assert_eq!(peer.initialize_central_config().unwrap(), 0);
    assert_eq!(rows(&hub, &peer).len(), stored);

    let master = peer.get_paramset(1, ParameterSetType::Config, 0, None).unwrap();
    assert_eq!(master.get("ON_LEVEL"), Some(&Variable::Integer(120)));
}

#[test]
fn put_paramset_stops_at_first_failed_member() {
    let hub = hub();
    let peer = paired(&hub, 0x10, "DIM0000001");
    hub.store.fail_on(FailPoint::SaveParameter(Some("RAMP_TIME".into())));

    let err = peer
        .put_paramset(
            1,
            ParameterSetType::Config,
            0,
            None,
            &members(&[
                ("ON_LEVEL", Variable::Integer(100)),
                ("RAMP_TIME", Variable::Float(2.0)),
                ("STATUS_DELAY", Variable::Integer(30)),
            ]),
        )
        .unwrap_err();
    assert_eq!(err.code(), -32501);

    let master = peer.get_paramset(1, ParameterSetType::Config, 0, None).unwrap();
    assert_eq!(master.get("ON_LEVEL"), Some(&Variable::Integer(100)));
    assert_eq!(master.get("RAMP_TIME"), Some(&Variable::Float(0.5)));
    assert_eq!(master.get("STATUS_DELAY"), Some(&Variable::Integer(0)));

    let rows = rows(&hub, &peer);
    assert_eq!(row(&rows, "ON_LEVEL").value, 100_i32.to_be_bytes().to_vec());
    assert_eq!(row(&rows, "STATUS_DELAY").value, 0_i32.to_be_bytes().to_vec());
}

#[test]
fn relative_updates_and_error_codes() {
    let hub = hub();
    let peer = paired(&hub, 0x10, "DIM0000001");
    peer.set_value(1, "LEVEL", Variable::Float(0.5)).unwrap();
    peer.set_value(1, "LEVEL", Variable::from("+=0.25")).unwrap();
    assert_eq!(peer.get_value(1, "LEVEL").unwrap(), Variable::Float(0.75));
    peer.set_value(1, "LEVEL", Variable::from("+=0.5")).unwrap();
    assert_eq!(peer.get_value(1, "LEVEL").unwrap(), Variable::Float(1.0));

    let code = |result: Result<(), hearth_core::CoreError>| result.unwrap_err().code();
    assert_eq!(code(peer.set_value(1, "LEVEL", Variable::from("/=0"))), -1);
    assert_eq!(code(peer.set_value(1, "WORKING", Variable::Bool(true))), -6);
    assert_eq!(code(peer.set_value(9, "LEVEL", Variable::Float(0.1))), -2);
    assert_eq!(code(peer.set_value(1, "NOPE", Variable::Float(0.1))), -5);
    assert_eq!(peer.get_value(9, "LEVEL").unwrap_err().code(), -2);
    assert_eq!(
        peer.get_paramset(1, ParameterSetType::Link, 0, None)
            .unwrap_err()
            .code(),
        -2
    );
}

#[test]
fn relative_updates_saturate_at_integer_bounds() {
    let hub = hub();
    let description = Arc::new(
        DeviceDescription::new(0x68, "COUNTER-1").with_function(
            Function::new(1, "COUNTER").with_config(
                Parameter::new("OFFSET", LogicalType::integer(i32::MIN, i32::MAX))
                    .with_default(i32::MIN),
            ),
        ),
    );
    let peer = hub.device.create_peer(
        PeerInit {
            id: 0,
            parent_id: 0,
            address: 0x30,
            serial: "CNT0000001".into(),
            device_type: 0x68,
            description,
        },
        None,
    );
    peer.initialize_central_config().unwrap();
    peer.save(true, false, false).unwrap();

    let offset = |peer: &Peer| {
        peer.get_paramset(1, ParameterSetType::Config, 0, None)
            .unwrap()
            .get("OFFSET")
            .cloned()
    };
    let put = |text: &str| {
        peer.put_paramset(
            1,
            ParameterSetType::Config,
            0,
            None,
            &members(&[("OFFSET", Variable::from(text))]),
        )
    };

    put("/=-1").unwrap();
    assert_eq!(offset(&peer), Some(Variable::Integer(i32::MAX)));
    put("+=1").unwrap();
    assert_eq!(offset(&peer), Some(Variable::Integer(i32::MAX)));
    put("*=-1").unwrap();
    assert_eq!(offset(&peer), Some(Variable::Integer(-i32::MAX)));
    put("-=10").unwrap();
    assert_eq!(offset(&peer), Some(Variable::Integer(i32::MIN)));
    put("*=2").unwrap();
    assert_eq!(offset(&peer), Some(Variable::Integer(i32::MIN)));
    assert_eq!(put("/=0").unwrap_err().code(), -1);
}

#[test]
fn changed_values_reach_rpc_listeners_once() {
    let hub = hub();
    let events = Arc::new(Events::default());
    hub.context.subscribe("recorder", events.clone());
    let peer = paired(&hub, 0x10, "DIM0000001");

    peer.set_value(1, "LEVEL", Variable::Float(0.3)).unwrap();
    peer.set_value(1, "LEVEL", Variable::Float(0.3)).unwrap();

    let recorded = events.0.lock();
    let levels: Vec<_> = recorded
        .iter()
        .filter(|event| event.value("LEVEL").is_some())
        .collect();
    assert_eq!(levels.len(), 1);
    assert_eq!(levels[0].address, "DIM0000001:1");
    assert_eq!(levels[0].peer_id, peer.id());
}

struct Explodes;

impl RpcListener for Explodes {
    fn on_event(&self, _event: &RpcEvent) {
        panic!("listener failure");
    }
}

#[test]
fn panicking_listener_does_not_interrupt_value_updates() {
    let hub = hub();
    hub.context.subscribe("explodes", Arc::new(Explodes));
    let events = Arc::new(Events::default());
    hub.context.subscribe("recorder", events.clone());
    let peer = paired(&hub, 0x10, "DIM0000001");

    peer.set_value(1, "LEVEL", Variable::Float(0.6)).unwrap();
    peer.put_paramset(
        1,
        ParameterSetType::Values,
        0,
        None,
        &members(&[("LEVEL", Variable::Float(0.2))]),
    )
    .unwrap();

    assert_eq!(peer.get_value(1, "LEVEL").unwrap(), Variable::Float(0.2));
    assert_eq!(
        row(&rows(&hub, &peer), "LEVEL").value,
        0.2_f64.to_be_bytes().to_vec()
    );
    let levels = events
        .0
        .lock()
        .iter()
        .filter(|event| event.value("LEVEL").is_some())
        .count();
    assert_eq!(levels, 2);
}

#[test]
fn orphaned_parameter_rows_are_deleted_on_load() {
    let hub = hub();
    let peer = paired(&hub, 0x10, "DIM0000001");
    let id = peer.id();
    hub.store
        .save_peer_parameter(&ParameterRow {
            row_id: None,
            peer_id: id,
            kind: ParameterSetType::Config,
            channel: 1,
            remote_address: 0,
            remote_channel: None,
            name: "OBSOLETE".into(),
            value: vec![1],
        })
        .unwrap();
    hub.store.clear_journal();

    let reloaded = Peer::new(
        PeerInit {
            id,
            parent_id: hub.device.id(),
            address: 0x10,
            serial: "DIM0000001".into(),
            device_type: 0x67,
            description: dimmer(),
        },
        hub.device.peer_owner(),
        None,
    );
    reloaded.load().unwrap();

    assert!(rows(&hub, &reloaded).iter().all(|row| row.name != "OBSOLETE"));
    assert!(
        hub.store
            .journal()
            .iter()
            .any(|op| matches!(op, StoreOp::ParameterDeleted { peer_id, .. } if *peer_id == id))
    );
}

#[test]
fn deleted_peer_rejects_access() {
    let hub = hub();
    let peer = paired(&hub, 0x10, "DIM0000001");
    peer.delete_from_database().unwrap();
    let err = peer.set_value(1, "LEVEL", Variable::Float(0.2)).unwrap_err();
    assert_eq!(err.code(), -32500);
    assert!(hub.store.peer(peer.id()).is_none());
}

// ── Service messages ────────────────────────────────────────────────

#[test]
fn cleared_service_flag_removes_its_row() {
    let hub = hub();
    let peer = paired(&hub, 0x10, "DIM0000001");

    peer.set_value(0, "CONFIG_PENDING", Variable::Bool(true)).unwrap();
    assert!(peer.service_messages().config_pending());
    assert!(!peer.report_value_usage().unwrap());
    assert_eq!(hub.store.summary().service_messages, 1);
    assert_eq!(peer.get_value(0, "CONFIG_PENDING").unwrap(), Variable::Bool(true));
    let listed = peer.get_service_messages(false).unwrap();
    assert_eq!(listed.as_array().map(<[Variable]>::len), Some(1));

    peer.set_value(0, "CONFIG_PENDING", Variable::Bool(false)).unwrap();
    assert_eq!(hub.store.summary().service_messages, 0);
    let listed = peer.get_service_messages(false).unwrap();
    assert_eq!(listed.as_array().map(<[Variable]>::len), Some(0));
    assert!(peer.report_value_usage().unwrap());
}

#[test]
fn service_flags_of_unsaved_peer_survive_first_save() {
    let hub = hub();
    let peer = unsaved(&hub, 0x10, "DIM0000001");
    peer.set_value(0, "LOWBAT", Variable::Bool(true)).unwrap();
    peer.set_value(0, "CONFIG_PENDING", Variable::Bool(true)).unwrap();
    assert!(peer.service_messages().lowbat());
    assert_eq!(hub.store.summary().service_messages, 0);

    peer.save(true, true, true).unwrap();
    assert_eq!(hub.store.summary().service_messages, 2);

    let reloaded = Peer::new(
        PeerInit {
            id: peer.id(),
            parent_id: hub.device.id(),
            address: 0x10,
            serial: "DIM0000001".into(),
            device_type: 0x67,
            description: dimmer(),
        },
        hub.device.peer_owner(),
        None,
    );
    reloaded.load().unwrap();
    assert!(reloaded.service_messages().lowbat());
    assert!(reloaded.service_messages().config_pending());

    reloaded.set_value(0, "LOWBAT", Variable::Bool(false)).unwrap();
    assert_eq!(hub.store.summary().service_messages, 1);
}

// ── Links ───────────────────────────────────────────────────────────

#[test]
fn link_to_unknown_remote_is_receiver_broken() {
    let hub = hub();
    let key = paired(&hub, 0x10, "DIM0000001");
    key.add_link(2, BasicPeerRef::new(0x99, 1)).unwrap();

    let links = key.get_link(Some(2), LinkFlags(0), false).unwrap();
    let links = links.as_array().unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].get("FLAGS"), Some(&Variable::Integer(LinkFlags::RECEIVER_BROKEN)));
    assert_eq!(links[0].get("RECEIVER"), Some(&Variable::from("@000099:1")));
    assert_eq!(links[0].get("SENDER"), Some(&Variable::from("DIM0000001:2")));
}

#[test]
fn links_known_on_both_ends_resolve_paramsets() {
    let hub = hub();
    let sender = paired(&hub, 0x10, "DIM0000001");
    let receiver = paired(&hub, 0x20, "DIM0000002");
    sender.add_link(2, BasicPeerRef::new(0x20, 1)).unwrap();
    receiver.add_link(1, BasicPeerRef::new(0x10, 2)).unwrap();

    let flags = LinkFlags(LinkFlags::SENDER_PARAMSET | LinkFlags::RECEIVER_PARAMSET);
    let links = sender.get_link(Some(2), flags, false).unwrap();
    let link = &links.as_array().unwrap()[0];
    assert_eq!(link.get("FLAGS"), Some(&Variable::Integer(0)));
    assert_eq!(link.get("RECEIVER"), Some(&Variable::from("DIM0000002:1")));
    assert_eq!(link.get("RECEIVER_ID"), Some(&Variable::from(receiver.id())));
    assert_eq!(
        link.get("RECEIVER_PARAMSET").and_then(|p| p.get("SHORT_ON_LEVEL")),
        Some(&Variable::Float(1.0))
    );
    assert_eq!(
        link.get("SENDER_PARAMSET").and_then(|p| p.get("LONG_PRESS_TIME")),
        Some(&Variable::Float(0.4))
    );

    let learned = sender
        .get_link_peer(2, PeerLookup::Address(0x20), Some(1))
        .unwrap();
    assert_eq!(learned.id, receiver.id());
    assert_eq!(learned.serial, "DIM0000002");

    let duplicates = receiver.get_link(Some(1), LinkFlags(0), true).unwrap();
    assert_eq!(duplicates.as_array().map(<[Variable]>::len), Some(0));
}

#[test]
fn link_paramset_and_info_follow_the_link() {
    let hub = hub();
    let sender = paired(&hub, 0x10, "DIM0000001");
    let receiver = paired(&hub, 0x20, "DIM0000002");
    sender.add_link(2, BasicPeerRef::new(0x20, 1)).unwrap();

    sender
        .put_paramset(
            2,
            ParameterSetType::Link,
            receiver.id(),
            Some(1),
            &members(&[("LONG_PRESS_TIME", Variable::Float(1.2))]),
        )
        .unwrap();
    let paramset = sender
        .get_paramset(2, ParameterSetType::Link, receiver.id(), Some(1))
        .unwrap();
    assert_eq!(paramset.get("LONG_PRESS_TIME"), Some(&Variable::Float(1.2)));

    sender
        .set_link_info(2, receiver.id(), Some(1), "Hall", "stairs switch")
        .unwrap();
    let info = sender.get_link_info(2, receiver.id(), Some(1)).unwrap();
    assert_eq!(info.get("NAME"), Some(&Variable::from("Hall")));
    assert_eq!(info.get("DESCRIPTION"), Some(&Variable::from("stairs switch")));

    let peers = sender.get_link_peers(Some(2), false).unwrap();
    assert_eq!(peers, Variable::Array(vec![Variable::from("DIM0000002:1")]));

    let before = rows(&hub, &sender).len();
    assert!(sender.remove_link(2, 0x20, 1).unwrap());
    assert_eq!(rows(&hub, &sender).len(), before - 1);
    assert_eq!(
        sender
            .get_paramset(2, ParameterSetType::Link, receiver.id(), Some(1))
            .unwrap_err()
            .code(),
        -3
    );
    assert!(!sender.remove_link(2, 0x20, 1).unwrap());
}

#[test]
fn peer_without_central_features_rejects_link_operations() {
    let hub = hub();
    let peer = paired(&hub, 0x10, "DIM0000001");
    peer.add_link(2, BasicPeerRef::new(0x20, 1)).unwrap();
    assert!(peer.has_central_features());

    peer.set_central_features(false);
    let err = peer.get_link(Some(2), LinkFlags(0), false).unwrap_err();
    assert!(matches!(err, hearth_core::CoreError::NotCentral { .. }));
    assert_eq!(err.code(), -2);
    assert_eq!(peer.get_link_peers(Some(2), false).unwrap_err().code(), -2);
    assert_eq!(peer.get_link_info(2, 0, Some(1)).unwrap_err().code(), -2);

    peer.set_central_features(true);
    assert_eq!(
        peer.get_link(Some(2), LinkFlags(0), false)
            .unwrap()
            .as_array()
            .map(<[Variable]>::len),
        Some(1)
    );
}
