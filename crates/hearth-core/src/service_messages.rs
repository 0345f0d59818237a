// ── Service messages ──
//
// Per-peer health state: UNREACH, STICKY_UNREACH, CONFIG_PENDING, LOWBAT
// plus open-ended per-channel error codes. Every transition is computed
// under the state lock as a list of effects; the effects (persistence,
// parameter mirroring, RPC events) run after the lock is released.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use strum::{Display, EnumString, IntoStaticStr};
use tracing::{error, info};

use crate::error::CoreError;
use crate::lifecycle::LifecyclePhase;
use crate::sink::RpcEvent;
use crate::storage::{ServiceMessageRow, ServiceMessageValue};
use crate::variable::Variable;

/// Reserved channel-0 keys handled by [`ServiceMessages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceFlag {
    Unreach,
    StickyUnreach,
    ConfigPending,
    #[strum(to_string = "LOWBAT", serialize = "LOWBAT_REPORTING")]
    Lowbat,
}

impl ServiceFlag {
    pub const ALL: [Self; 4] = [
        Self::Unreach,
        Self::StickyUnreach,
        Self::ConfigPending,
        Self::Lowbat,
    ];

    /// Storage index of the flag's row.
    pub fn index(self) -> u32 {
        match self {
            Self::Unreach => 0,
            Self::StickyUnreach => 1,
            Self::ConfigPending => 2,
            Self::Lowbat => 3,
        }
    }

    fn from_index(index: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|flag| flag.index() == index)
    }

    pub fn key(self) -> &'static str {
        self.into()
    }
}

/// Callbacks a [`ServiceMessages`] instance needs from its owning peer.
pub trait ServiceEventSink: Send + Sync {
    fn phase(&self) -> LifecyclePhase;
    fn on_config_pending(&self, pending: bool);
    fn on_rpc_event(&self, event: RpcEvent);
    /// Mirror a service value into the peer's channel parameters.
    fn on_save_parameter(&self, name: &str, channel: u32, data: &[u8]);
    fn on_get_service_messages(&self) -> Result<Vec<ServiceMessageRow>, CoreError>;
    fn on_save_service_message(&self, row: &ServiceMessageRow) -> Result<u64, CoreError>;
    fn on_delete_service_message(&self, row_id: u64) -> Result<(), CoreError>;
    fn on_enqueue_pending_queues(&self);
}

#[derive(Debug)]
struct State {
    unreach: bool,
    sticky_unreach: bool,
    config_pending: bool,
    config_pending_set_time: DateTime<Utc>,
    lowbat: bool,
    resend_counter: u32,
    errors: BTreeMap<u32, BTreeMap<String, u8>>,
    row_ids: HashMap<u32, u64>,
}

impl State {
    fn flag(&self, flag: ServiceFlag) -> bool {
        match flag {
            ServiceFlag::Unreach => self.unreach,
            ServiceFlag::StickyUnreach => self.sticky_unreach,
            ServiceFlag::ConfigPending => self.config_pending,
            ServiceFlag::Lowbat => self.lowbat,
        }
    }

    fn flag_mut(&mut self, flag: ServiceFlag) -> &mut bool {
        match flag {
            ServiceFlag::Unreach => &mut self.unreach,
            ServiceFlag::StickyUnreach => &mut self.sticky_unreach,
            ServiceFlag::ConfigPending => &mut self.config_pending,
            ServiceFlag::Lowbat => &mut self.lowbat,
        }
    }
}

enum Effect {
    Persist {
        index: u32,
        value: ServiceMessageValue,
    },
    SaveParameter {
        name: String,
        channel: u32,
        value: u8,
    },
    Event(RpcEvent),
    ConfigPending(bool),
    EnqueuePending,
}

/// Health and diagnostics state of one peer.
pub struct ServiceMessages {
    peer_id: AtomicU64,
    serial: Mutex<String>,
    sink: Weak<dyn ServiceEventSink>,
    resend_limit: u32,
    disposing: AtomicBool,
    state: Mutex<State>,
}

impl ServiceMessages {
    pub fn new(
        peer_id: u64,
        serial: impl Into<String>,
        sink: Weak<dyn ServiceEventSink>,
        resend_limit: u32,
    ) -> Self {
        Self {
            peer_id: AtomicU64::new(peer_id),
            serial: Mutex::new(serial.into()),
            sink,
            resend_limit,
            disposing: AtomicBool::new(false),
            state: Mutex::new(State {
                unreach: false,
                sticky_unreach: false,
                config_pending: false,
                config_pending_set_time: Utc::now(),
                lowbat: false,
                resend_counter: 0,
                errors: BTreeMap::new(),
                row_ids: HashMap::new(),
            }),
        }
    }

    pub fn set_peer_id(&self, peer_id: u64) {
        self.peer_id.store(peer_id, Ordering::Release);
    }

    pub fn set_peer_serial(&self, serial: impl Into<String>) {
        *self.serial.lock() = serial.into();
    }

    pub fn dispose(&self) {
        self.disposing.store(true, Ordering::Release);
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn unreach(&self) -> bool {
        self.state.lock().unreach
    }

    pub fn sticky_unreach(&self) -> bool {
        self.state.lock().sticky_unreach
    }

    pub fn config_pending(&self) -> bool {
        self.state.lock().config_pending
    }

    pub fn config_pending_set_time(&self) -> DateTime<Utc> {
        self.state.lock().config_pending_set_time
    }

    pub fn lowbat(&self) -> bool {
        self.state.lock().lowbat
    }

    pub fn resend_counter(&self) -> u32 {
        self.state.lock().resend_counter
    }

    /// Current value of a channel error, 0 when unset.
    pub fn error(&self, channel: u32, id: &str) -> u8 {
        self.state
            .lock()
            .errors
            .get(&channel)
            .and_then(|errors| errors.get(id))
            .copied()
            .unwrap_or(0)
    }

    // ── Loading ──────────────────────────────────────────────────────

    /// Restore state from stored rows. UNREACH always starts out false.
    pub fn load(&self) -> Result<(), CoreError> {
        let sink = self.sink()?;
        let rows = sink.on_get_service_messages()?;

        let (stale_unreach, mirror) = {
            let mut state = self.state.lock();
            for row in rows {
                let Some(row_id) = row.row_id else { continue };
                state.row_ids.insert(row.index, row_id);
                match row.value {
                    ServiceMessageValue::Flag { value } => {
                        let flag = ServiceFlag::from_index(row.index)
                            .filter(|flag| *flag != ServiceFlag::Unreach);
                        if let Some(flag) = flag {
                            *state.flag_mut(flag) = value;
                        }
                    }
                    ServiceMessageValue::ChannelError { channel, id, value } => {
                        if id.is_empty() || value == 0 {
                            continue;
                        }
                        state.errors.entry(channel).or_default().insert(id, value);
                    }
                }
            }
            state.unreach = false;
            let stale = state.row_ids.remove(&ServiceFlag::Unreach.index());
            let mirror: Vec<(ServiceFlag, bool)> = ServiceFlag::ALL
                .into_iter()
                .map(|flag| (flag, state.flag(flag)))
                .collect();
            (stale, mirror)
        };

        if let Some(row_id) = stale_unreach {
            if let Err(e) = sink.on_delete_service_message(row_id) {
                error!(peer_id = self.peer_id(), error = %e, "cannot delete stale unreach row");
            }
        }
        for (flag, value) in mirror {
            sink.on_save_parameter(flag.key(), 0, &[u8::from(value)]);
        }
        Ok(())
    }

    /// Write a row for every active flag and channel error.
    ///
    /// Called once the peer has an id; transitions made before that only
    /// changed the in-memory state.
    pub fn save_all(&self) {
        if self.peer_id() == 0 {
            return;
        }
        let Some(sink) = self.sink.upgrade() else {
            return;
        };
        let rows: Vec<(u32, ServiceMessageValue)> = {
            let state = self.state.lock();
            let flags = ServiceFlag::ALL
                .into_iter()
                .filter(|flag| state.flag(*flag))
                .map(|flag| (flag.index(), ServiceMessageValue::Flag { value: true }));
            let errors = state.errors.iter().flat_map(|(channel, errors)| {
                errors
                    .iter()
                    .filter(|(_, value)| **value > 0)
                    .map(|(id, value)| {
                        (
                            error_index(id),
                            ServiceMessageValue::ChannelError {
                                channel: *channel,
                                id: id.clone(),
                                value: *value,
                            },
                        )
                    })
            });
            flags.chain(errors).collect()
        };
        for (index, value) in rows {
            self.persist(&*sink, index, value);
        }
    }

    // ── Generic setters ──────────────────────────────────────────────

    /// Set a reserved flag or clear a channel error by id.
    ///
    /// Returns `true` when `id` was handled here. `LOWBAT_REPORTING` is an
    /// alias of `LOWBAT`. Clearing (`false`) an id that matches channel
    /// errors resets every channel carrying it.
    pub fn set(&self, id: &str, value: bool) -> bool {
        if self.disposing.load(Ordering::Acquire) {
            return false;
        }

        if let Ok(flag) = id.parse::<ServiceFlag>() {
            match flag {
                ServiceFlag::ConfigPending => self.set_config_pending(value),
                ServiceFlag::Unreach | ServiceFlag::StickyUnreach if value && !self.running() => {}
                _ => {
                    let effects = {
                        let mut state = self.state.lock();
                        if state.flag(flag) == value {
                            return true;
                        }
                        *state.flag_mut(flag) = value;
                        self.flag_effects(&[(flag, value)])
                    };
                    self.apply(effects);
                }
            }
            return true;
        }

        if value {
            return false;
        }

        let effects = {
            let mut state = self.state.lock();
            let channels: Vec<u32> = state
                .errors
                .iter_mut()
                .filter_map(|(channel, errors)| errors.remove(id).map(|_| *channel))
                .collect();
            state.errors.retain(|_, errors| !errors.is_empty());
            channels
                .into_iter()
                .flat_map(|channel| self.error_effects(channel, id, 0))
                .collect::<Vec<_>>()
        };
        let handled = !effects.is_empty();
        self.apply(effects);
        handled
    }

    /// Set a per-channel error code; 0 clears it. Returns `true` on change.
    pub fn set_error(&self, id: &str, value: u8, channel: u32) -> bool {
        if self.disposing.load(Ordering::Acquire) {
            return false;
        }
        let effects = {
            let mut state = self.state.lock();
            let current = state
                .errors
                .get(&channel)
                .and_then(|errors| errors.get(id))
                .copied()
                .unwrap_or(0);
            if current == value {
                return false;
            }
            if value == 0 {
                if let Some(errors) = state.errors.get_mut(&channel) {
                    errors.remove(id);
                    if errors.is_empty() {
                        state.errors.remove(&channel);
                    }
                }
            } else {
                state
                    .errors
                    .entry(channel)
                    .or_default()
                    .insert(id.to_owned(), value);
            }
            self.error_effects(channel, id, value)
        };
        self.apply(effects);
        true
    }

    // ── Reachability ─────────────────────────────────────────────────

    /// Mark the peer reachable or unreachable.
    ///
    /// With `requeue`, the first `resend_limit` unreachable reports only ask
    /// the peer to resend its pending queues.
    pub fn set_unreach(&self, value: bool, requeue: bool) {
        if self.disposing.load(Ordering::Acquire) || (value && !self.running()) {
            return;
        }
        let effects = {
            let mut state = self.state.lock();
            if value == state.unreach {
                if !value {
                    state.resend_counter = 0;
                }
                return;
            }
            if value && requeue && state.resend_counter < self.resend_limit {
                state.resend_counter += 1;
                vec![Effect::EnqueuePending]
            } else {
                state.resend_counter = 0;
                state.unreach = value;
                let mut changed = vec![(ServiceFlag::Unreach, value)];
                if value && !state.sticky_unreach {
                    state.sticky_unreach = true;
                    changed.push((ServiceFlag::StickyUnreach, true));
                }
                self.flag_effects(&changed)
            }
        };
        if value && effects.iter().any(|e| matches!(e, Effect::Event(_))) {
            info!(peer_id = self.peer_id(), "peer is unreachable");
        }
        self.apply(effects);
    }

    /// Declare the peer unreachable when nothing was heard within `cyclic_timeout`.
    pub fn check_unreach(&self, cyclic_timeout: TimeDelta, last_packet_received: DateTime<Utc>) {
        self.check_unreach_at(cyclic_timeout, last_packet_received, Utc::now());
    }

    pub fn check_unreach_at(
        &self,
        cyclic_timeout: TimeDelta,
        last_packet_received: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        if self.disposing.load(Ordering::Acquire) || !self.running() {
            return;
        }
        if cyclic_timeout <= TimeDelta::zero() || now - last_packet_received <= cyclic_timeout {
            return;
        }
        let effects = {
            let mut state = self.state.lock();
            if state.unreach {
                return;
            }
            state.unreach = true;
            let mut changed = vec![(ServiceFlag::Unreach, true)];
            if !state.sticky_unreach {
                state.sticky_unreach = true;
                changed.push((ServiceFlag::StickyUnreach, true));
            }
            self.flag_effects(&changed)
        };
        info!(peer_id = self.peer_id(), "peer is unreachable, cyclic timeout exceeded");
        self.apply(effects);
    }

    /// Clear UNREACH after the peer was heard from again. STICKY_UNREACH stays.
    pub fn end_unreach(&self) {
        if self.disposing.load(Ordering::Acquire) {
            return;
        }
        let effects = {
            let mut state = self.state.lock();
            if !state.unreach {
                return;
            }
            state.unreach = false;
            state.resend_counter = 0;
            self.flag_effects(&[(ServiceFlag::Unreach, false)])
        };
        self.apply(effects);
    }

    // ── Config pending ───────────────────────────────────────────────

    pub fn set_config_pending(&self, value: bool) {
        if self.disposing.load(Ordering::Acquire) {
            return;
        }
        let effects = {
            let mut state = self.state.lock();
            if state.config_pending == value {
                return;
            }
            state.config_pending = value;
            if value {
                state.config_pending_set_time = Utc::now();
            }
            let mut effects = self.flag_effects(&[(ServiceFlag::ConfigPending, value)]);
            effects.push(Effect::ConfigPending(value));
            effects
        };
        self.apply(effects);
    }

    pub fn reset_config_pending_set_time(&self) {
        self.state.lock().config_pending_set_time = Utc::now();
    }

    // ── Views ────────────────────────────────────────────────────────

    /// Active messages as `[address, key, value]` or, with `return_id`,
    /// `[peer_id, channel, key, value]` arrays.
    pub fn get(&self, return_id: bool) -> Variable {
        let peer_id = self.peer_id();
        if return_id && peer_id == 0 {
            return Variable::Array(Vec::new());
        }
        let serial = self.serial.lock().clone();
        let state = self.state.lock();

        let entry = |channel: u32, key: &str, value: Variable| {
            let mut items = Vec::with_capacity(4);
            if return_id {
                items.push(Variable::from(peer_id));
                items.push(Variable::from(i64::from(channel)));
            } else {
                items.push(Variable::from(format!("{serial}:{channel}")));
            }
            items.push(Variable::from(key));
            items.push(value);
            Variable::Array(items)
        };

        let mut messages: Vec<Variable> = ServiceFlag::ALL
            .into_iter()
            .filter(|flag| state.flag(*flag))
            .map(|flag| entry(0, flag.key(), Variable::Bool(true)))
            .collect();
        for (channel, errors) in &state.errors {
            for (id, value) in errors {
                if *value == 0 {
                    continue;
                }
                messages.push(entry(*channel, id, Variable::from(*value)));
            }
        }
        Variable::Array(messages)
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn peer_id(&self) -> u64 {
        self.peer_id.load(Ordering::Acquire)
    }

    fn sink(&self) -> Result<Arc<dyn ServiceEventSink>, CoreError> {
        self.sink.upgrade().ok_or_else(|| CoreError::Detached {
            entity: format!("service messages of peer {}", self.peer_id()),
        })
    }

    fn running(&self) -> bool {
        self.sink
            .upgrade()
            .is_none_or(|sink| sink.phase() == LifecyclePhase::Running)
    }

    fn event(&self, channel: u32) -> RpcEvent {
        RpcEvent::new(self.peer_id(), channel, &self.serial.lock())
    }

    fn flag_effects(&self, changed: &[(ServiceFlag, bool)]) -> Vec<Effect> {
        let mut effects = Vec::with_capacity(changed.len() * 2 + 1);
        let mut event = self.event(0);
        for (flag, value) in changed {
            effects.push(Effect::Persist {
                index: flag.index(),
                value: ServiceMessageValue::Flag { value: *value },
            });
            effects.push(Effect::SaveParameter {
                name: flag.key().to_owned(),
                channel: 0,
                value: u8::from(*value),
            });
            event = event.with(flag.key(), *value);
        }
        effects.push(Effect::Event(event));
        effects
    }

    fn error_effects(&self, channel: u32, id: &str, value: u8) -> Vec<Effect> {
        vec![
            Effect::Persist {
                index: error_index(id),
                value: ServiceMessageValue::ChannelError {
                    channel,
                    id: id.to_owned(),
                    value,
                },
            },
            Effect::SaveParameter {
                name: id.to_owned(),
                channel,
                value,
            },
            Effect::Event(self.event(channel).with(id, value)),
        ]
    }

    fn apply(&self, effects: Vec<Effect>) {
        let Some(sink) = self.sink.upgrade() else {
            return;
        };
        for effect in effects {
            match effect {
                Effect::Persist { index, value } => self.persist(&*sink, index, value),
                Effect::SaveParameter {
                    name,
                    channel,
                    value,
                } => sink.on_save_parameter(&name, channel, &[value]),
                Effect::Event(event) => {
                    if event.peer_id != 0 {
                        sink.on_rpc_event(event);
                    }
                }
                Effect::ConfigPending(pending) => sink.on_config_pending(pending),
                Effect::EnqueuePending => sink.on_enqueue_pending_queues(),
            }
        }
    }

    /// Upsert the row while the value is set, delete it once it is cleared.
    fn persist(&self, sink: &dyn ServiceEventSink, index: u32, value: ServiceMessageValue) {
        let peer_id = self.peer_id();
        let active = match &value {
            ServiceMessageValue::Flag { value } => *value,
            ServiceMessageValue::ChannelError { value, .. } => *value > 0,
        };

        if !active {
            let row_id = self.state.lock().row_ids.remove(&index);
            if let Some(row_id) = row_id {
                if let Err(e) = sink.on_delete_service_message(row_id) {
                    error!(peer_id, index, error = %e, "cannot delete service message");
                }
            }
            return;
        }

        let row_id = self.state.lock().row_ids.get(&index).copied();
        if row_id.is_none() && peer_id == 0 {
            return;
        }
        let row = ServiceMessageRow {
            row_id,
            peer_id,
            index,
            value,
        };
        match sink.on_save_service_message(&row) {
            Ok(row_id) => {
                self.state.lock().row_ids.insert(index, row_id);
            }
            Err(e) => error!(peer_id, index, error = %e, "cannot save service message"),
        }
    }
}

/// Storage index of a channel error: 1000 plus the byte sum of its id.
pub fn error_index(id: &str) -> u32 {
    id.bytes().fold(1000, |index, byte| index + u32::from(byte))
}

impl std::fmt::Debug for ServiceMessages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMessages")
            .field("peer_id", &self.peer_id())
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}
