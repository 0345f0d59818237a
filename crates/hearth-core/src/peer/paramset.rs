// ── Paramsets ──
//
// In-memory config, values and link parameters of one peer, keyed by
// channel (and remote endpoint for links). Raw data is the committed wire
// encoding; the parameter metadata decodes it on read. Rows are created
// lazily: a parameter gets its row id on its first successful write.

use std::collections::BTreeMap;
use std::iter;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use super::Peer;
use crate::description::{LogicalType, Parameter, ParameterSetType};
use crate::error::CoreError;
use crate::service_messages::ServiceFlag;
use crate::sink::{EventSink, RpcEvent};
use crate::storage::ParameterRow;
use crate::variable::{Variable, parse_number};

/// Remote endpoint that scopes a link paramset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkKey {
    pub remote_address: i32,
    pub remote_channel: u32,
}

/// One parameter value of a peer.
#[derive(Debug, Clone)]
pub struct RpcConfigurationParameter {
    /// `None` until the first successful write to storage.
    pub database_row_id: Option<u64>,
    pub parameter: Arc<Parameter>,
    pub raw_data: Vec<u8>,
}

pub(crate) type ChannelParameters = BTreeMap<String, RpcConfigurationParameter>;

/// Config, values and link parameters of one peer.
#[derive(Debug, Default)]
pub struct Paramsets {
    pub config: BTreeMap<u32, ChannelParameters>,
    pub values: BTreeMap<u32, ChannelParameters>,
    pub links: BTreeMap<u32, BTreeMap<LinkKey, ChannelParameters>>,
}

impl Paramsets {
    fn group(
        &self,
        kind: ParameterSetType,
        channel: u32,
        link: Option<LinkKey>,
    ) -> Option<&ChannelParameters> {
        match (kind, link) {
            (ParameterSetType::Config, _) => self.config.get(&channel),
            (ParameterSetType::Values, _) => self.values.get(&channel),
            (ParameterSetType::Link, Some(key)) => self.links.get(&channel)?.get(&key),
            _ => None,
        }
    }

    fn group_mut(
        &mut self,
        kind: ParameterSetType,
        channel: u32,
        link: Option<LinkKey>,
    ) -> Option<&mut ChannelParameters> {
        match (kind, link) {
            (ParameterSetType::Config, _) => self.config.get_mut(&channel),
            (ParameterSetType::Values, _) => self.values.get_mut(&channel),
            (ParameterSetType::Link, Some(key)) => self.links.get_mut(&channel)?.get_mut(&key),
            _ => None,
        }
    }

    fn group_or_insert(
        &mut self,
        kind: ParameterSetType,
        channel: u32,
        link: Option<LinkKey>,
    ) -> Option<&mut ChannelParameters> {
        match (kind, link) {
            (ParameterSetType::Config, _) => Some(self.config.entry(channel).or_default()),
            (ParameterSetType::Values, _) => Some(self.values.entry(channel).or_default()),
            (ParameterSetType::Link, Some(key)) => {
                Some(self.links.entry(channel).or_default().entry(key).or_default())
            }
            _ => None,
        }
    }

    /// Total number of parameters across every group.
    pub fn len(&self) -> usize {
        let flat = |groups: &BTreeMap<u32, ChannelParameters>| -> usize {
            groups.values().map(BTreeMap::len).sum()
        };
        flat(&self.config)
            + flat(&self.values)
            + self
                .links
                .values()
                .flat_map(BTreeMap::values)
                .map(BTreeMap::len)
                .sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slots(&self) -> Vec<Slot> {
        let plain = |kind: ParameterSetType, groups: &BTreeMap<u32, ChannelParameters>| {
            groups
                .iter()
                .flat_map(move |(channel, group)| {
                    group.keys().map(move |name| Slot::new(kind, *channel, None, name))
                })
                .collect::<Vec<_>>()
        };
        let mut slots = plain(ParameterSetType::Config, &self.config);
        slots.extend(plain(ParameterSetType::Values, &self.values));
        for (channel, remotes) in &self.links {
            for (key, group) in remotes {
                slots.extend(
                    group
                        .keys()
                        .map(|name| Slot::new(ParameterSetType::Link, *channel, Some(*key), name)),
                );
            }
        }
        slots
    }
}

/// Address of one parameter inside [`Paramsets`].
#[derive(Debug, Clone)]
pub(super) struct Slot {
    kind: ParameterSetType,
    channel: u32,
    link: Option<LinkKey>,
    name: String,
}

impl Slot {
    pub(super) fn new(
        kind: ParameterSetType,
        channel: u32,
        link: Option<LinkKey>,
        name: &str,
    ) -> Self {
        Self {
            kind,
            channel,
            link,
            name: name.to_owned(),
        }
    }
}

/// Insert `parameter` seeded with its default. `false` if already present.
pub(super) fn insert_default(group: &mut ChannelParameters, parameter: &Arc<Parameter>) -> bool {
    if group.contains_key(&parameter.id) {
        return false;
    }
    let raw_data = match parameter.default_packet() {
        Ok(raw) => raw,
        Err(e) => {
            warn!(parameter = %parameter.id, error = %e, "cannot encode default value");
            Vec::new()
        }
    };
    group.insert(
        parameter.id.clone(),
        RpcConfigurationParameter {
            database_row_id: None,
            parameter: Arc::clone(parameter),
            raw_data,
        },
    );
    true
}

/// Resolve `"+=5"`-style relative updates against the current value.
fn apply_relative(
    parameter: &Parameter,
    current: &[u8],
    value: &Variable,
) -> Result<Variable, CoreError> {
    let Variable::String(text) = value else {
        return Ok(value.clone());
    };
    if !parameter.is_numeric() {
        return Ok(value.clone());
    }
    let text = text.trim();
    let Some((op, operand)) = ["+=", "-=", "*=", "/="]
        .into_iter()
        .find_map(|op| text.strip_prefix(op).map(|rest| (op, rest.trim())))
    else {
        return Ok(value.clone());
    };
    let invalid = || CoreError::InvalidFactor {
        operand: operand.to_owned(),
    };
    let current = parameter.convert_from_packet(current);

    match parameter.logical {
        LogicalType::Float { .. } => {
            let operand: f64 = operand.parse().map_err(|_| invalid())?;
            let base = current.as_f64().unwrap_or_default();
            let result = match op {
                "+=" => base + operand,
                "-=" => base - operand,
                _ if operand == 0.0 => return Err(invalid()),
                "*=" => base * operand,
                _ => base / operand,
            };
            Ok(Variable::Float(result))
        }
        _ => {
            let operand = parse_number(operand).ok_or_else(invalid)?;
            let base = current.as_i32().unwrap_or_default();
            let result = match op {
                "+=" => base.saturating_add(operand),
                "-=" => base.saturating_sub(operand),
                _ if operand == 0 => return Err(invalid()),
                "*=" => base.saturating_mul(operand),
                _ => base.saturating_div(operand),
            };
            Ok(Variable::Integer(result))
        }
    }
}

impl Peer {
    // ── Seeding and loading ──────────────────────────────────────────

    /// Add every described config and value parameter that is missing,
    /// seeded from its default. Existing entries are never touched.
    /// Returns the number of parameters created.
    pub fn initialize_central_config(&self) -> Result<usize, CoreError> {
        self.ensure_active()?;
        let created = {
            let mut sets = self.paramsets.lock();
            let mut created = Vec::new();
            for (channel, function) in self.description.functions() {
                let config_groups =
                    iter::once(&function.config).chain(function.alternative_config.as_ref());
                for group in config_groups {
                    let target = sets.config.entry(channel).or_default();
                    for parameter in group.parameters() {
                        if insert_default(target, parameter) {
                            created.push(Slot::new(
                                ParameterSetType::Config,
                                channel,
                                None,
                                &parameter.id,
                            ));
                        }
                    }
                }
                let target = sets.values.entry(channel).or_default();
                for parameter in function.variables.parameters() {
                    if insert_default(target, parameter) {
                        created.push(Slot::new(
                            ParameterSetType::Values,
                            channel,
                            None,
                            &parameter.id,
                        ));
                    }
                }
            }
            created
        };

        if created.is_empty() || self.id() == 0 {
            return Ok(created.len());
        }
        self.with_savepoint(|| {
            for slot in &created {
                self.persist_slot(slot)?;
            }
            Ok(())
        })?;
        debug!(peer_id = self.id(), created = created.len(), "central config initialized");
        Ok(created.len())
    }

    /// Restore parameter rows. Rows without a matching description are
    /// deleted.
    pub fn load_config(&self) -> Result<(), CoreError> {
        let peer_id = self.id();
        if peer_id == 0 {
            return Ok(());
        }
        let rows = EventSink::get_peer_parameters(self, peer_id)?;
        let mut orphans = Vec::new();
        {
            let mut sets = self.paramsets.lock();
            for row in rows {
                let Some(row_id) = row.row_id else { continue };
                let parameter = self
                    .description
                    .function(row.channel)
                    .and_then(|function| function.parameter(row.kind, &row.name));
                let Some(parameter) = parameter else {
                    orphans.push((row_id, row.channel, row.name));
                    continue;
                };
                let link = (row.kind == ParameterSetType::Link).then(|| LinkKey {
                    remote_address: row.remote_address,
                    remote_channel: row.remote_channel.unwrap_or_default(),
                });
                let Some(group) = sets.group_or_insert(row.kind, row.channel, link) else {
                    orphans.push((row_id, row.channel, row.name));
                    continue;
                };
                group.insert(
                    row.name,
                    RpcConfigurationParameter {
                        database_row_id: Some(row_id),
                        parameter: Arc::clone(parameter),
                        raw_data: row.value,
                    },
                );
            }
        }

        for (row_id, channel, name) in orphans {
            error!(
                critical = true,
                peer_id,
                row_id,
                channel,
                parameter = %name,
                "stored parameter has no description, deleting row"
            );
            if let Err(e) = EventSink::delete_peer_parameter(self, peer_id, row_id) {
                error!(peer_id, row_id, error = %e, "cannot delete orphaned parameter row");
            }
        }
        Ok(())
    }

    /// Write every parameter, inserting rows that do not exist yet.
    pub fn save_central_config(&self) -> Result<(), CoreError> {
        if self.id() == 0 {
            return Ok(());
        }
        let slots = self.paramsets.lock().slots();
        self.with_savepoint(|| {
            for slot in &slots {
                if let Err(e) = self.persist_slot(slot) {
                    error!(peer_id = self.id(), parameter = %slot.name, error = %e, "cannot save parameter");
                }
            }
            Ok(())
        })
    }

    /// Insert (`row_id` is `None`) or update one parameter row.
    ///
    /// Returns the row id, or `None` while the peer has never been saved.
    #[allow(clippy::too_many_arguments)]
    pub fn save_parameter(
        &self,
        row_id: Option<u64>,
        kind: ParameterSetType,
        channel: u32,
        name: &str,
        value: &[u8],
        remote_address: i32,
        remote_channel: Option<u32>,
    ) -> Result<Option<u64>, CoreError> {
        let peer_id = self.id();
        if peer_id == 0 {
            return Ok(None);
        }
        let row = ParameterRow {
            row_id,
            peer_id,
            kind,
            channel,
            remote_address,
            remote_channel,
            name: name.to_owned(),
            value: value.to_vec(),
        };
        EventSink::save_peer_parameter(self, &row).map(Some)
    }

    // ── Paramset access ──────────────────────────────────────────────

    /// Readable members of one paramset as a struct.
    pub fn get_paramset(
        &self,
        channel: u32,
        kind: ParameterSetType,
        remote_id: u64,
        remote_channel: Option<u32>,
    ) -> Result<Variable, CoreError> {
        self.ensure_active()?;
        self.require_channel(channel)?;
        let link = self.resolve_link(channel, kind, remote_id, remote_channel)?;

        let sets = self.paramsets.lock();
        let Some(group) = sets.group(kind, channel, link) else {
            return match kind {
                ParameterSetType::Config | ParameterSetType::Values => Ok(Variable::new_struct()),
                _ => Err(CoreError::UnknownParamset {
                    paramset: kind.to_string(),
                }),
            };
        };
        Ok(Variable::Struct(
            group
                .iter()
                .filter(|(_, entry)| entry.parameter.readable)
                .map(|(name, entry)| {
                    (
                        name.clone(),
                        entry.parameter.convert_from_packet(&entry.raw_data),
                    )
                })
                .collect(),
        ))
    }

    /// Link paramset by remote endpoint, empty when the link is unknown.
    pub(super) fn link_paramset(&self, channel: u32, key: LinkKey) -> Variable {
        let sets = self.paramsets.lock();
        let Some(group) = sets.group(ParameterSetType::Link, channel, Some(key)) else {
            return Variable::new_struct();
        };
        Variable::Struct(
            group
                .iter()
                .filter(|(_, entry)| entry.parameter.readable)
                .map(|(name, entry)| {
                    (
                        name.clone(),
                        entry.parameter.convert_from_packet(&entry.raw_data),
                    )
                })
                .collect(),
        )
    }

    /// Write the members of one paramset in key order.
    ///
    /// Each member is persisted on its own; the first failure stops the
    /// call and leaves earlier members committed.
    pub fn put_paramset(
        &self,
        channel: u32,
        kind: ParameterSetType,
        remote_id: u64,
        remote_channel: Option<u32>,
        values: &BTreeMap<String, Variable>,
    ) -> Result<(), CoreError> {
        self.ensure_active()?;
        self.require_channel(channel)?;
        match kind {
            ParameterSetType::Values => {
                for (name, value) in values {
                    self.set_value(channel, name, value.clone())?;
                }
                Ok(())
            }
            ParameterSetType::Config | ParameterSetType::Link => {
                let link = self.resolve_link(channel, kind, remote_id, remote_channel)?;
                let mut written = Vec::new();
                let mut outcome = Ok(());
                for (name, value) in values {
                    match self.write_member(kind, channel, link, name, value) {
                        Ok(true) => written.push(name.clone()),
                        Ok(false) => {}
                        Err(e) => {
                            outcome = Err(e);
                            break;
                        }
                    }
                }
                if !written.is_empty() {
                    debug!(peer_id = self.id(), channel, %kind, written = written.len(), "paramset written");
                    if let Some(hooks) = &self.hooks {
                        hooks.paramset_written(self, channel, kind, &written);
                    }
                }
                outcome
            }
            ParameterSetType::None => Err(CoreError::UnknownParamset {
                paramset: kind.to_string(),
            }),
        }
    }

    // ── Single values ────────────────────────────────────────────────

    pub fn get_value(&self, channel: u32, key: &str) -> Result<Variable, CoreError> {
        self.ensure_active()?;
        let found = {
            let sets = self.paramsets.lock();
            sets.values
                .get(&channel)
                .and_then(|group| group.get(key))
                .map(|entry| (Arc::clone(&entry.parameter), entry.raw_data.clone()))
        };
        match found {
            Some((parameter, _)) if !parameter.readable => Err(CoreError::NotReadable {
                parameter: key.to_owned(),
            }),
            Some((parameter, raw)) => Ok(parameter.convert_from_packet(&raw)),
            None => {
                let flag = key.parse::<ServiceFlag>().ok().filter(|_| channel == 0);
                if let Some(flag) = flag {
                    let messages = &self.service_messages;
                    return Ok(Variable::Bool(match flag {
                        ServiceFlag::Unreach => messages.unreach(),
                        ServiceFlag::StickyUnreach => messages.sticky_unreach(),
                        ServiceFlag::ConfigPending => messages.config_pending(),
                        ServiceFlag::Lowbat => messages.lowbat(),
                    }));
                }
                self.require_channel(channel)?;
                Err(CoreError::UnknownParameter {
                    parameter: key.to_owned(),
                })
            }
        }
    }

    /// Write one value. Channel-0 service keys go to the service messages.
    ///
    /// The new value is kept in memory even when storage rejects it; an
    /// RPC event is emitted when the value changed.
    pub fn set_value(&self, channel: u32, key: &str, value: Variable) -> Result<(), CoreError> {
        self.ensure_active()?;
        if channel == 0 && key.parse::<ServiceFlag>().is_ok() {
            self.service_messages.set(key, value.as_bool());
            return Ok(());
        }
        self.require_channel(channel)?;

        let found = {
            let sets = self.paramsets.lock();
            sets.values
                .get(&channel)
                .and_then(|group| group.get(key))
                .map(|entry| {
                    (
                        Arc::clone(&entry.parameter),
                        entry.raw_data.clone(),
                        entry.database_row_id,
                    )
                })
        };
        let Some((parameter, current, row_id)) = found else {
            return Err(CoreError::UnknownParameter {
                parameter: key.to_owned(),
            });
        };
        if !parameter.writeable {
            return Err(CoreError::NotWriteable {
                parameter: key.to_owned(),
            });
        }

        let value = apply_relative(&parameter, &current, &value)?;
        let raw = parameter.convert_to_packet(&value)?;
        let decoded = parameter.convert_from_packet(&raw);
        let changed = raw != current || matches!(parameter.logical, LogicalType::Action);

        if changed {
            if let Some(entry) = self
                .paramsets
                .lock()
                .group_mut(ParameterSetType::Values, channel, None)
                .and_then(|group| group.get_mut(key))
            {
                entry.raw_data.clone_from(&raw);
            }
            match self.save_parameter(row_id, ParameterSetType::Values, channel, key, &raw, 0, None)
            {
                Ok(Some(saved)) => self.record_row_id(
                    &Slot::new(ParameterSetType::Values, channel, None, key),
                    saved,
                ),
                Ok(None) => {}
                Err(e) => {
                    error!(peer_id = self.id(), channel, parameter = key, error = %e, "cannot save value");
                }
            }
            let peer_id = self.id();
            if peer_id != 0 {
                self.rpc_event(RpcEvent::new(peer_id, channel, &self.serial).with(key, decoded.clone()));
            }
        }

        if let Some(hooks) = &self.hooks {
            hooks.value_set(self, channel, key, &decoded)?;
        }
        Ok(())
    }

    // ── Helpers shared with the other peer modules ───────────────────

    pub(super) fn require_channel(&self, channel: u32) -> Result<(), CoreError> {
        if self.description.function(channel).is_none() {
            return Err(CoreError::UnknownChannel { channel });
        }
        Ok(())
    }

    /// Store mirrored service data into an existing value parameter.
    pub(super) fn store_value_data(&self, channel: u32, name: &str, data: &[u8]) {
        let row_id = {
            let mut sets = self.paramsets.lock();
            let Some(entry) = sets
                .group_mut(ParameterSetType::Values, channel, None)
                .and_then(|group| group.get_mut(name))
            else {
                trace!(peer_id = self.id(), channel, parameter = name, "no value parameter to mirror into");
                return;
            };
            if entry.raw_data == data {
                return;
            }
            entry.raw_data = data.to_vec();
            entry.database_row_id
        };
        match self.save_parameter(row_id, ParameterSetType::Values, channel, name, data, 0, None) {
            Ok(Some(saved)) => {
                self.record_row_id(&Slot::new(ParameterSetType::Values, channel, None, name), saved);
            }
            Ok(None) => {}
            Err(e) => error!(peer_id = self.id(), channel, parameter = name, error = %e, "cannot save value"),
        }
    }

    /// Persist the current raw data of one slot.
    pub(super) fn persist_slot(&self, slot: &Slot) -> Result<(), CoreError> {
        let snapshot = {
            let sets = self.paramsets.lock();
            sets.group(slot.kind, slot.channel, slot.link)
                .and_then(|group| group.get(&slot.name))
                .map(|entry| (entry.database_row_id, entry.raw_data.clone()))
        };
        let Some((row_id, raw)) = snapshot else {
            return Ok(());
        };
        let saved = self.save_parameter(
            row_id,
            slot.kind,
            slot.channel,
            &slot.name,
            &raw,
            slot.link.map_or(0, |key| key.remote_address),
            slot.link.map(|key| key.remote_channel),
        )?;
        if let Some(saved) = saved {
            self.record_row_id(slot, saved);
        }
        Ok(())
    }

    /// Row ids of a removed link paramset.
    pub(super) fn take_link_paramset(&self, channel: u32, key: LinkKey) -> Vec<u64> {
        let mut sets = self.paramsets.lock();
        let Some(remotes) = sets.links.get_mut(&channel) else {
            return Vec::new();
        };
        let removed = remotes.remove(&key).unwrap_or_default();
        if remotes.is_empty() {
            sets.links.remove(&channel);
        }
        removed
            .into_values()
            .filter_map(|entry| entry.database_row_id)
            .collect()
    }

    /// Seed the link paramset for `key` from the channel's link group.
    pub(super) fn seed_link_paramset(&self, channel: u32, key: LinkKey) -> Vec<Slot> {
        let Some(function) = self.description.function(channel) else {
            return Vec::new();
        };
        let mut sets = self.paramsets.lock();
        let target = sets.links.entry(channel).or_default().entry(key).or_default();
        function
            .link
            .parameters()
            .filter(|parameter| insert_default(target, parameter))
            .map(|parameter| Slot::new(ParameterSetType::Link, channel, Some(key), &parameter.id))
            .collect()
    }

    fn record_row_id(&self, slot: &Slot, row_id: u64) {
        if let Some(entry) = self
            .paramsets
            .lock()
            .group_mut(slot.kind, slot.channel, slot.link)
            .and_then(|group| group.get_mut(&slot.name))
        {
            entry.database_row_id = Some(row_id);
        }
    }

    /// Validate, encode and persist one config or link member.
    fn write_member(
        &self,
        kind: ParameterSetType,
        channel: u32,
        link: Option<LinkKey>,
        name: &str,
        value: &Variable,
    ) -> Result<bool, CoreError> {
        let found = {
            let sets = self.paramsets.lock();
            sets.group(kind, channel, link)
                .and_then(|group| group.get(name))
                .map(|entry| {
                    (
                        Arc::clone(&entry.parameter),
                        entry.raw_data.clone(),
                        entry.database_row_id,
                    )
                })
        };
        let Some((parameter, current, row_id)) = found else {
            return Err(CoreError::UnknownParameter {
                parameter: name.to_owned(),
            });
        };
        if !parameter.writeable {
            return Err(CoreError::NotWriteable {
                parameter: name.to_owned(),
            });
        }
        let value = apply_relative(&parameter, &current, value)?;
        let raw = parameter.convert_to_packet(&value)?;
        if raw == current {
            return Ok(false);
        }

        let saved = self.save_parameter(
            row_id,
            kind,
            channel,
            name,
            &raw,
            link.map_or(0, |key| key.remote_address),
            link.map(|key| key.remote_channel),
        )?;
        let mut sets = self.paramsets.lock();
        if let Some(entry) = sets
            .group_mut(kind, channel, link)
            .and_then(|group| group.get_mut(name))
        {
            entry.raw_data = raw;
            if saved.is_some() {
                entry.database_row_id = saved;
            }
        }
        Ok(true)
    }

    /// Link paramset key for `remote_id`, `None` for non-link kinds.
    fn resolve_link(
        &self,
        channel: u32,
        kind: ParameterSetType,
        remote_id: u64,
        remote_channel: Option<u32>,
    ) -> Result<Option<LinkKey>, CoreError> {
        if kind != ParameterSetType::Link {
            return Ok(None);
        }
        let unknown = || CoreError::UnknownPeer {
            identifier: remote_id.to_string(),
        };
        if remote_id == 0 {
            return Err(unknown());
        }
        let stored = self
            .links
            .lock()
            .get(&channel)
            .and_then(|refs| refs.iter().find(|link| link.id == remote_id))
            .map(|link| link.address);
        let address = match stored {
            Some(address) => address,
            None => self
                .directory()
                .and_then(|directory| directory.peer_by_id(remote_id))
                .map(|peer| peer.address())
                .ok_or_else(unknown)?,
        };

        let sets = self.paramsets.lock();
        let remotes = sets.links.get(&channel);
        let key = match remote_channel {
            Some(remote_channel) => Some(LinkKey {
                remote_address: address,
                remote_channel,
            }),
            None => remotes.and_then(|remotes| {
                remotes
                    .keys()
                    .find(|key| key.remote_address == address)
                    .copied()
            }),
        };
        match key {
            Some(key) if remotes.is_some_and(|remotes| remotes.contains_key(&key)) => Ok(Some(key)),
            _ => Err(CoreError::UnknownParamset {
                paramset: format!("LINK {address:#08X}"),
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::description::LogicalType;

    fn level() -> Parameter {
        Parameter::new("LEVEL", LogicalType::integer(0, 200))
    }

    #[test]
    fn relative_updates_apply_to_numeric_parameters() {
        let parameter = level();
        let current = parameter.convert_to_packet(&Variable::Integer(10)).unwrap();
        let add = apply_relative(&parameter, &current, &Variable::from("+=5")).unwrap();
        assert_eq!(add, Variable::Integer(15));
        let mul = apply_relative(&parameter, &current, &Variable::from("*= 3")).unwrap();
        assert_eq!(mul, Variable::Integer(30));
        let plain = apply_relative(&parameter, &current, &Variable::Integer(7)).unwrap();
        assert_eq!(plain, Variable::Integer(7));
    }

    #[test]
    fn zero_factor_is_rejected() {
        let parameter = Parameter::new("LEVEL", LogicalType::float(0.0, 1.0));
        let current = parameter.convert_to_packet(&Variable::Float(0.5)).unwrap();
        let err = apply_relative(&parameter, &current, &Variable::from("/=0")).unwrap_err();
        assert_eq!(err.code(), -1);
        let err = apply_relative(&parameter, &current, &Variable::from("*=abc")).unwrap_err();
        assert!(matches!(err, CoreError::InvalidFactor { .. }));
    }

    #[test]
    fn insert_default_never_overwrites() {
        let parameter = Arc::new(level().with_default(42));
        let mut group = ChannelParameters::new();
        assert!(insert_default(&mut group, &parameter));
        group.get_mut("LEVEL").unwrap().raw_data = vec![0, 0, 0, 1];
        assert!(!insert_default(&mut group, &parameter));
        assert_eq!(group["LEVEL"].raw_data, vec![0, 0, 0, 1]);
    }

    #[test]
    fn paramsets_count_every_group() {
        let parameter = Arc::new(level());
        let mut sets = Paramsets::default();
        insert_default(sets.config.entry(0).or_default(), &parameter);
        insert_default(sets.values.entry(1).or_default(), &parameter);
        let key = LinkKey {
            remote_address: 0x10,
            remote_channel: 2,
        };
        insert_default(
            sets.links.entry(1).or_default().entry(key).or_default(),
            &parameter,
        );
        assert_eq!(sets.len(), 3);
        assert_eq!(sets.slots().len(), 3);
    }
}
