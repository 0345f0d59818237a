// ── Direct links ──
//
// A link pairs one of our channels with a channel on another endpoint. The
// remote side is stored by address; its id and serial are filled in once
// the remote peer is found in the owning device. Remote peers are looked
// up through the directory and only called while none of our locks are
// held.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::paramset::LinkKey;
use super::Peer;
use crate::error::CoreError;
use crate::sink::EventSink;
use crate::variable::Variable;

/// Stored reference to the remote end of a link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicPeerRef {
    pub address: i32,
    /// Empty until the remote peer has been resolved.
    pub serial: String,
    /// 0 until the remote peer has been resolved.
    pub id: u64,
    pub channel: u32,
    pub hidden: bool,
    pub link_name: String,
    pub link_description: String,
}

impl BasicPeerRef {
    pub fn new(address: i32, channel: u32) -> Self {
        Self {
            address,
            channel,
            ..Self::default()
        }
    }

    pub fn with_peer(mut self, id: u64, serial: impl Into<String>) -> Self {
        self.id = id;
        self.serial = serial.into();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    fn is_resolved(&self) -> bool {
        self.id != 0 && !self.serial.is_empty()
    }

    /// Serial for output, `@` plus the hex address when unresolved.
    fn display_serial(&self) -> String {
        if self.serial.is_empty() {
            format!("@{:06x}", self.address)
        } else {
            self.serial.clone()
        }
    }
}

/// Flag bits accepted by [`Peer::get_link`] and reported per link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkFlags(pub i32);

impl LinkFlags {
    /// Include the links of the grouped partner channel.
    pub const GROUP: i32 = 0x01;
    pub const SENDER_PARAMSET: i32 = 0x02;
    pub const RECEIVER_PARAMSET: i32 = 0x04;
    pub const SENDER_DESCRIPTION: i32 = 0x08;
    pub const RECEIVER_DESCRIPTION: i32 = 0x10;

    /// Per-link `FLAGS`: sender unknown or unreachable.
    pub const SENDER_BROKEN: i32 = 0x01;
    /// Per-link `FLAGS`: receiver unknown or unreachable.
    pub const RECEIVER_BROKEN: i32 = 0x02;
    /// Per-link `FLAGS`: link to an undescribed channel of this peer.
    pub const PEER_IS_ME: i32 = 0x04;

    pub fn contains(self, bit: i32) -> bool {
        self.0 & bit != 0
    }

    fn without(self, bit: i32) -> Self {
        Self(self.0 & !bit)
    }
}

/// Identifies a peer by address, id or serial.
#[derive(Debug, Clone, Copy)]
pub enum PeerLookup<'a> {
    Address(i32),
    Id(u64),
    Serial(&'a str),
}

/// One side of a link in `get_link` output.
struct Endpoint {
    address: String,
    id: u64,
    local: bool,
}

/// Remote data resolved for one link while building `get_link` output.
struct Resolved {
    id: u64,
    serial: String,
    broken: i32,
    remote: Option<Arc<Peer>>,
}

impl Peer {
    /// Add or replace the link to `peer_ref` on `channel` and seed its
    /// link paramset from the channel's link description.
    pub fn add_link(&self, channel: u32, peer_ref: BasicPeerRef) -> Result<(), CoreError> {
        self.ensure_active()?;
        self.require_channel(channel)?;
        let key = LinkKey {
            remote_address: peer_ref.address,
            remote_channel: peer_ref.channel,
        };
        {
            let mut links = self.links.lock();
            let list = links.entry(channel).or_default();
            match list
                .iter_mut()
                .find(|link| link.address == peer_ref.address && link.channel == peer_ref.channel)
            {
                Some(existing) => *existing = peer_ref,
                None => list.push(peer_ref),
            }
        }

        let created = self.seed_link_paramset(channel, key);
        if !created.is_empty() {
            self.with_savepoint(|| {
                for slot in &created {
                    self.persist_slot(slot)?;
                }
                Ok(())
            })?;
        }
        self.save_links();
        debug!(peer_id = self.id(), channel, remote = key.remote_address, "link added");
        Ok(())
    }

    /// Remove a link and delete its link paramset rows.
    pub fn remove_link(
        &self,
        channel: u32,
        address: i32,
        remote_channel: u32,
    ) -> Result<bool, CoreError> {
        self.ensure_active()?;
        let removed = {
            let mut links = self.links.lock();
            let Some(list) = links.get_mut(&channel) else {
                return Ok(false);
            };
            let before = list.len();
            list.retain(|link| !(link.address == address && link.channel == remote_channel));
            let removed = list.len() != before;
            if list.is_empty() {
                links.remove(&channel);
            }
            removed
        };
        if !removed {
            return Ok(false);
        }

        let peer_id = self.id();
        let key = LinkKey {
            remote_address: address,
            remote_channel,
        };
        for row_id in self.take_link_paramset(channel, key) {
            if let Err(e) = EventSink::delete_peer_parameter(self, peer_id, row_id) {
                error!(peer_id, row_id, error = %e, "cannot delete link parameter");
            }
        }
        self.save_links();
        Ok(true)
    }

    /// The stored link on `channel` matching `lookup`, optionally
    /// restricted to one remote channel.
    pub fn get_link_peer(
        &self,
        channel: u32,
        lookup: PeerLookup<'_>,
        remote_channel: Option<u32>,
    ) -> Option<BasicPeerRef> {
        let resolved_address = match lookup {
            PeerLookup::Id(id) => self
                .directory()
                .and_then(|directory| directory.peer_by_id(id))
                .map(|peer| peer.address()),
            _ => None,
        };
        let links = self.links.lock();
        links
            .get(&channel)?
            .iter()
            .filter(|link| remote_channel.is_none_or(|c| link.channel == c))
            .find(|link| match lookup {
                PeerLookup::Address(address) => link.address == address,
                PeerLookup::Id(id) => link.id == id || resolved_address == Some(link.address),
                PeerLookup::Serial(serial) => link.serial == serial,
            })
            .cloned()
    }

    /// Every stored link of `channel`.
    pub fn links_of(&self, channel: u32) -> Vec<BasicPeerRef> {
        self.links.lock().get(&channel).cloned().unwrap_or_default()
    }

    /// Describe links as RPC structs.
    ///
    /// `channel` `None` covers every channel. Remote ids and serials found
    /// along the way are written back into the stored links.
    pub fn get_link(
        &self,
        channel: Option<u32>,
        flags: LinkFlags,
        avoid_duplicates: bool,
    ) -> Result<Variable, CoreError> {
        self.ensure_central()?;
        let mut result = Vec::new();
        match channel {
            Some(channel) if flags.contains(LinkFlags::GROUP) => {
                let function = self
                    .description
                    .function(channel)
                    .ok_or(CoreError::UnknownChannel { channel })?;
                let flags = flags.without(LinkFlags::GROUP);
                result.extend(self.channel_links(channel, flags, avoid_duplicates)?);
                if let Some(partner) = function.grouped_with {
                    result.extend(self.channel_links(partner, flags, avoid_duplicates)?);
                }
            }
            Some(channel) => result.extend(self.channel_links(channel, flags, avoid_duplicates)?),
            None => {
                for channel in self.description.channels() {
                    result.extend(self.channel_links(channel, flags, avoid_duplicates)?);
                }
            }
        }
        Ok(Variable::Array(result))
    }

    /// Name and description of the link to `remote_id`.
    pub fn get_link_info(
        &self,
        channel: u32,
        remote_id: u64,
        remote_channel: Option<u32>,
    ) -> Result<Variable, CoreError> {
        self.ensure_central()?;
        let link = self
            .get_link_peer(channel, PeerLookup::Id(remote_id), remote_channel)
            .ok_or_else(|| CoreError::UnknownPeer {
                identifier: remote_id.to_string(),
            })?;
        Ok(Variable::from_pairs([
            ("DESCRIPTION", Variable::String(link.link_description)),
            ("NAME", Variable::String(link.link_name)),
        ]))
    }

    pub fn set_link_info(
        &self,
        channel: u32,
        remote_id: u64,
        remote_channel: Option<u32>,
        name: &str,
        description: &str,
    ) -> Result<(), CoreError> {
        self.ensure_central()?;
        let target = self
            .get_link_peer(channel, PeerLookup::Id(remote_id), remote_channel)
            .ok_or_else(|| CoreError::UnknownPeer {
                identifier: remote_id.to_string(),
            })?;
        {
            let mut links = self.links.lock();
            if let Some(link) = links.get_mut(&channel).and_then(|list| {
                list.iter_mut()
                    .find(|link| link.address == target.address && link.channel == target.channel)
            }) {
                name.clone_into(&mut link.link_name);
                description.clone_into(&mut link.link_description);
            }
        }
        self.save_links();
        Ok(())
    }

    /// Remote endpoints linked to `channel` (every channel for `None`):
    /// `[id, channel]` pairs with `return_id`, `SERIAL:CH` strings otherwise.
    pub fn get_link_peers(
        &self,
        channel: Option<u32>,
        return_id: bool,
    ) -> Result<Variable, CoreError> {
        self.ensure_central()?;
        let channels: Vec<u32> = match channel {
            Some(channel) => {
                self.require_channel(channel)?;
                vec![channel]
            }
            None => self.description.channels().collect(),
        };
        let directory = self.directory();
        let mut result = Vec::new();
        for channel in channels {
            for link in self.links_of(channel).iter().filter(|link| !link.hidden) {
                let remote = directory
                    .as_ref()
                    .and_then(|directory| directory.peer_by_address(link.address));
                if return_id {
                    let id = remote.as_ref().map_or(link.id, |peer| peer.id());
                    if id == 0 {
                        continue;
                    }
                    result.push(Variable::Array(vec![
                        Variable::from(id),
                        Variable::from(i64::from(link.channel)),
                    ]));
                } else {
                    let serial = remote
                        .as_ref()
                        .map_or_else(|| link.display_serial(), |peer| peer.serial().to_owned());
                    result.push(Variable::String(format!("{serial}:{}", link.channel)));
                }
            }
        }
        Ok(Variable::Array(result))
    }

    // ── get_link internals ───────────────────────────────────────────

    fn channel_links(
        &self,
        channel: u32,
        flags: LinkFlags,
        avoid_duplicates: bool,
    ) -> Result<Vec<Variable>, CoreError> {
        let function = self
            .description
            .function(channel)
            .ok_or(CoreError::UnknownChannel { channel })?;
        let is_sender = function.is_link_sender();
        if !is_sender && !function.is_link_receiver() {
            return Ok(Vec::new());
        }
        let refs = self.links_of(channel);
        if refs.is_empty() {
            return Ok(Vec::new());
        }

        let directory = self.directory();
        let remote_broken = if is_sender {
            LinkFlags::RECEIVER_BROKEN
        } else {
            LinkFlags::SENDER_BROKEN
        };
        let self_unreach = self.service_messages.unreach();
        let mut output = Vec::new();
        let mut learned = Vec::new();

        for link in refs.iter().filter(|link| !link.hidden) {
            let remote = directory
                .as_ref()
                .and_then(|directory| directory.peer_by_address(link.address));
            let knows_me = remote.as_ref().is_some_and(|peer| {
                peer.get_link_peer(link.channel, PeerLookup::Address(self.address), Some(channel))
                    .is_some()
            });
            // The sender side already reports links known on both ends.
            if avoid_duplicates && !is_sender && knows_me {
                return Ok(Vec::new());
            }

            let mut resolved = match remote {
                None => Resolved {
                    id: link.id,
                    serial: link.display_serial(),
                    broken: remote_broken,
                    remote: None,
                },
                Some(peer) if link.is_resolved() => Resolved {
                    id: link.id,
                    serial: link.serial.clone(),
                    broken: 0,
                    remote: Some(peer),
                },
                Some(peer) if knows_me || link.address == self.address => {
                    learned.push((link.address, link.channel, peer.id(), peer.serial().to_owned()));
                    Resolved {
                        id: peer.id(),
                        serial: peer.serial().to_owned(),
                        broken: 0,
                        remote: Some(peer),
                    }
                }
                Some(peer) => Resolved {
                    id: link.id,
                    serial: link.display_serial(),
                    broken: remote_broken,
                    remote: Some(peer),
                },
            };
            if link.address == self.address && self.description.function(link.channel).is_none() {
                resolved.broken = remote_broken | LinkFlags::PEER_IS_ME;
            }
            if resolved.broken == 0
                && resolved
                    .remote
                    .as_ref()
                    .is_some_and(|peer| peer.service_messages().unreach())
            {
                resolved.broken = LinkFlags::RECEIVER_BROKEN;
            }
            if self_unreach {
                resolved.broken |= LinkFlags::SENDER_BROKEN;
            }

            output.push(self.describe_link(channel, link, &resolved, flags, is_sender));
        }

        if !learned.is_empty() {
            let mut links = self.links.lock();
            if let Some(list) = links.get_mut(&channel) {
                for (address, remote_channel, id, serial) in learned {
                    if let Some(link) = list
                        .iter_mut()
                        .find(|link| link.address == address && link.channel == remote_channel)
                    {
                        link.id = id;
                        link.serial = serial;
                    }
                }
            }
        }
        Ok(output)
    }

    fn describe_link(
        &self,
        channel: u32,
        link: &BasicPeerRef,
        resolved: &Resolved,
        flags: LinkFlags,
        is_sender: bool,
    ) -> Variable {
        let local = Endpoint {
            address: format!("{}:{channel}", self.serial),
            id: self.id(),
            local: true,
        };
        let remote = Endpoint {
            address: format!("{}:{}", resolved.serial, link.channel),
            id: resolved.id,
            local: false,
        };
        let (sender, receiver) = if is_sender {
            (local, remote)
        } else {
            (remote, local)
        };

        let mut element = Variable::new_struct();
        element.insert("DESCRIPTION", Variable::String(link.link_description.clone()));
        element.insert("FLAGS", Variable::Integer(resolved.broken));
        element.insert("NAME", Variable::String(link.link_name.clone()));

        let sides = [
            (
                "RECEIVER",
                receiver,
                LinkFlags::RECEIVER_BROKEN,
                LinkFlags::RECEIVER_PARAMSET,
                LinkFlags::RECEIVER_DESCRIPTION,
            ),
            (
                "SENDER",
                sender,
                LinkFlags::SENDER_BROKEN,
                LinkFlags::SENDER_PARAMSET,
                LinkFlags::SENDER_DESCRIPTION,
            ),
        ];
        for (prefix, endpoint, broken_bit, paramset_bit, description_bit) in sides {
            let endpoint_channel = if endpoint.local { channel } else { link.channel };
            element.insert(format!("{prefix}_ID"), Variable::from(endpoint.id));
            element.insert(
                format!("{prefix}_CHANNEL"),
                Variable::from(i64::from(endpoint_channel)),
            );
            if flags.contains(paramset_bit) {
                let paramset = if resolved.broken & broken_bit != 0 {
                    Variable::new_struct()
                } else if endpoint.local {
                    self.link_paramset(
                        channel,
                        LinkKey {
                            remote_address: link.address,
                            remote_channel: link.channel,
                        },
                    )
                } else {
                    resolved.remote.as_ref().map_or_else(Variable::new_struct, |peer| {
                        peer.link_paramset(
                            link.channel,
                            LinkKey {
                                remote_address: self.address,
                                remote_channel: channel,
                            },
                        )
                    })
                };
                element.insert(format!("{prefix}_PARAMSET"), paramset);
            }
            if flags.contains(description_bit) {
                let description = if endpoint.local {
                    self.get_device_description(Some(channel)).ok()
                } else {
                    resolved
                        .remote
                        .as_ref()
                        .and_then(|peer| peer.get_device_description(Some(link.channel)).ok())
                };
                element.insert(
                    format!("{prefix}_DESCRIPTION"),
                    description.unwrap_or_else(Variable::new_struct),
                );
            }
            element.insert(prefix, Variable::String(endpoint.address));
        }
        element
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_links_show_hex_address() {
        let link = BasicPeerRef::new(0x1A2B3C, 4);
        assert!(!link.is_resolved());
        assert_eq!(link.display_serial(), "@1a2b3c");
        let link = link.with_peer(9, "KEQ0000009");
        assert!(link.is_resolved());
        assert_eq!(link.display_serial(), "KEQ0000009");
    }

    #[test]
    fn stored_links_tolerate_missing_fields() {
        let parsed: BasicPeerRef = serde_json::from_str(r#"{"address": 16, "channel": 2}"#).unwrap();
        assert_eq!(parsed, BasicPeerRef::new(16, 2));
        assert!(LinkFlags(0x06).contains(LinkFlags::RECEIVER_PARAMSET));
        assert!(!LinkFlags(0x06).contains(LinkFlags::GROUP));
    }
}
