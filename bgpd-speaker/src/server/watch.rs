//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr};

use bgpd_utils::UnboundedSender;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fsm::{AdminState, State, StateReason};
use crate::packet::message::{Message, UpdateMsg};
use crate::path::Path;
use crate::peer::Peer;

// Event classes a subscriber is interested in.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchOptions {
    pub best_path: bool,
    pub pre_update: bool,
    pub post_update: bool,
    pub peer_state: bool,
    pub message: bool,
    // Emit a snapshot of the current state before any change.
    pub current: bool,
}

#[derive(Clone, Debug, Serialize)]
pub enum WatchEvent {
    BestPath(BestPathEvent),
    Update(UpdateEvent),
    PeerState(PeerStateEvent),
    Message(MessageEvent),
}

#[derive(Clone, Debug, Serialize)]
pub struct BestPathEvent {
    pub paths: Vec<BestPath>,
    pub multipath: Vec<Vec<Path>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct BestPath {
    pub path: Path,
    // Identifiers of the VRFs that import the path.
    pub vrf_ids: Vec<u32>,
}

// Paths received from a neighbor, before or after the import policy.
#[derive(Clone, Debug, Serialize)]
pub struct UpdateEvent {
    pub addr: IpAddr,
    pub peer_as: u32,
    pub peer_id: Ipv4Addr,
    pub local_address: Option<IpAddr>,
    pub timestamp: DateTime<Utc>,
    pub post_policy: bool,
    pub msg: Option<UpdateMsg>,
    pub paths: Vec<Path>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PeerStateEvent {
    pub addr: IpAddr,
    pub peer_as: u32,
    pub peer_id: Ipv4Addr,
    pub state: State,
    pub admin_state: AdminState,
    pub reason: Option<StateReason>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct MessageEvent {
    pub addr: IpAddr,
    pub timestamp: DateTime<Utc>,
    pub msg: Message,
}

#[derive(Debug, Default)]
pub struct Watchers(Vec<Watcher>);

#[derive(Debug)]
struct Watcher {
    options: WatchOptions,
    tx: UnboundedSender<WatchEvent>,
}

// ===== impl WatchEvent =====

impl WatchEvent {
    fn is_wanted(&self, options: &WatchOptions) -> bool {
        match self {
            WatchEvent::BestPath(_) => options.best_path,
            WatchEvent::Update(event) if event.post_policy => {
                options.post_update
            }
            WatchEvent::Update(_) => options.pre_update,
            WatchEvent::PeerState(_) => options.peer_state,
            WatchEvent::Message(_) => options.message,
        }
    }
}

// ===== impl UpdateEvent =====

impl UpdateEvent {
    pub(crate) fn new(
        peer: &Peer,
        post_policy: bool,
        msg: Option<UpdateMsg>,
        paths: Vec<Path>,
    ) -> UpdateEvent {
        let info = peer.peer_info();
        UpdateEvent {
            addr: peer.addr,
            peer_as: info.asn,
            peer_id: info.id,
            local_address: info.local_address,
            timestamp: Utc::now(),
            post_policy,
            msg,
            paths,
        }
    }
}

// ===== impl PeerStateEvent =====

impl PeerStateEvent {
    pub(crate) fn new(peer: &Peer, reason: Option<StateReason>) -> Self {
        let fsm = peer.fsm.read();
        PeerStateEvent {
            addr: peer.addr,
            peer_as: fsm.peer_as(),
            peer_id: fsm.peer_info.id,
            state: fsm.state,
            admin_state: fsm.admin_state,
            reason,
            timestamp: Utc::now(),
        }
    }
}

// ===== impl Watchers =====

impl Watchers {
    pub(crate) fn add(
        &mut self,
        options: WatchOptions,
        tx: UnboundedSender<WatchEvent>,
    ) {
        self.0.push(Watcher { options, tx });
    }

    // Returns whether any subscriber wants best path events.
    pub(crate) fn best_path(&self) -> bool {
        self.0.iter().any(|watcher| watcher.options.best_path)
    }

    pub(crate) fn pre_update(&self) -> bool {
        self.0.iter().any(|watcher| watcher.options.pre_update)
    }

    pub(crate) fn post_update(&self) -> bool {
        self.0.iter().any(|watcher| watcher.options.post_update)
    }

    pub(crate) fn message(&self) -> bool {
        self.0.iter().any(|watcher| watcher.options.message)
    }

    // Delivers an event to the interested subscribers. Subscribers that went
    // away are removed.
    pub(crate) fn notify(&mut self, event: WatchEvent) {
        self.0.retain(|watcher| {
            !event.is_wanted(&watcher.options)
                || watcher.tx.send(event.clone()).is_ok()
        });
    }
}
