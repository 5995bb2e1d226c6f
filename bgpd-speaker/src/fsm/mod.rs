//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod handler;
pub mod open;

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::af::{AddPathMode, RouteFamily};
use crate::config::{GlobalConfig, NeighborConfig};
use crate::network::ConnInfo;
use crate::packet::codec::CodecCxt;
use crate::packet::message::{Message, NotificationMsg, OpenMsg};
use crate::path::PeerInfo;

// Large hold-time used during session initialization.
pub const LARGE_HOLDTIME: u16 = 240;
// Idle hold time applied once the first session attempt is over.
pub const IDLE_HOLD_TIME: u16 = 5;
// Maximum TTL.
pub const TTL_MAX: u8 = 255;
// Sessions going down sooner than this (in seconds) are counted as flops.
pub const FLOP_THRESHOLD: i64 = 30;

// Lower bound of the connect retry interval.
#[cfg(not(feature = "testing"))]
pub const MIN_CONNECT_RETRY: u16 = 10;
#[cfg(feature = "testing")]
pub const MIN_CONNECT_RETRY: u16 = 1;

// FSM states.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    Idle,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

// Administrative states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdminState {
    Up,
    Down,
    // Shut down after exceeding the prefix limit.
    PfxCt,
}

// Reason of an FSM state transition.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum StateReason {
    Dying,
    AdminDown,
    ReadFailed,
    WriteFailed,
    NotificationSent(NotificationMsg),
    NotificationRecv(NotificationMsg),
    HoldTimerExpired,
    IdleTimerExpired,
    RestartTimerExpired,
    GracefulRestart,
    InvalidMsg,
    NewConnection,
    OpenMsgReceived,
    OpenMsgNegotiated,
    HardReset,
    Deconfigured,
}

// Administrative state change request.
#[derive(Clone, Debug)]
pub struct AdminStateOp {
    pub state: AdminState,
    pub communication: String,
}

// Per-peer protocol state.
//
// It's shared between the central loop and the peer's own tasks.
#[derive(Debug)]
pub struct Fsm {
    pub addr: IpAddr,
    pub config: NeighborConfig,
    pub state: State,
    pub admin_state: AdminState,
    pub peer_info: Arc<PeerInfo>,
    pub open_sent: Option<OpenMsg>,
    pub open_rcvd: Option<OpenMsg>,
    // Negotiated address families and their ADD-PATH modes.
    pub families: BTreeMap<RouteFamily, AddPathMode>,
    pub four_byte_asn: bool,
    pub route_refresh: bool,
    pub hold_time: u16,
    pub keepalive_interval: u16,
    pub conn_info: Option<ConnInfo>,
    pub gr: GracefulRestartState,
    pub idle_hold_time: u16,
    pub statistics: Statistics,
    // Bumped on every state change. Messages generated by the tasks of an
    // older generation are discarded.
    pub version: u64,
}

// Graceful Restart and Long-Lived Graceful Restart state.
#[derive(Clone, Debug, Default)]
#[derive(Serialize)]
pub struct GracefulRestartState {
    // Negotiated on the current (or last) session.
    pub enabled: bool,
    pub peer_restart_time: u16,
    pub notification_enabled: bool,
    pub long_lived_enabled: bool,
    pub local_restarting: bool,
    pub peer_restarting: bool,
    pub families: BTreeMap<RouteFamily, GrFamilyState>,
}

// Per-family Graceful Restart state.
#[derive(Clone, Debug, Default)]
#[derive(Serialize)]
pub struct GrFamilyState {
    pub received: bool,
    pub eor_received: bool,
    pub eor_sent: bool,
    pub llgr_received: bool,
    pub llgr_restart_time: u32,
    pub llgr_expired: bool,
}

// Session statistics.
#[derive(Clone, Debug, Default)]
#[derive(Serialize)]
pub struct Statistics {
    pub msgs_sent: MessageCounters,
    pub msgs_rcvd: MessageCounters,
    pub established_count: u32,
    pub flops: u32,
    pub uptime: Option<DateTime<Utc>>,
    pub downtime: Option<DateTime<Utc>>,
    pub update_recv_time: Option<DateTime<Utc>>,
}

// Inbound or outbound message counters.
#[derive(Clone, Debug, Default)]
#[derive(Serialize)]
pub struct MessageCounters {
    pub open: u64,
    pub update: u64,
    pub notification: u64,
    pub keepalive: u64,
    pub route_refresh: u64,
    pub discarded: u64,
    pub withdraw_update: u64,
    pub withdraw_prefix: u64,
    pub total: u64,
}

// Reference-counted FSM guarded by a read/write lock.
#[derive(Clone, Debug)]
pub struct SharedFsm(Arc<RwLock<Fsm>>);

// ===== impl State =====

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Idle => write!(f, "idle"),
            State::Active => write!(f, "active"),
            State::OpenSent => write!(f, "opensent"),
            State::OpenConfirm => write!(f, "openconfirm"),
            State::Established => write!(f, "established"),
        }
    }
}

// ===== impl StateReason =====

impl StateReason {
    pub fn notification(&self) -> Option<&NotificationMsg> {
        match self {
            StateReason::NotificationSent(msg)
            | StateReason::NotificationRecv(msg) => Some(msg),
            _ => None,
        }
    }
}

impl std::fmt::Display for StateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateReason::Dying => write!(f, "dying"),
            StateReason::AdminDown => write!(f, "admin-down"),
            StateReason::ReadFailed => write!(f, "read-failed"),
            StateReason::WriteFailed => write!(f, "write-failed"),
            StateReason::NotificationSent(msg) => {
                write!(f, "notification-sent {msg}")
            }
            StateReason::NotificationRecv(msg) => {
                write!(f, "notification-received {msg}")
            }
            StateReason::HoldTimerExpired => write!(f, "hold-timer-expired"),
            StateReason::IdleTimerExpired => write!(f, "idle-timer-expired"),
            StateReason::RestartTimerExpired => {
                write!(f, "restart-timer-expired")
            }
            StateReason::GracefulRestart => write!(f, "graceful-restart"),
            StateReason::InvalidMsg => write!(f, "invalid-msg"),
            StateReason::NewConnection => write!(f, "new-connection"),
            StateReason::OpenMsgReceived => write!(f, "open-msg-received"),
            StateReason::OpenMsgNegotiated => {
                write!(f, "open-msg-negotiated")
            }
            StateReason::HardReset => write!(f, "hard-reset"),
            StateReason::Deconfigured => write!(f, "deconfigured"),
        }
    }
}

// ===== impl Fsm =====

impl Fsm {
    pub(crate) fn new(config: NeighborConfig, global: &GlobalConfig) -> Fsm {
        let local_as = match config.local_as {
            0 => global.asn,
            asn => asn,
        };
        let peer_info = PeerInfo {
            asn: config.peer_as,
            local_as,
            id: Ipv4Addr::UNSPECIFIED,
            local_id: global.router_id,
            address: Some(config.address),
            local_address: config.transport.local_address,
            route_reflector_client: config.route_reflector.client,
            route_reflector_cluster_id: config
                .route_reflector
                .cluster_id
                .unwrap_or(global.router_id),
        };
        let admin_state = if config.admin_down {
            AdminState::Down
        } else {
            AdminState::Up
        };
        let gr = GracefulRestartState {
            local_restarting: config.graceful_restart.local_restarting,
            ..Default::default()
        };

        Fsm {
            addr: config.address,
            config,
            state: State::Idle,
            admin_state,
            peer_info: Arc::new(peer_info),
            open_sent: None,
            open_rcvd: None,
            families: Default::default(),
            four_byte_asn: false,
            route_refresh: false,
            hold_time: 0,
            keepalive_interval: 0,
            conn_info: None,
            gr,
            idle_hold_time: 0,
            statistics: Default::default(),
            version: 0,
        }
    }

    pub fn local_as(&self) -> u32 {
        self.peer_info.local_as
    }

    pub fn peer_as(&self) -> u32 {
        self.peer_info.asn
    }

    pub fn is_ibgp(&self) -> bool {
        self.peer_info.is_ibgp()
    }

    pub fn is_negotiated(&self, family: RouteFamily) -> bool {
        self.families.contains_key(&family)
    }

    pub fn negotiated_families(&self) -> Vec<RouteFamily> {
        self.families.keys().copied().collect()
    }

    // Returns the TTL of outgoing packets based on the peer type and
    // configuration.
    pub(crate) fn tx_ttl(&self) -> u8 {
        let config = &self.config;
        if config.ttl_security.enabled {
            TTL_MAX
        } else if let Some(ttl) = config.transport.ttl {
            ttl
        } else if self.peer_as() == 0 || self.is_ibgp() {
            TTL_MAX
        } else if config.ebgp_multihop.enabled {
            config.ebgp_multihop.multihop_ttl
        } else {
            1
        }
    }

    // Returns the minimum TTL accepted on incoming packets (GTSM).
    pub(crate) fn min_ttl(&self) -> Option<u8> {
        self.config
            .ttl_security
            .enabled
            .then_some(self.config.ttl_security.ttl_min)
    }

    // Codec state resulting from the capabilities exchange.
    pub(crate) fn codec_cxt(&self) -> CodecCxt {
        CodecCxt {
            four_byte_asn: self.four_byte_asn,
            add_path: self
                .families
                .iter()
                .filter(|(_, mode)| !mode.is_empty())
                .map(|(family, mode)| (*family, *mode))
                .collect(),
        }
    }

    // Applies an administrative state change. Returns false when the
    // requested state is already in effect.
    pub(crate) fn change_admin_state(&mut self, state: AdminState) -> bool {
        if self.admin_state == state {
            return false;
        }
        self.admin_state = state;
        true
    }

    // Records a state transition and starts a new task generation.
    pub(crate) fn set_state(&mut self, state: State) {
        let now = Utc::now();
        if state == State::Established {
            self.statistics.established_count += 1;
            self.statistics.uptime = Some(now);
        } else if self.state == State::Established {
            if let Some(uptime) = self.statistics.uptime
                && (now - uptime).num_seconds() < FLOP_THRESHOLD
            {
                self.statistics.flops += 1;
            }
            self.statistics.downtime = Some(now);
        }
        self.state = state;
        self.version += 1;
    }

    // Clears the state negotiated on the last session.
    pub(crate) fn reset_negotiated(&mut self) {
        self.open_sent = None;
        self.open_rcvd = None;
        self.families.clear();
        self.four_byte_asn = false;
        self.route_refresh = false;
        self.hold_time = 0;
        self.keepalive_interval = 0;
        self.conn_info = None;
    }
}

// ===== impl MessageCounters =====

impl MessageCounters {
    pub(crate) fn update(&mut self, msg: &Message) {
        match msg {
            Message::Open(_) => self.open += 1,
            Message::Update(msg) => {
                self.update += 1;
                let withdrawn = msg.withdrawn_count();
                if withdrawn > 0 {
                    self.withdraw_update += 1;
                    self.withdraw_prefix += withdrawn as u64;
                }
            }
            Message::Notification(_) => self.notification += 1,
            Message::Keepalive(_) => self.keepalive += 1,
            Message::RouteRefresh(_) => self.route_refresh += 1,
        }
        self.total += 1;
    }
}

// ===== impl SharedFsm =====

impl SharedFsm {
    pub(crate) fn new(fsm: Fsm) -> SharedFsm {
        SharedFsm(Arc::new(RwLock::new(fsm)))
    }

    // The FSM state stays consistent even if a task panics while holding
    // the lock, so poisoning is ignored.
    pub fn read(&self) -> RwLockReadGuard<'_, Fsm> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Fsm> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ===== unit tests =====
