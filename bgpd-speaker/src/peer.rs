//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use bgpd_utils::task::{Task, TimeoutTask};
use bgpd_utils::{Sender, UnboundedSender};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug_span, warn};

use crate::af::{AddPathMode, RouteFamily};
use crate::config::{GlobalConfig, NeighborConfig};
use crate::error::Error;
use crate::fsm::handler::FsmHandler;
use crate::fsm::{
    AdminState, AdminStateOp, Fsm, GracefulRestartState, SharedFsm, State,
    Statistics,
};
use crate::network::{ConnInfo, Connection};
use crate::packet::codec::MessageCodec;
use crate::packet::message::NotificationMsg;
use crate::path::PeerInfo;
use crate::rib::TableId;
use crate::rib::adj::AdjRib;
use crate::tasks;
use crate::tasks::messages::input::FsmMsg;
use crate::tasks::messages::output::{Outgoing, Resume};

// Time given to a deleted peer to flush its final NOTIFICATION.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub type Peers = BTreeMap<IpAddr, Peer>;

// A configured or dynamically accepted neighbor.
#[derive(Debug)]
pub struct Peer {
    pub addr: IpAddr,
    pub fsm: SharedFsm,
    // Paths received from this neighbor.
    pub adj_rib_in: AdjRib,
    // Outgoing queue of the current established session.
    pub outgoing: Option<UnboundedSender<Outgoing>>,
    // Families for which the prefix limit warning was already logged.
    pub prefix_limit_warned: BTreeSet<RouteFamily>,
    pub llgr_timers: BTreeMap<RouteFamily, TimeoutTask>,
    pub rtc_deferral: Option<TimeoutTask>,
    // Created from a dynamic neighbor prefix.
    pub dynamic: bool,
    admin_tx: Sender<AdminStateOp>,
    conn_tx: Sender<Connection>,
    resume_tx: Sender<Resume>,
    token: CancellationToken,
    handler: Task<()>,
}

// Operational snapshot of a peer.
#[derive(Clone, Debug, Serialize)]
pub struct PeerState {
    pub config: NeighborConfig,
    pub state: State,
    pub admin_state: AdminState,
    pub peer_as: u32,
    pub peer_id: Ipv4Addr,
    pub local_as: u32,
    pub families: Vec<RouteFamily>,
    pub hold_time: u16,
    pub keepalive_interval: u16,
    pub conn_info: Option<ConnInfo>,
    pub statistics: Statistics,
    pub graceful_restart: GracefulRestartState,
    pub dynamic: bool,
}

// ===== impl Peer =====

impl Peer {
    pub(crate) fn new(
        config: NeighborConfig,
        global: &GlobalConfig,
        codec: Arc<dyn MessageCodec>,
        parent_token: &CancellationToken,
        fsm_tx: &UnboundedSender<FsmMsg>,
        dynamic: bool,
    ) -> Peer {
        let addr = config.address;
        let adj_rib_in = AdjRib::new(config.families());
        let mut fsm = Fsm::new(config, global);
        // Dynamic peers exist because of an inbound connection.
        if dynamic {
            fsm.state = State::Active;
        }
        let fsm = SharedFsm::new(fsm);

        let (admin_tx, admin_rx) = mpsc::channel(1);
        let (conn_tx, conn_rx) = mpsc::channel(4);
        let (resume_tx, resume_rx) = mpsc::channel(1);
        let token = parent_token.child_token();
        let handler = FsmHandler::new(
            fsm.clone(),
            codec,
            token.clone(),
            (conn_tx.clone(), conn_rx),
            admin_rx,
            fsm_tx.clone(),
            resume_rx,
        );
        let handler = tasks::peer_fsm(handler);

        Peer {
            addr,
            fsm,
            adj_rib_in,
            outgoing: None,
            prefix_limit_warned: Default::default(),
            llgr_timers: Default::default(),
            rtc_deferral: None,
            dynamic,
            admin_tx,
            conn_tx,
            resume_tx,
            token,
            handler,
        }
    }

    // RIB view this peer is served from.
    pub fn table_id(&self) -> TableId {
        if self.is_route_server_client() {
            TableId::RouteServerClient(self.addr)
        } else {
            TableId::Global
        }
    }

    pub fn peer_info(&self) -> Arc<PeerInfo> {
        self.fsm.read().peer_info.clone()
    }

    pub fn state(&self) -> State {
        self.fsm.read().state
    }

    pub fn is_established(&self) -> bool {
        self.state() == State::Established
    }

    pub fn is_route_server_client(&self) -> bool {
        self.fsm.read().config.is_route_server_client()
    }

    pub fn is_route_reflector_client(&self) -> bool {
        self.fsm.read().config.is_route_reflector_client()
    }

    pub fn vrf(&self) -> Option<String> {
        self.fsm.read().config.vrf.clone()
    }

    pub fn configured_families(&self) -> Vec<RouteFamily> {
        self.fsm.read().config.families()
    }

    // Families of the global RIB carrying this peer's paths. The unicast
    // families of a VRF peer map to their VPN counterparts.
    pub fn to_global_families(
        &self,
        families: &[RouteFamily],
    ) -> Vec<RouteFamily> {
        if self.vrf().is_none() {
            return families.to_vec();
        }
        let mut global = families
            .iter()
            .map(|family| family.to_vpn())
            .collect::<Vec<_>>();
        global.dedup();
        global
    }

    pub fn negotiated_families(&self) -> Vec<RouteFamily> {
        self.fsm.read().negotiated_families()
    }

    pub fn is_negotiated(&self, family: RouteFamily) -> bool {
        self.fsm.read().is_negotiated(family)
    }

    pub fn add_path_send(&self, family: RouteFamily) -> bool {
        self.fsm
            .read()
            .families
            .get(&family)
            .is_some_and(|mode| mode.contains(AddPathMode::SEND))
    }

    // RTC deferral time, if route target constraint is configured.
    pub fn rtc_deferral_time(&self) -> u16 {
        self.fsm
            .read()
            .config
            .afi_safi(RouteFamily::RouteTargetConstraint)
            .map(|afi_safi| afi_safi.rtc_deferral_time)
            .unwrap_or(0)
    }

    // Hands an accepted connection over to the FSM.
    pub(crate) fn pass_connection(&self, conn: Connection) {
        if self.conn_tx.try_send(conn).is_err() {
            warn!(addr = %self.addr, "connection queue full, dropping");
        }
    }

    pub(crate) fn request_admin_state(
        &self,
        state: AdminState,
        communication: String,
    ) -> Result<(), Error> {
        let op = AdminStateOp {
            state,
            communication,
        };
        self.admin_tx
            .try_send(op)
            .map_err(|_| Error::AdminStatePending(self.addr))
    }

    // Lets the FSM leave the state it last reported.
    pub(crate) fn resume(&self, resume: Resume) {
        let _ = self.resume_tx.try_send(resume);
    }

    pub(crate) fn send(&self, msg: Outgoing) {
        if msg.is_empty() {
            return;
        }
        if let Some(outgoing) = &self.outgoing {
            let _ = outgoing.send(msg);
        }
    }

    pub(crate) fn send_notification(
        &self,
        msg: NotificationMsg,
        stay_idle: bool,
    ) {
        let mut msg = Outgoing::notification(msg);
        msg.stay_idle = stay_idle;
        self.send(msg);
    }

    // Whether End-of-RIB was received for every graceful restart family.
    pub fn recvd_all_eor(&self) -> bool {
        self.fsm
            .read()
            .gr
            .families
            .values()
            .filter(|state| state.received)
            .all(|state| state.eor_received)
    }

    // Splits the configured families into those whose forwarding state the
    // peer preserved across its restart and the others.
    pub fn forwarding_preserved_families(
        &self,
    ) -> (Vec<RouteFamily>, Vec<RouteFamily>) {
        let fsm = self.fsm.read();
        fsm.config.families().into_iter().partition(|family| {
            fsm.gr
                .families
                .get(family)
                .is_some_and(|state| state.received)
        })
    }

    // Splits the configured families into those with long-lived graceful
    // restart and the others.
    pub fn llgr_families(&self) -> (Vec<RouteFamily>, Vec<RouteFamily>) {
        let fsm = self.fsm.read();
        fsm.config.families().into_iter().partition(|family| {
            fsm.gr
                .families
                .get(family)
                .is_some_and(|state| state.llgr_received)
        })
    }

    // Whether LLGR stale paths of the family can be sent to this peer.
    pub fn is_llgr_enabled_family(&self, family: RouteFamily) -> bool {
        let fsm = self.fsm.read();
        fsm.gr.long_lived_enabled
            && fsm
                .gr
                .families
                .get(&family)
                .is_some_and(|state| state.llgr_received)
    }

    pub(crate) fn stop_peer_restarting(&mut self) {
        self.fsm.write().gr.peer_restarting = false;
        self.llgr_timers.clear();
    }

    pub fn snapshot(&self) -> PeerState {
        let fsm = self.fsm.read();
        PeerState {
            config: fsm.config.clone(),
            state: fsm.state,
            admin_state: fsm.admin_state,
            peer_as: fsm.peer_as(),
            peer_id: fsm.peer_info.id,
            local_as: fsm.local_as(),
            families: fsm.negotiated_families(),
            hold_time: fsm.hold_time,
            keepalive_interval: fsm.keepalive_interval,
            conn_info: fsm.conn_info,
            statistics: fsm.statistics.clone(),
            graceful_restart: fsm.gr.clone(),
            dynamic: self.dynamic,
        }
    }

    // Stops the peer's tasks. An established session sends the given
    // NOTIFICATION first.
    //
    // Returns a task that completes once the FSM exited, giving up after a
    // bounded time.
    pub(crate) fn shutdown(self, msg: Option<NotificationMsg>) -> Task<()> {
        let Peer {
            addr,
            outgoing,
            token,
            mut handler,
            ..
        } = self;

        // Without a writer to flush the NOTIFICATION, stop right away.
        if let (Some(outgoing), Some(msg)) = (outgoing, msg) {
            if outgoing.send(Outgoing::notification(msg)).is_err() {
                token.cancel();
            }
        } else {
            token.cancel();
        }

        let span = debug_span!("neighbor", %addr);
        Task::spawn(
            async move {
                tokio::select! {
                    _ = &mut handler => {}
                    _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
                        warn!("peer didn't stop in time");
                        token.cancel();
                    }
                }
            }
            .instrument(span),
        )
    }
}
