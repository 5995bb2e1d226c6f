//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;
use std::sync::Arc;

use bgpd_utils::{UnboundedReceiver, UnboundedSender};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::af::RouteFamily;
use crate::debug::Debug;
use crate::fsm::{AdminState, State, StateReason};
use crate::packet::consts::{CeaseSubcode, ErrorCode};
use crate::packet::message::{
    Message, NotificationMsg, RouteRefreshMsg, UpdateMsg,
};
use crate::path::Path;
use crate::peer::{Peer, Peers};
use crate::server::propagate::{
    best_from_local, is_own_as_looped, propagate_update, soft_reset_in,
    soft_reset_out,
};
use crate::server::watch::{
    MessageEvent, PeerStateEvent, UpdateEvent, WatchEvent,
};
use crate::server::{ServerState, ServerUpView};
use crate::tasks;
use crate::tasks::messages::input::{FsmEvent, FsmMsg, TimerMsg};
use crate::tasks::messages::output::{Outgoing, Resume};
use crate::validation::RoaEvent;

// ===== global functions =====

pub(crate) fn process_fsm_msg(
    server: &mut ServerUpView<'_>,
    peers: &mut Peers,
    msg: FsmMsg,
) {
    let FsmMsg {
        addr,
        version,
        timestamp,
        event,
    } = msg;

    // Events of deleted peers or of older sessions are ignored.
    let Some(peer) = peers.get(&addr) else {
        return;
    };
    if peer.fsm.read().version != version {
        debug!(%addr, %version, "ignoring stale FSM event");
        return;
    }

    match event {
        FsmEvent::StateChange { state, reason } => {
            process_state_change(server, peers, addr, state, reason);
        }
        FsmEvent::Update { msg, paths, eor } => {
            process_update(server, peers, addr, timestamp, msg, paths, eor);
        }
        FsmEvent::RouteRefresh(family) => {
            process_route_refresh(server, peers, addr, timestamp, family);
        }
        FsmEvent::MessageError(error) => {
            let msg = NotificationMsg::from(&error);
            peer.send_notification(msg, false);
        }
    }
}

pub(crate) fn process_timer_msg(
    server: &mut ServerUpView<'_>,
    peers: &mut Peers,
    msg: TimerMsg,
) {
    match msg {
        TimerMsg::LlgrExpired { addr, family } => {
            let Some(peer) = peers.get_mut(&addr) else {
                return;
            };
            if peer.llgr_timers.remove(&family).is_none() {
                return;
            }
            Debug::LlgrExpired(&addr, family).log();

            peer.fsm
                .write()
                .gr
                .families
                .entry(family)
                .or_default()
                .llgr_expired = true;
            let withdrawals = peer.adj_rib_in.drop(&[family]);
            if peer.llgr_timers.is_empty() {
                peer.stop_peer_restarting();
            }
            propagate_update(server, peers, Some(addr), withdrawals);
        }
        TimerMsg::RtcDeferralExpired(addr) => {
            let Some(peer) = peers.get_mut(&addr) else {
                return;
            };
            if peer.rtc_deferral.take().is_none() || !peer.is_established() {
                return;
            }
            debug!(%addr, "route target deferral expired");
            send_non_rtc_families(server.state, peer);
        }
        TimerMsg::SelectionDeferralExpired => {
            if server.state.selection_deferral.is_none() {
                return;
            }
            Debug::SelectionDeferralExpired.log();
            finish_local_restart(server, peers);
        }
    }
}

// A change of the ROA table affects the validation state of every path, so
// the affected neighbors are soft-reset in both directions.
pub(crate) fn process_roa_event(
    server: &mut ServerUpView<'_>,
    peers: &mut Peers,
    event: RoaEvent,
) {
    if !server.state.validator.apply(event) {
        return;
    }

    let addrs = peers.keys().copied().collect::<Vec<_>>();
    for addr in addrs {
        let families = peers[&addr].configured_families();
        soft_reset_in(server, peers, addr, &families);
    }
    for peer in peers.values() {
        soft_reset_out(server.state, peer, &peer.negotiated_families());
    }
}

// ===== helper functions =====

fn process_state_change(
    server: &mut ServerUpView<'_>,
    peers: &mut Peers,
    addr: IpAddr,
    state: State,
    reason: StateReason,
) {
    let Some(peer) = peers.get(&addr) else {
        return;
    };
    let old_state = {
        let mut fsm = peer.fsm.write();
        let old_state = fsm.state;
        fsm.set_state(state);
        if state == State::Idle {
            fsm.reset_negotiated();
        }
        old_state
    };
    Debug::FsmTransition(&addr, &old_state, &state, &reason).log();

    if old_state == State::Established {
        peer_down(server, peers, addr, &reason);
    } else if state == State::Idle
        && reason == StateReason::RestartTimerExpired
    {
        restart_timer_expired(server, peers, addr);
    }

    // Dynamic peers only live as long as their session.
    if state == State::Idle && peers.get(&addr).is_some_and(|p| p.dynamic) {
        remove_dynamic_peer(server, peers, addr, reason);
        return;
    }

    let mut resume = Resume::default();
    if state == State::Established {
        resume.outgoing = Some(peer_up(server, peers, addr));
    }

    let Some(peer) = peers.get(&addr) else {
        return;
    };
    let event = PeerStateEvent::new(peer, Some(reason));
    server.watchers.notify(WatchEvent::PeerState(event));
    peer.resume(resume);
}

// Session went down: the peer's paths are withdrawn, or retained as stale
// when the peer is gracefully restarting.
fn peer_down(
    server: &mut ServerUpView<'_>,
    peers: &mut Peers,
    addr: IpAddr,
    reason: &StateReason,
) {
    let Some(peer) = peers.get_mut(&addr) else {
        return;
    };
    peer.outgoing = None;
    peer.prefix_limit_warned.clear();

    let graceful = *reason == StateReason::GracefulRestart && !peer.dynamic;
    let (stale, drop) = if graceful {
        peer.fsm.write().gr.peer_restarting = true;
        Debug::PeerRestarting(&addr).log();
        let (preserved, drop) = peer.forwarding_preserved_families();
        (peer.adj_rib_in.stale_all(&preserved), drop)
    } else {
        (vec![], peer.configured_families())
    };
    for state in peer.fsm.write().gr.families.values_mut() {
        state.eor_received = false;
        state.eor_sent = false;
    }
    let withdrawals = peer.adj_rib_in.drop(&drop);

    propagate_update(server, peers, Some(addr), stale);
    propagate_update(server, peers, Some(addr), withdrawals);

    // A neighbor accepted with any AS learns it again on the next session.
    if let Some(peer) = peers.get(&addr) {
        let mut fsm = peer.fsm.write();
        if fsm.config.peer_as == 0 {
            let mut info = (*fsm.peer_info).clone();
            info.asn = 0;
            fsm.peer_info = Arc::new(info);
        }
    }
}

// The restarting peer didn't come back in time. Families with long-lived
// graceful restart keep their paths as LLGR stale until their own timers
// expire; the other paths are removed.
fn restart_timer_expired(
    server: &mut ServerUpView<'_>,
    peers: &mut Peers,
    addr: IpAddr,
) {
    let Some(peer) = peers.get_mut(&addr) else {
        return;
    };
    let (peer_restarting, long_lived) = {
        let fsm = peer.fsm.read();
        (fsm.gr.peer_restarting, fsm.gr.long_lived_enabled)
    };
    if !peer_restarting {
        return;
    }

    let (llgr, no_llgr) = if long_lived {
        peer.llgr_families()
    } else {
        (vec![], peer.configured_families())
    };
    let withdrawals = peer.adj_rib_in.drop(&no_llgr);
    let stale = peer.adj_rib_in.mark_llgr_stale_or_drop(&llgr);
    if llgr.is_empty() {
        peer.stop_peer_restarting();
    }
    for family in llgr {
        let restart_time = peer
            .fsm
            .read()
            .gr
            .families
            .get(&family)
            .map(|state| state.llgr_restart_time)
            .unwrap_or(0);
        Debug::LlgrStart(&addr, family, restart_time).log();
        let timer =
            tasks::llgr_timer(addr, family, restart_time, &server.tx.timer);
        peer.llgr_timers.insert(family, timer);
    }

    propagate_update(server, peers, Some(addr), withdrawals);
    propagate_update(server, peers, Some(addr), stale);
}

// Session came up: the peer gets its outgoing queue and the initial table
// dump, unless route selection is deferred.
fn peer_up(
    server: &mut ServerUpView<'_>,
    peers: &mut Peers,
    addr: IpAddr,
) -> (UnboundedSender<Outgoing>, UnboundedReceiver<Outgoing>) {
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let Some(peer) = peers.get_mut(&addr) else {
        return (outgoing_tx, outgoing_rx);
    };
    peer.outgoing = Some(outgoing_tx.clone());

    let (local_restarting, peer_restarting) = {
        let fsm = peer.fsm.read();
        (fsm.gr.local_restarting, fsm.gr.peer_restarting)
    };
    if !local_restarting {
        let families = peer.negotiated_families();
        let rtc = RouteFamily::RouteTargetConstraint;
        let deferral = peer.rtc_deferral_time();
        if families.contains(&rtc) && !peer_restarting && deferral > 0 {
            // Route target memberships go first. The other families wait
            // for the neighbor's RTC End-of-RIB, so that its outbound filter
            // is known.
            send_table(server.state, peer, &[rtc]);
            let msg = TimerMsg::RtcDeferralExpired(addr);
            let timer =
                tasks::deferral_timer(msg, deferral, &server.tx.timer);
            peer.rtc_deferral = Some(timer);
        } else {
            send_table(server.state, peer, &families);
        }
    } else if peers.values().all(Peer::recvd_all_eor) {
        finish_local_restart(server, peers);
    } else if server.state.selection_deferral.is_none() {
        let deferral = server.state.config.graceful_restart.deferral_time;
        debug!(%deferral, "deferring route selection");
        let msg = TimerMsg::SelectionDeferralExpired;
        let timer = tasks::deferral_timer(msg, deferral, &server.tx.timer);
        server.state.selection_deferral = Some(timer);
    }

    (outgoing_tx, outgoing_rx)
}

fn remove_dynamic_peer(
    server: &mut ServerUpView<'_>,
    peers: &mut Peers,
    addr: IpAddr,
    reason: StateReason,
) {
    let Some(mut peer) = peers.remove(&addr) else {
        return;
    };
    peer.stop_peer_restarting();

    let event = PeerStateEvent::new(&peer, Some(reason));
    server.watchers.notify(WatchEvent::PeerState(event));

    let group = peer.fsm.read().config.peer_group.clone();
    if let Some(group) = group
        .as_ref()
        .and_then(|name| server.state.peer_groups.get_mut(name))
    {
        group.members.remove(&addr);
    }

    Debug::PeerDelete(&addr).log();
    peer.shutdown(None).detach();
}

#[allow(clippy::too_many_arguments)]
fn process_update(
    server: &mut ServerUpView<'_>,
    peers: &mut Peers,
    addr: IpAddr,
    timestamp: DateTime<Utc>,
    msg: UpdateMsg,
    paths: Vec<Path>,
    eor: Option<RouteFamily>,
) {
    let Some(peer) = peers.get_mut(&addr) else {
        return;
    };
    let (local_as, allow_own_as, ibgp, router_id) = {
        let mut fsm = peer.fsm.write();
        fsm.statistics.update_recv_time = Some(timestamp);
        (
            fsm.local_as(),
            fsm.config.as_path_options.allow_own_as,
            fsm.is_ibgp(),
            fsm.peer_info.local_id,
        )
    };

    if server.watchers.message() {
        let msg = Message::Update(msg.clone());
        let event = MessageEvent {
            addr,
            timestamp,
            msg,
        };
        server.watchers.notify(WatchEvent::Message(event));
    }
    if server.watchers.pre_update() {
        let event = UpdateEvent::new(peer, false, Some(msg), paths.clone());
        server.watchers.notify(WatchEvent::Update(event));
    }

    // Paths looping through the local AS are kept in the Adj-RIB-In but
    // excluded from route selection.
    let paths = paths
        .into_iter()
        .map(|path| {
            let looped = !path.is_withdraw()
                && is_own_as_looped(&path, local_as, allow_own_as);
            path.with_as_looped(looped)
        })
        .collect();
    let paths = peer
        .adj_rib_in
        .update(paths)
        .into_iter()
        .map(|path| {
            // RFC 4456 - Section 8: a route carrying the local router ID
            // as its ORIGINATOR_ID is ignored.
            let reflected =
                ibgp && path.attrs.base.originator_id == Some(router_id);
            if reflected && !path.is_withdraw() {
                debug!(%addr, nlri = %path.nlri, "originator ID is mine");
            }
            if path.is_as_looped() || reflected {
                path.as_withdrawal()
            } else {
                path
            }
        })
        .collect::<Vec<_>>();

    if prefix_limit_exceeded(peer) {
        return;
    }

    propagate_update(server, peers, Some(addr), paths);
    if let Some(family) = eor {
        process_eor(server, peers, addr, family);
    }
}

// Enforces the per-family prefix limits of a peer. Once a limit is
// exceeded the session is closed and kept down.
fn prefix_limit_exceeded(peer: &mut Peer) -> bool {
    let addr = peer.addr;
    // The session is already being torn down.
    if peer.fsm.read().admin_state == AdminState::PfxCt {
        return true;
    }
    for family in peer.configured_families() {
        let Some(limit) = peer.fsm.read().config.prefix_limit(family).cloned()
        else {
            continue;
        };
        let max_prefixes = limit.max_prefixes as usize;
        let count = peer.adj_rib_in.count(&[family]);

        let pct = usize::from(limit.warning_threshold_pct);
        if pct > 0
            && count > max_prefixes * pct / 100
            && peer.prefix_limit_warned.insert(family)
        {
            warn!(%addr, %family, %count, "prefix limit {}% reached", pct);
        }
        if count > max_prefixes {
            warn!(
                %addr, %family, %count, %max_prefixes,
                "prefix limit reached"
            );
            let msg = NotificationMsg::new(
                ErrorCode::Cease,
                CeaseSubcode::MaximumNumberofPrefixesReached,
            );
            peer.fsm.write().admin_state = AdminState::PfxCt;
            peer.send_notification(msg, true);
            return true;
        }
    }
    false
}

fn process_eor(
    server: &mut ServerUpView<'_>,
    peers: &mut Peers,
    addr: IpAddr,
    family: RouteFamily,
) {
    Debug::EorRx(&addr, family).log();
    let Some(peer) = peers.get(&addr) else {
        return;
    };
    let (local_restarting, peer_restarting) = {
        let mut fsm = peer.fsm.write();
        fsm.gr.families.entry(family).or_default().eor_received = true;
        (fsm.gr.local_restarting, fsm.gr.peer_restarting)
    };
    let mut rtc = family == RouteFamily::RouteTargetConstraint;

    // RFC 4724 - Section 4.1: the restarting speaker defers route selection
    // until every peer sent its End-of-RIB markers.
    if local_restarting {
        if peers.values().all(Peer::recvd_all_eor) {
            finish_local_restart(server, peers);
        }
        rtc = false;
    }

    let Some(peer) = peers.get_mut(&addr) else {
        return;
    };
    if peer_restarting {
        if peer.recvd_all_eor() {
            peer.stop_peer_restarting();
            Debug::PeerRestartFinished(&addr).log();
            let families = peer.configured_families();
            let withdrawals = peer.adj_rib_in.drop_stale(&families);
            debug!(%addr, count = %withdrawals.len(), "dropping stale routes");
            propagate_update(server, peers, Some(addr), withdrawals);
        }
        return;
    }

    // The neighbor's route target memberships are complete. The families
    // held back can be sent now.
    if rtc && peer.rtc_deferral.take().is_some() {
        debug!(%addr, "route target End-of-RIB received");
        send_non_rtc_families(server.state, peer);
    }
}

fn process_route_refresh(
    server: &mut ServerUpView<'_>,
    peers: &Peers,
    addr: IpAddr,
    timestamp: DateTime<Utc>,
    family: RouteFamily,
) {
    let Some(peer) = peers.get(&addr) else {
        return;
    };

    if server.watchers.message() {
        let msg = Message::RouteRefresh(RouteRefreshMsg::new(family));
        let event = MessageEvent {
            addr,
            timestamp,
            msg,
        };
        server.watchers.notify(WatchEvent::Message(event));
    }

    if !peer.is_negotiated(family) {
        warn!(%addr, %family, "route refresh for a family not negotiated");
        return;
    }
    if !peer.fsm.read().route_refresh {
        warn!(%addr, "route refresh capability wasn't negotiated");
        return;
    }
    let (paths, _) = best_from_local(server.state, peer, &[family]);
    peer.send(Outgoing::paths(paths));
}

// Ends the route selection deferral of a restarting speaker: every
// established peer receives its table.
fn finish_local_restart(server: &mut ServerUpView<'_>, peers: &Peers) {
    server.state.selection_deferral = None;
    for peer in peers.values() {
        peer.fsm.write().gr.local_restarting = false;
    }
    for peer in peers.values().filter(|peer| peer.is_established()) {
        send_table(server.state, peer, &peer.negotiated_families());
    }
    debug!("route selection deferral finished");
}

// Sends the best paths of the given families, followed by their End-of-RIB
// markers when graceful restart was negotiated.
fn send_table(state: &ServerState, peer: &Peer, families: &[RouteFamily]) {
    let (paths, _) = best_from_local(state, peer, families);
    let eor = if peer.fsm.read().gr.enabled {
        families.to_vec()
    } else {
        vec![]
    };
    peer.send(Outgoing {
        paths,
        eor,
        ..Default::default()
    });
}

fn send_non_rtc_families(state: &ServerState, peer: &Peer) {
    let families = peer
        .negotiated_families()
        .into_iter()
        .filter(|family| *family != RouteFamily::RouteTargetConstraint)
        .collect::<Vec<_>>();
    send_table(state, peer, &families);
}
