//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use bgpd_speaker::af::RouteFamily;
use bgpd_speaker::config::{AfiSafiConfig, NeighborConfig};
use bgpd_speaker::fsm::{State, StateReason};
use bgpd_speaker::packet::consts::{ErrorCode, WellKnownCommunities};
use bgpd_speaker::packet::message::{GrFlags, Message};
use bgpd_speaker::packet::nlri::Nlri;
use bgpd_speaker::path::Path;
use bgpd_speaker::server::BgpServer;
use bgpd_speaker::server::mgmt::TableType;
use bgpd_speaker::server::watch::{PeerStateEvent, WatchEvent, WatchOptions};
use bgpd_utils::UnboundedReceiver;
use common::*;
use const_addrs::{ip4, net4};

fn gr_neighbor(addr: Ipv4Addr, asn: u32) -> NeighborConfig {
    let mut config = neighbor(addr, asn);
    config.graceful_restart.enabled = true;
    config
}

async fn watch_peer_state(
    server: &BgpServer,
) -> UnboundedReceiver<WatchEvent> {
    let options = WatchOptions {
        peer_state: true,
        ..Default::default()
    };
    server.watch(options).await.unwrap()
}

async fn next_state_event(
    rx: &mut UnboundedReceiver<WatchEvent>,
    addr: IpAddr,
) -> PeerStateEvent {
    loop {
        match within(rx.recv()).await.unwrap() {
            WatchEvent::PeerState(event) if event.addr == addr => {
                return event;
            }
            _ => continue,
        }
    }
}

async fn global_paths(server: &BgpServer) -> Vec<Path> {
    server
        .list_path(TableType::Global, RouteFamily::Ipv4Unicast)
        .await
        .unwrap()
}

async fn wait_global_paths(server: &BgpServer, count: usize) {
    within(async {
        while global_paths(server).await.len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

#[tokio::test]
async fn stale_paths_until_end_of_rib() {
    let server = start_server().await;
    let config = gr_neighbor(ip4!("10.0.1.1"), 65001);
    let addr = config.address;
    server.add_peer(config).await.unwrap();
    let mut a = connect(&server, addr, 65001).await;
    let open = gr_open(a.asn, a.router_id, 120, GrFlags::empty());
    a.handshake(&server, open).await;
    let mut b = establish(&server, ip4!("10.0.2.1"), 65002).await;

    a.announce(net4!("192.0.2.0/24"), a.attrs()).await;
    let update = b.recv_update().await;
    assert_eq!(reach_prefixes(&update).len(), 1);

    // Connection lost without a NOTIFICATION.
    let mut rx = watch_peer_state(&server).await;
    let (asn, router_id) = (a.asn, a.router_id);
    drop(a);

    let event = next_state_event(&mut rx, addr).await;
    assert_eq!(event.state, State::Idle);
    assert_eq!(event.reason, Some(StateReason::GracefulRestart));
    b.expect_no_withdrawal(Duration::from_millis(500)).await;
    let paths = global_paths(&server).await;
    assert_eq!(paths.len(), 1);
    assert!(paths[0].is_stale());

    // A single transition for the failure. The next one is the
    // reconnection attempt.
    let event = next_state_event(&mut rx, addr).await;
    assert_eq!(event.state, State::Active);
    let peers = server.list_peer(Some(addr)).await.unwrap();
    assert!(peers[0].graceful_restart.peer_restarting);

    let mut a = connect(&server, addr, asn).await;
    let open = gr_open(asn, router_id, 120, GrFlags::RESTARTING);
    a.handshake(&server, open).await;
    let paths = global_paths(&server).await;
    assert_eq!(paths.len(), 1);
    assert!(paths[0].is_stale());

    // Whatever wasn't refreshed before the End-of-RIB is gone.
    a.end_of_rib().await;
    let update = b.recv_withdrawal().await;
    assert_eq!(
        unreach_prefixes(&update),
        [Nlri::Ipv4Unicast(net4!("192.0.2.0/24"))]
    );
    assert!(global_paths(&server).await.is_empty());
    let peers = server.list_peer(Some(addr)).await.unwrap();
    assert!(!peers[0].graceful_restart.peer_restarting);
}

#[tokio::test]
async fn refreshed_paths_survive_end_of_rib() {
    let server = start_server().await;
    let config = gr_neighbor(ip4!("10.0.1.1"), 65001);
    let addr = config.address;
    server.add_peer(config).await.unwrap();
    let mut a = connect(&server, addr, 65001).await;
    let open = gr_open(a.asn, a.router_id, 120, GrFlags::empty());
    a.handshake(&server, open).await;

    a.announce(net4!("192.0.2.0/24"), a.attrs()).await;
    a.announce(net4!("198.51.100.0/24"), a.attrs()).await;
    wait_global_paths(&server, 2).await;
    let (asn, router_id) = (a.asn, a.router_id);
    drop(a);
    wait_state(&server, addr, State::Idle).await;

    let mut a = connect(&server, addr, asn).await;
    let open = gr_open(asn, router_id, 120, GrFlags::RESTARTING);
    a.handshake(&server, open).await;
    a.announce(net4!("192.0.2.0/24"), a.attrs()).await;
    a.end_of_rib().await;

    wait_global_paths(&server, 1).await;
    let paths = global_paths(&server).await;
    assert_eq!(paths[0].nlri, Nlri::Ipv4Unicast(net4!("192.0.2.0/24")));
    assert!(!paths[0].is_stale());
}

#[tokio::test]
async fn restart_timer_expiry() {
    let server = start_server().await;
    let config = gr_neighbor(ip4!("10.0.1.1"), 65001);
    let addr = config.address;
    server.add_peer(config).await.unwrap();
    let mut a = connect(&server, addr, 65001).await;
    let open = gr_open(a.asn, a.router_id, 1, GrFlags::empty());
    a.handshake(&server, open).await;
    let mut b = establish(&server, ip4!("10.0.2.1"), 65002).await;

    a.announce(net4!("192.0.2.0/24"), a.attrs()).await;
    let update = b.recv_update().await;
    assert_eq!(reach_prefixes(&update).len(), 1);

    let mut rx = watch_peer_state(&server).await;
    drop(a);
    let event = next_state_event(&mut rx, addr).await;
    assert_eq!(event.reason, Some(StateReason::GracefulRestart));

    // The neighbor didn't come back in time.
    let event = next_state_event(&mut rx, addr).await;
    assert_eq!(event.state, State::Idle);
    assert_eq!(event.reason, Some(StateReason::RestartTimerExpired));
    let update = b.recv_withdrawal().await;
    assert_eq!(
        unreach_prefixes(&update),
        [Nlri::Ipv4Unicast(net4!("192.0.2.0/24"))]
    );
    assert!(global_paths(&server).await.is_empty());
}

#[tokio::test]
async fn long_lived_stale_after_restart_timer() {
    let server = start_server().await;
    let mut config = gr_neighbor(ip4!("10.0.1.1"), 65001);
    config.graceful_restart.long_lived_enabled = true;
    config.afi_safis = vec![AfiSafiConfig {
        family: RouteFamily::Ipv4Unicast,
        long_lived_graceful_restart: true,
        llgr_restart_time: 3600,
        ..Default::default()
    }];
    let addr = config.address;
    server.add_peer(config).await.unwrap();
    let mut a = connect(&server, addr, 65001).await;
    let open = gr_open(a.asn, a.router_id, 1, GrFlags::empty());
    a.handshake(&server, with_llgr(open, 3600)).await;

    a.announce(net4!("192.0.2.0/24"), a.attrs()).await;
    let mut attrs = a.attrs();
    attrs.add_comm(WellKnownCommunities::NoLlgr as u32);
    a.announce(net4!("198.51.100.0/24"), attrs).await;
    wait_global_paths(&server, 2).await;

    let mut rx = watch_peer_state(&server).await;
    drop(a);
    loop {
        let event = next_state_event(&mut rx, addr).await;
        if event.reason == Some(StateReason::RestartTimerExpired) {
            break;
        }
    }

    // Paths opting out of long-lived retention are dropped, the others
    // are kept as LLGR stale.
    let paths = global_paths(&server).await;
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].nlri, Nlri::Ipv4Unicast(net4!("192.0.2.0/24")));
    assert!(paths[0].is_llgr_stale());
    let peers = server.list_peer(Some(addr)).await.unwrap();
    assert!(peers[0].graceful_restart.peer_restarting);
}

#[tokio::test]
async fn hold_timer_expiry() {
    let server = start_server().await;
    let config = neighbor(ip4!("10.0.1.1"), 65001);
    let addr = config.address;
    server.add_peer(config).await.unwrap();
    let mut a = connect(&server, addr, 65001).await;
    let mut open = open(a.asn, a.router_id);
    open.holdtime = 3;
    a.handshake(&server, open).await;
    let mut rx = watch_peer_state(&server).await;

    // No KEEPALIVEs from this side.
    let Message::Notification(msg) = a.recv_skip_keepalives().await else {
        panic!("NOTIFICATION expected");
    };
    assert_eq!(msg.error_code(), Some(ErrorCode::HoldTimerExpired));
    a.expect_closed().await;

    let event = next_state_event(&mut rx, addr).await;
    assert_eq!(event.state, State::Idle);
    assert_eq!(event.reason, Some(StateReason::HoldTimerExpired));
}
