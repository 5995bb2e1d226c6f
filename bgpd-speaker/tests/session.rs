//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod common;

use std::net::SocketAddr;

use bgpd_speaker::af::RouteFamily;
use bgpd_speaker::config::{
    AfiSafiConfig, DynamicNeighborConfig, GlobalConfig, PeerGroupConfig,
};
use bgpd_speaker::error::Error;
use bgpd_speaker::fsm::{AdminState, State};
use bgpd_speaker::network::Connection;
use bgpd_speaker::packet::consts::{
    CeaseSubcode, ErrorCode, OpenMessageErrorSubcode,
};
use bgpd_speaker::packet::message::{KeepaliveMsg, Message};
use bgpd_speaker::server::BgpServer;
use common::*;
use const_addrs::{ip, ip4, net};

#[tokio::test]
async fn not_started() {
    let server = BgpServer::new();
    let result = server.list_peer(None).await;
    assert!(matches!(result, Err(Error::NotStarted)));
    let result = server.stop_bgp().await;
    assert!(matches!(result, Err(Error::NotStarted)));
}

#[tokio::test]
async fn start_stop() {
    let server = start_server().await;
    let result = server.start_bgp(GlobalConfig::default()).await;
    assert!(matches!(result, Err(Error::AlreadyStarted)));

    let config = server.get_bgp().await.unwrap();
    assert_eq!(config.asn, LOCAL_AS);

    server.stop_bgp().await.unwrap();
    let result = server.get_bgp().await;
    assert!(matches!(result, Err(Error::NotStarted)));
}

#[tokio::test]
async fn invalid_global_config() {
    let server = BgpServer::new();
    let result = server.start_bgp(GlobalConfig::default()).await;
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[tokio::test]
async fn peer_management() {
    let server = start_server().await;
    let addr = ip4!("10.0.1.1");
    server.add_peer(neighbor(addr, 65001)).await.unwrap();

    let result = server.add_peer(neighbor(addr, 65001)).await;
    assert!(matches!(result, Err(Error::PeerExists(_))));

    // IPv6 unicast isn't enabled globally.
    let mut config = neighbor(addr, 65001);
    config.afi_safis = vec![AfiSafiConfig {
        family: RouteFamily::Ipv6Unicast,
        ..Default::default()
    }];
    let result = server.update_peer(config).await;
    assert!(matches!(result, Err(Error::FamilyNotConfigured(_))));

    let result = server.delete_peer(ip!("10.0.9.9"), String::new()).await;
    assert!(matches!(result, Err(Error::PeerNotFound(_))));

    server.delete_peer(addr.into(), String::new()).await.unwrap();
    assert!(server.list_peer(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn session_establishment() {
    let server = start_server().await;
    let peer = establish(&server, ip4!("10.0.1.1"), 65001).await;

    let peers = server.list_peer(Some(peer.addr)).await.unwrap();
    let state = &peers[0];
    assert_eq!(state.state, State::Established);
    assert_eq!(state.peer_as, 65001);
    assert_eq!(state.peer_id, ip4!("10.0.1.1"));
    assert_eq!(state.hold_time, 90);
    assert_eq!(state.keepalive_interval, 30);
    assert!(!state.dynamic);
}

#[tokio::test]
async fn bad_peer_as() {
    let server = start_server().await;
    let addr = ip4!("10.0.1.1");
    server.add_peer(neighbor(addr, 65001)).await.unwrap();
    let mut peer = connect(&server, addr.into(), 65009).await;

    assert!(matches!(peer.recv().await, Message::Open(_)));
    peer.send(Message::Open(open(65009, addr))).await;

    let Message::Notification(msg) = peer.recv().await else {
        panic!("NOTIFICATION expected");
    };
    assert_eq!(msg.error_code, ErrorCode::OpenMessageError as u8);
    assert_eq!(
        msg.error_subcode,
        OpenMessageErrorSubcode::BadPeerAs as u8
    );
    wait_state(&server, addr.into(), State::Idle).await;
}

#[tokio::test]
async fn admin_shutdown() {
    let server = start_server().await;
    let mut peer = establish(&server, ip4!("10.0.1.1"), 65001).await;
    let addr = peer.addr;

    server
        .disable_peer(addr, "maintenance".to_owned())
        .await
        .unwrap();
    let Message::Notification(msg) = peer.recv_skip_keepalives().await else {
        panic!("NOTIFICATION expected");
    };
    assert!(msg.is_cease(CeaseSubcode::AdministrativeShutdown));
    assert_eq!(
        msg.communication().map(|(text, _)| text).as_deref(),
        Some("maintenance")
    );
    wait_state(&server, addr, State::Idle).await;

    let peers = server.list_peer(Some(addr)).await.unwrap();
    assert_eq!(peers[0].admin_state, AdminState::Down);
    let result = server.disable_peer(addr, String::new()).await;
    assert!(matches!(result, Err(Error::AdminStateUnchanged(_))));

    // The session can be brought up again.
    server.enable_peer(addr).await.unwrap();
    wait_state(&server, addr, State::Active).await;
}

#[tokio::test]
async fn peer_deconfigured() {
    let server = start_server().await;
    let mut peer = establish(&server, ip4!("10.0.1.1"), 65001).await;

    server.delete_peer(peer.addr, String::new()).await.unwrap();
    let Message::Notification(msg) = peer.recv_skip_keepalives().await else {
        panic!("NOTIFICATION expected");
    };
    assert!(msg.is_cease(CeaseSubcode::PeerDeConfigured));
    assert!(msg.communication().is_none());
    peer.expect_closed().await;
}

#[tokio::test]
async fn peer_groups() {
    let server = start_server().await;
    let group = PeerGroupConfig {
        name: "transit".to_owned(),
        peer_as: 65001,
        ..Default::default()
    };
    server.add_peer_group(group.clone()).await.unwrap();
    let result = server.add_peer_group(group).await;
    assert!(matches!(result, Err(Error::PeerGroupExists(_))));

    // Members inherit the group settings.
    let mut config = neighbor(ip4!("10.0.1.1"), 0);
    config.peer_group = Some("transit".to_owned());
    server.add_peer(config).await.unwrap();
    let peers = server.list_peer(None).await.unwrap();
    assert_eq!(peers[0].config.peer_as, 65001);

    let result = server.delete_peer_group("transit".to_owned()).await;
    assert!(matches!(result, Err(Error::PeerGroupInUse(_))));

    server
        .delete_peer(ip!("10.0.1.1"), String::new())
        .await
        .unwrap();
    server
        .delete_peer_group("transit".to_owned())
        .await
        .unwrap();
}

#[tokio::test]
async fn dynamic_neighbor() {
    let server = start_server().await;
    let group = PeerGroupConfig {
        name: "customers".to_owned(),
        peer_as: 65010,
        ..Default::default()
    };
    server.add_peer_group(group).await.unwrap();
    let dynamic = DynamicNeighborConfig {
        prefix: net!("10.9.0.0/16"),
        peer_group: "customers".to_owned(),
    };
    server.add_dynamic_neighbor(dynamic.clone()).await.unwrap();
    let result = server.add_dynamic_neighbor(dynamic).await;
    assert!(matches!(result, Err(Error::DynamicNeighborExists(_))));

    // An inbound connection from the prefix creates the neighbor.
    let addr = ip!("10.9.0.5");
    let local = SocketAddr::new(ip!("10.9.0.254"), 179);
    let (conn, stream) = Connection::memory(Some(local), (addr, 40000).into());
    server.accept(conn).await.unwrap();
    let mut peer = TestPeer::new(addr, 65010, stream);

    assert!(matches!(peer.recv().await, Message::Open(_)));
    peer.send(Message::Open(open(65010, ip4!("10.9.0.5")))).await;
    assert!(matches!(peer.recv().await, Message::Keepalive(_)));
    peer.send(Message::Keepalive(KeepaliveMsg {})).await;
    wait_state(&server, addr, State::Established).await;

    let peers = server.list_peer(Some(addr)).await.unwrap();
    assert!(peers[0].dynamic);
    assert_eq!(peers[0].config.peer_group.as_deref(), Some("customers"));

    // Dynamic neighbors go away with their session.
    drop(peer);
    within(async {
        while !server.list_peer(Some(addr)).await.unwrap().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn unknown_neighbor_rejected() {
    let server = start_server().await;
    let addr = ip!("10.0.7.7");
    let (conn, stream) =
        Connection::memory(None, SocketAddr::new(addr, 40000));
    server.accept(conn).await.unwrap();

    let mut peer = TestPeer::new(addr, 65007, stream);
    peer.expect_closed().await;
    assert!(server.list_peer(None).await.unwrap().is_empty());
}
