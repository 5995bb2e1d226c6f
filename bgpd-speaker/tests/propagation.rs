//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod common;

use std::sync::Arc;

use bgpd_speaker::af::RouteFamily;
use bgpd_speaker::config::{AfiSafiConfig, PrefixLimitConfig};
use bgpd_speaker::fsm::{AdminState, State, StateReason};
use bgpd_speaker::packet::attribute::AsPath;
use bgpd_speaker::packet::consts::CeaseSubcode;
use bgpd_speaker::packet::message::{Message, MpReachNlri, UpdateMsg};
use bgpd_speaker::packet::nlri::Nlri;
use bgpd_speaker::path::{Path, PeerInfo};
use bgpd_speaker::server::mgmt::TableType;
use bgpd_speaker::server::watch::{WatchEvent, WatchOptions};
use common::*;
use const_addrs::{ip, ip4, net4};

#[tokio::test]
async fn ebgp_outbound_rewrite() {
    let server = start_server().await;
    let mut a = establish(&server, ip4!("10.0.1.1"), 65001).await;
    let mut b = establish(&server, ip4!("10.0.2.1"), 65002).await;

    let mut attrs = a.attrs();
    attrs.base.local_pref = Some(200);
    attrs.base.med = Some(10);
    a.announce(net4!("192.0.2.0/24"), attrs).await;

    let update = b.recv_update().await;
    assert_eq!(
        reach_prefixes(&update),
        [Nlri::Ipv4Unicast(net4!("192.0.2.0/24"))]
    );
    let attrs = update.attrs.unwrap();
    assert_eq!(attrs.base.as_path, AsPath::from_sequence([65000, 65001]));
    assert_eq!(attrs.base.nexthop, Some(ip!("10.0.2.254")));
    assert_eq!(attrs.base.local_pref, None);
    assert_eq!(attrs.base.med, None);
}

#[tokio::test]
async fn ibgp_split_horizon() {
    let server = start_server().await;
    let mut a = establish(&server, ip4!("10.0.1.1"), LOCAL_AS).await;
    let _b = establish(&server, ip4!("10.0.2.1"), LOCAL_AS).await;
    let mut c = establish(&server, ip4!("10.0.3.1"), 65003).await;

    a.announce(net4!("192.0.2.0/24"), a.attrs()).await;
    let update = c.recv_update().await;
    assert_eq!(
        reach_prefixes(&update),
        [Nlri::Ipv4Unicast(net4!("192.0.2.0/24"))]
    );

    // Paths learned over iBGP aren't sent to other iBGP neighbors.
    let family = RouteFamily::Ipv4Unicast;
    let adj_out_b = server
        .list_path(TableType::AdjOut(ip!("10.0.2.1")), family)
        .await
        .unwrap();
    assert!(adj_out_b.is_empty());
    let adj_out_c = server
        .list_path(TableType::AdjOut(ip!("10.0.3.1")), family)
        .await
        .unwrap();
    assert_eq!(adj_out_c.len(), 1);
}

#[tokio::test]
async fn implicit_withdraw() {
    let server = start_server().await;
    let mut a = establish(&server, ip4!("10.0.1.1"), LOCAL_AS).await;

    let mut attrs = a.attrs();
    attrs.base.med = Some(10);
    a.announce(net4!("192.0.2.0/24"), attrs.clone()).await;
    attrs.base.med = Some(20);
    a.announce(net4!("192.0.2.0/24"), attrs).await;

    // The second announcement replaces the first one.
    let family = RouteFamily::Ipv4Unicast;
    let paths = within(async {
        loop {
            let paths = server
                .list_path(TableType::Global, family)
                .await
                .unwrap();
            if paths.iter().any(|path| path.attrs.base.med == Some(20)) {
                return paths;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(paths.len(), 1);

    let table = server.get_table(TableType::Global, family).await.unwrap();
    assert_eq!(table.destinations, 1);
    assert_eq!(table.paths, 1);
}

#[tokio::test]
async fn withdraw_propagation() {
    let server = start_server().await;
    let mut a = establish(&server, ip4!("10.0.1.1"), 65001).await;
    let mut b = establish(&server, ip4!("10.0.2.1"), 65002).await;

    a.announce(net4!("192.0.2.0/24"), a.attrs()).await;
    let update = b.recv_update().await;
    assert_eq!(reach_prefixes(&update).len(), 1);

    a.withdraw(net4!("192.0.2.0/24")).await;
    let update = b.recv_update().await;
    assert_eq!(
        unreach_prefixes(&update),
        [Nlri::Ipv4Unicast(net4!("192.0.2.0/24"))]
    );
}

#[tokio::test]
async fn prefix_limit() {
    let server = start_server().await;
    let mut config = neighbor(ip4!("10.0.1.1"), 65001);
    config.afi_safis = vec![AfiSafiConfig {
        family: RouteFamily::Ipv4Unicast,
        prefix_limit: PrefixLimitConfig {
            max_prefixes: 1,
            warning_threshold_pct: 0,
        },
        ..Default::default()
    }];
    let mut a = establish_with(&server, config).await;
    let options = WatchOptions {
        peer_state: true,
        ..Default::default()
    };
    let mut rx = server.watch(options).await.unwrap();

    // Everything past the limit arrives at once.
    let updates = ["192.0.2.0/24", "198.51.100.0/24", "203.0.113.0/24"]
        .into_iter()
        .map(|prefix| {
            let msg = UpdateMsg {
                reach: Some(MpReachNlri {
                    family: RouteFamily::Ipv4Unicast,
                    prefixes: vec![entry(prefix.parse().unwrap())],
                }),
                unreach: None,
                attrs: Some(a.attrs()),
            };
            Message::Update(msg)
        })
        .collect();
    a.send_batch(updates).await;

    // A single NOTIFICATION, however many UPDATEs follow.
    let notifications = a
        .recv_until_closed()
        .await
        .into_iter()
        .filter_map(|msg| match msg {
            Message::Notification(msg) => Some(msg),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(notifications.len(), 1);
    let msg = &notifications[0];
    assert!(msg.is_cease(CeaseSubcode::MaximumNumberofPrefixesReached));

    let event = loop {
        match within(rx.recv()).await.unwrap() {
            WatchEvent::PeerState(event) if event.state == State::Idle => {
                break event;
            }
            _ => continue,
        }
    };
    assert_eq!(event.reason, Some(StateReason::NotificationSent(msg.clone())));

    // The neighbor stays down.
    wait_state(&server, a.addr, State::Idle).await;
    let peers = server.list_peer(Some(a.addr)).await.unwrap();
    assert_eq!(peers[0].admin_state, AdminState::PfxCt);
}

#[tokio::test]
async fn delete_peer_withdraws_routes() {
    let server = start_server().await;
    let mut a = establish(&server, ip4!("10.0.1.1"), 65001).await;
    let mut b = establish(&server, ip4!("10.0.2.1"), 65002).await;

    a.announce(net4!("192.0.2.0/24"), a.attrs()).await;
    let update = b.recv_update().await;
    assert_eq!(reach_prefixes(&update).len(), 1);

    server
        .delete_peer(a.addr, "decommissioned".to_owned())
        .await
        .unwrap();

    let Message::Notification(msg) = a.recv_skip_keepalives().await else {
        panic!("NOTIFICATION expected");
    };
    // The reason text is only carried by an administrative shutdown.
    assert!(msg.is_cease(CeaseSubcode::AdministrativeShutdown));
    assert_eq!(
        msg.communication().map(|(text, _)| text).as_deref(),
        Some("decommissioned")
    );

    let update = b.recv_update().await;
    assert_eq!(
        unreach_prefixes(&update),
        [Nlri::Ipv4Unicast(net4!("192.0.2.0/24"))]
    );
    assert!(server.list_peer(Some(a.addr)).await.unwrap().is_empty());
}

#[tokio::test]
async fn local_origination() {
    let server = start_server().await;
    let mut b = establish(&server, ip4!("10.0.2.1"), 65002).await;

    let nlri = Nlri::Ipv4Unicast(net4!("203.0.113.0/24"));
    let source = Arc::new(PeerInfo::local(LOCAL_AS, ROUTER_ID));
    let attrs = attrs(AsPath::default(), ip!("192.0.2.1"));
    let path = Path::new(source, nlri, 0, Arc::new(attrs), false);
    server.add_path(None, vec![path]).await.unwrap();

    let update = b.recv_update().await;
    assert_eq!(reach_prefixes(&update), [nlri]);
    let attrs = update.attrs.unwrap();
    assert_eq!(attrs.base.as_path, AsPath::from_sequence([LOCAL_AS]));

    // Withdraw everything originated locally.
    server.delete_path(None, None).await.unwrap();
    let update = b.recv_update().await;
    assert_eq!(unreach_prefixes(&update), [nlri]);
}

#[tokio::test]
async fn watch_best_path() {
    let server = start_server().await;
    let mut a = establish(&server, ip4!("10.0.1.1"), 65001).await;

    let options = WatchOptions {
        best_path: true,
        ..Default::default()
    };
    let mut rx = server.watch(options).await.unwrap();

    a.announce(net4!("192.0.2.0/24"), a.attrs()).await;
    let event = within(rx.recv()).await.unwrap();
    let WatchEvent::BestPath(event) = event else {
        panic!("best path event expected");
    };
    assert_eq!(event.paths.len(), 1);
    assert_eq!(
        event.paths[0].path.nlri,
        Nlri::Ipv4Unicast(net4!("192.0.2.0/24"))
    );
    assert_eq!(event.paths[0].path.source.address, Some(a.addr));
}
