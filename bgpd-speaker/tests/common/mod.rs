//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![allow(dead_code)]

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bgpd_speaker::af::RouteFamily;
use bgpd_speaker::config::{GlobalConfig, NeighborConfig};
use bgpd_speaker::fsm::State;
use bgpd_speaker::network::Connection;
use bgpd_speaker::packet::attribute::{AsPath, Attrs, BaseAttrs};
use bgpd_speaker::packet::codec::{CodecCxt, JsonCodec, MessageCodec};
use bgpd_speaker::packet::consts::Origin;
use bgpd_speaker::packet::message::{
    Capability, GrFlags, GrTuple, GrTupleFlags, KeepaliveMsg, LlgrTuple,
    Message, MpReachNlri, MpUnreachNlri, NlriEntry, OpenMsg, UpdateMsg,
};
use bgpd_speaker::packet::nlri::Nlri;
use bgpd_speaker::server::BgpServer;
use bytes::BytesMut;
use ipnetwork::Ipv4Network;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const LOCAL_AS: u32 = 65000;
pub const ROUTER_ID: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);

// Upper bound for anything the tests wait on. Reconnections go through the
// idle hold time first.
const TIMEOUT: Duration = Duration::from_secs(10);

// Remote end of a session, driven by the test.
pub struct TestPeer {
    pub addr: IpAddr,
    pub asn: u32,
    pub router_id: Ipv4Addr,
    stream: DuplexStream,
    buf: BytesMut,
    cxt: CodecCxt,
}

// ===== impl TestPeer =====

impl TestPeer {
    pub fn new(addr: IpAddr, asn: u32, stream: DuplexStream) -> TestPeer {
        let router_id = match addr {
            IpAddr::V4(addr) => addr,
            IpAddr::V6(_) => Ipv4Addr::new(10, 255, 255, 1),
        };
        TestPeer {
            addr,
            asn,
            router_id,
            stream,
            buf: BytesMut::new(),
            cxt: CodecCxt::default(),
        }
    }

    pub async fn send(&mut self, msg: Message) {
        let data = JsonCodec.encode(&msg, &self.cxt);
        self.stream.write_all(&data).await.unwrap();
    }

    // Sends several messages in a single write.
    pub async fn send_batch(&mut self, msgs: Vec<Message>) {
        let mut data = BytesMut::new();
        for msg in &msgs {
            data.extend_from_slice(&JsonCodec.encode(msg, &self.cxt));
        }
        self.stream.write_all(&data).await.unwrap();
    }

    pub async fn recv(&mut self) -> Message {
        within(async {
            loop {
                if let Some(len) = JsonCodec.message_len(&self.buf).unwrap() {
                    let data = self.buf.split_to(len);
                    return JsonCodec.decode(&data, &self.cxt).unwrap();
                }
                let n = self.stream.read_buf(&mut self.buf).await.unwrap();
                assert_ne!(n, 0, "session closed");
            }
        })
        .await
    }

    // Waits for the server to close the connection.
    pub async fn expect_closed(&mut self) {
        within(async {
            while self.stream.read_buf(&mut self.buf).await.unwrap() != 0 {}
        })
        .await
    }

    // Everything the server sent before closing the connection.
    pub async fn recv_until_closed(&mut self) -> Vec<Message> {
        within(async {
            let mut msgs = vec![];
            loop {
                while let Some(len) =
                    JsonCodec.message_len(&self.buf).unwrap()
                {
                    let data = self.buf.split_to(len);
                    msgs.push(JsonCodec.decode(&data, &self.cxt).unwrap());
                }
                if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                    return msgs;
                }
            }
        })
        .await
    }

    // Exchanges OPEN and KEEPALIVE messages with the server.
    pub async fn handshake(&mut self, server: &BgpServer, open: OpenMsg) {
        assert!(matches!(self.recv().await, Message::Open(_)));
        self.send(Message::Open(open)).await;
        assert!(matches!(self.recv().await, Message::Keepalive(_)));
        self.send(Message::Keepalive(KeepaliveMsg {})).await;
        wait_state(server, self.addr, State::Established).await;
    }

    // Next UPDATE withdrawing something. Re-advertisements are skipped.
    pub async fn recv_withdrawal(&mut self) -> UpdateMsg {
        loop {
            let update = self.recv_update().await;
            if !unreach_prefixes(&update).is_empty() {
                return update;
            }
        }
    }

    // Fails on any withdrawal received during the given time.
    pub async fn expect_no_withdrawal(&mut self, wait: Duration) {
        let _ = tokio::time::timeout(wait, async {
            loop {
                let update = self.recv_update().await;
                assert!(unreach_prefixes(&update).is_empty());
            }
        })
        .await;
    }

    pub async fn end_of_rib(&mut self) {
        let msg = UpdateMsg::end_of_rib(RouteFamily::Ipv4Unicast);
        self.send(Message::Update(msg)).await;
    }

    // Next message other than a KEEPALIVE.
    pub async fn recv_skip_keepalives(&mut self) -> Message {
        loop {
            match self.recv().await {
                Message::Keepalive(_) => continue,
                msg => return msg,
            }
        }
    }

    pub async fn recv_update(&mut self) -> UpdateMsg {
        match self.recv_skip_keepalives().await {
            Message::Update(msg) => msg,
            msg => panic!("unexpected message: {msg:?}"),
        }
    }

    pub async fn announce(&mut self, prefix: Ipv4Network, attrs: Attrs) {
        let msg = UpdateMsg {
            reach: Some(MpReachNlri {
                family: RouteFamily::Ipv4Unicast,
                prefixes: vec![entry(prefix)],
            }),
            unreach: None,
            attrs: Some(attrs),
        };
        self.send(Message::Update(msg)).await;
    }

    pub async fn withdraw(&mut self, prefix: Ipv4Network) {
        let msg = UpdateMsg {
            reach: None,
            unreach: Some(MpUnreachNlri {
                family: RouteFamily::Ipv4Unicast,
                prefixes: vec![entry(prefix)],
            }),
            attrs: None,
        };
        self.send(Message::Update(msg)).await;
    }

    // Path attributes as originated by this peer.
    pub fn attrs(&self) -> Attrs {
        let as_path = if self.asn == LOCAL_AS {
            AsPath::default()
        } else {
            AsPath::from_sequence([self.asn])
        };
        attrs(as_path, self.addr)
    }
}

// ===== global functions =====

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, future)
        .await
        .expect("timed out")
}

pub async fn start_server() -> BgpServer {
    let server = BgpServer::new();
    let config = GlobalConfig {
        asn: LOCAL_AS,
        router_id: ROUTER_ID,
        listen_port: 0,
        families: vec![RouteFamily::Ipv4Unicast],
        ..Default::default()
    };
    server.start_bgp(config).await.unwrap();
    server
}

pub fn neighbor(addr: Ipv4Addr, asn: u32) -> NeighborConfig {
    let mut config = NeighborConfig::new(addr.into(), asn);
    config.transport.passive_mode = true;
    config
}

pub async fn wait_state(server: &BgpServer, addr: IpAddr, state: State) {
    within(async {
        loop {
            let peers = server.list_peer(Some(addr)).await.unwrap();
            if peers.first().is_some_and(|peer| peer.state == state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

// Configures a neighbor and brings its session up.
pub async fn establish(
    server: &BgpServer,
    addr: Ipv4Addr,
    asn: u32,
) -> TestPeer {
    establish_with(server, neighbor(addr, asn)).await
}

pub async fn establish_with(
    server: &BgpServer,
    config: NeighborConfig,
) -> TestPeer {
    let addr = config.address;
    let asn = config.peer_as;
    server.add_peer(config).await.unwrap();
    let mut peer = connect(server, addr, asn).await;
    let open = open(peer.asn, peer.router_id);
    peer.handshake(server, open).await;
    peer
}

// Opens a transport connection to an already configured neighbor.
pub async fn connect(server: &BgpServer, addr: IpAddr, asn: u32) -> TestPeer {
    wait_state(server, addr, State::Active).await;

    let IpAddr::V4(addr4) = addr else {
        panic!("IPv4 neighbors only");
    };
    let octets = addr4.octets();
    let local = SocketAddr::new(
        Ipv4Addr::new(octets[0], octets[1], octets[2], 254).into(),
        179,
    );
    let remote = SocketAddr::new(addr, 40000);
    let (conn, stream) = Connection::memory(Some(local), remote);
    server.accept(conn).await.unwrap();
    TestPeer::new(addr, asn, stream)
}

pub fn open(asn: u32, router_id: Ipv4Addr) -> OpenMsg {
    let capabilities = [
        Capability::multi_protocol(RouteFamily::Ipv4Unicast),
        Capability::FourOctetAsNumber { asn },
        Capability::RouteRefresh,
    ]
    .into();
    OpenMsg::new(asn, 90, router_id, capabilities)
}

// OPEN of a Graceful Restart capable speaker preserving the forwarding
// state of IPv4 unicast.
pub fn gr_open(
    asn: u32,
    router_id: Ipv4Addr,
    restart_time: u16,
    flags: GrFlags,
) -> OpenMsg {
    let family = RouteFamily::Ipv4Unicast;
    let mut open = open(asn, router_id);
    open.capabilities.insert(Capability::GracefulRestart {
        flags,
        restart_time,
        tuples: [GrTuple {
            afi: family.afi(),
            safi: family.safi(),
            flags: GrTupleFlags::FORWARDING,
        }]
        .into(),
    });
    open
}

// Adds Long-Lived Graceful Restart for IPv4 unicast to an OPEN.
pub fn with_llgr(mut open: OpenMsg, restart_time: u32) -> OpenMsg {
    let family = RouteFamily::Ipv4Unicast;
    open.capabilities.insert(Capability::LongLivedGracefulRestart(
        [LlgrTuple {
            afi: family.afi(),
            safi: family.safi(),
            flags: GrTupleFlags::FORWARDING,
            restart_time,
        }]
        .into(),
    ));
    open
}

pub fn attrs(as_path: AsPath, nexthop: IpAddr) -> Attrs {
    Attrs::new(BaseAttrs {
        origin: Origin::Igp,
        as_path,
        nexthop: Some(nexthop),
        med: None,
        local_pref: None,
        aggregator: None,
        atomic_aggregate: false,
        originator_id: None,
        cluster_list: None,
    })
}

pub fn entry(prefix: Ipv4Network) -> NlriEntry {
    NlriEntry {
        path_id: 0,
        nlri: Nlri::Ipv4Unicast(prefix),
    }
}

pub fn reach_prefixes(msg: &UpdateMsg) -> Vec<Nlri> {
    msg.reach
        .iter()
        .flat_map(|reach| reach.prefixes.iter())
        .map(|entry| entry.nlri)
        .collect()
}

pub fn unreach_prefixes(msg: &UpdateMsg) -> Vec<Nlri> {
    msg.unreach
        .iter()
        .flat_map(|unreach| unreach.prefixes.iter())
        .map(|entry| entry.nlri)
        .collect()
}
