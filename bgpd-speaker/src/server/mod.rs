//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod fsm_events;
pub mod mgmt;
pub mod propagate;
pub mod watch;

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bgpd_utils::socket::TcpListener;
use bgpd_utils::task::{Task, TimeoutTask};
use bgpd_utils::{Receiver, Sender, UnboundedReceiver, UnboundedSender};
use ipnetwork::IpNetwork;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, warn};

use crate::config::{
    DynamicNeighborConfig, GlobalConfig, NeighborConfig, PeerGroupConfig,
};
use crate::error::Error;
use crate::network::Connection;
use crate::packet::codec::{JsonCodec, MessageCodec};
use crate::path::PeerInfo;
use crate::peer::{Peer, Peers};
use crate::policy::PolicyEngine;
use crate::rib::TableManager;
use crate::server::watch::Watchers;
use crate::tasks::messages::input::{FsmMsg, TimerMsg};
use crate::validation::{RoaEvent, RoaTable, Validator};

// Handle to a running BGP server.
//
// The server runs as a single task that owns every peer and RIB. Dropping
// the handle stops it.
#[derive(Debug)]
pub struct BgpServer {
    mgmt_tx: Sender<MgmtMsg>,
    accept_tx: Sender<Connection>,
    roa_tx: UnboundedSender<RoaEvent>,
    _task: Task<()>,
}

// Management request, executed on the server task.
pub struct MgmtMsg(Box<dyn FnOnce(&mut Server) + Send>);

#[derive(Debug)]
pub struct Server {
    pub codec: Arc<dyn MessageCodec>,
    pub tx: ServerChannelsTx,
    // Parent of every peer's cancellation token.
    pub token: CancellationToken,
    pub state: Option<ServerState>,
    pub peers: Peers,
    pub watchers: Watchers,
}

#[derive(Debug)]
pub struct ServerState {
    pub config: GlobalConfig,
    // Source of locally originated paths.
    pub local_info: Arc<PeerInfo>,
    // Global RIB.
    pub rib: TableManager,
    // RIB of the route server clients.
    pub rs_rib: TableManager,
    pub policy: PolicyEngine,
    pub validator: Box<dyn Validator>,
    pub peer_groups: BTreeMap<String, PeerGroup>,
    pub listeners: Vec<TcpListenerTask>,
    // Route selection deferral while the local speaker restarts.
    pub selection_deferral: Option<TimeoutTask>,
}

#[derive(Debug)]
pub struct PeerGroup {
    pub config: PeerGroupConfig,
    // Members and their own (unmerged) configuration.
    pub members: BTreeMap<IpAddr, NeighborConfig>,
    pub dynamic_neighbors: BTreeMap<IpNetwork, DynamicNeighborConfig>,
}

#[derive(Debug)]
pub struct TcpListenerTask {
    pub addr: SocketAddr,
    pub socket: Arc<TcpListener>,
    _task: Task<Option<()>>,
}

#[derive(Clone, Debug)]
pub struct ServerChannelsTx {
    // Accepted TCP connection.
    pub accept: Sender<Connection>,
    // Peer FSM event.
    pub fsm: UnboundedSender<FsmMsg>,
    // Timer expiry.
    pub timer: Sender<TimerMsg>,
}

#[derive(Debug)]
pub struct ServerChannelsRx {
    pub mgmt: Receiver<MgmtMsg>,
    pub accept: Receiver<Connection>,
    pub fsm: UnboundedReceiver<FsmMsg>,
    pub timer: Receiver<TimerMsg>,
    pub roa: UnboundedReceiver<RoaEvent>,
}

pub struct ServerUpView<'a> {
    pub codec: &'a Arc<dyn MessageCodec>,
    pub tx: &'a ServerChannelsTx,
    pub token: &'a CancellationToken,
    pub state: &'a mut ServerState,
    pub watchers: &'a mut Watchers,
}

#[derive(Debug)]
enum ServerMsg {
    Mgmt(MgmtMsg),
    Accept(Connection),
    Fsm(FsmMsg),
    Timer(TimerMsg),
    Roa(RoaEvent),
}

// ===== impl BgpServer =====

impl BgpServer {
    // Spawns a server using the JSON message codec.
    pub fn new() -> BgpServer {
        BgpServer::with_codec(Arc::new(JsonCodec))
    }

    pub fn with_codec(codec: Arc<dyn MessageCodec>) -> BgpServer {
        let (mgmt_tx, mgmt_rx) = mpsc::channel(4);
        let (accept_tx, accept_rx) = mpsc::channel(4);
        let (fsm_tx, fsm_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::channel(4);
        let (roa_tx, roa_rx) = mpsc::unbounded_channel();

        let tx = ServerChannelsTx {
            accept: accept_tx.clone(),
            fsm: fsm_tx,
            timer: timer_tx,
        };
        let rx = ServerChannelsRx {
            mgmt: mgmt_rx,
            accept: accept_rx,
            fsm: fsm_rx,
            timer: timer_rx,
            roa: roa_rx,
        };
        let server = Server {
            codec,
            tx,
            token: CancellationToken::new(),
            state: None,
            peers: Default::default(),
            watchers: Default::default(),
        };

        let span = debug_span!("bgp");
        let task = Task::spawn(server.run(rx).instrument(span));
        BgpServer {
            mgmt_tx,
            accept_tx,
            roa_tx,
            _task: task,
        }
    }

    // Runs a management request on the server task.
    pub(crate) async fn request<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut Server) -> Result<T, Error> + Send + 'static,
    {
        let (responder, response) = oneshot::channel();
        let msg = MgmtMsg(Box::new(move |server| {
            let _ = responder.send(f(server));
        }));
        self.mgmt_tx
            .send(msg)
            .await
            .map_err(|_| Error::ServerStopped)?;
        response.await.map_err(|_| Error::ServerStopped)?
    }

    // Hands a connection accepted outside the server over to it.
    pub async fn accept(&self, conn: Connection) -> Result<(), Error> {
        self.accept_tx
            .send(conn)
            .await
            .map_err(|_| Error::ServerStopped)
    }

    // Feeds a ROA change learned by an RPKI client.
    pub fn roa_event(&self, event: RoaEvent) -> Result<(), Error> {
        self.roa_tx.send(event).map_err(|_| Error::ServerStopped)
    }
}

impl Default for BgpServer {
    fn default() -> BgpServer {
        BgpServer::new()
    }
}

// ===== impl MgmtMsg =====

impl std::fmt::Debug for MgmtMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MgmtMsg")
    }
}

// ===== impl Server =====

impl Server {
    async fn run(mut self, mut rx: ServerChannelsRx) {
        loop {
            // Requests and FSM events already queued are handled before
            // waiting on anything else.
            let msg = match rx.try_recv() {
                Some(msg) => msg,
                None => match rx.recv().await {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.process_msg(msg);
        }

        debug!("server handle dropped");
        self.token.cancel();
    }

    fn process_msg(&mut self, msg: ServerMsg) {
        match msg {
            ServerMsg::Mgmt(MgmtMsg(f)) => f(self),
            ServerMsg::Accept(conn) => {
                if let Err(error) = self.process_accept(conn) {
                    error.log();
                }
            }
            ServerMsg::Fsm(msg) => {
                if let Some((mut server, peers)) = self.as_up() {
                    fsm_events::process_fsm_msg(&mut server, peers, msg);
                }
            }
            ServerMsg::Timer(msg) => {
                if let Some((mut server, peers)) = self.as_up() {
                    fsm_events::process_timer_msg(&mut server, peers, msg);
                }
            }
            ServerMsg::Roa(event) => {
                if let Some((mut server, peers)) = self.as_up() {
                    fsm_events::process_roa_event(&mut server, peers, event);
                }
            }
        }
    }

    // Hands an accepted connection to its peer, creating a dynamic peer when
    // the remote address matches a dynamic neighbor prefix.
    fn process_accept(&mut self, conn: Connection) -> Result<(), Error> {
        let addr = conn.remote_addr();
        let Some((server, peers)) = self.as_up() else {
            debug!(%addr, "server not started, closing connection");
            return Ok(());
        };

        if let Some(peer) = peers.get(&addr) {
            peer.pass_connection(conn);
            return Ok(());
        }

        let Some(group) = server.state.dynamic_peer_group(addr) else {
            warn!(%addr, "connection from unconfigured neighbor");
            return Ok(());
        };
        let config = NeighborConfig::from_peer_group(addr, &group.config);
        config.validate()?;
        let name = group.config.name.clone();

        debug!(%addr, group = %name, "creating dynamic neighbor");
        let peer = Peer::new(
            config.clone(),
            &server.state.config,
            server.codec.clone(),
            server.token,
            &server.tx.fsm,
            true,
        );
        peer.pass_connection(conn);
        if let Some(group) = server.state.peer_groups.get_mut(&name) {
            group.members.insert(addr, config);
        }
        peers.insert(addr, peer);
        Ok(())
    }

    // Returns a view struct for the server if it's started.
    pub(crate) fn as_up(&mut self) -> Option<(ServerUpView<'_>, &mut Peers)> {
        let state = self.state.as_mut()?;
        let server = ServerUpView {
            codec: &self.codec,
            tx: &self.tx,
            token: &self.token,
            state,
            watchers: &mut self.watchers,
        };
        Some((server, &mut self.peers))
    }
}

// ===== impl ServerState =====

impl ServerState {
    pub(crate) fn new(config: GlobalConfig) -> ServerState {
        let local_info =
            Arc::new(PeerInfo::local(config.asn, config.router_id));
        let rib = TableManager::new(
            config.families.iter().copied(),
            config.route_selection,
        );
        let rs_rib = TableManager::new(
            config.families.iter().copied(),
            config.route_selection,
        );
        let validator = Box::new(RoaTable::new(config.asn));

        ServerState {
            config,
            local_info,
            rib,
            rs_rib,
            policy: Default::default(),
            validator,
            peer_groups: Default::default(),
            listeners: Default::default(),
            selection_deferral: None,
        }
    }

    // RIB serving the given kind of peer.
    pub(crate) fn rib(&self, route_server: bool) -> &TableManager {
        if route_server { &self.rs_rib } else { &self.rib }
    }

    pub(crate) fn rib_mut(&mut self, route_server: bool) -> &mut TableManager {
        if route_server {
            &mut self.rs_rib
        } else {
            &mut self.rib
        }
    }

    // Peer group whose dynamic neighbor prefix is the longest match for the
    // given address.
    fn dynamic_peer_group(&self, addr: IpAddr) -> Option<&PeerGroup> {
        self.peer_groups
            .values()
            .flat_map(|group| {
                group
                    .dynamic_neighbors
                    .keys()
                    .filter(|prefix| prefix.contains(addr))
                    .map(move |prefix| (prefix.prefix(), group))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, group)| group)
    }
}

// ===== impl ServerChannelsRx =====

impl ServerChannelsRx {
    fn try_recv(&mut self) -> Option<ServerMsg> {
        if let Ok(msg) = self.mgmt.try_recv() {
            return Some(ServerMsg::Mgmt(msg));
        }
        if let Ok(msg) = self.fsm.try_recv() {
            return Some(ServerMsg::Fsm(msg));
        }
        None
    }

    // Returns `None` once the server handle is gone.
    async fn recv(&mut self) -> Option<ServerMsg> {
        tokio::select! {
            biased;
            Some(conn) = self.accept.recv() => {
                Some(ServerMsg::Accept(conn))
            }
            msg = self.mgmt.recv() => {
                msg.map(ServerMsg::Mgmt)
            }
            Some(msg) = self.fsm.recv() => {
                Some(ServerMsg::Fsm(msg))
            }
            Some(msg) = self.timer.recv() => {
                Some(ServerMsg::Timer(msg))
            }
            Some(event) = self.roa.recv() => {
                Some(ServerMsg::Roa(event))
            }
        }
    }
}

// ===== impl TcpListenerTask =====

impl TcpListenerTask {
    pub(crate) fn new(
        addr: SocketAddr,
        socket: TcpListener,
        token: &CancellationToken,
        accept_tx: &Sender<Connection>,
    ) -> TcpListenerTask {
        let socket = Arc::new(socket);
        let task = crate::tasks::tcp_listener(&socket, token, accept_tx);
        TcpListenerTask {
            addr,
            socket,
            _task: task,
        }
    }
}
