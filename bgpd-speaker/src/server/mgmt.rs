//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bgpd_utils::UnboundedReceiver;
use bgpd_utils::task::Task;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::af::RouteFamily;
use crate::config::{
    DynamicNeighborConfig, GlobalConfig, NeighborConfig, PeerGroupConfig,
    VrfConfig,
};
use crate::debug::Debug;
use crate::error::{Error, IoError};
use crate::fsm::AdminState;
use crate::network;
use crate::packet::consts::{CeaseSubcode, ErrorCode};
use crate::packet::message::NotificationMsg;
use crate::path::{Path, PathFlags};
use crate::peer::{Peer, PeerState, Peers};
use crate::policy::{
    DefaultPolicyType, DefinedSets, Policy, PolicyAssignment,
    PolicyDirection, PolicyStmt, RoutingPolicy,
};
use crate::rib::TableId;
use crate::rib::table::TableInfo;
use crate::rib::vrf::Vrf;
use crate::server::propagate::{
    best_from_local, best_path, drop_peer_all_routes, propagate_update,
    soft_reset_in, soft_reset_out,
};
use crate::server::watch::{
    BestPathEvent, PeerStateEvent, UpdateEvent, WatchEvent, WatchOptions,
};
use crate::server::{
    BgpServer, PeerGroup, Server, ServerState, ServerUpView, TcpListenerTask,
};

// RIB view queried by the path listing operations.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TableType {
    Global,
    AdjIn(IpAddr),
    AdjOut(IpAddr),
    Vrf(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SoftResetDirection {
    In,
    Out,
    Both,
}

// ===== impl BgpServer =====

impl BgpServer {
    pub async fn start_bgp(&self, config: GlobalConfig) -> Result<(), Error> {
        self.request(move |server| server.start_bgp(config)).await
    }

    // Stops the server, waiting for every peer to shut down.
    pub async fn stop_bgp(&self) -> Result<(), Error> {
        let reapers = self.request(|server| server.stop_bgp()).await?;
        for reaper in reapers {
            let _ = reaper.await;
        }
        Ok(())
    }

    pub async fn get_bgp(&self) -> Result<GlobalConfig, Error> {
        self.request(|server| Ok(server.up_state()?.config.clone()))
            .await
    }

    pub async fn add_peer(&self, config: NeighborConfig) -> Result<(), Error> {
        self.request(move |server| server.add_peer(config)).await
    }

    pub async fn delete_peer(
        &self,
        addr: IpAddr,
        communication: String,
    ) -> Result<(), Error> {
        let reaper = self
            .request(move |server| server.delete_peer(addr, &communication))
            .await?;
        let _ = reaper.await;
        Ok(())
    }

    // Returns whether the received paths must be re-evaluated (soft reset
    // in) for the change to take effect.
    pub async fn update_peer(
        &self,
        config: NeighborConfig,
    ) -> Result<bool, Error> {
        self.request(move |server| server.update_peer(config)).await
    }

    pub async fn list_peer(
        &self,
        addr: Option<IpAddr>,
    ) -> Result<Vec<PeerState>, Error> {
        self.request(move |server| {
            server.up_state()?;
            Ok(server
                .peers
                .values()
                .filter(|peer| addr.is_none_or(|addr| addr == peer.addr))
                .map(Peer::snapshot)
                .collect())
        })
        .await
    }

    pub async fn add_peer_group(
        &self,
        config: PeerGroupConfig,
    ) -> Result<(), Error> {
        self.request(move |server| server.add_peer_group(config))
            .await
    }

    pub async fn delete_peer_group(&self, name: String) -> Result<(), Error> {
        self.request(move |server| server.delete_peer_group(&name))
            .await
    }

    pub async fn update_peer_group(
        &self,
        config: PeerGroupConfig,
    ) -> Result<bool, Error> {
        self.request(move |server| server.update_peer_group(config))
            .await
    }

    pub async fn add_dynamic_neighbor(
        &self,
        config: DynamicNeighborConfig,
    ) -> Result<(), Error> {
        self.request(move |server| server.add_dynamic_neighbor(config))
            .await
    }

    // Injects locally originated (or externally learned) paths, optionally
    // into a VRF.
    pub async fn add_path(
        &self,
        vrf: Option<String>,
        paths: Vec<Path>,
    ) -> Result<(), Error> {
        self.request(move |server| server.add_path(vrf.as_deref(), paths))
            .await
    }

    // Withdraws injected paths. Without paths, every locally originated
    // path (of the VRF, if given) is withdrawn.
    pub async fn delete_path(
        &self,
        vrf: Option<String>,
        paths: Option<Vec<Path>>,
    ) -> Result<(), Error> {
        self.request(move |server| server.delete_path(vrf.as_deref(), paths))
            .await
    }

    pub async fn add_vrf(&self, config: VrfConfig) -> Result<(), Error> {
        self.request(move |server| server.add_vrf(config)).await
    }

    pub async fn delete_vrf(&self, name: String) -> Result<(), Error> {
        self.request(move |server| server.delete_vrf(&name)).await
    }

    pub async fn list_vrf(&self) -> Result<Vec<Vrf>, Error> {
        self.request(|server| {
            Ok(server.up_state()?.rib.vrfs.values().cloned().collect())
        })
        .await
    }

    pub async fn enable_peer(&self, addr: IpAddr) -> Result<(), Error> {
        self.request(move |server| {
            server.change_admin_state(addr, AdminState::Up, String::new())
        })
        .await
    }

    pub async fn disable_peer(
        &self,
        addr: IpAddr,
        communication: String,
    ) -> Result<(), Error> {
        self.request(move |server| {
            server.change_admin_state(addr, AdminState::Down, communication)
        })
        .await
    }

    // Closes the session with an administrative shutdown, keeping the peer
    // down until it's enabled again.
    pub async fn shutdown_peer(
        &self,
        addr: IpAddr,
        communication: String,
    ) -> Result<(), Error> {
        self.request(move |server| server.shutdown_peer(addr, communication))
            .await
    }

    pub async fn reset_peer(
        &self,
        addr: IpAddr,
        soft: bool,
        direction: SoftResetDirection,
        communication: String,
    ) -> Result<(), Error> {
        self.request(move |server| {
            server.reset_peer(addr, soft, direction, &communication)
        })
        .await
    }

    pub async fn set_policies(
        &self,
        defined_sets: DefinedSets,
        policies: Vec<Policy>,
        assignments: BTreeMap<TableId, PolicyAssignment>,
    ) -> Result<(), Error> {
        self.request(move |server| {
            server.up_state_mut()?.policy.set_policies(
                defined_sets,
                policies,
                assignments,
            )
        })
        .await
    }

    pub async fn add_policy(&self, policy: Policy) -> Result<(), Error> {
        self.request(move |server| {
            server.up_state_mut()?.policy.add_policy(policy)
        })
        .await
    }

    pub async fn delete_policy(&self, name: String) -> Result<(), Error> {
        self.request(move |server| {
            server.up_state_mut()?.policy.delete_policy(&name)
        })
        .await
    }

    pub async fn add_statement(
        &self,
        policy: String,
        stmt: PolicyStmt,
    ) -> Result<(), Error> {
        self.request(move |server| {
            server.up_state_mut()?.policy.add_statement(&policy, stmt)
        })
        .await
    }

    pub async fn add_policy_assignment(
        &self,
        table_id: TableId,
        direction: PolicyDirection,
        policies: Vec<String>,
        default: DefaultPolicyType,
    ) -> Result<(), Error> {
        self.request(move |server| {
            server.up_state_mut()?.policy.add_policy_assignment(
                table_id, direction, policies, default,
            )
        })
        .await
    }

    pub async fn delete_policy_assignment(
        &self,
        table_id: TableId,
        direction: PolicyDirection,
        policies: Vec<String>,
    ) -> Result<(), Error> {
        self.request(move |server| {
            server.up_state_mut()?.policy.delete_policy_assignment(
                table_id, direction, &policies,
            )
        })
        .await
    }

    pub async fn list_policy(
        &self,
        name: Option<String>,
    ) -> Result<Vec<Arc<Policy>>, Error> {
        self.request(move |server| {
            server.up_state()?.policy.list_policy(name.as_deref())
        })
        .await
    }

    pub async fn list_path(
        &self,
        table: TableType,
        family: RouteFamily,
    ) -> Result<Vec<Path>, Error> {
        self.request(move |server| server.list_path(&table, family))
            .await
    }

    pub async fn get_table(
        &self,
        table: TableType,
        family: RouteFamily,
    ) -> Result<TableInfo, Error> {
        self.request(move |server| server.get_table(&table, family))
            .await
    }

    // Returns the global paths of a family with their origin validation
    // state.
    pub async fn validate_rib(
        &self,
        family: RouteFamily,
    ) -> Result<Vec<Path>, Error> {
        self.request(move |server| server.validate_rib(family)).await
    }

    // Subscribes to server events.
    pub async fn watch(
        &self,
        options: WatchOptions,
    ) -> Result<UnboundedReceiver<WatchEvent>, Error> {
        self.request(move |server| Ok(server.watch(options))).await
    }
}

// ===== impl Server =====

impl Server {
    fn up_state(&self) -> Result<&ServerState, Error> {
        self.state.as_ref().ok_or(Error::NotStarted)
    }

    fn up_state_mut(&mut self) -> Result<&mut ServerState, Error> {
        self.state.as_mut().ok_or(Error::NotStarted)
    }

    fn up(&mut self) -> Result<(ServerUpView<'_>, &mut Peers), Error> {
        self.as_up().ok_or(Error::NotStarted)
    }

    fn start_bgp(&mut self, config: GlobalConfig) -> Result<(), Error> {
        if self.state.is_some() {
            return Err(Error::AlreadyStarted);
        }
        config.validate()?;

        let mut state = ServerState::new(config);
        let assignment = state.config.apply_policy.clone();
        state
            .policy
            .reset([(TableId::Global, assignment)].into())?;

        if state.config.listen_port != 0 {
            for addr in &state.config.listen_addresses {
                let addr = SocketAddr::new(*addr, state.config.listen_port);
                match network::listen_socket(addr) {
                    Ok(socket) => {
                        let listener = TcpListenerTask::new(
                            addr,
                            socket,
                            &self.token,
                            &self.tx.accept,
                        );
                        state.listeners.push(listener);
                    }
                    Err(error) => IoError::TcpSocketError(error).log(),
                }
            }
        }

        Debug::ServerStart(state.config.asn).log();
        self.state = Some(state);
        Ok(())
    }

    // Deconfigures every peer and returns their reapers.
    fn stop_bgp(&mut self) -> Result<Vec<Task<()>>, Error> {
        if self.state.take().is_none() {
            return Err(Error::NotStarted);
        }

        let msg = NotificationMsg::new(
            ErrorCode::Cease,
            CeaseSubcode::PeerDeConfigured,
        );
        let reapers = std::mem::take(&mut self.peers)
            .into_values()
            .map(|peer| {
                Debug::PeerDelete(&peer.addr).log();
                peer.shutdown(Some(msg.clone()))
            })
            .collect();

        Debug::ServerStop.log();
        Ok(reapers)
    }

    fn add_peer(&mut self, config: NeighborConfig) -> Result<(), Error> {
        let (server, peers) = self.up()?;
        let addr = config.address;
        if peers.contains_key(&addr) {
            return Err(Error::PeerExists(addr));
        }
        let merged = merge_peer_group(server.state, &config)?;
        check_peer_config(server.state, &merged)?;

        if merged.is_route_server_client() {
            install_rs_policy(server.state, addr, merged.apply_policy.clone());
        }
        if let Some(password) = &merged.auth_password {
            for listener in &server.state.listeners {
                network::listen_socket_md5sig_update(
                    &listener.socket,
                    addr,
                    Some(password),
                );
            }
        }
        if let Some(group) = config
            .peer_group
            .as_ref()
            .and_then(|name| server.state.peer_groups.get_mut(name))
        {
            group.members.insert(addr, config);
        }

        Debug::PeerCreate(&addr).log();
        let peer = Peer::new(
            merged,
            &server.state.config,
            server.codec.clone(),
            server.token,
            &server.tx.fsm,
            false,
        );
        peers.insert(addr, peer);
        Ok(())
    }

    fn delete_peer(
        &mut self,
        addr: IpAddr,
        communication: &str,
    ) -> Result<Task<()>, Error> {
        let (mut server, peers) = self.up()?;
        let Some(peer) = peers.get(&addr) else {
            return Err(Error::PeerNotFound(addr));
        };

        let families = peer.configured_families();
        drop_peer_all_routes(&mut server, peers, addr, &families);
        let Some(peer) = peers.remove(&addr) else {
            return Err(Error::PeerNotFound(addr));
        };
        let config = peer.fsm.read().config.clone();

        if config.is_route_server_client() {
            install_rs_policy(server.state, addr, Default::default());
        }
        if config.auth_password.is_some() {
            for listener in &server.state.listeners {
                network::listen_socket_md5sig_update(
                    &listener.socket,
                    addr,
                    None,
                );
            }
        }
        if let Some(group) = config
            .peer_group
            .as_ref()
            .and_then(|name| server.state.peer_groups.get_mut(name))
        {
            group.members.remove(&addr);
        }

        Debug::PeerDelete(&addr).log();
        // A Shutdown Communication can only ride on an administrative
        // shutdown.
        let subcode = if communication.is_empty() {
            CeaseSubcode::PeerDeConfigured
        } else {
            CeaseSubcode::AdministrativeShutdown
        };
        let msg = NotificationMsg::with_communication(subcode, communication);
        Ok(peer.shutdown(Some(msg)))
    }

    fn update_peer(&mut self, config: NeighborConfig) -> Result<bool, Error> {
        let (mut server, peers) = self.up()?;
        let addr = config.address;
        let Some(peer) = peers.get(&addr) else {
            return Err(Error::PeerNotFound(addr));
        };
        let merged = merge_peer_group(server.state, &config)?;
        check_peer_config(server.state, &merged)?;
        let old = peer.fsm.read().config.clone();
        check_families_unchanged(&merged, &old)?;

        if old.peer_group != config.peer_group
            && let Some(group) = old
                .peer_group
                .as_ref()
                .and_then(|name| server.state.peer_groups.get_mut(name))
        {
            group.members.remove(&addr);
        }
        if let Some(group) = config
            .peer_group
            .as_ref()
            .and_then(|name| server.state.peer_groups.get_mut(name))
        {
            group.members.insert(addr, config);
        }

        Ok(apply_peer_config(&mut server, peers, merged))
    }

    fn add_peer_group(&mut self, config: PeerGroupConfig) -> Result<(), Error> {
        let state = self.up_state_mut()?;
        if config.name.is_empty() {
            return Err(Error::InvalidConfig("missing peer group name".into()));
        }
        if state.peer_groups.contains_key(&config.name) {
            return Err(Error::PeerGroupExists(config.name));
        }

        debug!(name = %config.name, "add peer group");
        let group = PeerGroup {
            config,
            members: Default::default(),
            dynamic_neighbors: Default::default(),
        };
        state.peer_groups.insert(group.config.name.clone(), group);
        Ok(())
    }

    fn delete_peer_group(&mut self, name: &str) -> Result<(), Error> {
        let state = self.up_state_mut()?;
        let Some(group) = state.peer_groups.get(name) else {
            return Err(Error::PeerGroupNotFound(name.to_owned()));
        };
        if !group.members.is_empty() {
            return Err(Error::PeerGroupInUse(name.to_owned()));
        }

        debug!(%name, "delete peer group");
        state.peer_groups.remove(name);
        Ok(())
    }

    // Applies new peer group settings to its static members. Dynamic
    // members pick them up on their next session.
    fn update_peer_group(
        &mut self,
        config: PeerGroupConfig,
    ) -> Result<bool, Error> {
        let (mut server, peers) = self.up()?;
        let Some(group) = server.state.peer_groups.get(&config.name) else {
            return Err(Error::PeerGroupNotFound(config.name));
        };

        let mut updates = vec![];
        for (addr, member) in &group.members {
            let Some(peer) = peers.get(addr).filter(|peer| !peer.dynamic)
            else {
                continue;
            };
            let mut merged = member.clone();
            merged.apply_peer_group(&config);
            check_peer_config(server.state, &merged)?;
            check_families_unchanged(&merged, &peer.fsm.read().config)?;
            updates.push(merged);
        }

        debug!(name = %config.name, "update peer group");
        if let Some(group) = server.state.peer_groups.get_mut(&config.name) {
            group.config = config;
        }
        let mut soft_reset_in = false;
        for merged in updates {
            soft_reset_in |= apply_peer_config(&mut server, peers, merged);
        }
        Ok(soft_reset_in)
    }

    fn add_dynamic_neighbor(
        &mut self,
        config: DynamicNeighborConfig,
    ) -> Result<(), Error> {
        let state = self.up_state_mut()?;
        if state
            .peer_groups
            .values()
            .any(|group| group.dynamic_neighbors.contains_key(&config.prefix))
        {
            return Err(Error::DynamicNeighborExists(config.prefix));
        }
        let Some(group) = state.peer_groups.get_mut(&config.peer_group) else {
            return Err(Error::PeerGroupNotFound(config.peer_group));
        };

        debug!(
            prefix = %config.prefix, group = %config.peer_group,
            "add dynamic neighbor"
        );
        group.dynamic_neighbors.insert(config.prefix, config);
        Ok(())
    }

    fn add_path(
        &mut self,
        vrf: Option<&str>,
        paths: Vec<Path>,
    ) -> Result<(), Error> {
        let (mut server, peers) = self.up()?;
        let paths = local_paths(server.state, vrf, paths)?;
        propagate_update(&mut server, peers, None, paths);
        Ok(())
    }

    fn delete_path(
        &mut self,
        vrf: Option<&str>,
        paths: Option<Vec<Path>>,
    ) -> Result<(), Error> {
        let (mut server, peers) = self.up()?;
        let state = &*server.state;
        let withdrawals = match paths {
            Some(paths) => local_paths(state, vrf, paths)?
                .iter()
                .map(Path::as_withdrawal)
                .collect(),
            None => match vrf {
                Some(name) => {
                    let Some(vrf) = state.rib.vrfs.get(name) else {
                        return Err(Error::VrfNotFound(name.to_owned()));
                    };
                    state
                        .rib
                        .tables
                        .values()
                        .flat_map(|table| table.vrf_paths(vrf.rd))
                        .map(Path::as_withdrawal)
                        .collect()
                }
                None => {
                    // VRF route target memberships stay.
                    let families = state
                        .rib
                        .families()
                        .filter(|family| {
                            *family != RouteFamily::RouteTargetConstraint
                        })
                        .collect::<Vec<_>>();
                    state
                        .rib
                        .path_list_with_source(
                            TableId::Global,
                            &families,
                            &state.local_info,
                        )
                        .iter()
                        .map(Path::as_withdrawal)
                        .collect()
                }
            },
        };
        propagate_update(&mut server, peers, None, withdrawals);
        Ok(())
    }

    fn add_vrf(&mut self, config: VrfConfig) -> Result<(), Error> {
        let (mut server, peers) = self.up()?;
        let state = &mut *server.state;
        if config.id != 0
            && state.rib.vrfs.values().any(|vrf| vrf.id == config.id)
        {
            return Err(Error::InvalidConfig(format!(
                "VRF id {} already in use",
                config.id
            )));
        }

        let local_info = state.local_info.clone();
        let paths = state.rib.add_vrf(config.into(), &local_info)?;
        propagate_update(&mut server, peers, None, paths);
        Ok(())
    }

    fn delete_vrf(&mut self, name: &str) -> Result<(), Error> {
        let (mut server, peers) = self.up()?;
        if peers
            .values()
            .any(|peer| peer.vrf().is_some_and(|vrf| vrf == name))
        {
            return Err(Error::VrfInUse(name.to_owned()));
        }

        let local_info = server.state.local_info.clone();
        let paths = server.state.rib.delete_vrf(name, &local_info)?;
        propagate_update(&mut server, peers, None, paths);
        Ok(())
    }

    fn change_admin_state(
        &mut self,
        addr: IpAddr,
        state: AdminState,
        communication: String,
    ) -> Result<(), Error> {
        let (_, peers) = self.up()?;
        let Some(peer) = peers.get(&addr) else {
            return Err(Error::PeerNotFound(addr));
        };
        if peer.fsm.read().admin_state == state {
            return Err(Error::AdminStateUnchanged(addr));
        }
        peer.request_admin_state(state, communication)
    }

    fn shutdown_peer(
        &mut self,
        addr: IpAddr,
        communication: String,
    ) -> Result<(), Error> {
        let (_, peers) = self.up()?;
        let Some(peer) = peers.get(&addr) else {
            return Err(Error::PeerNotFound(addr));
        };
        if peer.fsm.read().admin_state != AdminState::Up {
            return Err(Error::AdminStateUnchanged(addr));
        }

        if peer.is_established() {
            let msg = NotificationMsg::with_communication(
                CeaseSubcode::AdministrativeShutdown,
                &communication,
            );
            peer.send_notification(msg, true);
            Ok(())
        } else {
            peer.request_admin_state(AdminState::Down, communication)
        }
    }

    fn reset_peer(
        &mut self,
        addr: IpAddr,
        soft: bool,
        direction: SoftResetDirection,
        communication: &str,
    ) -> Result<(), Error> {
        let (mut server, peers) = self.up()?;
        let Some(peer) = peers.get(&addr) else {
            return Err(Error::PeerNotFound(addr));
        };

        if !soft {
            {
                let mut fsm = peer.fsm.write();
                let idle_hold_time =
                    fsm.config.timers.idle_hold_time_after_reset;
                fsm.idle_hold_time = idle_hold_time;
            }
            let msg = NotificationMsg::with_communication(
                CeaseSubcode::AdministrativeReset,
                communication,
            );
            peer.send_notification(msg, false);
            return Ok(());
        }

        let configured = peer.configured_families();
        let negotiated = peer.negotiated_families();
        if direction != SoftResetDirection::Out {
            debug!(%addr, "soft reset in");
            soft_reset_in(&mut server, peers, addr, &configured);
        }
        if direction != SoftResetDirection::In
            && let Some(peer) = peers.get(&addr)
        {
            debug!(%addr, "soft reset out");
            soft_reset_out(server.state, peer, &negotiated);
        }
        Ok(())
    }

    fn list_path(
        &self,
        table: &TableType,
        family: RouteFamily,
    ) -> Result<Vec<Path>, Error> {
        let state = self.up_state()?;
        match table {
            TableType::Global => {
                if !state.rib.tables.contains_key(&family) {
                    return Err(Error::FamilyNotConfigured(family));
                }
                Ok(state.rib.path_list(TableId::Global, 0, &[family]))
            }
            TableType::AdjIn(addr) => {
                let peer = self.peer(*addr)?;
                Ok(peer.adj_rib_in.path_list(&[family], false))
            }
            TableType::AdjOut(addr) => {
                let peer = self.peer(*addr)?;
                let (paths, _) = best_from_local(state, peer, &[family]);
                Ok(paths)
            }
            TableType::Vrf(name) => {
                let Some(vrf) = state.rib.vrfs.get(name) else {
                    return Err(Error::VrfNotFound(name.clone()));
                };
                let paths = state
                    .rib
                    .path_list(TableId::Global, 0, &[family.to_vpn()])
                    .into_iter()
                    .filter(|path| vrf.can_import(path))
                    .map(|path| path.to_local())
                    .collect();
                Ok(paths)
            }
        }
    }

    fn get_table(
        &self,
        table: &TableType,
        family: RouteFamily,
    ) -> Result<TableInfo, Error> {
        let state = self.up_state()?;
        match table {
            TableType::Global => {
                state.rib.table_info(TableId::Global, 0, family)
            }
            TableType::AdjIn(addr) => {
                let peer = self.peer(*addr)?;
                Ok(peer.adj_rib_in.table_info(family))
            }
            TableType::AdjOut(_) | TableType::Vrf(_) => {
                let paths = self.list_path(table, family)?;
                let destinations = paths
                    .iter()
                    .map(|path| path.nlri)
                    .collect::<BTreeSet<_>>()
                    .len();
                Ok(TableInfo {
                    destinations,
                    paths: paths.len(),
                    accepted: paths.len(),
                })
            }
        }
    }

    fn validate_rib(&self, family: RouteFamily) -> Result<Vec<Path>, Error> {
        let state = self.up_state()?;
        if !state.rib.tables.contains_key(&family) {
            return Err(Error::FamilyNotConfigured(family));
        }
        let paths = state
            .rib
            .path_list(TableId::Global, 0, &[family])
            .into_iter()
            .map(|path| {
                let validation = state.validator.validate(&path);
                path.with_validation(validation)
            })
            .collect();
        Ok(paths)
    }

    fn watch(
        &mut self,
        options: WatchOptions,
    ) -> UnboundedReceiver<WatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        if options.current {
            let mut events = vec![];
            if options.peer_state {
                events.extend(self.peers.values().map(|peer| {
                    WatchEvent::PeerState(PeerStateEvent::new(peer, None))
                }));
            }
            if let Some(state) = &self.state {
                events.extend(current_events(state, &self.peers, &options));
            }
            for event in events {
                let _ = tx.send(event);
            }
        }

        self.watchers.add(options, tx);
        rx
    }

    fn peer(&self, addr: IpAddr) -> Result<&Peer, Error> {
        self.peers.get(&addr).ok_or(Error::PeerNotFound(addr))
    }
}

// ===== helper functions =====

// Fills the neighbor settings left unset with those of its peer group.
fn merge_peer_group(
    state: &ServerState,
    config: &NeighborConfig,
) -> Result<NeighborConfig, Error> {
    let mut merged = config.clone();
    if let Some(name) = &config.peer_group {
        let Some(group) = state.peer_groups.get(name) else {
            return Err(Error::PeerGroupNotFound(name.clone()));
        };
        merged.apply_peer_group(&group.config);
    }
    Ok(merged)
}

// Checks a (merged) neighbor configuration against the server state.
fn check_peer_config(
    state: &ServerState,
    config: &NeighborConfig,
) -> Result<(), Error> {
    config.validate()?;

    if let Some(vrf) = &config.vrf
        && !state.rib.vrfs.contains_key(vrf)
    {
        return Err(Error::VrfNotFound(vrf.clone()));
    }

    // The unicast paths of VRF neighbors live in the VPN tables.
    let families = config
        .families()
        .into_iter()
        .map(|family| match config.vrf {
            Some(_) => family.to_vpn(),
            None => family,
        })
        .collect::<Vec<_>>();
    if let Some(family) = families
        .into_iter()
        .find(|family| !state.config.families.contains(family))
    {
        return Err(Error::FamilyNotConfigured(family));
    }

    if config.is_route_server_client() {
        let assignment = &config.apply_policy;
        if let Some(name) = assignment
            .import_policy
            .iter()
            .chain(assignment.export_policy.iter())
            .find(|name| !state.policy.policies.contains_key(*name))
        {
            return Err(Error::PolicyNotFound(name.clone()));
        }
    }

    Ok(())
}

fn check_families_unchanged(
    config: &NeighborConfig,
    old: &NeighborConfig,
) -> Result<(), Error> {
    if config.families() != old.families() {
        return Err(Error::InvalidConfig(format!(
            "neighbor {}: address families can't be changed",
            config.address
        )));
    }
    Ok(())
}

// Applies a validated configuration to an existing peer. Session-affecting
// changes re-create the peer.
//
// Returns whether the received paths must be re-evaluated.
fn apply_peer_config(
    server: &mut ServerUpView<'_>,
    peers: &mut Peers,
    config: NeighborConfig,
) -> bool {
    let addr = config.address;
    let Some(peer) = peers.get(&addr) else {
        return false;
    };
    let old = peer.fsm.read().config.clone();

    if config.is_route_server_client() {
        install_rs_policy(server.state, addr, config.apply_policy.clone());
    } else if old.is_route_server_client() {
        install_rs_policy(server.state, addr, Default::default());
    }
    if config.auth_password != old.auth_password {
        for listener in &server.state.listeners {
            network::listen_socket_md5sig_update(
                &listener.socket,
                addr,
                config.auth_password.as_deref(),
            );
        }
    }

    if config.needs_reset(&old) {
        debug!(%addr, "configuration change, resetting neighbor");
        drop_peer_all_routes(server, peers, addr, &old.families());
        if let Some(peer) = peers.remove(&addr) {
            let msg = NotificationMsg::new(
                ErrorCode::Cease,
                CeaseSubcode::OtherConfigurationChange,
            );
            peer.shutdown(Some(msg)).detach();
        }
        let peer = Peer::new(
            config,
            &server.state.config,
            server.codec.clone(),
            server.token,
            &server.tx.fsm,
            false,
        );
        peers.insert(addr, peer);
        return false;
    }

    let soft_reset_in = config.needs_soft_reset_in(&old);
    let admin_down = config.admin_down;
    peer.fsm.write().config = config;
    if admin_down != old.admin_down {
        let state = if admin_down {
            AdminState::Down
        } else {
            AdminState::Up
        };
        if let Err(error) = peer.request_admin_state(state, String::new()) {
            error.log();
        }
    }
    soft_reset_in
}

fn install_rs_policy(
    state: &mut ServerState,
    addr: IpAddr,
    assignment: PolicyAssignment,
) {
    let table_id = TableId::RouteServerClient(addr);
    if let Err(error) = state.policy.reset([(table_id, assignment)].into()) {
        error.log();
    }
}

// Turns paths handed over by the management interface into locally
// originated paths of the global RIB.
fn local_paths(
    state: &ServerState,
    vrf: Option<&str>,
    paths: Vec<Path>,
) -> Result<Vec<Path>, Error> {
    let vrf = match vrf {
        Some(name) => match state.rib.vrfs.get(name) {
            Some(vrf) => Some(vrf),
            None => return Err(Error::VrfNotFound(name.to_owned())),
        },
        None => None,
    };

    let paths = paths
        .into_iter()
        .map(|path| {
            // Only the from-external marker survives.
            let path = Path {
                source: state.local_info.clone(),
                flags: path.flags & PathFlags::FROM_EXTERNAL,
                ..path
            };
            match vrf {
                Some(vrf) => path.to_global(vrf),
                None => path,
            }
        })
        .collect::<Vec<_>>();
    if let Some(path) = paths
        .iter()
        .find(|path| !state.rib.tables.contains_key(&path.family()))
    {
        return Err(Error::FamilyNotConfigured(path.family()));
    }
    Ok(paths)
}

// Snapshot of the current RIB state for a new subscriber.
fn current_events(
    state: &ServerState,
    peers: &Peers,
    options: &WatchOptions,
) -> Vec<WatchEvent> {
    let mut events = vec![];
    let families = state.rib.families().collect::<Vec<_>>();

    if options.best_path {
        let paths = state
            .rib
            .best_path_list(TableId::Global, 0, &families)
            .iter()
            .map(|path| best_path(state, path))
            .collect();
        let event = BestPathEvent {
            paths,
            multipath: vec![],
        };
        events.push(WatchEvent::BestPath(event));
    }
    for peer in peers.values() {
        let families = peer.configured_families();
        if options.pre_update {
            let paths = peer.adj_rib_in.path_list(&families, false);
            let event = UpdateEvent::new(peer, false, None, paths);
            events.push(WatchEvent::Update(event));
        }
        if options.post_update && !peer.is_route_server_client() {
            let families = peer.to_global_families(&families);
            let paths = state.rib.path_list_by_peer(peer.addr, &families);
            let event = UpdateEvent::new(peer, true, None, paths);
            events.push(WatchEvent::Update(event));
        }
    }
    events
}
