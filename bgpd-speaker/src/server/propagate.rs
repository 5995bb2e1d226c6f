//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use itertools::Itertools;
use tracing::debug;

use crate::af::RouteFamily;
use crate::debug::Debug;
use crate::packet::attribute::{ExtComm, UnknownAttr};
use crate::packet::nlri::Nlri;
use crate::path::{Path, PeerInfo};
use crate::peer::{Peer, Peers};
use crate::policy::{PolicyDirection, PolicyOptions, RoutingPolicy};
use crate::rib::destination::Update;
use crate::rib::{DFLT_LOCAL_PREF, TableId};
use crate::server::watch::{
    BestPath, BestPathEvent, UpdateEvent, WatchEvent, Watchers,
};
use crate::server::{ServerState, ServerUpView};
use crate::tasks::messages::output::Outgoing;

// Neighbor state that outgoing paths are filtered against, captured once
// per propagation batch.
#[derive(Clone, Debug)]
pub(crate) struct OutboundPeer {
    pub addr: IpAddr,
    pub info: Arc<PeerInfo>,
    pub table_id: TableId,
    pub vrf: Option<String>,
    pub route_server_client: bool,
    pub route_reflector_client: bool,
    pub next_hop_self: bool,
    pub replace_peer_as: bool,
    // Negotiated families.
    pub families: BTreeSet<RouteFamily>,
    // Families with long-lived graceful restart.
    pub llgr_families: BTreeSet<RouteFamily>,
    // Route target memberships received from the neighbor, if it negotiated
    // RTC. A `None` entry is the default membership.
    pub rtc_memberships: Option<Vec<Option<ExtComm>>>,
}

// ===== impl OutboundPeer =====

impl OutboundPeer {
    pub(crate) fn new(peer: &Peer) -> OutboundPeer {
        let fsm = peer.fsm.read();
        let families = fsm.families.keys().copied().collect::<BTreeSet<_>>();
        let llgr_families = fsm
            .gr
            .families
            .iter()
            .filter(|_| fsm.gr.long_lived_enabled)
            .filter(|(_, state)| state.llgr_received)
            .map(|(family, _)| *family)
            .collect();
        let rtc_memberships = families
            .contains(&RouteFamily::RouteTargetConstraint)
            .then(|| peer.adj_rib_in.rtc_memberships());

        OutboundPeer {
            addr: peer.addr,
            info: fsm.peer_info.clone(),
            table_id: peer.table_id(),
            vrf: fsm.config.vrf.clone(),
            route_server_client: fsm.config.is_route_server_client(),
            route_reflector_client: fsm.config.is_route_reflector_client(),
            next_hop_self: fsm.config.next_hop_self,
            replace_peer_as: fsm.config.as_path_options.replace_peer_as,
            families,
            llgr_families,
            rtc_memberships,
        }
    }

    fn is_ibgp(&self) -> bool {
        self.info.is_ibgp()
    }

    // RFC 4684: whether the neighbor asked for paths carrying any of the
    // path's route targets.
    fn wants_route_targets(&self, path: &Path) -> bool {
        let Some(memberships) = &self.rtc_memberships else {
            return true;
        };
        memberships.iter().any(|membership| match membership {
            None => true,
            Some(rt) => path.attrs.route_targets().any(|prt| prt == rt),
        })
    }
}

// ===== global functions =====

// Runs paths received from a neighbor (or originated locally when `source`
// is `None`) through the import policy and the RIB, and propagates the
// resulting best-path changes.
pub(crate) fn propagate_update(
    server: &mut ServerUpView<'_>,
    peers: &Peers,
    source: Option<IpAddr>,
    paths: Vec<Path>,
) {
    let peer = source.and_then(|addr| peers.get(&addr));
    let rs = peer.is_some_and(Peer::is_route_server_client);
    let table_id = match peer {
        Some(peer) if rs => peer.table_id(),
        _ => TableId::Global,
    };
    let vrf = peer
        .and_then(Peer::vrf)
        .and_then(|name| server.state.rib.vrfs.get(&name).cloned());
    let info = peer.map(Peer::peer_info);

    // Import policy.
    let paths = paths
        .into_iter()
        .map(|path| match &vrf {
            Some(vrf) => path.to_global(vrf),
            None => path,
        })
        .map(|path| {
            let state = &*server.state;
            let validation = state.validator.validate(&path);
            let options = PolicyOptions {
                info: info.as_deref().unwrap_or(&state.local_info),
                old_nexthop: None,
                validation: validation.as_ref(),
            };
            let result = state.policy.apply(
                table_id,
                PolicyDirection::Import,
                path.clone(),
                &options,
            );
            let path = result.unwrap_or_else(|| {
                Debug::PolicyReject(&path, PolicyDirection::Import).log();
                path.as_withdrawal()
            });
            path.with_validation(validation)
        })
        .collect::<Vec<_>>();

    if !rs
        && let Some(peer) = peer
        && server.watchers.post_update()
    {
        let event = UpdateEvent::new(peer, true, None, paths.clone());
        server.watchers.notify(WatchEvent::Update(event));
    }

    for path in paths {
        if !rs
            && let Some(peer) = peer
            && path.family() == RouteFamily::RouteTargetConstraint
        {
            process_rtc_membership(server.state, peer, &path);
        }

        let updates = server.state.rib_mut(rs).update(path.clone());
        if !updates.is_empty() {
            propagate_to_neighbors(server, peers, peer, &path, &updates, true);
        }
    }
}

// Fans the RIB changes caused by one path out to every neighbor.
//
// `need_old` is unset when the previous best paths were already withdrawn
// from the neighbors by other means.
pub(crate) fn propagate_to_neighbors(
    server: &mut ServerUpView<'_>,
    peers: &Peers,
    source: Option<&Peer>,
    new_path: &Path,
    updates: &[Update],
    need_old: bool,
) {
    let state = &*server.state;
    let source_rs = source.is_some_and(Peer::is_route_server_client);

    let (global_best, global_old) = if !source_rs {
        let multipath = state.config.use_multiple_paths;
        let mut best_list = Vec::with_capacity(updates.len());
        let mut old_list = Vec::with_capacity(updates.len());
        let mut multi_list = vec![];
        for update in updates {
            let (best, old, multi) =
                update.changes(TableId::Global, 0, multipath);
            match &best {
                Some(best) if !best.is_withdraw() => {
                    Debug::BestPathFound(best).log();
                }
                Some(_) => Debug::BestPathNotFound(&update.nlri).log(),
                None => (),
            }
            best_list.push(best);
            old_list.push(old);
            if !multi.is_empty() {
                multi_list.push(multi);
            }
        }
        notify_best_path(state, server.watchers, &best_list, multi_list);
        (best_list, old_list)
    } else {
        (vec![], vec![])
    };

    for target in peers.values() {
        let target_rs = target.is_route_server_client();
        match source {
            None if target_rs => continue,
            Some(_) if source_rs != target_rs => continue,
            _ => (),
        }

        let family = match target.vrf() {
            Some(_) => new_path.family().to_unicast(),
            None => new_path.family(),
        };
        let (best, old) = if target.add_path_send(family) {
            (add_path_list(new_path, updates), vec![])
        } else if target_rs {
            let asn = target.peer_info().asn;
            updates
                .iter()
                .map(|update| {
                    let (best, old, _) =
                        update.changes(target.table_id(), asn, false);
                    (best, old)
                })
                .unzip()
        } else {
            (global_best.clone(), global_old.clone())
        };
        let old = if need_old { old } else { vec![] };

        let paths = process_outgoing_paths(state, target, best, old);
        target.send(Outgoing::paths(paths));
    }
}

// Filters a batch of paths for one neighbor. `olds` holds the previous best
// path of each position, when known.
pub(crate) fn process_outgoing_paths(
    state: &ServerState,
    target: &Peer,
    paths: Vec<Option<Path>>,
    olds: Vec<Option<Path>>,
) -> Vec<Path> {
    if !target.is_established() {
        return vec![];
    }
    if target.fsm.read().gr.local_restarting {
        debug!(addr = %target.addr, "local restart, suppressing updates");
        return vec![];
    }

    let outbound = OutboundPeer::new(target);
    let mut olds = olds.into_iter();
    paths
        .into_iter()
        .map(|path| (path, olds.next().flatten()))
        .filter_map(|(path, old)| {
            filterpath(state, &outbound, path?, old.as_ref())
        })
        .collect()
}

// Decides what, if anything, a neighbor must receive for a path. `old` is
// the previous best path of the same destination.
//
// The result is the (rewritten) path, a withdrawal of the old path, or
// nothing.
pub(crate) fn filterpath(
    state: &ServerState,
    target: &OutboundPeer,
    mut path: Path,
    old: Option<&Path>,
) -> Option<Path> {
    // RFC 4684 membership paths.
    if path.family() == RouteFamily::RouteTargetConstraint
        && !path.is_withdraw()
    {
        if path.is_local() && old.is_some_and(|old| path.is_same(old)) {
            debug!(addr = %target.addr, nlri = %path.nlri,
                "membership already advertised");
            return None;
        }
        if let Some(old) = old
            && old.is_local()
        {
            // The local membership went away (VRF deleted).
            return Some(old.as_withdrawal());
        } else if !target.route_reflector_client {
            // Any known path is sent, not only the best one. A path learned
            // from a route reflector client wins over the others, and the
            // neighbor's own path is never echoed back. Clients instead
            // get the path even when they originated it, so that they
            // distribute the paths carrying that route target.
            let dest = state.rib.destination(path.family(), &path.nlri)?;
            let candidates = dest
                .known_path_list(target.table_id, target.info.asn)
                .into_iter()
                .filter(|known| known.source.address != Some(target.addr))
                .collect::<Vec<_>>();
            path = candidates
                .iter()
                .find(|known| known.source.route_reflector_client)
                .or(candidates.first())
                .cloned()?;
        }
    }

    // VRF-attached neighbors only see the importable VPN paths, converted
    // to their unicast form.
    if let Some(vrf) = &target.vrf {
        if !path.family().is_vpn() {
            return None;
        }
        let vrf = state.rib.vrfs.get(vrf)?;
        if !vrf.can_import(&path) {
            return None;
        }
        path = path.to_local();
    }

    if target.replace_peer_as && !path.is_withdraw() {
        path = path.replace_as(target.info.local_as, target.info.asn);
    }

    let mut path = filter_neighbor(target, path, old)?;

    // Outbound attribute rewrite and export policy.
    let old_nexthop = path.nexthop();
    path = update_path_attrs(target, path);
    let validation = state.validator.validate(&path);
    let options = PolicyOptions {
        info: &target.info,
        old_nexthop,
        validation: validation.as_ref(),
    };
    let result = state.policy.apply(
        target.table_id,
        PolicyDirection::Export,
        path.clone(),
        &options,
    );
    path = match result {
        Some(path) => path,
        None => {
            Debug::PolicyReject(&path, PolicyDirection::Export).log();
            // Withdraw the old path if it was advertised.
            let old = old?;
            state.policy.apply(
                target.table_id,
                PolicyDirection::Export,
                old.clone(),
                &options,
            )?;
            old.as_withdrawal()
        }
    };

    // RFC 9494: LLGR stale paths are withdrawn from the neighbors that
    // don't support long-lived graceful restart.
    if !path.is_withdraw()
        && path.is_llgr_stale()
        && !target.llgr_families.contains(&path.family())
    {
        path = path.as_withdrawal();
    }

    if !target.is_ibgp() && !target.route_server_client {
        path = path.without_local_pref();
    }

    Some(path)
}

// Rewrites the attributes of a path advertised to the given neighbor.
pub(crate) fn update_path_attrs(target: &OutboundPeer, path: Path) -> Path {
    if target.route_server_client {
        return path;
    }

    let local_address = target.info.local_address;
    let mut attrs = (*path.attrs).clone();
    attrs.unknown.retain(UnknownAttr::is_transitive);

    if target.is_ibgp() {
        if (path.is_local() && attrs.base.nexthop.is_none())
            || target.next_hop_self
        {
            attrs.base.nexthop = local_address.or(attrs.base.nexthop);
        }
        attrs.base.local_pref.get_or_insert(DFLT_LOCAL_PREF);

        // RFC 4456 - Section 8.
        if target.route_reflector_client {
            if path.family() == RouteFamily::RouteTargetConstraint {
                // RFC 4684 - Section 3.2.
                attrs.base.nexthop = local_address.or(attrs.base.nexthop);
                attrs.base.originator_id = Some(target.info.local_id);
            } else if attrs.base.originator_id.is_none() {
                attrs.base.originator_id = Some(if path.is_local() {
                    target.info.local_id
                } else {
                    path.source.id
                });
            }
            attrs
                .base
                .cluster_list
                .get_or_insert_with(Default::default)
                .prepend(target.info.route_reflector_cluster_id);
        }
    } else {
        if !path.is_local() || attrs.base.nexthop.is_none() {
            attrs.base.nexthop = local_address.or(attrs.base.nexthop);
        }
        attrs.base.as_path.prepend(target.info.local_as);
        if !path.is_local() {
            attrs.base.med = None;
        }
        attrs.base.originator_id = None;
        attrs.base.cluster_list = None;
    }

    path.with_attrs(attrs)
}

// Paths a neighbor must receive when its session comes up (or on route
// refresh), along with the candidate paths it was denied.
pub(crate) fn best_from_local(
    state: &ServerState,
    peer: &Peer,
    families: &[RouteFamily],
) -> (Vec<Path>, Vec<Path>) {
    let target = OutboundPeer::new(peer);
    let rib = state.rib(target.route_server_client);

    let mut paths = vec![];
    let mut filtered = vec![];
    for family in peer.to_global_families(families) {
        let family = [family];
        let candidates = if peer.add_path_send(family[0]) {
            rib.path_list(target.table_id, target.info.asn, &family)
        } else {
            rib.best_path_list(target.table_id, target.info.asn, &family)
        };
        for path in candidates {
            match filterpath(state, &target, path.clone(), None) {
                Some(path) => paths.push(path),
                None => filtered.push(path),
            }
        }
    }
    (paths, filtered)
}

// Withdraws from the RIB every path learned from a neighbor for the given
// families.
pub(crate) fn drop_peer_all_routes(
    server: &mut ServerUpView<'_>,
    peers: &Peers,
    addr: IpAddr,
    families: &[RouteFamily],
) {
    let Some(peer) = peers.get(&addr) else {
        return;
    };
    let rs = peer.is_route_server_client();
    let families = peer.to_global_families(families);
    let paths = server.state.rib(rs).path_list_by_peer(addr, &families);

    for path in paths {
        let path = path.as_withdrawal();
        let updates = server.state.rib_mut(rs).update(path.clone());
        if !updates.is_empty() {
            propagate_to_neighbors(
                server,
                peers,
                Some(peer),
                &path,
                &updates,
                false,
            );
        }
    }
}

// Re-evaluates the paths received from a neighbor, after a policy or
// AS-path option change.
pub(crate) fn soft_reset_in(
    server: &mut ServerUpView<'_>,
    peers: &mut Peers,
    addr: IpAddr,
    families: &[RouteFamily],
) {
    let Some(peer) = peers.get_mut(&addr) else {
        return;
    };
    let (local_as, allow_own_as) = {
        let fsm = peer.fsm.read();
        (fsm.local_as(), fsm.config.as_path_options.allow_own_as)
    };

    let mut paths = vec![];
    for path in peer.adj_rib_in.path_list(families, false) {
        let looped = is_own_as_looped(&path, local_as, allow_own_as);
        let changed = path.is_as_looped() != looped;
        let path = if changed {
            let path = path.with_as_looped(looped);
            peer.adj_rib_in.update(vec![path.clone()]);
            path
        } else {
            path
        };
        if !path.is_as_looped() {
            paths.push(path);
        } else if changed {
            // Newly looped paths leave the RIB.
            paths.push(path.as_withdrawal());
        }
    }

    propagate_update(server, peers, Some(addr), paths);
}

// Re-sends the best paths to a neighbor, withdrawing the ones it is no
// longer allowed to see.
pub(crate) fn soft_reset_out(
    state: &ServerState,
    peer: &Peer,
    families: &[RouteFamily],
) {
    if !peer.is_established() {
        return;
    }
    let (mut paths, filtered) = best_from_local(state, peer, families);
    paths.extend(filtered.iter().map(Path::as_withdrawal));
    peer.send(Outgoing::paths(paths));
}

// Returns whether the local AS appears in the AS path more often than
// tolerated.
pub(crate) fn is_own_as_looped(
    path: &Path,
    local_as: u32,
    allow_own_as: u8,
) -> bool {
    path.attrs.base.as_path.count(local_as) > usize::from(allow_own_as)
}

// Annotates a best path with the VRFs importing it.
pub(crate) fn best_path(state: &ServerState, path: &Path) -> BestPath {
    let vrf_ids = state
        .rib
        .vrfs
        .values()
        .filter(|vrf| vrf.id != 0)
        .filter(|vrf| path.family().is_vpn() && vrf.can_import(path))
        .map(|vrf| vrf.id)
        .collect();
    BestPath {
        path: path.clone(),
        vrf_ids,
    }
}

// ===== helper functions =====

// Paths advertised to an ADD-PATH neighbor: every change is sent, not only
// best-path changes.
fn add_path_list(new_path: &Path, updates: &[Update]) -> Vec<Option<Path>> {
    if new_path.is_withdraw() {
        return updates
            .iter()
            .flat_map(Update::withdrawn_paths)
            .map(Some)
            .collect();
    }

    // The local membership was already advertised. This avoids an update
    // loop between route reflectors and their clients.
    if new_path.family() == RouteFamily::RouteTargetConstraint
        && updates.iter().any(|update| {
            update.old_known_path_list.iter().any(Path::is_local)
        })
    {
        return vec![];
    }

    updates
        .iter()
        .map(|update| Some(update.new_path.clone()))
        .collect()
}

// Neighbor-level checks: address family, route target constraint, iBGP
// re-advertisement rules, split horizon and AS-path loops.
fn filter_neighbor(
    target: &OutboundPeer,
    path: Path,
    old: Option<&Path>,
) -> Option<Path> {
    if !target.families.contains(&path.family()) {
        return None;
    }

    if path.family().is_vpn()
        && !path.is_withdraw()
        && !target.wants_route_targets(&path)
    {
        return None;
    }

    // RFC 4456 - Section 8.
    if target.is_ibgp() && !path.is_local() {
        let source = &path.source;
        let mut ignore =
            source.asn == target.info.asn && !source.route_reflector_client;
        if target.route_reflector_client {
            let cluster_id = target.info.route_reflector_cluster_id;
            if path
                .attrs
                .base
                .cluster_list
                .as_ref()
                .is_some_and(|list| list.contains(&cluster_id))
            {
                debug!(addr = %target.addr, nlri = %path.nlri,
                    "cluster list loop, ignoring");
                return None;
            }
            ignore = false;
        }
        if ignore {
            // The previous best path (local or learned over eBGP) was
            // advertised and must be withdrawn.
            if !path.is_withdraw()
                && let Some(old) = old
                && (old.is_local()
                    || (old.source.address != Some(target.addr)
                        && old.source.asn != target.info.asn))
            {
                return Some(old.as_withdrawal());
            }
            return None;
        }
    }

    // Split horizon. Membership paths are reflected back to clients to keep
    // them sending paths with the route target.
    if path.source.address == Some(target.addr) {
        let rtc_to_client = !target.route_server_client
            && target.route_reflector_client
            && path.family() == RouteFamily::RouteTargetConstraint;
        if !rtc_to_client {
            if !target.route_server_client
                && !path.is_withdraw()
                && let Some(old) = old
                && old.source.address != Some(target.addr)
            {
                return Some(old.as_withdrawal());
            }
            return None;
        }
    }

    if !target.route_server_client
        && path.attrs.base.as_path.contains(target.info.asn)
    {
        return None;
    }

    Some(path)
}

// RFC 4684 - Section 6: a change in the route target membership of a
// neighbor changes the set of VPN paths it must receive.
fn process_rtc_membership(state: &ServerState, peer: &Peer, path: &Path) {
    let Nlri::RouteTarget { route_target, .. } = path.nlri else {
        return;
    };
    let families = peer
        .negotiated_families()
        .into_iter()
        .filter(|family| *family != RouteFamily::RouteTargetConstraint)
        .collect_vec();
    if families.is_empty() {
        return;
    }

    let candidates = if path.is_withdraw() {
        // The paths the membership allowed are now filtered.
        best_from_local(state, peer, &families).1
    } else {
        // Duplicate memberships change nothing.
        let duplicate = state
            .rib
            .path_list_with_source(
                TableId::Global,
                &[RouteFamily::RouteTargetConstraint],
                &path.source,
            )
            .iter()
            .any(|known| known.nlri == path.nlri);
        if duplicate {
            vec![]
        } else {
            state
                .rib
                .best_path_list(peer.table_id(), 0, &families)
        }
    };

    let paths = candidates
        .into_iter()
        .filter(|candidate| match &route_target {
            None => candidate.attrs.route_targets().next().is_some(),
            Some(rt) => candidate.attrs.route_targets().any(|crt| crt == rt),
        })
        .collect::<Vec<_>>();
    let paths = if path.is_withdraw() {
        paths.iter().map(Path::as_withdrawal).collect()
    } else {
        let olds = vec![None; paths.len()];
        process_outgoing_paths(
            state,
            peer,
            paths.into_iter().map(Some).collect(),
            olds,
        )
    };
    peer.send(Outgoing::paths(paths));
}

fn notify_best_path(
    state: &ServerState,
    watchers: &mut Watchers,
    best_list: &[Option<Path>],
    multipath: Vec<Vec<Path>>,
) {
    if !watchers.best_path() {
        return;
    }
    let paths = best_list
        .iter()
        .flatten()
        .map(|path| best_path(state, path))
        .collect::<Vec<_>>();
    if paths.is_empty() && multipath.is_empty() {
        return;
    }
    let event = BestPathEvent { paths, multipath };
    watchers.notify(WatchEvent::BestPath(event));
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use ipnetwork::IpNetwork;
    use maplit::btreeset;

    use super::*;
    use crate::config::GlobalConfig;
    use crate::packet::attribute::{AsPath, Attrs, ClusterList};

    const LOCAL_AS: u32 = 65000;
    const ROUTER_ID: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const LOCAL_ADDR: [u8; 4] = [192, 0, 2, 254];

    fn state() -> ServerState {
        ServerState::new(GlobalConfig {
            asn: LOCAL_AS,
            router_id: ROUTER_ID,
            ..Default::default()
        })
    }

    fn info(asn: u32, addr: &str) -> PeerInfo {
        let addr = addr.parse::<IpAddr>().unwrap();
        PeerInfo {
            asn,
            local_as: LOCAL_AS,
            id: Ipv4Addr::new(10, 0, 0, asn as u8),
            local_id: ROUTER_ID,
            address: Some(addr),
            local_address: Some(IpAddr::from(LOCAL_ADDR)),
            route_reflector_client: false,
            route_reflector_cluster_id: ROUTER_ID,
        }
    }

    fn outbound(asn: u32, addr: &str) -> OutboundPeer {
        let info = info(asn, addr);
        OutboundPeer {
            addr: info.address.unwrap(),
            info: Arc::new(info),
            table_id: TableId::Global,
            vrf: None,
            route_server_client: false,
            route_reflector_client: false,
            next_hop_self: false,
            replace_peer_as: false,
            families: btreeset![RouteFamily::Ipv4Unicast],
            llgr_families: Default::default(),
            rtc_memberships: None,
        }
    }

    fn path(source: PeerInfo, as_path: &[u32]) -> Path {
        let mut attrs = Attrs::default();
        attrs.base.as_path = AsPath::from_sequence(as_path.iter().copied());
        attrs.base.nexthop = source.address;
        attrs.base.med = Some(10);
        attrs.base.local_pref = Some(200);
        let prefix = "10.0.0.0/24".parse::<IpNetwork>().unwrap();
        Path::new(
            Arc::new(source),
            Nlri::from(prefix),
            0,
            Arc::new(attrs),
            false,
        )
    }

    fn as_path(path: &Path) -> Vec<u32> {
        path.attrs.base.as_path.iter().collect()
    }

    #[test]
    fn ebgp_attribute_rewrite() {
        let state = state();
        let target = outbound(65002, "192.0.2.2");
        let path = path(info(65001, "192.0.2.1"), &[65001]);

        let sent = filterpath(&state, &target, path, None).unwrap();
        assert!(!sent.is_withdraw());
        assert_eq!(sent.nexthop(), Some(IpAddr::from(LOCAL_ADDR)));
        assert_eq!(as_path(&sent), vec![LOCAL_AS, 65001]);
        assert_eq!(sent.attrs.base.med, None);
        assert_eq!(sent.attrs.base.local_pref, None);
    }

    #[test]
    fn ibgp_local_path_defaults() {
        let target = outbound(LOCAL_AS, "192.0.2.3");
        let mut local = path(info(65001, "192.0.2.1"), &[]);
        local.source = Arc::new(PeerInfo::local(LOCAL_AS, ROUTER_ID));
        let mut attrs = (*local.attrs).clone();
        attrs.base.nexthop = None;
        attrs.base.local_pref = None;
        let local = local.with_attrs(attrs);

        let sent = update_path_attrs(&target, local);
        assert_eq!(sent.nexthop(), Some(IpAddr::from(LOCAL_ADDR)));
        assert_eq!(sent.attrs.base.local_pref, Some(DFLT_LOCAL_PREF));
        assert!(as_path(&sent).is_empty());
    }

    #[test]
    fn as_path_loop() {
        let state = state();
        let target = outbound(65002, "192.0.2.2");
        let path = path(info(65001, "192.0.2.1"), &[65001, 65002, 65003]);
        assert!(filterpath(&state, &target, path, None).is_none());
    }

    #[test]
    fn family_not_negotiated() {
        let state = state();
        let mut target = outbound(65002, "192.0.2.2");
        target.families.clear();
        let path = path(info(65001, "192.0.2.1"), &[65001]);
        assert!(filterpath(&state, &target, path, None).is_none());
    }

    #[test]
    fn split_horizon() {
        let state = state();
        let target = outbound(65001, "192.0.2.1");
        let own = path(info(65001, "192.0.2.1"), &[65001]);
        assert!(filterpath(&state, &target, own.clone(), None).is_none());

        // The neighbor's path replaced another best path, which must be
        // withdrawn from it.
        let old = path(info(65003, "192.0.2.3"), &[65003]);
        let sent = filterpath(&state, &target, own, Some(&old)).unwrap();
        assert!(sent.is_withdraw());
        assert_eq!(sent.source.address, old.source.address);
    }

    #[test]
    fn ibgp_not_readvertised() {
        let state = state();
        let target = outbound(LOCAL_AS, "192.0.2.4");
        let ibgp = path(info(LOCAL_AS, "192.0.2.3"), &[]);
        assert!(filterpath(&state, &target, ibgp.clone(), None).is_none());

        // A previously advertised eBGP best path is withdrawn instead.
        let old = path(info(65001, "192.0.2.1"), &[65001]);
        let sent = filterpath(&state, &target, ibgp, Some(&old)).unwrap();
        assert!(sent.is_withdraw());
        assert_eq!(sent.source.asn, 65001);
    }

    #[test]
    fn route_reflection() {
        let state = state();
        let mut target = outbound(LOCAL_AS, "192.0.2.4");
        target.route_reflector_client = true;
        let source = info(LOCAL_AS, "192.0.2.3");
        let source_id = source.id;
        let ibgp = path(source, &[]);

        let sent = filterpath(&state, &target, ibgp.clone(), None).unwrap();
        assert_eq!(sent.attrs.base.originator_id, Some(source_id));
        assert_eq!(
            sent.attrs.base.cluster_list,
            Some(ClusterList(vec![ROUTER_ID]))
        );
        assert_eq!(sent.attrs.base.local_pref, Some(200));

        // Our own cluster ID means the path already went through us.
        let mut attrs = (*ibgp.attrs).clone();
        attrs.base.cluster_list = Some(ClusterList(vec![ROUTER_ID]));
        let looped = ibgp.with_attrs(attrs);
        assert!(filterpath(&state, &target, looped, None).is_none());
    }

    #[test]
    fn rtc_membership_from_reflector_client() {
        let mut state = ServerState::new(GlobalConfig {
            asn: LOCAL_AS,
            router_id: ROUTER_ID,
            families: vec![RouteFamily::RouteTargetConstraint],
            ..Default::default()
        });
        let membership = |mut source: PeerInfo, client: bool| {
            source.route_reflector_client = client;
            let mut path = path(source, &[]);
            path.nlri = Nlri::RouteTarget {
                origin_as: 65001,
                route_target: None,
            };
            path
        };
        let plain = membership(info(LOCAL_AS, "192.0.2.3"), false);
        let client = membership(info(LOCAL_AS, "192.0.2.5"), true);
        state.rib.update(plain.clone());
        state.rib.update(client.clone());

        // Whatever the best path, a non-client gets the client's path.
        let mut target = outbound(LOCAL_AS, "192.0.2.4");
        target.families = btreeset![RouteFamily::RouteTargetConstraint];
        target.route_reflector_client = true;
        let sent = filterpath(&state, &target, plain.clone(), None);
        assert_eq!(sent.unwrap().source.address, plain.source.address);
        target.route_reflector_client = false;
        let sent = filterpath(&state, &target, plain.clone(), None);
        assert_eq!(sent.unwrap().source.address, client.source.address);

        // A path is never echoed back to the neighbor it came from.
        let mut target = outbound(65009, "192.0.2.5");
        target.families = btreeset![RouteFamily::RouteTargetConstraint];
        let sent = filterpath(&state, &target, client, None);
        assert_eq!(sent.unwrap().source.address, plain.source.address);
    }

    #[test]
    fn own_as_loop_tolerance() {
        let path = path(info(65001, "192.0.2.1"), &[65001, LOCAL_AS]);
        assert!(is_own_as_looped(&path, LOCAL_AS, 0));
        assert!(!is_own_as_looped(&path, LOCAL_AS, 1));
    }
}
