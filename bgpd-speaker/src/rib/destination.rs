//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cmp::Ordering;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::af::RouteFamily;
use crate::packet::nlri::Nlri;
use crate::path::Path;
use crate::rib::{DFLT_LOCAL_PREF, SelectionCfg, TableId};

// All paths known for one NLRI, ordered best first.
#[derive(Clone, Debug)]
pub struct Destination {
    pub nlri: Nlri,
    pub known_paths: Vec<Path>,
    pub best_reason: Option<BestPathReason>,
}

// Outcome of a destination recalculation.
#[derive(Clone, Debug)]
pub struct Update {
    pub nlri: Nlri,
    // The processed path, carrying the local path identifier it was stored
    // (or withdrawn) under.
    pub new_path: Path,
    pub known_path_list: Vec<Path>,
    pub old_known_path_list: Vec<Path>,
    selection: SelectionCfg,
}

// Tie-breaker that decided the best path.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BestPathReason {
    OnlyPath,
    LlgrStale,
    ReachableNexthop,
    LocalPref,
    LocalOrigin,
    AsPath,
    Origin,
    Med,
    ExternalOverInternal,
    Older,
    RouterId,
    ClusterList,
    PeerAddress,
    PathId,
    Equal,
}

// ===== impl Destination =====

impl Destination {
    pub fn new(nlri: Nlri) -> Destination {
        Destination {
            nlri,
            known_paths: Vec::new(),
            best_reason: None,
        }
    }

    pub fn family(&self) -> RouteFamily {
        self.nlri.family()
    }

    // Processes a new path or withdrawal for this destination.
    //
    // A source can have a single path per path identifier: a new path
    // replaces (implicitly withdraws) the previous one, inheriting its local
    // path identifier.
    pub fn calculate(
        &mut self,
        mut path: Path,
        selection: &SelectionCfg,
    ) -> Update {
        let old_known_path_list = self.known_paths.clone();

        let source_key = path.source_key();
        let prev = self
            .known_paths
            .iter()
            .position(|known| known.source_key() == source_key);
        let prev = prev.map(|pos| self.known_paths.remove(pos));

        match prev {
            Some(prev) => path.local_path_id = prev.local_path_id,
            None if !path.is_withdraw() => {
                path.local_path_id = self.next_local_path_id();
            }
            None => (),
        }
        if !path.is_withdraw() {
            self.known_paths.push(path.clone());
        }

        self.known_paths.sort_by(|a, b| compare(a, b, selection).0);
        self.best_reason = match self.known_paths.as_slice() {
            [] => None,
            [_] => Some(BestPathReason::OnlyPath),
            [a, b, ..] => Some(compare(a, b, selection).1),
        };

        Update {
            nlri: self.nlri,
            new_path: path,
            known_path_list: self.known_paths.clone(),
            old_known_path_list,
            selection: *selection,
        }
    }

    // Paths visible from the given table.
    pub fn known_path_list(&self, table_id: TableId, asn: u32) -> Vec<Path> {
        known_path_list(&self.known_paths, table_id, asn)
            .cloned()
            .collect()
    }

    pub fn best_path(&self, table_id: TableId, asn: u32) -> Option<&Path> {
        best_path(&self.known_paths, table_id, asn)
    }

    pub fn multipath_list(
        &self,
        table_id: TableId,
        asn: u32,
        selection: &SelectionCfg,
    ) -> Vec<Path> {
        multipath_list(&self.known_paths, table_id, asn, selection)
    }

    // Lowest local path identifier not in use.
    fn next_local_path_id(&self) -> u32 {
        (1..)
            .find(|id| {
                !self.known_paths.iter().any(|path| path.local_path_id == *id)
            })
            .unwrap_or_default()
    }
}

// ===== impl Update =====

impl Update {
    // Returns the new best path to advertise (if it changed), the previous
    // best path and the new multipath set (if it changed).
    pub fn changes(
        &self,
        table_id: TableId,
        asn: u32,
        multipath: bool,
    ) -> (Option<Path>, Option<Path>, Vec<Path>) {
        let old = best_path(&self.old_known_path_list, table_id, asn);
        let best = best_path(&self.known_path_list, table_id, asn);

        let (best, old) = match (best, old) {
            (Some(best), Some(old))
                if best.is_same(old)
                    && best.local_path_id == old.local_path_id =>
            {
                // RFC 4684 - Section 3.2:
                // "When processing RT membership NLRIs received from internal
                // iBGP peers, it is necessary to consider all available iBGP
                // paths for a given RT prefix, for building the outbound route
                // filter, and not just the best path".
                if best.family() == RouteFamily::RouteTargetConstraint
                    || best.is_nexthop_invalid() != old.is_nexthop_invalid()
                {
                    (Some(best.clone()), Some(old.clone()))
                } else {
                    (None, Some(old.clone()))
                }
            }
            (None, Some(old)) => (Some(old.as_withdrawal()), Some(old.clone())),
            (None, None) => (None, None),
            (Some(best), old) => (Some(best.clone()), old.cloned()),
        };

        let mut multi = vec![];
        if multipath && table_id == TableId::Global {
            let old_multi = multipath_list(
                &self.old_known_path_list,
                table_id,
                asn,
                &self.selection,
            );
            let new_multi = multipath_list(
                &self.known_path_list,
                table_id,
                asn,
                &self.selection,
            );
            let changed = old_multi.len() != new_multi.len()
                || old_multi
                    .iter()
                    .zip(new_multi.iter())
                    .any(|(a, b)| !a.is_same(b));
            if changed {
                multi = new_multi;
                if multi.is_empty()
                    && let Some(best) = &best
                {
                    multi.push(best.clone());
                }
            }
        }

        (best, old, multi)
    }

    // Paths that disappeared from the destination, as withdrawals.
    //
    // An implicit withdrawal (a source replacing its own path) doesn't change
    // the number of known paths and produces nothing.
    pub fn withdrawn_paths(&self) -> Vec<Path> {
        if self.known_path_list.len() == self.old_known_path_list.len() {
            return vec![];
        }
        self.old_known_path_list
            .iter()
            .filter(|old| {
                !self.known_path_list.iter().any(|new| {
                    new.source_key() == old.source_key()
                        && new.local_path_id == old.local_path_id
                })
            })
            .map(|old| old.as_withdrawal())
            .collect()
    }
}

// ===== impl BestPathReason =====

impl BestPathReason {
    // Returns whether paths that tie up to this point are considered equal
    // for multipath purposes.
    pub fn is_multipath_tie(&self) -> bool {
        matches!(
            self,
            BestPathReason::Older
                | BestPathReason::RouterId
                | BestPathReason::ClusterList
                | BestPathReason::PeerAddress
                | BestPathReason::PathId
                | BestPathReason::Equal
        )
    }
}

impl std::fmt::Display for BestPathReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BestPathReason::OnlyPath => write!(f, "only path"),
            BestPathReason::LlgrStale => write!(f, "LLGR stale community"),
            BestPathReason::ReachableNexthop => write!(f, "reachable nexthop"),
            BestPathReason::LocalPref => write!(f, "local preference"),
            BestPathReason::LocalOrigin => write!(f, "local origin"),
            BestPathReason::AsPath => write!(f, "AS path length"),
            BestPathReason::Origin => write!(f, "origin"),
            BestPathReason::Med => write!(f, "MED"),
            BestPathReason::ExternalOverInternal => {
                write!(f, "eBGP over iBGP")
            }
            BestPathReason::Older => write!(f, "older path"),
            BestPathReason::RouterId => write!(f, "router ID"),
            BestPathReason::ClusterList => write!(f, "cluster list length"),
            BestPathReason::PeerAddress => write!(f, "peer address"),
            BestPathReason::PathId => write!(f, "path identifier"),
            BestPathReason::Equal => write!(f, "equal"),
        }
    }
}

// ===== helper functions =====

fn known_path_list(
    paths: &[Path],
    table_id: TableId,
    asn: u32,
) -> impl Iterator<Item = &Path> + '_ {
    paths.iter().filter(move |path| {
        // Route server clients don't see the paths that went through their
        // own AS.
        table_id == TableId::Global
            || asn == 0
            || !path.attrs.base.as_path.contains(asn)
    })
}

fn best_path(paths: &[Path], table_id: TableId, asn: u32) -> Option<&Path> {
    known_path_list(paths, table_id, asn)
        .find(|path| !path.is_nexthop_invalid())
}

fn multipath_list(
    paths: &[Path],
    table_id: TableId,
    asn: u32,
    selection: &SelectionCfg,
) -> Vec<Path> {
    let mut paths = known_path_list(paths, table_id, asn)
        .filter(|path| !path.is_nexthop_invalid());
    let Some(best) = paths.next() else {
        return vec![];
    };
    std::iter::once(best)
        .chain(paths.filter(|path| {
            compare(best, path, selection).1.is_multipath_tie()
        }))
        .cloned()
        .collect()
}

// Router ID used for tie-breaking (RFC 4456 - Section 9).
fn router_id(path: &Path) -> Ipv4Addr {
    path.attrs.base.originator_id.unwrap_or(path.source.id)
}

fn tie_break<T: Ord>(
    a: T,
    b: T,
    reason: BestPathReason,
) -> Option<(Ordering, BestPathReason)> {
    match a.cmp(&b) {
        Ordering::Equal => None,
        ordering => Some((ordering, reason)),
    }
}

// ===== global functions =====

// Compares two paths for best-path selection. `Ordering::Less` means that `a`
// is preferred over `b`.
pub fn compare(
    a: &Path,
    b: &Path,
    selection: &SelectionCfg,
) -> (Ordering, BestPathReason) {
    // Paths tagged LLGR_STALE are the least preferred (RFC 9494).
    if let Some(result) = tie_break(
        a.is_llgr_stale(),
        b.is_llgr_stale(),
        BestPathReason::LlgrStale,
    ) {
        return result;
    }

    // Prefer paths with a reachable nexthop.
    if let Some(result) = tie_break(
        a.is_nexthop_invalid(),
        b.is_nexthop_invalid(),
        BestPathReason::ReachableNexthop,
    ) {
        return result;
    }

    // Compare LOCAL_PREFERENCE attributes.
    let a_pref = a.attrs.base.local_pref.unwrap_or(DFLT_LOCAL_PREF);
    let b_pref = b.attrs.base.local_pref.unwrap_or(DFLT_LOCAL_PREF);
    if let Some(result) =
        tie_break(b_pref, a_pref, BestPathReason::LocalPref)
    {
        return result;
    }

    // Prefer locally originated paths.
    if a.source != b.source
        && let Some(result) = tie_break(
            !a.is_local(),
            !b.is_local(),
            BestPathReason::LocalOrigin,
        )
    {
        return result;
    }

    // Compare AS_PATH lengths.
    if !selection.ignore_as_path_length
        && let Some(result) = tie_break(
            a.attrs.base.as_path.path_length(),
            b.attrs.base.as_path.path_length(),
            BestPathReason::AsPath,
        )
    {
        return result;
    }

    // Compare ORIGIN attributes.
    if let Some(result) = tie_break(
        a.attrs.base.origin,
        b.attrs.base.origin,
        BestPathReason::Origin,
    ) {
        return result;
    }

    // Compare MULTI_EXIT_DISC attributes.
    let a_as_path = &a.attrs.base.as_path;
    let b_as_path = &b.attrs.base.as_path;
    let internal = a_as_path.path_length() == 0 && b_as_path.path_length() == 0;
    if (selection.always_compare_med
        || internal
        || a_as_path.first() == b_as_path.first())
        && let Some(result) = tie_break(
            a.attrs.base.med.unwrap_or(0),
            b.attrs.base.med.unwrap_or(0),
            BestPathReason::Med,
        )
    {
        return result;
    }

    // Prefer eBGP paths.
    if let Some(result) = tie_break(
        a.is_ibgp(),
        b.is_ibgp(),
        BestPathReason::ExternalOverInternal,
    ) {
        return result;
    }

    // RFC 5004: when both paths are external, prefer the oldest one to
    // reduce route flaps.
    if !a.is_ibgp()
        && !b.is_ibgp()
        && !selection.external_compare_router_id
        && let Some(result) =
            tie_break(a.timestamp, b.timestamp, BestPathReason::Older)
    {
        return result;
    }

    // Compare router IDs.
    if let Some(result) =
        tie_break(router_id(a), router_id(b), BestPathReason::RouterId)
    {
        return result;
    }

    // Compare CLUSTER_LIST lengths.
    let a_len = a.attrs.base.cluster_list.as_ref().map_or(0, |cl| cl.len());
    let b_len = b.attrs.base.cluster_list.as_ref().map_or(0, |cl| cl.len());
    if let Some(result) = tie_break(a_len, b_len, BestPathReason::ClusterList)
    {
        return result;
    }

    // Compare peer addresses.
    if let Some(result) = tie_break(
        a.source.address,
        b.source.address,
        BestPathReason::PeerAddress,
    ) {
        return result;
    }

    // Compare path identifiers.
    if let Some(result) =
        tie_break(a.path_id, b.path_id, BestPathReason::PathId)
    {
        return result;
    }

    (Ordering::Equal, BestPathReason::Equal)
}

// ===== unit tests =====
