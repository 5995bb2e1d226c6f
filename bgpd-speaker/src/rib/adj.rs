//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};

use crate::af::RouteFamily;
use crate::packet::attribute::ExtComm;
use crate::packet::consts::WellKnownCommunities;
use crate::packet::nlri::Nlri;
use crate::path::Path;
use crate::rib::table::TableInfo;

// Paths received from a single neighbor (Adj-RIB-In).
//
// Paths are keyed by NLRI and path identifier. Paths marked as AS-looped are
// kept (they count as received) but are not accepted.
#[derive(Debug, Default)]
pub struct AdjRib {
    tables: BTreeMap<RouteFamily, BTreeMap<(Nlri, u32), Path>>,
    accepted: BTreeMap<RouteFamily, usize>,
}

// ===== impl AdjRib =====

impl AdjRib {
    pub fn new(families: impl IntoIterator<Item = RouteFamily>) -> AdjRib {
        AdjRib {
            tables: families
                .into_iter()
                .map(|family| (family, Default::default()))
                .collect(),
            accepted: Default::default(),
        }
    }

    // Stores the latest path of each (NLRI, path identifier) key.
    //
    // Returns the paths as stored: a re-advertisement that doesn't change
    // anything keeps the timestamp of the original path.
    pub fn update(&mut self, paths: Vec<Path>) -> Vec<Path> {
        let mut stored = Vec::with_capacity(paths.len());
        for mut path in paths {
            let family = path.family();
            let Some(table) = self.tables.get_mut(&family) else {
                continue;
            };
            let accepted = self.accepted.entry(family).or_default();
            let key = (path.nlri, path.path_id);

            if path.is_withdraw() {
                if let Some(old) = table.remove(&key)
                    && !old.is_as_looped()
                {
                    *accepted = accepted.saturating_sub(1);
                }
            } else {
                match table.get(&key) {
                    Some(old) => {
                        match (old.is_as_looped(), path.is_as_looped()) {
                            (true, false) => *accepted += 1,
                            (false, true) => {
                                *accepted = accepted.saturating_sub(1)
                            }
                            _ => (),
                        }
                        if old.is_same(&path) && old.flags == path.flags {
                            path.timestamp = old.timestamp;
                        }
                    }
                    None => {
                        if !path.is_as_looped() {
                            *accepted += 1;
                        }
                    }
                }
                table.insert(key, path.clone());
            }
            stored.push(path);
        }
        stored
    }

    pub fn path_list(
        &self,
        families: &[RouteFamily],
        accepted_only: bool,
    ) -> Vec<Path> {
        self.walk(families)
            .filter(|path| !accepted_only || !path.is_as_looped())
            .cloned()
            .collect()
    }

    // Route targets of the accepted membership paths (RFC 4684). `None` is
    // the default membership.
    pub fn rtc_memberships(&self) -> Vec<Option<ExtComm>> {
        self.walk(&[RouteFamily::RouteTargetConstraint])
            .filter(|path| !path.is_as_looped())
            .filter_map(|path| match path.nlri {
                Nlri::RouteTarget { route_target, .. } => Some(route_target),
                _ => None,
            })
            .collect()
    }

    // Iterates over the paths of the given families.
    pub fn walk<'a>(
        &'a self,
        families: &'a [RouteFamily],
    ) -> impl Iterator<Item = &'a Path> + 'a {
        families
            .iter()
            .filter_map(|family| self.tables.get(family))
            .flat_map(|table| table.values())
    }

    // Number of received paths.
    pub fn count(&self, families: &[RouteFamily]) -> usize {
        families
            .iter()
            .filter_map(|family| self.tables.get(family))
            .map(|table| table.len())
            .sum()
    }

    // Number of accepted (not AS-looped) paths.
    pub fn accepted(&self, families: &[RouteFamily]) -> usize {
        families
            .iter()
            .filter_map(|family| self.accepted.get(family))
            .sum()
    }

    // Marks all paths of the given families as stale (graceful restart).
    pub fn stale_all(&mut self, families: &[RouteFamily]) -> Vec<Path> {
        let mut stale = vec![];
        for family in families {
            let Some(table) = self.tables.get_mut(family) else {
                continue;
            };
            for path in table.values_mut() {
                *path = path.with_stale_marker();
                stale.push(path.clone());
            }
        }
        stale
    }

    // Long-lived graceful restart: paths carrying NO_LLGR are removed, the
    // others are tagged with LLGR_STALE.
    pub fn mark_llgr_stale_or_drop(
        &mut self,
        families: &[RouteFamily],
    ) -> Vec<Path> {
        let mut paths = vec![];
        for family in families {
            let Some(table) = self.tables.get_mut(family) else {
                continue;
            };
            let accepted = self.accepted.entry(*family).or_default();
            table.retain(|_, path| {
                if path.attrs.has_comm(WellKnownCommunities::NoLlgr as u32) {
                    if !path.is_as_looped() {
                        *accepted = accepted.saturating_sub(1);
                    }
                    paths.push(path.as_withdrawal());
                    false
                } else {
                    *path = path.with_llgr_stale();
                    paths.push(path.clone());
                    true
                }
            });
        }
        paths
    }

    // Removes the paths that are still stale, returning their withdrawals.
    pub fn drop_stale(&mut self, families: &[RouteFamily]) -> Vec<Path> {
        let mut withdrawals = vec![];
        for family in families {
            let Some(table) = self.tables.get_mut(family) else {
                continue;
            };
            let accepted = self.accepted.entry(*family).or_default();
            table.retain(|_, path| {
                if !path.is_stale() {
                    return true;
                }
                if !path.is_as_looped() {
                    *accepted = accepted.saturating_sub(1);
                }
                withdrawals.push(path.as_withdrawal());
                false
            });
        }
        withdrawals
    }

    // Removes all paths of the given families, returning their withdrawals.
    pub fn drop(&mut self, families: &[RouteFamily]) -> Vec<Path> {
        let mut withdrawals = vec![];
        for family in families {
            let Some(table) = self.tables.get_mut(family) else {
                continue;
            };
            withdrawals.extend(
                std::mem::take(table)
                    .into_values()
                    .map(|path| path.as_withdrawal()),
            );
            self.accepted.remove(family);
        }
        withdrawals
    }

    pub fn table_info(&self, family: RouteFamily) -> TableInfo {
        let Some(table) = self.tables.get(&family) else {
            return TableInfo::default();
        };
        let destinations = table
            .keys()
            .map(|(nlri, _)| nlri)
            .collect::<BTreeSet<_>>()
            .len();
        TableInfo {
            destinations,
            paths: table.len(),
            accepted: self.accepted.get(&family).copied().unwrap_or(0),
        }
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use itertools::Itertools;

    use super::*;
    use crate::packet::attribute::Attrs;
    use crate::path::PeerInfo;

    fn path(prefix: &str, path_id: u32, med: u32) -> Path {
        let source = Arc::new(PeerInfo {
            asn: 65001,
            local_as: 65000,
            id: "1.1.1.1".parse().unwrap(),
            local_id: "9.9.9.9".parse().unwrap(),
            address: Some("192.0.2.1".parse().unwrap()),
            local_address: None,
            route_reflector_client: false,
            route_reflector_cluster_id: "9.9.9.9".parse().unwrap(),
        });
        let mut attrs = Attrs::default();
        attrs.base.med = Some(med);
        Path::new(
            source,
            Nlri::Ipv4Unicast(prefix.parse().unwrap()),
            path_id,
            Arc::new(attrs),
            false,
        )
    }

    const V4: [RouteFamily; 1] = [RouteFamily::Ipv4Unicast];

    #[test]
    fn last_write_wins() {
        let mut adj = AdjRib::new(V4);
        adj.update(vec![
            path("10.0.0.0/24", 0, 1),
            path("10.0.0.0/24", 0, 2),
            path("10.0.0.0/24", 1, 3),
            path("10.0.1.0/24", 0, 4),
        ]);
        adj.update(vec![path("10.0.0.0/24", 0, 5)]);

        let meds = adj
            .path_list(&V4, false)
            .iter()
            .map(|path| path.attrs.base.med.unwrap())
            .sorted()
            .collect_vec();
        assert_eq!(meds, [3, 4, 5]);
        assert_eq!(adj.count(&V4), 3);
        assert_eq!(adj.accepted(&V4), 3);
        assert_eq!(adj.table_info(RouteFamily::Ipv4Unicast).destinations, 2);

        adj.update(vec![path("10.0.0.0/24", 1, 0).as_withdrawal()]);
        assert_eq!(adj.count(&V4), 2);
        assert_eq!(adj.accepted(&V4), 2);
    }

    #[test]
    fn as_looped_not_accepted() {
        let mut adj = AdjRib::new(V4);
        adj.update(vec![
            path("10.0.0.0/24", 0, 1).with_as_looped(true),
            path("10.0.1.0/24", 0, 1),
        ]);
        assert_eq!(adj.count(&V4), 2);
        assert_eq!(adj.accepted(&V4), 1);
        assert_eq!(adj.path_list(&V4, true).len(), 1);

        adj.update(vec![path("10.0.0.0/24", 0, 1)]);
        assert_eq!(adj.accepted(&V4), 2);
    }

    #[test]
    fn looped_memberships_ignored() {
        let membership = |route_target: Option<ExtComm>| {
            let mut path = path("10.0.0.0/24", 0, 0);
            path.nlri = Nlri::RouteTarget {
                origin_as: 65001,
                route_target,
            };
            path
        };
        let rt = ExtComm([0x00, 0x02, 0xfd, 0xe9, 0, 0, 0, 100]);
        let mut adj = AdjRib::new([RouteFamily::RouteTargetConstraint]);
        adj.update(vec![
            membership(Some(rt)),
            membership(None).with_as_looped(true),
        ]);
        assert_eq!(adj.rtc_memberships(), [Some(rt)]);
    }

    #[test]
    fn graceful_restart() {
        let mut adj = AdjRib::new(V4);
        adj.update(vec![
            path("10.0.0.0/24", 0, 1),
            path("10.0.1.0/24", 0, 1),
        ]);

        let stale = adj.stale_all(&V4);
        assert_eq!(stale.len(), 2);
        assert!(stale.iter().all(|path| path.is_stale()));

        // Refreshed path is no longer stale.
        adj.update(vec![path("10.0.0.0/24", 0, 1)]);
        let withdrawals = adj.drop_stale(&V4);
        assert_eq!(withdrawals.len(), 1);
        assert!(withdrawals[0].is_withdraw());
        assert_eq!(adj.count(&V4), 1);

        let withdrawals = adj.drop(&V4);
        assert_eq!(withdrawals.len(), 1);
        assert_eq!(adj.count(&V4), 0);
        assert_eq!(adj.accepted(&V4), 0);
    }

    #[test]
    fn llgr_stale_or_drop() {
        let mut adj = AdjRib::new(V4);
        let mut no_llgr = path("10.0.1.0/24", 0, 1);
        no_llgr = no_llgr.with_attrs({
            let mut attrs = (*no_llgr.attrs).clone();
            attrs.add_comm(WellKnownCommunities::NoLlgr as u32);
            attrs
        });
        adj.update(vec![path("10.0.0.0/24", 0, 1), no_llgr]);

        let paths = adj.mark_llgr_stale_or_drop(&V4);
        assert_eq!(paths.len(), 2);
        assert_eq!(paths.iter().filter(|path| path.is_withdraw()).count(), 1);
        assert_eq!(adj.count(&V4), 1);
        assert!(adj.path_list(&V4, false)[0].is_llgr_stale());
    }
}
