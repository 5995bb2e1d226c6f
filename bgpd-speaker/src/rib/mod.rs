//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod adj;
pub mod destination;
pub mod table;
pub mod vrf;

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::af::RouteFamily;
use crate::error::Error;
use crate::packet::attribute::{Attrs, BaseAttrs, ExtComm};
use crate::packet::consts::Origin;
use crate::packet::nlri::Nlri;
use crate::path::{Path, PeerInfo};
use crate::rib::destination::{Destination, Update};
use crate::rib::table::{Table, TableInfo};
use crate::rib::vrf::Vrf;

// Default values.
pub const DFLT_LOCAL_PREF: u32 = 100;

// Identifies the view of the RIB a peer is served from.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum TableId {
    Global,
    RouteServerClient(IpAddr),
}

// Best-path selection knobs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelectionCfg {
    pub always_compare_med: bool,
    pub ignore_as_path_length: bool,
    pub external_compare_router_id: bool,
}

// Set of per-family routing tables and VRFs.
#[derive(Debug)]
pub struct TableManager {
    pub tables: BTreeMap<RouteFamily, Table>,
    pub vrfs: BTreeMap<String, Vrf>,
    pub selection: SelectionCfg,
}

// ===== impl TableId =====

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableId::Global => write!(f, "global"),
            TableId::RouteServerClient(addr) => write!(f, "{addr}"),
        }
    }
}

// ===== impl TableManager =====

impl TableManager {
    pub fn new(
        families: impl IntoIterator<Item = RouteFamily>,
        selection: SelectionCfg,
    ) -> TableManager {
        TableManager {
            tables: families
                .into_iter()
                .map(|family| (family, Table::new(family)))
                .collect(),
            vrfs: Default::default(),
            selection,
        }
    }

    pub fn families(&self) -> impl Iterator<Item = RouteFamily> + '_ {
        self.tables.keys().copied()
    }

    // Processes a path, returning the resulting destination changes. Paths of
    // families without a table are ignored.
    pub fn update(&mut self, path: Path) -> Vec<Update> {
        let Some(table) = self.tables.get_mut(&path.family()) else {
            return vec![];
        };
        vec![table.update(path, &self.selection)]
    }

    pub fn best_path_list(
        &self,
        table_id: TableId,
        asn: u32,
        families: &[RouteFamily],
    ) -> Vec<Path> {
        self.tables_of(families)
            .flat_map(|table| table.best_paths(table_id, asn))
            .cloned()
            .collect()
    }

    pub fn path_list(
        &self,
        table_id: TableId,
        asn: u32,
        families: &[RouteFamily],
    ) -> Vec<Path> {
        self.tables_of(families)
            .flat_map(|table| table.known_paths(table_id, asn))
            .collect()
    }

    // Paths learned from the given neighbor.
    pub fn path_list_by_peer(
        &self,
        addr: IpAddr,
        families: &[RouteFamily],
    ) -> Vec<Path> {
        self.tables_of(families)
            .flat_map(|table| table.iter())
            .flat_map(|dest| dest.known_paths.iter())
            .filter(|path| path.source.address == Some(addr))
            .cloned()
            .collect()
    }

    pub fn path_list_with_source(
        &self,
        table_id: TableId,
        families: &[RouteFamily],
        source: &PeerInfo,
    ) -> Vec<Path> {
        self.tables_of(families)
            .flat_map(|table| table.known_paths(table_id, 0))
            .filter(|path| *path.source == *source)
            .collect()
    }

    pub fn path_list_with_nexthop(
        &self,
        families: &[RouteFamily],
        nexthop: IpAddr,
    ) -> Vec<Path> {
        self.tables_of(families)
            .flat_map(|table| table.iter())
            .flat_map(|dest| dest.known_paths.iter())
            .filter(|path| path.nexthop() == Some(nexthop))
            .cloned()
            .collect()
    }

    pub fn destination(
        &self,
        family: RouteFamily,
        nlri: &Nlri,
    ) -> Option<&Destination> {
        self.tables
            .get(&family)
            .and_then(|table| table.destination(nlri))
    }

    // Adds a VRF, returning the route target membership paths of its import
    // route targets.
    pub fn add_vrf(
        &mut self,
        vrf: Vrf,
        source: &Arc<PeerInfo>,
    ) -> Result<Vec<Path>, Error> {
        if self.vrfs.contains_key(&vrf.name) {
            return Err(Error::VrfExists(vrf.name));
        }
        if self.vrfs.values().any(|other| other.rd == vrf.rd) {
            return Err(Error::VrfRdInUse(vrf.rd));
        }

        debug!(name = %vrf.name, rd = %vrf.rd, "add VRF");
        let paths = vrf
            .import_rt
            .iter()
            .map(|rt| rtc_membership(source, Some(*rt)))
            .collect();
        self.vrfs.insert(vrf.name.clone(), vrf);
        Ok(paths)
    }

    // Deletes a VRF, returning withdrawals for its locally originated paths
    // and for the route target memberships no other VRF needs.
    pub fn delete_vrf(
        &mut self,
        name: &str,
        source: &Arc<PeerInfo>,
    ) -> Result<Vec<Path>, Error> {
        let Some(vrf) = self.vrfs.remove(name) else {
            return Err(Error::VrfNotFound(name.to_owned()));
        };

        debug!(%name, rd = %vrf.rd, "delete VRF");
        let mut paths = self
            .tables
            .values()
            .flat_map(|table| table.vrf_paths(vrf.rd))
            .map(|path| path.as_withdrawal())
            .collect::<Vec<_>>();
        paths.extend(
            vrf.import_rt
                .iter()
                .filter(|rt| {
                    !self
                        .vrfs
                        .values()
                        .any(|other| other.import_rt.contains(rt))
                })
                .map(|rt| rtc_membership(source, Some(*rt)).as_withdrawal()),
        );
        Ok(paths)
    }

    pub fn table_info(
        &self,
        table_id: TableId,
        asn: u32,
        family: RouteFamily,
    ) -> Result<TableInfo, Error> {
        let table = self
            .tables
            .get(&family)
            .ok_or(Error::FamilyNotConfigured(family))?;
        Ok(table.info(table_id, asn))
    }

    fn tables_of<'a>(
        &'a self,
        families: &'a [RouteFamily],
    ) -> impl Iterator<Item = &'a Table> + 'a {
        families
            .iter()
            .filter_map(|family| self.tables.get(family))
    }
}

// ===== helper functions =====

// Route target membership path (RFC 4684) originated for a VRF import route
// target.
fn rtc_membership(
    source: &Arc<PeerInfo>,
    route_target: Option<ExtComm>,
) -> Path {
    let nlri = Nlri::RouteTarget {
        origin_as: source.asn,
        route_target,
    };
    let attrs = Attrs::new(BaseAttrs {
        origin: Origin::Igp,
        nexthop: Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        ..Default::default()
    });
    Path::new(source.clone(), nlri, 0, Arc::new(attrs), false)
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::nlri::RouteDistinguisher;

    fn vrf(name: &str, value: u32) -> Vrf {
        let rt = ExtComm::route_target_as2(65000, value);
        Vrf {
            name: name.to_owned(),
            id: value,
            rd: RouteDistinguisher::as2(65000, value),
            import_rt: [rt, ExtComm::route_target_as2(65000, 1)].into(),
            export_rt: [rt].into(),
        }
    }

    #[test]
    fn vrf_membership_paths() {
        let source =
            Arc::new(PeerInfo::local(65000, "1.1.1.1".parse().unwrap()));
        let mut rib = TableManager::new(RouteFamily::ALL, Default::default());

        let paths = rib.add_vrf(vrf("red", 10), &source).unwrap();
        assert_eq!(paths.len(), 2);
        for path in paths {
            rib.update(path);
        }
        let paths = rib.add_vrf(vrf("blue", 20), &source).unwrap();
        for path in paths {
            rib.update(path);
        }
        assert!(matches!(
            rib.add_vrf(vrf("red", 30), &source),
            Err(Error::VrfExists(_))
        ));
        assert!(matches!(
            rib.add_vrf(vrf("green", 10), &source),
            Err(Error::VrfRdInUse(_))
        ));

        // A locally originated VRF path.
        let prefix = "10.0.0.0/24".parse::<ipnetwork::IpNetwork>().unwrap();
        let path = Path::new(
            source.clone(),
            Nlri::from(prefix),
            0,
            Arc::new(Attrs::default()),
            false,
        );
        let path = path.to_global(&rib.vrfs["red"]);
        rib.update(path);
        assert_eq!(
            rib.path_list(TableId::Global, 0, &[RouteFamily::Ipv4Vpn]).len(),
            1
        );

        // The shared route target is still needed by the other VRF.
        let paths = rib.delete_vrf("red", &source).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|path| path.is_withdraw()));
        assert_eq!(
            paths
                .iter()
                .filter(|path| path.family() == RouteFamily::Ipv4Vpn)
                .count(),
            1
        );
        assert!(rib.delete_vrf("red", &source).is_err());
    }

    #[test]
    fn paths_by_peer() {
        let local =
            Arc::new(PeerInfo::local(65000, "1.1.1.1".parse().unwrap()));
        let mut peer = (*local).clone();
        peer.address = Some("192.0.2.1".parse().unwrap());
        peer.asn = 65001;
        let peer = Arc::new(peer);

        let mut rib = TableManager::new(
            [RouteFamily::Ipv4Unicast],
            Default::default(),
        );
        for (source, prefix) in [
            (&local, "10.0.0.0/24"),
            (&peer, "10.0.1.0/24"),
            (&peer, "10.0.2.0/24"),
        ] {
            let prefix = prefix.parse::<ipnetwork::IpNetwork>().unwrap();
            let path = Path::new(
                source.clone(),
                Nlri::from(prefix),
                0,
                Arc::new(Attrs::default()),
                false,
            );
            assert_eq!(rib.update(path).len(), 1);
        }

        let families = [RouteFamily::Ipv4Unicast];
        let addr = "192.0.2.1".parse().unwrap();
        assert_eq!(rib.path_list_by_peer(addr, &families).len(), 2);
        assert_eq!(
            rib.path_list_with_source(TableId::Global, &families, &local)
                .len(),
            1
        );
        assert_eq!(rib.best_path_list(TableId::Global, 0, &families).len(), 3);
        let info = rib
            .table_info(TableId::Global, 0, RouteFamily::Ipv4Unicast)
            .unwrap();
        assert_eq!(info.destinations, 3);
        assert!(rib
            .table_info(TableId::Global, 0, RouteFamily::Ipv6Unicast)
            .is_err());

        // Unconfigured families are ignored.
        let prefix = "2001:db8::/32".parse::<ipnetwork::IpNetwork>().unwrap();
        let path = Path::new(
            local.clone(),
            Nlri::from(prefix),
            0,
            Arc::new(Attrs::default()),
            false,
        );
        assert!(rib.update(path).is_empty());
    }
}
