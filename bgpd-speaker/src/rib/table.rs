//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::af::RouteFamily;
use crate::packet::nlri::{Nlri, RouteDistinguisher};
use crate::path::Path;
use crate::rib::destination::{Destination, Update};
use crate::rib::{SelectionCfg, TableId};

// Routing table of one address family.
#[derive(Debug)]
pub struct Table {
    pub family: RouteFamily,
    pub destinations: BTreeMap<Nlri, Destination>,
}

// Table counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct TableInfo {
    pub destinations: usize,
    pub paths: usize,
    pub accepted: usize,
}

// ===== impl Table =====

impl Table {
    pub fn new(family: RouteFamily) -> Table {
        Table {
            family,
            destinations: Default::default(),
        }
    }

    // Processes a path, removing its destination once it's left empty.
    pub fn update(&mut self, path: Path, selection: &SelectionCfg) -> Update {
        let nlri = path.nlri;
        let dest = self
            .destinations
            .entry(nlri)
            .or_insert_with(|| Destination::new(nlri));
        let update = dest.calculate(path, selection);
        if dest.known_paths.is_empty() {
            self.destinations.remove(&nlri);
        }
        update
    }

    pub fn destination(&self, nlri: &Nlri) -> Option<&Destination> {
        self.destinations.get(nlri)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Destination> + '_ {
        self.destinations.values()
    }

    pub fn best_paths(
        &self,
        table_id: TableId,
        asn: u32,
    ) -> impl Iterator<Item = &Path> + '_ {
        self.destinations
            .values()
            .filter_map(move |dest| dest.best_path(table_id, asn))
    }

    pub fn known_paths(
        &self,
        table_id: TableId,
        asn: u32,
    ) -> impl Iterator<Item = Path> + '_ {
        self.destinations
            .values()
            .flat_map(move |dest| dest.known_path_list(table_id, asn))
    }

    // Locally originated VPN paths using the given route distinguisher.
    pub fn vrf_paths(
        &self,
        rd: RouteDistinguisher,
    ) -> impl Iterator<Item = &Path> + '_ {
        self.destinations
            .values()
            .flat_map(|dest| dest.known_paths.iter())
            .filter(move |path| path.is_local() && path.nlri.rd() == Some(rd))
    }

    pub fn info(&self, table_id: TableId, asn: u32) -> TableInfo {
        let mut info = TableInfo::default();
        for dest in self.destinations.values() {
            let paths = dest.known_path_list(table_id, asn);
            if paths.is_empty() {
                continue;
            }
            info.destinations += 1;
            info.paths += paths.len();
            if dest.best_path(table_id, asn).is_some() {
                info.accepted += 1;
            }
        }
        info
    }
}
