//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::packet::attribute::ExtComm;
use crate::packet::nlri::RouteDistinguisher;
use crate::path::Path;

// Virtual routing and forwarding instance (RFC 4364).
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Vrf {
    pub name: String,
    // Routing table identifier, used by the kernel synchronization client.
    pub id: u32,
    pub rd: RouteDistinguisher,
    pub import_rt: BTreeSet<ExtComm>,
    pub export_rt: BTreeSet<ExtComm>,
}

// ===== impl Vrf =====

impl Vrf {
    // Returns whether the path carries any of the VRF's import route targets.
    pub fn can_import(&self, path: &Path) -> bool {
        path.attrs
            .route_targets()
            .any(|rt| self.import_rt.contains(rt))
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::packet::attribute::{Attrs, CommList};
    use crate::packet::nlri::Nlri;
    use crate::path::PeerInfo;

    #[test]
    fn import_by_route_target() {
        let vrf = Vrf {
            name: "red".to_owned(),
            id: 10,
            rd: RouteDistinguisher::as2(65000, 10),
            import_rt: [ExtComm::route_target_as2(65000, 10)].into(),
            export_rt: [ExtComm::route_target_as2(65000, 10)].into(),
        };

        let mut attrs = Attrs::default();
        attrs.ext_comm =
            Some(CommList([ExtComm::route_target_as2(65000, 20)].into()));
        let source =
            Arc::new(PeerInfo::local(65000, "1.1.1.1".parse().unwrap()));
        let prefix = "10.0.0.0/24".parse::<ipnetwork::IpNetwork>().unwrap();
        let nlri = Nlri::from(prefix).to_vpn(vrf.rd);
        let path = Path::new(source, nlri, 0, Arc::new(attrs.clone()), false);
        assert!(!vrf.can_import(&path));

        attrs
            .ext_comm
            .as_mut()
            .unwrap()
            .0
            .insert(ExtComm::route_target_as2(65000, 10));
        let path = path.with_attrs(attrs);
        assert!(vrf.can_import(&path));
    }
}
