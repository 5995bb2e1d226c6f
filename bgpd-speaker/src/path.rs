//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::af::RouteFamily;
use crate::packet::attribute::Attrs;
use crate::packet::consts::WellKnownCommunities;
use crate::packet::message::{
    MpReachNlri, MpUnreachNlri, NlriEntry, UpdateMsg,
};
use crate::packet::nlri::Nlri;
use crate::rib::vrf::Vrf;
use crate::validation::Validation;

// Identity of the speaker a path was learned from.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PeerInfo {
    pub asn: u32,
    pub local_as: u32,
    pub id: Ipv4Addr,
    pub local_id: Ipv4Addr,
    // Unset for locally originated paths.
    pub address: Option<IpAddr>,
    pub local_address: Option<IpAddr>,
    pub route_reflector_client: bool,
    pub route_reflector_cluster_id: Ipv4Addr,
}

// A route: one NLRI and its attributes as learned from one source.
//
// Paths are values. Every transformation returns a new path, and the
// attributes are shared between the copies until one of them modifies them.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct Path {
    pub nlri: Nlri,
    // Path identifier received from the source (ADD-PATH).
    pub path_id: u32,
    // Path identifier assigned locally for ADD-PATH advertisement.
    pub local_path_id: u32,
    pub source: Arc<PeerInfo>,
    pub attrs: Arc<Attrs>,
    pub timestamp: DateTime<Utc>,
    pub flags: PathFlags,
    pub validation: Option<Arc<Validation>>,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct PathFlags: u16 {
        const WITHDRAW = 0x0001;
        const STALE = 0x0002;
        const FROM_EXTERNAL = 0x0004;
        const AS_LOOPED = 0x0008;
        const NEXTHOP_INVALID = 0x0010;
        const NO_IMPLICIT_WITHDRAW = 0x0020;
    }
}

// ===== impl PeerInfo =====

impl PeerInfo {
    // Source of locally originated paths.
    pub fn local(asn: u32, id: Ipv4Addr) -> PeerInfo {
        PeerInfo {
            asn,
            local_as: asn,
            id,
            local_id: id,
            address: None,
            local_address: None,
            route_reflector_client: false,
            route_reflector_cluster_id: id,
        }
    }

    pub fn is_ibgp(&self) -> bool {
        self.asn == self.local_as
    }
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            Some(addr) => write!(f, "{} (AS{})", addr, self.asn),
            None => write!(f, "local"),
        }
    }
}

// ===== impl Path =====

impl Path {
    pub fn new(
        source: Arc<PeerInfo>,
        nlri: Nlri,
        path_id: u32,
        attrs: Arc<Attrs>,
        withdraw: bool,
    ) -> Path {
        let mut flags = PathFlags::empty();
        flags.set(PathFlags::WITHDRAW, withdraw);
        Path {
            nlri,
            path_id,
            local_path_id: 0,
            source,
            attrs,
            timestamp: Utc::now(),
            flags,
            validation: None,
        }
    }

    // Builds the paths carried by an UPDATE message.
    pub fn from_update(source: &Arc<PeerInfo>, msg: &UpdateMsg) -> Vec<Path> {
        let mut paths = vec![];

        if let Some(unreach) = &msg.unreach {
            let attrs = Arc::new(Attrs::default());
            for entry in &unreach.prefixes {
                paths.push(Path::new(
                    source.clone(),
                    entry.nlri,
                    entry.path_id,
                    attrs.clone(),
                    true,
                ));
            }
        }

        if let Some(reach) = &msg.reach
            && let Some(attrs) = &msg.attrs
        {
            let attrs = Arc::new(attrs.clone());
            for entry in &reach.prefixes {
                paths.push(Path::new(
                    source.clone(),
                    entry.nlri,
                    entry.path_id,
                    attrs.clone(),
                    false,
                ));
            }
        }

        paths
    }

    pub fn family(&self) -> RouteFamily {
        self.nlri.family()
    }

    pub fn is_withdraw(&self) -> bool {
        self.flags.contains(PathFlags::WITHDRAW)
    }

    pub fn is_stale(&self) -> bool {
        self.flags.contains(PathFlags::STALE)
    }

    pub fn is_from_external(&self) -> bool {
        self.flags.contains(PathFlags::FROM_EXTERNAL)
    }

    pub fn is_as_looped(&self) -> bool {
        self.flags.contains(PathFlags::AS_LOOPED)
    }

    pub fn is_nexthop_invalid(&self) -> bool {
        self.flags.contains(PathFlags::NEXTHOP_INVALID)
    }

    pub fn no_implicit_withdraw(&self) -> bool {
        self.flags.contains(PathFlags::NO_IMPLICIT_WITHDRAW)
    }

    pub fn is_local(&self) -> bool {
        self.source.address.is_none()
    }

    pub fn is_ibgp(&self) -> bool {
        self.source.is_ibgp()
    }

    pub fn is_llgr_stale(&self) -> bool {
        self.attrs.has_comm(WellKnownCommunities::LlgrStale as u32)
    }

    pub fn nexthop(&self) -> Option<IpAddr> {
        self.attrs.base.nexthop
    }

    // Source address and path identifier: the key under which a source can
    // have at most one path per destination.
    pub fn source_key(&self) -> (Option<IpAddr>, u32) {
        (self.source.address, self.path_id)
    }

    // Returns whether both paths describe the same advertisement: same
    // source, NLRI, path identifier and attributes.
    pub fn is_same(&self, other: &Path) -> bool {
        self.source == other.source
            && self.nlri == other.nlri
            && self.path_id == other.path_id
            && (Arc::ptr_eq(&self.attrs, &other.attrs)
                || self.attrs == other.attrs)
    }

    pub fn as_withdrawal(&self) -> Path {
        let mut path = self.clone();
        path.flags.insert(PathFlags::WITHDRAW);
        path
    }

    pub fn with_stale_marker(&self) -> Path {
        let mut path = self.clone();
        path.flags.insert(PathFlags::STALE);
        path
    }

    // Tags the path with the LLGR_STALE community (RFC 9494).
    pub fn with_llgr_stale(&self) -> Path {
        let mut path = self.with_stale_marker();
        Arc::make_mut(&mut path.attrs)
            .add_comm(WellKnownCommunities::LlgrStale as u32);
        path
    }

    pub fn with_as_looped(&self, looped: bool) -> Path {
        let mut path = self.clone();
        path.flags.set(PathFlags::AS_LOOPED, looped);
        path
    }

    pub fn with_flags(&self, flags: PathFlags) -> Path {
        let mut path = self.clone();
        path.flags.insert(flags);
        path
    }

    pub fn with_attrs(&self, attrs: Attrs) -> Path {
        let mut path = self.clone();
        path.attrs = Arc::new(attrs);
        path
    }

    pub fn with_nexthop(&self, nexthop: IpAddr) -> Path {
        let mut path = self.clone();
        Arc::make_mut(&mut path.attrs).base.nexthop = Some(nexthop);
        path
    }

    pub fn with_validation(&self, validation: Option<Validation>) -> Path {
        let mut path = self.clone();
        path.validation = validation.map(Arc::new);
        path
    }

    // Replaces every occurrence of `peer_as` in the AS path with `local_as`.
    pub fn replace_as(&self, local_as: u32, peer_as: u32) -> Path {
        if !self.attrs.base.as_path.contains(peer_as) {
            return self.clone();
        }
        let mut path = self.clone();
        Arc::make_mut(&mut path.attrs)
            .base
            .as_path
            .replace(peer_as, local_as);
        path
    }

    pub fn without_local_pref(&self) -> Path {
        if self.attrs.base.local_pref.is_none() {
            return self.clone();
        }
        let mut path = self.clone();
        Arc::make_mut(&mut path.attrs).base.local_pref = None;
        path
    }

    // Converts a VPN path into the unicast form seen by VRF-attached peers.
    // Route targets are stripped with the route distinguisher.
    pub fn to_local(&self) -> Path {
        if !self.family().is_vpn() {
            return self.clone();
        }
        let mut path = self.clone();
        path.nlri = self.nlri.to_unicast();
        Arc::make_mut(&mut path.attrs).ext_comm = None;
        path
    }

    // Converts a VRF unicast path into its VPN form, using the VRF's route
    // distinguisher and export route targets.
    pub fn to_global(&self, vrf: &Vrf) -> Path {
        if self.family().is_vpn()
            || self.family() == RouteFamily::RouteTargetConstraint
        {
            return self.clone();
        }
        let mut path = self.clone();
        path.nlri = self.nlri.to_vpn(vrf.rd);
        if !vrf.export_rt.is_empty() {
            let attrs = Arc::make_mut(&mut path.attrs);
            let ext_comm = attrs.ext_comm.get_or_insert_with(Default::default);
            ext_comm.0.extend(vrf.export_rt.iter().copied());
        }
        path
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} from {}", self.nlri, self.source)?;
        if self.path_id != 0 {
            write!(f, " id {}", self.path_id)?;
        }
        if self.is_withdraw() {
            write!(f, " (withdraw)")?;
        }
        Ok(())
    }
}

// ===== global functions =====

// Packs outgoing paths into UPDATE messages.
//
// Withdrawals are grouped per family; advertisements are grouped per family
// and attribute set. End-of-RIB markers are appended last.
pub fn updates_from_paths(
    paths: &[Path],
    eor: &[RouteFamily],
) -> Vec<UpdateMsg> {
    let mut withdrawals: Vec<(RouteFamily, Vec<NlriEntry>)> = vec![];
    let mut reachable: Vec<(RouteFamily, Arc<Attrs>, Vec<NlriEntry>)> = vec![];

    for path in paths {
        let family = path.family();
        let entry = NlriEntry {
            path_id: path.local_path_id,
            nlri: path.nlri,
        };
        if path.is_withdraw() {
            match withdrawals.iter_mut().find(|(f, _)| *f == family) {
                Some((_, entries)) => entries.push(entry),
                None => withdrawals.push((family, vec![entry])),
            }
        } else {
            match reachable.iter_mut().find(|(f, attrs, _)| {
                *f == family
                    && (Arc::ptr_eq(attrs, &path.attrs)
                        || **attrs == *path.attrs)
            }) {
                Some((_, _, entries)) => entries.push(entry),
                None => {
                    reachable.push((family, path.attrs.clone(), vec![entry]))
                }
            }
        }
    }

    let withdrawals =
        withdrawals.into_iter().map(|(family, prefixes)| UpdateMsg {
            reach: None,
            unreach: Some(MpUnreachNlri { family, prefixes }),
            attrs: None,
        });
    let reachable =
        reachable
            .into_iter()
            .map(|(family, attrs, prefixes)| UpdateMsg {
                reach: Some(MpReachNlri { family, prefixes }),
                unreach: None,
                attrs: Some((*attrs).clone()),
            });
    let eor = eor.iter().map(|family| UpdateMsg::end_of_rib(*family));

    withdrawals.chain(reachable).chain(eor).collect()
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::attribute::AsPath;

    fn peer(addr: &str, asn: u32) -> Arc<PeerInfo> {
        Arc::new(PeerInfo {
            asn,
            local_as: 65000,
            id: Ipv4Addr::new(1, 1, 1, 1),
            local_id: Ipv4Addr::new(9, 9, 9, 9),
            address: Some(addr.parse().unwrap()),
            local_address: None,
            route_reflector_client: false,
            route_reflector_cluster_id: Ipv4Addr::new(9, 9, 9, 9),
        })
    }

    fn path(prefix: &str, attrs: &Arc<Attrs>) -> Path {
        Path::new(
            peer("192.0.2.1", 65001),
            Nlri::from(prefix.parse::<ipnetwork::IpNetwork>().unwrap()),
            0,
            attrs.clone(),
            false,
        )
    }

    #[test]
    fn transforms_dont_alias() {
        let mut attrs = Attrs::default();
        attrs.base.local_pref = Some(200);
        attrs.base.as_path = AsPath::from_sequence([65001, 65002]);
        let attrs = Arc::new(attrs);
        let orig = path("10.0.0.0/24", &attrs);

        let stripped = orig.without_local_pref();
        assert_eq!(stripped.attrs.base.local_pref, None);
        assert_eq!(orig.attrs.base.local_pref, Some(200));

        let replaced = orig.replace_as(65000, 65002);
        assert_eq!(replaced.attrs.base.as_path.to_string(), "65001 65000");
        assert!(orig.attrs.base.as_path.contains(65002));

        let withdrawal = orig.as_withdrawal();
        assert!(withdrawal.is_withdraw());
        assert!(!orig.is_withdraw());
        assert!(withdrawal.is_same(&orig));

        let llgr = orig.with_llgr_stale();
        assert!(llgr.is_llgr_stale() && llgr.is_stale());
        assert!(!orig.is_llgr_stale());
        assert!(!llgr.is_same(&orig));
    }

    #[test]
    fn updates_grouped_by_attrs() {
        let attrs1 = Arc::new(Attrs::default());
        let mut attrs2 = Attrs::default();
        attrs2.base.med = Some(10);
        let attrs2 = Arc::new(attrs2);

        let paths = [
            path("10.0.0.0/24", &attrs1),
            path("10.0.1.0/24", &attrs1),
            path("10.0.2.0/24", &attrs2),
            path("10.0.3.0/24", &attrs1).as_withdrawal(),
        ];
        let updates = updates_from_paths(&paths, &[RouteFamily::Ipv4Unicast]);
        assert_eq!(updates.len(), 4);
        assert_eq!(updates[0].withdrawn_count(), 1);
        assert_eq!(updates[1].reach.as_ref().unwrap().prefixes.len(), 2);
        assert_eq!(updates[2].reach.as_ref().unwrap().prefixes.len(), 1);
        assert_eq!(updates[3].eor_family(), Some(RouteFamily::Ipv4Unicast));

        // Round trip back into paths.
        let source = peer("192.0.2.1", 65001);
        let paths = updates[..3]
            .iter()
            .flat_map(|msg| Path::from_update(&source, msg))
            .collect::<Vec<_>>();
        assert_eq!(paths.len(), 4);
        assert_eq!(paths.iter().filter(|p| p.is_withdraw()).count(), 1);
    }
}
