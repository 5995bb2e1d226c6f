//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};

use bytes::Bytes;
use derive_new::new;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::packet::consts::{
    AsPathSegmentType, AttrFlags, Origin, WellKnownCommunities,
};

// BGP path attributes.
//
// Each attribute type appears at most once: the struct shape itself enforces
// per-type uniqueness.
#[skip_serializing_none]
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Attrs {
    pub base: BaseAttrs,
    pub comm: Option<Comms>,
    pub ext_comm: Option<ExtComms>,
    pub large_comm: Option<LargeComms>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown: Vec<UnknownAttr>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct BaseAttrs {
    pub origin: Origin,
    pub as_path: AsPath,
    pub nexthop: Option<IpAddr>,
    pub med: Option<u32>,
    pub local_pref: Option<u32>,
    pub aggregator: Option<Aggregator>,
    #[serde(default)]
    pub atomic_aggregate: bool,
    pub originator_id: Option<Ipv4Addr>,
    pub cluster_list: Option<ClusterList>,
}

#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct AsPath {
    pub segments: VecDeque<AsPathSegment>,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct AsPathSegment {
    pub seg_type: AsPathSegmentType,
    pub members: VecDeque<u32>,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Aggregator {
    pub asn: u32,
    pub identifier: Ipv4Addr,
}

// CLUSTER_LIST, most recently prepended cluster first.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct ClusterList(pub Vec<Ipv4Addr>);

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct Comm(pub u32);

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct ExtComm(pub [u8; 8]);

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct LargeComm(pub [u8; 12]);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct CommList<T: Ord>(pub BTreeSet<T>);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[derive(new)]
#[derive(Deserialize, Serialize)]
pub struct UnknownAttr {
    pub attr_type: u8,
    pub flags: u8,
    pub value: Bytes,
}

// Useful type definitions.
pub type Comms = CommList<Comm>;
pub type ExtComms = CommList<ExtComm>;
pub type LargeComms = CommList<LargeComm>;

// ===== impl Attrs =====

impl Attrs {
    pub fn new(base: BaseAttrs) -> Attrs {
        Attrs {
            base,
            comm: None,
            ext_comm: None,
            large_comm: None,
            unknown: Vec::new(),
        }
    }

    // Returns whether the standard community list contains `value`.
    pub fn has_comm(&self, value: u32) -> bool {
        self.comm
            .as_ref()
            .is_some_and(|comm| comm.0.contains(&Comm(value)))
    }

    pub fn add_comm(&mut self, value: u32) {
        self.comm.get_or_insert_with(Default::default).0.insert(Comm(value));
    }

    pub fn remove_comm(&mut self, value: u32) {
        if let Some(comm) = &mut self.comm {
            comm.0.remove(&Comm(value));
            if comm.0.is_empty() {
                self.comm = None;
            }
        }
    }

    // Returns an iterator over the Route Target extended communities.
    pub fn route_targets(&self) -> impl Iterator<Item = &ExtComm> + '_ {
        self.ext_comm
            .iter()
            .flat_map(|ext_comm| ext_comm.0.iter())
            .filter(|ext_comm| ext_comm.is_route_target())
    }
}

impl Default for Attrs {
    fn default() -> Attrs {
        Attrs::new(BaseAttrs::default())
    }
}

impl Default for BaseAttrs {
    fn default() -> BaseAttrs {
        BaseAttrs {
            origin: Origin::Igp,
            as_path: Default::default(),
            nexthop: None,
            med: None,
            local_pref: None,
            aggregator: None,
            atomic_aggregate: false,
            originator_id: None,
            cluster_list: None,
        }
    }
}

// ===== impl AsPath =====

impl AsPath {
    pub fn from_sequence(members: impl IntoIterator<Item = u32>) -> AsPath {
        let members: VecDeque<_> = members.into_iter().collect();
        let mut segments = VecDeque::new();
        if !members.is_empty() {
            segments.push_back(AsPathSegment {
                seg_type: AsPathSegmentType::Sequence,
                members,
            });
        }
        AsPath { segments }
    }

    pub fn path_length(&self) -> u32 {
        self.segments
            .iter()
            .map(|segment| match segment.seg_type {
                AsPathSegmentType::Set => 1,
                AsPathSegmentType::Sequence => segment.members.len(),
                // RFC 5065 - Section 5.3:
                // "When comparing routes using AS_PATH length, CONFED_SEQUENCE
                // and CONFED_SETs SHOULD NOT be counted".
                AsPathSegmentType::ConfedSequence
                | AsPathSegmentType::ConfedSet => 0,
            })
            .sum::<usize>() as u32
    }

    pub fn first(&self) -> Option<u32> {
        self.segments
            .front()
            .filter(|segment| segment.seg_type == AsPathSegmentType::Sequence)
            .and_then(|segment| segment.members.front().copied())
    }

    // Origin AS: the last member of the last AS_SEQUENCE.
    pub fn origin(&self) -> Option<u32> {
        self.segments
            .back()
            .filter(|segment| segment.seg_type == AsPathSegmentType::Sequence)
            .and_then(|segment| segment.members.back().copied())
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.segments
            .iter()
            .flat_map(|segment| segment.members.iter().copied())
    }

    pub fn prepend(&mut self, asn: u32) {
        if let Some(segment) = self.segments.front_mut()
            && segment.seg_type == AsPathSegmentType::Sequence
            && segment.members.len() < 255
        {
            segment.members.push_front(asn);
        } else {
            self.segments.push_front(AsPathSegment {
                seg_type: AsPathSegmentType::Sequence,
                members: [asn].into(),
            });
        }
    }

    pub fn replace(&mut self, from: u32, to: u32) {
        for segment in self.segments.iter_mut() {
            for member in segment.members.iter_mut() {
                if *member == from {
                    *member = to;
                }
            }
        }
    }

    pub fn contains(&self, asn: u32) -> bool {
        self.segments.iter().any(|segment| segment.contains(asn))
    }

    // Number of occurrences of `asn`, used by the allow-own-as check.
    pub fn count(&self, asn: u32) -> usize {
        self.iter().filter(|member| *member == asn).count()
    }
}

impl std::fmt::Display for AsPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for segment in &self.segments {
            if !first {
                write!(f, " ")?;
            }
            first = false;

            let members = segment
                .members
                .iter()
                .map(|asn| asn.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            match segment.seg_type {
                AsPathSegmentType::Sequence => write!(f, "{members}")?,
                AsPathSegmentType::Set => write!(f, "{{{members}}}")?,
                AsPathSegmentType::ConfedSequence => write!(f, "({members})")?,
                AsPathSegmentType::ConfedSet => write!(f, "[{members}]")?,
            }
        }
        Ok(())
    }
}

// ===== impl AsPathSegment =====

impl AsPathSegment {
    fn contains(&self, asn: u32) -> bool {
        self.members.iter().any(|member| asn == *member)
    }
}

// ===== impl UnknownAttr =====

impl UnknownAttr {
    pub fn is_transitive(&self) -> bool {
        AttrFlags::from_bits_truncate(self.flags)
            .contains(AttrFlags::TRANSITIVE)
    }
}

// ===== impl ClusterList =====

impl ClusterList {
    pub fn contains(&self, cluster_id: &Ipv4Addr) -> bool {
        self.0.contains(cluster_id)
    }

    pub fn prepend(&mut self, cluster_id: Ipv4Addr) {
        self.0.insert(0, cluster_id);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ===== impl Comm =====

impl std::fmt::Display for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match WellKnownCommunities::from_u32(self.0) {
            Some(WellKnownCommunities::LlgrStale) => write!(f, "llgr-stale"),
            Some(WellKnownCommunities::NoLlgr) => write!(f, "no-llgr"),
            Some(WellKnownCommunities::NoExport) => write!(f, "no-export"),
            Some(WellKnownCommunities::NoAdvertise) => {
                write!(f, "no-advertise")
            }
            Some(WellKnownCommunities::NoExportSubconfed) => {
                write!(f, "no-export-subconfed")
            }
            None => write!(f, "{}:{}", self.0 >> 16, self.0 & 0xFFFF),
        }
    }
}

// ===== impl ExtComm =====

impl ExtComm {
    // Extended community sub-type of Route Targets (RFC 4360).
    const SUBTYPE_ROUTE_TARGET: u8 = 0x02;

    // Builds a two-octet-AS specific Route Target.
    pub fn route_target_as2(asn: u16, value: u32) -> ExtComm {
        let mut bytes = [0; 8];
        bytes[0] = 0x00;
        bytes[1] = Self::SUBTYPE_ROUTE_TARGET;
        bytes[2..4].copy_from_slice(&asn.to_be_bytes());
        bytes[4..8].copy_from_slice(&value.to_be_bytes());
        ExtComm(bytes)
    }

    // Builds an IPv4-address specific Route Target.
    pub fn route_target_ipv4(addr: Ipv4Addr, value: u16) -> ExtComm {
        let mut bytes = [0; 8];
        bytes[0] = 0x01;
        bytes[1] = Self::SUBTYPE_ROUTE_TARGET;
        bytes[2..6].copy_from_slice(&addr.octets());
        bytes[6..8].copy_from_slice(&value.to_be_bytes());
        ExtComm(bytes)
    }

    // Builds a four-octet-AS specific Route Target.
    pub fn route_target_as4(asn: u32, value: u16) -> ExtComm {
        let mut bytes = [0; 8];
        bytes[0] = 0x02;
        bytes[1] = Self::SUBTYPE_ROUTE_TARGET;
        bytes[2..6].copy_from_slice(&asn.to_be_bytes());
        bytes[6..8].copy_from_slice(&value.to_be_bytes());
        ExtComm(bytes)
    }

    pub fn is_route_target(&self) -> bool {
        // Only the transitive variants are considered.
        self.0[0] <= 0x02 && self.0[1] == Self::SUBTYPE_ROUTE_TARGET
    }
}

impl std::fmt::Display for ExtComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = &self.0;
        if self.is_route_target() {
            match b[0] {
                0x00 => {
                    let asn = u16::from_be_bytes([b[2], b[3]]);
                    let value = u32::from_be_bytes([b[4], b[5], b[6], b[7]]);
                    return write!(f, "rt:{asn}:{value}");
                }
                0x01 => {
                    let addr = Ipv4Addr::new(b[2], b[3], b[4], b[5]);
                    let value = u16::from_be_bytes([b[6], b[7]]);
                    return write!(f, "rt:{addr}:{value}");
                }
                _ => {
                    let asn = u32::from_be_bytes([b[2], b[3], b[4], b[5]]);
                    let value = u16::from_be_bytes([b[6], b[7]]);
                    return write!(f, "rt:{asn}:{value}");
                }
            }
        }
        write!(
            f,
            "raw:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

// ===== impl CommList =====

impl<T: Ord> Default for CommList<T> {
    fn default() -> CommList<T> {
        CommList(BTreeSet::new())
    }
}

// ===== impl LargeComm =====

impl LargeComm {
    pub fn new(global: u32, local1: u32, local2: u32) -> LargeComm {
        let mut bytes = [0; 12];
        bytes[0..4].copy_from_slice(&global.to_be_bytes());
        bytes[4..8].copy_from_slice(&local1.to_be_bytes());
        bytes[8..12].copy_from_slice(&local2.to_be_bytes());
        LargeComm(bytes)
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_path_prepend_and_length() {
        let mut as_path = AsPath::from_sequence([65001, 65002]);
        as_path.prepend(65000);
        assert_eq!(as_path.path_length(), 3);
        assert_eq!(as_path.first(), Some(65000));
        assert_eq!(as_path.origin(), Some(65002));
        assert_eq!(as_path.to_string(), "65000 65001 65002");

        as_path.segments.push_back(AsPathSegment {
            seg_type: AsPathSegmentType::Set,
            members: [1, 2, 3].into(),
        });
        assert_eq!(as_path.path_length(), 4);
        assert_eq!(as_path.origin(), None);
    }

    #[test]
    fn as_path_replace_and_count() {
        let mut as_path = AsPath::from_sequence([65001, 65000, 65001]);
        assert_eq!(as_path.count(65001), 2);
        as_path.replace(65001, 65100);
        assert!(!as_path.contains(65001));
        assert_eq!(as_path.count(65100), 2);
    }

    #[test]
    fn route_target_ext_comm() {
        let rt = ExtComm::route_target_as2(65000, 100);
        assert!(rt.is_route_target());
        assert_eq!(rt.to_string(), "rt:65000:100");

        let rt = ExtComm::route_target_ipv4(Ipv4Addr::new(192, 0, 2, 1), 7);
        assert_eq!(rt.to_string(), "rt:192.0.2.1:7");

        let mut attrs = Attrs::new(BaseAttrs::default());
        attrs.ext_comm = Some(CommList([rt].into()));
        assert_eq!(attrs.route_targets().count(), 1);
    }

    #[test]
    fn well_known_comms() {
        let mut attrs = Attrs::new(BaseAttrs::default());
        attrs.add_comm(WellKnownCommunities::LlgrStale as u32);
        assert!(attrs.has_comm(0xFFFF0006));
        assert_eq!(Comm(0xFFFF0006).to_string(), "llgr-stale");
        attrs.remove_comm(WellKnownCommunities::LlgrStale as u32);
        assert!(attrs.comm.is_none());
    }
}
