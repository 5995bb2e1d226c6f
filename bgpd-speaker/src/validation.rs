//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::packet::consts::AsPathSegmentType;
use crate::path::Path;

// Route Origin Authorization.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct Roa {
    pub asn: u32,
    pub prefix: IpNetwork,
    pub max_len: u8,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationStatus {
    Valid,
    Invalid,
    NotFound,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationReason {
    None,
    As,
    Length,
}

// Result of the origin validation of a path (RFC 6811).
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Validation {
    pub status: ValidationStatus,
    pub reason: ValidationReason,
    pub matched: Vec<Roa>,
    pub unmatched_as: Vec<Roa>,
    pub unmatched_length: Vec<Roa>,
}

// Changes to the set of known ROAs, as learned by an RPKI cache client.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub enum RoaEvent {
    Add(Roa),
    Delete(Roa),
    Reset,
}

// Origin validation collaborator.
//
// Lookups are synchronous and must not block.
pub trait Validator: std::fmt::Debug + Send {
    // Returns `None` when origin validation isn't enabled or doesn't apply to
    // the given path.
    fn validate(&self, path: &Path) -> Option<Validation>;

    // Applies a ROA change, returning whether anything changed.
    fn apply(&mut self, event: RoaEvent) -> bool;
}

// In-memory ROA table.
#[derive(Debug, Default)]
pub struct RoaTable {
    local_as: u32,
    roas: BTreeSet<Roa>,
}

// ===== impl RoaTable =====

impl RoaTable {
    pub fn new(local_as: u32) -> RoaTable {
        RoaTable {
            local_as,
            roas: Default::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.roas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Roa> + '_ {
        self.roas.iter()
    }

    fn validate_prefix(
        &self,
        prefix: IpNetwork,
        origin_as: Option<u32>,
    ) -> Validation {
        let mut validation = Validation {
            status: ValidationStatus::NotFound,
            reason: ValidationReason::None,
            matched: vec![],
            unmatched_as: vec![],
            unmatched_length: vec![],
        };

        for roa in self.roas.iter().filter(|roa| covers(&roa.prefix, &prefix)) {
            if prefix.prefix() > roa.max_len {
                validation.unmatched_length.push(*roa);
            } else if roa.asn != 0 && Some(roa.asn) == origin_as {
                validation.matched.push(*roa);
            } else {
                validation.unmatched_as.push(*roa);
            }
        }

        if !validation.matched.is_empty() {
            validation.status = ValidationStatus::Valid;
        } else if !validation.unmatched_as.is_empty() {
            validation.status = ValidationStatus::Invalid;
            validation.reason = ValidationReason::As;
        } else if !validation.unmatched_length.is_empty() {
            validation.status = ValidationStatus::Invalid;
            validation.reason = ValidationReason::Length;
        }
        validation
    }
}

impl Validator for RoaTable {
    fn validate(&self, path: &Path) -> Option<Validation> {
        if self.roas.is_empty() || path.is_withdraw() {
            return None;
        }
        if path.family().is_vpn() {
            return None;
        }
        let prefix = path.nlri.prefix()?;

        // The origin AS is the last member of the rightmost AS_SEQUENCE. An
        // empty path was originated in the local AS. A path ending in an
        // AS_SET has no origin AS and can't be valid.
        let as_path = &path.attrs.base.as_path;
        let origin_as = match as_path.segments.back() {
            None => Some(self.local_as),
            Some(segment) => match segment.seg_type {
                AsPathSegmentType::Sequence => Some(
                    segment.members.back().copied().unwrap_or(self.local_as),
                ),
                AsPathSegmentType::ConfedSequence
                | AsPathSegmentType::ConfedSet => Some(self.local_as),
                AsPathSegmentType::Set => None,
            },
        };

        Some(self.validate_prefix(prefix, origin_as))
    }

    fn apply(&mut self, event: RoaEvent) -> bool {
        match event {
            RoaEvent::Add(roa) => self.roas.insert(roa),
            RoaEvent::Delete(roa) => self.roas.remove(&roa),
            RoaEvent::Reset => {
                let changed = !self.roas.is_empty();
                self.roas.clear();
                changed
            }
        }
    }
}

// ===== helper functions =====

fn covers(roa: &IpNetwork, prefix: &IpNetwork) -> bool {
    match (roa, prefix) {
        (IpNetwork::V4(roa), IpNetwork::V4(prefix)) => {
            roa.prefix() <= prefix.prefix() && roa.contains(prefix.network())
        }
        (IpNetwork::V6(roa), IpNetwork::V6(prefix)) => {
            roa.prefix() <= prefix.prefix() && roa.contains(prefix.network())
        }
        _ => false,
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    fn roa(asn: u32, prefix: &str, max_len: u8) -> Roa {
        Roa {
            asn,
            prefix: prefix.parse().unwrap(),
            max_len,
        }
    }

    #[test]
    fn origin_validation() {
        let mut table = RoaTable::new(65000);
        assert!(table.apply(RoaEvent::Add(roa(65001, "10.0.0.0/16", 24))));
        assert!(!table.apply(RoaEvent::Add(roa(65001, "10.0.0.0/16", 24))));

        let prefix = "10.0.1.0/24".parse().unwrap();
        let v = table.validate_prefix(prefix, Some(65001));
        assert_eq!(v.status, ValidationStatus::Valid);
        assert_eq!(v.matched.len(), 1);

        let v = table.validate_prefix(prefix, Some(65002));
        assert_eq!(v.status, ValidationStatus::Invalid);
        assert_eq!(v.reason, ValidationReason::As);

        let prefix = "10.0.1.0/25".parse().unwrap();
        let v = table.validate_prefix(prefix, Some(65001));
        assert_eq!(v.status, ValidationStatus::Invalid);
        assert_eq!(v.reason, ValidationReason::Length);

        let prefix = "192.0.2.0/24".parse().unwrap();
        let v = table.validate_prefix(prefix, Some(65001));
        assert_eq!(v.status, ValidationStatus::NotFound);

        assert!(table.apply(RoaEvent::Reset));
        assert!(table.is_empty());
    }

    #[test]
    fn as0_roa_never_matches() {
        let mut table = RoaTable::new(65000);
        table.apply(RoaEvent::Add(roa(0, "10.0.0.0/8", 32)));
        let prefix = "10.1.0.0/16".parse().unwrap();
        let v = table.validate_prefix(prefix, Some(0));
        assert_eq!(v.status, ValidationStatus::Invalid);
    }
}
