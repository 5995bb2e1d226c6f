//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};

use crate::af::RouteFamily;
use crate::packet::attribute::ExtComm;

// Network Layer Reachability Information.
//
// The VPN label stack is carried by the wire codec and isn't part of the
// destination key.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum Nlri {
    Ipv4Unicast(Ipv4Network),
    Ipv6Unicast(Ipv6Network),
    Ipv4Vpn {
        rd: RouteDistinguisher,
        prefix: Ipv4Network,
    },
    Ipv6Vpn {
        rd: RouteDistinguisher,
        prefix: Ipv6Network,
    },
    // Route Target membership (RFC 4684). A missing route target is the
    // default membership, matching every route target.
    RouteTarget {
        origin_as: u32,
        route_target: Option<ExtComm>,
    },
}

// Route Distinguisher (RFC 4364).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct RouteDistinguisher(pub [u8; 8]);

// ===== impl Nlri =====

impl Nlri {
    pub fn family(&self) -> RouteFamily {
        match self {
            Nlri::Ipv4Unicast(_) => RouteFamily::Ipv4Unicast,
            Nlri::Ipv6Unicast(_) => RouteFamily::Ipv6Unicast,
            Nlri::Ipv4Vpn { .. } => RouteFamily::Ipv4Vpn,
            Nlri::Ipv6Vpn { .. } => RouteFamily::Ipv6Vpn,
            Nlri::RouteTarget { .. } => RouteFamily::RouteTargetConstraint,
        }
    }

    // Returns the IP prefix of unicast and VPN NLRIs.
    pub fn prefix(&self) -> Option<IpNetwork> {
        match self {
            Nlri::Ipv4Unicast(prefix) | Nlri::Ipv4Vpn { prefix, .. } => {
                Some(IpNetwork::V4(*prefix))
            }
            Nlri::Ipv6Unicast(prefix) | Nlri::Ipv6Vpn { prefix, .. } => {
                Some(IpNetwork::V6(*prefix))
            }
            Nlri::RouteTarget { .. } => None,
        }
    }

    pub fn rd(&self) -> Option<RouteDistinguisher> {
        match self {
            Nlri::Ipv4Vpn { rd, .. } | Nlri::Ipv6Vpn { rd, .. } => Some(*rd),
            _ => None,
        }
    }

    // Strips the route distinguisher of a VPN NLRI.
    pub fn to_unicast(&self) -> Nlri {
        match self {
            Nlri::Ipv4Vpn { prefix, .. } => Nlri::Ipv4Unicast(*prefix),
            Nlri::Ipv6Vpn { prefix, .. } => Nlri::Ipv6Unicast(*prefix),
            _ => *self,
        }
    }

    // Converts a unicast NLRI into its VPN form using the given route
    // distinguisher.
    pub fn to_vpn(&self, rd: RouteDistinguisher) -> Nlri {
        match self {
            Nlri::Ipv4Unicast(prefix) => Nlri::Ipv4Vpn {
                rd,
                prefix: *prefix,
            },
            Nlri::Ipv6Unicast(prefix) => Nlri::Ipv6Vpn {
                rd,
                prefix: *prefix,
            },
            _ => *self,
        }
    }
}

impl From<IpNetwork> for Nlri {
    fn from(prefix: IpNetwork) -> Nlri {
        match prefix {
            IpNetwork::V4(prefix) => Nlri::Ipv4Unicast(prefix),
            IpNetwork::V6(prefix) => Nlri::Ipv6Unicast(prefix),
        }
    }
}

impl std::fmt::Display for Nlri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Nlri::Ipv4Unicast(prefix) => write!(f, "{prefix}"),
            Nlri::Ipv6Unicast(prefix) => write!(f, "{prefix}"),
            Nlri::Ipv4Vpn { rd, prefix } => write!(f, "{rd}:{prefix}"),
            Nlri::Ipv6Vpn { rd, prefix } => write!(f, "{rd}:{prefix}"),
            Nlri::RouteTarget {
                origin_as,
                route_target: Some(rt),
            } => write!(f, "{origin_as}:{rt}"),
            Nlri::RouteTarget {
                route_target: None,
                ..
            } => write!(f, "default"),
        }
    }
}

// ===== impl RouteDistinguisher =====

impl RouteDistinguisher {
    // Type 0: two-octet AS administrator.
    pub fn as2(asn: u16, value: u32) -> RouteDistinguisher {
        let mut bytes = [0; 8];
        bytes[2..4].copy_from_slice(&asn.to_be_bytes());
        bytes[4..8].copy_from_slice(&value.to_be_bytes());
        RouteDistinguisher(bytes)
    }

    // Type 1: IPv4 address administrator.
    pub fn ipv4(addr: Ipv4Addr, value: u16) -> RouteDistinguisher {
        let mut bytes = [0; 8];
        bytes[1] = 1;
        bytes[2..6].copy_from_slice(&addr.octets());
        bytes[6..8].copy_from_slice(&value.to_be_bytes());
        RouteDistinguisher(bytes)
    }

    // Type 2: four-octet AS administrator.
    pub fn as4(asn: u32, value: u16) -> RouteDistinguisher {
        let mut bytes = [0; 8];
        bytes[1] = 2;
        bytes[2..6].copy_from_slice(&asn.to_be_bytes());
        bytes[6..8].copy_from_slice(&value.to_be_bytes());
        RouteDistinguisher(bytes)
    }
}

impl std::fmt::Display for RouteDistinguisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = &self.0;
        match u16::from_be_bytes([b[0], b[1]]) {
            0 => write!(
                f,
                "{}:{}",
                u16::from_be_bytes([b[2], b[3]]),
                u32::from_be_bytes([b[4], b[5], b[6], b[7]])
            ),
            1 => write!(
                f,
                "{}:{}",
                Ipv4Addr::new(b[2], b[3], b[4], b[5]),
                u16::from_be_bytes([b[6], b[7]])
            ),
            _ => write!(
                f,
                "{}:{}",
                u32::from_be_bytes([b[2], b[3], b[4], b[5]]),
                u16::from_be_bytes([b[6], b[7]])
            ),
        }
    }
}

impl FromStr for RouteDistinguisher {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (admin, value) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid route distinguisher: {s}"))?;
        let invalid = || format!("invalid route distinguisher: {s}");

        if let Ok(addr) = admin.parse::<Ipv4Addr>() {
            let value = value.parse::<u16>().map_err(|_| invalid())?;
            return Ok(RouteDistinguisher::ipv4(addr, value));
        }
        let asn = admin.parse::<u32>().map_err(|_| invalid())?;
        match u16::try_from(asn) {
            Ok(asn) => {
                let value = value.parse::<u32>().map_err(|_| invalid())?;
                Ok(RouteDistinguisher::as2(asn, value))
            }
            Err(_) => {
                let value = value.parse::<u16>().map_err(|_| invalid())?;
                Ok(RouteDistinguisher::as4(asn, value))
            }
        }
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rd_parse_and_display() {
        for s in ["65000:100", "192.0.2.1:5", "4200000000:7"] {
            let rd = s.parse::<RouteDistinguisher>().unwrap();
            assert_eq!(rd.to_string(), s);
        }
        assert!("65000".parse::<RouteDistinguisher>().is_err());
    }

    #[test]
    fn vpn_conversion() {
        let rd = RouteDistinguisher::as2(65000, 1);
        let nlri = Nlri::Ipv4Unicast("10.0.0.0/24".parse().unwrap());
        let vpn = nlri.to_vpn(rd);
        assert_eq!(vpn.family(), RouteFamily::Ipv4Vpn);
        assert_eq!(vpn.rd(), Some(rd));
        assert_eq!(vpn.to_unicast(), nlri);
        assert_eq!(vpn.to_string(), "65000:1:10.0.0.0/24");
    }
}
