//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::str::FromStr;

use bgpd_utils::ip::AddressFamily;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::packet::consts::{Afi, Safi};

// Address families supported by the speaker.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteFamily {
    Ipv4Unicast,
    Ipv6Unicast,
    #[serde(rename = "l3vpn-ipv4-unicast")]
    Ipv4Vpn,
    #[serde(rename = "l3vpn-ipv6-unicast")]
    Ipv6Vpn,
    #[serde(rename = "rtc")]
    RouteTargetConstraint,
}

// Per-family ADD-PATH mode (RFC 7911).
bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct AddPathMode: u8 {
        const RECEIVE = 0x01;
        const SEND = 0x02;
    }
}

// ===== impl RouteFamily =====

impl RouteFamily {
    pub const ALL: [RouteFamily; 5] = [
        RouteFamily::Ipv4Unicast,
        RouteFamily::Ipv6Unicast,
        RouteFamily::Ipv4Vpn,
        RouteFamily::Ipv6Vpn,
        RouteFamily::RouteTargetConstraint,
    ];

    pub const fn afi(&self) -> Afi {
        match self {
            RouteFamily::Ipv4Unicast
            | RouteFamily::Ipv4Vpn
            | RouteFamily::RouteTargetConstraint => AddressFamily::Ipv4,
            RouteFamily::Ipv6Unicast | RouteFamily::Ipv6Vpn => {
                AddressFamily::Ipv6
            }
        }
    }

    pub const fn safi(&self) -> Safi {
        match self {
            RouteFamily::Ipv4Unicast | RouteFamily::Ipv6Unicast => {
                Safi::Unicast
            }
            RouteFamily::Ipv4Vpn | RouteFamily::Ipv6Vpn => Safi::LabeledVpn,
            RouteFamily::RouteTargetConstraint => Safi::RouteTarget,
        }
    }

    pub fn from_afi_safi(afi: Afi, safi: Safi) -> Option<RouteFamily> {
        let family = match (afi, safi) {
            (AddressFamily::Ipv4, Safi::Unicast) => RouteFamily::Ipv4Unicast,
            (AddressFamily::Ipv6, Safi::Unicast) => RouteFamily::Ipv6Unicast,
            (AddressFamily::Ipv4, Safi::LabeledVpn) => RouteFamily::Ipv4Vpn,
            (AddressFamily::Ipv6, Safi::LabeledVpn) => RouteFamily::Ipv6Vpn,
            (AddressFamily::Ipv4, Safi::RouteTarget) => {
                RouteFamily::RouteTargetConstraint
            }
            _ => return None,
        };
        Some(family)
    }

    // Returns whether this is one of the L3VPN families.
    pub const fn is_vpn(&self) -> bool {
        matches!(self, RouteFamily::Ipv4Vpn | RouteFamily::Ipv6Vpn)
    }

    // Returns the unicast family that VPN routes of this family are imported
    // into (VRF-attached peers only speak unicast).
    pub const fn to_unicast(&self) -> RouteFamily {
        match self {
            RouteFamily::Ipv4Vpn => RouteFamily::Ipv4Unicast,
            RouteFamily::Ipv6Vpn => RouteFamily::Ipv6Unicast,
            _ => *self,
        }
    }

    // Returns the VPN family that unicast routes of this family are exported
    // into when leaving a VRF.
    pub const fn to_vpn(&self) -> RouteFamily {
        match self {
            RouteFamily::Ipv4Unicast => RouteFamily::Ipv4Vpn,
            RouteFamily::Ipv6Unicast => RouteFamily::Ipv6Vpn,
            _ => *self,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            RouteFamily::Ipv4Unicast => "ipv4-unicast",
            RouteFamily::Ipv6Unicast => "ipv6-unicast",
            RouteFamily::Ipv4Vpn => "l3vpn-ipv4-unicast",
            RouteFamily::Ipv6Vpn => "l3vpn-ipv6-unicast",
            RouteFamily::RouteTargetConstraint => "rtc",
        }
    }
}

impl std::fmt::Display for RouteFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RouteFamily {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RouteFamily::ALL
            .into_iter()
            .find(|family| family.as_str() == s)
            .ok_or(())
    }
}

// ===== impl AddPathMode =====

impl AddPathMode {
    // Negotiates the ADD-PATH mode of one family given the local and the
    // remote advertised modes.
    pub fn negotiate(local: AddPathMode, remote: AddPathMode) -> AddPathMode {
        let mut mode = AddPathMode::empty();
        if local.contains(AddPathMode::SEND)
            && remote.contains(AddPathMode::RECEIVE)
        {
            mode.insert(AddPathMode::SEND);
        }
        if local.contains(AddPathMode::RECEIVE)
            && remote.contains(AddPathMode::SEND)
        {
            mode.insert(AddPathMode::RECEIVE);
        }
        mode
    }
}

// ===== unit tests =====
