//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::af::{AddPathMode, RouteFamily};
use crate::error::Error;
use crate::packet::attribute::ExtComm;
use crate::packet::consts::BGP_PORT;
use crate::packet::nlri::RouteDistinguisher;
use crate::policy::PolicyAssignment;
use crate::rib::SelectionCfg;
use crate::rib::vrf::Vrf;

// Global BGP settings.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GlobalConfig {
    pub asn: u32,
    pub router_id: Ipv4Addr,
    // Port to accept sessions on (0 disables the listeners).
    pub listen_port: u16,
    pub listen_addresses: Vec<IpAddr>,
    pub families: Vec<RouteFamily>,
    pub route_selection: SelectionCfg,
    pub use_multiple_paths: bool,
    pub graceful_restart: GracefulRestartConfig,
    pub apply_policy: PolicyAssignment,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NeighborConfig {
    pub address: IpAddr,
    // Expected peer AS (0 accepts any AS).
    pub peer_as: u32,
    // Local AS used for the session (0 uses the global AS).
    pub local_as: u32,
    pub peer_group: Option<String>,
    pub description: String,
    pub admin_down: bool,
    pub auth_password: Option<String>,
    pub vrf: Option<String>,
    pub next_hop_self: bool,
    pub timers: TimersConfig,
    pub transport: TransportConfig,
    pub ebgp_multihop: EbgpMultihopConfig,
    pub ttl_security: TtlSecurityConfig,
    pub route_reflector: RouteReflectorConfig,
    pub route_server: RouteServerConfig,
    pub as_path_options: AsPathOptions,
    pub graceful_restart: GracefulRestartConfig,
    pub afi_safis: Vec<AfiSafiConfig>,
    // Policies of the neighbor's own RIB view (route server clients).
    pub apply_policy: PolicyAssignment,
}

// Settings shared by the members of a peer group.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeerGroupConfig {
    pub name: String,
    pub peer_as: u32,
    pub local_as: u32,
    pub auth_password: Option<String>,
    pub next_hop_self: bool,
    pub timers: TimersConfig,
    pub transport: TransportConfig,
    pub ebgp_multihop: EbgpMultihopConfig,
    pub ttl_security: TtlSecurityConfig,
    pub route_reflector: RouteReflectorConfig,
    pub route_server: RouteServerConfig,
    pub as_path_options: AsPathOptions,
    pub graceful_restart: GracefulRestartConfig,
    pub afi_safis: Vec<AfiSafiConfig>,
    pub apply_policy: PolicyAssignment,
}

// Range of addresses accepted as passive members of a peer group.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DynamicNeighborConfig {
    pub prefix: IpNetwork,
    pub peer_group: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AfiSafiConfig {
    pub family: RouteFamily,
    pub enabled: bool,
    pub prefix_limit: PrefixLimitConfig,
    pub add_path_receive: bool,
    pub add_path_send: bool,
    pub mp_graceful_restart: bool,
    pub long_lived_graceful_restart: bool,
    // LLGR stale time advertised for the family, in seconds.
    pub llgr_restart_time: u32,
    // Route target constraint deferral, in seconds.
    pub rtc_deferral_time: u16,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimersConfig {
    pub connect_retry: u16,
    pub hold_time: u16,
    pub keepalive_interval: u16,
    pub idle_hold_time_after_reset: u16,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub local_address: Option<IpAddr>,
    pub remote_port: u16,
    pub passive_mode: bool,
    pub ttl: Option<u8>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EbgpMultihopConfig {
    pub enabled: bool,
    pub multihop_ttl: u8,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TtlSecurityConfig {
    pub enabled: bool,
    pub ttl_min: u8,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouteReflectorConfig {
    pub client: bool,
    pub cluster_id: Option<Ipv4Addr>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouteServerConfig {
    pub client: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AsPathOptions {
    // Number of occurrences of the local AS tolerated in received paths.
    pub allow_own_as: u8,
    pub replace_peer_as: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GracefulRestartConfig {
    pub enabled: bool,
    pub restart_time: u16,
    pub helper_only: bool,
    // Selection deferral time, in seconds.
    pub deferral_time: u16,
    pub notification_enabled: bool,
    pub long_lived_enabled: bool,
    // Set while the speaker itself is restarting.
    pub local_restarting: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrefixLimitConfig {
    // Maximum number of accepted prefixes (0 disables the limit).
    pub max_prefixes: u32,
    // Percentage of the maximum that triggers a warning.
    pub warning_threshold_pct: u8,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VrfConfig {
    pub name: String,
    #[serde(default)]
    pub id: u32,
    pub rd: RouteDistinguisher,
    #[serde(default)]
    pub import_rt: BTreeSet<ExtComm>,
    #[serde(default)]
    pub export_rt: BTreeSet<ExtComm>,
}

// ===== impl GlobalConfig =====

impl GlobalConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.asn == 0 {
            return Err(Error::InvalidConfig("missing local AS".to_owned()));
        }
        if self.router_id.is_unspecified() {
            return Err(Error::InvalidConfig("missing router-id".to_owned()));
        }
        Ok(())
    }
}

impl Default for GlobalConfig {
    fn default() -> GlobalConfig {
        GlobalConfig {
            asn: 0,
            router_id: Ipv4Addr::UNSPECIFIED,
            listen_port: BGP_PORT,
            listen_addresses: vec![
                IpAddr::from([0, 0, 0, 0]),
                IpAddr::from([0u16; 8]),
            ],
            families: vec![RouteFamily::Ipv4Unicast, RouteFamily::Ipv6Unicast],
            route_selection: Default::default(),
            use_multiple_paths: false,
            graceful_restart: Default::default(),
            apply_policy: Default::default(),
        }
    }
}

// ===== impl NeighborConfig =====

impl NeighborConfig {
    pub fn new(address: IpAddr, peer_as: u32) -> NeighborConfig {
        NeighborConfig {
            address,
            peer_as,
            ..Default::default()
        }
    }

    // Fills the settings left at their defaults with the peer group ones.
    pub fn apply_peer_group(&mut self, group: &PeerGroupConfig) {
        let dflt = NeighborConfig::default();

        if self.peer_as == dflt.peer_as {
            self.peer_as = group.peer_as;
        }
        if self.local_as == dflt.local_as {
            self.local_as = group.local_as;
        }
        if self.auth_password.is_none() {
            self.auth_password = group.auth_password.clone();
        }
        self.next_hop_self |= group.next_hop_self;
        if self.timers == dflt.timers {
            self.timers = group.timers.clone();
        }
        if self.transport == dflt.transport {
            self.transport = group.transport.clone();
        }
        if self.ebgp_multihop == dflt.ebgp_multihop {
            self.ebgp_multihop = group.ebgp_multihop.clone();
        }
        if self.ttl_security == dflt.ttl_security {
            self.ttl_security = group.ttl_security.clone();
        }
        if self.route_reflector == dflt.route_reflector {
            self.route_reflector = group.route_reflector.clone();
        }
        if self.route_server == dflt.route_server {
            self.route_server = group.route_server.clone();
        }
        if self.as_path_options == dflt.as_path_options {
            self.as_path_options = group.as_path_options.clone();
        }
        if self.graceful_restart == dflt.graceful_restart {
            self.graceful_restart = group.graceful_restart.clone();
        }
        if self.afi_safis.is_empty() {
            self.afi_safis = group.afi_safis.clone();
        }
        if self.apply_policy == dflt.apply_policy {
            self.apply_policy = group.apply_policy.clone();
        }
    }

    // Builds the configuration of a dynamic neighbor.
    pub fn from_peer_group(
        address: IpAddr,
        group: &PeerGroupConfig,
    ) -> NeighborConfig {
        let mut config = NeighborConfig::new(address, 0);
        config.peer_group = Some(group.name.clone());
        config.apply_peer_group(group);
        config.transport.passive_mode = true;
        config
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.route_server.client && self.route_reflector.client {
            return Err(Error::InvalidConfig(format!(
                "neighbor {} can't be both route server and route reflector \
                 client",
                self.address
            )));
        }
        if self.vrf.is_some() {
            if self.route_server.client {
                return Err(Error::InvalidConfig(format!(
                    "route server client {} can't be in a VRF",
                    self.address
                )));
            }
            if let Some(family) = self.families().into_iter().find(|family| {
                !matches!(
                    family,
                    RouteFamily::Ipv4Unicast | RouteFamily::Ipv6Unicast
                )
            }) {
                return Err(Error::InvalidConfig(format!(
                    "VRF neighbor {} can't use family {}",
                    self.address, family
                )));
            }
        }
        if self.timers.keepalive_interval > self.timers.hold_time {
            return Err(Error::InvalidConfig(format!(
                "neighbor {}: keepalive interval exceeds the hold time",
                self.address
            )));
        }
        Ok(())
    }

    // Enabled address families. Without explicit configuration the family
    // of the neighbor address is used.
    pub fn families(&self) -> Vec<RouteFamily> {
        if self.afi_safis.is_empty() {
            return match self.address {
                IpAddr::V4(_) => vec![RouteFamily::Ipv4Unicast],
                IpAddr::V6(_) => vec![RouteFamily::Ipv6Unicast],
            };
        }
        self.afi_safis
            .iter()
            .filter(|afi_safi| afi_safi.enabled)
            .map(|afi_safi| afi_safi.family)
            .collect()
    }

    pub fn afi_safi(&self, family: RouteFamily) -> Option<&AfiSafiConfig> {
        self.afi_safis
            .iter()
            .find(|afi_safi| afi_safi.enabled && afi_safi.family == family)
    }

    pub fn add_path_mode(&self, family: RouteFamily) -> AddPathMode {
        let mut mode = AddPathMode::empty();
        if let Some(afi_safi) = self.afi_safi(family) {
            mode.set(AddPathMode::RECEIVE, afi_safi.add_path_receive);
            mode.set(AddPathMode::SEND, afi_safi.add_path_send);
        }
        mode
    }

    pub fn prefix_limit(
        &self,
        family: RouteFamily,
    ) -> Option<&PrefixLimitConfig> {
        self.afi_safi(family)
            .map(|afi_safi| &afi_safi.prefix_limit)
            .filter(|limit| limit.max_prefixes != 0)
    }

    pub fn is_route_server_client(&self) -> bool {
        self.route_server.client
    }

    pub fn is_route_reflector_client(&self) -> bool {
        self.route_reflector.client
    }

    // Whether a configuration change requires tearing the session down.
    pub fn needs_reset(&self, old: &NeighborConfig) -> bool {
        self.peer_as != old.peer_as
            || self.local_as != old.local_as
            || self.auth_password != old.auth_password
            || self.vrf != old.vrf
            || self.timers != old.timers
            || self.transport != old.transport
            || self.ebgp_multihop != old.ebgp_multihop
            || self.ttl_security != old.ttl_security
            || self.route_reflector != old.route_reflector
            || self.route_server != old.route_server
            || self.graceful_restart != old.graceful_restart
            || self.afi_safis != old.afi_safis
    }

    // Whether a configuration change requires re-evaluating the received
    // paths.
    pub fn needs_soft_reset_in(&self, old: &NeighborConfig) -> bool {
        self.as_path_options != old.as_path_options
            || self.apply_policy != old.apply_policy
    }
}

impl Default for NeighborConfig {
    fn default() -> NeighborConfig {
        NeighborConfig {
            address: IpAddr::from([0, 0, 0, 0]),
            peer_as: 0,
            local_as: 0,
            peer_group: None,
            description: String::new(),
            admin_down: false,
            auth_password: None,
            vrf: None,
            next_hop_self: false,
            timers: Default::default(),
            transport: Default::default(),
            ebgp_multihop: Default::default(),
            ttl_security: Default::default(),
            route_reflector: Default::default(),
            route_server: Default::default(),
            as_path_options: Default::default(),
            graceful_restart: Default::default(),
            afi_safis: Default::default(),
            apply_policy: Default::default(),
        }
    }
}

// ===== impl PeerGroupConfig =====

impl Default for PeerGroupConfig {
    fn default() -> PeerGroupConfig {
        let dflt = NeighborConfig::default();
        PeerGroupConfig {
            name: String::new(),
            peer_as: dflt.peer_as,
            local_as: dflt.local_as,
            auth_password: dflt.auth_password,
            next_hop_self: dflt.next_hop_self,
            timers: dflt.timers,
            transport: dflt.transport,
            ebgp_multihop: dflt.ebgp_multihop,
            ttl_security: dflt.ttl_security,
            route_reflector: dflt.route_reflector,
            route_server: dflt.route_server,
            as_path_options: dflt.as_path_options,
            graceful_restart: dflt.graceful_restart,
            afi_safis: dflt.afi_safis,
            apply_policy: dflt.apply_policy,
        }
    }
}

// ===== impl AfiSafiConfig =====

impl AfiSafiConfig {
    pub fn new(family: RouteFamily) -> AfiSafiConfig {
        AfiSafiConfig {
            family,
            ..Default::default()
        }
    }
}

impl Default for AfiSafiConfig {
    fn default() -> AfiSafiConfig {
        AfiSafiConfig {
            family: RouteFamily::Ipv4Unicast,
            enabled: true,
            prefix_limit: Default::default(),
            add_path_receive: false,
            add_path_send: false,
            mp_graceful_restart: true,
            long_lived_graceful_restart: false,
            llgr_restart_time: 0,
            rtc_deferral_time: 0,
        }
    }
}

// ===== impl TimersConfig =====

impl Default for TimersConfig {
    fn default() -> TimersConfig {
        TimersConfig {
            connect_retry: 120,
            hold_time: 90,
            keepalive_interval: 30,
            idle_hold_time_after_reset: 30,
        }
    }
}

// ===== impl TransportConfig =====

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            local_address: None,
            remote_port: BGP_PORT,
            passive_mode: false,
            ttl: None,
        }
    }
}

// ===== impl TtlSecurityConfig =====

impl Default for TtlSecurityConfig {
    fn default() -> TtlSecurityConfig {
        TtlSecurityConfig {
            enabled: false,
            ttl_min: 255,
        }
    }
}

// ===== impl GracefulRestartConfig =====

impl Default for GracefulRestartConfig {
    fn default() -> GracefulRestartConfig {
        GracefulRestartConfig {
            enabled: false,
            restart_time: 120,
            helper_only: false,
            deferral_time: 360,
            notification_enabled: false,
            long_lived_enabled: false,
            local_restarting: false,
        }
    }
}

// ===== impl VrfConfig =====

impl From<VrfConfig> for Vrf {
    fn from(config: VrfConfig) -> Vrf {
        Vrf {
            name: config.name,
            id: config.id,
            rd: config.rd,
            import_rt: config.import_rt,
            export_rt: config.export_rt,
        }
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config: NeighborConfig =
            serde_json::from_str(r#"{"address": "192.0.2.1"}"#).unwrap();
        assert_eq!(config.timers.hold_time, 90);
        assert_eq!(config.timers.keepalive_interval, 30);
        assert_eq!(config.timers.connect_retry, 120);
        assert_eq!(config.timers.idle_hold_time_after_reset, 30);
        assert_eq!(config.transport.remote_port, 179);
        assert_eq!(config.graceful_restart.restart_time, 120);
        assert_eq!(config.graceful_restart.deferral_time, 360);
        assert_eq!(config.families(), [RouteFamily::Ipv4Unicast]);

        assert!(
            serde_json::from_str::<NeighborConfig>(r#"{"bogus": 1}"#).is_err()
        );
    }

    #[test]
    fn peer_group_inheritance() {
        let group = PeerGroupConfig {
            name: "clients".to_owned(),
            peer_as: 65010,
            route_reflector: RouteReflectorConfig {
                client: true,
                cluster_id: None,
            },
            afi_safis: vec![AfiSafiConfig::new(RouteFamily::Ipv6Unicast)],
            ..Default::default()
        };

        let mut config = NeighborConfig::new("192.0.2.1".parse().unwrap(), 0);
        config.peer_group = Some("clients".to_owned());
        config.timers.hold_time = 9;
        config.timers.keepalive_interval = 3;
        config.apply_peer_group(&group);
        assert_eq!(config.peer_as, 65010);
        assert!(config.is_route_reflector_client());
        assert_eq!(config.families(), [RouteFamily::Ipv6Unicast]);
        assert_eq!(config.timers.hold_time, 9);

        let addr = "192.0.2.7".parse().unwrap();
        let dynamic = NeighborConfig::from_peer_group(addr, &group);
        assert!(dynamic.transport.passive_mode);
        assert_eq!(dynamic.peer_group.as_deref(), Some("clients"));
    }

    #[test]
    fn validation() {
        let mut config = NeighborConfig::new("192.0.2.1".parse().unwrap(), 1);
        assert!(config.validate().is_ok());

        config.route_server.client = true;
        config.route_reflector.client = true;
        assert!(config.validate().is_err());

        config.route_reflector.client = false;
        config.vrf = Some("red".to_owned());
        assert!(config.validate().is_err());

        config.route_server.client = false;
        config.afi_safis = vec![AfiSafiConfig::new(RouteFamily::Ipv4Vpn)];
        assert!(config.validate().is_err());

        config.afi_safis = vec![AfiSafiConfig::new(RouteFamily::Ipv4Unicast)];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reset_decisions() {
        let old = NeighborConfig::new("192.0.2.1".parse().unwrap(), 65001);
        let mut new = old.clone();
        new.description = "upstream".to_owned();
        assert!(!new.needs_reset(&old));
        assert!(!new.needs_soft_reset_in(&old));

        new.as_path_options.allow_own_as = 1;
        assert!(!new.needs_reset(&old));
        assert!(new.needs_soft_reset_in(&old));

        new.peer_as = 65002;
        assert!(new.needs_reset(&old));
    }
}
