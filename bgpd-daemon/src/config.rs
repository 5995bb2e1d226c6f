//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![allow(clippy::derivable_impls)]

use bgpd_speaker::config::{
    DynamicNeighborConfig, GlobalConfig, NeighborConfig, PeerGroupConfig,
    VrfConfig,
};
use bgpd_speaker::policy::{DefinedSets, Policy};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub logging: Logging,
    pub bgp: Bgp,
}

// Startup configuration of the BGP server.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Bgp {
    pub global: GlobalConfig,
    pub defined_sets: DefinedSets,
    pub policies: Vec<Policy>,
    pub vrfs: Vec<VrfConfig>,
    pub peer_groups: Vec<PeerGroupConfig>,
    pub dynamic_neighbors: Vec<DynamicNeighborConfig>,
    pub neighbors: Vec<NeighborConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Logging {
    pub file: LoggingFile,
    pub stdout: LoggingStdout,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingFile {
    pub enabled: bool,
    pub dir: String,
    pub name: String,
    pub rotation: LoggingFileRotation,
    #[serde(flatten)]
    pub fmt: LoggingFmt,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingStdout {
    pub enabled: bool,
    #[serde(flatten)]
    pub fmt: LoggingFmt,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingFmt {
    pub style: LoggingFmtStyle,
    pub colors: bool,
    pub show_thread_id: bool,
    pub show_source: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFileRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFmtStyle {
    Compact,
    Full,
    Json,
    Pretty,
}

// ===== impl Config =====

impl Config {
    const DFLT_FILEPATH: &'static str = "/etc/bgpd.toml";

    pub(crate) fn load(config_file: Option<&str>) -> Config {
        let config_file = config_file.unwrap_or(Config::DFLT_FILEPATH);

        match std::fs::read_to_string(config_file) {
            Ok(config_str) => toml::from_str(&config_str)
                .expect("Failed to parse configuration file"),
            Err(err) => {
                eprintln!("Failed to load configuration file: {err}");
                eprintln!("Falling back to default configuration...");
                Config::default()
            }
        }
    }
}

// ===== impl LoggingFile =====

impl Default for LoggingFile {
    fn default() -> LoggingFile {
        LoggingFile {
            enabled: true,
            dir: "/var/log".to_owned(),
            name: "bgpd.log".to_owned(),
            rotation: Default::default(),
            fmt: Default::default(),
        }
    }
}

// ===== impl LoggingStdout =====

impl Default for LoggingStdout {
    fn default() -> LoggingStdout {
        LoggingStdout {
            enabled: false,
            fmt: Default::default(),
        }
    }
}

// ===== impl LoggingFmt =====

impl Default for LoggingFmt {
    fn default() -> LoggingFmt {
        LoggingFmt {
            style: LoggingFmtStyle::Full,
            colors: false,
            show_thread_id: false,
            show_source: false,
        }
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_startup_config() {
        let config: Config = toml::from_str(
            r#"
            [logging.stdout]
            enabled = true
            style = "json"

            [bgp.global]
            asn = 65000
            router_id = "1.1.1.1"

            [[bgp.peer_groups]]
            name = "transit"
            peer_as = 65001

            [[bgp.neighbors]]
            address = "10.0.1.1"
            peer_group = "transit"
            "#,
        )
        .unwrap();

        assert!(config.logging.stdout.enabled);
        assert!(matches!(
            config.logging.stdout.fmt.style,
            LoggingFmtStyle::Json
        ));
        assert!(config.logging.file.enabled);
        assert_eq!(config.bgp.global.asn, 65000);
        assert_eq!(config.bgp.global.listen_port, 179);
        assert_eq!(config.bgp.peer_groups[0].peer_as, 65001);
        assert_eq!(
            config.bgp.neighbors[0].peer_group.as_deref(),
            Some("transit")
        );
    }

    #[test]
    fn unknown_field_rejected() {
        let result = toml::from_str::<Config>(
            r#"
            [bgp.global]
            asn = 65000
            bogus = true
            "#,
        );
        assert!(result.is_err());
    }
}
