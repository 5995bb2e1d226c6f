//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::af::{AddPathMode, RouteFamily};
use crate::config::NeighborConfig;
use crate::error::Error;
use crate::fsm::{Fsm, GrFamilyState};
use crate::packet::consts::{
    BGP_VERSION, CapabilityCode, ErrorCode, OpenMessageErrorSubcode,
};
use crate::packet::error::MessageError;
use crate::packet::message::{
    AddPathTuple, Capability, GrFlags, GrTuple, GrTupleFlags, LlgrTuple,
    NotificationMsg, OpenMsg,
};

// Reason why a received OPEN message was rejected.
#[derive(Debug)]
pub(crate) enum OpenError {
    // Semantic error (bad peer AS or BGP identifier).
    Invalid(Error),
    // Malformed message.
    Malformed(MessageError),
    // The peer is restarting but didn't set the Restart State bit.
    RestartStateMissing,
}

// ===== impl OpenError =====

impl OpenError {
    pub(crate) fn log(&self) {
        match self {
            OpenError::Invalid(error) => error.log(),
            OpenError::Malformed(error) => {
                tracing::warn!(reason = %error.reason, "malformed OPEN");
            }
            OpenError::RestartStateMissing => {
                tracing::warn!(
                    "restarting peer didn't set the restart state bit"
                );
            }
        }
    }

    // NOTIFICATION sent back to the peer, if any.
    pub(crate) fn notification(&self) -> Option<NotificationMsg> {
        let subcode = match self {
            OpenError::Invalid(Error::NbrBadAs(..)) => {
                OpenMessageErrorSubcode::BadPeerAs
            }
            OpenError::Invalid(Error::NbrBadIdentifier(..)) => {
                OpenMessageErrorSubcode::BadBgpIdentifier
            }
            OpenError::Invalid(_) | OpenError::RestartStateMissing => {
                return None;
            }
            OpenError::Malformed(error) => return Some(error.into()),
        };
        Some(NotificationMsg::new(ErrorCode::OpenMessageError, subcode))
    }
}

// ===== global functions =====

// Builds the OPEN message advertised to the neighbor.
pub(crate) fn build_open(fsm: &Fsm) -> OpenMsg {
    let config = &fsm.config;
    let families = config.families();

    // Base capabilities.
    let mut capabilities: BTreeSet<_> = [
        Capability::RouteRefresh,
        Capability::FourOctetAsNumber {
            asn: fsm.local_as(),
        },
    ]
    .into();

    // Multiprotocol capabilities.
    capabilities.extend(
        families
            .iter()
            .map(|family| Capability::multi_protocol(*family)),
    );

    // Graceful Restart capabilities.
    let gr = &config.graceful_restart;
    if gr.enabled {
        let restarting = gr.local_restarting;
        let mut flags = GrFlags::empty();
        flags.set(GrFlags::RESTARTING, restarting);
        flags.set(GrFlags::NOTIFICATION, gr.notification_enabled);

        // When restarting, the forwarding bit is always set.
        let mut tuple_flags = GrTupleFlags::empty();
        tuple_flags.set(GrTupleFlags::FORWARDING, restarting);

        let mut tuples = BTreeSet::new();
        let mut llgr_tuples = BTreeSet::new();
        for family in families.iter().copied() {
            if !gr.helper_only && gr_configured(config, family) {
                tuples.insert(GrTuple {
                    afi: family.afi(),
                    safi: family.safi(),
                    flags: tuple_flags,
                });
            }
            if let Some(afi_safi) = config.afi_safi(family)
                && gr.long_lived_enabled
                && afi_safi.long_lived_graceful_restart
            {
                llgr_tuples.insert(LlgrTuple {
                    afi: family.afi(),
                    safi: family.safi(),
                    flags: tuple_flags,
                    restart_time: afi_safi.llgr_restart_time,
                });
            }
        }
        capabilities.insert(Capability::GracefulRestart {
            flags,
            restart_time: gr.restart_time,
            tuples,
        });
        if !llgr_tuples.is_empty() {
            capabilities
                .insert(Capability::LongLivedGracefulRestart(llgr_tuples));
        }
    }

    // ADD-PATH capability.
    let add_path = families
        .iter()
        .filter_map(|family| {
            let mode = config.add_path_mode(*family);
            (!mode.is_empty()).then_some(AddPathTuple {
                afi: family.afi(),
                safi: family.safi(),
                mode,
            })
        })
        .collect::<BTreeSet<_>>();
    if !add_path.is_empty() {
        capabilities.insert(Capability::AddPath(add_path));
    }

    OpenMsg::new(
        fsm.local_as(),
        config.timers.hold_time,
        fsm.peer_info.local_id,
        capabilities,
    )
}

// Validates the OPEN message received from the neighbor and negotiates the
// session parameters.
pub(crate) fn process_open(
    fsm: &mut Fsm,
    msg: &OpenMsg,
) -> Result<(), OpenError> {
    validate(fsm, msg)?;

    // Peer identity. An unset peer AS accepts whatever the peer announces,
    // which also defines the peer type.
    let mut peer_info = (*fsm.peer_info).clone();
    peer_info.asn = msg.real_as();
    peer_info.id = msg.identifier;
    fsm.peer_info = Arc::new(peer_info);

    // Address families and ADD-PATH modes.
    let remote_families = msg.families();
    let remote_add_path = msg.add_path_modes().collect::<BTreeMap<_, _>>();
    fsm.families = fsm
        .config
        .families()
        .into_iter()
        .filter(|family| remote_families.contains(family))
        .map(|family| {
            let local = fsm.config.add_path_mode(family);
            let remote =
                remote_add_path.get(&family).copied().unwrap_or_default();
            (family, AddPathMode::negotiate(local, remote))
        })
        .collect();
    fsm.four_byte_asn = msg.has_capability(CapabilityCode::FourOctetAsNumber);
    fsm.route_refresh = msg.has_capability(CapabilityCode::RouteRefresh);

    // Timers.
    let configured = fsm.config.timers.hold_time;
    fsm.hold_time = std::cmp::min(configured, msg.holdtime);
    fsm.keepalive_interval = if fsm.hold_time < configured {
        fsm.hold_time / 3
    } else {
        fsm.config.timers.keepalive_interval
    };

    negotiate_graceful_restart(fsm, msg)?;

    fsm.open_rcvd = Some(msg.clone());
    Ok(())
}

// ===== helper functions =====

// Performs semantic validation of the received OPEN message.
fn validate(fsm: &Fsm, msg: &OpenMsg) -> Result<(), OpenError> {
    // Validate version.
    if msg.version != BGP_VERSION {
        let mut error = MessageError::session_reset(
            ErrorCode::OpenMessageError,
            OpenMessageErrorSubcode::UnsupportedVersionNumber,
            format!("unsupported version {}", msg.version),
        );
        error.data = (BGP_VERSION as u16).to_be_bytes().to_vec();
        return Err(OpenError::Malformed(error));
    }

    // Validate ASN.
    let peer_as = msg.real_as();
    if fsm.config.peer_as != 0 && fsm.config.peer_as != peer_as {
        return Err(OpenError::Invalid(Error::NbrBadAs(
            fsm.addr,
            peer_as,
            fsm.config.peer_as,
        )));
    }

    // Validate BGP identifier.
    if msg.identifier.is_unspecified()
        || (peer_as == fsm.local_as()
            && msg.identifier == fsm.peer_info.local_id)
    {
        return Err(OpenError::Invalid(Error::NbrBadIdentifier(
            fsm.addr,
            msg.identifier,
        )));
    }

    // Validate hold time.
    if msg.holdtime == 1 || msg.holdtime == 2 {
        return Err(OpenError::Malformed(MessageError::session_reset(
            ErrorCode::OpenMessageError,
            OpenMessageErrorSubcode::UnacceptableHoldTime,
            format!("unacceptable hold time {}", msg.holdtime),
        )));
    }

    Ok(())
}

fn negotiate_graceful_restart(
    fsm: &mut Fsm,
    msg: &OpenMsg,
) -> Result<(), OpenError> {
    let config = fsm.config.graceful_restart.clone();
    let peer_restarting = fsm.gr.peer_restarting;
    fsm.gr.enabled = false;
    fsm.gr.notification_enabled = false;
    fsm.gr.long_lived_enabled = false;
    fsm.gr.families.clear();

    let Some((flags, restart_time, tuples)) = msg.graceful_restart() else {
        return Ok(());
    };
    if !config.enabled {
        return Ok(());
    }

    fsm.gr.enabled = true;
    fsm.gr.peer_restart_time = *restart_time;
    for family in tuples.iter().filter_map(GrTuple::family) {
        if fsm.is_negotiated(family) && gr_configured(&fsm.config, family) {
            fsm.gr.families.insert(
                family,
                GrFamilyState {
                    received: true,
                    ..Default::default()
                },
            );
        }
    }

    // RFC 4724: to re-establish the session with its peer, the restarting
    // speaker must set the Restart State bit.
    if peer_restarting && !flags.contains(GrFlags::RESTARTING) {
        return Err(OpenError::RestartStateMissing);
    }

    fsm.gr.notification_enabled =
        config.notification_enabled && flags.contains(GrFlags::NOTIFICATION);

    if config.long_lived_enabled
        && let Some(llgr_tuples) = msg.long_lived_graceful_restart()
    {
        fsm.gr.long_lived_enabled = true;
        for tuple in llgr_tuples {
            let Some(family) = tuple.family() else {
                continue;
            };
            let configured = fsm
                .config
                .afi_safi(family)
                .is_some_and(|afi_safi| afi_safi.long_lived_graceful_restart);
            if !fsm.is_negotiated(family) || !configured {
                continue;
            }
            let state = fsm.gr.families.entry(family).or_default();
            state.llgr_received = true;
            state.llgr_restart_time = tuple.restart_time;
        }
    }

    Ok(())
}

// Whether Graceful Restart is enabled for the given family. Neighbors
// without explicit address family settings use it on their default family.
fn gr_configured(config: &NeighborConfig, family: RouteFamily) -> bool {
    match config.afi_safi(family) {
        Some(afi_safi) => afi_safi.mp_graceful_restart,
        None => config.afi_safis.is_empty(),
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::config::{AfiSafiConfig, GlobalConfig, GracefulRestartConfig};

    fn fsm(peer_as: u32) -> Fsm {
        let global = GlobalConfig {
            asn: 65000,
            router_id: Ipv4Addr::new(1, 1, 1, 1),
            ..Default::default()
        };
        let mut config =
            NeighborConfig::new("192.0.2.1".parse().unwrap(), peer_as);
        config.graceful_restart = GracefulRestartConfig {
            enabled: true,
            notification_enabled: true,
            ..Default::default()
        };
        config.afi_safis = vec![
            AfiSafiConfig::new(RouteFamily::Ipv4Unicast),
            AfiSafiConfig {
                add_path_receive: true,
                ..AfiSafiConfig::new(RouteFamily::Ipv6Unicast)
            },
        ];
        config.timers.hold_time = 90;
        config.timers.keepalive_interval = 30;
        Fsm::new(config, &global)
    }

    fn remote_open(asn: u32, holdtime: u16) -> OpenMsg {
        let mut fsm = fsm(asn);
        fsm.config.timers.hold_time = holdtime;
        fsm.peer_info = Arc::new(crate::path::PeerInfo {
            local_as: asn,
            local_id: Ipv4Addr::new(2, 2, 2, 2),
            ..(*fsm.peer_info).clone()
        });
        fsm.config.afi_safis[1].add_path_receive = false;
        fsm.config.afi_safis[1].add_path_send = true;
        build_open(&fsm)
    }

    #[test]
    fn open_capabilities() {
        let fsm = fsm(65001);
        let msg = build_open(&fsm);
        assert_eq!(msg.real_as(), 65000);
        assert_eq!(msg.holdtime, 90);
        assert!(msg.has_capability(CapabilityCode::RouteRefresh));
        assert_eq!(
            msg.families(),
            [RouteFamily::Ipv4Unicast, RouteFamily::Ipv6Unicast].into()
        );
        let (flags, _, tuples) = msg.graceful_restart().unwrap();
        assert_eq!(*flags, GrFlags::NOTIFICATION);
        assert_eq!(tuples.len(), 2);
        assert_eq!(
            msg.add_path_modes().collect::<Vec<_>>(),
            vec![(RouteFamily::Ipv6Unicast, AddPathMode::RECEIVE)]
        );
    }

    #[test]
    fn open_negotiation() {
        let mut fsm = fsm(65001);
        let msg = remote_open(65001, 30);
        process_open(&mut fsm, &msg).unwrap();

        assert_eq!(fsm.peer_info.id, Ipv4Addr::new(2, 2, 2, 2));
        assert_eq!(fsm.hold_time, 30);
        assert_eq!(fsm.keepalive_interval, 10);
        assert_eq!(
            fsm.families.get(&RouteFamily::Ipv6Unicast),
            Some(&AddPathMode::RECEIVE)
        );
        assert!(fsm.gr.enabled);
        assert!(fsm.gr.notification_enabled);
        assert_eq!(fsm.gr.families.len(), 2);
        assert!(fsm.codec_cxt().four_byte_asn);
    }

    #[test]
    fn open_validation() {
        let mut fsm = fsm(65002);
        let error = process_open(&mut fsm, &remote_open(65001, 90));
        let error = error.unwrap_err();
        assert!(matches!(error, OpenError::Invalid(Error::NbrBadAs(..))));
        let notif = error.notification().unwrap();
        assert_eq!(
            notif,
            NotificationMsg::new(
                ErrorCode::OpenMessageError,
                OpenMessageErrorSubcode::BadPeerAs
            )
        );

        let mut fsm = self::fsm(65001);
        let error = process_open(&mut fsm, &remote_open(65001, 2));
        assert!(matches!(error, Err(OpenError::Malformed(_))));

        // Any AS is accepted when the peer AS isn't configured.
        let mut fsm = self::fsm(0);
        process_open(&mut fsm, &remote_open(65009, 90)).unwrap();
        assert_eq!(fsm.peer_as(), 65009);
        assert!(!fsm.is_ibgp());
    }

    #[test]
    fn open_restart_state_missing() {
        let mut fsm = fsm(65001);
        fsm.gr.peer_restarting = true;
        let error = process_open(&mut fsm, &remote_open(65001, 90));
        assert!(matches!(error, Err(OpenError::RestartStateMissing)));
    }
}
