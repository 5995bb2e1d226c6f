//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use tracing::{debug, debug_span, info};

use crate::af::RouteFamily;
use crate::fsm::{AdminState, State, StateReason};
use crate::packet::message::Message;
use crate::packet::nlri::Nlri;
use crate::path::Path;
use crate::policy::PolicyDirection;

// BGP debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    ServerStart(u32),
    ServerStop,
    PeerCreate(&'a IpAddr),
    PeerDelete(&'a IpAddr),
    FsmTransition(&'a IpAddr, &'a State, &'a State, &'a StateReason),
    AdminStateChange(&'a IpAddr, &'a AdminState),
    MsgRx(&'a IpAddr, &'a Message),
    MsgTx(&'a IpAddr, &'a Message),
    EorRx(&'a IpAddr, RouteFamily),
    PeerRestarting(&'a IpAddr),
    PeerRestartFinished(&'a IpAddr),
    LlgrStart(&'a IpAddr, RouteFamily, u32),
    LlgrExpired(&'a IpAddr, RouteFamily),
    SelectionDeferralExpired,
    BestPathFound(&'a Path),
    BestPathNotFound(&'a Nlri),
    PolicyReject(&'a Path, PolicyDirection),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::ServerStart(asn) => {
                info!(%asn, "{}", self);
            }
            Debug::ServerStop | Debug::SelectionDeferralExpired => {
                debug!("{}", self);
            }
            Debug::PeerCreate(addr)
            | Debug::PeerDelete(addr)
            | Debug::PeerRestarting(addr)
            | Debug::PeerRestartFinished(addr) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::FsmTransition(addr, old_state, new_state, reason) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("fsm").in_scope(|| {
                        debug!(%old_state, %new_state, %reason, "{}", self);
                    })
                });
            }
            Debug::AdminStateChange(addr, state) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("fsm").in_scope(|| {
                        debug!(?state, "{}", self);
                    })
                });
            }
            Debug::MsgRx(addr, msg) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("input").in_scope(|| {
                        let data =
                            serde_json::to_string(&msg).unwrap_or_default();
                        debug!(%data, "{}", self);
                    })
                });
            }
            Debug::MsgTx(addr, msg) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("output").in_scope(|| {
                        let data =
                            serde_json::to_string(&msg).unwrap_or_default();
                        debug!(%data, "{}", self);
                    })
                });
            }
            Debug::EorRx(addr, family) | Debug::LlgrExpired(addr, family) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug!(%family, "{}", self);
                });
            }
            Debug::LlgrStart(addr, family, stale_time) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug!(%family, %stale_time, "{}", self);
                });
            }
            Debug::BestPathFound(path) => {
                let nlri = &path.nlri;
                let source = &path.source;
                debug!(%nlri, %source, "{}", self);
            }
            Debug::BestPathNotFound(nlri) => {
                debug!(%nlri, "{}", self);
            }
            Debug::PolicyReject(path, direction) => {
                let nlri = &path.nlri;
                let source = &path.source;
                debug!(%nlri, %source, ?direction, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::ServerStart(..) => {
                write!(f, "starting server")
            }
            Debug::ServerStop => {
                write!(f, "stopping server")
            }
            Debug::PeerCreate(..) => {
                write!(f, "peer created")
            }
            Debug::PeerDelete(..) => {
                write!(f, "peer deleted")
            }
            Debug::FsmTransition(..) => {
                write!(f, "state transition")
            }
            Debug::AdminStateChange(..) => {
                write!(f, "administrative state change")
            }
            Debug::MsgRx(..) | Debug::MsgTx(..) => {
                write!(f, "message")
            }
            Debug::EorRx(..) => {
                write!(f, "End-of-RIB received")
            }
            Debug::PeerRestarting(..) => {
                write!(f, "peer restarting")
            }
            Debug::PeerRestartFinished(..) => {
                write!(f, "peer restart finished")
            }
            Debug::LlgrStart(..) => {
                write!(f, "long-lived stale timer started")
            }
            Debug::LlgrExpired(..) => {
                write!(f, "long-lived stale timer expired")
            }
            Debug::SelectionDeferralExpired => {
                write!(f, "selection deferral timer expired")
            }
            Debug::BestPathFound(..) => {
                write!(f, "best path found")
            }
            Debug::BestPathNotFound(..) => {
                write!(f, "best path not found")
            }
            Debug::PolicyReject(..) => {
                write!(f, "path rejected by policy")
            }
        }
    }
}
