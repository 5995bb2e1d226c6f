//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::IpNetwork;
use tracing::{error, warn, warn_span};

use crate::af::RouteFamily;
use crate::packet::error::MessageError;
use crate::packet::nlri::RouteDistinguisher;

// BGP errors.
#[derive(Debug)]
pub enum Error {
    // I/O errors
    IoError(IoError),
    // Network input
    NbrRxError(IpAddr, NbrRxError),
    // Message processing
    NbrBadAs(IpAddr, u32, u32),
    NbrBadIdentifier(IpAddr, Ipv4Addr),
    // Management operations
    NotStarted,
    AlreadyStarted,
    ServerStopped,
    InvalidConfig(String),
    PeerExists(IpAddr),
    PeerNotFound(IpAddr),
    PeerGroupExists(String),
    PeerGroupNotFound(String),
    PeerGroupInUse(String),
    DynamicNeighborExists(IpNetwork),
    VrfExists(String),
    VrfNotFound(String),
    VrfInUse(String),
    VrfRdInUse(RouteDistinguisher),
    FamilyNotConfigured(RouteFamily),
    AdminStateUnchanged(IpAddr),
    AdminStatePending(IpAddr),
    // Policies
    PolicyExists(String),
    PolicyNotFound(String),
    PolicyInUse(String),
    StatementExists(String),
    DefinedSetNotFound(String),
}

// BGP I/O errors.
#[derive(Debug)]
pub enum IoError {
    TcpSocketError(std::io::Error),
    TcpAcceptError(std::io::Error),
    TcpConnectError(std::io::Error),
    TcpInfoError(std::io::Error),
    TcpAuthError(std::io::Error),
    TcpRecvError(std::io::Error),
    TcpSendError(std::io::Error),
}

// Neighbor Rx errors.
#[derive(Debug)]
pub enum NbrRxError {
    TcpConnClosed,
    TcpReadError(std::io::Error),
    MsgDecodeError(MessageError),
}

// ===== impl Error =====

impl Error {
    pub fn log(&self) {
        match self {
            Error::IoError(error) => {
                error.log();
            }
            Error::NbrRxError(addr, error) => {
                warn_span!("neighbor", %addr).in_scope(|| {
                    error.log();
                });
            }
            Error::NbrBadAs(addr, received, expected) => {
                warn_span!("neighbor", %addr).in_scope(|| {
                    warn!(%received, %expected, "{}", self);
                });
            }
            Error::NbrBadIdentifier(addr, identifier) => {
                warn_span!("neighbor", %addr).in_scope(|| {
                    warn!(%identifier, "{}", self);
                });
            }
            Error::NotStarted
            | Error::AlreadyStarted
            | Error::ServerStopped
            | Error::InvalidConfig(..) => {
                warn!("{}", self);
            }
            Error::PeerExists(addr)
            | Error::PeerNotFound(addr)
            | Error::AdminStateUnchanged(addr)
            | Error::AdminStatePending(addr) => {
                warn!(%addr, "{}", self);
            }
            Error::DynamicNeighborExists(prefix) => {
                warn!(%prefix, "{}", self);
            }
            Error::PeerGroupExists(name)
            | Error::PeerGroupNotFound(name)
            | Error::PeerGroupInUse(name)
            | Error::VrfExists(name)
            | Error::VrfNotFound(name)
            | Error::VrfInUse(name)
            | Error::PolicyExists(name)
            | Error::PolicyNotFound(name)
            | Error::PolicyInUse(name)
            | Error::StatementExists(name)
            | Error::DefinedSetNotFound(name) => {
                warn!(%name, "{}", self);
            }
            Error::VrfRdInUse(rd) => {
                warn!(%rd, "{}", self);
            }
            Error::FamilyNotConfigured(family) => {
                error!(%family, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(error) => error.fmt(f),
            Error::NbrRxError(_, error) => error.fmt(f),
            Error::NbrBadAs(..) => {
                write!(f, "bad peer AS")
            }
            Error::NbrBadIdentifier(..) => {
                write!(f, "BGP identifier conflict")
            }
            Error::NotStarted => {
                write!(f, "BGP server hasn't started yet")
            }
            Error::AlreadyStarted => {
                write!(f, "BGP server is already started")
            }
            Error::ServerStopped => {
                write!(f, "BGP server has stopped")
            }
            Error::InvalidConfig(reason) => {
                write!(f, "invalid configuration: {reason}")
            }
            Error::PeerExists(addr) => {
                write!(f, "neighbor {addr} already exists")
            }
            Error::PeerNotFound(addr) => {
                write!(f, "neighbor {addr} not found")
            }
            Error::PeerGroupExists(name) => {
                write!(f, "peer group {name} already exists")
            }
            Error::PeerGroupNotFound(name) => {
                write!(f, "peer group {name} not found")
            }
            Error::PeerGroupInUse(name) => {
                write!(f, "peer group {name} is in use")
            }
            Error::DynamicNeighborExists(prefix) => {
                write!(f, "dynamic neighbor {prefix} already exists")
            }
            Error::VrfExists(name) => {
                write!(f, "VRF {name} already exists")
            }
            Error::VrfNotFound(name) => {
                write!(f, "VRF {name} not found")
            }
            Error::VrfInUse(name) => {
                write!(f, "VRF {name} is in use")
            }
            Error::VrfRdInUse(rd) => {
                write!(f, "route distinguisher {rd} is already in use")
            }
            Error::FamilyNotConfigured(family) => {
                write!(f, "address family {family} isn't configured")
            }
            Error::AdminStateUnchanged(..) => {
                write!(f, "administrative state is already the requested one")
            }
            Error::AdminStatePending(..) => {
                write!(f, "previous administrative state request is pending")
            }
            Error::PolicyExists(name) => {
                write!(f, "policy {name} already exists")
            }
            Error::PolicyNotFound(name) => {
                write!(f, "policy {name} not found")
            }
            Error::PolicyInUse(name) => {
                write!(f, "policy {name} is in use")
            }
            Error::StatementExists(name) => {
                write!(f, "statement {name} already exists")
            }
            Error::DefinedSetNotFound(name) => {
                write!(f, "defined set {name} not found")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(error) => Some(error),
            Error::NbrRxError(_, error) => Some(error),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::IoError(error)
    }
}

// ===== impl IoError =====

impl IoError {
    pub fn log(&self) {
        match self {
            IoError::TcpSocketError(error)
            | IoError::TcpAcceptError(error)
            | IoError::TcpConnectError(error)
            | IoError::TcpAuthError(error)
            | IoError::TcpInfoError(error)
            | IoError::TcpRecvError(error)
            | IoError::TcpSendError(error) => {
                warn!(error = %with_source(error), "{}", self);
            }
        }
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::TcpSocketError(..) => {
                write!(f, "failed to create TCP socket")
            }
            IoError::TcpAcceptError(..) => {
                write!(f, "failed to accept connection request")
            }
            IoError::TcpConnectError(..) => {
                write!(f, "failed to establish TCP connection")
            }
            IoError::TcpAuthError(..) => {
                write!(f, "failed to set TCP authentication option")
            }
            IoError::TcpInfoError(..) => {
                write!(f, "failed to fetch address information from the socket")
            }
            IoError::TcpRecvError(..) => {
                write!(f, "failed to read TCP data")
            }
            IoError::TcpSendError(..) => {
                write!(f, "failed to send TCP data")
            }
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::TcpSocketError(error)
            | IoError::TcpAcceptError(error)
            | IoError::TcpConnectError(error)
            | IoError::TcpAuthError(error)
            | IoError::TcpInfoError(error)
            | IoError::TcpRecvError(error)
            | IoError::TcpSendError(error) => Some(error),
        }
    }
}

// ===== impl NbrRxError =====

impl NbrRxError {
    pub fn log(&self) {
        match self {
            NbrRxError::TcpConnClosed => {
                warn!("{}", self);
            }
            NbrRxError::TcpReadError(error) => {
                warn!(error = %with_source(error), "{}", self);
            }
            NbrRxError::MsgDecodeError(error) => {
                warn!(error = %with_source(error), "{}", self);
            }
        }
    }
}

impl std::fmt::Display for NbrRxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NbrRxError::TcpConnClosed => {
                write!(f, "connection closed by remote end")
            }
            NbrRxError::TcpReadError(..) => {
                write!(f, "failed to read TCP data")
            }
            NbrRxError::MsgDecodeError(..) => {
                write!(f, "failed to decode BGP message")
            }
        }
    }
}

impl std::error::Error for NbrRxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NbrRxError::TcpReadError(error) => Some(error),
            NbrRxError::MsgDecodeError(error) => Some(error),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NbrRxError {
    fn from(error: std::io::Error) -> NbrRxError {
        NbrRxError::TcpReadError(error)
    }
}

// ===== global functions =====

fn with_source<E: std::error::Error>(error: E) -> String {
    if let Some(source) = error.source() {
        format!("{} ({})", error, with_source(source))
    } else {
        error.to_string()
    }
}
