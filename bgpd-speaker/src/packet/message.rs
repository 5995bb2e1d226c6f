//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use bitflags::bitflags;
use enum_as_inner::EnumAsInner;
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::af::{AddPathMode, RouteFamily};
use crate::packet::attribute::Attrs;
use crate::packet::consts::{
    Afi, BGP_VERSION, CapabilityCode, CeaseSubcode, ErrorCode, MessageType,
    Safi, UpdateMessageErrorSubcode,
};
use crate::packet::error::{ErrorHandling, MessageError};
use crate::packet::nlri::Nlri;

//
// BGP message.
//
// Encoding format (message header):
//
// 0                   1                   2                   3
// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                                                               |
// +                                                               +
// |                           Marker                              |
// +                                                               +
// |                                                               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |          Length               |      Type     |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(EnumAsInner)]
#[derive(Deserialize, Serialize)]
pub enum Message {
    Open(OpenMsg),
    Update(UpdateMsg),
    Notification(NotificationMsg),
    Keepalive(KeepaliveMsg),
    RouteRefresh(RouteRefreshMsg),
}

//
// OPEN Message.
//
// Encoding format (message body):
//
// 0                   1                   2                   3
// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+
// |    Version    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |     My Autonomous System      |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |           Hold Time           |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                         BGP Identifier                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Opt Parm Len  |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                                                               |
// |             Optional Parameters (variable)                    |
// |                                                               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct OpenMsg {
    pub version: u8,
    pub my_as: u16,
    pub holdtime: u16,
    pub identifier: Ipv4Addr,
    pub capabilities: BTreeSet<Capability>,
}

//
// Capabilities Optional Parameter.
//
// Encoding format:
//
// +------------------------------+
// | Capability Code (1 octet)    |
// +------------------------------+
// | Capability Length (1 octet)  |
// +------------------------------+
// | Capability Value (variable)  |
// ~                              ~
// +------------------------------+
//
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(EnumAsInner)]
#[derive(Deserialize, Serialize)]
pub enum Capability {
    MultiProtocol {
        afi: Afi,
        safi: Safi,
    },
    RouteRefresh,
    ExtendedNextHop(BTreeSet<ExtNexthopTuple>),
    GracefulRestart {
        flags: GrFlags,
        restart_time: u16,
        tuples: BTreeSet<GrTuple>,
    },
    FourOctetAsNumber {
        asn: u32,
    },
    AddPath(BTreeSet<AddPathTuple>),
    LongLivedGracefulRestart(BTreeSet<LlgrTuple>),
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct AddPathTuple {
    pub afi: Afi,
    pub safi: Safi,
    pub mode: AddPathMode,
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct ExtNexthopTuple {
    pub afi: Afi,
    pub safi: Safi,
    pub nexthop_afi: Afi,
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct GrTuple {
    pub afi: Afi,
    pub safi: Safi,
    pub flags: GrTupleFlags,
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct LlgrTuple {
    pub afi: Afi,
    pub safi: Safi,
    pub flags: GrTupleFlags,
    // Stale time, in seconds (24 bits on the wire).
    pub restart_time: u32,
}

// Graceful Restart capability flags (RFC 4724, RFC 8538).
bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct GrFlags: u8 {
        const RESTARTING = 0x08;
        const NOTIFICATION = 0x04;
    }
}

// Graceful Restart per-AFI/SAFI flags.
bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct GrTupleFlags: u8 {
        const FORWARDING = 0x80;
    }
}

//
// UPDATE Message.
//
// Encoding format (message body):
//
// +-----------------------------------------------------+
// |   Withdrawn Routes Length (2 octets)                |
// +-----------------------------------------------------+
// |   Withdrawn Routes (variable)                       |
// +-----------------------------------------------------+
// |   Total Path Attribute Length (2 octets)            |
// +-----------------------------------------------------+
// |   Path Attributes (variable)                        |
// +-----------------------------------------------------+
// |   Network Layer Reachability Information (variable) |
// +-----------------------------------------------------+
//
// Reachable and unreachable NLRIs are always carried in the multiprotocol
// form: the codec maps the legacy IPv4 fields onto them.
//
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[skip_serializing_none]
#[derive(Deserialize, Serialize)]
pub struct UpdateMsg {
    pub reach: Option<MpReachNlri>,
    pub unreach: Option<MpUnreachNlri>,
    pub attrs: Option<Attrs>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MpReachNlri {
    pub family: RouteFamily,
    pub prefixes: Vec<NlriEntry>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MpUnreachNlri {
    pub family: RouteFamily,
    pub prefixes: Vec<NlriEntry>,
}

// NLRI prefixed by its ADD-PATH identifier (zero when ADD-PATH isn't in use).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct NlriEntry {
    pub path_id: u32,
    pub nlri: Nlri,
}

//
// NOTIFICATION Message.
//
// Encoding format (message body):
//
// 0                   1                   2                   3
// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Error code    | Error subcode |   Data (variable)             |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct NotificationMsg {
    pub error_code: u8,
    pub error_subcode: u8,
    pub data: Vec<u8>,
}

//
// KEEPALIVE Message.
//
// A KEEPALIVE message consists of only the message header and has a length of
// 19 octets.
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct KeepaliveMsg {}

//
// Route-REFRESH Message.
//
// Encoding format (message body):
//
// 0       7      15      23      31
// +-------+-------+-------+-------+
// |      AFI      | Res.  | SAFI  |
// +-------+-------+-------+-------+
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RouteRefreshMsg {
    pub afi: Afi,
    pub safi: Safi,
}

// ===== impl Message =====

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Open(_) => MessageType::Open,
            Message::Update(_) => MessageType::Update,
            Message::Notification(_) => MessageType::Notification,
            Message::Keepalive(_) => MessageType::Keepalive,
            Message::RouteRefresh(_) => MessageType::RouteRefresh,
        }
    }
}

// ===== impl OpenMsg =====

impl OpenMsg {
    pub fn new(
        local_as: u32,
        holdtime: u16,
        identifier: Ipv4Addr,
        capabilities: BTreeSet<Capability>,
    ) -> OpenMsg {
        // RFC 6793: ASNs that don't fit in two octets are advertised as
        // AS_TRANS.
        let my_as = u16::try_from(local_as)
            .unwrap_or(crate::packet::consts::AS_TRANS);
        OpenMsg {
            version: BGP_VERSION,
            my_as,
            holdtime,
            identifier,
            capabilities,
        }
    }

    pub fn real_as(&self) -> u32 {
        self.capabilities
            .iter()
            .find_map(|cap| {
                if let Capability::FourOctetAsNumber { asn } = cap {
                    Some(*asn)
                } else {
                    None
                }
            })
            .unwrap_or(self.my_as as u32)
    }

    pub fn has_capability(&self, code: CapabilityCode) -> bool {
        self.capabilities.iter().any(|cap| cap.code() == code)
    }

    // Families announced through the multiprotocol capability. A speaker
    // that doesn't send it implicitly supports IPv4 unicast only.
    pub fn families(&self) -> BTreeSet<RouteFamily> {
        let families = self
            .capabilities
            .iter()
            .filter_map(|cap| cap.as_multi_protocol())
            .filter_map(|(afi, safi)| RouteFamily::from_afi_safi(*afi, *safi))
            .collect::<BTreeSet<_>>();
        if !self.has_capability(CapabilityCode::MultiProtocol) {
            return [RouteFamily::Ipv4Unicast].into();
        }
        families
    }

    // ADD-PATH modes announced per family. Multiple ADD-PATH capabilities
    // are merged.
    pub fn add_path_modes(
        &self,
    ) -> impl Iterator<Item = (RouteFamily, AddPathMode)> + '_ {
        self.capabilities
            .iter()
            .filter_map(|cap| cap.as_add_path())
            .flatten()
            .filter_map(|tuple| {
                RouteFamily::from_afi_safi(tuple.afi, tuple.safi)
                    .map(|family| (family, tuple.mode))
            })
    }

    // Returns the last Graceful Restart capability, if any.
    pub fn graceful_restart(
        &self,
    ) -> Option<(&GrFlags, &u16, &BTreeSet<GrTuple>)> {
        self.capabilities
            .iter()
            .filter_map(|cap| cap.as_graceful_restart())
            .last()
    }

    // Returns the last Long-Lived Graceful Restart capability, if any.
    pub fn long_lived_graceful_restart(&self) -> Option<&BTreeSet<LlgrTuple>> {
        self.capabilities
            .iter()
            .filter_map(|cap| cap.as_long_lived_graceful_restart())
            .last()
    }
}

// ===== impl Capability =====

impl Capability {
    pub fn code(&self) -> CapabilityCode {
        match self {
            Capability::MultiProtocol { .. } => CapabilityCode::MultiProtocol,
            Capability::RouteRefresh => CapabilityCode::RouteRefresh,
            Capability::ExtendedNextHop(_) => CapabilityCode::ExtendedNextHop,
            Capability::GracefulRestart { .. } => {
                CapabilityCode::GracefulRestart
            }
            Capability::FourOctetAsNumber { .. } => {
                CapabilityCode::FourOctetAsNumber
            }
            Capability::AddPath(_) => CapabilityCode::AddPath,
            Capability::LongLivedGracefulRestart(_) => {
                CapabilityCode::LongLivedGracefulRestart
            }
        }
    }

    pub fn multi_protocol(family: RouteFamily) -> Capability {
        Capability::MultiProtocol {
            afi: family.afi(),
            safi: family.safi(),
        }
    }
}

// ===== impl GrTuple =====

impl GrTuple {
    pub fn family(&self) -> Option<RouteFamily> {
        RouteFamily::from_afi_safi(self.afi, self.safi)
    }
}

// ===== impl LlgrTuple =====

impl LlgrTuple {
    pub fn family(&self) -> Option<RouteFamily> {
        RouteFamily::from_afi_safi(self.afi, self.safi)
    }
}

// ===== impl UpdateMsg =====

impl UpdateMsg {
    // Builds an End-of-RIB marker for the given family (RFC 4724).
    pub fn end_of_rib(family: RouteFamily) -> UpdateMsg {
        match family {
            RouteFamily::Ipv4Unicast => UpdateMsg::default(),
            _ => UpdateMsg {
                reach: None,
                unreach: Some(MpUnreachNlri {
                    family,
                    prefixes: vec![],
                }),
                attrs: None,
            },
        }
    }

    // Returns the family of this End-of-RIB marker, if the message is one.
    pub fn eor_family(&self) -> Option<RouteFamily> {
        if self.reach.is_some() || self.attrs.is_some() {
            return None;
        }
        match &self.unreach {
            None => Some(RouteFamily::Ipv4Unicast),
            Some(unreach) if unreach.prefixes.is_empty() => {
                Some(unreach.family)
            }
            Some(_) => None,
        }
    }

    // Number of withdrawn prefixes carried by this message.
    pub fn withdrawn_count(&self) -> usize {
        self.unreach
            .as_ref()
            .map(|unreach| unreach.prefixes.len())
            .unwrap_or(0)
    }

    // Converts every reachable NLRI into a withdrawal (RFC 7606
    // "treat-as-withdraw").
    pub fn treat_as_withdraw(&mut self) {
        let Some(reach) = self.reach.take() else {
            return;
        };
        let unreach = self.unreach.get_or_insert_with(|| MpUnreachNlri {
            family: reach.family,
            prefixes: vec![],
        });
        if unreach.family == reach.family {
            unreach.prefixes.extend(reach.prefixes);
        }
        self.attrs = None;
    }

    // Checks the message against the families negotiated for the session
    // and the well-known attribute rules (RFC 7606).
    pub fn validate(
        &self,
        families: &BTreeMap<RouteFamily, AddPathMode>,
    ) -> Result<(), MessageError> {
        let reach = self.reach.as_ref().map(|reach| reach.family);
        let unreach = self.unreach.as_ref().map(|unreach| unreach.family);
        for family in reach.into_iter().chain(unreach) {
            if !families.contains_key(&family) {
                return Err(MessageError::malformed_update(
                    UpdateMessageErrorSubcode::OptionalAttributeError,
                    ErrorHandling::AfiSafiDisable,
                    format!("address family {family} wasn't negotiated"),
                ));
            }
        }

        let Some(reach) = &self.reach else {
            return Ok(());
        };
        if reach.prefixes.is_empty() {
            return Ok(());
        }
        let Some(attrs) = &self.attrs else {
            return Err(MessageError::malformed_update(
                UpdateMessageErrorSubcode::MissingWellKnownAttribute,
                ErrorHandling::TreatAsWithdraw,
                "missing path attributes",
            ));
        };
        let Some(nexthop) = attrs.base.nexthop else {
            return Err(MessageError::malformed_update(
                UpdateMessageErrorSubcode::MissingWellKnownAttribute,
                ErrorHandling::TreatAsWithdraw,
                "missing next hop",
            ));
        };
        if reach.family != RouteFamily::RouteTargetConstraint
            && (nexthop.is_unspecified() || nexthop.is_multicast())
        {
            return Err(MessageError::malformed_update(
                UpdateMessageErrorSubcode::InvalidNexthopAttribute,
                ErrorHandling::TreatAsWithdraw,
                format!("invalid next hop {nexthop}"),
            ));
        }
        Ok(())
    }
}

// ===== impl NotificationMsg =====

impl NotificationMsg {
    // Maximum length of the Shutdown Communication (RFC 9003).
    const MAX_COMMUNICATION_LEN: usize = 255;

    pub fn new(
        error_code: impl ToPrimitive,
        error_subcode: impl ToPrimitive,
    ) -> Self {
        NotificationMsg {
            error_code: error_code.to_u8().unwrap_or(0),
            error_subcode: error_subcode.to_u8().unwrap_or(0),
            data: Default::default(),
        }
    }

    // Builds a CEASE notification carrying a Shutdown Communication.
    //
    // Only administrative shutdown/reset carry one (RFC 9003); the text is
    // dropped for any other subcode.
    pub fn with_communication(
        subcode: CeaseSubcode,
        communication: &str,
    ) -> Self {
        let mut msg = NotificationMsg::new(ErrorCode::Cease, subcode);
        let admin = matches!(
            subcode,
            CeaseSubcode::AdministrativeShutdown
                | CeaseSubcode::AdministrativeReset
        );
        if admin && !communication.is_empty() {
            let mut end = communication.len().min(Self::MAX_COMMUNICATION_LEN);
            while !communication.is_char_boundary(end) {
                end -= 1;
            }
            let communication = &communication.as_bytes()[..end];
            msg.data.push(communication.len() as u8);
            msg.data.extend_from_slice(communication);
        }
        msg
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u8(self.error_code)
    }

    pub fn is_cease(&self, subcode: CeaseSubcode) -> bool {
        self.error_code() == Some(ErrorCode::Cease)
            && CeaseSubcode::from_u8(self.error_subcode) == Some(subcode)
    }

    // Decodes the Shutdown Communication of administrative shutdown/reset
    // notifications, returning it together with any trailing data.
    pub fn communication(&self) -> Option<(String, &[u8])> {
        if !self.is_cease(CeaseSubcode::AdministrativeShutdown)
            && !self.is_cease(CeaseSubcode::AdministrativeReset)
        {
            return None;
        }
        let (len, rest) = self.data.split_first()?;
        let len = (*len as usize).min(rest.len());
        let communication = String::from_utf8_lossy(&rest[..len]).into_owned();
        Some((communication, &rest[len..]))
    }
}

impl From<&MessageError> for NotificationMsg {
    fn from(error: &MessageError) -> NotificationMsg {
        NotificationMsg {
            error_code: error.code as u8,
            error_subcode: error.subcode,
            data: error.data.clone(),
        }
    }
}

impl std::fmt::Display for NotificationMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.error_code() {
            Some(code) => write!(f, "{:?}", code)?,
            None => write!(f, "code {}", self.error_code)?,
        }
        write!(f, "/{}", self.error_subcode)
    }
}

// ===== impl RouteRefreshMsg =====

impl RouteRefreshMsg {
    pub fn new(family: RouteFamily) -> RouteRefreshMsg {
        RouteRefreshMsg {
            afi: family.afi(),
            safi: family.safi(),
        }
    }

    pub fn family(&self) -> Option<RouteFamily> {
        RouteFamily::from_afi_safi(self.afi, self.safi)
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::consts::AS_TRANS;

    #[test]
    fn open_real_as() {
        let caps = [Capability::FourOctetAsNumber { asn: 4200000000 }].into();
        let msg = OpenMsg::new(4200000000, 90, Ipv4Addr::new(1, 1, 1, 1), caps);
        assert_eq!(msg.my_as, AS_TRANS);
        assert_eq!(msg.real_as(), 4200000000);
        assert_eq!(msg.families(), [RouteFamily::Ipv4Unicast].into());
    }

    #[test]
    fn end_of_rib_markers() {
        for family in RouteFamily::ALL {
            let eor = UpdateMsg::end_of_rib(family);
            assert_eq!(eor.eor_family(), Some(family));
        }
    }

    #[test]
    fn update_validation() {
        use std::net::IpAddr;

        use crate::packet::attribute::{Attrs, BaseAttrs};

        let families = BTreeMap::from([(
            RouteFamily::Ipv4Unicast,
            AddPathMode::empty(),
        )]);
        let prefix = "10.0.0.0/24".parse::<ipnetwork::IpNetwork>().unwrap();
        let nlri = Nlri::from(prefix);
        let reach = |nexthop: Option<IpAddr>| UpdateMsg {
            reach: Some(MpReachNlri {
                family: RouteFamily::Ipv4Unicast,
                prefixes: vec![NlriEntry { path_id: 0, nlri }],
            }),
            unreach: None,
            attrs: Some(Attrs::new(BaseAttrs {
                nexthop,
                ..Default::default()
            })),
        };

        assert!(reach(Some("192.0.2.1".parse().unwrap()))
            .validate(&families)
            .is_ok());
        let error = reach(None).validate(&families).unwrap_err();
        assert_eq!(error.handling, ErrorHandling::TreatAsWithdraw);
        let error = reach(Some("0.0.0.0".parse().unwrap()))
            .validate(&families)
            .unwrap_err();
        assert_eq!(error.handling, ErrorHandling::TreatAsWithdraw);

        let eor = UpdateMsg::end_of_rib(RouteFamily::Ipv6Unicast);
        let error = eor.validate(&families).unwrap_err();
        assert_eq!(error.handling, ErrorHandling::AfiSafiDisable);
        assert!(UpdateMsg::default().validate(&families).is_ok());
    }

    #[test]
    fn shutdown_communication() {
        let msg = NotificationMsg::with_communication(
            CeaseSubcode::AdministrativeShutdown,
            "maintenance",
        );
        let (communication, rest) = msg.communication().unwrap();
        assert_eq!(communication, "maintenance");
        assert!(rest.is_empty());

        let msg = NotificationMsg::new(
            ErrorCode::Cease,
            CeaseSubcode::MaximumNumberofPrefixesReached,
        );
        assert!(msg.communication().is_none());

        let msg = NotificationMsg::with_communication(
            CeaseSubcode::PeerDeConfigured,
            "maintenance",
        );
        assert!(msg.data.is_empty());
        assert!(msg.communication().is_none());
    }
}
