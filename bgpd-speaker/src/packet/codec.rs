//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use bytes::{BufMut, Bytes, BytesMut};

use crate::af::{AddPathMode, RouteFamily};
use crate::packet::consts::{AS_TRANS, ErrorCode, MessageHeaderErrorSubcode};
use crate::packet::error::MessageError;
use crate::packet::message::{Message, NlriEntry};

// Session state that influences how messages are encoded and decoded.
//
// It's updated once the OPEN messages are exchanged and before the first
// UPDATE can possibly be received.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CodecCxt {
    pub four_byte_asn: bool,
    pub add_path: BTreeMap<RouteFamily, AddPathMode>,
}

// Context shared between a session's read and write tasks.
pub type SharedCodecCxt = Arc<RwLock<CodecCxt>>;

// BGP message codec.
//
// The core only exchanges fully decoded messages; framing and attribute
// encoding are delegated to an implementation of this trait.
pub trait MessageCodec: std::fmt::Debug + Send + Sync + 'static {
    // Returns the length of the first complete message in `data`, or `None`
    // if more data is needed.
    fn message_len(&self, data: &[u8]) -> Result<Option<usize>, MessageError>;

    // Decodes a single complete message.
    fn decode(
        &self,
        data: &[u8],
        cxt: &CodecCxt,
    ) -> Result<Message, MessageError>;

    // Encodes a single message.
    fn encode(&self, msg: &Message, cxt: &CodecCxt) -> Bytes;
}

// Length-prefixed JSON codec.
//
// Each message is a 4-byte big-endian length followed by the JSON document of
// the message.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

// ===== impl CodecCxt =====

impl CodecCxt {
    pub fn add_path_mode(&self, family: RouteFamily) -> AddPathMode {
        self.add_path.get(&family).copied().unwrap_or_default()
    }
}

// ===== impl JsonCodec =====

impl JsonCodec {
    const HDR_LEN: usize = 4;
    const MAX_LEN: usize = 1 << 20;
}

impl MessageCodec for JsonCodec {
    fn message_len(&self, data: &[u8]) -> Result<Option<usize>, MessageError> {
        let Some(hdr) = data.get(..Self::HDR_LEN) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]) as usize;
        if len == 0 || len > Self::MAX_LEN {
            return Err(MessageError::bad_message_length(len));
        }
        let total = Self::HDR_LEN + len;
        if data.len() < total {
            return Ok(None);
        }
        Ok(Some(total))
    }

    fn decode(
        &self,
        data: &[u8],
        cxt: &CodecCxt,
    ) -> Result<Message, MessageError> {
        let body = data.get(Self::HDR_LEN..).unwrap_or_default();
        let mut msg =
            serde_json::from_slice::<Message>(body).map_err(|error| {
                MessageError::session_reset(
                    ErrorCode::MessageHeaderError,
                    MessageHeaderErrorSubcode::BadMessageType,
                    error.to_string(),
                )
            })?;

        // Path identifiers are only present for families where ADD-PATH
        // receive was negotiated.
        if let Message::Update(update) = &mut msg {
            if let Some(reach) = &mut update.reach {
                let mode = cxt.add_path_mode(reach.family);
                clear_path_ids(&mut reach.prefixes, mode, AddPathMode::RECEIVE);
            }
            if let Some(unreach) = &mut update.unreach {
                let mode = cxt.add_path_mode(unreach.family);
                clear_path_ids(
                    &mut unreach.prefixes,
                    mode,
                    AddPathMode::RECEIVE,
                );
            }
        }

        Ok(msg)
    }

    fn encode(&self, msg: &Message, cxt: &CodecCxt) -> Bytes {
        let mut msg = msg.clone();
        if let Message::Update(update) = &mut msg {
            if let Some(reach) = &mut update.reach {
                let mode = cxt.add_path_mode(reach.family);
                clear_path_ids(&mut reach.prefixes, mode, AddPathMode::SEND);
            }
            if let Some(unreach) = &mut update.unreach {
                let mode = cxt.add_path_mode(unreach.family);
                clear_path_ids(&mut unreach.prefixes, mode, AddPathMode::SEND);
            }

            // Without 4-octet AS support, ASNs that don't fit in two octets
            // are replaced by AS_TRANS.
            if !cxt.four_byte_asn
                && let Some(attrs) = &mut update.attrs
            {
                for segment in attrs.base.as_path.segments.iter_mut() {
                    for member in segment.members.iter_mut() {
                        if *member > u16::MAX as u32 {
                            *member = AS_TRANS as u32;
                        }
                    }
                }
            }
        }

        // Serializing plain data structures can't fail.
        let body = serde_json::to_vec(&msg).unwrap_or_default();
        let mut buf = BytesMut::with_capacity(Self::HDR_LEN + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        buf.freeze()
    }
}

// ===== helper functions =====

fn clear_path_ids(
    prefixes: &mut [NlriEntry],
    mode: AddPathMode,
    required: AddPathMode,
) {
    if mode.contains(required) {
        return;
    }
    for entry in prefixes {
        entry.path_id = 0;
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::message::{KeepaliveMsg, MpReachNlri, UpdateMsg};
    use crate::packet::nlri::Nlri;

    fn update(path_id: u32) -> Message {
        Message::Update(UpdateMsg {
            reach: Some(MpReachNlri {
                family: RouteFamily::Ipv4Unicast,
                prefixes: vec![NlriEntry {
                    path_id,
                    nlri: Nlri::Ipv4Unicast("10.0.0.0/8".parse().unwrap()),
                }],
            }),
            unreach: None,
            attrs: None,
        })
    }

    #[test]
    fn partial_and_complete_frames() {
        let codec = JsonCodec;
        let cxt = CodecCxt::default();
        let buf = codec.encode(&Message::Keepalive(KeepaliveMsg {}), &cxt);

        assert_eq!(codec.message_len(&buf[..3]), Ok(None));
        assert_eq!(codec.message_len(&buf[..buf.len() - 1]), Ok(None));
        assert_eq!(codec.message_len(&buf), Ok(Some(buf.len())));
        assert_eq!(
            codec.decode(&buf, &cxt),
            Ok(Message::Keepalive(KeepaliveMsg {}))
        );
    }

    #[test]
    fn oversized_frame() {
        let codec = JsonCodec;
        let buf = u32::MAX.to_be_bytes();
        assert!(codec.message_len(&buf).is_err());
    }

    #[test]
    fn path_ids_follow_add_path() {
        let codec = JsonCodec;
        let mut cxt = CodecCxt::default();

        let buf = codec.encode(&update(7), &cxt);
        let msg = codec.decode(&buf, &cxt).unwrap();
        assert_eq!(msg, update(0));

        cxt.add_path.insert(
            RouteFamily::Ipv4Unicast,
            AddPathMode::SEND | AddPathMode::RECEIVE,
        );
        let buf = codec.encode(&update(7), &cxt);
        let msg = codec.decode(&buf, &cxt).unwrap();
        assert_eq!(msg, update(7));
    }

    #[test]
    fn garbage_is_rejected() {
        let codec = JsonCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(b"{]}");
        let error = codec.decode(&buf, &CodecCxt::default()).unwrap_err();
        assert_eq!(error.code, ErrorCode::MessageHeaderError);
    }
}
