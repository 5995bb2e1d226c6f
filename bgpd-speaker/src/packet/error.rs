//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::packet::consts::{
    ErrorCode, MessageHeaderErrorSubcode, UpdateMessageErrorSubcode,
};

// How a protocol error is recovered from (RFC 7606).
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum ErrorHandling {
    None,
    AttributeDiscard,
    TreatAsWithdraw,
    AfiSafiDisable,
    SessionReset,
}

// Protocol error detected while decoding or validating a BGP message.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MessageError {
    pub code: ErrorCode,
    pub subcode: u8,
    pub data: Vec<u8>,
    pub handling: ErrorHandling,
    pub reason: String,
}

// ===== impl MessageError =====

impl MessageError {
    pub fn new(
        code: ErrorCode,
        subcode: impl ToPrimitive,
        handling: ErrorHandling,
        reason: impl Into<String>,
    ) -> MessageError {
        MessageError {
            code,
            subcode: subcode.to_u8().unwrap_or(0),
            data: Vec::new(),
            handling,
            reason: reason.into(),
        }
    }

    // Error that can't be recovered from.
    pub fn session_reset(
        code: ErrorCode,
        subcode: impl ToPrimitive,
        reason: impl Into<String>,
    ) -> MessageError {
        MessageError::new(code, subcode, ErrorHandling::SessionReset, reason)
    }

    pub fn bad_message_length(len: usize) -> MessageError {
        let mut error = MessageError::session_reset(
            ErrorCode::MessageHeaderError,
            MessageHeaderErrorSubcode::BadMessageLength,
            format!("invalid message length: {len}"),
        );
        error.data = (len as u16).to_be_bytes().to_vec();
        error
    }

    pub fn malformed_update(
        subcode: UpdateMessageErrorSubcode,
        handling: ErrorHandling,
        reason: impl Into<String>,
    ) -> MessageError {
        MessageError::new(
            ErrorCode::UpdateMessageError,
            subcode,
            handling,
            reason,
        )
    }
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} (subcode {}): {}",
            self.code, self.subcode, self.reason
        )
    }
}

impl std::error::Error for MessageError {}
