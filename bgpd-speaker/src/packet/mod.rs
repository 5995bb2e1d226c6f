//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod attribute;
pub mod codec;
pub mod consts;
pub mod error;
pub mod message;
pub mod nlri;
