//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod af;
pub mod config;
pub mod debug;
pub mod error;
pub mod fsm;
pub mod network;
pub mod packet;
pub mod path;
pub mod peer;
pub mod policy;
pub mod rib;
pub mod server;
pub mod tasks;
pub mod validation;
