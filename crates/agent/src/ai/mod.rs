// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The inference path: wire protocol, TCP client, and the engine that sits
//! between frame capture and the event bus.

pub mod client;
pub mod engine;
pub mod wire;

/// Generated protocol types.
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/infer.v1.rs"));
}
