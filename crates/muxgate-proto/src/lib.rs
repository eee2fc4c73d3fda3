// SPDX-License-Identifier: Apache-2.0
//! Generated prost/tonic types for the agent stream wire protocol.
//!
//! The message shapes mirror the frame vocabulary one-for-one; see
//! `proto/agent.proto` for the authoritative definitions.

pub mod v1 {
    tonic::include_proto!("muxgate.agent.v1");
}

pub use v1::*;
