// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Networking collaborators of the scheduler.
//!
//! - [`connection`] - `Connection` traits, `TcpConnection`, `FrameHandler`
//! - [`frame_codec`] - 4-byte length-prefix framing
//! - [`selector`] - mio readiness thread and `ReadinessDetector`
//! - [`transport`] - listener bootstrap and lifecycle
//! - [`config`] - `TransportConfig`

pub mod config;
pub mod connection;
pub mod frame_codec;
pub mod selector;
pub mod transport;

pub use config::TransportConfig;
pub use connection::{
    Connection, ConnectionRunState, ConnectionStats, FrameHandler, Outbox, SelectableConnection,
    TcpConnection,
};
pub use frame_codec::{FrameCodec, DEFAULT_MAX_MESSAGE_SIZE, FRAME_HEADER_SIZE};
pub use selector::{
    Acceptor, ConnectionFactory, ReadinessDetector, Selector, SelectorHandle, SelectorThread,
};
pub use transport::{Transport, TransportState};
