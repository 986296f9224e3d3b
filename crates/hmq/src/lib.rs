// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HMQ - message broker connection core
//!
//! The I/O scheduling and delivery bookkeeping core of a message broker:
//! many concurrent client connections multiplexed over a fixed pool of worker
//! threads, with at-least-once delivery tracked per session.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hmq::net::{FrameHandler, Outbox, Transport, TransportConfig};
//!
//! struct Echo;
//!
//! impl FrameHandler for Echo {
//!     fn on_frame(&mut self, frame: Vec<u8>, outbox: &mut Outbox) -> hmq::Result<()> {
//!         outbox.push(&frame);
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> hmq::Result<()> {
//!     let transport = Transport::start(TransportConfig::default().with_port(5672), |_| Echo)?;
//!     println!("listening on {}", transport.local_addr());
//!     transport.shutdown()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |   Selector thread (mio)                                             |
//! |   listener accept | parked connections | waker for hand-backs       |
//! +---------------------------------------------------------------------+
//! |   Scheduler: pool queue -> N workers                                |
//! |   per unit of work: closed | hand back | resubmit | rerun inline    |
//! +---------------------------------------------------------------------+
//! |   Connection: read budget | frame codec | FrameHandler | outbox     |
//! +---------------------------------------------------------------------+
//! |   Session: delivery tags | prefetch | UnackedTracker                |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`scheduler`] - worker pool and dispatch algorithm
//! - [`delivery`] - unacknowledged-delivery tracker and sessions
//! - [`net`] - connections, framing, selector, transport bootstrap
//! - [`error`] - crate error type

/// Crate-wide error type.
pub mod error;
/// Unacknowledged-delivery tracking and session glue.
pub mod delivery;
/// Connections, framing, readiness detection and transport bootstrap.
pub mod net;
/// Connection I/O scheduler (fixed worker pool).
pub mod scheduler;

pub use delivery::{DeliveryTag, MessageRef, Session, UnackedTracker};
pub use error::{Error, Result};
pub use net::{Connection, Transport, TransportConfig};
pub use scheduler::{ScheduleError, Scheduler, SchedulerConfig};
