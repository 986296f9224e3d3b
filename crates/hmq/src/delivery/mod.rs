// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Delivery bookkeeping for at-least-once semantics.
//!
//! - `tracker` - [`UnackedTracker`], the per-session map of in-flight deliveries
//! - `session` - [`Session`], tag assignment, prefetch and transactional acks
//!
//! # Lifecycle of a delivery
//!
//! ```text
//!   deliver() --> [in flight] --ack(tag)----------> gone
//!                     |      --ack(tag, multiple)-> gone (all <= tag)
//!                     |      --reject(tag)--------> requeued upstream
//!                     +------ cancel_all() -------> requeued upstream
//! ```

pub mod session;
pub mod tracker;

use std::sync::Arc;

pub use session::{AckTransaction, Session};
pub use tracker::{TrackerError, UnackedEntry, UnackedTracker, UnackedVisitor};

/// Session-scoped delivery identifier, strictly increasing, never reused while
/// the session is alive.
pub type DeliveryTag = u64;

/// Reference to a delivered message.
///
/// The tracker never owns message content, only a handle it can clone back to
/// callers on acknowledgment or cancellation. `payload_size` feeds the
/// unacknowledged byte total and must be stable for a given handle.
pub trait MessageRef: Clone + Send + Sync + 'static {
    /// Payload size in bytes (0 when unknown).
    fn payload_size(&self) -> u64 {
        0
    }
}

/// Opaque message id (e.g. a queue entry id).
impl MessageRef for u64 {}

impl MessageRef for Vec<u8> {
    fn payload_size(&self) -> u64 {
        self.len() as u64
    }
}

impl MessageRef for Arc<[u8]> {
    fn payload_size(&self) -> u64 {
        self.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_sizes() {
        assert_eq!(42u64.payload_size(), 0);
        assert_eq!(vec![0u8; 5].payload_size(), 5);
        let shared: Arc<[u8]> = Arc::from(&b"abc"[..]);
        assert_eq!(shared.payload_size(), 3);
    }
}
