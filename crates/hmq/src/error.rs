// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error type.
//!
//! Faults intrinsic to one connection never surface here: the scheduler
//! contains them. What does surface is configuration and I/O failure at
//! bootstrap, tracker invariant violations, and session-level refusals.

use crate::delivery::DeliveryTag;

/// HMQ error type.
///
/// # Example
///
/// ```
/// use hmq::delivery::UnackedTracker;
/// use hmq::Error;
///
/// let tracker: UnackedTracker<u64> = UnackedTracker::new();
/// tracker.add(1, 10).unwrap();
///
/// match tracker.add(1, 11).map_err(Error::from) {
///     Err(Error::DuplicateTag(tag)) => assert_eq!(tag, 1),
///     other => panic!("unexpected: {:?}", other),
/// }
/// ```
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration / lifecycle
    // ========================================================================
    /// Configuration rejected by `validate()`.
    InvalidConfig(String),
    /// Operation not allowed in the current lifecycle state.
    InvalidState(String),

    // ========================================================================
    // Transport
    // ========================================================================
    /// I/O error with underlying cause.
    Io(std::io::Error),
    /// Inbound frame length exceeds the configured maximum.
    FrameTooLarge {
        /// Announced payload length
        len: usize,
        /// Configured maximum
        max: usize,
    },
    /// Protocol engine refused a frame.
    Handler(String),

    // ========================================================================
    // Delivery
    // ========================================================================
    /// Tag is already outstanding in the tracker.
    DuplicateTag(DeliveryTag),
    /// Session has reached its prefetch limit.
    PrefetchExhausted,
    /// Session was closed.
    SessionClosed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::FrameTooLarge { len, max } => {
                write!(f, "Frame too large: {} bytes (max {})", len, max)
            }
            Error::Handler(msg) => write!(f, "Handler error: {}", msg),
            Error::DuplicateTag(tag) => write!(f, "Delivery tag {} already outstanding", tag),
            Error::PrefetchExhausted => write!(f, "Prefetch limit reached"),
            Error::SessionClosed => write!(f, "Session closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenient alias for API results using the public `Error` type.
pub type Result<T> = core::result::Result<T, Error>;
