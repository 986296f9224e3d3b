// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Loopback delivery engine.
//!
//! Every message a client publishes is delivered back to the same client and
//! tracked until acknowledged, which exercises the full path: framing,
//! scheduling, prefetch credit and the unacknowledged-delivery tracker.
//!
//! # Frames
//!
//! ```text
//!   client -> broker                        broker -> client
//!   0x01 PUBLISH body                       0x81 DELIVER tag(u64 BE) body
//!   0x02 ACK     tag(u64 BE) multiple(u8)
//!   0x03 REJECT  tag(u64 BE)
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hmq::delivery::Session;
use hmq::net::{FrameHandler, Outbox};
use hmq::{Error, Result};
use tracing::{debug, warn};

pub const OP_PUBLISH: u8 = 0x01;
pub const OP_ACK: u8 = 0x02;
pub const OP_REJECT: u8 = 0x03;
pub const OP_DELIVER: u8 = 0x81;

/// Broker-wide engine counters, shared by every connection.
#[derive(Debug, Default)]
pub struct EngineCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    acknowledged: AtomicU64,
    requeued: AtomicU64,
}

impl EngineCounters {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::Relaxed)
    }

    /// Rejected deliveries plus deliveries cancelled by a closing connection.
    pub fn requeued(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Per-connection engine: one session, one pending queue.
pub struct LoopbackEngine {
    peer: SocketAddr,
    session: Session<Arc<[u8]>>,
    pending: VecDeque<Arc<[u8]>>,
    batch: usize,
    counters: Arc<EngineCounters>,
}

impl LoopbackEngine {
    pub fn new(
        peer: SocketAddr,
        prefetch_limit: Option<usize>,
        batch: usize,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            peer,
            session: Session::new(prefetch_limit),
            pending: VecDeque::new(),
            batch: batch.max(1),
            counters,
        }
    }

    /// Messages published but not yet delivered.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn session(&self) -> &Session<Arc<[u8]>> {
        &self.session
    }
}

impl FrameHandler for LoopbackEngine {
    fn on_frame(&mut self, frame: Vec<u8>, _outbox: &mut Outbox) -> Result<()> {
        let (&opcode, body) = frame
            .split_first()
            .ok_or_else(|| Error::Handler("empty frame".into()))?;

        match opcode {
            OP_PUBLISH => {
                self.pending.push_back(Arc::from(body));
                EngineCounters::add(&self.counters.published, 1);
            }
            OP_ACK => {
                let (tag, multiple) = parse_ack(body)?;
                let acked = self.session.acknowledge(tag, multiple);
                EngineCounters::add(&self.counters.acknowledged, acked.len());
            }
            OP_REJECT => {
                let tag = parse_tag(body)?;
                if let Some(message) = self.session.reject(tag) {
                    self.pending.push_back(message);
                    EngineCounters::add(&self.counters.requeued, 1);
                }
            }
            other => {
                return Err(Error::Handler(format!("unknown opcode 0x{:02x}", other)));
            }
        }
        Ok(())
    }

    fn poll_pending(&mut self, outbox: &mut Outbox) -> bool {
        let mut sent = 0usize;
        while sent < self.batch && self.session.has_credit() {
            let Some(message) = self.pending.pop_front() else {
                break;
            };
            match self.session.deliver(Arc::clone(&message)) {
                Ok(tag) => {
                    outbox.push(&encode_deliver(tag, &message));
                    sent += 1;
                }
                Err(e) => {
                    warn!(peer = %self.peer, "delivery refused: {}", e);
                    self.pending.push_front(message);
                    break;
                }
            }
        }
        EngineCounters::add(&self.counters.delivered, sent);

        // Out of credit: wait for an ack to arrive as new input
        !self.pending.is_empty() && self.session.has_credit()
    }

    fn on_close(&mut self) {
        let cancelled = self.session.close();
        EngineCounters::add(&self.counters.requeued, cancelled.len());
        debug!(
            peer = %self.peer,
            cancelled = cancelled.len(),
            undelivered = self.pending.len(),
            "session closed"
        );
        self.pending.clear();
    }
}

/// `0x81 tag(u64 BE) body`
pub fn encode_deliver(tag: u64, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + 8 + body.len());
    frame.push(OP_DELIVER);
    frame.extend_from_slice(&tag.to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

fn parse_tag(body: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = body
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Handler(format!("truncated tag ({} bytes)", body.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn parse_ack(body: &[u8]) -> Result<(u64, bool)> {
    let tag = parse_tag(body)?;
    let multiple = *body
        .get(8)
        .ok_or_else(|| Error::Handler("ack missing multiple flag".into()))?;
    Ok((tag, multiple != 0))
}

// ============================================================================
// Tests
// ============================================================================
