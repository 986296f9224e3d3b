// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-session delivery state: tag counter, prefetch credit and the tracker.
//!
//! A protocol engine owns one `Session` per consumer session and calls it from
//! the worker that is currently running the connection. The tracker is shared
//! behind an `Arc` so monitoring code can inspect it concurrently.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{DeliveryTag, MessageRef, UnackedEntry, UnackedTracker};
use crate::{Error, Result};

/// Delivery state of one consumer session.
pub struct Session<M: MessageRef> {
    tracker: Arc<UnackedTracker<M>>,
    next_tag: DeliveryTag,
    prefetch_limit: Option<usize>,
    closed: bool,
}

impl<M: MessageRef> Session<M> {
    /// Create a session. `None` means unlimited prefetch.
    pub fn new(prefetch_limit: Option<usize>) -> Self {
        Self {
            tracker: Arc::new(UnackedTracker::new()),
            next_tag: 1,
            prefetch_limit,
            closed: false,
        }
    }

    /// Track `message` under the next delivery tag and return the tag.
    pub fn deliver(&mut self, message: M) -> Result<DeliveryTag> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        if !self.has_credit() {
            return Err(Error::PrefetchExhausted);
        }

        let tag = self.next_tag;
        self.tracker.add(tag, message)?;
        self.next_tag += 1;
        Ok(tag)
    }

    /// Check whether another delivery fits under the prefetch limit.
    pub fn has_credit(&self) -> bool {
        !self.closed
            && self
                .prefetch_limit
                .map_or(true, |limit| self.tracker.size() < limit)
    }

    /// Acknowledge one tag, or every tag `<= tag` when `multiple`.
    pub fn acknowledge(&self, tag: DeliveryTag, multiple: bool) -> Vec<UnackedEntry<M>> {
        self.tracker.acknowledge(tag, multiple)
    }

    /// Withdraw a delivery so the caller can requeue it.
    pub fn reject(&self, tag: DeliveryTag) -> Option<M> {
        self.tracker.remove(tag)
    }

    /// Start collecting acknowledgments that only take effect on commit.
    pub fn begin_transaction(&self) -> AckTransaction<'_, M> {
        AckTransaction {
            tracker: &self.tracker,
            pending: BTreeMap::new(),
        }
    }

    /// Shared tracker, for out-of-band inspection.
    pub fn tracker(&self) -> &Arc<UnackedTracker<M>> {
        &self.tracker
    }

    /// Tag the next delivery will receive.
    pub fn next_tag(&self) -> DeliveryTag {
        self.next_tag
    }

    pub fn prefetch_limit(&self) -> Option<usize> {
        self.prefetch_limit
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the session and return every in-flight message for requeue.
    /// A second call returns nothing.
    pub fn close(&mut self) -> Vec<M> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        self.tracker.cancel_all_messages()
    }
}

impl<M: MessageRef> std::fmt::Debug for Session<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("next_tag", &self.next_tag)
            .field("prefetch_limit", &self.prefetch_limit)
            .field("unacked", &self.tracker.size())
            .field("closed", &self.closed)
            .finish()
    }
}

/// Acknowledgments staged inside a transaction.
///
/// Dropping the transaction without `commit` discards it.
pub struct AckTransaction<'a, M: MessageRef> {
    tracker: &'a UnackedTracker<M>,
    pending: BTreeMap<DeliveryTag, M>,
}

impl<M: MessageRef> AckTransaction<'_, M> {
    /// Stage an acknowledgment. The tracker is not modified.
    pub fn ack(&mut self, tag: DeliveryTag, multiple: bool) {
        self.tracker.collect(tag, multiple, &mut self.pending);
    }

    /// Number of staged deliveries.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Apply the staged acknowledgments. Tags removed from the tracker since
    /// they were staged are skipped.
    pub fn commit(self) -> Vec<UnackedEntry<M>> {
        let tags: Vec<DeliveryTag> = self.pending.into_keys().collect();
        self.tracker.remove_all(tags)
    }

    /// Discard the staged acknowledgments.
    pub fn rollback(self) {}
}
