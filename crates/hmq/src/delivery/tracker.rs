// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Unacknowledged-delivery tracker.
//!
//! Thread-safe ordered map from delivery tag to in-flight message. The key set
//! is exactly the tags that were delivered and not yet acknowledged, removed
//! or cancelled. Every operation takes the lock once, so each call is atomic
//! with respect to every other call.
//!
//! In normal operation only the worker currently running the owning
//! connection mutates a tracker; the lock is there for out-of-band readers
//! (monitoring, inspection) that may run concurrently.
//!
//! # Example
//!
//! ```
//! use hmq::delivery::UnackedTracker;
//!
//! let tracker: UnackedTracker<Vec<u8>> = UnackedTracker::new();
//! for tag in 1..=4 {
//!     tracker.add(tag, vec![0u8; 8]).unwrap();
//! }
//!
//! let acked = tracker.acknowledge(2, true);
//! assert_eq!(acked.iter().map(|e| e.tag).collect::<Vec<_>>(), vec![1, 2]);
//! assert_eq!(tracker.delivery_tags(), vec![3, 4]);
//! assert_eq!(tracker.unacknowledged_bytes(), 16);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;

use super::{DeliveryTag, MessageRef};

/// One in-flight delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnackedEntry<M> {
    pub tag: DeliveryTag,
    pub message: M,
}

/// Tracker invariant violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerError {
    /// `add` called with a tag that is already outstanding.
    DuplicateTag(DeliveryTag),
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::DuplicateTag(tag) => {
                write!(f, "Delivery tag {} already outstanding", tag)
            }
        }
    }
}

impl std::error::Error for TrackerError {}

impl From<TrackerError> for crate::Error {
    fn from(e: TrackerError) -> Self {
        match e {
            TrackerError::DuplicateTag(tag) => crate::Error::DuplicateTag(tag),
        }
    }
}

/// Visitor over outstanding entries, in tag-ascending order.
///
/// Closures `FnMut(DeliveryTag, &M) -> bool` implement this trait directly.
pub trait UnackedVisitor<M> {
    /// Called once per entry. Return `true` to stop iterating.
    fn visit(&mut self, tag: DeliveryTag, message: &M) -> bool;

    /// Called after the last visited entry, whether iteration ran to the end
    /// or was stopped early.
    fn visit_complete(&mut self) {}
}

impl<M, F> UnackedVisitor<M> for F
where
    F: FnMut(DeliveryTag, &M) -> bool,
{
    fn visit(&mut self, tag: DeliveryTag, message: &M) -> bool {
        self(tag, message)
    }
}

struct Inner<M> {
    map: BTreeMap<DeliveryTag, M>,
    bytes: u64,
}

impl<M: MessageRef> Inner<M> {
    fn take(&mut self, tag: DeliveryTag) -> Option<M> {
        let message = self.map.remove(&tag)?;
        self.bytes = self.bytes.saturating_sub(message.payload_size());
        Some(message)
    }

    /// Detach every entry with key <= `tag`. Does not assume the removed keys
    /// form a contiguous range.
    fn take_through(&mut self, tag: DeliveryTag) -> BTreeMap<DeliveryTag, M> {
        let removed = match tag.checked_add(1) {
            Some(bound) => {
                let kept = self.map.split_off(&bound);
                std::mem::replace(&mut self.map, kept)
            }
            None => std::mem::take(&mut self.map),
        };
        let freed: u64 = removed.values().map(MessageRef::payload_size).sum();
        self.bytes = self.bytes.saturating_sub(freed);
        removed
    }
}

/// Per-session map of delivered-but-unacknowledged messages.
pub struct UnackedTracker<M> {
    inner: Mutex<Inner<M>>,
}

impl<M: MessageRef> UnackedTracker<M> {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: BTreeMap::new(),
                bytes: 0,
            }),
        }
    }

    /// Record a new delivery.
    ///
    /// A tag that is already present is an upstream bug: the call fails and
    /// the existing entry is left as it was.
    pub fn add(&self, tag: DeliveryTag, message: M) -> Result<(), TrackerError> {
        let mut inner = self.inner.lock();
        if inner.map.contains_key(&tag) {
            log::debug!("[tracker] duplicate delivery tag {}", tag);
            return Err(TrackerError::DuplicateTag(tag));
        }
        inner.bytes = inner.bytes.saturating_add(message.payload_size());
        inner.map.insert(tag, message);
        Ok(())
    }

    /// Look up an outstanding delivery.
    pub fn get(&self, tag: DeliveryTag) -> Option<M> {
        self.inner.lock().map.get(&tag).cloned()
    }

    /// Remove one delivery outside of acknowledgment (requeue, expiry).
    pub fn remove(&self, tag: DeliveryTag) -> Option<M> {
        self.inner.lock().take(tag)
    }

    /// Acknowledge `tag`, or every outstanding tag `<= tag` when `multiple`.
    ///
    /// Returns the removed entries in ascending tag order. An absent tag is
    /// not an error: the result is simply empty.
    pub fn acknowledge(&self, tag: DeliveryTag, multiple: bool) -> Vec<UnackedEntry<M>> {
        let mut inner = self.inner.lock();
        if multiple {
            inner
                .take_through(tag)
                .into_iter()
                .map(|(tag, message)| UnackedEntry { tag, message })
                .collect()
        } else {
            inner
                .take(tag)
                .map(|message| UnackedEntry { tag, message })
                .into_iter()
                .collect()
        }
    }

    /// Add to `out` the entries `acknowledge(tag, multiple)` would remove,
    /// without removing them.
    pub fn collect<E>(&self, tag: DeliveryTag, multiple: bool, out: &mut E)
    where
        E: Extend<(DeliveryTag, M)>,
    {
        let selected: Vec<(DeliveryTag, M)> = {
            let inner = self.inner.lock();
            if multiple {
                inner
                    .map
                    .range(..=tag)
                    .map(|(tag, message)| (*tag, message.clone()))
                    .collect()
            } else {
                inner
                    .map
                    .get(&tag)
                    .map(|message| (tag, message.clone()))
                    .into_iter()
                    .collect()
            }
        };
        out.extend(selected);
    }

    /// Remove a previously collected set of tags. Absent tags are skipped.
    pub fn remove_all<I>(&self, tags: I) -> Vec<UnackedEntry<M>>
    where
        I: IntoIterator<Item = DeliveryTag>,
    {
        let mut inner = self.inner.lock();
        let mut removed: Vec<UnackedEntry<M>> = tags
            .into_iter()
            .filter_map(|tag| inner.take(tag).map(|message| UnackedEntry { tag, message }))
            .collect();
        removed.sort_by_key(|entry| entry.tag);
        removed
    }

    /// Visit every outstanding entry in ascending tag order.
    ///
    /// Iterates over a snapshot taken at the start of the call, so the visitor
    /// may call back into the tracker; concurrent changes are not observed.
    pub fn visit<V>(&self, visitor: &mut V)
    where
        V: UnackedVisitor<M> + ?Sized,
    {
        let snapshot: Vec<(DeliveryTag, M)> = {
            let inner = self.inner.lock();
            inner
                .map
                .iter()
                .map(|(tag, message)| (*tag, message.clone()))
                .collect()
        };

        for (tag, message) in &snapshot {
            if visitor.visit(*tag, message) {
                break;
            }
        }
        visitor.visit_complete();
    }

    /// Drain the tracker, returning every in-flight message (ascending tag
    /// order) so it can be requeued upstream.
    pub fn cancel_all_messages(&self) -> Vec<M> {
        let drained = {
            let mut inner = self.inner.lock();
            inner.bytes = 0;
            std::mem::take(&mut inner.map)
        };
        if !drained.is_empty() {
            log::debug!("[tracker] cancelled {} in-flight deliveries", drained.len());
        }
        drained.into_values().collect()
    }

    /// Number of outstanding deliveries.
    pub fn size(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Check whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    /// Forget every outstanding delivery without returning it.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.bytes = 0;
    }

    /// Outstanding tags, ascending.
    pub fn delivery_tags(&self) -> Vec<DeliveryTag> {
        self.inner.lock().map.keys().copied().collect()
    }

    /// Summed payload size of outstanding deliveries.
    pub fn unacknowledged_bytes(&self) -> u64 {
        self.inner.lock().bytes
    }
}

impl<M: MessageRef> Default for UnackedTracker<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MessageRef> fmt::Debug for UnackedTracker<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("UnackedTracker")
            .field("size", &inner.map.len())
            .field("bytes", &inner.bytes)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
