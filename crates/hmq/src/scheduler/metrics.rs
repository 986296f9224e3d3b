// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Scheduler metrics.
//!
//! Counters for every dispatch decision plus the pool occupancy gauge the
//! workers consult when choosing between inline rerun and resubmission.
//!
//! # Example
//!
//! ```
//! use hmq::scheduler::SchedulerMetrics;
//!
//! let metrics = SchedulerMetrics::new(2);
//! metrics.record_scheduled();
//! metrics.record_inline_rerun();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.scheduled, 1);
//! assert_eq!(snapshot.inline_reruns, 1);
//! assert_eq!(snapshot.pool_size, 2);
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Metrics for one scheduler.
#[derive(Debug)]
pub struct SchedulerMetrics {
    /// Workers currently running a connection
    occupancy: AtomicUsize,

    /// Configured pool size
    pool_size: usize,

    // Dispatch decisions
    /// Successful enqueues on the pool queue (initial and resubmitted)
    scheduled: AtomicU64,

    /// Units of work rerun on the same worker because the pool was saturated
    inline_reruns: AtomicU64,

    /// Connections handed back to the pool queue with work still pending
    resubmits: AtomicU64,

    /// Connections returned to the readiness detector
    handed_back: AtomicU64,

    // Terminal outcomes
    /// Connections that reported closed (or were closed by the scheduler)
    closed: AtomicU64,

    /// Panics caught while running a connection
    worker_faults: AtomicU64,

    /// Enqueues refused after shutdown
    rejected: AtomicU64,

    start_time: Instant,
}

impl SchedulerMetrics {
    /// Create a new metrics instance.
    pub fn new(pool_size: usize) -> Self {
        Self {
            occupancy: AtomicUsize::new(0),
            pool_size,
            scheduled: AtomicU64::new(0),
            inline_reruns: AtomicU64::new(0),
            resubmits: AtomicU64::new(0),
            handed_back: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            worker_faults: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    // ========================================================================
    // Occupancy
    // ========================================================================

    pub(crate) fn enter_worker(&self) {
        self.occupancy.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn leave_worker(&self) {
        self.occupancy.fetch_sub(1, Ordering::Relaxed);
    }

    /// Workers currently running a connection.
    ///
    /// Relaxed load: the value may be stale by the time the caller acts on it.
    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::Relaxed)
    }

    /// Configured number of workers.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    // ========================================================================
    // Recording
    // ========================================================================

    pub fn record_scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo a `record_scheduled` whose enqueue then failed.
    pub(crate) fn revert_scheduled(&self) {
        self.scheduled.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_inline_rerun(&self) {
        self.inline_reruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resubmit(&self) {
        self.resubmits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handed_back(&self) {
        self.handed_back.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_fault(&self) {
        self.worker_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> SchedulerMetricsSnapshot {
        SchedulerMetricsSnapshot {
            occupancy: self.occupancy.load(Ordering::Relaxed),
            pool_size: self.pool_size,
            scheduled: self.scheduled.load(Ordering::Relaxed),
            inline_reruns: self.inline_reruns.load(Ordering::Relaxed),
            resubmits: self.resubmits.load(Ordering::Relaxed),
            handed_back: self.handed_back.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            worker_faults: self.worker_faults.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

/// Snapshot of scheduler metrics.
#[derive(Clone, Debug, Default)]
pub struct SchedulerMetricsSnapshot {
    pub occupancy: usize,
    pub pool_size: usize,
    pub scheduled: u64,
    pub inline_reruns: u64,
    pub resubmits: u64,
    pub handed_back: u64,
    pub closed: u64,
    pub worker_faults: u64,
    pub rejected: u64,
    pub uptime_secs: f64,
}

impl SchedulerMetricsSnapshot {
    /// Fraction of continuations that stayed on their worker (0.0 when none).
    pub fn inline_ratio(&self) -> f64 {
        let total = self.inline_reruns + self.resubmits;
        if total > 0 {
            self.inline_reruns as f64 / total as f64
        } else {
            0.0
        }
    }
}
