// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection I/O scheduler.
//!
//! Dispatches ready connections onto a fixed pool of worker threads. A
//! connection value is moved from the readiness detector to the pool queue and
//! from the queue to exactly one worker, so no two workers can ever run the
//! same connection and no per-connection lock is needed.
//!
//! After each unit of work the worker decides where the connection goes next
//! (see [`worker`]): back to the readiness detector when it has nothing left
//! to do, back on the queue when the pool has idle workers, or straight into
//! another unit of work on the same worker when every worker is busy. The
//! last case is the backpressure path: a busy connection never waits behind
//! a queue that no worker is free to drain.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hmq::net::{SelectableConnection, Selector};
//! use hmq::scheduler::{Scheduler, SchedulerConfig};
//!
//! fn wire<C: SelectableConnection>() -> hmq::Result<()> {
//!     let (selector, detector) = Selector::<C>::new()?;
//!     let scheduler = Arc::new(Scheduler::new(
//!         SchedulerConfig::default().with_pool_size(4),
//!         Arc::new(detector),
//!     )?);
//!     let _selector = selector.spawn(Arc::clone(&scheduler), None)?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod metrics;
mod worker;

pub use config::SchedulerConfig;
pub use metrics::{SchedulerMetrics, SchedulerMetricsSnapshot};

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::net::connection::{Connection, ConnectionRunState};
use crate::net::selector::ReadinessDetector;
use crate::{Error, Result};

/// Enqueue refused because the scheduler is closed.
///
/// Ownership of the connection goes back to the caller.
pub enum ScheduleError<C> {
    Rejected(C),
}

impl<C> ScheduleError<C> {
    /// Recover the refused connection.
    pub fn into_inner(self) -> C {
        match self {
            ScheduleError::Rejected(conn) => conn,
        }
    }
}

impl<C> fmt::Debug for ScheduleError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Rejected(..)")
    }
}

impl<C> fmt::Display for ScheduleError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheduler is closed")
    }
}

impl<C> std::error::Error for ScheduleError<C> {}

/// State shared between the scheduler handle and its workers.
pub(crate) struct Shared<C: Connection> {
    /// `None` once closed
    queue: RwLock<Option<Sender<C>>>,
    detector: Arc<dyn ReadinessDetector<C>>,
    metrics: Arc<SchedulerMetrics>,
    pool_size: usize,
}

impl<C: Connection> Shared<C> {
    fn schedule(&self, mut conn: C) -> std::result::Result<(), ScheduleError<C>> {
        let queue = self.queue.read();
        let Some(tx) = queue.as_ref() else {
            self.metrics.record_rejected();
            return Err(ScheduleError::Rejected(conn));
        };

        conn.on_run_state(ConnectionRunState::Queued);
        // Counted before the send: a worker may finish the unit before we return.
        self.metrics.record_scheduled();
        tx.send(conn).map_err(|channel::SendError(conn)| {
            // Every worker is gone while the queue is still open.
            self.metrics.revert_scheduled();
            self.metrics.record_rejected();
            ScheduleError::Rejected(conn)
        })
    }
}

/// Worker threads and the progress of joining them.
#[derive(Default)]
struct Workers {
    handles: Vec<JoinHandle<()>>,
    ids: Vec<ThreadId>,
    joining: bool,
    joined: bool,
}

/// Fixed-size worker pool driving connections.
pub struct Scheduler<C: Connection> {
    shared: Arc<Shared<C>>,
    workers: Mutex<Workers>,
    all_joined: Condvar,
}

impl<C: Connection> Scheduler<C> {
    /// Validate `config` and spawn `config.pool_size` worker threads.
    pub fn new(config: SchedulerConfig, detector: Arc<dyn ReadinessDetector<C>>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let (tx, rx) = channel::unbounded();
        let shared = Arc::new(Shared {
            queue: RwLock::new(Some(tx)),
            detector,
            metrics: Arc::new(SchedulerMetrics::new(config.pool_size)),
            pool_size: config.pool_size,
        });
        let scheduler = Self {
            shared,
            workers: Mutex::new(Workers::default()),
            all_joined: Condvar::new(),
        };

        for index in 0..config.pool_size {
            let shared = Arc::clone(&scheduler.shared);
            let queue = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, index))
                .spawn(move || worker::run(shared, queue));

            match spawned {
                Ok(handle) => {
                    let mut workers = scheduler.workers.lock();
                    workers.ids.push(handle.thread().id());
                    workers.handles.push(handle);
                }
                Err(e) => {
                    log::error!("[scheduler] failed to spawn worker {}: {}", index, e);
                    scheduler.close();
                    return Err(Error::Io(e));
                }
            }
        }

        log::debug!(
            "[scheduler] started {} workers ({})",
            config.pool_size,
            config.thread_name
        );
        Ok(scheduler)
    }

    /// Enqueue a ready connection. Never blocks.
    ///
    /// After [`close`](Self::close) the connection is handed back inside
    /// [`ScheduleError::Rejected`].
    pub fn schedule(&self, conn: C) -> std::result::Result<(), ScheduleError<C>> {
        self.shared.schedule(conn)
    }

    /// Stop accepting work, let workers drain what is already queued or
    /// running, and join them. Idempotent.
    ///
    /// Concurrent callers all return only once the workers are joined.
    /// A worker of this scheduler may call it too: that worker is never
    /// waited on and exits on its own once the queue is drained.
    pub fn close(&self) {
        let was_open = self.shared.queue.write().take().is_some();
        if was_open {
            log::debug!("[scheduler] closing, draining queued work");
        }

        let current = thread::current().id();
        let handles = {
            let mut workers = self.workers.lock();
            if workers.joining {
                // A worker waiting here could be the one being joined
                if !workers.ids.contains(&current) {
                    while !workers.joined {
                        self.all_joined.wait(&mut workers);
                    }
                }
                return;
            }
            workers.joining = true;
            std::mem::take(&mut workers.handles)
        };

        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("[scheduler] worker thread panicked");
            }
        }

        self.workers.lock().joined = true;
        self.all_joined.notify_all();
    }

    /// Check whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.queue.read().is_none()
    }

    /// Workers currently running a connection (racy).
    pub fn occupancy(&self) -> usize {
        self.shared.metrics.occupancy()
    }

    pub fn pool_size(&self) -> usize {
        self.shared.pool_size
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        Arc::clone(&self.shared.metrics)
    }
}

impl<C: Connection> Drop for Scheduler<C> {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::{Receiver, RecvTimeoutError};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    /// Scripted connection: reports pending work for `busy_units` units.
    struct MockConn {
        id: u16,
        busy_units: usize,
        units_run: Arc<AtomicUsize>,
        running: Arc<AtomicBool>,
        overlap: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
        panic_on_work: bool,
        panic_on_state_check: bool,
        /// First unit signals `started`, then waits for `go`
        gate: Option<(channel::Sender<()>, Receiver<()>)>,
        /// Signal sent when the given unit completes
        notify_after: Option<(usize, channel::Sender<()>)>,
    }

    impl MockConn {
        fn new(id: u16, busy_units: usize) -> Self {
            Self {
                id,
                busy_units,
                units_run: Arc::new(AtomicUsize::new(0)),
                running: Arc::new(AtomicBool::new(false)),
                overlap: Arc::new(AtomicBool::new(false)),
                closed: Arc::new(AtomicBool::new(false)),
                panic_on_work: false,
                panic_on_state_check: false,
                gate: None,
                notify_after: None,
            }
        }
    }

    impl Connection for MockConn {
        fn do_work(&mut self) -> bool {
            if self.running.swap(true, Ordering::SeqCst) {
                self.overlap.store(true, Ordering::SeqCst);
            }
            let unit = self.units_run.fetch_add(1, Ordering::SeqCst) + 1;

            if let Some((started, go)) = self.gate.take() {
                let _ = started.send(());
                let _ = go.recv_timeout(WAIT);
            }
            if self.panic_on_work {
                panic!("mock fault");
            }
            if let Some((at, tx)) = &self.notify_after {
                if unit == *at {
                    let _ = tx.send(());
                }
            }

            self.busy_units = self.busy_units.saturating_sub(1);
            thread::yield_now();
            self.running.store(false, Ordering::SeqCst);
            false
        }

        fn is_state_changed(&self) -> bool {
            if self.panic_on_state_check {
                panic!("mock state fault");
            }
            self.busy_units > 0
        }

        fn is_partial_read(&self) -> bool {
            false
        }

        fn remote_addr(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 10_000 + self.id))
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Readiness detector that forwards handed-back connections to the test.
    struct Collector {
        tx: channel::Sender<MockConn>,
    }

    impl ReadinessDetector<MockConn> for Collector {
        fn add_connection(&self, conn: MockConn) {
            let _ = self.tx.send(conn);
        }
    }

    fn scheduler(pool_size: usize) -> (Scheduler<MockConn>, Receiver<MockConn>) {
        let (tx, rx) = channel::unbounded();
        let config = SchedulerConfig::default()
            .with_pool_size(pool_size)
            .with_thread_name("hmq-test");
        let scheduler = Scheduler::new(config, Arc::new(Collector { tx })).unwrap();
        (scheduler, rx)
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_rejects_zero_pool() {
        let (tx, _rx) = channel::unbounded();
        let config = SchedulerConfig::default().with_pool_size(0);
        let result = Scheduler::<MockConn>::new(config, Arc::new(Collector { tx }));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_idle_connection_handed_back() {
        let (scheduler, rx) = scheduler(2);
        let conn = MockConn::new(1, 0);
        let units = Arc::clone(&conn.units_run);

        scheduler.schedule(conn).unwrap();
        let back = rx.recv_timeout(WAIT).unwrap();

        assert_eq!(back.id, 1);
        assert_eq!(units.load(Ordering::SeqCst), 1);
        let snapshot = scheduler.metrics().snapshot();
        assert_eq!(snapshot.scheduled, 1);
        assert_eq!(snapshot.handed_back, 1);
        assert_eq!(snapshot.resubmits, 0);
    }

    #[test]
    fn test_saturated_pool_reruns_inline() {
        let (scheduler, rx) = scheduler(1);
        let conn = MockConn::new(1, 5);
        let units = Arc::clone(&conn.units_run);

        scheduler.schedule(conn).unwrap();
        rx.recv_timeout(WAIT).unwrap();

        // Single worker always sees itself as the whole pool
        assert_eq!(units.load(Ordering::SeqCst), 5);
        let snapshot = scheduler.metrics().snapshot();
        assert_eq!(snapshot.scheduled, 1);
        assert_eq!(snapshot.inline_reruns, 4);
        assert_eq!(snapshot.resubmits, 0);
    }

    #[test]
    fn test_spare_capacity_resubmits() {
        let (scheduler, rx) = scheduler(4);
        let conn = MockConn::new(1, 5);
        let units = Arc::clone(&conn.units_run);

        scheduler.schedule(conn).unwrap();
        rx.recv_timeout(WAIT).unwrap();

        assert_eq!(units.load(Ordering::SeqCst), 5);
        let snapshot = scheduler.metrics().snapshot();
        assert_eq!(snapshot.scheduled, 5);
        assert_eq!(snapshot.resubmits, 4);
        assert_eq!(snapshot.inline_reruns, 0);
    }

    #[test]
    fn test_busy_connection_does_not_starve_pool() {
        let (scheduler, rx) = scheduler(2);

        // B holds the second worker until A has run ten units
        let (started_tx, started_rx) = channel::bounded(1);
        let (go_tx, go_rx) = channel::bounded(1);
        let mut b = MockConn::new(2, 0);
        b.gate = Some((started_tx, go_rx));
        let b_units = Arc::clone(&b.units_run);

        let mut a = MockConn::new(1, 20);
        a.notify_after = Some((10, go_tx));
        let a_units = Arc::clone(&a.units_run);

        scheduler.schedule(b).unwrap();
        started_rx.recv_timeout(WAIT).unwrap();
        scheduler.schedule(a).unwrap();

        let mut returned: Vec<u16> = (0..2).map(|_| rx.recv_timeout(WAIT).unwrap().id).collect();
        returned.sort_unstable();
        assert_eq!(returned, vec![1, 2]);

        assert_eq!(a_units.load(Ordering::SeqCst), 20);
        assert_eq!(b_units.load(Ordering::SeqCst), 1);
        // While B held its worker, every continuation of A stayed inline
        assert!(scheduler.metrics().snapshot().inline_reruns >= 9);
    }

    #[test]
    fn test_never_runs_connection_concurrently() {
        let (scheduler, rx) = scheduler(4);
        let mut overlaps = Vec::new();
        let mut total = 0;

        for id in 0..16 {
            let conn = MockConn::new(id, (id as usize % 5) + 1);
            overlaps.push(Arc::clone(&conn.overlap));
            total += 1;
            scheduler.schedule(conn).unwrap();
        }

        // Simulate readiness: reschedule every returning connection a few times
        let mut rounds = vec![0u8; 16];
        while total > 0 {
            let mut conn = rx.recv_timeout(WAIT).unwrap();
            let round = &mut rounds[conn.id as usize];
            *round += 1;
            if *round < 4 {
                conn.busy_units = 3;
                scheduler.schedule(conn).unwrap();
            } else {
                total -= 1;
            }
        }

        assert!(overlaps.iter().all(|o| !o.load(Ordering::SeqCst)));
    }

    #[test]
    fn test_panic_is_contained() {
        let (scheduler, rx) = scheduler(1);

        let mut faulty = MockConn::new(1, 3);
        faulty.panic_on_work = true;
        let faulty_closed = Arc::clone(&faulty.closed);
        scheduler.schedule(faulty).unwrap();

        // The single worker survives and keeps serving
        scheduler.schedule(MockConn::new(2, 0)).unwrap();
        let back = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(back.id, 2);

        assert!(faulty_closed.load(Ordering::SeqCst));
        let snapshot = scheduler.metrics().snapshot();
        assert_eq!(snapshot.worker_faults, 1);
        assert_eq!(snapshot.closed, 1);
        // Never rescheduled or handed back
        assert_eq!(snapshot.handed_back, 1);
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(50)),
            Err(RecvTimeoutError::Timeout)
        ));
    }

    #[test]
    fn test_panic_in_state_check_closes_connection() {
        let (scheduler, rx) = scheduler(1);

        let mut faulty = MockConn::new(1, 0);
        faulty.panic_on_state_check = true;
        let closed = Arc::clone(&faulty.closed);
        scheduler.schedule(faulty).unwrap();
        scheduler.close();

        assert!(closed.load(Ordering::SeqCst));
        let snapshot = scheduler.metrics().snapshot();
        assert_eq!(snapshot.worker_faults, 1);
        assert_eq!(snapshot.closed, 1);
        assert_eq!(snapshot.handed_back, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_failed_enqueue_not_counted_as_scheduled() {
        let (detector_tx, _detector_rx) = channel::unbounded();
        let (tx, rx) = channel::unbounded::<MockConn>();
        drop(rx);
        let shared = Shared {
            queue: RwLock::new(Some(tx)),
            detector: Arc::new(Collector { tx: detector_tx }),
            metrics: Arc::new(SchedulerMetrics::new(1)),
            pool_size: 1,
        };

        let conn = shared.schedule(MockConn::new(3, 0)).unwrap_err().into_inner();
        assert_eq!(conn.id, 3);
        let snapshot = shared.metrics.snapshot();
        assert_eq!(snapshot.scheduled, 0);
        assert_eq!(snapshot.rejected, 1);
    }

    #[test]
    fn test_concurrent_close_waits_for_drain() {
        let (scheduler, rx) = scheduler(1);
        let scheduler = Arc::new(scheduler);

        let (started_tx, started_rx) = channel::bounded(1);
        let (go_tx, go_rx) = channel::bounded(1);
        let mut conn = MockConn::new(1, 0);
        conn.gate = Some((started_tx, go_rx));
        scheduler.schedule(conn).unwrap();
        started_rx.recv_timeout(WAIT).unwrap();

        // Both callers must observe the finished unit once close returns
        let closers: Vec<_> = (0..2)
            .map(|_| {
                let scheduler = Arc::clone(&scheduler);
                thread::spawn(move || {
                    scheduler.close();
                    scheduler.occupancy()
                })
            })
            .collect();
        wait_for(|| scheduler.is_closed());
        thread::sleep(Duration::from_millis(20));
        go_tx.send(()).unwrap();

        for closer in closers {
            assert_eq!(closer.join().unwrap(), 0);
        }
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_schedule_after_close_rejected() {
        let (scheduler, _rx) = scheduler(2);
        scheduler.close();
        assert!(scheduler.is_closed());

        let conn = MockConn::new(7, 0);
        let units = Arc::clone(&conn.units_run);
        let rejected = scheduler.schedule(conn).unwrap_err();

        let conn = rejected.into_inner();
        assert_eq!(conn.id, 7);
        assert_eq!(units.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.metrics().snapshot().rejected, 1);

        // Idempotent
        scheduler.close();
    }

    #[test]
    fn test_close_drains_queued_work() {
        let (scheduler, rx) = scheduler(1);
        let counters: Vec<_> = (0..3)
            .map(|id| {
                let conn = MockConn::new(id, 2);
                let units = Arc::clone(&conn.units_run);
                scheduler.schedule(conn).unwrap();
                units
            })
            .collect();

        scheduler.close();

        for units in &counters {
            assert_eq!(units.load(Ordering::SeqCst), 2);
        }
        assert_eq!(rx.try_iter().count(), 3);
    }

    #[test]
    fn test_resubmit_after_close_closes_connection() {
        let (scheduler, rx) = scheduler(2);
        let scheduler = Arc::new(scheduler);

        let (started_tx, started_rx) = channel::bounded(1);
        let (go_tx, go_rx) = channel::bounded(1);
        let mut conn = MockConn::new(1, 3);
        conn.gate = Some((started_tx, go_rx));
        let closed = Arc::clone(&conn.closed);

        scheduler.schedule(conn).unwrap();
        started_rx.recv_timeout(WAIT).unwrap();

        let closer = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || scheduler.close())
        };
        wait_for(|| scheduler.is_closed());
        go_tx.send(()).unwrap();
        closer.join().unwrap();

        assert!(closed.load(Ordering::SeqCst));
        let snapshot = scheduler.metrics().snapshot();
        assert_eq!(snapshot.resubmits, 1);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.closed, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_occupancy_returns_to_zero() {
        let (scheduler, rx) = scheduler(3);
        for id in 0..6 {
            scheduler.schedule(MockConn::new(id, 3)).unwrap();
        }
        for _ in 0..6 {
            rx.recv_timeout(WAIT).unwrap();
        }
        wait_for(|| scheduler.occupancy() == 0);
        assert_eq!(scheduler.pool_size(), 3);
    }
}
