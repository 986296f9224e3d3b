// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker loop and the per-connection dispatch algorithm.
//!
//! A worker dequeues a connection, which it then owns exclusively, and runs
//! units of work on it until one of three things happens:
//!
//! ```text
//!   do_work() == true (closed)           -> drop it
//!   no state change, no partial read     -> hand back to the readiness detector
//!   more work pending, pool has capacity -> resubmit to the pool queue
//!   more work pending, pool saturated    -> run again on this worker
//! ```

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam::channel::Receiver;

use super::{ScheduleError, Shared};
use crate::net::connection::{Connection, ConnectionRunState};

/// Keeps the occupancy gauge raised while a connection runs on this worker.
struct OccupancyGuard<'a, C: Connection> {
    shared: &'a Shared<C>,
}

impl<'a, C: Connection> OccupancyGuard<'a, C> {
    fn enter(shared: &'a Shared<C>) -> Self {
        shared.metrics.enter_worker();
        Self { shared }
    }
}

impl<C: Connection> Drop for OccupancyGuard<'_, C> {
    fn drop(&mut self) {
        self.shared.metrics.leave_worker();
    }
}

/// Worker thread body: runs until the pool queue is closed and drained.
pub(super) fn run<C: Connection>(shared: Arc<Shared<C>>, queue: Receiver<C>) {
    while let Ok(conn) = queue.recv() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatch(&shared, conn)));
        if let Err(payload) = outcome {
            // Panicked in the detector or the queue after the connection
            // left this worker; its owner dropped it during the unwind.
            shared.metrics.record_worker_fault();
            log::error!(
                "[scheduler] hand-off panicked, connection dropped: {}",
                panic_message(&*payload)
            );
        }
    }
    log::debug!("[scheduler] worker exiting");
}

/// Run one dequeued connection until it leaves this worker.
fn dispatch<C: Connection>(shared: &Shared<C>, mut conn: C) {
    let _occupied = OccupancyGuard::enter(shared);
    if !set_run_state(shared, &mut conn, ConnectionRunState::Running) {
        shared.metrics.record_closed();
        return;
    }

    loop {
        match run_unit(shared, &mut conn) {
            Outcome::Closed => {
                shared.metrics.record_closed();
                return;
            }
            Outcome::Idle => {
                if !set_run_state(shared, &mut conn, ConnectionRunState::AwaitingReadiness) {
                    shared.metrics.record_closed();
                    return;
                }
                shared.metrics.record_handed_back();
                shared.detector.add_connection(conn);
                return;
            }
            Outcome::MoreWork => {}
        }

        // Racy by intent: a stale read costs one extra rerun or resubmit.
        if shared.metrics.occupancy() >= shared.pool_size {
            shared.metrics.record_inline_rerun();
            continue;
        }

        shared.metrics.record_resubmit();
        if let Err(ScheduleError::Rejected(mut conn)) = shared.schedule(conn) {
            log::debug!(
                "[scheduler] resubmit rejected after close, closing {}",
                conn.remote_addr()
            );
            close_quietly(&mut conn);
            shared.metrics.record_closed();
        }
        return;
    }
}

/// Where a connection stands after one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Closed,
    /// Nothing to do until new readiness
    Idle,
    /// State changed or read budget exhausted
    MoreWork,
}

/// One unit of work plus the follow-up signal checks, with panic
/// containment. A panic anywhere in here closes the connection.
fn run_unit<C: Connection>(shared: &Shared<C>, conn: &mut C) -> Outcome {
    let unit = panic::catch_unwind(AssertUnwindSafe(|| {
        if conn.do_work() {
            Outcome::Closed
        } else if conn.is_state_changed() || conn.is_partial_read() {
            Outcome::MoreWork
        } else {
            Outcome::Idle
        }
    }));

    match unit {
        Ok(outcome) => outcome,
        Err(payload) => {
            shared.metrics.record_worker_fault();
            log::error!(
                "[scheduler] connection {} panicked during a unit of work: {}",
                conn.remote_addr(),
                panic_message(&*payload)
            );
            close_quietly(conn);
            Outcome::Closed
        }
    }
}

/// Run-state notification with the same containment as a unit of work.
/// Returns false if it panicked and the connection was closed.
fn set_run_state<C: Connection>(
    shared: &Shared<C>,
    conn: &mut C,
    state: ConnectionRunState,
) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| conn.on_run_state(state))) {
        Ok(()) => true,
        Err(payload) => {
            shared.metrics.record_worker_fault();
            log::error!(
                "[scheduler] connection {} panicked entering {:?}: {}",
                conn.remote_addr(),
                state,
                panic_message(&*payload)
            );
            close_quietly(conn);
            false
        }
    }
}

fn close_quietly<C: Connection>(conn: &mut C) {
    if panic::catch_unwind(AssertUnwindSafe(|| conn.close())).is_err() {
        log::error!("[scheduler] connection {} panicked in close", conn.remote_addr());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic>"
    }
}
