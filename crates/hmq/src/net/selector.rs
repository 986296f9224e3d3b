// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Readiness detection thread.
//!
//! The selector parks connections that are waiting for I/O readiness in a
//! mio poll and hands each one to the scheduler as soon as the OS reports it
//! ready. Workers give connections back through a [`SelectorHandle`], which
//! queues them on a channel and wakes the poll.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                       Selector thread                        |
//! |   mio::Poll                                                  |
//! |    - listener (token 0)   -> factory -> Scheduler::schedule   |
//! |    - waker    (token 1)   -> register/reregister returns      |
//! |    - parked   (token 2..) -> Scheduler::schedule              |
//! +--------------------------------------------------------------+
//!          ^                                         |
//!          | SelectorHandle::add_connection          v
//!   +---------------+                      +-------------------+
//!   |    workers    | <------------------- |  pool queue       |
//!   +---------------+                      +-------------------+
//! ```
//!
//! A connection is parked only while it is registered here; readiness for a
//! token that is not parked (the connection is queued or running) is ignored.
//! Re-registration re-arms the token, so readiness that arrived in the
//! meantime is reported again.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::RwLock;

use super::connection::{Connection, SelectableConnection};
use crate::scheduler::Scheduler;

// ============================================================================
// Constants
// ============================================================================

/// Token for the TCP listener
const LISTENER_TOKEN: Token = Token(0);

/// Token for the waker (returning connections)
const WAKER_TOKEN: Token = Token(1);

/// Starting token for connections
const CONNECTION_TOKEN_START: usize = 2;

/// Poll timeout (bounds how long shutdown takes to be noticed without a wake)
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum events to process per poll
const MAX_EVENTS: usize = 256;

// ============================================================================
// Readiness detector
// ============================================================================

/// Receiver of connections that have nothing to do until new I/O readiness.
pub trait ReadinessDetector<C>: Send + Sync {
    /// Take ownership of a connection and watch it for readiness.
    fn add_connection(&self, conn: C);
}

/// Cloneable handle workers use to return connections to the selector.
pub struct SelectorHandle<C> {
    tx: Sender<C>,
    waker: Arc<Waker>,
    /// Cleared under the write lock before the final drain; sends hold the
    /// read lock, so none can land after the drain.
    accepting: Arc<RwLock<bool>>,
}

impl<C> Clone for SelectorHandle<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            waker: Arc::clone(&self.waker),
            accepting: Arc::clone(&self.accepting),
        }
    }
}

impl<C: Connection> ReadinessDetector<C> for SelectorHandle<C> {
    fn add_connection(&self, conn: C) {
        let sent = {
            let accepting = self.accepting.read();
            if *accepting {
                self.tx.send(conn).map_err(|channel::SendError(conn)| conn)
            } else {
                Err(conn)
            }
        };

        match sent {
            Ok(()) => {
                if let Err(e) = self.waker.wake() {
                    log::warn!("[selector] wake failed: {}", e);
                }
            }
            Err(mut conn) => {
                log::debug!(
                    "[selector] stopped, closing returned connection {}",
                    conn.remote_addr()
                );
                conn.close();
            }
        }
    }
}

// ============================================================================
// Acceptor
// ============================================================================

/// Turns an accepted stream into a connection.
pub type ConnectionFactory<C> = Box<dyn FnMut(TcpStream, SocketAddr) -> io::Result<C> + Send>;

/// Listening socket plus the factory for accepted streams.
pub struct Acceptor<C> {
    listener: TcpListener,
    factory: ConnectionFactory<C>,
}

impl<C> Acceptor<C> {
    pub fn new(listener: TcpListener, factory: ConnectionFactory<C>) -> Self {
        Self { listener, factory }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

// ============================================================================
// Selector
// ============================================================================

/// Selector state, owned by its thread once spawned.
pub struct Selector<C: SelectableConnection> {
    poll: Poll,
    waker: Arc<Waker>,
    returns: Receiver<C>,
    running: Arc<AtomicBool>,
    accepting: Arc<RwLock<bool>>,
    parked: HashMap<Token, C>,
    next_token: usize,
    acceptor: Option<Acceptor<C>>,
}

impl<C: SelectableConnection> Selector<C> {
    /// Create the poll and the handle workers will return connections through.
    pub fn new() -> io::Result<(Self, SelectorHandle<C>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, rx) = channel::unbounded();
        let accepting = Arc::new(RwLock::new(true));

        let handle = SelectorHandle {
            tx,
            waker: Arc::clone(&waker),
            accepting: Arc::clone(&accepting),
        };
        let selector = Self {
            poll,
            waker,
            returns: rx,
            running: Arc::new(AtomicBool::new(true)),
            accepting,
            parked: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            acceptor: None,
        };
        Ok((selector, handle))
    }

    /// Spawn the selector thread, dispatching ready connections to `scheduler`.
    pub fn spawn(
        mut self,
        scheduler: Arc<Scheduler<C>>,
        acceptor: Option<Acceptor<C>>,
    ) -> io::Result<SelectorThread> {
        let mut local_addr = None;
        if let Some(mut acceptor) = acceptor {
            self.poll
                .registry()
                .register(&mut acceptor.listener, LISTENER_TOKEN, Interest::READABLE)?;
            local_addr = Some(acceptor.listener.local_addr()?);
            self.acceptor = Some(acceptor);
        }

        let running = Arc::clone(&self.running);
        let waker = Arc::clone(&self.waker);
        let thread = thread::Builder::new()
            .name("hmq-selector".to_string())
            .spawn(move || self.run(&scheduler))?;

        Ok(SelectorThread {
            running,
            waker,
            thread: Some(thread),
            local_addr,
        })
    }

    fn run(mut self, scheduler: &Scheduler<C>) {
        log::debug!("[selector] started");
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::warn!("[selector] poll error: {}", e);
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.handle_accept(scheduler),
                    // Returns are drained after every poll
                    WAKER_TOKEN => {}
                    token => self.handle_ready(token, scheduler),
                }
            }

            self.handle_returns();
        }

        self.close_all();
        log::debug!("[selector] stopped");
    }

    fn handle_accept(&mut self, scheduler: &Scheduler<C>) {
        let Some(acceptor) = self.acceptor.as_mut() else {
            return;
        };

        loop {
            match acceptor.listener.accept() {
                Ok((stream, remote_addr)) => match (acceptor.factory)(stream, remote_addr) {
                    // Fresh connections may already hold data: run them now
                    Ok(conn) => {
                        log::debug!("[selector] accepted {}", remote_addr);
                        dispatch(scheduler, conn);
                    }
                    Err(e) => {
                        log::warn!("[selector] rejected {}: {}", remote_addr, e);
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("[selector] accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_ready(&mut self, token: Token, scheduler: &Scheduler<C>) {
        // Not parked: queued or running, it will be re-armed on return
        if let Some(conn) = self.parked.remove(&token) {
            dispatch(scheduler, conn);
        }
    }

    fn handle_returns(&mut self) {
        while let Ok(mut conn) = self.returns.try_recv() {
            let registry = self.poll.registry();
            let registered = match conn.token() {
                Some(token) => conn.reregister(registry).map(|()| token),
                None => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    conn.register(registry, token).map(|()| token)
                }
            };

            match registered {
                Ok(token) => {
                    self.parked.insert(token, conn);
                }
                Err(e) => {
                    log::warn!(
                        "[selector] cannot watch {}, closing: {}",
                        conn.remote_addr(),
                        e
                    );
                    conn.close();
                }
            }
        }
    }

    /// Stop accepting hand-backs and close everything this selector owns.
    /// Idempotent.
    fn close_all(&mut self) {
        self.running.store(false, Ordering::Release);
        *self.accepting.write() = false;
        let registry = self.poll.registry();

        let returned: Vec<C> = self.returns.try_iter().collect();
        let parked = self.parked.drain().map(|(_, conn)| conn);
        let mut count = 0usize;
        for mut conn in parked.chain(returned) {
            let _ = conn.deregister(registry);
            conn.close();
            count += 1;
        }
        if count > 0 {
            log::debug!("[selector] closed {} idle connections", count);
        }
    }
}

impl<C: SelectableConnection> Drop for Selector<C> {
    fn drop(&mut self) {
        // No-op after `run`; covers a selector dropped without being spawned
        self.close_all();
    }
}

/// Schedule a connection, closing it if the scheduler refuses.
fn dispatch<C: Connection>(scheduler: &Scheduler<C>, conn: C) {
    if let Err(rejected) = scheduler.schedule(conn) {
        let mut conn = rejected.into_inner();
        log::debug!("[selector] scheduler closed, dropping {}", conn.remote_addr());
        conn.close();
    }
}

// ============================================================================
// Thread handle
// ============================================================================

/// Handle to a running selector thread. Shuts the thread down on drop.
pub struct SelectorThread {
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl SelectorThread {
    /// Bound listener address, if the selector accepts connections.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some() && self.running.load(Ordering::Acquire)
    }

    /// Stop the thread and close every parked connection. Idempotent.
    pub fn shutdown(&mut self) -> io::Result<()> {
        let Some(handle) = self.thread.take() else {
            return Ok(());
        };

        self.running.store(false, Ordering::Release);
        let _ = self.waker.wake();
        handle
            .join()
            .map_err(|_| io::Error::other("selector thread panicked"))
    }
}

impl Drop for SelectorThread {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerConfig;
    use mio::Registry;
    use std::time::Instant;

    /// Connection that never sees real I/O; registration is only recorded.
    struct Idle {
        token: Option<Token>,
        registrations: Arc<std::sync::atomic::AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    impl Idle {
        fn new() -> Self {
            Self {
                token: None,
                registrations: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl Connection for Idle {
        fn do_work(&mut self) -> bool {
            false
        }
        fn is_state_changed(&self) -> bool {
            false
        }
        fn is_partial_read(&self) -> bool {
            false
        }
        fn remote_addr(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 9))
        }
        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl SelectableConnection for Idle {
        fn token(&self) -> Option<Token> {
            self.token
        }
        fn register(&mut self, _registry: &Registry, token: Token) -> io::Result<()> {
            self.token = Some(token);
            self.registrations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn reregister(&mut self, _registry: &Registry) -> io::Result<()> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
            self.token = None;
            Ok(())
        }
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_constants() {
        assert_eq!(LISTENER_TOKEN, Token(0));
        assert_eq!(WAKER_TOKEN, Token(1));
        assert_eq!(CONNECTION_TOKEN_START, 2);
    }

    #[test]
    fn test_handed_back_connection_is_parked_then_closed_on_shutdown() {
        let (selector, handle) = Selector::<Idle>::new().unwrap();
        let scheduler = Arc::new(
            Scheduler::new(
                SchedulerConfig::default().with_pool_size(1),
                Arc::new(handle),
            )
            .unwrap(),
        );
        let mut thread = selector.spawn(Arc::clone(&scheduler), None).unwrap();
        assert!(thread.is_running());
        assert!(thread.local_addr().is_none());

        let conn = Idle::new();
        let registrations = Arc::clone(&conn.registrations);
        let closed = Arc::clone(&conn.closed);
        scheduler.schedule(conn).unwrap();

        wait_for(|| registrations.load(Ordering::SeqCst) == 1);
        assert!(!closed.load(Ordering::SeqCst));

        thread.shutdown().unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert!(!thread.is_running());
        thread.shutdown().unwrap();

        scheduler.close();
    }

    #[test]
    fn test_handle_closes_when_selector_gone() {
        let (selector, handle) = Selector::<Idle>::new().unwrap();
        drop(selector);

        let conn = Idle::new();
        let closed = Arc::clone(&conn.closed);
        handle.add_connection(conn);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_hand_back_during_shutdown_always_closes() {
        let (selector, handle) = Selector::<Idle>::new().unwrap();
        let scheduler = Arc::new(
            Scheduler::new(
                SchedulerConfig::default().with_pool_size(1),
                Arc::new(handle.clone()),
            )
            .unwrap(),
        );
        let mut selector_thread = selector.spawn(Arc::clone(&scheduler), None).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut flags = Vec::new();
                    while !stop.load(Ordering::SeqCst) {
                        let conn = Idle::new();
                        flags.push(Arc::clone(&conn.closed));
                        handle.add_connection(conn);
                        thread::yield_now();
                    }
                    flags
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        selector_thread.shutdown().unwrap();
        thread::sleep(Duration::from_millis(5));
        stop.store(true, Ordering::SeqCst);

        let mut total = 0;
        for worker in workers {
            let flags = worker.join().unwrap();
            total += flags.len();
            assert!(flags.iter().all(|closed| closed.load(Ordering::SeqCst)));
        }
        assert!(total > 0);
        scheduler.close();
    }

    #[test]
    fn test_handle_closes_after_shutdown() {
        let (selector, handle) = Selector::<Idle>::new().unwrap();
        let scheduler = Arc::new(
            Scheduler::new(
                SchedulerConfig::default().with_pool_size(1),
                Arc::new(handle.clone()),
            )
            .unwrap(),
        );
        let mut thread = selector.spawn(Arc::clone(&scheduler), None).unwrap();
        thread.shutdown().unwrap();

        let conn = Idle::new();
        let closed = Arc::clone(&conn.closed);
        handle.add_connection(conn);
        assert!(closed.load(Ordering::SeqCst));
    }
}
