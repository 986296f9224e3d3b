// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport bootstrap: listener, selector and worker pool wired together.
//!
//! # Lifecycle
//!
//! ```text
//!   Initialising --> Active --> Stopping --> Stopped
//!        |             |           |
//!        +-------------+-----------+------> Failed
//! ```
//!
//! Every change goes through [`TransportState::transition`], which checks the
//! `(current, desired)` pair against a fixed table.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::{TcpListener, TcpStream};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use super::config::TransportConfig;
use super::connection::{FrameHandler, TcpConnection};
use super::selector::{Acceptor, ConnectionFactory, Selector, SelectorThread};
use crate::scheduler::{Scheduler, SchedulerMetrics};
use crate::{Error, Result};

// ============================================================================
// State machine
// ============================================================================

/// Transport lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// Binding and spawning threads
    Initialising,
    /// Accepting and serving connections
    Active,
    /// Shutdown in progress
    Stopping,
    /// Shut down cleanly (terminal)
    Stopped,
    /// Start or shutdown failed (terminal)
    Failed,
}

/// Allowed `(current, desired)` pairs.
const TRANSITIONS: &[(TransportState, TransportState)] = &[
    (TransportState::Initialising, TransportState::Active),
    (TransportState::Initialising, TransportState::Failed),
    (TransportState::Active, TransportState::Stopping),
    (TransportState::Active, TransportState::Failed),
    (TransportState::Stopping, TransportState::Stopped),
    (TransportState::Stopping, TransportState::Failed),
];

impl TransportState {
    /// Validate a move to `desired` and return the new state.
    pub fn transition(self, desired: TransportState) -> Result<TransportState> {
        if TRANSITIONS.contains(&(self, desired)) {
            Ok(desired)
        } else {
            Err(Error::InvalidState(format!(
                "transport cannot go from {:?} to {:?}",
                self, desired
            )))
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TransportState::Active)
    }

    /// Check if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Stopped | TransportState::Failed)
    }
}

// ============================================================================
// Transport
// ============================================================================

/// A listening broker transport serving [`TcpConnection`]s.
pub struct Transport<H: FrameHandler> {
    config: TransportConfig,
    local_addr: SocketAddr,
    state: Mutex<TransportState>,
    selector: Mutex<Option<SelectorThread>>,
    scheduler: Arc<Scheduler<TcpConnection<H>>>,
}

impl<H: FrameHandler> Transport<H> {
    /// Bind the listener and start the selector and worker threads.
    ///
    /// `handler_factory` builds the protocol engine for each accepted peer.
    pub fn start<F>(config: TransportConfig, handler_factory: F) -> Result<Self>
    where
        F: FnMut(SocketAddr) -> H + Send + 'static,
    {
        config
            .validate()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let state = TransportState::Initialising;
        match Self::bring_up(&config, handler_factory) {
            Ok((scheduler, selector, local_addr)) => {
                let state = state.transition(TransportState::Active)?;
                log::info!(
                    "[transport] listening on {} with {} workers",
                    local_addr,
                    config.worker_threads
                );
                Ok(Self {
                    config,
                    local_addr,
                    state: Mutex::new(state),
                    selector: Mutex::new(Some(selector)),
                    scheduler,
                })
            }
            Err(e) => {
                let _ = state.transition(TransportState::Failed);
                log::error!("[transport] failed to start on {}: {}", config.bind_addr(), e);
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn bring_up<F>(
        config: &TransportConfig,
        mut handler_factory: F,
    ) -> Result<(Arc<Scheduler<TcpConnection<H>>>, SelectorThread, SocketAddr)>
    where
        F: FnMut(SocketAddr) -> H + Send + 'static,
    {
        let listener = bind_listener(config)?;
        let local_addr = listener.local_addr()?;

        let max_message_size = config.max_message_size;
        let read_budget = config.read_budget;
        let nodelay = config.nodelay;
        let factory: ConnectionFactory<TcpConnection<H>> =
            Box::new(move |stream: TcpStream, remote_addr: SocketAddr| {
                if let Err(e) = stream.set_nodelay(nodelay) {
                    log::debug!("[transport] set_nodelay failed for {}: {}", remote_addr, e);
                }
                TcpConnection::new(
                    stream,
                    handler_factory(remote_addr),
                    max_message_size,
                    read_budget,
                )
            });

        let (selector, detector) = Selector::new()?;
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler_config(),
            Arc::new(detector),
        )?);
        let selector = selector.spawn(
            Arc::clone(&scheduler),
            Some(Acceptor::new(listener, factory)),
        )?;

        Ok((scheduler, selector, local_addr))
    }

    /// Address the listener is bound to (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Worker pool metrics.
    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        self.scheduler.metrics()
    }

    /// Stop accepting, close idle connections, drain and join the workers.
    /// Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.is_active() {
                return Ok(());
            }
            *state = state.transition(TransportState::Stopping)?;
        }
        log::info!("[transport] shutting down {}", self.local_addr);

        let selector_result = match self.selector.lock().take() {
            Some(mut selector) => selector.shutdown(),
            None => Ok(()),
        };
        self.scheduler.close();

        let mut state = self.state.lock();
        match selector_result {
            Ok(()) => {
                *state = state.transition(TransportState::Stopped)?;
                Ok(())
            }
            Err(e) => {
                *state = state.transition(TransportState::Failed)?;
                Err(Error::Io(e))
            }
        }
    }
}

impl<H: FrameHandler> Drop for Transport<H> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("[transport] shutdown on drop failed: {}", e);
        }
    }
}

/// Bind a non-blocking listener with address reuse and the configured backlog.
fn bind_listener(config: &TransportConfig) -> io::Result<TcpListener> {
    let addr = config.bind_addr();
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.listen_backlog.min(i32::MAX as u32) as i32)?;
    socket.set_nonblocking(true)?;

    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener))
}

// ============================================================================
// Tests
// ============================================================================
