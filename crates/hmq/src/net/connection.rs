// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection abstractions and the TCP connection driven by the scheduler.
//!
//! A [`Connection`] is a non-blocking endpoint that performs one bounded unit
//! of work per [`do_work`](Connection::do_work) call and then reports whether
//! it wants to run again. [`TcpConnection`] implements it over a mio stream
//! with length-prefixed framing and a pluggable [`FrameHandler`].
//!
//! # Unit of work
//!
//! ```text
//!  read (until WouldBlock or read_budget) -> decode frames -> handler.on_frame
//!       |                                                          |
//!       +-- budget hit: partial read            handler.poll_pending -> state changed
//!                                                                  |
//!                                           flush outbox (until WouldBlock)
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use super::frame_codec::FrameCodec;
use crate::{Error, Result};

/// Size of the stack buffer used for each socket read.
const READ_CHUNK: usize = 8 * 1024;

// ============================================================================
// Traits
// ============================================================================

/// Where a connection currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRunState {
    /// Parked with the readiness detector
    AwaitingReadiness,
    /// Waiting on the worker pool queue
    Queued,
    /// Owned by a worker
    Running,
}

/// A schedulable non-blocking connection.
pub trait Connection: Send + 'static {
    /// Run one unit of work. Returns `true` when the connection is closed.
    fn do_work(&mut self) -> bool;

    /// The last unit of work left follow-up work that needs no new readiness.
    fn is_state_changed(&self) -> bool;

    /// The last unit of work stopped reading before the socket was drained.
    fn is_partial_read(&self) -> bool;

    fn remote_addr(&self) -> SocketAddr;

    /// Close the connection. Must be idempotent.
    fn close(&mut self);

    /// Notification of each run-state transition.
    fn on_run_state(&mut self, _state: ConnectionRunState) {}
}

/// A connection the selector can register with a mio poll.
pub trait SelectableConnection: Connection {
    /// Token assigned at registration, if registered.
    fn token(&self) -> Option<Token>;

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()>;

    /// Re-arm with the interest the connection currently needs.
    fn reregister(&mut self, registry: &Registry) -> io::Result<()>;

    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;
}

/// Protocol engine plugged into a [`TcpConnection`].
pub trait FrameHandler: Send + 'static {
    /// Handle one inbound payload. An error closes the connection.
    fn on_frame(&mut self, frame: Vec<u8>, outbox: &mut Outbox) -> Result<()>;

    /// Emit deferred work. Returns `true` if more remains after this pass.
    fn poll_pending(&mut self, _outbox: &mut Outbox) -> bool {
        false
    }

    /// Called once when the connection closes.
    fn on_close(&mut self) {}
}

// ============================================================================
// Outbox
// ============================================================================

/// Outbound frames waiting to be written to the socket.
#[derive(Debug, Default)]
pub struct Outbox {
    buf: Vec<u8>,
    offset: usize,
    frames_queued: u64,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one payload; it is framed on the way in.
    pub fn push(&mut self, payload: &[u8]) {
        FrameCodec::encode_into(payload, &mut self.buf);
        self.frames_queued += 1;
    }

    /// Bytes not yet written.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.pending_bytes() == 0
    }

    /// Frames pushed since creation.
    pub fn frames_queued(&self) -> u64 {
        self.frames_queued
    }

    /// Unwritten bytes, framing included.
    pub fn as_bytes(&self) -> &[u8] {
        self.unwritten()
    }

    /// Discard unwritten bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.offset = 0;
    }

    fn unwritten(&self) -> &[u8] {
        &self.buf[self.offset..]
    }

    fn advance(&mut self, n: usize) {
        self.offset += n;
        if self.offset >= self.buf.len() {
            self.buf.clear();
            self.offset = 0;
        }
    }
}

// ============================================================================
// TCP connection
// ============================================================================

/// Per-connection counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Units of work that stopped at the read budget
    pub partial_reads: u64,
    pub units_of_work: u64,
}

/// Framed TCP connection driving a [`FrameHandler`].
pub struct TcpConnection<H: FrameHandler> {
    stream: TcpStream,
    remote_addr: SocketAddr,
    token: Option<Token>,
    codec: FrameCodec,
    handler: H,
    outbox: Outbox,
    read_budget: usize,

    state_changed: bool,
    partial_read: bool,
    peer_closed: bool,
    closed: bool,
    run_state: ConnectionRunState,
    stats: ConnectionStats,
}

impl<H: FrameHandler> TcpConnection<H> {
    /// Wrap an accepted (non-blocking) stream.
    ///
    /// `read_budget` bounds the bytes read in one unit of work.
    pub fn new(
        stream: TcpStream,
        handler: H,
        max_message_size: usize,
        read_budget: usize,
    ) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        Ok(Self {
            stream,
            remote_addr,
            token: None,
            codec: FrameCodec::new(max_message_size),
            handler,
            outbox: Outbox::new(),
            read_budget: read_budget.max(1),
            state_changed: false,
            partial_read: false,
            peer_closed: false,
            closed: false,
            run_state: ConnectionRunState::Queued,
            stats: ConnectionStats::default(),
        })
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn run_state(&self) -> ConnectionRunState {
        self.run_state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Interest needed right now: writable only while output is queued.
    pub fn interest(&self) -> Interest {
        if self.outbox.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    fn drive(&mut self) -> Result<()> {
        self.read_input()?;

        while let Some(frame) = self.codec.decode_buffered()? {
            self.stats.frames_in += 1;
            self.handler.on_frame(frame, &mut self.outbox)?;
        }

        if !self.peer_closed && self.handler.poll_pending(&mut self.outbox) {
            self.state_changed = true;
        }

        self.flush()
    }

    fn read_input(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut consumed = 0usize;

        loop {
            if consumed >= self.read_budget {
                self.partial_read = true;
                self.stats.partial_reads += 1;
                return Ok(());
            }

            let want = chunk.len().min(self.read_budget - consumed);
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => {
                    self.peer_closed = true;
                    return Ok(());
                }
                Ok(n) => {
                    consumed += n;
                    self.stats.bytes_in += n as u64;
                    self.codec.feed(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        let queued_before = self.outbox.frames_queued();
        while !self.outbox.is_empty() {
            match self.stream.write(self.outbox.unwritten()) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    )))
                }
                Ok(n) => {
                    self.outbox.advance(n);
                    self.stats.bytes_out += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        self.stats.frames_out = queued_before;
        Ok(())
    }

    fn close_with(&mut self, reason: &dyn fmt::Display) {
        log::debug!("[connection] {} closing: {}", self.remote_addr, reason);
        Connection::close(self);
    }
}

impl<H: FrameHandler> Connection for TcpConnection<H> {
    fn do_work(&mut self) -> bool {
        if self.closed {
            return true;
        }
        self.state_changed = false;
        self.partial_read = false;
        self.stats.units_of_work += 1;

        if let Err(e) = self.drive() {
            self.close_with(&e);
            return true;
        }
        if self.peer_closed {
            self.close_with(&"peer closed");
            return true;
        }
        false
    }

    fn is_state_changed(&self) -> bool {
        self.state_changed
    }

    fn is_partial_read(&self) -> bool {
        self.partial_read
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.codec.reset();
        let _ = self.stream.shutdown(Shutdown::Both);
        self.handler.on_close();
    }

    fn on_run_state(&mut self, state: ConnectionRunState) {
        self.run_state = state;
    }
}

impl<H: FrameHandler> Drop for TcpConnection<H> {
    fn drop(&mut self) {
        // Any path that loses the connection still runs the handler's cleanup
        Connection::close(self);
    }
}

impl<H: FrameHandler> SelectableConnection for TcpConnection<H> {
    fn token(&self) -> Option<Token> {
        self.token
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = self.interest();
        registry.register(&mut self.stream, token, interest)?;
        self.token = Some(token);
        Ok(())
    }

    fn reregister(&mut self, registry: &Registry) -> io::Result<()> {
        let token = self
            .token
            .ok_or_else(|| io::Error::other("connection not registered"))?;
        let interest = self.interest();
        registry.reregister(&mut self.stream, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.token = None;
        registry.deregister(&mut self.stream)
    }
}

impl<H: FrameHandler> fmt::Debug for TcpConnection<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("remote_addr", &self.remote_addr)
            .field("token", &self.token)
            .field("run_state", &self.run_state)
            .field("closed", &self.closed)
            .field("stats", &self.stats)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
