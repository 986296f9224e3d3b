// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix transport framing.
//!
//! TCP carries no message boundaries, so every frame exchanged with a client
//! is prefixed with its length:
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | Payload           |
//! +----------------+-------------------+
//! ```
//!
//! The codec is fed raw bytes as the connection reads them and hands back
//! whole payloads. It never touches the socket, so a connection can bound how
//! much it reads per unit of work independently of frame sizes.
//!
//! # Example
//!
//! ```
//! use hmq::net::FrameCodec;
//!
//! let mut codec = FrameCodec::new(1024);
//! let wire = FrameCodec::encode(b"hello");
//!
//! codec.feed(&wire[..3]);
//! assert!(codec.decode_buffered().unwrap().is_none());
//! codec.feed(&wire[3..]);
//! assert_eq!(codec.decode_buffered().unwrap().as_deref(), Some(&b"hello"[..]));
//! ```

use crate::{Error, Result};

/// Frame header size (4 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default maximum payload size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Incremental length-prefix decoder with anti-OOM limit.
#[derive(Debug)]
pub struct FrameCodec {
    /// Bytes fed but not yet decoded start at `pos`
    buffer: Vec<u8>,
    pos: usize,

    /// Maximum allowed payload size
    max_size: usize,

    frames_decoded: u64,
    bytes_decoded: u64,
    frames_rejected: u64,
}

impl FrameCodec {
    /// Create a codec rejecting payloads above `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(16 * 1024),
            pos: 0,
            max_size,
            frames_decoded: 0,
            bytes_decoded: 0,
            frames_rejected: 0,
        }
    }

    /// Create a codec with default max size (16 MB).
    pub fn with_default_max() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }

    /// Frames refused because they exceeded `max_size`.
    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Encode a payload into a new framed buffer.
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        Self::encode_into(payload, &mut frame);
        frame
    }

    /// Append `[length: u32 BE][payload]` to `buf`.
    pub fn encode_into(payload: &[u8], buf: &mut Vec<u8>) {
        let len = payload.len() as u32;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(payload);
    }

    /// Append raw bytes read from the peer.
    pub fn feed(&mut self, data: &[u8]) {
        // Compact once more than half of the buffer is consumed
        if self.pos > 0 && self.pos > self.buffer.len() / 2 {
            self.buffer.drain(..self.pos);
            self.pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Decode the next complete payload from buffered bytes.
    ///
    /// Returns `Ok(None)` when more bytes are needed. An oversized length
    /// header is an error; the stream cannot be resynchronised after it.
    pub fn decode_buffered(&mut self) -> Result<Option<Vec<u8>>> {
        match peek_frame_header(&self.buffer[self.pos..], self.max_size) {
            ParseResult::Incomplete(_) => Ok(None),
            ParseResult::TooLarge(len) => {
                self.frames_rejected += 1;
                Err(Error::FrameTooLarge {
                    len,
                    max: self.max_size,
                })
            }
            ParseResult::Complete(len, total) => {
                let start = self.pos + FRAME_HEADER_SIZE;
                let payload = self.buffer[start..start + len].to_vec();
                self.pos += total;
                if self.pos == self.buffer.len() {
                    self.buffer.clear();
                    self.pos = 0;
                }
                self.frames_decoded += 1;
                self.bytes_decoded += len as u64;
                Ok(Some(payload))
            }
        }
    }

    /// Check whether fed bytes are waiting (a partial frame at least).
    pub fn has_buffered_data(&self) -> bool {
        self.pos < self.buffer.len()
    }

    /// Drop buffered bytes (e.g. after the connection closed).
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pos = 0;
    }
}

/// Result of inspecting a buffer for a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// Complete frame found: (payload_len, total_frame_len)
    Complete(usize, usize),
    /// Bytes still missing
    Incomplete(usize),
    /// Announced length exceeds the maximum
    TooLarge(usize),
}

/// Inspect the frame header at the start of `buf` without consuming it.
pub fn peek_frame_header(buf: &[u8], max_size: usize) -> ParseResult {
    if buf.len() < FRAME_HEADER_SIZE {
        return ParseResult::Incomplete(FRAME_HEADER_SIZE - buf.len());
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > max_size {
        return ParseResult::TooLarge(len);
    }

    let total = FRAME_HEADER_SIZE + len;
    if buf.len() < total {
        return ParseResult::Incomplete(total - buf.len());
    }
    ParseResult::Complete(len, total)
}
