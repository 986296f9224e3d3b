// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport configuration.
//!
//! # Example
//!
//! ```
//! use hmq::net::TransportConfig;
//!
//! let config = TransportConfig {
//!     listen_port: 5672,
//!     worker_threads: 8,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::frame_codec::DEFAULT_MAX_MESSAGE_SIZE;
use crate::scheduler::SchedulerConfig;

/// Listener and worker pool settings.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    // === Listener ===
    /// Address to bind (None = all interfaces)
    pub listen_address: Option<IpAddr>,

    /// TCP listen port (0 = ephemeral port assigned by OS)
    pub listen_port: u16,

    /// TCP listen backlog (pending connection queue size)
    pub listen_backlog: u32,

    // === Scheduling ===
    /// Worker pool size
    pub worker_threads: usize,

    // === Framing ===
    /// Maximum inbound frame payload (anti-OOM protection)
    pub max_message_size: usize,

    /// Bytes a connection may read in one unit of work before yielding
    pub read_budget: usize,

    /// Enable TCP_NODELAY on accepted streams
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        Self {
            listen_address: None,
            listen_port: 0,
            listen_backlog: 128,
            worker_threads: scheduler.pool_size,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_budget: 64 * 1024,
            nodelay: true,
        }
    }
}

impl TransportConfig {
    /// Builder: set listen port
    pub fn with_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    /// Builder: set bind address
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.listen_address = Some(address);
        self
    }

    /// Builder: set worker pool size
    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    /// Builder: set max message size
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Builder: set per-unit read budget
    pub fn with_read_budget(mut self, budget: usize) -> Self {
        self.read_budget = budget;
        self
    }

    /// Builder: set TCP_NODELAY
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Socket address to bind.
    pub fn bind_addr(&self) -> SocketAddr {
        let ip = self
            .listen_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.listen_port)
    }

    /// Scheduler settings derived from this config.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_pool_size(self.worker_threads)
            .with_thread_name("hmq-worker")
    }

    /// Validate configuration, returning error message if invalid.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.worker_threads == 0 {
            return Err("worker_threads must be > 0");
        }
        if self.max_message_size == 0 {
            return Err("max_message_size must be > 0");
        }
        if self.max_message_size > u32::MAX as usize {
            return Err("max_message_size exceeds the 32-bit length prefix");
        }
        if self.read_budget == 0 {
            return Err("read_budget must be > 0");
        }
        if self.listen_backlog == 0 {
            return Err("listen_backlog must be > 0");
        }
        self.scheduler_config().validate()
    }
}
