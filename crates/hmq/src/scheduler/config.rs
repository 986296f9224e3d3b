// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Scheduler configuration.

use std::thread;

/// Worker pool configuration.
///
/// # Example
///
/// ```
/// use hmq::scheduler::SchedulerConfig;
///
/// let config = SchedulerConfig::default()
///     .with_pool_size(4)
///     .with_thread_name("hmq-io");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Number of worker threads (fixed for the scheduler's lifetime)
    pub pool_size: usize,

    /// Worker thread name prefix; threads are named `{prefix}-{index}`
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: thread::available_parallelism().map_or(4, |n| n.get()),
            thread_name: "hmq-worker".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Builder: set pool size
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Builder: set worker thread name prefix
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Validate configuration, returning error message if invalid.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.pool_size == 0 {
            return Err("pool_size must be > 0");
        }
        if self.pool_size > 4096 {
            return Err("pool_size too large (> 4096)");
        }
        if self.thread_name.is_empty() {
            return Err("thread_name must not be empty");
        }
        Ok(())
    }
}
