// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HMQ Broker
//!
//! Standalone broker process built on the `hmq` scheduler. Clients publish
//! frames and receive them back as tracked deliveries which they acknowledge
//! or reject.
//!
//! # Usage
//!
//! ```bash
//! # Start on the default port (5672)
//! hmq-broker
//!
//! # Custom port, pool size and config file
//! hmq-broker --port 5673 --workers 8 --config broker.json
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hmq::net::Transport;

mod config;
mod engine;

use config::BrokerConfig;
use engine::{EngineCounters, LoopbackEngine};

/// HMQ Broker - loopback delivery server
#[derive(Parser, Debug)]
#[command(name = "hmq-broker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on (overrides config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Worker pool size (overrides config file)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (also captures `log` records from the hmq library)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let mut config = if let Some(config_path) = &args.config {
        info!("Loading config from {:?}", config_path);
        BrokerConfig::from_file(config_path)?
    } else {
        BrokerConfig::default()
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = &args.bind {
        config.bind_address = bind.parse()?;
    }
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }
    config.validate()?;

    let counters = Arc::new(EngineCounters::default());
    let prefetch_limit = config.prefetch_limit;
    let batch = config.delivery_batch;
    let engine_counters = Arc::clone(&counters);
    let transport = Transport::start(config.transport_config(), move |peer| {
        LoopbackEngine::new(peer, prefetch_limit, batch, Arc::clone(&engine_counters))
    })?;

    info!("+----------------------------------------------------+");
    info!(
        "|       HMQ Broker v{}                            |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:     {:38} |", transport.local_addr());
    info!("|  Workers:  {:38} |", config.worker_threads);
    info!(
        "|  Prefetch: {:38} |",
        config
            .prefetch_limit
            .map_or_else(|| "unlimited".to_string(), |n| n.to_string())
    );
    info!("|  Batch:    {:38} |", config.delivery_batch);
    info!("+----------------------------------------------------+");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping broker...");

    if let Err(e) = transport.shutdown() {
        warn!("Shutdown failed: {}", e);
    }

    let stats = transport.metrics().snapshot();
    info!(
        scheduled = stats.scheduled,
        inline_reruns = stats.inline_reruns,
        resubmits = stats.resubmits,
        handed_back = stats.handed_back,
        closed = stats.closed,
        worker_faults = stats.worker_faults,
        "scheduler totals"
    );
    info!(
        published = counters.published(),
        delivered = counters.delivered(),
        acknowledged = counters.acknowledged(),
        requeued = counters.requeued(),
        "engine totals"
    );
    info!("Broker stopped");
    Ok(())
}
