//! Feis results server binary.
//!
//! Loads the roster, opens the RocksDB ledger, and serves score ingestion,
//! results, recalls, and live round subscriptions over JSON-RPC.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use feis_node_lib::logging::init_logging;
use feis_node_lib::{Node, NodeConfig, start_rpc_server};
use feis_tabulate::results::NoShowPolicy;
use feis_tabulate::tiebreak::TieBreakPolicy;
use tracing::{debug, error, info};

/// How often idle broadcast channels are dropped.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Feis results server.
#[derive(Parser, Debug)]
#[command(
    name = "feis-node",
    version,
    about = "Feis tabulation server with RocksDB storage and JSON-RPC"
)]
struct Args {
    /// Optional TOML config file; FEIS_* environment variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for the score ledger
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Roster JSON file (competitions, rounds, entries)
    #[arg(long)]
    roster: Option<PathBuf>,

    /// RPC server bind address
    #[arg(long)]
    rpc_bind: Option<String>,

    /// RPC server port
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long)]
    log_format: Option<String>,

    /// Tie-break for equal aggregates (shared_rank, raw_mark_total, placement_sum)
    #[arg(long)]
    tie_break: Option<TieBreakPolicy>,

    /// No-show handling (exclude, score_zero)
    #[arg(long)]
    no_show: Option<NoShowPolicy>,

    /// Share of the field recalled, in percent
    #[arg(long)]
    recall_percent: Option<u32>,

    /// Offline writes from different devices closer than this are held for review
    #[arg(long)]
    conflict_window_ms: Option<u64>,
}

impl Args {
    /// Layer CLI flags over file and environment configuration.
    fn into_config(self) -> Result<NodeConfig> {
        let mut config = NodeConfig::load(self.config.as_deref())
            .context("failed to load configuration")?;

        if let Some(v) = self.data_dir {
            config.data_dir = v;
        }
        if let Some(v) = self.roster {
            config.roster_path = Some(v);
        }
        if let Some(v) = self.rpc_bind {
            config.rpc_bind = v;
        }
        if let Some(v) = self.rpc_port {
            config.rpc_port = v;
        }
        if let Some(v) = self.log_level {
            config.log_level = v;
        }
        if let Some(v) = self.log_format {
            config.log_format = v;
        }
        if let Some(v) = self.tie_break {
            config.tie_break = v;
        }
        if let Some(v) = self.no_show {
            config.no_show = v;
        }
        if let Some(v) = self.recall_percent {
            config.recall_percent = v;
        }
        if let Some(v) = self.conflict_window_ms {
            config.conflict_window_ms = v;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let config = match Args::parse().into_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("feis-node: {e:#}");
            process::exit(2);
        }
    };

    init_logging(&config.log_level, &config.log_format);

    info!("Feis Results Server v{}", env!("CARGO_PKG_VERSION"));
    info!("data_dir: {:?}", config.data_dir);
    info!("roster: {:?}", config.roster_path);
    info!("rpc_addr: {}", config.rpc_addr());

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!("failed to create data_dir: {}", e);
        process::exit(1);
    }

    let node = match Node::open(&config) {
        Ok(n) => n,
        Err(e) => {
            error!("failed to start node: {}", e);
            process::exit(1);
        }
    };
    info!("Node initialized");

    let (addr, rpc_handle) = match start_rpc_server(&config.rpc_addr(), node.clone()).await {
        Ok(started) => started,
        Err(e) => {
            error!("failed to start RPC server: {}", e);
            process::exit(1);
        }
    };
    info!("RPC server listening on {}", addr);

    let pruner = {
        let node = node.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                tick.tick().await;
                let dropped = node.prune_subscriptions();
                if dropped > 0 {
                    debug!(dropped, "idle round channels pruned");
                }
            }
        })
    };

    info!("Feis node running (Ctrl+C to stop)");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl+C: {}", e);
    }
    info!("shutdown signal received");

    pruner.abort();
    rpc_handle.stop().ok();
    rpc_handle.stopped().await;
    info!("RPC server stopped");
    info!("Feis node shutdown complete");
}
