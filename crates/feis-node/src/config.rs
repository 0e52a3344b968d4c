//! Results server configuration.
//!
//! Provides [`NodeConfig`] with defaults for the data directory, RPC binding,
//! roster, and tabulation policies. Values come from (lowest to highest
//! priority) the defaults, an optional TOML file, `FEIS_*` environment
//! variables, and finally command-line flags applied by the binary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use feis_core::constants::{
    DEFAULT_BROADCAST_CAPACITY, DEFAULT_CONFLICT_WINDOW_MS, DEFAULT_RECALL_PERCENT,
    DEFAULT_RPC_PORT,
};
use feis_core::error::{FeisError, TabulationError};
use feis_core::types::MergePolicy;
use feis_tabulate::points::PointsTable;
use feis_tabulate::results::{NoShowPolicy, TabulationSettings};
use feis_tabulate::tiebreak::TieBreakPolicy;

/// Environment variable prefix (`FEIS_RPC_PORT`, `FEIS_TIE_BREAK`, ...).
pub const ENV_PREFIX: &str = "FEIS";

/// Configuration for a results server instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// IP address for the JSON-RPC server to bind to.
    pub rpc_bind: String,
    pub rpc_port: u16,
    /// Log level filter string (e.g. "info", "feis_node_lib=debug").
    pub log_level: String,
    /// "text" or "json".
    pub log_format: String,
    /// Roster JSON loaded at start.
    pub roster_path: Option<PathBuf>,
    pub conflict_window_ms: u64,
    pub tie_break: TieBreakPolicy,
    pub no_show: NoShowPolicy,
    pub recall_percent: u32,
    /// Per-round broadcast buffer; subscribers further behind get a fresh
    /// snapshot.
    pub broadcast_capacity: usize,
    /// Whole points for placements 1..=N; the standard table when unset.
    pub points_table: Option<Vec<u64>>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("feis");

        Self {
            data_dir,
            rpc_bind: "127.0.0.1".to_string(),
            rpc_port: DEFAULT_RPC_PORT,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            roster_path: None,
            conflict_window_ms: DEFAULT_CONFLICT_WINDOW_MS,
            tie_break: TieBreakPolicy::default(),
            no_show: NoShowPolicy::default(),
            recall_percent: DEFAULT_RECALL_PERCENT,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            points_table: None,
        }
    }
}

impl NodeConfig {
    /// Layer an optional TOML file and `FEIS_*` environment variables over
    /// the defaults.
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// Path to the RocksDB ledger directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("ledger")
    }

    /// Socket address string for the RPC server.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_bind, self.rpc_port)
    }

    pub fn merge_policy(&self) -> MergePolicy {
        MergePolicy {
            conflict_window_ms: self.conflict_window_ms,
        }
    }

    pub fn tabulation(&self) -> Result<TabulationSettings, TabulationError> {
        let table = match &self.points_table {
            Some(values) => PointsTable::from_whole_points(values.clone())?,
            None => PointsTable::standard(),
        };
        Ok(TabulationSettings {
            table,
            tie_break: self.tie_break,
            no_show: self.no_show,
        })
    }

    /// Reject settings the node cannot run with.
    pub fn validate(&self) -> Result<(), FeisError> {
        if !(1..=100).contains(&self.recall_percent) {
            return Err(feis_core::error::RecallError::InvalidPercent(self.recall_percent).into());
        }
        self.tabulation()?;
        Ok(())
    }
}
