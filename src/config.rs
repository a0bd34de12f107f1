//! Engine-wide settings and the per-instance `Options` record.
//!
//! Loading these from a config file, CLI flags, or environment variables is
//! explicitly someone else's job; this module only defines the shapes and
//! their defaults, and leaves wiring to `main.rs`.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Error;

fn default_port_range_low() -> u16 {
    8100
}
fn default_port_range_high() -> u16 {
    8199
}
fn default_max_instances() -> usize {
    64
}
fn default_max_running_instances() -> usize {
    4
}
fn default_on_demand_start_timeout_secs() -> u64 {
    120
}
fn default_timeout_check_interval_minutes() -> u64 {
    1
}
fn default_graceful_stop_secs() -> u64 {
    30
}

/// Settings the `Manager` is constructed with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_port_range_low")]
    pub port_range_low: u16,
    #[serde(default = "default_port_range_high")]
    pub port_range_high: u16,

    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    #[serde(default = "default_max_running_instances")]
    pub max_running_instances: usize,
    #[serde(default = "default_true")]
    pub enable_lru_eviction: bool,

    #[serde(default = "default_on_demand_start_timeout_secs")]
    pub on_demand_start_timeout_secs: u64,
    #[serde(default = "default_timeout_check_interval_minutes")]
    pub timeout_check_interval_minutes: u64,
    #[serde(default = "default_graceful_stop_secs")]
    pub graceful_stop_secs: u64,

    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port_range_low: default_port_range_low(),
            port_range_high: default_port_range_high(),
            max_instances: default_max_instances(),
            max_running_instances: default_max_running_instances(),
            enable_lru_eviction: true,
            on_demand_start_timeout_secs: default_on_demand_start_timeout_secs(),
            timeout_check_interval_minutes: default_timeout_check_interval_minutes(),
            graceful_stop_secs: default_graceful_stop_secs(),
            data_dir: PathBuf::from("./data"),
            db_path: PathBuf::from("./data/llamactl.db"),
        }
    }
}

/// Which inference engine a given instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    LlamaCpp,
    MlxLm,
    Vllm,
}

impl BackendType {
    /// Stable lowercase form stored in the `instances.backend_type` column.
    pub fn as_str(self) -> &'static str {
        match self {
            BackendType::LlamaCpp => "llama_cpp",
            BackendType::MlxLm => "mlx_lm",
            BackendType::Vllm => "vllm",
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The heterogeneous, backend-specific option record. The core only ever
/// reads `model`/`host`/`port`; everything else is opaque and passed through
/// to `build_command` as `--key value` pairs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendOptions {
    pub model: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Full configuration of a single instance, as supplied at creation time and
/// stored verbatim in the `instances` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceOptions {
    pub backend_type: BackendType,
    #[serde(default)]
    pub backend_options: BackendOptions,

    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: i64,
    #[serde(default = "default_restart_delay")]
    pub restart_delay_seconds: u64,

    #[serde(default = "default_true")]
    pub on_demand_start: bool,
    #[serde(default)]
    pub idle_timeout_minutes: u64,

    #[serde(default)]
    pub environment: HashMap<String, String>,

    #[serde(default)]
    pub docker_enabled: bool,
    #[serde(default)]
    pub command_override: Option<String>,

    #[serde(default)]
    pub nodes: BTreeSet<String>,
}

fn default_max_restarts() -> i64 {
    3
}
fn default_restart_delay() -> u64 {
    5
}

impl InstanceOptions {
    /// Invalid input is rejected at the boundary rather than accepted and
    /// failing later (§3/§7).
    pub fn validate(&self, name: &str) -> Result<(), Error> {
        if name.is_empty()
            || name.len() > 128
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::ValidationError {
                message: format!(
                    "instance name {name:?} must be 1-128 characters of [A-Za-z0-9_-]"
                ),
            });
        }
        if self.max_restarts < -1 {
            return Err(Error::ValidationError {
                message: "max_restarts must be -1 (unlimited) or >= 0".into(),
            });
        }
        if self.is_remote() && self.docker_enabled {
            return Err(Error::ValidationError {
                message: "a remote instance cannot also be docker_enabled".into(),
            });
        }
        Ok(())
    }

    /// True when `nodes` is nonempty — this instance is a remote/federated
    /// instance and the Manager never spawns a local subprocess for it.
    pub fn is_remote(&self) -> bool {
        !self.nodes.is_empty()
    }

    /// Whether the restart budget still allows another attempt.
    pub fn restart_budget_remaining(&self, restart_count: u32) -> bool {
        self.max_restarts < 0 || (restart_count as i64) < self.max_restarts
    }
}
