//! Gateway configuration: an `arl.toml` file parsed with `serde` + `toml`,
//! overridable by CLI flags. The Gateway itself never reads the
//! `ARL_*` environment variables of spec.md §6.3 — those are consumed only
//! by CLI/benchmark clients (`src/main.rs`, `sdk/rust`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure for the `arl` gateway and controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub sidecar: SidecarConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            controller: ControllerConfig::default(),
            sidecar: SidecarConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the HTTP/WebSocket server listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Namespace used when a request doesn't specify one.
    #[serde(default = "default_namespace")]
    pub default_namespace: String,
    /// Used when `POST /v1/sessions` omits `idleTimeoutSeconds`.
    #[serde(default = "default_idle_timeout_seconds")]
    pub default_idle_timeout_seconds: u64,
    /// Upper bound on concurrently tracked sessions; session creation past
    /// this is refused with `ArlError::Transient`.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Deadline for "sandbox becomes Ready" polling on session creation
    /// (spec.md §5, default 5 min).
    #[serde(default = "default_sandbox_ready_timeout_seconds")]
    pub sandbox_ready_timeout_seconds: u64,
    /// Per-session history cap (spec.md §9 Open Question, resolved:
    /// unbounded by default). `None` means unbounded.
    #[serde(default)]
    pub max_history: Option<usize>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_namespace() -> String {
    "default".to_string()
}
fn default_idle_timeout_seconds() -> u64 {
    900
}
fn default_max_sessions() -> usize {
    10_000
}
fn default_sandbox_ready_timeout_seconds() -> u64 {
    300
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            default_namespace: default_namespace(),
            default_idle_timeout_seconds: default_idle_timeout_seconds(),
            max_sessions: default_max_sessions(),
            sandbox_ready_timeout_seconds: default_sandbox_ready_timeout_seconds(),
            max_history: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// How often the WarmPool controller sweeps each pool.
    #[serde(default = "default_warmpool_reconcile_seconds")]
    pub warmpool_reconcile_seconds: u64,
    /// How often the Sandbox controller sweeps for idle/lifetime reaping.
    #[serde(default = "default_sandbox_reconcile_seconds")]
    pub sandbox_reconcile_seconds: u64,
    /// Restart-count threshold beyond which a pod is considered failing
    /// (spec.md §4.C, default 3).
    #[serde(default = "default_restart_threshold")]
    pub restart_threshold: i32,
    /// Max optimistic-concurrency retries before a conflict is surfaced
    /// (spec.md §5).
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

fn default_warmpool_reconcile_seconds() -> u64 {
    10
}
fn default_sandbox_reconcile_seconds() -> u64 {
    5
}
fn default_restart_threshold() -> i32 {
    3
}
fn default_max_conflict_retries() -> u32 {
    5
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            warmpool_reconcile_seconds: default_warmpool_reconcile_seconds(),
            sandbox_reconcile_seconds: default_sandbox_reconcile_seconds(),
            restart_threshold: default_restart_threshold(),
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarConfig {
    /// Well-known TCP port the sidecar's RPC surface listens on in every
    /// pod (spec.md §4.A).
    #[serde(default = "default_sidecar_port")]
    pub port: u16,
    /// Per-RPC-call timeout, independent of a step's own `timeout` field.
    #[serde(default = "default_sidecar_rpc_timeout_seconds")]
    pub rpc_timeout_seconds: u64,
}

fn default_sidecar_port() -> u16 {
    9090
}
fn default_sidecar_rpc_timeout_seconds() -> u64 {
    60
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            port: default_sidecar_port(),
            rpc_timeout_seconds: default_sidecar_rpc_timeout_seconds(),
        }
    }
}

/// Which snapshotting strategy the sidecar is asked to use. The Gateway
/// itself is agnostic (spec.md §9 Design Notes); this only picks the
/// label recorded for diagnostics, since the actual git-commit mechanics
/// run inside the pod via `sidecar::Execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStrategy {
    GitCommit,
    ContentHash,
}

impl Default for SnapshotStrategy {
    fn default() -> Self {
        SnapshotStrategy::GitCommit
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub strategy: SnapshotStrategy,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            strategy: SnapshotStrategy::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML configuration")
    }
}
