//! Core data model shared by the controllers, the Gateway, and the CRDs.
//!
//! Field names/casing follow the wire shapes already exercised by the
//! original Python SDK (`examples/original_source/sdk/python/arl/arl/types.py`):
//! camelCase on the wire, snake_case in Rust, via `#[serde(rename_all = ...)]`
//! and explicit `rename` where the two diverge (`snapshot_id`, `podIP`, ...).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single argv-command execution request within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    /// Unique within the batch it belongs to.
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(rename = "workDir", default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    /// Seconds; must be > 0 if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl StepRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("step name must not be empty".into());
        }
        if self.command.is_empty() {
            return Err("step command must not be empty".into());
        }
        if let Some(0) = self.timeout {
            return Err("step timeout must be > 0 if set".into());
        }
        Ok(())
    }
}

/// Output of a single step's command execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, rename = "exitCode")]
    pub exit_code: i32,
}

/// A single recorded step, with its input, output, and a snapshot of
/// workspace state after the step ran. `index` is 0-based and strictly
/// increasing within a session's history (spec.md P1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub index: u64,
    pub name: String,
    pub input: StepRequest,
    pub output: StepOutput,
    /// Empty only if snapshotting failed for this step.
    #[serde(rename = "snapshotId", default)]
    pub snapshot_id: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Information about an active session, returned by the Gateway's
/// `POST /v1/sessions` and `GET /v1/sessions/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    #[serde(rename = "sandboxName")]
    pub sandbox_name: String,
    pub namespace: String,
    #[serde(rename = "poolRef")]
    pub pool_ref: String,
    #[serde(rename = "podIP", default)]
    pub pod_ip: String,
    #[serde(rename = "podName", default)]
    pub pod_name: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// `POST /v1/sessions` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionCreateRequest {
    #[serde(rename = "poolRef")]
    pub pool_ref: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(rename = "idleTimeoutSeconds", default)]
    pub idle_timeout_seconds: Option<u64>,
    #[serde(rename = "maxLifetimeSeconds", default)]
    pub max_lifetime_seconds: Option<u64>,
    #[serde(rename = "maxHistory", default)]
    pub max_history: Option<usize>,
}

/// `POST /v1/sessions/{id}/execute` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    pub steps: Vec<StepRequest>,
    #[serde(rename = "traceID", default)]
    pub trace_id: Option<String>,
}

/// `POST /v1/sessions/{id}/execute` response body.
///
/// `error` is only set when a step's sidecar RPC itself failed partway
/// through the batch (spec.md §4.E.2): `results` still carries every step
/// that completed before the failure, and the HTTP status surfaced
/// alongside this body is a 5xx keyed off `error`. A non-zero `exitCode`
/// in `results` is never an error and never sets this field.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    #[serde(rename = "sessionID")]
    pub session_id: Uuid,
    pub results: Vec<StepResult>,
    #[serde(rename = "totalDurationMs")]
    pub total_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::error::ErrorResponse>,
}

/// `POST /v1/sessions/{id}/restore` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct RestoreRequest {
    #[serde(rename = "snapshotID")]
    pub snapshot_id: String,
}

/// A status condition, mirroring `metav1.Condition` closely enough for our
/// purposes without depending on it directly.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema, PartialEq, Eq)]
pub struct PoolCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl PoolCondition {
    pub fn new(condition_type: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn unknown(condition_type: &str, reason: &str, message: impl Into<String>) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: "Unknown".to_string(),
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Runtime for an inline tool's entrypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ToolRuntime {
    Bash,
    Python,
    Binary,
}

/// A pool-declared tool materialized under `/opt/arl/tools/<name>/` on pod
/// init. See spec.md §3 (`InlineTool`).
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct InlineTool {
    pub name: String,
    pub runtime: ToolRuntime,
    /// Must be a key of `files`.
    pub entrypoint: String,
    /// Go-duration-format string, e.g. "30s"; carried through unparsed for
    /// wire compatibility with the original implementation, parsed by the
    /// sidecar (out of scope here).
    #[serde(default)]
    pub timeout: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub description: String,
}

/// Validates name/entrypoint invariants from spec.md §3: the name pattern
/// `[A-Za-z0-9][A-Za-z0-9_.-]{0,62}` and "entrypoint must be a key of
/// files".
impl InlineTool {
    pub fn validate(&self) -> Result<(), String> {
        crate::validation::validate_tool_name(&self.name)?;
        if !self.files.contains_key(&self.entrypoint) {
            return Err(format!(
                "entrypoint '{}' must be a key in files",
                self.entrypoint
            ));
        }
        Ok(())
    }
}

/// One entry of `/opt/arl/tools/registry.json`, as read back by the
/// Gateway's tool-listing API (spec.md §4.E.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub entrypoint: String,
    pub runtime: ToolRuntime,
    #[serde(default)]
    pub timeout: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsRegistry {
    #[serde(default)]
    pub tools: Vec<ToolManifest>,
}

/// Result of a tool call: raw stdout is always returned; `parsed` is
/// best-effort JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    #[serde(rename = "rawOutput")]
    pub raw_output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<serde_json::Value>,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    pub stderr: String,
}

/// A single JSONL line of a session's exported trajectory
/// (`GET /v1/sessions/{id}/trajectory`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryEntry {
    pub session_id: Uuid,
    pub step: u64,
    pub action: TrajectoryAction,
    pub observation: TrajectoryObservation,
    #[serde(default)]
    pub snapshot_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryAction {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub work_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryObservation {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Interactive-shell WebSocket message, tagged on `type` exactly like
/// `daemon/protocol.rs`'s `DaemonRequest`/`DaemonResponse` in the teacher
/// repo, per spec.md §4.E.6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShellMessage {
    Input { data: String },
    Signal { signal: String },
    Resize { cols: u16, rows: u16 },
    Output { data: String },
    Exit { exit_code: i32 },
    Error { data: String },
}

/// `POST /v1/pools` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolCreateRequest {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub image: String,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
    #[serde(rename = "workspaceDir", default)]
    pub workspace_dir: Option<String>,
    #[serde(default)]
    pub tools: Vec<InlineTool>,
}

/// `PATCH /v1/pools/{name}` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolPatchRequest {
    #[serde(default)]
    pub replicas: Option<u32>,
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// `GET`/`PATCH /v1/pools/{name}` response body, matching
/// `examples/original_source/sdk/python/arl/arl/types.py::PoolInfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolInfo {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub replicas: u32,
    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: u32,
    #[serde(rename = "allocatedReplicas", default)]
    pub allocated_replicas: u32,
    #[serde(default)]
    pub conditions: Vec<PoolCondition>,
}

/// Kubernetes-quantity-valued resource requests/limits, validated by
/// `validation::validate_quantity`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

impl ResourceRequirements {
    pub fn validate(&self) -> Result<(), String> {
        for (k, v) in self.requests.iter().chain(self.limits.iter()) {
            crate::validation::validate_quantity(k, v)?;
        }
        Ok(())
    }
}

/// `imageLocality` config block of a WarmPool.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ImageLocality {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_spread_factor")]
    pub spread_factor: f64,
    #[serde(default = "default_weight")]
    pub weight: i32,
}

fn default_true() -> bool {
    true
}
fn default_spread_factor() -> f64 {
    1.0
}
fn default_weight() -> i32 {
    80
}

impl Default for ImageLocality {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            spread_factor: default_spread_factor(),
            weight: default_weight(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_request_rejects_empty_command() {
        let step = StepRequest {
            name: "s".into(),
            command: vec![],
            env: BTreeMap::new(),
            work_dir: None,
            timeout: None,
        };
        assert!(step.validate().is_err());
    }

    #[test]
    fn step_request_rejects_zero_timeout() {
        let step = StepRequest {
            name: "s".into(),
            command: vec!["echo".into()],
            env: BTreeMap::new(),
            work_dir: None,
            timeout: Some(0),
        };
        assert!(step.validate().is_err());
    }

    #[test]
    fn session_create_request_parses_camelcase_wire_fields() {
        let body = r#"{"poolRef":"p1","namespace":"ns1","idleTimeoutSeconds":60}"#;
        let req: SessionCreateRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.pool_ref, "p1");
        assert_eq!(req.namespace.as_deref(), Some("ns1"));
        assert_eq!(req.idle_timeout_seconds, Some(60));
        assert_eq!(req.max_lifetime_seconds, None);
    }

    #[test]
    fn pool_create_request_parses_camelcase_wire_fields() {
        let body = r#"{"name":"p1","image":"alpine:3.20","replicas":2,"workspaceDir":"/ws"}"#;
        let req: PoolCreateRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.name, "p1");
        assert_eq!(req.workspace_dir.as_deref(), Some("/ws"));
        assert_eq!(req.namespace, None);
    }

    #[test]
    fn pool_info_serializes_camelcase_replica_fields() {
        let info = PoolInfo {
            name: "p1".into(),
            namespace: "default".into(),
            replicas: 2,
            ready_replicas: 1,
            allocated_replicas: 1,
            conditions: vec![],
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"readyReplicas\":1"));
        assert!(json.contains("\"allocatedReplicas\":1"));
    }

    #[test]
    fn inline_tool_requires_entrypoint_in_files() {
        let tool = InlineTool {
            name: "greet".into(),
            runtime: ToolRuntime::Bash,
            entrypoint: "run.sh".into(),
            timeout: "10s".into(),
            parameters: serde_json::json!({}),
            files: BTreeMap::new(),
            description: String::new(),
        };
        assert!(tool.validate().is_err());
    }
}
