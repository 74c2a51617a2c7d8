use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single argv-command execution request within a batch, mirroring
/// the Gateway's own `arl::types::StepRequest` wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(rename = "workDir", default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl StepRequest {
    pub fn new(name: impl Into<String>, command: &[&str]) -> Self {
        Self {
            name: name.into(),
            command: command.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
            work_dir: None,
            timeout: None,
        }
    }
}

/// Output of a single step's command execution.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, rename = "exitCode")]
    pub exit_code: i32,
}

/// A single recorded step, returned in execute responses and history.
#[derive(Debug, Clone, Deserialize)]
pub struct StepResult {
    pub index: u64,
    pub name: String,
    pub output: StepOutput,
    #[serde(rename = "snapshotId", default)]
    pub snapshot_id: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Information about an active session.
#[derive(Debug, Clone, Deserialize)]
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

/// `POST /v1/sessions` request body (internal; use [`crate::Arl::create_session`]).
#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct SessionCreateRequest {
    #[serde(rename = "poolRef")]
    pub pool_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "idleTimeoutSeconds", skip_serializing_if = "Option::is_none")]
    pub idle_timeout_seconds: Option<u64>,
    #[serde(rename = "maxLifetimeSeconds", skip_serializing_if = "Option::is_none")]
    pub max_lifetime_seconds: Option<u64>,
}

/// Options accepted by [`crate::Arl::create_session`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub namespace: Option<String>,
    pub idle_timeout_seconds: Option<u64>,
    pub max_lifetime_seconds: Option<u64>,
}

/// `POST /v1/sessions/{id}/execute` request body (internal).
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ExecuteRequest {
    pub steps: Vec<StepRequest>,
    #[serde(rename = "traceID", skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// `POST /v1/sessions/{id}/execute` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteResponse {
    #[serde(rename = "sessionID")]
    pub session_id: Uuid,
    pub results: Vec<StepResult>,
    #[serde(rename = "totalDurationMs")]
    pub total_duration_ms: u64,
}

/// `POST /v1/sessions/{id}/restore` request body (internal).
#[derive(Debug, Clone, Serialize)]
pub(crate) struct RestoreRequest {
    #[serde(rename = "snapshotID")]
    pub snapshot_id: String,
}

/// A pool condition, matching `arl::types::PoolCondition`.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Kubernetes-quantity-valued resource requests/limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// An inline tool manifest entry, as accepted by `POST /v1/pools`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineTool {
    pub name: String,
    pub runtime: String,
    pub entrypoint: Vec<String>,
}

/// `POST /v1/pools` request body (internal; use [`crate::Arl::create_pool`]).
#[derive(Debug, Clone, Serialize)]
pub(crate) struct PoolCreateRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub image: String,
    pub replicas: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(rename = "workspaceDir", skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<InlineTool>,
}

/// `PATCH /v1/pools/{name}` request body (internal).
#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct PoolPatchRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// `GET`/`PATCH /v1/pools/{name}` response body.
#[derive(Debug, Clone, Deserialize)]
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

/// Error body shape carried by every 4xx/5xx response (spec.md §6.1).
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorBody {
    pub error: String,
    pub detail: Option<String>,
}
