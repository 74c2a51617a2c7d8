//! Kubernetes CRD types for `arl.infra.io/v1alpha1`: `WarmPool`, `Sandbox`,
//! `Task`.
//!
//! Grounded directly in the teacher's `AgentSandbox`/`AgentSandboxPool`
//! CRDs (`kube::CustomResource` derive, `schemars::JsonSchema`, namespaced,
//! with a status subresource) and renamed/reshaped to the entities of
//! spec.md §3. `Task` exists only for the historic clients spec.md §6.2
//! calls out; its semantics match an `ExecuteRequest` tied to a Sandbox,
//! per the Python original's `session.py::execute()`, which creates a
//! `Task` object and polls `status.state`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::types::{ImageLocality, InlineTool, PoolCondition, ResourceRequirements, StepRequest, StepResult};

/// Label applied to every pod belonging to a WarmPool.
pub const LABEL_POOL: &str = "arl.infra.io/pool";
/// Label whose value is either `idle`, `allocated`, or `terminating`.
pub const LABEL_STATUS: &str = "arl.infra.io/status";
/// Label set to the owning Sandbox's name while a pod is allocated.
pub const LABEL_SESSION: &str = "arl.infra.io/session";

pub const STATUS_IDLE: &str = "idle";
pub const STATUS_ALLOCATED: &str = "allocated";
pub const STATUS_TERMINATING: &str = "terminating";

/// Spec of a WarmPool: a declared template plus a target replica count.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "arl.infra.io",
    version = "v1alpha1",
    kind = "WarmPool",
    plural = "warmpools",
    shortname = "wp",
    status = "WarmPoolStatus",
    namespaced
)]
pub struct WarmPoolSpec {
    pub image: String,
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub image_locality: ImageLocality,
    #[serde(default)]
    pub tools: Vec<InlineTool>,
    /// Maximum number of pods allowed above `replicas` during scale-down
    /// transitions (spec.md §3 invariant).
    #[serde(default = "default_max_surge")]
    pub max_surge: u32,
}

fn default_workspace_dir() -> String {
    "/workspace".to_string()
}

fn default_max_surge() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct WarmPoolStatus {
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub ready_replicas: u32,
    #[serde(default)]
    pub allocated_replicas: u32,
    #[serde(default)]
    pub conditions: Vec<PoolCondition>,
}

/// Spec of a Sandbox: a per-allocation binding to an idle pod of a named
/// pool.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "arl.infra.io",
    version = "v1alpha1",
    kind = "Sandbox",
    plural = "sandboxes",
    shortname = "sbx",
    status = "SandboxStatus",
    namespaced
)]
pub struct SandboxSpec {
    pub pool_ref: String,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lifetime_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum SandboxPhase {
    #[default]
    Pending,
    Ready,
    Failed,
    Terminated,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SandboxStatus {
    #[serde(default)]
    pub phase: SandboxPhase,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub pod_ip: String,
    #[serde(default)]
    pub adopted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<PoolCondition>,
}

/// A `Task` ties a batch of steps to an already-adopted Sandbox, for
/// clients that predate the Gateway's `/execute` REST endpoint. See
/// spec.md §6.2.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "arl.infra.io",
    version = "v1alpha1",
    kind = "Task",
    plural = "tasks",
    status = "TaskStatus",
    namespaced
)]
pub struct TaskSpec {
    pub sandbox_ref: String,
    pub steps: Vec<StepRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TaskStatus {
    #[serde(default)]
    pub state: TaskState,
    #[serde(default)]
    pub results: Vec<StepResult>,
    #[serde(default)]
    pub message: String,
}

/// Standard labels every pod belonging to `pool` must carry while idle.
pub fn warm_labels(pool: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_POOL.to_string(), pool.to_string());
    labels.insert(LABEL_STATUS.to_string(), STATUS_IDLE.to_string());
    labels
}

/// Render both CRDs as YAML for `arl crds print` (mirrors
/// `generate_crd_manifests` in the teacher's operator module).
pub fn generate_crd_manifests() -> anyhow::Result<Vec<(&'static str, String)>> {
    Ok(vec![
        ("WarmPool", serde_yaml::to_string(&WarmPool::crd())?),
        ("Sandbox", serde_yaml::to_string(&Sandbox::crd())?),
        ("Task", serde_yaml::to_string(&Task::crd())?),
    ])
}
