//! WarmPool controller (spec.md §4.C).
//!
//! Grounded in the teacher's `backend::kubernetes_pool::KubernetesPool`
//! (warm/active pod accounting, `replenish()`'s "create up to the
//! deficit" logic) and `backend::kubernetes_operator::run_operator`'s use
//! of `kube::runtime::controller::Controller`. The pool-conservation
//! invariant (P4: `idle + allocated` tracks `replicas` within `max_surge`)
//! is the one property this module is built to keep true no matter what
//! order events are observed in.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::ResourceExt;

use crate::controller::{jitter_seconds, ControllerContext, ReconcileError};
use crate::crd::{
    WarmPool, WarmPoolSpec, WarmPoolStatus, LABEL_POOL, LABEL_STATUS, STATUS_ALLOCATED, STATUS_IDLE,
    STATUS_TERMINATING,
};
use crate::pod_template;
use crate::types::PoolCondition;

/// A minimal view of a pod's pool membership, extracted from a live `Pod`
/// so the planning logic below never touches `k8s_openapi` types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSummary {
    pub name: String,
    pub status_label: String,
    pub restart_count: i32,
    /// `waiting.reason` of the first non-ready container, if any (e.g.
    /// `ImagePullBackOff`, `CrashLoopBackOff`) — drives the `PodsFailing`
    /// and `ImagePull` conditions.
    pub waiting_reason: Option<String>,
}

impl PodSummary {
    pub fn from_pod(pod: &Pod) -> Self {
        let status_label = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_STATUS))
            .cloned()
            .unwrap_or_else(|| STATUS_IDLE.to_string());
        let container_statuses = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref());
        let restart_count = container_statuses
            .map(|statuses| statuses.iter().map(|c| c.restart_count).max().unwrap_or(0))
            .unwrap_or(0);
        let waiting_reason = container_statuses.and_then(|statuses| {
            statuses
                .iter()
                .find_map(|c| c.state.as_ref()?.waiting.as_ref()?.reason.clone())
        });
        Self {
            name: pod.name_any(),
            status_label,
            restart_count,
            waiting_reason,
        }
    }
}

/// What the controller should do this reconcile: create `create` new
/// pods, delete the pods named in `delete` (failing idle pods first, then
/// oldest-named surplus idle pods for determinism).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReconcilePlan {
    pub create: usize,
    pub delete: Vec<String>,
}

/// Pure reconciliation planner (spec.md P4: pool conservation).
///
/// `restart_threshold` idle pods at or above it are always deleted
/// (they're crash-looping and useless); the remaining healthy idle pods
/// plus allocated pods are compared against `spec.replicas`, with at most
/// `spec.max_surge` extra pods tolerated transiently while new ones start.
pub fn plan_reconcile(spec: &WarmPoolSpec, pods: &[PodSummary], restart_threshold: i32) -> ReconcilePlan {
    let desired = spec.replicas as usize;

    let allocated_count = pods.iter().filter(|p| p.status_label == STATUS_ALLOCATED).count();

    let mut healthy_idle: Vec<&PodSummary> = pods
        .iter()
        .filter(|p| p.status_label == STATUS_IDLE && p.restart_count < restart_threshold)
        .collect();
    healthy_idle.sort_by(|a, b| a.name.cmp(&b.name));

    let failing_idle: Vec<&PodSummary> = pods
        .iter()
        .filter(|p| p.status_label == STATUS_IDLE && p.restart_count >= restart_threshold)
        .collect();

    let mut delete: Vec<String> = failing_idle.iter().map(|p| p.name.clone()).collect();

    let accounted = healthy_idle.len() + allocated_count;
    let mut create = desired.saturating_sub(accounted);

    if accounted > desired {
        let excess = accounted - desired;
        for p in healthy_idle.iter().take(excess) {
            delete.push(p.name.clone());
        }
    }

    let non_terminating = pods.iter().filter(|p| p.status_label != STATUS_TERMINATING).count();
    let surge_cap = desired + spec.max_surge as usize;
    let after_delete = non_terminating.saturating_sub(delete.len());
    let create_budget = surge_cap.saturating_sub(after_delete);
    create = create.min(create_budget);

    ReconcilePlan { create, delete }
}

/// Message substrings that mark a container failure as transient
/// API-throttling rather than a genuine crash, per spec.md §4.C: these
/// must never flip `PodsFailing` to `True`.
const RATE_LIMIT_MARKERS: &[&str] = &["qps exceeded", "rate limit", "toomanyrequests", "429"];

fn is_transient_rate_limit(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Status conditions reported on the WarmPool (spec.md §4.C): `Ready`,
/// `Progressing` (pre-existing), plus `PodsReady`, `PodsFailing`, and
/// `ImagePull`, derived from the same pod summaries `plan_reconcile` saw.
pub fn compute_conditions(
    desired: u32,
    ready_replicas: u32,
    allocated_replicas: u32,
    pods: &[PodSummary],
    restart_threshold: i32,
) -> Vec<PoolCondition> {
    let total = ready_replicas + allocated_replicas;
    let is_ready = if desired == 0 { true } else { ready_replicas >= 1 };
    let ready = PoolCondition::new(
        "Ready",
        is_ready,
        if is_ready { "ReplicasAvailable" } else { "NoIdlePods" },
        format!("{ready_replicas} idle replicas available"),
    );
    let progressing = PoolCondition::new(
        "Progressing",
        total < desired,
        if total < desired { "ScalingUp" } else { "AtDesiredReplicas" },
        format!("{total}/{desired} replicas ready"),
    );

    let pods_ready_ok = ready_replicas == desired;
    let pods_ready = PoolCondition::new(
        "PodsReady",
        pods_ready_ok,
        if pods_ready_ok {
            "ReadyReplicasMatch"
        } else {
            "ReadyReplicasBelowDesired"
        },
        format!("{ready_replicas}/{desired} ready replicas"),
    );

    let failing: Vec<&PodSummary> = pods
        .iter()
        .filter(|p| p.restart_count >= restart_threshold || p.waiting_reason.is_some())
        .collect();
    let all_transient = !failing.is_empty()
        && failing
            .iter()
            .all(|p| p.waiting_reason.as_deref().is_some_and(is_transient_rate_limit));
    let pods_failing_bool = !failing.is_empty() && !all_transient;
    let failing_message = failing
        .iter()
        .take(3)
        .map(|p| {
            format!(
                "{}={}",
                p.name,
                p.waiting_reason.as_deref().unwrap_or("CrashLoopBackOff")
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    let pods_failing = PoolCondition::new(
        "PodsFailing",
        pods_failing_bool,
        if pods_failing_bool {
            "PodsCrashLooping"
        } else {
            "NoFailingPods"
        },
        failing_message,
    );

    let image_pull_bool = pods
        .iter()
        .any(|p| matches!(p.waiting_reason.as_deref(), Some("ImagePullBackOff") | Some("ErrImagePull")));
    let image_pull = PoolCondition::new(
        "ImagePull",
        image_pull_bool,
        if image_pull_bool { "ImagePullBackOff" } else { "ImagesAvailable" },
        "",
    );

    vec![ready, progressing, pods_ready, pods_failing, image_pull]
}

/// Reconcile a single WarmPool: list its pods, plan, and apply.
pub async fn reconcile(pool: Arc<WarmPool>, ctx: Arc<ControllerContext>) -> Result<Action, ReconcileError> {
    let client = &ctx.client;
    let namespace = pool.namespace().unwrap_or_else(|| "default".to_string());
    let name = pool.name_any();
    let resource_version = pool.resource_version().unwrap_or_default();

    let pools: Api<WarmPool> = Api::namespaced(client.clone(), &namespace);
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

    let list_params = ListParams::default().labels(&format!("{LABEL_POOL}={name}"));
    let pod_list = pods.list(&list_params).await.map_err(anyhow::Error::from)?;
    let summaries: Vec<PodSummary> = pod_list.items.iter().map(PodSummary::from_pod).collect();

    let plan = plan_reconcile(&pool.spec, &summaries, ctx.config.restart_threshold);

    for pod_name in &plan.delete {
        if let Err(e) = pods.delete(pod_name, &DeleteParams::default()).await {
            eprintln!("warmpool {name}: failed to delete pod {pod_name}: {e}");
        }
    }

    let mut created = 0usize;
    let existing_names: std::collections::HashSet<&str> =
        summaries.iter().map(|p| p.name.as_str()).collect();
    for i in 0..plan.create {
        let pod_name = unique_pod_name(&name, &existing_names, i);
        let nodes = Vec::new(); // node inventory is out of this controller's scope; see Open Questions
        match pod_template::build_pod(&name, &namespace, &pool.spec, &pod_name, &nodes, 9090) {
            Ok(pod) => match pods.create(&PostParams::default(), &pod).await {
                Ok(_) => created += 1,
                Err(e) => eprintln!("warmpool {name}: failed to create pod {pod_name}: {e}"),
            },
            Err(e) => eprintln!("warmpool {name}: failed to build pod template: {e}"),
        }
    }

    let allocated_replicas = summaries.iter().filter(|p| p.status_label == STATUS_ALLOCATED).count() as u32;
    let ready_replicas = summaries
        .iter()
        .filter(|p| p.status_label == STATUS_IDLE && p.restart_count < ctx.config.restart_threshold)
        .count() as u32
        + created as u32;

    let conditions = compute_conditions(
        pool.spec.replicas,
        ready_replicas,
        allocated_replicas,
        &summaries,
        ctx.config.restart_threshold,
    );
    let status = serde_json::json!({
        "status": WarmPoolStatus {
            replicas: pool.spec.replicas,
            ready_replicas,
            allocated_replicas,
            conditions,
        }
    });
    if let Err(e) = pools
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
        .await
    {
        eprintln!("warmpool {name}: failed to patch status: {e}");
    }

    let base = ctx.config.warmpool_reconcile_seconds;
    let requeue_after = base + jitter_seconds(&resource_version, base.max(1));
    Ok(Action::requeue(Duration::from_secs(requeue_after)))
}

pub fn error_policy(_pool: Arc<WarmPool>, error: &ReconcileError, _ctx: Arc<ControllerContext>) -> Action {
    eprintln!("warmpool reconcile error: {error}");
    Action::requeue(Duration::from_secs(30))
}

fn unique_pod_name(pool_name: &str, existing: &std::collections::HashSet<&str>, attempt: usize) -> String {
    for i in attempt.. {
        let candidate = format!("{pool_name}-{i:05}");
        if !existing.contains(candidate.as_str()) {
            return candidate;
        }
    }
    unreachable!("usize iteration never exhausts")
}

/// Run the WarmPool controller loop for all namespaces (mirrors the
/// teacher's `run_operator`).
pub async fn run(client: kube::Client, config: Arc<crate::config::ControllerConfig>) -> anyhow::Result<()> {
    use futures::StreamExt;

    let pools: Api<WarmPool> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let ctx = Arc::new(ControllerContext { client, config });

    Controller::new(pools, WatcherConfig::default())
        .owns(pods, WatcherConfig::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                eprintln!("warmpool controller error: {e}");
            }
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ImageLocality, ResourceRequirements};

    fn spec(replicas: u32, max_surge: u32) -> WarmPoolSpec {
        WarmPoolSpec {
            image: "busybox:1.35".into(),
            workspace_dir: "/workspace".into(),
            replicas,
            resources: ResourceRequirements::default(),
            image_locality: ImageLocality::default(),
            tools: Vec::new(),
            max_surge,
        }
    }

    fn idle(name: &str, restarts: i32) -> PodSummary {
        PodSummary {
            name: name.into(),
            status_label: STATUS_IDLE.into(),
            restart_count: restarts,
            waiting_reason: None,
        }
    }

    fn allocated(name: &str) -> PodSummary {
        PodSummary {
            name: name.into(),
            status_label: STATUS_ALLOCATED.into(),
            restart_count: 0,
            waiting_reason: None,
        }
    }

    fn idle_waiting(name: &str, reason: &str) -> PodSummary {
        PodSummary {
            name: name.into(),
            status_label: STATUS_IDLE.into(),
            restart_count: 0,
            waiting_reason: Some(reason.into()),
        }
    }

    #[test]
    fn creates_up_to_deficit_from_empty() {
        let plan = plan_reconcile(&spec(3, 1), &[], 3);
        assert_eq!(plan.create, 3);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn p4_pool_conservation_counts_allocated_toward_replicas() {
        let pods = vec![idle("p-0", 0), allocated("p-1")];
        let plan = plan_reconcile(&spec(2, 1), &pods, 3);
        assert_eq!(plan.create, 0);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn deletes_failing_idle_pods_regardless_of_replica_count() {
        let pods = vec![idle("p-0", 5), idle("p-1", 0)];
        let plan = plan_reconcile(&spec(2, 1), &pods, 3);
        assert!(plan.delete.contains(&"p-0".to_string()));
        assert_eq!(plan.create, 1);
    }

    #[test]
    fn scale_down_deletes_surplus_healthy_idle_pods_oldest_name_first() {
        let pods = vec![idle("p-0", 0), idle("p-1", 0), idle("p-2", 0)];
        let plan = plan_reconcile(&spec(1, 1), &pods, 3);
        assert_eq!(plan.delete, vec!["p-0".to_string(), "p-1".to_string()]);
        assert_eq!(plan.create, 0);
    }

    #[test]
    fn create_is_bounded_by_max_surge() {
        // 10 pods already terminating shouldn't count against the surge
        // cap, but a large deficit should still be capped by max_surge.
        let pods: Vec<PodSummary> = Vec::new();
        let plan = plan_reconcile(&spec(100, 2), &pods, 3);
        assert_eq!(plan.create, 2);
    }

    #[test]
    fn conditions_report_not_ready_with_no_idle_pods() {
        let conds = compute_conditions(3, 0, 1, &[], 3);
        let ready = conds.iter().find(|c| c.condition_type == "Ready").unwrap();
        assert!(!ready.is_true());
        assert_eq!(ready.reason, "NoIdlePods");
    }

    #[test]
    fn conditions_report_ready_with_any_idle_pod_even_below_desired() {
        let conds = compute_conditions(3, 1, 1, &[], 3);
        let ready = conds.iter().find(|c| c.condition_type == "Ready").unwrap();
        assert!(ready.is_true());
    }

    #[test]
    fn zero_replica_pool_is_trivially_ready() {
        let conds = compute_conditions(0, 0, 0, &[], 3);
        let ready = conds.iter().find(|c| c.condition_type == "Ready").unwrap();
        assert!(ready.is_true());
    }

    #[test]
    fn pods_failing_true_on_crash_looping_pod() {
        let pods = vec![idle("p-0", 5)];
        let conds = compute_conditions(1, 0, 0, &pods, 3);
        let failing = conds.iter().find(|c| c.condition_type == "PodsFailing").unwrap();
        assert!(failing.is_true());
    }

    #[test]
    fn pods_failing_false_when_only_rate_limited() {
        let pods = vec![idle_waiting("p-0", "RateLimitExceeded: 429 too many requests")];
        let conds = compute_conditions(1, 0, 0, &pods, 3);
        let failing = conds.iter().find(|c| c.condition_type == "PodsFailing").unwrap();
        assert!(!failing.is_true());
    }

    #[test]
    fn image_pull_condition_flags_backoff() {
        let pods = vec![idle_waiting("p-0", "ImagePullBackOff")];
        let conds = compute_conditions(1, 0, 0, &pods, 3);
        let image_pull = conds.iter().find(|c| c.condition_type == "ImagePull").unwrap();
        assert!(image_pull.is_true());
    }

    #[test]
    fn pods_ready_false_when_below_desired() {
        let conds = compute_conditions(3, 1, 0, &[], 3);
        let pods_ready = conds.iter().find(|c| c.condition_type == "PodsReady").unwrap();
        assert!(!pods_ready.is_true());
    }
}
