//! Sandbox controller (spec.md §4.D).
//!
//! Adopts one idle pod from a WarmPool into a Sandbox via a
//! compare-and-swap relabel (optimistic concurrency on the pod's
//! `resourceVersion`, the same mechanism the teacher's
//! `kubernetes_pool.rs::acquire` leans on for its warm→active relabel),
//! then reaps the Sandbox once it goes idle past `idle_timeout_seconds`
//! or exceeds `max_lifetime_seconds`. P5 (single-claim) holds because the
//! Kubernetes API server itself rejects a patch whose `resourceVersion`
//! doesn't match current state with a 409 — only one of N racing
//! reconciles can ever win a given pod.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::ResourceExt;

use crate::controller::{jitter_seconds, ControllerContext, ReconcileError};
use crate::crd::{
    Sandbox, SandboxPhase, SandboxStatus, WarmPool, LABEL_POOL, LABEL_SESSION, LABEL_STATUS,
    STATUS_ALLOCATED, STATUS_IDLE, STATUS_TERMINATING,
};

/// Finalizer name added to every Sandbox so that an explicit delete (or
/// an idle/lifetime reap, which now goes through the same API-server
/// delete path) always runs `cleanup` before the object is actually
/// removed: spec.md line 115 requires the bound pod to be relabeled
/// `status=terminating` and deleted, never handed back to the idle pool.
const SANDBOX_FINALIZER: &str = "arl.infra.io/sandbox-cleanup";

/// A candidate idle pod available for adoption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodCandidate {
    pub name: String,
    pub resource_version: String,
    pub status_label: String,
}

/// Deterministically pick the next pod to attempt adoption on: the
/// alphabetically first idle candidate. Determinism matters for test
/// reproducibility; it has no bearing on correctness since the CAS patch
/// is what actually enforces single-claim.
pub fn plan_adoption(candidates: &[PodCandidate]) -> Option<&PodCandidate> {
    candidates
        .iter()
        .filter(|c| c.status_label == STATUS_IDLE)
        .min_by(|a, b| a.name.cmp(&b.name))
}

/// Whether an adopted Sandbox should be reaped this reconcile, and why.
pub fn should_reap(
    status: &SandboxStatus,
    idle_timeout_seconds: Option<u64>,
    max_lifetime_seconds: Option<u64>,
    now: DateTime<Utc>,
) -> Option<&'static str> {
    if status.phase != SandboxPhase::Ready {
        return None;
    }
    if let (Some(max_seconds), Some(adopted_at)) = (max_lifetime_seconds, status.adopted_at) {
        if (now - adopted_at).num_seconds() >= max_seconds as i64 {
            return Some("MaxLifetimeExceeded");
        }
    }
    if let (Some(idle_seconds), Some(last_activity)) = (idle_timeout_seconds, status.last_activity_at) {
        if (now - last_activity).num_seconds() >= idle_seconds as i64 {
            return Some("IdleTimeoutExceeded");
        }
    }
    None
}

/// Build the merge-patch body that performs the CAS relabel: includes the
/// candidate's `resourceVersion` so the API server enforces optimistic
/// concurrency even though this is a merge (not a full replace).
fn adoption_patch(sandbox_name: &str, candidate: &PodCandidate) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "resourceVersion": candidate.resource_version,
            "labels": {
                LABEL_STATUS: STATUS_ALLOCATED,
                LABEL_SESSION: sandbox_name,
            }
        }
    })
}

/// Build the merge-patch body that marks a pod as being torn down, per
/// spec.md line 115 ("set pod `status=terminating`, delete the pod"):
/// pods are single-use, so this never clears `LABEL_SESSION` — the pod is
/// deleted immediately after this patch lands, not recycled.
fn terminating_patch() -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "labels": {
                LABEL_STATUS: STATUS_TERMINATING,
            }
        }
    })
}

async fn try_adopt(
    pods: &Api<Pod>,
    sandbox_name: &str,
    pool_ref: &str,
    max_retries: u32,
) -> anyhow::Result<Option<(String, String)>> {
    for _attempt in 0..=max_retries {
        let list_params = ListParams::default().labels(&format!("{LABEL_POOL}={pool_ref},{LABEL_STATUS}={STATUS_IDLE}"));
        let list = pods.list(&list_params).await?;
        let candidates: Vec<PodCandidate> = list
            .items
            .iter()
            .map(|p| PodCandidate {
                name: p.name_any(),
                resource_version: p.resource_version().unwrap_or_default(),
                status_label: STATUS_IDLE.to_string(),
            })
            .collect();

        let Some(candidate) = plan_adoption(&candidates) else {
            return Ok(None);
        };

        let patch = adoption_patch(sandbox_name, candidate);
        match pods
            .patch(&candidate.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(pod) => {
                let pod_ip = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.pod_ip.clone())
                    .unwrap_or_default();
                return Ok(Some((candidate.name.clone(), pod_ip)));
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                // Lost the race; retry against the refreshed candidate list.
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

/// Delete the pod bound to a Sandbox, if any: relabel it `terminating`
/// first (so a concurrent WarmPool reconcile never mistakes it for idle
/// capacity) and then issue the actual delete. Pods are single-use — the
/// WarmPool controller creates the replacement on its own next pass.
async fn delete_bound_pod(pods: &Api<Pod>, sandbox_name: &str, pod_name: &str) {
    if pod_name.is_empty() {
        return;
    }
    let patch = terminating_patch();
    if let Err(e) = pods.patch(pod_name, &PatchParams::default(), &Patch::Merge(&patch)).await {
        eprintln!("sandbox {sandbox_name}: failed to mark pod {pod_name} terminating: {e}");
    }
    if let Err(e) = pods.delete(pod_name, &DeleteParams::default()).await {
        eprintln!("sandbox {sandbox_name}: failed to delete pod {pod_name}: {e}");
    }
}

/// Finalizer cleanup: runs once, when the Sandbox object itself has a
/// `deletionTimestamp` set (explicit `DELETE`, or the `apply` reap path
/// below issuing its own delete). Always deletes the bound pod rather
/// than relabeling it back to idle — pods are single-use by default.
async fn cleanup(sandbox: Arc<Sandbox>, ctx: Arc<ControllerContext>) -> Result<Action, ReconcileError> {
    let namespace = sandbox.namespace().unwrap_or_else(|| "default".to_string());
    let name = sandbox.name_any();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);

    if let Some(status) = &sandbox.status {
        delete_bound_pod(&pods, &name, &status.pod_name).await;
    }

    Ok(Action::await_change())
}

/// Apply: the reconcile body for a Sandbox that is not being deleted —
/// adoption while `Pending`, idle/lifetime reap while `Ready`, no-op once
/// terminal.
async fn apply(sandbox: Arc<Sandbox>, ctx: Arc<ControllerContext>) -> Result<Action, ReconcileError> {
    let client = &ctx.client;
    let namespace = sandbox.namespace().unwrap_or_else(|| "default".to_string());
    let name = sandbox.name_any();
    let resource_version = sandbox.resource_version().unwrap_or_default();

    let sandboxes: Api<Sandbox> = Api::namespaced(client.clone(), &namespace);
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

    let current_phase = sandbox
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or(SandboxPhase::Pending);

    match current_phase {
        SandboxPhase::Pending => {
            let pools: Api<WarmPool> = Api::namespaced(client.clone(), &namespace);
            if pools.get_opt(&sandbox.spec.pool_ref).await.map_err(anyhow::Error::from)?.is_none() {
                eprintln!(
                    "sandbox {name}: referenced pool '{}' not found",
                    sandbox.spec.pool_ref
                );
                let status = serde_json::json!({
                    "status": SandboxStatus {
                        phase: SandboxPhase::Failed,
                        conditions: vec![crate::types::PoolCondition::new(
                            "Adopted",
                            false,
                            "PoolNotFound",
                            format!("pool '{}' does not exist", sandbox.spec.pool_ref),
                        )],
                        ..Default::default()
                    }
                });
                if let Err(e) = sandboxes
                    .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
                    .await
                {
                    eprintln!("sandbox {name}: failed to patch failed status: {e}");
                }
                return Ok(Action::await_change());
            }

            let adopted = try_adopt(&pods, &name, &sandbox.spec.pool_ref, ctx.config.max_conflict_retries)
                .await
                .map_err(anyhow::Error::from)?;

            let status = match adopted {
                Some((pod_name, pod_ip)) => {
                    eprintln!("sandbox {name}: adopted pod {pod_name}");
                    SandboxStatus {
                        phase: SandboxPhase::Ready,
                        pod_name,
                        pod_ip,
                        adopted_at: Some(Utc::now()),
                        last_activity_at: Some(Utc::now()),
                        conditions: vec![crate::types::PoolCondition::new(
                            "Adopted",
                            true,
                            "PodAssigned",
                            "",
                        )],
                    }
                }
                None => SandboxStatus {
                    phase: SandboxPhase::Pending,
                    conditions: vec![crate::types::PoolCondition::new(
                        "Adopted",
                        false,
                        "NoIdlePods",
                        format!("no idle pod available in pool {}", sandbox.spec.pool_ref),
                    )],
                    ..Default::default()
                },
            };

            let patch = serde_json::json!({ "status": status });
            if let Err(e) = sandboxes
                .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                eprintln!("sandbox {name}: failed to patch status: {e}");
            }
        }
        SandboxPhase::Ready => {
            if let Some(status) = &sandbox.status {
                let reason = should_reap(
                    status,
                    sandbox.spec.idle_timeout_seconds,
                    sandbox.spec.max_lifetime_seconds,
                    Utc::now(),
                );
                if let Some(reason) = reason {
                    eprintln!("sandbox {name}: reaping ({reason})");
                    let new_status = serde_json::json!({
                        "status": {
                            "phase": SandboxPhase::Terminated,
                            "conditions": [crate::types::PoolCondition::new("Reaped", true, reason, "")],
                        }
                    });
                    if let Err(e) = sandboxes
                        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&new_status))
                        .await
                    {
                        eprintln!("sandbox {name}: failed to patch terminated status: {e}");
                    }
                    // Deleting the object (rather than relabeling the pod
                    // back to idle in place) routes through the same
                    // `cleanup` finalizer path an explicit client DELETE
                    // takes, so the bound pod is always deleted, never
                    // recycled.
                    if let Err(e) = sandboxes.delete(&name, &DeleteParams::default()).await {
                        eprintln!("sandbox {name}: failed to delete reaped object: {e}");
                    }
                    return Ok(Action::await_change());
                }
            }
        }
        SandboxPhase::Failed | SandboxPhase::Terminated => {
            return Ok(Action::await_change());
        }
    }

    let base = ctx.config.sandbox_reconcile_seconds;
    let requeue_after = base + jitter_seconds(&resource_version, base.max(1));
    Ok(Action::requeue(Duration::from_secs(requeue_after)))
}

/// Entry point handed to `Controller::run`: wraps `apply`/`cleanup` in
/// `kube::runtime::finalizer::finalizer`, the same mechanism the teacher
/// uses nowhere (it never needed delete-time cleanup) but which is the
/// idiomatic `kube`-crate way to guarantee `cleanup` runs exactly once
/// before a Sandbox with a bound pod is actually removed from the API
/// server (P5/P4: a bound pod must never outlive its Sandbox unnoticed).
pub async fn reconcile(sandbox: Arc<Sandbox>, ctx: Arc<ControllerContext>) -> Result<Action, ReconcileError> {
    let namespace = sandbox.namespace().unwrap_or_else(|| "default".to_string());
    let sandboxes: Api<Sandbox> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&sandboxes, SANDBOX_FINALIZER, sandbox, move |event| async move {
        match event {
            FinalizerEvent::Apply(sandbox) => apply(sandbox, ctx.clone()).await,
            FinalizerEvent::Cleanup(sandbox) => cleanup(sandbox, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| ReconcileError::from(anyhow::anyhow!("finalizer error: {e}")))
}

pub fn error_policy(_sandbox: Arc<Sandbox>, error: &ReconcileError, _ctx: Arc<ControllerContext>) -> Action {
    eprintln!("sandbox reconcile error: {error}");
    Action::requeue(Duration::from_secs(15))
}

/// Run the Sandbox controller loop for all namespaces.
pub async fn run(client: kube::Client, config: Arc<crate::config::ControllerConfig>) -> anyhow::Result<()> {
    use futures::StreamExt;

    let sandboxes: Api<Sandbox> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let ctx = Arc::new(ControllerContext { client, config });

    Controller::new(sandboxes, WatcherConfig::default())
        .owns(pods, WatcherConfig::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                eprintln!("sandbox controller error: {e}");
            }
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, status: &str) -> PodCandidate {
        PodCandidate {
            name: name.into(),
            resource_version: "1".into(),
            status_label: status.into(),
        }
    }

    #[test]
    fn plan_adoption_picks_alphabetically_first_idle() {
        let candidates = vec![
            candidate("p-2", STATUS_IDLE),
            candidate("p-0", STATUS_IDLE),
            candidate("p-1", STATUS_ALLOCATED),
        ];
        let picked = plan_adoption(&candidates).unwrap();
        assert_eq!(picked.name, "p-0");
    }

    #[test]
    fn plan_adoption_returns_none_when_no_idle_pods() {
        let candidates = vec![candidate("p-0", STATUS_ALLOCATED)];
        assert!(plan_adoption(&candidates).is_none());
    }

    #[test]
    fn should_reap_none_while_pending() {
        let status = SandboxStatus {
            phase: SandboxPhase::Pending,
            ..Default::default()
        };
        assert_eq!(should_reap(&status, Some(1), None, Utc::now()), None);
    }

    #[test]
    fn should_reap_on_idle_timeout() {
        let status = SandboxStatus {
            phase: SandboxPhase::Ready,
            last_activity_at: Some(Utc::now() - chrono::Duration::seconds(1000)),
            ..Default::default()
        };
        assert_eq!(should_reap(&status, Some(900), None, Utc::now()), Some("IdleTimeoutExceeded"));
    }

    #[test]
    fn should_reap_on_max_lifetime() {
        let status = SandboxStatus {
            phase: SandboxPhase::Ready,
            adopted_at: Some(Utc::now() - chrono::Duration::seconds(7200)),
            last_activity_at: Some(Utc::now()),
            ..Default::default()
        };
        assert_eq!(
            should_reap(&status, None, Some(3600), Utc::now()),
            Some("MaxLifetimeExceeded")
        );
    }

    #[test]
    fn should_reap_none_when_within_both_budgets() {
        let status = SandboxStatus {
            phase: SandboxPhase::Ready,
            adopted_at: Some(Utc::now() - chrono::Duration::seconds(10)),
            last_activity_at: Some(Utc::now()),
            ..Default::default()
        };
        assert_eq!(should_reap(&status, Some(900), Some(3600), Utc::now()), None);
    }
}
