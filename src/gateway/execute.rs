//! Execute RPC (spec.md §4.E.2): run a batch of steps against a
//! session's sandbox, snapshotting after each step.
//!
//! Grounded in the teacher's `backend::kubernetes_pool`-era "run a
//! command, then commit state" pairing, generalized to a batch of named
//! steps each carrying its own recorded snapshot. P1 (step ordering) is
//! enforced by the caller holding `Session::exec_lock` for the whole
//! call and assigning `index` from the current history length before
//! any await point that could yield to another task.

use std::time::{Duration, Instant};

use crate::audit::{self, AuditEvent};
use crate::error::{ArlError, Result};
use crate::gateway::session::Session;
use crate::types::{ExecuteResponse, StepOutput, StepRequest, StepResult};

/// Result of running a step batch: either every step completed, or a
/// step's sidecar RPC itself failed (distinct from the step merely
/// exiting non-zero, which is never an error) and the batch stopped
/// partway through.
///
/// spec.md §4.E.2: "If any step's RPC itself fails (sidecar unreachable),
/// the gateway returns a partial response with the results so far and a
/// 5xx error surface on the failing step." `Partial` carries both: the
/// `ExecuteResponse` with every step that completed before the failure,
/// and the `ArlError` the caller uses to pick the HTTP status.
pub enum ExecuteOutcome {
    Complete(ExecuteResponse),
    Partial { response: ExecuteResponse, error: ArlError },
}

/// Run each step in `steps` in order against `session`, snapshotting the
/// workspace after every step regardless of its exit code (spec.md: "a
/// failed step still gets a snapshot, so the caller can restore to just
/// before or just after it").
///
/// Only pre-flight validation (empty step list entries, bad timeouts)
/// surfaces as `Err`; once the batch starts running, a sidecar failure
/// produces `Ok(ExecuteOutcome::Partial { .. })` instead, so steps that
/// already succeeded are never discarded.
pub async fn execute_steps(
    session: &Session,
    steps: Vec<StepRequest>,
    rpc_timeout: Duration,
) -> Result<ExecuteOutcome> {
    for step in &steps {
        step.validate().map_err(ArlError::InvalidArgument)?;
    }

    let _exec_guard = session.exec_lock.lock().await;
    let start = Instant::now();
    let mut results = Vec::with_capacity(steps.len());
    let mut failure: Option<ArlError> = None;

    for step in steps {
        let step_start = Instant::now();
        let (sidecar, workspace_dir, next_index) = session
            .with_state(|s| (s.sidecar.clone(), s.workspace_dir.clone(), s.history.len() as u64))
            .await;

        let timeout = step.timeout.map(Duration::from_secs).or(Some(rpc_timeout));
        let work_dir = step.work_dir.clone().unwrap_or_else(|| workspace_dir.clone());

        let outcome = match sidecar.execute(&step.command, &step.env, &work_dir, timeout).await {
            Ok(o) => o,
            Err(e) => {
                failure = Some(e);
                break;
            }
        };

        let snapshot_id = crate::snapshot::record(sidecar.as_ref(), &workspace_dir, &step.name)
            .await
            .unwrap_or_default();

        let result = StepResult {
            index: next_index,
            name: step.name.clone(),
            input: step.clone(),
            output: StepOutput {
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                exit_code: if outcome.timed_out { 124 } else { outcome.exit_code },
            },
            snapshot_id,
            duration_ms: step_start.elapsed().as_millis() as u64,
            timestamp: chrono::Utc::now(),
        };

        session
            .with_state(|s| {
                s.last_activity_at = chrono::Utc::now();
                s.history.push(result.clone());
                Session::enforce_history_cap(&mut s.history, session.max_history);
            })
            .await;

        results.push(result);
    }

    let total_duration_ms = start.elapsed().as_millis() as u64;
    match failure {
        None => Ok(ExecuteOutcome::Complete(ExecuteResponse {
            session_id: session.id,
            total_duration_ms,
            results,
            error: None,
        })),
        Some(error) => {
            let response = ExecuteResponse {
                session_id: session.id,
                total_duration_ms,
                results,
                error: Some(error.to_response()),
            };
            Ok(ExecuteOutcome::Partial { response, error })
        }
    }
}

/// Emit one audit event per tool-call-shaped execute (see
/// `gateway::tools::call_tool`); plain `execute` batches are not audited
/// individually, only session create/delete and restores are (spec.md
/// §4.F's audit event list).
pub fn audit_session_created(session_id: uuid::Uuid, pool: &str, sandbox: &str) {
    audit::log_event(AuditEvent::SessionCreated {
        session_id: session_id.to_string(),
        pool: pool.to_string(),
        sandbox: sandbox.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::session::{AllocatedSandbox, FakeSandboxProvisioner, SandboxProvisioner};
    use crate::sidecar::FakeSidecarClient;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;
    use uuid::Uuid;

    async fn new_session() -> Session {
        let provisioner = FakeSandboxProvisioner::new();
        let allocated = provisioner
            .allocate("p1", "default", None, None, StdDuration::from_secs(5))
            .await
            .unwrap();
        Session::new(Uuid::new_v4(), "p1".into(), "default".into(), None, None, None, allocated)
    }

    /// Builds a session wired to a `FakeSidecarClient` the caller keeps a
    /// handle to, so a test can call `fail_execute_after` on it.
    fn new_session_with_fake_sidecar() -> (Session, Arc<FakeSidecarClient>) {
        let fake = Arc::new(FakeSidecarClient::new());
        let allocated = AllocatedSandbox {
            sandbox_name: "sbx-0".into(),
            pod_name: "p1-fake-0".into(),
            pod_ip: "p1-fake-0".into(),
            workspace_dir: "/workspace".into(),
            sidecar: fake.clone(),
        };
        let session = Session::new(Uuid::new_v4(), "p1".into(), "default".into(), None, None, None, allocated);
        (session, fake)
    }

    /// Unwraps the `Complete` variant, panicking with a clear message if a
    /// test's batch unexpectedly went `Partial`.
    fn complete(outcome: ExecuteOutcome) -> ExecuteResponse {
        match outcome {
            ExecuteOutcome::Complete(resp) => resp,
            ExecuteOutcome::Partial { error, .. } => panic!("expected Complete, got Partial: {error}"),
        }
    }

    fn step(name: &str, cmd: &[&str]) -> StepRequest {
        StepRequest {
            name: name.into(),
            command: cmd.iter().map(|s| s.to_string()).collect(),
            env: Default::default(),
            work_dir: None,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn p1_step_ordering_is_preserved_and_indices_increase() {
        let session = new_session().await;
        let steps = vec![
            step("write", &["sh", "-c", "echo a > /workspace/f.txt"]),
            step("read", &["cat", "/workspace/f.txt"]),
        ];
        let resp = complete(execute_steps(&session, steps, StdDuration::from_secs(5)).await.unwrap());
        assert_eq!(resp.results.len(), 2);
        assert_eq!(resp.results[0].index, 0);
        assert_eq!(resp.results[1].index, 1);
        assert_eq!(resp.results[1].output.stdout, "a\n");
    }

    #[tokio::test]
    async fn execute_is_rejected_for_invalid_step() {
        let session = new_session().await;
        let bad = StepRequest {
            name: "bad".into(),
            command: vec![],
            env: Default::default(),
            work_dir: None,
            timeout: None,
        };
        let err = execute_steps(&session, vec![bad], StdDuration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ArlError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn each_step_gets_its_own_snapshot() {
        let session = new_session().await;
        let steps = vec![
            step("one", &["sh", "-c", "echo 1 > /workspace/a.txt"]),
            step("two", &["sh", "-c", "echo 2 > /workspace/b.txt"]),
        ];
        let resp = complete(execute_steps(&session, steps, StdDuration::from_secs(5)).await.unwrap());
        assert_ne!(resp.results[0].snapshot_id, resp.results[1].snapshot_id);
        assert!(!resp.results[0].snapshot_id.is_empty());
    }

    #[tokio::test]
    async fn history_extends_across_multiple_execute_calls() {
        let session = new_session().await;
        execute_steps(&session, vec![step("one", &["echo", "x"])], StdDuration::from_secs(5))
            .await
            .unwrap();
        let resp = complete(
            execute_steps(&session, vec![step("two", &["echo", "y"])], StdDuration::from_secs(5))
                .await
                .unwrap(),
        );
        assert_eq!(resp.results[0].index, 1);
        assert_eq!(session.history_snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn mid_batch_sidecar_failure_keeps_prior_results_and_surfaces_error() {
        let (session, fake) = new_session_with_fake_sidecar();
        let steps = vec![
            step("first", &["echo", "ok"]),
            step("second", &["echo", "also ok"]),
            step("third", &["echo", "unreachable"]),
        ];
        // Let the first two steps' sidecar.execute calls succeed, fail the third.
        fake.fail_execute_after(2).await;
        let outcome = execute_steps(&session, steps, StdDuration::from_secs(5)).await.unwrap();
        match outcome {
            ExecuteOutcome::Complete(_) => panic!("expected Partial"),
            ExecuteOutcome::Partial { response, error } => {
                assert_eq!(response.results.len(), 2);
                assert_eq!(response.results[0].name, "first");
                assert_eq!(response.results[1].name, "second");
                assert_eq!(response.error.as_ref().unwrap().error, "execution_failed");
                assert!(matches!(error, ArlError::ExecutionFailed(_)));
                assert_eq!(error.status_code(), 502);
            }
        }
        // The two completed steps are still recorded in session history.
        assert_eq!(session.history_snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn sidecar_failure_on_first_step_returns_partial_with_no_results() {
        let (session, fake) = new_session_with_fake_sidecar();
        fake.fail_execute_after(0).await;
        let outcome = execute_steps(&session, vec![step("only", &["echo", "unreachable"])], StdDuration::from_secs(5))
            .await
            .unwrap();
        match outcome {
            ExecuteOutcome::Complete(_) => panic!("expected Partial"),
            ExecuteOutcome::Partial { response, .. } => assert!(response.results.is_empty()),
        }
    }
}
