//! Restore RPC (spec.md §4.E.3): re-create a session's sandbox from
//! scratch and replay recorded steps up to a target snapshot.
//!
//! Restore never trusts the sidecar's own `Restore` RPC to "jump" to a
//! snapshot in place: a fresh `Sandbox` is always allocated with a blank
//! workspace (grounded in the teacher's `kubernetes_pool::acquire`
//! allocate-fresh-then-configure pattern) and the recorded steps are
//! re-executed against it in order. This is why restore doesn't reuse
//! `snapshot::plan_restore`'s `Direct` classification: that plan exists
//! for a hypothetical future native-snapshot mode where a sidecar could
//! seek straight to a commit in an already-running pod, but a
//! freshly-allocated, stateless pod has no commit history to seek
//! within, so there is never a "nothing to replay" case here — the
//! prefix `index <= target_index` is always replayed in full.

use std::time::Duration;

use crate::audit::{self, AuditEvent};
use crate::error::{ArlError, Result};
use crate::gateway::session::{SandboxProvisioner, Session, SessionState};
use crate::types::{StepOutput, StepResult};

/// Replay history up to (and including) the step whose recorded
/// `snapshotId` equals `target_snapshot_id`, against a freshly allocated
/// sandbox, then swap that sandbox into `session`.
///
/// Holds `session.exec_lock` for its entire duration (P6: an execute
/// cannot interleave with a restore, and two restores cannot race each
/// other on the same session).
pub async fn restore(
    session: &Session,
    provisioner: &dyn SandboxProvisioner,
    target_snapshot_id: &str,
    rpc_timeout: Duration,
    ready_deadline: Duration,
) -> Result<Vec<StepResult>> {
    if target_snapshot_id.is_empty() {
        return Err(ArlError::SnapshotMissing);
    }

    let _exec_guard = session.exec_lock.lock().await;

    let history = session.history_snapshot().await;
    let target_index = history
        .iter()
        .find(|s| s.snapshot_id == target_snapshot_id)
        .map(|s| s.index)
        .ok_or(ArlError::SnapshotMissing)?;

    let to_replay: Vec<&StepResult> = history.iter().filter(|s| s.index <= target_index).collect();

    let old_sandbox_name = session.sandbox_name().await;
    let allocated = provisioner
        .allocate(
            &session.pool_ref,
            &session.namespace,
            session.idle_timeout_seconds,
            session.max_lifetime_seconds,
            ready_deadline,
        )
        .await?;
    let new_sandbox_name = allocated.sandbox_name.clone();

    let mut replayed = Vec::with_capacity(to_replay.len());
    for recorded in &to_replay {
        let work_dir = recorded
            .input
            .work_dir
            .clone()
            .unwrap_or_else(|| allocated.workspace_dir.clone());
        let timeout = recorded.input.timeout.map(Duration::from_secs).or(Some(rpc_timeout));

        let outcome = allocated
            .sidecar
            .execute(&recorded.input.command, &recorded.input.env, &work_dir, timeout)
            .await?;

        let snapshot_id = crate::snapshot::record(
            allocated.sidecar.as_ref(),
            &allocated.workspace_dir,
            &recorded.name,
        )
        .await
        .unwrap_or_default();

        replayed.push(StepResult {
            index: recorded.index,
            name: recorded.name.clone(),
            input: recorded.input.clone(),
            output: StepOutput {
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                exit_code: if outcome.timed_out { 124 } else { outcome.exit_code },
            },
            snapshot_id,
            duration_ms: recorded.duration_ms,
            timestamp: chrono::Utc::now(),
        });
    }

    session
        .with_state(|state: &mut SessionState| {
            state.sandbox_name = new_sandbox_name.clone();
            state.pod_name = allocated.pod_name.clone();
            state.pod_ip = allocated.pod_ip.clone();
            state.workspace_dir = allocated.workspace_dir.clone();
            state.sidecar = allocated.sidecar.clone();
            state.last_activity_at = chrono::Utc::now();
            state.history.truncate(to_replay.len());
            state.history[..].clone_from_slice(&replayed);
        })
        .await;

    if !old_sandbox_name.is_empty() {
        if let Err(e) = provisioner.release(&old_sandbox_name, &session.namespace).await {
            eprintln!("restore: failed to release old sandbox {old_sandbox_name}: {e}");
        }
    }

    audit::log_event(AuditEvent::RestorePerformed {
        session_id: session.id.to_string(),
        snapshot_id: target_snapshot_id.to_string(),
        replayed_steps: replayed.len(),
    });

    Ok(replayed)
}
