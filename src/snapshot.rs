//! Snapshot recording and restore planning (spec.md §4.G, §9 Design Notes).
//!
//! The reference strategy is one git commit per step inside the pod's
//! workspace directory (`SnapshotStrategy::GitCommit` in `config.rs`); a
//! snapshot id is therefore opaque to the Gateway — it is whatever string
//! the sidecar hands back from `SidecarClient::snapshot`. Restore is
//! never "checkout a commit": it is replaying the recorded step inputs
//! from the nearest prior snapshot up to the target, so that workspace
//! state and trajectory history stay consistent even for sidecars that
//! don't keep every commit reachable.
//!
//! Kept pure where possible, mirroring `scheduler.rs`'s separation of
//! planning from I/O: `plan_restore` only looks at already-recorded
//! `StepResult`s and never touches the sidecar itself.

use serde::Serialize;

use crate::error::{ArlError, Result};
use crate::sidecar::SidecarClient;
use crate::types::StepResult;

/// Take a snapshot of `workspace_dir` after a step ran, labeling it with
/// the step's name for diagnostics. A failed snapshot never fails the
/// step itself (spec.md §9: "snapshot failure never overwrites exit
/// code") — callers get `Ok(None)` and record an empty `snapshotId`, the
/// step's own `exit_code` is untouched either way.
pub async fn record(
    sidecar: &dyn SidecarClient,
    workspace_dir: &str,
    label: &str,
) -> Option<String> {
    match sidecar.snapshot(workspace_dir).await {
        Ok(id) => Some(id),
        Err(e) => {
            eprintln!("snapshot failed for step {label}: {e}");
            None
        }
    }
}

/// A plan for restoring a session to the state after a target step,
/// built purely from recorded history — no sidecar calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RestorePlan {
    /// The target step itself carries a snapshot id; nothing needs replay,
    /// the workspace is already at or can be reset directly to that state.
    Direct { snapshot_id: String },
    /// No step at or before the target carries a snapshot id (e.g. every
    /// intervening snapshot attempt failed); replay every step from the
    /// beginning of history up to and including the target.
    ReplayFromStart { through_index: u64 },
    /// A prior step carries a snapshot id; replay steps strictly after it
    /// up to and including the target.
    ReplayFromSnapshot {
        snapshot_id: String,
        from_index: u64,
        through_index: u64,
    },
}

/// Build a restore plan for reaching the state immediately after the step
/// whose recorded `snapshot_id` equals `target_snapshot_id`.
///
/// `history` must be sorted ascending by `index` (spec.md P1: step
/// ordering). Returns `ArlError::SnapshotMissing` if no step in history
/// carries that snapshot id at all.
pub fn plan_restore(history: &[StepResult], target_snapshot_id: &str) -> Result<RestorePlan> {
    let target_pos = history
        .iter()
        .position(|s| s.snapshot_id == target_snapshot_id)
        .ok_or(ArlError::SnapshotMissing)?;

    let through_index = history[target_pos].index;

    // Direct hit: nothing to replay, the target step's own snapshot is
    // the destination state.
    if !history[target_pos].snapshot_id.is_empty() {
        return Ok(RestorePlan::Direct {
            snapshot_id: target_snapshot_id.to_string(),
        });
    }

    // Walk backward from the target for the nearest earlier step that
    // does carry a usable snapshot id.
    match history[..target_pos]
        .iter()
        .rev()
        .find(|s| !s.snapshot_id.is_empty())
    {
        Some(anchor) => Ok(RestorePlan::ReplayFromSnapshot {
            snapshot_id: anchor.snapshot_id.clone(),
            from_index: anchor.index,
            through_index,
        }),
        None => Ok(RestorePlan::ReplayFromStart { through_index }),
    }
}

/// Steps that must be replayed (in order) to execute `plan`, drawn from
/// `history`. For `Direct`, this is empty — no replay required.
pub fn steps_to_replay<'a>(plan: &RestorePlan, history: &'a [StepResult]) -> Vec<&'a StepResult> {
    match plan {
        RestorePlan::Direct { .. } => Vec::new(),
        RestorePlan::ReplayFromStart { through_index } => history
            .iter()
            .filter(|s| s.index <= *through_index)
            .collect(),
        RestorePlan::ReplayFromSnapshot {
            from_index,
            through_index,
            ..
        } => history
            .iter()
            .filter(|s| s.index > *from_index && s.index <= *through_index)
            .collect(),
    }
}
