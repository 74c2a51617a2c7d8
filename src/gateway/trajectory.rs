//! Trajectory export (spec.md §4.E.7, `GET /v1/sessions/{id}/trajectory`).
//!
//! Renders a session's step history as JSONL, one `TrajectoryEntry` per
//! line — the shape an agent-training pipeline consumes directly,
//! mirrors the teacher's `asciicast.rs` "one JSON event per line"
//! recording format generalized from terminal frames to step
//! input/output pairs.

use crate::types::{StepResult, TrajectoryAction, TrajectoryEntry, TrajectoryObservation};

/// Build the trajectory entries for a session's full recorded history.
pub fn build_trajectory(session_id: uuid::Uuid, history: &[StepResult]) -> Vec<TrajectoryEntry> {
    history
        .iter()
        .map(|step| TrajectoryEntry {
            session_id,
            step: step.index,
            action: TrajectoryAction {
                command: step.input.command.clone(),
                env: step.input.env.clone(),
                work_dir: step.input.work_dir.clone(),
            },
            observation: TrajectoryObservation {
                stdout: step.output.stdout.clone(),
                stderr: step.output.stderr.clone(),
                exit_code: step.output.exit_code,
            },
            snapshot_id: step.snapshot_id.clone(),
            timestamp: step.timestamp,
        })
        .collect()
}

/// Render entries as newline-delimited JSON, the Gateway's wire format
/// for the trajectory endpoint.
pub fn to_jsonl(entries: &[TrajectoryEntry]) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&serde_json::to_string(entry)?);
        out.push('\n');
    }
    Ok(out)
}

/// Parse a JSONL trajectory export back into entries; used by the SDK
/// and by tests that round-trip a recorded trajectory.
pub fn parse_jsonl(text: &str) -> Result<Vec<TrajectoryEntry>, serde_json::Error> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StepOutput, StepRequest};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_step(index: u64) -> StepResult {
        StepResult {
            index,
            name: format!("s{index}"),
            input: StepRequest {
                name: format!("s{index}"),
                command: vec!["echo".into(), "hi".into()],
                env: Default::default(),
                work_dir: None,
                timeout: None,
            },
            output: StepOutput {
                stdout: "hi\n".into(),
                stderr: String::new(),
                exit_code: 0,
            },
            snapshot_id: format!("snap-{index}"),
            duration_ms: 5,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn jsonl_round_trips() {
        let session_id = Uuid::new_v4();
        let history = vec![sample_step(0), sample_step(1)];
        let entries = build_trajectory(session_id, &history);
        let jsonl = to_jsonl(&entries).unwrap();
        assert_eq!(jsonl.lines().count(), 2);

        let parsed = parse_jsonl(&jsonl).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].session_id, session_id);
        assert_eq!(parsed[1].step, 1);
    }

    #[test]
    fn empty_history_yields_empty_jsonl() {
        let entries = build_trajectory(Uuid::new_v4(), &[]);
        assert_eq!(to_jsonl(&entries).unwrap(), "");
    }
}
