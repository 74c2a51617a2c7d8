//! Tool registry listing and invocation (spec.md §4.E.5).
//!
//! Tools are materialized on disk by the `tool-init` container
//! (`pod_template::render_tool_init_script`) as
//! `/opt/arl/tools/registry.json` plus one directory per tool. The
//! Gateway never parses the pod spec to discover tools; it reads the
//! same registry file the sidecar can see, the way the teacher's
//! `http_api.rs` handlers always go through the running container
//! rather than re-deriving state from the Kubernetes object.

use std::time::Duration;

use crate::error::{ArlError, Result};
use crate::gateway::session::Session;
use crate::pod_template::TOOLS_MOUNT_PATH;
use crate::types::{ToolResult, ToolsRegistry};
use crate::validation;

/// List tools available in `session`'s sandbox by reading back the
/// registry the init container wrote.
pub async fn list_tools(session: &Session, rpc_timeout: Duration) -> Result<ToolsRegistry> {
    let (sidecar, workspace_dir) = session.with_state(|s| (s.sidecar.clone(), s.workspace_dir.clone())).await;
    let registry_path = format!("{TOOLS_MOUNT_PATH}/registry.json");

    let outcome = sidecar
        .execute(
            &["cat".to_string(), registry_path.clone()],
            &Default::default(),
            &workspace_dir,
            Some(rpc_timeout),
        )
        .await?;

    if outcome.exit_code != 0 {
        // No tools were configured for this pool; an empty registry is not
        // an error (spec.md: "a pool with no declared tools has an empty
        // registry, not a failure").
        return Ok(ToolsRegistry::default());
    }

    serde_json::from_str(&outcome.stdout)
        .map_err(|e| ArlError::Other(anyhow::anyhow!("malformed tool registry: {e}")))
}

/// Invoke `tool_name`'s entrypoint, base64-encoding the JSON parameters
/// and piping them into the entrypoint's stdin via a small shell pipeline
/// (spec.md §4.E.5: "decodes the parameters into the entrypoint's
/// stdin"). stdout is captured as `rawOutput`; if it parses as JSON,
/// `parsed` is also populated.
pub async fn call_tool(
    session: &Session,
    tool_name: &str,
    arguments: &serde_json::Value,
    rpc_timeout: Duration,
) -> Result<ToolResult> {
    validation::validate_tool_call_name(tool_name).map_err(ArlError::InvalidArgument)?;

    let registry = list_tools(session, rpc_timeout).await?;
    let manifest = registry
        .tools
        .iter()
        .find(|t| t.name == tool_name)
        .ok_or_else(|| ArlError::NotFound(format!("tool '{tool_name}' not found")))?;

    let entrypoint_path = format!("{TOOLS_MOUNT_PATH}/{tool_name}/{}", manifest.entrypoint);
    let args_json = serde_json::to_string(arguments).map_err(|e| ArlError::Other(e.into()))?;
    let args_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, args_json.as_bytes());
    let pipeline = format!("echo {args_b64} | base64 -d | {entrypoint_path}");

    let (sidecar, workspace_dir) = session.with_state(|s| (s.sidecar.clone(), s.workspace_dir.clone())).await;
    let outcome = sidecar
        .execute(
            &["sh".to_string(), "-c".to_string(), pipeline],
            &Default::default(),
            &workspace_dir,
            Some(rpc_timeout),
        )
        .await?;

    session
        .with_state(|s| s.last_activity_at = chrono::Utc::now())
        .await;

    crate::audit::log_event(crate::audit::AuditEvent::ToolCalled {
        session_id: session.id.to_string(),
        tool: tool_name.to_string(),
        exit_code: outcome.exit_code,
    });

    let parsed = serde_json::from_str(&outcome.stdout).ok();

    Ok(ToolResult {
        raw_output: outcome.stdout,
        parsed,
        exit_code: outcome.exit_code,
        stderr: outcome.stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::session::{FakeSandboxProvisioner, SandboxProvisioner};
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

    #[tokio::test]
    async fn list_tools_is_empty_when_registry_missing() {
        let session = new_session().await;
        let registry = list_tools(&session, StdDuration::from_secs(5)).await.unwrap();
        assert!(registry.tools.is_empty());
    }

    #[tokio::test]
    async fn call_tool_rejects_unknown_name() {
        let session = new_session().await;
        let err = call_tool(&session, "nope", &serde_json::json!({}), StdDuration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ArlError::NotFound(_)));
    }

    #[tokio::test]
    async fn call_tool_rejects_unsafe_name_before_touching_sidecar() {
        let session = new_session().await;
        let err = call_tool(
            &session,
            "$(whoami)",
            &serde_json::json!({}),
            StdDuration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ArlError::InvalidArgument(_)));
    }
}
