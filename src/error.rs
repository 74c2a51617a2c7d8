//! The ARL error taxonomy.
//!
//! Every error a client can observe from the Gateway is one of these
//! variants. Controllers never return these to a client directly; they
//! record the same information on an object's `conditions` and keep
//! reconciling (see `controller::warmpool` / `controller::sandbox`).

use serde::Serialize;

use crate::types::PoolCondition;

/// The closed taxonomy of errors the Gateway can surface to a client.
#[derive(Debug, thiserror::Error)]
pub enum ArlError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("pool not ready: {reason}")]
    PoolNotReady {
        reason: String,
        conditions: Vec<PoolCondition>,
    },

    #[error("pool has failing pods: {reason}")]
    PoolPodsFailing {
        reason: String,
        conditions: Vec<PoolCondition>,
    },

    #[error("sandbox not ready: {0}")]
    SandboxNotReady(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("snapshot missing for restore target")]
    SnapshotMissing,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("transient error, retry with backoff: {0}")]
    Transient(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Wire representation of an error, per spec.md §6.1: all 4xx/5xx carry
/// `{error, detail?}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ArlError {
    /// HTTP status code this error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            ArlError::NotFound(_) => 404,
            ArlError::AlreadyExists(_) => 409,
            ArlError::InvalidArgument(_) => 400,
            ArlError::PoolNotReady { .. } => 503,
            ArlError::PoolPodsFailing { .. } => 503,
            ArlError::SandboxNotReady(_) => 504,
            ArlError::ExecutionFailed(_) => 502,
            ArlError::SnapshotMissing => 400,
            ArlError::Conflict(_) => 409,
            ArlError::Timeout(_) => 504,
            ArlError::Transient(_) => 503,
            ArlError::Other(_) => 500,
        }
    }

    /// A short machine-readable label for this variant, used as `error` in
    /// the JSON body.
    pub fn kind(&self) -> &'static str {
        match self {
            ArlError::NotFound(_) => "not_found",
            ArlError::AlreadyExists(_) => "already_exists",
            ArlError::InvalidArgument(_) => "invalid_argument",
            ArlError::PoolNotReady { .. } => "pool_not_ready",
            ArlError::PoolPodsFailing { .. } => "pool_pods_failing",
            ArlError::SandboxNotReady(_) => "sandbox_not_ready",
            ArlError::ExecutionFailed(_) => "execution_failed",
            ArlError::SnapshotMissing => "snapshot_missing",
            ArlError::Conflict(_) => "conflict",
            ArlError::Timeout(_) => "timeout",
            ArlError::Transient(_) => "transient",
            ArlError::Other(_) => "internal",
        }
    }

    /// Render as the wire `ErrorResponse`, dropping structured condition
    /// lists into the `detail` string (clients that want the structured
    /// form should use the SDK rather than parse `detail`).
    pub fn to_response(&self) -> ErrorResponse {
        let detail = match self {
            ArlError::PoolNotReady { conditions, .. } | ArlError::PoolPodsFailing { conditions, .. } => {
                Some(
                    conditions
                        .iter()
                        .map(|c| format!("{}={} ({})", c.condition_type, c.status, c.reason))
                        .collect::<Vec<_>>()
                        .join("; "),
                )
            }
            _ => None,
        };
        ErrorResponse {
            error: self.kind().to_string(),
            detail: detail.or_else(|| Some(self.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, ArlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(ArlError::NotFound("x".into()).status_code(), 404);
        assert_eq!(ArlError::AlreadyExists("x".into()).status_code(), 409);
        assert_eq!(ArlError::InvalidArgument("x".into()).status_code(), 400);
        assert_eq!(ArlError::SnapshotMissing.status_code(), 400);
    }

    #[test]
    fn pool_not_ready_carries_conditions_in_detail() {
        let err = ArlError::PoolNotReady {
            reason: "NoIdlePods".into(),
            conditions: vec![PoolCondition {
                condition_type: "Ready".into(),
                status: "False".into(),
                reason: "NoIdlePods".into(),
                message: "".into(),
            }],
        };
        let resp = err.to_response();
        assert_eq!(resp.error, "pool_not_ready");
        assert!(resp.detail.unwrap().contains("Ready=False"));
    }
}
