//! Audit logging for ARL session/pool lifecycle events.
//!
//! JSONL log of auditable events — session created/deleted, pool
//! created/scaled, sandbox adopted/reaped, restore performed — adapted
//! from the teacher's `audit.rs`. Human-readable operational logs (pod
//! create/delete, reconcile errors) stay as plain `eprintln!` in the
//! controllers and gateway; this module is only for the events spec.md
//! calls out as auditable lifecycle transitions.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

/// Auditable ARL lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    PoolCreated {
        pool: String,
        namespace: String,
        image: String,
        replicas: u32,
    },
    PoolScaled {
        pool: String,
        namespace: String,
        from_replicas: u32,
        to_replicas: u32,
    },
    PoolDeleted {
        pool: String,
        namespace: String,
    },
    SandboxAdopted {
        sandbox: String,
        pool: String,
        pod_name: String,
    },
    SandboxReaped {
        sandbox: String,
        reason: String,
    },
    SessionCreated {
        session_id: String,
        pool: String,
        sandbox: String,
    },
    SessionDeleted {
        session_id: String,
        reason: String,
    },
    RestorePerformed {
        session_id: String,
        snapshot_id: String,
        replayed_steps: usize,
    },
    ToolCalled {
        session_id: String,
        tool: String,
        exit_code: i32,
    },
}

/// A logged audit entry with metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditEntry {
    pub fn new(event: AuditEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            pid: std::process::id(),
            event,
        }
    }
}

/// Default audit log path: `$HOME/.arl/audit.jsonl`, falling back to the
/// current directory when `HOME` is unset (matches the teacher's
/// no-new-dependency rule: no `dirs` crate in the trimmed dependency set).
pub fn default_audit_path() -> PathBuf {
    let home = std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    home.join(".arl").join("audit.jsonl")
}

pub struct AuditLog {
    path: PathBuf,
    enabled: bool,
}

impl AuditLog {
    pub fn new() -> Self {
        let enabled = std::env::var("ARL_AUDIT")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            path: default_audit_path(),
            enabled,
        }
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            enabled: true,
        }
    }

    pub fn log(&self, event: AuditEvent) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let entry = AuditEntry::new(event);
        let line = serde_json::to_string(&entry)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        writeln!(file, "{}", line)?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => eprintln!("Warning: skipping malformed audit entry: {}", e),
            }
        }

        Ok(entries)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Global audit logger (lazily initialised).
pub fn audit() -> &'static AuditLog {
    use std::sync::OnceLock;
    static AUDIT: OnceLock<AuditLog> = OnceLock::new();
    AUDIT.get_or_init(AuditLog::new)
}

/// Convenience function to log an event through the global logger.
pub fn log_event(event: AuditEvent) {
    if let Err(e) = audit().log(event) {
        eprintln!("Warning: failed to write audit log: {}", e);
    }
}
