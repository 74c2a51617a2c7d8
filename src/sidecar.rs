//! Sidecar RPC client (spec.md §6.4).
//!
//! The in-pod sidecar binary is an external collaborator — only its RPC
//! surface is modeled here, as a trait plus one concrete implementation
//! speaking newline-delimited JSON over a plain TCP connection to the
//! well-known sidecar port. This mirrors the way the teacher's
//! `firecracker_client.rs` models a connection to an out-of-scope process
//! (Firecracker) as a thin request/response client, generalized from HTTP
//! framing to NDJSON-over-TCP since the sidecar has no REST surface of
//! its own.
//!
//! `FakeSidecarClient` is a deterministic in-memory test double used by
//! the Gateway's own unit tests (P1-P6, S1-S6) without needing a real pod.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use crate::error::{ArlError, Result};
use crate::types::ShellMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateFilesOutcome {
    pub success: bool,
    pub message: String,
}

/// One end of a bridged interactive shell: `to_sidecar` carries client
/// input/signal/resize frames in, `from_sidecar` carries output/exit/error
/// frames back out. `gateway::shell` owns both ends and pumps them against
/// a client WebSocket with two independent tasks, so a quiet sidecar never
/// blocks delivery of client keystrokes and vice versa (spec.md §5).
pub struct ShellChannel {
    pub to_sidecar: mpsc::UnboundedSender<ShellMessage>,
    pub from_sidecar: mpsc::UnboundedReceiver<ShellMessage>,
}

/// The sidecar's RPC surface, per spec.md §6.4. Each method corresponds
/// to one RPC; `Execute` in the real protocol streams chunks, but since
/// the Gateway always waits for completion before snapshotting (spec.md
/// §4.E.2), this trait exposes the aggregated result rather than a raw
/// stream.
#[async_trait]
pub trait SidecarClient: Send + Sync {
    async fn execute(
        &self,
        command: &[String],
        env: &BTreeMap<String, String>,
        working_dir: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecuteOutcome>;

    async fn update_files(
        &self,
        base_path: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<UpdateFilesOutcome>;

    /// Record a snapshot of `workspace_dir`'s current state, returning an
    /// opaque content-addressed identifier (spec.md §9: reference
    /// implementation is a git commit SHA).
    async fn snapshot(&self, workspace_dir: &str) -> Result<String>;

    /// Present for future native-snapshot mode; unused by the replay-based
    /// restore model (spec.md §4.E.3).
    async fn restore(&self, snapshot_id: &str) -> Result<()>;

    async fn signal_process(&self, pid: u32, signal: &str) -> Result<()>;

    async fn reset(&self, preserve_files: bool) -> Result<()>;

    /// Open a bidirectional interactive shell stream (spec.md §4.E.6).
    /// Unlike the other RPCs this is long-lived: the returned channel stays
    /// open until the caller drops it or the sidecar sends `Exit`.
    async fn open_shell(&self, working_dir: &str) -> Result<ShellChannel>;
}

/// NDJSON-over-TCP request envelope.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum RpcRequest<'a> {
    Execute {
        command: &'a [String],
        env: &'a BTreeMap<String, String>,
        working_dir: &'a str,
        timeout_seconds: Option<u64>,
    },
    UpdateFiles {
        base_path: &'a str,
        files: &'a BTreeMap<String, String>,
    },
    Snapshot {
        workspace_dir: &'a str,
    },
    Restore {
        snapshot_id: &'a str,
    },
    SignalProcess {
        pid: u32,
        signal: &'a str,
    },
    Reset {
        preserve_files: bool,
    },
    InteractiveShell {
        working_dir: &'a str,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    timed_out: bool,
    #[serde(default)]
    snapshot_id: String,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    error: Option<String>,
}

/// Concrete sidecar client over a plain TCP connection to `pod_ip:port`.
/// A fresh connection is opened per RPC call, matching the stateless
/// request/response shape the rest of the Gateway assumes (no connection
/// pooling across steps is required by spec.md).
pub struct TcpSidecarClient {
    addr: String,
    rpc_timeout: Duration,
}

impl TcpSidecarClient {
    pub fn new(pod_ip: &str, port: u16, rpc_timeout: Duration) -> Self {
        Self {
            addr: format!("{pod_ip}:{port}"),
            rpc_timeout,
        }
    }

    async fn call(&self, req: RpcRequest<'_>) -> Result<RpcResponse> {
        let fut = async {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| ArlError::ExecutionFailed(format!("connect {}: {e}", self.addr)))?;
            let (read_half, mut write_half) = stream.into_split();
            let mut line = serde_json::to_string(&req).map_err(|e| ArlError::Other(e.into()))?;
            line.push('\n');
            write_half
                .write_all(line.as_bytes())
                .await
                .map_err(|e| ArlError::ExecutionFailed(format!("write: {e}")))?;

            let mut reader = BufReader::new(read_half);
            let mut response_line = String::new();
            reader
                .read_line(&mut response_line)
                .await
                .map_err(|e| ArlError::ExecutionFailed(format!("read: {e}")))?;
            if response_line.trim().is_empty() {
                return Err(ArlError::ExecutionFailed("sidecar closed connection".into()));
            }
            let resp: RpcResponse =
                serde_json::from_str(response_line.trim()).map_err(|e| ArlError::Other(e.into()))?;
            if let Some(err) = &resp.error {
                return Err(ArlError::ExecutionFailed(err.clone()));
            }
            Ok(resp)
        };

        tokio::time::timeout(self.rpc_timeout, fut)
            .await
            .map_err(|_| ArlError::Timeout(format!("sidecar RPC to {} timed out", self.addr)))?
    }
}

#[async_trait]
impl SidecarClient for TcpSidecarClient {
    async fn execute(
        &self,
        command: &[String],
        env: &BTreeMap<String, String>,
        working_dir: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecuteOutcome> {
        let resp = self
            .call(RpcRequest::Execute {
                command,
                env,
                working_dir,
                timeout_seconds: timeout.map(|d| d.as_secs()),
            })
            .await?;
        Ok(ExecuteOutcome {
            stdout: resp.stdout,
            stderr: resp.stderr,
            exit_code: resp.exit_code,
            timed_out: resp.timed_out,
        })
    }

    async fn update_files(
        &self,
        base_path: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<UpdateFilesOutcome> {
        let resp = self.call(RpcRequest::UpdateFiles { base_path, files }).await?;
        Ok(UpdateFilesOutcome {
            success: resp.success,
            message: resp.message,
        })
    }

    async fn snapshot(&self, workspace_dir: &str) -> Result<String> {
        let resp = self.call(RpcRequest::Snapshot { workspace_dir }).await?;
        Ok(resp.snapshot_id)
    }

    async fn restore(&self, snapshot_id: &str) -> Result<()> {
        self.call(RpcRequest::Restore { snapshot_id }).await?;
        Ok(())
    }

    async fn signal_process(&self, pid: u32, signal: &str) -> Result<()> {
        self.call(RpcRequest::SignalProcess { pid, signal }).await?;
        Ok(())
    }

    async fn reset(&self, preserve_files: bool) -> Result<()> {
        self.call(RpcRequest::Reset { preserve_files }).await?;
        Ok(())
    }

    async fn open_shell(&self, working_dir: &str) -> Result<ShellChannel> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| ArlError::ExecutionFailed(format!("connect {}: {e}", self.addr)))?;
        let (read_half, mut write_half) = stream.into_split();

        let mut open_line = serde_json::to_string(&RpcRequest::InteractiveShell { working_dir })
            .map_err(|e| ArlError::Other(e.into()))?;
        open_line.push('\n');
        write_half
            .write_all(open_line.as_bytes())
            .await
            .map_err(|e| ArlError::ExecutionFailed(format!("write: {e}")))?;

        let (to_sidecar_tx, mut to_sidecar_rx) = mpsc::unbounded_channel::<ShellMessage>();
        let (from_sidecar_tx, from_sidecar_rx) = mpsc::unbounded_channel::<ShellMessage>();

        // client -> sidecar: forward every frame the Gateway hands us until
        // the sender is dropped or the socket goes away.
        tokio::spawn(async move {
            let mut write_half = write_half;
            while let Some(msg) = to_sidecar_rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&msg) else {
                    continue;
                };
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        // sidecar -> client: one NDJSON-framed ShellMessage per line, ends
        // the pump on EOF, a parse error, or an Exit frame.
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => match serde_json::from_str::<ShellMessage>(line.trim()) {
                        Ok(msg) => {
                            let is_exit = matches!(msg, ShellMessage::Exit { .. });
                            if from_sidecar_tx.send(msg).is_err() || is_exit {
                                break;
                            }
                        }
                        Err(_) => break,
                    },
                }
            }
        });

        Ok(ShellChannel {
            to_sidecar: to_sidecar_tx,
            from_sidecar: from_sidecar_rx,
        })
    }
}

/// Deterministic in-memory fake: "git-style" snapshotting over a
/// `HashMap<PathBuf, Vec<u8>>`, content-addressed by hashing the sorted
/// file listing, satisfying P2 (snapshot determinism) by construction.
pub struct FakeSidecarClient {
    workspace: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    fail_next_snapshot: Arc<Mutex<bool>>,
    fail_execute_after: Arc<Mutex<Option<u32>>>,
}

impl FakeSidecarClient {
    pub fn new() -> Self {
        Self {
            workspace: Arc::new(Mutex::new(BTreeMap::new())),
            fail_next_snapshot: Arc::new(Mutex::new(false)),
            fail_execute_after: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn fail_next_snapshot(&self) {
        *self.fail_next_snapshot.lock().await = true;
    }

    /// Makes the `successes`-th call after this one succeed as normal, then
    /// the next `execute` call after that return
    /// `Err(ArlError::ExecutionFailed)`, simulating a sidecar that goes
    /// unreachable partway through a step batch. `fail_execute_after(0)`
    /// fails the very next call.
    pub async fn fail_execute_after(&self, successes: u32) {
        *self.fail_execute_after.lock().await = Some(successes);
    }

    async fn content_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let fs = self.workspace.lock().await;
        let mut hasher = Sha256::new();
        for (path, content) in fs.iter() {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(content);
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

impl Default for FakeSidecarClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SidecarClient for FakeSidecarClient {
    async fn execute(
        &self,
        command: &[String],
        _env: &BTreeMap<String, String>,
        working_dir: &str,
        _timeout: Option<Duration>,
    ) -> Result<ExecuteOutcome> {
        {
            let mut guard = self.fail_execute_after.lock().await;
            if let Some(n) = *guard {
                if n == 0 {
                    *guard = None;
                    return Err(ArlError::ExecutionFailed("sidecar unreachable (injected)".into()));
                }
                *guard = Some(n - 1);
            }
        }

        // Interprets a tiny subset of shell forms sufficient for tests and
        // for the Gateway's own tool-registry/tool-call plumbing: writes,
        // reads, and `cat`. Anything else echoes the command back.
        let mut fs = self.workspace.lock().await;
        if command.len() >= 3 && command[0] == "sh" && command[1] == "-c" {
            let script = &command[2];
            if let Some((path, content)) = parse_redirect_write(script, working_dir) {
                fs.insert(path, content.into_bytes());
                return Ok(ExecuteOutcome {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                    timed_out: false,
                });
            }
            if let Some(path) = parse_cat(script, working_dir) {
                return Ok(match fs.get(&path) {
                    Some(content) => ExecuteOutcome {
                        stdout: String::from_utf8_lossy(content).to_string(),
                        stderr: String::new(),
                        exit_code: 0,
                        timed_out: false,
                    },
                    None => ExecuteOutcome {
                        stdout: String::new(),
                        stderr: format!("cat: {path}: No such file or directory\n"),
                        exit_code: 1,
                        timed_out: false,
                    },
                });
            }
        }
        if command.len() >= 2 && command[0] == "cat" {
            let path = resolve_path(working_dir, &command[1]);
            return Ok(match fs.get(&path) {
                Some(content) => ExecuteOutcome {
                    stdout: String::from_utf8_lossy(content).to_string(),
                    stderr: String::new(),
                    exit_code: 0,
                    timed_out: false,
                },
                None => ExecuteOutcome {
                    stdout: String::new(),
                    stderr: format!("cat: {path}: No such file or directory\n"),
                    exit_code: 1,
                    timed_out: false,
                },
            });
        }
        if command.len() >= 2 && command[0] == "echo" {
            return Ok(ExecuteOutcome {
                stdout: format!("{}\n", command[1..].join(" ")),
                stderr: String::new(),
                exit_code: 0,
                timed_out: false,
            });
        }
        Ok(ExecuteOutcome {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            timed_out: false,
        })
    }

    async fn update_files(
        &self,
        base_path: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<UpdateFilesOutcome> {
        let mut fs = self.workspace.lock().await;
        for (name, content) in files {
            fs.insert(resolve_path(base_path, name), content.clone().into_bytes());
        }
        Ok(UpdateFilesOutcome {
            success: true,
            message: String::new(),
        })
    }

    async fn snapshot(&self, _workspace_dir: &str) -> Result<String> {
        let mut fail = self.fail_next_snapshot.lock().await;
        if *fail {
            *fail = false;
            return Err(ArlError::ExecutionFailed("snapshot failed (injected)".into()));
        }
        drop(fail);
        Ok(self.content_hash().await)
    }

    async fn restore(&self, _snapshot_id: &str) -> Result<()> {
        Ok(())
    }

    async fn signal_process(&self, _pid: u32, _signal: &str) -> Result<()> {
        Ok(())
    }

    async fn reset(&self, preserve_files: bool) -> Result<()> {
        if !preserve_files {
            self.workspace.lock().await.clear();
        }
        Ok(())
    }

    /// An echo shell: every `Input` frame is reflected back as `Output`,
    /// `Input` of exactly `"exit\n"`/`"exit"` ends the session with
    /// `Exit{exit_code:0}`, `Signal`/`Resize` are accepted and ignored.
    /// Sufficient for the Gateway's own shell-bridge unit tests without a
    /// real pod.
    async fn open_shell(&self, _working_dir: &str) -> Result<ShellChannel> {
        let (to_sidecar_tx, mut to_sidecar_rx) = mpsc::unbounded_channel::<ShellMessage>();
        let (from_sidecar_tx, from_sidecar_rx) = mpsc::unbounded_channel::<ShellMessage>();

        tokio::spawn(async move {
            while let Some(msg) = to_sidecar_rx.recv().await {
                match msg {
                    ShellMessage::Input { data } => {
                        if data.trim() == "exit" {
                            let _ = from_sidecar_tx.send(ShellMessage::Exit { exit_code: 0 });
                            break;
                        }
                        if from_sidecar_tx.send(ShellMessage::Output { data }).is_err() {
                            break;
                        }
                    }
                    ShellMessage::Signal { .. } | ShellMessage::Resize { .. } => {}
                    ShellMessage::Output { .. } | ShellMessage::Exit { .. } | ShellMessage::Error { .. } => {}
                }
            }
        });

        Ok(ShellChannel {
            to_sidecar: to_sidecar_tx,
            from_sidecar: from_sidecar_rx,
        })
    }
}

fn resolve_path(base: &str, name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), name)
    }
}

/// Recognizes `echo <content> > <path>` and `echo <content> >> <path>`,
/// the two shapes the spec's scenarios (S2, S3) and tool tests use.
fn parse_redirect_write(script: &str, working_dir: &str) -> Option<(String, String)> {
    let script = script.trim();
    let rest = script.strip_prefix("echo ")?;
    let (content_part, path_part) = if let Some(idx) = rest.find(" >> ") {
        (&rest[..idx], &rest[idx + 4..])
    } else {
        let idx = rest.find(" > ")?;
        (&rest[..idx], &rest[idx + 3..])
    };
    let content = content_part.trim().trim_matches('"').trim_matches('\'');
    let path = resolve_path(working_dir, path_part.trim());
    Some((path, format!("{content}\n")))
}

fn parse_cat(script: &str, working_dir: &str) -> Option<String> {
    let rest = script.trim().strip_prefix("cat ")?;
    Some(resolve_path(working_dir, rest.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_write_then_read_round_trips() {
        let fake = FakeSidecarClient::new();
        fake.execute(
            &["sh".into(), "-c".into(), "echo 1 > /workspace/a.txt".into()],
            &BTreeMap::new(),
            "/workspace",
            None,
        )
        .await
        .unwrap();

        let out = fake
            .execute(
                &["cat".into(), "/workspace/a.txt".into()],
                &BTreeMap::new(),
                "/workspace",
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "1\n");
    }

    #[tokio::test]
    async fn snapshot_determinism_p2() {
        let fake = FakeSidecarClient::new();
        fake.execute(
            &["sh".into(), "-c".into(), "echo x > /workspace/a.txt".into()],
            &BTreeMap::new(),
            "/workspace",
            None,
        )
        .await
        .unwrap();
        let s1 = fake.snapshot("/workspace").await.unwrap();
        let s2 = fake.snapshot("/workspace").await.unwrap();
        assert_eq!(s1, s2);
    }

    #[tokio::test]
    async fn injected_snapshot_failure_surfaces_once() {
        let fake = FakeSidecarClient::new();
        fake.fail_next_snapshot().await;
        assert!(fake.snapshot("/workspace").await.is_err());
        assert!(fake.snapshot("/workspace").await.is_ok());
    }
}
