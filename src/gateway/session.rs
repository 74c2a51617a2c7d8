//! The Gateway's in-memory Session table (spec.md §4.E.1, §5).
//!
//! Grounded in the teacher's `backend::kubernetes_pool::KubernetesPool`
//! warm/active bookkeeping for the allocate-and-track shape, generalized
//! from "one pool of active containers" to "one table of active
//! sessions, each owning exactly one Sandbox". The sharded map follows
//! SPEC_FULL.md §5's "Session-map concurrency" design note: a `Vec` of
//! `tokio::sync::Mutex`-guarded buckets, shard chosen by a hash of the
//! session id, so that two unrelated sessions never contend on the same
//! lock. Each `Session` additionally carries its own execution mutex
//! (P6: at-most-one Execute RPC in flight per session at a time),
//! separate from the lock guarding its mutable fields.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::sidecar::SidecarClient;
use crate::types::{SessionInfo, StepResult};

/// Result of successfully allocating (or re-allocating, for restore) a
/// Sandbox for a session: the pod it was bound to, and a ready-to-use
/// sidecar client for that pod.
pub struct AllocatedSandbox {
    pub sandbox_name: String,
    pub pod_name: String,
    pub pod_ip: String,
    pub workspace_dir: String,
    pub sidecar: Arc<dyn SidecarClient>,
}

/// The Gateway's view onto Sandbox provisioning (spec.md §4.E.1, §4.E.3).
/// A trait so the Gateway's own tests can run the full session lifecycle
/// without a real cluster; `KubeSandboxProvisioner` (gateway/kube.rs) is
/// the production implementation driving the Sandbox CRD through `kube`.
#[async_trait]
pub trait SandboxProvisioner: Send + Sync {
    /// Create a Sandbox bound to `pool_ref` and poll until it is Ready
    /// or `ready_deadline` elapses (spec.md §5, default 5 min).
    async fn allocate(
        &self,
        pool_ref: &str,
        namespace: &str,
        idle_timeout_seconds: Option<u64>,
        max_lifetime_seconds: Option<u64>,
        ready_deadline: Duration,
    ) -> Result<AllocatedSandbox>;

    /// Delete the Sandbox (and, transitively, its pod).
    async fn release(&self, sandbox_name: &str, namespace: &str) -> Result<()>;

    /// Record `lastActivityAt = now` on the Sandbox (spec.md §4.D: "updated
    /// by the gateway on every execute/restore/shell byte").
    async fn touch_activity(&self, sandbox_name: &str, namespace: &str) -> Result<()>;
}

/// Mutable session fields, behind one lock per spec.md §5's "per-session
/// lock protects that session's fields".
pub struct SessionState {
    pub sandbox_name: String,
    pub pod_name: String,
    pub pod_ip: String,
    pub workspace_dir: String,
    pub sidecar: Arc<dyn SidecarClient>,
    pub last_activity_at: DateTime<Utc>,
    pub history: Vec<StepResult>,
}

/// An active session: one client's binding to one (at a time) Sandbox,
/// plus its append-only step history (spec.md §3).
pub struct Session {
    pub id: Uuid,
    pub pool_ref: String,
    pub namespace: String,
    pub created_at: DateTime<Utc>,
    pub idle_timeout_seconds: Option<u64>,
    pub max_lifetime_seconds: Option<u64>,
    pub max_history: Option<usize>,
    state: Mutex<SessionState>,
    /// Serialises Execute RPCs (P6) and is held for the whole duration of
    /// a restore (spec.md §5: "restore acquires the same mutex for its
    /// entire duration").
    pub exec_lock: Mutex<()>,
}

impl Session {
    pub fn new(
        id: Uuid,
        pool_ref: String,
        namespace: String,
        idle_timeout_seconds: Option<u64>,
        max_lifetime_seconds: Option<u64>,
        max_history: Option<usize>,
        allocated: AllocatedSandbox,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            pool_ref,
            namespace,
            created_at: now,
            idle_timeout_seconds,
            max_lifetime_seconds,
            max_history,
            state: Mutex::new(SessionState {
                sandbox_name: allocated.sandbox_name,
                pod_name: allocated.pod_name,
                pod_ip: allocated.pod_ip,
                workspace_dir: allocated.workspace_dir,
                sidecar: allocated.sidecar,
                last_activity_at: now,
                history: Vec::new(),
            }),
            exec_lock: Mutex::new(()),
        }
    }

    pub async fn info(&self) -> SessionInfo {
        let state = self.state.lock().await;
        SessionInfo {
            id: self.id,
            sandbox_name: state.sandbox_name.clone(),
            namespace: self.namespace.clone(),
            pool_ref: self.pool_ref.clone(),
            pod_ip: state.pod_ip.clone(),
            pod_name: state.pod_name.clone(),
            created_at: self.created_at,
        }
    }

    pub async fn history_snapshot(&self) -> Vec<StepResult> {
        self.state.lock().await.history.clone()
    }

    pub async fn sandbox_name(&self) -> String {
        self.state.lock().await.sandbox_name.clone()
    }

    pub async fn is_idle_expired(&self, now: DateTime<Utc>) -> bool {
        match self.idle_timeout_seconds {
            Some(secs) => {
                let last = self.state.lock().await.last_activity_at;
                (now - last).num_seconds() >= secs as i64
            }
            None => false,
        }
    }

    pub fn is_lifetime_expired(&self, now: DateTime<Utc>) -> bool {
        match self.max_lifetime_seconds {
            Some(secs) => (now - self.created_at).num_seconds() >= secs as i64,
            None => false,
        }
    }

    /// Append `steps` starting at the current history length, dropping the
    /// oldest non-bearing-snapshot... actually eviction is applied by the
    /// caller via `enforce_history_cap` once the whole batch lands, so that
    /// a cap never splits a single execute's results across eviction.
    pub(crate) async fn with_state<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut SessionState) -> T,
    {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    /// Evict the oldest history entries once `max_history` is exceeded,
    /// per SPEC_FULL.md's resolution of the "unbounded history" Open
    /// Question: oldest-first, but never a step that is the *only*
    /// remaining carrier of a snapshot id another step's restore plan
    /// would need — in practice this means we simply never evict the most
    /// recent snapshot-bearing step, keeping at least one restore target
    /// reachable.
    pub(crate) fn enforce_history_cap(history: &mut Vec<StepResult>, max_history: Option<usize>) {
        let Some(cap) = max_history else { return };
        if history.len() <= cap {
            return;
        }
        let overflow = history.len() - cap;
        let last_snapshot_pos = history.iter().rposition(|s| !s.snapshot_id.is_empty());
        let mut evicted = 0;
        let mut keep_from = 0;
        for (i, _) in history.iter().enumerate() {
            if evicted >= overflow {
                break;
            }
            if Some(i) == last_snapshot_pos {
                continue;
            }
            keep_from = i + 1;
            evicted += 1;
        }
        if keep_from > 0 {
            history.drain(0..keep_from);
        }
    }
}

const SHARD_COUNT: usize = 16;

/// Sharded session table (spec.md §5's "Session-map concurrency").
pub struct SessionTable {
    shards: Vec<Mutex<HashMap<Uuid, Arc<Session>>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_index(id: &Uuid) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() as usize) % SHARD_COUNT
    }

    pub async fn insert(&self, session: Arc<Session>) {
        let idx = Self::shard_index(&session.id);
        self.shards[idx].lock().await.insert(session.id, session);
    }

    pub async fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        let idx = Self::shard_index(id);
        self.shards[idx].lock().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &Uuid) -> Option<Arc<Session>> {
        let idx = Self::shard_index(id);
        self.shards[idx].lock().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.lock().await.len();
        }
        total
    }

    /// Snapshot of every session's id, for idle/lifetime sweeps.
    pub async fn ids(&self) -> Vec<Uuid> {
        let mut ids = Vec::new();
        for shard in &self.shards {
            ids.extend(shard.lock().await.keys().copied());
        }
        ids
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic in-memory `SandboxProvisioner` for tests: "allocates" by
/// minting a new `FakeSidecarClient` per call, mirroring the
/// single-use-pod default (spec.md §9 Open Question: "callers should
/// assume single-use").
pub struct FakeSandboxProvisioner {
    counter: std::sync::atomic::AtomicU64,
    pub workspace_dir: String,
}

impl FakeSandboxProvisioner {
    pub fn new() -> Self {
        Self {
            counter: std::sync::atomic::AtomicU64::new(0),
            workspace_dir: "/workspace".to_string(),
        }
    }
}

impl Default for FakeSandboxProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxProvisioner for FakeSandboxProvisioner {
    async fn allocate(
        &self,
        pool_ref: &str,
        _namespace: &str,
        _idle_timeout_seconds: Option<u64>,
        _max_lifetime_seconds: Option<u64>,
        _ready_deadline: Duration,
    ) -> Result<AllocatedSandbox> {
        let n = self.counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let pod_name = format!("{pool_ref}-fake-{n}");
        Ok(AllocatedSandbox {
            sandbox_name: format!("sbx-{n}"),
            pod_name: pod_name.clone(),
            pod_ip: pod_name,
            workspace_dir: self.workspace_dir.clone(),
            sidecar: Arc::new(crate::sidecar::FakeSidecarClient::new()),
        })
    }

    async fn release(&self, _sandbox_name: &str, _namespace: &str) -> Result<()> {
        Ok(())
    }

    async fn touch_activity(&self, _sandbox_name: &str, _namespace: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StepOutput, StepRequest};

    async fn new_test_session(id: Uuid) -> Session {
        let provisioner = FakeSandboxProvisioner::new();
        let allocated = provisioner
            .allocate("p1", "default", None, None, Duration::from_secs(5))
            .await
            .unwrap();
        Session::new(id, "p1".into(), "default".into(), None, None, None, allocated)
    }

    #[tokio::test]
    async fn table_insert_get_remove_round_trips() {
        let table = SessionTable::new();
        let session = Arc::new(new_test_session(Uuid::new_v4()).await);
        let id = session.id;
        table.insert(session).await;
        assert_eq!(table.len().await, 1);
        assert!(table.get(&id).await.is_some());
        table.remove(&id).await;
        assert!(table.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn idle_expiry_uses_last_activity() {
        let session = new_test_session(Uuid::new_v4()).await;
        let far_future = Utc::now() + chrono::Duration::seconds(100);
        assert!(!session.is_idle_expired(Utc::now()).await);
        let session = Session {
            idle_timeout_seconds: Some(5),
            ..session
        };
        assert!(session.is_idle_expired(far_future).await);
    }

    fn step(index: u64, snapshot_id: &str) -> StepResult {
        StepResult {
            index,
            name: format!("s{index}"),
            input: StepRequest {
                name: format!("s{index}"),
                command: vec!["true".into()],
                env: Default::default(),
                work_dir: None,
                timeout: None,
            },
            output: StepOutput::default(),
            snapshot_id: snapshot_id.to_string(),
            duration_ms: 1,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn history_cap_evicts_oldest_first() {
        let mut history = vec![step(0, "s0"), step(1, "s1"), step(2, "s2"), step(3, "s3")];
        Session::enforce_history_cap(&mut history, Some(2));
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].index, 2);
        assert_eq!(history[1].index, 3);
    }

    #[test]
    fn history_cap_preserves_the_last_snapshot_bearing_step() {
        let mut history = vec![step(0, "s0"), step(1, ""), step(2, ""), step(3, "")];
        Session::enforce_history_cap(&mut history, Some(1));
        // step 0 is the only snapshot carrier; it must survive eviction.
        assert!(history.iter().any(|s| s.index == 0));
    }

    #[test]
    fn no_cap_is_a_no_op() {
        let mut history = vec![step(0, "s0"), step(1, "s1")];
        Session::enforce_history_cap(&mut history, None);
        assert_eq!(history.len(), 2);
    }
}
