//! Production `SandboxProvisioner` (spec.md §4.E.1, §4.E.3), driving the
//! `Sandbox` CRD through `kube::Api` exactly the way
//! `backend::kubernetes_pool::KubernetesPool::acquire` drives its own
//! allocate-then-wait-for-ready call, generalized from "claim a
//! pre-started container" to "create a Sandbox object and let the Sandbox
//! controller (`controller::sandbox::reconcile`) adopt an idle pod onto
//! it". The Gateway never touches pod labels itself; that CAS dance is
//! entirely the controller's job, so this module is a thin create +
//! poll + delete wrapper.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use uuid::Uuid;

use crate::crd::{Sandbox, SandboxPhase, SandboxSpec, WarmPool};
use crate::error::{ArlError, Result};
use crate::gateway::session::{AllocatedSandbox, SandboxProvisioner};
use crate::sidecar::TcpSidecarClient;

pub struct KubeSandboxProvisioner {
    client: kube::Client,
    sidecar_port: u16,
    rpc_timeout: Duration,
    poll_interval: Duration,
}

impl KubeSandboxProvisioner {
    pub fn new(client: kube::Client, sidecar_port: u16, rpc_timeout: Duration) -> Self {
        Self {
            client,
            sidecar_port,
            rpc_timeout,
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl SandboxProvisioner for KubeSandboxProvisioner {
    async fn allocate(
        &self,
        pool_ref: &str,
        namespace: &str,
        idle_timeout_seconds: Option<u64>,
        max_lifetime_seconds: Option<u64>,
        ready_deadline: Duration,
    ) -> Result<AllocatedSandbox> {
        let pools: Api<WarmPool> = Api::namespaced(self.client.clone(), namespace);
        let pool = pools
            .get(pool_ref)
            .await
            .map_err(|e| ArlError::NotFound(format!("pool '{pool_ref}' not found: {e}")))?;

        let sandboxes: Api<Sandbox> = Api::namespaced(self.client.clone(), namespace);
        let name = format!("sbx-{}", Uuid::new_v4());
        let sandbox = Sandbox {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: SandboxSpec {
                pool_ref: pool_ref.to_string(),
                keep_alive: false,
                idle_timeout_seconds,
                max_lifetime_seconds,
            },
            status: None,
        };

        sandboxes
            .create(&PostParams::default(), &sandbox)
            .await
            .map_err(|e| ArlError::Other(e.into()))?;

        let deadline = tokio::time::Instant::now() + ready_deadline;
        loop {
            let current = sandboxes
                .get(&name)
                .await
                .map_err(|e| ArlError::Other(e.into()))?;
            let status = current.status.unwrap_or_default();
            match status.phase {
                SandboxPhase::Ready => {
                    return Ok(AllocatedSandbox {
                        sandbox_name: name,
                        pod_name: status.pod_name,
                        pod_ip: status.pod_ip.clone(),
                        workspace_dir: pool.spec.workspace_dir.clone(),
                        sidecar: std::sync::Arc::new(TcpSidecarClient::new(
                            &status.pod_ip,
                            self.sidecar_port,
                            self.rpc_timeout,
                        )),
                    });
                }
                SandboxPhase::Failed => {
                    return Err(ArlError::SandboxNotReady(format!(
                        "sandbox {name} failed to adopt a pod from pool '{pool_ref}'"
                    )));
                }
                SandboxPhase::Pending | SandboxPhase::Terminated => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ArlError::Timeout(format!(
                    "sandbox {name} did not become Ready within {:?}",
                    ready_deadline
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn release(&self, sandbox_name: &str, namespace: &str) -> Result<()> {
        let sandboxes: Api<Sandbox> = Api::namespaced(self.client.clone(), namespace);
        match sandboxes.delete(sandbox_name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(ArlError::Other(e.into())),
        }
    }

    async fn touch_activity(&self, sandbox_name: &str, namespace: &str) -> Result<()> {
        let sandboxes: Api<Sandbox> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": { "last_activity_at": chrono::Utc::now() } });
        sandboxes
            .patch_status(
                sandbox_name,
                &kube::api::PatchParams::default(),
                &kube::api::Patch::Merge(&patch),
            )
            .await
            .map(|_| ())
            .or_else(|e| match e {
                kube::Error::Api(err) if err.code == 404 => Ok(()),
                e => Err(ArlError::Other(e.into())),
            })
    }
}

