//! Pod Template Builder (spec.md §4.A).
//!
//! Renders a `k8s_openapi::api::core::v1::Pod` from a `WarmPoolSpec`:
//! an `executor` container (user image, workspace + tools volumes,
//! resources), a `sidecar` container (fixed image, RPC port), and a
//! `tool-init` init container that materializes each `InlineTool` under
//! `/opt/arl/tools/<name>/` and writes `/opt/arl/tools/registry.json`
//! atomically. Field-by-field construction of `k8s_openapi` types,
//! exactly the way the teacher's
//! `backend/kubernetes_pool.rs::build_warm_pod` and
//! `backend/kubernetes_operator.rs::reconcile_sandbox` build `Pod`s.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, EmptyDirVolumeSource, EnvVar, NodeAffinity, NodeSelectorRequirement,
    NodeSelectorTerm, Pod, PodSpec, PreferredSchedulingTerm, ResourceRequirements as K8sResources,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::{warm_labels, WarmPoolSpec, LABEL_POOL, LABEL_STATUS, STATUS_IDLE};
use crate::error::{ArlError, Result};
use crate::scheduler::{preferred_node_count, top_k_nodes};
use crate::types::{InlineTool, ResourceRequirements};
use crate::validation;

pub const SIDECAR_IMAGE: &str = "arl-sidecar:latest";
pub const TOOLS_MOUNT_PATH: &str = "/opt/arl/tools";
const TOOLS_VOLUME: &str = "arl-tools";
const WORKSPACE_VOLUME: &str = "arl-workspace";

/// Validates a WarmPool's admission-critical fields before a pod (or the
/// WarmPool object itself) is ever written, per spec.md §4.A: "the gateway
/// validates before writing the object".
pub fn validate_pool_spec(spec: &WarmPoolSpec) -> Result<()> {
    spec.resources
        .validate()
        .map_err(ArlError::InvalidArgument)?;

    let names: Vec<&str> = spec.tools.iter().map(|t| t.name.as_str()).collect();
    validation::validate_no_duplicate_tool_names(&names).map_err(ArlError::InvalidArgument)?;

    for tool in &spec.tools {
        tool.validate().map_err(ArlError::InvalidArgument)?;
    }

    Ok(())
}

/// Build the executor + sidecar pod for one replica of `pool_name`, with
/// node affinity computed from the image-locality hint over `nodes`.
pub fn build_pod(
    pool_name: &str,
    namespace: &str,
    spec: &WarmPoolSpec,
    pod_name: &str,
    nodes: &[String],
    sidecar_port: u16,
) -> Result<Pod> {
    validate_pool_spec(spec)?;

    let mut labels = warm_labels(pool_name);
    labels.insert(LABEL_STATUS.to_string(), STATUS_IDLE.to_string());

    let executor = Container {
        name: "executor".to_string(),
        image: Some(spec.image.clone()),
        resources: Some(to_k8s_resources(&spec.resources)),
        volume_mounts: Some(vec![
            VolumeMount {
                name: WORKSPACE_VOLUME.to_string(),
                mount_path: spec.workspace_dir.clone(),
                ..Default::default()
            },
            VolumeMount {
                name: TOOLS_VOLUME.to_string(),
                mount_path: TOOLS_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let sidecar = Container {
        name: "sidecar".to_string(),
        image: Some(SIDECAR_IMAGE.to_string()),
        ports: Some(vec![k8s_openapi::api::core::v1::ContainerPort {
            container_port: sidecar_port as i32,
            name: Some("rpc".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: WORKSPACE_VOLUME.to_string(),
                mount_path: spec.workspace_dir.clone(),
                ..Default::default()
            },
            VolumeMount {
                name: TOOLS_VOLUME.to_string(),
                mount_path: TOOLS_MOUNT_PATH.to_string(),
                ..Default::default()
            },
        ]),
        env: Some(vec![EnvVar {
            name: "ARL_SIDECAR_PORT".to_string(),
            value: Some(sidecar_port.to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let init_containers = if spec.tools.is_empty() {
        None
    } else {
        Some(vec![build_tool_init_container(&spec.tools)?])
    };

    let affinity = if spec.image_locality.enabled && !nodes.is_empty() {
        let k = preferred_node_count(spec.replicas.max(1), spec.image_locality.spread_factor);
        let preferred = top_k_nodes(&spec.image, nodes, k);
        Some(build_affinity(&preferred, spec.image_locality.weight))
    } else {
        None
    };

    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            init_containers,
            containers: vec![executor, sidecar],
            volumes: Some(vec![
                Volume {
                    name: WORKSPACE_VOLUME.to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                },
                Volume {
                    name: TOOLS_VOLUME.to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                },
            ]),
            restart_policy: Some("Never".to_string()),
            affinity,
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(pod)
}

fn to_k8s_resources(res: &ResourceRequirements) -> K8sResources {
    let to_map = |m: &BTreeMap<String, String>| -> BTreeMap<String, Quantity> {
        m.iter().map(|(k, v)| (k.clone(), Quantity(v.clone()))).collect()
    };
    K8sResources {
        requests: if res.requests.is_empty() {
            None
        } else {
            Some(to_map(&res.requests))
        },
        limits: if res.limits.is_empty() {
            None
        } else {
            Some(to_map(&res.limits))
        },
        ..Default::default()
    }
}

fn build_affinity(preferred_nodes: &[String], weight: i32) -> Affinity {
    let terms: Vec<PreferredSchedulingTerm> = preferred_nodes
        .iter()
        .map(|node| PreferredSchedulingTerm {
            weight,
            preference: NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: "kubernetes.io/hostname".to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![node.clone()]),
                }]),
                ..Default::default()
            },
        })
        .collect();

    Affinity {
        node_affinity: Some(NodeAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(terms),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the `tool-init` init container: a small embedded shell script
/// that writes each tool's files, chmods its entrypoint, and appends a
/// manifest to `/opt/arl/tools/registry.json` atomically
/// (write-to-temp-then-rename).
fn build_tool_init_container(tools: &[InlineTool]) -> Result<Container> {
    let script = render_tool_init_script(tools)?;
    Ok(Container {
        name: "tool-init".to_string(),
        image: Some("busybox:1.36".to_string()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
        volume_mounts: Some(vec![VolumeMount {
            name: TOOLS_VOLUME.to_string(),
            mount_path: TOOLS_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    })
}

/// Render the shell script the init container runs. Each tool's files are
/// base64-embedded to avoid any shell-quoting hazard with file contents.
fn render_tool_init_script(tools: &[InlineTool]) -> Result<String> {
    use base64::Engine as _;
    let mut script = String::from("set -e\nmkdir -p /opt/arl/tools\nmanifest_tmp=$(mktemp)\necho '{\"tools\":[' > \"$manifest_tmp\"\nfirst=1\n");

    for tool in tools {
        let dir = format!("{TOOLS_MOUNT_PATH}/{}", tool.name);
        script.push_str(&format!("mkdir -p '{dir}'\n"));
        for (filename, content) in &tool.files {
            let encoded = base64::engine::general_purpose::STANDARD.encode(content.as_bytes());
            script.push_str(&format!(
                "echo '{encoded}' | base64 -d > '{dir}/{filename}'\n",
            ));
        }
        script.push_str(&format!("chmod +x '{dir}/{}'\n", tool.entrypoint));

        let manifest = serde_json::json!({
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
            "entrypoint": tool.entrypoint,
            "runtime": tool.runtime,
            "timeout": tool.timeout,
        });
        let manifest_json = serde_json::to_string(&manifest).map_err(|e| ArlError::Other(e.into()))?;
        let manifest_b64 = base64::engine::general_purpose::STANDARD.encode(manifest_json.as_bytes());
        script.push_str("if [ \"$first\" = 1 ]; then first=0; else echo ',' >> \"$manifest_tmp\"; fi\n");
        script.push_str(&format!("echo '{manifest_b64}' | base64 -d >> \"$manifest_tmp\"\n"));
    }

    script.push_str("echo ']}' >> \"$manifest_tmp\"\nmv \"$manifest_tmp\" /opt/arl/tools/registry.json\n");
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::WarmPoolSpec;
    use crate::types::{ImageLocality, ToolRuntime};
    use std::collections::BTreeMap;

    fn sample_spec() -> WarmPoolSpec {
        WarmPoolSpec {
            image: "python:3.11-slim".to_string(),
            workspace_dir: "/workspace".to_string(),
            replicas: 4,
            resources: ResourceRequirements::default(),
            image_locality: ImageLocality::default(),
            tools: vec![],
            max_surge: 1,
        }
    }

    #[test]
    fn builds_two_containers_and_labels() {
        let spec = sample_spec();
        let nodes = vec!["n0".into(), "n1".into(), "n2".into()];
        let pod = build_pod("p1", "default", &spec, "p1-abcde", &nodes, 9090).unwrap();
        let pod_spec = pod.spec.unwrap();
        assert_eq!(pod_spec.containers.len(), 2);
        assert_eq!(pod_spec.containers[0].name, "executor");
        assert_eq!(pod_spec.containers[1].name, "sidecar");
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get(LABEL_POOL).unwrap(), "p1");
        assert_eq!(labels.get(LABEL_STATUS).unwrap(), STATUS_IDLE);
    }

    #[test]
    fn attaches_node_affinity_from_locality_hint() {
        let spec = sample_spec();
        let nodes: Vec<String> = (0..4).map(|i| format!("node-{i}")).collect();
        let pod = build_pod("p1", "default", &spec, "p1-abcde", &nodes, 9090).unwrap();
        let affinity = pod.spec.unwrap().affinity.unwrap();
        let terms = affinity
            .node_affinity
            .unwrap()
            .preferred_during_scheduling_ignored_during_execution
            .unwrap();
        assert_eq!(terms.len(), 4); // spreadFactor=1.0, replicas=4 -> k=4
    }

    #[test]
    fn no_affinity_when_locality_disabled() {
        let mut spec = sample_spec();
        spec.image_locality.enabled = false;
        let nodes = vec!["n0".into()];
        let pod = build_pod("p1", "default", &spec, "p1-abcde", &nodes, 9090).unwrap();
        assert!(pod.spec.unwrap().affinity.is_none());
    }

    #[test]
    fn rejects_duplicate_tool_names() {
        let mut spec = sample_spec();
        let mut files = BTreeMap::new();
        files.insert("run.sh".to_string(), "#!/bin/sh\necho hi\n".to_string());
        let tool = InlineTool {
            name: "greet".into(),
            runtime: ToolRuntime::Bash,
            entrypoint: "run.sh".into(),
            timeout: "10s".into(),
            parameters: serde_json::json!({}),
            files: files.clone(),
            description: String::new(),
        };
        spec.tools = vec![tool.clone(), tool];
        let err = build_pod("p1", "default", &spec, "p1-abcde", &[], 9090).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn init_container_present_with_tools() {
        let mut spec = sample_spec();
        let mut files = BTreeMap::new();
        files.insert("run.sh".to_string(), "#!/bin/sh\necho hi\n".to_string());
        spec.tools = vec![InlineTool {
            name: "greet".into(),
            runtime: ToolRuntime::Bash,
            entrypoint: "run.sh".into(),
            timeout: "10s".into(),
            parameters: serde_json::json!({}),
            files,
            description: String::new(),
        }];
        let pod = build_pod("p1", "default", &spec, "p1-abcde", &[], 9090).unwrap();
        let init = pod.spec.unwrap().init_containers.unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].name, "tool-init");
    }
}
