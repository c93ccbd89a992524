//! Builders for the child resources the operator owns: the headless
//! service, the ordered replica set, and scaling-task Jobs.

use crate::{CLUSTER_LABEL, ROLE_LABEL, STORE_CONTAINER};
use anyhow::Context;
use controller::TaskSpec;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use models::ShardedCluster;
use serde_json::json;

/// Owner reference that ties every child to its cluster, so cascading
/// deletion also terminates in-flight tasks.
pub fn owner_reference(cluster: &ShardedCluster) -> anyhow::Result<OwnerReference> {
    Ok(OwnerReference {
        api_version: ShardedCluster::api_version(&()).to_string(),
        kind: ShardedCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.uid().context("cluster object has no uid")?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

fn pod_labels(name: &str) -> serde_json::Value {
    json!({
        "app.kubernetes.io/name": "shardscale",
        CLUSTER_LABEL: name,
    })
}

pub fn headless_service(cluster: &ShardedCluster, service: &str) -> anyhow::Result<Service> {
    let name = cluster.name_any();
    let owner = serde_json::to_value(owner_reference(cluster)?)?;
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": service,
            "namespace": cluster.namespace(),
            "labels": pod_labels(&name),
            "ownerReferences": [owner],
        },
        "spec": {
            "clusterIP": "None",
            "publishNotReadyAddresses": true,
            "selector": pod_labels(&name),
            "ports": [
                {"name": "client", "port": models::client_port()},
                {"name": "gossip", "port": models::client_port() + 10000},
            ],
        },
    }))
    .context("building headless service")
}

/// The ordered replica set materializing the shard layout: position
/// `i × (replicasPerShard + 1)` is primary `i`, the standby group last.
pub fn stateful_set(
    cluster: &ShardedCluster,
    service: &str,
    store_image: &str,
    pods: i32,
) -> anyhow::Result<StatefulSet> {
    let name = cluster.name_any();
    let owner = serde_json::to_value(owner_reference(cluster)?)?;
    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {
            "name": name,
            "namespace": cluster.namespace(),
            "labels": pod_labels(&name),
            "ownerReferences": [owner],
        },
        "spec": {
            "serviceName": service,
            "replicas": pods,
            // The bootstrap wires all pods at once; no need to gate pod
            // creation on ordinal order.
            "podManagementPolicy": "Parallel",
            "selector": {"matchLabels": pod_labels(&name)},
            "template": {
                "metadata": {"labels": pod_labels(&name)},
                "spec": {
                    "containers": [{
                        "name": STORE_CONTAINER,
                        "image": store_image,
                        "command": ["redis-server"],
                        "args": [
                            "--cluster-enabled", "yes",
                            "--cluster-config-file", "/data/nodes.conf",
                            "--appendonly", "no",
                        ],
                        "ports": [
                            {"name": "client", "containerPort": models::client_port()},
                            {"name": "gossip", "containerPort": models::client_port() + 10000},
                        ],
                        "readinessProbe": {
                            "tcpSocket": {"port": models::client_port()},
                            "initialDelaySeconds": 3,
                            "periodSeconds": 5,
                        },
                        "volumeMounts": [{"name": "data", "mountPath": "/data"}],
                    }],
                    "volumes": [{"name": "data", "emptyDir": {}}],
                },
            },
        },
    }))
    .context("building stateful set")
}

/// A one-shot Job running this operator's own image to execute one admin
/// operation to completion.
pub fn scaling_task_job(
    cluster: &ShardedCluster,
    task: &TaskSpec,
    runner_image: &str,
    seed_addrs: &str,
) -> anyhow::Result<Job> {
    let name = cluster.name_any();
    let owner = serde_json::to_value(owner_reference(cluster)?)?;
    let mut args = vec![
        "task".to_string(),
        "--timeout".to_string(),
        format!("{}s", task.timeout_seconds),
    ];
    args.extend(task.args.iter().cloned());

    serde_json::from_value(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": task.name,
            "namespace": cluster.namespace(),
            "labels": {
                CLUSTER_LABEL: name,
                ROLE_LABEL: "scaling-task",
            },
            "ownerReferences": [owner],
        },
        "spec": {
            // The protocol layer owns retries; a failed attempt must be
            // observed, not silently re-run.
            "backoffLimit": 0,
            "activeDeadlineSeconds": task.timeout_seconds,
            "template": {
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": "task",
                        "image": runner_image,
                        "args": args,
                        "env": [{"name": "SEED_ADDRS", "value": seed_addrs}],
                    }],
                },
            },
        },
    }))
    .context("building scaling task job")
}

#[cfg(test)]
mod test {
    use super::*;

    fn cluster() -> ShardedCluster {
        let cluster: ShardedCluster = serde_json::from_value(json!({
            "apiVersion": "shardscale.io/v1alpha1",
            "kind": "ShardedCluster",
            "metadata": {
                "name": "kv",
                "namespace": "default",
                "uid": "0000-1111",
            },
            "spec": {
                "activeShards": 3,
                "autoScale": true,
                "metricsEndpoint": "http://prometheus:9090",
            },
        }))
        .unwrap();
        cluster
    }

    #[test]
    fn stateful_set_matches_the_ordering_convention() {
        let cluster = cluster();
        let sts = stateful_set(&cluster, "kv", "redis:7.2", 8).unwrap();
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(8));
        assert_eq!(spec.service_name, "kv");
        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.name, STORE_CONTAINER);
        assert!(container
            .args
            .as_ref()
            .unwrap()
            .contains(&"--cluster-enabled".to_string()));
    }

    #[test]
    fn job_runs_the_task_subcommand_with_deadline() {
        let cluster = cluster();
        let task = TaskSpec {
            name: "kv-reshard".to_string(),
            args: vec![
                "reshard".to_string(),
                "--from".to_string(),
                "aa".to_string(),
                "--to".to_string(),
                "bb".to_string(),
                "--slots".to_string(),
                "42".to_string(),
            ],
            timeout_seconds: 120,
        };
        let job = scaling_task_job(&cluster, &task, "shardscale:latest", "10.0.0.1:6379").unwrap();
        let spec = job.spec.unwrap();
        assert_eq!(spec.active_deadline_seconds, Some(120));
        assert_eq!(spec.backoff_limit, Some(0));
        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(
            container.args.as_ref().unwrap()[..3],
            ["task".to_string(), "--timeout".to_string(), "120s".to_string()]
        );
        assert_eq!(container.args.as_ref().unwrap()[3], "reshard");
    }

    #[test]
    fn children_carry_a_controller_owner_reference() {
        let cluster = cluster();
        let service = headless_service(&cluster, "kv").unwrap();
        let owners = service.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "ShardedCluster");
        assert_eq!(owners[0].controller, Some(true));
    }
}
