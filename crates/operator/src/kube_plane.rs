//! Kubernetes-backed implementation of the reconciler's orchestrator
//! contract: pods and desired count through the StatefulSet, one-shot
//! tasks through Jobs, and spec write-back through the cluster object.

use crate::{resources, CLUSTER_LABEL, ROLE_LABEL};
use anyhow::Context;
use chrono::{DateTime, Utc};
use controller::{Orchestrator, PodState, TaskSpec, TaskState};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use models::ShardedCluster;
use std::sync::Arc;

pub struct KubeOrchestrator {
    client: Client,
    cluster: Arc<ShardedCluster>,
    name: String,
    namespace: String,
    service: String,
    task_runner_image: String,
    store_image: String,
}

impl KubeOrchestrator {
    pub fn new(
        client: Client,
        cluster: Arc<ShardedCluster>,
        task_runner_image: String,
        store_image: String,
    ) -> anyhow::Result<Self> {
        let name = cluster.name_any();
        let namespace = cluster
            .namespace()
            .context("cluster object has no namespace")?;
        let service = cluster
            .spec
            .service_name
            .clone()
            .unwrap_or_else(|| name.clone());
        Ok(Self {
            client,
            cluster,
            name,
            namespace,
            service,
            task_runner_image,
            store_image,
        })
    }

    fn clusters(&self) -> Api<ShardedCluster> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn stateful_sets(&self) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods_api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Label selector for this cluster's pods. Existing-mode deployments
    /// bring their own selector.
    fn pod_selector(&self) -> String {
        if let Some(selector) = self
            .cluster
            .spec
            .selector
            .as_ref()
            .filter(|_| self.cluster.spec.existing_mode)
        {
            selector
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",")
        } else {
            format!("{CLUSTER_LABEL}={}", self.name)
        }
    }

    fn is_ready(pod: &Pod) -> bool {
        pod.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
    }

    /// Comma-separated node addresses used by task Jobs to reach the
    /// cluster.
    async fn seed_addrs(&self) -> anyhow::Result<String> {
        let pods = self.pods().await?;
        Ok(pods
            .iter()
            .filter_map(|p| p.ip.as_deref())
            .map(|ip| format!("{ip}:{}", models::client_port()))
            .collect::<Vec<_>>()
            .join(","))
    }
}

fn ordinal_of(name: &str) -> Option<i32> {
    name.rsplit_once('-').and_then(|(_, n)| n.parse().ok())
}

fn job_state(job: &Job) -> TaskState {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    if conditions
        .iter()
        .any(|c| c.type_ == "Complete" && c.status == "True")
    {
        TaskState::Succeeded
    } else if conditions
        .iter()
        .any(|c| c.type_ == "Failed" && c.status == "True")
    {
        TaskState::Failed
    } else {
        TaskState::Running
    }
}

fn ignore_not_found(err: kube::Error) -> anyhow::Result<()> {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Ok(()),
        other => Err(other.into()),
    }
}

fn ignore_already_exists(err: kube::Error) -> anyhow::Result<()> {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Ok(()),
        other => Err(other.into()),
    }
}

#[async_trait::async_trait]
impl Orchestrator for KubeOrchestrator {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn pods(&self) -> anyhow::Result<Vec<PodState>> {
        let params = ListParams::default().labels(&self.pod_selector());
        let list = self
            .pods_api()
            .list(&params)
            .await
            .context("listing cluster pods")?;

        let mut pods: Vec<PodState> = list
            .items
            .iter()
            .filter_map(|pod| {
                let name = pod.name_any();
                let ordinal = ordinal_of(&name)?;
                Some(PodState {
                    ready: Self::is_ready(pod),
                    ip: pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
                    name,
                    ordinal,
                })
            })
            .collect();
        pods.sort_by_key(|p| p.ordinal);
        Ok(pods)
    }

    async fn desired_pods(&self) -> anyhow::Result<Option<i32>> {
        let sts = self
            .stateful_sets()
            .get_opt(&self.name)
            .await
            .context("reading replica set")?;
        Ok(sts.and_then(|s| s.spec.and_then(|spec| spec.replicas)))
    }

    async fn ensure_replica_set(&self, pods: i32) -> anyhow::Result<()> {
        if self.desired_pods().await?.is_some() {
            return Ok(());
        }
        tracing::info!(cluster = %self.name, pods, "creating headless service and replica set");

        let service = resources::headless_service(&self.cluster, &self.service)?;
        let services: Api<k8s_openapi::api::core::v1::Service> =
            Api::namespaced(self.client.clone(), &self.namespace);
        if let Err(err) = services.create(&PostParams::default(), &service).await {
            ignore_already_exists(err).context("creating headless service")?;
        }

        let sts =
            resources::stateful_set(&self.cluster, &self.service, &self.store_image, pods)?;
        if let Err(err) = self.stateful_sets().create(&PostParams::default(), &sts).await {
            ignore_already_exists(err).context("creating replica set")?;
        }
        Ok(())
    }

    async fn resize(&self, pods: i32) -> anyhow::Result<()> {
        tracing::info!(cluster = %self.name, pods, "resizing replica set");
        self.stateful_sets()
            .patch(
                &self.name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({"spec": {"replicas": pods}})),
            )
            .await
            .context("resizing replica set")?;
        Ok(())
    }

    async fn persist_active_shards(&self, shards: i32) -> anyhow::Result<()> {
        tracing::info!(cluster = %self.name, shards, "persisting activeShards");
        self.clusters()
            .patch(
                &self.name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({"spec": {"activeShards": shards}})),
            )
            .await
            .context("persisting activeShards")?;
        Ok(())
    }

    async fn find_task(&self, name: &str) -> anyhow::Result<Option<TaskState>> {
        let job = self
            .jobs()
            .get_opt(name)
            .await
            .context("reading scaling task")?;
        Ok(job.as_ref().map(job_state))
    }

    async fn any_task(&self) -> anyhow::Result<Option<(String, TaskState)>> {
        let params = ListParams::default().labels(&format!(
            "{CLUSTER_LABEL}={},{ROLE_LABEL}=scaling-task",
            self.name
        ));
        let list = self
            .jobs()
            .list(&params)
            .await
            .context("listing scaling tasks")?;
        Ok(list
            .items
            .first()
            .map(|job| (job.name_any(), job_state(job))))
    }

    async fn launch_task(&self, task: TaskSpec) -> anyhow::Result<()> {
        let seeds = self.seed_addrs().await?;
        let job =
            resources::scaling_task_job(&self.cluster, &task, &self.task_runner_image, &seeds)?;
        tracing::info!(cluster = %self.name, task = %task.name, "launching scaling task");
        if let Err(err) = self.jobs().create(&PostParams::default(), &job).await {
            // An identically-named Job means a previous tick already
            // launched this step.
            ignore_already_exists(err).context("creating scaling task")?;
        }
        Ok(())
    }

    async fn delete_task(&self, name: &str) -> anyhow::Result<()> {
        match self
            .jobs()
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => ignore_not_found(err).context("deleting scaling task"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ordinals_parse_from_pod_names() {
        assert_eq!(ordinal_of("kv-12"), Some(12));
        assert_eq!(ordinal_of("my-cluster-0"), Some(0));
        assert_eq!(ordinal_of("headless"), None);
    }

    #[test]
    fn job_conditions_map_to_task_states() {
        let job: Job = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "kv-reshard"},
            "status": {"conditions": [{"type": "Complete", "status": "True"}]},
        }))
        .unwrap();
        assert_eq!(job_state(&job), TaskState::Succeeded);

        let job: Job = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "kv-reshard"},
            "status": {"conditions": [{"type": "Failed", "status": "True"}]},
        }))
        .unwrap();
        assert_eq!(job_state(&job), TaskState::Failed);

        let job: Job = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "kv-reshard"},
            "status": {"active": 1},
        }))
        .unwrap();
        assert_eq!(job_state(&job), TaskState::Running);
    }
}
