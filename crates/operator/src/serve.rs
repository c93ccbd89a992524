//! The `serve` subcommand: leader election, the probe endpoint, and the
//! watch-driven controller loop. Reconciliation of each cluster object is
//! serialized by the runtime; distinct objects reconcile in parallel.

use crate::elect::LeaderElector;
use crate::kube_plane::KubeOrchestrator;
use anyhow::Context as _;
use controller::{ClusterCx, Orchestrator, Reconciler};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use models::ShardedCluster;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Port of the probe and metrics endpoint.
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Image run by scaling-task Jobs; usually this operator's own image.
    #[arg(long, env = "TASK_RUNNER_IMAGE")]
    pub task_runner_image: String,

    /// Image of the sharded store.
    #[arg(long, env = "STORE_IMAGE", default_value = "redis:7.2")]
    pub store_image: String,

    /// Namespace holding the leader-election lease.
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub lease_namespace: String,

    /// Holder identity for leader election.
    #[arg(long, env = "POD_NAME", default_value = "shardscale-operator")]
    pub identity: String,

    /// Skip leader election (single-replica deployments).
    #[arg(long, env = "SINGLE_INSTANCE", default_value_t = false)]
    pub single_instance: bool,
}

struct Ctx {
    client: Client,
    probe: Arc<probe::PromProbe>,
    task_runner_image: String,
    store_image: String,
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ReconcileError(#[from] anyhow::Error);

pub async fn run(args: ServeArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("building Kubernetes client")?;

    let ready = Arc::new(AtomicBool::new(false));
    tokio::spawn(crate::http::serve(args.http_port, ready.clone()));

    if !args.single_instance {
        let elector = LeaderElector::new(
            client.clone(),
            &args.lease_namespace,
            "shardscale-operator",
            &args.identity,
        );
        elector.acquire().await?;
        tokio::spawn(async move {
            if let Err(err) = elector.keep_renewed().await {
                tracing::error!(error = ?err, "lost leadership; exiting");
                std::process::exit(1);
            }
        });
    }
    ready.store(true, Ordering::Relaxed);

    let context = Arc::new(Ctx {
        client: client.clone(),
        probe: Arc::new(probe::PromProbe::new()?),
        task_runner_image: args.task_runner_image,
        store_image: args.store_image,
    });

    let clusters: Api<ShardedCluster> = Api::all(client.clone());
    Controller::new(clusters, watcher::Config::default())
        .owns(
            Api::<StatefulSet>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(Api::<Job>::all(client.clone()), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => tracing::debug!(object = %object.name, "reconciled"),
                Err(err) => tracing::warn!(error = ?err, "reconcile failed"),
            }
        })
        .await;

    Ok(())
}

async fn reconcile(
    cluster: Arc<ShardedCluster>,
    ctx: Arc<Ctx>,
) -> Result<Action, ReconcileError> {
    let requeue = reconcile_inner(cluster, ctx).await?;
    Ok(Action::requeue(requeue))
}

fn error_policy(_cluster: Arc<ShardedCluster>, _error: &ReconcileError, _ctx: Arc<Ctx>) -> Action {
    Action::requeue(Duration::from_secs(10))
}

async fn reconcile_inner(
    cluster: Arc<ShardedCluster>,
    ctx: Arc<Ctx>,
) -> anyhow::Result<Duration> {
    let name = cluster.name_any();
    let namespace = cluster
        .namespace()
        .context("cluster object has no namespace")?;

    let cx = ClusterCx {
        name: name.clone(),
        namespace: namespace.clone(),
        service: cluster
            .spec
            .service_name
            .clone()
            .unwrap_or_else(|| name.clone()),
        container: crate::STORE_CONTAINER.to_string(),
        spec: cluster.spec.clone(),
    };

    let plane = Arc::new(KubeOrchestrator::new(
        ctx.client.clone(),
        cluster.clone(),
        ctx.task_runner_image.clone(),
        ctx.store_image.clone(),
    )?);

    // Data-plane membership is reached through the current pod IPs; the
    // listing itself tolerates any one seed being down.
    let seeds: Vec<String> = plane
        .pods()
        .await?
        .iter()
        .filter_map(|p| p.ip.as_deref())
        .map(|ip| format!("{ip}:{}", models::client_port()))
        .collect();
    let admin = Arc::new(topology::Client::new(topology::ClientConfig {
        seeds,
        ..Default::default()
    }));

    let reconciler = Reconciler {
        plane: plane.clone(),
        admin,
        metrics_source: ctx.probe.clone(),
    };

    let mut status = cluster.status.clone().unwrap_or_default();
    let requeue = reconciler.tick(&cx, &mut status).await;

    if cluster.status.as_ref() != Some(&status) {
        write_status(&ctx.client, &cluster, &namespace, &name, status).await?;
    }
    Ok(requeue)
}

/// Writes status with optimistic concurrency: the object carries the
/// resourceVersion it was read at, so a concurrent writer surfaces as a
/// conflict and the change is retried from a fresh read on requeue.
async fn write_status(
    client: &Client,
    cluster: &ShardedCluster,
    namespace: &str,
    name: &str,
    status: models::ClusterStatus,
) -> anyhow::Result<()> {
    let api: Api<ShardedCluster> = Api::namespaced(client.clone(), namespace);
    let mut updated = ShardedCluster::clone(cluster);
    updated.status = Some(status);

    match api
        .replace_status(name, &PostParams::default(), serde_json::to_vec(&updated)?)
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            tracing::debug!(cluster = %name, "status write conflicted; retrying from a fresh read");
            Ok(())
        }
        Err(err) => Err(err).context("writing cluster status"),
    }
}
