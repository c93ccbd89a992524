//! The `task` subcommand: runs exactly one admin operation to completion.
//! Scaling-task Jobs execute this binary so that long-running migrations
//! never hold a reconciler worker.

use std::time::Duration;
use topology::Admin;

#[derive(clap::Args, Debug)]
pub struct TaskArgs {
    /// Comma-separated `host:port` node addresses of the target cluster.
    #[arg(long, env = "SEED_ADDRS", value_delimiter = ',', required = true)]
    pub seeds: Vec<String>,

    /// Overall deadline of the operation.
    #[arg(long, default_value = "600s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    #[command(subcommand)]
    pub op: TaskOp,
}

#[derive(clap::Subcommand, Debug)]
pub enum TaskOp {
    /// Migrate hash slots between two primaries.
    Reshard {
        /// Member id of the source primary.
        #[arg(long)]
        from: String,
        /// Member id of the destination primary.
        #[arg(long)]
        to: String,
        #[arg(long)]
        slots: u16,
    },
    /// Reconcile topology inconsistencies and verify health.
    Fix,
}

pub async fn run(args: TaskArgs) -> anyhow::Result<()> {
    let client = topology::Client::new(topology::ClientConfig {
        seeds: args.seeds.clone(),
        ..Default::default()
    });

    match args.op {
        TaskOp::Reshard { from, to, slots } => {
            tracing::info!(%from, %to, slots, "running reshard task");
            client.reshard(&from, &to, slots, args.timeout).await
        }
        TaskOp::Fix => {
            tracing::info!("running fix task");
            client.fix().await?;
            anyhow::ensure!(client.health().await?, "cluster unhealthy after fix");
            Ok(())
        }
    }
}
