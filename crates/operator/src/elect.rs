//! Lease-based leader election over the object store, so only one
//! operator replica drives reconciliation at a time.

use anyhow::Context;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use std::time::Duration;

const LEASE_DURATION_SECONDS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(5);

pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, lease_name: &str, identity: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Blocks until this instance holds the lease.
    pub async fn acquire(&self) -> anyhow::Result<()> {
        loop {
            if self.try_acquire().await? {
                tracing::info!(lease = %self.lease_name, identity = %self.identity, "acquired leadership");
                return Ok(());
            }
            tokio::time::sleep(RENEW_INTERVAL).await;
        }
    }

    /// Renews forever. Returns an error when leadership is lost, at
    /// which point the caller must stop reconciling.
    pub async fn keep_renewed(&self) -> anyhow::Result<()> {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            if !self.try_acquire().await.context("renewing lease")? {
                anyhow::bail!("leadership lost to another instance");
            }
        }
    }

    async fn try_acquire(&self) -> anyhow::Result<bool> {
        let now = MicroTime(chrono::Utc::now());

        let Some(mut lease) = self
            .api
            .get_opt(&self.lease_name)
            .await
            .context("reading lease")?
        else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.lease_name.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                    acquire_time: Some(now.clone()),
                    renew_time: Some(now),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                // Another instance created it first.
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                Err(err) => Err(err).context("creating lease"),
            };
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let held_by_us = spec.holder_identity.as_deref() == Some(self.identity.as_str());
        let expired = spec.renew_time.as_ref().map_or(true, |renewed| {
            let duration = i64::from(spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS));
            (chrono::Utc::now() - renewed.0).num_seconds() > duration
        });
        if !held_by_us && !expired {
            return Ok(false);
        }

        lease.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
            acquire_time: if held_by_us {
                spec.acquire_time
            } else {
                Some(now.clone())
            },
            renew_time: Some(now),
            lease_transitions: Some(
                spec.lease_transitions.unwrap_or(0) + i32::from(!held_by_us),
            ),
            ..Default::default()
        });
        // The replace carries the read resourceVersion: losing the race
        // surfaces as a conflict, not a silent takeover.
        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(err) => Err(err).context("updating lease"),
        }
    }
}
