//! Per-shard load sampling against a Prometheus-compatible query API.
//!
//! The probe reports the most recent instantaneous CPU and memory ratio of
//! each active primary. It neither aggregates nor smooths; noise handling
//! is the decision engine's problem, staleness handling the caller's.

use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// One pod's instantaneous load.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub cpu_pct: f64,
    pub mem_pct: f64,
}

/// What to sample: one cluster's active primaries.
#[derive(Clone, Debug)]
pub struct Query {
    /// Base URL of the metrics source.
    pub endpoint: url::Url,
    pub namespace: String,
    pub cluster: String,
    /// Name of the store container within each pod.
    pub container: String,
    /// Pod names of the active primaries. The standby is excluded by the
    /// caller and never sampled.
    pub primaries: Vec<String>,
}

#[async_trait::async_trait]
pub trait MetricsSource: Send + Sync {
    /// Samples CPU% and memory% for the queried primaries, joined by pod.
    /// Pods missing either metric are dropped silently; an empty result is
    /// the caller's signal to skip the tick.
    async fn sample(&self, query: &Query) -> anyhow::Result<BTreeMap<String, Sample>>;
}

/// Deadline of one instant query. Metric sampling must never stall a tick.
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PromProbe {
    http: reqwest::Client,
}

impl PromProbe {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .context("building metrics HTTP client")?;
        Ok(Self { http })
    }

    async fn instant_vector(
        &self,
        endpoint: &url::Url,
        promql: &str,
    ) -> anyhow::Result<Vec<(String, f64)>> {
        let url = endpoint
            .join("api/v1/query")
            .context("composing metrics query URL")?;
        let body: Envelope = self
            .http
            .get(url)
            .query(&[("query", promql)])
            .send()
            .await
            .context("metrics query request failed")?
            .error_for_status()
            .context("metrics query was rejected")?
            .json()
            .await
            .context("decoding metrics query response")?;
        parse_instant_vector(body)
    }
}

#[async_trait::async_trait]
impl MetricsSource for PromProbe {
    #[tracing::instrument(skip_all, fields(cluster = %query.cluster))]
    async fn sample(&self, query: &Query) -> anyhow::Result<BTreeMap<String, Sample>> {
        let cpu = self
            .instant_vector(&query.endpoint, &cpu_query(query))
            .await?;
        let mem = self
            .instant_vector(&query.endpoint, &mem_query(query))
            .await?;
        let samples = join_samples(cpu, mem, &query.primaries);
        tracing::debug!(pods = samples.len(), "sampled primaries");
        Ok(samples)
    }
}

/// CPU% of one core: rate of consumed CPU seconds over a one-minute
/// window, scaled to a percentage.
fn cpu_query(query: &Query) -> String {
    format!(
        r#"100 * sum by (pod) (rate(container_cpu_usage_seconds_total{{namespace="{ns}",container="{container}",pod=~"{cluster}-\\d+"}}[1m]))"#,
        ns = query.namespace,
        container = query.container,
        cluster = query.cluster,
    )
}

/// Memory%: working set over the configured limit.
fn mem_query(query: &Query) -> String {
    format!(
        r#"100 * sum by (pod) (container_memory_working_set_bytes{{namespace="{ns}",container="{container}",pod=~"{cluster}-\\d+"}}) / sum by (pod) (container_spec_memory_limit_bytes{{namespace="{ns}",container="{container}",pod=~"{cluster}-\\d+"}})"#,
        ns = query.namespace,
        container = query.container,
        cluster = query.cluster,
    )
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    data: Option<VectorData>,
}

#[derive(Debug, Deserialize)]
struct VectorData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<Series>,
}

#[derive(Debug, Deserialize)]
struct Series {
    metric: BTreeMap<String, String>,
    /// `[unix_seconds, "value"]`
    value: (f64, String),
}

fn parse_instant_vector(envelope: Envelope) -> anyhow::Result<Vec<(String, f64)>> {
    anyhow::ensure!(
        envelope.status == "success",
        "metrics source answered status {:?}",
        envelope.status
    );
    let data = envelope.data.context("metrics response carries no data")?;
    anyhow::ensure!(
        data.result_type == "vector",
        "expected an instant vector, got {:?}",
        data.result_type
    );

    let mut out = Vec::with_capacity(data.result.len());
    for series in data.result {
        let Some(pod) = series.metric.get("pod") else {
            continue;
        };
        let Ok(value) = series.value.1.parse::<f64>() else {
            continue;
        };
        if value.is_finite() {
            out.push((pod.clone(), value));
        }
    }
    Ok(out)
}

/// Joins the two metric vectors by pod, keeping only queried primaries
/// that reported both metrics.
fn join_samples(
    cpu: Vec<(String, f64)>,
    mem: Vec<(String, f64)>,
    primaries: &[String],
) -> BTreeMap<String, Sample> {
    let mem: BTreeMap<String, f64> = mem.into_iter().collect();
    cpu.into_iter()
        .filter(|(pod, _)| primaries.iter().any(|p| p == pod))
        .filter_map(|(pod, cpu_pct)| {
            let mem_pct = *mem.get(&pod)?;
            Some((pod, Sample { cpu_pct, mem_pct }))
        })
        .collect()
}
