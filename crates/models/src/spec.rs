use crate::status::ClusterStatus;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The hard lower bound on active shards. A sharded store needs three
/// primaries for a quorum of configuration epochs, regardless of what the
/// spec's `minShards` says.
pub const ABSOLUTE_MIN_SHARDS: i32 = 3;

/// ClusterSpec is the desired state of one sharded key-value deployment.
///
/// `activeShards` counts primaries that own hash slots; the deployment
/// always provisions one additional zero-slot primary (the standby) plus
/// `replicasPerShard` secondaries per primary.
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "shardscale.io",
    version = "v1alpha1",
    kind = "ShardedCluster",
    namespaced,
    status = "ClusterStatus",
    shortname = "skv",
    printcolumn = r#"{"name":"Shards","type":"integer","jsonPath":".spec.activeShards"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase.type"}"#,
    printcolumn = r#"{"name":"Standby","type":"string","jsonPath":".status.standby"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Active primaries, excluding the standby.
    pub active_shards: i32,

    /// Lower bound for scale-down.
    #[serde(default = "default_min_shards")]
    pub min_shards: i32,

    /// Secondaries per primary.
    #[serde(default)]
    pub replicas_per_shard: i32,

    /// When false, the controller observes but never scales.
    #[serde(default)]
    pub auto_scale: bool,

    /// CPU percentage above which a shard is considered overloaded.
    #[serde(default = "default_cpu_high")]
    pub cpu_high: i32,
    /// CPU percentage below which a shard is considered underutilized.
    #[serde(default = "default_cpu_low")]
    pub cpu_low: i32,
    /// Memory percentage above which a shard is considered overloaded.
    #[serde(default = "default_mem_high")]
    pub mem_high: i32,
    /// Memory percentage below which a shard is considered underutilized.
    #[serde(default = "default_mem_low")]
    pub mem_low: i32,

    /// Minimum seconds between completed scaling protocols.
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u32,
    /// Active deadline for one externally-run topology task.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_seconds: u32,
    /// Requeue cadence of the stable monitoring path.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u32,

    /// Base URL of the Prometheus-compatible metrics source.
    pub metrics_endpoint: url::Url,

    /// When set, the deployment is managed externally and the controller
    /// discovers it instead of creating it.
    #[serde(default)]
    pub existing_mode: bool,
    /// Pod label selector for discovery. Required with `existingMode`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<BTreeMap<String, String>>,
    /// Headless service of the externally-managed deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    /// Whether the controller may resize the externally-managed replica set.
    #[serde(default)]
    pub manage_replica_set: bool,
}

fn default_min_shards() -> i32 {
    ABSOLUTE_MIN_SHARDS
}
fn default_cpu_high() -> i32 {
    70
}
fn default_cpu_low() -> i32 {
    20
}
fn default_mem_high() -> i32 {
    70
}
fn default_mem_low() -> i32 {
    30
}
fn default_cooldown() -> u32 {
    300
}
fn default_task_timeout() -> u32 {
    600
}
fn default_poll_interval() -> u32 {
    30
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("activeShards must be at least 1, got {0}")]
    ActiveShards(i32),
    #[error("minShards must be at least 3, got {0}")]
    MinShards(i32),
    #[error("activeShards ({active}) must not be below minShards ({min})")]
    BelowMinShards { active: i32, min: i32 },
    #[error("replicasPerShard must not be negative, got {0}")]
    ReplicasPerShard(i32),
    #[error("{field} must be within [1, 100], got {value}")]
    PercentOutOfRange { field: &'static str, value: i32 },
    #[error("cpuHigh ({high}) must be greater than cpuLow ({low})")]
    CpuThresholdsCrossed { high: i32, low: i32 },
    #[error("memHigh ({high}) must be greater than memLow ({low})")]
    MemThresholdsCrossed { high: i32, low: i32 },
    #[error("{field} must be positive")]
    ZeroInterval { field: &'static str },
    #[error("existingMode requires a pod selector")]
    SelectorRequired,
}

impl ClusterSpec {
    /// Validates the spec up front. An invalid spec is never reconciled.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.active_shards < 1 {
            return Err(ValidationError::ActiveShards(self.active_shards));
        }
        if self.min_shards < ABSOLUTE_MIN_SHARDS {
            return Err(ValidationError::MinShards(self.min_shards));
        }
        if self.active_shards < self.min_shards {
            return Err(ValidationError::BelowMinShards {
                active: self.active_shards,
                min: self.min_shards,
            });
        }
        if self.replicas_per_shard < 0 {
            return Err(ValidationError::ReplicasPerShard(self.replicas_per_shard));
        }
        for (field, value) in [
            ("cpuHigh", self.cpu_high),
            ("cpuLow", self.cpu_low),
            ("memHigh", self.mem_high),
            ("memLow", self.mem_low),
        ] {
            if !(1..=100).contains(&value) {
                return Err(ValidationError::PercentOutOfRange { field, value });
            }
        }
        if self.cpu_high <= self.cpu_low {
            return Err(ValidationError::CpuThresholdsCrossed {
                high: self.cpu_high,
                low: self.cpu_low,
            });
        }
        if self.mem_high <= self.mem_low {
            return Err(ValidationError::MemThresholdsCrossed {
                high: self.mem_high,
                low: self.mem_low,
            });
        }
        for (field, value) in [
            ("cooldownSeconds", self.cooldown_seconds),
            ("taskTimeoutSeconds", self.task_timeout_seconds),
            ("pollIntervalSeconds", self.poll_interval_seconds),
        ] {
            if value == 0 {
                return Err(ValidationError::ZeroInterval { field });
            }
        }
        if self.existing_mode && self.selector.as_ref().map_or(true, |s| s.is_empty()) {
            return Err(ValidationError::SelectorRequired);
        }
        Ok(())
    }

    /// Total pods the ordered replica set must provision:
    /// `(activeShards + 1) × (replicasPerShard + 1)`.
    pub fn desired_pods(&self) -> i32 {
        crate::ordering::desired_pods(self.active_shards, self.replicas_per_shard)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> ClusterSpec {
        serde_json::from_value(serde_json::json!({
            "activeShards": 3,
            "autoScale": true,
            "metricsEndpoint": "http://prometheus.monitoring:9090",
        }))
        .unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let spec = fixture();
        assert_eq!(spec.min_shards, 3);
        assert_eq!(spec.cpu_high, 70);
        assert_eq!(spec.cooldown_seconds, 300);
        assert!(spec.validate().is_ok());
        assert_eq!(spec.desired_pods(), 4);
    }

    #[test]
    fn rejects_crossed_thresholds() {
        let mut spec = fixture();
        spec.cpu_high = 20;
        spec.cpu_low = 20;
        assert_eq!(
            spec.validate(),
            Err(ValidationError::CpuThresholdsCrossed { high: 20, low: 20 })
        );

        let mut spec = fixture();
        spec.mem_high = 10;
        assert_eq!(
            spec.validate(),
            Err(ValidationError::MemThresholdsCrossed { high: 10, low: 30 })
        );
    }

    #[test]
    fn rejects_active_below_min() {
        let mut spec = fixture();
        spec.active_shards = 2;
        spec.min_shards = 3;
        assert_eq!(
            spec.validate(),
            Err(ValidationError::BelowMinShards { active: 2, min: 3 })
        );
    }

    #[test]
    fn rejects_existing_mode_without_selector() {
        let mut spec = fixture();
        spec.existing_mode = true;
        assert_eq!(spec.validate(), Err(ValidationError::SelectorRequired));

        spec.selector = Some([("app".to_string(), "kv".to_string())].into());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_percentages() {
        let mut spec = fixture();
        spec.mem_low = 0;
        assert_eq!(
            spec.validate(),
            Err(ValidationError::PercentOutOfRange {
                field: "memLow",
                value: 0
            })
        );
    }
}
