use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Most recent conditions kept on the status. Older entries fall off.
pub const MAX_CONDITIONS: usize = 8;

/// The reconciliation phase, with witness fields carried only by the
/// phases that use them. At most one scaling protocol is ever in flight.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "type")]
pub enum Phase {
    /// Created but not yet bootstrapped (or discovered, in existing mode).
    #[default]
    Uninitialized,
    /// Monitoring; the only phase from which a scaling verdict is taken.
    Stable,
    /// Half of the overloaded primary's slots are moving into the standby.
    #[serde(rename_all = "camelCase")]
    ScalingUp {
        /// Pod identity of the overloaded primary being split.
        overloaded: String,
    },
    /// The replica set has grown by one shard's worth of pods; the new
    /// tail is being joined as the fresh standby.
    #[serde(rename_all = "camelCase")]
    ProvisioningStandby {
        /// Join attempts so far. Bounded; exhaustion fails the cluster.
        #[serde(default)]
        attempts: i32,
    },
    /// A victim primary is being drained and rotated into the standby role.
    #[serde(rename_all = "camelCase")]
    ScalingDown {
        /// Pod identity of the primary being drained.
        victim: String,
        /// First migration destination.
        dest_a: String,
        /// Second migration destination, absent when the victim itself was
        /// among the two lowest-memory primaries.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest_b: Option<String>,
        /// Resumption point for a restarted controller.
        stage: DrainStage,
    },
    /// A protocol invariant was violated or retries were exhausted.
    /// Cleared only by operator intervention (editing spec or status).
    #[serde(rename_all = "camelCase")]
    Failed { step: String, detail: String },
}

/// Sequencing of the scale-down protocol across ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum DrainStage {
    /// Move the first half of the victim's slots to the first destination.
    DrainFirstHalf,
    /// Move the remainder to the second destination.
    DrainSecondHalf,
    /// Excise old membership, shrink the replica set, rejoin the drained
    /// victim as the fresh standby.
    Rotate,
}

impl Phase {
    pub fn is_stable(&self) -> bool {
        matches!(self, Phase::Stable)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Phase::Failed { .. })
    }

    /// Short name used in logs and the phase printer column.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Uninitialized => "Uninitialized",
            Phase::Stable => "Stable",
            Phase::ScalingUp { .. } => "ScalingUp",
            Phase::ProvisioningStandby { .. } => "ProvisioningStandby",
            Phase::ScalingDown { .. } => "ScalingDown",
            Phase::Failed { .. } => "Failed",
        }
    }
}

/// A user-visible record of why the controller did (or could not do)
/// something. Bounded history, most recent first.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Machine-readable reason, e.g. "CooldownActive" or "ReshardFailed".
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// ClusterStatus is the observed state, authored only by the controller.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterStatus {
    pub phase: Phase,

    /// Primaries observed in the replica set, standby included.
    pub observed_shards: i32,
    /// Total pods observed in the replica set.
    pub observed_replicas: i32,

    /// Pod identity of the unique zero-slot primary. Meaningful in
    /// `Stable`; absent while a fresh standby is being provisioned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub standby: Option<String>,

    /// Completion time of the last scaling protocol, successful or not.
    /// Cooldown is measured from here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scale_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ClusterStatus {
    /// Records a condition, deduplicating an identical head entry so that
    /// an unchanged verdict leaves the status at a fixed point.
    pub fn record(&mut self, reason: &str, message: impl Into<String>, now: DateTime<Utc>) {
        let message = message.into();
        if let Some(head) = self.conditions.first() {
            if head.reason == reason && head.message == message {
                return;
            }
        }
        self.conditions.insert(
            0,
            Condition {
                reason: reason.to_string(),
                message,
                last_transition_time: now,
            },
        );
        self.conditions.truncate(MAX_CONDITIONS);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn phase_round_trips_with_witness_fields() {
        let phase = Phase::ScalingDown {
            victim: "kv-8".to_string(),
            dest_a: "kv-0".to_string(),
            dest_b: Some("kv-4".to_string()),
            stage: DrainStage::DrainSecondHalf,
        };
        let json = serde_json::to_value(&phase).unwrap();
        assert_eq!(json["type"], "ScalingDown");
        assert_eq!(json["destA"], "kv-0");
        assert_eq!(json["stage"], "DrainSecondHalf");
        let parsed: Phase = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, phase);
    }

    #[test]
    fn default_phase_is_uninitialized() {
        let status: ClusterStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.phase, Phase::Uninitialized);
    }

    #[test]
    fn record_deduplicates_and_bounds_history() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut status = ClusterStatus::default();

        status.record("CooldownActive", "cooldown remaining 30s", t0);
        status.record("CooldownActive", "cooldown remaining 30s", t0 + chrono::Duration::seconds(5));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].last_transition_time, t0);

        for i in 0..20 {
            status.record("GateHold", format!("hold {i}"), t0);
        }
        assert_eq!(status.conditions.len(), MAX_CONDITIONS);
        assert_eq!(status.conditions[0].message, "hold 19");
    }
}
