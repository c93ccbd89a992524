//! Translates metric samples and spec thresholds into a scaling verdict.
//!
//! Pure and synchronous: everything here is decided from one snapshot of
//! samples and one membership view, which keeps the rules exhaustively
//! unit-testable.

use crate::gate::ActivePrimary;
use models::ClusterSpec;
use probe::Sample;
use std::collections::BTreeMap;

/// How many active primaries must simultaneously sit below both low
/// thresholds before a shrink is considered. A single underutilized shard
/// is deliberately not enough; that suppresses oscillation.
pub const SHRINK_QUORUM: usize = 2;

#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    None,
    Grow {
        /// Pod identity of the overloaded primary to split.
        trigger: String,
        /// Human-readable account of the exceeded signals.
        reason: String,
    },
    Shrink {
        /// Pod identity of the primary to drain: always the highest-index
        /// active primary, so the ordered replica set shrinks at its tail.
        victim: String,
        dest_a: String,
        dest_b: Option<String>,
    },
}

/// Decides a verdict for one tick. `samples` covers active primaries only
/// (the standby is never sampled); `actives` is ordinal-sorted.
pub fn decide(
    spec: &ClusterSpec,
    samples: &BTreeMap<String, Sample>,
    actives: &[ActivePrimary],
) -> Verdict {
    if let Some(verdict) = grow_verdict(spec, samples) {
        return verdict;
    }
    if let Some(verdict) = shrink_verdict(spec, samples, actives) {
        return verdict;
    }
    Verdict::None
}

/// Grow when any active primary exceeds either high threshold. Among the
/// exceeders, the one with the highest memory wins: for an in-memory
/// store, memory is the more conservative signal than CPU.
fn grow_verdict(spec: &ClusterSpec, samples: &BTreeMap<String, Sample>) -> Option<Verdict> {
    let trigger = samples
        .iter()
        .filter(|(_, s)| s.cpu_pct > spec.cpu_high.into() || s.mem_pct > spec.mem_high.into())
        .max_by(|(_, a), (_, b)| a.mem_pct.total_cmp(&b.mem_pct))?;

    let (pod, sample) = trigger;
    let mut signals = Vec::new();
    if sample.cpu_pct > spec.cpu_high.into() {
        signals.push(format!("CPU overloaded {:.0}%", sample.cpu_pct));
    }
    if sample.mem_pct > spec.mem_high.into() {
        signals.push(format!("memory overloaded {:.0}%", sample.mem_pct));
    }
    Some(Verdict::Grow {
        trigger: pod.clone(),
        reason: signals.join(", "),
    })
}

/// Shrink when the shard count has headroom above its floor and at least
/// [`SHRINK_QUORUM`] active primaries sit below both low thresholds.
fn shrink_verdict(
    spec: &ClusterSpec,
    samples: &BTreeMap<String, Sample>,
    actives: &[ActivePrimary],
) -> Option<Verdict> {
    if spec.active_shards <= spec.min_shards.max(models::ABSOLUTE_MIN_SHARDS) {
        return None;
    }
    let underutilized = samples
        .values()
        .filter(|s| s.cpu_pct < spec.cpu_low.into() && s.mem_pct < spec.mem_low.into())
        .count();
    if underutilized < SHRINK_QUORUM {
        return None;
    }

    // The victim is the highest-index active primary: a stable choice
    // that never fragments the ordered replica set.
    let victim = actives.last()?;

    // Destinations are the two lowest-memory active primaries, and must
    // themselves sit at primary positions of the ordered layout.
    let mut candidates: Vec<&ActivePrimary> = actives
        .iter()
        .filter(|a| models::is_primary_ordinal(a.ordinal, spec.replicas_per_shard))
        .filter(|a| samples.contains_key(&a.pod))
        .collect();
    candidates.sort_by(|a, b| {
        samples[&a.pod]
            .mem_pct
            .total_cmp(&samples[&b.pod].mem_pct)
            .then(a.ordinal.cmp(&b.ordinal))
    });

    let mut lowest = candidates.into_iter().take(2);
    let (first, second) = (lowest.next()?, lowest.next());

    if first.pod == victim.pod {
        // The victim itself is among the two lowest; migrate everything
        // to the single remaining destination.
        let dest = second?;
        return Some(Verdict::Shrink {
            victim: victim.pod.clone(),
            dest_a: dest.pod.clone(),
            dest_b: None,
        });
    }
    match second {
        Some(second) if second.pod == victim.pod => Some(Verdict::Shrink {
            victim: victim.pod.clone(),
            dest_a: first.pod.clone(),
            dest_b: None,
        }),
        Some(second) => Some(Verdict::Shrink {
            victim: victim.pod.clone(),
            dest_a: first.pod.clone(),
            dest_b: Some(second.pod.clone()),
        }),
        None => Some(Verdict::Shrink {
            victim: victim.pod.clone(),
            dest_a: first.pod.clone(),
            dest_b: None,
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec(active: i32, min: i32) -> ClusterSpec {
        serde_json::from_value(serde_json::json!({
            "activeShards": active,
            "minShards": min,
            "replicasPerShard": 1,
            "autoScale": true,
            "cpuHigh": 70, "cpuLow": 20,
            "memHigh": 70, "memLow": 30,
            "metricsEndpoint": "http://prometheus:9090",
        }))
        .unwrap()
    }

    fn actives(spec: &ClusterSpec) -> Vec<ActivePrimary> {
        (0..spec.active_shards)
            .map(|i| {
                let ordinal = models::primary_ordinal(i, spec.replicas_per_shard);
                ActivePrimary {
                    pod: format!("kv-{ordinal}"),
                    ordinal,
                    node_id: format!("node{i}"),
                    slots: 16384 / spec.active_shards as u16,
                }
            })
            .collect()
    }

    fn samples(load: &[(&str, f64, f64)]) -> BTreeMap<String, Sample> {
        load.iter()
            .map(|(pod, cpu_pct, mem_pct)| {
                (
                    pod.to_string(),
                    Sample {
                        cpu_pct: *cpu_pct,
                        mem_pct: *mem_pct,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn steady_state_yields_no_verdict() {
        // Scenario: every primary at half load against 70% thresholds.
        let spec = spec(3, 3);
        let samples = samples(&[
            ("kv-0", 50.0, 50.0),
            ("kv-2", 50.0, 50.0),
            ("kv-4", 50.0, 50.0),
        ]);
        assert_eq!(decide(&spec, &samples, &actives(&spec)), Verdict::None);
    }

    #[test]
    fn grows_on_memory_and_names_the_signal() {
        let spec = spec(3, 3);
        let samples = samples(&[
            ("kv-0", 50.0, 50.0),
            ("kv-2", 50.0, 82.0),
            ("kv-4", 50.0, 50.0),
        ]);
        assert_eq!(
            decide(&spec, &samples, &actives(&spec)),
            Verdict::Grow {
                trigger: "kv-2".to_string(),
                reason: "memory overloaded 82%".to_string(),
            }
        );
    }

    #[test]
    fn memory_breaks_ties_between_exceeders() {
        // kv-0 exceeds CPU harder, kv-4 exceeds memory: memory wins.
        let spec = spec(3, 3);
        let samples = samples(&[
            ("kv-0", 95.0, 40.0),
            ("kv-2", 10.0, 10.0),
            ("kv-4", 72.0, 70.6),
        ]);
        let Verdict::Grow { trigger, reason } = decide(&spec, &samples, &actives(&spec)) else {
            panic!("expected grow");
        };
        assert_eq!(trigger, "kv-4");
        assert_eq!(reason, "CPU overloaded 72%, memory overloaded 71%");
    }

    #[test]
    fn shrinks_with_quorum_and_targets_tail() {
        // Five shards, four idle, one slightly warm but also under both
        // thresholds: shrink proceeds, victim is the tail primary.
        let spec = spec(5, 3);
        let samples = samples(&[
            ("kv-0", 10.0, 25.0),
            ("kv-2", 10.0, 25.0),
            ("kv-4", 10.0, 25.0),
            ("kv-6", 10.0, 25.0),
            ("kv-8", 12.0, 28.0),
        ]);
        let Verdict::Shrink {
            victim,
            dest_a,
            dest_b,
        } = decide(&spec, &samples, &actives(&spec))
        else {
            panic!("expected shrink");
        };
        assert_eq!(victim, "kv-8");
        // Destinations are the two lowest-memory primaries; the 25% pods
        // tie and ordinal order breaks the tie.
        assert_eq!(dest_a, "kv-0");
        assert_eq!(dest_b.as_deref(), Some("kv-2"));
    }

    #[test]
    fn one_warm_pod_does_not_block_shrink() {
        // Four primaries idle, one at CPU 35%: the quorum of two
        // underutilized primaries is met, so shrink proceeds.
        let spec = spec(5, 3);
        let samples = samples(&[
            ("kv-0", 10.0, 10.0),
            ("kv-2", 10.0, 10.0),
            ("kv-4", 10.0, 10.0),
            ("kv-6", 10.0, 10.0),
            ("kv-8", 35.0, 10.0),
        ]);
        assert!(matches!(
            decide(&spec, &samples, &actives(&spec)),
            Verdict::Shrink { .. }
        ));
    }

    #[test]
    fn no_shrink_at_min_shards() {
        let spec = spec(3, 3);
        let samples = samples(&[
            ("kv-0", 1.0, 1.0),
            ("kv-2", 1.0, 1.0),
            ("kv-4", 1.0, 1.0),
        ]);
        assert_eq!(decide(&spec, &samples, &actives(&spec)), Verdict::None);
    }

    #[test]
    fn no_shrink_below_quorum() {
        // Exactly one underutilized pod, others idling at the boundary
        // (boundary values are not strictly below the threshold).
        let spec = spec(5, 3);
        let samples = samples(&[
            ("kv-0", 20.0, 30.0),
            ("kv-2", 20.0, 30.0),
            ("kv-4", 20.0, 30.0),
            ("kv-6", 20.0, 30.0),
            ("kv-8", 5.0, 5.0),
        ]);
        assert_eq!(decide(&spec, &samples, &actives(&spec)), Verdict::None);
    }

    #[test]
    fn victim_among_lowest_memory_falls_back_to_single_destination() {
        let spec = spec(4, 3);
        // Tail primary kv-6 has the lowest memory of all.
        let samples = samples(&[
            ("kv-0", 10.0, 29.0),
            ("kv-2", 10.0, 20.0),
            ("kv-4", 10.0, 25.0),
            ("kv-6", 10.0, 5.0),
        ]);
        let Verdict::Shrink {
            victim,
            dest_a,
            dest_b,
        } = decide(&spec, &samples, &actives(&spec))
        else {
            panic!("expected shrink");
        };
        assert_eq!(victim, "kv-6");
        assert_eq!(dest_a, "kv-2");
        assert_eq!(dest_b, None);
    }

    #[test]
    fn grow_takes_precedence_over_shrink() {
        // One overloaded primary amid idle peers must grow, not shrink.
        let spec = spec(5, 3);
        let samples = samples(&[
            ("kv-0", 1.0, 1.0),
            ("kv-2", 1.0, 1.0),
            ("kv-4", 1.0, 1.0),
            ("kv-6", 1.0, 1.0),
            ("kv-8", 1.0, 90.0),
        ]);
        assert!(matches!(
            decide(&spec, &samples, &actives(&spec)),
            Verdict::Grow { .. }
        ));
    }
}
