//! Protocol counters exported on the operator's metrics endpoint.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter,
    IntCounterVec,
};

lazy_static! {
    pub static ref RESHARDS_COMPLETED: IntCounter = register_int_counter!(
        "shardscale_reshards_completed_total",
        "Scale-up slot migrations completed"
    )
    .unwrap();
    pub static ref DRAINS_COMPLETED: IntCounter = register_int_counter!(
        "shardscale_drains_completed_total",
        "Scale-down drains and rotations completed"
    )
    .unwrap();
    pub static ref PROTOCOL_FAILURES: IntCounterVec = register_int_counter_vec!(
        "shardscale_protocol_failures_total",
        "Scaling protocol failures by step",
        &["step"]
    )
    .unwrap();
    pub static ref TICK_DURATION: Histogram = register_histogram!(
        "shardscale_tick_duration_seconds",
        "Wall time of one reconciliation tick"
    )
    .unwrap();
}
