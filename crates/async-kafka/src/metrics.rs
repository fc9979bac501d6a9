//! Consumer lag gauge.
//!
//! One gauge series per {group, topic, partition}, set to
//! `high_water_mark - offset` right before each record is decoded. Simple-mode
//! consumers report an empty group label.

use prometheus::{IntGaugeVec, Opts};
use std::sync::LazyLock;
use tracing::warn;

pub const OFFSET_DIFF_METRIC: &str = "kafka_consumer_offset_diff";

static OFFSET_DIFF: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            OFFSET_DIFF_METRIC,
            "Difference between the partition high water mark and the offset being processed",
        ),
        &["group", "topic", "partition"],
    )
    .expect("static gauge options are valid");

    if let Err(e) = prometheus::register(Box::new(gauge.clone())) {
        warn!("failed to register {OFFSET_DIFF_METRIC} gauge: {e}");
    }
    gauge
});

/// Record the lag of `offset` behind `high_water_mark` and return it.
pub fn set_offset_diff(
    group: &str,
    topic: &str,
    partition: i32,
    high_water_mark: i64,
    offset: i64,
) -> i64 {
    let diff = high_water_mark - offset;
    OFFSET_DIFF
        .with_label_values(&[group, topic, &partition.to_string()])
        .set(diff);
    diff
}

/// Current lag value for a partition; series that were never set read as 0.
pub fn offset_diff(group: &str, topic: &str, partition: i32) -> Option<i64> {
    OFFSET_DIFF
        .get_metric_with_label_values(&[group, topic, &partition.to_string()])
        .ok()
        .map(|gauge| gauge.get())
}
