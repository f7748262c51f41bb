//! Presentation-side reduction of traffic series.
//!
//! Storage keeps every sample; graphs ask for at most `max_points` and get
//! fixed-size buckets averaged into one point each.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::TrafficSample;

/// One point of a traffic series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrafficPoint {
    pub timestamp: Option<DateTime<Utc>>,
    pub received_bytes: u64,
    pub sent_bytes: u64,
}

impl From<&TrafficSample> for TrafficPoint {
    fn from(sample: &TrafficSample) -> Self {
        Self {
            timestamp: Some(sample.recorded_at),
            received_bytes: sample.received_bytes,
            sent_bytes: sample.sent_bytes,
        }
    }
}

/// Per-second transfer rate between two consecutive points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RatePoint {
    pub timestamp: DateTime<Utc>,
    pub received_per_sec: f64,
    pub sent_per_sec: f64,
}

/// Reduce `series` to at most `max_points` points.
///
/// Series that already fit, and a budget of zero, come back unchanged.
/// Otherwise the series is cut into consecutive buckets of
/// `ceil(len / max_points)` samples (the last may be shorter). Each bucket
/// becomes one point carrying its first non-null timestamp and the mean of
/// its byte fields, rounded half up.
pub fn downsample(series: &[TrafficPoint], max_points: usize) -> Vec<TrafficPoint> {
    if max_points == 0 || series.len() <= max_points {
        return series.to_vec();
    }

    let bucket_size = series.len().div_ceil(max_points);
    series
        .chunks(bucket_size)
        .map(|bucket| TrafficPoint {
            timestamp: bucket.iter().find_map(|p| p.timestamp),
            received_bytes: rounded_mean(bucket.iter().map(|p| p.received_bytes), bucket.len()),
            sent_bytes: rounded_mean(bucket.iter().map(|p| p.sent_bytes), bucket.len()),
        })
        .collect()
}

fn rounded_mean(values: impl Iterator<Item = u64>, count: usize) -> u64 {
    let count = count as u128;
    let sum: u128 = values.map(u128::from).sum();
    ((sum + count / 2) / count) as u64
}

/// Per-second rates between consecutive timestamped points of a cumulative
/// series. A decrease is a counter reset and counts the new value as the
/// transfer since the previous point.
pub fn rates(series: &[TrafficPoint]) -> Vec<RatePoint> {
    let points: Vec<(DateTime<Utc>, &TrafficPoint)> = series
        .iter()
        .filter_map(|p| p.timestamp.map(|ts| (ts, p)))
        .collect();

    points
        .windows(2)
        .filter_map(|pair| {
            let (prev_ts, prev) = pair[0];
            let (ts, cur) = pair[1];
            let elapsed = (ts - prev_ts).num_milliseconds();
            if elapsed <= 0 {
                return None;
            }
            let secs = elapsed as f64 / 1000.0;
            Some(RatePoint {
                timestamp: ts,
                received_per_sec: reset_safe_delta(prev.received_bytes, cur.received_bytes) as f64
                    / secs,
                sent_per_sec: reset_safe_delta(prev.sent_bytes, cur.sent_bytes) as f64 / secs,
            })
        })
        .collect()
}

/// Growth of a cumulative counter from `previous` to `current`. When the
/// counter went backwards the source was reset and everything it counted
/// since then is new.
pub fn reset_safe_delta(previous: u64, current: u64) -> u64 {
    if current < previous {
        current
    } else {
        current - previous
    }
}
