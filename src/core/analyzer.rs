//! Usage-pattern statistics over refresh history.
//!
//! Everything here is a pure function of its inputs so the coordinator can
//! recompute peak windows after every run without synchronization.

use crate::core::models::RefreshRecord;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_THRESHOLD: f64 = 1.5;
pub const DEFAULT_MIN_SAMPLES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStat {
    pub weekday: Weekday,
    pub hour: u32,
    pub average_queries_per_hour: f64,
    pub sample_count: usize,
}

/// Recurring `[start_hour, end_hour)` range on one weekday, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeakWindow {
    pub weekday: Weekday,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl PeakWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at.weekday() == self.weekday && (self.start_hour..self.end_hour).contains(&at.hour())
    }
}

impl std::fmt::Display for PeakWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:02}:00-{:02}:00",
            self.weekday, self.start_hour, self.end_hour
        )
    }
}

/// Buckets completed runs from the trailing `retention` window by
/// (weekday, hour of `started_at`) and averages `queries_analyzed`.
pub fn compute_stats<'a, I>(records: I, now: DateTime<Utc>, retention: Duration) -> Vec<UsageStat>
where
    I: IntoIterator<Item = &'a RefreshRecord>,
{
    let boundary = now - retention;
    let mut buckets: BTreeMap<(u32, u32), (Weekday, u64, usize)> = BTreeMap::new();

    for record in records {
        if !record.outcome.is_completed() || record.started_at < boundary || record.started_at > now {
            continue;
        }
        let weekday = record.started_at.weekday();
        let hour = record.started_at.hour();
        let bucket = buckets
            .entry((weekday.num_days_from_monday(), hour))
            .or_insert((weekday, 0, 0));
        bucket.1 += record.queries_analyzed;
        bucket.2 += 1;
    }

    buckets
        .into_iter()
        .map(|((_, hour), (weekday, total, count))| UsageStat {
            weekday,
            hour,
            average_queries_per_hour: total as f64 / count as f64,
            sample_count: count,
        })
        .collect()
}

/// Flags buckets whose average exceeds `threshold_multiplier` times the
/// global mean, merging adjacent hours into windows.
///
/// Buckets with fewer than `min_samples` samples take no part, neither as
/// candidates nor in the global mean.
pub fn detect_peak_windows(
    stats: &[UsageStat],
    threshold_multiplier: f64,
    min_samples: usize,
) -> Vec<PeakWindow> {
    let eligible: Vec<&UsageStat> = stats
        .iter()
        .filter(|s| s.sample_count >= min_samples)
        .collect();
    if eligible.is_empty() {
        return Vec::new();
    }

    let global_mean = eligible
        .iter()
        .map(|s| s.average_queries_per_hour)
        .sum::<f64>()
        / eligible.len() as f64;
    if global_mean <= 0.0 {
        return Vec::new();
    }

    let cutoff = threshold_multiplier * global_mean;
    let mut peaks: Vec<(u32, Weekday, u32)> = eligible
        .iter()
        .filter(|s| s.average_queries_per_hour > cutoff)
        .map(|s| (s.weekday.num_days_from_monday(), s.weekday, s.hour))
        .collect();
    peaks.sort_by_key(|(day, _, hour)| (*day, *hour));

    let mut windows: Vec<PeakWindow> = Vec::new();
    for (_, weekday, hour) in peaks {
        match windows.last_mut() {
            Some(last) if last.weekday == weekday && last.end_hour == hour => {
                last.end_hour = hour + 1;
            }
            _ => windows.push(PeakWindow {
                weekday,
                start_hour: hour,
                end_hour: hour + 1,
            }),
        }
    }
    windows
}
