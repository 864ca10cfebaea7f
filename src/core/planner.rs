use crate::core::analyzer::PeakWindow;
use crate::core::retry::RetryPolicy;
use crate::core::settings::ScheduleSettings;
use chrono::{DateTime, Duration, Utc};

/// Peak interval while `now` sits inside a peak window, base interval otherwise.
pub fn effective_interval(
    now: DateTime<Utc>,
    settings: &ScheduleSettings,
    peaks: &[PeakWindow],
) -> Duration {
    if peaks.iter().any(|window| window.contains(now)) {
        settings.peak_interval()
    } else {
        settings.base_interval()
    }
}

/// When the next scheduled refresh is due. Never earlier than `now`.
///
/// A missing `last_run_at` (cold start) and an overdue run both yield `now`.
pub fn next_run_at(
    now: DateTime<Utc>,
    settings: &ScheduleSettings,
    peaks: &[PeakWindow],
    last_run_at: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let Some(last_run_at) = last_run_at else {
        return now;
    };

    let next = last_run_at + effective_interval(now, settings, peaks);
    if next <= now {
        now
    } else {
        next
    }
}

/// Retry time after a failure: `now + min(base_interval, backoff)`.
pub fn retry_at(
    now: DateTime<Utc>,
    settings: &ScheduleSettings,
    policy: &RetryPolicy,
    consecutive_failures: u32,
) -> DateTime<Utc> {
    now + policy
        .backoff(consecutive_failures)
        .min(settings.base_interval())
}
