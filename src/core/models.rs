use crate::core::analyzer::PeakWindow;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub type RunId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Success,
    Warning,
    Failure,
}

impl Outcome {
    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Success => "success",
            Outcome::Warning => "warning",
            Outcome::Failure => "failure",
        }
    }

    /// True for runs whose counters came back from the source.
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::Warning)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunReason {
    Scheduled,
    Manual,
}

impl RunReason {
    pub fn name(&self) -> &'static str {
        match self {
            RunReason::Scheduled => "scheduled",
            RunReason::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshCounters {
    pub tables_scanned: u64,
    pub queries_analyzed: u64,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshRecord {
    pub id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub tables_scanned: u64,
    pub queries_analyzed: u64,
    pub error_detail: Option<String>,
    pub reason: RunReason,
}

impl RefreshRecord {
    pub fn pending(id: RunId, started_at: DateTime<Utc>, reason: RunReason) -> Self {
        Self {
            id,
            started_at,
            finished_at: None,
            outcome: Outcome::Pending,
            duration_ms: 0,
            tables_scanned: 0,
            queries_analyzed: 0,
            error_detail: None,
            reason,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.outcome == Outcome::Pending
    }

    pub fn seal(&mut self, completion: Completion) {
        self.finished_at = Some(completion.finished_at);
        self.outcome = completion.outcome;
        self.duration_ms = completion.duration_ms;
        self.tables_scanned = completion.counters.tables_scanned;
        self.queries_analyzed = completion.counters.queries_analyzed;
        self.error_detail = completion.error_detail;
    }
}

/// Everything needed to seal a pending record.
#[derive(Debug, Clone)]
pub struct Completion {
    pub outcome: Outcome,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub counters: RefreshCounters,
    pub error_detail: Option<String>,
}

impl Completion {
    pub fn failure(finished_at: DateTime<Utc>, duration_ms: u64, detail: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failure,
            finished_at,
            duration_ms,
            counters: RefreshCounters::default(),
            error_detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    #[default]
    Idle,
    Scheduled,
    Running,
    Backoff,
    Disabled,
}

impl SchedulerState {
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Scheduled => "scheduled",
            SchedulerState::Running => "running",
            SchedulerState::Backoff => "backoff",
            SchedulerState::Disabled => "disabled",
        }
    }

    /// States in which the loop is waiting for `next_run_at`.
    pub fn is_waiting(&self) -> bool {
        matches!(self, SchedulerState::Scheduled | SchedulerState::Backoff)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub next_run_at: Option<DateTime<Utc>>,
    pub running_record_id: Option<RunId>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub source: String,
    pub state: SchedulerState,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_record: Option<RefreshRecord>,
    pub consecutive_failures: u32,
    pub running_record_id: Option<RunId>,
    #[serde(default)]
    pub peak_windows: Vec<PeakWindow>,
}

/// Half-open `[start, end)` time range over `started_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// `[now - length, now]`, saturating at the representable range.
    pub fn trailing(now: DateTime<Utc>, length: Duration) -> Self {
        let start = now
            .checked_sub_signed(length)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end = now
            .checked_add_signed(Duration::milliseconds(1))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::new(start, end)
    }

    pub fn all() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_seal_pending_record() {
        let started = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let mut record = RefreshRecord::pending(7, started, RunReason::Manual);
        assert!(record.is_pending());

        record.seal(Completion {
            outcome: Outcome::Success,
            finished_at: started + Duration::seconds(42),
            duration_ms: 42_000,
            counters: RefreshCounters {
                tables_scanned: 12,
                queries_analyzed: 340,
                duration_ms: 41_500,
            },
            error_detail: None,
        });

        assert!(!record.is_pending());
        assert_eq!(record.outcome, Outcome::Success);
        assert_eq!(record.tables_scanned, 12);
        assert_eq!(record.queries_analyzed, 340);
        assert_eq!(record.duration_ms, 42_000);
    }

    #[test]
    fn test_time_window_is_half_open() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let end = start + Duration::hours(1);
        let window = TimeWindow::new(start, end);

        assert!(window.contains(start));
        assert!(window.contains(end - Duration::seconds(1)));
        assert!(!window.contains(end));
    }

    #[test]
    fn test_trailing_window_saturates() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();

        let day = TimeWindow::trailing(now, Duration::hours(24));
        assert!(day.contains(now));
        assert!(day.contains(now - Duration::hours(24)));
        assert!(!day.contains(now - Duration::hours(25)));

        let huge = TimeWindow::trailing(now, Duration::hours(i64::from(u32::MAX)));
        assert_eq!(huge.start, DateTime::<Utc>::MIN_UTC);
        assert!(huge.contains(now));

        let edge = TimeWindow::trailing(DateTime::<Utc>::MAX_UTC, Duration::hours(1));
        assert_eq!(edge.end, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_state_names_match_serialization() {
        for state in [
            SchedulerState::Idle,
            SchedulerState::Scheduled,
            SchedulerState::Running,
            SchedulerState::Backoff,
            SchedulerState::Disabled,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.name()));
        }
    }

    #[test]
    fn test_failure_completion_has_no_counters() {
        let now = Utc::now();
        let completion = Completion::failure(now, 10, "timeout");
        assert_eq!(completion.outcome, Outcome::Failure);
        assert_eq!(completion.counters, RefreshCounters::default());
        assert_eq!(completion.error_detail.as_deref(), Some("timeout"));
    }
}
