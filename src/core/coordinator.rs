//! The scheduler core.
//!
//! One [`RefreshCoordinator`] owns one monitored source. All state
//! transitions, and every history write, happen under a single lock:
//!
//! ```text
//! Idle -> Scheduled -> Running -> Scheduled        (success / warning)
//!                              -> Backoff -> Running (retry due)
//!                              -> Disabled          (failure ceiling)
//! ```
//!
//! Each run is tagged with a generation number. A result carrying an older
//! generation than the current one belongs to an abandoned attempt and is
//! dropped.

use crate::core::analyzer::{self, PeakWindow};
use crate::core::error::{SchedulerError, SchedulerResult, SourceError};
use crate::core::history::{HistoryCursor, HistoryStore};
use crate::core::models::{
    Completion, Outcome, Priority, RefreshCounters, RefreshRecord, RunId, RunReason,
    ScheduleState, SchedulerState, Status, TimeWindow,
};
use crate::core::notifications::Notifier;
use crate::core::planner;
use crate::core::retry::RetryPolicy;
use crate::core::settings::{PolicySettings, ScheduleSettings, SettingsPatch};
use crate::core::settings_store::SettingsStore;
use crate::sources::DataSource;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;

/// Longest the loop sleeps before re-checking the wall clock.
const MAX_LOOP_SLEEP: Duration = Duration::from_secs(60);

#[derive(Default)]
struct CoreState {
    phase: SchedulerState,
    schedule: ScheduleState,
    generation: u64,
    last_run_at: Option<DateTime<Utc>>,
    peaks: Vec<PeakWindow>,
}

struct Inner {
    source_name: String,
    state: Mutex<CoreState>,
    history: HistoryStore,
    settings: SettingsStore,
    source: Arc<dyn DataSource>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    peak_threshold: f64,
    min_samples: usize,
    warning_factor: f64,
    wake: Notify,
    phase_tx: watch::Sender<SchedulerState>,
}

/// A run that has been started but not yet completed.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub generation: u64,
    pub run_id: RunId,
    deadline: Duration,
    priority: Priority,
    started: Instant,
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        history: HistoryStore,
        settings: SettingsStore,
        source: Arc<dyn DataSource>,
        notifier: Arc<dyn Notifier>,
        policy: &PolicySettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source_name: source.name().to_string(),
                state: Mutex::new(CoreState::default()),
                history,
                settings,
                source,
                notifier,
                retry: RetryPolicy::new(policy.max_backoff(), policy.max_consecutive_failures),
                peak_threshold: policy.peak_threshold,
                min_samples: policy.min_samples,
                warning_factor: policy.warning_factor,
                wake: Notify::new(),
                phase_tx: watch::Sender::new(SchedulerState::Idle),
            }),
        }
    }

    /// Every state transition, newest value only.
    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.inner.phase_tx.subscribe()
    }

    fn enter(&self, state: &mut CoreState, phase: SchedulerState) {
        state.phase = phase;
        self.inner.phase_tx.send_replace(phase);
    }

    /// Idle -> Scheduled. Pending records left by a previous process are
    /// marked interrupted before the first run is planned.
    pub async fn start(&self) -> SchedulerResult<()> {
        let mut state = self.inner.state.lock().await;
        if state.phase != SchedulerState::Idle {
            return Ok(());
        }

        let now = Utc::now();
        let recovered = self.inner.history.recover_interrupted(now).await?;
        let settings = self.inner.settings.get().await;

        state.last_run_at = self
            .inner
            .history
            .last_finished()
            .await
            .map(|r| r.started_at);
        state.peaks = self.compute_peaks(now, &settings).await;

        let next = planner::next_run_at(now, &settings, &state.peaks, state.last_run_at);
        state.schedule.next_run_at = Some(next);
        self.enter(&mut state, SchedulerState::Scheduled);

        tracing::info!(
            source = %self.inner.source_name,
            next_run_at = %next,
            interrupted = recovered.len(),
            peak_windows = state.peaks.len(),
            "Scheduler started"
        );
        drop(state);

        self.inner.wake.notify_one();
        Ok(())
    }

    /// Runs the scheduler loop until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(source = %self.inner.source_name, "Scheduler loop started");

        loop {
            let due_in = self.due_in(Utc::now()).await;
            let sleep_for = due_in.map_or(MAX_LOOP_SLEEP, |d| d.min(MAX_LOOP_SLEEP));

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {
                    self.fire_if_due().await;
                }
                _ = self.inner.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(source = %self.inner.source_name, "Scheduler loop stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn due_in(&self, now: DateTime<Utc>) -> Option<Duration> {
        let state = self.inner.state.lock().await;
        if !state.phase.is_waiting() {
            return None;
        }
        state
            .schedule
            .next_run_at
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }

    async fn fire_if_due(&self) {
        let attempt = {
            let mut state = self.inner.state.lock().await;
            let due = state.phase.is_waiting()
                && state.schedule.next_run_at.is_some_and(|at| at <= Utc::now());
            if !due {
                return;
            }
            self.begin_locked(&mut state, RunReason::Scheduled).await
        };

        match attempt {
            Ok(attempt) => self.spawn_execute(attempt),
            Err(SchedulerError::AlreadyRunning) => {
                tracing::debug!("Scheduled refresh skipped, a run is in flight");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start scheduled refresh");
            }
        }
    }

    /// Starts a manual run in the background and returns its record id.
    pub async fn trigger_manual_refresh(&self) -> SchedulerResult<RunId> {
        let attempt = self.begin(RunReason::Manual).await?;
        let run_id = attempt.run_id;
        self.spawn_execute(attempt);
        Ok(run_id)
    }

    /// Starts a run and waits for it to finish.
    pub async fn trigger_refresh(&self, reason: RunReason) -> SchedulerResult<RefreshRecord> {
        let attempt = self.begin(reason).await?;
        self.execute(attempt).await
    }

    /// Creates the pending record and moves to Running.
    pub async fn begin(&self, reason: RunReason) -> SchedulerResult<Attempt> {
        let mut state = self.inner.state.lock().await;
        self.begin_locked(&mut state, reason).await
    }

    async fn begin_locked(
        &self,
        state: &mut CoreState,
        reason: RunReason,
    ) -> SchedulerResult<Attempt> {
        match state.phase {
            SchedulerState::Running => return Err(SchedulerError::AlreadyRunning),
            SchedulerState::Disabled => {
                return Err(SchedulerError::Disabled(state.schedule.consecutive_failures))
            }
            SchedulerState::Idle | SchedulerState::Scheduled | SchedulerState::Backoff => {}
        }

        // The in-flight run keeps this snapshot even if settings change.
        let settings = self.inner.settings.get().await;
        let run_id = self.inner.history.append(Utc::now(), reason).await?;

        state.generation += 1;
        self.enter(state, SchedulerState::Running);
        state.schedule.running_record_id = Some(run_id);
        state.schedule.next_run_at = None;

        tracing::info!(
            source = %self.inner.source_name,
            run_id,
            reason = reason.name(),
            generation = state.generation,
            "Refresh started"
        );

        Ok(Attempt {
            generation: state.generation,
            run_id,
            deadline: settings.max_run_duration(),
            priority: settings.priority,
            started: Instant::now(),
        })
    }

    fn spawn_execute(&self, attempt: Attempt) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let run_id = attempt.run_id;
            match coordinator.execute(attempt).await {
                Ok(_) => {}
                Err(SchedulerError::StaleAttempt { .. }) => {}
                Err(e) => tracing::error!(run_id, error = %e, "Failed to record refresh outcome"),
            }
        });
    }

    /// Calls the source under the attempt's deadline and records the result.
    ///
    /// The call runs in its own task; on expiry it is aborted best-effort
    /// and the run fails with `timeout` without waiting for it.
    pub async fn execute(&self, attempt: Attempt) -> SchedulerResult<RefreshRecord> {
        let source = Arc::clone(&self.inner.source);
        let priority = attempt.priority;
        let mut call = tokio::spawn(async move { source.refresh(priority).await });

        let result = match tokio::time::timeout(attempt.deadline, &mut call).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(SourceError::Query(format!(
                "refresh task failed: {join_error}"
            ))),
            Err(_) => {
                call.abort();
                tracing::warn!(
                    run_id = attempt.run_id,
                    deadline_secs = attempt.deadline.as_secs(),
                    "Refresh exceeded its deadline"
                );
                Err(SourceError::Timeout)
            }
        };

        self.complete_attempt(attempt.generation, result, attempt.started.elapsed())
            .await
    }

    /// Records the result of attempt `generation` and plans the next run.
    ///
    /// Fails with `StaleAttempt` when that attempt was already settled.
    pub async fn complete_attempt(
        &self,
        generation: u64,
        result: Result<RefreshCounters, SourceError>,
        elapsed: Duration,
    ) -> SchedulerResult<RefreshRecord> {
        let mut state = self.inner.state.lock().await;

        let stale = SchedulerError::StaleAttempt {
            attempt: generation,
            current: state.generation,
        };
        if state.generation != generation || state.phase != SchedulerState::Running {
            tracing::warn!(generation, current = state.generation, "Discarding stale refresh result");
            return Err(stale);
        }
        let run_id = state.schedule.running_record_id.ok_or(stale)?;

        let now = Utc::now();
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let completion = match result {
            Ok(counters) => self.success_completion(now, duration_ms, counters).await,
            Err(e) => Completion::failure(now, duration_ms, e.to_string()),
        };

        let settings = self.inner.settings.get().await;
        let record = match self.inner.history.complete(run_id, completion).await {
            Ok(record) => record,
            Err(e) => {
                // Leave Running regardless; the record can no longer be sealed.
                state.schedule.running_record_id = None;
                let next = planner::next_run_at(now, &settings, &state.peaks, state.last_run_at);
                state.schedule.next_run_at = Some(next);
                self.enter(&mut state, SchedulerState::Scheduled);
                drop(state);

                tracing::error!(run_id, error = %e, "Failed to record refresh outcome");
                self.inner.wake.notify_one();
                return Err(e);
            }
        };

        state.schedule.running_record_id = None;
        state.last_run_at = Some(record.started_at);
        state.peaks = self.compute_peaks(now, &settings).await;

        let mut disabled = false;
        if record.outcome == Outcome::Failure {
            state.schedule.consecutive_failures += 1;
            let failures = state.schedule.consecutive_failures;

            if self.inner.retry.is_exhausted(failures) {
                disabled = true;
                self.enter(&mut state, SchedulerState::Disabled);
                state.schedule.next_run_at = None;
                tracing::error!(
                    source = %self.inner.source_name,
                    run_id,
                    consecutive_failures = failures,
                    "Failure ceiling reached, scheduler disabled"
                );
            } else {
                let next = if settings.auto_retry {
                    planner::retry_at(now, &settings, &self.inner.retry, failures)
                } else {
                    planner::next_run_at(now, &settings, &state.peaks, state.last_run_at)
                };
                self.enter(&mut state, SchedulerState::Backoff);
                state.schedule.next_run_at = Some(next);
                tracing::warn!(
                    source = %self.inner.source_name,
                    run_id,
                    error = record.error_detail.as_deref().unwrap_or(""),
                    consecutive_failures = failures,
                    next_run_at = %next,
                    "Refresh failed, backing off"
                );
            }
        } else {
            if state.schedule.consecutive_failures > 0 {
                tracing::info!(
                    source = %self.inner.source_name,
                    failures = state.schedule.consecutive_failures,
                    "Source recovered from error state"
                );
            }
            state.schedule.consecutive_failures = 0;
            let next = planner::next_run_at(now, &settings, &state.peaks, state.last_run_at);
            self.enter(&mut state, SchedulerState::Scheduled);
            state.schedule.next_run_at = Some(next);
            tracing::info!(
                source = %self.inner.source_name,
                run_id,
                outcome = record.outcome.name(),
                duration_ms = record.duration_ms,
                queries = record.queries_analyzed,
                next_run_at = %next,
                "Refresh finished"
            );
        }

        if let Err(e) = self
            .inner
            .history
            .prune(settings.retention_window(), now, state.schedule.running_record_id)
            .await
        {
            tracing::warn!(error = %e, "Failed to prune refresh history");
        }

        let failures = state.schedule.consecutive_failures;
        drop(state);

        if record.outcome == Outcome::Failure && settings.notify_on_failure {
            self.inner
                .notifier
                .refresh_failed(&self.inner.source_name, &record, failures, disabled);
        }
        self.inner.wake.notify_one();
        Ok(record)
    }

    async fn success_completion(
        &self,
        now: DateTime<Utc>,
        duration_ms: u64,
        counters: RefreshCounters,
    ) -> Completion {
        let mean = self.inner.history.mean_success_duration().await;
        let slow = mean.filter(|m| duration_ms as f64 > self.inner.warning_factor * m);

        let (outcome, error_detail) = match slow {
            Some(mean) => (
                Outcome::Warning,
                Some(format!(
                    "slow run: {duration_ms}ms against a trailing mean of {mean:.0}ms"
                )),
            ),
            None => (Outcome::Success, None),
        };

        Completion {
            outcome,
            finished_at: now,
            duration_ms,
            counters,
            error_detail,
        }
    }

    async fn compute_peaks(&self, now: DateTime<Utc>, settings: &ScheduleSettings) -> Vec<PeakWindow> {
        let records = self.inner.history.snapshot().await;
        let stats = analyzer::compute_stats(records.iter(), now, settings.retention_window());
        analyzer::detect_peak_windows(&stats, self.inner.peak_threshold, self.inner.min_samples)
    }

    /// Validates and applies `patch`. A run in flight is left alone; a
    /// pending next run is re-planned under the new settings.
    pub async fn update_settings(
        &self,
        patch: &SettingsPatch,
    ) -> SchedulerResult<Arc<ScheduleSettings>> {
        let mut state = self.inner.state.lock().await;
        let settings = self.inner.settings.update(patch).await?;
        self.replan_locked(&mut state, &settings).await;
        drop(state);

        self.inner.wake.notify_one();
        Ok(settings)
    }

    /// Like [`Self::update_settings`], replacing every field.
    pub async fn replace_settings(
        &self,
        settings: ScheduleSettings,
    ) -> SchedulerResult<Arc<ScheduleSettings>> {
        let mut state = self.inner.state.lock().await;
        let settings = self.inner.settings.set(settings).await?;
        self.replan_locked(&mut state, &settings).await;
        drop(state);

        self.inner.wake.notify_one();
        Ok(settings)
    }

    async fn replan_locked(&self, state: &mut CoreState, settings: &ScheduleSettings) {
        let now = Utc::now();
        state.peaks = self.compute_peaks(now, settings).await;

        let replan = match state.phase {
            SchedulerState::Scheduled => true,
            SchedulerState::Backoff => !settings.auto_retry,
            _ => false,
        };
        if replan {
            let next = planner::next_run_at(now, settings, &state.peaks, state.last_run_at);
            state.schedule.next_run_at = Some(next);
        }

        tracing::info!(
            state = state.phase.name(),
            replanned = replan,
            next_run_at = ?state.schedule.next_run_at,
            "Schedule settings updated"
        );
    }

    /// Disabled -> Scheduled, due immediately.
    ///
    /// The failure count stays until the next successful run clears it.
    pub async fn reenable(&self) -> SchedulerResult<()> {
        let mut state = self.inner.state.lock().await;
        if state.phase != SchedulerState::Disabled {
            return Err(SchedulerError::NotDisabled);
        }

        self.enter(&mut state, SchedulerState::Scheduled);
        state.schedule.next_run_at = Some(Utc::now());
        tracing::info!(
            source = %self.inner.source_name,
            consecutive_failures = state.schedule.consecutive_failures,
            "Scheduler re-enabled"
        );
        drop(state);

        self.inner.wake.notify_one();
        Ok(())
    }

    /// Abandons the in-flight run, if any, as an interrupted failure.
    pub async fn shutdown(&self) -> SchedulerResult<Option<RunId>> {
        let mut state = self.inner.state.lock().await;
        let Some(run_id) = state.schedule.running_record_id.take() else {
            self.enter(&mut state, SchedulerState::Idle);
            return Ok(None);
        };

        // Fence the abandoned attempt before sealing its record.
        state.generation += 1;
        self.enter(&mut state, SchedulerState::Idle);
        state.schedule.next_run_at = None;

        let now = Utc::now();
        let record = self
            .inner
            .history
            .query(TimeWindow::all())
            .await
            .find(|r| r.id == run_id);
        let elapsed = record.map_or(0, |r| (now - r.started_at).num_milliseconds().max(0) as u64);
        self.inner
            .history
            .complete(run_id, Completion::failure(now, elapsed, "interrupted"))
            .await?;

        tracing::warn!(run_id, "Abandoned in-flight refresh on shutdown");
        Ok(Some(run_id))
    }

    pub async fn status(&self) -> Status {
        let state = self.inner.state.lock().await;
        Status {
            source: self.inner.source_name.clone(),
            state: state.phase,
            next_run_at: state.schedule.next_run_at,
            last_record: self.inner.history.last_finished().await,
            consecutive_failures: state.schedule.consecutive_failures,
            running_record_id: state.schedule.running_record_id,
            peak_windows: state.peaks.clone(),
        }
    }

    pub async fn history(&self, window: TimeWindow) -> HistoryCursor {
        self.inner.history.query(window).await
    }

    pub async fn settings(&self) -> Arc<ScheduleSettings> {
        self.inner.settings.get().await
    }
}
