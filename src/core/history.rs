use crate::core::error::{SchedulerError, SchedulerResult};
use crate::core::models::{Completion, Outcome, RefreshRecord, RunId, RunReason, TimeWindow};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

struct HistoryInner {
    records: Arc<Vec<RefreshRecord>>,
    next_id: RunId,
    log_path: Option<PathBuf>,
    /// Set when a log write failed; the next write rewrites the whole file.
    log_dirty: bool,
}

impl HistoryInner {
    fn persist(&mut self, record: &RefreshRecord) -> SchedulerResult<()> {
        let Some(path) = self.log_path.as_deref() else {
            return Ok(());
        };
        if self.log_dirty {
            rewrite_log(path, &self.records)?;
            self.log_dirty = false;
            tracing::info!(?path, "Refresh history log rewritten after earlier write failure");
            Ok(())
        } else {
            append_line(Some(path), record)
        }
    }
}

/// Append-only log of refresh runs, ordered by `started_at`.
///
/// Writers swap in a new `Arc<Vec<_>>` (copy-on-write), so readers holding
/// a [`HistoryCursor`] keep a consistent snapshot while appends and prunes
/// go ahead.
#[derive(Clone)]
pub struct HistoryStore {
    inner: Arc<RwLock<HistoryInner>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::from_parts(Vec::new(), None)
    }

    /// Opens a durable history backed by a JSON-lines log at `path`.
    ///
    /// Every append and completion writes the record's latest state as one
    /// line; replay keeps the last line seen for each id.
    pub fn open(path: &Path) -> SchedulerResult<Self> {
        let mut by_id: BTreeMap<RunId, RefreshRecord> = BTreeMap::new();

        if path.exists() {
            let file = std::fs::File::open(path)?;
            for (lineno, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RefreshRecord>(&line) {
                    Ok(record) => {
                        by_id.insert(record.id, record);
                    }
                    Err(e) => {
                        tracing::warn!(?path, line = lineno + 1, error = %e, "Skipping corrupt history line");
                    }
                }
            }
        } else if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut records: Vec<RefreshRecord> = by_id.into_values().collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        tracing::info!(?path, records = records.len(), "Loaded refresh history");

        Ok(Self::from_parts(records, Some(path.to_path_buf())))
    }

    fn from_parts(records: Vec<RefreshRecord>, log_path: Option<PathBuf>) -> Self {
        let next_id = records.iter().map(|r| r.id).max().map_or(1, |id| id + 1);
        Self {
            inner: Arc::new(RwLock::new(HistoryInner {
                records: Arc::new(records),
                next_id,
                log_path,
                log_dirty: false,
            })),
        }
    }

    /// Adds a pending record and returns its id.
    pub async fn append(
        &self,
        started_at: DateTime<Utc>,
        reason: RunReason,
    ) -> SchedulerResult<RunId> {
        let mut inner = self.inner.write().await;

        if let Some(pending) = inner.records.iter().find(|r| r.is_pending()) {
            return Err(SchedulerError::DuplicateRun(pending.id));
        }

        // Keep the log ordered even if the wall clock stepped backwards.
        let started_at = match inner.records.last() {
            Some(last) if last.started_at > started_at => last.started_at,
            _ => started_at,
        };

        let id = inner.next_id;
        let record = RefreshRecord::pending(id, started_at, reason);
        Arc::make_mut(&mut inner.records).push(record.clone());
        if let Err(e) = inner.persist(&record) {
            Arc::make_mut(&mut inner.records).pop();
            return Err(e);
        }

        inner.next_id += 1;
        tracing::debug!(id, reason = reason.name(), "Appended pending refresh record");
        Ok(id)
    }

    /// Seals a pending record. Completed records are immutable.
    ///
    /// The record is sealed in memory even when the log write fails; the
    /// failure is logged and the log is rewritten on the next write.
    pub async fn complete(
        &self,
        id: RunId,
        completion: Completion,
    ) -> SchedulerResult<RefreshRecord> {
        let mut inner = self.inner.write().await;

        let index = inner
            .records
            .iter()
            .position(|r| r.id == id && r.is_pending())
            .ok_or(SchedulerError::UnknownRecord(id))?;

        let mut sealed = inner.records[index].clone();
        sealed.seal(completion);
        Arc::make_mut(&mut inner.records)[index] = sealed.clone();

        if let Err(e) = inner.persist(&sealed) {
            inner.log_dirty = true;
            tracing::error!(id, error = %e, "Failed to write refresh history, keeping record in memory");
        }
        Ok(sealed)
    }

    /// Lazy, restartable cursor over records whose `started_at` is in `window`.
    pub async fn query(&self, window: TimeWindow) -> HistoryCursor {
        let records = Arc::clone(&self.inner.read().await.records);
        HistoryCursor::new(records, window)
    }

    pub async fn snapshot(&self) -> Arc<Vec<RefreshRecord>> {
        Arc::clone(&self.inner.read().await.records)
    }

    /// Drops records that started before `now - retention`.
    ///
    /// Pending records and `keep` are never removed.
    pub async fn prune(
        &self,
        retention: Duration,
        now: DateTime<Utc>,
        keep: Option<RunId>,
    ) -> SchedulerResult<usize> {
        let boundary = now - retention;
        let mut inner = self.inner.write().await;

        let before = inner.records.len();
        let retained: Vec<RefreshRecord> = inner
            .records
            .iter()
            .filter(|r| r.started_at >= boundary || r.is_pending() || Some(r.id) == keep)
            .cloned()
            .collect();
        let removed = before - retained.len();

        if removed > 0 || inner.log_dirty {
            if let Some(path) = inner.log_path.as_deref() {
                rewrite_log(path, &retained)?;
            }
            inner.log_dirty = false;
            inner.records = Arc::new(retained);
            tracing::debug!(removed, %boundary, "Pruned refresh history");
        }

        Ok(removed)
    }

    /// Marks every pending record as an interrupted failure.
    ///
    /// Used at startup: a record still pending then belongs to a process
    /// that exited mid-run.
    pub async fn recover_interrupted(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<RunId>> {
        let pending: Vec<RefreshRecord> = self
            .inner
            .read()
            .await
            .records
            .iter()
            .filter(|r| r.is_pending())
            .cloned()
            .collect();

        let mut recovered = Vec::with_capacity(pending.len());
        for record in pending {
            let elapsed = (now - record.started_at).num_milliseconds().max(0) as u64;
            self.complete(record.id, Completion::failure(now, elapsed, "interrupted"))
                .await?;
            tracing::warn!(id = record.id, "Marked interrupted refresh as failed");
            recovered.push(record.id);
        }
        Ok(recovered)
    }

    #[cfg(test)]
    pub async fn pending_id(&self) -> Option<RunId> {
        self.inner
            .read()
            .await
            .records
            .iter()
            .find(|r| r.is_pending())
            .map(|r| r.id)
    }

    #[cfg(test)]
    pub async fn last(&self) -> Option<RefreshRecord> {
        self.inner.read().await.records.last().cloned()
    }

    pub async fn last_finished(&self) -> Option<RefreshRecord> {
        self.inner
            .read()
            .await
            .records
            .iter()
            .rev()
            .find(|r| !r.is_pending())
            .cloned()
    }

    /// Mean duration of retained `Success` runs, in milliseconds.
    pub async fn mean_success_duration(&self) -> Option<f64> {
        let inner = self.inner.read().await;
        let durations: Vec<u64> = inner
            .records
            .iter()
            .filter(|r| r.outcome == Outcome::Success)
            .map(|r| r.duration_ms)
            .collect();

        if durations.is_empty() {
            return None;
        }
        Some(durations.iter().sum::<u64>() as f64 / durations.len() as f64)
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn append_line(path: Option<&Path>, record: &RefreshRecord) -> SchedulerResult<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(record)?;
    writeln!(file, "{line}")?;
    Ok(())
}

fn rewrite_log(path: &Path, records: &[RefreshRecord]) -> SchedulerResult<()> {
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        for record in records {
            writeln!(file, "{}", serde_json::to_string(record)?)?;
        }
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Point-in-time view over history, filtered to a time window.
///
/// Cloning or calling [`HistoryCursor::restart`] replays the same records.
#[derive(Debug, Clone)]
pub struct HistoryCursor {
    records: Arc<Vec<RefreshRecord>>,
    window: TimeWindow,
    first: usize,
    pos: usize,
}

impl HistoryCursor {
    fn new(records: Arc<Vec<RefreshRecord>>, window: TimeWindow) -> Self {
        let first = records.partition_point(|r| r.started_at < window.start);
        Self {
            records,
            window,
            first,
            pos: first,
        }
    }

    pub fn restart(&mut self) {
        self.pos = self.first;
    }
}

impl Iterator for HistoryCursor {
    type Item = RefreshRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.get(self.pos)?;
        if !self.window.contains(record.started_at) {
            return None;
        }
        self.pos += 1;
        Some(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::RefreshCounters;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    fn success(at: DateTime<Utc>, duration_ms: u64, queries: u64) -> Completion {
        Completion {
            outcome: Outcome::Success,
            finished_at: at,
            duration_ms,
            counters: RefreshCounters {
                tables_scanned: 4,
                queries_analyzed: queries,
                duration_ms,
            },
            error_detail: None,
        }
    }

    async fn seeded(count: i64) -> HistoryStore {
        let store = HistoryStore::new();
        for i in 0..count {
            let at = base_time() + Duration::hours(i);
            let id = store.append(at, RunReason::Scheduled).await.unwrap();
            store.complete(id, success(at, 1_000, 10)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_append_refuses_second_pending() {
        let store = HistoryStore::new();
        let id = store.append(base_time(), RunReason::Manual).await.unwrap();

        let err = store
            .append(base_time(), RunReason::Scheduled)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateRun(pending) if pending == id));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_complete_twice_is_unknown_record() {
        let store = HistoryStore::new();
        let id = store.append(base_time(), RunReason::Manual).await.unwrap();
        store.complete(id, success(base_time(), 5, 1)).await.unwrap();

        let err = store
            .complete(id, success(base_time(), 5, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownRecord(_)));

        let err = store
            .complete(999, success(base_time(), 5, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownRecord(999)));
    }

    #[tokio::test]
    async fn test_query_is_windowed_ordered_and_restartable() {
        let store = seeded(6).await;
        let window = TimeWindow::new(
            base_time() + Duration::hours(2),
            base_time() + Duration::hours(5),
        );

        let mut cursor = store.query(window).await;
        let ids: Vec<RunId> = cursor.by_ref().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);

        cursor.restart();
        assert_eq!(cursor.count(), 3);
    }

    #[tokio::test]
    async fn test_cursor_keeps_snapshot_across_writes() {
        let store = seeded(3).await;
        let cursor = store.query(TimeWindow::all()).await;

        store
            .prune(Duration::hours(1), base_time() + Duration::hours(10), None)
            .await
            .unwrap();
        assert_eq!(store.len().await, 0);
        assert_eq!(cursor.count(), 3);
    }

    #[tokio::test]
    async fn test_prune_keeps_pending_and_running_records() {
        let store = seeded(3).await;
        let running = store
            .append(base_time() + Duration::hours(3), RunReason::Scheduled)
            .await
            .unwrap();

        let removed = store
            .prune(
                Duration::hours(1),
                base_time() + Duration::days(30),
                Some(running),
            )
            .await
            .unwrap();

        assert_eq!(removed, 3);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.pending_id().await, Some(running));
    }

    #[tokio::test]
    async fn test_append_clamps_backwards_clock() {
        let store = seeded(2).await;
        let id = store
            .append(base_time() - Duration::hours(5), RunReason::Manual)
            .await
            .unwrap();

        let last = store.last().await.unwrap();
        assert_eq!(last.id, id);
        assert_eq!(last.started_at, base_time() + Duration::hours(1));
    }

    #[tokio::test]
    async fn test_mean_success_duration_ignores_other_outcomes() {
        let store = HistoryStore::new();
        assert!(store.mean_success_duration().await.is_none());

        for (i, duration) in [1_000u64, 3_000].into_iter().enumerate() {
            let at = base_time() + Duration::hours(i as i64);
            let id = store.append(at, RunReason::Scheduled).await.unwrap();
            store.complete(id, success(at, duration, 1)).await.unwrap();
        }
        let at = base_time() + Duration::hours(3);
        let id = store.append(at, RunReason::Scheduled).await.unwrap();
        store
            .complete(id, Completion::failure(at, 60_000, "timeout"))
            .await
            .unwrap();

        let mean = store.mean_success_duration().await.unwrap();
        assert!((mean - 2_000.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_durable_log_replays_and_recovers_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        {
            let store = HistoryStore::open(&path).unwrap();
            let id = store.append(base_time(), RunReason::Scheduled).await.unwrap();
            store.complete(id, success(base_time(), 800, 25)).await.unwrap();
            store
                .append(base_time() + Duration::hours(1), RunReason::Manual)
                .await
                .unwrap();
        }

        let store = HistoryStore::open(&path).unwrap();
        assert_eq!(store.len().await, 2);
        assert_eq!(store.pending_id().await, Some(2));

        let recovered = store
            .recover_interrupted(base_time() + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(recovered, vec![2]);

        let reopened = HistoryStore::open(&path).unwrap();
        let last = reopened.last().await.unwrap();
        assert_eq!(last.outcome, Outcome::Failure);
        assert_eq!(last.error_detail.as_deref(), Some("interrupted"));
        assert!(reopened.pending_id().await.is_none());

        let next = reopened
            .append(base_time() + Duration::hours(3), RunReason::Scheduled)
            .await
            .unwrap();
        assert_eq!(next, 3);
    }

    #[tokio::test]
    async fn test_complete_survives_log_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        let store = HistoryStore::open(&path).unwrap();
        let id = store.append(base_time(), RunReason::Scheduled).await.unwrap();

        // Make the log unwritable mid-run.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let sealed = store.complete(id, success(base_time(), 400, 7)).await.unwrap();
        assert_eq!(sealed.outcome, Outcome::Success);
        assert!(store.pending_id().await.is_none());

        let err = store
            .append(base_time() + Duration::hours(1), RunReason::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Persistence(_)));
        assert_eq!(store.len().await, 1);

        std::fs::remove_dir(&path).unwrap();
        let next = store
            .append(base_time() + Duration::hours(1), RunReason::Manual)
            .await
            .unwrap();
        assert_eq!(next, id + 1);

        let reopened = HistoryStore::open(&path).unwrap();
        let records: Vec<RefreshRecord> = reopened.query(TimeWindow::all()).await.collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, Outcome::Success);
        assert_eq!(records[0].queries_analyzed, 7);
        assert!(records[1].is_pending());
    }

    #[tokio::test]
    async fn test_prune_compacts_durable_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        let store = HistoryStore::open(&path).unwrap();
        for i in 0..4 {
            let at = base_time() + Duration::days(i);
            let id = store.append(at, RunReason::Scheduled).await.unwrap();
            store.complete(id, success(at, 100, 1)).await.unwrap();
        }

        store
            .prune(Duration::days(2), base_time() + Duration::days(4), None)
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert_eq!(HistoryStore::open(&path).unwrap().len().await, 2);
    }
}
