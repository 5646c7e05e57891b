use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::PipelineError;
use crate::fs_util;
use crate::orchestrator::CancelFlag;

pub const METADATA_FILE: &str = "metadata.json";

/// One task's most recent attempt, plus the last-success snapshot that
/// survives later failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_end: Option<DateTime<Utc>>,
    /// Seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub custom: Map<String, Value>,
}

impl TaskRecord {
    /// Fold a fresh attempt over what is already recorded at this slot:
    /// the attempt fields always reflect the latest run, the lastSuccess
    /// fields advance only on success.
    pub fn merged_over(mut self, previous: Option<&TaskRecord>) -> TaskRecord {
        if self.success {
            self.last_success_start = self.task_start;
            self.last_success_end = self.task_end;
            self.last_success_duration = self.duration;
        } else if let Some(previous) = previous {
            self.last_success_start = previous.last_success_start;
            self.last_success_end = previous.last_success_end;
            self.last_success_duration = previous.last_success_duration;
        }
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_total_duration: Option<f64>,
}

/// Per-source durable record of stage runs, one JSON document at
/// `<source>/metadata.json`. Whole-file replace on save; a single writer
/// per source is assumed.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: Utf8PathBuf,
    stages: BTreeMap<String, StageRecord>,
}

impl MetadataStore {
    /// Load the store, tolerating a missing or unparseable file by starting
    /// empty.
    pub fn load(source_dir: &Utf8Path) -> Self {
        let path = source_dir.join(METADATA_FILE);
        let stages = match std::fs::read_to_string(path.as_std_path()) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(stages) => stages,
                Err(err) => {
                    warn!(path = %path, error = %err, "metadata unreadable; starting empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self { path, stages }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn stage(&self, stage: &str) -> Option<&StageRecord> {
        self.stages.get(stage)
    }

    /// Record one task attempt at `(stage, index)`, growing the task list as
    /// needed and preserving any earlier last-success snapshot.
    pub fn record_task(&mut self, stage: &str, index: usize, attempt: TaskRecord) {
        let record = self.stages.entry(stage.to_string()).or_default();
        if record.tasks.len() <= index {
            record.tasks.resize(index + 1, TaskRecord::default());
        }
        let merged = attempt.merged_over(Some(&record.tasks[index]));
        record.tasks[index] = merged;
    }

    /// Truncate a stage's task list to the current run's length, so stale
    /// records from a previous, longer task list do not linger.
    pub fn trim_stage(&mut self, stage: &str, task_count: usize) {
        if let Some(record) = self.stages.get_mut(stage) {
            record.tasks.truncate(task_count);
        }
    }

    pub fn set_stage_totals(&mut self, stage: &str, total: f64, all_succeeded: bool) {
        let record = self.stages.entry(stage.to_string()).or_default();
        record.total_duration = Some(total);
        if all_succeeded {
            record.last_success_total_duration = Some(total);
        }
    }

    /// Whether every recorded task of `stage` has a last-success snapshot,
    /// i.e. the stage has fully produced its outputs at least once.
    pub fn stage_succeeded(&self, stage: &str) -> bool {
        self.stages
            .get(stage)
            .map(|record| {
                !record.tasks.is_empty()
                    && record
                        .tasks
                        .iter()
                        .all(|task| task.last_success_end.is_some())
            })
            .unwrap_or(false)
    }

    /// Most recent successful task completion across all stages. Feeds the
    /// update policy.
    pub fn latest_success(&self) -> Option<DateTime<Utc>> {
        self.stages
            .values()
            .flat_map(|record| record.tasks.iter())
            .filter_map(|task| task.last_success_end)
            .max()
    }

    /// Drop one stage's records entirely, as when its outputs are purged.
    pub fn clear_stage(&mut self, stage: &str) {
        self.stages.remove(stage);
    }

    pub fn clear(&mut self) {
        self.stages.clear();
    }

    pub fn save(&self) -> Result<(), PipelineError> {
        let body = serde_json::to_vec_pretty(&self.stages)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        fs_util::write_bytes_atomic(&self.path, &body)
    }
}

/// Drives one stage's task loop against the store: every task gets timed,
/// recorded at its slot, and the stage totals land on finish. A cancelled
/// flag stops further execution at the next task boundary.
#[derive(Debug)]
pub struct StageRunner<'a> {
    store: &'a mut MetadataStore,
    stage: String,
    next_index: usize,
    start: DateTime<Utc>,
    all_succeeded: bool,
    cancel: CancelFlag,
}

impl<'a> StageRunner<'a> {
    pub fn new(store: &'a mut MetadataStore, stage: &str) -> Self {
        Self::with_cancel(store, stage, CancelFlag::new())
    }

    pub fn with_cancel(store: &'a mut MetadataStore, stage: &str, cancel: CancelFlag) -> Self {
        Self {
            store,
            stage: stage.to_string(),
            next_index: 0,
            start: Utc::now(),
            all_succeeded: true,
            cancel,
        }
    }

    /// Run one task and record its attempt. Returns the task's success so
    /// callers can log, but never aborts the loop. Once the cancel flag is
    /// set, remaining tasks are recorded as failed without running.
    pub fn run_task<F>(&mut self, output: Option<String>, task: F) -> bool
    where
        F: FnOnce() -> (bool, Map<String, Value>),
    {
        if self.cancel.is_cancelled() {
            let mut custom = Map::new();
            custom.insert("cancelled".to_string(), true.into());
            let record = TaskTimer::start().finish(false, output, custom);
            self.store.record_task(&self.stage, self.next_index, record);
            self.next_index += 1;
            self.all_succeeded = false;
            return false;
        }
        let timer = TaskTimer::start();
        let (success, custom) = task();
        let record = timer.finish(success, output, custom);
        self.store.record_task(&self.stage, self.next_index, record);
        self.next_index += 1;
        self.all_succeeded &= success;
        success
    }

    /// Close out the stage: trim stale slots, write totals, persist.
    /// Returns whether every task succeeded.
    pub fn finish(self) -> Result<bool, PipelineError> {
        self.store.trim_stage(&self.stage, self.next_index);
        let total = (Utc::now() - self.start).num_milliseconds() as f64 / 1000.0;
        self.store
            .set_stage_totals(&self.stage, total, self.all_succeeded);
        self.store.save()?;
        Ok(self.all_succeeded)
    }

    /// Persist what has been captured so far without closing totals, used
    /// when a stage is interrupted mid-loop.
    pub fn abort(self) -> Result<(), PipelineError> {
        self.store.save()
    }
}

/// Captures wall-clock timings for one task attempt.
#[derive(Debug)]
pub struct TaskTimer {
    start: DateTime<Utc>,
}

impl TaskTimer {
    pub fn start() -> Self {
        Self { start: Utc::now() }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn finish(
        self,
        success: bool,
        output: Option<String>,
        custom: Map<String, Value>,
    ) -> TaskRecord {
        let end = Utc::now();
        let duration = (end - self.start).num_milliseconds() as f64 / 1000.0;
        TaskRecord {
            output,
            success,
            task_start: Some(self.start),
            task_end: Some(end),
            duration: Some(duration),
            last_success_start: None,
            last_success_end: None,
            last_success_duration: None,
            custom,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn attempt(success: bool, start: DateTime<Utc>) -> TaskRecord {
        TaskRecord {
            output: Some("out.csv".to_string()),
            success,
            task_start: Some(start),
            task_end: Some(start + chrono::Duration::seconds(5)),
            duration: Some(5.0),
            ..TaskRecord::default()
        }
    }

    #[test]
    fn success_advances_last_success() {
        let record = attempt(true, utc(2024, 3, 10)).merged_over(None);
        assert_eq!(record.last_success_start, Some(utc(2024, 3, 10)));
        assert_eq!(record.last_success_duration, Some(5.0));
    }

    #[test]
    fn failure_keeps_previous_last_success() {
        let first = attempt(true, utc(2024, 3, 10)).merged_over(None);
        let second = attempt(false, utc(2024, 3, 12)).merged_over(Some(&first));
        assert!(!second.success);
        assert_eq!(second.task_start, Some(utc(2024, 3, 12)));
        assert_eq!(second.last_success_start, Some(utc(2024, 3, 10)));
    }

    #[test]
    fn roundtrips_through_disk() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();

        let mut store = MetadataStore::load(&dir);
        store.record_task("download", 0, attempt(true, utc(2024, 3, 10)));
        store.record_task("download", 1, attempt(false, utc(2024, 3, 10)));
        store.set_stage_totals("download", 10.0, false);
        store.save().unwrap();

        let reloaded = MetadataStore::load(&dir);
        let stage = reloaded.stage("download").unwrap();
        assert_eq!(stage.tasks.len(), 2);
        assert!(stage.tasks[0].success);
        assert!(!stage.tasks[1].success);
        assert_eq!(stage.total_duration, Some(10.0));
        assert_eq!(stage.last_success_total_duration, None);
    }

    #[test]
    fn unreadable_file_loads_empty() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        std::fs::write(dir.join(METADATA_FILE).as_std_path(), b"not json").unwrap();
        let store = MetadataStore::load(&dir);
        assert!(store.stage("download").is_none());
    }

    #[test]
    fn stage_success_requires_every_task() {
        let mut store = MetadataStore::load(Utf8Path::new("/nonexistent"));
        store.record_task("download", 0, attempt(true, utc(2024, 3, 10)));
        store.record_task("download", 1, attempt(false, utc(2024, 3, 10)));
        assert!(!store.stage_succeeded("download"));
        store.record_task("download", 1, attempt(true, utc(2024, 3, 11)));
        assert!(store.stage_succeeded("download"));
        assert_eq!(store.latest_success().unwrap().date_naive(), utc(2024, 3, 11).date_naive());
    }

    #[test]
    fn runner_times_tasks_and_writes_totals() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let mut store = MetadataStore::load(&dir);

        let mut runner = StageRunner::new(&mut store, "download");
        assert!(runner.run_task(Some("a.csv".to_string()), || (true, Map::new())));
        assert!(!runner.run_task(Some("b.csv".to_string()), || (false, Map::new())));
        assert!(!runner.finish().unwrap());

        let reloaded = MetadataStore::load(&dir);
        let stage = reloaded.stage("download").unwrap();
        assert_eq!(stage.tasks.len(), 2);
        assert!(stage.tasks[0].last_success_end.is_some());
        assert!(stage.tasks[1].last_success_end.is_none());
        assert!(stage.total_duration.is_some());
        assert_eq!(stage.last_success_total_duration, None);
    }

    #[test]
    fn trim_drops_stale_records() {
        let mut store = MetadataStore::load(Utf8Path::new("/nonexistent"));
        store.record_task("download", 2, attempt(true, utc(2024, 3, 10)));
        store.trim_stage("download", 1);
        assert_eq!(store.stage("download").unwrap().tasks.len(), 1);
    }
}
