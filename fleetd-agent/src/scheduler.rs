//! Local cron scheduler: one loop per registered task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use croner::errors::CronError;
use croner::Cron;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiError, TaskApi};
use crate::executor::Executor;
use crate::task_manager::TaskManager;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("task {0} is already scheduled")]
    Duplicate(String),
    #[error("task {0} is not scheduled")]
    NotScheduled(String),
    #[error("task {0} has no cron expression or script path")]
    Incomplete(String),
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Accepts five-field and six-field (leading seconds) expressions.
pub fn parse_cron(expression: &str) -> Result<Cron, SchedulerError> {
    Cron::new(expression.trim())
        .with_seconds_optional()
        .parse()
        .map_err(|err| SchedulerError::InvalidCron {
            expression: expression.to_string(),
            reason: err.to_string(),
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub cron_expression: String,
    pub script_path: String,
}

struct Entry {
    task: ScheduledTask,
    cancel: CancellationToken,
}

pub struct Scheduler {
    executor: Arc<Executor>,
    api: Arc<dyn TaskApi>,
    manager: Arc<TaskManager>,
    entries: Mutex<HashMap<String, Entry>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(executor: Arc<Executor>, api: Arc<dyn TaskApi>, manager: Arc<TaskManager>) -> Self {
        Self {
            executor,
            api,
            manager,
            entries: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stages task files, then registers every active task that has both a
    /// cron expression and a script path. Returns the number registered.
    pub async fn start(&self) -> Result<usize, SchedulerError> {
        self.stage_files().await;

        let task_ids = self.manager.active_ids();
        if task_ids.is_empty() {
            info!("No active tasks to schedule");
            return Ok(0);
        }
        let details = self.api.query_tasks(&task_ids).await?;

        let mut registered = 0;
        for task_id in &task_ids {
            let Some(task) = details.get(task_id) else {
                warn!(task_id = %task_id, "Server returned no details, not scheduled");
                continue;
            };
            let (Some(cron), Some(script)) = (&task.crond_expression, &task.script_path) else {
                warn!(task_id = %task_id, "Missing cron expression or script path, not scheduled");
                continue;
            };
            match self.add_task(task_id, cron, script) {
                Ok(()) => registered += 1,
                Err(SchedulerError::Duplicate(_)) => {
                    debug!(task_id = %task_id, "Already scheduled")
                }
                Err(err) => warn!(task_id = %task_id, "Not scheduled: {}", err),
            }
        }
        info!("Scheduler started with {} new task(s)", registered);
        Ok(registered)
    }

    async fn stage_files(&self) {
        let files = match self.api.task_files().await {
            Ok(files) => files,
            Err(err) => {
                warn!("Failed to list task files: {}", err);
                return;
            }
        };
        if files.is_empty() {
            return;
        }
        let work_dir = &self.executor.config().work_dir;
        match self.executor.transport().download(&files, work_dir).await {
            Ok(paths) => info!("Staged {} of {} task file(s)", paths.len(), files.len()),
            Err(err) => warn!("Failed to stage task files: {}", err),
        }
    }

    /// Registers a cron loop for `task_id`; ids are unique.
    pub fn add_task(&self, task_id: &str, cron_expression: &str, script_path: &str) -> Result<(), SchedulerError> {
        if cron_expression.trim().is_empty() || script_path.trim().is_empty() {
            return Err(SchedulerError::Incomplete(task_id.to_string()));
        }
        let mut entries = self.entries();
        if entries.contains_key(task_id) {
            return Err(SchedulerError::Duplicate(task_id.to_string()));
        }
        let cron = parse_cron(cron_expression)?;
        let cancel = self.shutdown.child_token();

        tokio::spawn(run_entry(
            self.executor.clone(),
            task_id.to_string(),
            script_path.to_string(),
            cron,
            cancel.clone(),
        ));
        entries.insert(
            task_id.to_string(),
            Entry {
                task: ScheduledTask {
                    cron_expression: cron_expression.to_string(),
                    script_path: script_path.to_string(),
                },
                cancel,
            },
        );
        info!(task_id = %task_id, "Scheduled '{}' -> {}", cron_expression, script_path);
        Ok(())
    }

    /// Cancels the task's loop and any run in flight.
    pub fn stop_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        let entry = self
            .entries()
            .remove(task_id)
            .ok_or_else(|| SchedulerError::NotScheduled(task_id.to_string()))?;
        entry.cancel.cancel();
        info!(task_id = %task_id, "Unscheduled");
        Ok(())
    }

    pub fn is_scheduled(&self, task_id: &str) -> bool {
        self.entries().contains_key(task_id)
    }

    pub fn entry(&self, task_id: &str) -> Option<ScheduledTask> {
        self.entries().get(task_id).map(|entry| entry.task.clone())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.entries().clear();
    }
}

/// Next whole-second firing strictly after `fired`. A wall clock that has
/// already passed `fired` moves the start forward, so missed firings are not
/// replayed.
pub fn next_after(cron: &Cron, fired: DateTime<Utc>, now: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    let start = fired.max(now);
    let start = start.with_nanosecond(0).unwrap_or(start);
    cron.find_next_occurrence(&start, false)
}

async fn run_entry(
    executor: Arc<Executor>,
    task_id: String,
    script_path: String,
    cron: Cron,
    cancel: CancellationToken,
) {
    let now = Utc::now();
    let mut next = match next_after(&cron, now, now) {
        Ok(next) => next,
        Err(err) => {
            warn!(task_id = %task_id, "No next occurrence: {}", err);
            return;
        }
    };
    loop {
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let executor = executor.clone();
        let id = task_id.clone();
        let script = script_path.clone();
        let run_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = executor.run(&id, &script, &run_cancel).await {
                warn!(task_id = %id, "Run could not start: {}", err);
            }
        });

        next = match next_after(&cron, next, Utc::now()) {
            Ok(following) => following,
            Err(err) => {
                warn!(task_id = %task_id, "No next occurrence: {}", err);
                return;
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::testing::{RecordingApi, RecordingTransport};
    use std::path::Path;

    fn scheduler(
        dir: &Path,
        api: RecordingApi,
    ) -> (Scheduler, Arc<TaskManager>, Arc<RecordingApi>, Arc<RecordingTransport>) {
        let api = Arc::new(api);
        let manager = Arc::new(TaskManager::new());
        let transport = Arc::new(RecordingTransport::default());
        let executor = Arc::new(Executor::new(
            ExecutorConfig {
                identity: "10.0.0.4".into(),
                work_dir: dir.to_path_buf(),
                log_dir: dir.join("logs"),
                timeout: Duration::from_secs(10),
            },
            api.clone(),
            manager.clone(),
            transport.clone(),
        ));
        (
            Scheduler::new(executor, api.clone(), manager.clone()),
            manager,
            api,
            transport,
        )
    }

    #[test]
    fn cron_accepts_five_and_six_fields() {
        assert!(parse_cron("*/5 * * * * *").is_ok());
        assert!(parse_cron("0 3 * * *").is_ok());
        assert!(matches!(
            parse_cron("every tuesday"),
            Err(SchedulerError::InvalidCron { .. })
        ));
    }

    #[tokio::test]
    async fn directed_add_then_start_registers_once() {
        let dir = tempfile::tempdir().unwrap();
        let api = RecordingApi::default().with_task("T1", "*/5 * * * * *", "/opt/x.sh");
        let (scheduler, manager, _, _) = scheduler(dir.path(), api);

        assert!(manager.add_task("T1", "/opt/x.sh"));
        scheduler.add_task("T1", "*/5 * * * * *", "/opt/x.sh").unwrap();

        assert_eq!(scheduler.start().await.unwrap(), 0);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.entry("T1").unwrap().script_path, "/opt/x.sh");
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn start_skips_incomplete_tasks_and_stages_files() {
        let dir = tempfile::tempdir().unwrap();
        let api = RecordingApi::default()
            .with_task("0001", "0 0 * * * *", "/opt/a.sh")
            .with_task("0002", "", "/opt/b.sh")
            .with_task("0003", "0 0 * * * *", "");
        api.files.lock().unwrap().push("17".into());
        let (scheduler, manager, api, transport) = scheduler(dir.path(), api);
        manager.load_from(api.as_ref()).await.unwrap();

        assert_eq!(scheduler.start().await.unwrap(), 1);
        assert!(scheduler.is_scheduled("0001"));
        assert!(!scheduler.is_scheduled("0002"));
        assert!(!scheduler.is_scheduled("0003"));
        assert_eq!(transport.downloads(), vec!["17"]);
        scheduler.shutdown();
        assert!(scheduler.is_empty());
    }

    #[test]
    fn next_firing_never_repeats_the_fired_instant() {
        use chrono::TimeZone;
        let cron = parse_cron("* * * * * *").unwrap();
        let fired = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 10).unwrap();

        let lagging_clock = fired - chrono::Duration::milliseconds(5);
        assert_eq!(
            next_after(&cron, fired, lagging_clock).unwrap(),
            fired + chrono::Duration::seconds(1)
        );

        let late_clock = fired + chrono::Duration::milliseconds(4_500);
        assert_eq!(
            next_after(&cron, fired, late_clock).unwrap(),
            fired + chrono::Duration::seconds(5)
        );
    }

    #[tokio::test]
    async fn selected_task_without_details_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let api = RecordingApi::default().with_task("0001", "0 0 * * * *", "/opt/a.sh");
        api.selectable.lock().unwrap().push("0002".into());
        let (scheduler, manager, api, _) = scheduler(dir.path(), api);
        manager.load_from(api.as_ref()).await.unwrap();
        assert_eq!(manager.active_ids(), vec!["0001", "0002"]);

        assert_eq!(scheduler.start().await.unwrap(), 1);
        assert!(scheduler.is_scheduled("0001"));
        assert!(!scheduler.is_scheduled("0002"));
        assert!(manager.get("0002").is_some());
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn duplicates_and_unknown_stops_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _, _, _) = scheduler(dir.path(), RecordingApi::default());

        scheduler.add_task("0001", "0 0 * * *", "/opt/a.sh").unwrap();
        assert!(matches!(
            scheduler.add_task("0001", "0 0 * * *", "/opt/a.sh"),
            Err(SchedulerError::Duplicate(_))
        ));
        assert!(matches!(
            scheduler.add_task("0002", "bad cron", "/opt/a.sh"),
            Err(SchedulerError::InvalidCron { .. })
        ));
        assert!(!scheduler.is_scheduled("0002"));

        scheduler.stop_task("0001").unwrap();
        assert!(matches!(
            scheduler.stop_task("0001"),
            Err(SchedulerError::NotScheduled(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn scheduled_task_fires() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("tick.sh");
        std::fs::write(&script, "echo tick\n").unwrap();
        let (scheduler, manager, api, _) = scheduler(dir.path(), RecordingApi::default());
        manager.add_task("0001", "");

        scheduler
            .add_task("0001", "* * * * * *", script.to_str().unwrap())
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while api.logs().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        scheduler.stop_task("0001").unwrap();

        let logs = api.logs();
        assert!(!logs.is_empty());
        assert_eq!(logs[0].task_id, "0001");
        assert_eq!(logs[0].success, Some(true));
    }
}
