//! Runs one task script and reports the outcome.
//!
//! A run marks the task `running`, executes the script with an interpreter
//! chosen from the host OS and the file extension, streams stdout and stderr
//! into a per-run log file, then marks the task `completed`, uploads the log
//! and submits a task log. The status ends `completed` whatever the exit
//! status; success and exit code travel in the task log.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use fleet_common::{TaskLogPayload, TaskStatus};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::TaskApi;
use crate::task_manager::TaskManager;
use crate::transport::FileTransport;

const DEFAULT_TIMEOUT_SECS: u64 = 3_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Unix,
    Windows,
}

impl HostOs {
    pub fn current() -> Self {
        if cfg!(windows) {
            HostOs::Windows
        } else {
            HostOs::Unix
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<OsString>,
}

/// Interpreter for `script` on `os`, or `None` for unsupported extensions.
pub fn interpreter_for(script: &Path, os: HostOs) -> Option<Invocation> {
    let extension = script.extension()?.to_string_lossy().to_ascii_lowercase();
    let path = script.as_os_str().to_os_string();
    let (program, mut args): (&str, Vec<OsString>) = match (os, extension.as_str()) {
        (HostOs::Unix, "sh") => ("/bin/sh", Vec::new()),
        (HostOs::Unix, "py") => ("python3", Vec::new()),
        (HostOs::Windows, "bat" | "cmd") => ("cmd", vec!["/C".into()]),
        (HostOs::Windows, "ps1") => (
            "powershell",
            vec!["-ExecutionPolicy".into(), "Bypass".into(), "-File".into()],
        ),
        (HostOs::Windows, "py") => ("python", Vec::new()),
        (_, "java") => ("java", Vec::new()),
        _ => return None,
    };
    args.push(path);
    Some(Invocation {
        program: program.to_string(),
        args,
    })
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Reported as `client_ip` in task logs.
    pub identity: String,
    pub work_dir: PathBuf,
    pub log_dir: PathBuf,
    pub timeout: Duration,
}

impl ExecutorConfig {
    fn effective_timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        } else {
            self.timeout
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Process exited; `None` when it was ended by a signal.
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
    SpawnFailed(String),
    Unsupported(String),
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        matches!(self, RunOutcome::Exited(Some(0)))
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunOutcome::Exited(code) => *code,
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            RunOutcome::Exited(Some(code)) => format!("exited with status {code}"),
            RunOutcome::Exited(None) => "terminated by signal".to_string(),
            RunOutcome::TimedOut => "timed out".to_string(),
            RunOutcome::Cancelled => "cancelled".to_string(),
            RunOutcome::SpawnFailed(err) => format!("failed to start: {err}"),
            RunOutcome::Unsupported(ext) => format!("unsupported script type '{ext}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub task_id: String,
    pub log_path: PathBuf,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Clone)]
struct LogFile {
    file: Arc<Mutex<File>>,
}

impl LogFile {
    async fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(bytes).await
    }

    async fn note(&self, text: &str) {
        let line = format!("[fleetd-agent] {text}\n");
        if let Err(err) = self.write(line.as_bytes()).await {
            warn!("Failed to write task log: {}", err);
        }
    }

    async fn flush(&self) -> io::Result<()> {
        self.file.lock().await.flush().await
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>, log: LogFile) -> io::Result<()> {
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut buf = [0u8; 8192];
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        log.write(&buf[..read]).await?;
    }
}

/// `{log_dir}/{task_id}/{task_id}_{YYYYmmdd-HHMMSS}.log`
pub fn log_path_for(log_dir: &Path, task_id: &str, at: DateTime<Utc>) -> PathBuf {
    log_dir
        .join(task_id)
        .join(format!("{task_id}_{}.log", at.format("%Y%m%d-%H%M%S")))
}

pub struct Executor {
    config: ExecutorConfig,
    api: Arc<dyn TaskApi>,
    manager: Arc<TaskManager>,
    transport: Arc<dyn FileTransport>,
    os: HostOs,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        api: Arc<dyn TaskApi>,
        manager: Arc<TaskManager>,
        transport: Arc<dyn FileTransport>,
    ) -> Self {
        Self {
            config,
            api,
            manager,
            transport,
            os: HostOs::current(),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn FileTransport> {
        &self.transport
    }

    fn resolve_script(&self, script_path: &str) -> PathBuf {
        let path = Path::new(script_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.work_dir.join(path)
        }
    }

    async fn set_status(&self, task_id: &str, status: TaskStatus) {
        self.manager.update_status(task_id, status);
        if let Err(err) = self.api.update_status(task_id, status.as_str()).await {
            warn!(task_id = %task_id, "Failed to report status {}: {}", status, err);
        }
    }

    /// Executes `script_path` for `task_id`. Only a log file that cannot be
    /// created is an error; every other failure ends up in the report.
    pub async fn run(
        &self,
        task_id: &str,
        script_path: &str,
        cancel: &CancellationToken,
    ) -> io::Result<ExecutionReport> {
        let started_at = Utc::now();
        let log_path = log_path_for(&self.config.log_dir, task_id, started_at);
        let log = LogFile::create(&log_path).await?;

        self.set_status(task_id, TaskStatus::Running).await;
        info!(task_id = %task_id, "Running {}", script_path);

        let script = self.resolve_script(script_path);
        let outcome = match interpreter_for(&script, self.os) {
            Some(invocation) => self.run_process(invocation, &log, cancel).await,
            None => {
                let ext = script
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_default();
                RunOutcome::Unsupported(ext)
            }
        };
        if !matches!(outcome, RunOutcome::Exited(Some(0))) {
            log.note(&outcome.describe()).await;
        }
        if let Err(err) = log.flush().await {
            warn!(task_id = %task_id, "Failed to flush task log: {}", err);
        }
        let finished_at = Utc::now();

        self.set_status(task_id, TaskStatus::Completed).await;
        if let Err(err) = self.transport.upload(&log_path).await {
            warn!(task_id = %task_id, "Failed to upload log {}: {}", log_path.display(), err);
        }

        let payload = TaskLogPayload {
            client_ip: self.config.identity.clone(),
            task_id: task_id.to_string(),
            output: log_path.display().to_string(),
            execution_time: Some(started_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            completion_time: Some(finished_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            remarks: outcome.describe(),
            success: Some(outcome.success()),
            exit_code: outcome.exit_code(),
        };
        match self.api.submit_log(payload).await {
            Ok(log_id) => debug!(task_id = %task_id, "Task log stored as {}", log_id),
            Err(err) => warn!(task_id = %task_id, "Failed to submit task log: {}", err),
        }

        info!(task_id = %task_id, "Run {}", outcome.describe());
        Ok(ExecutionReport {
            task_id: task_id.to_string(),
            log_path,
            outcome,
            started_at,
            finished_at,
        })
    }

    async fn run_process(
        &self,
        invocation: Invocation,
        log: &LogFile,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.config.work_dir.is_dir() {
            command.current_dir(&self.config.work_dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => return RunOutcome::SpawnFailed(err.to_string()),
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = self.config.effective_timeout();

        let outcome = {
            let completion = async {
                let (status, out, err) = tokio::join!(
                    child.wait(),
                    drain(stdout, log.clone()),
                    drain(stderr, log.clone())
                );
                if let Err(e) = out.and(err) {
                    warn!("Failed to capture script output: {}", e);
                }
                status
            };
            tokio::select! {
                result = timeout(limit, completion) => match result {
                    Ok(Ok(status)) => RunOutcome::Exited(status.code()),
                    Ok(Err(err)) => RunOutcome::SpawnFailed(err.to_string()),
                    Err(_) => RunOutcome::TimedOut,
                },
                _ = cancel.cancelled() => RunOutcome::Cancelled,
            }
        };

        if matches!(outcome, RunOutcome::TimedOut | RunOutcome::Cancelled) {
            if let Err(err) = child.kill().await {
                debug!("Kill after {} failed: {}", outcome.describe(), err);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingApi, RecordingTransport};
    use chrono::TimeZone;

    fn executor(dir: &Path, timeout: Duration) -> (Executor, Arc<RecordingApi>, Arc<RecordingTransport>, Arc<TaskManager>) {
        let api = Arc::new(RecordingApi::default());
        let transport = Arc::new(RecordingTransport::default());
        let manager = Arc::new(TaskManager::new());
        manager.init_tasks(vec!["0001".to_string()]);
        let executor = Executor::new(
            ExecutorConfig {
                identity: "10.0.0.4".into(),
                work_dir: dir.to_path_buf(),
                log_dir: dir.join("logs"),
                timeout,
            },
            api.clone(),
            manager.clone(),
            transport.clone(),
        );
        (executor, api, transport, manager)
    }

    #[test]
    fn interpreter_follows_os_and_extension() {
        let unix = interpreter_for(Path::new("/opt/job.SH"), HostOs::Unix).unwrap();
        assert_eq!(unix.program, "/bin/sh");
        assert_eq!(unix.args, vec![OsString::from("/opt/job.SH")]);

        let ps = interpreter_for(Path::new("C:\\jobs\\x.ps1"), HostOs::Windows).unwrap();
        assert_eq!(ps.program, "powershell");
        assert_eq!(ps.args.len(), 4);

        assert_eq!(
            interpreter_for(Path::new("run.bat"), HostOs::Windows).unwrap().program,
            "cmd"
        );
        assert!(interpreter_for(Path::new("run.bat"), HostOs::Unix).is_none());
        assert!(interpreter_for(Path::new("run.ps1"), HostOs::Unix).is_none());
        assert!(interpreter_for(Path::new("noext"), HostOs::Unix).is_none());
        assert_eq!(
            interpreter_for(Path::new("Main.java"), HostOs::Unix).unwrap().program,
            "java"
        );
    }

    #[test]
    fn log_path_layout() {
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            log_path_for(Path::new("logs"), "0042", at),
            PathBuf::from("logs/0042/0042_20260309-070501.log")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_script_output_reaches_log_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hello.sh");
        std::fs::write(&script, "echo hello\necho oops >&2\nexit 3\n").unwrap();
        let (executor, api, transport, manager) = executor(dir.path(), Duration::from_secs(30));

        let report = executor
            .run("0001", script.to_str().unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Exited(Some(3)));
        let contents = std::fs::read_to_string(&report.log_path).unwrap();
        assert!(contents.contains("hello"));
        assert!(contents.contains("oops"));

        assert_eq!(
            api.statuses(),
            vec![
                ("0001".to_string(), "running".to_string()),
                ("0001".to_string(), "completed".to_string())
            ]
        );
        let logs = api.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].success, Some(false));
        assert_eq!(logs[0].exit_code, Some(3));
        assert_eq!(logs[0].client_ip, "10.0.0.4");
        assert_eq!(transport.uploads(), vec![report.log_path.clone()]);
        assert_eq!(manager.get("0001").unwrap().status, TaskStatus::Completed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_script_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow.sh");
        std::fs::write(&script, "sleep 30\n").unwrap();
        let (executor, api, _, _) = executor(dir.path(), Duration::from_millis(200));

        let report = executor
            .run("0001", "slow.sh", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::TimedOut);
        assert_eq!(api.logs()[0].success, Some(false));
        assert_eq!(api.statuses().last().unwrap().1, "completed");
    }

    #[tokio::test]
    async fn unsupported_extension_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, api, _, _) = executor(dir.path(), Duration::from_secs(5));

        let report = executor
            .run("0001", "notes.txt", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Unsupported("txt".into()));
        let contents = std::fs::read_to_string(&report.log_path).unwrap();
        assert!(contents.contains("unsupported script type 'txt'"));
        assert_eq!(api.statuses().last().unwrap().1, "completed");
        assert_eq!(api.logs()[0].success, Some(false));
    }
}
