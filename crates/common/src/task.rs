//! Task records, statuses and coordination-store key layout.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status value `select` filters on when listing a client's tasks.
pub const SELECTABLE_STATUS: TaskStatus = TaskStatus::Inactive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Inactive,
    Active,
    Running,
    Completed,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Inactive => "inactive",
            TaskStatus::Active => "active",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inactive" => Ok(TaskStatus::Inactive),
            "active" => Ok(TaskStatus::Active),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "stopped" => Ok(TaskStatus::Stopped),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Durable task metadata held by the coordinator's repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default)]
    pub script_path: String,
    #[serde(default)]
    pub remarks: String,
    #[serde(default)]
    pub crond_expression: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub file_id: i64,
}

/// One execution outcome as stored by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_id: Option<i64>,
    pub client_ip: String,
    pub task_id: String,
    pub execution_time: DateTime<Utc>,
    pub completion_time: DateTime<Utc>,
    pub output: String,
    #[serde(default)]
    pub remarks: String,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

fn default_success() -> bool {
    true
}

/// `/tasks/{client}/{task_id}` holds the task's current status string.
pub fn task_key(client: &str, task_id: &str) -> String {
    format!("/tasks/{client}/{task_id}")
}

pub fn task_prefix(client: &str) -> String {
    format!("/tasks/{client}/")
}

/// `/tasksfile/{task_id}` holds the id of the file the task needs staged.
pub fn task_file_key(task_id: &str) -> String {
    format!("/tasksfile/{task_id}")
}

pub fn task_file_prefix(task_id: &str) -> String {
    task_file_key(task_id)
}

/// Last path segment of a task key.
pub fn task_id_from_key(key: &str) -> Option<&str> {
    key.rsplit('/').next().filter(|segment| !segment.is_empty())
}
