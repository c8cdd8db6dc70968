//! Task requests the agent issues over its session.

use std::collections::HashMap;

use async_trait::async_trait;
use fleet_common::{RequestKind, TaskLogPayload, TaskRequest};
use serde_json::Value;
use tracing::warn;

use crate::session::{Session, SessionError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("server rejected request: {0}")]
    Rejected(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Scheduling metadata of one task, as returned by `query_task`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDetails {
    pub task_id: String,
    pub crond_expression: Option<String>,
    pub script_path: Option<String>,
    pub file_id: Option<i64>,
    pub remarks: Option<String>,
}

impl TaskDetails {
    /// Tolerates missing or mistyped fields; only `task_id` is required.
    pub fn from_value(value: &Value) -> Option<Self> {
        let text = |field: &str| {
            value
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .filter(|s| !s.is_empty())
        };
        Some(Self {
            task_id: text("task_id")?,
            crond_expression: text("crond_expression"),
            script_path: text("script_path"),
            file_id: value.get("file_id").and_then(Value::as_i64),
            remarks: text("remarks"),
        })
    }
}

#[async_trait]
pub trait TaskApi: Send + Sync {
    /// Ids of this agent's selectable tasks.
    async fn select_tasks(&self) -> Result<Vec<String>, ApiError>;

    /// File ids the selectable tasks need staged.
    async fn task_files(&self) -> Result<Vec<String>, ApiError>;

    async fn query_tasks(&self, task_ids: &[String]) -> Result<HashMap<String, TaskDetails>, ApiError>;

    async fn update_status(&self, task_id: &str, status: &str) -> Result<(), ApiError>;

    /// Returns the stored log id.
    async fn submit_log(&self, log: TaskLogPayload) -> Result<i64, ApiError>;
}

/// [`TaskApi`] over a live [`Session`].
#[derive(Clone)]
pub struct RemoteTaskApi {
    session: Session,
}

impl RemoteTaskApi {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    async fn request(&self, request: TaskRequest) -> Result<Value, ApiError> {
        let raw = self.session.send(RequestKind::TaskRequest, &request).await?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|err| ApiError::Malformed(format!("{err}: {raw}")))?;
        if let Some(error) = value.get("error").and_then(Value::as_str) {
            return Err(ApiError::Rejected(error.to_string()));
        }
        Ok(value)
    }

    fn identity(&self) -> String {
        self.session.identity().to_string()
    }
}

fn string_list(value: &Value, field: &str) -> Result<Vec<String>, ApiError> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()),
        Some(other) => Err(ApiError::Malformed(format!("{field} is not a list: {other}"))),
    }
}

#[async_trait]
impl TaskApi for RemoteTaskApi {
    async fn select_tasks(&self) -> Result<Vec<String>, ApiError> {
        let response = self
            .request(TaskRequest::Select {
                request_id: self.identity(),
            })
            .await?;
        string_list(&response, "task_list")
    }

    async fn task_files(&self) -> Result<Vec<String>, ApiError> {
        let response = self
            .request(TaskRequest::GetTask {
                request_id: self.identity(),
            })
            .await?;
        string_list(&response, "files")
    }

    async fn query_tasks(&self, task_ids: &[String]) -> Result<HashMap<String, TaskDetails>, ApiError> {
        let response = self
            .request(TaskRequest::QueryTask {
                request_id: self.identity(),
                task_id: task_ids.to_vec(),
            })
            .await?;

        let mut details = HashMap::new();
        if let Some(items) = response.get("tasks_info").and_then(Value::as_array) {
            for item in items {
                match TaskDetails::from_value(item) {
                    Some(task) => {
                        details.insert(task.task_id.clone(), task);
                    }
                    None => warn!("Skipping task info without task_id: {}", item),
                }
            }
        }
        Ok(details)
    }

    async fn update_status(&self, task_id: &str, status: &str) -> Result<(), ApiError> {
        self.request(TaskRequest::UpdateStatus {
            request_id: self.identity(),
            task_id: task_id.to_string(),
            task_status: status.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn submit_log(&self, log: TaskLogPayload) -> Result<i64, ApiError> {
        let response = self
            .request(TaskRequest::TaskLogAccepted {
                request_id: self.identity(),
                client_task_log: log,
            })
            .await?;
        response
            .get("log_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ApiError::Malformed(format!("no log_id in {response}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn details_skip_empty_and_mistyped_fields() {
        let details = TaskDetails::from_value(&json!({
            "task_id": "0004",
            "crond_expression": "",
            "script_path": "/opt/a.sh",
            "file_id": "nope"
        }))
        .unwrap();
        assert_eq!(details.crond_expression, None);
        assert_eq!(details.script_path.as_deref(), Some("/opt/a.sh"));
        assert_eq!(details.file_id, None);
        assert!(TaskDetails::from_value(&json!({"script_path": "/x"})).is_none());
    }

    #[test]
    fn list_fields_accept_null_and_numbers() {
        assert!(string_list(&json!({"task_list": null}), "task_list")
            .unwrap()
            .is_empty());
        assert_eq!(
            string_list(&json!({"files": ["7", 8]}), "files").unwrap(),
            vec!["7", "8"]
        );
        assert!(string_list(&json!({"task_list": "0001"}), "task_list").is_err());
    }
}
