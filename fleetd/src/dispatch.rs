//! Handling of decoded `task_request` payloads.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_common::{
    decode_task_request, DecodeError, TaskLog, TaskLogPayload, TaskRequest, SELECTABLE_STATUS,
};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::repository::{RepoError, SqliteRepository};
use crate::store::{StoreError, TaskStates};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("coordination store: {0}")]
    Store(#[from] StoreError),
    #[error("repository: {0}")]
    Repo(#[from] RepoError),
}

pub struct TaskDispatcher {
    states: TaskStates,
    repo: Arc<SqliteRepository>,
}

fn timestamp_or_now(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

impl TaskDispatcher {
    pub fn new(states: TaskStates, repo: Arc<SqliteRepository>) -> Self {
        Self { states, repo }
    }

    /// Decodes the envelope's `Msg` and handles it.
    pub async fn dispatch(&self, msg: &str) -> Result<Value, DispatchError> {
        let request = decode_task_request(msg)?;
        self.handle(request).await
    }

    pub async fn handle(&self, request: TaskRequest) -> Result<Value, DispatchError> {
        debug!("Dispatching {} request", request.task_type());
        match request {
            TaskRequest::Select { request_id } => {
                let task_list = self.states.task_ids(&request_id, SELECTABLE_STATUS).await?;
                Ok(json!({ "request_id": request_id, "task_list": task_list }))
            }
            TaskRequest::GetTask { request_id } => {
                let task_ids = self.states.task_ids(&request_id, SELECTABLE_STATUS).await?;
                let file_list = self.states.file_ids(&task_ids).await?;
                Ok(json!({ "request_id": request_id, "files": file_list }))
            }
            TaskRequest::UpdateStatus {
                request_id,
                task_id,
                task_status,
            } => {
                if request_id.is_empty() || task_id.is_empty() {
                    return Err(DispatchError::Invalid(
                        "update_status needs request_id and task_id".to_string(),
                    ));
                }
                self.states
                    .set_status(&request_id, &task_id, &task_status)
                    .await?;
                self.repo.update_task_status(&task_id, &task_status).await?;
                info!("Task {} on {} is now {}", task_id, request_id, task_status);
                Ok(json!({ "task_id": task_id, "status": "ok" }))
            }
            TaskRequest::QueryTask { task_id, .. } => {
                let tasks_info = self.repo.task_records(&task_id).await?;
                Ok(json!({ "tasks_info": tasks_info }))
            }
            TaskRequest::TaskLogAccepted {
                client_task_log, ..
            } => {
                let log_id = self.accept_log(client_task_log).await?;
                Ok(json!({ "log_id": log_id, "status": "accepted" }))
            }
        }
    }

    async fn accept_log(&self, payload: TaskLogPayload) -> Result<i64, DispatchError> {
        if payload.task_id.is_empty() || payload.client_ip.is_empty() {
            return Err(DispatchError::Invalid(
                "task log needs task_id and client_ip".to_string(),
            ));
        }
        let log = TaskLog {
            log_id: None,
            execution_time: timestamp_or_now(payload.execution_time.as_deref()),
            completion_time: timestamp_or_now(payload.completion_time.as_deref()),
            client_ip: payload.client_ip,
            task_id: payload.task_id,
            output: payload.output,
            remarks: payload.remarks,
            success: payload.success.unwrap_or(true),
            exit_code: payload.exit_code,
        };
        let log_id = self.repo.insert_task_log(&log).await?;
        info!(
            "Accepted log {} for task {} from {} (success: {})",
            log_id, log.task_id, log.client_ip, log.success
        );
        Ok(log_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CoordinationStore, MemoryStore};
    use fleet_common::{encode_payload, TaskRecord};

    async fn dispatcher() -> (TaskDispatcher, Arc<dyn CoordinationStore>, Arc<SqliteRepository>) {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let repo = Arc::new(SqliteRepository::in_memory().unwrap());
        (
            TaskDispatcher::new(TaskStates::new(store.clone()), repo.clone()),
            store,
            repo,
        )
    }

    #[tokio::test]
    async fn select_lists_only_inactive_tasks() {
        let (dispatcher, store, _) = dispatcher().await;
        store.put("/tasks/h1/0001", "inactive").await.unwrap();
        store.put("/tasks/h1/0002", "active").await.unwrap();
        store.put("/tasks/h2/0003", "inactive").await.unwrap();

        let response = dispatcher
            .handle(TaskRequest::Select {
                request_id: "h1".into(),
            })
            .await
            .unwrap();
        assert_eq!(response["request_id"], "h1");
        assert_eq!(response["task_list"], json!(["0001"]));
    }

    #[tokio::test]
    async fn get_task_resolves_file_ids() {
        let (dispatcher, store, _) = dispatcher().await;
        store.put("/tasks/h1/0001", "inactive").await.unwrap();
        store.put("/tasksfile/0001", "77").await.unwrap();

        let response = dispatcher
            .handle(TaskRequest::GetTask {
                request_id: "h1".into(),
            })
            .await
            .unwrap();
        assert_eq!(response["files"], json!(["77"]));
    }

    #[tokio::test]
    async fn update_status_requires_existing_key() {
        let (dispatcher, store, repo) = dispatcher().await;
        store.put("/tasks/h1/0001", "inactive").await.unwrap();
        repo.insert_task_record(&TaskRecord {
            task_id: "0001".into(),
            client_ip: "h1".into(),
            status: "inactive".into(),
            ..TaskRecord::default()
        })
        .await
        .unwrap();

        let ok = dispatcher
            .handle(TaskRequest::UpdateStatus {
                request_id: "h1".into(),
                task_id: "0001".into(),
                task_status: "running".into(),
            })
            .await
            .unwrap();
        assert_eq!(ok["status"], "ok");
        assert_eq!(
            store.get("/tasks/h1/0001").await.unwrap().as_deref(),
            Some("running")
        );
        assert_eq!(repo.task_record("0001").await.unwrap().unwrap().status, "running");

        let missing = dispatcher
            .handle(TaskRequest::UpdateStatus {
                request_id: "h1".into(),
                task_id: "0404".into(),
                task_status: "running".into(),
            })
            .await;
        assert!(matches!(missing, Err(DispatchError::Store(StoreError::NotFound(_)))));
        assert!(store.get("/tasks/h1/0404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn half_created_tasks_answer_from_each_store() {
        let (dispatcher, store, repo) = dispatcher().await;
        // Key written, repository row not yet inserted.
        store.put("/tasks/h1/0001", "inactive").await.unwrap();
        // Row inserted, key not yet written.
        repo.insert_task_record(&TaskRecord {
            task_id: "0002".into(),
            client_ip: "h1".into(),
            script_path: "/opt/b.sh".into(),
            crond_expression: "0 0 * * *".into(),
            status: "inactive".into(),
            ..TaskRecord::default()
        })
        .await
        .unwrap();

        let selected = dispatcher
            .handle(TaskRequest::Select {
                request_id: "h1".into(),
            })
            .await
            .unwrap();
        assert_eq!(selected["task_list"], json!(["0001"]));

        let query = dispatcher
            .handle(TaskRequest::QueryTask {
                request_id: "h1".into(),
                task_id: vec!["0001".into(), "0002".into()],
            })
            .await
            .unwrap();
        let infos = query["tasks_info"].as_array().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0]["task_id"], "0002");

        let update = dispatcher
            .handle(TaskRequest::UpdateStatus {
                request_id: "h1".into(),
                task_id: "0002".into(),
                task_status: "running".into(),
            })
            .await;
        assert!(matches!(update, Err(DispatchError::Store(StoreError::NotFound(_)))));
        assert_eq!(repo.task_record("0002").await.unwrap().unwrap().status, "inactive");
    }

    #[tokio::test]
    async fn unknown_task_type_mutates_nothing() {
        let (dispatcher, store, repo) = dispatcher().await;
        store.put("/tasks/h1/0001", "inactive").await.unwrap();

        let msg = encode_payload(&json!({"task_type": "bogus", "request_id": "h1"})).unwrap();
        let result = dispatcher.dispatch(&msg).await;
        assert!(matches!(
            result,
            Err(DispatchError::Decode(DecodeError::UnknownTaskType(_)))
        ));

        assert_eq!(store.get_prefix("/").await.unwrap().len(), 1);
        assert_eq!(repo.count_task_records().await.unwrap(), 0);
        assert_eq!(repo.count_task_logs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn task_log_defaults_times_and_correlates_with_record() {
        let (dispatcher, _, repo) = dispatcher().await;
        repo.insert_task_record(&TaskRecord {
            task_id: "0001".into(),
            client_ip: "h1".into(),
            script_path: "/opt/a.sh".into(),
            crond_expression: "* * * * *".into(),
            status: "inactive".into(),
            ..TaskRecord::default()
        })
        .await
        .unwrap();

        let before = Utc::now();
        let msg = encode_payload(&TaskRequest::TaskLogAccepted {
            request_id: "h1".into(),
            client_task_log: TaskLogPayload {
                client_ip: "h1".into(),
                task_id: "0001".into(),
                output: "logs/0001/run.log".into(),
                execution_time: Some("not a time".into()),
                ..TaskLogPayload::default()
            },
        })
        .unwrap();
        let response = dispatcher.dispatch(&msg).await.unwrap();
        assert_eq!(response["status"], "accepted");

        let logs = repo.task_logs("0001").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].execution_time >= before - chrono::Duration::seconds(1));
        assert!(logs[0].success);

        let query = dispatcher
            .handle(TaskRequest::QueryTask {
                request_id: "h1".into(),
                task_id: vec![logs[0].task_id.clone()],
            })
            .await
            .unwrap();
        assert_eq!(query["tasks_info"][0]["task_id"], "0001");
        assert_eq!(query["tasks_info"][0]["script_path"], "/opt/a.sh");
    }

    #[tokio::test]
    async fn task_log_without_identity_is_rejected() {
        let (dispatcher, _, repo) = dispatcher().await;
        let result = dispatcher
            .handle(TaskRequest::TaskLogAccepted {
                request_id: "h1".into(),
                client_task_log: TaskLogPayload {
                    task_id: "0001".into(),
                    ..TaskLogPayload::default()
                },
            })
            .await;
        assert!(matches!(result, Err(DispatchError::Invalid(_))));
        assert_eq!(repo.count_task_logs().await.unwrap(), 0);
    }
}
