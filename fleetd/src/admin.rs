//! Operator-facing task administration: create, stop, update, delete, query.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use fleet_common::{
    task_file_key, task_key, ControlAction, ControlMessage, TaskRecord, TaskStatus,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::registry::ConnectionRegistry;
use crate::repository::{RepoError, SqliteRepository};
use crate::store::{StoreError, TaskStates};

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    #[error("'{0}' is not a valid client IP address")]
    InvalidClient(String),
    #[error("task_id is required")]
    MissingTaskId,
    #[error("task {0} already exists")]
    AlreadyExists(String),
    #[error("task {0} does not exist")]
    UnknownTask(String),
    #[error("coordination store: {0}")]
    Store(#[from] StoreError),
    #[error("repository: {0}")]
    Repo(#[from] RepoError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TaskControl {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub task_name: String,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default)]
    pub script_path: String,
    #[serde(default)]
    pub action: String,
}

/// Body of `POST /api/tasks`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskAdminRequest {
    pub option: String,
    #[serde(default)]
    pub file_id: i64,
    #[serde(default)]
    pub task_record: TaskRecord,
    #[serde(default)]
    pub task_control: TaskControl,
}

/// Four-digit task code: first two bytes of `sha256("{client}:{salt}")`,
/// big-endian, modulo 10000, zero padded.
pub fn generate_task_code(client_ip: &str, salt: i64) -> Result<String, AdminError> {
    client_ip
        .parse::<IpAddr>()
        .map_err(|_| AdminError::InvalidClient(client_ip.to_string()))?;
    let digest = Sha256::digest(format!("{client_ip}:{salt}").as_bytes());
    let code = u16::from_be_bytes([digest[0], digest[1]]) % 10_000;
    Ok(format!("{code:04}"))
}

pub struct TaskAdmin {
    states: TaskStates,
    repo: Arc<SqliteRepository>,
    registry: Arc<ConnectionRegistry>,
}

impl TaskAdmin {
    pub fn new(
        states: TaskStates,
        repo: Arc<SqliteRepository>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            states,
            repo,
            registry,
        }
    }

    /// Applies one admin request; `create` and `query` return a record.
    pub async fn apply(&self, request: TaskAdminRequest) -> Result<Option<TaskRecord>, AdminError> {
        match request.option.as_str() {
            "create" => self.create(request.task_record, request.file_id).await.map(Some),
            "stop" => {
                self.stop(&request.task_control)?;
                Ok(None)
            }
            "update" => {
                self.update(&request.task_control, &request.task_record.status)
                    .await?;
                Ok(None)
            }
            "delete" => {
                self.delete(&request.task_control).await?;
                Ok(None)
            }
            "query" => self.query(&request.task_record.task_id).await.map(Some),
            other => Err(AdminError::UnknownOption(other.to_string())),
        }
    }

    pub async fn create(&self, mut record: TaskRecord, file_id: i64) -> Result<TaskRecord, AdminError> {
        let salt = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_micros());
        record.task_id = generate_task_code(&record.client_ip, salt)?;
        if record.status.is_empty() {
            record.status = TaskStatus::Inactive.to_string();
        }
        if file_id != 0 {
            record.file_id = file_id;
        }

        let mut batch = vec![(
            task_key(&record.client_ip, &record.task_id),
            record.status.clone(),
        )];
        if record.file_id != 0 {
            batch.push((task_file_key(&record.task_id), record.file_id.to_string()));
        }
        if !self.states.store().put_if_absent(&batch).await? {
            return Err(AdminError::AlreadyExists(record.task_id));
        }

        self.repo.insert_task_record(&record).await?;

        let mut message = ControlMessage::new(ControlAction::Add, &record.task_id);
        message.crond_expression = Some(record.crond_expression.clone());
        message.script_path = Some(record.script_path.clone());
        message.file_id = (record.file_id != 0).then_some(record.file_id);
        let delivered = self.registry.broadcast(&message);
        info!(
            task_id = %record.task_id,
            client = %record.client_ip,
            "Task created, add delivered to {} session(s)",
            delivered
        );
        Ok(record)
    }

    pub fn stop(&self, control: &TaskControl) -> Result<usize, AdminError> {
        if control.task_id.is_empty() {
            return Err(AdminError::MissingTaskId);
        }
        let message = ControlMessage::new(ControlAction::Stop, &control.task_id);
        let delivered = self.registry.broadcast(&message);
        info!(task_id = %control.task_id, "Stop delivered to {} session(s)", delivered);
        Ok(delivered)
    }

    pub async fn update(&self, control: &TaskControl, status: &str) -> Result<usize, AdminError> {
        if control.task_id.is_empty() {
            return Err(AdminError::MissingTaskId);
        }
        match self
            .states
            .set_status(&control.client_ip, &control.task_id, status)
            .await
        {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                return Err(AdminError::UnknownTask(control.task_id.clone()))
            }
            Err(err) => return Err(err.into()),
        }
        self.repo.update_task_status(&control.task_id, status).await?;
        let message =
            ControlMessage::new(ControlAction::Update, &control.task_id).with_status(status);
        Ok(self.registry.broadcast(&message))
    }

    pub async fn delete(&self, control: &TaskControl) -> Result<usize, AdminError> {
        if control.task_id.is_empty() {
            return Err(AdminError::MissingTaskId);
        }
        let store = self.states.store();
        let removed = store
            .delete(&task_key(&control.client_ip, &control.task_id))
            .await?;
        store.delete(&task_file_key(&control.task_id)).await?;
        self.repo.delete_task_records(&control.task_id).await?;
        if !removed {
            warn!(task_id = %control.task_id, "Delete requested for a task with no status key");
        }
        let message = ControlMessage::new(ControlAction::Delete, &control.task_id);
        Ok(self.registry.broadcast(&message))
    }

    /// Rebuilds missing coordination keys from the repository's newest row
    /// of every task. Keys already present are left alone. Returns the number
    /// of task keys written.
    pub async fn restore_states(&self) -> Result<usize, AdminError> {
        let store = self.states.store();
        let mut restored = 0;
        for record in self.repo.latest_task_records().await? {
            let status = if record.status.is_empty() {
                TaskStatus::Inactive.to_string()
            } else {
                record.status.clone()
            };
            let task = [(task_key(&record.client_ip, &record.task_id), status)];
            if store.put_if_absent(&task).await? {
                restored += 1;
            }
            if record.file_id != 0 {
                let file = [(task_file_key(&record.task_id), record.file_id.to_string())];
                store.put_if_absent(&file).await?;
            }
        }
        info!("Restored {} task key(s) from the repository", restored);
        Ok(restored)
    }

    pub async fn query(&self, task_id: &str) -> Result<TaskRecord, AdminError> {
        if task_id.is_empty() {
            return Err(AdminError::MissingTaskId);
        }
        self.repo
            .task_record(task_id)
            .await?
            .ok_or_else(|| AdminError::UnknownTask(task_id.to_string()))
    }
}
