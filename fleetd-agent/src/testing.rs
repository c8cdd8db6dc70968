//! In-memory doubles for the agent's seams.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use fleet_common::TaskLogPayload;

use crate::api::{ApiError, TaskApi, TaskDetails};
use crate::transport::{FileTransport, TransportError};

#[derive(Default)]
pub struct RecordingApi {
    pub selectable: Mutex<Vec<String>>,
    pub files: Mutex<Vec<String>>,
    pub details: Mutex<HashMap<String, TaskDetails>>,
    statuses: Mutex<Vec<(String, String)>>,
    logs: Mutex<Vec<TaskLogPayload>>,
}

impl RecordingApi {
    pub fn with_task(self, task_id: &str, cron: &str, script: &str) -> Self {
        self.selectable.lock().unwrap().push(task_id.to_string());
        self.details.lock().unwrap().insert(
            task_id.to_string(),
            TaskDetails {
                task_id: task_id.to_string(),
                crond_expression: Some(cron.to_string()).filter(|s| !s.is_empty()),
                script_path: Some(script.to_string()).filter(|s| !s.is_empty()),
                ..TaskDetails::default()
            },
        );
        self
    }

    pub fn statuses(&self) -> Vec<(String, String)> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn logs(&self) -> Vec<TaskLogPayload> {
        self.logs.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskApi for RecordingApi {
    async fn select_tasks(&self) -> Result<Vec<String>, ApiError> {
        Ok(self.selectable.lock().unwrap().clone())
    }

    async fn task_files(&self) -> Result<Vec<String>, ApiError> {
        Ok(self.files.lock().unwrap().clone())
    }

    async fn query_tasks(&self, task_ids: &[String]) -> Result<HashMap<String, TaskDetails>, ApiError> {
        let details = self.details.lock().unwrap();
        Ok(task_ids
            .iter()
            .filter_map(|id| details.get(id).map(|d| (id.clone(), d.clone())))
            .collect())
    }

    async fn update_status(&self, task_id: &str, status: &str) -> Result<(), ApiError> {
        self.statuses
            .lock()
            .unwrap()
            .push((task_id.to_string(), status.to_string()));
        Ok(())
    }

    async fn submit_log(&self, log: TaskLogPayload) -> Result<i64, ApiError> {
        let mut logs = self.logs.lock().unwrap();
        logs.push(log);
        Ok(logs.len() as i64)
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    uploads: Mutex<Vec<PathBuf>>,
    downloads: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn uploads(&self) -> Vec<PathBuf> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl FileTransport for RecordingTransport {
    async fn upload(&self, path: &Path) -> Result<(), TransportError> {
        self.uploads.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    async fn download(&self, file_ids: &[String], dest_dir: &Path) -> Result<Vec<PathBuf>, TransportError> {
        self.downloads.lock().unwrap().extend(file_ids.iter().cloned());
        Ok(file_ids
            .iter()
            .map(|id| dest_dir.join(format!("{id}_taskfile")))
            .collect())
    }
}
