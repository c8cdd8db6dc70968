//! In-memory view of the tasks this agent owns.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use fleet_common::TaskStatus;
use tracing::info;

use crate::api::{ApiError, TaskApi};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTask {
    pub task_id: String,
    pub content: String,
    pub status: TaskStatus,
}

#[derive(Default)]
pub struct TaskManager {
    tasks: Mutex<HashMap<String, LocalTask>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, LocalTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds the table; every seeded task starts `active`.
    pub fn init_tasks<I>(&self, task_ids: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut tasks = self.tasks();
        let mut added = 0;
        for task_id in task_ids {
            if tasks.contains_key(&task_id) {
                continue;
            }
            tasks.insert(
                task_id.clone(),
                LocalTask {
                    task_id,
                    content: String::new(),
                    status: TaskStatus::Active,
                },
            );
            added += 1;
        }
        added
    }

    /// Seeds from the server's `select` answer.
    pub async fn load_from(&self, api: &dyn TaskApi) -> Result<usize, ApiError> {
        let ids = api.select_tasks().await?;
        let added = self.init_tasks(ids);
        info!("Task manager initialised with {} task(s)", added);
        Ok(added)
    }

    /// Adds an active task; `false` when the id is already known.
    pub fn add_task(&self, task_id: &str, content: &str) -> bool {
        let mut tasks = self.tasks();
        if tasks.contains_key(task_id) {
            return false;
        }
        tasks.insert(
            task_id.to_string(),
            LocalTask {
                task_id: task_id.to_string(),
                content: content.to_string(),
                status: TaskStatus::Active,
            },
        );
        true
    }

    pub fn stop_task(&self, task_id: &str) -> bool {
        self.update_status(task_id, TaskStatus::Stopped)
    }

    pub fn update_status(&self, task_id: &str, status: TaskStatus) -> bool {
        match self.tasks().get_mut(task_id) {
            Some(task) => {
                task.status = status;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, task_id: &str) -> Option<LocalTask> {
        self.tasks().get(task_id).cloned()
    }

    /// Ids of tasks currently `active`, sorted.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tasks()
            .values()
            .filter(|task| task.status == TaskStatus::Active)
            .map(|task| task.task_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_and_added_tasks_are_active() {
        let manager = TaskManager::new();
        assert_eq!(manager.init_tasks(vec!["0002".into(), "0001".into()]), 2);
        assert!(manager.add_task("0003", "/opt/c.sh"));
        assert!(!manager.add_task("0001", "dup"));

        assert_eq!(manager.active_ids(), vec!["0001", "0002", "0003"]);
        assert_eq!(manager.get("0003").unwrap().content, "/opt/c.sh");
    }

    #[test]
    fn stop_removes_task_from_active_set() {
        let manager = TaskManager::new();
        manager.init_tasks(vec!["0001".into()]);
        assert!(manager.stop_task("0001"));
        assert!(!manager.stop_task("0404"));
        assert_eq!(manager.get("0001").unwrap().status, TaskStatus::Stopped);
        assert!(manager.active_ids().is_empty());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn running_tasks_are_not_active() {
        let manager = TaskManager::new();
        manager.init_tasks(vec!["0001".into()]);
        manager.update_status("0001", TaskStatus::Running);
        assert!(manager.active_ids().is_empty());
        manager.update_status("0001", TaskStatus::Completed);
        assert_eq!(manager.get("0001").unwrap().status, TaskStatus::Completed);
    }
}
