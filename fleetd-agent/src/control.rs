//! Applies directed control messages to the local task table and scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_common::{ControlAction, ControlMessage};
use tracing::{debug, info, warn};

use crate::api::TaskApi;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::session::ControlHandler;
use crate::task_manager::TaskManager;

pub struct AgentControl {
    manager: Arc<TaskManager>,
    scheduler: Arc<Scheduler>,
    api: Arc<dyn TaskApi>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl AgentControl {
    pub fn new(manager: Arc<TaskManager>, scheduler: Arc<Scheduler>, api: Arc<dyn TaskApi>) -> Self {
        Self {
            manager,
            scheduler,
            api,
        }
    }

    /// Cron expression and script path for an `add`, asking the server when
    /// the frame does not carry them.
    async fn resolve(&self, message: &ControlMessage) -> Option<(String, String)> {
        if let (Some(cron), Some(script)) = (
            non_empty(&message.crond_expression),
            non_empty(&message.script_path),
        ) {
            return Some((cron, script));
        }

        let ids = vec![message.task_id.clone()];
        match self.api.query_tasks(&ids).await {
            Ok(mut details) => {
                let task = details.remove(&message.task_id)?;
                Some((
                    non_empty(&task.crond_expression)?,
                    non_empty(&task.script_path)?,
                ))
            }
            Err(err) => {
                warn!(task_id = %message.task_id, "Failed to query task details: {}", err);
                None
            }
        }
    }

    async fn add(&self, message: &ControlMessage) {
        let content = message.script_path.clone().unwrap_or_default();
        if self.manager.add_task(&message.task_id, &content) {
            info!(task_id = %message.task_id, "Task added");
        } else {
            debug!(task_id = %message.task_id, "Task already known");
        }

        let Some((cron, script)) = self.resolve(message).await else {
            warn!(task_id = %message.task_id, "No schedule available, task not scheduled");
            return;
        };
        match self.scheduler.add_task(&message.task_id, &cron, &script) {
            Ok(()) => {}
            Err(SchedulerError::Duplicate(_)) => {
                debug!(task_id = %message.task_id, "Already scheduled")
            }
            Err(err) => warn!(task_id = %message.task_id, "Failed to schedule: {}", err),
        }
    }

    fn stop(&self, message: &ControlMessage) {
        if !self.manager.stop_task(&message.task_id) {
            debug!(task_id = %message.task_id, "Stop for unknown task");
        }
        match self.scheduler.stop_task(&message.task_id) {
            Ok(()) | Err(SchedulerError::NotScheduled(_)) => {}
            Err(err) => warn!(task_id = %message.task_id, "Failed to unschedule: {}", err),
        }
    }
}

#[async_trait]
impl ControlHandler for AgentControl {
    async fn on_control(&self, message: ControlMessage) {
        match message.action() {
            Some(ControlAction::Add) => self.add(&message).await,
            Some(ControlAction::Stop) => self.stop(&message),
            Some(other) => {
                info!(task_id = %message.task_id, "Ignoring {} control message", other.as_str())
            }
            None => warn!(task_id = %message.task_id, "Unknown control action '{}'", message.action),
        }
    }
}
