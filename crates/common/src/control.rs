//! Control messages pushed from the coordinator to agents.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Add,
    Stop,
    Update,
    Delete,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Add => "add",
            ControlAction::Stop => "stop",
            ControlAction::Update => "update",
            ControlAction::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "add" => Some(ControlAction::Add),
            "stop" => Some(ControlAction::Stop),
            "update" => Some(ControlAction::Update),
            "delete" => Some(ControlAction::Delete),
            _ => None,
        }
    }
}

/// `{action, task_id, client_ip, ...}` as broadcast or unicast to agents.
///
/// `client_ip` is stamped by the registry with the recipient's identity
/// right before delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: String,
    pub task_id: String,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crond_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ControlMessage {
    pub fn new(action: ControlAction, task_id: impl Into<String>) -> Self {
        Self {
            action: action.as_str().to_string(),
            task_id: task_id.into(),
            ..Self::default()
        }
    }

    pub fn action(&self) -> Option<ControlAction> {
        ControlAction::parse(&self.action)
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Inbound frame as seen by an agent's listener.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Control message addressed to this agent.
    Directed(ControlMessage),
    /// Anything else: request responses, foreign control messages, notices.
    General(Value),
}

/// A frame is directed when it carries `task_id`, `action` and a `client_ip`
/// equal to `identity`.
pub fn classify_frame(raw: &str, identity: &str) -> Result<Frame, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;
    let has_str = |field: &str| value.get(field).and_then(Value::as_str).is_some();
    let addressed = value.get("client_ip").and_then(Value::as_str) == Some(identity);

    if has_str("task_id") && has_str("action") && addressed {
        if let Ok(message) = serde_json::from_value::<ControlMessage>(value.clone()) {
            return Ok(Frame::Directed(message));
        }
    }
    Ok(Frame::General(value))
}
