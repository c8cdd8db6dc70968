//! Task request payloads carried in [`Envelope::msg`](crate::Envelope).
//!
//! A payload travels as JSON, base64-encoded, then rendered as a JSON string
//! literal. Decoding peels those layers back one at a time so each failure
//! reports the stage it happened at.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Envelope;

const TASK_TYPE_FIELD: &str = "task_type";
const KNOWN_TASK_TYPES: &[&str] = &[
    "select",
    "get_task",
    "update_status",
    "query_task",
    "task_log_accepted",
];

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not a valid envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("payload is empty")]
    EmptyPayload,
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("payload has no task_type")]
    MissingTaskType,
    #[error("unknown task_type '{0}'")]
    UnknownTaskType(String),
    #[error("invalid {task_type} payload: {source}")]
    InvalidFields {
        task_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Log body an agent submits after a run.
///
/// Timestamps are RFC 3339 strings; the coordinator substitutes "now" for
/// anything absent or unparsable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogPayload {
    #[serde(default)]
    pub client_ip: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    #[serde(default)]
    pub remarks: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum TaskRequest {
    Select {
        #[serde(default)]
        request_id: String,
    },
    GetTask {
        #[serde(default)]
        request_id: String,
    },
    /// `request_id` names the client whose key is rewritten.
    UpdateStatus {
        request_id: String,
        task_id: String,
        task_status: String,
    },
    QueryTask {
        #[serde(default)]
        request_id: String,
        task_id: Vec<String>,
    },
    TaskLogAccepted {
        #[serde(default)]
        request_id: String,
        client_task_log: TaskLogPayload,
    },
}

impl TaskRequest {
    pub fn task_type(&self) -> &'static str {
        match self {
            TaskRequest::Select { .. } => "select",
            TaskRequest::GetTask { .. } => "get_task",
            TaskRequest::UpdateStatus { .. } => "update_status",
            TaskRequest::QueryTask { .. } => "query_task",
            TaskRequest::TaskLogAccepted { .. } => "task_log_accepted",
        }
    }
}

/// JSON-encode, base64-encode, then wrap as a JSON string literal.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(payload)?;
    serde_json::to_string(&STANDARD.encode(json))
}

pub fn decode_envelope(raw: &str) -> Result<Envelope, DecodeError> {
    serde_json::from_str(raw).map_err(DecodeError::Envelope)
}

/// Reverse of [`encode_payload`] for task requests.
pub fn decode_task_request(msg: &str) -> Result<TaskRequest, DecodeError> {
    let trimmed = msg.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(trimmed);
    if unquoted.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }

    let bytes = STANDARD.decode(unquoted)?;
    let value: Value = serde_json::from_slice(&bytes).map_err(DecodeError::Json)?;

    let task_type = value
        .get(TASK_TYPE_FIELD)
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingTaskType)?
        .to_string();
    if !KNOWN_TASK_TYPES.contains(&task_type.as_str()) {
        return Err(DecodeError::UnknownTaskType(task_type));
    }

    serde_json::from_value(value).map_err(|source| DecodeError::InvalidFields { task_type, source })
}
