//! Shared protocol definitions for `fleetd` and `fleetd-agent`.
//!
//! Everything that crosses the socket lives here: the outer envelope, the
//! token handshake frames, the base64-wrapped task request payloads and the
//! control messages the coordinator pushes to agents.

pub mod control;
pub mod envelope;
pub mod payload;
pub mod task;

pub use control::{classify_frame, ControlAction, ControlMessage, Frame};
pub use envelope::{Envelope, ErrorReply, RequestKind, TokenGrant, TokenRequest};
pub use payload::{
    decode_envelope, decode_task_request, encode_payload, DecodeError, TaskLogPayload,
    TaskRequest,
};
pub use task::{
    task_file_key, task_file_prefix, task_key, task_prefix, task_id_from_key, TaskLog,
    TaskRecord, TaskStatus, UnknownStatus, SELECTABLE_STATUS,
};
