//! fleetd: task coordinator for a fleet of remote agents.
//!
//! Agents hold a WebSocket session to the coordinator, obtain a bearer
//! token, then issue task requests. Operators create and control tasks over
//! HTTP; control frames are fanned out to the live sessions.

pub mod admin;
pub mod config;
pub mod dispatch;
pub mod registry;
pub mod repository;
pub mod server;
pub mod session;
pub mod store;
pub mod token;

pub use admin::{generate_task_code, AdminError, TaskAdmin, TaskAdminRequest, TaskControl};
pub use config::{load_server_config, ServerConfig};
pub use dispatch::{DispatchError, TaskDispatcher};
pub use registry::{ConnectionId, ConnectionRegistry, RegistryError, SessionHandle};
pub use repository::{ConnectionRecord, RepoError, SqliteRepository};
pub use server::{router, serve, AppState, AGENT_PATH};
pub use store::{CoordinationStore, MemoryStore, StoreError, TaskStates, WatchKind};
pub use token::{IssuedToken, TokenError, TokenIssuer};
