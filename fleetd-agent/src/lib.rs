//! fleetd-agent: runs on every managed host.
//!
//! The agent keeps one session to the coordinator, seeds its task table from
//! `select`, schedules each task's script on its cron expression and reports
//! every run back. Directed `add`/`stop` frames change the schedule live.

pub mod api;
pub mod backoff;
pub mod config;
pub mod control;
pub mod executor;
pub mod scheduler;
pub mod session;
pub mod task_manager;
pub mod transport;

#[cfg(test)]
mod testing;

pub use api::{ApiError, RemoteTaskApi, TaskApi, TaskDetails};
pub use backoff::{retry_with_backoff, ReconnectPolicy, RetryExhausted};
pub use config::AgentConfig;
pub use control::AgentControl;
pub use executor::{
    interpreter_for, ExecutionReport, Executor, ExecutorConfig, HostOs, Invocation, RunOutcome,
};
pub use scheduler::{parse_cron, ScheduledTask, Scheduler, SchedulerError};
pub use session::{connect, ControlHandler, Handshake, Session, SessionConfig, SessionError};
pub use task_manager::{LocalTask, TaskManager};
pub use transport::{FileTransport, HttpTransport, TransportError};
