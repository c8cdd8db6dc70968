//! HTTP surface: the agent WebSocket plus the operator endpoints.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use fleet_common::{ControlMessage, ErrorReply};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::admin::{AdminError, TaskAdmin, TaskAdminRequest};
use crate::dispatch::TaskDispatcher;
use crate::registry::{ConnectionRegistry, RegistryError};
use crate::repository::SqliteRepository;
use crate::session::ws_handler;
use crate::store::{CoordinationStore, TaskStates, WatchKind};
use crate::token::TokenIssuer;

pub const AGENT_PATH: &str = "/wsclient";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub admin: Arc<TaskAdmin>,
    pub issuer: Arc<TokenIssuer>,
    pub repo: Arc<SqliteRepository>,
    pub store: Arc<dyn CoordinationStore>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        repo: Arc<SqliteRepository>,
        issuer: TokenIssuer,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let states = TaskStates::new(store.clone());
        Self {
            dispatcher: Arc::new(TaskDispatcher::new(states.clone(), repo.clone())),
            admin: Arc::new(TaskAdmin::new(states, repo.clone(), registry.clone())),
            issuer: Arc::new(issuer),
            registry,
            repo,
            store,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(AGENT_PATH, get(ws_handler))
        .route("/api/tasks", post(admin_handler))
        .route("/api/clients/:client/control", post(control_handler))
        .with_state(state)
}

fn error_body(status: StatusCode, error: impl ToString) -> (StatusCode, Json<Value>) {
    (status, Json(json!(ErrorReply::new(error.to_string()))))
}

async fn admin_handler(
    State(state): State<AppState>,
    Json(request): Json<TaskAdminRequest>,
) -> (StatusCode, Json<Value>) {
    let option = request.option.clone();
    match state.admin.apply(request).await {
        Ok(record) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "option": option, "task_record": record })),
        ),
        Err(err) => {
            let status = match err {
                AdminError::UnknownOption(_)
                | AdminError::InvalidClient(_)
                | AdminError::MissingTaskId => StatusCode::BAD_REQUEST,
                AdminError::UnknownTask(_) => StatusCode::NOT_FOUND,
                AdminError::AlreadyExists(_) => StatusCode::CONFLICT,
                AdminError::Store(_) | AdminError::Repo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            warn!("Admin {} failed: {}", option, err);
            error_body(status, err)
        }
    }
}

#[derive(Debug, Deserialize)]
struct UnicastRequest {
    task_id: String,
    action: String,
    #[serde(default)]
    crond_expression: Option<String>,
    #[serde(default)]
    script_path: Option<String>,
}

async fn control_handler(
    State(state): State<AppState>,
    Path(client): Path<String>,
    Json(request): Json<UnicastRequest>,
) -> (StatusCode, Json<Value>) {
    let message = ControlMessage {
        action: request.action,
        task_id: request.task_id,
        crond_expression: request.crond_expression,
        script_path: request.script_path,
        ..ControlMessage::default()
    };
    match state.registry.unicast(&client, &message) {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok", "client": client }))),
        Err(err @ RegistryError::NotFound(_)) => error_body(StatusCode::NOT_FOUND, err),
        Err(err) => error_body(StatusCode::BAD_GATEWAY, err),
    }
}

/// Logs every status write under `/tasks/` until the store goes away.
pub async fn watch_task_status(store: Arc<dyn CoordinationStore>) {
    let mut watch = store.watch("/tasks/", WatchKind::Put);
    while let Some(event) = watch.next().await {
        info!(
            key = %event.key,
            "Task status changed to {}",
            event.value.as_deref().unwrap_or("")
        );
    }
}

/// Serves `state` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("fleetd listening on {}", addr);
    }
    tokio::spawn(watch_task_status(state.store.clone()));
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> AppState {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let repo = Arc::new(SqliteRepository::in_memory().unwrap());
        let issuer = TokenIssuer::new("secret", chrono::Duration::hours(1), store.clone());
        AppState::new(store, repo, issuer)
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn admin_create_returns_generated_id() {
        let state = state();
        let (status, body) = post_json(
            router(state.clone()),
            "/api/tasks",
            json!({
                "option": "create",
                "file_id": 3,
                "task_record": {"client_ip": "10.0.0.4", "script_path": "/opt/a.sh", "crond_expression": "* * * * *"}
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let task_id = body["task_record"]["task_id"].as_str().unwrap().to_string();
        assert_eq!(task_id.len(), 4);

        let (status, body) = post_json(
            router(state),
            "/api/tasks",
            json!({"option": "query", "task_record": {"task_id": task_id}}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["task_record"]["script_path"], "/opt/a.sh");
    }

    #[tokio::test]
    async fn admin_rejects_bad_client_and_unicast_needs_session() {
        let state = state();
        let (status, body) = post_json(
            router(state.clone()),
            "/api/tasks",
            json!({"option": "create", "task_record": {"client_ip": "db-01"}}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");

        let (status, _) = post_json(
            router(state),
            "/api/clients/10.0.0.9/control",
            json!({"task_id": "0001", "action": "stop"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
