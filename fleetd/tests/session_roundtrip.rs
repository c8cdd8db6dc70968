//! A real agent session against a real coordinator on a loopback port.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_common::{ControlMessage, RequestKind, TaskLogPayload, TaskRecord};
use fleetd::token::token_key;
use fleetd::{serve, AppState, CoordinationStore, MemoryStore, SqliteRepository, TaskStates, TokenIssuer};
use fleetd_agent::{ControlHandler, ReconnectPolicy, RemoteTaskApi, Session, SessionConfig, TaskApi};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

struct Forward(mpsc::UnboundedSender<ControlMessage>);

#[async_trait]
impl ControlHandler for Forward {
    async fn on_control(&self, message: ControlMessage) {
        let _ = self.0.send(message);
    }
}

struct Harness {
    state: AppState,
    session: Session,
    _shutdown: oneshot::Sender<()>,
}

async fn start() -> Harness {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let repo = Arc::new(SqliteRepository::in_memory().unwrap());
    let issuer = TokenIssuer::new("roundtrip-secret", chrono::Duration::hours(1), store.clone());
    let state = AppState::new(store, repo, issuer);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let served = state.clone();
    tokio::spawn(async move {
        serve(listener, served, async {
            let _ = shutdown_rx.await;
        })
        .await
        .unwrap();
    });

    let session = Session::connect(SessionConfig {
        url: format!("ws://{addr}/wsclient"),
        identity: "127.0.0.1".to_string(),
        heartbeat: Duration::from_secs(60),
        reconnect: ReconnectPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(10),
        },
        response_timeout: Duration::from_secs(5),
    })
    .await
    .unwrap();

    Harness {
        state,
        session,
        _shutdown: shutdown_tx,
    }
}

fn record() -> TaskRecord {
    TaskRecord {
        client_ip: "127.0.0.1".into(),
        script_path: "/opt/jobs/backup.sh".into(),
        crond_expression: "0 30 2 * * *".into(),
        remarks: "nightly".into(),
        ..TaskRecord::default()
    }
}

#[tokio::test]
async fn handshake_records_connection() {
    let h = start().await;
    let handshake = h.session.handshake().await;
    assert_eq!(handshake.token.len(), 64);
    assert!(handshake.expires_at > chrono::Utc::now());

    let stored = h.state.repo.connection("127.0.0.1").await.unwrap().unwrap();
    assert_eq!(stored.auth_code, handshake.token);
    let cached = h.state.store.get(&token_key("127.0.0.1")).await.unwrap().unwrap();
    assert!(cached.starts_with(&format!("token:{},", handshake.token)));
}

#[tokio::test]
async fn created_task_reaches_agent_and_is_selectable() {
    let h = start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = h.session.clone();
    tokio::spawn(async move { listener.listen(&Forward(tx)).await });

    let created = h.state.admin.create(record(), 0).await.unwrap();

    let add = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(add.action, "add");
    assert_eq!(add.task_id, created.task_id);
    assert_eq!(add.client_ip, "127.0.0.1");
    assert_eq!(add.crond_expression.as_deref(), Some("0 30 2 * * *"));

    let api = RemoteTaskApi::new(h.session.clone());
    assert_eq!(api.select_tasks().await.unwrap(), vec![created.task_id.clone()]);
    let details = api.query_tasks(&[created.task_id.clone()]).await.unwrap();
    assert_eq!(
        details[&created.task_id].script_path.as_deref(),
        Some("/opt/jobs/backup.sh")
    );

    api.update_status(&created.task_id, "running").await.unwrap();
    let states = TaskStates::new(h.state.store.clone());
    assert_eq!(
        states.status("127.0.0.1", &created.task_id).await.unwrap().as_deref(),
        Some("running")
    );
    assert!(api.select_tasks().await.unwrap().is_empty());

    let log_id = api
        .submit_log(TaskLogPayload {
            task_id: created.task_id.clone(),
            client_ip: "127.0.0.1".into(),
            output: "done".into(),
            success: Some(true),
            exit_code: Some(0),
            ..TaskLogPayload::default()
        })
        .await
        .unwrap();
    assert!(log_id > 0);
    assert_eq!(h.state.repo.count_task_logs().await.unwrap(), 1);
}

#[tokio::test]
async fn unknown_task_type_gets_error_and_changes_nothing() {
    let h = start().await;
    let created = h.state.admin.create(record(), 0).await.unwrap();

    let raw = h
        .session
        .send(
            RequestKind::TaskRequest,
            &json!({ "task_type": "bogus", "request_id": "127.0.0.1", "task_id": created.task_id }),
        )
        .await
        .unwrap();
    let reply: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(reply["status"], "error");

    let states = TaskStates::new(h.state.store.clone());
    assert_eq!(
        states.status("127.0.0.1", &created.task_id).await.unwrap().as_deref(),
        Some("inactive")
    );
    assert_eq!(h.state.repo.count_task_logs().await.unwrap(), 0);
}
