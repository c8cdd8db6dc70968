//! Client half of the agent session.
//!
//! One background reader per link owns the socket's receive side and routes
//! every inbound frame: directed control messages go to the listener, the
//! response to an in-flight [`Session::send`] goes to its waiter, anything
//! else goes to the listener as a general frame. Writers share the send
//! side under a mutex.
//!
//! Each successful (re)connect bumps the link generation. Reconnects are
//! serialized and keyed on the generation a caller observed, so concurrent
//! failures of the same link produce exactly one reconnect. Responses read
//! from a replaced link never reach a waiter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_common::{
    classify_frame, encode_payload, ControlMessage, Envelope, Frame, RequestKind, TokenGrant,
    TokenRequest,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::backoff::{retry_with_backoff, ReconnectPolicy};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("write failed: {0}")]
    Write(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("reconnect gave up after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: String },
    #[error("session closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    pub identity: String,
    pub heartbeat: Duration,
    pub reconnect: ReconnectPolicy,
    pub response_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub server_version: Option<String>,
}

/// Opens a transport to `url` and performs the token handshake.
pub async fn connect(url: &str, identity: &str) -> Result<(WsStream, Handshake), SessionError> {
    let (mut ws, _) = connect_async(url)
        .await
        .map_err(|err| SessionError::Connect {
            url: url.to_string(),
            reason: err.to_string(),
        })?;

    let request = serde_json::to_string(&TokenRequest::new(identity))
        .map_err(SessionError::Encode)?;
    ws.send(Message::Text(request))
        .await
        .map_err(|err| SessionError::Handshake(format!("token request not sent: {err}")))?;

    let reply = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Binary(bytes))) => {
                break String::from_utf8(bytes)
                    .map_err(|_| SessionError::Handshake("binary token reply".to_string()))?
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(SessionError::Handshake("closed before token reply".to_string()))
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(SessionError::Read(err.to_string())),
        }
    };

    let grant: TokenGrant = serde_json::from_str(&reply)
        .map_err(|err| SessionError::Handshake(format!("unexpected token reply '{reply}': {err}")))?;
    let expires_at = grant.expiry().map_err(|err| {
        SessionError::Handshake(format!("invalid expiry '{}': {err}", grant.expires_at))
    })?;
    debug!("Token received, expires at {}", expires_at);

    Ok((
        ws,
        Handshake {
            token: grant.token,
            expires_at,
            server_version: grant.server_version,
        },
    ))
}

/// Receives inbound frames that are not responses to [`Session::send`].
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn on_control(&self, message: ControlMessage);

    fn on_general(&self, frame: Value) {
        debug!("Unrouted frame: {}", frame);
    }
}

enum Inbound {
    Directed(ControlMessage),
    General(Value),
    Closed,
}

type Waiter = oneshot::Sender<Result<String, SessionError>>;

struct Link {
    sink: WsSink,
    handshake: Handshake,
}

struct RouteState {
    generation: u64,
    waiter: Option<Waiter>,
}

struct Inner {
    config: SessionConfig,
    link: tokio::sync::Mutex<Link>,
    route: Mutex<RouteState>,
    request_lock: tokio::sync::Mutex<()>,
    reconnect_lock: tokio::sync::Mutex<()>,
    closing: AtomicBool,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Connects, performs the handshake and starts the reader.
    pub async fn connect(config: SessionConfig) -> Result<Self, SessionError> {
        let (ws, handshake) = connect(&config.url, &config.identity).await?;
        info!(
            "Connected to {} as {} (server {})",
            config.url,
            config.identity,
            handshake.server_version.as_deref().unwrap_or("unknown")
        );
        let (sink, source) = ws.split();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let session = Self {
            inner: Arc::new(Inner {
                config,
                link: tokio::sync::Mutex::new(Link { sink, handshake }),
                route: Mutex::new(RouteState {
                    generation: 1,
                    waiter: None,
                }),
                request_lock: tokio::sync::Mutex::new(()),
                reconnect_lock: tokio::sync::Mutex::new(()),
                closing: AtomicBool::new(false),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
            }),
        };
        session.spawn_reader(source, 1);
        Ok(session)
    }

    fn route(&self) -> MutexGuard<'_, RouteState> {
        self.inner.route.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn identity(&self) -> &str {
        &self.inner.config.identity
    }

    pub fn generation(&self) -> u64 {
        self.route().generation
    }

    pub async fn handshake(&self) -> Handshake {
        self.inner.link.lock().await.handshake.clone()
    }

    /// Sends one request and waits for its response frame.
    ///
    /// A failed write triggers one reconnect and one retry. A failed read is
    /// returned as is. On a timeout the link is replaced before returning,
    /// since a response that is merely late would otherwise answer the next
    /// request.
    pub async fn send<T: Serialize>(&self, kind: RequestKind, payload: &T) -> Result<String, SessionError> {
        let msg = encode_payload(payload).map_err(SessionError::Encode)?;
        let _request = self.inner.request_lock.lock().await;

        let observed = self.generation();
        let mut response = self.arm_waiter();
        match self.write_envelope(kind, &msg).await {
            Ok(()) => {}
            Err(SessionError::Write(reason)) => {
                warn!("Failed to send {} request: {}, reconnecting", kind.as_str(), reason);
                self.reconnect_from(observed).await?;
                response = self.arm_waiter();
                if let Err(err) = self.write_envelope(kind, &msg).await {
                    self.disarm_waiter();
                    return Err(err);
                }
            }
            Err(err) => {
                self.disarm_waiter();
                return Err(err);
            }
        }

        let limit = self.inner.config.response_timeout;
        match timeout(limit, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Read("response channel dropped".to_string())),
            Err(_) => {
                self.disarm_waiter();
                if !self.is_closing() {
                    warn!("No {} response within {:?}, replacing link", kind.as_str(), limit);
                    if let Err(err) = self.reconnect_from(observed).await {
                        warn!("Failed to replace link after timeout: {}", err);
                    }
                }
                Err(SessionError::Timeout(limit))
            }
        }
    }

    fn arm_waiter(&self) -> oneshot::Receiver<Result<String, SessionError>> {
        let (tx, rx) = oneshot::channel();
        self.route().waiter = Some(tx);
        rx
    }

    fn disarm_waiter(&self) {
        self.route().waiter = None;
    }

    async fn write_envelope(&self, kind: RequestKind, msg: &str) -> Result<(), SessionError> {
        let mut link = self.inner.link.lock().await;
        let envelope = Envelope::new(link.handshake.token.clone(), kind, msg);
        let frame = serde_json::to_string(&envelope).map_err(SessionError::Encode)?;
        link.sink
            .send(Message::Text(frame))
            .await
            .map_err(|err| SessionError::Write(err.to_string()))
    }

    async fn ping(&self) -> Result<(), SessionError> {
        let mut link = self.inner.link.lock().await;
        link.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|err| SessionError::Write(err.to_string()))
    }

    /// Replaces the link unless someone already replaced generation
    /// `observed`.
    async fn reconnect_from(&self, observed: u64) -> Result<(), SessionError> {
        let _guard = self.inner.reconnect_lock.lock().await;
        if self.is_closing() {
            return Err(SessionError::Closed);
        }
        if self.generation() != observed {
            debug!("Link {} already replaced", observed);
            return Ok(());
        }

        let config = &self.inner.config;
        let (ws, handshake) = retry_with_backoff(config.reconnect, |attempt| {
            info!("Reconnect attempt {} to {}", attempt, config.url);
            connect(&config.url, &config.identity)
        })
        .await
        .map_err(|exhausted| SessionError::ReconnectExhausted {
            attempts: exhausted.attempts,
            last: exhausted.last.to_string(),
        })?;

        let (sink, source) = ws.split();
        {
            let mut link = self.inner.link.lock().await;
            let _ = link.sink.close().await;
            *link = Link { sink, handshake };
        }
        let generation = {
            let mut route = self.route();
            route.generation += 1;
            if let Some(waiter) = route.waiter.take() {
                let _ = waiter.send(Err(SessionError::Read("connection replaced".to_string())));
            }
            route.generation
        };
        self.spawn_reader(source, generation);
        info!("Reconnection successful (link {})", generation);
        Ok(())
    }

    fn spawn_reader(&self, mut source: WsSource, generation: u64) {
        let session = self.clone();
        tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => session.deliver(text, generation),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => session.deliver(text, generation),
                        Err(_) => warn!("Dropping non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break "closed by server".to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => break err.to_string(),
                }
            };
            session.link_lost(generation, reason).await;
        });
    }

    /// Waiter for a response read on link `generation`, if that link is
    /// still current.
    fn take_waiter(&self, generation: u64) -> Option<Waiter> {
        let mut route = self.route();
        if route.generation != generation {
            debug!("Dropping response from replaced link {}", generation);
            return None;
        }
        route.waiter.take()
    }

    fn deliver(&self, text: String, generation: u64) {
        match classify_frame(&text, self.identity()) {
            Ok(Frame::Directed(message)) => {
                debug!("Directed {} for task {}", message.action, message.task_id);
                let _ = self.inner.inbound_tx.send(Inbound::Directed(message));
            }
            Ok(Frame::General(value)) => {
                let waiter = self.take_waiter(generation);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(text));
                    }
                    None => {
                        let _ = self.inner.inbound_tx.send(Inbound::General(value));
                    }
                }
            }
            Err(err) => {
                let waiter = self.take_waiter(generation);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(text));
                    }
                    None => warn!("Dropping unparsable frame: {}", err),
                }
            }
        }
    }

    async fn link_lost(&self, generation: u64, reason: String) {
        {
            let mut route = self.route();
            if route.generation != generation {
                return;
            }
            if self.is_closing() {
                route.waiter = None;
                drop(route);
                let _ = self.inner.inbound_tx.send(Inbound::Closed);
                return;
            }
            if let Some(waiter) = route.waiter.take() {
                let _ = waiter.send(Err(SessionError::Read(reason.clone())));
            }
        }
        warn!("Failed to read from server: {}, attempting to reconnect", reason);
        if let Err(err) = self.reconnect_from(generation).await {
            error!("Session lost: {}", err);
            let _ = self.inner.inbound_tx.send(Inbound::Closed);
        }
    }

    /// Pings every heartbeat period; a failed ping triggers a reconnect.
    /// Returns once reconnects are exhausted.
    pub async fn heartbeat(&self) {
        let mut ticker = interval(self.inner.config.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.is_closing() {
                return;
            }
            let observed = self.generation();
            if let Err(err) = self.ping().await {
                warn!("Heartbeat failed: {}, reconnecting", err);
                if let Err(err) = self.reconnect_from(observed).await {
                    error!("Heartbeat stopped: {}", err);
                    return;
                }
            }
        }
    }

    pub fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move { session.heartbeat().await })
    }

    /// Feeds inbound frames to `handler` until the session is lost.
    /// Only the first caller receives frames.
    pub async fn listen<H: ControlHandler + ?Sized>(&self, handler: &H) {
        let receiver = self
            .inner
            .inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut receiver) = receiver else {
            warn!("Session already has a listener");
            return;
        };

        while let Some(inbound) = receiver.recv().await {
            match inbound {
                Inbound::Directed(message) => handler.on_control(message).await,
                Inbound::General(frame) => handler.on_general(frame),
                Inbound::Closed => {
                    warn!("Listener stopping: session closed");
                    break;
                }
            }
        }
    }

    fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Sends a close frame on the current link and stops reconnecting.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.inner.closing.store(true, Ordering::SeqCst);
        let mut link = self.inner.link.lock().await;
        link.sink
            .close()
            .await
            .map_err(|err| SessionError::Write(err.to_string()))
    }
}
