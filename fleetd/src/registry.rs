//! Live agent sessions and control-message fan-out.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use fleet_common::ControlMessage;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no live session for {0}")]
    NotFound(String),
    #[error("delivery to {0} failed, session dropped")]
    SendFailed(String),
    #[error("failed to encode control message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Writer side of one agent session plus its bound credentials.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub identity: String,
    pub remote_addr: String,
    pub token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    outbound: mpsc::UnboundedSender<String>,
}

impl SessionHandle {
    pub fn new(
        identity: impl Into<String>,
        remote_addr: impl Into<String>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            remote_addr: remote_addr.into(),
            token: None,
            expires_at: None,
            outbound,
        }
    }

    fn deliver(&self, message: &ControlMessage) -> Result<(), RegistryError> {
        let mut stamped = message.clone();
        stamped.client_ip = self.identity.clone();
        let frame = serde_json::to_string(&stamped)?;
        self.outbound
            .send(frame)
            .map_err(|_| RegistryError::SendFailed(self.identity.clone()))
    }
}

/// Registry keyed by connection. All mutation happens under one lock;
/// sends are non-blocking channel pushes so the lock is never held across
/// socket I/O.
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<ConnectionId, SessionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<ConnectionId, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, handle: SessionHandle) -> ConnectionId {
        let id = Uuid::new_v4();
        debug!("Session {} registered for {}", id, handle.identity);
        self.sessions().insert(id, handle);
        id
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<SessionHandle> {
        self.sessions().remove(id)
    }

    /// Rebinds a session to the identity it declared in its handshake.
    pub fn bind(
        &self,
        id: &ConnectionId,
        identity: &str,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> bool {
        match self.sessions().get_mut(id) {
            Some(handle) => {
                handle.identity = identity.to_string();
                handle.token = Some(token.to_string());
                handle.expires_at = Some(expires_at);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<SessionHandle> {
        self.sessions().get(id).cloned()
    }

    /// Whether any session other than `except` is bound to `identity`.
    pub fn has_other_session(&self, identity: &str, except: &ConnectionId) -> bool {
        self.sessions()
            .iter()
            .any(|(id, handle)| id != except && handle.identity == identity)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    pub fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> =
            self.sessions().values().map(|h| h.identity.clone()).collect();
        identities.sort();
        identities
    }

    /// Sends to the first session whose identity or remote address equals
    /// `target`. A failed write drops that session.
    pub fn unicast(&self, target: &str, message: &ControlMessage) -> Result<(), RegistryError> {
        let mut sessions = self.sessions();
        let found = sessions
            .iter()
            .find(|(_, handle)| handle.identity == target || handle.remote_addr == target)
            .map(|(id, handle)| (*id, handle.clone()));

        let Some((id, handle)) = found else {
            return Err(RegistryError::NotFound(target.to_string()));
        };
        match handle.deliver(message) {
            Err(RegistryError::SendFailed(identity)) => {
                sessions.remove(&id);
                warn!("Dropped session {} ({}) after failed unicast", id, identity);
                Err(RegistryError::SendFailed(identity))
            }
            other => other,
        }
    }

    /// Sends to every session, returning how many deliveries succeeded.
    pub fn broadcast(&self, message: &ControlMessage) -> usize {
        self.broadcast_where(message, |_| true)
    }

    /// Sends to every session matching `filter`, stamping each copy with the
    /// recipient's identity. Sessions whose write fails are removed.
    pub fn broadcast_where<F>(&self, message: &ControlMessage, filter: F) -> usize
    where
        F: Fn(&SessionHandle) -> bool,
    {
        let mut sessions = self.sessions();
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, handle) in sessions.iter().filter(|(_, handle)| filter(handle)) {
            match handle.deliver(message) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!("Broadcast to {} failed: {}", handle.identity, err);
                    if matches!(err, RegistryError::SendFailed(_)) {
                        dead.push(*id);
                    }
                }
            }
        }
        for id in dead {
            sessions.remove(&id);
        }
        delivered
    }
}
