//! Outer frames of the agent/coordinator socket.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of request kinds an agent may put in an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    RequestToken,
    Ping,
    TaskRequest,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::RequestToken => "request_token",
            RequestKind::Ping => "ping",
            RequestKind::TaskRequest => "task_request",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "request_token" => Some(RequestKind::RequestToken),
            "ping" => Some(RequestKind::Ping),
            "task_request" => Some(RequestKind::TaskRequest),
            _ => None,
        }
    }
}

/// Authenticated request frame: `{"Token", "type", "Msg"}`.
///
/// `msg` holds the JSON string literal produced by
/// [`encode_payload`](crate::payload::encode_payload), quotes included.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    #[serde(rename = "Token", default)]
    pub token: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "Msg", default)]
    pub msg: String,
}

impl Envelope {
    pub fn new(token: impl Into<String>, kind: RequestKind, msg: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            kind: kind.as_str().to_string(),
            msg: msg.into(),
        }
    }

    pub fn request_kind(&self) -> Option<RequestKind> {
        RequestKind::parse(&self.kind)
    }
}

/// First frame sent on a fresh connection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TokenRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub client_ip: String,
}

impl TokenRequest {
    pub fn new(client_ip: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::RequestToken.as_str().to_string(),
            client_ip: client_ip.into(),
        }
    }
}

/// Coordinator answer to a [`TokenRequest`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TokenGrant {
    #[serde(rename = "Token")]
    pub token: String,
    /// RFC 3339 timestamp.
    #[serde(rename = "ExpiresAt")]
    pub expires_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
}

impl TokenGrant {
    pub fn new(
        token: impl Into<String>,
        expires_at: DateTime<Utc>,
        server_version: Option<String>,
    ) -> Self {
        Self {
            token: token.into(),
            expires_at: expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            server_version,
        }
    }

    pub fn expiry(&self) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(&self.expires_at).map(|ts| ts.with_timezone(&Utc))
    }
}

/// Body of every rejected request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ErrorReply {
    pub status: String,
    pub error: String,
}

impl ErrorReply {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn envelope_uses_wire_field_names() {
        let envelope = Envelope::new("tok", RequestKind::TaskRequest, "\"e30=\"");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["Token"], "tok");
        assert_eq!(value["type"], "task_request");
        assert_eq!(value["Msg"], "\"e30=\"");
        assert_eq!(envelope.request_kind(), Some(RequestKind::TaskRequest));
    }

    #[test]
    fn token_grant_expiry_parses_back() {
        let expires = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let grant = TokenGrant::new("abc", expires, None);
        assert_eq!(grant.expires_at, "2026-05-01T12:00:00Z");
        assert_eq!(grant.expiry().unwrap(), expires);

        let json = serde_json::to_string(&grant).unwrap();
        assert!(!json.contains("server_version"));
    }

    #[test]
    fn unknown_request_kind_is_rejected() {
        assert_eq!(RequestKind::parse("request_token"), Some(RequestKind::RequestToken));
        assert_eq!(RequestKind::parse("shutdown"), None);
    }
}
