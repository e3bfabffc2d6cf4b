//! Request and response messages exchanged over the IPC socket.
//!
//! Both directions are JSON bodies inside length-prefixed frames. The
//! daemon (server) and the CLI (client) share these types.

use std::fmt;

use fanguard_config::{ControlPolicy, ValidationError};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::control::{CommandError, RuntimeSnapshot};

/// Operation requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    /// Latest published snapshot.
    GetState,
    /// Replace the active policy.
    SetPolicy { policy: ControlPolicy },
    /// Current snapshot, then one per published update.
    Subscribe,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::GetState => "get_state",
            Request::SetPolicy { .. } => "set_policy",
            Request::Subscribe => "subscribe",
        }
    }
}

/// A request together with the shared token.
#[derive(Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub token: String,
    pub request: Request,
}

impl RequestFrame {
    pub fn new(token: &str, request: Request) -> Self {
        Self {
            token: token.to_string(),
            request,
        }
    }
}

impl Drop for RequestFrame {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

impl fmt::Debug for RequestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestFrame")
            .field("token", &"[REDACTED]")
            .field("request", &self.request)
            .finish()
    }
}

/// Error categories reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedPolicy,
    UnsafeThreshold,
    Unauthorized,
    Malformed,
    Timeout,
    Busy,
    Storage,
    Unavailable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::MalformedPolicy => "malformed_policy",
            ErrorKind::UnsafeThreshold => "unsafe_threshold",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Busy => "busy",
            ErrorKind::Storage => "storage",
            ErrorKind::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Reply sent by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    StateSnapshot { snapshot: Box<RuntimeSnapshot> },
    Ack,
    Error { error_kind: ErrorKind, message: String },
}

impl Response {
    pub fn error(error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            error_kind,
            message: message.into(),
        }
    }

    pub fn snapshot(snapshot: &RuntimeSnapshot) -> Self {
        Response::StateSnapshot {
            snapshot: Box::new(snapshot.clone()),
        }
    }
}

impl From<&ValidationError> for Response {
    fn from(e: &ValidationError) -> Self {
        let kind = match e {
            ValidationError::MalformedPolicy(_) => ErrorKind::MalformedPolicy,
            ValidationError::UnsafeThreshold(_) => ErrorKind::UnsafeThreshold,
        };
        Response::error(kind, e.to_string())
    }
}

impl From<CommandError> for Response {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Validation(v) => Response::from(&v),
            CommandError::Storage(msg) => {
                Response::error(ErrorKind::Storage, format!("failed to persist policy: {msg}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let frame = RequestFrame::new("tok", Request::GetState);
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"token": "tok", "request": {"kind": "get_state"}})
        );

        let parsed: RequestFrame = serde_json::from_value(json!({
            "token": "t",
            "request": {
                "kind": "set_policy",
                "policy": {
                    "channels": {
                        "cpu": {"base_duty": 30, "bands": [{"rise": 50.0, "fall": 45.0, "duty": 60}]},
                        "gpu": {"base_duty": 30}
                    }
                }
            }
        }))
        .unwrap();
        match &parsed.request {
            Request::SetPolicy { policy } => {
                assert_eq!(policy.channels.cpu.bands.len(), 1);
                assert_eq!(policy.sample_interval_ms, 2000);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result: Result<RequestFrame, _> =
            serde_json::from_value(json!({"token": "t", "request": {"kind": "reboot"}}));
        assert!(result.is_err());
    }

    #[test]
    fn test_response_wire_shape() {
        assert_eq!(
            serde_json::to_value(Response::Ack).unwrap(),
            json!({"kind": "ack"})
        );
        assert_eq!(
            serde_json::to_value(Response::error(ErrorKind::Busy, "queue full")).unwrap(),
            json!({"kind": "error", "error_kind": "busy", "message": "queue full"})
        );
    }

    #[test]
    fn test_frame_debug_hides_token() {
        let frame = RequestFrame::new("hunter2", Request::Subscribe);
        let debug = format!("{frame:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("Subscribe"));
    }

    #[test]
    fn test_command_error_mapping() {
        let r = Response::from(CommandError::Validation(ValidationError::UnsafeThreshold(
            "too hot".into(),
        )));
        assert!(matches!(
            r,
            Response::Error {
                error_kind: ErrorKind::UnsafeThreshold,
                ..
            }
        ));
        let r = Response::from(CommandError::Storage("disk full".into()));
        match r {
            Response::Error {
                error_kind,
                message,
            } => {
                assert_eq!(error_kind, ErrorKind::Storage);
                assert!(message.contains("disk full"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_kind_display_matches_wire() {
        for kind in [ErrorKind::MalformedPolicy, ErrorKind::Unauthorized, ErrorKind::Timeout] {
            let wire = serde_json::to_value(kind).unwrap();
            assert_eq!(wire, json!(kind.to_string()));
        }
    }
}
