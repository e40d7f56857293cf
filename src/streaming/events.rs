// Notification and connection-state types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Kind of the synthetic notification emitted on every state change
pub const CONNECTION_STATUS_CHANGED: &str = "connection-status-changed";

/// Connection state of an event stream client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    /// Reconnect attempts exhausted. Terminal.
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed view of a notification payload, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NotificationEvent {
    PaymentSuccess(Map<String, Value>),
    StampAdded(Map<String, Value>),
    StampCompleted(Map<String, Value>),
    CouponIssued(Map<String, Value>),
    CouponExpiring(Map<String, Value>),
    ConnectionStatusChanged { state: ConnectionState },
}

/// A notification as delivered to subscribers.
///
/// `payload` is the JSON object exactly as received, `type` included.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl Notification {
    /// Parse a frame body. The body must be a JSON object with a string `type`.
    pub fn from_json(data: &str) -> Result<Self, String> {
        let payload: Value =
            serde_json::from_str(data).map_err(|e| format!("invalid JSON: {}", e))?;

        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing string \"type\" discriminant".to_string())?
            .to_string();

        Ok(Self {
            kind,
            payload,
            received_at: Utc::now(),
        })
    }

    pub(crate) fn connection_status(state: ConnectionState) -> Self {
        Self {
            kind: CONNECTION_STATUS_CHANGED.to_string(),
            payload: json!({ "type": CONNECTION_STATUS_CHANGED, "state": state }),
            received_at: Utc::now(),
        }
    }

    /// Typed view; `None` for kinds this crate does not model
    pub fn event(&self) -> Option<NotificationEvent> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_keeps_exact_payload() {
        let body = r#"{"type":"stamp-added","storeId":12,"stamps":{"count":4,"goal":10},"note":null}"#;
        let notification = Notification::from_json(body).unwrap();

        assert_eq!(notification.kind, "stamp-added");
        assert_eq!(
            notification.payload,
            serde_json::from_str::<Value>(body).unwrap()
        );
    }

    #[test]
    fn test_from_json_rejects_missing_type() {
        assert!(Notification::from_json(r#"{"amount":5}"#).is_err());
        assert!(Notification::from_json(r#"{"type":5}"#).is_err());
        assert!(Notification::from_json("not json").is_err());
        assert!(Notification::from_json("[]").is_err());
    }

    #[test]
    fn test_typed_view() {
        let notification =
            Notification::from_json(r#"{"type":"payment-success","amount":1200}"#).unwrap();
        match notification.event() {
            Some(NotificationEvent::PaymentSuccess(fields)) => {
                assert_eq!(fields["amount"], 1200);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let unknown = Notification::from_json(r#"{"type":"map-pin-moved"}"#).unwrap();
        assert!(unknown.event().is_none());
    }

    #[test]
    fn test_connection_status_notification() {
        let notification = Notification::connection_status(ConnectionState::Failed);
        assert_eq!(notification.kind, CONNECTION_STATUS_CHANGED);
        assert_eq!(notification.payload["state"], "failed");
        assert_eq!(
            notification.event(),
            Some(NotificationEvent::ConnectionStatusChanged {
                state: ConnectionState::Failed
            })
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }
}
