use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// ID 0 is never assigned to a call; it marks an outgoing notification.
pub const NOTIFICATION_ID: u64 = 0;

/// Outgoing call (or notification) as written to the wire
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutgoingCall {
    /// Omitted from the wire when zero
    #[serde(skip_serializing_if = "is_notification_id")]
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl OutgoingCall {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self::new(NOTIFICATION_ID, method, params)
    }

    pub fn is_notification(&self) -> bool {
        is_notification_id(&self.id)
    }
}

fn is_notification_id(id: &u64) -> bool {
    *id == NOTIFICATION_ID
}

/// One decoded inbound line, before classification
///
/// Unknown fields (`jsonrpc`, `error`, ...) are ignored.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: Option<u64>,

    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub params: Value,

    /// `Some` whenever the key is present, including `"result": null`
    #[serde(default, deserialize_with = "deserialize_present")]
    pub result: Option<Value>,
}

fn deserialize_present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Inbound message after response/notification discrimination
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    Response { id: u64, result: Value },
    Notification { method: String, params: Value },
    /// Neither a result nor a method (e.g. a JSON-RPC `error` reply)
    Unroutable { id: Option<u64> },
}

impl InboundMessage {
    pub fn is_response(&self) -> bool {
        self.result.is_some()
    }

    /// Split into a response or a notification.
    ///
    /// A response without an `id` is kept with ID 0, which never matches a
    /// pending call. A message with no `result` and no non-empty `method`
    /// cannot be routed anywhere and is dropped by the reader.
    pub fn classify(self) -> InboundPayload {
        if let Some(result) = self.result {
            return InboundPayload::Response {
                id: self.id.unwrap_or(NOTIFICATION_ID),
                result,
            };
        }

        match self.method {
            Some(method) if !method.is_empty() => InboundPayload::Notification {
                method,
                params: self.params,
            },
            _ => InboundPayload::Unroutable { id: self.id },
        }
    }
}
