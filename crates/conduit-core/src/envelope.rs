use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The camelCase SSE/live-bus wire frame, identical to the one written to
/// the render_payload column's envelope view. `kind` is the event_type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "chatId")]
    pub chat_id: Uuid,
    #[serde(rename = "messageId")]
    pub message_id: Uuid,
    #[serde(rename = "streamId")]
    pub stream_id: Uuid,
    pub seq: i64,
    pub kind: String,
    pub payload: Value,
    pub ts: String,
}

impl Envelope {
    pub fn new(
        chat_id: Uuid,
        message_id: Uuid,
        stream_id: Uuid,
        seq: i64,
        kind: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            chat_id,
            message_id,
            stream_id,
            seq,
            kind: kind.into(),
            payload,
            ts: Utc::now().to_rfc3339(),
        }
    }
}
