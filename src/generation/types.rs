//! Payload, chunk, and error types for the generative model endpoint.

use super::eventstream::EventStreamError;
use crate::aws::SigningError;
use futures_core::Stream;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised while invoking the model or decoding its stream.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Endpoint URL could not be built.
    #[error("Invalid model endpoint: {0}")]
    InvalidEndpoint(String),
    /// Request signing failed.
    #[error("Failed to sign model request: {0}")]
    Signing(#[from] SigningError),
    /// HTTP layer failed before or while receiving the response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The runtime answered with an unexpected status code.
    #[error("Unexpected model response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the runtime.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// Binary framing of the response stream was invalid.
    #[error("Malformed response stream: {0}")]
    EventStream(#[from] EventStreamError),
    /// A chunk payload could not be decoded.
    #[error("Failed to decode model chunk: {0}")]
    ChunkDecode(String),
    /// The runtime reported an exception inside the stream.
    #[error("{kind}: {message}")]
    ModelException {
        /// Exception type reported by the runtime.
        kind: String,
        /// Human-readable description.
        message: String,
    },
    /// The stream ended in the middle of a frame.
    #[error("Model stream ended mid-message")]
    Truncated,
    /// The caller abandoned the generation.
    #[error("Generation cancelled")]
    Cancelled,
}

/// Incremental event emitted by the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    /// Text appended to the answer.
    TextDelta(String),
    /// Any other event (message start/stop, block boundaries, usage); carries its type.
    Other(String),
}

impl ModelChunk {
    /// Interpret one decoded chunk document.
    pub fn from_json(value: &Value) -> Self {
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        if kind == "content_block_delta" {
            let delta = value.get("delta");
            let delta_kind = delta
                .and_then(|delta| delta.get("type"))
                .and_then(Value::as_str);
            if delta_kind == Some("text_delta") {
                let text = delta
                    .and_then(|delta| delta.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                return Self::TextDelta(text.to_string());
            }
        }
        Self::Other(kind.to_string())
    }
}

/// Stream of decoded chunks for one invocation.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, GenerationError>> + Send>>;

/// Request body for one model invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelPayload {
    /// Version marker required by the runtime.
    pub anthropic_version: String,
    /// Generation cap; longer answers are truncated.
    pub max_tokens: u32,
    /// System instruction with the grounding documents.
    pub system: String,
    /// Conversation turns.
    pub messages: Vec<Message>,
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    /// Speaker role.
    pub role: String,
    /// Content blocks of the turn.
    pub content: Vec<ContentBlock>,
}

/// Typed content block inside a message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// Block text.
        text: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_deltas_are_recognized() {
        let chunk = ModelChunk::from_json(&json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "text_delta", "text": "Hello" }
        }));
        assert_eq!(chunk, ModelChunk::TextDelta("Hello".into()));
    }

    #[test]
    fn other_events_keep_their_type() {
        assert_eq!(
            ModelChunk::from_json(&json!({ "type": "message_stop" })),
            ModelChunk::Other("message_stop".into())
        );
        assert_eq!(
            ModelChunk::from_json(&json!({
                "type": "content_block_delta",
                "delta": { "type": "input_json_delta", "partial_json": "{" }
            })),
            ModelChunk::Other("content_block_delta".into())
        );
    }

    #[test]
    fn payload_serializes_user_turn() {
        let payload = ModelPayload {
            anthropic_version: "bedrock-2023-05-31".into(),
            max_tokens: 1000,
            system: "system".into(),
            messages: vec![Message {
                role: "user".into(),
                content: vec![ContentBlock::Text {
                    text: "question".into(),
                }],
            }],
        };

        assert_eq!(
            serde_json::to_value(&payload).expect("json"),
            json!({
                "anthropic_version": "bedrock-2023-05-31",
                "max_tokens": 1000,
                "system": "system",
                "messages": [
                    { "role": "user", "content": [{ "type": "text", "text": "question" }] }
                ]
            })
        );
    }
}
