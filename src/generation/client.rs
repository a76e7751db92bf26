//! Streaming client for the hosted generative model runtime.

use crate::aws::{Signer, format_endpoint, service_endpoint, signed_json_post};
use crate::config::Config;
use crate::generation::eventstream::{EventMessage, EventStreamDecoder};
use crate::generation::types::{ChunkStream, GenerationError, ModelChunk, ModelPayload};
use async_stream::try_stream;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures_util::StreamExt;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Streams answer chunks from a generative model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Start one streaming invocation.
    ///
    /// The returned stream stops with [`GenerationError::Cancelled`] once `cancel` fires,
    /// which also drops the underlying connection.
    async fn invoke_streaming(
        &self,
        payload: &ModelPayload,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, GenerationError>;
}

/// Runtime client signing each invocation with SigV4.
pub struct BedrockRuntimeClient {
    client: Client,
    base_url: String,
    model_id: String,
    signer: Signer,
}

#[derive(Deserialize)]
struct ChunkEnvelope {
    bytes: String,
}

#[derive(Deserialize, Default)]
struct ExceptionBody {
    #[serde(default, alias = "Message")]
    message: String,
}

impl BedrockRuntimeClient {
    /// Construct a client for the configured model and region.
    pub fn new(config: &Config) -> Result<Self, GenerationError> {
        let client = Client::builder().user_agent("ragstream/0.1").build()?;
        let base_url = service_endpoint(
            config.model_runtime_endpoint.as_deref(),
            "bedrock-runtime",
            &config.model_region,
        );
        tracing::debug!(url = %base_url, model = %config.model_id, "Initialized model runtime client");

        Ok(Self {
            client,
            base_url,
            model_id: config.model_id.clone(),
            signer: Signer::new(config.credentials.clone(), &config.model_region, "bedrock"),
        })
    }

    fn invoke_url(&self) -> Result<Url, GenerationError> {
        let path = format!(
            "model/{}/invoke-with-response-stream",
            urlencoding::encode(&self.model_id)
        );
        let endpoint = format_endpoint(&self.base_url, &path);
        Url::parse(&endpoint).map_err(|_| GenerationError::InvalidEndpoint(endpoint))
    }
}

#[async_trait]
impl ModelClient for BedrockRuntimeClient {
    async fn invoke_streaming(
        &self,
        payload: &ModelPayload,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, GenerationError> {
        let body = serde_json::to_vec(payload)
            .map_err(|error| GenerationError::ChunkDecode(error.to_string()))?;
        let request = signed_json_post(&self.client, &self.signer, self.invoke_url()?, body)?
            .header("accept", "application/vnd.amazon.eventstream")
            .header("x-amzn-bedrock-accept", "application/json");

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(GenerationError::Cancelled),
            response = request.send() => response?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = GenerationError::UnexpectedStatus { status, body };
            tracing::error!(error = %error, model = %self.model_id, "Model invocation failed");
            return Err(error);
        }

        let stream = try_stream! {
            let mut body = Box::pin(response.bytes_stream());
            let mut decoder = EventStreamDecoder::new();

            loop {
                let next = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    item = body.next() => Some(item),
                };
                let Some(item) = next else {
                    Err(GenerationError::Cancelled)?;
                    break;
                };
                let Some(bytes) = item else {
                    break;
                };

                decoder.push(&bytes?);
                while let Some(message) = decoder.next_message()? {
                    if let Some(chunk) = interpret_message(&message)? {
                        yield chunk;
                    }
                }
            }

            if !decoder.is_empty() {
                Err(GenerationError::Truncated)?;
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Turn one framed message into a chunk, an exception, or nothing.
fn interpret_message(message: &EventMessage) -> Result<Option<ModelChunk>, GenerationError> {
    match message.header_str(":message-type") {
        Some("exception") | Some("error") => {
            let kind = message
                .header_str(":exception-type")
                .or_else(|| message.header_str(":error-code"))
                .unwrap_or("UnknownException")
                .to_string();
            let body: ExceptionBody = serde_json::from_slice(&message.payload).unwrap_or_default();
            let message = match message.header_str(":error-message") {
                Some(text) if body.message.is_empty() => text.to_string(),
                _ => body.message,
            };
            tracing::warn!(kind = %kind, message = %message, "Model stream reported an exception");
            Err(GenerationError::ModelException { kind, message })
        }
        _ if message.header_str(":event-type") == Some("chunk") => {
            let envelope: ChunkEnvelope = serde_json::from_slice(&message.payload)
                .map_err(|error| GenerationError::ChunkDecode(error.to_string()))?;
            let decoded = STANDARD
                .decode(envelope.bytes.as_bytes())
                .map_err(|error| GenerationError::ChunkDecode(error.to_string()))?;
            let value: Value = serde_json::from_slice(&decoded)
                .map_err(|error| GenerationError::ChunkDecode(error.to_string()))?;
            Ok(Some(ModelChunk::from_json(&value)))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::generation::eventstream::encode_message;
    use crate::generation::types::{ContentBlock, Message};
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;

    const MODEL_PATH: &str = "/invoke-with-response-stream";

    fn chunk_frame(event: Value) -> Vec<u8> {
        let envelope = json!({ "bytes": STANDARD.encode(event.to_string()) });
        encode_message(
            &[
                (":message-type", "event"),
                (":event-type", "chunk"),
                (":content-type", "application/json"),
            ],
            envelope.to_string().as_bytes(),
        )
    }

    fn text_frame(text: &str) -> Vec<u8> {
        chunk_frame(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "text_delta", "text": text }
        }))
    }

    fn payload() -> ModelPayload {
        ModelPayload {
            anthropic_version: "bedrock-2023-05-31".into(),
            max_tokens: 1000,
            system: "system".into(),
            messages: vec![Message {
                role: "user".into(),
                content: vec![ContentBlock::Text {
                    text: "question".into(),
                }],
            }],
        }
    }

    fn client_for(server: &MockServer) -> BedrockRuntimeClient {
        BedrockRuntimeClient::new(&test_config(Some(server.base_url()))).expect("client")
    }

    async fn collect(stream: ChunkStream) -> Vec<Result<ModelChunk, GenerationError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn invoke_streams_text_deltas_in_order() {
        let server = MockServer::start_async().await;
        let mut body = chunk_frame(json!({ "type": "message_start" }));
        body.extend(text_frame("Employees get "));
        body.extend(text_frame("20 days [^0]"));
        body.extend(chunk_frame(json!({ "type": "message_stop" })));

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path_contains(MODEL_PATH)
                    .header_exists("authorization")
                    .header("x-amzn-bedrock-accept", "application/json")
                    .json_body(serde_json::to_value(payload()).expect("json"));
                then.status(200)
                    .header("content-type", "application/vnd.amazon.eventstream")
                    .body(body);
            })
            .await;

        let stream = client_for(&server)
            .invoke_streaming(&payload(), CancellationToken::new())
            .await
            .expect("stream");
        let chunks: Vec<ModelChunk> = collect(stream)
            .await
            .into_iter()
            .map(|item| item.expect("chunk"))
            .collect();

        mock.assert_async().await;
        assert_eq!(
            chunks,
            vec![
                ModelChunk::Other("message_start".into()),
                ModelChunk::TextDelta("Employees get ".into()),
                ModelChunk::TextDelta("20 days [^0]".into()),
                ModelChunk::Other("message_stop".into()),
            ]
        );
    }

    #[tokio::test]
    async fn exception_frames_become_errors() {
        let server = MockServer::start_async().await;
        let mut body = text_frame("partial");
        body.extend(encode_message(
            &[
                (":message-type", "exception"),
                (":exception-type", "throttlingException"),
            ],
            br#"{"message":"Too many requests"}"#,
        ));
        server
            .mock_async(|when, then| {
                when.method(POST).path_contains(MODEL_PATH);
                then.status(200).body(body);
            })
            .await;

        let stream = client_for(&server)
            .invoke_streaming(&payload(), CancellationToken::new())
            .await
            .expect("stream");
        let items = collect(stream).await;

        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Ok(ModelChunk::TextDelta(text)) if text == "partial"));
        match &items[1] {
            Err(GenerationError::ModelException { kind, message }) => {
                assert_eq!(kind, "throttlingException");
                assert_eq!(message, "Too many requests");
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_body_is_reported() {
        let server = MockServer::start_async().await;
        let frame = text_frame("cut");
        let body = frame[..frame.len() - 3].to_vec();
        server
            .mock_async(|when, then| {
                when.method(POST).path_contains(MODEL_PATH);
                then.status(200).body(body);
            })
            .await;

        let stream = client_for(&server)
            .invoke_streaming(&payload(), CancellationToken::new())
            .await
            .expect("stream");
        let items = collect(stream).await;

        assert!(matches!(items.as_slice(), [Err(GenerationError::Truncated)]));
    }

    #[tokio::test]
    async fn error_status_is_surfaced_before_streaming() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path_contains(MODEL_PATH);
                then.status(400)
                    .json_body(json!({ "message": "Malformed input request" }));
            })
            .await;

        let error = match client_for(&server)
            .invoke_streaming(&payload(), CancellationToken::new())
            .await
        {
            Ok(_) => panic!("expected failure"),
            Err(error) => error,
        };
        assert!(matches!(
            error,
            GenerationError::UnexpectedStatus { status, ref body }
                if status == reqwest::StatusCode::BAD_REQUEST && body.contains("Malformed")
        ));
    }

    #[tokio::test]
    async fn cancelled_stream_stops_with_cancelled() {
        let server = MockServer::start_async().await;
        let mut body = text_frame("one");
        body.extend(text_frame("two"));
        server
            .mock_async(|when, then| {
                when.method(POST).path_contains(MODEL_PATH);
                then.status(200).body(body);
            })
            .await;

        let cancel = CancellationToken::new();
        let stream = client_for(&server)
            .invoke_streaming(&payload(), cancel.clone())
            .await
            .expect("stream");
        cancel.cancel();
        let items = collect(stream).await;

        assert!(matches!(items.as_slice(), [Err(GenerationError::Cancelled)]));
    }
}
