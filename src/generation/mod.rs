//! Generative model invocation: request payloads, response framing, and the runtime client.

pub mod client;
pub mod eventstream;
pub mod types;

pub use client::{BedrockRuntimeClient, ModelClient};
pub use eventstream::{EventMessage, EventStreamDecoder, EventStreamError, HeaderValue};
pub use types::{ChunkStream, ContentBlock, GenerationError, Message, ModelChunk, ModelPayload};
