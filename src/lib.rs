#![deny(missing_docs)]

//! Core library for the retrieval-augmented answer streaming service.

/// HTTP routing and request handlers.
pub mod api;
/// AWS request signing helpers.
pub mod aws;
/// Environment-driven configuration management.
pub mod config;
/// Generative model payloads and the streaming runtime client.
pub mod generation;
/// Structured logging and tracing setup.
pub mod logging;
/// Pipeline counters and per-request telemetry.
pub mod metrics;
/// Search and answer orchestration.
pub mod pipeline;
/// Knowledge base retrieval client and filters.
pub mod retrieval;
/// Object store download URLs.
pub mod storage;
