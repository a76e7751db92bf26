//! Wires collaborators into the search and answer services shared by the HTTP layer.

use crate::config::Config;
use crate::generation::{BedrockRuntimeClient, GenerationError, ModelClient};
use crate::metrics::PipelineMetrics;
use crate::pipeline::orchestrator::AnswerPipeline;
use crate::pipeline::search::SearchService;
use crate::retrieval::{KnowledgeBaseClient, RetrievalError, Retriever};
use crate::storage::{S3UrlSigner, UrlSigner};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while constructing the service.
#[derive(Debug, Error)]
pub enum InitError {
    /// Retrieval client construction failed.
    #[error("Failed to initialize retrieval client: {0}")]
    Retrieval(#[from] RetrievalError),
    /// Model client construction failed.
    #[error("Failed to initialize model client: {0}")]
    Generation(#[from] GenerationError),
}

/// Settings that shape responses rather than collaborators.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Version marker embedded in model payloads.
    pub anthropic_version: String,
    /// Validity of issued download URLs.
    pub url_ttl: Duration,
    /// Value of `Access-Control-Allow-Origin`.
    pub allow_origin: String,
}

impl ServiceSettings {
    /// Extract settings from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            anthropic_version: config.anthropic_version.clone(),
            url_ttl: Duration::from_secs(config.signed_url_ttl_secs),
            allow_origin: config.allow_origin.clone(),
        }
    }
}

/// Search and answer services plus the counters they share.
pub struct RagService {
    search: SearchService,
    answers: AnswerPipeline,
    metrics: Arc<PipelineMetrics>,
    allow_origin: String,
}

impl RagService {
    /// Build the service with the AWS-backed collaborators described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, InitError> {
        let retriever = Arc::new(KnowledgeBaseClient::new(config)?);
        let model = Arc::new(BedrockRuntimeClient::new(config)?);
        let signer = Arc::new(S3UrlSigner::new(config));
        Ok(Self::new(
            retriever,
            model,
            signer,
            ServiceSettings::from_config(config),
        ))
    }

    /// Build the service from explicit collaborators.
    pub fn new(
        retriever: Arc<dyn Retriever>,
        model: Arc<dyn ModelClient>,
        signer: Arc<dyn UrlSigner>,
        settings: ServiceSettings,
    ) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        Self {
            search: SearchService::new(
                retriever,
                Arc::clone(&signer),
                Arc::clone(&metrics),
                settings.url_ttl,
            ),
            answers: AnswerPipeline::new(
                model,
                signer,
                Arc::clone(&metrics),
                settings.anthropic_version,
                settings.url_ttl,
            ),
            metrics,
            allow_origin: settings.allow_origin,
        }
    }

    /// Retrieval-only search service.
    pub fn search(&self) -> &SearchService {
        &self.search
    }

    /// Streaming answer pipeline.
    pub fn answers(&self) -> &AnswerPipeline {
        &self.answers
    }

    /// Shared counters.
    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Origin allowed by CORS responses.
    pub fn allow_origin(&self) -> &str {
        &self.allow_origin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    #[test]
    fn from_config_builds_aws_collaborators() {
        let config = test_config(Some("http://127.0.0.1:9".into()));
        let service = RagService::from_config(&config).expect("service");

        assert_eq!(service.allow_origin(), "*");
        assert_eq!(service.metrics().snapshot().searches_served, 0);
    }

    #[test]
    fn settings_follow_config() {
        let mut config = test_config(None);
        config.signed_url_ttl_secs = 120;
        config.allow_origin = "https://app.example.com".into();

        let settings = ServiceSettings::from_config(&config);

        assert_eq!(settings.url_ttl, Duration::from_secs(120));
        assert_eq!(settings.allow_origin, "https://app.example.com");
        assert_eq!(settings.anthropic_version, "bedrock-2023-05-31");
    }
}
