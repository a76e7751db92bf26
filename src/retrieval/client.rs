//! HTTP client for the managed knowledge base retrieval API.

use crate::aws::{Signer, format_endpoint, service_endpoint, signed_json_post};
use crate::config::Config;
use crate::retrieval::filters::{SemanticFilter, retrieval_configuration};
use crate::retrieval::types::{RetrievalError, RetrievedPassage};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;

/// Source of ranked passages for a query.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Fetch up to ten passages for `query`, narrowed by `filter` when present.
    ///
    /// An empty result is not an error. Transport and permission failures are surfaced
    /// as [`RetrievalError`] without retrying.
    async fn retrieve(
        &self,
        query: &str,
        filter: Option<&SemanticFilter>,
    ) -> Result<Vec<RetrievedPassage>, RetrievalError>;
}

/// Knowledge base client signing each call with SigV4.
pub struct KnowledgeBaseClient {
    client: Client,
    base_url: String,
    knowledge_base_id: String,
    signer: Signer,
}

#[derive(Deserialize)]
struct RetrieveResponse {
    #[serde(rename = "retrievalResults", default)]
    retrieval_results: Vec<RetrievedPassage>,
}

impl KnowledgeBaseClient {
    /// Construct a client from the loaded configuration.
    pub fn new(config: &Config) -> Result<Self, RetrievalError> {
        let client = Client::builder().user_agent("ragstream/0.1").build()?;
        let base_url = service_endpoint(
            config.agent_runtime_endpoint.as_deref(),
            "bedrock-agent-runtime",
            &config.aws_region,
        );
        tracing::debug!(
            url = %base_url,
            knowledge_base_id = %config.knowledge_base_id,
            "Initialized knowledge base client"
        );

        Ok(Self {
            client,
            base_url,
            knowledge_base_id: config.knowledge_base_id.clone(),
            signer: Signer::new(config.credentials.clone(), &config.aws_region, "bedrock"),
        })
    }

    fn retrieve_url(&self) -> Result<Url, RetrievalError> {
        let path = format!(
            "knowledgebases/{}/retrieve",
            urlencoding::encode(&self.knowledge_base_id)
        );
        let endpoint = format_endpoint(&self.base_url, &path);
        Url::parse(&endpoint).map_err(|_| RetrievalError::InvalidEndpoint(endpoint))
    }
}

#[async_trait]
impl Retriever for KnowledgeBaseClient {
    async fn retrieve(
        &self,
        query: &str,
        filter: Option<&SemanticFilter>,
    ) -> Result<Vec<RetrievedPassage>, RetrievalError> {
        let body = json!({
            "retrievalQuery": { "text": query },
            "retrievalConfiguration": retrieval_configuration(filter),
        });

        let response = signed_json_post(
            &self.client,
            &self.signer,
            self.retrieve_url()?,
            body.to_string().into_bytes(),
        )?
        .send()
        .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = RetrievalError::UnexpectedStatus { status, body };
            tracing::error!(error = %error, filtered = filter.is_some(), "Knowledge base retrieval failed");
            return Err(error);
        }

        let RetrieveResponse { retrieval_results } = response.json().await?;
        tracing::debug!(
            passages = retrieval_results.len(),
            filtered = filter.is_some(),
            "Knowledge base retrieval completed"
        );
        Ok(retrieval_results)
    }
}
