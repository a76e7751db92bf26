//! Retrieval-only search: one ranked, deduplicated result set per target.

use crate::metrics::PipelineMetrics;
use crate::pipeline::format::{DisplayDocument, format_display_documents, highest_score_text};
use crate::retrieval::{
    RetrievalError, RetrievalTarget, RetrievedPassage, Retriever, SearchTarget, build_filter,
};
use crate::storage::{StorageError, UrlSigner};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while serving a search.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The knowledge base call failed.
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    /// A download URL could not be issued.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Results for one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionResult {
    /// Section the target named, or empty for an unfiltered search.
    pub section_name: String,
    /// Categories the target named.
    pub categories: Vec<String>,
    /// Deduplicated citations.
    pub documents: Vec<DisplayDocument>,
    /// Content of the best-scoring passage.
    pub highest_score_text: String,
    /// Raw passages, ready to be posted back for generation.
    pub passages: Vec<RetrievedPassage>,
}

/// Runs retrievals for each requested target.
pub struct SearchService {
    retriever: Arc<dyn Retriever>,
    signer: Arc<dyn UrlSigner>,
    metrics: Arc<PipelineMetrics>,
    url_ttl: Duration,
}

impl SearchService {
    /// Assemble the service from its collaborators.
    pub fn new(
        retriever: Arc<dyn Retriever>,
        signer: Arc<dyn UrlSigner>,
        metrics: Arc<PipelineMetrics>,
        url_ttl: Duration,
    ) -> Self {
        Self {
            retriever,
            signer,
            metrics,
            url_ttl,
        }
    }

    /// Search every target in order; an absent or empty target list searches unfiltered.
    ///
    /// The first failing retrieval aborts the whole search.
    pub async fn search(
        &self,
        query: &str,
        target: Option<SearchTarget>,
    ) -> Result<Vec<SectionResult>, SearchError> {
        let mut targets = target.map(SearchTarget::into_targets).unwrap_or_default();
        if targets.is_empty() {
            targets.push(RetrievalTarget::default());
        }

        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let filter = build_filter(&target);
            let passages = self.retriever.retrieve(query, filter.as_ref()).await?;
            let documents = format_display_documents(&passages, self.signer.as_ref(), self.url_ttl)?;

            results.push(SectionResult {
                section_name: target.section_name.unwrap_or_default(),
                categories: target.categories.unwrap_or_default(),
                highest_score_text: highest_score_text(&passages),
                documents,
                passages,
            });
        }

        self.metrics.record_search();
        tracing::info!(sections = results.len(), "Search completed");
        Ok(results)
    }
}
