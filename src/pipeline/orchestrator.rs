//! Drives prompt assembly, model invocation, and section relay for one answer request.

use crate::generation::ModelClient;
use crate::logging;
use crate::metrics::{PipelineMetrics, RequestTelemetry};
use crate::pipeline::events::StreamEvent;
use crate::pipeline::format::format_prompt_documents;
use crate::pipeline::prompt::build_payload;
use crate::pipeline::stream::{SectionProcessor, drive_section};
use crate::retrieval::RetrievedPassage;
use crate::storage::UrlSigner;
use async_stream::stream;
use futures_core::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// A required request field was missing or empty.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Named field is absent or empty.
    #[error("{0} is required")]
    MissingField(&'static str),
    /// A document carries neither passage text nor a source location.
    #[error("{0} has neither content text nor a source location")]
    UngroundedDocument(String),
}

/// One section to answer, grounded on its retrieved passages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionDocuments {
    /// Section label echoed on every event.
    #[serde(default, alias = "section_name")]
    pub section_name: String,
    /// Passages grounding the answer.
    #[serde(default)]
    pub documents: Vec<RetrievedPassage>,
}

/// Validated input for one streamed answer.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    query: String,
    sections: Vec<SectionDocuments>,
}

impl GenerationRequest {
    /// One section, as posted to `/generate`.
    pub fn single(
        query: impl Into<String>,
        section_name: impl Into<String>,
        documents: Vec<RetrievedPassage>,
    ) -> Result<Self, ValidationError> {
        let query = require_query(query.into())?;
        if documents.is_empty() {
            return Err(ValidationError::MissingField("documents"));
        }
        require_grounded(&documents, "documents")?;
        Ok(Self {
            query,
            sections: vec![SectionDocuments {
                section_name: section_name.into(),
                documents,
            }],
        })
    }

    /// Several sections, as posted to the combined endpoint.
    pub fn multi(
        query: impl Into<String>,
        sections: Vec<SectionDocuments>,
    ) -> Result<Self, ValidationError> {
        let query = require_query(query.into())?;
        if sections.is_empty() {
            return Err(ValidationError::MissingField("retrievedResults"));
        }
        for (index, section) in sections.iter().enumerate() {
            require_grounded(
                &section.documents,
                &format!("retrievedResults[{index}].documents"),
            )?;
        }
        Ok(Self { query, sections })
    }

    /// Question text.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Sections in processing order.
    pub fn sections(&self) -> &[SectionDocuments] {
        &self.sections
    }
}

fn require_query(query: String) -> Result<String, ValidationError> {
    if query.trim().is_empty() {
        Err(ValidationError::MissingField("searchText"))
    } else {
        Ok(query)
    }
}

// Display-shaped documents (URL, page, score) deserialize too; they cannot ground an answer.
fn require_grounded(documents: &[RetrievedPassage], field: &str) -> Result<(), ValidationError> {
    match documents.iter().position(|document| !document.is_grounded()) {
        Some(index) => Err(ValidationError::UngroundedDocument(format!("{field}[{index}]"))),
        None => Ok(()),
    }
}

/// Flushes buffered request counters when the outbound stream goes away.
struct FlushOnDrop {
    metrics: Arc<PipelineMetrics>,
    telemetry: RequestTelemetry,
}

impl Drop for FlushOnDrop {
    fn drop(&mut self) {
        self.telemetry.flush(&self.metrics);
    }
}

/// Sequential multi-section answer generator.
pub struct AnswerPipeline {
    model: Arc<dyn ModelClient>,
    signer: Arc<dyn UrlSigner>,
    metrics: Arc<PipelineMetrics>,
    anthropic_version: String,
    url_ttl: Duration,
}

impl AnswerPipeline {
    /// Assemble the pipeline from its collaborators.
    pub fn new(
        model: Arc<dyn ModelClient>,
        signer: Arc<dyn UrlSigner>,
        metrics: Arc<PipelineMetrics>,
        anthropic_version: impl Into<String>,
        url_ttl: Duration,
    ) -> Self {
        Self {
            model,
            signer,
            metrics,
            anthropic_version: anthropic_version.into(),
            url_ttl,
        }
    }

    /// Stream every section's events, one section after another.
    ///
    /// A failing section yields one error event and the next section still runs.
    /// Dropping the returned stream cancels `cancel`, abandoning the in-flight model call.
    pub fn stream(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let model = Arc::clone(&self.model);
        let signer = Arc::clone(&self.signer);
        let metrics = Arc::clone(&self.metrics);
        let version = self.anthropic_version.clone();
        let ttl = self.url_ttl;

        stream! {
            let _cancel_on_drop = cancel.clone().drop_guard();
            let mut flush = FlushOnDrop {
                metrics,
                telemetry: RequestTelemetry::default(),
            };
            let GenerationRequest { query, sections } = request;

            for SectionDocuments { section_name, documents } in sections {
                let span = logging::section_span(&section_name, documents.len());
                span.in_scope(|| tracing::info!("Generating section answer"));
                let prompt = build_payload(&format_prompt_documents(&documents), &query, &version);
                let mut processor = SectionProcessor::new(section_name, documents);

                let payload = match prompt {
                    Ok(payload) => payload,
                    Err(error) => {
                        flush.telemetry.sections_failed += 1;
                        yield processor.fail(error);
                        continue;
                    }
                };
                let invocation = model.invoke_streaming(&payload, cancel.clone());
                let chunks = match invocation.instrument(span.clone()).await {
                    Ok(chunks) => chunks,
                    Err(error) => {
                        flush.telemetry.sections_failed += 1;
                        yield processor.fail(error);
                        continue;
                    }
                };

                let mut failed = false;
                let mut events = Box::pin(drive_section(processor, chunks, Arc::clone(&signer), ttl));
                while let Some(event) = events.next().instrument(span.clone()).await {
                    match &event {
                        StreamEvent::ResultText { .. } => flush.telemetry.deltas_relayed += 1,
                        StreamEvent::Documents { .. } => flush.telemetry.documents_emitted += 1,
                        StreamEvent::Error { .. } => failed = true,
                    }
                    yield event;
                }

                if failed {
                    flush.telemetry.sections_failed += 1;
                } else {
                    flush.telemetry.sections_streamed += 1;
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{ScriptedModel, text};
    use super::*;
    use crate::generation::{ContentBlock, GenerationError};
    use crate::pipeline::format::test_support::{CountingSigner, passage};

    fn pipeline(model: Arc<ScriptedModel>, metrics: Arc<PipelineMetrics>) -> AnswerPipeline {
        AnswerPipeline::new(
            model,
            Arc::new(CountingSigner::default()),
            metrics,
            "bedrock-2023-05-31",
            Duration::from_secs(3600),
        )
    }

    fn section(name: &str, uri: &str) -> SectionDocuments {
        SectionDocuments {
            section_name: name.into(),
            documents: vec![passage(uri, Some(1), Some(0.8), "grounding")],
        }
    }

    fn section_of(event: &StreamEvent) -> Option<&str> {
        match event {
            StreamEvent::ResultText { section_name, .. }
            | StreamEvent::Documents { section_name, .. } => Some(section_name),
            StreamEvent::Error { .. } => None,
        }
    }

    #[test]
    fn validation_rejects_missing_fields() {
        let documents = vec![passage("s3://docs/a.pdf", Some(1), None, "a")];
        assert_eq!(
            GenerationRequest::single("", "HR", documents.clone()),
            Err(ValidationError::MissingField("searchText"))
        );
        assert_eq!(
            GenerationRequest::single("   ", "HR", Vec::new()),
            Err(ValidationError::MissingField("searchText"))
        );
        assert_eq!(
            GenerationRequest::single("q", "HR", Vec::new()),
            Err(ValidationError::MissingField("documents"))
        );
        assert_eq!(
            GenerationRequest::multi("q", Vec::new()),
            Err(ValidationError::MissingField("retrievedResults"))
        );
        assert_eq!(
            ValidationError::MissingField("searchText").to_string(),
            "searchText is required"
        );
    }

    #[test]
    fn validation_rejects_documents_without_content_or_location() {
        let display_shaped: RetrievedPassage = serde_json::from_value(serde_json::json!({
            "documentUrl": "https://signed.test/docs/a.pdf",
            "pageNumber": 1,
            "score": 0.5
        }))
        .expect("any object deserializes");
        let grounded = passage("s3://docs/a.pdf", Some(1), None, "a");

        assert_eq!(
            GenerationRequest::single("q", "HR", vec![grounded.clone(), display_shaped.clone()]),
            Err(ValidationError::UngroundedDocument("documents[1]".into()))
        );
        assert_eq!(
            GenerationRequest::multi(
                "q",
                vec![
                    section("HR", "s3://docs/hr.pdf"),
                    SectionDocuments {
                        section_name: "Finance".into(),
                        documents: vec![display_shaped],
                    },
                ]
            ),
            Err(ValidationError::UngroundedDocument(
                "retrievedResults[1].documents[0]".into()
            ))
        );
        assert!(GenerationRequest::single("q", "HR", vec![grounded]).is_ok());
    }

    #[tokio::test]
    async fn sections_run_strictly_in_order() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(vec![text("HR answer "), text("[^0]")]),
            Ok(vec![text("Finance answer")]),
        ]));
        let metrics = Arc::new(PipelineMetrics::new());
        let request = GenerationRequest::multi(
            "vacation policy",
            vec![section("HR", "s3://docs/hr.pdf"), section("Finance", "s3://docs/fin.pdf")],
        )
        .expect("request");

        let pipeline = pipeline(model.clone(), metrics.clone());
        let mut events = Box::pin(pipeline.stream(request, CancellationToken::new()));

        let first = events.next().await.expect("first event");
        assert_eq!(section_of(&first), Some("HR"));
        assert_eq!(model.calls(), 1);

        let mut rest = Vec::new();
        while let Some(event) = events.next().await {
            rest.push(event);
        }
        let order: Vec<Option<&str>> = rest.iter().map(section_of).collect();
        assert_eq!(order, vec![Some("HR"), Some("HR"), Some("Finance")]);
        assert!(matches!(rest[1], StreamEvent::Documents { .. }));
        assert_eq!(model.calls(), 2);

        let payloads = model.payloads.lock().expect("lock");
        assert_eq!(
            payloads[1].messages[0].content,
            vec![ContentBlock::Text {
                text: "vacation policy".into()
            }]
        );
        assert!(payloads[1].system.contains("s3://docs/fin.pdf"));
        drop(payloads);

        drop(events);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.generation_requests, 1);
        assert_eq!(snapshot.sections_streamed, 2);
        assert_eq!(snapshot.documents_emitted, 1);
    }

    #[tokio::test]
    async fn failing_section_does_not_abort_siblings() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(GenerationError::UnexpectedStatus {
                status: reqwest::StatusCode::TOO_MANY_REQUESTS,
                body: "throttled".into(),
            }),
            Ok(vec![text("second"), Err(GenerationError::Truncated)]),
            Ok(vec![text("third")]),
        ]));
        let metrics = Arc::new(PipelineMetrics::new());
        let request = GenerationRequest::multi(
            "q",
            vec![
                section("A", "s3://docs/a.pdf"),
                section("B", "s3://docs/b.pdf"),
                section("C", "s3://docs/c.pdf"),
            ],
        )
        .expect("request");

        let events: Vec<StreamEvent> = pipeline(model.clone(), metrics.clone())
            .stream(request, CancellationToken::new())
            .collect()
            .await;

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], StreamEvent::Error { content } if content.contains("throttled")));
        assert_eq!(section_of(&events[1]), Some("B"));
        assert!(matches!(&events[2], StreamEvent::Error { content } if content == "Model stream ended mid-message"));
        assert_eq!(section_of(&events[3]), Some("C"));
        assert_eq!(model.calls(), 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sections_failed, 2);
        assert_eq!(snapshot.sections_streamed, 1);
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_token() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(vec![text("a"), text("b")])]));
        let request = GenerationRequest::single(
            "q",
            "HR",
            vec![passage("s3://docs/a.pdf", Some(1), None, "a")],
        )
        .expect("request");
        let cancel = CancellationToken::new();

        let pipeline = pipeline(model, Arc::new(PipelineMetrics::new()));
        let mut events = Box::pin(pipeline.stream(request, cancel.clone()));
        events.next().await.expect("first event");
        assert!(!cancel.is_cancelled());

        drop(events);
        assert!(cancel.is_cancelled());
    }
}
