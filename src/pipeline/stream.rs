//! Per-section relay of model output with post-answer citation scanning.

use crate::generation::{ChunkStream, ModelChunk};
use crate::pipeline::events::StreamEvent;
use crate::pipeline::format::format_display_documents;
use crate::retrieval::RetrievedPassage;
use crate::storage::UrlSigner;
use async_stream::stream;
use futures_core::Stream;
use futures_util::StreamExt;
use regex::Regex;
use std::fmt::Display;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

static CITATION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\^(\d+)\]").expect("citation pattern is valid"));

/// Lifecycle of one section's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionState {
    /// Relaying text deltas as they arrive.
    Streaming,
    /// Model output exhausted; looking for citation markers.
    CitationScan,
    /// Finished successfully.
    Done,
    /// Failed; an error event was emitted.
    Errored,
}

/// Accumulates one section's answer and decides which citations to emit.
#[derive(Debug)]
pub struct SectionProcessor {
    section_name: String,
    passages: Vec<RetrievedPassage>,
    answer: String,
    state: SectionState,
}

impl SectionProcessor {
    /// Start processing a section grounded on `passages`.
    pub fn new(section_name: impl Into<String>, passages: Vec<RetrievedPassage>) -> Self {
        Self {
            section_name: section_name.into(),
            passages,
            answer: String::new(),
            state: SectionState::Streaming,
        }
    }

    /// Current state.
    pub fn state(&self) -> SectionState {
        self.state
    }

    /// Answer text accumulated so far.
    pub fn answer(&self) -> &str {
        &self.answer
    }

    /// Consume one model chunk, returning the delta event for text chunks.
    pub fn accept(&mut self, chunk: ModelChunk) -> Option<StreamEvent> {
        if self.state != SectionState::Streaming {
            return None;
        }
        match chunk {
            ModelChunk::TextDelta(text) => {
                self.answer.push_str(&text);
                Some(StreamEvent::ResultText {
                    section_name: self.section_name.clone(),
                    content: text,
                })
            }
            ModelChunk::Other(_) => None,
        }
    }

    /// Close the model stream and emit citations if the answer cites any source.
    pub fn finish(&mut self, signer: &dyn UrlSigner, ttl: Duration) -> Vec<StreamEvent> {
        if self.state != SectionState::Streaming {
            return Vec::new();
        }
        self.state = SectionState::CitationScan;

        if cited_source_ids(&self.answer).is_empty() {
            self.state = SectionState::Done;
            return Vec::new();
        }

        match format_display_documents(&self.passages, signer, ttl) {
            Ok(documents) => {
                self.state = SectionState::Done;
                documents
                    .into_iter()
                    .map(|document| StreamEvent::Documents {
                        section_name: self.section_name.clone(),
                        content: document,
                    })
                    .collect()
            }
            Err(error) => vec![self.fail(error)],
        }
    }

    /// Abandon the section, producing its single error event.
    pub fn fail(&mut self, error: impl Display) -> StreamEvent {
        self.state = SectionState::Errored;
        tracing::warn!(section = %self.section_name, error = %error, "Section generation failed");
        StreamEvent::error(error)
    }
}

/// Source ids referenced by `[^n]` markers, in order of appearance.
pub fn cited_source_ids(text: &str) -> Vec<String> {
    CITATION_MARKER
        .captures_iter(text)
        .map(|captures| captures[1].to_string())
        .collect()
}

/// Relay `chunks` through `processor`, ending with citations or a single error event.
pub fn drive_section(
    mut processor: SectionProcessor,
    mut chunks: ChunkStream,
    signer: Arc<dyn UrlSigner>,
    ttl: Duration,
) -> impl Stream<Item = StreamEvent> + Send + 'static {
    stream! {
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    if let Some(event) = processor.accept(chunk) {
                        yield event;
                    }
                }
                Err(error) => {
                    yield processor.fail(error);
                    break;
                }
            }
        }

        for event in processor.finish(signer.as_ref(), ttl) {
            yield event;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::GenerationError;
    use crate::pipeline::format::test_support::{CountingSigner, passage};
    use futures_util::stream;

    const TTL: Duration = Duration::from_secs(3600);

    fn chunks(items: Vec<Result<ModelChunk, GenerationError>>) -> ChunkStream {
        Box::pin(stream::iter(items))
    }

    fn delta(text: &str) -> Result<ModelChunk, GenerationError> {
        Ok(ModelChunk::TextDelta(text.to_string()))
    }

    fn two_sources() -> Vec<RetrievedPassage> {
        vec![
            passage("s3://docs/hr.pdf", Some(1), Some(0.9), "Twenty days."),
            passage("s3://docs/faq.pdf", Some(4), Some(0.6), "Ask your manager."),
        ]
    }

    #[test]
    fn citation_markers_are_extracted_in_order() {
        assert_eq!(cited_source_ids("a [^0] b [^12][^3]"), vec!["0", "12", "3"]);
        assert!(cited_source_ids("no markers [^] [x] ^1").is_empty());
    }

    #[tokio::test]
    async fn cited_answer_emits_documents_after_text() {
        let processor = SectionProcessor::new("HR", two_sources());
        let events: Vec<StreamEvent> = drive_section(
            processor,
            chunks(vec![
                Ok(ModelChunk::Other("message_start".into())),
                delta("answer "),
                delta("[^0][^1]"),
                Ok(ModelChunk::Other("message_stop".into())),
            ]),
            Arc::new(CountingSigner::default()),
            TTL,
        )
        .collect()
        .await;

        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            StreamEvent::ResultText {
                section_name: "HR".into(),
                content: "answer ".into()
            }
        );
        assert_eq!(
            events[1],
            StreamEvent::ResultText {
                section_name: "HR".into(),
                content: "[^0][^1]".into()
            }
        );
        let urls: Vec<&str> = events[2..]
            .iter()
            .map(|event| match event {
                StreamEvent::Documents { section_name, content } => {
                    assert_eq!(section_name, "HR");
                    content.document_url.as_str()
                }
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://signed.test/docs/hr.pdf?ttl=3600",
                "https://signed.test/docs/faq.pdf?ttl=3600"
            ]
        );
    }

    #[tokio::test]
    async fn uncited_answer_emits_only_text() {
        let signer = Arc::new(CountingSigner::default());
        let events: Vec<StreamEvent> = drive_section(
            SectionProcessor::new("HR", two_sources()),
            chunks(vec![delta("回答に必要な情報が見つかりませんでした。")]),
            signer.clone(),
            TTL,
        )
        .collect()
        .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::ResultText { .. }));
        assert_eq!(signer.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mid_stream_failure_emits_one_error_and_no_documents() {
        let events: Vec<StreamEvent> = drive_section(
            SectionProcessor::new("HR", two_sources()),
            chunks(vec![
                delta("partial [^0]"),
                Err(GenerationError::ModelException {
                    kind: "throttlingException".into(),
                    message: "slow down".into(),
                }),
                delta("never relayed"),
            ]),
            Arc::new(CountingSigner::default()),
            TTL,
        )
        .collect()
        .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::ResultText {
                    section_name: "HR".into(),
                    content: "partial [^0]".into()
                },
                StreamEvent::Error {
                    content: "throttlingException: slow down".into()
                },
            ]
        );
    }

    #[test]
    fn processor_transitions_through_states() {
        let signer = CountingSigner::default();
        let mut processor = SectionProcessor::new("HR", two_sources());
        assert_eq!(processor.state(), SectionState::Streaming);

        processor.accept(ModelChunk::TextDelta("see [^1]".into()));
        assert_eq!(processor.answer(), "see [^1]");

        let events = processor.finish(&signer, TTL);
        assert_eq!(events.len(), 2);
        assert_eq!(processor.state(), SectionState::Done);
        assert!(processor.accept(ModelChunk::TextDelta("late".into())).is_none());
        assert!(processor.finish(&signer, TTL).is_empty());
    }

    #[test]
    fn unsignable_citation_source_fails_the_section() {
        let signer = CountingSigner::default();
        let mut processor = SectionProcessor::new(
            "HR",
            vec![passage("https://not-s3/a.pdf", Some(1), Some(0.5), "a")],
        );
        processor.accept(ModelChunk::TextDelta("[^0]".into()));

        let events = processor.finish(&signer, TTL);

        assert!(matches!(events.as_slice(), [StreamEvent::Error { .. }]));
        assert_eq!(processor.state(), SectionState::Errored);
    }
}
