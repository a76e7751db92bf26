//! Shapes retrieved passages for end-user display and for the model's grounding context.

use crate::retrieval::{PageNumber, RetrievedPassage};
use crate::storage::{StorageError, UrlSigner};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

const UNSPECIFIED: &str = "unspecified";

/// Citation entry rendered to the end user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayDocument {
    /// Time-bounded download URL for the source object.
    pub document_url: String,
    /// Page of the source the passage came from.
    pub page_number: PageNumber,
    /// Score of the first passage seen for this page.
    pub score: f64,
}

/// Grounding entry embedded in the system instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptDocument {
    /// Ordinal the model cites as `[^SourceId]`.
    #[serde(rename = "SourceId")]
    pub source_id: String,
    /// Same ordinal, exposed as a document identifier.
    #[serde(rename = "DocumentId")]
    pub document_id: String,
    /// Source title, or `unspecified`.
    #[serde(rename = "DocumentTitle")]
    pub title: String,
    /// Source page, or `unspecified`.
    #[serde(rename = "DocumentPage")]
    pub page_number: PageNumber,
    /// Passage text.
    #[serde(rename = "Content")]
    pub content: String,
}

struct SourceEntry {
    url: String,
    pages: HashSet<PageNumber>,
}

/// Deduplicate passages by source and page, attaching one signed URL per source.
///
/// Order follows the input; the first passage for a `(source, page)` pair wins.
pub fn format_display_documents(
    passages: &[RetrievedPassage],
    signer: &dyn UrlSigner,
    ttl: Duration,
) -> Result<Vec<DisplayDocument>, StorageError> {
    let mut sources: HashMap<&str, SourceEntry> = HashMap::new();
    let mut documents = Vec::new();

    for passage in passages {
        let uri = passage.source_location_uri.as_str();
        let entry = match sources.entry(uri) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => vacant.insert(SourceEntry {
                url: signer.presign_get(uri, ttl)?,
                pages: HashSet::new(),
            }),
        };

        let page = passage.page();
        if entry.pages.insert(page.clone()) {
            documents.push(DisplayDocument {
                document_url: entry.url.clone(),
                page_number: page,
                score: passage.score_value(),
            });
        }
    }

    Ok(documents)
}

/// Label every passage with its position; duplicates are kept.
pub fn format_prompt_documents(passages: &[RetrievedPassage]) -> Vec<PromptDocument> {
    passages
        .iter()
        .enumerate()
        .map(|(index, passage)| PromptDocument {
            source_id: index.to_string(),
            document_id: index.to_string(),
            title: passage
                .source_title
                .clone()
                .unwrap_or_else(|| UNSPECIFIED.to_string()),
            page_number: passage.page(),
            content: passage.content_text.clone(),
        })
        .collect()
}

/// Content of the best-scoring passage; ties go to the earliest.
pub fn highest_score_text(passages: &[RetrievedPassage]) -> String {
    let mut best: Option<&RetrievedPassage> = None;
    for passage in passages {
        if best.is_none_or(|current| passage.score_value() > current.score_value()) {
            best = Some(passage);
        }
    }
    best.map(|passage| passage.content_text.clone())
        .unwrap_or_default()
}
