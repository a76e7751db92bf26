//! Events relayed to the client over the outbound event stream.

use crate::pipeline::format::DisplayDocument;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// One outbound event, serialized as `{"type": ..., ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamEvent {
    /// Incremental answer text for a section.
    #[serde(rename_all = "camelCase")]
    ResultText {
        /// Section the text belongs to.
        section_name: String,
        /// Delta text, not the cumulative answer.
        content: String,
    },
    /// Citation for a section whose answer referenced its sources.
    #[serde(rename_all = "camelCase")]
    Documents {
        /// Section the citation belongs to.
        section_name: String,
        /// Deduplicated display document.
        content: DisplayDocument,
    },
    /// A section failed; its remaining output is abandoned.
    Error {
        /// Error message.
        content: String,
    },
}

impl StreamEvent {
    /// Build an error event from any displayable failure.
    pub fn error(error: impl Display) -> Self {
        Self::Error {
            content: error.to_string(),
        }
    }
}
