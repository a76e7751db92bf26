//! Retrieval-augmented answer pipeline: formatting, prompting, relay, and orchestration.

pub mod events;
pub mod format;
pub mod orchestrator;
pub mod prompt;
pub mod search;
pub mod service;
pub mod stream;

pub use events::StreamEvent;
pub use format::{
    DisplayDocument, PromptDocument, format_display_documents, format_prompt_documents,
    highest_score_text,
};
pub use orchestrator::{AnswerPipeline, GenerationRequest, SectionDocuments, ValidationError};
pub use prompt::build_payload;
pub use search::{SearchError, SearchService, SectionResult};
pub use service::{InitError, RagService, ServiceSettings};
pub use stream::{SectionProcessor, SectionState, cited_source_ids, drive_section};
