//! Knowledge base retrieval: filter construction, passage types, and the service client.

pub mod client;
pub mod filters;
pub mod types;

pub use client::{KnowledgeBaseClient, Retriever};
pub use filters::{RESULT_COUNT, SEARCH_TYPE, SemanticFilter, build_filter, retrieval_configuration};
pub use types::{PageNumber, RetrievalError, RetrievalTarget, RetrievedPassage, SearchTarget};
