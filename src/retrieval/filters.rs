//! Filter expressions for knowledge base retrieval queries.

use serde_json::{Value, json};

use super::types::RetrievalTarget;

/// Maximum passages requested per retrieval.
pub const RESULT_COUNT: usize = 10;
/// Embedding-similarity ranking, as opposed to hybrid lexical search.
pub const SEARCH_TYPE: &str = "SEMANTIC";

const SECTION_KEY: &str = "section";
const CATEGORY_KEY: &str = "category";

/// Metadata filter understood by the retrieval service.
#[derive(Debug, Clone, PartialEq)]
pub enum SemanticFilter {
    /// Metadata `key` must equal `value`.
    Equals {
        /// Metadata attribute name.
        key: String,
        /// Required value.
        value: String,
    },
    /// Metadata `key` must be one of `values`.
    In {
        /// Metadata attribute name.
        key: String,
        /// Accepted values.
        values: Vec<String>,
    },
    /// Every sub-expression must hold.
    AndAll(Vec<SemanticFilter>),
}

impl SemanticFilter {
    /// Render the filter in the service's JSON form.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Equals { key, value } => json!({ "equals": { "key": key, "value": value } }),
            Self::In { key, values } => json!({ "in": { "key": key, "value": values } }),
            Self::AndAll(filters) => json!({
                "andAll": filters.iter().map(Self::to_json).collect::<Vec<_>>()
            }),
        }
    }
}

/// Build the filter for one target.
///
/// Section and categories together narrow by both; either alone narrows by that field;
/// neither yields no filter at all. A blank section or a list of only blank categories
/// counts as absent; present values are sent exactly as given.
pub fn build_filter(target: &RetrievalTarget) -> Option<SemanticFilter> {
    let section = target
        .section_name
        .as_ref()
        .filter(|section| !is_blank(section));
    let categories = target
        .categories
        .as_ref()
        .filter(|categories| !categories.iter().all(|category| is_blank(category)));

    let section_filter = section.map(|section| SemanticFilter::Equals {
        key: SECTION_KEY.into(),
        value: section.clone(),
    });
    let category_filter = categories.map(|values| SemanticFilter::In {
        key: CATEGORY_KEY.into(),
        values: values.clone(),
    });

    match (section_filter, category_filter) {
        (Some(section), Some(categories)) => Some(SemanticFilter::AndAll(vec![section, categories])),
        (None, Some(categories)) => Some(categories),
        (Some(section), None) => Some(section),
        (None, None) => None,
    }
}

/// Compose the `retrievalConfiguration` body; the `filter` key is omitted when absent.
pub fn retrieval_configuration(filter: Option<&SemanticFilter>) -> Value {
    let mut vector_search = json!({
        "numberOfResults": RESULT_COUNT,
        "overrideSearchType": SEARCH_TYPE,
    });
    if let (Some(filter), Value::Object(map)) = (filter, &mut vector_search) {
        map.insert("filter".into(), filter.to_json());
    }
    json!({ "vectorSearchConfiguration": vector_search })
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}
