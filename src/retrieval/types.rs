//! Shared types produced and consumed by the retrieval layer.

use crate::aws::SigningError;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

const SOURCE_URI_KEY: &str = "x-amz-bedrock-kb-source-uri";
const PAGE_NUMBER_KEY: &str = "x-amz-bedrock-kb-document-page-number";
const UNSPECIFIED: &str = "unspecified";

/// Errors returned while querying the knowledge base.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Endpoint URL could not be built.
    #[error("Invalid retrieval endpoint: {0}")]
    InvalidEndpoint(String),
    /// Request signing failed.
    #[error("Failed to sign retrieval request: {0}")]
    Signing(#[from] SigningError),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The retrieval service responded with an unexpected status code.
    #[error("Unexpected retrieval response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the service.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
}

/// Opaque page marker attached to a passage.
///
/// The knowledge base reports numbers, but uploaded metadata may carry labels. Integral
/// numbers are normalized so `1` and `1.0` name the same page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PageNumber {
    /// Numeric page.
    Number(i64),
    /// Free-form page label.
    Label(String),
}

impl PageNumber {
    /// Marker used when a passage carries no page information.
    pub fn unspecified() -> Self {
        Self::Label(UNSPECIFIED.to_string())
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Number(number) => Some(match number.as_i64() {
                Some(integer) => Self::Number(integer),
                None => match number.as_f64() {
                    Some(float) if float.is_finite() && float.fract() == 0.0 => {
                        Self::Number(float as i64)
                    }
                    _ => Self::Label(number.to_string()),
                },
            }),
            Value::String(label) => Some(Self::Label(label.clone())),
            other => Some(Self::Label(other.to_string())),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Number(number) => Value::from(*number),
            Self::Label(label) => Value::String(label.clone()),
        }
    }
}

impl Default for PageNumber {
    fn default() -> Self {
        Self::unspecified()
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(number) => write!(f, "{number}"),
            Self::Label(label) => f.write_str(label),
        }
    }
}

impl Serialize for PageNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(number) => serializer.serialize_i64(*number),
            Self::Label(label) => serializer.serialize_str(label),
        }
    }
}

impl<'de> Deserialize<'de> for PageNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&value).unwrap_or_default())
    }
}

/// One passage returned by the knowledge base.
///
/// Serializes to and from the service's retrieval-result shape so that search responses
/// can be forwarded verbatim to the generation endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PassageWire", into = "PassageWire")]
pub struct RetrievedPassage {
    /// Passage text.
    pub content_text: String,
    /// Similarity score, when the service reported one.
    pub score: Option<f64>,
    /// Location of the source object (`s3://bucket/key`).
    pub source_location_uri: String,
    /// Page the passage was taken from.
    pub page_number: Option<PageNumber>,
    /// Source title taken from the passage metadata.
    pub source_title: Option<String>,
}

impl RetrievedPassage {
    /// Page marker, falling back to the unspecified marker.
    pub fn page(&self) -> PageNumber {
        self.page_number.clone().unwrap_or_default()
    }

    /// Whether the passage has text or a source to ground an answer on.
    pub fn is_grounded(&self) -> bool {
        !self.content_text.trim().is_empty() || !self.source_location_uri.is_empty()
    }

    /// Score used for ranking; unscored passages rank as zero.
    pub fn score_value(&self) -> f64 {
        self.score.unwrap_or(0.0)
    }
}

#[derive(Serialize, Deserialize, Default)]
struct PassageWire {
    #[serde(default)]
    content: ContentWire,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<LocationWire>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Default)]
struct ContentWire {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct LocationWire {
    #[serde(rename = "s3Location", default, skip_serializing_if = "Option::is_none")]
    s3_location: Option<S3LocationWire>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct S3LocationWire {
    uri: String,
}

impl From<PassageWire> for RetrievedPassage {
    fn from(wire: PassageWire) -> Self {
        let source_title = match wire.metadata.get(SOURCE_URI_KEY) {
            Some(Value::String(uri)) => Some(uri.clone()),
            _ => None,
        };
        let source_location_uri = wire
            .location
            .and_then(|location| location.s3_location)
            .map(|s3| s3.uri)
            .or_else(|| source_title.clone())
            .unwrap_or_default();

        Self {
            content_text: wire.content.text.unwrap_or_default(),
            score: wire.score,
            source_location_uri,
            page_number: wire
                .metadata
                .get(PAGE_NUMBER_KEY)
                .and_then(PageNumber::from_value),
            source_title,
        }
    }
}

impl From<RetrievedPassage> for PassageWire {
    fn from(passage: RetrievedPassage) -> Self {
        let mut metadata = Map::new();
        if let Some(title) = passage.source_title {
            metadata.insert(SOURCE_URI_KEY.into(), Value::String(title));
        }
        if let Some(page) = &passage.page_number {
            metadata.insert(PAGE_NUMBER_KEY.into(), page.to_value());
        }
        let location = (!passage.source_location_uri.is_empty()).then(|| LocationWire {
            s3_location: Some(S3LocationWire {
                uri: passage.source_location_uri,
            }),
            kind: Some("S3".into()),
        });

        Self {
            content: ContentWire {
                text: Some(passage.content_text),
            },
            score: passage.score,
            location,
            metadata,
        }
    }
}

/// Section/category selection narrowing one retrieval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalTarget {
    /// Section the passages must belong to.
    #[serde(default, alias = "section_name")]
    pub section_name: Option<String>,
    /// Categories the passages may belong to.
    #[serde(default, alias = "category")]
    pub categories: Option<Vec<String>>,
}

/// Retrieval targets as supplied by clients: one object or a list of them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SearchTarget {
    /// Several targets, each producing its own section of results.
    Multiple(Vec<RetrievalTarget>),
    /// A single target.
    Single(RetrievalTarget),
}

impl SearchTarget {
    /// Flatten into the ordered list of targets to query.
    pub fn into_targets(self) -> Vec<RetrievalTarget> {
        match self {
            Self::Multiple(targets) => targets,
            Self::Single(target) => vec![target],
        }
    }
}
