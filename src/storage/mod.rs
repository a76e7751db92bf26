//! Object store access: time-bounded download URLs for cited documents.

use crate::aws::{Signer, SigningError};
use crate::config::Config;
use reqwest::Url;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

/// Errors raised while issuing object store URLs.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The location is not of the form `s3://bucket/key`.
    #[error("Invalid object location: {0}")]
    InvalidUri(String),
    /// Signing the URL failed.
    #[error("Failed to sign object URL: {0}")]
    Signing(#[from] SigningError),
}

/// Issues download URLs for objects referenced by retrieved passages.
pub trait UrlSigner: Send + Sync {
    /// Return a URL granting read access to `location` for `ttl`.
    fn presign_get(&self, location: &str, ttl: Duration) -> Result<String, StorageError>;
}

/// SigV4 query-string presigner for S3 objects.
pub struct S3UrlSigner {
    signer: Signer,
    region: String,
    endpoint: Option<String>,
}

impl S3UrlSigner {
    /// Build a presigner using the configured region, credentials, and optional endpoint.
    pub fn new(config: &Config) -> Self {
        Self {
            signer: Signer::new(config.credentials.clone(), &config.aws_region, "s3"),
            region: config.aws_region.clone(),
            endpoint: config
                .s3_endpoint
                .as_deref()
                .map(|endpoint| endpoint.trim_end_matches('/').to_string()),
        }
    }

    /// Presign `location` as of `now`.
    pub fn presign_get_at(
        &self,
        location: &str,
        ttl: Duration,
        now: OffsetDateTime,
    ) -> Result<String, StorageError> {
        let (bucket, key) = parse_s3_uri(location)?;
        let encoded_key = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");

        let raw = match &self.endpoint {
            Some(endpoint) => format!("{endpoint}/{bucket}/{encoded_key}"),
            None if self.region == "us-east-1" => {
                format!("https://{bucket}.s3.amazonaws.com/{encoded_key}")
            }
            None => format!("https://{bucket}.s3.{}.amazonaws.com/{encoded_key}", self.region),
        };
        let url = Url::parse(&raw).map_err(|_| StorageError::InvalidUri(location.to_string()))?;

        Ok(self.signer.presign_url("GET", &url, ttl.as_secs(), now)?)
    }
}

impl UrlSigner for S3UrlSigner {
    fn presign_get(&self, location: &str, ttl: Duration) -> Result<String, StorageError> {
        self.presign_get_at(location, ttl, OffsetDateTime::now_utc())
    }
}

/// Split `s3://bucket/key` into its bucket and key.
pub fn parse_s3_uri(location: &str) -> Result<(&str, &str), StorageError> {
    location
        .strip_prefix("s3://")
        .and_then(|rest| rest.split_once('/'))
        .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
        .ok_or_else(|| StorageError::InvalidUri(location.to_string()))
}
