//! AWS Signature Version 4.
//!
//! Two flavors are supported: header signing for JSON APIs (`Authorization` header) and
//! query-string presigning for object downloads. Only `host`, `x-amz-date` and, when
//! temporary credentials are in use, `x-amz-security-token` are signed.

use crate::config::AwsCredentials;
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
/// Longest lifetime AWS accepts for a presigned URL, in seconds.
pub const MAX_PRESIGN_SECS: u64 = 604_800;

/// Errors raised while signing a request.
#[derive(Debug, Error)]
pub enum SigningError {
    /// Target URL could not be parsed or has no host.
    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),
    /// Presigned URL lifetime outside the window accepted by AWS.
    #[error("Presigned URL lifetime must be between 1 and {MAX_PRESIGN_SECS} seconds, got {0}")]
    InvalidExpiry(u64),
}

/// Header values produced by [`Signer::sign_request`].
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    /// Value for the `Authorization` header.
    pub authorization: String,
    /// Value for the `x-amz-date` header.
    pub amz_date: String,
    /// Value for the `x-amz-security-token` header, when temporary credentials are used.
    pub security_token: Option<String>,
}

/// Signs requests for one service in one region.
#[derive(Debug, Clone)]
pub struct Signer {
    credentials: AwsCredentials,
    region: String,
    service: String,
}

struct SigningTime {
    amz_date: String,
    date: String,
}

impl SigningTime {
    fn new(now: OffsetDateTime) -> Self {
        let date = format!(
            "{:04}{:02}{:02}",
            now.year(),
            u8::from(now.month()),
            now.day()
        );
        let amz_date = format!(
            "{date}T{:02}{:02}{:02}Z",
            now.hour(),
            now.minute(),
            now.second()
        );
        Self { amz_date, date }
    }
}

impl Signer {
    /// Create a signer bound to `service` in `region`.
    pub fn new(credentials: AwsCredentials, region: &str, service: &str) -> Self {
        Self {
            credentials,
            region: region.to_string(),
            service: service.to_string(),
        }
    }

    /// Sign a request whose body is `payload`, returning the headers to attach.
    pub fn sign_request(
        &self,
        method: &str,
        url: &Url,
        payload: &[u8],
        now: OffsetDateTime,
    ) -> Result<SignedHeaders, SigningError> {
        let time = SigningTime::new(now);
        let host = host_header(url)?;

        let mut canonical_headers = format!("host:{host}\nx-amz-date:{}\n", time.amz_date);
        let mut signed_headers = String::from("host;x-amz-date");
        if let Some(token) = &self.credentials.session_token {
            canonical_headers.push_str(&format!("x-amz-security-token:{token}\n"));
            signed_headers.push_str(";x-amz-security-token");
        }

        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let canonical_request = format!(
            "{method}\n{}\n{}\n{canonical_headers}\n{signed_headers}\n{}",
            self.canonical_uri(url),
            canonical_query(query),
            hex::encode(Sha256::digest(payload)),
        );
        let scope = self.scope(&time);
        let signature = self.signature(&time, &scope, &canonical_request);

        Ok(SignedHeaders {
            authorization: format!(
                "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                self.credentials.access_key_id
            ),
            amz_date: time.amz_date,
            security_token: self.credentials.session_token.clone(),
        })
    }

    /// Produce a presigned URL valid for `expires_secs` seconds.
    pub fn presign_url(
        &self,
        method: &str,
        url: &Url,
        expires_secs: u64,
        now: OffsetDateTime,
    ) -> Result<String, SigningError> {
        if expires_secs == 0 || expires_secs > MAX_PRESIGN_SECS {
            return Err(SigningError::InvalidExpiry(expires_secs));
        }
        let time = SigningTime::new(now);
        let host = host_header(url)?;
        let scope = self.scope(&time);

        let mut query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        query.push(("X-Amz-Algorithm".into(), ALGORITHM.into()));
        query.push((
            "X-Amz-Credential".into(),
            format!("{}/{scope}", self.credentials.access_key_id),
        ));
        query.push(("X-Amz-Date".into(), time.amz_date.clone()));
        query.push(("X-Amz-Expires".into(), expires_secs.to_string()));
        query.push(("X-Amz-SignedHeaders".into(), "host".into()));
        if let Some(token) = &self.credentials.session_token {
            query.push(("X-Amz-Security-Token".into(), token.clone()));
        }
        let canonical_query = canonical_query(query);

        let canonical_request = format!(
            "{method}\n{}\n{canonical_query}\nhost:{host}\n\nhost\n{UNSIGNED_PAYLOAD}",
            self.canonical_uri(url),
        );
        let signature = self.signature(&time, &scope, &canonical_request);

        Ok(format!(
            "{}://{host}{}?{canonical_query}&X-Amz-Signature={signature}",
            url.scheme(),
            url.path()
        ))
    }

    fn scope(&self, time: &SigningTime) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            time.date, self.region, self.service
        )
    }

    // S3 paths are encoded once; every other service expects each segment encoded again.
    fn canonical_uri(&self, url: &Url) -> String {
        let path = url.path();
        let path = if path.is_empty() { "/" } else { path };
        if self.service == "s3" {
            return path.to_string();
        }
        path.split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn signature(&self, time: &SigningTime, scope: &str, canonical_request: &str) -> String {
        let string_to_sign = format!(
            "{ALGORITHM}\n{}\n{scope}\n{}",
            time.amz_date,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let secret = format!("AWS4{}", self.credentials.secret_access_key);
        let k_date = hmac_sha256(secret.as_bytes(), &time.date);
        let k_region = hmac_sha256(&k_date, &self.region);
        let k_service = hmac_sha256(&k_region, &self.service);
        let k_signing = hmac_sha256(&k_service, "aws4_request");
        hex::encode(hmac_sha256(&k_signing, &string_to_sign))
    }
}

fn hmac_sha256(key: &[u8], data: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn host_header(url: &Url) -> Result<String, SigningError> {
    let host = url
        .host_str()
        .ok_or_else(|| SigningError::InvalidUrl(url.to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn canonical_query(pairs: Vec<(String, String)>) -> String {
    let mut encoded: Vec<(String, String)> = pairs
        .into_iter()
        .map(|(key, value)| {
            (
                urlencoding::encode(&key).into_owned(),
                urlencoding::encode(&value).into_owned(),
            )
        })
        .collect();
    encoded.sort();
    encoded
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}
