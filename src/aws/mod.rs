//! Request signing shared by the AWS-backed collaborators.

pub mod sigv4;

pub use sigv4::{MAX_PRESIGN_SECS, Signer, SignedHeaders, SigningError};

use reqwest::{Client, RequestBuilder, Url, header::CONTENT_TYPE};
use time::OffsetDateTime;

/// Prepare a SigV4-signed JSON `POST` carrying `body`.
pub(crate) fn signed_json_post(
    client: &Client,
    signer: &Signer,
    url: Url,
    body: Vec<u8>,
) -> Result<RequestBuilder, SigningError> {
    let signed = signer.sign_request("POST", &url, &body, OffsetDateTime::now_utc())?;
    let mut request = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .header("x-amz-date", signed.amz_date)
        .header("authorization", signed.authorization);
    if let Some(token) = signed.security_token {
        request = request.header("x-amz-security-token", token);
    }
    Ok(request.body(body))
}

/// Build the service endpoint, honoring an explicit override when configured.
pub(crate) fn service_endpoint(overridden: Option<&str>, service: &str, region: &str) -> String {
    match overridden {
        Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
        None => format!("https://{service}.{region}.amazonaws.com"),
    }
}

/// Join a base URL and a path without doubling separators.
pub(crate) fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}
