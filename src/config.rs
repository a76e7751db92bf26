use crate::aws::MAX_PRESIGN_SECS;
use std::env;
use std::path::PathBuf;
use thiserror::Error;

const DEFAULT_REGION: &str = "ap-northeast-1";
const DEFAULT_MODEL_VERSION: &str = "anthropic.claude-3-5-sonnet-20240620-v1:0";
const DEFAULT_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
const DEFAULT_SIGNED_URL_TTL_SECS: u64 = 3600;
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_LOG_FILE: &str = "logs/ragstream.log";

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the answer streaming server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of the managed knowledge base queried for passages.
    pub knowledge_base_id: String,
    /// Region hosting the knowledge base and the document bucket.
    pub aws_region: String,
    /// Region hosting the generative model endpoint.
    pub model_region: String,
    /// Model identifier passed to the runtime.
    pub model_id: String,
    /// Version marker embedded in every model payload.
    pub anthropic_version: String,
    /// Static credentials used to sign outbound requests.
    pub credentials: AwsCredentials,
    /// Optional override for the retrieval service endpoint.
    pub agent_runtime_endpoint: Option<String>,
    /// Optional override for the model runtime endpoint.
    pub model_runtime_endpoint: Option<String>,
    /// Optional override for the object store endpoint (switches to path-style URLs).
    pub s3_endpoint: Option<String>,
    /// Validity of the document URLs handed to clients, in seconds.
    pub signed_url_ttl_secs: u64,
    /// Origin echoed by the CORS preflight handler.
    pub allow_origin: String,
    /// Interface the HTTP server binds to.
    pub server_host: String,
    /// Port the HTTP server binds to.
    pub server_port: u16,
    /// Log filter and destination.
    pub logging: LogSettings,
}

/// Where logs go and how much of them.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// `EnvFilter` directives, taken from `RUST_LOG`.
    pub filter: String,
    /// File receiving a copy of every log line.
    pub file: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            file: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }
}

/// Access key pair plus optional session token.
#[derive(Clone)]
pub struct AwsCredentials {
    /// Access key identifier.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token issued for temporary credentials.
    pub session_token: Option<String>,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let aws_region =
            load_env_optional("AWS_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string());
        Ok(Self {
            knowledge_base_id: load_env("KNOWLEDGEBASE_ID")?,
            model_region: load_env_optional("MODEL_REGION").unwrap_or_else(|| aws_region.clone()),
            aws_region,
            model_id: load_env_optional("MODEL_VERSION")
                .unwrap_or_else(|| DEFAULT_MODEL_VERSION.to_string()),
            anthropic_version: load_env_optional("ANTHROPIC_VERSION")
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_VERSION.to_string()),
            credentials: AwsCredentials {
                access_key_id: load_env("AWS_ACCESS_KEY_ID")?,
                secret_access_key: load_env("AWS_SECRET_ACCESS_KEY")?,
                session_token: load_env_optional("AWS_SESSION_TOKEN"),
            },
            agent_runtime_endpoint: load_env_optional("BEDROCK_AGENT_RUNTIME_ENDPOINT"),
            model_runtime_endpoint: load_env_optional("BEDROCK_RUNTIME_ENDPOINT"),
            s3_endpoint: load_env_optional("S3_ENDPOINT"),
            signed_url_ttl_secs: parse_url_ttl(load_env_optional("SIGNED_URL_TTL_SECS"))?,
            allow_origin: load_env_optional("ALLOW_ORIGIN").unwrap_or_else(|| "*".to_string()),
            server_host: load_env_optional("SERVER_HOST")
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?
                .unwrap_or(8080),
            logging: LogSettings {
                filter: load_env_optional("RUST_LOG")
                    .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
                file: load_env_optional("RAGSTREAM_LOG_FILE")
                    .map_or_else(|| PathBuf::from(DEFAULT_LOG_FILE), PathBuf::from),
            },
        })
    }
}

// Presigned URLs only accept lifetimes between one second and seven days.
fn parse_url_ttl(value: Option<String>) -> Result<u64, ConfigError> {
    let Some(value) = value else {
        return Ok(DEFAULT_SIGNED_URL_TTL_SECS);
    };
    value
        .trim()
        .parse()
        .ok()
        .filter(|secs| (1..=MAX_PRESIGN_SECS).contains(secs))
        .ok_or_else(|| ConfigError::InvalidValue("SIGNED_URL_TTL_SECS".into()))
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    load_env_optional(key).ok_or_else(|| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Load `.env` (when present) and parse the configuration from the environment.
pub fn init_config() -> Result<Config, ConfigError> {
    dotenvy::dotenv().ok();
    Config::from_env()
}

#[cfg(test)]
pub(crate) fn test_config(endpoint: Option<String>) -> Config {
    Config {
        knowledge_base_id: "KB12345".into(),
        aws_region: "ap-northeast-1".into(),
        model_region: "us-east-1".into(),
        model_id: DEFAULT_MODEL_VERSION.into(),
        anthropic_version: DEFAULT_ANTHROPIC_VERSION.into(),
        credentials: AwsCredentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            session_token: None,
        },
        agent_runtime_endpoint: endpoint.clone(),
        model_runtime_endpoint: endpoint.clone(),
        s3_endpoint: endpoint,
        signed_url_ttl_secs: DEFAULT_SIGNED_URL_TTL_SECS,
        allow_origin: "*".into(),
        server_host: "127.0.0.1".into(),
        server_port: 8080,
        logging: LogSettings::default(),
    }
}
