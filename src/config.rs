//! Configuration management for the Power BI MCP Server.
//!
//! Configuration is loaded from environment variables following the 12-factor app pattern.
//! Nothing here reads `.env` files; the process environment is the only source.

use crate::constants::{
    DEFAULT_AUTHORITY_HOST, DEFAULT_DISCOVERY_WAIT_SECS, DEFAULT_LLM_BASE_URL, DEFAULT_LLM_MODEL,
    DEFAULT_MAX_RESULT_ROWS, DEFAULT_REQUEST_TIMEOUT_SECS,
};
use crate::error::ServerError;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Process-wide credential defaults for `connect`
    pub credentials: CredentialDefaults,

    /// Remote protocol configuration
    pub xmla: XmlaConfig,

    /// Schema cache configuration
    pub schema: SchemaConfig,

    /// Query execution configuration
    pub query: QueryConfig,

    /// Language model configuration; `None` disables the natural-language operations
    pub llm: Option<LlmConfig>,
}

/// Credentials used when a `connect` request omits them.
#[derive(Clone, Default)]
pub struct CredentialDefaults {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl std::fmt::Debug for CredentialDefaults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialDefaults")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Remote protocol configuration.
#[derive(Debug, Clone)]
pub struct XmlaConfig {
    /// Azure AD authority host, without tenant
    pub authority_host: String,

    /// Token scope override; derived from the endpoint when unset
    pub token_scope: Option<String>,

    /// Optional HTTP client timeout. Unset means round trips may block indefinitely.
    pub http_timeout: Option<Duration>,
}

/// Schema cache configuration.
#[derive(Debug, Clone)]
pub struct SchemaConfig {
    /// Bounded wait for background discovery before falling back to a synchronous pass
    pub discovery_wait: Duration,

    /// Freshness window for cached entries; `None` keeps entries for the session lifetime
    pub entry_ttl: Option<Duration>,
}

/// Query execution configuration.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Maximum rows rendered per result
    pub max_result_rows: usize,

    /// Protocol-boundary timeout applied to each tool call
    pub request_timeout: Duration,
}

/// OpenAI-compatible chat completion settings.
#[derive(Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &"***")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Read a variable, treating empty values as unset.
fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_var(name)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// ## Credentials
    /// - `DEFAULT_TENANT_ID`, `DEFAULT_CLIENT_ID`, `DEFAULT_CLIENT_SECRET`
    ///
    /// ## Optional
    /// - `POWERBI_AUTHORITY_HOST`: Azure AD authority (default: login.microsoftonline.com)
    /// - `POWERBI_TOKEN_SCOPE`: Override the token scope
    /// - `POWERBI_HTTP_TIMEOUT`: HTTP client timeout in seconds (default: none)
    /// - `POWERBI_DISCOVERY_WAIT`: Discovery wait in seconds (default: 30)
    /// - `POWERBI_SCHEMA_TTL`: Cache freshness window in seconds (default: none)
    /// - `POWERBI_MAX_ROWS`: Maximum result rows (default: 1000)
    /// - `POWERBI_REQUEST_TIMEOUT`: Per-call timeout in seconds (default: 120)
    /// - `OPENAI_API_KEY`: Enables natural-language operations
    /// - `OPENAI_MODEL`: Chat model (default: gpt-4o-mini)
    /// - `OPENAI_BASE_URL`: API base URL (default: https://api.openai.com/v1)
    pub fn from_env() -> Result<Self, ServerError> {
        let credentials = CredentialDefaults {
            tenant_id: env_var("DEFAULT_TENANT_ID"),
            client_id: env_var("DEFAULT_CLIENT_ID"),
            client_secret: env_var("DEFAULT_CLIENT_SECRET"),
        };

        let authority_host = env_var("POWERBI_AUTHORITY_HOST")
            .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_string());
        url::Url::parse(&authority_host).map_err(|e| {
            ServerError::config(format!(
                "POWERBI_AUTHORITY_HOST is not a valid URL ({}): {}",
                authority_host, e
            ))
        })?;

        let xmla = XmlaConfig {
            authority_host: authority_host.trim_end_matches('/').to_string(),
            token_scope: env_var("POWERBI_TOKEN_SCOPE"),
            http_timeout: env_secs("POWERBI_HTTP_TIMEOUT"),
        };

        let schema = SchemaConfig {
            discovery_wait: env_secs("POWERBI_DISCOVERY_WAIT")
                .unwrap_or(Duration::from_secs(DEFAULT_DISCOVERY_WAIT_SECS)),
            entry_ttl: env_secs("POWERBI_SCHEMA_TTL"),
        };

        let query = QueryConfig {
            max_result_rows: env_var("POWERBI_MAX_ROWS")
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(DEFAULT_MAX_RESULT_ROWS),
            request_timeout: env_secs("POWERBI_REQUEST_TIMEOUT")
                .unwrap_or(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)),
        };

        let llm = env_var("OPENAI_API_KEY").map(|api_key| LlmConfig {
            api_key,
            model: env_var("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            base_url: env_var("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        });

        Ok(Config {
            credentials,
            xmla,
            schema,
            query,
            llm,
        })
    }

    /// Whether the natural-language operations are available.
    pub fn nl_enabled(&self) -> bool {
        self.llm.is_some()
    }
}

impl Default for XmlaConfig {
    fn default() -> Self {
        Self {
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            token_scope: None,
            http_timeout: None,
        }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            discovery_wait: Duration::from_secs(DEFAULT_DISCOVERY_WAIT_SECS),
            entry_ttl: None,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_result_rows: DEFAULT_MAX_RESULT_ROWS,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}
