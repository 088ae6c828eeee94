//! Azure Active Directory client-credentials authentication.
//!
//! Tokens are requested with raw form posts against the v2.0 token endpoint
//! and cached until shortly before they expire.

use crate::constants::TOKEN_REFRESH_MARGIN;
use crate::error::ServerError;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// AAD error codes that mean the caller's identity was rejected.
const CREDENTIAL_ERRORS: &[&str] = &[
    "invalid_client",
    "unauthorized_client",
    "invalid_grant",
    "invalid_request",
    "invalid_scope",
];

/// A bearer token and its expiry.
#[derive(Clone)]
pub struct AccessToken {
    secret: String,
    expires_at: Instant,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            secret: secret.into(),
            expires_at: Instant::now() + lifetime,
        }
    }

    /// Whether the token remains valid beyond the refresh margin.
    pub fn is_fresh(&self) -> bool {
        self.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// AAD v2 returns a number, older endpoints a string.
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl TokenResponse {
    fn expires_in_secs(&self) -> u64 {
        match &self.expires_in {
            Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(3600),
            Some(serde_json::Value::String(s)) => s.parse().unwrap_or(3600),
            _ => 3600,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Acquires and caches app-only tokens for one service principal.
pub struct TokenProvider {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    cached: Option<AccessToken>,
}

impl TokenProvider {
    pub fn new(
        http: reqwest::Client,
        authority_host: &str,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
        scope: &str,
    ) -> Self {
        Self {
            http,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                authority_host.trim_end_matches('/'),
                tenant_id
            ),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            scope: scope.to_string(),
            cached: None,
        }
    }

    /// Return a valid bearer token, refreshing it when close to expiry.
    pub async fn token(&mut self) -> Result<String, ServerError> {
        if let Some(token) = self.cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.secret().to_string());
        }

        let token = self.fetch().await?;
        let secret = token.secret().to_string();
        self.cached = Some(token);
        Ok(secret)
    }

    /// Drop the cached token so the next call re-authenticates.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    async fn fetch(&self) -> Result<AccessToken, ServerError> {
        debug!("Requesting access token for scope {}", self.scope);

        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                ServerError::connection_with_source("Failed to reach the identity provider", e)
            })?;

        let status = response.status();
        if status.is_success() {
            let body: TokenResponse = response.json().await.map_err(|e| {
                ServerError::connection_with_source("Failed to parse token response", e)
            })?;
            return Ok(AccessToken::new(
                body.access_token.clone(),
                Duration::from_secs(body.expires_in_secs()),
            ));
        }

        let text = response.text().await.unwrap_or_default();
        Err(classify_token_failure(status.as_u16(), &text))
    }
}

/// Map a failed token response to an error kind.
fn classify_token_failure(status: u16, body: &str) -> ServerError {
    let parsed: Option<TokenError> = serde_json::from_str(body).ok();
    let description = parsed
        .as_ref()
        .map(|e| {
            e.error_description
                .clone()
                .unwrap_or_else(|| e.error.clone())
        })
        .unwrap_or_else(|| format!("HTTP {}", status));
    // AAD descriptions span several lines with trace ids; keep the first.
    let description = description.lines().next().unwrap_or_default().to_string();

    let rejected = matches!(status, 400 | 401 | 403)
        && parsed
            .as_ref()
            .map(|e| CREDENTIAL_ERRORS.contains(&e.error.as_str()))
            .unwrap_or(status != 400);

    if rejected {
        warn!("Identity provider rejected credentials: {}", description);
        ServerError::auth(description)
    } else {
        ServerError::connection(format!("Identity provider error: {}", description))
    }
}
