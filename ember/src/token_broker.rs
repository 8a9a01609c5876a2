//! Registration-token acquisition against the hosting service.
//!
//! The only contract consumed here is "scope + runner name in, short-lived
//! token out". Every create attempt mints a fresh token so a retried
//! create never ships an expired one. Token values are secrets: they flow
//! into the first-boot blob and nowhere else, and they never hit the logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::Secret;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::model::runners::ScopeKind;

#[derive(Debug, Error)]
pub enum TokenError {
    /// Credentials rejected for this scope; terminal, surfaced to the
    /// operator.
    #[error("hosting service rejected credentials for {scope}: {message}")]
    ScopeUnauthorized { scope: String, message: String },

    /// Caller should requeue with backoff.
    #[error("hosting service rate limited the request{}", retry_after.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimited { retry_after: Option<u64> },

    /// Network-level failure; retryable.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed token response: {0}")]
    Malformed(String),
}

pub struct RegistrationToken {
    pub value: Secret<String>,
    pub expires_at: DateTime<Utc>,
}

/// Capability the reconcilers depend on; the production implementation is
/// [`GithubTokenBroker`], tests substitute their own.
#[async_trait]
pub trait TokenBroker: Send + Sync {
    async fn issue(
        &self,
        scope_kind: ScopeKind,
        scope_value: &str,
        runner_name: &str,
    ) -> Result<RegistrationToken, TokenError>;
}

pub struct GithubTokenBroker {
    http: reqwest::Client,
    api_url: String,
    html_url: String,
    token: Secret<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

impl GithubTokenBroker {
    pub fn new(api_url: String, html_url: String, token: Secret<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            html_url: html_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// REST endpoint that mints a registration token for the scope.
    pub fn registration_url(&self, scope_kind: ScopeKind, scope_value: &str) -> String {
        let base = &self.api_url;
        match scope_kind {
            ScopeKind::Enterprise => {
                format!("{base}/enterprises/{scope_value}/actions/runners/registration-token")
            }
            ScopeKind::Organization => {
                format!("{base}/orgs/{scope_value}/actions/runners/registration-token")
            }
            ScopeKind::Repository => {
                format!("{base}/repos/{scope_value}/actions/runners/registration-token")
            }
        }
    }

    /// Page the runner's `config.sh --url` points at.
    pub fn runner_config_url(&self, scope_kind: ScopeKind, scope_value: &str) -> String {
        runner_config_url(&self.html_url, scope_kind, scope_value)
    }
}

/// Registration page for a scope, e.g. `https://github.com/acme` for an
/// organization or `https://github.com/enterprises/megacorp`.
pub fn runner_config_url(html_url: &str, scope_kind: ScopeKind, scope_value: &str) -> String {
    let base = html_url.trim_end_matches('/');
    match scope_kind {
        ScopeKind::Enterprise => format!("{base}/enterprises/{scope_value}"),
        ScopeKind::Organization | ScopeKind::Repository => format!("{base}/{scope_value}"),
    }
}

#[async_trait]
impl TokenBroker for GithubTokenBroker {
    #[instrument(skip(self), fields(scope = %scope_value))]
    async fn issue(
        &self,
        scope_kind: ScopeKind,
        scope_value: &str,
        runner_name: &str,
    ) -> Result<RegistrationToken, TokenError> {
        use secrecy::ExposeSecret;

        let url = self.registration_url(scope_kind, scope_value);
        debug!(runner = %runner_name, "requesting registration token");

        let response = self
            .http
            .post(&url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "ember-controller")
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| TokenError::Transport(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        match status.as_u16() {
            200 | 201 => {
                let body: TokenResponse = response
                    .json()
                    .await
                    .map_err(|e| TokenError::Malformed(e.to_string()))?;
                Ok(RegistrationToken {
                    value: Secret::new(body.token),
                    expires_at: body.expires_at,
                })
            }
            401 | 403 if !is_rate_limited(&headers) => Err(TokenError::ScopeUnauthorized {
                scope: format!("{scope_kind}:{scope_value}"),
                message: format!("HTTP {status}"),
            }),
            403 | 429 => {
                let retry_after = headers
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                Err(TokenError::RateLimited { retry_after })
            }
            _ => Err(TokenError::Transport(format!("HTTP {status}"))),
        }
    }
}

fn is_rate_limited(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "0")
        .unwrap_or(false)
        || headers.contains_key("retry-after")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> GithubTokenBroker {
        GithubTokenBroker::new(
            "https://api.github.com/".to_string(),
            "https://github.com".to_string(),
            Secret::new("ghp_test".to_string()),
        )
    }

    #[test]
    fn registration_url_for_each_scope() {
        let b = broker();
        assert_eq!(
            b.registration_url(ScopeKind::Enterprise, "megacorp"),
            "https://api.github.com/enterprises/megacorp/actions/runners/registration-token"
        );
        assert_eq!(
            b.registration_url(ScopeKind::Organization, "acme"),
            "https://api.github.com/orgs/acme/actions/runners/registration-token"
        );
        assert_eq!(
            b.registration_url(ScopeKind::Repository, "acme/widgets"),
            "https://api.github.com/repos/acme/widgets/actions/runners/registration-token"
        );
    }

    #[test]
    fn runner_config_url_for_each_scope() {
        let b = broker();
        assert_eq!(
            b.runner_config_url(ScopeKind::Enterprise, "megacorp"),
            "https://github.com/enterprises/megacorp"
        );
        assert_eq!(
            b.runner_config_url(ScopeKind::Organization, "acme"),
            "https://github.com/acme"
        );
        assert_eq!(
            b.runner_config_url(ScopeKind::Repository, "acme/widgets"),
            "https://github.com/acme/widgets"
        );
    }

    #[test]
    fn rate_limit_detection_reads_remaining_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert!(!is_rate_limited(&headers));
        headers.insert("x-ratelimit-remaining", "0".parse().unwrap());
        assert!(is_rate_limited(&headers));
    }
}
