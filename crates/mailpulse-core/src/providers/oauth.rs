//! OAuth refresh-token exchange for vendor APIs

use super::http::classify_status;
use mailpulse_common::{Error, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Refresh this long before the provider-reported expiry
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Short-lived bearer token
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Instant,
}

impl AccessToken {
    pub fn is_fresh(&self) -> bool {
        Instant::now() + EXPIRY_SKEW < self.expires_at
    }
}

/// Exchanges a stored refresh token for access tokens, caching the result
pub struct TokenSource {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    scope: Option<String>,
    cached: Option<AccessToken>,
}

impl TokenSource {
    pub fn new(
        client: Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
            scope: None,
            cached: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Current bearer token, refreshed when missing or about to expire
    pub async fn bearer(&mut self) -> Result<String> {
        if let Some(token) = self.cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.token.clone());
        }
        let token = self.refresh().await?;
        let value = token.token.clone();
        self.cached = Some(token);
        Ok(value)
    }

    /// Forget the cached token so the next call performs a refresh
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    async fn refresh(&self) -> Result<AccessToken> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", self.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        if let Some(scope) = &self.scope {
            form.push(("scope", scope.as_str()));
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::TransientProtocol(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.contains("invalid_grant") || status.as_u16() == 400 || status.as_u16() == 401 {
                return Err(Error::AuthExpired(format!(
                    "token refresh rejected with status {}: {}",
                    status, body
                )));
            }
            return Err(classify_status(status, &body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::TransientProtocol(format!("invalid token response: {}", e)))?;

        debug!("Access token refreshed");
        Ok(AccessToken {
            token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in.unwrap_or(3600)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_bearer_is_cached_until_invalidated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.first",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let mut source = TokenSource::new(
            Client::new(),
            format!("{}/token", server.uri()),
            "client",
            "secret",
            "1//refresh",
        );
        assert_eq!(source.bearer().await.unwrap(), "ya29.first");
        assert_eq!(source.bearer().await.unwrap(), "ya29.first");
        source.invalidate();
        assert_eq!(source.bearer().await.unwrap(), "ya29.first");
    }

    #[tokio::test]
    async fn test_invalid_grant_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;

        let mut source = TokenSource::new(Client::new(), server.uri(), "c", "s", "revoked");
        assert!(matches!(source.bearer().await, Err(Error::AuthExpired(_))));
    }
}
