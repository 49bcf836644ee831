//! REST plumbing shared by the vendor clients
//!
//! Requests carry explicit timeouts. HTTP 429 is retried a bounded number of
//! times, honouring a numeric `Retry-After` when the provider sends one.

use mailpulse_common::{Error, Result};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::warn;

/// Longest pause between rate-limit retries when the provider gives no hint
const MAX_RATE_LIMIT_PAUSE: Duration = Duration::from_secs(10);

/// HTTP client with rate-limit aware GET
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    max_rate_limit_retries: u32,
}

impl RestClient {
    pub fn new(timeout: Duration, max_rate_limit_retries: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_rate_limit_retries,
        })
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// GET `url` with a bearer token and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        bearer: &str,
        headers: &[(&str, String)],
    ) -> Result<T> {
        let response = self
            .send_with_retry(|| {
                let mut request = self.client.get(url).bearer_auth(bearer).query(query);
                for (name, value) in headers {
                    request = request.header(*name, value.as_str());
                }
                request
            })
            .await?;

        response
            .json::<T>()
            .await
            .map_err(|e| Error::TransientProtocol(format!("invalid response body from {}: {}", url, e)))
    }

    /// Send, retrying on 429, and map any other failure status to an error
    pub async fn send_with_retry<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            let response = build()
                .send()
                .await
                .map_err(|e| Error::TransientProtocol(format!("request failed: {}", e)))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = retry_after(response.headers());
                if attempt >= self.max_rate_limit_retries {
                    return Err(Error::RateLimited { retry_after });
                }
                let pause = retry_after.unwrap_or_else(|| rate_limit_pause(attempt));
                warn!(attempt, pause_secs = pause.as_secs(), "Rate limited, backing off");
                tokio::time::sleep(pause).await;
                attempt += 1;
                continue;
            }

            if status.is_success() {
                return Ok(response);
            }

            let body = response.text().await.unwrap_or_else(|e| {
                warn!("Failed to read error response body: {}", e);
                String::new()
            });
            return Err(classify_status(status, &body));
        }
    }
}

/// Numeric `Retry-After` header in seconds
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Fallback pause before retry number `attempt + 1`
pub fn rate_limit_pause(attempt: u32) -> Duration {
    Duration::from_secs(1 + attempt as u64).min(MAX_RATE_LIMIT_PAUSE)
}

/// Map a failed HTTP status to the sync error taxonomy
pub fn classify_status(status: StatusCode, body: &str) -> Error {
    let lower = body.to_ascii_lowercase();
    let summary: String = body.chars().take(300).collect();
    match status {
        StatusCode::UNAUTHORIZED => Error::AuthExpired(format!("status {}: {}", status, summary)),
        StatusCode::FORBIDDEN if lower.contains("invalid_grant") || lower.contains("unauthorized") => {
            Error::AuthExpired(format!("status {}: {}", status, summary))
        }
        StatusCode::GONE => Error::AnchorInvalid(format!("status {}: {}", status, summary)),
        StatusCode::NOT_FOUND => Error::NotFound(format!("status {}: {}", status, summary)),
        s if s.is_server_error() => {
            Error::TransientProtocol(format!("status {}: {}", status, summary))
        }
        _ if lower.contains("syncstatenotfound") || lower.contains("syncstateinvalid") => {
            Error::AnchorInvalid(format!("status {}: {}", status, summary))
        }
        _ => Error::TransientProtocol(format!("status {}: {}", status, summary)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_rate_limit_pause_is_capped() {
        assert_eq!(rate_limit_pause(0), Duration::from_secs(1));
        assert_eq!(rate_limit_pause(3), Duration::from_secs(4));
        assert_eq!(rate_limit_pause(20), Duration::from_secs(10));
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            Error::AuthExpired(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::GONE, "{}"),
            Error::AnchorInvalid(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "{\"error\":{\"code\":\"SyncStateNotFound\"}}"),
            Error::AnchorInvalid(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            Error::TransientProtocol(_)
        ));
    }

    #[tokio::test]
    async fn test_get_json_retries_after_429() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"n": 3})))
            .mount(&server)
            .await;

        let client = RestClient::new(Duration::from_secs(5), 5).unwrap();
        let value: serde_json::Value = client
            .get_json(&format!("{}/items", server.uri()), &[], "tok", &[])
            .await
            .unwrap();
        assert_eq!(value["n"], 3);
    }

    #[tokio::test]
    async fn test_get_json_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .mount(&server)
            .await;

        let client = RestClient::new(Duration::from_secs(5), 2).unwrap();
        let err = client
            .get_json::<serde_json::Value>(&server.uri(), &[], "tok", &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RateLimited {
                retry_after: Some(d)
            } if d == Duration::ZERO
        ));
    }
}
