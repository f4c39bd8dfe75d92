//! Shared HTTP client with bounded retries.
//!
//! Every source goes through [`HttpSource`]: transport errors and transient
//! status codes (429/500/502/503/504) are retried with exponential backoff,
//! `Retry-After` is honoured on 429, and everything else fails immediately.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Errors that can occur while talking to a remote source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    #[error("GraphQL errors: {0}")]
    GraphQl(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration for outbound requests.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Request timeout.
    pub timeout: Duration,
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    /// Initial backoff duration for retries.
    pub initial_backoff: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// Status codes worth retrying.
pub fn is_transient(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

#[derive(Debug, Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    config: HttpConfig,
}

impl HttpSource {
    pub fn new(config: HttpConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("pnl-extract/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, config })
    }

    /// GET `url` with query parameters and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let body = self
            .send_with_retry(|client| client.get(url).query(query))
            .await?;
        parse_json(&body)
    }

    /// GET `url` and return the body as text.
    pub async fn get_text(&self, url: &str) -> Result<String, SourceError> {
        self.send_with_retry(|client| client.get(url)).await
    }

    /// POST a JSON body and decode the JSON response.
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T, SourceError> {
        let text = self
            .send_with_retry(|client| client.post(url).json(body))
            .await?;
        parse_json(&text)
    }

    /// POST a GraphQL query and return its `data` payload.
    pub async fn graphql<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, SourceError> {
        let request = GraphQlRequest { query, variables };
        let body = self
            .send_with_retry(|client| client.post(url).json(&request))
            .await?;
        let response: GraphQlResponse<T> = parse_json(&body)?;
        if !response.errors.is_empty() {
            let messages: Vec<&str> = response.errors.iter().map(|e| e.message.as_str()).collect();
            return Err(SourceError::GraphQl(messages.join("; ")));
        }
        response
            .data
            .ok_or_else(|| {
                SourceError::InvalidResponse("GraphQL response without data".to_string())
            })
    }

    /// Makes a request with retry and exponential backoff.
    async fn send_with_retry<F>(&self, build: F) -> Result<String, SourceError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0;

        loop {
            let can_retry = attempt < self.config.max_retries;
            attempt += 1;

            match build(&self.client).send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.text().await?);
                }
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok());
                    if !can_retry {
                        return Err(SourceError::RateLimited(
                            retry_after.unwrap_or(backoff.as_secs()),
                        ));
                    }
                    let wait = retry_after.map(Duration::from_secs).unwrap_or(backoff);
                    warn!(
                        "Rate limited, waiting {:?} (attempt {}/{})",
                        wait, attempt, self.config.max_retries
                    );
                    tokio::time::sleep(wait).await;
                    backoff *= 2;
                }
                Ok(response) => {
                    let status = response.status();
                    if is_transient(status) && can_retry {
                        warn!(
                            "HTTP {} (attempt {}/{}), retrying in {:?}",
                            status, attempt, self.config.max_retries, backoff
                        );
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                        continue;
                    }
                    let body = response.text().await.unwrap_or_default();
                    return Err(SourceError::Status {
                        status: status.as_u16(),
                        body: truncate(&body),
                    });
                }
                Err(e) if can_retry => {
                    warn!(
                        "Request failed: {} (attempt {}/{}), retrying in {:?}",
                        e, attempt, self.config.max_retries, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(SourceError::Http(e)),
            }
        }
    }
}

fn parse_json<T: DeserializeOwned>(body: &str) -> Result<T, SourceError> {
    serde_json::from_str(body).map_err(|e| {
        SourceError::InvalidResponse(format!("JSON parse error: {} (body: {})", e, truncate(body)))
    })
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HttpConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_transient_statuses() {
        for code in [429u16, 500, 502, 503, 504] {
            assert!(is_transient(StatusCode::from_u16(code).unwrap()));
        }
        for code in [400u16, 401, 403, 404, 501] {
            assert!(!is_transient(StatusCode::from_u16(code).unwrap()));
        }
    }

    #[test]
    fn test_graphql_response_with_errors() {
        let json = r#"{"data": null, "errors": [{"message": "block not found"}]}"#;
        let response: GraphQlResponse<serde_json::Value> = serde_json::from_str(json).unwrap();
        assert!(response.data.is_none());
        assert_eq!(response.errors[0].message, "block not found");
    }

    #[test]
    fn test_graphql_response_without_errors() {
        let json = r#"{"data": {"redemptions": []}}"#;
        let response: GraphQlResponse<serde_json::Value> = serde_json::from_str(json).unwrap();
        assert!(response.errors.is_empty());
        assert!(response.data.is_some());
    }

    #[test]
    fn test_parse_json_reports_body() {
        let err = parse_json::<Vec<u32>>("<html>oops</html>").unwrap_err();
        assert!(err.to_string().contains("<html>"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let body = "é".repeat(300);
        assert_eq!(truncate(&body).chars().count(), 200);
    }
}
