//! Convoy HTTP Client
//!
//! A type-safe HTTP client for the Convoy server API, shared by the agent
//! (dispatch protocol) and the CLI (job management).
//!
//! # Example
//!
//! ```no_run
//! use convoy_client::QueueClient;
//! use convoy_core::domain::pipeline::{Pipeline, Step};
//! use convoy_core::dto::job::CreateJob;
//!
//! # async fn example() -> convoy_client::Result<()> {
//! let client = QueueClient::new("http://localhost:8080");
//! let pipeline = Pipeline::new("ci", vec![Step::new("test", "rust:1", vec!["cargo test".into()])]);
//! let job = client.create_job(CreateJob::new(pipeline)).await?;
//! println!("Enqueued job: {}", job.id);
//! # Ok(())
//! # }
//! ```

pub mod error;
mod jobs;
mod rpc;

pub use error::{ClientError, Result};

use convoy_core::dto::rpc::MAX_POLL_WINDOW;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Timeout for ordinary requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for long-poll requests; servers hold a poll open at most
/// [`MAX_POLL_WINDOW`]
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(MAX_POLL_WINDOW.as_secs() + 30);

/// HTTP client for the Convoy server API
#[derive(Debug, Clone)]
pub struct QueueClient {
    /// Base URL of the server (e.g., "http://localhost:8080")
    base_url: String,
    /// Shared bearer token
    token: Option<String>,
    /// HTTP client instance
    client: Client,
}

impl QueueClient {
    /// Create a new client
    ///
    /// # Example
    /// ```
    /// use convoy_client::QueueClient;
    ///
    /// let client = QueueClient::new("http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new client with a custom HTTP client
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            client,
        }
    }

    /// Authenticate every request with `token`
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    /// Get the base URL of the server
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.get(self.url(path)).timeout(REQUEST_TIMEOUT))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.post(self.url(path)).timeout(REQUEST_TIMEOUT))
    }

    fn long_poll(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.post(self.url(path)).timeout(LONG_POLL_TIMEOUT))
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Fail on non-success status codes, keeping the error body as message
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(response)
    }

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response that returns no content
    async fn handle_empty_response(response: reqwest::Response) -> Result<()> {
        Self::check(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = QueueClient::new("http://localhost:8080/");
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(client.url("/health"), "http://localhost:8080/health");
    }

    #[test]
    fn test_empty_token_is_ignored() {
        let client = QueueClient::new("http://localhost:8080").with_token(Some(String::new()));
        assert!(client.token.is_none());

        let client = client.with_token(Some("secret".to_string()));
        assert_eq!(client.token.as_deref(), Some("secret"));
    }
}
