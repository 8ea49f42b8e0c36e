//! # HTTP Retrieval Utilities
//!
//! This module provides a robust, asynchronous API client wrapper around `reqwest`.
//! It includes middleware support for exponential backoff retries, a bounded
//! per-request timeout, standardized JSON response handling and raw streaming
//! responses for feeds too large to buffer.

use std::time::Duration;

use reqwest::{header::{HeaderMap, AUTHORIZATION}, Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::{de::DeserializeOwned, Serialize};

/// Default per-request timeout. A timeout counts as a failed fetch.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A standardized container for API responses.
///
/// This struct wraps the deserialized data along with metadata about the
/// HTTP transaction, such as status codes and headers.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles an optional base URL,
/// authentication tokens, and automatic retries of transient failures.
#[derive(Clone)]
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which relative paths are joined. Without one, every
    /// path must be an absolute URL.
    base_url: Option<Url>,
    /// An optional Bearer token used for authorization.
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a new `ApiClient` instance with a retry policy.
    ///
    /// # Arguments
    /// * `base_url` - An optional absolute base URL (e.g., "https://api.example.com/v1/").
    /// * `auth_token` - An optional string for the Authorization header.
    /// * `timeout` - Upper bound for one request, including reading the body.
    ///
    /// # Errors
    /// Returns an error if the base URL is not absolute or the TLS backend
    /// cannot be initialized.
    pub fn new(
        base_url: Option<&str>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        // Parse the base URL to ensure it is valid and absolute
        let base_url = base_url.map(Url::parse).transpose()?;

        // Configure an exponential backoff policy with 3 retries
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("adx-control/1.0")
            .build()?;

        // Construct the client with the retry middleware
        let client = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url,
            auth_token,
        })
    }

    /// Resolves `path` against the base URL, or parses it as absolute.
    fn resolve(&self, path: &str) -> anyhow::Result<Url> {
        match &self.base_url {
            Some(base) => Ok(base.join(path)?),
            None => Ok(Url::parse(path)?),
        }
    }

    /// Performs a generic HTTP request and handles the response.
    ///
    /// This method manages URL joining, header injection, authentication,
    /// and JSON serialization/deserialization.
    ///
    /// # Arguments
    /// * `method` - The HTTP verb (GET, POST, etc.).
    /// * `path` - The relative path to append to the base URL.
    /// * `headers` - Optional additional headers for this specific request.
    /// * `body` - Optional serializable object to send as the JSON body.
    ///
    /// # Errors
    /// Returns an `anyhow::Error` if URL joining or network execution fails.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        // 1. Construct the full absolute URL
        let full_url = self.resolve(path)?;
        let mut req = self.inner.request(method, full_url);

        // 2. Add Custom Headers if provided
        if let Some(h) = headers {
            req = req.headers(h);
        }

        // 3. Inject Bearer Authentication if a token is present
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        // 4. Serialize and attach the JSON body if present
        if let Some(b) = body {
            use reqwest::header::CONTENT_TYPE;
            let json_body = serde_json::to_string(&b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        // 5. Execute the request and capture response metadata
        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();
        let success = status.is_success();

        // 6. Handle the result based on success status
        if success {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            // Capture the error body as a string for debugging
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }

    /// Convenience wrapper for a bodiless `GET` returning JSON.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<ApiResponse<T>> {
        self.request::<T, ()>(Method::GET, path, None, None).await
    }

    /// Issues a `GET` and hands back the response with its body unread, so the
    /// caller can consume it incrementally with `bytes_stream()`.
    ///
    /// # Errors
    /// Returns an error on URL or transport failure. Non-2xx statuses are
    /// returned as a response; check `status()`.
    pub async fn get_stream(&self, path: &str) -> anyhow::Result<reqwest::Response> {
        let full_url = self.resolve(path)?;
        let mut req = self.inner.get(full_url);
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        Ok(req.send().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_and_absolute_paths() {
        let client = ApiClient::new(Some("http://fleet.internal/v1/"), None, DEFAULT_TIMEOUT).unwrap();
        assert_eq!(
            client.resolve("groups/bidder").unwrap().as_str(),
            "http://fleet.internal/v1/groups/bidder"
        );
        assert_eq!(
            client.resolve("https://feeds.example.com/ads?c=1").unwrap().as_str(),
            "https://feeds.example.com/ads?c=1"
        );

        let detached = ApiClient::new(None, None, DEFAULT_TIMEOUT).unwrap();
        assert!(detached.resolve("relative/path").is_err());
    }

    #[test]
    fn rejects_relative_base_url() {
        assert!(ApiClient::new(Some("not a url"), None, DEFAULT_TIMEOUT).is_err());
    }
}
