//! # Fleet Size Providers
//!
//! The pacing threshold is a global target divided across the serving fleet,
//! so the controller needs the number of live instances in the autoscaling
//! group it runs in.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::retrieve::ApiClient;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FleetError {
    #[error("fleet provider unreachable: {0}")]
    Unreachable(String),

    #[error("fleet provider answered HTTP {0}")]
    Status(u16),

    #[error("group {group:?} matched {matches} groups")]
    Ambiguous { group: String, matches: usize },

    #[error("group {group:?} has no instances in service")]
    Empty { group: String },
}

/// Source of the live instance count of a named group.
#[async_trait]
pub trait FleetSizeProvider: Send + Sync {
    /// # Errors
    ///
    /// Any failure to produce a positive, unambiguous count.
    async fn describe_group(&self, name: &str) -> Result<u64, FleetError>;
}

/// A fixed fleet size, for single-instance deployments and tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticFleetSize(pub u64);

#[async_trait]
impl FleetSizeProvider for StaticFleetSize {
    async fn describe_group(&self, name: &str) -> Result<u64, FleetError> {
        if self.0 == 0 {
            return Err(FleetError::Empty {
                group: name.to_string(),
            });
        }
        Ok(self.0)
    }
}

#[derive(Debug, Deserialize)]
struct GroupsResponse {
    #[serde(default)]
    groups: Vec<GroupDescription>,
}

#[derive(Debug, Deserialize)]
struct GroupDescription {
    #[allow(dead_code)]
    name: String,
    instances: u64,
}

/// Asks an inventory service for `GET <base>/groups/<name>`, which answers
/// `{"groups": [{"name": "bidder", "instances": 12}]}`.
#[derive(Clone)]
pub struct HttpFleetSizeProvider {
    client: ApiClient,
}

impl HttpFleetSizeProvider {
    /// `client` must carry the service base URL.
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FleetSizeProvider for HttpFleetSizeProvider {
    async fn describe_group(&self, name: &str) -> Result<u64, FleetError> {
        let response = self
            .client
            .get_json::<GroupsResponse>(&format!("groups/{name}"))
            .await
            .map_err(|e| FleetError::Unreachable(format!("{e:#}")))?;

        if !response.success {
            return Err(FleetError::Status(response.status));
        }
        let groups = response.data.map(|r| r.groups).unwrap_or_default();

        match groups.as_slice() {
            [group] if group.instances > 0 => Ok(group.instances),
            [_] | [] => Err(FleetError::Empty {
                group: name.to_string(),
            }),
            many => Err(FleetError::Ambiguous {
                group: name.to_string(),
                matches: many.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieve::DEFAULT_TIMEOUT;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serves one HTTP response on a random local port and returns its base URL.
    fn serve_once(status: &'static str, body: &'static str) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).unwrap();
                stream.flush().unwrap();
            }
        });
        (format!("http://127.0.0.1:{port}/"), handle)
    }

    async fn describe(status: &'static str, body: &'static str) -> Result<u64, FleetError> {
        let (base, handle) = serve_once(status, body);
        let client = ApiClient::new(Some(&base), None, DEFAULT_TIMEOUT).unwrap();
        let result = HttpFleetSizeProvider::new(client).describe_group("bidder").await;
        handle.join().unwrap();
        result
    }

    #[tokio::test]
    async fn reads_instance_count_of_single_group() {
        let result = describe("200 OK", r#"{"groups":[{"name":"bidder","instances":4}]}"#).await;
        assert_eq!(result, Ok(4));
    }

    #[tokio::test]
    async fn zero_and_ambiguous_membership_are_errors() {
        let empty = describe("200 OK", r#"{"groups":[{"name":"bidder","instances":0}]}"#).await;
        assert!(matches!(empty, Err(FleetError::Empty { .. })));

        let none = describe("200 OK", r#"{"groups":[]}"#).await;
        assert!(matches!(none, Err(FleetError::Empty { .. })));

        let many = describe(
            "200 OK",
            r#"{"groups":[{"name":"bidder","instances":2},{"name":"bidder-canary","instances":1}]}"#,
        )
        .await;
        assert_eq!(
            many,
            Err(FleetError::Ambiguous {
                group: "bidder".to_string(),
                matches: 2
            })
        );
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let result = describe("404 Not Found", r#"{"message":"no such group"}"#).await;
        assert_eq!(result, Err(FleetError::Status(404)));
    }

    #[tokio::test]
    async fn static_size_of_zero_is_empty() {
        assert_eq!(StaticFleetSize(3).describe_group("g").await, Ok(3));
        assert!(StaticFleetSize(0).describe_group("g").await.is_err());
    }
}
