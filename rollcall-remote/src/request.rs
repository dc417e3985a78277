use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{Span, field, instrument};

use crate::util::http::{Client, ClientError, InvalidUriError, Method, Response, StatusCode, Uri};

/// Errors that can occur when talking to the attendance server.
///
/// Every request either succeeds or fails with exactly one of these,
/// which tells the caller whether trying again can help.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The request never got a response: timeout, connection refused,
    /// DNS failure and the like.
    #[error("request failed: {0}")]
    Transport(String),

    /// The server refused the request (4xx). Repeating it will not help.
    #[error("server rejected request with {status}: {reason}")]
    Rejected { status: StatusCode, reason: String },

    /// The server could not handle the request right now (5xx or 429).
    #[error("server unavailable: {status}")]
    Unavailable {
        status: StatusCode,
        retry_after: Option<Duration>,
    },

    /// The server replied with success but the body could not be decoded
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl RequestError {
    /// Returns true if a later attempt of the same request may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RequestError::Rejected { .. })
    }

    /// Server provided hint of how long to wait before retrying
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RequestError::Unavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<ClientError> for RequestError {
    fn from(err: ClientError) -> Self {
        if err.is_timeout() {
            RequestError::Transport(format!("timed out: {err}"))
        } else {
            RequestError::Transport(err.to_string())
        }
    }
}

/// Metrics tracking the success and failure counts for HTTP requests.
#[derive(Debug, Clone, Copy)]
pub struct RequestMetrics {
    /// Number of successful HTTP requests (2xx status codes).
    pub success_count: u64,
    /// Number of failed HTTP requests (4xx, 5xx status codes, network errors).
    pub error_count: u64,
}

impl RequestMetrics {
    /// Returns the total number of requests made (successful + failed).
    pub fn total_requests(&self) -> u64 {
        self.success_count + self.error_count
    }

    /// Returns the success rate as a percentage (0.0 to 100.0).
    ///
    /// Returns 0.0 if no requests have been made yet.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            (self.success_count as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    success: AtomicU64,
    error: AtomicU64,
}

/// A single server endpoint
///
/// Requests are single-shot: retry policy belongs to the caller, which
/// decides based on the returned [`RequestError`]. Cloning is cheap and
/// clones share the connection pool and metrics.
#[derive(Debug, Clone)]
pub struct Endpoint {
    client: Client,
    uri: Uri,
    counters: Arc<Counters>,
}

impl Endpoint {
    /// Creates a new endpoint for `path` under the server base URI
    pub fn new(base: &Uri, path: &str, timeout: Duration) -> Result<Self, InvalidUriError> {
        let uri = Uri::from_parts(base.clone(), path, None)?;
        Ok(Self {
            client: Client::new(timeout),
            uri,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Send `payload` as a JSON body. Any 2xx response is an acknowledgment.
    #[instrument(level = "trace", skip_all, fields(uri = %self.uri, response = field::Empty), err(level = "debug"))]
    pub async fn post<P: Serialize + ?Sized>(&self, payload: &P) -> Result<(), RequestError> {
        let response = self
            .client
            .request(Method::POST, &self.uri, |request| {
                request
                    .header("Content-Type", "application/json")
                    .json(payload)
            })
            .await
            .inspect_err(|_| self.record_failure())?;

        self.check_status(response).await.map(|_| ())
    }

    /// Query the endpoint and decode the JSON response
    #[instrument(level = "trace", skip_all, fields(uri = %self.uri, response = field::Empty), err(level = "debug"))]
    pub async fn get<T: DeserializeOwned>(
        &self,
        query: &[(&str, &str)],
    ) -> Result<T, RequestError> {
        let response = self
            .client
            .request(Method::GET, &self.uri, |request| {
                request.header("Accept", "application/json").query(query)
            })
            .await
            .inspect_err(|_| self.record_failure())?;

        let response = self.check_status(response).await?;
        response.json().await.map_err(|e| {
            // a success response we cannot read is a server problem
            self.record_failure();
            RequestError::Decode(e.to_string())
        })
    }

    async fn check_status(&self, response: Response) -> Result<Response, RequestError> {
        let status = response.status();
        Span::current().record("response", field::display(status));

        match status {
            status if status.is_success() => {
                self.record_success();
                Ok(response)
            }
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                self.record_failure();
                let retry_after = parse_retry_after(&response);
                Err(RequestError::Unavailable {
                    status,
                    retry_after,
                })
            }
            status if status.is_server_error() => {
                self.record_failure();
                Err(RequestError::Unavailable {
                    status,
                    retry_after: None,
                })
            }
            _ => {
                // Other responses are permanent client errors
                self.record_failure();
                let reason = response.text().await.unwrap_or_default();
                Err(RequestError::Rejected {
                    status,
                    reason: truncate(reason, 256),
                })
            }
        }
    }

    fn record_success(&self) {
        self.counters.success.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.counters.error.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns current request metrics including success and error counts.
    pub fn metrics(&self) -> RequestMetrics {
        RequestMetrics {
            success_count: self.counters.success.load(Ordering::Relaxed),
            error_count: self.counters.error.load(Ordering::Relaxed),
        }
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde::Deserialize;
    use serde_json::json;

    async fn endpoint_for(server: &Server, path: &str) -> Endpoint {
        let base: Uri = server.url().try_into().unwrap();
        Endpoint::new(&base, path, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_post_success_is_acknowledged() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/attendance")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({"studentToken": "abc"})))
            .with_status(201)
            .with_body(r#"{"status": "success"}"#)
            .create_async()
            .await;

        let endpoint = endpoint_for(&server, "/attendance").await;
        endpoint
            .post(&json!({"studentToken": "abc"}))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(endpoint.metrics().success_count, 1);
    }

    #[tokio::test]
    async fn test_post_client_error_is_rejected() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/attendance")
            .with_status(403)
            .with_body("student not enrolled")
            .create_async()
            .await;

        let endpoint = endpoint_for(&server, "/attendance").await;
        let err = endpoint.post(&json!({})).await.unwrap_err();

        assert!(!err.is_retryable());
        match err {
            RequestError::Rejected { status, reason } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(reason, "student not enrolled");
            }
            other => panic!("unexpected error {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_server_error_is_retryable() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/heartbeat")
            .with_status(500)
            .create_async()
            .await;

        let endpoint = endpoint_for(&server, "/heartbeat").await;
        let err = endpoint.post(&json!({})).await.unwrap_err();

        assert!(err.is_retryable());
        assert!(matches!(
            err,
            RequestError::Unavailable {
                retry_after: None,
                ..
            }
        ));
        assert_eq!(endpoint.metrics().error_count, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/attendance")
            .with_status(429)
            .with_header("retry-after", "7")
            .create_async()
            .await;

        let endpoint = endpoint_for(&server, "/attendance").await;
        let err = endpoint.post(&json!({})).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_connection_refused_is_a_transport_error() {
        // grab a free port and release it so nothing is listening there
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let base: Uri = format!("http://127.0.0.1:{port}").parse().unwrap();
        let endpoint = Endpoint::new(&base, "/heartbeat", Duration::from_secs(1)).unwrap();
        let err = endpoint.post(&json!({})).await.unwrap_err();

        assert!(matches!(err, RequestError::Transport(_)));
        assert!(err.is_retryable());
        assert_eq!(endpoint.metrics().error_count, 1);
    }

    #[tokio::test]
    async fn test_success_rate_counts_every_outcome() {
        let mut server = Server::new_async().await;
        let ok = server
            .mock("POST", "/heartbeat")
            .with_status(200)
            .expect(3)
            .create_async()
            .await;

        let endpoint = endpoint_for(&server, "/heartbeat").await;
        assert_eq!(endpoint.metrics().success_rate(), 0.0);

        for _ in 0..3 {
            endpoint.post(&json!({})).await.unwrap();
        }
        ok.assert_async().await;
        ok.remove_async().await;

        server
            .mock("POST", "/heartbeat")
            .with_status(503)
            .create_async()
            .await;
        assert!(endpoint.post(&json!({})).await.is_err());

        let metrics = endpoint.metrics();
        assert_eq!(metrics.total_requests(), 4);
        assert_eq!(metrics.success_rate(), 75.0);
    }

    #[derive(Deserialize, Debug, PartialEq)]
    struct Status {
        status: String,
    }

    #[tokio::test]
    async fn test_get_decodes_json_with_query() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/active-session")
            .match_query(Matcher::UrlEncoded("location".into(), "Lecture Theatre 1".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status": "running"}"#)
            .create_async()
            .await;

        let endpoint = endpoint_for(&server, "/active-session").await;
        let status: Status = endpoint
            .get(&[("location", "Lecture Theatre 1")])
            .await
            .unwrap();

        assert_eq!(
            status,
            Status {
                status: "running".into()
            }
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_with_invalid_body_is_a_decode_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/active-session")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let endpoint = endpoint_for(&server, "/active-session").await;
        let res: Result<Status, _> = endpoint.get(&[]).await;

        let err = res.unwrap_err();
        assert!(matches!(err, RequestError::Decode(_)));
        assert!(err.is_retryable());
    }
}
