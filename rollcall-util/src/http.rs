pub use client::{Client, ClientError, HeaderMap, Method, Response, StatusCode};
pub use uri::{InvalidUriError, Uri};

mod uri {
    use std::fmt::Display;
    use std::str::FromStr;

    use axum::http::{self, uri::PathAndQuery};
    use thiserror::Error;

    /// The server address or an endpoint path could not be parsed
    #[derive(Debug, Error)]
    #[error("invalid uri: {0}")]
    pub struct InvalidUriError(String);

    impl From<http::uri::InvalidUri> for InvalidUriError {
        fn from(value: http::uri::InvalidUri) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    impl From<http::uri::InvalidUriParts> for InvalidUriError {
        fn from(value: http::uri::InvalidUriParts) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    /// Absolute URI of the attendance server or one of its endpoints
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct Uri(http::Uri);

    impl Uri {
        pub fn host(&self) -> Option<&str> {
            self.0.host()
        }

        /// Port of the URI, falling back to the scheme default
        pub fn port_or_default(&self) -> u16 {
            match (self.0.port_u16(), self.0.scheme_str()) {
                (Some(port), _) => port,
                (None, Some("https")) => 443,
                (None, _) => 80,
            }
        }

        /// Resolve `path` under `base_uri`
        ///
        /// The path is appended to whatever prefix the base already carries,
        /// since the server may be mounted under one, e.g.
        /// `http://10.0.0.2:8000/api/devices`.
        pub fn from_parts(
            base_uri: Uri,
            path: &str,
            query: Option<&str>,
        ) -> Result<Self, InvalidUriError> {
            let mut target = format!(
                "{}/{}",
                base_uri.0.path().trim_end_matches('/'),
                path.trim_start_matches('/')
            );
            if let Some(qs) = query {
                target.push('?');
                target.push_str(qs);
            }

            let mut parts = base_uri.0.into_parts();
            parts.path_and_query = Some(PathAndQuery::from_maybe_shared(target)?);
            let uri = http::Uri::from_parts(parts)?;
            Ok(Self(uri))
        }
    }

    impl Display for Uri {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    impl FromStr for Uri {
        type Err = InvalidUriError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let uri = http::Uri::from_str(s)?;
            Ok(Self(uri))
        }
    }

    impl TryFrom<String> for Uri {
        type Error = InvalidUriError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            value.parse()
        }
    }
}

mod client {
    use std::time::Duration;

    use reqwest::RequestBuilder;
    use serde::de::DeserializeOwned;

    use super::uri::Uri;

    pub type Method = reqwest::Method;
    pub type StatusCode = reqwest::StatusCode;
    pub type HeaderMap = reqwest::header::HeaderMap;

    #[derive(Debug, thiserror::Error)]
    pub enum ClientError {
        /// The request could not be sent or no response arrived in time
        #[error(transparent)]
        Send(reqwest::Error),

        /// The response body could not be read
        #[error(transparent)]
        Body(reqwest::Error),
    }

    impl ClientError {
        /// True if the request did not complete within the client timeout
        pub fn is_timeout(&self) -> bool {
            match self {
                ClientError::Send(err) | ClientError::Body(err) => err.is_timeout(),
            }
        }
    }

    #[derive(Debug)]
    pub struct Response(reqwest::Response);

    impl Response {
        pub fn status(&self) -> StatusCode {
            self.0.status()
        }

        pub fn headers(&self) -> &HeaderMap {
            self.0.headers()
        }

        pub async fn json<T: DeserializeOwned>(self) -> Result<T, ClientError> {
            self.0.json().await.map_err(ClientError::Body)
        }

        pub async fn text(self) -> Result<String, ClientError> {
            self.0.text().await.map_err(ClientError::Body)
        }
    }

    /// HTTP client where every request is bounded by a timeout
    #[derive(Debug, Clone)]
    pub struct Client {
        inner: reqwest::Client,
        timeout: Duration,
    }

    impl Client {
        pub fn new(timeout: Duration) -> Self {
            Self {
                inner: reqwest::Client::new(),
                timeout,
            }
        }

        /// Send a request to `uri`, letting `build` add headers and a body
        pub async fn request<F>(
            &self,
            method: Method,
            uri: &Uri,
            build: F,
        ) -> Result<Response, ClientError>
        where
            F: FnOnce(RequestBuilder) -> RequestBuilder,
        {
            let request = self
                .inner
                .request(method, uri.to_string())
                .timeout(self.timeout);

            build(request)
                .send()
                .await
                .map(Response)
                .map_err(ClientError::Send)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_parts_replaces_path_on_bare_endpoint() {
        let base: Uri = "http://10.66.19.27:8000".parse().unwrap();
        let uri = Uri::from_parts(base, "/heartbeat", None).unwrap();
        assert_eq!(uri.to_string(), "http://10.66.19.27:8000/heartbeat");
    }

    #[test]
    fn test_from_parts_keeps_base_path_prefix() {
        let base: Uri = "http://example.com/admin-panel/api/esp32/".parse().unwrap();
        let uri = Uri::from_parts(base, "/active-session", Some("location=LT1")).unwrap();
        assert_eq!(
            uri.to_string(),
            "http://example.com/admin-panel/api/esp32/active-session?location=LT1"
        );
    }

    #[test]
    fn test_port_falls_back_to_scheme_default() {
        let http: Uri = "http://example.com".parse().unwrap();
        let https: Uri = "https://example.com".parse().unwrap();
        let explicit: Uri = "http://example.com:8000".parse().unwrap();

        assert_eq!(http.port_or_default(), 80);
        assert_eq!(https.port_or_default(), 443);
        assert_eq!(explicit.port_or_default(), 8000);
        assert_eq!(explicit.host(), Some("example.com"));
    }
}
