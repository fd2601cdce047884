//! Delivery of encoded batches to the remote endpoint.
//!
//! The pipeline only talks to the endpoint through the [`Transport`] trait, which takes an
//! already-encoded payload and resolves to the endpoint's response. [`HttpTransport`] is the
//! production implementation: it POSTs the payload over HTTP/1.1, with TLS when the endpoint uses
//! `https`.
use std::{future::Future, pin::Pin, time::Duration};

use bytes::Bytes;
use http_body_util::{BodyExt, Collected, Full};
use hyper::{header, Method, Request, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;
use tracing::warn;

use crate::builder::BuildError;

const USER_AGENT: &str = concat!("tsrelay/", env!("CARGO_PKG_VERSION"));

/// Convenience type for the future returned by a [`Transport`].
pub type TransportFuture =
    Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'static>>;

/// Errors that could occur while delivering a payload.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be built.
    #[error("failed to build request: {0}")]
    Request(#[from] hyper::http::Error),

    /// The request failed before a response was received.
    #[error("request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    /// No complete response was received within the request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// The endpoint's answer to a delivery attempt.
#[derive(Clone, Debug)]
pub struct TransportResponse {
    /// Status code of the response.
    pub status: StatusCode,

    /// Body of the response, decoded lossily.
    pub body: String,
}

impl TransportResponse {
    /// Returns `true` if the endpoint accepted the payload.
    ///
    /// The ingestion API acknowledges a successful write with `204 No Content`; every other status,
    /// including other 2xx codes, means the points were not stored.
    pub fn is_success(&self) -> bool {
        self.status == StatusCode::NO_CONTENT
    }
}

/// Sends encoded payloads to a remote endpoint.
pub trait Transport: Send + Sync + 'static {
    /// Sends a gzip-compressed JSON payload, resolving to the endpoint's response.
    fn send(&self, payload: Bytes) -> TransportFuture;
}

/// Transport that POSTs payloads to an HTTP(S) endpoint.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    endpoint: Uri,
    timeout: Duration,
}

impl HttpTransport {
    /// Creates a new `HttpTransport` for the given endpoint.
    ///
    /// `timeout` bounds the whole exchange, from connecting to reading the response body.
    ///
    /// # Errors
    ///
    /// If the native root certificates cannot be loaded, an error is returned.
    pub fn new(endpoint: Uri, timeout: Duration) -> Result<Self, BuildError> {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| BuildError::TlsRoots(e.to_string()))?
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(https);

        Ok(HttpTransport { client, endpoint, timeout })
    }
}

fn build_request(
    endpoint: &Uri,
    payload: Bytes,
) -> Result<Request<Full<Bytes>>, hyper::http::Error> {
    Request::builder()
        .method(Method::POST)
        .uri(endpoint.clone())
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_ENCODING, "gzip")
        .header(header::USER_AGENT, USER_AGENT)
        .body(Full::new(payload))
}

impl Transport for HttpTransport {
    fn send(&self, payload: Bytes) -> TransportFuture {
        let client = self.client.clone();
        let timeout = self.timeout;
        let request = build_request(&self.endpoint, payload);

        Box::pin(async move {
            let request = request?;
            let exchange = async move {
                let response = client.request(request).await?;
                let status = response.status();
                let body = match response.into_body().collect().await.map(Collected::to_bytes) {
                    Ok(body) => String::from_utf8_lossy(&body).into_owned(),
                    Err(e) => {
                        warn!(error = %e, %status, "Failed to read response body.");
                        String::from("<failed to read response body>")
                    }
                };
                Ok::<_, TransportError>(TransportResponse { status, body })
            };

            match tokio::time::timeout(timeout, exchange).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            }
        })
    }
}


#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use hyper::{header, Method, StatusCode, Uri};

    use super::{build_request, TransportResponse, USER_AGENT};

    #[test]
    fn only_no_content_is_success() {
        let response = |status| TransportResponse { status, body: String::new() };
        assert!(response(StatusCode::NO_CONTENT).is_success());
        assert!(!response(StatusCode::OK).is_success());
        assert!(!response(StatusCode::BAD_REQUEST).is_success());
        assert!(!response(StatusCode::INTERNAL_SERVER_ERROR).is_success());
    }

    #[test]
    fn request_carries_encoding_headers() {
        let endpoint: Uri = "http://127.0.0.1:4242/api/put".parse().unwrap();
        let request = build_request(&endpoint, Bytes::from_static(b"payload")).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri(), &endpoint);
        assert_eq!(request.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(request.headers()[header::CONTENT_ENCODING], "gzip");
        assert_eq!(request.headers()[header::USER_AGENT], USER_AGENT);
        assert!(USER_AGENT.starts_with("tsrelay/"));
    }
}
