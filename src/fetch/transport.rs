//! Network seams for the fetcher: name resolution and single-hop requests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::redirect::Policy;
use reqwest::{Method, StatusCode};
use std::net::SocketAddr;
use std::pin::Pin;
use url::Url;

use crate::error::FetchError;

/// Response body as it arrives from the network.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchError>> + Send>>;

/// Resolves a hostname to every address it maps to.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, FetchError>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, FetchError> {
        tokio::net::lookup_host((host, port))
            .await
            .map(|addrs| addrs.collect())
            .map_err(|e| {
                tracing::debug!(host, error = %e, "DNS lookup failed");
                FetchError::DnsResolutionFailed(host.to_string())
            })
    }
}

/// One outbound hop. Redirects are never followed by the transport.
#[derive(Debug, Clone)]
pub struct HopRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Validated addresses the connection is pinned to.
    pub addrs: Vec<SocketAddr>,
}

/// Status, headers and the unread body of one hop.
pub struct HopResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl std::fmt::Debug for HopResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HopResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Sends a single request without following redirects.
#[async_trait]
pub trait HopTransport: Send + Sync {
    async fn send(&self, request: HopRequest) -> Result<HopResponse, FetchError>;
}

/// reqwest-backed transport that connects only to the validated addresses.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    user_agent: String,
}

impl ReqwestTransport {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }

    fn client_for(&self, request: &HopRequest) -> Result<reqwest::Client, FetchError> {
        let mut builder = reqwest::Client::builder()
            .redirect(Policy::none())
            .user_agent(self.user_agent.as_str());

        if let Some(host) = request.url.host_str() {
            builder = builder.resolve_to_addrs(host, &request.addrs);
        }

        builder
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))
    }
}

#[async_trait]
impl HopTransport for ReqwestTransport {
    async fn send(&self, request: HopRequest) -> Result<HopResponse, FetchError> {
        let client = self.client_for(&request)?;

        let mut builder = client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| FetchError::Network(e.to_string())));

        Ok(HopResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}
