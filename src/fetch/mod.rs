//! SSRF-safe document fetching.
//!
//! Every hop (the first request and each redirect) is validated by
//! [`UrlGuard`] before any connection is made, redirects are followed by hand
//! up to a configured limit, and the body is read under a byte cap.

mod guard;
mod transport;

pub use guard::{is_private_ip, UrlGuard};
pub use transport::{
    BodyStream, HopRequest, HopResponse, HopTransport, HostResolver, ReqwestTransport,
    SystemResolver,
};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{self, HeaderMap};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cancel::CallScope;
use crate::config::{FetchConfig, RedirectMethod};
use crate::error::FetchError;
use crate::metrics;

/// Outbound request as issued by a command.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

/// Final response of a fetch, fully read.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    /// URL of the hop that produced this response.
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Redirects followed to get here.
    pub redirects: usize,
}

impl FetchedDocument {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Fetcher that refuses private destinations at every hop.
pub struct SafeFetcher {
    config: FetchConfig,
    guard: UrlGuard,
    transport: Arc<dyn HopTransport>,
}

impl SafeFetcher {
    /// Fetcher using system DNS and reqwest.
    pub fn new(config: &FetchConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(SystemResolver),
            Arc::new(ReqwestTransport::new(config.user_agent.clone())),
        )
    }

    /// Fetcher with explicit resolver and transport.
    pub fn with_parts(
        config: &FetchConfig,
        resolver: Arc<dyn HostResolver>,
        transport: Arc<dyn HopTransport>,
    ) -> Self {
        Self {
            config: config.clone(),
            guard: UrlGuard::new(config.allow_private, resolver),
            transport,
        }
    }

    /// Fetch `request`, following redirects within the configured limit.
    ///
    /// One deadline covers every hop and the body read.
    pub async fn fetch(
        &self,
        request: FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchedDocument, FetchError> {
        let scope = CallScope::new(self.config.timeout(), cancel.clone());
        let result = self.follow(request, &scope).await;

        if let Err(e) = &result {
            tracing::debug!(error = %e, "Fetch failed");
            metrics::record_fetch_error(e.reason());
        }
        result
    }

    async fn follow(
        &self,
        request: FetchRequest,
        scope: &CallScope,
    ) -> Result<FetchedDocument, FetchError> {
        let max_redirects = self.config.max_redirects;
        let mut url = Url::parse(request.url.trim()).map_err(|_| FetchError::InvalidUrl)?;
        let mut method = request.method;
        let mut headers = request.headers;
        let mut body = request.body;

        for hop in 0..=max_redirects {
            let addrs = self.guard.validate(&url, scope).await?;

            let response = scope
                .run(self.transport.send(HopRequest {
                    method: method.clone(),
                    url: url.clone(),
                    headers: headers.clone(),
                    body: body.clone(),
                    addrs,
                }))
                .await??;

            let Some(location) = redirect_location(&response)? else {
                let content = read_capped(response.body, self.config.max_bytes, scope).await?;
                return Ok(FetchedDocument {
                    url,
                    status: response.status,
                    headers: response.headers,
                    body: content,
                    redirects: hop,
                });
            };

            if hop >= max_redirects {
                return Err(FetchError::TooManyRedirects(max_redirects));
            }

            let next = url
                .join(&location)
                .map_err(|_| FetchError::InvalidRedirect(location.clone()))?;
            tracing::debug!(from = %url, to = %next, status = response.status.as_u16(), "Following redirect");

            if self.config.redirect_method == RedirectMethod::Rewrite
                && rewrites_to_get(response.status, &method)
            {
                method = Method::GET;
                body = None;
                headers.remove(header::CONTENT_TYPE);
                headers.remove(header::CONTENT_LENGTH);
            }
            url = next;
        }

        Err(FetchError::TooManyRedirects(max_redirects))
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// `Location` of a redirect response, `None` when the response is final.
fn redirect_location(response: &HopResponse) -> Result<Option<String>, FetchError> {
    if !is_redirect(response.status) {
        return Ok(None);
    }
    match response.headers.get(header::LOCATION) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|s| Some(s.trim().to_string()))
            .map_err(|_| {
                FetchError::InvalidRedirect(String::from_utf8_lossy(value.as_bytes()).into_owned())
            }),
    }
}

/// 303 always becomes GET (HEAD stays HEAD); 301/302 turn anything but
/// GET/HEAD into GET.
fn rewrites_to_get(status: StatusCode, method: &Method) -> bool {
    if *method == Method::GET || *method == Method::HEAD {
        return false;
    }
    matches!(status.as_u16(), 301 | 302 | 303)
}

/// Read a body, failing as soon as it grows past `max_bytes`.
async fn read_capped(
    mut body: BodyStream,
    max_bytes: usize,
    scope: &CallScope,
) -> Result<Bytes, FetchError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = scope.run(body.next()).await? {
        let chunk = chunk?;
        if buf.len() + chunk.len() > max_bytes {
            return Err(FetchError::ResponseTooLarge(max_bytes));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}
