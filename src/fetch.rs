//! Network access used to fill gaps in the embedded data: issuer
//! certificates from AIA, CRLs from distribution points and OCSP responses.
//!
//! The engine only knows the [`Fetcher`] trait. [`NoFetch`] keeps a
//! validation fully offline, and [`HttpFetcher`] (feature `http`) talks to
//! real endpoints.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use base64::Engine;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("timed out after {0:?} fetching {1}")]
    Timeout(Duration, String),
    #[error("could not reach {0}: {1}")]
    Unreachable(String, String),
    #[error("{0} answered with HTTP status {1}")]
    Status(String, u16),
    #[error("validation was cancelled")]
    Cancelled,
    #[error("unsupported URI scheme: {0}")]
    Unsupported(String),
    #[error("network access is disabled")]
    Offline,
}

/// Retrieves the resource at `uri`, giving up after `timeout`.
///
/// Implementations must honor the timeout: a blocked fetch would stall the
/// whole validation run.
pub trait Fetcher: Sync {
    fn fetch(&self, uri: &str, timeout: Duration) -> Result<Vec<u8>, FetchError>;
}

impl<F: Fetcher + ?Sized> Fetcher for &F {
    fn fetch(&self, uri: &str, timeout: Duration) -> Result<Vec<u8>, FetchError> {
        (**self).fetch(uri, timeout)
    }
}

/// A fetcher that never touches the network.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFetch;

impl Fetcher for NoFetch {
    fn fetch(&self, _uri: &str, _timeout: Duration) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::Offline)
    }
}

/// Cooperative cancellation flag shared between the caller and a running
/// validation.
#[derive(Debug, Default, Clone)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Wraps a fetcher so that it refuses to start new requests once the token
/// is cancelled.
pub(crate) struct Guarded<'a, F: ?Sized> {
    pub fetcher: &'a F,
    pub cancel: &'a CancellationToken,
    pub timeout: Duration,
}

impl<F: Fetcher + ?Sized> Guarded<'_, F> {
    pub fn fetch(&self, uri: &str) -> Result<Vec<u8>, FetchError> {
        if self.cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        log::debug!("fetching {uri}");
        let result = self.fetcher.fetch(uri, self.timeout);
        if let Err(err) = &result {
            log::warn!("fetch of {uri} failed: {err}");
        }
        result
    }
}

/// Builds the GET form of an OCSP request (RFC 6960, appendix A.1): the DER
/// request, base64 encoded and then URL encoded, appended to the responder
/// URI.
pub fn ocsp_get_uri(responder: &str, request_der: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(request_der);
    let escaped: String = url::form_urlencoded::byte_serialize(encoded.as_bytes()).collect();
    if responder.ends_with('/') {
        format!("{responder}{escaped}")
    } else {
        format!("{responder}/{escaped}")
    }
}

/// Blocking HTTP fetcher on top of `reqwest`.
#[cfg(feature = "http")]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http")]
impl HttpFetcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("trust_ltv/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http")]
impl Fetcher for HttpFetcher {
    fn fetch(&self, uri: &str, timeout: Duration) -> Result<Vec<u8>, FetchError> {
        let parsed = url::Url::parse(uri).map_err(|_| FetchError::Unsupported(uri.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::Unsupported(uri.to_string()));
        }

        let response = self
            .client
            .get(parsed)
            .timeout(timeout)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout(timeout, uri.to_string())
                } else {
                    FetchError::Unreachable(uri.to_string(), e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(uri.to_string(), status.as_u16()));
        }

        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| FetchError::Unreachable(uri.to_string(), e.to_string()))
    }
}
