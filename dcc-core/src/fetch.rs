//! Retrieval of remote resources (DCC documents, XSD schemas, CRLs).
use std::fmt::Debug;

use reqwest::blocking::Client;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

/// Errors returned while fetching a remote resource.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Unexpected HTTP status {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Source of bytes for a URL.
///
/// Every call is a single attempt; implementations must not retry.
pub trait Fetcher: Debug + Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Blocking HTTP fetcher bounded by [`Config::http_timeout`].
///
/// # Examples
/// ```rust,no_run
/// use dcc_core::config::Config;
/// use dcc_core::fetch::{Fetcher, HttpFetcher};
///
/// let fetcher = HttpFetcher::new(&Config::default())?;
/// let bytes = fetcher.fetch("https://example.org/dcc.xml")?;
/// # let _ = bytes;
/// # Ok::<(), dcc_core::fetch::FetchError>(())
/// ```
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// # Errors
    /// Returns [`FetchError::Http`] if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.http_timeout())
            .user_agent(config.user_agent())
            .build()
            .map_err(FetchError::Http)?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        debug!(url, "fetching remote resource");
        let response = self.client.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes()?;
        debug!(url, bytes = body.len(), "fetched remote resource");
        Ok(body.to_vec())
    }
}
