//! HTTP access to the tiles API.
//!
//! [`Fetcher`] is the seam between the loader and the network, so tests can
//! serve documents from memory. [`HttpFetcher`] is the reqwest-backed
//! implementation, and [`Endpoint`] builds the request URLs.

use std::future::Future;
use std::pin::Pin;

use reqwest::Url;

use crate::error::{Error, Result};
use crate::types::invalid_uri;

/// Query parameter carrying the API key.
const KEY_PARAM: &str = "key";

/// Query parameter carrying the session token.
pub const SESSION_PARAM: &str = "session";

/// Path of the root tileset, relative to the API base URL.
const ROOT_PATH: &str = "v1/3dtiles/root.json";

/// A fetched response body together with the URL it was finally served from.
#[derive(Debug, Clone)]
pub struct Fetched {
    /// URL of the response, after any redirects.
    pub url: Url,
    /// Response body.
    pub body: Vec<u8>,
}

/// Future type for fetch operations.
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Fetched>> + Send + 'a>>;

/// Performs GET requests against the tiles API.
pub trait Fetcher: Send + Sync {
    /// Fetch a URL.
    ///
    /// Implementations return `Error::Http` for transport failures and
    /// `Error::HttpStatus` for non-2xx responses.
    fn fetch(&self, url: &Url) -> FetchFuture<'_>;
}

/// Fetcher backed by a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher with a default HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fetcher around a custom HTTP client.
    #[must_use]
    pub fn with_http(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &Url) -> FetchFuture<'_> {
        let url = url.clone();
        Box::pin(async move {
            tracing::debug!(%url, "fetching");

            let response = self
                .http
                .get(url.clone())
                .send()
                .await
                .map_err(|e| Error::Http {
                    url: url.to_string(),
                    message: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::HttpStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }

            let final_url = response.url().clone();
            let body = response.bytes().await.map_err(|e| Error::Http {
                url: url.to_string(),
                message: e.to_string(),
            })?;

            Ok(Fetched {
                url: final_url,
                body: body.to_vec(),
            })
        })
    }
}

/// Base URL plus API key; builds every request URL the manager issues.
#[derive(Debug, Clone)]
pub struct Endpoint {
    api_url: Url,
    api_key: String,
}

impl Endpoint {
    /// Create an endpoint. `api_url` must already be a valid base URL.
    #[must_use]
    pub fn new(api_url: Url, api_key: String) -> Self {
        Self { api_url, api_key }
    }

    /// Base URL of the API.
    #[must_use]
    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    /// `{apiUrl}v1/3dtiles/root.json?key={apiKey}`.
    pub fn root_url(&self) -> Result<Url> {
        let mut url = self
            .api_url
            .join(ROOT_PATH)
            .map_err(|e| invalid_uri(ROOT_PATH, e))?;
        url.query_pairs_mut().append_pair(KEY_PARAM, &self.api_key);
        Ok(url)
    }

    /// Resolve a content URI against the API base, adding the key and, when
    /// given, the session unless the URI already carries one.
    pub fn content_url(&self, uri: &str, session: Option<&str>) -> Result<Url> {
        let mut url = self.api_url.join(uri).map_err(|e| invalid_uri(uri, e))?;
        let has_session = session_from_url(&url).is_some();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(KEY_PARAM, &self.api_key);
            if let (Some(session), false) = (session, has_session) {
                query.append_pair(SESSION_PARAM, session);
            }
        }
        Ok(url)
    }
}

/// Extract the session token from a URL's query, if present.
#[must_use]
pub fn session_from_url(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(name, _)| name == SESSION_PARAM)
        .map(|(_, value)| value.into_owned())
}
