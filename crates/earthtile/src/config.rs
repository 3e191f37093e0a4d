//! Manager configuration.

use reqwest::Url;

use crate::error::{Error, Result};
use crate::fetch::Endpoint;

/// Base URL of Google's Map Tiles API.
pub const DEFAULT_API_URL: &str = "https://tile.googleapis.com/";

/// Connection settings for a [`TileManager`](crate::TileManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// API key sent as the `key` query parameter on every request.
    pub api_key: String,
    /// Base URL every content URI is resolved against.
    pub api_url: String,
}

impl ManagerConfig {
    /// Create a configuration for the default API URL.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_url: DEFAULT_API_URL.to_string(),
        }
    }

    /// Use a different API base URL, e.g. a proxy or a test server.
    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Validate the settings and build the request endpoint.
    pub(crate) fn endpoint(&self) -> Result<Endpoint> {
        if self.api_key.trim().is_empty() {
            return Err(Error::InvalidConfig {
                detail: "api key is empty".to_string(),
            });
        }

        // Relative URIs resolve against the last path segment, so the base
        // must end in a slash.
        let mut base = self.api_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let api_url = Url::parse(&base).map_err(|e| Error::InvalidConfig {
            detail: format!("api url {:?}: {e}", self.api_url),
        })?;
        if api_url.cannot_be_a_base() {
            return Err(Error::InvalidConfig {
                detail: format!("api url {:?} cannot be a base", self.api_url),
            });
        }

        Ok(Endpoint::new(api_url, self.api_key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_api_url() {
        let config = ManagerConfig::new("k");
        assert_eq!(config.api_url, DEFAULT_API_URL);
        let endpoint = config.endpoint().unwrap();
        assert_eq!(endpoint.api_url().as_str(), DEFAULT_API_URL);
    }

    #[test]
    fn test_trailing_slash_is_added() {
        let endpoint = ManagerConfig::new("k")
            .with_api_url("http://localhost:8080/tiles")
            .endpoint()
            .unwrap();
        assert_eq!(
            endpoint.root_url().unwrap().as_str(),
            "http://localhost:8080/tiles/v1/3dtiles/root.json?key=k"
        );
    }

    #[test]
    fn test_rejects_empty_key() {
        let err = ManagerConfig::new("  ").endpoint().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn test_rejects_unparseable_url() {
        let err = ManagerConfig::new("k")
            .with_api_url("not a url")
            .endpoint()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}
