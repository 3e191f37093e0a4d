//! Error types for the earthtile crate.

use std::fmt;

/// Result type for earthtile operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while streaming a tileset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// HTTP request failed before a response was received.
    Http {
        /// The URL that failed.
        url: String,
        /// The error message.
        message: String,
    },
    /// HTTP response had a non-success status code.
    HttpStatus {
        /// The URL that returned the error.
        url: String,
        /// The HTTP status code.
        status: u16,
    },
    /// A fetched document or descriptor was malformed.
    InvalidData {
        /// Context for where the error occurred.
        context: &'static str,
        /// Description of what was invalid.
        detail: String,
    },
    /// An injected content handler failed to load a tile.
    Handler {
        /// Content URI of the tile being loaded.
        uri: String,
        /// The error message.
        message: String,
    },
    /// The manager was configured with unusable settings.
    InvalidConfig {
        /// Description of the problem.
        detail: String,
    },
    /// A spawned content task panicked or was torn down with its runtime.
    Task {
        /// The error message.
        message: String,
    },
}

impl Error {
    /// Build a handler error for the given content URI.
    pub fn handler(uri: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Handler {
            uri: uri.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error came from the network layer.
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Http { .. } | Error::HttpStatus { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http { url, message } => {
                write!(f, "http request to {url} failed: {message}")
            }
            Error::HttpStatus { url, status } => {
                write!(f, "http request to {url} returned status {status}")
            }
            Error::InvalidData { context, detail } => {
                write!(f, "invalid {context}: {detail}")
            }
            Error::Handler { uri, message } => {
                write!(f, "content handler failed for {uri}: {message}")
            }
            Error::InvalidConfig { detail } => write!(f, "invalid configuration: {detail}"),
            Error::Task { message } => write!(f, "content task failed: {message}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidData {
            context: "tileset document",
            detail: e.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Task {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_classification() {
        let status = Error::HttpStatus {
            url: "https://example.com/root.json".to_string(),
            status: 403,
        };
        assert!(status.is_network());
        assert!(!Error::handler("a.glb", "boom").is_network());
    }

    #[test]
    fn test_display_includes_url_and_status() {
        let err = Error::HttpStatus {
            url: "https://example.com/root.json".to_string(),
            status: 404,
        };
        assert_eq!(
            err.to_string(),
            "http request to https://example.com/root.json returned status 404"
        );
    }

    #[test]
    fn test_json_errors_become_invalid_data() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, Error::InvalidData { context: "tileset document", .. }));
    }
}
