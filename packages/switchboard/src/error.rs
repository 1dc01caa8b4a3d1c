//! Error types for the engine's recoverable and unrecoverable failures.

use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Failures reported by a [`Connector`](crate::transport::Connector) or a live
/// [`Transport`](crate::transport::Transport).
///
/// Most variants are transient and drive a reconnect. [`is_fatal`] picks out
/// the ones that can never succeed by retrying.
///
/// [`is_fatal`]: TransportError::is_fatal
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint is unavailable: {0}")]
    Unavailable(String),

    #[error("connect attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("endpoint rejected the connection: {0}")]
    Rejected(String),

    #[error("invalid endpoint address: {0}")]
    InvalidUrl(String),

    #[error("transport closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether retrying is pointless (endpoint refused us or the address is
    /// unusable). Fatal errors move the connection to `Failed`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::InvalidUrl(_))
    }

    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(io_err) => match io_err.kind() {
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected => Self::Unavailable(io_err.to_string()),
                _ => Self::Io(io_err.to_string()),
            },
            tungstenite::Error::Url(url_err) => Self::InvalidUrl(url_err.to_string()),
            tungstenite::Error::Http(response) => Self::from_http_status(response.status()),
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::Closed
            }
            other => Self::Io(other.to_string()),
        }
    }

    /// Classify a failed upgrade response: 4xx means the endpoint will keep
    /// refusing us, anything else may clear up on its own.
    pub fn from_http_status(status: tungstenite::http::StatusCode) -> Self {
        if status.is_client_error() {
            Self::Rejected(format!("HTTP {status}"))
        } else {
            Self::Unavailable(format!("HTTP {status}"))
        }
    }
}

/// Inbound text that does not parse to an [`Envelope`](crate::Envelope).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope has an empty type")]
    EmptyType,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- from_tungstenite: connection-level IO errors → Unavailable --

    #[test]
    fn refused_is_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = TransportError::from_tungstenite(tungstenite::Error::Io(io));
        assert!(matches!(err, TransportError::Unavailable(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn reset_is_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = TransportError::from_tungstenite(tungstenite::Error::Io(io));
        assert!(matches!(err, TransportError::Unavailable(_)));
    }

    #[test]
    fn other_io_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = TransportError::from_tungstenite(tungstenite::Error::Io(io));
        assert!(matches!(err, TransportError::Io(_)));
        assert!(!err.is_fatal());
    }

    // -- from_tungstenite: non-IO variants --

    #[test]
    fn connection_closed_maps_to_closed() {
        let err = TransportError::from_tungstenite(tungstenite::Error::ConnectionClosed);
        assert!(matches!(err, TransportError::Closed));
    }

    #[test]
    fn url_error_is_fatal() {
        let err = TransportError::from_tungstenite(tungstenite::Error::Url(
            tungstenite::error::UrlError::UnsupportedUrlScheme,
        ));
        assert!(matches!(err, TransportError::InvalidUrl(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn client_error_status_is_fatal() {
        let err = TransportError::from_http_status(tungstenite::http::StatusCode::FORBIDDEN);
        assert!(matches!(err, TransportError::Rejected(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn server_error_status_is_transient() {
        let err =
            TransportError::from_http_status(tungstenite::http::StatusCode::SERVICE_UNAVAILABLE);
        assert!(matches!(err, TransportError::Unavailable(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn timeout_display() {
        let err = TransportError::Timeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "connect attempt timed out after 5s");
    }
}
