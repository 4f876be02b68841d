//! Transport layer
//!
//! Provides:
//! - Backend dialing with a connect timeout ([`TcpDialer`])
//! - The accept loop with transient-error backoff ([`Acceptor`])

mod listener;
mod tcp;

pub use listener::{is_transient, AcceptBackoff, Acceptor, Incoming};
pub use tcp::TcpDialer;

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,
}

impl TransportError {
    /// Whether the failure should be reported as a dial timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Timeout => true,
            TransportError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

/// Opens connections to resolved backends
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to a `host:port` address
    async fn dial(&self, addr: &str) -> Result<TcpStream, TransportError>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Backend connect timeout
    pub connect_timeout: Duration,
    /// Disable Nagle on both sides of a tunnel
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            nodelay: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(TransportError::Timeout.is_timeout());
        assert!(TransportError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow")).is_timeout());
        assert!(
            !TransportError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "no")).is_timeout()
        );
        assert!(!TransportError::InvalidAddress("x".to_string()).is_timeout());
    }

    #[test]
    fn test_every_variant_classified() {
        let errors = [
            TransportError::Io(io::Error::from(io::ErrorKind::ConnectionRefused)),
            TransportError::InvalidAddress("not UTF-8".to_string()),
            TransportError::Timeout,
        ];

        for err in &errors {
            let expected = match err {
                TransportError::Io(_) | TransportError::InvalidAddress(_) => false,
                TransportError::Timeout => true,
            };
            assert_eq!(err.is_timeout(), expected, "{}", err);
        }
    }
}
