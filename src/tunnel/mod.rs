//! Tunnel layer - from framing line to relayed bytes
//!
//! Provides:
//! - The shared address cache
//! - Pooled read buffers
//! - The per-connection dispatcher
//! - The byte relay

mod cache;
mod handler;
mod pool;
mod relay;

pub use cache::{AddressCache, CacheStats, Snapshot, DEFAULT_CACHE_CAPACITY};
pub use handler::Dispatcher;
pub use pool::{BufferedReader, PooledBuffer, ReaderPool, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IDLE};
pub use relay::{pipe, Direction};

use crate::crypto::CryptoError;
use crate::protocol::{ProtocolError, Signal};
use crate::transport::TransportError;
use thiserror::Error;

/// Reasons a tunnel could not be established
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to read framing line: {0}")]
    Frame(#[from] ProtocolError),

    #[error("Failed to decrypt backend address: {0}")]
    Decrypt(#[from] CryptoError),

    #[error("Dial to {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: TransportError,
    },
}

impl TunnelError {
    /// Byte reported to the client for this failure
    pub fn signal(&self) -> Signal {
        match self {
            TunnelError::Frame(_) => Signal::ReadFrameError,
            TunnelError::Decrypt(_) => Signal::DecryptError,
            TunnelError::Dial { source, .. } if source.is_timeout() => Signal::DialTimeout,
            TunnelError::Dial { .. } => Signal::DialError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_mapping() {
        assert_eq!(
            TunnelError::Frame(ProtocolError::LineTooLong(4096)).signal(),
            Signal::ReadFrameError
        );
        assert_eq!(
            TunnelError::Frame(ProtocolError::UnexpectedEof).signal(),
            Signal::ReadFrameError
        );
        assert_eq!(
            TunnelError::Decrypt(CryptoError::MissingSalt).signal(),
            Signal::DecryptError
        );
        assert_eq!(
            TunnelError::Dial {
                addr: "10.0.0.1:80".to_string(),
                source: TransportError::Timeout,
            }
            .signal(),
            Signal::DialTimeout
        );
        assert_eq!(
            TunnelError::Dial {
                addr: "10.0.0.1:80".to_string(),
                source: TransportError::InvalidAddress("bad".to_string()),
            }
            .signal(),
            Signal::DialError
        );
    }
}
