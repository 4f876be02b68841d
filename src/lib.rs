//! # Front Tunnel
//!
//! A TCP tunnel dispatcher that routes clients to backends whose addresses
//! never cross the wire in plaintext.
//!
//! ## Features
//!
//! - **Encrypted destinations**: clients send the backend `host:port`
//!   encrypted under a shared secret (OpenSSL-compatible salted AES-256-CBC)
//! - **Lock-free address cache**: decrypted destinations are cached in a
//!   copy-on-write snapshot readers load with one atomic operation
//! - **Transparent relay**: after setup, bytes flow unmodified both ways
//! - **Single-byte failure signals** for dial, framing and decrypt errors
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Acceptor                          │
//! │        (accept loop, transient-error backoff)        │
//! ├─────────────────────────────────────────────────────┤
//! │                   Dispatcher                         │
//! │   (framing line -> address cache -> backend dial)    │
//! ├─────────────────────────────────────────────────────┤
//! │                     Relay                            │
//! │    (client -> backend, backend -> client copies)     │
//! ├─────────────────────────────────────────────────────┤
//! │                    Transport                         │
//! │                      (TCP)                           │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod crypto;
pub mod metrics;
pub mod protocol;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use protocol::Signal;
pub use transport::Acceptor;
pub use tunnel::{AddressCache, Dispatcher};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default listening port
pub const DEFAULT_PORT: u16 = 4043;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
