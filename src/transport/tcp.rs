//! TCP backend dialer

use super::{Dialer, TransportConfig, TransportError};
use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

/// Dials backends over plain TCP
pub struct TcpDialer {
    config: TransportConfig,
}

impl TcpDialer {
    /// Create a new TCP dialer
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration
    pub fn new_default() -> Self {
        Self::new(TransportConfig::default())
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<TcpStream, TransportError> {
        let stream = connect_within(self.config.connect_timeout, TcpStream::connect(addr)).await?;

        if self.config.nodelay {
            stream.set_nodelay(true).ok();
        }

        Ok(stream)
    }
}

/// Drive `connect`, giving up once `limit` has elapsed
async fn connect_within<F>(limit: Duration, connect: F) -> Result<TcpStream, TransportError>
where
    F: Future<Output = io::Result<TcpStream>>,
{
    tokio::time::timeout(limit, connect)
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(TransportError::Io)
}
