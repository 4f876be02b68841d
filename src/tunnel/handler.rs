//! Per-connection handling
//!
//! ```text
//! ReadingFrame -> Resolving -> Dialing -> Relaying -> Closed
//!       \             \           \
//!        +-------------+-----------+--> signal byte -> Closed
//! ```

use super::{pipe, AddressCache, BufferedReader, Direction, ReaderPool, TunnelError};
use crate::config::ServerConfig;
use crate::crypto::PassphraseCipher;
use crate::metrics::Metrics;
use crate::transport::{Dialer, TcpDialer, TransportConfig, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, error, trace};

/// Turns accepted client connections into tunnels
pub struct Dispatcher {
    cache: Arc<AddressCache>,
    pool: Arc<ReaderPool>,
    dialer: Arc<dyn Dialer>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(
        cache: Arc<AddressCache>,
        pool: Arc<ReaderPool>,
        dialer: Arc<dyn Dialer>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cache,
            pool,
            dialer,
            metrics,
        }
    }

    /// Build a dispatcher with a passphrase cipher and TCP dialer
    pub fn from_config(config: &ServerConfig) -> Self {
        let cipher = Arc::new(PassphraseCipher::new(config.secret.as_bytes()));
        let cache = Arc::new(AddressCache::new(cipher, config.cache_capacity));
        let pool = ReaderPool::new(config.read_buffer_size, config.max_idle_buffers);
        let dialer = Arc::new(TcpDialer::new(TransportConfig {
            connect_timeout: config.backend_timeout(),
            nodelay: true,
        }));

        Self::new(cache, pool, dialer, Arc::new(Metrics::new()))
    }

    pub fn cache(&self) -> Arc<AddressCache> {
        Arc::clone(&self.cache)
    }

    pub fn pool(&self) -> Arc<ReaderPool> {
        Arc::clone(&self.pool)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Serve one client connection to completion
    ///
    /// Failures before the relay starts are answered with a single signal
    /// byte. Streams and pooled buffers are released on every exit path,
    /// including unwinding.
    pub async fn handle(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let _active = self.metrics.connection_opened();

        // Disable Nagle's algorithm so small interactive writes are not delayed
        stream.set_nodelay(true).ok();

        let (client_read, mut client_write) = stream.into_split();
        let mut reader = self.pool.acquire().bind(client_read);

        let backend = match self.open_tunnel(&mut reader).await {
            Ok(backend) => backend,
            Err(e) => {
                let signal = e.signal();
                debug!("Connection from {} rejected with {}: {}", peer_addr, signal, e);
                self.metrics.record_signal(signal);

                if let Err(e) = client_write.write_all(&[signal.as_byte()]).await {
                    trace!("Failed to signal {}: {}", peer_addr, e);
                }
                let _ = client_write.shutdown().await;
                return;
            }
        };

        self.metrics.record_tunnel();
        self.relay(reader, client_write, backend, peer_addr).await;
    }

    /// Read the framing line, resolve it and dial the backend
    async fn open_tunnel(
        &self,
        reader: &mut BufferedReader<OwnedReadHalf>,
    ) -> Result<TcpStream, TunnelError> {
        let line = reader.read_line().await?;
        let addr = self.cache.resolve(&line)?;

        let addr = std::str::from_utf8(&addr).map_err(|_| TunnelError::Dial {
            addr: String::from_utf8_lossy(&addr).into_owned(),
            source: TransportError::InvalidAddress("not UTF-8".to_string()),
        })?;

        trace!("Dialing backend {}", addr);
        self.dialer
            .dial(addr)
            .await
            .map_err(|source| TunnelError::Dial {
                addr: addr.to_string(),
                source,
            })
    }

    /// Run both copy directions until each has finished
    async fn relay(
        &self,
        reader: BufferedReader<OwnedReadHalf>,
        client_write: OwnedWriteHalf,
        backend: TcpStream,
        peer_addr: SocketAddr,
    ) {
        let backend_addr = backend.peer_addr().ok();
        debug!("Tunnel {} -> {:?} established", peer_addr, backend_addr);

        let (backend_read, backend_write) = backend.into_split();
        let (client_read, mut up_buf) = reader.into_parts();

        let metrics = Arc::clone(&self.metrics);
        let mut down_buf = self.pool.acquire();
        let downstream = tokio::spawn(async move {
            let (copied, err) = pipe(
                backend_read,
                client_write,
                &[],
                down_buf.scratch(),
                Direction::BackendToClient,
            )
            .await;
            metrics.record_relay(Direction::BackendToClient, copied, err.is_some());
        });

        // Bytes the client sent right behind its framing line go first
        let pending = up_buf.split().freeze();
        let (copied, err) = pipe(
            client_read,
            backend_write,
            &pending,
            up_buf.scratch(),
            Direction::ClientToBackend,
        )
        .await;
        self.metrics
            .record_relay(Direction::ClientToBackend, copied, err.is_some());

        if let Err(e) = downstream.await {
            if e.is_panic() {
                self.metrics.record_panic();
                error!("Relay task for {} panicked", peer_addr);
            }
        }

        debug!("Tunnel {} -> {:?} closed", peer_addr, backend_addr);
    }
}
