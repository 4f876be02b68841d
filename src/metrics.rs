//! Lightweight Prometheus-compatible metrics for the dispatcher.
//!
//! Uses atomic counters for lock-free instrumentation. Renders metrics in
//! Prometheus text exposition format, served by [`serve`] on the
//! diagnostics port.

use crate::protocol::Signal;
use crate::tunnel::{AddressCache, CacheStats, Direction};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Dispatcher counters
pub struct Metrics {
    /// Connections currently being handled (gauge)
    pub active_connections: AtomicU64,
    /// Connections accepted (counter)
    pub connections_total: AtomicU64,
    /// Tunnels that reached the relay stage (counter)
    pub tunnels_established_total: AtomicU64,
    /// Bytes relayed client -> backend (counter)
    pub client_bytes_total: AtomicU64,
    /// Bytes relayed backend -> client (counter)
    pub backend_bytes_total: AtomicU64,
    /// Relay copies that ended with an IO error (counter)
    pub relay_errors_total: AtomicU64,
    /// `0x01` signals sent (counter)
    pub dial_timeouts_total: AtomicU64,
    /// `0x02` signals sent (counter)
    pub dial_errors_total: AtomicU64,
    /// `0x04` signals sent (counter)
    pub frame_errors_total: AtomicU64,
    /// `0x06` signals sent (counter)
    pub decrypt_errors_total: AtomicU64,
    /// Transient accept errors retried (counter)
    pub accept_retries_total: AtomicU64,
    /// Connection tasks that panicked (counter)
    pub handler_panics_total: AtomicU64,
    /// Start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            active_connections: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            tunnels_established_total: AtomicU64::new(0),
            client_bytes_total: AtomicU64::new(0),
            backend_bytes_total: AtomicU64::new(0),
            relay_errors_total: AtomicU64::new(0),
            dial_timeouts_total: AtomicU64::new(0),
            dial_errors_total: AtomicU64::new(0),
            frame_errors_total: AtomicU64::new(0),
            decrypt_errors_total: AtomicU64::new(0),
            accept_retries_total: AtomicU64::new(0),
            handler_panics_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Count a connection as active until the guard drops
    pub fn connection_opened(self: &Arc<Self>) -> ConnectionGuard {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            metrics: Arc::clone(self),
        }
    }

    pub fn record_signal(&self, signal: Signal) {
        let counter = match signal {
            Signal::DialTimeout => &self.dial_timeouts_total,
            Signal::DialError => &self.dial_errors_total,
            Signal::ReadFrameError => &self.frame_errors_total,
            Signal::DecryptError => &self.decrypt_errors_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tunnel(&self) {
        self.tunnels_established_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay(&self, direction: Direction, bytes: u64, failed: bool) {
        let counter = match direction {
            Direction::ClientToBackend => &self.client_bytes_total,
            Direction::BackendToClient => &self.backend_bytes_total,
        };
        counter.fetch_add(bytes, Ordering::Relaxed);
        if failed {
            self.relay_errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_accept_retry(&self) {
        self.accept_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.handler_panics_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self, cache: &CacheStats) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP front_active_connections Connections currently being handled\n\
             # TYPE front_active_connections gauge\n\
             front_active_connections {}\n\
             # HELP front_connections_total Connections accepted\n\
             # TYPE front_connections_total counter\n\
             front_connections_total {}\n\
             # HELP front_tunnels_established_total Tunnels that reached the relay stage\n\
             # TYPE front_tunnels_established_total counter\n\
             front_tunnels_established_total {}\n\
             # HELP front_relay_bytes_total Bytes relayed per direction\n\
             # TYPE front_relay_bytes_total counter\n\
             front_relay_bytes_total{{direction=\"client_to_backend\"}} {}\n\
             front_relay_bytes_total{{direction=\"backend_to_client\"}} {}\n\
             # HELP front_relay_errors_total Relay copies ended by an IO error\n\
             # TYPE front_relay_errors_total counter\n\
             front_relay_errors_total {}\n\
             # HELP front_signals_total Failure signals written to clients\n\
             # TYPE front_signals_total counter\n\
             front_signals_total{{signal=\"dial_timeout\"}} {}\n\
             front_signals_total{{signal=\"dial_error\"}} {}\n\
             front_signals_total{{signal=\"read_frame_error\"}} {}\n\
             front_signals_total{{signal=\"decrypt_error\"}} {}\n\
             # HELP front_accept_retries_total Transient accept errors retried\n\
             # TYPE front_accept_retries_total counter\n\
             front_accept_retries_total {}\n\
             # HELP front_handler_panics_total Connection handlers that panicked\n\
             # TYPE front_handler_panics_total counter\n\
             front_handler_panics_total {}\n\
             # HELP front_cache_entries Entries in the current address cache snapshot\n\
             # TYPE front_cache_entries gauge\n\
             front_cache_entries {}\n\
             # HELP front_cache_hits_total Address cache hits\n\
             # TYPE front_cache_hits_total counter\n\
             front_cache_hits_total {}\n\
             # HELP front_cache_misses_total Address cache misses\n\
             # TYPE front_cache_misses_total counter\n\
             front_cache_misses_total {}\n\
             # HELP front_cache_decrypt_failures_total Cache misses that failed to decrypt\n\
             # TYPE front_cache_decrypt_failures_total counter\n\
             front_cache_decrypt_failures_total {}\n\
             # HELP front_cache_flushes_total Address cache full flushes\n\
             # TYPE front_cache_flushes_total counter\n\
             front_cache_flushes_total {}\n\
             # HELP front_uptime_seconds Dispatcher uptime in seconds\n\
             # TYPE front_uptime_seconds gauge\n\
             front_uptime_seconds {}\n",
            self.active_connections.load(Ordering::Relaxed),
            self.connections_total.load(Ordering::Relaxed),
            self.tunnels_established_total.load(Ordering::Relaxed),
            self.client_bytes_total.load(Ordering::Relaxed),
            self.backend_bytes_total.load(Ordering::Relaxed),
            self.relay_errors_total.load(Ordering::Relaxed),
            self.dial_timeouts_total.load(Ordering::Relaxed),
            self.dial_errors_total.load(Ordering::Relaxed),
            self.frame_errors_total.load(Ordering::Relaxed),
            self.decrypt_errors_total.load(Ordering::Relaxed),
            self.accept_retries_total.load(Ordering::Relaxed),
            self.handler_panics_total.load(Ordering::Relaxed),
            cache.entries,
            cache.hits,
            cache.misses,
            cache.decrypt_failures,
            cache.flushes,
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the active connection gauge on drop
pub struct ConnectionGuard {
    metrics: Arc<Metrics>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Serve the metrics page over minimal HTTP/1.1
///
/// Every request, whatever its path, gets the current metrics.
pub async fn serve(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    cache: Arc<AddressCache>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Diagnostics listening on {}", addr);
    }

    loop {
        let (mut stream, peer_addr) = listener.accept().await?;
        let metrics = Arc::clone(&metrics);
        let cache = Arc::clone(&cache);

        tokio::spawn(async move {
            // Request content is irrelevant; read what arrived and answer
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request).await;

            let body = metrics.render(&cache.stats());
            let response = format!(
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: text/plain; version=0.0.4\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\r\n{}",
                body.len(),
                body
            );
            if let Err(e) = stream.write_all(response.as_bytes()).await {
                debug!("Diagnostics write to {} failed: {}", peer_addr, e);
            }
            let _ = stream.shutdown().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_format() {
        let m = Metrics::new();
        m.record_signal(Signal::DecryptError);
        m.record_relay(Direction::ClientToBackend, 1024, false);
        let output = m.render(&CacheStats::default());
        assert!(output.contains("front_signals_total{signal=\"decrypt_error\"} 1"));
        assert!(output.contains("front_relay_bytes_total{direction=\"client_to_backend\"} 1024"));
        assert!(output.contains("front_active_connections 0"));
        assert!(output.contains("# TYPE front_uptime_seconds gauge"));
    }

    #[test]
    fn test_connection_guard() {
        let m = Arc::new(Metrics::new());
        {
            let _a = m.connection_opened();
            let _b = m.connection_opened();
            assert_eq!(m.active_connections.load(Ordering::Relaxed), 2);
        }
        assert_eq!(m.active_connections.load(Ordering::Relaxed), 0);
        assert_eq!(m.connections_total.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_signal_counters() {
        let m = Metrics::new();
        m.record_signal(Signal::DialTimeout);
        m.record_signal(Signal::DialError);
        m.record_signal(Signal::DialError);
        m.record_signal(Signal::ReadFrameError);
        assert_eq!(m.dial_timeouts_total.load(Ordering::Relaxed), 1);
        assert_eq!(m.dial_errors_total.load(Ordering::Relaxed), 2);
        assert_eq!(m.frame_errors_total.load(Ordering::Relaxed), 1);
        assert_eq!(m.decrypt_errors_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_cache_stats_rendered() {
        let m = Metrics::new();
        let stats = CacheStats {
            entries: 3,
            hits: 10,
            misses: 4,
            decrypt_failures: 1,
            flushes: 2,
        };
        let output = m.render(&stats);
        assert!(output.contains("front_cache_entries 3"));
        assert!(output.contains("front_cache_hits_total 10"));
        assert!(output.contains("front_cache_misses_total 4"));
        assert!(output.contains("front_cache_decrypt_failures_total 1"));
        assert!(output.contains("front_cache_flushes_total 2"));
    }

    #[test]
    fn test_relay_errors_counted() {
        let m = Metrics::new();
        m.record_relay(Direction::BackendToClient, 10, true);
        assert_eq!(m.backend_bytes_total.load(Ordering::Relaxed), 10);
        assert_eq!(m.relay_errors_total.load(Ordering::Relaxed), 1);
    }
}
