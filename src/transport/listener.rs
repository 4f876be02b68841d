//! Accept loop
//!
//! Accepts client connections and hands each one to the dispatcher on its
//! own task. Transient accept failures (descriptor exhaustion, aborted
//! handshakes) are retried with exponential backoff; anything else ends
//! the loop with an error.

use super::TransportError;
use crate::tunnel::Dispatcher;
use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// First retry delay after a transient accept error
const INITIAL_ACCEPT_DELAY: Duration = Duration::from_millis(5);

/// Upper bound for the retry delay
const MAX_ACCEPT_DELAY: Duration = Duration::from_secs(1);

/// Exponential backoff for transient accept errors
#[derive(Debug, Clone)]
pub struct AcceptBackoff {
    initial: Duration,
    max: Duration,
    delay: Duration,
}

impl AcceptBackoff {
    /// 5 ms, then doubling, capped at 1 s
    pub fn new() -> Self {
        Self::with_limits(INITIAL_ACCEPT_DELAY, MAX_ACCEPT_DELAY)
    }

    pub fn with_limits(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            delay: Duration::ZERO,
        }
    }

    /// Delay before the next retry
    pub fn next_delay(&mut self) -> Duration {
        self.delay = if self.delay.is_zero() {
            self.initial
        } else {
            std::cmp::min(self.delay * 2, self.max)
        };
        self.delay
    }

    /// Forget previous failures after a successful accept
    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }

    pub fn current(&self) -> Duration {
        self.delay
    }
}

impl Default for AcceptBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether an accept error is worth retrying
pub fn is_transient(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::OutOfMemory => true,
        _ => err.raw_os_error().map_or(false, is_resource_exhaustion),
    }
}

#[cfg(unix)]
fn is_resource_exhaustion(code: i32) -> bool {
    matches!(
        code,
        libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EPROTO
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_code: i32) -> bool {
    false
}

/// Source of inbound connections
#[async_trait]
pub trait Incoming: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Incoming for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Owns the listening socket
pub struct Acceptor {
    incoming: Box<dyn Incoming>,
    backoff: AcceptBackoff,
}

impl Acceptor {
    pub fn new<I: Incoming + 'static>(incoming: I) -> Self {
        Self {
            incoming: Box::new(incoming),
            backoff: AcceptBackoff::new(),
        }
    }

    /// Bind a listener
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::new(listener))
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        Self::new(listener)
    }

    /// Replace the transient-error backoff schedule
    pub fn with_backoff(mut self, backoff: AcceptBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.incoming.local_addr()?)
    }

    /// Accept until `shutdown` resolves or the listener fails
    ///
    /// Each connection runs on its own task. A task that panics is logged
    /// and counted; it never stops the loop. Returns an error only for a
    /// non-transient accept failure. Shutdown and task reaping stay live
    /// while a transient error is being backed off.
    pub async fn run<S>(self, dispatcher: Arc<Dispatcher>, shutdown: S) -> Result<(), TransportError>
    where
        S: Future<Output = ()>,
    {
        let Self {
            incoming,
            mut backoff,
        } = self;
        let mut tasks = JoinSet::new();
        let metrics = dispatcher.metrics();
        tokio::pin!(shutdown);

        let retry = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(retry);
        let mut backing_off = false;

        if let Ok(addr) = incoming.local_addr() {
            info!("Accepting connections on {}", addr);
        }

        loop {
            tokio::select! {
                accept_result = incoming.accept(), if !backing_off => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            backoff.reset();
                            debug!("New connection from {}", peer_addr);

                            let dispatcher = Arc::clone(&dispatcher);
                            tasks.spawn(async move {
                                dispatcher.handle(stream, peer_addr).await;
                            });
                        }
                        Err(e) if is_transient(&e) => {
                            let delay = backoff.next_delay();
                            metrics.record_accept_retry();
                            warn!("Accept error: {}; retrying in {:?}", e, delay);
                            retry.as_mut().reset(Instant::now() + delay);
                            backing_off = true;
                        }
                        Err(e) => {
                            error!("Accept failed: {}", e);
                            tasks.shutdown().await;
                            return Err(e.into());
                        }
                    }
                }
                () = &mut retry, if backing_off => {
                    backing_off = false;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            metrics.record_panic();
                            error!("Connection handler panicked: {}", panic_message(e.into_panic()));
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        tasks.shutdown().await;
        Ok(())
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
