//! One-directional byte copy used twice per tunnel

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Direction label for logs and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToBackend => write!(f, "client->backend"),
            Direction::BackendToClient => write!(f, "backend->client"),
        }
    }
}

/// Copy `src` into `dst` until end of stream or error, then shut `dst` down
///
/// `pending` is written first (bytes already read from `src` by someone
/// else). End of stream is a normal finish; errors end the copy and are
/// returned after the shutdown together with the byte count so far.
pub async fn pipe<R, W>(
    mut src: R,
    mut dst: W,
    pending: &[u8],
    buf: &mut [u8],
    direction: Direction,
) -> (u64, Option<io::Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    let result = copy_loop(&mut src, &mut dst, pending, buf, &mut copied).await;

    // Half-close so the peer sees EOF and the opposite copy can finish
    if let Err(e) = dst.shutdown().await {
        trace!("{} shutdown: {}", direction, e);
    }

    match result {
        Ok(()) => {
            trace!("{} finished after {} bytes", direction, copied);
            (copied, None)
        }
        Err(e) => {
            debug!("{} relay error after {} bytes: {}", direction, copied, e);
            (copied, Some(e))
        }
    }
}

async fn copy_loop<R, W>(
    src: &mut R,
    dst: &mut W,
    pending: &[u8],
    buf: &mut [u8],
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !pending.is_empty() {
        dst.write_all(pending).await?;
        *copied += pending.len() as u64;
    }

    loop {
        let n = src.read(buf).await?;
        if n == 0 {
            return Ok(());
        }
        dst.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}
