//! Pooled read buffers
//!
//! Each connection checks out a buffer for reading its framing line and
//! keeps it for the client-to-backend relay. Buffers go back to the pool
//! when their [`PooledBuffer`] guard drops, on every exit path.

use crate::protocol::{trim_line, ProtocolError, LINE_DELIMITER};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default read buffer capacity, which bounds the framing line
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default number of idle buffers kept for reuse
pub const DEFAULT_MAX_IDLE: usize = 1024;

/// Pool of reusable read buffers
pub struct ReaderPool {
    idle: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    max_idle: usize,
}

impl ReaderPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::new()),
            buffer_size: buffer_size.max(1),
            max_idle,
        })
    }

    /// Check out an empty buffer
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Return a buffer to the pool
    ///
    /// Same as dropping it.
    pub fn release(&self, mut buffer: PooledBuffer) {
        if let Some(buf) = buffer.buf.take() {
            self.put_back(buf);
        }
    }

    fn put_back(&self, mut buf: BytesMut) {
        buf.clear();
        // `reserve` reclaims the front of a uniquely owned allocation
        buf.reserve(self.buffer_size);
        if buf.capacity() < self.buffer_size {
            return;
        }

        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers waiting to be reused
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A checked-out buffer; returns itself to the pool on drop
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<ReaderPool>,
}

impl PooledBuffer {
    /// Bind this buffer to a stream for buffered reading
    pub fn bind<R>(self, inner: R) -> BufferedReader<R> {
        BufferedReader { inner, buf: self }
    }

    /// Maximum number of bytes this buffer holds
    pub fn max_len(&self) -> usize {
        self.pool.buffer_size
    }

    /// Zero-filled scratch space of the full buffer size
    pub fn scratch(&mut self) -> &mut [u8] {
        let limit = self.max_len();
        let buf = self.buf_mut();
        buf.clear();
        buf.resize(limit, 0);
        &mut buf[..]
    }

    fn buf_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf_mut()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(buf);
        }
    }
}

/// Buffered reader over a pooled buffer
pub struct BufferedReader<R> {
    inner: R,
    buf: PooledBuffer,
}

impl<R: AsyncRead + Unpin> BufferedReader<R> {
    /// Read one line, without its terminator
    ///
    /// The line and its terminator must fit in the buffer. An unterminated
    /// line at end of stream is returned as is; end of stream with nothing
    /// buffered is [`ProtocolError::UnexpectedEof`].
    pub async fn read_line(&mut self) -> Result<Bytes, ProtocolError> {
        let limit = self.buf.max_len();
        let mut scanned = 0;

        loop {
            if let Some(pos) = self.buf[scanned..]
                .iter()
                .position(|&b| b == LINE_DELIMITER)
            {
                let end = scanned + pos + 1;
                let line = Bytes::copy_from_slice(trim_line(&self.buf[..end]));
                self.buf.advance(end);
                return Ok(line);
            }
            scanned = self.buf.len();

            if self.buf.len() >= limit {
                return Err(ProtocolError::LineTooLong(limit));
            }

            let room = limit - self.buf.len();
            let n = {
                let mut window = (&mut *self.buf).limit(room);
                self.inner.read_buf(&mut window).await?
            };

            if n == 0 {
                if self.buf.is_empty() {
                    return Err(ProtocolError::UnexpectedEof);
                }
                let line = self.buf.split().freeze();
                return Ok(Bytes::copy_from_slice(trim_line(&line)));
            }
        }
    }

    /// Bytes read past the last returned line
    pub fn buffered(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Split into the stream and the buffer, which still holds
    /// [`buffered`](Self::buffered) bytes
    pub fn into_parts(self) -> (R, PooledBuffer) {
        (self.inner, self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_acquire_reuses_released() {
        let pool = ReaderPool::new(64, 8);
        assert_eq!(pool.idle(), 0);

        let mut buffer = pool.acquire();
        buffer.extend_from_slice(b"leftover");
        pool.release(buffer);
        assert_eq!(pool.idle(), 1);

        let buffer = pool.acquire();
        assert!(buffer.is_empty());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_drop_returns_buffer() {
        let pool = ReaderPool::new(64, 8);
        {
            let _a = pool.acquire();
            let _b = pool.acquire();
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_idle_is_bounded() {
        let pool = ReaderPool::new(64, 1);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_scratch_has_full_size() {
        let pool = ReaderPool::new(128, 1);
        let mut buffer = pool.acquire();
        assert_eq!(buffer.scratch().len(), 128);
    }

    #[tokio::test]
    async fn test_read_line_keeps_trailing_bytes() {
        let pool = ReaderPool::new(64, 1);
        let input: &[u8] = b"cipher\npayload";
        let mut reader = pool.acquire().bind(input);

        assert_eq!(reader.read_line().await.unwrap(), &b"cipher"[..]);
        assert_eq!(reader.buffered(), b"payload");
    }

    #[tokio::test]
    async fn test_read_line_strips_crlf() {
        let pool = ReaderPool::new(64, 1);
        let input: &[u8] = b"cipher\r\n";
        let mut reader = pool.acquire().bind(input);

        assert_eq!(reader.read_line().await.unwrap(), &b"cipher"[..]);
        assert!(reader.buffered().is_empty());
    }

    #[tokio::test]
    async fn test_read_line_across_reads() {
        let pool = ReaderPool::new(64, 1);
        let (mut client, server) = tokio::io::duplex(16);
        let mut reader = pool.acquire().bind(server);

        let writer = tokio::spawn(async move {
            client.write_all(b"abc").await.unwrap();
            tokio::task::yield_now().await;
            client.write_all(b"def\nrest").await.unwrap();
            client
        });

        assert_eq!(reader.read_line().await.unwrap(), &b"abcdef"[..]);
        let _client = writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_line_too_long() {
        let pool = ReaderPool::new(8, 1);
        let input: &[u8] = b"0123456789\n";
        let mut reader = pool.acquire().bind(input);

        assert!(matches!(
            reader.read_line().await,
            Err(ProtocolError::LineTooLong(8))
        ));
    }

    #[tokio::test]
    async fn test_line_filling_buffer_exactly() {
        let pool = ReaderPool::new(8, 1);
        let input: &[u8] = b"0123456\n";
        let mut reader = pool.acquire().bind(input);

        assert_eq!(reader.read_line().await.unwrap(), &b"0123456"[..]);
    }

    #[tokio::test]
    async fn test_read_line_eof() {
        let pool = ReaderPool::new(64, 1);

        let empty: &[u8] = b"";
        let mut reader = pool.acquire().bind(empty);
        assert!(matches!(
            reader.read_line().await,
            Err(ProtocolError::UnexpectedEof)
        ));

        let unterminated: &[u8] = b"cipher";
        let mut reader = pool.acquire().bind(unterminated);
        assert_eq!(reader.read_line().await.unwrap(), &b"cipher"[..]);
    }

    #[tokio::test]
    async fn test_into_parts_returns_buffer_on_drop() {
        let pool = ReaderPool::new(64, 4);
        let input: &[u8] = b"line\nextra";
        let mut reader = pool.acquire().bind(input);
        reader.read_line().await.unwrap();

        let (_stream, buffer) = reader.into_parts();
        assert_eq!(&buffer[..], b"extra");
        drop(buffer);
        assert_eq!(pool.idle(), 1);
    }
}
