use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The initial buffer size allocated before trying to read from IO.
pub(crate) const INIT_BUFFER_SIZE: usize = 8192;

/// A buffered wrapper over the connection transport.
///
/// All socket reads land in `read_buf` first; the head parser and the body
/// decoder both consume from that buffer, so bytes belonging to a pipelined
/// next request are never lost between exchanges. Byte counters are shared
/// with the Context for the connection's lifetime.
pub(crate) struct Buffered<T> {
    io: T,
    read_buf: BytesMut,
    bytes_in: Arc<AtomicU64>,
    bytes_out: Arc<AtomicU64>,
}

impl<T> Buffered<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: T) -> Buffered<T> {
        Buffered {
            io,
            read_buf: BytesMut::with_capacity(INIT_BUFFER_SIZE),
            bytes_in: Arc::new(AtomicU64::new(0)),
            bytes_out: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn counters(&self) -> (Arc<AtomicU64>, Arc<AtomicU64>) {
        (self.bytes_in.clone(), self.bytes_out.clone())
    }

    pub(crate) fn read_buf(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    pub(crate) fn has_buffered(&self) -> bool {
        !self.read_buf.is_empty()
    }

    /// Reads more bytes from the transport into the read buffer.
    ///
    /// Returns the number of bytes read; zero means the peer closed its
    /// write side. Cancel-safe: a canceled fill either appended bytes or
    /// did not.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        if self.read_buf.capacity() - self.read_buf.len() < INIT_BUFFER_SIZE {
            self.read_buf.reserve(INIT_BUFFER_SIZE);
        }
        let n = self.io.read_buf(&mut self.read_buf).await?;
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    pub(crate) async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.io.write_all(data).await?;
        self.bytes_out.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        self.io.flush().await
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        self.io.shutdown().await
    }

    /// Tears the wrapper down for a protocol upgrade, handing back the
    /// transport together with any bytes read past the current message.
    pub(crate) fn into_parts(self) -> (T, Bytes) {
        (self.io, self.read_buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fill_appends_and_counts() {
        let (client, server) = tokio::io::duplex(64);
        let mut buffered = Buffered::new(server);
        let (bytes_in, _) = buffered.counters();

        let mut client = client;
        client.write_all(b"hello").await.unwrap();

        let n = buffered.fill().await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buffered.read_buf()[..], b"hello");
        assert_eq!(bytes_in.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn fill_reports_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut buffered = Buffered::new(server);
        assert_eq!(buffered.fill().await.unwrap(), 0);
    }
}
