use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Encoder;

use crate::codec::FrameConfig;
use crate::error::{FrameError, Result};

/// Writes complete frames to any `AsyncWrite` stream.
///
/// A failed or timed-out write may leave a partial frame on the wire, so the
/// stream must be discarded after any error.
pub struct FrameWriter<T, E> {
    inner: T,
    encoder: E,
    buf: BytesMut,
    write_timeout: Option<Duration>,
}

impl<T, E> FrameWriter<T, E>
where
    T: AsyncWrite + Unpin,
{
    pub fn new(inner: T, encoder: E, config: &FrameConfig) -> Self {
        Self {
            inner,
            encoder,
            buf: BytesMut::new(),
            write_timeout: config.write_timeout,
        }
    }

    /// Encode one message and write it out in full, then flush.
    pub async fn write<I>(&mut self, item: I) -> Result<()>
    where
        E: Encoder<I, Error = FrameError>,
    {
        self.buf.clear();
        self.encoder.encode(item, &mut self.buf)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            let attempt = self.inner.write(&self.buf[offset..]);
            match deadline(self.write_timeout, attempt).await? {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush().await
    }

    /// Flush the underlying stream.
    pub async fn flush(&mut self) -> Result<()> {
        loop {
            match deadline(self.write_timeout, self.inner.flush()).await? {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Shut down the write side of the stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        deadline(self.write_timeout, self.inner.shutdown())
            .await?
            .map_err(FrameError::Io)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer, returning the underlying stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

async fn deadline<F: Future>(limit: Option<Duration>, attempt: F) -> Result<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| FrameError::TimedOut(limit)),
        None => Ok(attempt.await),
    }
}
