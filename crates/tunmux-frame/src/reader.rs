use std::io::ErrorKind;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::codec::FrameConfig;
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `AsyncRead` stream.
///
/// Handles partial reads internally: callers always get complete messages.
/// The buffer never holds more than one maximum-size frame, and every read
/// attempt is bounded by the configured read timeout.
pub struct FrameReader<T, D> {
    inner: T,
    decoder: D,
    buf: BytesMut,
    chunk: Box<[u8]>,
    capacity: usize,
    read_timeout: Option<Duration>,
}

impl<T, D> FrameReader<T, D>
where
    T: AsyncRead + Unpin,
    D: Decoder<Error = FrameError>,
{
    pub fn new(inner: T, decoder: D, config: &FrameConfig) -> Self {
        let capacity = config.buffer_capacity();
        Self {
            inner,
            decoder,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY.min(capacity)),
            chunk: vec![0u8; READ_CHUNK_SIZE.min(capacity)].into_boxed_slice(),
            capacity,
            read_timeout: config.read_timeout,
        }
    }

    /// Read the next complete message.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub async fn read(&mut self) -> Result<D::Item> {
        loop {
            if let Some(item) = self.decoder.decode(&mut self.buf)? {
                return Ok(item);
            }

            // The decoder rejects frames larger than the capacity, so a full
            // buffer always holds a decodable frame.
            let room = self.capacity.saturating_sub(self.buf.len());
            if room == 0 {
                return Err(FrameError::PayloadTooLarge {
                    size: self.buf.len(),
                    max: self.capacity,
                });
            }
            let want = room.min(self.chunk.len());

            let attempt = self.inner.read(&mut self.chunk[..want]);
            let read = match self.read_timeout {
                Some(limit) => tokio::time::timeout(limit, attempt)
                    .await
                    .map_err(|_| FrameError::TimedOut(limit))?,
                None => attempt.await,
            };
            let read = match read {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                if !self.buf.is_empty() {
                    trace!(buffered = self.buf.len(), "eof inside a frame");
                }
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&self.chunk[..read]);
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader, returning the underlying stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use bytes::{Bytes, BytesMut};
    use tokio::io::{AsyncWriteExt, ReadBuf};
    use tokio_util::codec::Encoder;

    use super::*;
    use crate::codec::{encode_frame, EnvelopeCodec};
    use crate::message::{Request, Response};

    fn config() -> FrameConfig {
        FrameConfig::default()
    }

    fn response_bytes(responses: &[Response]) -> Vec<u8> {
        let mut codec = EnvelopeCodec::<Response>::default();
        let mut buf = BytesMut::new();
        for response in responses {
            codec.encode(response, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    /// Serves `bytes` in the given chunk sizes, cycling through them.
    #[derive(Debug)]
    struct ChunkedReader {
        bytes: Vec<u8>,
        pos: usize,
        sizes: Vec<usize>,
        next: usize,
    }

    impl ChunkedReader {
        fn new(bytes: Vec<u8>, sizes: Vec<usize>) -> Self {
            Self {
                bytes,
                pos: 0,
                sizes,
                next: 0,
            }
        }
    }

    impl AsyncRead for ChunkedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let this = &mut *self;
            if this.pos >= this.bytes.len() {
                return Poll::Ready(Ok(()));
            }
            let size = this.sizes[this.next % this.sizes.len()];
            this.next += 1;
            let n = size
                .min(buf.remaining())
                .min(this.bytes.len() - this.pos);
            buf.put_slice(&this.bytes[this.pos..this.pos + n]);
            this.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn read_single_message() {
        let response = Response::data(1, Bytes::from_static(b"hello"));
        let data = response_bytes(std::slice::from_ref(&response));
        let mut reader =
            FrameReader::new(data.as_slice(), EnvelopeCodec::<Response>::default(), &config());

        assert_eq!(reader.read().await.unwrap(), response);
        assert!(matches!(
            reader.read().await.unwrap_err(),
            FrameError::ConnectionClosed
        ));
    }

    #[tokio::test]
    async fn reassembles_across_arbitrary_chunks() {
        let responses: Vec<Response> = (1..=20)
            .map(|id| Response::data(id, Bytes::from(vec![id as u8; id as usize * 37])))
            .chain(std::iter::once(Response::close(21)))
            .collect();
        let data = response_bytes(&responses);

        for sizes in [vec![1], vec![3, 7, 1], vec![4096], vec![9, 2, 50, 1, 13]] {
            let source = ChunkedReader::new(data.clone(), sizes);
            let mut reader =
                FrameReader::new(source, EnvelopeCodec::<Response>::default(), &config());
            for expected in &responses {
                assert_eq!(&reader.read().await.unwrap(), expected);
            }
            assert!(matches!(
                reader.read().await.unwrap_err(),
                FrameError::ConnectionClosed
            ));
        }
    }

    #[tokio::test]
    async fn eof_mid_frame_is_connection_closed() {
        let data = response_bytes(&[Response::data(1, Bytes::from_static(b"truncated"))]);
        let partial = &data[..data.len() - 3];
        let mut reader = FrameReader::new(partial, EnvelopeCodec::<Response>::default(), &config());

        assert!(matches!(
            reader.read().await.unwrap_err(),
            FrameError::ConnectionClosed
        ));
    }

    #[tokio::test]
    async fn invalid_magic_in_stream() {
        let data = vec![0x00, 0x01, 0x02, 0x01, 0, 0, 0, 0];
        let mut reader = FrameReader::new(
            data.as_slice(),
            EnvelopeCodec::<Response>::default(),
            &config(),
        );
        assert!(matches!(
            reader.read().await.unwrap_err(),
            FrameError::InvalidMagic { .. }
        ));
    }

    #[tokio::test]
    async fn oversized_frame_in_stream() {
        let mut buf = BytesMut::new();
        encode_frame(&[0u8; 256], &mut buf).unwrap();
        let config = FrameConfig {
            max_payload_size: 64,
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::new(&buf[..], EnvelopeCodec::<Response>::new(64), &config);
        assert!(matches!(
            reader.read().await.unwrap_err(),
            FrameError::PayloadTooLarge { size: 256, max: 64 }
        ));
    }

    #[tokio::test]
    async fn buffer_stays_within_one_frame() {
        let payload = Bytes::from(vec![7u8; 100]);
        let responses = vec![
            Response::data(1, payload.clone()),
            Response::data(2, payload),
        ];
        let data = response_bytes(&responses);
        let frame_len = data.len() / 2;
        let config = FrameConfig {
            max_payload_size: frame_len - crate::codec::HEADER_SIZE,
            ..FrameConfig::default()
        };

        let mut reader = FrameReader::new(
            data.as_slice(),
            EnvelopeCodec::<Response>::new(config.max_payload_size),
            &config,
        );
        assert_eq!(reader.read().await.unwrap().channel_id, 1);
        assert_eq!(reader.read().await.unwrap().channel_id, 2);
    }

    #[tokio::test]
    async fn read_timeout_fires_per_attempt() {
        let (_writer, rx) = tokio::io::duplex(64);
        let config = FrameConfig::with_timeout(Duration::from_millis(20));
        let mut reader = FrameReader::new(rx, EnvelopeCodec::<Request>::default(), &config);

        let started = std::time::Instant::now();
        let err = reader.read().await.unwrap_err();
        assert!(matches!(err, FrameError::TimedOut(_)));
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn roundtrip_over_duplex() {
        let (mut tx, rx) = tokio::io::duplex(16);
        let mut reader = FrameReader::new(rx, EnvelopeCodec::<Request>::default(), &config());

        let request = Request::open(11, "127.0.0.1:9000");
        let mut codec = EnvelopeCodec::<Request>::default();
        let mut buf = BytesMut::new();
        codec.encode(&request, &mut buf).unwrap();

        let writer = tokio::spawn(async move {
            tx.write_all(&buf).await.unwrap();
            tx
        });

        assert_eq!(reader.read().await.unwrap(), request);
        drop(writer.await.unwrap());
        assert!(matches!(
            reader.read().await.unwrap_err(),
            FrameError::ConnectionClosed
        ));
    }
}
