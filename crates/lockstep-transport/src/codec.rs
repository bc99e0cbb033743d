//! Big-endian framing over one bidirectional byte stream.
//!
//! # Value layout
//!
//! | Kind   | Bytes                                   |
//! |--------|-----------------------------------------|
//! | string | `u16` length, then that many UTF-8 bytes |
//! | int64  | 8 bytes, two's complement               |
//! | int32  | 4 bytes, two's complement               |
//! | bool   | 1 byte, `0` is false                    |
//! | chunk  | raw bytes, length agreed out of band     |
//!
//! Every write is flushed before returning: the peer is blocked waiting for
//! exactly that value.

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use lockstep_core::{LockstepError, ProtocolError, TransportError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_STRING_BYTES: usize = u16::MAX as usize;

/// Framed view of a stream. Owns the stream so no buffered bytes can be lost
/// between values.
pub struct WireStream<S> {
    inner: S,
    read_timeout: Option<Duration>,
}

impl<S> WireStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_timeout: None,
        }
    }

    /// Limit applied to each read unless a call overrides it.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> WireStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // ── Writes ───────────────────────────────────────────────────────────────

    pub async fn write_string(&mut self, value: &str) -> Result<(), TransportError> {
        let bytes = value.as_bytes();
        if bytes.len() > MAX_STRING_BYTES {
            return Err(TransportError::FrameTooLarge {
                len: bytes.len(),
                max: MAX_STRING_BYTES,
            });
        }
        let mut frame = BytesMut::with_capacity(2 + bytes.len());
        frame.put_u16(bytes.len() as u16);
        frame.put_slice(bytes);
        self.write_frame(&frame).await
    }

    pub async fn write_i64(&mut self, value: i64) -> Result<(), TransportError> {
        self.write_frame(&value.to_be_bytes()).await
    }

    pub async fn write_i32(&mut self, value: i32) -> Result<(), TransportError> {
        self.write_frame(&value.to_be_bytes()).await
    }

    pub async fn write_bool(&mut self, value: bool) -> Result<(), TransportError> {
        self.write_frame(&[u8::from(value)]).await
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        self.write_frame(chunk).await
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub async fn read_string(&mut self) -> Result<String, TransportError> {
        self.read_string_within(self.read_timeout).await
    }

    /// Read a string with an explicit limit (`None` waits indefinitely).
    pub async fn read_string_within(&mut self, timeout: Option<Duration>) -> Result<String, TransportError> {
        let inner = &mut self.inner;
        with_deadline(timeout, async move {
            let mut len = [0u8; 2];
            fill(inner, &mut len).await?;
            let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
            fill(inner, &mut body).await?;
            String::from_utf8(body).map_err(|_| TransportError::InvalidUtf8)
        })
        .await
    }

    pub async fn read_i64(&mut self) -> Result<i64, TransportError> {
        self.read_i64_within(self.read_timeout).await
    }

    pub async fn read_i64_within(&mut self, timeout: Option<Duration>) -> Result<i64, TransportError> {
        let mut buf = [0u8; 8];
        self.read_exact_within(timeout, &mut buf).await?;
        Ok(i64::from_be_bytes(buf))
    }

    pub async fn read_i32(&mut self) -> Result<i32, TransportError> {
        let mut buf = [0u8; 4];
        self.read_exact_within(self.read_timeout, &mut buf).await?;
        Ok(i32::from_be_bytes(buf))
    }

    pub async fn read_bool(&mut self) -> Result<bool, TransportError> {
        let mut buf = [0u8; 1];
        self.read_exact_within(self.read_timeout, &mut buf).await?;
        Ok(buf[0] != 0)
    }

    /// Read whatever is available, up to `buf.len()`. `Ok(0)` means the peer
    /// closed the stream.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let inner = &mut self.inner;
        with_deadline(self.read_timeout, async move { Ok(inner.read(buf).await?) }).await
    }

    /// Read a string and require it to equal `expected`.
    pub async fn expect_token(&mut self, expected: &'static str) -> Result<(), LockstepError> {
        let received = self.read_string().await?;
        if received == expected {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedToken { expected, received }.into())
        }
    }

    async fn read_exact_within(&mut self, timeout: Option<Duration>, buf: &mut [u8]) -> Result<(), TransportError> {
        let inner = &mut self.inner;
        with_deadline(timeout, fill(inner, buf)).await
    }
}

async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TransportError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

async fn with_deadline<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransportError::Timeout {
                ms: limit.as_millis() as u64,
            })?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    fn pair() -> (WireStream<DuplexStream>, DuplexStream) {
        let (a, b) = duplex(64 * 1024);
        (WireStream::new(a), b)
    }

    #[tokio::test]
    async fn string_layout_is_length_prefixed() {
        let (mut wire, mut raw) = pair();
        wire.write_string("READY").await.unwrap();

        let mut buf = [0u8; 7];
        raw.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x00\x05READY");
    }

    #[tokio::test]
    async fn integers_are_big_endian() {
        let (mut wire, mut raw) = pair();
        wire.write_i64(1).await.unwrap();
        wire.write_i32(-2).await.unwrap();
        wire.write_bool(true).await.unwrap();

        let mut buf = [0u8; 13];
        raw.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..8], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&buf[8..12], &[0xff, 0xff, 0xff, 0xfe]);
        assert_eq!(buf[12], 1);
    }

    #[tokio::test]
    async fn reads_values_written_by_peer() {
        let (a, b) = duplex(1024);
        let mut left = WireStream::new(a);
        let mut right = WireStream::new(b);

        left.write_string("héllo").await.unwrap();
        left.write_i64(-11_000).await.unwrap();
        left.write_i32(3).await.unwrap();
        left.write_bool(false).await.unwrap();

        assert_eq!(right.read_string().await.unwrap(), "héllo");
        assert_eq!(right.read_i64().await.unwrap(), -11_000);
        assert_eq!(right.read_i32().await.unwrap(), 3);
        assert!(!right.read_bool().await.unwrap());
    }

    #[tokio::test]
    async fn any_nonzero_byte_is_true() {
        let (mut wire, mut raw) = pair();
        raw.write_all(&[0x7f]).await.unwrap();
        assert!(wire.read_bool().await.unwrap());
    }

    #[tokio::test]
    async fn oversize_string_rejected_before_writing() {
        let (mut wire, raw) = pair();
        let huge = "x".repeat(MAX_STRING_BYTES + 1);
        let err = wire.write_string(&huge).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { len, .. } if len == MAX_STRING_BYTES + 1));

        drop(wire);
        let mut rest = Vec::new();
        let mut raw = raw;
        raw.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn eof_mid_value_is_connection_closed() {
        let (mut wire, mut raw) = pair();
        raw.write_all(&[0, 9, b'a', b'b']).await.unwrap();
        drop(raw);
        assert!(matches!(
            wire.read_string().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn invalid_utf8_reported() {
        let (mut wire, mut raw) = pair();
        raw.write_all(&[0, 2, 0xc3, 0x28]).await.unwrap();
        assert!(matches!(
            wire.read_string().await,
            Err(TransportError::InvalidUtf8)
        ));
    }

    #[tokio::test]
    async fn expect_token_mismatch_is_protocol_error() {
        let (a, b) = duplex(1024);
        let mut left = WireStream::new(a);
        let mut right = WireStream::new(b);
        left.write_string("NOPE").await.unwrap();

        match right.expect_token("READY").await {
            Err(LockstepError::Protocol(ProtocolError::UnexpectedToken { expected, received })) => {
                assert_eq!(expected, "READY");
                assert_eq!(received, "NOPE");
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn read_timeout_expires() {
        let (a, _keep_open) = duplex(1024);
        let mut wire = WireStream::new(a).with_read_timeout(Some(Duration::from_secs(60)));
        assert!(matches!(
            wire.read_i64().await,
            Err(TransportError::Timeout { ms: 60_000 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_none_overrides_default_timeout() {
        let (a, b) = duplex(1024);
        let mut wire = WireStream::new(a).with_read_timeout(Some(Duration::from_millis(10)));
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(120)).await;
            let mut peer = WireStream::new(b);
            peer.write_i64(42).await.unwrap();
            peer
        });
        assert_eq!(wire.read_i64_within(None).await.unwrap(), 42);
        drop(writer.await.unwrap());
    }
}
