//! HTTP/1.1 response serialization onto an `AsyncWrite`.
//!
//! The head is written verbatim and decides the body framing:
//!
//! - `transfer-encoding: chunked` frames every write as one chunk
//! - `content-length: n` writes the body as is and fails if it is not exactly `n` bytes
//! - neither means the body runs until the connection closes

use crate::sink::ResponseSink;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode};
use std::io;
use std::io::{ErrorKind, Write};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Encoder;
use tracing::{error, trace};

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 4 * 1024;

/// Represents an item in the response payload stream.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PayloadItem {
    Chunk(Bytes),
    Eof,
}

/// Encodes the status line and header block.
#[derive(Debug)]
struct HeadEncoder;

impl<'a> Encoder<(StatusCode, &'a HeaderMap)> for HeadEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: (StatusCode, &'a HeaderMap), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (status, headers) = item;

        dst.reserve(INIT_HEADER_SIZE);
        write!(FastWrite(dst), "HTTP/1.1 {} {}\r\n", status.as_str(), status.canonical_reason().unwrap_or(""))?;

        for (header_name, header_value) in headers {
            dst.put_slice(header_name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(header_value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChunkedEncoder {
    eof: bool,
}

impl Encoder<PayloadItem> for ChunkedEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: PayloadItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.eof {
            return Ok(());
        }

        match item {
            // an empty chunk would read as the terminator
            PayloadItem::Chunk(bytes) if !bytes.has_remaining() => Ok(()),
            PayloadItem::Chunk(bytes) => {
                write!(FastWrite(dst), "{:X}\r\n", bytes.remaining())?;
                dst.reserve(bytes.remaining() + 2);
                dst.extend_from_slice(bytes.chunk());
                dst.extend_from_slice(b"\r\n");
                Ok(())
            }
            PayloadItem::Eof => {
                self.eof = true;
                dst.extend_from_slice(b"0\r\n\r\n");
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LengthEncoder {
    /// bytes still owed to the peer
    remaining: u64,
}

impl Encoder<PayloadItem> for LengthEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: PayloadItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            PayloadItem::Chunk(bytes) => {
                let len = bytes.remaining() as u64;
                if len > self.remaining {
                    error!(len, remaining = self.remaining, "body exceeds content-length");
                    return Err(io::Error::new(ErrorKind::InvalidInput, "body exceeds content-length"));
                }
                dst.extend_from_slice(bytes.chunk());
                self.remaining -= len;
                Ok(())
            }
            PayloadItem::Eof if self.remaining > 0 => {
                error!(remaining = self.remaining, "body shorter than content-length");
                Err(io::Error::new(ErrorKind::UnexpectedEof, "body shorter than content-length"))
            }
            PayloadItem::Eof => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PayloadEncoder {
    /// content-length payload
    Length(LengthEncoder),
    /// transfer-encoding chunked payload
    Chunked(ChunkedEncoder),
    /// delimited by closing the connection
    UntilClose,
}

impl PayloadEncoder {
    fn from_headers(headers: &HeaderMap) -> io::Result<Self> {
        let chunked = headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .last()
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        if chunked {
            return Ok(Self::Chunked(ChunkedEncoder { eof: false }));
        }

        match headers.get(CONTENT_LENGTH) {
            Some(value) => {
                let length = value
                    .to_str()
                    .ok()
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "invalid content-length header"))?;
                Ok(Self::Length(LengthEncoder { remaining: length }))
            }
            None => Ok(Self::UntilClose),
        }
    }
}

impl Encoder<PayloadItem> for PayloadEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: PayloadItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self {
            Self::Length(encoder) => encoder.encode(item, dst),
            Self::Chunked(encoder) => encoder.encode(item, dst),
            Self::UntilClose => {
                if let PayloadItem::Chunk(bytes) = item {
                    dst.extend_from_slice(&bytes);
                }
                Ok(())
            }
        }
    }
}

/// A [`ResponseSink`] writing an HTTP/1.1 response to `W`.
///
/// Every call is flushed before it returns, so a slow peer holds back the
/// pipeline feeding this sink.
#[derive(Debug)]
pub struct WireSink<W> {
    writer: W,
    buffer: BytesMut,
    payload_encoder: Option<PayloadEncoder>,
    ended: bool,
}

impl<W> WireSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self::with_capacity(writer, 8 * 1024)
    }

    pub fn with_capacity(writer: W, buffer_size: usize) -> Self {
        Self { writer, buffer: BytesMut::with_capacity(buffer_size), payload_encoder: None, ended: false }
    }

    #[inline]
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn encode_payload(&mut self, item: PayloadItem) -> io::Result<()> {
        if self.ended {
            error!("receive body after the response ended");
            return Err(io::Error::from(ErrorKind::InvalidInput));
        }
        match &mut self.payload_encoder {
            Some(encoder) => encoder.encode(item, &mut self.buffer),
            None => {
                error!("expect response head but receive payload item");
                Err(io::Error::from(ErrorKind::InvalidInput))
            }
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        trace!(size = self.buffer.len(), "flush response bytes");
        self.writer.write_all(self.buffer.as_ref()).await?;
        self.buffer.clear();
        self.writer.flush().await
    }
}

#[async_trait]
impl<W> ResponseSink for WireSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_head(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()> {
        if self.payload_encoder.is_some() {
            error!("expect payload item but receive response head");
            return Err(io::Error::from(ErrorKind::InvalidInput));
        }

        let payload_encoder = PayloadEncoder::from_headers(headers)?;
        HeadEncoder.encode((status, headers), &mut self.buffer)?;
        self.payload_encoder = Some(payload_encoder);
        self.flush().await
    }

    async fn write(&mut self, bytes: Bytes) -> io::Result<()> {
        self.encode_payload(PayloadItem::Chunk(bytes))?;
        self.flush().await
    }

    async fn end(&mut self, bytes: Option<Bytes>) -> io::Result<()> {
        if let Some(bytes) = bytes {
            self.encode_payload(PayloadItem::Chunk(bytes))?;
        }
        self.encode_payload(PayloadItem::Eof)?;
        self.ended = true;
        self.flush().await
    }
}

/// Writes formatted output straight into a `BytesMut`.
struct FastWrite<'a>(&'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
