use crate::encoding::writer::Writer;
use crate::encoding::{Encoding, Preset};
use crate::error::RecodeError;
use brotli::enc::BrotliEncoderParams;
use bytes::Bytes;
use flate2::write::{GzEncoder, ZlibEncoder};
use futures::Stream;
use pin_project_lite::pin_project;
use std::io;
use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tracing::trace;

// adapted from actix-http: https://github.com/actix/actix-web/blob/master/actix-http/src/encoding/encoder.rs

/// Brotli's internal buffer size.
const BR_BUFFER_SIZE: usize = 32 * 1024;

/// Brotli window, BROTLI_PARAM_LGWIN
const BR_LGWIN: i32 = 22;

/// An incremental compressor for one of the non-identity encodings.
pub(crate) enum Encoder {
    /// Gzip encoding.
    Gzip(GzEncoder<Writer>),
    /// Deflate encoding, zlib-wrapped as http's `deflate` requires.
    Deflate(ZlibEncoder<Writer>),
    /// Brotli encoding.
    Br(Box<brotli::CompressorWriter<Writer>>),
}

impl Encoder {
    /// Creates a compressor for `encoding`, or `None` for identity.
    ///
    /// `size_hint` is only used by brotli, which tunes its parameters when the
    /// total input length is known up front.
    pub(crate) fn new(encoding: Encoding, preset: Preset, size_hint: Option<usize>) -> Option<Self> {
        Self::with_writer(encoding, preset, size_hint, Writer::new())
    }

    pub(crate) fn with_writer(encoding: Encoding, preset: Preset, size_hint: Option<usize>, writer: Writer) -> Option<Self> {
        match encoding {
            Encoding::Identity => None,
            Encoding::Gzip => Some(Self::Gzip(GzEncoder::new(writer, preset.flate_level()))),
            Encoding::Deflate => Some(Self::Deflate(ZlibEncoder::new(writer, preset.flate_level()))),
            Encoding::Brotli => {
                let params = BrotliEncoderParams {
                    quality: preset.brotli_quality(),
                    lgwin: BR_LGWIN,
                    size_hint: size_hint.unwrap_or(0),
                    ..BrotliEncoderParams::default()
                };
                Some(Self::Br(Box::new(brotli::CompressorWriter::with_params(writer, BR_BUFFER_SIZE, &params))))
            }
        }
    }

    /// Returns the name of the encoding.
    fn name(&self) -> &'static str {
        match self {
            Encoder::Gzip(_) => "gzip",
            Encoder::Deflate(_) => "deflate",
            Encoder::Br(_) => "br",
        }
    }

    /// Writes data to the encoder.
    pub(crate) fn write(&mut self, data: &[u8]) -> Result<(), io::Error> {
        let result = match self {
            Self::Gzip(encoder) => encoder.write_all(data),
            Self::Deflate(encoder) => encoder.write_all(data),
            Self::Br(encoder) => encoder.write_all(data),
        };

        if let Err(err) = &result {
            trace!("Error encoding {} encoding: {}", self.name(), err);
        }
        result
    }

    /// Takes the encoded data produced so far.
    pub(crate) fn take(&mut self) -> Bytes {
        match self {
            Self::Gzip(encoder) => encoder.get_mut().take(),
            Self::Deflate(encoder) => encoder.get_mut().take(),
            Self::Br(encoder) => encoder.get_mut().take(),
        }
    }

    /// Finishes the encoding process and returns the remaining encoded data.
    pub(crate) fn finish(self) -> Result<Bytes, io::Error> {
        match self {
            Self::Gzip(encoder) => Ok(encoder.finish()?.freeze()),
            Self::Deflate(encoder) => Ok(encoder.finish()?.freeze()),
            Self::Br(mut encoder) => {
                encoder.flush()?;
                // into_inner closes the brotli stream
                Ok(encoder.into_inner().freeze())
            }
        }
    }
}

pin_project! {
    /// Compresses every chunk of the inner stream, preserving order.
    ///
    /// Chunks that only fill the compressor's window yield nothing; the tail
    /// is emitted once the inner stream ends.
    pub struct EncodedStream<S> {
        #[pin]
        inner: S,
        encoder: Option<Encoder>,
    }
}

impl<S> EncodedStream<S> {
    pub(crate) fn new(inner: S, encoder: Encoder) -> Self {
        Self { inner, encoder: Some(encoder) }
    }
}

impl<S> Stream for EncodedStream<S>
where
    S: Stream<Item = Result<Bytes, RecodeError>>,
{
    type Item = Result<Bytes, RecodeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            let Some(encoder) = this.encoder.as_mut() else {
                return Poll::Ready(None);
            };

            return match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => {
                    if let Err(e) = encoder.write(&chunk) {
                        this.encoder.take();
                        return Poll::Ready(Some(Err(RecodeError::compression(e))));
                    }
                    let bytes = encoder.take();
                    if bytes.is_empty() {
                        continue;
                    }
                    Poll::Ready(Some(Ok(bytes)))
                }
                Some(Err(e)) => {
                    this.encoder.take();
                    Poll::Ready(Some(Err(e)))
                }
                None => {
                    // the encoder is only taken here, so the tail is produced once
                    let Some(encoder) = this.encoder.take() else {
                        return Poll::Ready(None);
                    };
                    match encoder.finish() {
                        Ok(bytes) if bytes.is_empty() => Poll::Ready(None),
                        Ok(bytes) => Poll::Ready(Some(Ok(bytes))),
                        Err(e) => Poll::Ready(Some(Err(RecodeError::compression(e)))),
                    }
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use futures::{StreamExt, TryStreamExt, stream};
    use std::io::Read;

    #[test]
    fn identity_has_no_encoder() {
        assert!(Encoder::new(Encoding::Identity, Preset::Fast, None).is_none());
    }

    #[tokio::test]
    async fn encoded_stream_produces_one_gzip_member() {
        let chunks = vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"world"))];
        let encoder = Encoder::new(Encoding::Gzip, Preset::Best, None).unwrap();
        let encoded: Vec<Bytes> = EncodedStream::new(stream::iter(chunks), encoder).try_collect().await.unwrap();

        let joined = encoded.concat();
        let mut plain = String::new();
        GzDecoder::new(&joined[..]).read_to_string(&mut plain).unwrap();
        assert_eq!(plain, "hello world");
    }

    #[tokio::test]
    async fn encoded_stream_stops_after_upstream_error() {
        let chunks = vec![Ok(Bytes::from_static(b"abc")), Err(RecodeError::upstream(io::ErrorKind::ConnectionReset))];
        let encoder = Encoder::new(Encoding::Brotli, Preset::Fast, None).unwrap();
        let mut encoded = EncodedStream::new(stream::iter(chunks), encoder);

        let mut saw_error = false;
        while let Some(item) = encoded.next().await {
            if item.is_err() {
                saw_error = true;
            }
        }
        assert!(saw_error);
        assert!(encoded.next().await.is_none());
    }
}
