use crate::encoding::Encoding;
use crate::encoding::writer::Writer;
use crate::error::RecodeError;
use bytes::Bytes;
use flate2::write::GzDecoder;
use flate2::{Decompress, FlushDecompress, Status};
use futures::Stream;
use pin_project_lite::pin_project;
use std::io;
use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tracing::trace;

const BR_BUFFER_SIZE: usize = 32 * 1024;

/// Output window of one inflate call.
const INFLATE_BUFFER_SIZE: usize = 32 * 1024;

/// A zlib inflater that remembers whether the stream reached its end marker.
///
/// `flate2::write::ZlibDecoder` accepts a stream cut short as a complete one,
/// so the deflate path drives `Decompress` itself.
pub(crate) struct Inflater {
    state: Decompress,
    writer: Writer,
    scratch: Box<[u8]>,
    ended: bool,
}

impl Inflater {
    fn new(writer: Writer) -> Self {
        Self { state: Decompress::new(true), writer, scratch: vec![0; INFLATE_BUFFER_SIZE].into_boxed_slice(), ended: false }
    }

    fn write(&mut self, mut input: &[u8]) -> io::Result<()> {
        loop {
            if self.ended {
                if input.is_empty() {
                    return Ok(());
                }
                return Err(io::Error::new(io::ErrorKind::InvalidData, "trailing bytes after deflate stream"));
            }

            let (in_before, out_before) = (self.state.total_in(), self.state.total_out());
            let status = self
                .state
                .decompress(input, &mut self.scratch, FlushDecompress::None)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let consumed = usize::try_from(self.state.total_in() - in_before).map_err(io::Error::other)?;
            let produced = usize::try_from(self.state.total_out() - out_before).map_err(io::Error::other)?;

            input = &input[consumed..];
            self.writer.buf.extend_from_slice(&self.scratch[..produced]);

            match status {
                Status::StreamEnd => self.ended = true,
                // a full window may hide more pending output
                _ if produced == self.scratch.len() => {}
                _ if input.is_empty() => return Ok(()),
                _ if consumed == 0 && produced == 0 => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "deflate stream stalled"));
                }
                _ => {}
            }
        }
    }

    fn finish(self) -> io::Result<Bytes> {
        if !self.ended {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated deflate stream"));
        }
        Ok(self.writer.freeze())
    }
}

/// An incremental decompressor, the mirror of [`Encoder`](super::encoder::Encoder).
pub(crate) enum Decoder {
    Gzip(GzDecoder<Writer>),
    Deflate(Box<Inflater>),
    Br(Box<brotli::DecompressorWriter<Writer>>),
}

impl Decoder {
    pub(crate) fn new(encoding: Encoding) -> Option<Self> {
        Self::with_writer(encoding, Writer::new())
    }

    pub(crate) fn with_writer(encoding: Encoding, writer: Writer) -> Option<Self> {
        match encoding {
            Encoding::Identity => None,
            Encoding::Gzip => Some(Self::Gzip(GzDecoder::new(writer))),
            Encoding::Deflate => Some(Self::Deflate(Box::new(Inflater::new(writer)))),
            Encoding::Brotli => Some(Self::Br(Box::new(brotli::DecompressorWriter::new(writer, BR_BUFFER_SIZE)))),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Decoder::Gzip(_) => "gzip",
            Decoder::Deflate(_) => "deflate",
            Decoder::Br(_) => "br",
        }
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> Result<(), io::Error> {
        let result = match self {
            Self::Gzip(decoder) => decoder.write_all(data),
            Self::Deflate(inflater) => inflater.write(data),
            Self::Br(decoder) => decoder.write_all(data),
        };

        if let Err(err) = &result {
            trace!("Error decoding {} encoding: {}", self.name(), err);
        }
        result
    }

    pub(crate) fn take(&mut self) -> Bytes {
        match self {
            Self::Gzip(decoder) => decoder.get_mut().take(),
            Self::Deflate(inflater) => inflater.writer.take(),
            Self::Br(decoder) => decoder.get_mut().take(),
        }
    }

    /// Flushes the decompressor, failing if the compressed input was truncated.
    pub(crate) fn finish(self) -> Result<Bytes, io::Error> {
        match self {
            Self::Gzip(decoder) => Ok(decoder.finish()?.freeze()),
            Self::Deflate(inflater) => inflater.finish(),
            Self::Br(decoder) => match decoder.into_inner() {
                Ok(writer) => Ok(writer.freeze()),
                Err(_) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated brotli stream")),
            },
        }
    }
}

pin_project! {
    /// Decompresses the inner stream chunk by chunk, preserving order.
    pub struct DecodedStream<S> {
        #[pin]
        inner: S,
        decoder: Option<Decoder>,
    }
}

impl<S> DecodedStream<S> {
    pub(crate) fn new(inner: S, decoder: Decoder) -> Self {
        Self { inner, decoder: Some(decoder) }
    }
}

impl<S> Stream for DecodedStream<S>
where
    S: Stream<Item = Result<Bytes, RecodeError>>,
{
    type Item = Result<Bytes, RecodeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            let Some(decoder) = this.decoder.as_mut() else {
                return Poll::Ready(None);
            };

            return match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => {
                    if let Err(e) = decoder.write(&chunk) {
                        this.decoder.take();
                        return Poll::Ready(Some(Err(RecodeError::compression(e))));
                    }
                    let bytes = decoder.take();
                    if bytes.is_empty() {
                        continue;
                    }
                    Poll::Ready(Some(Ok(bytes)))
                }
                Some(Err(e)) => {
                    this.decoder.take();
                    Poll::Ready(Some(Err(e)))
                }
                None => {
                    let Some(decoder) = this.decoder.take() else {
                        return Poll::Ready(None);
                    };
                    match decoder.finish() {
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
    use flate2::Compression;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use futures::{TryStreamExt, stream};

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    async fn decode(encoding: Encoding, chunks: Vec<Bytes>) -> Result<Bytes, RecodeError> {
        let decoder = Decoder::new(encoding).unwrap();
        let decoded: Vec<Bytes> = DecodedStream::new(stream::iter(chunks.into_iter().map(Ok)), decoder).try_collect().await?;
        Ok(Bytes::from(decoded.concat()))
    }

    #[tokio::test]
    async fn decodes_across_arbitrary_chunk_boundaries() {
        let plain = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let compressed = gzip(&plain);
        let chunks: Vec<_> = compressed.chunks(7).map(|c| Ok(Bytes::copy_from_slice(c))).collect();

        let decoder = Decoder::new(Encoding::Gzip).unwrap();
        let decoded: Vec<Bytes> = DecodedStream::new(stream::iter(chunks), decoder).try_collect().await.unwrap();
        assert_eq!(decoded.concat(), plain);
    }

    #[tokio::test]
    async fn truncated_input_is_a_compression_failure() {
        let plain = b"abcdefgh".repeat(1000);
        for (encoding, compressed) in [(Encoding::Gzip, gzip(&plain)), (Encoding::Deflate, zlib(&plain))] {
            let truncated = Bytes::copy_from_slice(&compressed[..compressed.len() / 2]);
            let result = decode(encoding, vec![truncated]).await;
            assert!(matches!(result, Err(RecodeError::Compression { .. })), "{encoding}");
        }
    }

    #[tokio::test]
    async fn deflate_output_larger_than_one_window() {
        let plain: Vec<u8> = (0..300_000u32).map(|i| (i % 7 + i % 13) as u8).collect();
        let compressed = zlib(&plain);
        let chunks = compressed.chunks(1000).map(Bytes::copy_from_slice).collect();
        assert_eq!(decode(Encoding::Deflate, chunks).await.unwrap(), plain);
    }

    #[tokio::test]
    async fn deflate_empty_stream_decodes_to_nothing() {
        let compressed = Bytes::from(zlib(b""));
        assert!(decode(Encoding::Deflate, vec![compressed]).await.unwrap().is_empty());

        // no input at all is not an empty stream
        assert!(decode(Encoding::Deflate, Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn deflate_rejects_trailing_bytes() {
        let mut compressed = zlib(b"payload");
        compressed.extend_from_slice(b"junk");
        let result = decode(Encoding::Deflate, vec![Bytes::from(compressed)]).await;
        assert!(matches!(result, Err(RecodeError::Compression { .. })));
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        let decoder = Decoder::new(Encoding::Deflate).unwrap();
        let chunks = vec![Ok(Bytes::from_static(b"definitely not zlib"))];
        let result: Result<Vec<Bytes>, _> = DecodedStream::new(stream::iter(chunks), decoder).try_collect().await;
        assert!(matches!(result, Err(RecodeError::Compression { .. })));
    }
}
