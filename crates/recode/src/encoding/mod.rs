//! The registry of supported content encodings.
//!
//! Every algorithm-specific detail lives here: how a token is recognised, which
//! compression preset is used, how a stream or a whole buffer is compressed and
//! decompressed, and how the `content-encoding` header is mutated. The rest of
//! the crate only ever holds an [`Encoding`] value.
//!
//! | Encoding | Token     | Fast preset | Best preset |
//! |----------|-----------|-------------|-------------|
//! | identity | -         | -           | -           |
//! | gzip     | `gzip`    | level 3     | level 9     |
//! | deflate  | `deflate` | level 3     | level 9     |
//! | brotli   | `br`      | quality 3   | quality 11  |

use crate::error::RecodeError;
use crate::negotiate::HeaderPatch;
use bytes::Bytes;
use flate2::Compression;
use futures::Stream;
use futures::future::Either;
use http::HeaderMap;
use std::fmt;

mod decoder;
mod encoder;
mod writer;

pub use decoder::DecodedStream;
pub use encoder::EncodedStream;

use decoder::Decoder;
use encoder::Encoder;
use writer::Writer;

/// One of the four supported content encodings.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

/// Compression preset, selected by the caller's fast flag.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Preset {
    /// Trade ratio for lower cpu cost.
    Fast,
    /// Best ratio the algorithm offers.
    Best,
}

impl Preset {
    pub fn from_fast(fast: bool) -> Self {
        if fast { Preset::Fast } else { Preset::Best }
    }

    pub fn flate_level(self) -> Compression {
        match self {
            Preset::Fast => Compression::new(3),
            Preset::Best => Compression::new(9),
        }
    }

    pub fn brotli_quality(self) -> i32 {
        match self {
            Preset::Fast => 3,
            Preset::Best => 11,
        }
    }
}

impl Encoding {
    /// All encodings, in no particular order.
    pub const ALL: [Encoding; 4] = [Encoding::Identity, Encoding::Gzip, Encoding::Deflate, Encoding::Brotli];

    /// Picks the output encoding from an `accept-encoding` value.
    ///
    /// The check is a case-insensitive substring containment in the fixed
    /// order brotli > gzip > deflate > identity, so a token such as `xbr`
    /// also counts as brotli. `exclude_brotli` skips brotli even when the
    /// client accepts it. Anything unrecognised falls back to identity.
    pub fn detect(accept: &str, exclude_brotli: bool) -> Encoding {
        let accept = accept.to_ascii_lowercase();
        if !exclude_brotli && accept.contains("br") {
            Encoding::Brotli
        } else if accept.contains("gzip") {
            Encoding::Gzip
        } else if accept.contains("deflate") {
            Encoding::Deflate
        } else {
            Encoding::Identity
        }
    }

    /// Looks up the encoding declared by a `content-encoding` value.
    ///
    /// Only an exact token matches; absent or unknown values are identity.
    pub fn from_token(token: &str) -> Encoding {
        let token = token.trim();
        if token.eq_ignore_ascii_case("br") {
            Encoding::Brotli
        } else if token.eq_ignore_ascii_case("gzip") || token.eq_ignore_ascii_case("x-gzip") {
            Encoding::Gzip
        } else if token.eq_ignore_ascii_case("deflate") {
            Encoding::Deflate
        } else {
            Encoding::Identity
        }
    }

    /// The wire token.
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
            Encoding::Brotli => "br",
        }
    }

    pub fn is_identity(self) -> bool {
        self == Encoding::Identity
    }

    /// The `content-encoding` change that announces this encoding.
    pub fn header_patch(self) -> HeaderPatch {
        match self {
            Encoding::Identity => HeaderPatch::Remove(http::header::CONTENT_ENCODING),
            encoding => HeaderPatch::Set(http::header::CONTENT_ENCODING, http::HeaderValue::from_static(encoding.as_str())),
        }
    }

    /// Sets or removes `content-encoding` in `headers`.
    pub fn apply_header(self, headers: &mut HeaderMap) {
        self.header_patch().apply(headers);
    }

    /// Attaches an incremental compressor to `stream`; identity passes it through.
    pub fn encode_stream<S>(self, stream: S, fast: bool, size_hint: Option<usize>) -> Either<S, EncodedStream<S>>
    where
        S: Stream<Item = Result<Bytes, RecodeError>>,
    {
        match Encoder::new(self, Preset::from_fast(fast), size_hint) {
            Some(encoder) => Either::Right(EncodedStream::new(stream, encoder)),
            None => Either::Left(stream),
        }
    }

    /// Attaches an incremental decompressor to `stream`; identity passes it through.
    pub fn decode_stream<S>(self, stream: S) -> Either<S, DecodedStream<S>>
    where
        S: Stream<Item = Result<Bytes, RecodeError>>,
    {
        match Decoder::new(self) {
            Some(decoder) => Either::Right(DecodedStream::new(stream, decoder)),
            None => Either::Left(stream),
        }
    }

    /// Compresses a whole buffer on the blocking pool.
    ///
    /// Brotli receives the buffer length as its size hint.
    pub async fn compress_buffer(self, bytes: Bytes, fast: bool) -> Result<Bytes, RecodeError> {
        self.compress_buffer_holding(bytes, fast, ()).await
    }

    /// [`compress_buffer`](Self::compress_buffer), keeping `guard` alive until
    /// the compression itself is over, even if the caller stops waiting for it.
    pub(crate) async fn compress_buffer_holding<G>(self, bytes: Bytes, fast: bool, guard: G) -> Result<Bytes, RecodeError>
    where
        G: Send + 'static,
    {
        if self.is_identity() {
            return Ok(bytes);
        }

        let preset = Preset::from_fast(fast);
        run_blocking(guard, move || {
            let writer = Writer::with_capacity(bytes.len() / 4 + 64);
            let Some(mut encoder) = Encoder::with_writer(self, preset, Some(bytes.len()), writer) else {
                return Ok(bytes);
            };
            encoder.write(&bytes)?;
            encoder.finish()
        })
        .await
    }

    /// Decompresses a whole buffer on the blocking pool.
    pub async fn decompress_buffer(self, bytes: Bytes) -> Result<Bytes, RecodeError> {
        if self.is_identity() {
            return Ok(bytes);
        }

        run_blocking((), move || {
            let writer = Writer::with_capacity(bytes.len().saturating_mul(4));
            let Some(mut decoder) = Decoder::with_writer(self, writer) else {
                return Ok(bytes);
            };
            decoder.write(&bytes)?;
            decoder.finish()
        })
        .await
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

async fn run_blocking<G, F>(guard: G, f: F) -> Result<Bytes, RecodeError>
where
    G: Send + 'static,
    F: FnOnce() -> std::io::Result<Bytes> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        f()
    });
    match task.await {
        Ok(result) => result.map_err(RecodeError::compression),
        Err(join_error) => Err(RecodeError::compression(std::io::Error::other(join_error))),
    }
}
