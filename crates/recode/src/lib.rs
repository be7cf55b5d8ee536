//! Re-encode HTTP response bodies to match what the client accepts
//!
//! Given the encoding an origin body already has and the client's
//! `accept-encoding`, this crate decides whether to leave the body alone,
//! decode and re-compress it in memory, or decode and re-compress it as a
//! chunked stream, and keeps `content-length`, `content-encoding`,
//! `transfer-encoding` and `vary` consistent with whichever path was taken.
//!
//! # Features
//!
//! - identity, gzip, deflate and brotli in and out
//! - bounded memory: bodies above a threshold (16 MiB by default) are streamed
//! - exact `content-length` for everything below the threshold
//! - cpu-heavy whole-buffer compression serialized through a [`JobQueue`]
//! - a fast mode trading ratio for cpu time
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use futures::stream;
//! use http::header::{ACCEPT_ENCODING, CONTENT_TYPE};
//! use http::{HeaderMap, HeaderValue};
//! use micro_recode::{Recompressor, WireSink};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut request = HeaderMap::new();
//!     request.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, br"));
//!
//!     let mut response = HeaderMap::new();
//!     response.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
//!
//!     let body = stream::iter(vec![Ok(Bytes::from_static(b"{\"hello\": \"world\"}"))]);
//!     let mut sink = WireSink::new(tokio::io::stdout());
//!
//!     let recompressor = Recompressor::default();
//!     match recompressor.recompress(&request, &mut response, body, &mut sink, false).await {
//!         Ok(outcome) => println!("sent {} bytes as {}", outcome.bytes_written, outcome.encoding_out),
//!         Err(e) => eprintln!("failed: {e}"),
//!     }
//! }
//! ```
//!
//! # Architecture
//!
//! - [`encoding`]: the four supported encodings and everything algorithm-specific
//! - [`negotiate`]: the pure choice of input and output encoding
//! - [`buffer`]: the one-way switch from buffering to streaming
//! - [`queue`]: admission control for whole-buffer compression
//! - [`sink`]: where the response goes
//! - [`pipeline`]: the state machine tying the above together
//!
//! # Error Handling
//!
//! Every failure ends the run with a single [`PipelineError`]. If the head has
//! not been sent yet, [`PipelineError::status_hint`] suggests the status to
//! answer with; otherwise the only safe reaction is to abort the connection.
//!
//! # Limitations
//!
//! - `accept-encoding` is matched by substring, quality values are ignored
//! - no zstd, no stacked encodings, no range requests

pub mod buffer;
pub mod encoding;
pub mod negotiate;
pub mod pipeline;
pub mod queue;
pub mod sink;

mod config;
mod error;

pub use buffer::AdaptiveBuffer;
pub use config::RecodeConfig;
pub use encoding::{Encoding, Preset};
pub use error::{PipelineError, RecodeError};
pub use negotiate::{HeaderPatch, Negotiation, negotiate};
pub use pipeline::{Mode, Outcome, Recompressor, RecompressorBuilder, Stage, recompress};
pub use queue::{JobQueue, Slot};
pub use sink::{MemorySink, ResponseSink, WireSink};
