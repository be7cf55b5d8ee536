//! The re-encoding pipeline.
//!
//! One run moves through these stages:
//!
//! ```text
//! Init -> Negotiate -> Decode -> Accumulate -+-> FinalizeBuffer -+-> Done
//!                                            |                   |
//!                                            +-> FinalizeStream -+-> Failed
//! ```
//!
//! The body is always decoded first, so everything after `Decode` works on
//! plain bytes. While the decoded body stays below the threshold it is held in
//! memory; at the end it is compressed in one go through the [`JobQueue`] and
//! sent with an exact `content-length`. Once the threshold is reached the head
//! is committed with `transfer-encoding: chunked` and the rest is compressed
//! incrementally as it arrives. The head is written exactly once, after this
//! decision.

use crate::buffer::{AdaptiveBuffer, DEFAULT_THRESHOLD, Finish, Step};
use crate::config::RecodeConfig;
use crate::encoding::Encoding;
use crate::error::{PipelineError, RecodeError};
use crate::negotiate::negotiate;
use crate::queue::{JobQueue, Slot};
use crate::sink::ResponseSink;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt, stream};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body::Body;
use http_body_util::BodyExt;
use std::error::Error;
use std::io;
use tracing::{debug, error, trace};

/// The states of a pipeline run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stage {
    Init,
    Negotiate,
    Decode,
    Accumulate,
    FinalizeBuffer,
    FinalizeStream,
    Done,
    Failed,
}

/// How the body was delivered.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Compressed as a whole and sent with `content-length`.
    Buffered,
    /// Compressed incrementally and sent chunked.
    Streamed,
}

/// Summary of a successful run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub encoding_in: Encoding,
    pub encoding_out: Encoding,
    pub mode: Mode,
    /// Body bytes handed to the sink, after encoding.
    pub bytes_written: u64,
}

/// Re-encodes response bodies; cheap to clone and share between connections.
#[derive(Debug, Clone)]
pub struct Recompressor {
    threshold: usize,
    queue: JobQueue,
}

impl Default for Recompressor {
    /// 16 MiB threshold, jobs go through the process-wide queue.
    fn default() -> Self {
        Self { threshold: DEFAULT_THRESHOLD, queue: JobQueue::global().clone() }
    }
}

#[derive(Debug)]
pub struct RecompressorBuilder {
    threshold: usize,
    queue: Option<JobQueue>,
}

impl RecompressorBuilder {
    fn new() -> Self {
        Self { threshold: DEFAULT_THRESHOLD, queue: None }
    }

    pub fn threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn queue(mut self, queue: JobQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Takes the threshold and a dedicated queue from `config`.
    pub fn config(mut self, config: &RecodeConfig) -> Self {
        self.threshold = config.threshold;
        self.queue = Some(config.build_queue());
        self
    }

    /// Without an explicit queue, jobs go through the process-wide one.
    pub fn build(self) -> Recompressor {
        let queue = self.queue.unwrap_or_else(|| JobQueue::global().clone());
        Recompressor { threshold: self.threshold, queue }
    }
}

/// Tracks where a run is, so a failure can say what was already committed.
#[derive(Debug)]
struct Run {
    stage: Stage,
    head_sent: bool,
}

impl Run {
    fn enter(&mut self, stage: Stage) {
        trace!(from = ?self.stage, to = ?stage, "pipeline stage");
        self.stage = stage;
    }

    /// Builds the terminal error; it records the stage the failure happened in.
    fn fail(&self, source: RecodeError) -> PipelineError {
        trace!(from = ?self.stage, to = ?Stage::Failed, "pipeline stage");
        error!(stage = ?self.stage, head_sent = self.head_sent, cause = %source, "recompression failed");
        PipelineError::new(source, self.stage, self.head_sent)
    }
}

impl Recompressor {
    pub fn builder() -> RecompressorBuilder {
        RecompressorBuilder::new()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Re-encodes `input` for the client and writes the whole response to `sink`.
    ///
    /// `response` holds the origin's headers on entry and the headers that were
    /// sent on return: `vary` names `accept-encoding`, `content-encoding`
    /// matches the chosen encoding and exactly one of `content-length` and
    /// `transfer-encoding: chunked` is present.
    ///
    /// # Errors
    ///
    /// Any decode, compress, queue or sink failure ends the run. The error tells
    /// whether the head already went out, see [`PipelineError::status_hint`].
    pub async fn recompress<I, S>(
        &self,
        request: &HeaderMap,
        response: &mut HeaderMap,
        input: I,
        sink: &mut S,
        fast: bool,
    ) -> Result<Outcome, PipelineError>
    where
        I: Stream<Item = io::Result<Bytes>>,
        S: ResponseSink + ?Sized,
    {
        let mut run = Run { stage: Stage::Init, head_sent: false };

        run.enter(Stage::Negotiate);
        let negotiation = negotiate(request, response, fast);
        negotiation.apply(response);
        let encoding_in = negotiation.encoding_in();
        let encoding_out = negotiation.encoding_out();

        run.enter(Stage::Decode);
        // the origin length is the decoded length only when nothing has to be decoded
        let size_hint = if encoding_in.is_identity() { content_length(response) } else { None };
        let decoded = encoding_in.decode_stream(input.map_err(RecodeError::upstream));
        tokio::pin!(decoded);

        run.enter(Stage::Accumulate);
        let mut buffer = AdaptiveBuffer::new(self.threshold);
        let replay = loop {
            match decoded.next().await {
                Some(Ok(chunk)) => match buffer.push(chunk) {
                    Step::Buffered => {}
                    Step::StreamStarted(replay) => break Some(replay),
                    Step::Passthrough(chunk) => break Some(vec![chunk]),
                },
                Some(Err(e)) => return Err(run.fail(e)),
                None => break None,
            }
        };

        let (mode, bytes_written) = match replay {
            Some(replay) => {
                run.enter(Stage::FinalizeStream);
                let body = stream::iter(replay.into_iter().map(Ok)).chain(decoded.as_mut());
                let encoded = encoding_out.encode_stream(body, fast, size_hint);
                let written = stream_to_sink(encoded, response, sink, &mut run).await?;
                (Mode::Streamed, written)
            }
            None => {
                let Finish::BufferReady(body) = buffer.finish() else {
                    return Err(run.fail(RecodeError::compression(io::Error::other("buffer switched without a stream start"))));
                };

                run.enter(Stage::FinalizeBuffer);
                let written = self.buffer_to_sink(body, encoding_out, fast, response, sink, &mut run).await?;
                (Mode::Buffered, written)
            }
        };

        run.enter(Stage::Done);
        debug!(encoding_in = %encoding_in, encoding_out = %encoding_out, ?mode, bytes_written, "recompression finished");
        Ok(Outcome { encoding_in, encoding_out, mode, bytes_written })
    }

    /// [`recompress`](Self::recompress) with an `http_body::Body` as input; trailers are dropped.
    ///
    /// # Errors
    ///
    /// See [`recompress`](Self::recompress).
    pub async fn recompress_body<B, S>(
        &self,
        request: &HeaderMap,
        response: &mut HeaderMap,
        body: B,
        sink: &mut S,
        fast: bool,
    ) -> Result<Outcome, PipelineError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
        S: ResponseSink + ?Sized,
    {
        let input = body.into_data_stream().map_err(io::Error::other);
        self.recompress(request, response, input, sink, fast).await
    }

    /// Compresses the whole body as one queued job and sends it with its exact length.
    async fn buffer_to_sink<S>(
        &self,
        body: Bytes,
        encoding_out: Encoding,
        fast: bool,
        response: &mut HeaderMap,
        sink: &mut S,
        run: &mut Run,
    ) -> Result<u64, PipelineError>
    where
        S: ResponseSink + ?Sized,
    {
        let head_sent = &mut run.head_sent;
        let job = move |slot: Slot| async move {
            // held until the compression itself ends, even past a timeout
            let compressed = encoding_out.compress_buffer_holding(body, fast, slot).await?;
            let len = compressed.len();

            response.remove(TRANSFER_ENCODING);
            response.insert(CONTENT_LENGTH, HeaderValue::from(len));
            sink.write_head(StatusCode::OK, response).await.map_err(RecodeError::sink_write)?;
            *head_sent = true;

            sink.end(Some(compressed)).await.map_err(RecodeError::sink_write)?;
            Ok::<_, RecodeError>(len as u64)
        };

        match self.queue.run(job).await {
            Ok(written) => Ok(written),
            Err(e) => Err(run.fail(e)),
        }
    }
}

/// Commits a chunked head, then forwards the encoded stream as it is produced.
async fn stream_to_sink<E, S>(encoded: E, response: &mut HeaderMap, sink: &mut S, run: &mut Run) -> Result<u64, PipelineError>
where
    E: Stream<Item = Result<Bytes, RecodeError>>,
    S: ResponseSink + ?Sized,
{
    response.remove(CONTENT_LENGTH);
    response.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    if let Err(e) = sink.write_head(StatusCode::OK, response).await {
        return Err(run.fail(RecodeError::sink_write(e)));
    }
    run.head_sent = true;

    tokio::pin!(encoded);
    let mut written = 0u64;
    while let Some(chunk) = encoded.next().await {
        let chunk = chunk.map_err(|e| run.fail(e))?;
        written += chunk.len() as u64;
        if let Err(e) = sink.write(chunk).await {
            return Err(run.fail(RecodeError::sink_write(e)));
        }
    }

    if let Err(e) = sink.end(None).await {
        return Err(run.fail(RecodeError::sink_write(e)));
    }
    Ok(written)
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers.get(CONTENT_LENGTH)?.to_str().ok()?.trim().parse().ok()
}

/// Re-encodes through a recompressor with the default threshold and the
/// process-wide queue.
///
/// # Errors
///
/// See [`Recompressor::recompress`].
pub async fn recompress<I, S>(
    request: &HeaderMap,
    response: &mut HeaderMap,
    input: I,
    sink: &mut S,
    fast: bool,
) -> Result<Outcome, PipelineError>
where
    I: Stream<Item = io::Result<Bytes>>,
    S: ResponseSink + ?Sized,
{
    Recompressor::default().recompress(request, response, input, sink, fast).await
}
