use crate::pipeline::Stage;
use http::StatusCode;
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecodeError {
    #[error("compression failure: {source}")]
    Compression { source: io::Error },

    #[error("buffer job exceeded its time budget of {timeout:?}")]
    QueueTimeout { timeout: Duration },

    #[error("job queue is closed")]
    QueueClosed,

    #[error("sink write failure: {source}")]
    SinkWrite { source: io::Error },

    #[error("input stream failure: {source}")]
    Upstream { source: io::Error },
}

impl RecodeError {
    pub fn compression<E: Into<io::Error>>(e: E) -> Self {
        Self::Compression { source: e.into() }
    }

    pub fn sink_write<E: Into<io::Error>>(e: E) -> Self {
        Self::SinkWrite { source: e.into() }
    }

    pub fn upstream<E: Into<io::Error>>(e: E) -> Self {
        Self::Upstream { source: e.into() }
    }

    pub fn queue_timeout(timeout: Duration) -> Self {
        Self::QueueTimeout { timeout }
    }
}

/// The single terminal failure of a pipeline run.
///
/// Carries the stage the pipeline was in and whether the response head had
/// already been committed to the sink, which decides what the caller can still
/// do about it.
#[derive(Debug, Error)]
#[error("recompression failed during {stage:?} (head sent: {head_sent}): {source}")]
pub struct PipelineError {
    #[source]
    source: RecodeError,
    stage: Stage,
    head_sent: bool,
}

impl PipelineError {
    pub(crate) fn new(source: RecodeError, stage: Stage, head_sent: bool) -> Self {
        Self { source, stage, head_sent }
    }

    pub fn kind(&self) -> &RecodeError {
        &self.source
    }

    pub fn into_inner(self) -> RecodeError {
        self.source
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn head_sent(&self) -> bool {
        self.head_sent
    }

    /// The status the caller should answer with, or `None` when the head is
    /// already on the wire and the connection has to be aborted instead.
    pub fn status_hint(&self) -> Option<StatusCode> {
        if self.head_sent {
            return None;
        }
        match self.source {
            RecodeError::QueueTimeout { .. } | RecodeError::QueueClosed => Some(StatusCode::SERVICE_UNAVAILABLE),
            RecodeError::Upstream { .. } => Some(StatusCode::BAD_GATEWAY),
            RecodeError::Compression { .. } | RecodeError::SinkWrite { .. } => Some(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}
