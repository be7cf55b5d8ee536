//! Where the re-encoded response goes.
//!
//! The surrounding server owns the real connection; the pipeline only needs
//! the small capability set of [`ResponseSink`]. Two adapters are provided:
//!
//! - [`MemorySink`]: records the response as a value
//! - [`WireSink`]: serializes an HTTP/1.1 response onto any `AsyncWrite`

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::io;

mod memory;
mod wire;

pub use memory::MemorySink;
pub use wire::WireSink;

#[async_trait]
pub trait ResponseSink: Send {
    /// Commits the status and headers. Called once, before any body bytes.
    async fn write_head(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()>;

    /// Writes a piece of the body, waiting for the sink to accept it.
    async fn write(&mut self, bytes: Bytes) -> io::Result<()>;

    /// Writes the optional last piece and completes the response.
    async fn end(&mut self, bytes: Option<Bytes>) -> io::Result<()>;
}

#[async_trait]
impl<S: ResponseSink + ?Sized> ResponseSink for &mut S {
    async fn write_head(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()> {
        (**self).write_head(status, headers).await
    }

    async fn write(&mut self, bytes: Bytes) -> io::Result<()> {
        (**self).write(bytes).await
    }

    async fn end(&mut self, bytes: Option<Bytes>) -> io::Result<()> {
        (**self).end(bytes).await
    }
}

#[async_trait]
impl<S: ResponseSink + ?Sized> ResponseSink for Box<S> {
    async fn write_head(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()> {
        (**self).write_head(status, headers).await
    }

    async fn write(&mut self, bytes: Bytes) -> io::Result<()> {
        (**self).write(bytes).await
    }

    async fn end(&mut self, bytes: Option<Bytes>) -> io::Result<()> {
        (**self).end(bytes).await
    }
}
