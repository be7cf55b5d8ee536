use crate::sink::ResponseSink;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use std::io;
use std::io::ErrorKind;
use tracing::error;

/// Collects a whole response in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    status: Option<StatusCode>,
    headers: Option<HeaderMap>,
    body: BytesMut,
    writes: usize,
    ended: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.headers.as_ref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Number of non-empty body writes, the `end` piece included.
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn into_body(self) -> Bytes {
        self.body.freeze()
    }

    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.headers.is_none() {
            error!("expect response head but receive body");
            return Err(io::Error::from(ErrorKind::InvalidInput));
        }
        if self.ended {
            error!("receive body after the response ended");
            return Err(io::Error::from(ErrorKind::InvalidInput));
        }
        if !bytes.is_empty() {
            self.writes += 1;
            self.body.extend_from_slice(bytes);
        }
        Ok(())
    }
}

#[async_trait]
impl ResponseSink for MemorySink {
    async fn write_head(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()> {
        if self.headers.is_some() {
            error!("response head has already been written");
            return Err(io::Error::from(ErrorKind::InvalidInput));
        }
        self.status = Some(status);
        self.headers = Some(headers.clone());
        Ok(())
    }

    async fn write(&mut self, bytes: Bytes) -> io::Result<()> {
        self.append(&bytes)
    }

    async fn end(&mut self, bytes: Option<Bytes>) -> io::Result<()> {
        if let Some(bytes) = bytes {
            self.append(&bytes)?;
        } else {
            self.append(&[])?;
        }
        self.ended = true;
        Ok(())
    }
}
