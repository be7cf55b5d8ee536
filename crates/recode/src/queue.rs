//! Admission control for cpu-heavy whole-buffer compression.
//!
//! A [`JobQueue`] runs at most `concurrency` jobs at a time and fails any job
//! that runs longer than its timeout. Admission is first come, first served.
//! Streaming compression never goes through the queue.
//!
//! An admitted job receives a [`Slot`]. The queue position is only given back
//! once every copy of the slot is dropped, so work the job moved onto another
//! thread keeps occupying it even after the job itself timed out.

use crate::error::RecodeError;
use once_cell::sync::Lazy;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{trace, warn};

/// Jobs running at once in the process-wide queue.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Time budget of one job in the process-wide queue.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

static GLOBAL: Lazy<JobQueue> = Lazy::new(|| JobQueue::new(DEFAULT_CONCURRENCY, Some(DEFAULT_TIMEOUT)));

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

struct Inner {
    // `None` admits every job immediately
    permits: Option<Arc<Semaphore>>,
    concurrency: usize,
    timeout: Option<Duration>,
    next_id: AtomicU64,
}

/// A job's hold on its queue position.
#[derive(Debug, Clone)]
pub struct Slot {
    job: u64,
    _permit: Option<Arc<OwnedSemaphorePermit>>,
}

impl Slot {
    /// The id the queue logs this job under.
    pub fn job(&self) -> u64 {
        self.job
    }
}

impl JobQueue {
    /// Creates a queue running up to `concurrency` jobs at once, at least one.
    pub fn new(concurrency: usize, timeout: Option<Duration>) -> Self {
        let concurrency = concurrency.max(1);
        Self::with_permits(Some(Arc::new(Semaphore::new(concurrency))), concurrency, timeout)
    }

    /// A queue that runs every job as soon as it is submitted, without a timeout.
    pub fn immediate() -> Self {
        Self::with_permits(None, usize::MAX, None)
    }

    /// The process-wide queue: one job at a time, 180 seconds each.
    pub fn global() -> &'static JobQueue {
        &GLOBAL
    }

    fn with_permits(permits: Option<Arc<Semaphore>>, concurrency: usize, timeout: Option<Duration>) -> Self {
        Self { inner: Arc::new(Inner { permits, concurrency, timeout, next_id: AtomicU64::new(0) }) }
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    /// Rejects every job submitted from now on; jobs already admitted finish normally.
    pub fn close(&self) {
        if let Some(permits) = &self.inner.permits {
            permits.close();
        }
    }

    /// Waits for a free slot, then drives the job built by `job` to completion
    /// within the timeout.
    ///
    /// On timeout the job future is dropped and the job is reported as failed
    /// right away. The position itself stays taken until every clone of the
    /// [`Slot`] handed to `job` is gone, so blocking work that holds one still
    /// counts against the concurrency limit until it really ends.
    pub async fn run<F, Fut, T>(&self, job: F) -> Result<T, RecodeError>
    where
        F: FnOnce(Slot) -> Fut,
        Fut: Future<Output = Result<T, RecodeError>>,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(job = id, "job queued");

        let permit = match &self.inner.permits {
            Some(permits) => match Arc::clone(permits).acquire_owned().await {
                Ok(permit) => Some(Arc::new(permit)),
                Err(_) => {
                    warn!(job = id, "job rejected, queue is closed");
                    return Err(RecodeError::QueueClosed);
                }
            },
            None => None,
        };
        trace!(job = id, "job admitted");

        let job = job(Slot { job: id, _permit: permit });
        let result = match self.inner.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, job).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    warn!(job = id, timeout = ?timeout, "job exceeded its time budget");
                    Err(RecodeError::queue_timeout(timeout))
                }
            },
            None => job.await,
        };

        trace!(job = id, ok = result.is_ok(), "job finished");
        result
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("concurrency", &self.inner.concurrency)
            .field("timeout", &self.inner.timeout)
            .finish_non_exhaustive()
    }
}
