//! Execution pool for timeout callbacks.
//!
//! Clock tasks only hand work over; the actual invocation runs here so a
//! slow business callback never delays other deadlines.

use std::sync::Arc;

use tokio::{runtime::Handle, sync::Semaphore};
use tracing::warn;

use crate::error::{Result, TimerError};

/// Boxed unit of work submitted by the scheduling coordinator.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait TimeoutExecutor: Send + Sync {
    /// Queue `job` for execution. An error means the job was not accepted.
    fn submit(&self, job: Job) -> Result<()>;
}

/// Runs jobs on tokio's blocking pool, at most `max_concurrent` at a time.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    runtime: Handle,
    permits: Arc<Semaphore>,
}

impl TokioExecutor {
    pub fn new(runtime: Handle, max_concurrent: usize) -> Self {
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Stop accepting jobs. Jobs already waiting for a permit are dropped.
    pub fn close(&self) {
        self.permits.close();
    }
}

impl TimeoutExecutor for TokioExecutor {
    fn submit(&self, job: Job) -> Result<()> {
        if self.permits.is_closed() {
            return Err(TimerError::Executor("timeout executor is closed".to_string()));
        }
        let permits = Arc::clone(&self.permits);
        self.runtime.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!("timeout executor closed, job dropped");
                return;
            };
            if let Err(e) = tokio::task::spawn_blocking(job).await {
                warn!("timeout job panicked: {e}");
            }
        });
        Ok(())
    }
}

/// Runs each job synchronously on the submitting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl TimeoutExecutor for InlineExecutor {
    fn submit(&self, job: Job) -> Result<()> {
        job();
        Ok(())
    }
}
