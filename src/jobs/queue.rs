//! In-process task submission

use super::{run_job, JobContext, JobHandle};
use crate::catalog::JobRecord;
use crate::error::Result;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// How a job is submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Run to completion before returning
    Wait,
    /// Spawn onto the runtime and return the job id immediately
    Detached,
}

/// Result of a dispatch
#[derive(Debug)]
pub enum Dispatched {
    Finished(JobRecord),
    Queued { job_id: String },
}

impl Dispatched {
    pub fn job_id(&self) -> &str {
        match self {
            Dispatched::Finished(record) => &record.id,
            Dispatched::Queued { job_id } => job_id,
        }
    }
}

/// Runs job bodies either inline or on spawned tasks
#[derive(Clone, Default)]
pub struct TaskQueue {
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn dispatch<F, Fut>(&self, mode: Submission, handle: JobHandle, work: F) -> Result<Dispatched>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        match mode {
            Submission::Wait => Ok(Dispatched::Finished(run_job(handle, work).await?)),
            Submission::Detached => {
                let job_id = handle.id().to_string();
                let id = job_id.clone();
                let task = tokio::spawn(async move {
                    if let Err(e) = run_job(handle, work).await {
                        error!(job = %id, error = %e, "Detached job failed to complete");
                    }
                });
                self.pending
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(task);
                debug!(job = %job_id, "Job queued");
                Ok(Dispatched::Queued { job_id })
            }
        }
    }

    /// Number of detached jobs not yet awaited
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Wait for every detached job, including ones queued while draining
    pub async fn drain(&self) -> usize {
        let mut finished = 0;
        loop {
            let batch: Vec<JoinHandle<()>> = std::mem::take(
                &mut *self
                    .pending
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            );
            if batch.is_empty() {
                return finished;
            }
            for task in batch {
                if let Err(e) = task.await {
                    error!(error = %e, "Detached job task failed");
                }
                finished += 1;
            }
        }
    }
}
