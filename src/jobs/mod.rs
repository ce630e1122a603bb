//! Job lifecycle tracking
//!
//! Every asynchronous unit of work owns one [`JobRecord`]. A record starts in
//! `Initializing task...`, takes any number of status/error/output writes while
//! open, and is completed exactly once through [`JobHandle::complete`]. Writes
//! to a completed record fail with [`Error::JobTerminal`].
//!
//! [`run_job`] drives a work body against a handle and guarantees the terminal
//! transition whether the body succeeds, returns an error or panics. A handle
//! dropped without completing schedules a completion with an
//! "abandoned" error.

mod queue;

pub use queue::{Dispatched, Submission, TaskQueue};

use crate::catalog::{Catalog, JobRecord};
use crate::error::{Error, Result};
use chrono::Utc;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const INITIAL_STATUS: &str = "Initializing task...";
pub const COMPLETED_STATUS: &str = "Completed";
pub const COMPLETED_WITH_ERROR_STATUS: &str = "Completed with error";
pub const ABANDONED_ERROR: &str = "job abandoned before completion";

/// Lifecycle state derived from a job record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Initializing,
    Running(String),
    Completed,
    CompletedWithError(String),
}

impl JobState {
    pub fn of(record: &JobRecord) -> Self {
        match (record.completed, &record.error) {
            (true, Some(error)) => JobState::CompletedWithError(error.clone()),
            (true, None) => JobState::Completed,
            (false, _) if record.status == INITIAL_STATUS => JobState::Initializing,
            (false, _) => JobState::Running(record.status.clone()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::CompletedWithError(_))
    }
}

/// Declaration of a job about to start
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub name: String,
    pub job_type: String,
    pub project_id: Option<String>,
    pub inputs: Map<String, Value>,
}

/// Creates and looks up job records
#[derive(Clone)]
pub struct JobTracker {
    catalog: Catalog,
}

impl JobTracker {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    /// Persist a new record before any work begins
    pub async fn start(&self, job: NewJob) -> Result<JobHandle> {
        let now = Utc::now().to_rfc3339();
        let record = JobRecord {
            id: Uuid::new_v4().to_string(),
            name: job.name,
            job_type: job.job_type,
            project_id: job.project_id,
            inputs_json: serde_json::to_string(&job.inputs)?,
            outputs_json: None,
            status: INITIAL_STATUS.to_string(),
            error: None,
            completed: false,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
        };
        self.catalog.insert_job(&record).await?;
        info!(job = %record.id, job_type = %record.job_type, name = %record.name, "Job started");

        Ok(JobHandle {
            context: JobContext {
                catalog: self.catalog.clone(),
                job_id: Arc::from(record.id.as_str()),
            },
            completed: false,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        self.catalog.get_job(id).await
    }
}

/// Write access to one open job record
#[derive(Clone)]
pub struct JobContext {
    catalog: Catalog,
    job_id: Arc<str>,
}

impl JobContext {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn terminal(&self) -> Error {
        Error::JobTerminal(self.job_id.to_string())
    }

    pub async fn record(&self) -> Result<JobRecord> {
        self.catalog
            .get_job(&self.job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", self.job_id)))
    }

    pub async fn inputs(&self) -> Result<Map<String, Value>> {
        Ok(self.record().await?.inputs())
    }

    pub async fn write_status(&self, status: &str) -> Result<()> {
        debug!(job = %self.job_id, status, "Job status");
        if !self.catalog.update_job_status(&self.job_id, status).await? {
            return Err(self.terminal());
        }
        Ok(())
    }

    /// Record an error. The job stays open until completed.
    pub async fn write_error(&self, error: &str) -> Result<()> {
        warn!(job = %self.job_id, error, "Job error");
        if !self.catalog.update_job_error(&self.job_id, error).await? {
            return Err(self.terminal());
        }
        Ok(())
    }

    pub async fn write_output(&self, key: &str, value: Value) -> Result<()> {
        let mut outputs = self.record().await?.outputs();
        outputs.insert(key.to_string(), value);
        if !self.catalog.update_job_outputs(&self.job_id, &outputs).await? {
            return Err(self.terminal());
        }
        Ok(())
    }

    pub async fn rename(&self, name: &str) -> Result<()> {
        if !self.catalog.update_job_name(&self.job_id, name).await? {
            return Err(self.terminal());
        }
        Ok(())
    }

    async fn finish(&self) -> Result<JobRecord> {
        let record = self.record().await?;
        let status = match record.error {
            Some(_) => COMPLETED_WITH_ERROR_STATUS,
            None => COMPLETED_STATUS,
        };
        if !self.catalog.complete_job(&self.job_id, status).await? {
            return Err(self.terminal());
        }
        info!(job = %self.job_id, status, "Job completed");
        self.record().await
    }
}

/// Ownership of a job's terminal transition
pub struct JobHandle {
    context: JobContext,
    completed: bool,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        self.context.job_id()
    }

    pub fn context(&self) -> JobContext {
        self.context.clone()
    }

    /// The single terminal transition
    pub async fn complete(mut self) -> Result<JobRecord> {
        self.completed = true;
        self.context.finish().await
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let context = self.context.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(job = %context.job_id, "Job handle dropped without completion");
                runtime.spawn(async move {
                    let open_error = context.record().await.map(|r| r.error.is_none());
                    if let Ok(true) = open_error {
                        let _ = context.write_error(ABANDONED_ERROR).await;
                    }
                    if let Err(e) = context.finish().await {
                        warn!(job = %context.job_id, error = %e, "Could not complete abandoned job");
                    }
                });
            }
            Err(_) => warn!(job = %context.job_id, "Job abandoned outside a runtime; left open"),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("job panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("job panicked: {}", message)
    } else {
        "job panicked".to_string()
    }
}

/// Run `work` and complete the job on every exit path.
///
/// An `Err` or a panic from the body is written as the job error before the
/// terminal transition.
pub async fn run_job<F, Fut>(handle: JobHandle, work: F) -> Result<JobRecord>
where
    F: FnOnce(JobContext) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let context = handle.context();
    let body = context.clone();
    let outcome = AssertUnwindSafe(async move { work(body).await })
        .catch_unwind()
        .await;

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(payload) => Some(panic_message(payload.as_ref())),
    };
    if let Some(message) = failure {
        if let Err(e) = context.write_error(&message).await {
            warn!(job = %context.job_id(), error = %e, "Could not record job error");
        }
    }
    handle.complete().await
}
