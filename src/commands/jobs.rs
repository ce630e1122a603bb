//! Job polling commands

use crate::app::App;
use crate::catalog::{JobFilter, JobRecord};
use crate::error::{Error, Result};
use crate::jobs::JobState;
use crossterm::style::Stylize;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

/// A job record as shown to polling clients
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub job_type: String,
    pub project_id: Option<String>,
    pub state: &'static str,
    pub status: String,
    pub error: Option<String>,
    pub completed: bool,
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl From<JobRecord> for JobInfo {
    fn from(record: JobRecord) -> Self {
        let state = match JobState::of(&record) {
            JobState::Initializing => "initializing",
            JobState::Running(_) => "running",
            JobState::Completed => "completed",
            JobState::CompletedWithError(_) => "completed_with_error",
        };
        Self {
            inputs: record.inputs(),
            outputs: record.outputs(),
            id: record.id,
            name: record.name,
            job_type: record.job_type,
            project_id: record.project_id,
            state,
            status: record.status,
            error: record.error,
            completed: record.completed,
            created_at: record.created_at,
            completed_at: record.completed_at,
        }
    }
}

/// Filters for `jobs`
#[derive(Debug, Clone, Default)]
pub struct JobListOptions {
    /// Project name
    pub project: Option<String>,
    pub job_type: Option<String>,
    pub limit: Option<i64>,
}

/// List job records, newest first
pub async fn cmd_list_jobs(app: &App, options: JobListOptions) -> Result<Vec<JobInfo>> {
    info!("Listing jobs");

    let project_id = match &options.project {
        Some(name) => Some(
            app.catalog
                .get_project_by_name(name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("project '{}'", name)))?
                .id,
        ),
        None => None,
    };

    let records = app
        .catalog
        .list_jobs(&JobFilter {
            project_id,
            job_type: options.job_type,
            limit: options.limit,
        })
        .await?;
    Ok(records.into_iter().map(JobInfo::from).collect())
}

/// Look up one job record
pub async fn cmd_show_job(app: &App, id: &str) -> Result<JobInfo> {
    app.tracker
        .get(id)
        .await?
        .map(JobInfo::from)
        .ok_or_else(|| Error::NotFound(format!("job {}", id)))
}

fn state_marker(job: &JobInfo) -> String {
    match job.state {
        "completed" => "✓".green().to_string(),
        "completed_with_error" => "✗".red().to_string(),
        _ => "…".yellow().to_string(),
    }
}

/// Print a job list to console
pub fn print_jobs(jobs: &[JobInfo]) {
    println!("\n🛠 Jobs\n");

    if jobs.is_empty() {
        println!("No jobs recorded. Use 'geoingest ingest' or 'geoingest analyze' to start some.");
        return;
    }

    for job in jobs {
        println!("{} {} [{}]", state_marker(job), job.name, job.job_type);
        println!("    ID: {}", job.id);
        println!("    Status: {}", job.status);
        if let Some(error) = &job.error {
            println!("    Error: {}", error.as_str().red());
        }
    }
}

/// Print one job in full
pub fn print_job(job: &JobInfo) {
    println!("{} {} [{}]", state_marker(job), job.name, job.job_type);
    println!("  ID: {}", job.id);
    if let Some(project) = &job.project_id {
        println!("  Project: {}", project);
    }
    println!("  State: {}", job.state);
    println!("  Status: {}", job.status);
    if let Some(error) = &job.error {
        println!("  Error: {}", error.as_str().red());
    }
    println!("  Created: {}", job.created_at);
    if let Some(completed_at) = &job.completed_at {
        println!("  Completed: {}", completed_at);
    }
    if !job.inputs.is_empty() {
        println!("  Inputs:");
        for (key, value) in &job.inputs {
            println!("    {}: {}", key, value);
        }
    }
    if !job.outputs.is_empty() {
        println!("  Outputs:");
        for (key, value) in &job.outputs {
            println!("    {}: {}", key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::test_app;
    use crate::catalog::NewProject;
    use crate::jobs::{run_job, NewJob};
    use serde_json::json;

    #[tokio::test]
    async fn test_list_and_show_jobs() {
        let (_tmp, app) = test_app().await;
        let (project, _) = app
            .catalog
            .create_project(&NewProject {
                name: "Harbor".to_string(),
                default_map_center: [0.0, 0.0],
                default_map_zoom: 4.0,
            })
            .await
            .unwrap();

        let handle = app
            .tracker
            .start(NewJob {
                name: "Failing".to_string(),
                job_type: "demo".to_string(),
                project_id: Some(project.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        run_job(handle, |job| async move {
            job.write_output("partial", json!(1)).await?;
            Err(Error::Job("boom".to_string()))
        })
        .await
        .unwrap();

        let open = app
            .tracker
            .start(NewJob {
                name: "Open".to_string(),
                job_type: "other".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let jobs = cmd_list_jobs(
            &app,
            JobListOptions {
                project: Some("Harbor".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, "completed_with_error");
        assert_eq!(jobs[0].outputs["partial"], json!(1));

        let shown = cmd_show_job(&app, open.id()).await.unwrap();
        assert_eq!(shown.state, "initializing");
        open.complete().await.unwrap();

        assert!(matches!(
            cmd_show_job(&app, "missing").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            cmd_list_jobs(
                &app,
                JobListOptions {
                    project: Some("Nowhere".to_string()),
                    ..Default::default()
                }
            )
            .await,
            Err(Error::NotFound(_))
        ));
    }
}
