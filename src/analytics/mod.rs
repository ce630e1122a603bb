//! Analysis types run as tracked jobs

mod flood;

pub use flood::{CommandFloodModel, FloodModel, FloodParameters, FloodSimulation};

use crate::catalog::Project;
use crate::config::Config;
use crate::convert::Converter;
use crate::error::{Error, Result};
use crate::jobs::{Dispatched, JobContext, JobTracker, NewJob, Submission, TaskQueue};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

/// A kind of analysis that can be run against a project
#[async_trait]
pub trait AnalysisType: Send + Sync {
    /// Display name
    fn name(&self) -> &str;

    /// Stable identifier stored as the job type
    fn db_value(&self) -> &str;

    fn description(&self) -> &str;

    fn attribution(&self) -> &str {
        ""
    }

    /// Input name to type name, in declaration order
    fn input_types(&self) -> Vec<(&'static str, &'static str)>;

    fn output_types(&self) -> Vec<(&'static str, &'static str)>;

    fn is_enabled(&self) -> bool;

    /// Do the work for an open job. Expected input problems are written to
    /// the job rather than returned.
    async fn execute(&self, job: JobContext) -> Result<()>;
}

/// Listing entry for an analysis type
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub name: String,
    pub db_value: String,
    pub description: String,
    pub attribution: String,
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
}

fn type_map(types: Vec<(&'static str, &'static str)>) -> Map<String, Value> {
    types
        .into_iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect()
}

impl AnalysisSummary {
    pub fn of(analysis: &dyn AnalysisType) -> Self {
        Self {
            name: analysis.name().to_string(),
            db_value: analysis.db_value().to_string(),
            description: analysis.description().to_string(),
            attribution: analysis.attribution().to_string(),
            inputs: type_map(analysis.input_types()),
            outputs: type_map(analysis.output_types()),
        }
    }
}

/// Known analysis types
#[derive(Clone, Default)]
pub struct AnalysisRegistry {
    types: Vec<Arc<dyn AnalysisType>>,
}

impl AnalysisRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of every analysis shipped with the crate
    pub fn from_config(config: &Config, converter: Converter) -> Self {
        let model = config
            .analytics
            .flood_model_command
            .clone()
            .map(|argv| Arc::new(CommandFloodModel::new(argv)) as Arc<dyn FloodModel>);
        let mut registry = Self::new();
        registry.register(Arc::new(FloodSimulation::new(converter, model)));
        registry
    }

    pub fn register(&mut self, analysis: Arc<dyn AnalysisType>) {
        self.types.retain(|a| a.db_value() != analysis.db_value());
        self.types.push(analysis);
    }

    pub fn get(&self, db_value: &str) -> Option<Arc<dyn AnalysisType>> {
        self.types.iter().find(|a| a.db_value() == db_value).cloned()
    }

    pub fn enabled(&self) -> Vec<Arc<dyn AnalysisType>> {
        self.types.iter().filter(|a| a.is_enabled()).cloned().collect()
    }
}

/// Start an analysis job for `project` and hand its work to the queue.
///
/// The job record exists before this returns; with [`Submission::Detached`]
/// the caller gets its id while the work is still running.
pub async fn run_analysis(
    registry: &AnalysisRegistry,
    tracker: &JobTracker,
    queue: &TaskQueue,
    project: &Project,
    db_value: &str,
    inputs: Map<String, Value>,
    mode: Submission,
) -> Result<Dispatched> {
    let analysis = registry
        .get(db_value)
        .ok_or_else(|| Error::NotFound(format!("analysis type '{}'", db_value)))?;
    if !analysis.is_enabled() {
        return Err(Error::Config(format!("analysis type '{}' is not enabled", db_value)));
    }

    let handle = tracker
        .start(NewJob {
            name: analysis.name().to_string(),
            job_type: analysis.db_value().to_string(),
            project_id: Some(project.id.clone()),
            inputs,
        })
        .await?;
    info!(job = %handle.id(), analysis = db_value, project = %project.name, "Running analysis");

    queue
        .dispatch(mode, handle, move |job| async move { analysis.execute(job).await })
        .await
}
