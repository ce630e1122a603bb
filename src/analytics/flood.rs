//! Flood simulation analysis

use super::AnalysisType;
use crate::catalog::{FileOwner, NewDataset};
use crate::convert::Converter;
use crate::error::{Error, Result};
use crate::jobs::JobContext;
use crate::manifest::FileReference;
use crate::materialize::materialize;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

const REQUIRED_INPUTS: [&str; 7] = [
    "initial_conditions_id",
    "time_period",
    "hydrograph",
    "potential_evapotranspiration_percentile",
    "soil_moisture_percentile",
    "ground_water_percentile",
    "annual_probability",
];
const OUTPUT_FILE: &str = "flood_simulation.tif";
const DATASET_TAGS: [&str; 3] = ["analytics", "flood", "simulation"];

/// Inputs handed to the flood model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FloodParameters {
    pub initial_conditions_id: String,
    pub time_period: String,
    pub annual_probability: f64,
    pub hydrograph: Vec<f64>,
    pub pet_percentile: f64,
    pub sm_percentile: f64,
    pub gw_percentile: f64,
}

/// Opaque simulation producing a flood depth raster
#[async_trait]
pub trait FloodModel: Send + Sync {
    async fn run(&self, parameters: &FloodParameters, output: &Path) -> Result<()>;
}

/// Runs an external executable: `<argv...> --params <json> --output <tif>`
#[derive(Debug, Clone)]
pub struct CommandFloodModel {
    argv: Vec<String>,
}

impl CommandFloodModel {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl FloodModel for CommandFloodModel {
    async fn run(&self, parameters: &FloodParameters, output: &Path) -> Result<()> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| Error::Config("flood_model_command is empty".to_string()))?;
        let params_path = output.with_extension("params.json");
        tokio::fs::write(&params_path, serde_json::to_vec(parameters)?).await?;

        debug!(program = %program, "Running flood model");
        let result = Command::new(program)
            .args(args)
            .arg("--params")
            .arg(&params_path)
            .arg("--output")
            .arg(output)
            .output()
            .await?;
        if !result.status.success() {
            return Err(Error::Job(format!(
                "flood model failed: {}",
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Simulates a 24-hour flood and stores the result as a new dataset
pub struct FloodSimulation {
    converter: Converter,
    model: Option<Arc<dyn FloodModel>>,
}

impl FloodSimulation {
    pub fn new(converter: Converter, model: Option<Arc<dyn FloodModel>>) -> Self {
        Self { converter, model }
    }
}

/// Inputs arrive as JSON from the API or as strings from the CLI
fn number_input(inputs: &Map<String, Value>, key: &str) -> Result<f64> {
    match inputs.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| Error::Job(format!("{} is not a number", key)))
}

fn text_input(inputs: &Map<String, Value>, key: &str) -> String {
    match inputs.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl AnalysisType for FloodSimulation {
    fn name(&self) -> &str {
        "Flood Simulation"
    }

    fn db_value(&self) -> &str {
        "flood_simulation"
    }

    fn description(&self) -> &str {
        "Select parameters to simulate a 24-hour flood of the Charles River"
    }

    fn attribution(&self) -> &str {
        "Northeastern University"
    }

    fn input_types(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("initial_conditions_id", "string"),
            ("time_period", "string"),
            ("hydrograph", "Chart"),
            ("potential_evapotranspiration_percentile", "number"),
            ("soil_moisture_percentile", "number"),
            ("ground_water_percentile", "number"),
            ("annual_probability", "number"),
        ]
    }

    fn output_types(&self) -> Vec<(&'static str, &'static str)> {
        vec![("flood", "Dataset")]
    }

    fn is_enabled(&self) -> bool {
        self.model.is_some()
    }

    async fn execute(&self, job: JobContext) -> Result<()> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| Error::Config("flood model is not configured".to_string()))?;
        let record = job.record().await?;
        let inputs = record.inputs();

        for key in REQUIRED_INPUTS {
            if inputs.get(key).map_or(true, Value::is_null) {
                job.write_error(&format!("{} not provided", key)).await?;
                return Ok(());
            }
        }

        job.write_status("Interpreting input values").await?;
        let catalog = self.converter.catalog();
        let hydrograph_ref = text_input(&inputs, "hydrograph");
        let chart = match catalog.get_chart(&hydrograph_ref).await? {
            Some(chart) => chart,
            None => catalog
                .get_chart_by_name(&hydrograph_ref)
                .await?
                .ok_or_else(|| Error::NotFound(format!("chart {}", hydrograph_ref)))?,
        };
        let hydrograph: Vec<f64> = chart
            .chart_data()
            .as_ref()
            .and_then(|data| data.pointer("/datasets/0/data"))
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Job(format!("chart '{}' has no data series", chart.name)))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(-1.0))
            .collect();

        let parameters = FloodParameters {
            initial_conditions_id: text_input(&inputs, "initial_conditions_id"),
            time_period: text_input(&inputs, "time_period"),
            annual_probability: number_input(&inputs, "annual_probability")?,
            hydrograph,
            pet_percentile: number_input(&inputs, "potential_evapotranspiration_percentile")?,
            sm_percentile: number_input(&inputs, "soil_moisture_percentile")?,
            gw_percentile: number_input(&inputs, "ground_water_percentile")?,
        };

        let mut name = format!(
            "{} {} Flood Simulation with {}, initial condition set {}, and percentiles {}, {}, {}",
            parameters.time_period,
            text_input(&inputs, "annual_probability"),
            chart.name,
            parameters.initial_conditions_id,
            text_input(&inputs, "potential_evapotranspiration_percentile"),
            text_input(&inputs, "soil_moisture_percentile"),
            text_input(&inputs, "ground_water_percentile"),
        );
        job.rename(&name).await?;
        job.write_status("Running flood simulation module with specified inputs")
            .await?;

        let scratch = tempfile::tempdir()?;
        let output = scratch.path().join(OUTPUT_FILE);
        model.run(&parameters, &output).await?;

        job.write_status("Saving result to database").await?;
        let metadata = json!({
            "attribution": "Simulation code by August Posch at Northeastern University",
            "simulation_steps": [
                "downscaling_prediction",
                "hydrological_prediction",
                "hydrodynamic_prediction"
            ],
            "inputs": serde_json::to_value(&parameters)?,
            "uploaded": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        });
        let metadata = metadata.as_object().cloned().unwrap_or_default();

        let matches = catalog.count_datasets_named_like(&name).await?;
        if matches > 0 {
            name = format!("{} ({})", name, matches + 1);
        }
        let (dataset, _) = catalog
            .create_dataset(&NewDataset {
                name,
                description: "Generated by Flood Simulation Analytics Task".to_string(),
                category: Some("flood".to_string()),
                metadata: metadata.clone(),
            })
            .await?;
        let tags: Vec<String> = DATASET_TAGS.iter().map(|t| t.to_string()).collect();
        catalog.set_dataset_tags(&dataset.id, &tags).await?;

        let reference = FileReference {
            name: Some(OUTPUT_FILE.to_string()),
            path: OUTPUT_FILE.to_string(),
            url: None,
            hash: None,
            metadata,
        };
        materialize(
            catalog,
            &reference,
            &output,
            0,
            &FileOwner::Dataset(dataset.id.clone()),
            false,
        )
        .await?;

        let report = self.converter.convert_dataset(&dataset.id).await?;
        if !report.is_success() {
            return Err(Error::Job(report.errors.join("; ")));
        }

        if let Some(project_id) = &record.project_id {
            let mut members: Vec<String> = catalog
                .project_datasets(project_id)
                .await?
                .into_iter()
                .map(|d| d.id)
                .collect();
            members.push(dataset.id.clone());
            catalog.set_project_datasets(project_id, &members).await?;
        }

        job.write_output("flood", Value::String(dataset.id.clone()))
            .await?;
        info!(dataset = %dataset.name, "Flood simulation stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{run_analysis, AnalysisRegistry};
    use crate::catalog::{Catalog, NewChart, NewProject, Project};
    use crate::convert::crs::{WebMercatorReprojector, WGS84};
    use crate::convert::testing::CopyRasterBackend;
    use crate::jobs::{Dispatched, JobState, JobTracker, Submission, TaskQueue};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingModel {
        seen: Mutex<Vec<FloodParameters>>,
    }

    #[async_trait]
    impl FloodModel for RecordingModel {
        async fn run(&self, parameters: &FloodParameters, output: &Path) -> Result<()> {
            self.seen.lock().unwrap().push(parameters.clone());
            tokio::fs::write(output, b"depths").await?;
            Ok(())
        }
    }

    struct Setup {
        _tmp: TempDir,
        catalog: Catalog,
        project: Project,
        tracker: JobTracker,
        queue: TaskQueue,
        registry: AnalysisRegistry,
        model: Arc<RecordingModel>,
    }

    async fn setup() -> Setup {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(&tmp.path().join("db.sqlite"), &tmp.path().join("storage"))
            .await
            .unwrap();
        let (project, _) = catalog
            .create_project(&NewProject {
                name: "Boston Transportation".to_string(),
                default_map_center: [42.4, -71.1],
                default_map_zoom: 11.0,
            })
            .await
            .unwrap();
        let (chart, _) = catalog
            .create_chart(&NewChart {
                name: "Charles River Hydrograph".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        catalog
            .set_chart_data(
                &chart.id,
                &json!({"labels": [1, 2, 3], "datasets": [{"label": "flow", "data": [0.5, 1.5, -1]}]}),
            )
            .await
            .unwrap();

        let converter = Converter::new(
            catalog.clone(),
            Arc::new(CopyRasterBackend::default()),
            Arc::new(WebMercatorReprojector),
            WGS84,
        );
        let model = Arc::new(RecordingModel::default());
        let mut registry = AnalysisRegistry::new();
        registry.register(Arc::new(FloodSimulation::new(
            converter,
            Some(model.clone() as Arc<dyn FloodModel>),
        )));
        Setup {
            tracker: JobTracker::new(catalog.clone()),
            queue: TaskQueue::new(),
            _tmp: tmp,
            catalog,
            project,
            registry,
            model,
        }
    }

    fn full_inputs() -> Map<String, Value> {
        json!({
            "initial_conditions_id": "001",
            "time_period": "2031-2050",
            "hydrograph": "Charles River Hydrograph",
            "potential_evapotranspiration_percentile": "25",
            "soil_moisture_percentile": 50,
            "ground_water_percentile": 75,
            "annual_probability": 0.04
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    async fn run(s: &Setup, inputs: Map<String, Value>) -> crate::catalog::JobRecord {
        match run_analysis(
            &s.registry,
            &s.tracker,
            &s.queue,
            &s.project,
            "flood_simulation",
            inputs,
            Submission::Wait,
        )
        .await
        .unwrap()
        {
            Dispatched::Finished(record) => record,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_input_is_reported_and_completed() {
        let s = setup().await;
        let mut inputs = full_inputs();
        inputs.remove("hydrograph");
        let record = run(&s, inputs).await;
        assert_eq!(
            JobState::of(&record),
            JobState::CompletedWithError("hydrograph not provided".to_string())
        );
        assert!(s.model.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flood_dataset_created_and_attached() {
        let s = setup().await;
        let record = run(&s, full_inputs()).await;
        assert_eq!(JobState::of(&record), JobState::Completed, "{:?}", record.error);
        assert_eq!(
            record.name,
            "2031-2050 0.04 Flood Simulation with Charles River Hydrograph, \
             initial condition set 001, and percentiles 25, 50, 75"
        );

        let dataset_id = record.outputs()["flood"].as_str().unwrap().to_string();
        let dataset = s.catalog.get_dataset(&dataset_id).await.unwrap().unwrap();
        assert_eq!(dataset.category.as_deref(), Some("flood"));
        assert_eq!(
            s.catalog.dataset_tags(&dataset.id).await.unwrap(),
            vec!["analytics", "flood", "simulation"]
        );
        assert_eq!(s.catalog.list_raster_data(&dataset.id).await.unwrap().len(), 1);
        let members = s.catalog.project_datasets(&s.project.id).await.unwrap();
        assert_eq!(members.len(), 1);

        let seen = s.model.seen.lock().unwrap();
        assert_eq!(seen[0].hydrograph, vec![0.5, 1.5, -1.0]);
        assert_eq!(seen[0].pet_percentile, 25.0);
    }

    #[tokio::test]
    async fn test_repeat_runs_get_distinct_names() {
        let s = setup().await;
        let first = run(&s, full_inputs()).await;
        let second = run(&s, full_inputs()).await;
        let name_of = |record: &crate::catalog::JobRecord| {
            record.outputs()["flood"].as_str().unwrap().to_string()
        };
        let a = s.catalog.get_dataset(&name_of(&first)).await.unwrap().unwrap();
        let b = s.catalog.get_dataset(&name_of(&second)).await.unwrap().unwrap();
        assert_eq!(b.name, format!("{} (2)", a.name));
        assert_eq!(s.catalog.project_datasets(&s.project.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_without_model() {
        let s = setup().await;
        let converter = Converter::new(
            s.catalog.clone(),
            Arc::new(CopyRasterBackend::default()),
            Arc::new(WebMercatorReprojector),
            WGS84,
        );
        let mut registry = AnalysisRegistry::new();
        registry.register(Arc::new(FloodSimulation::new(converter, None)));
        assert!(registry.enabled().is_empty());
        let err = run_analysis(
            &registry,
            &s.tracker,
            &s.queue,
            &s.project,
            "flood_simulation",
            full_inputs(),
            Submission::Wait,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
