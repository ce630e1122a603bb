//! Ingest command: walk a manifest and materialize its items
//!
//! Datasets are processed first, then projects (which reference datasets by
//! name), then charts. A failing item is reported and the run moves on; only
//! fatal errors (no administrative owner, database failures) stop it.

use crate::app::App;
use crate::catalog::{
    Chart, ClearStats, Dataset, FileOwner, JobRecord, NewChart, NewDataset, NewProject,
};
use crate::convert::chart::convert_csv_chart;
use crate::error::{Error, Result};
use crate::extension::run_plugin;
use crate::jobs::{Dispatched, NewJob, Submission};
use crate::manifest::{
    decide, parse_manifest, ChartConversionOptions, ChartItem, DatasetItem, FileIntent,
    FileReference, IdempotencyDecision, ItemAction, ItemKind, ParsedManifest, PolicyInput, ProjectItem,
    RejectedItem,
};
use crate::materialize::materialize;
use crossterm::style::Stylize;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Job type of the default dataset conversion
pub const DATASET_CONVERSION_JOB: &str = "convert_dataset";
/// Job type of chart data conversion
pub const CHART_CONVERSION_JOB: &str = "convert_chart";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Operator flags for one ingest run
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Recreate items that already exist
    pub replace: bool,
    /// Delete every project, dataset and chart first (after confirmation)
    pub clear: bool,
    /// Download remote files again even when cached
    pub skip_cache: bool,
    /// Owner override; falls back to `owner` in the config
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Created,
    Replaced,
    Skipped,
    Failed,
}

/// What happened to one manifest item
#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub kind: ItemKind,
    pub name: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_mb: Option<f64>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ItemOutcome {
    fn new(kind: ItemKind, name: &str, status: ItemStatus) -> Self {
        Self {
            kind,
            name: name.to_string(),
            status,
            id: None,
            job_id: None,
            size_mb: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn failed(kind: ItemKind, name: &str, error: &Error) -> Self {
        let mut outcome = Self::new(kind, name, ItemStatus::Failed);
        outcome.errors.push(error.to_string());
        outcome
    }

    pub fn is_ok(&self) -> bool {
        self.status != ItemStatus::Failed && self.errors.is_empty()
    }
}

/// Summary of a completed ingest run
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub manifest: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleared: Option<ClearStats>,
    pub rejected: Vec<RejectedItem>,
    pub items: Vec<ItemOutcome>,
}

impl IngestReport {
    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }

    pub fn error_count(&self) -> usize {
        self.items.iter().filter(|i| !i.is_ok()).count()
    }
}

/// How an ingest invocation ended
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IngestRun {
    /// The manifest path does not exist; nothing was done
    MissingManifest { path: PathBuf },
    /// `--clear` was declined; nothing was done
    Declined,
    Completed(IngestReport),
}

/// Ingest a manifest.
///
/// `manifest` is resolved under the configured data directory. The manifest
/// is read and parsed before the `--clear` step, so a malformed manifest fails
/// without deleting anything. `confirm` is asked before `--clear` deletes
/// records.
pub async fn cmd_ingest<C>(
    app: &App,
    manifest: &Path,
    options: &IngestOptions,
    confirm: C,
) -> Result<IngestRun>
where
    C: FnOnce(&str) -> Result<bool>,
{
    let manifest_path = app.config.data_dir.join(manifest);
    if !manifest_path.is_file() {
        warn!(path = %manifest_path.display(), "Manifest not found");
        return Ok(IngestRun::MissingManifest {
            path: manifest_path,
        });
    }

    let parsed = parse_manifest(&manifest_path)?;

    let mut report = IngestReport {
        manifest: manifest_path.clone(),
        rejected: parsed.rejected.clone(),
        ..Default::default()
    };

    if options.clear {
        if !confirm("Delete ALL existing projects, datasets and charts before ingesting?")? {
            info!("Clear declined, aborting ingest");
            return Ok(IngestRun::Declined);
        }
        report.cleared = Some(app.catalog.clear_all().await?);
    }

    let ingest = Ingest {
        app,
        manifest: &parsed,
        options,
        owner: options.owner.clone().or_else(|| app.config.owner.clone()),
    };

    if !parsed.datasets.is_empty() {
        ingest.owner()?;
    }

    info!(
        manifest = %manifest_path.display(),
        datasets = parsed.datasets.len(),
        projects = parsed.projects.len(),
        charts = parsed.charts.len(),
        "Ingesting manifest"
    );

    for item in &parsed.datasets {
        let outcome = settle(ItemKind::Dataset, &item.name, ingest.dataset(item).await)?;
        report.items.push(outcome);
    }
    for item in &parsed.projects {
        let outcome = settle(ItemKind::Project, &item.name, ingest.project(item).await)?;
        report.items.push(outcome);
    }
    for item in &parsed.charts {
        let outcome = settle(ItemKind::Chart, &item.name, ingest.chart(item).await)?;
        report.items.push(outcome);
    }

    Ok(IngestRun::Completed(report))
}

/// Fold an item result into an outcome; fatal errors end the run
fn settle(kind: ItemKind, name: &str, result: Result<ItemOutcome>) -> Result<ItemOutcome> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(kind = %kind, item = name, error = %e, "Item failed");
            Ok(ItemOutcome::failed(kind, name, &e))
        }
    }
}

struct Ingest<'a> {
    app: &'a App,
    manifest: &'a ParsedManifest,
    options: &'a IngestOptions,
    owner: Option<String>,
}

impl Ingest<'_> {
    fn owner(&self) -> Result<&str> {
        self.owner.as_deref().ok_or(Error::MissingAdministrator)
    }

    fn decide(&self, kind: ItemKind, existing: bool, action: ItemAction) -> IdempotencyDecision {
        decide(PolicyInput {
            kind,
            existing,
            replace: self.options.replace,
            action,
            skip_cache: self.options.skip_cache,
        })
    }

    async fn dataset(&self, item: &DatasetItem) -> Result<ItemOutcome> {
        let catalog = &self.app.catalog;
        let existing = catalog.get_dataset_by_name(&item.name).await?;
        let decision = self.decide(ItemKind::Dataset, existing.is_some(), item.action());
        debug!(dataset = %item.name, ?decision, "Dataset decision");

        let mut status = ItemStatus::Created;
        if let Some(old) = existing {
            if decision == IdempotencyDecision::ReuseExisting {
                info!(dataset = %item.name, "Dataset already exists, skipping");
                let outcome = ItemOutcome::new(ItemKind::Dataset, &item.name, ItemStatus::Skipped);
                return self.finish_dataset(old, item, outcome).await;
            }
            info!(dataset = %item.name, "Replacing dataset");
            catalog.delete_dataset(&old.id).await?;
            status = ItemStatus::Replaced;
        }

        let (dataset, created) = catalog
            .create_dataset(&NewDataset {
                name: item.name.clone(),
                description: item.description.clone(),
                category: item.category.clone(),
                metadata: dataset_metadata(item),
            })
            .await?;
        if !created {
            let outcome = ItemOutcome::new(ItemKind::Dataset, &item.name, ItemStatus::Skipped);
            return self.finish_dataset(dataset, item, outcome).await;
        }
        info!(dataset = %dataset.name, id = %dataset.id, "Dataset created");

        let mut outcome = ItemOutcome::new(ItemKind::Dataset, &item.name, status);
        let intent = FileIntent::for_item(self.options.replace, self.options.skip_cache, item.action());
        let owner = FileOwner::Dataset(dataset.id.clone());
        outcome.errors = self.materialize_files(&owner, &item.files, intent).await?;

        match &item.conversion_script {
            Some(script) => {
                let script_path = self.manifest.resolve(script);
                let converted = match self.app.plugins.load(&script_path) {
                    Ok(plugin) => {
                        info!(dataset = %dataset.name, script = %script, "Running conversion script");
                        run_plugin(plugin.as_ref(), &self.app.converter, dataset.clone(), item).await
                    }
                    Err(e) => Err(e),
                };
                match converted {
                    Ok(report) => outcome.errors.extend(report.errors),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(dataset = %dataset.name, error = %e, "Conversion script failed");
                        outcome.errors.push(e.to_string());
                    }
                }
            }
            None => {
                let record = self.convert_dataset_job(&dataset).await?;
                if let Some(error) = &record.error {
                    outcome.errors.push(format!("conversion: {}", error));
                }
                outcome.job_id = Some(record.id);
            }
        }

        self.finish_dataset(dataset, item, outcome).await
    }

    /// Tags, ownership and size apply whether the dataset was created or reused
    async fn finish_dataset(
        &self,
        dataset: Dataset,
        item: &DatasetItem,
        mut outcome: ItemOutcome,
    ) -> Result<ItemOutcome> {
        let catalog = &self.app.catalog;
        catalog.set_dataset_tags(&dataset.id, &item.tags).await?;
        catalog.set_dataset_owner(&dataset.id, self.owner()?).await?;

        let size = catalog.dataset_size(&dataset.id).await?;
        let size_mb = (size as f64 / BYTES_PER_MB * 100.0).round() / 100.0;
        info!(dataset = %dataset.name, size_mb, "Dataset ready");

        outcome.id = Some(dataset.id);
        outcome.size_mb = Some(size_mb);
        Ok(outcome)
    }

    async fn convert_dataset_job(&self, dataset: &Dataset) -> Result<JobRecord> {
        let mut inputs = Map::new();
        inputs.insert("dataset_id".to_string(), json!(dataset.id));
        let handle = self
            .app
            .tracker
            .start(NewJob {
                name: format!("Convert {}", dataset.name),
                job_type: DATASET_CONVERSION_JOB.to_string(),
                project_id: None,
                inputs,
            })
            .await?;

        let converter = self.app.converter.clone();
        let dataset_id = dataset.id.clone();
        let dispatched = self
            .app
            .queue
            .dispatch(Submission::Wait, handle, move |job| async move {
                job.write_status("Converting dataset files").await?;
                let report = converter.convert_dataset(&dataset_id).await?;
                job.write_output("vector_data", json!(report.vector_ids)).await?;
                job.write_output("raster_data", json!(report.raster_ids)).await?;
                if !report.unrecognized.is_empty() {
                    job.write_output("unrecognized", json!(report.unrecognized))
                        .await?;
                }
                if !report.is_success() {
                    job.write_error(&report.errors.join("\n")).await?;
                }
                Ok(())
            })
            .await?;
        self.finished(dispatched).await
    }

    async fn finished(&self, dispatched: Dispatched) -> Result<JobRecord> {
        match dispatched {
            Dispatched::Finished(record) => Ok(record),
            Dispatched::Queued { job_id } => self
                .app
                .tracker
                .get(&job_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("job {}", job_id))),
        }
    }

    /// Fetch and persist each reference in declared order. Per-file failures
    /// are returned as messages.
    async fn materialize_files(
        &self,
        owner: &FileOwner,
        files: &[FileReference],
        intent: FileIntent,
    ) -> Result<Vec<String>> {
        let mut errors = Vec::new();
        for (index, reference) in files.iter().enumerate() {
            let result = match self.app.store.fetch(reference, intent.skip_cache).await {
                Ok(local) => {
                    materialize(
                        &self.app.catalog,
                        reference,
                        &local,
                        index,
                        owner,
                        intent.replace,
                    )
                    .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(materialized) => {
                    debug!(file = %materialized.item().name, created = materialized.was_created(), "File materialized");
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(file = %reference.path, error = %e, "File not ingested");
                    errors.push(format!("{}: {}", reference.display_name(), e));
                }
            }
        }
        Ok(errors)
    }

    async fn project(&self, item: &ProjectItem) -> Result<ItemOutcome> {
        let catalog = &self.app.catalog;
        let existing = catalog.get_project_by_name(&item.name).await?;
        let decision = self.decide(ItemKind::Project, existing.is_some(), item.action());

        let mut status = ItemStatus::Created;
        let reused = match existing {
            Some(old) if decision == IdempotencyDecision::ReuseExisting => {
                info!(project = %item.name, "Project already exists, skipping");
                Some(old)
            }
            Some(old) => {
                info!(project = %item.name, "Replacing project");
                catalog.delete_project(&old.id).await?;
                status = ItemStatus::Replaced;
                None
            }
            None => None,
        };

        let project = match reused {
            Some(project) => {
                status = ItemStatus::Skipped;
                project
            }
            None => {
                let (project, created) = catalog
                    .create_project(&NewProject {
                        name: item.name.clone(),
                        default_map_center: item.default_map_center,
                        default_map_zoom: item.default_map_zoom,
                    })
                    .await?;
                if created {
                    catalog.set_project_owner(&project.id, self.owner()?).await?;
                    info!(project = %project.name, id = %project.id, "Project created");
                } else {
                    status = ItemStatus::Skipped;
                }
                project
            }
        };

        let mut outcome = ItemOutcome::new(ItemKind::Project, &item.name, status);
        let mut dataset_ids = Vec::with_capacity(item.datasets.len());
        for name in &item.datasets {
            match catalog.get_dataset_by_name(name).await? {
                Some(dataset) => dataset_ids.push(dataset.id),
                None => {
                    warn!(project = %project.name, dataset = %name, "Dataset not found");
                    outcome.warnings.push(format!("dataset '{}' not found", name));
                }
            }
        }
        catalog.set_project_datasets(&project.id, &dataset_ids).await?;
        debug!(project = %project.name, datasets = dataset_ids.len(), "Project datasets set");

        outcome.id = Some(project.id);
        Ok(outcome)
    }

    async fn chart(&self, item: &ChartItem) -> Result<ItemOutcome> {
        let catalog = &self.app.catalog;
        let existing = catalog.get_chart_by_name(&item.name).await?;
        let decision = self.decide(ItemKind::Chart, existing.is_some(), item.action());

        let mut status = ItemStatus::Created;
        if let Some(old) = existing {
            if decision == IdempotencyDecision::ReuseExisting {
                info!(chart = %item.name, "Chart already exists, skipping");
                let mut outcome = ItemOutcome::new(ItemKind::Chart, &item.name, ItemStatus::Skipped);
                outcome.id = Some(old.id);
                return Ok(outcome);
            }
            info!(chart = %item.name, "Replacing chart");
            catalog.delete_chart(&old.id).await?;
            status = ItemStatus::Replaced;
        }

        let mut outcome = ItemOutcome::new(ItemKind::Chart, &item.name, status);
        let project_id = match &item.project {
            Some(name) => match catalog.get_project_by_name(name).await? {
                Some(project) => Some(project.id),
                None => {
                    warn!(chart = %item.name, project = %name, "Project not found");
                    outcome.warnings.push(format!("project '{}' not found", name));
                    None
                }
            },
            None => None,
        };

        let (chart, created) = catalog
            .create_chart(&NewChart {
                name: item.name.clone(),
                description: item.description.clone(),
                project_id,
                metadata: item.metadata.clone(),
                chart_options: item.chart_options.clone(),
                editable: item.editable,
            })
            .await?;
        outcome.id = Some(chart.id.clone());
        if !created {
            outcome.status = ItemStatus::Skipped;
            return Ok(outcome);
        }
        info!(chart = %chart.name, id = %chart.id, "Chart created");

        let intent = FileIntent::for_item(self.options.replace, self.options.skip_cache, item.action());
        let owner = FileOwner::Chart(chart.id.clone());
        outcome.errors = self.materialize_files(&owner, &item.files, intent).await?;

        if let Some(options) = &item.conversion_options {
            let record = self.convert_chart_job(&chart, options).await?;
            if let Some(error) = &record.error {
                outcome.errors.push(format!("conversion: {}", error));
            }
            outcome.job_id = Some(record.id);
        }
        Ok(outcome)
    }

    async fn convert_chart_job(
        &self,
        chart: &Chart,
        options: &ChartConversionOptions,
    ) -> Result<JobRecord> {
        let mut inputs = Map::new();
        inputs.insert("chart_id".to_string(), json!(chart.id));
        inputs.insert("conversion_options".to_string(), serde_json::to_value(options)?);
        let handle = self
            .app
            .tracker
            .start(NewJob {
                name: format!("Convert {}", chart.name),
                job_type: CHART_CONVERSION_JOB.to_string(),
                project_id: chart.project_id.clone(),
                inputs,
            })
            .await?;

        let chart_id = chart.id.clone();
        let options = options.clone();
        let dispatched = self
            .app
            .queue
            .dispatch(Submission::Wait, handle, move |job| async move {
                job.write_status("Converting chart data").await?;
                let catalog = job.catalog().clone();
                let files = catalog
                    .list_file_items(&FileOwner::Chart(chart_id.clone()))
                    .await?;
                let Some(file) = files.first() else {
                    return Err(Error::Job("chart has no files to convert".to_string()));
                };
                if file.file_type != "csv" {
                    return Err(Error::conversion(
                        &file.name,
                        format!("unsupported chart file type '{}'", file.file_type),
                    ));
                }

                let path = catalog.file_item_path(file)?;
                let chart_data = tokio::task::spawn_blocking(move || convert_csv_chart(&path, &options))
                    .await
                    .map_err(|e| Error::Other(format!("chart conversion task failed: {}", e)))??;
                catalog.set_chart_data(&chart_id, &chart_data).await?;
                job.write_output("chart", Value::String(chart_id)).await?;
                Ok(())
            })
            .await?;
        self.finished(dispatched).await
    }
}

fn dataset_metadata(item: &DatasetItem) -> Map<String, Value> {
    let mut metadata = item.metadata.clone();
    let options = [
        ("layers", &item.layers),
        ("network_options", &item.network_options),
        ("region_options", &item.region_options),
    ];
    for (key, value) in options {
        if let Some(value) = value {
            metadata.insert(key.to_string(), value.clone());
        }
    }
    metadata
}

/// Print an ingest run to the console
pub fn print_ingest_run(run: &IngestRun) {
    match run {
        IngestRun::MissingManifest { path } => {
            println!("Manifest not found at {}. Nothing to ingest.", path.display());
        }
        IngestRun::Declined => {
            println!("Clear declined. Nothing was ingested.");
        }
        IngestRun::Completed(report) => print_ingest_report(report),
    }
}

fn print_ingest_report(report: &IngestReport) {
    println!("\n📦 Ingesting {}\n", report.manifest.display());

    if let Some(cleared) = &report.cleared {
        println!(
            "Cleared {} projects, {} datasets, {} charts",
            cleared.projects, cleared.datasets, cleared.charts
        );
    }
    for rejected in &report.rejected {
        println!(
            "{} item {}: invalid type {}",
            "⚠".yellow(),
            rejected.index,
            rejected.type_name.as_deref().unwrap_or("<missing>")
        );
    }

    for item in &report.items {
        let label = format!("{} '{}'", item.kind, item.name);
        let line = match item.status {
            ItemStatus::Failed => format!("{} {}: failed", "✗".red(), label),
            _ if !item.errors.is_empty() => {
                format!("{} {}: {} with errors", "✗".red(), label, status_word(item.status))
            }
            ItemStatus::Skipped => format!("{} {}: already exists, skipped", "•".yellow(), label),
            status => format!("{} {}: {}", "✓".green(), label, status_word(status)),
        };
        match item.size_mb {
            Some(size) => println!("{} ({:.2} MB)", line, size),
            None => println!("{}", line),
        }
        for error in &item.errors {
            println!("    {}", error.as_str().red());
        }
        for warning in &item.warnings {
            println!("    {}", warning.as_str().yellow());
        }
    }

    println!("\nSummary:");
    println!("  Created: {}", report.count(ItemStatus::Created));
    println!("  Replaced: {}", report.count(ItemStatus::Replaced));
    println!("  Skipped: {}", report.count(ItemStatus::Skipped));
    println!("  With errors: {}", report.error_count());
}

fn status_word(status: ItemStatus) -> &'static str {
    match status {
        ItemStatus::Created => "created",
        ItemStatus::Replaced => "replaced",
        ItemStatus::Skipped => "skipped",
        ItemStatus::Failed => "failed",
    }
}
