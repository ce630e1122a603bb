//! Record store using SQLite
//!
//! This module persists every ingested entity:
//! - Projects, datasets and charts (unique by name)
//! - File items owned by exactly one dataset or chart
//! - Normalized vector and raster artifacts
//! - Job records for asynchronous work
//!
//! Bytes live in a [`BlobStore`] next to the database; every record deletion
//! also drops its bytes.

mod blobs;
mod schema;

pub use blobs::BlobStore;
pub use schema::*;

use crate::config::Config;
use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn parse_object(json: &str) -> Map<String, Value> {
    match serde_json::from_str(json) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// A project
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub owner: Option<String>,
    pub default_map_center_json: String,
    pub default_map_zoom: f64,
    pub created_at: String,
    pub updated_at: String,
}

impl Project {
    pub fn default_map_center(&self) -> [f64; 2] {
        serde_json::from_str(&self.default_map_center_json).unwrap_or([0.0, 0.0])
    }
}

/// A dataset
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: Option<String>,
    pub metadata_json: String,
    pub owner: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Dataset {
    pub fn metadata(&self) -> Map<String, Value> {
        parse_object(&self.metadata_json)
    }
}

/// A chart
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Chart {
    pub id: String,
    pub name: String,
    pub description: String,
    pub project_id: Option<String>,
    pub metadata_json: Option<String>,
    pub chart_data_json: Option<String>,
    pub chart_options_json: Option<String>,
    pub editable: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Chart {
    pub fn chart_data(&self) -> Option<Value> {
        self.chart_data_json
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
    }
}

/// The record a file item belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOwner {
    Dataset(String),
    Chart(String),
}

impl FileOwner {
    fn column(&self) -> &'static str {
        match self {
            FileOwner::Dataset(_) => "dataset_id",
            FileOwner::Chart(_) => "chart_id",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            FileOwner::Dataset(id) | FileOwner::Chart(id) => id,
        }
    }

    fn blob_prefix(&self) -> String {
        match self {
            FileOwner::Dataset(id) => format!("datasets/{}", id),
            FileOwner::Chart(id) => format!("charts/{}", id),
        }
    }
}

/// A persisted copy of one ingested file
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FileItem {
    pub id: String,
    pub name: String,
    pub dataset_id: Option<String>,
    pub chart_id: Option<String>,
    pub file_type: String,
    pub file_size: i64,
    pub file_index: i64,
    pub metadata_json: String,
    pub blob_path: String,
    pub created_at: String,
}

impl FileItem {
    pub fn metadata(&self) -> Map<String, Value> {
        parse_object(&self.metadata_json)
    }

    pub fn owner(&self) -> Option<FileOwner> {
        match (&self.dataset_id, &self.chart_id) {
            (Some(id), None) => Some(FileOwner::Dataset(id.clone())),
            (None, Some(id)) => Some(FileOwner::Chart(id.clone())),
            _ => None,
        }
    }
}

/// A normalized feature collection
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct VectorData {
    pub id: String,
    pub name: String,
    pub dataset_id: String,
    pub source_file_id: Option<String>,
    pub metadata_json: String,
    pub feature_count: i64,
    pub blob_path: String,
    pub created_at: String,
    pub updated_at: String,
}

impl VectorData {
    pub fn metadata(&self) -> Map<String, Value> {
        parse_object(&self.metadata_json)
    }
}

/// A canonical cloud-optimized raster
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RasterData {
    pub id: String,
    pub name: String,
    pub dataset_id: String,
    pub source_file_id: Option<String>,
    pub metadata_json: String,
    pub blob_path: String,
    pub created_at: String,
}

impl RasterData {
    pub fn metadata(&self) -> Map<String, Value> {
        parse_object(&self.metadata_json)
    }
}

/// Persisted state of one asynchronous job
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub name: String,
    pub job_type: String,
    pub project_id: Option<String>,
    pub inputs_json: String,
    pub outputs_json: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub completed: bool,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl JobRecord {
    pub fn inputs(&self) -> Map<String, Value> {
        parse_object(&self.inputs_json)
    }

    pub fn outputs(&self) -> Map<String, Value> {
        self.outputs_json
            .as_deref()
            .map(parse_object)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub default_map_center: [f64; 2],
    pub default_map_zoom: f64,
}

#[derive(Debug, Clone, Default)]
pub struct NewDataset {
    pub name: String,
    pub description: String,
    pub category: Option<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct NewChart {
    pub name: String,
    pub description: String,
    pub project_id: Option<String>,
    pub metadata: Option<Value>,
    pub chart_options: Option<Value>,
    pub editable: bool,
}

#[derive(Debug, Clone)]
pub struct NewFileItem {
    pub name: String,
    pub file_type: String,
    pub file_index: i64,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct NewVectorData {
    pub name: String,
    pub dataset_id: String,
    pub source_file_id: Option<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct NewRasterData {
    pub name: String,
    pub dataset_id: String,
    pub source_file_id: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Result of a file item write
#[derive(Debug, Clone)]
pub enum FileWrite {
    Created(FileItem),
    Existing(FileItem),
}

/// Filter for listing jobs
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub project_id: Option<String>,
    pub job_type: Option<String>,
    pub limit: Option<i64>,
}

/// Counts removed by a full clear
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClearStats {
    pub projects: u64,
    pub datasets: u64,
    pub charts: u64,
}

/// Record counts across the catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogStats {
    pub projects: i64,
    pub datasets: i64,
    pub charts: i64,
    pub file_items: i64,
    pub vector_data: i64,
    pub raster_data: i64,
    pub jobs: i64,
    pub jobs_pending: i64,
    pub stored_bytes: u64,
}

/// Catalog database handle
#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
    blobs: BlobStore,
}

impl Catalog {
    /// Open the catalog described by a configuration
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::open(&config.paths.db_file, &config.paths.storage_dir).await
    }

    /// Open (and initialize if needed) a catalog database and its blob store
    pub async fn open(db_path: &Path, storage_dir: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(storage_dir)?;

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30))
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        debug!("Connecting to SQLite database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let catalog = Self {
            pool,
            blobs: BlobStore::new(storage_dir),
        };
        if !catalog.is_initialized().await? {
            catalog.init_schema().await?;
        }
        Ok(catalog)
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing catalog schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        let result: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type='table' AND name='job_records'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(result.is_some())
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Delete every project, dataset and chart along with their bytes
    pub async fn clear_all(&self) -> Result<ClearStats> {
        let mut tx = self.pool.begin().await?;
        let charts = sqlx::query("DELETE FROM charts").execute(&mut *tx).await?;
        let projects = sqlx::query("DELETE FROM projects").execute(&mut *tx).await?;
        let datasets = sqlx::query("DELETE FROM datasets").execute(&mut *tx).await?;
        tx.commit().await?;

        self.blobs.remove_tree("datasets").await?;
        self.blobs.remove_tree("charts").await?;

        let stats = ClearStats {
            projects: projects.rows_affected(),
            datasets: datasets.rows_affected(),
            charts: charts.rows_affected(),
        };
        info!(
            projects = stats.projects,
            datasets = stats.datasets,
            charts = stats.charts,
            "Cleared catalog"
        );
        Ok(stats)
    }

    // ===== Project Operations =====

    /// Get project by name
    pub async fn get_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(project)
    }

    /// Create a project unless one with the same name exists.
    ///
    /// Returns the stored project and whether this call created it.
    pub async fn create_project(&self, new: &NewProject) -> Result<(Project, bool)> {
        let now = now();
        let result = sqlx::query(
            r#"
            INSERT INTO projects (id, name, owner, default_map_center_json, default_map_zoom, created_at, updated_at)
            VALUES (?, ?, NULL, ?, ?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&new.name)
        .bind(serde_json::to_string(&new.default_map_center)?)
        .bind(new.default_map_zoom)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let project = self
            .get_project_by_name(&new.name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("project {}", new.name)))?;
        Ok((project, result.rows_affected() == 1))
    }

    /// Delete a project; its charts cascade
    pub async fn delete_project(&self, id: &str) -> Result<()> {
        let chart_ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM charts WHERE project_id = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        for (chart_id,) in chart_ids {
            self.blobs.remove_tree(&format!("charts/{}", chart_id)).await?;
        }
        Ok(())
    }

    pub async fn set_project_owner(&self, id: &str, owner: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET owner = ?, updated_at = ? WHERE id = ?")
            .bind(owner)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace a project's dataset membership with exactly `dataset_ids`
    pub async fn set_project_datasets(&self, project_id: &str, dataset_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM project_datasets WHERE project_id = ?")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        for dataset_id in dataset_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO project_datasets (project_id, dataset_id) VALUES (?, ?)",
            )
            .bind(project_id)
            .bind(dataset_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Datasets attached to a project
    pub async fn project_datasets(&self, project_id: &str) -> Result<Vec<Dataset>> {
        let datasets = sqlx::query_as::<_, Dataset>(
            r#"
            SELECT d.* FROM datasets d
            JOIN project_datasets pd ON pd.dataset_id = d.id
            WHERE pd.project_id = ?
            ORDER BY d.name
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(datasets)
    }

    // ===== Dataset Operations =====

    /// Get dataset by name
    pub async fn get_dataset_by_name(&self, name: &str) -> Result<Option<Dataset>> {
        let dataset = sqlx::query_as::<_, Dataset>("SELECT * FROM datasets WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(dataset)
    }

    /// Get dataset by ID
    pub async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        let dataset = sqlx::query_as::<_, Dataset>("SELECT * FROM datasets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(dataset)
    }

    pub async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        let datasets = sqlx::query_as::<_, Dataset>("SELECT * FROM datasets ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(datasets)
    }

    /// Create a dataset unless one with the same name exists
    pub async fn create_dataset(&self, new: &NewDataset) -> Result<(Dataset, bool)> {
        let now = now();
        let result = sqlx::query(
            r#"
            INSERT INTO datasets (id, name, description, category, metadata_json, owner, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, NULL, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.category)
        .bind(serde_json::to_string(&new.metadata)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let dataset = self
            .get_dataset_by_name(&new.name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("dataset {}", new.name)))?;
        Ok((dataset, result.rows_affected() == 1))
    }

    /// Delete a dataset with its files, artifacts and bytes
    pub async fn delete_dataset(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM datasets WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.blobs.remove_tree(&format!("datasets/{}", id)).await
    }

    /// Replace a dataset's tags
    pub async fn set_dataset_tags(&self, id: &str, tags: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM dataset_tags WHERE dataset_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for tag in tags {
            sqlx::query("INSERT OR IGNORE INTO dataset_tags (dataset_id, tag) VALUES (?, ?)")
                .bind(id)
                .bind(tag)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn dataset_tags(&self, id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT tag FROM dataset_tags WHERE dataset_id = ? ORDER BY tag")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(tag,)| tag).collect())
    }

    pub async fn set_dataset_owner(&self, id: &str, owner: &str) -> Result<()> {
        sqlx::query("UPDATE datasets SET owner = ?, updated_at = ? WHERE id = ?")
            .bind(owner)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Total bytes of a dataset's file items
    pub async fn dataset_size(&self, id: &str) -> Result<u64> {
        let (size,): (i64,) =
            sqlx::query_as("SELECT COALESCE(SUM(file_size), 0) FROM file_items WHERE dataset_id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(size.max(0) as u64)
    }

    /// Number of datasets whose name contains `fragment`, ignoring case
    pub async fn count_datasets_named_like(&self, fragment: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM datasets WHERE instr(lower(name), lower(?)) > 0")
                .bind(fragment)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ===== Chart Operations =====

    /// Get chart by name
    pub async fn get_chart_by_name(&self, name: &str) -> Result<Option<Chart>> {
        let chart = sqlx::query_as::<_, Chart>("SELECT * FROM charts WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(chart)
    }

    /// Get chart by ID
    pub async fn get_chart(&self, id: &str) -> Result<Option<Chart>> {
        let chart = sqlx::query_as::<_, Chart>("SELECT * FROM charts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(chart)
    }

    /// Create a chart unless one with the same name exists
    pub async fn create_chart(&self, new: &NewChart) -> Result<(Chart, bool)> {
        let now = now();
        let metadata = new.metadata.as_ref().map(serde_json::to_string).transpose()?;
        let options = new
            .chart_options
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            r#"
            INSERT INTO charts (id, name, description, project_id, metadata_json, chart_data_json,
                                chart_options_json, editable, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, NULL, ?, ?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.project_id)
        .bind(metadata)
        .bind(options)
        .bind(new.editable)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let chart = self
            .get_chart_by_name(&new.name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("chart {}", new.name)))?;
        Ok((chart, result.rows_affected() == 1))
    }

    pub async fn delete_chart(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM charts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.blobs.remove_tree(&format!("charts/{}", id)).await
    }

    pub async fn set_chart_data(&self, id: &str, chart_data: &Value) -> Result<()> {
        sqlx::query("UPDATE charts SET chart_data_json = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(chart_data)?)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ===== File Item Operations =====

    /// File items of an owner in declared order
    pub async fn list_file_items(&self, owner: &FileOwner) -> Result<Vec<FileItem>> {
        let sql = format!(
            "SELECT * FROM file_items WHERE {} = ? ORDER BY file_index, name",
            owner.column()
        );
        let items = sqlx::query_as::<_, FileItem>(&sql)
            .bind(owner.id())
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    /// Absolute path of a file item's stored bytes
    pub fn file_item_path(&self, item: &FileItem) -> Result<PathBuf> {
        self.blobs.path(&item.blob_path)
    }

    /// Persist a file item and its bytes.
    ///
    /// The lookup, optional replacement and insert run in one `BEGIN IMMEDIATE`
    /// transaction, so concurrent writers for the same (owner, name) serialize
    /// and at most one item is ever created.
    pub async fn write_file_item(
        &self,
        owner: &FileOwner,
        new: &NewFileItem,
        source: &Path,
        replace: bool,
    ) -> Result<FileWrite> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match self
            .write_file_item_locked(&mut conn, owner, new, source, replace)
            .await
        {
            Ok((write, replaced_blob)) => {
                if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    if let FileWrite::Created(item) = &write {
                        self.blobs.remove(&item.blob_path).await?;
                    }
                    return Err(e.into());
                }
                if let Some(stale) = replaced_blob {
                    self.blobs.remove(&stale).await?;
                }
                Ok(write)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn write_file_item_locked(
        &self,
        conn: &mut SqliteConnection,
        owner: &FileOwner,
        new: &NewFileItem,
        source: &Path,
        replace: bool,
    ) -> Result<(FileWrite, Option<String>)> {
        let select = format!(
            "SELECT * FROM file_items WHERE {} = ? AND name = ?",
            owner.column()
        );
        let existing = sqlx::query_as::<_, FileItem>(&select)
            .bind(owner.id())
            .bind(&new.name)
            .fetch_optional(&mut *conn)
            .await?;

        let mut replaced_blob = None;
        if let Some(existing) = existing {
            if !replace {
                return Ok((FileWrite::Existing(existing), None));
            }
            sqlx::query("DELETE FROM file_items WHERE id = ?")
                .bind(&existing.id)
                .execute(&mut *conn)
                .await?;
            replaced_blob = Some(existing.blob_path);
        }

        let id = Uuid::new_v4().to_string();
        let blob_path = format!("{}/files/{}/{}", owner.blob_prefix(), id, new.name);
        let file_size = tokio::fs::metadata(source).await?.len();

        let (dataset_id, chart_id) = match owner {
            FileOwner::Dataset(id) => (Some(id.as_str()), None),
            FileOwner::Chart(id) => (None, Some(id.as_str())),
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO file_items (id, name, dataset_id, chart_id, file_type, file_size,
                                    file_index, metadata_json, blob_path, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(&new.name)
        .bind(dataset_id)
        .bind(chart_id)
        .bind(&new.file_type)
        .bind(file_size as i64)
        .bind(new.file_index)
        .bind(serde_json::to_string(&new.metadata)?)
        .bind(&blob_path)
        .bind(now())
        .execute(&mut *conn)
        .await?;

        if inserted.rows_affected() == 0 {
            warn!(name = %new.name, "File item appeared during write; keeping existing");
            let existing = sqlx::query_as::<_, FileItem>(&select)
                .bind(owner.id())
                .bind(&new.name)
                .fetch_one(&mut *conn)
                .await?;
            return Ok((FileWrite::Existing(existing), replaced_blob));
        }

        if let Err(e) = self.blobs.copy_in(&blob_path, source).await {
            self.blobs.remove(&blob_path).await?;
            return Err(e);
        }

        let item = sqlx::query_as::<_, FileItem>("SELECT * FROM file_items WHERE id = ?")
            .bind(&id)
            .fetch_one(&mut *conn)
            .await?;
        Ok((FileWrite::Created(item), replaced_blob))
    }

    // ===== Vector Operations =====

    /// Store a normalized feature collection
    pub async fn insert_vector_data(&self, new: &NewVectorData, geojson: &Value) -> Result<VectorData> {
        let id = Uuid::new_v4().to_string();
        let blob_path = format!("datasets/{}/vector/{}.geojson", new.dataset_id, id);
        let features = features_of(geojson);
        self.blobs
            .write(&blob_path, &serde_json::to_vec(geojson)?)
            .await?;

        let now = now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO vector_data (id, name, dataset_id, source_file_id, metadata_json,
                                     feature_count, blob_path, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.name)
        .bind(&new.dataset_id)
        .bind(&new.source_file_id)
        .bind(serde_json::to_string(&new.metadata)?)
        .bind(features.len() as i64)
        .bind(&blob_path)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        insert_features(&mut tx, &id, features).await?;
        tx.commit().await?;

        debug!(vector_data = %id, features = features.len(), "Stored vector data");
        self.get_vector_data(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("vector data {}", id)))
    }

    /// Replace the features and metadata of an existing vector artifact
    pub async fn rewrite_vector_data(
        &self,
        vector: &VectorData,
        geojson: &Value,
        metadata: &Map<String, Value>,
    ) -> Result<VectorData> {
        let features = features_of(geojson);
        self.blobs
            .write(&vector.blob_path, &serde_json::to_vec(geojson)?)
            .await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE vector_data SET metadata_json = ?, feature_count = ?, updated_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(metadata)?)
        .bind(features.len() as i64)
        .bind(now())
        .bind(&vector.id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM vector_features WHERE vector_data_id = ?")
            .bind(&vector.id)
            .execute(&mut *tx)
            .await?;
        insert_features(&mut tx, &vector.id, features).await?;
        tx.commit().await?;

        self.get_vector_data(&vector.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("vector data {}", vector.id)))
    }

    pub async fn get_vector_data(&self, id: &str) -> Result<Option<VectorData>> {
        let data = sqlx::query_as::<_, VectorData>("SELECT * FROM vector_data WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(data)
    }

    pub async fn list_vector_data(&self, dataset_id: &str) -> Result<Vec<VectorData>> {
        let data = sqlx::query_as::<_, VectorData>(
            "SELECT * FROM vector_data WHERE dataset_id = ? ORDER BY created_at, name",
        )
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(data)
    }

    /// Read a vector artifact's GeoJSON
    pub async fn read_vector_geojson(&self, vector: &VectorData) -> Result<Value> {
        let bytes = self.blobs.read(&vector.blob_path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn count_vector_features(&self, vector_data_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM vector_features WHERE vector_data_id = ?")
                .bind(vector_data_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ===== Raster Operations =====

    /// Store a canonical raster copied from `cog_path`
    pub async fn insert_raster_data(&self, new: &NewRasterData, cog_path: &Path) -> Result<RasterData> {
        let id = Uuid::new_v4().to_string();
        let blob_path = format!("datasets/{}/raster/{}.tif", new.dataset_id, id);
        self.blobs.copy_in(&blob_path, cog_path).await?;

        sqlx::query(
            r#"
            INSERT INTO raster_data (id, name, dataset_id, source_file_id, metadata_json, blob_path, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.name)
        .bind(&new.dataset_id)
        .bind(&new.source_file_id)
        .bind(serde_json::to_string(&new.metadata)?)
        .bind(&blob_path)
        .bind(now())
        .execute(&self.pool)
        .await?;

        let raster = sqlx::query_as::<_, RasterData>("SELECT * FROM raster_data WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        Ok(raster)
    }

    pub async fn list_raster_data(&self, dataset_id: &str) -> Result<Vec<RasterData>> {
        let data = sqlx::query_as::<_, RasterData>(
            "SELECT * FROM raster_data WHERE dataset_id = ? ORDER BY created_at, name",
        )
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(data)
    }

    // ===== Job Operations =====

    pub async fn insert_job(&self, job: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_records (id, name, job_type, project_id, inputs_json, outputs_json,
                                     status, error, completed, created_at, updated_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(&job.job_type)
        .bind(&job.project_id)
        .bind(&job.inputs_json)
        .bind(&job.outputs_json)
        .bind(&job.status)
        .bind(&job.error)
        .bind(job.completed)
        .bind(&job.created_at)
        .bind(&job.updated_at)
        .bind(&job.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let job = sqlx::query_as::<_, JobRecord>("SELECT * FROM job_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// List jobs, newest first
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let jobs = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM job_records
            WHERE (?1 IS NULL OR project_id = ?1)
              AND (?2 IS NULL OR job_type = ?2)
            ORDER BY created_at DESC, id
            LIMIT ?3
            "#,
        )
        .bind(&filter.project_id)
        .bind(&filter.job_type)
        .bind(filter.limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Update one column of a job that has not completed. Returns false if terminal.
    async fn update_open_job(&self, id: &str, column: &str, value: Option<&str>) -> Result<bool> {
        let sql = format!(
            "UPDATE job_records SET {} = ?, updated_at = ? WHERE id = ? AND completed = 0",
            column
        );
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_job_status(&self, id: &str, status: &str) -> Result<bool> {
        self.update_open_job(id, "status", Some(status)).await
    }

    pub async fn update_job_error(&self, id: &str, error: &str) -> Result<bool> {
        self.update_open_job(id, "error", Some(error)).await
    }

    pub async fn update_job_name(&self, id: &str, name: &str) -> Result<bool> {
        self.update_open_job(id, "name", Some(name)).await
    }

    pub async fn update_job_outputs(&self, id: &str, outputs: &Map<String, Value>) -> Result<bool> {
        let json = serde_json::to_string(outputs)?;
        self.update_open_job(id, "outputs_json", Some(&json)).await
    }

    /// Terminal transition. Returns false if the job had already completed.
    pub async fn complete_job(&self, id: &str, status: &str) -> Result<bool> {
        let now = now();
        let result = sqlx::query(
            r#"
            UPDATE job_records SET completed = 1, status = ?, completed_at = ?, updated_at = ?
            WHERE id = ? AND completed = 0
            "#,
        )
        .bind(status)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ===== Statistics =====

    pub async fn stats(&self) -> Result<CatalogStats> {
        let count = |table: &'static str| {
            let pool = self.pool.clone();
            async move {
                let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
                    .fetch_one(&pool)
                    .await?;
                Ok::<i64, Error>(n)
            }
        };
        let (jobs_pending,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM job_records WHERE completed = 0")
                .fetch_one(&self.pool)
                .await?;

        Ok(CatalogStats {
            projects: count("projects").await?,
            datasets: count("datasets").await?,
            charts: count("charts").await?,
            file_items: count("file_items").await?,
            vector_data: count("vector_data").await?,
            raster_data: count("raster_data").await?,
            jobs: count("job_records").await?,
            jobs_pending,
            stored_bytes: self.blobs.tree_size(".")?,
        })
    }
}

fn features_of(geojson: &Value) -> &[Value] {
    geojson
        .get("features")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

async fn insert_features(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    vector_data_id: &str,
    features: &[Value],
) -> Result<()> {
    for feature in features {
        let geometry = feature.get("geometry").cloned().unwrap_or(Value::Null);
        let properties = feature
            .get("properties")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        sqlx::query(
            "INSERT INTO vector_features (vector_data_id, geometry_json, properties_json) VALUES (?, ?, ?)",
        )
        .bind(vector_data_id)
        .bind(serde_json::to_string(&geometry)?)
        .bind(serde_json::to_string(&properties)?)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup_test_catalog() -> (Catalog, TempDir) {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(&tmp.path().join("test.db"), &tmp.path().join("storage"))
            .await
            .unwrap();
        (catalog, tmp)
    }

    fn new_dataset(name: &str) -> NewDataset {
        NewDataset {
            name: name.to_string(),
            description: "test".to_string(),
            ..Default::default()
        }
    }

    fn new_file(name: &str, index: i64) -> NewFileItem {
        NewFileItem {
            name: name.to_string(),
            file_type: "geojson".to_string(),
            file_index: index,
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_create_dataset_is_conflict_tolerant() {
        let (catalog, _tmp) = setup_test_catalog().await;

        let (first, created) = catalog.create_dataset(&new_dataset("roads")).await.unwrap();
        assert!(created);
        let (second, created) = catalog.create_dataset(&new_dataset("roads")).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(catalog.list_datasets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_item_write_skip_and_replace() {
        let (catalog, tmp) = setup_test_catalog().await;
        let (dataset, _) = catalog.create_dataset(&new_dataset("roads")).await.unwrap();
        let owner = FileOwner::Dataset(dataset.id.clone());

        let source = tmp.path().join("roads.geojson");
        std::fs::write(&source, b"first").unwrap();

        let first = match catalog
            .write_file_item(&owner, &new_file("roads.geojson", 0), &source, false)
            .await
            .unwrap()
        {
            FileWrite::Created(item) => item,
            FileWrite::Existing(_) => panic!("expected a new item"),
        };
        assert_eq!(first.file_size, 5);

        std::fs::write(&source, b"second!").unwrap();
        let skipped = catalog
            .write_file_item(&owner, &new_file("roads.geojson", 0), &source, false)
            .await
            .unwrap();
        assert!(matches!(skipped, FileWrite::Existing(ref item) if item.id == first.id));

        let replaced = catalog
            .write_file_item(&owner, &new_file("roads.geojson", 0), &source, true)
            .await
            .unwrap();
        let FileWrite::Created(replaced) = replaced else {
            panic!("expected replacement");
        };
        assert_ne!(replaced.id, first.id);
        assert_eq!(replaced.file_size, 7);
        assert!(!catalog.file_item_path(&first).unwrap().exists());
        assert_eq!(
            std::fs::read(catalog.file_item_path(&replaced).unwrap()).unwrap(),
            b"second!"
        );
        assert_eq!(catalog.list_file_items(&owner).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_file_writes_create_one_item() {
        let (catalog, tmp) = setup_test_catalog().await;
        let (dataset, _) = catalog.create_dataset(&new_dataset("roads")).await.unwrap();
        let owner = FileOwner::Dataset(dataset.id.clone());
        let source = tmp.path().join("a.geojson");
        std::fs::write(&source, b"{}").unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let catalog = catalog.clone();
            let owner = owner.clone();
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                catalog
                    .write_file_item(&owner, &new_file("a.geojson", 0), &source, false)
                    .await
                    .unwrap()
            }));
        }
        let mut created = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), FileWrite::Created(_)) {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(catalog.list_file_items(&owner).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_dataset_cascades_and_removes_bytes() {
        let (catalog, tmp) = setup_test_catalog().await;
        let (dataset, _) = catalog.create_dataset(&new_dataset("roads")).await.unwrap();
        let owner = FileOwner::Dataset(dataset.id.clone());
        let source = tmp.path().join("a.geojson");
        std::fs::write(&source, b"{}").unwrap();
        let FileWrite::Created(item) = catalog
            .write_file_item(&owner, &new_file("a.geojson", 0), &source, false)
            .await
            .unwrap()
        else {
            panic!("expected a new item");
        };

        let vector = catalog
            .insert_vector_data(
                &NewVectorData {
                    name: "a".to_string(),
                    dataset_id: dataset.id.clone(),
                    source_file_id: Some(item.id.clone()),
                    metadata: Map::new(),
                },
                &json!({"type": "FeatureCollection", "features": [
                    {"type": "Feature", "geometry": {"type": "Point", "coordinates": [1, 2]}, "properties": {"a": 1}}
                ]}),
            )
            .await
            .unwrap();
        assert_eq!(vector.feature_count, 1);
        assert_eq!(catalog.count_vector_features(&vector.id).await.unwrap(), 1);

        catalog.delete_dataset(&dataset.id).await.unwrap();
        assert!(catalog.list_file_items(&owner).await.unwrap().is_empty());
        assert!(catalog.get_vector_data(&vector.id).await.unwrap().is_none());
        assert_eq!(catalog.count_vector_features(&vector.id).await.unwrap(), 0);
        assert!(!catalog.file_item_path(&item).unwrap().exists());
    }

    #[tokio::test]
    async fn test_project_membership_is_full_replace() {
        let (catalog, _tmp) = setup_test_catalog().await;
        let (a, _) = catalog.create_dataset(&new_dataset("a")).await.unwrap();
        let (b, _) = catalog.create_dataset(&new_dataset("b")).await.unwrap();
        let (project, created) = catalog
            .create_project(&NewProject {
                name: "p".to_string(),
                default_map_center: [42.0, -71.0],
                default_map_zoom: 10.0,
            })
            .await
            .unwrap();
        assert!(created);
        assert_eq!(project.default_map_center(), [42.0, -71.0]);

        catalog
            .set_project_datasets(&project.id, &[a.id.clone(), b.id.clone()])
            .await
            .unwrap();
        catalog
            .set_project_datasets(&project.id, &[b.id.clone()])
            .await
            .unwrap();
        let members = catalog.project_datasets(&project.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "b");
    }

    #[tokio::test]
    async fn test_job_updates_stop_after_completion() {
        let (catalog, _tmp) = setup_test_catalog().await;
        let now = now();
        let job = JobRecord {
            id: Uuid::new_v4().to_string(),
            name: "j".to_string(),
            job_type: "test".to_string(),
            project_id: None,
            inputs_json: "{}".to_string(),
            outputs_json: None,
            status: "Initializing task...".to_string(),
            error: None,
            completed: false,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
        };
        catalog.insert_job(&job).await.unwrap();

        assert!(catalog.update_job_status(&job.id, "working").await.unwrap());
        assert!(catalog.complete_job(&job.id, "Completed").await.unwrap());
        assert!(!catalog.complete_job(&job.id, "Completed").await.unwrap());
        assert!(!catalog.update_job_status(&job.id, "late").await.unwrap());

        let stored = catalog.get_job(&job.id).await.unwrap().unwrap();
        assert!(stored.completed);
        assert_eq!(stored.status, "Completed");
    }

    #[tokio::test]
    async fn test_clear_all() {
        let (catalog, _tmp) = setup_test_catalog().await;
        catalog.create_dataset(&new_dataset("a")).await.unwrap();
        catalog
            .create_chart(&NewChart {
                name: "c".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let stats = catalog.clear_all().await.unwrap();
        assert_eq!(stats.datasets, 1);
        assert_eq!(stats.charts, 1);
        let counts = catalog.stats().await.unwrap();
        assert_eq!(counts.datasets, 0);
        assert_eq!(counts.charts, 0);
    }

    #[tokio::test]
    async fn test_tags_and_name_counting() {
        let (catalog, _tmp) = setup_test_catalog().await;
        let (dataset, _) = catalog
            .create_dataset(&new_dataset("Flood Simulation A"))
            .await
            .unwrap();
        catalog
            .set_dataset_tags(&dataset.id, &["b".to_string(), "a".to_string(), "a".to_string()])
            .await
            .unwrap();
        assert_eq!(catalog.dataset_tags(&dataset.id).await.unwrap(), vec!["a", "b"]);
        assert_eq!(
            catalog.count_datasets_named_like("flood simulation").await.unwrap(),
            1
        );
    }
}
