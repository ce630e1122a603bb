//! Manifest items and parsing
//!
//! A manifest is a JSON array of objects, each tagged with `type` =
//! `Project`, `Dataset` or `Chart`. Items are validated into typed variants at
//! the boundary; unrecognized kinds are collected as rejected and never
//! abort the run.

mod policy;

pub use policy::*;

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Kinds of manifest item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    Project,
    Dataset,
    Chart,
}

impl ItemKind {
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "Project" => Some(ItemKind::Project),
            "Dataset" => Some(ItemKind::Dataset),
            "Chart" => Some(ItemKind::Chart),
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemKind::Project => write!(f, "Project"),
            ItemKind::Dataset => write!(f, "Dataset"),
            ItemKind::Chart => write!(f, "Chart"),
        }
    }
}

/// Per-item action directive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemAction {
    #[default]
    None,
    Replace,
    Redownload,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A declared source file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReference {
    #[serde(default)]
    pub name: Option<String>,
    pub path: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Map<String, Value>,
}

impl FileReference {
    /// Declared name, else the final segment of `path`
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self
                .path
                .rsplit('/')
                .next()
                .unwrap_or(&self.path)
                .to_string(),
        }
    }
}

/// Dataset declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetItem {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Map<String, Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub files: Vec<FileReference>,
    #[serde(default)]
    pub layers: Option<Value>,
    #[serde(default)]
    pub network_options: Option<Value>,
    #[serde(default)]
    pub region_options: Option<Value>,
    /// Path of a conversion routine, relative to the manifest
    #[serde(default)]
    pub conversion_script: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub action: Option<ItemAction>,
    #[serde(default)]
    pub project: Option<String>,
    /// Keys not modelled above, available to conversion plugins
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DatasetItem {
    pub fn action(&self) -> ItemAction {
        self.action.unwrap_or_default()
    }
}

/// Project declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectItem {
    pub name: String,
    pub default_map_center: [f64; 2],
    pub default_map_zoom: f64,
    pub datasets: Vec<String>,
    #[serde(default)]
    pub action: Option<ItemAction>,
}

impl ProjectItem {
    pub fn action(&self) -> ItemAction {
        self.action.unwrap_or_default()
    }
}

/// How a chart's tabular file becomes chart data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartConversionOptions {
    /// Column used for the x-axis labels
    pub labels: String,
    /// Columns turned into series
    pub datasets: Vec<String>,
    /// Series name to colour name
    #[serde(default, deserialize_with = "null_as_default")]
    pub palette: BTreeMap<String, String>,
}

/// Chart declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartItem {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub files: Vec<FileReference>,
    #[serde(default)]
    pub editable: bool,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub chart_options: Option<Value>,
    #[serde(default)]
    pub conversion_options: Option<ChartConversionOptions>,
    #[serde(default)]
    pub action: Option<ItemAction>,
}

impl ChartItem {
    pub fn action(&self) -> ItemAction {
        self.action.unwrap_or_default()
    }
}

/// One validated manifest item
#[derive(Debug, Clone)]
pub enum ManifestItem {
    Project(ProjectItem),
    Dataset(DatasetItem),
    Chart(ChartItem),
}

impl ManifestItem {
    pub fn kind(&self) -> ItemKind {
        match self {
            ManifestItem::Project(_) => ItemKind::Project,
            ManifestItem::Dataset(_) => ItemKind::Dataset,
            ManifestItem::Chart(_) => ItemKind::Chart,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ManifestItem::Project(p) => &p.name,
            ManifestItem::Dataset(d) => &d.name,
            ManifestItem::Chart(c) => &c.name,
        }
    }
}

/// An item dropped because its `type` was not recognized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedItem {
    pub index: usize,
    pub type_name: Option<String>,
}

/// A manifest split into its item categories
#[derive(Debug, Clone, Default)]
pub struct ParsedManifest {
    /// Directory conversion scripts are resolved against
    pub base_dir: PathBuf,
    pub datasets: Vec<DatasetItem>,
    pub projects: Vec<ProjectItem>,
    pub charts: Vec<ChartItem>,
    pub rejected: Vec<RejectedItem>,
}

impl ParsedManifest {
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty() && self.projects.is_empty() && self.charts.is_empty()
    }

    /// Resolve a path declared in the manifest
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.base_dir.join(relative)
    }
}

/// Read and parse a manifest file
pub fn parse_manifest(path: &Path) -> Result<ParsedManifest> {
    let content = std::fs::read_to_string(path)?;
    let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    parse_manifest_str(&content, base_dir)
}

/// Parse manifest JSON text
pub fn parse_manifest_str(content: &str, base_dir: PathBuf) -> Result<ParsedManifest> {
    let raw: Value = serde_json::from_str(content)
        .map_err(|e| Error::ManifestParse(format!("malformed JSON: {}", e)))?;
    let Value::Array(entries) = raw else {
        return Err(Error::ManifestParse(
            "manifest must be a JSON array of items".to_string(),
        ));
    };

    let mut parsed = ParsedManifest {
        base_dir,
        ..Default::default()
    };

    for (index, entry) in entries.into_iter().enumerate() {
        match parse_item(index, entry)? {
            Ok(ManifestItem::Dataset(d)) => parsed.datasets.push(d),
            Ok(ManifestItem::Project(p)) => parsed.projects.push(p),
            Ok(ManifestItem::Chart(c)) => parsed.charts.push(c),
            Err(rejected) => {
                warn!(
                    index = rejected.index,
                    "Invalid item type: {}",
                    rejected.type_name.as_deref().unwrap_or("<missing>")
                );
                parsed.rejected.push(rejected);
            }
        }
    }

    debug!(
        datasets = parsed.datasets.len(),
        projects = parsed.projects.len(),
        charts = parsed.charts.len(),
        rejected = parsed.rejected.len(),
        "Parsed manifest"
    );
    Ok(parsed)
}

/// Outer error is fatal; inner `Err` is a recoverable rejection
fn parse_item(index: usize, entry: Value) -> Result<std::result::Result<ManifestItem, RejectedItem>> {
    let Value::Object(mut object) = entry else {
        return Ok(Err(RejectedItem {
            index,
            type_name: None,
        }));
    };

    let type_name = object
        .remove("type")
        .and_then(|t| t.as_str().map(str::to_string));
    let Some(kind) = type_name.as_deref().and_then(ItemKind::from_type_name) else {
        return Ok(Err(RejectedItem { index, type_name }));
    };

    let label = object
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>")
        .to_string();
    let body = Value::Object(object);
    let fail = |e: serde_json::Error| {
        Error::ManifestParse(format!("item {} ({} '{}'): {}", index, kind, label, e))
    };

    let item = match kind {
        ItemKind::Project => ManifestItem::Project(serde_json::from_value(body).map_err(fail)?),
        ItemKind::Dataset => ManifestItem::Dataset(serde_json::from_value(body).map_err(fail)?),
        ItemKind::Chart => ManifestItem::Chart(serde_json::from_value(body).map_err(fail)?),
    };
    Ok(Ok(item))
}
