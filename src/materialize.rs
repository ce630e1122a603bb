//! File materializer: fetched bytes to owned file items

use crate::catalog::{Catalog, FileItem, FileOwner, FileWrite, NewFileItem};
use crate::error::Result;
use crate::manifest::FileReference;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

/// Outcome of materializing one reference
#[derive(Debug, Clone)]
pub enum Materialized {
    Created(FileItem),
    /// An item with this (owner, name) already existed and was kept
    Skipped(FileItem),
}

impl Materialized {
    pub fn item(&self) -> &FileItem {
        match self {
            Materialized::Created(item) | Materialized::Skipped(item) => item,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Materialized::Created(_))
    }
}

/// Suffix after the last `.` of the final path segment, lowercased
pub fn file_type_of(path: &str) -> String {
    let segment = path.rsplit('/').next().unwrap_or(path);
    match segment.rsplit_once('.') {
        Some((_, suffix)) => suffix.to_ascii_lowercase(),
        None => String::new(),
    }
}

/// Persist `local_path` as the file item `reference` under `owner`.
///
/// An existing item with the same name is kept unless `replace` is set, in
/// which case it and its bytes are removed first.
pub async fn materialize(
    catalog: &Catalog,
    reference: &FileReference,
    local_path: &Path,
    index: usize,
    owner: &FileOwner,
    replace: bool,
) -> Result<Materialized> {
    let name = reference.display_name();
    let mut metadata = reference.metadata.clone();
    metadata.insert(
        "uploaded".to_string(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
    );

    let new = NewFileItem {
        name: name.clone(),
        file_type: file_type_of(&reference.path),
        file_index: index as i64,
        metadata,
    };

    match catalog
        .write_file_item(owner, &new, local_path, replace)
        .await?
    {
        FileWrite::Created(item) => {
            info!(file = %item.name, size = item.file_size, "File item created");
            Ok(Materialized::Created(item))
        }
        FileWrite::Existing(item) => {
            debug!(file = %item.name, "File item already exists");
            Ok(Materialized::Skipped(item))
        }
    }
}
