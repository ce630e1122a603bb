//! Format routing and conversion into normalized artifacts
//!
//! Each file item of a dataset is staged into a scratch directory under a
//! flat name carrying its stored file type, classified by that suffix and
//! handed to the matching converter:
//! - vectors (shapefile, GeoJSON) become one feature collection per file, or
//!   one per archive when the archive asks for its contents to be combined
//! - rasters become a single-band cloud-optimized raster
//! - archives are expanded and their members routed individually
//!
//! A failing file is recorded in the [`ConversionReport`] and does not stop
//! its siblings. The first raster failure skips the dataset's remaining
//! rasters.

pub mod archive;
pub mod chart;
pub mod colors;
pub mod crs;
pub mod raster;
pub mod shapefile;
pub mod vector;

use crate::catalog::{Catalog, FileItem, FileOwner, NewRasterData, NewVectorData};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::materialize::file_type_of;
use archive::{expand_archive, ArchiveKind};
use crs::{reproject_collection, Crs, Reprojector, WebMercatorReprojector, WGS84};
use raster::{GdalRasterBackend, RasterBackend, RasterReferencing};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vector::FeatureCollection;

const IGNORED_SUFFIXES: &[&str] = &[
    "dbf", "sbn", "sbx", "cpg", "shp.xml", "shx", "vrt", "hdf", "lyr",
];
const RASTER_SUFFIXES: &[&str] = &["tif", "tiff", "nc", "jp2"];

/// Metadata key of an archive file item that merges its vector members
pub const COMBINE_KEY: &str = "combine_contents";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorFormat {
    Shapefile,
    GeoJson,
}

/// Routing decision for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    Vector(VectorFormat),
    /// Sidecar projection definition
    Projection,
    Raster,
    Archive(ArchiveKind),
    Ignorable,
    Unknown,
}

/// Classify a file by its name's suffix
pub fn classify(name: &str) -> FileClass {
    let name = name.to_ascii_lowercase();
    if IGNORED_SUFFIXES
        .iter()
        .any(|suffix| name.ends_with(&format!(".{}", suffix)))
    {
        return FileClass::Ignorable;
    }
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") || name.ends_with(".gz") {
        return FileClass::Archive(ArchiveKind::TarGz);
    }

    let suffix = name.rsplit_once('.').map(|(_, s)| s).unwrap_or("");
    match suffix {
        "shp" => FileClass::Vector(VectorFormat::Shapefile),
        "json" | "geojson" => FileClass::Vector(VectorFormat::GeoJson),
        "prj" => FileClass::Projection,
        "zip" => FileClass::Archive(ArchiveKind::Zip),
        s if RASTER_SUFFIXES.contains(&s) => FileClass::Raster,
        _ => FileClass::Unknown,
    }
}

/// Aggregate outcome of converting a set of files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionReport {
    pub vector_ids: Vec<String>,
    pub raster_ids: Vec<String>,
    /// `"<file>: <message>"` per failed file
    pub errors: Vec<String>,
    pub unrecognized: Vec<String>,
}

impl ConversionReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn artifact_count(&self) -> usize {
        self.vector_ids.len() + self.raster_ids.len()
    }

    fn record_error(&mut self, file: &str, error: &Error) {
        warn!(file, error = %error, "Conversion failed");
        let message = match error {
            Error::Conversion { message, .. } => message.clone(),
            other => other.to_string(),
        };
        self.errors.push(format!("{}: {}", file, message));
    }

}

/// State shared by every batch of one dataset conversion
#[derive(Default)]
struct RunState {
    raster_failed: bool,
    report: ConversionReport,
}

/// Flat scratch file name for a file item.
///
/// Directory components of the item name are dropped and the stored file
/// type is appended when the name does not already end with it, so routing
/// follows the source path rather than the display name. Names already used
/// in the batch get an index prefix.
fn staged_name(item: &FileItem, index: usize, taken: &mut HashSet<String>) -> String {
    let base = item
        .name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .map(str::trim)
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .map(str::to_string)
        .unwrap_or_else(|| format!("file-{}", index));

    let mut name = if item.file_type.is_empty() || file_type_of(&base) == item.file_type {
        base
    } else {
        format!("{}.{}", base, item.file_type)
    };
    if taken.contains(&name.to_ascii_lowercase()) {
        name = format!("{}-{}", index, name);
    }
    taken.insert(name.to_ascii_lowercase());
    name
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Converts staged files into vector and raster artifacts
#[derive(Clone)]
pub struct Converter {
    catalog: Catalog,
    raster: Arc<dyn RasterBackend>,
    reprojector: Arc<dyn Reprojector>,
    canonical_crs: Crs,
}

impl Converter {
    pub fn new(
        catalog: Catalog,
        raster: Arc<dyn RasterBackend>,
        reprojector: Arc<dyn Reprojector>,
        canonical_crs: Crs,
    ) -> Self {
        Self {
            catalog,
            raster,
            reprojector,
            canonical_crs,
        }
    }

    /// Production converter: GDAL rasters, native web mercator reprojection
    pub fn from_config(catalog: Catalog, config: &Config) -> Result<Self> {
        Ok(Self::new(
            catalog,
            Arc::new(GdalRasterBackend::new(&config.raster)),
            Arc::new(WebMercatorReprojector),
            config.canonical_crs()?,
        ))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn canonical_crs(&self) -> Crs {
        self.canonical_crs
    }

    /// Convert every file item of a dataset
    pub async fn convert_dataset(&self, dataset_id: &str) -> Result<ConversionReport> {
        let dataset = self
            .catalog
            .get_dataset(dataset_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("dataset {}", dataset_id)))?;
        let items = self
            .catalog
            .list_file_items(&FileOwner::Dataset(dataset.id.clone()))
            .await?;
        info!(dataset = %dataset.name, files = items.len(), "Converting dataset");

        let scratch = tempfile::tempdir()?;
        let staged_dir = scratch.path().join("files");
        tokio::fs::create_dir_all(&staged_dir).await?;

        let mut state = RunState::default();

        // Stage everything first so shapefile sidecars sit next to their .shp
        let mut taken = HashSet::new();
        let mut staged = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let target = staged_dir.join(staged_name(item, index, &mut taken));
            match self.stage(item, &target).await {
                Ok(()) => staged.push(Some(target)),
                Err(e) => {
                    state.report.record_error(&item.name, &e);
                    staged.push(None);
                }
            }
        }

        for (index, (item, path)) in items.iter().zip(&staged).enumerate() {
            let Some(path) = path else { continue };
            let archive_dir = scratch.path().join(format!("archive-{}", index));
            self.convert_staged(&dataset.id, item, path, &archive_dir, &mut state)
                .await;
        }

        info!(
            dataset = %dataset.name,
            vectors = state.report.vector_ids.len(),
            rasters = state.report.raster_ids.len(),
            errors = state.report.errors.len(),
            "Dataset conversion finished"
        );
        Ok(state.report)
    }

    async fn stage(&self, item: &FileItem, target: &Path) -> Result<()> {
        tokio::fs::copy(self.catalog.file_item_path(item)?, target).await?;
        Ok(())
    }

    async fn convert_staged(
        &self,
        dataset_id: &str,
        item: &FileItem,
        path: &Path,
        archive_dir: &Path,
        state: &mut RunState,
    ) {
        match classify(&file_name(path)) {
            FileClass::Archive(kind) => {
                let members = match expand_archive(kind, path, archive_dir).await {
                    Ok(members) => members,
                    Err(e) => {
                        state.report.record_error(&item.name, &e);
                        return;
                    }
                };
                let combine = item
                    .metadata()
                    .get(COMBINE_KEY)
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.convert_batch(dataset_id, item, &members, combine, state)
                    .await;
            }
            _ => {
                self.convert_batch(dataset_id, item, &[path.to_path_buf()], false, state)
                    .await
            }
        }
    }

    async fn convert_batch(
        &self,
        dataset_id: &str,
        source: &FileItem,
        files: &[PathBuf],
        combine: bool,
        state: &mut RunState,
    ) {
        let batch_projection = files
            .iter()
            .find(|f| classify(&file_name(f)) == FileClass::Projection)
            .and_then(|prj| read_projection(prj));

        let mut combined = FeatureCollection::default();
        let mut combined_names = Vec::new();

        for path in files {
            let name = file_name(path);
            match classify(&name) {
                FileClass::Vector(format) => {
                    match self.read_vector(path, format, batch_projection) {
                        Ok(collection) if combine => {
                            combined.extend(collection);
                            combined_names.push(name);
                        }
                        Ok(collection) => {
                            match self
                                .store_vector(dataset_id, source, &name, vec![name.clone()], collection)
                                .await
                            {
                                Ok(id) => state.report.vector_ids.push(id),
                                Err(e) => state.report.record_error(&name, &e),
                            }
                        }
                        Err(e) => state.report.record_error(&name, &e),
                    }
                }
                FileClass::Raster => {
                    if state.raster_failed {
                        state.report.errors.push(format!(
                            "{}: skipped after an earlier raster failure",
                            name
                        ));
                        continue;
                    }
                    match self.convert_raster(dataset_id, source, path).await {
                        Ok(id) => state.report.raster_ids.push(id),
                        Err(e) => {
                            state.raster_failed = true;
                            state.report.record_error(&name, &e);
                        }
                    }
                }
                FileClass::Projection => {}
                FileClass::Ignorable => debug!(file = %name, "Ignoring sidecar file"),
                FileClass::Archive(_) => {
                    warn!(file = %name, "Nested archives are not expanded");
                    state.report.unrecognized.push(name);
                }
                FileClass::Unknown => {
                    warn!(file = %name, "Unable to convert");
                    state.report.unrecognized.push(name);
                }
            }
        }

        if combine && !combined_names.is_empty() {
            match self
                .store_vector(dataset_id, source, &source.name, combined_names, combined)
                .await
            {
                Ok(id) => state.report.vector_ids.push(id),
                Err(e) => state.report.record_error(&source.name, &e),
            }
        }
    }

    /// Parse a vector file and bring it into the canonical reference
    fn read_vector(
        &self,
        path: &Path,
        format: VectorFormat,
        batch_projection: Option<Crs>,
    ) -> Result<FeatureCollection> {
        let name = file_name(path);
        let (mut collection, source_crs) = match format {
            VectorFormat::Shapefile => {
                let crs = batch_projection
                    .or_else(|| shapefile::sibling(path, "prj").and_then(|p| read_projection(&p)))
                    .unwrap_or(WGS84);
                (shapefile::read_shapefile(path)?, crs)
            }
            VectorFormat::GeoJson => {
                let bytes = std::fs::read(path)?;
                let (collection, declared) = FeatureCollection::from_geojson_slice(&bytes)
                    .map_err(|e| Error::conversion(&name, e))?;
                let crs = match declared {
                    Some(text) => Crs::parse(&text).ok_or_else(|| {
                        Error::conversion(&name, format!("unrecognized coordinate reference '{}'", text))
                    })?,
                    None => WGS84,
                };
                (collection, crs)
            }
        };

        if source_crs != self.canonical_crs {
            debug!(file = %name, from = %source_crs, to = %self.canonical_crs, "Reprojecting");
            reproject_collection(
                &mut collection,
                source_crs,
                self.canonical_crs,
                self.reprojector.as_ref(),
            )
            .map_err(|e| Error::conversion(&name, e))?;
        }
        Ok(collection)
    }

    async fn store_vector(
        &self,
        dataset_id: &str,
        source: &FileItem,
        name: &str,
        source_filenames: Vec<String>,
        collection: FeatureCollection,
    ) -> Result<String> {
        let metadata = vector_metadata(source.metadata(), source_filenames, &collection);
        let vector = self
            .catalog
            .insert_vector_data(
                &NewVectorData {
                    name: name.to_string(),
                    dataset_id: dataset_id.to_string(),
                    source_file_id: Some(source.id.clone()),
                    metadata,
                },
                &collection.to_geojson()?,
            )
            .await?;
        info!(vector_data = %vector.id, name, features = vector.feature_count, "Vector data created");
        Ok(vector.id)
    }

    async fn convert_raster(&self, dataset_id: &str, source: &FileItem, path: &Path) -> Result<String> {
        let name = file_name(path);
        let probe = self.raster.probe(path).await?;

        let referenced = if probe.georeferenced {
            path.to_path_buf()
        } else {
            let referencing = RasterReferencing::from_metadata(&source.metadata()).ok_or_else(|| {
                Error::conversion(
                    &name,
                    "raster has no georeferencing and no crs/transform metadata was supplied",
                )
            })?;
            let output = path.with_extension("referenced.tif");
            self.raster
                .synthesize(path, &probe, &referencing, &output)
                .await?;
            output
        };

        let cog = path.with_extension("cog.tif");
        self.raster.to_cloud_optimized(&referenced, &cog).await?;

        let mut metadata = source.metadata();
        metadata.insert("source_filenames".to_string(), json!([name]));
        metadata.insert("width".to_string(), json!(probe.width));
        metadata.insert("height".to_string(), json!(probe.height));
        metadata.insert("bands".to_string(), json!(probe.bands));
        if let Some(crs) = &probe.crs {
            metadata.insert("source_crs".to_string(), json!(crs));
        }
        metadata.extend(probe.metadata);

        let raster = self
            .catalog
            .insert_raster_data(
                &NewRasterData {
                    name: name.clone(),
                    dataset_id: dataset_id.to_string(),
                    source_file_id: Some(source.id.clone()),
                    metadata,
                },
                &cog,
            )
            .await?;
        info!(raster_data = %raster.id, name = %name, "Raster data created");
        Ok(raster.id)
    }
}

/// Metadata for a vector artifact: the source item's metadata plus the
/// contributing file names, feature count and attribute inventory
pub fn vector_metadata(
    mut metadata: Map<String, Value>,
    source_filenames: Vec<String>,
    collection: &FeatureCollection,
) -> Map<String, Value> {
    metadata.insert("source_filenames".to_string(), json!(source_filenames));
    metadata.insert("feature_count".to_string(), json!(collection.len()));
    metadata.insert("properties".to_string(), collection.inventory().to_json());
    metadata
}

fn read_projection(path: &Path) -> Option<Crs> {
    let text = std::fs::read_to_string(path).ok()?;
    let crs = Crs::parse(&text);
    if crs.is_none() {
        warn!(file = %path.display(), "Unrecognized projection definition");
    }
    crs
}

#[cfg(test)]
pub(crate) mod testing {
    use super::raster::{RasterBackend, RasterProbe, RasterReferencing};
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Raster backend that copies bytes instead of running GDAL.
    ///
    /// Files whose content starts with `corrupt` fail to open; names
    /// containing `unreferenced` report no georeferencing.
    #[derive(Default)]
    pub struct CopyRasterBackend {
        pub synthesized: AtomicUsize,
        pub canonicalized: AtomicUsize,
    }

    #[async_trait]
    impl RasterBackend for CopyRasterBackend {
        async fn probe(&self, source: &Path) -> Result<RasterProbe> {
            let bytes = tokio::fs::read(source).await?;
            let name = source.display().to_string();
            if bytes.starts_with(b"corrupt") {
                return Err(Error::conversion(name, "not a raster"));
            }
            Ok(RasterProbe {
                georeferenced: !name.contains("unreferenced"),
                width: 4,
                height: 2,
                bands: 1,
                crs: None,
                metadata: Default::default(),
            })
        }

        async fn synthesize(
            &self,
            source: &Path,
            _probe: &RasterProbe,
            _referencing: &RasterReferencing,
            output: &Path,
        ) -> Result<()> {
            self.synthesized.fetch_add(1, Ordering::SeqCst);
            tokio::fs::copy(source, output).await?;
            Ok(())
        }

        async fn to_cloud_optimized(&self, source: &Path, output: &Path) -> Result<()> {
            self.canonicalized.fetch_add(1, Ordering::SeqCst);
            tokio::fs::copy(source, output).await?;
            Ok(())
        }
    }
}
