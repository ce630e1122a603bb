//! Operator-supplied dataset conversion
//!
//! A dataset declaration may name a conversion script. Scripts are not loaded
//! dynamically; the script path resolves to an identifier that selects a
//! [`ConversionPlugin`] from a [`PluginRegistry`]. A resolved plugin replaces
//! the default conversion for that dataset and may call it itself through the
//! [`DatasetHandle`].

mod styles;

pub use styles::{PropertyStyles, StyleOptions};

use crate::catalog::{Catalog, Dataset, VectorData};
use crate::convert::vector::FeatureCollection;
use crate::convert::{vector_metadata, ConversionReport, Converter};
use crate::error::{Error, Result};
use crate::manifest::DatasetItem;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// File whose presence marks a script directory as a package
pub const PACKAGE_MARKER: &str = "mod.rs";

/// A custom dataset conversion routine.
///
/// Plugins are operator code and report failures as [`anyhow::Error`];
/// [`run_plugin`] folds the error chain into the crate error.
#[async_trait]
pub trait ConversionPlugin: Send + Sync {
    async fn convert(
        &self,
        dataset: &mut DatasetHandle<'_>,
        declaration: &DatasetItem,
    ) -> anyhow::Result<()>;
}

/// Registry identifier for a script path: `<dir>::<stem>` when the script's
/// directory is a package, `<stem>` otherwise
pub fn identifier_for(script_path: &Path) -> Option<String> {
    let stem = script_path.file_stem()?.to_string_lossy().to_string();
    let parent = script_path.parent()?;
    if parent.join(PACKAGE_MARKER).is_file() {
        let package = parent.file_name()?.to_string_lossy().to_string();
        Some(format!("{}::{}", package, stem))
    } else {
        Some(stem)
    }
}

/// Conversion plugins keyed by identifier
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn ConversionPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the plugins shipped in this crate
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(PropertyStyles::IDENTIFIER, Arc::new(PropertyStyles));
        registry
    }

    pub fn register(&mut self, identifier: impl Into<String>, plugin: Arc<dyn ConversionPlugin>) {
        self.plugins.insert(identifier.into(), plugin);
    }

    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Resolve a declared script path to its plugin
    pub fn load(&self, script_path: &Path) -> Result<Arc<dyn ConversionPlugin>> {
        if !script_path.is_file() {
            return Err(Error::ExtensionLoad(format!(
                "conversion script not found: {}",
                script_path.display()
            )));
        }
        let identifier = identifier_for(script_path).ok_or_else(|| {
            Error::ExtensionLoad(format!("invalid script path: {}", script_path.display()))
        })?;
        debug!(script = %script_path.display(), identifier = %identifier, "Resolving conversion plugin");
        self.plugins.get(&identifier).cloned().ok_or_else(|| {
            Error::ExtensionLoad(format!(
                "missing entry point: no conversion routine registered as '{}'",
                identifier
            ))
        })
    }
}

/// Live view of a dataset handed to a conversion plugin
pub struct DatasetHandle<'a> {
    converter: &'a Converter,
    dataset: Dataset,
    report: ConversionReport,
}

impl<'a> DatasetHandle<'a> {
    pub fn new(converter: &'a Converter, dataset: Dataset) -> Self {
        Self {
            converter,
            dataset,
            report: ConversionReport::default(),
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn catalog(&self) -> &Catalog {
        self.converter.catalog()
    }

    /// Run the standard vector/raster conversion over the dataset's files
    pub async fn run_default_conversion(&mut self) -> Result<&ConversionReport> {
        let report = self.converter.convert_dataset(&self.dataset.id).await?;
        self.report.vector_ids.extend(report.vector_ids);
        self.report.raster_ids.extend(report.raster_ids);
        self.report.errors.extend(report.errors);
        self.report.unrecognized.extend(report.unrecognized);
        Ok(&self.report)
    }

    pub async fn vector_data(&self) -> Result<Vec<VectorData>> {
        self.catalog().list_vector_data(&self.dataset.id).await
    }

    pub async fn read_features(&self, vector: &VectorData) -> Result<FeatureCollection> {
        let geojson = self.catalog().read_vector_geojson(vector).await?;
        let (collection, _) = FeatureCollection::from_geojson_value(geojson)?;
        Ok(collection)
    }

    /// Replace a vector artifact's features; the attribute inventory is
    /// rebuilt from the new features
    pub async fn rewrite_features(
        &self,
        vector: &VectorData,
        collection: &FeatureCollection,
    ) -> Result<VectorData> {
        let mut metadata = vector.metadata();
        let source_filenames = match metadata.remove("source_filenames") {
            Some(Value::Array(names)) => names
                .into_iter()
                .filter_map(|n| n.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        let metadata = vector_metadata(metadata, source_filenames, collection);
        let updated = self
            .catalog()
            .rewrite_vector_data(vector, &collection.to_geojson()?, &metadata)
            .await?;
        info!(vector_data = %vector.id, features = collection.len(), "Rewrote vector features");
        Ok(updated)
    }

    pub fn into_report(self) -> ConversionReport {
        self.report
    }
}

/// Run a plugin against a dataset and return what it produced
pub async fn run_plugin(
    plugin: &dyn ConversionPlugin,
    converter: &Converter,
    dataset: Dataset,
    declaration: &DatasetItem,
) -> Result<ConversionReport> {
    let mut handle = DatasetHandle::new(converter, dataset);
    plugin.convert(&mut handle, declaration).await?;
    Ok(handle.into_report())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::NewDataset;
    use crate::convert::crs::{WebMercatorReprojector, WGS84};
    use crate::convert::testing::CopyRasterBackend;
    use anyhow::Context;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    pub(crate) fn declaration(value: Value) -> DatasetItem {
        serde_json::from_value(value).unwrap()
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl ConversionPlugin for Counting {
        async fn convert(&self, dataset: &mut DatasetHandle<'_>, _: &DatasetItem) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            assert_eq!(dataset.dataset().name, "Transit");
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl ConversionPlugin for Failing {
        async fn convert(&self, dataset: &mut DatasetHandle<'_>, _: &DatasetItem) -> anyhow::Result<()> {
            let name = dataset.dataset().name.clone();
            Err(anyhow::anyhow!("lookup table missing")).context(format!("enriching {}", name))
        }
    }

    #[test]
    fn test_identifier_for_package_and_standalone() {
        let tmp = TempDir::new().unwrap();
        let standalone = tmp.path().join("enrich.rs");
        std::fs::write(&standalone, "").unwrap();
        assert_eq!(identifier_for(&standalone).as_deref(), Some("enrich"));

        let package = tmp.path().join("mbta");
        std::fs::create_dir_all(&package).unwrap();
        std::fs::write(package.join(PACKAGE_MARKER), "").unwrap();
        let script = package.join("ingest_mbta.rs");
        std::fs::write(&script, "").unwrap();
        assert_eq!(identifier_for(&script).as_deref(), Some("mbta::ingest_mbta"));
    }

    #[test]
    fn test_load_errors() {
        let tmp = TempDir::new().unwrap();
        let registry = PluginRegistry::with_builtins();

        let missing = registry.load(&tmp.path().join("nope.rs")).err().unwrap();
        assert!(matches!(missing, Error::ExtensionLoad(ref m) if m.contains("not found")));

        let unregistered = tmp.path().join("custom.rs");
        std::fs::write(&unregistered, "").unwrap();
        let err = registry.load(&unregistered).err().unwrap();
        assert!(matches!(err, Error::ExtensionLoad(ref m) if m.contains("missing entry point")));

        let builtin = tmp.path().join("property_styles.rs");
        std::fs::write(&builtin, "").unwrap();
        assert!(registry.load(&builtin).is_ok());
    }

    #[tokio::test]
    async fn test_run_plugin_receives_dataset() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(&tmp.path().join("db.sqlite"), &tmp.path().join("storage"))
            .await
            .unwrap();
        let (dataset, _) = catalog
            .create_dataset(&NewDataset {
                name: "Transit".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let converter = Converter::new(
            catalog,
            Arc::new(CopyRasterBackend::default()),
            Arc::new(WebMercatorReprojector),
            WGS84,
        );

        let plugin = Counting(AtomicUsize::new(0));
        let item = declaration(serde_json::json!({"name": "Transit", "description": ""}));
        let report = run_plugin(&plugin, &converter, dataset.clone(), &item).await.unwrap();
        assert_eq!(plugin.0.load(Ordering::SeqCst), 1);
        assert_eq!(report.artifact_count(), 0);

        let err = run_plugin(&Failing, &converter, dataset, &item).await.unwrap_err();
        assert_eq!(err.to_string(), "enriching Transit: lookup table missing");
    }
}
