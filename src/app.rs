//! Service wiring shared by the CLI commands

use crate::analytics::AnalysisRegistry;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::convert::Converter;
use crate::error::Result;
use crate::extension::PluginRegistry;
use crate::fetch::ContentStore;
use crate::jobs::{JobTracker, TaskQueue};
use tracing::debug;

/// Everything a command needs to touch the catalog and run jobs
#[derive(Clone)]
pub struct App {
    pub config: Config,
    pub catalog: Catalog,
    pub store: ContentStore,
    pub converter: Converter,
    pub plugins: PluginRegistry,
    pub tracker: JobTracker,
    pub queue: TaskQueue,
    pub analyses: AnalysisRegistry,
}

impl App {
    /// Open the catalog and build the production services
    pub async fn open(config: Config) -> Result<Self> {
        let catalog = Catalog::connect(&config).await?;
        let converter = Converter::from_config(catalog.clone(), &config)?;
        Self::with_converter(config, catalog, converter)
    }

    /// Build the services around an existing catalog and converter
    pub fn with_converter(config: Config, catalog: Catalog, converter: Converter) -> Result<Self> {
        let store = ContentStore::from_config(&config)?;
        let analyses = AnalysisRegistry::from_config(&config, converter.clone());
        debug!(
            cache = %store.cache_root().display(),
            analyses = analyses.enabled().len(),
            "Services ready"
        );

        Ok(Self {
            tracker: JobTracker::new(catalog.clone()),
            plugins: PluginRegistry::with_builtins(),
            queue: TaskQueue::new(),
            config,
            catalog,
            store,
            converter,
            analyses,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::test_app;

    #[tokio::test]
    async fn test_app_wires_builtin_plugins() {
        let (_tmp, app) = test_app().await;
        assert_eq!(app.plugins.identifiers(), vec!["property_styles"]);
        assert!(app.analyses.get("flood_simulation").is_some());
        assert_eq!(app.queue.pending(), 0);
    }
}
