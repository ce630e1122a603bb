//! Status command implementation

use crate::app::App;
use crate::catalog::CatalogStats;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub config_path: String,
    pub db_path: String,
    pub storage_dir: String,
    pub data_dir: String,
    pub downloads_dir: String,
    pub canonical_crs: String,
    pub owner: Option<String>,
    pub analyses: Vec<String>,
    pub catalog: CatalogStats,
}

/// Get system status
pub async fn cmd_status(app: &App) -> Result<StatusInfo> {
    info!("Getting status");

    let config = &app.config;
    let catalog = app.catalog.stats().await?;

    Ok(StatusInfo {
        config_path: config.paths.config_file.display().to_string(),
        db_path: config.paths.db_file.display().to_string(),
        storage_dir: config.paths.storage_dir.display().to_string(),
        data_dir: config.data_dir.display().to_string(),
        downloads_dir: config.downloads_dir().display().to_string(),
        canonical_crs: config.canonical_crs.clone(),
        owner: config.owner.clone(),
        analyses: app
            .analyses
            .enabled()
            .iter()
            .map(|a| a.db_value().to_string())
            .collect(),
        catalog,
    })
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Print status to console
pub fn print_status(status: &StatusInfo) {
    println!("\n📊 geoingest Status\n");
    println!("Configuration: {}", status.config_path);
    println!("Catalog: {}", status.db_path);
    println!("Storage: {}", status.storage_dir);
    println!("\nData directory: {}", status.data_dir);
    println!("  Downloads: {}", status.downloads_dir);
    println!("\nCanonical CRS: {}", status.canonical_crs);
    println!(
        "Owner: {}",
        status.owner.as_deref().unwrap_or("(not configured)")
    );
    if status.analyses.is_empty() {
        println!("Analyses: none enabled");
    } else {
        println!("Analyses: {}", status.analyses.join(", "));
    }

    let stats = &status.catalog;
    println!("\nCatalog Stats:");
    println!("  Projects: {}", stats.projects);
    println!("  Datasets: {}", stats.datasets);
    println!("  Charts: {}", stats.charts);
    println!("  File items: {}", stats.file_items);
    println!("  Vector data: {}", stats.vector_data);
    println!("  Raster data: {}", stats.raster_data);
    println!("  Jobs: {} ({} running)", stats.jobs, stats.jobs_pending);
    println!("  Stored: {}", format_bytes(stats.stored_bytes));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::test_app;
    use crate::catalog::NewDataset;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[tokio::test]
    async fn test_status_counts_records() {
        let (_tmp, app) = test_app().await;
        app.catalog
            .create_dataset(&NewDataset {
                name: "Parks".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let status = cmd_status(&app).await.unwrap();
        assert_eq!(status.catalog.datasets, 1);
        assert_eq!(status.owner.as_deref(), Some("admin"));
        assert!(status.analyses.is_empty());
    }
}
