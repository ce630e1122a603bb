//! Default values for configuration

use std::path::PathBuf;

/// Environment variable naming the root directory for manifests and downloads
pub const DATA_DIR_ENV: &str = "GEOINGEST_DATA_DIR";

/// Default data directory (`$GEOINGEST_DATA_DIR`, else `sample_data`)
pub fn default_data_dir() -> PathBuf {
    std::env::var(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("sample_data"))
}

/// Canonical coordinate reference for every vector artifact
pub fn default_canonical_crs() -> String {
    "EPSG:4326".to_string()
}

/// Default user agent
pub fn default_http_user_agent() -> String {
    format!("geoingest/{} (Geospatial Ingestion)", env!("CARGO_PKG_VERSION"))
}

/// Default request timeout in seconds
pub fn default_http_timeout() -> u64 {
    300
}

/// Show download progress bars
pub fn default_http_progress() -> bool {
    true
}

/// Web mercator, the tiling grid of cloud-optimized output
pub fn default_raster_target_crs() -> String {
    "EPSG:3857".to_string()
}

/// Default cloud-optimized raster compression
pub fn default_raster_compression() -> String {
    "DEFLATE".to_string()
}

/// Default cloud-optimized raster block size (pixels)
pub fn default_raster_block_size() -> u32 {
    256
}
