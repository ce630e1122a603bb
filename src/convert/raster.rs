//! Raster canonicalization
//!
//! The pixel work is delegated to a [`RasterBackend`]. The production backend
//! drives the GDAL command line tools.

use super::crs::Crs;
use crate::config::RasterConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// What opening a raster revealed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RasterProbe {
    /// The source carries a coordinate reference and geotransform
    pub georeferenced: bool,
    pub width: u64,
    pub height: u64,
    pub bands: u64,
    pub crs: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Caller-supplied referencing for rasters that lack their own
#[derive(Debug, Clone, PartialEq)]
pub struct RasterReferencing {
    pub crs: Crs,
    /// GDAL-order geotransform: origin x, pixel width, row rotation,
    /// origin y, column rotation, pixel height
    pub transform: [f64; 6],
}

impl RasterReferencing {
    /// Read `crs` and `transform` from file artifact metadata
    pub fn from_metadata(metadata: &Map<String, Value>) -> Option<Self> {
        let crs = match metadata.get("crs")? {
            Value::String(text) => Crs::parse(text)?,
            Value::Number(code) => Crs::epsg(u32::try_from(code.as_u64()?).ok()?),
            _ => return None,
        };
        let values = metadata.get("transform")?.as_array()?;
        if values.len() != 6 {
            return None;
        }
        let mut transform = [0.0; 6];
        for (slot, value) in transform.iter_mut().zip(values) {
            *slot = value.as_f64()?;
        }
        Some(Self { crs, transform })
    }

    /// Corner bounds `(ulx, uly, lrx, lry)` for a raster of the given size
    pub fn corners(&self, width: u64, height: u64) -> (f64, f64, f64, f64) {
        let [x0, dx, _, y0, _, dy] = self.transform;
        (x0, y0, x0 + dx * width as f64, y0 + dy * height as f64)
    }
}

/// Raster primitives used by the converter
#[async_trait]
pub trait RasterBackend: Send + Sync {
    /// Open a source and report its referencing
    async fn probe(&self, source: &Path) -> Result<RasterProbe>;

    /// Write a referenced single-band float raster from an unreferenced source
    async fn synthesize(
        &self,
        source: &Path,
        probe: &RasterProbe,
        referencing: &RasterReferencing,
        output: &Path,
    ) -> Result<()>;

    /// Reproject, tile and build overviews into a cloud-optimized raster
    async fn to_cloud_optimized(&self, source: &Path, output: &Path) -> Result<()>;
}

/// GDAL command line backend
#[derive(Debug, Clone)]
pub struct GdalRasterBackend {
    bin_dir: Option<PathBuf>,
    target_crs: String,
    compression: String,
    block_size: u32,
}

impl GdalRasterBackend {
    pub fn new(config: &RasterConfig) -> Self {
        Self {
            bin_dir: config.gdal_bin_dir.clone(),
            target_crs: config.target_crs.clone(),
            compression: config.compression.clone(),
            block_size: config.block_size,
        }
    }

    fn tool(&self, name: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    async fn run(&self, name: &str, args: &[String], file: &Path) -> Result<Vec<u8>> {
        debug!(tool = name, ?args, "Running GDAL tool");
        let output = Command::new(self.tool(name))
            .args(args)
            .output()
            .await
            .map_err(|e| Error::conversion(file.display().to_string(), format!("failed to run {}: {}", name, e)))?;
        if !output.status.success() {
            return Err(Error::conversion(
                file.display().to_string(),
                format!("{} failed: {}", name, String::from_utf8_lossy(&output.stderr).trim()),
            ));
        }
        Ok(output.stdout)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Interpret `gdalinfo -json` output
pub fn parse_gdalinfo(info: &Value) -> RasterProbe {
    let wkt = info
        .pointer("/coordinateSystem/wkt")
        .and_then(Value::as_str)
        .filter(|wkt| !wkt.trim().is_empty());
    let has_transform = info.get("geoTransform").and_then(Value::as_array).is_some();
    let size = |index: usize| {
        info.get("size")
            .and_then(|s| s.get(index))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    let metadata = info
        .pointer("/metadata/")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    RasterProbe {
        georeferenced: wkt.is_some() && has_transform,
        width: size(0),
        height: size(1),
        bands: info
            .get("bands")
            .and_then(Value::as_array)
            .map(|b| b.len() as u64)
            .unwrap_or(0),
        crs: wkt.map(|wkt| {
            Crs::parse(wkt)
                .map(|crs| crs.to_string())
                .unwrap_or_else(|| wkt.to_string())
        }),
        metadata,
    }
}

#[async_trait]
impl RasterBackend for GdalRasterBackend {
    async fn probe(&self, source: &Path) -> Result<RasterProbe> {
        let stdout = self
            .run("gdalinfo", &["-json".to_string(), path_arg(source)], source)
            .await?;
        let info: Value = serde_json::from_slice(&stdout)
            .map_err(|e| Error::conversion(source.display().to_string(), e))?;
        Ok(parse_gdalinfo(&info))
    }

    async fn synthesize(
        &self,
        source: &Path,
        probe: &RasterProbe,
        referencing: &RasterReferencing,
        output: &Path,
    ) -> Result<()> {
        let (ulx, uly, lrx, lry) = referencing.corners(probe.width, probe.height);
        let args = vec![
            "-b".to_string(),
            "1".to_string(),
            "-ot".to_string(),
            "Float32".to_string(),
            "-a_srs".to_string(),
            referencing.crs.to_string(),
            "-a_ullr".to_string(),
            ulx.to_string(),
            uly.to_string(),
            lrx.to_string(),
            lry.to_string(),
            path_arg(source),
            path_arg(output),
        ];
        self.run("gdal_translate", &args, source).await?;
        Ok(())
    }

    async fn to_cloud_optimized(&self, source: &Path, output: &Path) -> Result<()> {
        let single_band = output.with_extension("band1.vrt");
        let translate = vec![
            "-b".to_string(),
            "1".to_string(),
            "-of".to_string(),
            "VRT".to_string(),
            path_arg(source),
            path_arg(&single_band),
        ];
        self.run("gdal_translate", &translate, source).await?;

        let warp = vec![
            "-t_srs".to_string(),
            self.target_crs.clone(),
            "-of".to_string(),
            "COG".to_string(),
            "-co".to_string(),
            format!("COMPRESS={}", self.compression),
            "-co".to_string(),
            format!("BLOCKSIZE={}", self.block_size),
            "-overwrite".to_string(),
            path_arg(&single_band),
            path_arg(output),
        ];
        let result = self.run("gdalwarp", &warp, source).await;
        let _ = tokio::fs::remove_file(&single_band).await;
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_referencing_from_metadata() {
        let metadata = json!({
            "crs": "EPSG:4326",
            "transform": [-71.2, 0.01, 0.0, 42.5, 0.0, -0.01]
        });
        let referencing = RasterReferencing::from_metadata(metadata.as_object().unwrap()).unwrap();
        assert_eq!(referencing.crs, crate::convert::crs::WGS84);
        let (ulx, uly, lrx, lry) = referencing.corners(100, 50);
        assert_eq!(ulx, -71.2);
        assert_eq!(uly, 42.5);
        assert!((lrx - -70.2).abs() < 1e-9);
        assert!((lry - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_referencing_requires_six_values() {
        let metadata = json!({"crs": 3857, "transform": [0.0, 1.0]});
        assert!(RasterReferencing::from_metadata(metadata.as_object().unwrap()).is_none());
        let metadata = json!({"transform": [0.0, 1.0, 0.0, 0.0, 0.0, -1.0]});
        assert!(RasterReferencing::from_metadata(metadata.as_object().unwrap()).is_none());
    }

    #[test]
    fn test_parse_gdalinfo_referenced() {
        let info = json!({
            "size": [512, 256],
            "coordinateSystem": {"wkt": "GEOGCRS[\"WGS 84\",ID[\"EPSG\",4326]]"},
            "geoTransform": [0.0, 1.0, 0.0, 0.0, 0.0, -1.0],
            "bands": [{"band": 1}, {"band": 2}]
        });
        let probe = parse_gdalinfo(&info);
        assert!(probe.georeferenced);
        assert_eq!((probe.width, probe.height, probe.bands), (512, 256, 2));
    }

    #[test]
    fn test_parse_gdalinfo_unreferenced() {
        let info = json!({"size": [10, 10], "coordinateSystem": {"wkt": ""}, "bands": [{}]});
        let probe = parse_gdalinfo(&info);
        assert!(!probe.georeferenced);
        assert_eq!(probe.crs, None);
    }
}
