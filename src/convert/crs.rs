//! Coordinate reference parsing and reprojection
//!
//! Only EPSG-coded references are modelled. Reprojection goes through the
//! [`Reprojector`] trait so a full transformation library can be swapped in.

use super::vector::FeatureCollection;
use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

const EARTH_RADIUS: f64 = 6_378_137.0;
const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Crs {
    epsg: u32,
}

pub const WGS84: Crs = Crs { epsg: 4326 };
pub const WEB_MERCATOR: Crs = Crs { epsg: 3857 };

fn authority_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"AUTHORITY\s*\[\s*"EPSG"\s*,\s*"?(\d+)"?\s*\]"#).ok())
        .as_ref()
}

fn epsg_code_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:urn:ogc:def:crs:)?epsg:(?:[\d.]*:)?(\d+)$|^https?://www\.opengis\.net/def/crs/EPSG/[\d.]+/(\d+)$")
            .ok()
    })
    .as_ref()
}

impl Crs {
    pub fn epsg(code: u32) -> Self {
        Self { epsg: code }
    }

    pub fn code(&self) -> u32 {
        self.epsg
    }

    /// Parse an EPSG code, URN, URL, CRS84 alias or WKT string
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        if let Ok(code) = text.parse::<u32>() {
            return Some(Self::epsg(code));
        }

        let upper = text.to_ascii_uppercase();
        if upper.ends_with("CRS84") {
            return Some(WGS84);
        }

        if let Some(caps) = epsg_code_regex().and_then(|re| re.captures(text)) {
            return caps
                .get(1)
                .or_else(|| caps.get(2))
                .and_then(|m| m.as_str().parse().ok())
                .map(Self::epsg);
        }

        if upper.starts_with("GEOGCS[")
            || upper.starts_with("PROJCS[")
            || upper.starts_with("GEOGCRS[")
            || upper.starts_with("PROJCRS[")
        {
            return Self::parse_wkt(text, &upper);
        }
        None
    }

    fn parse_wkt(text: &str, upper: &str) -> Option<Self> {
        // The outermost authority is the last one in the string
        if let Some(caps) = authority_regex().and_then(|re| re.captures_iter(text).last()) {
            return caps.get(1).and_then(|m| m.as_str().parse().ok()).map(Self::epsg);
        }

        let mercator = ["WEB_MERCATOR", "PSEUDO-MERCATOR", "POPULAR VISUALISATION"];
        if upper.starts_with("PROJCS[") || upper.starts_with("PROJCRS[") {
            return mercator
                .iter()
                .any(|name| upper.contains(name))
                .then_some(WEB_MERCATOR);
        }

        let wgs84 = ["WGS_1984", "WGS 84", "WGS84"];
        wgs84
            .iter()
            .any(|name| upper.contains(name))
            .then_some(WGS84)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg)
    }
}

/// Coordinate transformation between references
pub trait Reprojector: Send + Sync {
    /// Transform one position (x, y, and optional trailing ordinates) in place
    fn reproject(&self, from: Crs, to: Crs, position: &mut [f64]) -> Result<()>;

    fn supports(&self, from: Crs, to: Crs) -> bool;
}

/// Spherical web mercator <-> WGS84 transformation
#[derive(Debug, Clone, Copy, Default)]
pub struct WebMercatorReprojector;

impl Reprojector for WebMercatorReprojector {
    fn reproject(&self, from: Crs, to: Crs, position: &mut [f64]) -> Result<()> {
        if from == to {
            return Ok(());
        }
        if position.len() < 2 {
            return Err(Error::Other("position has fewer than two ordinates".to_string()));
        }
        match (from, to) {
            (WGS84, WEB_MERCATOR) => {
                let lat = position[1].clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
                position[0] = EARTH_RADIUS * position[0].to_radians();
                position[1] = EARTH_RADIUS
                    * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0)
                        .tan()
                        .ln();
                Ok(())
            }
            (WEB_MERCATOR, WGS84) => {
                position[0] = (position[0] / EARTH_RADIUS).to_degrees();
                position[1] = (2.0 * (position[1] / EARTH_RADIUS).exp().atan()
                    - std::f64::consts::FRAC_PI_2)
                    .to_degrees();
                Ok(())
            }
            _ => Err(Error::Other(format!(
                "no transformation from {} to {}",
                from, to
            ))),
        }
    }

    fn supports(&self, from: Crs, to: Crs) -> bool {
        from == to || matches!((from, to), (WGS84, WEB_MERCATOR) | (WEB_MERCATOR, WGS84))
    }
}

/// Reproject every geometry of a collection
pub fn reproject_collection(
    collection: &mut FeatureCollection,
    from: Crs,
    to: Crs,
    reprojector: &dyn Reprojector,
) -> Result<()> {
    if from == to {
        return Ok(());
    }
    if !reprojector.supports(from, to) {
        return Err(Error::Other(format!(
            "no transformation from {} to {}",
            from, to
        )));
    }
    for feature in &mut collection.features {
        if let Some(geometry) = feature.geometry.as_mut() {
            geometry.try_for_each_position(&mut |p| reprojector.reproject(from, to, p))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::vector::{Feature, Geometry};
    use serde_json::Map;

    #[test]
    fn test_parse_codes_and_urns() {
        assert_eq!(Crs::parse("EPSG:4326"), Some(WGS84));
        assert_eq!(Crs::parse("epsg:3857"), Some(WEB_MERCATOR));
        assert_eq!(Crs::parse("4326"), Some(WGS84));
        assert_eq!(Crs::parse("urn:ogc:def:crs:EPSG::3857"), Some(WEB_MERCATOR));
        assert_eq!(Crs::parse("urn:ogc:def:crs:EPSG:6.6:26986"), Some(Crs::epsg(26986)));
        assert_eq!(Crs::parse("urn:ogc:def:crs:OGC:1.3:CRS84"), Some(WGS84));
        assert_eq!(
            Crs::parse("http://www.opengis.net/def/crs/EPSG/0/3857"),
            Some(WEB_MERCATOR)
        );
        assert_eq!(Crs::parse("nonsense"), None);
    }

    #[test]
    fn test_parse_wkt() {
        let esri_geographic = r#"GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]]"#;
        assert_eq!(Crs::parse(esri_geographic), Some(WGS84));

        let with_authority = r#"PROJCS["NAD83 / Massachusetts Mainland",GEOGCS["NAD83",AUTHORITY["EPSG","4269"]],AUTHORITY["EPSG","26986"]]"#;
        assert_eq!(Crs::parse(with_authority), Some(Crs::epsg(26986)));

        let esri_mercator = r#"PROJCS["WGS_1984_Web_Mercator_Auxiliary_Sphere",GEOGCS["GCS_WGS_1984"]]"#;
        assert_eq!(Crs::parse(esri_mercator), Some(WEB_MERCATOR));
    }

    #[test]
    fn test_mercator_round_trip() {
        let r = WebMercatorReprojector;
        let mut p = vec![-71.06, 42.36];
        r.reproject(WGS84, WEB_MERCATOR, &mut p).unwrap();
        assert!((p[0] - -7_910_363.0).abs() < 1.0);
        r.reproject(WEB_MERCATOR, WGS84, &mut p).unwrap();
        assert!((p[0] - -71.06).abs() < 1e-9);
        assert!((p[1] - 42.36).abs() < 1e-9);
    }

    #[test]
    fn test_unsupported_pair() {
        let mut collection = FeatureCollection::new(vec![Feature::new(
            Some(Geometry::Point {
                coordinates: vec![1.0, 2.0],
            }),
            Map::new(),
        )]);
        let err = reproject_collection(
            &mut collection,
            Crs::epsg(26986),
            WGS84,
            &WebMercatorReprojector,
        );
        assert!(err.is_err());
    }
}
