//! GeoJSON features, collections and the attribute inventory

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub type Position = Vec<f64>;

/// GeoJSON geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: Position },
    MultiPoint { coordinates: Vec<Position> },
    LineString { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    GeometryCollection { geometries: Vec<Geometry> },
}

impl Geometry {
    /// Apply `f` to every position
    pub fn try_for_each_position<F>(&mut self, f: &mut F) -> Result<()>
    where
        F: FnMut(&mut [f64]) -> Result<()>,
    {
        match self {
            Geometry::Point { coordinates } => f(coordinates),
            Geometry::MultiPoint { coordinates } | Geometry::LineString { coordinates } => {
                coordinates.iter_mut().try_for_each(|p| f(p))
            }
            Geometry::MultiLineString { coordinates } | Geometry::Polygon { coordinates } => {
                coordinates.iter_mut().flatten().try_for_each(|p| f(p))
            }
            Geometry::MultiPolygon { coordinates } => coordinates
                .iter_mut()
                .flatten()
                .flatten()
                .try_for_each(|p| f(p)),
            Geometry::GeometryCollection { geometries } => geometries
                .iter_mut()
                .try_for_each(|g| g.try_for_each_position(f)),
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A GeoJSON feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default = "feature_type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub geometry: Option<Geometry>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub properties: Map<String, Value>,
}

fn feature_type() -> String {
    "Feature".to_string()
}

impl Feature {
    pub fn new(geometry: Option<Geometry>, properties: Map<String, Value>) -> Self {
        Self {
            kind: feature_type(),
            id: None,
            geometry,
            properties,
        }
    }
}

/// An ordered list of features
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureCollection {
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Parse GeoJSON text. Returns the features and the `crs.properties.name`
    /// member if the document declares one.
    pub fn from_geojson_slice(bytes: &[u8]) -> Result<(Self, Option<String>)> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_geojson_value(value)
    }

    pub fn from_geojson_value(value: Value) -> Result<(Self, Option<String>)> {
        let crs = value
            .pointer("/crs/properties/name")
            .and_then(Value::as_str)
            .map(str::to_string);

        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        let features = match kind {
            "FeatureCollection" => match value.get("features") {
                Some(Value::Array(items)) => items
                    .iter()
                    .cloned()
                    .map(serde_json::from_value)
                    .collect::<std::result::Result<Vec<Feature>, _>>()?,
                Some(Value::Null) | None => Vec::new(),
                Some(_) => {
                    return Err(Error::Other(
                        "FeatureCollection.features is not an array".to_string(),
                    ))
                }
            },
            "Feature" => vec![serde_json::from_value(value)?],
            "" => return Err(Error::Other("GeoJSON document has no type".to_string())),
            _ => {
                let geometry: Geometry = serde_json::from_value(value)?;
                vec![Feature::new(Some(geometry), Map::new())]
            }
        };
        Ok((Self { features }, crs))
    }

    pub fn to_geojson(&self) -> Result<Value> {
        Ok(json!({
            "type": "FeatureCollection",
            "features": serde_json::to_value(&self.features)?,
        }))
    }

    pub fn extend(&mut self, other: FeatureCollection) {
        self.features.extend(other.features);
    }

    pub fn inventory(&self) -> AttributeInventory {
        AttributeInventory::from_features(&self.features)
    }
}

/// Distinct observed values per property name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeInventory {
    values: BTreeMap<String, BTreeMap<String, Value>>,
}

impl AttributeInventory {
    pub fn from_features(features: &[Feature]) -> Self {
        let mut inventory = Self::default();
        for feature in features {
            for (name, value) in &feature.properties {
                inventory.observe(name, value);
            }
        }
        inventory
    }

    pub fn observe(&mut self, name: &str, value: &Value) {
        self.values
            .entry(name.to_string())
            .or_default()
            .entry(value.to_string())
            .or_insert_with(|| value.clone());
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn values(&self, name: &str) -> Vec<&Value> {
        self.values
            .get(name)
            .map(|v| v.values().collect())
            .unwrap_or_default()
    }

    /// JSON object `{name: [values...]}`
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(name, values)| {
                    (
                        name.clone(),
                        Value::Array(values.values().cloned().collect()),
                    )
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(props: Value) -> Feature {
        Feature::new(
            Some(Geometry::Point {
                coordinates: vec![0.0, 0.0],
            }),
            props.as_object().cloned().unwrap_or_default(),
        )
    }

    #[test]
    fn test_inventory_is_deduplicated_and_order_independent() {
        let forward = vec![
            feature(json!({"color": "red"})),
            feature(json!({"color": "blue"})),
            feature(json!({"color": "red"})),
        ];
        let mut backward = forward.clone();
        backward.reverse();

        let a = AttributeInventory::from_features(&forward);
        let b = AttributeInventory::from_features(&backward);
        assert_eq!(a, b);
        assert_eq!(a.values("color").len(), 2);
        assert!(a.values("color").contains(&&json!("red")));
        assert!(a.values("color").contains(&&json!("blue")));
    }

    #[test]
    fn test_parse_collection_with_crs() {
        let doc = json!({
            "type": "FeatureCollection",
            "crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG::3857"}},
            "features": [
                {"type": "Feature", "geometry": {"type": "LineString", "coordinates": [[0, 0], [1, 1]]},
                 "properties": null}
            ]
        });
        let (collection, crs) = FeatureCollection::from_geojson_value(doc).unwrap();
        assert_eq!(crs.as_deref(), Some("urn:ogc:def:crs:EPSG::3857"));
        assert_eq!(collection.len(), 1);
        assert!(collection.features[0].properties.is_empty());
    }

    #[test]
    fn test_bare_geometry_becomes_feature() {
        let (collection, crs) = FeatureCollection::from_geojson_value(
            json!({"type": "Point", "coordinates": [3.0, 4.0]}),
        )
        .unwrap();
        assert!(crs.is_none());
        assert_eq!(
            collection.features[0].geometry,
            Some(Geometry::Point {
                coordinates: vec![3.0, 4.0]
            })
        );
    }

    #[test]
    fn test_to_geojson_shape() {
        let collection = FeatureCollection::new(vec![feature(json!({"a": 1}))]);
        let value = collection.to_geojson().unwrap();
        assert_eq!(value["type"], "FeatureCollection");
        assert_eq!(value["features"][0]["type"], "Feature");
        assert_eq!(value["features"][0]["properties"]["a"], 1);
    }

    #[test]
    fn test_for_each_position_visits_all() {
        let mut geometry = Geometry::MultiPolygon {
            coordinates: vec![vec![vec![vec![1.0, 1.0], vec![2.0, 2.0]]]],
        };
        geometry
            .try_for_each_position(&mut |p| {
                p[0] *= 10.0;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            geometry,
            Geometry::MultiPolygon {
                coordinates: vec![vec![vec![vec![10.0, 1.0], vec![20.0, 2.0]]]]
            }
        );
    }
}
