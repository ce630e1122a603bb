//! Built-in plugin that derives `fill` and `stroke` from a property value

use super::{ConversionPlugin, DatasetHandle};
use crate::convert::colors::color_to_hex;
use crate::error::{Error, Result};
use crate::manifest::DatasetItem;
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::info;

/// `style_options` of a dataset declaration
#[derive(Debug, Clone, Deserialize)]
pub struct StyleOptions {
    /// Property whose value selects the palette entries
    pub property: String,
    /// Splits multi-valued properties such as `RED/ORANGE`
    #[serde(default)]
    pub separator: Option<String>,
    /// Property value to color name or hex
    pub palette: BTreeMap<String, String>,
}

impl StyleOptions {
    pub fn from_declaration(declaration: &DatasetItem) -> Result<Self> {
        let raw = declaration.extra.get("style_options").cloned().ok_or_else(|| {
            Error::ExtensionLoad(format!("dataset '{}' has no style_options", declaration.name))
        })?;
        let options: StyleOptions = serde_json::from_value(raw)?;
        if let Some((value, color)) = options
            .palette
            .iter()
            .find(|(_, color)| color_to_hex(color).is_none())
        {
            return Err(Error::Config(format!(
                "style_options palette entry '{}' has unknown color '{}'",
                value, color
            )));
        }
        Ok(options)
    }

    /// Colors for one property value, in the order the parts appear
    fn colors_for(&self, value: &str) -> Vec<String> {
        let parts: Vec<&str> = match &self.separator {
            Some(sep) if !sep.is_empty() => value.split(sep.as_str()).collect(),
            _ => vec![value],
        };
        parts
            .into_iter()
            .filter_map(|part| self.palette.get(part.trim()))
            .filter_map(|color| color_to_hex(color))
            .collect()
    }
}

/// Runs the default conversion, then styles every feature
pub struct PropertyStyles;

impl PropertyStyles {
    pub const IDENTIFIER: &'static str = "property_styles";
}

#[async_trait]
impl ConversionPlugin for PropertyStyles {
    async fn convert(
        &self,
        dataset: &mut DatasetHandle<'_>,
        declaration: &DatasetItem,
    ) -> anyhow::Result<()> {
        let options = StyleOptions::from_declaration(declaration)?;
        dataset.run_default_conversion().await?;

        let mut styled = 0usize;
        for vector in dataset.vector_data().await? {
            let mut collection = dataset
                .read_features(&vector)
                .await
                .with_context(|| format!("reading features of {}", vector.name))?;
            for feature in &mut collection.features {
                let value = match feature.properties.get(&options.property) {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => continue,
                    Some(other) => other.to_string(),
                };
                let colors = options.colors_for(&value);
                let Some(fill) = colors.first().cloned() else {
                    continue;
                };
                let stroke = colors.get(1).cloned().unwrap_or_else(|| fill.clone());
                feature.properties.insert("fill".to_string(), Value::String(fill));
                feature.properties.insert("stroke".to_string(), Value::String(stroke));
                styled += 1;
            }
            dataset
                .rewrite_features(&vector, &collection)
                .await
                .with_context(|| format!("rewriting features of {}", vector.name))?;
        }
        info!(dataset = %dataset.dataset().name, styled, "Applied property styles");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, FileOwner, NewDataset};
    use crate::convert::crs::{WebMercatorReprojector, WGS84};
    use crate::convert::testing::CopyRasterBackend;
    use crate::convert::Converter;
    use crate::extension::run_plugin;
    use crate::extension::tests::declaration;
    use crate::manifest::FileReference;
    use crate::materialize::materialize;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_colors_for_split_values() {
        let options: StyleOptions = serde_json::from_value(json!({
            "property": "LINE",
            "separator": "/",
            "palette": {"RED": "#D31414", "ORANGE": "orange"}
        }))
        .unwrap();
        assert_eq!(options.colors_for("RED/ORANGE"), vec!["#d31414", "#ffa500"]);
        assert_eq!(options.colors_for("SILVER"), Vec::<String>::new());
    }

    #[test]
    fn test_missing_or_bad_options() {
        let item = declaration(json!({"name": "Lines", "description": ""}));
        assert!(StyleOptions::from_declaration(&item).is_err());

        let item = declaration(json!({
            "name": "Lines",
            "description": "",
            "style_options": {"property": "LINE", "palette": {"RED": "reddish"}}
        }));
        assert!(StyleOptions::from_declaration(&item).is_err());
    }

    #[tokio::test]
    async fn test_styles_features_and_inventory() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(&tmp.path().join("db.sqlite"), &tmp.path().join("storage"))
            .await
            .unwrap();
        let (dataset, _) = catalog
            .create_dataset(&NewDataset {
                name: "Lines".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let source = tmp.path().join("lines.geojson");
        let doc = json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "geometry": {"type": "Point", "coordinates": [0.0, 0.0]},
                 "properties": {"LINE": "RED/ORANGE"}},
                {"type": "Feature", "geometry": {"type": "Point", "coordinates": [1.0, 1.0]},
                 "properties": {"LINE": "GREEN"}}
            ]
        });
        std::fs::write(&source, serde_json::to_vec(&doc).unwrap()).unwrap();
        let reference = FileReference {
            name: None,
            path: "lines.geojson".to_string(),
            url: None,
            hash: None,
            metadata: Default::default(),
        };
        materialize(
            &catalog,
            &reference,
            &source,
            0,
            &FileOwner::Dataset(dataset.id.clone()),
            false,
        )
        .await
        .unwrap();

        let converter = Converter::new(
            catalog.clone(),
            Arc::new(CopyRasterBackend::default()),
            Arc::new(WebMercatorReprojector),
            WGS84,
        );
        let item = declaration(json!({
            "name": "Lines",
            "description": "",
            "style_options": {"property": "LINE", "separator": "/",
                              "palette": {"RED": "red", "ORANGE": "orange"}}
        }));
        let report = run_plugin(&PropertyStyles, &converter, dataset.clone(), &item)
            .await
            .unwrap();
        assert_eq!(report.vector_ids.len(), 1);

        let vector = catalog.list_vector_data(&dataset.id).await.unwrap().remove(0);
        let geojson = catalog.read_vector_geojson(&vector).await.unwrap();
        assert_eq!(geojson["features"][0]["properties"]["fill"], json!("#ff0000"));
        assert_eq!(geojson["features"][0]["properties"]["stroke"], json!("#ffa500"));
        assert!(geojson["features"][1]["properties"].get("fill").is_none());

        let metadata = vector.metadata();
        assert_eq!(metadata["properties"]["fill"], json!(["#ff0000"]));
        assert_eq!(metadata["source_filenames"], json!(["lines.geojson"]));
    }
}
