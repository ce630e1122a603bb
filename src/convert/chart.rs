//! Tabular chart data conversion

use super::colors::color_to_hex;
use crate::error::{Error, Result};
use crate::manifest::ChartConversionOptions;
use csv::ReaderBuilder;
use serde_json::{json, Number, Value};
use std::path::Path;

const MISSING_VALUE: i64 = -1;
const DEFAULT_COLOR: &str = "black";

/// How the cells of one column are emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    /// Every cell present and integral
    Integer,
    /// Numeric with a fractional or missing cell; every value is a float
    Float,
    Text,
}

fn column_kind(cells: &[String]) -> ColumnKind {
    let present: Vec<&str> = cells
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect();
    if present.is_empty() || present.iter().any(|c| c.parse::<f64>().is_err()) {
        return ColumnKind::Text;
    }
    if present.len() == cells.len() && present.iter().all(|c| c.parse::<i64>().is_ok()) {
        ColumnKind::Integer
    } else {
        ColumnKind::Float
    }
}

fn column_values(cells: &[String]) -> Vec<Value> {
    let kind = column_kind(cells);
    cells
        .iter()
        .map(|cell| {
            let cell = cell.trim();
            match kind {
                ColumnKind::Integer => cell
                    .parse::<i64>()
                    .map(Value::from)
                    .unwrap_or_else(|_| Value::from(MISSING_VALUE)),
                // NaN and infinities have no JSON form
                ColumnKind::Float => cell
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::from(MISSING_VALUE as f64)),
                ColumnKind::Text if cell.is_empty() => Value::from(MISSING_VALUE),
                ColumnKind::Text => Value::String(cell.to_string()),
            }
        })
        .collect()
}

/// Build `{labels, datasets}` chart data from a CSV file
pub fn convert_csv_chart(path: &Path, options: &ChartConversionOptions) -> Result<Value> {
    let file = path.display().to_string();
    let mut reader = ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| Error::conversion(&file, format!("column '{}' not found", name)))
    };

    let label_index = column(&options.labels)?;
    let series_indices = options
        .datasets
        .iter()
        .map(|name| column(name))
        .collect::<Result<Vec<_>>>()?;

    let mut labels = Vec::new();
    let mut series: Vec<Vec<String>> = vec![Vec::new(); series_indices.len()];
    for record in reader.records() {
        let record = record?;
        let cell = |index: usize| record.get(index).unwrap_or("").to_string();
        labels.push(cell(label_index));
        for (data, &index) in series.iter_mut().zip(&series_indices) {
            data.push(cell(index));
        }
    }
    let labels = column_values(&labels);

    let datasets = options
        .datasets
        .iter()
        .zip(series)
        .map(|(name, data)| {
            let color_name = options
                .palette
                .get(name)
                .map(String::as_str)
                .unwrap_or(DEFAULT_COLOR);
            let color = color_to_hex(color_name)
                .ok_or_else(|| Error::conversion(&file, format!("unknown color '{}'", color_name)))?;
            Ok(json!({
                "label": name,
                "backgroundColor": color,
                "borderColor": color,
                "data": column_values(&data),
            }))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(json!({ "labels": labels, "datasets": datasets }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn options(palette: &[(&str, &str)]) -> ChartConversionOptions {
        ChartConversionOptions {
            labels: "date".to_string(),
            datasets: vec!["cases".to_string()],
            palette: palette
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_labels_and_series() {
        let tmp = TempDir::new().unwrap();
        let csv = tmp.path().join("cases.csv");
        std::fs::write(&csv, "date,cases,deaths\n2020-03-01,4,0\n2020-03-02,,1\n2020-03-03,7.5,1\n").unwrap();

        let data = convert_csv_chart(&csv, &options(&[("cases", "red")])).unwrap();
        assert_eq!(data["labels"], json!(["2020-03-01", "2020-03-02", "2020-03-03"]));
        let series = data["datasets"].as_array().unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0]["label"], json!("cases"));
        assert_eq!(series[0]["backgroundColor"], json!("#ff0000"));
        assert_eq!(series[0]["borderColor"], json!("#ff0000"));
        assert_eq!(series[0]["data"], json!([4.0, -1.0, 7.5]));
    }

    #[test]
    fn test_column_kinds() {
        let cells = |values: &[&str]| values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
        assert_eq!(column_values(&cells(&["1", "2"])), vec![json!(1), json!(2)]);
        assert_eq!(column_values(&cells(&["3", ""])), vec![json!(3.0), json!(-1.0)]);
        assert_eq!(column_values(&cells(&["a", ""])), vec![json!("a"), json!(-1)]);
        assert_eq!(column_values(&cells(&["1", "x"])), vec![json!("1"), json!("x")]);
    }

    #[test]
    fn test_default_color_is_black() {
        let tmp = TempDir::new().unwrap();
        let csv = tmp.path().join("cases.csv");
        std::fs::write(&csv, "date,cases\n1,2\n").unwrap();
        let data = convert_csv_chart(&csv, &options(&[])).unwrap();
        assert_eq!(data["datasets"][0]["backgroundColor"], json!("#000000"));
    }

    #[test]
    fn test_unknown_column_and_color() {
        let tmp = TempDir::new().unwrap();
        let csv = tmp.path().join("cases.csv");
        std::fs::write(&csv, "day,cases\n1,2\n").unwrap();
        assert!(convert_csv_chart(&csv, &options(&[])).is_err());

        std::fs::write(&csv, "date,cases\n1,2\n").unwrap();
        let err = convert_csv_chart(&csv, &options(&[("cases", "blurple")])).unwrap_err();
        assert!(err.to_string().contains("blurple"));
    }
}
