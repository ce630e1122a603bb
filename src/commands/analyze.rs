//! Analysis commands: list analysis types and start analysis jobs

use crate::analytics::{run_analysis, AnalysisSummary};
use crate::app::App;
use crate::error::{Error, Result};
use crate::jobs::{Dispatched, Submission};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

/// List the enabled analysis types
pub fn cmd_list_analyses(app: &App) -> Vec<AnalysisSummary> {
    app.analyses
        .enabled()
        .iter()
        .map(|analysis| AnalysisSummary::of(analysis.as_ref()))
        .collect()
}

/// Parse a `key=value` input. Values that parse as JSON (numbers, booleans,
/// quoted strings, arrays) are kept typed; anything else is a string.
pub fn parse_input(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| Error::Config(format!("input '{}' must look like key=value", raw)))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::Config(format!("input '{}' has an empty key", raw)));
    }
    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| Value::String(value.trim().to_string()));
    Ok((key.to_string(), value))
}

/// Outcome of `analyze`
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeResult {
    pub job_id: String,
    pub detached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<super::JobInfo>,
}

/// Start an analysis for a project.
///
/// With `detach` the job id is returned as soon as the record exists and the
/// work keeps running until the caller drains the queue.
pub async fn cmd_analyze(
    app: &App,
    project: &str,
    analysis: &str,
    inputs: &[String],
    detach: bool,
) -> Result<AnalyzeResult> {
    let project = app
        .catalog
        .get_project_by_name(project)
        .await?
        .ok_or_else(|| Error::NotFound(format!("project '{}'", project)))?;

    let inputs = inputs
        .iter()
        .map(|raw| parse_input(raw))
        .collect::<Result<Map<String, Value>>>()?;

    let mode = if detach {
        Submission::Detached
    } else {
        Submission::Wait
    };
    info!(project = %project.name, analysis, detach, "Starting analysis");

    let dispatched = run_analysis(
        &app.analyses,
        &app.tracker,
        &app.queue,
        &project,
        analysis,
        inputs,
        mode,
    )
    .await?;

    Ok(match dispatched {
        Dispatched::Finished(record) => AnalyzeResult {
            job_id: record.id.clone(),
            detached: false,
            job: Some(record.into()),
        },
        Dispatched::Queued { job_id } => AnalyzeResult {
            job_id,
            detached: true,
            job: None,
        },
    })
}

/// Print analysis types to console
pub fn print_analyses(analyses: &[AnalysisSummary]) {
    println!("\n🌊 Analysis Types\n");

    if analyses.is_empty() {
        println!("No analyses enabled. Configure [analytics] in config.toml.");
        return;
    }

    for analysis in analyses {
        println!("• {} ({})", analysis.name, analysis.db_value);
        println!("    {}", analysis.description);
        if !analysis.attribution.is_empty() {
            println!("    Attribution: {}", analysis.attribution);
        }
        let inputs: Vec<String> = analysis
            .inputs
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v.as_str().unwrap_or_default()))
            .collect();
        println!("    Inputs: {}", inputs.join(", "));
    }
}

/// Print an analyze result to console
pub fn print_analyze_result(result: &AnalyzeResult) {
    match &result.job {
        Some(job) => super::print_job(job),
        None => {
            println!("✓ Analysis queued as job {}", result.job_id);
            println!("  Poll it with: geoingest job {}", result.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::AnalysisType;
    use crate::app::testing::test_app;
    use crate::catalog::NewProject;
    use crate::jobs::JobContext;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct Echo;

    #[async_trait]
    impl AnalysisType for Echo {
        fn name(&self) -> &str {
            "Echo"
        }
        fn db_value(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Copies its inputs to its outputs"
        }
        fn input_types(&self) -> Vec<(&'static str, &'static str)> {
            vec![("value", "number")]
        }
        fn output_types(&self) -> Vec<(&'static str, &'static str)> {
            vec![("value", "number")]
        }
        fn is_enabled(&self) -> bool {
            true
        }
        async fn execute(&self, job: JobContext) -> Result<()> {
            let inputs = job.inputs().await?;
            job.write_output("value", inputs["value"].clone()).await
        }
    }

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("zoom=4").unwrap(), ("zoom".to_string(), json!(4)));
        assert_eq!(
            parse_input("period = spring").unwrap(),
            ("period".to_string(), json!("spring"))
        );
        assert_eq!(parse_input("hydrograph=\"7\"").unwrap().1, json!("7"));
        assert!(parse_input("novalue").is_err());
        assert!(parse_input("=3").is_err());
    }

    #[tokio::test]
    async fn test_analyze_wait_and_detach() {
        let (_tmp, mut app) = test_app().await;
        app.analyses.register(Arc::new(Echo));
        app.catalog
            .create_project(&NewProject {
                name: "Harbor".to_string(),
                default_map_center: [0.0, 0.0],
                default_map_zoom: 4.0,
            })
            .await
            .unwrap();

        assert_eq!(cmd_list_analyses(&app).len(), 1);

        let waited = cmd_analyze(&app, "Harbor", "echo", &["value=3".to_string()], false)
            .await
            .unwrap();
        let job = waited.job.unwrap();
        assert!(job.completed);
        assert_eq!(job.outputs["value"], json!(3));

        let detached = cmd_analyze(&app, "Harbor", "echo", &["value=5".to_string()], true)
            .await
            .unwrap();
        assert!(detached.detached);
        app.queue.drain().await;
        let job = app.tracker.get(&detached.job_id).await.unwrap().unwrap();
        assert!(job.completed);
        assert_eq!(job.outputs()["value"], json!(5));

        assert!(matches!(
            cmd_analyze(&app, "Nowhere", "echo", &[], false).await,
            Err(Error::NotFound(_))
        ));
    }
}
