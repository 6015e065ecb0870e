use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::config::SonarConfig;
use crate::error::{AppError, Result};
use crate::quality::{CoverageReport, QualityServer};
use crate::workflow::state::UncoveredFile;

const PROJECT_METRICS: &str =
    "coverage,line_coverage,branch_coverage,lines_to_cover,uncovered_lines";
const FILE_METRICS: &str = "coverage,uncovered_lines";
const PAGE_SIZE: &str = "100";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// SonarQube Web API client.
pub struct SonarClient {
    client: Client,
    base_url: String,
    token: String,
}

impl SonarClient {
    pub fn new(config: &SonarConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(AppError::Config("sonar.url is required".to_string()));
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            // SonarQube takes the token as the basic-auth user name
            .basic_auth(&self.token, Some(""))
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::from_status("SonarQube", status.as_u16(), &body));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl QualityServer for SonarClient {
    async fn fetch_coverage(&self, project_key: &str) -> Result<CoverageReport> {
        let measures: MeasuresResponse = self
            .get(
                "/api/measures/component",
                &[("component", project_key), ("metricKeys", PROJECT_METRICS)],
            )
            .await?;
        let (coverage, metrics) = parse_measures(project_key, measures)?;

        let tree = self
            .get::<TreeResponse>(
                "/api/measures/component_tree",
                &[
                    ("component", project_key),
                    ("metricKeys", FILE_METRICS),
                    ("qualifiers", "FIL"),
                    ("ps", PAGE_SIZE),
                ],
            )
            .await;
        let uncovered_files = match tree {
            Ok(tree) => parse_component_tree(tree),
            Err(e) => {
                tracing::warn!(
                    project_key = %project_key,
                    error = %e,
                    "Failed to fetch per-file coverage, continuing without it"
                );
                Vec::new()
            }
        };

        tracing::info!(
            project_key = %project_key,
            coverage = coverage,
            uncovered_files = uncovered_files.len(),
            "Fetched coverage"
        );

        Ok(CoverageReport {
            coverage,
            metrics,
            uncovered_files,
        })
    }
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
struct MeasuresResponse {
    component: MeasuredComponent,
}

#[derive(Debug, Deserialize)]
struct MeasuredComponent {
    #[serde(default)]
    measures: Vec<Measure>,
}

#[derive(Debug, Deserialize)]
struct Measure {
    metric: String,
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    #[serde(default)]
    components: Vec<TreeComponent>,
}

#[derive(Debug, Deserialize)]
struct TreeComponent {
    path: Option<String>,
    language: Option<String>,
    #[serde(default)]
    measures: Vec<Measure>,
}

fn numeric_measures(measures: Vec<Measure>) -> BTreeMap<String, f64> {
    measures
        .into_iter()
        .filter_map(|m| {
            let value = m.value?.parse::<f64>().ok()?;
            Some((m.metric, value))
        })
        .collect()
}

fn parse_measures(
    project_key: &str,
    response: MeasuresResponse,
) -> Result<(f64, BTreeMap<String, f64>)> {
    let metrics = numeric_measures(response.component.measures);
    let coverage = metrics.get("coverage").copied().ok_or_else(|| {
        AppError::QualityServer(format!(
            "Project {project_key} has no coverage measure; \
             has an analysis with coverage been uploaded?"
        ))
    })?;
    Ok((coverage, metrics))
}

fn parse_component_tree(response: TreeResponse) -> Vec<UncoveredFile> {
    response
        .components
        .into_iter()
        .filter_map(|component| {
            let path = component.path?;
            let metrics = numeric_measures(component.measures);
            let coverage = metrics.get("coverage").copied().unwrap_or(100.0);
            if coverage >= 100.0 {
                return None;
            }
            let language = component
                .language
                .as_deref()
                .map(normalize_language)
                .unwrap_or_else(|| infer_language(&path))
                .to_string();
            Some(UncoveredFile {
                coverage,
                uncovered_lines: metrics.get("uncovered_lines").copied().unwrap_or(0.0) as u64,
                language,
                path,
            })
        })
        .collect()
}

/// Map a SonarQube language key to the name used throughout the crate.
fn normalize_language(key: &str) -> &str {
    match key {
        "py" => "python",
        "js" => "javascript",
        "ts" => "typescript",
        "cs" => "csharp",
        "kotlin" | "kt" => "kotlin",
        "rs" => "rust",
        other => other,
    }
}

/// Infer a language name from a file extension.
pub fn infer_language(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "py" => "python",
        "js" | "jsx" | "mjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "java" => "java",
        "cs" => "csharp",
        "cpp" | "cc" | "cxx" => "cpp",
        "c" | "h" => "c",
        "go" => "go",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "kt" => "kotlin",
        "scala" => "scala",
        "rs" => "rust",
        "m" => "objective-c",
        "dart" => "dart",
        "pl" => "perl",
        "sh" => "shell",
        _ => "unknown",
    }
}
