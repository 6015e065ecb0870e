use std::cmp::Ordering;
use std::path::{Component, Path};

use async_trait::async_trait;
use regex::Regex;

use crate::config::AnalysisConfig;
use crate::error::{AppError, Result};
use crate::workflow::state::{CodeLocation, UncoveredFile};

/// Chooses which uncovered files tests are generated for.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn find_uncovered(
        &self,
        local_path: &Path,
        files: &[UncoveredFile],
    ) -> Result<Vec<CodeLocation>>;
}

/// Filters reported files against the clone and ranks them by uncovered lines.
pub struct FileAnalyzer {
    exclude: Vec<Regex>,
    max_targets: usize,
}

impl FileAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let exclude = config
            .exclude_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    AppError::Config(format!("Invalid exclude pattern {pattern:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            exclude,
            max_targets: config.max_targets,
        })
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.exclude.iter().any(|re| re.is_match(path))
    }
}

/// Reject absolute paths and `..` so a reported path cannot leave the clone.
fn is_contained(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[async_trait]
impl Analyzer for FileAnalyzer {
    async fn find_uncovered(
        &self,
        local_path: &Path,
        files: &[UncoveredFile],
    ) -> Result<Vec<CodeLocation>> {
        let mut locations = Vec::new();

        for file in files {
            if !is_contained(&file.path) || self.is_excluded(&file.path) {
                tracing::debug!(path = %file.path, "Skipping excluded file");
                continue;
            }
            let on_disk = tokio::fs::metadata(local_path.join(&file.path))
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            if !on_disk {
                tracing::debug!(path = %file.path, "Skipping file missing from clone");
                continue;
            }
            locations.push(CodeLocation {
                file_path: file.path.clone(),
                language: file.language.clone(),
                coverage: file.coverage,
                uncovered_lines: file.uncovered_lines,
            });
        }

        locations.sort_by(|a, b| match b.uncovered_lines.cmp(&a.uncovered_lines) {
            Ordering::Equal => a.file_path.cmp(&b.file_path),
            other => other,
        });
        locations.truncate(self.max_targets);

        tracing::info!(
            reported = files.len(),
            selected = locations.len(),
            "Selected code locations for test generation"
        );
        Ok(locations)
    }
}
