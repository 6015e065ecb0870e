pub mod sonar;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::workflow::state::UncoveredFile;

/// Coverage measurements for one project.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageReport {
    /// Overall coverage percentage.
    pub coverage: f64,
    /// Every numeric project measure returned, keyed by metric name.
    pub metrics: BTreeMap<String, f64>,
    pub uncovered_files: Vec<UncoveredFile>,
}

/// Code-quality server that reports coverage.
#[async_trait]
pub trait QualityServer: Send + Sync {
    async fn fetch_coverage(&self, project_key: &str) -> Result<CoverageReport>;
}
