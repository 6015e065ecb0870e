use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{AppError, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub sonar: SonarConfig,
    pub github: GitHubConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub test_generation: TestGenerationConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,
    #[serde(default)]
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_concurrent_workflows: default_max_concurrent_workflows(),
            enable_cors: false,
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct SonarConfig {
    pub url: String,
    pub token: String,
}

// Manual Debug impl to avoid leaking the token
impl std::fmt::Debug for SonarConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SonarConfig")
            .field("url", &self.url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Deserialize, Clone)]
pub struct GitHubConfig {
    pub token: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Override for GitHub Enterprise installations.
    #[serde(default)]
    pub api_url: Option<String>,
}

impl std::fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("token", &"[REDACTED]")
            .field("base_branch", &self.base_branch)
            .field("branch_prefix", &self.branch_prefix)
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// Completion API used for test generation.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Anthropic,
    OpenAi,
}

impl LlmProvider {
    fn default_model(self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "claude-sonnet-4-20250514",
            LlmProvider::OpenAi => "gpt-4o",
        }
    }

    fn default_api_url(self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "https://api.anthropic.com/v1/messages",
            LlmProvider::OpenAi => "https://api.openai.com/v1/chat/completions",
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    pub api_key: String,
    /// Defaults to the provider's model when unset.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Defaults to the provider's public endpoint when unset.
    #[serde(default)]
    pub api_url: Option<String>,
}

impl LlmConfig {
    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.provider.default_model())
    }

    pub fn api_url(&self) -> &str {
        self.api_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_api_url())
    }
}

// Manual Debug impl to avoid leaking the API key
impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model())
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("api_url", &self.api_url())
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_dir")]
    pub base_dir: PathBuf,
    /// Leave cloned workspaces on disk after a workflow finishes.
    #[serde(default)]
    pub keep_workspaces: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: default_workspace_dir(),
            keep_workspaces: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    /// Regular expressions matched against repository-relative paths.
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
    #[serde(default = "default_max_targets")]
    pub max_targets: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: default_exclude_patterns(),
            max_targets: default_max_targets(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TestGenerationConfig {
    #[serde(default = "default_framework")]
    pub framework: String,
    #[serde(default = "default_test_directory")]
    pub test_directory: String,
}

impl Default for TestGenerationConfig {
    fn default() -> Self {
        Self {
            framework: default_framework(),
            test_directory: default_test_directory(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PersistenceConfig {
    /// Directory for workflow snapshots. Durability is off when unset.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_concurrent_workflows() -> usize {
    4
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_branch_prefix() -> String {
    "coverage-improvement".to_string()
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_temperature() -> f32 {
    0.2
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("/tmp/coverbot-workspaces")
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_attempt_timeout_secs() -> u64 {
    600
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        r"(^|/)tests?/".to_string(),
        r"(^|/)test_[^/]*$".to_string(),
        r"(^|/)__pycache__/".to_string(),
        r"(^|/)venv/".to_string(),
        r"(^|/)node_modules/".to_string(),
    ]
}

fn default_max_targets() -> usize {
    10
}

fn default_framework() -> String {
    "pytest".to_string()
}

fn default_test_directory() -> String {
    "tests".to_string()
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Load from file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            builder = builder.add_source(config::File::with_name("coverbot").required(false));
        }

        // Environment variable overrides with COVERBOT_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("COVERBOT")
                .separator("__")
                .try_parsing(true),
        );

        Self::build(builder)
    }

    /// Parse a TOML document without consulting files or the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml));
        Self::build(builder)
    }

    fn build(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let config: Self = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        // NaN fails every comparison, so test for the valid range
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(AppError::Config(
                "retry.multiplier must be a finite number >= 1.0".to_string(),
            ));
        }
        if self.retry.attempt_timeout_secs == 0 {
            return Err(AppError::Config(
                "retry.attempt_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.server.max_concurrent_workflows == 0 {
            return Err(AppError::Config(
                "server.max_concurrent_workflows must be at least 1".to_string(),
            ));
        }
        for pattern in &self.analysis.exclude_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                AppError::Config(format!("Invalid exclude pattern {pattern:?}: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn github_token(&self) -> &str {
        &self.github.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[sonar]
url = "https://sonar.example.com"
token = "sonar-secret"

[github]
token = "gh-secret"

[llm]
api_key = "llm-secret"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.max_concurrent_workflows, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.github.base_branch, "main");
        assert_eq!(config.github.branch_prefix, "coverage-improvement");
        assert_eq!(config.test_generation.framework, "pytest");
        assert!(config.persistence.state_dir.is_none());
        assert!(!config.analysis.exclude_patterns.is_empty());
    }

    #[test]
    fn test_missing_credentials_is_config_error() {
        let result = AppConfig::from_toml_str("[server]\nport = 9000\n");
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let toml = format!("{MINIMAL}\n[retry]\nmax_attempts = 0\n");
        let err = AppConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_zero_attempt_timeout_rejected() {
        let toml = format!("{MINIMAL}\n[retry]\nattempt_timeout_secs = 0\n");
        let err = AppConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("attempt_timeout_secs"));
    }

    #[test]
    fn test_non_finite_multiplier_rejected() {
        for value in ["nan", "inf", "0.5"] {
            let toml = format!("{MINIMAL}\n[retry]\nmultiplier = {value}\n");
            let err = AppConfig::from_toml_str(&toml).unwrap_err();
            assert!(err.to_string().contains("multiplier"), "{value}: {err}");
        }
    }

    #[test]
    fn test_llm_defaults_follow_provider() {
        let config = AppConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.llm.provider, LlmProvider::Anthropic);
        assert_eq!(config.llm.api_url(), "https://api.anthropic.com/v1/messages");
        assert_eq!(config.llm.max_tokens, 4000);

        let toml = MINIMAL.replace("[llm]\n", "[llm]\nprovider = \"openai\"\n");
        let config = AppConfig::from_toml_str(&toml).unwrap();
        assert_eq!(config.llm.provider, LlmProvider::OpenAi);
        assert_eq!(config.llm.model(), "gpt-4o");
        assert_eq!(config.llm.api_url(), "https://api.openai.com/v1/chat/completions");

        let toml = MINIMAL.replace(
            "[llm]\n",
            "[llm]\nprovider = \"openai\"\nmodel = \"gpt-4.1\"\n",
        );
        let config = AppConfig::from_toml_str(&toml).unwrap();
        assert_eq!(config.llm.model(), "gpt-4.1");
    }

    #[test]
    fn test_unknown_llm_provider_rejected() {
        let toml = MINIMAL.replace("[llm]\n", "[llm]\nprovider = \"bard\"\n");
        assert!(matches!(AppConfig::from_toml_str(&toml), Err(AppError::Config(_))));
    }

    #[test]
    fn test_invalid_exclude_pattern_rejected() {
        let toml = format!("{MINIMAL}\n[analysis]\nexclude_patterns = [\"(unclosed\"]\n");
        assert!(AppConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = AppConfig::from_toml_str(MINIMAL).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("sonar-secret"));
        assert!(!debug.contains("gh-secret"));
        assert!(!debug.contains("llm-secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
