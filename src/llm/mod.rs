pub mod claude;
pub mod openai;
pub mod prompt;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{LlmConfig, LlmProvider, TestGenerationConfig};
use crate::error::{AppError, Result};
use crate::workflow::state::{CodeLocation, GeneratedArtifact};
use claude::ClaudeClient;
use openai::OpenAiClient;

/// Single-turn text completion against a hosted model.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

/// Build the completion client for the configured provider.
pub fn completion_client(config: &LlmConfig) -> Result<Arc<dyn CompletionClient>> {
    let client: Arc<dyn CompletionClient> = match config.provider {
        LlmProvider::Anthropic => Arc::new(ClaudeClient::new(config)?),
        LlmProvider::OpenAi => Arc::new(OpenAiClient::new(config)?),
    };
    tracing::info!(provider = ?config.provider, model = %client.model(), "LLM client configured");
    Ok(client)
}

/// Produces test files for selected code locations.
#[async_trait]
pub trait TestWriter: Send + Sync {
    async fn generate_tests(
        &self,
        local_path: &Path,
        locations: &[CodeLocation],
    ) -> Result<Vec<GeneratedArtifact>>;
}

/// [`TestWriter`] that asks a [`CompletionClient`] for one test file per location.
pub struct LlmTestWriter {
    client: Arc<dyn CompletionClient>,
    framework: String,
    test_directory: String,
}

impl LlmTestWriter {
    pub fn new(client: Arc<dyn CompletionClient>, config: &TestGenerationConfig) -> Self {
        Self {
            client,
            framework: config.framework.clone(),
            test_directory: config.test_directory.clone(),
        }
    }
}

#[async_trait]
impl TestWriter for LlmTestWriter {
    async fn generate_tests(
        &self,
        local_path: &Path,
        locations: &[CodeLocation],
    ) -> Result<Vec<GeneratedArtifact>> {
        let mut artifacts = Vec::with_capacity(locations.len());
        let mut seen = HashSet::new();

        for location in locations {
            let path =
                test_file_path(&location.file_path, &location.language, &self.test_directory);
            if !seen.insert(path.clone()) {
                tracing::warn!(
                    source = %location.file_path,
                    test_file = %path,
                    "Skipping location whose test file is already generated"
                );
                continue;
            }

            let source = tokio::fs::read_to_string(local_path.join(&location.file_path))
                .await
                .map_err(|e| {
                    AppError::Workspace(format!("Failed to read {}: {e}", location.file_path))
                })?;

            let framework = prompt::framework_for(&location.language, &self.framework);
            let system = prompt::system_prompt(&location.language, framework);
            let user = prompt::test_generation_prompt(location, &source, framework);

            tracing::info!(
                source = %location.file_path,
                model = %self.client.model(),
                "Generating tests"
            );
            let response = self.client.complete(&system, &user).await?;
            let content = clean_generated_code(&response);
            if content.is_empty() {
                return Err(AppError::Llm(format!(
                    "Model returned an empty test file for {}",
                    location.file_path
                )));
            }

            artifacts.push(GeneratedArtifact {
                path,
                content: format!("{content}\n"),
            });
        }

        Ok(artifacts)
    }
}

/// Strip a surrounding markdown code fence, if any.
pub fn clean_generated_code(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed.to_string();
    };

    // Skip the fence line, including its language tag
    let after_fence = &trimmed[start + 3..];
    let body = match after_fence.find('\n') {
        Some(newline) => &after_fence[newline + 1..],
        None => "",
    };
    let body = match body.rfind("```") {
        Some(end) => &body[..end],
        None => body,
    };
    body.trim().to_string()
}

/// Repository-relative path of the test file for `source`.
pub fn test_file_path(source: &str, language: &str, test_directory: &str) -> String {
    let path = Path::new(source);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("module");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("txt");
    let dir = path
        .parent()
        .and_then(|p| p.to_str())
        .unwrap_or_default();

    match language {
        "python" => {
            let dir = if dir == "src" {
                ""
            } else {
                dir.strip_prefix("src/").unwrap_or(dir)
            };
            let name = format!("test_{stem}.py");
            join_path(&[test_directory, dir, name.as_str()])
        }
        "javascript" | "typescript" => {
            let name = format!("{stem}.test.{ext}");
            join_path(&[dir, name.as_str()])
        }
        "go" => {
            let name = format!("{stem}_test.go");
            join_path(&[dir, name.as_str()])
        }
        "java" => {
            let mut chars = stem.chars();
            let class: String = match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            };
            let dir = dir.replacen("src/main/java", "src/test/java", 1);
            let name = format!("{class}Test.java");
            join_path(&[dir.as_str(), name.as_str()])
        }
        "rust" => format!("tests/{stem}_test.rs"),
        _ => {
            let name = format!("test_{stem}.{ext}");
            join_path(&[test_directory, dir, name.as_str()])
        }
    }
}

fn join_path(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}
