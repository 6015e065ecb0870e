use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::CompletionClient;
use crate::config::LlmConfig;
use crate::error::{AppError, Result};

const API_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Minimal client for the Anthropic Messages API.
pub struct ClaudeClient {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl ClaudeClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(AppError::Config("llm.api_key is required".to_string()));
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            api_url: config.api_url().to_string(),
            api_key: config.api_key.clone(),
            model: config.model().to_string(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    pub async fn send_message(&self, request: &MessagesRequest) -> Result<MessagesResponse> {
        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::from_status("Anthropic API", status.as_u16(), &body));
        }

        let body = response.json::<MessagesResponse>().await?;
        Ok(body)
    }
}

#[async_trait]
impl CompletionClient for ClaudeClient {
    fn model(&self) -> &str {
        &self.model
    }

    /// Single-turn completion returning the concatenated text blocks.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: system.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self.send_message(&request).await?;
        tracing::debug!(
            model = %self.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            stop_reason = ?response.stop_reason,
            "LLM call completed"
        );

        let text = response.text();
        if text.trim().is_empty() {
            return Err(AppError::Llm("Model returned no text content".to_string()));
        }
        Ok(text)
    }
}

// --- Request types ---

#[derive(Debug, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

// --- Response types ---

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct MessagesResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

impl MessagesResponse {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::LlmProvider;
    use crate::error::ErrorKind;
    use axum::{http::StatusCode, routing::post, Json, Router};

    /// Serve a fixed JSON reply for `POST path` on an ephemeral port and return its URL.
    pub(crate) async fn mock_route(
        path: &'static str,
        status: StatusCode,
        body: serde_json::Value,
    ) -> String {
        let app = Router::new().route(
            path,
            post(move || {
                let body = body.clone();
                async move { (status, Json(body)) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}{path}")
    }

    pub(crate) async fn mock_api(status: StatusCode, body: serde_json::Value) -> String {
        mock_route("/v1/messages", status, body).await
    }

    pub(crate) fn client_for(api_url: String) -> ClaudeClient {
        ClaudeClient::new(&LlmConfig {
            provider: LlmProvider::Anthropic,
            api_key: "test-key".to_string(),
            model: Some("claude-test".to_string()),
            max_tokens: 256,
            temperature: 0.2,
            api_url: Some(api_url),
        })
        .unwrap()
    }

    pub(crate) fn text_reply(text: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": text}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 20}
        })
    }

    #[test]
    fn test_new_requires_api_key() {
        let result = ClaudeClient::new(&LlmConfig {
            provider: LlmProvider::Anthropic,
            api_key: String::new(),
            model: None,
            max_tokens: 1,
            temperature: 0.0,
            api_url: None,
        });
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_response_text_skips_non_text_blocks() {
        let response: MessagesResponse = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "text", "text": "def test_a():"},
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "\n    pass"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1, "output_tokens": 2}
        }))
        .unwrap();
        assert_eq!(response.text(), "def test_a():\n    pass");
    }

    #[tokio::test]
    async fn test_complete_returns_text() {
        let url = mock_api(StatusCode::OK, text_reply("assert True")).await;
        let client = client_for(url);
        assert_eq!(client.complete("sys", "prompt").await.unwrap(), "assert True");
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let url = mock_api(
            StatusCode::TOO_MANY_REQUESTS,
            serde_json::json!({"type": "error", "error": {"type": "rate_limit_error"}}),
        )
        .await;
        let err = client_for(url).complete("sys", "prompt").await.unwrap_err();
        assert!(matches!(err, AppError::RateLimited(_)));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_overloaded_is_transient() {
        let url = mock_api(
            StatusCode::from_u16(529).unwrap(),
            serde_json::json!({"type": "error", "error": {"type": "overloaded_error"}}),
        )
        .await;
        let err = client_for(url).complete("sys", "prompt").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_auth_failure_is_permanent() {
        let url = mock_api(
            StatusCode::UNAUTHORIZED,
            serde_json::json!({"type": "error", "error": {"type": "authentication_error"}}),
        )
        .await;
        let err = client_for(url).complete("sys", "prompt").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_empty_text_is_an_error() {
        let url = mock_api(StatusCode::OK, text_reply("   ")).await;
        let err = client_for(url).complete("sys", "prompt").await.unwrap_err();
        assert!(matches!(err, AppError::Llm(_)));
    }
}
