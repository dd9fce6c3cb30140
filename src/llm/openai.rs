use super::{AssistantMessage, ChatMessage, ChatModel};
use crate::config::ModelConfig;
use crate::directory::FunctionTool;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint
pub struct OpenAiChatClient {
    http_client: HttpClient,
    base_url: String,
    model: String,
    api_key: Option<String>,
    api_key_env: String,
}

impl OpenAiChatClient {
    /// `api_key` is injected by the caller; `api_key_env` only names where it
    /// was expected to come from, for error messages.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        api_key_env: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            api_key_env: api_key_env.into(),
        }
    }

    pub fn from_config(config: &ModelConfig, api_key: Option<String>) -> Self {
        Self::new(
            config.base_url.clone(),
            config.model.clone(),
            api_key,
            config.api_key_env.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// Whether a model call can be attempted at all
    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ChatModel for OpenAiChatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[FunctionTool],
    ) -> Result<AssistantMessage> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| BridgeError::MissingApiKey(self.api_key_env.clone()))?;

        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            "Querying model {} with {} message(s), {} tool(s)",
            self.model,
            messages.len(),
            tools.len()
        );

        let response = self
            .http_client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::Model(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            warn!("Model API returned {}", status);
            return Err(BridgeError::Model(format!("{} - {}", status, error_text)));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::Model(format!("malformed response: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| BridgeError::Model("response contained no choices".to_string()))
    }
}
