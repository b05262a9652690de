use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::backend::{parse_suggestion, Suggestion, SuggestionBackend, SuggestionContext};
use crate::config::LlmConfig;
use crate::error::{DocsmithError, Result};

const SYSTEM_PROMPT: &str = "You repair code and documentation after an edit broke a contract. \
Propose the smallest change that restores consistency. Never invent APIs that are not shown.";

/// Build the configured backend, or `None` when LLM suggestions are disabled
pub fn create_backend(config: &LlmConfig) -> Result<Option<Arc<dyn SuggestionBackend>>> {
    if !config.enabled {
        return Ok(None);
    }

    let backend: Arc<dyn SuggestionBackend> = match config.provider.as_str() {
        "anthropic" => Arc::new(AnthropicBackend::new(config)?),
        "openai" => Arc::new(OpenAiBackend::new(config)?),
        "mcp" => Arc::new(McpBackend::new(config)?),
        _ => {
            return Err(DocsmithError::Config(format!(
                "Unsupported LLM provider: {}",
                config.provider
            )))
        }
    };

    Ok(Some(backend))
}

fn http_client(config: &LlmConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| DocsmithError::Llm(format!("Failed to build HTTP client: {}", e)))
}

async fn post_json(
    request: reqwest::RequestBuilder,
    payload: &serde_json::Value,
    provider: &str,
) -> Result<serde_json::Value> {
    let response = request
        .json(payload)
        .send()
        .await
        .map_err(|e| DocsmithError::Llm(format!("{} request failed: {}", provider, e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        return Err(DocsmithError::Llm(format!(
            "{} API error {}: {}",
            provider, status, error_text
        )));
    }

    response
        .json()
        .await
        .map_err(|e| DocsmithError::Llm(format!("Failed to parse {} response: {}", provider, e)))
}

/// Anthropic Messages API
pub struct AnthropicBackend {
    config: LlmConfig,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if config.api_key.is_none() {
            return Err(DocsmithError::Config(
                "API key required for the anthropic provider".to_string(),
            ));
        }

        Ok(Self {
            config: config.clone(),
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl SuggestionBackend for AnthropicBackend {
    async fn suggest(&self, context: &SuggestionContext) -> Result<Option<Suggestion>> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| DocsmithError::Config("Anthropic API key not set".to_string()))?;
        let base_url = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.anthropic.com");

        let payload = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens.unwrap_or(2000),
            "temperature": self.config.temperature.unwrap_or(0.2),
            "system": SYSTEM_PROMPT,
            "messages": [
                { "role": "user", "content": context.prompt() }
            ]
        });

        let request = self
            .client
            .post(format!("{}/v1/messages", base_url.trim_end_matches('/')))
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01");
        let data = post_json(request, &payload, "Anthropic").await?;

        if let Some(usage) = data.get("usage") {
            debug!("Anthropic usage: {}", usage);
        }

        let text = data["content"][0]["text"].as_str().unwrap_or_default();
        Ok(parse_suggestion(text))
    }

    fn provider_name(&self) -> &str {
        "Anthropic"
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// OpenAI-compatible chat completions
pub struct OpenAiBackend {
    config: LlmConfig,
    client: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if config.api_key.is_none() && config.base_url.is_none() {
            return Err(DocsmithError::Config(
                "API key required for the openai provider".to_string(),
            ));
        }

        Ok(Self {
            config: config.clone(),
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl SuggestionBackend for OpenAiBackend {
    async fn suggest(&self, context: &SuggestionContext) -> Result<Option<Suggestion>> {
        let base_url = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com");

        let payload = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": context.prompt() }
            ],
            "max_tokens": self.config.max_tokens.unwrap_or(2000),
            "temperature": self.config.temperature.unwrap_or(0.2)
        });

        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", base_url.trim_end_matches('/')));
        if let Some(api_key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }
        let data = post_json(request, &payload, "OpenAI").await?;

        let text = data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default();
        Ok(parse_suggestion(text))
    }

    fn provider_name(&self) -> &str {
        "OpenAI"
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// An MCP bridge exposing a `suggest_fix` tool over HTTP
pub struct McpBackend {
    config: LlmConfig,
    base_url: String,
    client: reqwest::Client,
}

impl McpBackend {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| DocsmithError::Config("Base URL required for the mcp provider".to_string()))?;

        Ok(Self {
            config: config.clone(),
            base_url,
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl SuggestionBackend for McpBackend {
    async fn suggest(&self, context: &SuggestionContext) -> Result<Option<Suggestion>> {
        let payload = json!({
            "name": "suggest_fix",
            "arguments": {
                "prompt": context.prompt(),
                "issue": context.issue,
                "model": self.config.model,
            }
        });

        let request = self
            .client
            .post(format!("{}/tools/call", self.base_url.trim_end_matches('/')));
        let data = post_json(request, &payload, "MCP").await?;

        // Tool results arrive as a list of content parts
        let text: String = data["content"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        Ok(parse_suggestion(&text))
    }

    fn provider_name(&self) -> &str {
        "MCP"
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_config_has_no_backend() {
        assert!(create_backend(&LlmConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_provider_selection() {
        let mut config = LlmConfig {
            enabled: true,
            api_key: Some("sk-test".to_string()),
            ..LlmConfig::default()
        };
        let backend = create_backend(&config).unwrap().unwrap();
        assert_eq!(backend.provider_name(), "Anthropic");

        config.provider = "openai".to_string();
        assert_eq!(create_backend(&config).unwrap().unwrap().provider_name(), "OpenAI");

        config.provider = "mcp".to_string();
        assert!(create_backend(&config).is_err());
        config.base_url = Some("http://localhost:8931".to_string());
        assert_eq!(create_backend(&config).unwrap().unwrap().provider_name(), "MCP");

        config.provider = "cortex".to_string();
        assert!(create_backend(&config).is_err());
    }

    #[test]
    fn test_anthropic_requires_api_key() {
        let config = LlmConfig {
            enabled: true,
            ..LlmConfig::default()
        };
        assert!(matches!(create_backend(&config), Err(DocsmithError::Config(_))));
    }
}
