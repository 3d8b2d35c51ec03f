//! Anthropic Messages API adapter.

use super::{
    GenerationRequest, GenerationResponse, Message, ProviderCapability, ProviderError,
    TokenCountInput, Usage, build_http_client, require_api_key,
};
use crate::config::{ConfigError, ProviderSettings};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Provider backed by the Anthropic Messages API.
pub struct AnthropicProvider {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    context_window_tokens: usize,
    request_timeout: Duration,
}

impl AnthropicProvider {
    /// Build a client from settings; a missing key is a configuration error.
    pub fn new(settings: &ProviderSettings, request_timeout: Duration) -> Result<Self, ConfigError> {
        Ok(Self {
            http: build_http_client(settings, request_timeout)?,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: require_api_key(settings)?,
            model: settings.model.clone(),
            context_window_tokens: settings.context_window_tokens,
            request_timeout,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url.trim_end_matches('/'))
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .http
            .post(self.endpoint(path))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|error| ProviderError::from_transport(error, self.request_timeout))?;

        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::from_status(status, &headers, body))
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct CountTokensResponse {
    input_tokens: usize,
}

fn messages_payload(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| json!({ "role": message.role.as_str(), "content": message.content }))
        .collect()
}

#[async_trait]
impl ProviderCapability for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn context_window_tokens(&self) -> usize {
        self.context_window_tokens
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let mut payload = json!({
            "model": model,
            "max_tokens": request.max_tokens,
            "messages": messages_payload(&[Message::user(request.prompt.as_str())]),
        });
        let body = payload
            .as_object_mut()
            .ok_or_else(|| ProviderError::Other("request body is not an object".into()))?;
        if let Some(system) = request.system_prompt.as_deref() {
            body.insert("system".into(), Value::from(system));
        }
        match request.thinking_budget_tokens {
            // Extended thinking requires the default temperature.
            Some(budget) => {
                body.insert(
                    "thinking".into(),
                    json!({ "type": "enabled", "budget_tokens": budget }),
                );
            }
            None => {
                body.insert("temperature".into(), Value::from(request.temperature));
            }
        }

        let response = self.post("messages", &payload).await?;
        let parsed: MessagesResponse = response.json().await.map_err(|error| {
            ProviderError::InvalidResponse(format!("failed to decode Anthropic response: {error}"))
        })?;

        let mut content = String::new();
        let mut thinking = String::new();
        for block in parsed.content {
            match block {
                ContentBlock::Text { text } => content.push_str(&text),
                ContentBlock::Thinking { thinking: trace } => thinking.push_str(&trace),
                ContentBlock::Unknown => {}
            }
        }
        if content.trim().is_empty() {
            return Err(ProviderError::InvalidResponse(
                "Anthropic response contained no text blocks".into(),
            ));
        }

        Ok(GenerationResponse {
            content: content.trim().to_string(),
            thinking: (!thinking.trim().is_empty()).then(|| thinking.trim().to_string()),
            usage: parsed.usage.map(|usage| Usage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            }),
        })
    }

    async fn count_tokens(&self, input: TokenCountInput<'_>) -> Result<usize, ProviderError> {
        let payload = json!({
            "model": self.model,
            "messages": messages_payload(&input.to_messages()),
        });
        let response = self.post("messages/count_tokens", &payload).await?;
        let parsed: CountTokensResponse = response.json().await.map_err(|error| {
            ProviderError::InvalidResponse(format!("failed to decode token count: {error}"))
        })?;
        Ok(parsed.input_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::retry::{Classify, ErrorClass};
    use httpmock::{Method::POST, MockServer};

    fn provider_for(server: &MockServer) -> AnthropicProvider {
        let settings = ProviderSettings {
            kind: ProviderKind::Anthropic,
            model: "claude-test".into(),
            api_key: Some("secret".into()),
            base_url: Some(server.base_url()),
            context_window_tokens: 200_000,
        };
        AnthropicProvider::new(&settings, Duration::from_secs(5)).expect("provider")
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "Summarize".into(),
            system_prompt: Some("You are careful.".into()),
            model: None,
            max_tokens: 1_000,
            temperature: 0.1,
            thinking_budget_tokens: None,
        }
    }

    #[test]
    fn missing_api_key_is_configuration_error() {
        let settings = ProviderSettings {
            kind: ProviderKind::Anthropic,
            model: "claude-test".into(),
            api_key: None,
            base_url: None,
            context_window_tokens: 200_000,
        };
        let error = AnthropicProvider::new(&settings, Duration::from_secs(1))
            .err()
            .expect("missing key rejected");
        assert!(matches!(error, ConfigError::ProviderInit { .. }));
    }

    #[tokio::test]
    async fn generate_collects_text_thinking_and_usage() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/messages")
                    .header("x-api-key", "secret")
                    .header("anthropic-version", API_VERSION);
                then.status(200).json_body(json!({
                    "content": [
                        { "type": "thinking", "thinking": "Weighing the record." },
                        { "type": "text", "text": "  Summary text  " }
                    ],
                    "usage": { "input_tokens": 120, "output_tokens": 30 }
                }));
            })
            .await;

        let response = provider_for(&server)
            .generate(&request())
            .await
            .expect("response");

        mock.assert_async().await;
        assert_eq!(response.content, "Summary text");
        assert_eq!(response.thinking.as_deref(), Some("Weighing the record."));
        assert_eq!(
            response.usage,
            Some(Usage {
                input_tokens: 120,
                output_tokens: 30
            })
        );
    }

    #[tokio::test]
    async fn generate_sends_thinking_budget_without_temperature() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/messages")
                    .json_body_partial(r#"{"thinking":{"type":"enabled","budget_tokens":500}}"#);
                then.status(200).json_body(json!({
                    "content": [{ "type": "text", "text": "ok" }]
                }));
            })
            .await;

        let mut thinking_request = request();
        thinking_request.thinking_budget_tokens = Some(500);
        provider_for(&server)
            .generate(&thinking_request)
            .await
            .expect("response");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn overloaded_status_is_retryable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages");
                then.status(503).body("overloaded");
            })
            .await;

        let error = provider_for(&server)
            .generate(&request())
            .await
            .expect_err("error status");
        assert_eq!(error.class(), ErrorClass::Retryable);
    }

    #[tokio::test]
    async fn unauthorized_status_is_fatal() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages");
                then.status(401).body("invalid x-api-key");
            })
            .await;

        let error = provider_for(&server)
            .generate(&request())
            .await
            .expect_err("error status");
        assert!(matches!(error, ProviderError::Authentication(_)));
        assert_eq!(error.class(), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn count_tokens_reads_input_tokens() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages/count_tokens");
                then.status(200).json_body(json!({ "input_tokens": 42 }));
            })
            .await;

        let count = provider_for(&server)
            .count_tokens(TokenCountInput::Text("hello there"))
            .await
            .expect("count");
        assert_eq!(count, 42);
    }
}
