//! Google Gemini adapter; typically configured as the large-context fallback.

use super::{
    GenerationRequest, GenerationResponse, Message, ProviderCapability, ProviderError, Role,
    TokenCountInput, Usage, build_http_client, require_api_key,
};
use crate::config::{ConfigError, ProviderSettings};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Provider backed by the Gemini `generateContent` API.
pub struct GeminiProvider {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    context_window_tokens: usize,
    request_timeout: Duration,
}

impl GeminiProvider {
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

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!(
            "{}/v1beta/models/{model}:{method}",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn post(&self, url: String, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
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
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    thoughts_token_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountTokensResponse {
    total_tokens: usize,
}

fn contents_payload(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            json!({ "role": role, "parts": [{ "text": message.content }] })
        })
        .collect()
}

#[async_trait]
impl ProviderCapability for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn context_window_tokens(&self) -> usize {
        self.context_window_tokens
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let mut generation_config = json!({
            "maxOutputTokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if let (Some(budget), Some(config)) = (
            request.thinking_budget_tokens,
            generation_config.as_object_mut(),
        ) {
            config.insert(
                "thinkingConfig".into(),
                json!({ "thinkingBudget": budget, "includeThoughts": true }),
            );
        }

        let mut payload = json!({
            "contents": contents_payload(&[Message::user(request.prompt.as_str())]),
            "generationConfig": generation_config,
        });
        if let (Some(system), Some(body)) =
            (request.system_prompt.as_deref(), payload.as_object_mut())
        {
            body.insert(
                "systemInstruction".into(),
                json!({ "parts": [{ "text": system }] }),
            );
        }

        let response = self
            .post(self.endpoint(model, "generateContent"), &payload)
            .await?;
        let parsed: GenerateContentResponse = response.json().await.map_err(|error| {
            ProviderError::InvalidResponse(format!("failed to decode Gemini response: {error}"))
        })?;

        let candidate = parsed.candidates.into_iter().next().ok_or_else(|| {
            ProviderError::InvalidResponse("Gemini response contained no candidates".into())
        })?;
        let mut content = String::new();
        let mut thinking = String::new();
        for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
            let Some(text) = part.text else { continue };
            if part.thought {
                thinking.push_str(&text);
            } else {
                content.push_str(&text);
            }
        }
        if content.trim().is_empty() {
            return Err(ProviderError::InvalidResponse(format!(
                "Gemini returned no text (finish reason: {})",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            )));
        }

        Ok(GenerationResponse {
            content: content.trim().to_string(),
            thinking: (!thinking.trim().is_empty()).then(|| thinking.trim().to_string()),
            usage: parsed.usage_metadata.map(|usage| Usage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count + usage.thoughts_token_count,
            }),
        })
    }

    async fn count_tokens(&self, input: TokenCountInput<'_>) -> Result<usize, ProviderError> {
        let payload = json!({ "contents": contents_payload(&input.to_messages()) });
        let response = self
            .post(self.endpoint(&self.model, "countTokens"), &payload)
            .await?;
        let parsed: CountTokensResponse = response.json().await.map_err(|error| {
            ProviderError::InvalidResponse(format!("failed to decode token count: {error}"))
        })?;
        Ok(parsed.total_tokens)
    }
}
