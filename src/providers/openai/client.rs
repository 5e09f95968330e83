use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use super::types::{ApiErrorEnvelope, ChatCompletionRequest, ChatMessage};
use crate::provider::CompletionProvider;
use crate::providers::http::{classify_transport, rate_limit_snapshot, retry_after};
use crate::types::{Parameters, RawProviderResponse, TextProviderSettings};
use crate::Error;

/// OpenAI-compatible chat completion provider (OpenAI, Deepseek, ...).
pub struct OpenAIProvider {
    client: Client,
    name: String,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAIProvider {
    /// Create a provider against the OpenAI API.
    pub fn new(api_key: String) -> Result<Self, Error> {
        Self::new_with_base_url(api_key, "https://api.openai.com/v1".to_string())
    }

    /// Create a provider with a custom base URL.
    pub fn new_with_base_url(api_key: String, base_url: String) -> Result<Self, Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            name: "OpenAI".to_string(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: "gpt-4o-mini".to_string(),
        })
    }

    /// Create a provider from settings.
    pub fn from_settings(settings: &TextProviderSettings) -> Result<Self, Error> {
        if settings.api_key.is_empty() {
            return Err(Error::config("API key required for the text provider"));
        }
        let provider = Self::new_with_base_url(settings.api_key.clone(), settings.base_url.clone())?
            .with_model(settings.model.clone());
        let name = if provider.base_url.contains("deepseek") {
            "Deepseek"
        } else {
            "OpenAI"
        };
        Ok(provider.with_name(name))
    }

    /// Default model used when the request does not name one.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Name reported in logs and result metadata.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Build the request body. Parameters have already been checked against
    /// the chat completion schema.
    fn convert_request(&self, prompt: &str, parameters: &Parameters) -> ChatCompletionRequest {
        let string = |name: &str| parameters.get(name).and_then(Value::as_str);
        let number = |name: &str| parameters.get(name).and_then(Value::as_f64);

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = string("system") {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));

        ChatCompletionRequest {
            model: string("model").unwrap_or(&self.model).to_string(),
            messages,
            temperature: number("temperature"),
            max_tokens: parameters.get("max_tokens").and_then(Value::as_u64),
            top_p: number("top_p"),
            stop: parameters.get("stop").and_then(Value::as_array).map(|items| {
                items
                    .iter()
                    .filter_map(|s| s.as_str().map(str::to_string))
                    .collect()
            }),
            presence_penalty: number("presence_penalty"),
            frequency_penalty: number("frequency_penalty"),
            stream: false,
        }
    }

    /// Turn a non-success response into a classified error.
    async fn error_from_response(&self, response: reqwest::Response) -> Error {
        let status = response.status();
        let retry_after = retry_after(response.headers());
        let snapshot = rate_limit_snapshot(response.headers());
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ApiErrorEnvelope>(&body) {
            Ok(envelope) => envelope.error.describe(),
            Err(_) if body.is_empty() => status.canonical_reason().unwrap_or("no body").to_string(),
            Err(_) => body,
        };
        Error::from_status(&self.name, status, message, retry_after).with_rate_limit(snapshot)
    }
}

#[async_trait::async_trait]
impl CompletionProvider for OpenAIProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        prompt: &str,
        parameters: &Parameters,
        timeout: Duration,
    ) -> Result<RawProviderResponse, Error> {
        let request = self.convert_request(prompt, parameters);
        tracing::debug!(provider = %self.name, model = %request.model, "sending chat completion");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport(&self.name, e))?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }
        let snapshot = rate_limit_snapshot(response.headers());

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::normalization(format!("{} returned an undecodable body: {e}", self.name)))?;

        let completion_id = body.get("id").and_then(Value::as_str).map(str::to_string);
        let mut raw = RawProviderResponse::json(self.name.clone(), body).with_rate_limit(snapshot);
        raw.provider_id = completion_id;
        Ok(raw)
    }
}
