//! OpenRouter federated provider.
//!
//! Routes to many upstream models. Requests a strict `json_schema` response
//! format, but upstream models do not all honor it, so responses go through
//! [`parse_verdict_lenient`]. Token usage and reported cost are accumulated
//! per adapter instance.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::time::Instant;

use super::openai_compat::{image_messages, text_messages, ChatOutput, OpenAiCompatClient};
use super::response::{parse_verdict_lenient, verdict_schema};
use super::secrets::ApiCredential;
use super::{ImageOptions, ProviderAdapter, ProviderError, ProviderId, UsageTotals, Verdict};
use crate::prompts::{build_prompt_message, build_vision_message, PROMPT_SYSTEM, VISION_SYSTEM};

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Debug)]
pub struct OpenRouterProvider {
    client: OpenAiCompatClient,
    usage: Mutex<UsageTotals>,
}

impl OpenRouterProvider {
    pub fn new(credential: ApiCredential) -> Self {
        let client =
            OpenAiCompatClient::new(ProviderId::OpenRouter, OPENROUTER_BASE_URL, Some(credential))
                .with_header("X-Title", "sieve");
        Self {
            client,
            usage: Mutex::new(UsageTotals::default()),
        }
    }

    /// Set custom base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.client = self.client.with_base_url(url);
        self
    }

    fn response_format() -> serde_json::Value {
        json!({
            "type": "json_schema",
            "json_schema": { "name": "verdict", "strict": true, "schema": verdict_schema() },
        })
    }

    async fn complete(
        &self,
        model: &str,
        body: serde_json::Value,
    ) -> Result<Verdict, ProviderError> {
        let start = Instant::now();
        let output = self.client.chat(&body).await?;
        self.record_usage(model, &output, start);
        parse_verdict_lenient(&output.content)
    }

    fn record_usage(&self, model: &str, output: &ChatOutput, start: Instant) {
        let mut totals = self.usage.lock();
        totals.calls += 1;

        if let Some(usage) = &output.usage {
            totals.prompt_tokens += usage.prompt_tokens;
            totals.completion_tokens += usage.completion_tokens;
            totals.cost_usd += usage.cost.unwrap_or(0.0);

            tracing::info!(
                model = %model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                cost_usd = usage.cost.unwrap_or(0.0),
                latency_ms = start.elapsed().as_millis() as u64,
                "OpenRouter call complete"
            );
        } else {
            tracing::info!(
                model = %model,
                latency_ms = start.elapsed().as_millis() as u64,
                "OpenRouter call complete (no usage reported)"
            );
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenRouterProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenRouter
    }

    async fn analyze_with_prompt(
        &self,
        text: &str,
        criteria: &str,
        model: &str,
    ) -> Result<Verdict, ProviderError> {
        let body = json!({
            "model": model,
            "messages": text_messages(PROMPT_SYSTEM, &build_prompt_message(text, criteria)),
            "response_format": Self::response_format(),
            "usage": { "include": true },
            "temperature": 0,
        });
        self.complete(model, body).await
    }

    async fn analyze_image(
        &self,
        image_base64: &str,
        criteria: &str,
        model: &str,
        options: &ImageOptions,
    ) -> Result<Verdict, ProviderError> {
        let body = json!({
            "model": model,
            "messages": image_messages(
                VISION_SYSTEM,
                &build_vision_message(criteria),
                image_base64,
                options,
            ),
            "response_format": Self::response_format(),
            "usage": { "include": true },
            "max_tokens": options.max_tokens,
            "temperature": 0,
        });
        self.complete(model, body).await
    }

    async fn health_check(&self) -> bool {
        self.client.credential().is_some_and(|c| !c.is_empty())
    }

    fn usage(&self) -> Option<UsageTotals> {
        Some(self.usage.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::openai_compat::ChatUsage;
    use crate::providers::CredentialSource;

    fn provider() -> OpenRouterProvider {
        OpenRouterProvider::new(ApiCredential::new(
            "or-key",
            CredentialSource::Programmatic,
            "OpenRouter API key",
        ))
    }

    #[test]
    fn test_usage_accumulates() {
        let p = provider();
        assert_eq!(p.usage(), Some(UsageTotals::default()));

        let output = ChatOutput {
            content: String::new(),
            usage: Some(ChatUsage {
                prompt_tokens: 100,
                completion_tokens: 20,
                cost: Some(0.001),
            }),
        };
        p.record_usage("m", &output, Instant::now());
        p.record_usage("m", &output, Instant::now());
        p.record_usage(
            "m",
            &ChatOutput {
                content: String::new(),
                usage: None,
            },
            Instant::now(),
        );

        let totals = p.usage().unwrap();
        assert_eq!(totals.calls, 3);
        assert_eq!(totals.total_tokens(), 240);
        assert!((totals.cost_usd - 0.002).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_no_embeddings() {
        let err = provider().get_embedding("x", "m").await.unwrap_err();
        assert!(err.to_string().contains("openai or gemini or lmstudio"));
    }

    #[test]
    fn test_response_format_is_strict_schema() {
        let format = OpenRouterProvider::response_format();
        assert_eq!(format["type"], "json_schema");
        assert_eq!(format["json_schema"]["strict"], true);
        assert_eq!(format["json_schema"]["schema"]["required"][0], "matches");
    }
}
