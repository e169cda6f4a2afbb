//! LM Studio local server provider.
//!
//! LM Studio exposes an OpenAI-compatible API on localhost and needs no
//! credential. Models load just-in-time: the first request for a cold
//! model fails with a "model not loaded" error while loading starts, so
//! every call is retried exactly once after a fixed delay.

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use serde_json::json;
use std::future::Future;
use std::time::Duration;

use super::openai_compat::{image_messages, text_messages, OpenAiCompatClient};
use super::response::{parse_verdict, verdict_schema};
use super::{ImageOptions, ProviderAdapter, ProviderError, ProviderId, Verdict};
use crate::prompts::{build_prompt_message, build_vision_message, PROMPT_SYSTEM, VISION_SYSTEM};

pub const DEFAULT_LMSTUDIO_URL: &str = "http://localhost:1234/v1";

/// Default wait before retrying a cold model.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Run `op`, retrying once after `delay` if the server reports a cold model.
///
/// Any other error, and a second failure, propagate unchanged.
pub async fn with_jit_retry<T, F, Fut>(delay: Duration, op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    op.retry(
        ConstantBuilder::default()
            .with_delay(delay)
            .with_max_times(1),
    )
    .sleep(tokio::time::sleep)
    .when(ProviderError::is_model_not_loaded)
    .notify(|_, wait| {
        tracing::info!(delay = ?wait, "Model not loaded yet, retrying after JIT load");
    })
    .await
}

#[derive(Debug)]
pub struct LmStudioProvider {
    client: OpenAiCompatClient,
    retry_delay: Duration,
}

impl LmStudioProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: OpenAiCompatClient::new(ProviderId::LmStudio, base_url, None),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn base_url(&self) -> &str {
        self.client.base_url()
    }

    fn response_format() -> serde_json::Value {
        json!({
            "type": "json_schema",
            "json_schema": { "name": "verdict", "strict": true, "schema": verdict_schema() },
        })
    }
}

#[async_trait]
impl ProviderAdapter for LmStudioProvider {
    fn id(&self) -> ProviderId {
        ProviderId::LmStudio
    }

    async fn get_embedding(&self, text: &str, model: &str) -> Result<Vec<f32>, ProviderError> {
        with_jit_retry(self.retry_delay, || self.client.embed(text, model)).await
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
            "temperature": 0,
        });

        let output = with_jit_retry(self.retry_delay, || self.client.chat(&body)).await?;
        parse_verdict(&output.content)
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
            "max_tokens": options.max_tokens,
            "temperature": 0,
        });

        let output = with_jit_retry(self.retry_delay, || self.client.chat(&body)).await?;
        parse_verdict(&output.content)
    }

    async fn health_check(&self) -> bool {
        self.client.probe("/models").await
    }
}
