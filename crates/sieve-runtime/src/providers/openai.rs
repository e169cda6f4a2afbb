//! OpenAI cloud API provider.
//!
//! ## Security
//!
//! The API key is held in an [`ApiCredential`] and only exposed when the
//! bearer header is built.

use async_trait::async_trait;
use serde_json::json;

use super::openai_compat::{image_messages, text_messages, OpenAiCompatClient};
use super::response::parse_verdict;
use super::secrets::ApiCredential;
use super::{ImageOptions, ProviderAdapter, ProviderError, ProviderId, Verdict};
use crate::prompts::{build_prompt_message, build_vision_message, PROMPT_SYSTEM, VISION_SYSTEM};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI provider: embeddings, chat and vision.
#[derive(Debug)]
pub struct OpenAiProvider {
    client: OpenAiCompatClient,
}

impl OpenAiProvider {
    pub fn new(credential: ApiCredential) -> Self {
        Self {
            client: OpenAiCompatClient::new(ProviderId::OpenAi, OPENAI_BASE_URL, Some(credential)),
        }
    }

    /// Set custom base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.client = self.client.with_base_url(url);
        self
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAi
    }

    async fn get_embedding(&self, text: &str, model: &str) -> Result<Vec<f32>, ProviderError> {
        self.client.embed(text, model).await
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
            "response_format": { "type": "json_object" },
            "temperature": 0,
        });

        let output = self.client.chat(&body).await?;
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
            "response_format": { "type": "json_object" },
            "max_tokens": options.max_tokens,
            "temperature": 0,
        });

        let output = self.client.chat(&body).await?;
        parse_verdict(&output.content)
    }

    async fn health_check(&self) -> bool {
        // Verify the key is set without logging it.
        self.client.credential().is_some_and(|c| !c.is_empty())
    }
}
