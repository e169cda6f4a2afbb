//! Shared HTTP client for OpenAI-compatible endpoints.
//!
//! OpenAI, LM Studio and OpenRouter all speak the same `/embeddings` and
//! `/chat/completions` wire format; only the base URL, the credential and
//! a few request fields differ.

use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use super::secrets::ApiCredential;
use super::{ImageOptions, ProviderError, ProviderId};

pub(crate) struct OpenAiCompatClient {
    provider: ProviderId,
    base_url: String,
    credential: Option<ApiCredential>,
    extra_headers: Vec<(&'static str, String)>,
    http: reqwest::Client,
}

impl std::fmt::Debug for OpenAiCompatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatClient")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("credential", &self.credential)
            .finish()
    }
}

/// Text and token usage of one chat completion.
#[derive(Debug, Clone)]
pub(crate) struct ChatOutput {
    pub content: String,
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    /// Reported by routers that do usage accounting
    #[serde(default)]
    pub cost: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl OpenAiCompatClient {
    pub fn new(
        provider: ProviderId,
        base_url: impl Into<String>,
        credential: Option<ApiCredential>,
    ) -> Self {
        Self {
            provider,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential,
            extra_headers: Vec::new(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.extra_headers.push((name, value.into()));
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credential(&self) -> Option<&ApiCredential> {
        self.credential.as_ref()
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));

        // The credential is only exposed here, at the point of use.
        if let Some(credential) = &self.credential {
            builder = builder.bearer_auth(credential.expose());
        }
        for (name, value) in &self.extra_headers {
            builder = builder.header(*name, value);
        }
        builder
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &JsonValue,
    ) -> Result<T, ProviderError> {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Backend {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            ProviderError::MalformedResponse(format!("{} response: {}", self.provider, e))
        })
    }

    /// POST /embeddings and return the first vector.
    pub async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>, ProviderError> {
        let body = json!({ "model": model, "input": text });
        let response: EmbeddingResponse = self.post_json("/embeddings", &body).await?;

        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ProviderError::MalformedResponse(format!("{} returned no embedding", self.provider))
            })
    }

    /// POST /chat/completions and return the first choice's text.
    pub async fn chat(&self, body: &JsonValue) -> Result<ChatOutput, ProviderError> {
        let response: ChatResponse = self.post_json("/chat/completions", body).await?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                ProviderError::MalformedResponse(format!("{} returned no choices", self.provider))
            })?;

        Ok(ChatOutput {
            content,
            usage: response.usage,
        })
    }

    /// GET a path and report whether it answered 2xx.
    pub async fn probe(&self, path: &str) -> bool {
        match self.request(reqwest::Method::GET, path).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(provider = %self.provider, error = %e, "Probe failed");
                false
            }
        }
    }
}

/// System + user messages for text analysis.
pub(crate) fn text_messages(system: &str, user: &str) -> JsonValue {
    json!([
        { "role": "system", "content": system.trim() },
        { "role": "user", "content": user },
    ])
}

/// System + user messages with an inline data-URI image.
pub(crate) fn image_messages(
    system: &str,
    user: &str,
    image_base64: &str,
    options: &ImageOptions,
) -> JsonValue {
    let mut image_url = json!({
        "url": format!("data:{};base64,{}", options.mime_type, image_base64),
    });
    if let Some(detail) = &options.detail {
        image_url["detail"] = json!(detail);
    }

    json!([
        { "role": "system", "content": system.trim() },
        {
            "role": "user",
            "content": [
                { "type": "text", "text": user },
                { "type": "image_url", "image_url": image_url },
            ],
        },
    ])
}
