//! Google Gemini provider.
//!
//! Differences from the OpenAI wire format:
//! - API key in the `x-goog-api-key` header
//! - `responseMimeType: "application/json"` in the generation config
//! - Images are sent as `inline_data` parts
//! - Text lives in `candidates[0].content.parts[*].text`

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use super::response::parse_verdict;
use super::secrets::ApiCredential;
use super::{ImageOptions, ProviderAdapter, ProviderError, ProviderId, Verdict};
use crate::prompts::{build_prompt_message, build_vision_message, PROMPT_SYSTEM, VISION_SYSTEM};

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    credential: ApiCredential,
    base_url: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbedValues,
}

#[derive(Debug, Deserialize)]
struct EmbedValues {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl GeminiProvider {
    pub fn new(credential: ApiCredential) -> Self {
        Self {
            credential,
            base_url: GEMINI_BASE_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Set custom base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!("{}/models/{}:{}", self.base_url, model, method)
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        body: &JsonValue,
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", self.credential.expose())
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
        serde_json::from_str(&text)
            .map_err(|e| ProviderError::MalformedResponse(format!("gemini response: {}", e)))
    }

    async fn generate(
        &self,
        model: &str,
        system: &str,
        parts: JsonValue,
        max_tokens: Option<u32>,
    ) -> Result<String, ProviderError> {
        let mut generation_config = json!({
            "temperature": 0,
            "responseMimeType": "application/json",
        });
        if let Some(max) = max_tokens {
            generation_config["maxOutputTokens"] = json!(max);
        }

        let body = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "systemInstruction": { "parts": [{ "text": system.trim() }] },
            "generationConfig": generation_config,
        });

        let response: GenerateResponse = self
            .post(self.model_url(model, "generateContent"), &body)
            .await?;

        let text = extract_text(response);
        if text.is_empty() {
            return Err(ProviderError::MalformedResponse(
                "gemini returned no text".to_string(),
            ));
        }
        Ok(text)
    }
}

fn extract_text(response: GenerateResponse) -> String {
    response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

#[async_trait]
impl ProviderAdapter for GeminiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
    }

    async fn get_embedding(&self, text: &str, model: &str) -> Result<Vec<f32>, ProviderError> {
        let body = json!({ "content": { "parts": [{ "text": text }] } });
        let response: EmbedResponse = self.post(self.model_url(model, "embedContent"), &body).await?;

        if response.embedding.values.is_empty() {
            return Err(ProviderError::MalformedResponse(
                "gemini returned an empty embedding".to_string(),
            ));
        }
        Ok(response.embedding.values)
    }

    async fn analyze_with_prompt(
        &self,
        text: &str,
        criteria: &str,
        model: &str,
    ) -> Result<Verdict, ProviderError> {
        let parts = json!([{ "text": build_prompt_message(text, criteria) }]);
        let content = self.generate(model, PROMPT_SYSTEM, parts, None).await?;
        parse_verdict(&content)
    }

    async fn analyze_image(
        &self,
        image_base64: &str,
        criteria: &str,
        model: &str,
        options: &ImageOptions,
    ) -> Result<Verdict, ProviderError> {
        let parts = json!([
            { "text": build_vision_message(criteria) },
            { "inline_data": { "mime_type": options.mime_type, "data": image_base64 } },
        ]);
        let content = self
            .generate(model, VISION_SYSTEM, parts, Some(options.max_tokens))
            .await?;
        parse_verdict(&content)
    }

    async fn health_check(&self) -> bool {
        !self.credential.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::openai_compat::tests::serve_canned;
    use crate::providers::CredentialSource;

    fn provider() -> GeminiProvider {
        GeminiProvider::new(ApiCredential::new(
            "g-key",
            CredentialSource::Programmatic,
            "Gemini API key",
        ))
    }

    #[test]
    fn test_model_url() {
        let p = provider();
        assert_eq!(
            p.model_url("models/text-embedding-004", "embedContent"),
            format!("{}/models/text-embedding-004:embedContent", GEMINI_BASE_URL)
        );
        assert_eq!(
            p.with_base_url("http://local/")
                .model_url("gemini-2.0-flash", "generateContent"),
            "http://local/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn test_extract_text_joins_parts() {
        let response: GenerateResponse = serde_json::from_value(json!({
            "candidates": [{ "content": { "parts": [{ "text": "{\"matches\":" }, { "text": "true}" }] } }]
        }))
        .unwrap();
        assert_eq!(extract_text(response), "{\"matches\":true}");

        let empty: GenerateResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(extract_text(empty), "");
    }

    #[test]
    fn test_debug_redacts_key() {
        assert!(!format!("{:?}", provider()).contains("g-key"));
    }

    #[tokio::test]
    async fn test_error_status_maps_to_backend() {
        let (url, seen) = serve_canned(500, r#"{"error":{"code":500}}"#).await;
        let err = provider()
            .with_base_url(url)
            .get_embedding("t", "text-embedding-004")
            .await
            .unwrap_err();

        assert!(matches!(
            &err,
            ProviderError::Backend { status: 500, body } if body.contains("\"code\":500")
        ));
        let (head, _) = seen.lock()[0].clone();
        assert!(head.starts_with("post /models/text-embedding-004:embedcontent "));
        assert!(head.contains("x-goog-api-key: g-key"));
    }

    #[tokio::test]
    async fn test_undecodable_bodies_map_to_malformed() {
        let (url, _) = serve_canned(200, "not json").await;
        assert!(matches!(
            provider().with_base_url(url).get_embedding("t", "m").await,
            Err(ProviderError::MalformedResponse(_))
        ));

        let (url, _) = serve_canned(200, r#"{"embedding":{"values":[]}}"#).await;
        assert!(matches!(
            provider().with_base_url(url).get_embedding("t", "m").await,
            Err(ProviderError::MalformedResponse(_))
        ));

        let (url, _) = serve_canned(200, r#"{"candidates":[]}"#).await;
        assert!(matches!(
            provider().with_base_url(url).analyze_with_prompt("t", "c", "m").await,
            Err(ProviderError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_prompt_verdict_over_http() {
        let (url, seen) = serve_canned(
            200,
            r#"{"candidates":[{"content":{"parts":[{"text":"{\"matches\":true,\"confidence\":0.9,\"explanation\":\"ad\"}"}]}}]}"#,
        )
        .await;

        let verdict = provider()
            .with_base_url(url)
            .analyze_with_prompt("Buy now", "an advert", "gemini-2.0-flash")
            .await
            .unwrap();
        assert!(verdict.matches);
        assert_eq!(verdict.confidence, 0.9);

        let (_, body) = seen.lock()[0].clone();
        let body: JsonValue = serde_json::from_str(&body).unwrap();
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
    }
}
