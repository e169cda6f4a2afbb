//! Provider adapters for sieve-runtime.
//!
//! This module defines the adapter contract every backend satisfies and
//! the closed set of built-in providers:
//!
//! | id           | backend                          | embedding | prompt | vision |
//! |--------------|----------------------------------|-----------|--------|--------|
//! | `openai`     | OpenAI cloud API (key)           | yes       | yes    | yes    |
//! | `gemini`     | Google Gemini API (key)          | yes       | yes    | yes    |
//! | `lmstudio`   | local OpenAI-compatible server   | yes       | yes    | yes    |
//! | `on-device`  | session-based on-device model    | no        | yes    | yes    |
//! | `openrouter` | federated router (key)           | no        | yes    | yes    |
//!
//! ## Security
//!
//! All keyed providers use the [`secrets`] module for credential handling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

mod factory;
mod gemini;
mod lmstudio;
mod on_device;
mod openai;
mod openai_compat;
mod openrouter;
pub mod response;
pub mod secrets;

pub use factory::{AdapterFactory, BuiltinAdapterFactory};
pub use gemini::GeminiProvider;
pub use lmstudio::{with_jit_retry, LmStudioProvider, DEFAULT_LMSTUDIO_URL, DEFAULT_RETRY_DELAY};
pub use on_device::{
    OnDeviceAvailability, OnDeviceModel, OnDeviceProvider, OnDeviceSession, SessionInput,
    SessionOptions,
};
pub use openai::OpenAiProvider;
pub use openrouter::OpenRouterProvider;
pub use response::Verdict;
pub use secrets::{ApiCredential, CredentialSource};

/// Errors from provider adapters.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("{provider} does not support {operation}; use {alternative} instead")]
    UnsupportedOperation {
        provider: ProviderId,
        operation: Capability,
        alternative: String,
    },

    #[error("{name} required for {provider}: add it in settings or set {env_var}")]
    MissingCredential {
        provider: ProviderId,
        name: &'static str,
        env_var: &'static str,
    },

    #[error("API error: {status} - {body}")]
    Backend { status: u16, body: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("On-device model not ready: {0}")]
    OnDeviceUnavailable(OnDeviceAvailability),

    #[error("Invalid image payload: {0}")]
    InvalidImage(String),
}

impl ProviderError {
    /// Build the error for a capability the provider lacks, naming the
    /// providers that do offer it.
    pub fn unsupported(provider: ProviderId, operation: Capability) -> Self {
        let alternative = ProviderId::ALL
            .iter()
            .filter(|p| **p != provider && p.supports(operation))
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(" or ");
        ProviderError::UnsupportedOperation {
            provider,
            operation,
            alternative,
        }
    }

    /// Whether a local server reported that the requested model is not
    /// loaded yet (just-in-time loading in progress).
    pub fn is_model_not_loaded(&self) -> bool {
        match self {
            ProviderError::Backend { body, .. } => {
                let body = body.to_ascii_lowercase();
                body.contains("model not loaded")
                    || body.contains("model is not loaded")
                    || body.contains("no models loaded")
                    || body.contains("loading model")
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ProviderError::MalformedResponse(e.to_string())
        } else {
            ProviderError::Http(e.to_string())
        }
    }
}

/// A provider id that is not one of the built-in providers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown provider: '{0}'. Available: openai, gemini, lmstudio, on-device, openrouter")]
pub struct UnknownProvider(pub String);

/// The closed set of supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProviderId {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "lmstudio")]
    LmStudio,
    #[serde(rename = "on-device")]
    OnDevice,
    #[serde(rename = "openrouter")]
    OpenRouter,
}

/// An operation in the adapter contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Embedding,
    Prompt,
    Vision,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Embedding => write!(f, "embeddings"),
            Capability::Prompt => write!(f, "prompt analysis"),
            Capability::Vision => write!(f, "image analysis"),
        }
    }
}

impl From<sieve_core::RuleKind> for Capability {
    fn from(kind: sieve_core::RuleKind) -> Self {
        match kind {
            sieve_core::RuleKind::Embedding => Capability::Embedding,
            sieve_core::RuleKind::Prompt => Capability::Prompt,
            sieve_core::RuleKind::Vision => Capability::Vision,
        }
    }
}

/// Where a provider's credential comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialSpec {
    /// Human-readable name for messages
    pub name: &'static str,

    /// Environment fallback
    pub env_var: &'static str,
}

impl ProviderId {
    pub const ALL: [ProviderId; 5] = [
        ProviderId::OpenAi,
        ProviderId::Gemini,
        ProviderId::LmStudio,
        ProviderId::OnDevice,
        ProviderId::OpenRouter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Gemini => "gemini",
            ProviderId::LmStudio => "lmstudio",
            ProviderId::OnDevice => "on-device",
            ProviderId::OpenRouter => "openrouter",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "OpenAI",
            ProviderId::Gemini => "Google Gemini",
            ProviderId::LmStudio => "LM Studio",
            ProviderId::OnDevice => "On-device model",
            ProviderId::OpenRouter => "OpenRouter",
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match self {
            ProviderId::OpenAi | ProviderId::Gemini | ProviderId::LmStudio => true,
            ProviderId::OnDevice | ProviderId::OpenRouter => capability != Capability::Embedding,
        }
    }

    /// The credential this provider needs, if any.
    pub fn credential(&self) -> Option<CredentialSpec> {
        match self {
            ProviderId::OpenAi => Some(CredentialSpec {
                name: "OpenAI API key",
                env_var: "OPENAI_API_KEY",
            }),
            ProviderId::Gemini => Some(CredentialSpec {
                name: "Gemini API key",
                env_var: "GEMINI_API_KEY",
            }),
            ProviderId::OpenRouter => Some(CredentialSpec {
                name: "OpenRouter API key",
                env_var: "OPENROUTER_API_KEY",
            }),
            ProviderId::LmStudio | ProviderId::OnDevice => None,
        }
    }

    /// Whether the provider depends on a local service that must be probed.
    pub fn requires_service(&self) -> bool {
        matches!(self, ProviderId::LmStudio | ProviderId::OnDevice)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderId::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

/// Options for image analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageOptions {
    /// MIME type of the base64 payload
    pub mime_type: String,

    /// Resolution hint for backends that accept one ("low", "high", "auto")
    pub detail: Option<String>,

    pub max_tokens: u32,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            mime_type: "image/png".to_string(),
            detail: Some("low".to_string()),
            max_tokens: 200,
        }
    }
}

/// Accumulated token usage for a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    /// Number of completed calls
    pub calls: u32,

    pub prompt_tokens: u64,

    pub completion_tokens: u64,

    /// Cost reported by the backend, in USD
    pub cost_usd: f64,
}

impl UsageTotals {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// The capability contract every backend adapter satisfies.
///
/// Unsupported operations keep the default implementation, which fails
/// with [`ProviderError::UnsupportedOperation`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which provider this adapter talks to.
    fn id(&self) -> ProviderId;

    /// Embed `text` with `model`.
    async fn get_embedding(&self, _text: &str, _model: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::unsupported(self.id(), Capability::Embedding))
    }

    /// Judge whether `text` meets `criteria`.
    async fn analyze_with_prompt(
        &self,
        _text: &str,
        _criteria: &str,
        _model: &str,
    ) -> Result<Verdict, ProviderError> {
        Err(ProviderError::unsupported(self.id(), Capability::Prompt))
    }

    /// Judge whether a base64 image meets `criteria`.
    async fn analyze_image(
        &self,
        _image_base64: &str,
        _criteria: &str,
        _model: &str,
        _options: &ImageOptions,
    ) -> Result<Verdict, ProviderError> {
        Err(ProviderError::unsupported(self.id(), Capability::Vision))
    }

    /// Whether the backend is reachable and ready.
    async fn health_check(&self) -> bool;

    /// Usage accounting, for adapters that track it.
    fn usage(&self) -> Option<UsageTotals> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmbedOnly;

    #[async_trait]
    impl ProviderAdapter for EmbedOnly {
        fn id(&self) -> ProviderId {
            ProviderId::OnDevice
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_provider_id_round_trip() {
        for id in ProviderId::ALL {
            assert_eq!(id.as_str().parse::<ProviderId>().unwrap(), id);
        }
        let err = "bard".parse::<ProviderId>().unwrap_err();
        assert!(err.to_string().contains("Unknown provider"));
    }

    #[test]
    fn test_capabilities() {
        assert!(ProviderId::OpenAi.supports(Capability::Embedding));
        assert!(!ProviderId::OpenRouter.supports(Capability::Embedding));
        assert!(ProviderId::OnDevice.supports(Capability::Vision));
        assert!(ProviderId::LmStudio.credential().is_none());
        assert!(ProviderId::LmStudio.requires_service());
        assert_eq!(
            ProviderId::Gemini.credential().unwrap().env_var,
            "GEMINI_API_KEY"
        );
    }

    #[tokio::test]
    async fn test_default_methods_are_unsupported() {
        let adapter = EmbedOnly;
        let err = adapter.get_embedding("x", "m").await.unwrap_err();
        match err {
            ProviderError::UnsupportedOperation {
                provider,
                alternative,
                ..
            } => {
                assert_eq!(provider, ProviderId::OnDevice);
                assert_eq!(alternative, "openai or gemini or lmstudio");
            }
            other => panic!("Expected UnsupportedOperation, got {other:?}"),
        }
        assert!(adapter.usage().is_none());
    }

    #[test]
    fn test_model_not_loaded_detection() {
        let cold = ProviderError::Backend {
            status: 404,
            body: r#"{"error":"No models loaded. Please load a model."}"#.to_string(),
        };
        assert!(cold.is_model_not_loaded());

        let other = ProviderError::Backend {
            status: 500,
            body: "internal error".to_string(),
        };
        assert!(!other.is_model_not_loaded());
        assert!(!ProviderError::Http("x".into()).is_model_not_loaded());
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&ProviderId::OnDevice).unwrap(),
            "\"on-device\""
        );
        assert_eq!(
            serde_json::from_str::<ProviderId>("\"openai\"").unwrap(),
            ProviderId::OpenAi
        );
    }
}
