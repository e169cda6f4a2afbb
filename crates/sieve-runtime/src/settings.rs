//! Persisted user settings.
//!
//! Settings are stored as one JSON object under [`SETTINGS_KEY`]. Every
//! field has a default, so partial or older objects load cleanly; an
//! unreadable or unparseable object falls back to [`Settings::default`]
//! instead of failing.

use serde::{Deserialize, Serialize};
use sieve_core::RuleKind;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::providers::{ApiCredential, ProviderError, ProviderId, UnknownProvider};
use crate::storage::{Storage, StorageError};

/// Storage key for the settings object.
pub const SETTINGS_KEY: &str = "settings";

/// Current settings schema version.
pub const SETTINGS_VERSION: u32 = 1;

pub const DEFAULT_EMBEDDING_THRESHOLD: f64 = 0.32;
pub const DEFAULT_PROMPT_THRESHOLD: f64 = 0.7;
pub const DEFAULT_VISION_THRESHOLD: f64 = 0.7;

/// Serde helper for `Duration` as a humantime string ("5s", "1m 30s").
mod duration_human {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelSpecError {
    #[error("Model '{0}' must be written as provider:model")]
    MissingSeparator(String),

    #[error("Model '{0}' has an empty model name")]
    EmptyModel(String),

    #[error(transparent)]
    UnknownProvider(#[from] UnknownProvider),
}

/// A `provider:modelName` model binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelSpec {
    pub provider: ProviderId,
    pub model: String,
}

impl FromStr for ModelSpec {
    type Err = ModelSpecError;

    /// Splits at the first ':', so model names may contain ':' themselves.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, model) = s
            .split_once(':')
            .ok_or_else(|| ModelSpecError::MissingSeparator(s.to_string()))?;

        let model = model.trim();
        if model.is_empty() {
            return Err(ModelSpecError::EmptyModel(s.to_string()));
        }

        Ok(ModelSpec {
            provider: provider.trim().parse()?,
            model: model.to_string(),
        })
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

/// Presentation preferences, carried for the host UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiPreferences {
    /// Blur radius in pixels for matched elements
    pub blur_radius: u32,

    pub reveal_on_hover: bool,
}

impl Default for UiPreferences {
    fn default() -> Self {
        Self {
            blur_radius: 10,
            reveal_on_hover: true,
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub version: u32,

    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,

    /// Base URL of the LM Studio server
    pub lmstudio_url: String,

    pub embedding_model: String,
    pub prompt_model: String,
    pub vision_model: String,

    pub embedding_threshold: f64,
    pub prompt_threshold: f64,
    pub vision_threshold: f64,

    /// Global kill switch for analysis
    pub blocking_enabled: bool,

    /// Wait before the single retry of a cold local model
    #[serde(with = "duration_human")]
    pub local_retry_delay: Duration,

    /// Fall back to `*_API_KEY` environment variables for missing keys
    pub credentials_from_env: bool,

    pub ui: UiPreferences,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            openai_api_key: None,
            gemini_api_key: None,
            openrouter_api_key: None,
            lmstudio_url: crate::providers::DEFAULT_LMSTUDIO_URL.to_string(),
            embedding_model: "openai:text-embedding-3-small".to_string(),
            prompt_model: "openai:gpt-4o-mini".to_string(),
            vision_model: "openai:gpt-4o-mini".to_string(),
            embedding_threshold: DEFAULT_EMBEDDING_THRESHOLD,
            prompt_threshold: DEFAULT_PROMPT_THRESHOLD,
            vision_threshold: DEFAULT_VISION_THRESHOLD,
            blocking_enabled: true,
            local_retry_delay: Duration::from_secs(5),
            credentials_from_env: true,
            ui: UiPreferences::default(),
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |key: &Option<String>| key.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("Settings")
            .field("version", &self.version)
            .field("openai_api_key", &redact(&self.openai_api_key))
            .field("gemini_api_key", &redact(&self.gemini_api_key))
            .field("openrouter_api_key", &redact(&self.openrouter_api_key))
            .field("lmstudio_url", &self.lmstudio_url)
            .field("embedding_model", &self.embedding_model)
            .field("prompt_model", &self.prompt_model)
            .field("vision_model", &self.vision_model)
            .field("embedding_threshold", &self.embedding_threshold)
            .field("prompt_threshold", &self.prompt_threshold)
            .field("vision_threshold", &self.vision_threshold)
            .field("blocking_enabled", &self.blocking_enabled)
            .field("local_retry_delay", &self.local_retry_delay)
            .field("credentials_from_env", &self.credentials_from_env)
            .field("ui", &self.ui)
            .finish()
    }
}

fn clamp_threshold(value: f64, default: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        default
    }
}

impl Settings {
    /// Load settings, falling back to defaults on any failure.
    pub async fn load(storage: &dyn Storage) -> Settings {
        let value = match storage.get(SETTINGS_KEY).await {
            Ok(Some(value)) => value,
            Ok(None) => return Settings::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read settings, using defaults");
                return Settings::default();
            }
        };

        match serde_json::from_value::<Settings>(value) {
            Ok(settings) => settings.normalized(),
            Err(e) => {
                tracing::warn!(error = %e, "Stored settings are invalid, using defaults");
                Settings::default()
            }
        }
    }

    pub async fn save(&self, storage: &dyn Storage) -> Result<(), StorageError> {
        let value =
            serde_json::to_value(self).map_err(|source| StorageError::Serialization {
                key: SETTINGS_KEY.to_string(),
                source,
            })?;
        storage.set(SETTINGS_KEY, value).await
    }

    /// Clamp thresholds into [0, 1] and stamp the current version.
    pub fn normalized(mut self) -> Self {
        if self.version != SETTINGS_VERSION {
            tracing::debug!(
                stored = self.version,
                current = SETTINGS_VERSION,
                "Upgrading settings version"
            );
            self.version = SETTINGS_VERSION;
        }
        self.embedding_threshold =
            clamp_threshold(self.embedding_threshold, DEFAULT_EMBEDDING_THRESHOLD);
        self.prompt_threshold = clamp_threshold(self.prompt_threshold, DEFAULT_PROMPT_THRESHOLD);
        self.vision_threshold = clamp_threshold(self.vision_threshold, DEFAULT_VISION_THRESHOLD);
        self
    }

    /// The raw `provider:model` string bound to a slot.
    pub fn model_string(&self, kind: RuleKind) -> &str {
        match kind {
            RuleKind::Embedding => &self.embedding_model,
            RuleKind::Prompt => &self.prompt_model,
            RuleKind::Vision => &self.vision_model,
        }
    }

    pub fn model_for(&self, kind: RuleKind) -> Result<ModelSpec, ModelSpecError> {
        self.model_string(kind).parse()
    }

    pub fn threshold_for(&self, kind: RuleKind) -> f64 {
        match kind {
            RuleKind::Embedding => self.embedding_threshold,
            RuleKind::Prompt => self.prompt_threshold,
            RuleKind::Vision => self.vision_threshold,
        }
    }

    fn api_key(&self, provider: ProviderId) -> Option<&str> {
        match provider {
            ProviderId::OpenAi => self.openai_api_key.as_deref(),
            ProviderId::Gemini => self.gemini_api_key.as_deref(),
            ProviderId::OpenRouter => self.openrouter_api_key.as_deref(),
            ProviderId::LmStudio | ProviderId::OnDevice => None,
        }
    }

    /// Resolve the credential a provider needs.
    ///
    /// `Ok(None)` for providers that need none.
    pub fn credential(&self, provider: ProviderId) -> Result<Option<ApiCredential>, ProviderError> {
        match provider.credential() {
            Some(spec) => ApiCredential::from_setting_or_env(
                self.api_key(provider),
                spec,
                provider,
                self.credentials_from_env,
            )
            .map(Some),
            None => Ok(None),
        }
    }

    /// Like [`Settings::credential`], but a credential is required.
    pub fn require_credential(&self, provider: ProviderId) -> Result<ApiCredential, ProviderError> {
        self.credential(provider)?.ok_or(ProviderError::MissingCredential {
            provider,
            name: "API key",
            env_var: "",
        })
    }
}
