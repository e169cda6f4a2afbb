//! Adapter construction.
//!
//! The provider set is closed, so construction is a match on
//! [`ProviderId`] rather than a registry. The [`AdapterFactory`] trait is
//! the seam the orchestrator builds adapters through; tests substitute
//! fakes there.
//!
//! ```ignore
//! let factory = BuiltinAdapterFactory::new();
//! let adapter = factory.create(ProviderId::OpenAi, &settings)?;
//! ```

use std::sync::Arc;

use super::gemini::GeminiProvider;
use super::lmstudio::LmStudioProvider;
use super::on_device::{OnDeviceModel, OnDeviceProvider};
use super::openai::OpenAiProvider;
use super::openrouter::OpenRouterProvider;
use super::{ProviderAdapter, ProviderError, ProviderId};
use crate::settings::Settings;

/// Builds adapters from the current settings.
pub trait AdapterFactory: Send + Sync {
    /// Create an adapter for `provider`.
    ///
    /// Keyed providers fail with [`ProviderError::MissingCredential`]
    /// before any network call when no key is configured.
    fn create(
        &self,
        provider: ProviderId,
        settings: &Settings,
    ) -> Result<Arc<dyn ProviderAdapter>, ProviderError>;
}

/// Factory for the built-in adapters.
#[derive(Clone, Default)]
pub struct BuiltinAdapterFactory {
    on_device: Option<Arc<dyn OnDeviceModel>>,
}

impl BuiltinAdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the host's on-device model runtime.
    pub fn with_on_device(mut self, model: Arc<dyn OnDeviceModel>) -> Self {
        self.on_device = Some(model);
        self
    }
}

impl AdapterFactory for BuiltinAdapterFactory {
    fn create(
        &self,
        provider: ProviderId,
        settings: &Settings,
    ) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        let adapter: Arc<dyn ProviderAdapter> = match provider {
            ProviderId::OpenAi => {
                Arc::new(OpenAiProvider::new(settings.require_credential(provider)?))
            }
            ProviderId::Gemini => {
                Arc::new(GeminiProvider::new(settings.require_credential(provider)?))
            }
            ProviderId::OpenRouter => {
                Arc::new(OpenRouterProvider::new(settings.require_credential(provider)?))
            }
            ProviderId::LmStudio => Arc::new(
                LmStudioProvider::new(settings.lmstudio_url.clone())
                    .with_retry_delay(settings.local_retry_delay),
            ),
            ProviderId::OnDevice => Arc::new(OnDeviceProvider::new(self.on_device.clone())),
        };

        tracing::debug!(provider = %provider, "Created provider adapter");
        Ok(adapter)
    }
}
