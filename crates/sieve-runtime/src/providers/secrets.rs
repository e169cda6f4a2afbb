//! Secure credential handling for provider adapters.
//!
//! API keys live in the persisted settings (or the environment) as plain
//! strings. As soon as an adapter is built they are wrapped in an
//! [`ApiCredential`], which:
//!
//! - Cannot appear in `Debug`/`Display` output
//! - Is zeroed on drop via `secrecy`
//! - Must be exposed explicitly at the point of use
//!
//! ```ignore
//! let cred = ApiCredential::from_setting_or_env(
//!     settings.openai_api_key.as_deref(),
//!     spec,
//!     ProviderId::OpenAi,
//!     true,
//! )?;
//! request.bearer_auth(cred.expose());
//! ```

use secrecy::{ExposeSecret, SecretString};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use super::{CredentialSpec, ProviderError, ProviderId};

/// Where a credential was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Loaded from persisted settings
    Settings,
    /// Loaded from an environment variable
    Environment,
    /// Provided programmatically
    Programmatic,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Settings => write!(f, "settings"),
            CredentialSource::Environment => write!(f, "environment"),
            CredentialSource::Programmatic => write!(f, "programmatic"),
        }
    }
}

/// A securely-stored API credential.
pub struct ApiCredential {
    value: SecretString,
    source: CredentialSource,
    name: &'static str,
}

impl ApiCredential {
    /// Wrap a credential value. It cannot be logged after this point.
    pub fn new(value: impl Into<String>, source: CredentialSource, name: &'static str) -> Self {
        Self {
            value: SecretString::from(value.into()),
            source,
            name,
        }
    }

    /// Load a credential from a settings value, falling back to the
    /// provider's environment variable when `env_fallback` is set.
    ///
    /// Empty strings count as absent.
    pub fn from_setting_or_env(
        setting: Option<&str>,
        spec: CredentialSpec,
        provider: ProviderId,
        env_fallback: bool,
    ) -> Result<Self, ProviderError> {
        if let Some(value) = setting.filter(|v| !v.trim().is_empty()) {
            return Ok(Self::new(value.trim(), CredentialSource::Settings, spec.name));
        }

        if env_fallback {
            if let Ok(value) = std::env::var(spec.env_var) {
                if !value.trim().is_empty() {
                    return Ok(Self::new(value.trim(), CredentialSource::Environment, spec.name));
                }
            }
        }

        Err(ProviderError::MissingCredential {
            provider,
            name: spec.name,
            env_var: spec.env_var,
        })
    }

    /// Expose the credential value for use in an API call.
    ///
    /// Only call this where the value is actually needed (an HTTP header).
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.value.expose_secret().is_empty()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// A hash of the value, used to detect credential changes without
    /// keeping a second copy of the secret.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.value.expose_secret().hash(&mut hasher);
        hasher.finish()
    }
}

impl Clone for ApiCredential {
    fn clone(&self) -> Self {
        Self::new(self.expose(), self.source, self.name)
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("value", &"[REDACTED]")
            .field("source", &self.source)
            .field("name", &self.name)
            .finish()
    }
}

impl fmt::Display for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} [REDACTED]", self.name, self.source)
    }
}
