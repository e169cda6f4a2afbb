//! On-device model provider.
//!
//! The on-device model is an external collaborator reached through the
//! [`OnDeviceModel`] trait: it reports an availability state and hands out
//! stateful sessions. This adapter creates one session per call and always
//! destroys it afterwards, so unrelated analyses never share context.
//!
//! Concurrent sessions corrupt the model's shared state for image input,
//! so image analysis is serialized through a FIFO async mutex held until
//! the previous call's session has been torn down.

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::response::parse_verdict;
use super::{ImageOptions, ProviderAdapter, ProviderError, ProviderId, Verdict};
use crate::prompts::{build_prompt_message, build_vision_message, PROMPT_SYSTEM, VISION_SYSTEM};

/// Readiness of the on-device model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnDeviceAvailability {
    Available,
    NeedsDownload,
    Downloading,
    Unavailable,
}

impl fmt::Display for OnDeviceAvailability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnDeviceAvailability::Available => write!(f, "model is available"),
            OnDeviceAvailability::NeedsDownload => {
                write!(f, "model needs to be downloaded before first use")
            }
            OnDeviceAvailability::Downloading => {
                write!(f, "model is still downloading, try again shortly")
            }
            OnDeviceAvailability::Unavailable => {
                write!(f, "model is not supported on this device")
            }
        }
    }
}

/// Input to a single session prompt.
#[derive(Debug, Clone)]
pub enum SessionInput {
    Text(String),
    Image {
        bytes: Vec<u8>,
        mime_type: String,
        text: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub system_prompt: String,
    /// Whether the session must accept image input
    pub expects_image: bool,
}

/// The on-device model runtime.
#[async_trait]
pub trait OnDeviceModel: Send + Sync {
    async fn availability(&self) -> OnDeviceAvailability;

    async fn create_session(
        &self,
        options: &SessionOptions,
    ) -> Result<Box<dyn OnDeviceSession>, ProviderError>;
}

/// A stateful conversation with the on-device model.
#[async_trait]
pub trait OnDeviceSession: Send {
    async fn prompt(&mut self, input: SessionInput) -> Result<String, ProviderError>;

    async fn destroy(self: Box<Self>);
}

pub struct OnDeviceProvider {
    model: Option<Arc<dyn OnDeviceModel>>,
    image_lock: Mutex<()>,
}

impl fmt::Debug for OnDeviceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnDeviceProvider")
            .field("has_model", &self.model.is_some())
            .finish()
    }
}

impl OnDeviceProvider {
    /// `None` when the host has no on-device runtime at all.
    pub fn new(model: Option<Arc<dyn OnDeviceModel>>) -> Self {
        Self {
            model,
            image_lock: Mutex::new(()),
        }
    }

    async fn ready_model(&self) -> Result<&Arc<dyn OnDeviceModel>, ProviderError> {
        let model = self
            .model
            .as_ref()
            .ok_or(ProviderError::OnDeviceUnavailable(
                OnDeviceAvailability::Unavailable,
            ))?;

        match model.availability().await {
            OnDeviceAvailability::Available => Ok(model),
            state => Err(ProviderError::OnDeviceUnavailable(state)),
        }
    }

    /// One prompt in a fresh session; the session is destroyed on every path.
    async fn run_session(
        &self,
        options: SessionOptions,
        input: SessionInput,
    ) -> Result<String, ProviderError> {
        let model = self.ready_model().await?;
        let mut session = model.create_session(&options).await?;
        let result = session.prompt(input).await;
        session.destroy().await;
        result
    }
}

#[async_trait]
impl ProviderAdapter for OnDeviceProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OnDevice
    }

    async fn analyze_with_prompt(
        &self,
        text: &str,
        criteria: &str,
        _model: &str,
    ) -> Result<Verdict, ProviderError> {
        let options = SessionOptions {
            system_prompt: PROMPT_SYSTEM.trim().to_string(),
            expects_image: false,
        };
        let output = self
            .run_session(options, SessionInput::Text(build_prompt_message(text, criteria)))
            .await?;
        parse_verdict(&output)
    }

    async fn analyze_image(
        &self,
        image_base64: &str,
        criteria: &str,
        _model: &str,
        options: &ImageOptions,
    ) -> Result<Verdict, ProviderError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(image_base64.trim())
            .map_err(|e| ProviderError::InvalidImage(e.to_string()))?;

        let session_options = SessionOptions {
            system_prompt: VISION_SYSTEM.trim().to_string(),
            expects_image: true,
        };
        let input = SessionInput::Image {
            bytes,
            mime_type: options.mime_type.clone(),
            text: build_vision_message(criteria),
        };

        // Held until the session is destroyed, including on error.
        let _guard = self.image_lock.lock().await;
        let output = self.run_session(session_options, input).await?;
        parse_verdict(&output)
    }

    async fn health_check(&self) -> bool {
        match &self.model {
            Some(model) => model.availability().await == OnDeviceAvailability::Available,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const MATCH_JSON: &str = r#"{"matches": true, "confidence": 0.9, "explanation": "face"}"#;
    const PNG_B64: &str = "iVBORw0KGgo=";

    #[derive(Default)]
    struct Counters {
        live: AtomicUsize,
        max_live: AtomicUsize,
        created: AtomicUsize,
        destroyed: AtomicUsize,
    }

    struct FakeModel {
        state: OnDeviceAvailability,
        counters: Arc<Counters>,
        fail_prompt: bool,
    }

    struct FakeSession {
        counters: Arc<Counters>,
        fail_prompt: bool,
    }

    #[async_trait]
    impl OnDeviceModel for FakeModel {
        async fn availability(&self) -> OnDeviceAvailability {
            self.state
        }

        async fn create_session(
            &self,
            _options: &SessionOptions,
        ) -> Result<Box<dyn OnDeviceSession>, ProviderError> {
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                counters: self.counters.clone(),
                fail_prompt: self.fail_prompt,
            }))
        }
    }

    #[async_trait]
    impl OnDeviceSession for FakeSession {
        async fn prompt(&mut self, _input: SessionInput) -> Result<String, ProviderError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail_prompt {
                return Err(ProviderError::MalformedResponse("session crashed".into()));
            }
            Ok(MATCH_JSON.to_string())
        }

        async fn destroy(self: Box<Self>) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
            self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn provider(state: OnDeviceAvailability, fail_prompt: bool) -> (OnDeviceProvider, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let model = FakeModel {
            state,
            counters: counters.clone(),
            fail_prompt,
        };
        (OnDeviceProvider::new(Some(Arc::new(model))), counters)
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_calls_are_serialized() {
        let (provider, counters) = provider(OnDeviceAvailability::Available, false);
        let provider = Arc::new(provider);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let p = provider.clone();
                tokio::spawn(async move {
                    p.analyze_image(PNG_B64, "shows a face", "", &ImageOptions::default())
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().unwrap().matches);
        }
        assert_eq!(counters.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(counters.created.load(Ordering::SeqCst), 4);
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_destroyed_on_error() {
        let (provider, counters) = provider(OnDeviceAvailability::Available, true);
        let result = provider
            .analyze_image(PNG_B64, "x", "", &ImageOptions::default())
            .await;
        assert!(result.is_err());
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);

        // The lock was released, so a second call is not blocked.
        let second = provider.analyze_with_prompt("text", "x", "").await;
        assert!(second.is_err());
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_state_errors() {
        for state in [
            OnDeviceAvailability::NeedsDownload,
            OnDeviceAvailability::Downloading,
            OnDeviceAvailability::Unavailable,
        ] {
            let (provider, counters) = provider(state, false);
            let err = provider.analyze_with_prompt("t", "c", "").await.unwrap_err();
            assert!(matches!(err, ProviderError::OnDeviceUnavailable(s) if s == state));
            assert!(!provider.health_check().await);
            assert_eq!(counters.created.load(Ordering::SeqCst), 0);
        }

        let err = ProviderError::OnDeviceUnavailable(OnDeviceAvailability::Downloading);
        assert!(err.to_string().contains("still downloading"));
    }

    #[tokio::test]
    async fn test_no_runtime_and_no_embeddings() {
        let provider = OnDeviceProvider::new(None);
        assert!(!provider.health_check().await);
        assert!(matches!(
            provider.analyze_with_prompt("t", "c", "").await,
            Err(ProviderError::OnDeviceUnavailable(OnDeviceAvailability::Unavailable))
        ));
        assert!(matches!(
            provider.get_embedding("t", "").await,
            Err(ProviderError::UnsupportedOperation { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_base64() {
        let (provider, counters) = provider(OnDeviceAvailability::Available, false);
        let err = provider
            .analyze_image("not base64!!", "c", "", &ImageOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidImage(_)));
        assert_eq!(counters.created.load(Ordering::SeqCst), 0);
    }
}
