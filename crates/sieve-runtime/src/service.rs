//! The analysis orchestrator.
//!
//! [`LlmService`] owns the provider pool, the three model slot bindings
//! (embedding, prompt, vision) and the analysis cache. Every analysis call
//! first reconciles its slot against freshly loaded settings:
//!
//! 1. Resolve the slot's `provider:model` binding
//! 2. Resolve the provider's credential, failing with
//!    [`ServiceError::ProviderUnavailable`] when it is missing
//! 3. Evict the pooled adapter when the provider or credential changed
//! 4. Probe local services through the 30 s availability cache
//!
//! Decisions combine the backend's judgment with the slot threshold:
//! `matches = backend_matches && confidence >= threshold`.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sieve_core::{cosine_similarity, RuleKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::availability::{AvailabilityCache, AVAILABILITY_TTL};
use crate::benchmark::{Measurement, MeasurementSink};
use crate::cache::{CacheConfig, CacheStore};
use crate::providers::{
    AdapterFactory, ApiCredential, ImageOptions, ProviderAdapter, ProviderError, ProviderId,
    UnknownProvider, UsageTotals, Verdict,
};
use crate::settings::{ModelSpec, ModelSpecError, Settings};
use crate::storage::{Storage, StorageError};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    UnknownProvider(#[from] UnknownProvider),

    #[error("Invalid {slot} model setting: {source}")]
    ModelSpec {
        slot: RuleKind,
        #[source]
        source: ModelSpecError,
    },

    #[error("{slot} analysis unavailable with {provider}: missing {missing}")]
    ProviderUnavailable {
        slot: RuleKind,
        provider: ProviderId,
        missing: String,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome of one analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub matches: bool,
    pub confidence: f64,
    pub explanation: String,
    pub provider: ProviderId,
    /// Served from the cache
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub had_json_error: bool,
}

/// A cached embedding vector, similarity score or backend verdict.
///
/// Scores and verdicts are stored before the slot threshold is applied;
/// the threshold in force is applied again on every hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CachedValue {
    Embedding(Vec<f32>),
    Similarity(f64),
    Verdict(Verdict),
}

/// What an embedded text is, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextType {
    /// Page content
    Content,
    /// A rule's reference phrase
    Criteria,
}

/// Collaborators the service is built from.
#[derive(Clone)]
pub struct ServiceContext {
    pub storage: Arc<dyn Storage>,
    pub factory: Arc<dyn AdapterFactory>,
    pub measurements: Option<Arc<dyn MeasurementSink>>,
    pub cache_config: CacheConfig,
    pub availability_ttl: Duration,
}

impl ServiceContext {
    pub fn new(storage: Arc<dyn Storage>, factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            storage,
            factory,
            measurements: None,
            cache_config: CacheConfig::default(),
            availability_ttl: AVAILABILITY_TTL,
        }
    }

    pub fn with_measurements(mut self, sink: Arc<dyn MeasurementSink>) -> Self {
        self.measurements = Some(sink);
        self
    }

    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    pub fn with_availability_ttl(mut self, ttl: Duration) -> Self {
        self.availability_ttl = ttl;
        self
    }
}

/// A slot's adapter, model and threshold after reconciliation.
#[derive(Clone)]
pub struct BoundAdapter {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub model: ModelSpec,
    pub threshold: f64,
}

/// What [`LlmService::reload_settings`] changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReloadOutcome {
    /// Slots whose model binding changed
    pub models_changed: Vec<RuleKind>,
    /// Providers whose pooled adapter was evicted
    pub evicted: Vec<ProviderId>,
}

#[derive(Debug, Clone, PartialEq)]
struct SlotBinding {
    model: ModelSpec,
    /// Fingerprint of the credential the adapter was built with
    credential: Option<u64>,
}

#[derive(Debug, Default)]
struct SlotChange {
    evicted: Option<ProviderId>,
    model_changed: bool,
}

struct ServiceState {
    settings: Settings,
    bindings: HashMap<RuleKind, SlotBinding>,
}

pub struct LlmService {
    storage: Arc<dyn Storage>,
    factory: Arc<dyn AdapterFactory>,
    measurements: Option<Arc<dyn MeasurementSink>>,
    pool: RwLock<HashMap<ProviderId, Arc<dyn ProviderAdapter>>>,
    state: Mutex<ServiceState>,
    cache: CacheStore<CachedValue>,
    availability: AvailabilityCache,
    benchmarking: AtomicBool,
}

impl LlmService {
    /// Load settings and the persisted cache.
    pub async fn new(context: ServiceContext) -> Self {
        let settings = Settings::load(context.storage.as_ref()).await;
        let cache = CacheStore::load(context.storage.clone(), context.cache_config).await;

        Self {
            storage: context.storage,
            factory: context.factory,
            measurements: context.measurements,
            pool: RwLock::new(HashMap::new()),
            state: Mutex::new(ServiceState {
                bindings: initial_bindings(&settings),
                settings,
            }),
            cache,
            availability: AvailabilityCache::new(context.availability_ttl),
            benchmarking: AtomicBool::new(false),
        }
    }

    /// Return the pooled adapter for `provider_id`, creating it from the
    /// current settings if needed.
    pub fn get_or_create_provider(
        &self,
        provider_id: &str,
    ) -> Result<Arc<dyn ProviderAdapter>, ServiceError> {
        let provider: ProviderId = provider_id.parse()?;
        let settings = self.state.lock().settings.clone();
        self.adapter_for(provider, &settings)
    }

    fn adapter_for(
        &self,
        provider: ProviderId,
        settings: &Settings,
    ) -> Result<Arc<dyn ProviderAdapter>, ServiceError> {
        let existing = self.pool.read().get(&provider).cloned();
        if let Some(adapter) = existing {
            return Ok(adapter);
        }

        let created = self.factory.create(provider, settings)?;
        let mut pool = self.pool.write();
        Ok(pool.entry(provider).or_insert(created).clone())
    }

    /// Record a slot's new binding, evicting the stale adapter if needed.
    fn rebind(&self, state: &mut ServiceState, slot: RuleKind, binding: SlotBinding) -> SlotChange {
        let mut change = SlotChange::default();

        if let Some(previous) = state.bindings.get(&slot) {
            if previous.model.provider != binding.model.provider {
                tracing::info!(
                    slot = %slot,
                    from = %previous.model.provider,
                    to = %binding.model.provider,
                    "Provider changed, evicting adapter"
                );
                change.evicted = Some(previous.model.provider);
            } else if previous.credential != binding.credential {
                tracing::info!(
                    slot = %slot,
                    provider = %binding.model.provider,
                    "Credential changed, evicting adapter"
                );
                change.evicted = Some(binding.model.provider);
            }

            if previous.model != binding.model {
                tracing::info!(
                    slot = %slot,
                    from = %previous.model,
                    to = %binding.model,
                    "Model binding changed"
                );
                change.model_changed = true;
            }
        }

        if let Some(provider) = change.evicted {
            self.pool.write().remove(&provider);
        }
        state.bindings.insert(slot, binding);
        change
    }

    /// Reconcile `slot` with the persisted settings and return its adapter.
    pub async fn ensure_adapter(&self, slot: RuleKind) -> Result<BoundAdapter, ServiceError> {
        let settings = Settings::load(self.storage.as_ref()).await;
        let model = settings
            .model_for(slot)
            .map_err(|source| ServiceError::ModelSpec { slot, source })?;
        let provider = model.provider;

        let credential = match settings.credential(provider) {
            Ok(credential) => credential,
            Err(ProviderError::MissingCredential { name, env_var, .. }) => {
                return Err(ServiceError::ProviderUnavailable {
                    slot,
                    provider,
                    missing: format!("{} (add it in settings or set {})", name, env_var),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let binding = SlotBinding {
            model: model.clone(),
            credential: credential.as_ref().map(ApiCredential::fingerprint),
        };
        let change = {
            let mut state = self.state.lock();
            state.settings = settings.clone();
            self.rebind(&mut state, slot, binding)
        };
        if let Some(evicted) = change.evicted {
            self.availability.invalidate(evicted).await;
        }
        if change.model_changed {
            tracing::info!(slot = %slot, model = %model, "Clearing cache after model change");
            self.clear_cache().await?;
        }

        let adapter = self.adapter_for(provider, &settings)?;

        if provider.requires_service() {
            let target = adapter.clone();
            let availability = self
                .availability
                .check(provider, || async move { target.health_check().await })
                .await;
            if !availability.available {
                return Err(ServiceError::ProviderUnavailable {
                    slot,
                    provider,
                    missing: service_description(provider, &settings),
                });
            }
        }

        Ok(BoundAdapter {
            adapter,
            threshold: settings.threshold_for(slot),
            model,
        })
    }

    /// Embed `text` with the embedding slot's model.
    pub async fn get_embedding(
        &self,
        text: &str,
        text_type: TextType,
    ) -> Result<Vec<f32>, ServiceError> {
        let bound = self.ensure_adapter(RuleKind::Embedding).await?;
        self.fetch_embedding(&bound, text, text_type).await
    }

    async fn fetch_embedding(
        &self,
        bound: &BoundAdapter,
        text: &str,
        text_type: TextType,
    ) -> Result<Vec<f32>, ServiceError> {
        let key = format!("embedding:{}:{}", bound.model, text);
        if let Some(CachedValue::Embedding(vector)) = self.cached(&key) {
            return Ok(vector);
        }

        tracing::debug!(model = %bound.model, text_type = ?text_type, "Fetching embedding");
        let vector = bound.adapter.get_embedding(text, &bound.model.model).await?;

        self.store(key, CachedValue::Embedding(vector.clone()));
        Ok(vector)
    }

    /// Compare `text` and `criteria` by cosine similarity of their embeddings.
    pub async fn analyze_by_embedding(
        &self,
        text: &str,
        criteria: &str,
        ground_truth: Option<bool>,
    ) -> Result<AnalysisResult, ServiceError> {
        let bound = self.ensure_adapter(RuleKind::Embedding).await?;
        let key = format!("embedding:{}:similarity:{}:{}", bound.model, text, criteria);

        if let Some(CachedValue::Similarity(similarity)) = self.cached(&key) {
            return Ok(AnalysisResult {
                cached: true,
                ..similarity_result(similarity, &bound)
            });
        }

        let start = Instant::now();
        let (text_vector, criteria_vector) = futures::try_join!(
            self.fetch_embedding(&bound, text, TextType::Content),
            self.fetch_embedding(&bound, criteria, TextType::Criteria),
        )?;

        let similarity = cosine_similarity(&text_vector, &criteria_vector);
        let result = similarity_result(similarity, &bound);

        self.record(RuleKind::Embedding, &bound, start, &result, ground_truth);
        self.store(key, CachedValue::Similarity(similarity));
        Ok(result)
    }

    /// Ask the prompt slot's backend whether `text` meets `criteria`.
    pub async fn analyze_by_prompt(
        &self,
        text: &str,
        criteria: &str,
        ground_truth: Option<bool>,
    ) -> Result<AnalysisResult, ServiceError> {
        let bound = self.ensure_adapter(RuleKind::Prompt).await?;
        let key = format!("prompt:{}:{}:{}", bound.model, text, criteria);

        if let Some(CachedValue::Verdict(verdict)) = self.cached(&key) {
            return Ok(AnalysisResult {
                cached: true,
                ..combine(verdict, &bound, RuleKind::Prompt)
            });
        }

        let start = Instant::now();
        let verdict = bound
            .adapter
            .analyze_with_prompt(text, criteria, &bound.model.model)
            .await?;

        self.store(key, CachedValue::Verdict(verdict.clone()));
        let result = combine(verdict, &bound, RuleKind::Prompt);
        self.record(RuleKind::Prompt, &bound, start, &result, ground_truth);
        Ok(result)
    }

    /// Ask the vision slot's backend whether a screenshot meets `criteria`.
    ///
    /// Never cached: screenshots are point-in-time and a text key cannot
    /// tell rotating content apart. `cache_info` only labels log lines.
    pub async fn analyze_by_image(
        &self,
        image_base64: &str,
        criteria: &str,
        cache_info: Option<&str>,
        options: &ImageOptions,
    ) -> Result<AnalysisResult, ServiceError> {
        let bound = self.ensure_adapter(RuleKind::Vision).await?;

        tracing::debug!(model = %bound.model, subject = ?cache_info, "Analyzing screenshot");
        let start = Instant::now();
        let verdict = bound
            .adapter
            .analyze_image(image_base64, criteria, &bound.model.model, options)
            .await?;

        let result = combine(verdict, &bound, RuleKind::Vision);
        self.record(RuleKind::Vision, &bound, start, &result, None);
        Ok(result)
    }

    /// Whether rules of `kind` can run with the current settings.
    ///
    /// False when the slot's provider needs a credential that is absent,
    /// lacks the capability, or the slot's model setting is invalid.
    pub async fn can_execute_rule_type(&self, kind: RuleKind) -> bool {
        let settings = Settings::load(self.storage.as_ref()).await;
        let Ok(model) = settings.model_for(kind) else {
            return false;
        };
        model.provider.supports(kind.into()) && settings.credential(model.provider).is_ok()
    }

    /// Re-read settings, rebind every slot and evict changed adapters.
    ///
    /// Does not clear the cache; see [`LlmService::apply_settings_change`].
    pub async fn reload_settings(&self) -> ReloadOutcome {
        let settings = Settings::load(self.storage.as_ref()).await;
        let mut outcome = ReloadOutcome::default();

        {
            let mut state = self.state.lock();
            for slot in RuleKind::ALL {
                let model = match settings.model_for(slot) {
                    Ok(model) => model,
                    Err(e) => {
                        tracing::warn!(slot = %slot, error = %e, "Skipping invalid model setting");
                        continue;
                    }
                };
                let credential = settings
                    .credential(model.provider)
                    .ok()
                    .flatten()
                    .map(|c| c.fingerprint());

                let change = self.rebind(&mut state, slot, SlotBinding { model, credential });
                if change.model_changed {
                    outcome.models_changed.push(slot);
                }
                if let Some(provider) = change.evicted {
                    if !outcome.evicted.contains(&provider) {
                        outcome.evicted.push(provider);
                    }
                }
            }
            state.settings = settings;
        }

        for provider in &outcome.evicted {
            self.availability.invalidate(*provider).await;
        }
        outcome
    }

    /// Reload settings and clear the cache if any model binding changed.
    pub async fn apply_settings_change(&self) -> Result<ReloadOutcome, ServiceError> {
        let outcome = self.reload_settings().await;
        if !outcome.models_changed.is_empty() {
            self.clear_cache().await?;
        }
        Ok(outcome)
    }

    pub async fn clear_cache(&self) -> Result<(), ServiceError> {
        self.cache.clear().await.map_err(ServiceError::from)
    }

    /// Persist pending cache changes. Call on shutdown.
    pub async fn flush(&self) -> Result<(), ServiceError> {
        self.cache.flush().await.map_err(ServiceError::from)
    }

    pub fn cache(&self) -> &CacheStore<CachedValue> {
        &self.cache
    }

    /// Toggle benchmarking: bypass the cache and record measurements.
    pub fn set_benchmarking(&self, enabled: bool) {
        self.benchmarking.store(enabled, Ordering::SeqCst);
    }

    pub fn is_benchmarking(&self) -> bool {
        self.benchmarking.load(Ordering::SeqCst)
    }

    /// Whether analysis is globally enabled, per the persisted settings.
    pub async fn is_blocking_enabled(&self) -> bool {
        Settings::load(self.storage.as_ref()).await.blocking_enabled
    }

    /// Threshold for `kind` as of the last reconciliation.
    pub fn threshold(&self, kind: RuleKind) -> f64 {
        self.state.lock().settings.threshold_for(kind)
    }

    /// Usage totals of a pooled adapter that tracks them.
    pub fn provider_usage(&self, provider: ProviderId) -> Option<UsageTotals> {
        self.pool.read().get(&provider).and_then(|a| a.usage())
    }

    /// Providers that currently have a pooled adapter.
    pub fn pooled_providers(&self) -> Vec<ProviderId> {
        let mut providers: Vec<ProviderId> = self.pool.read().keys().copied().collect();
        providers.sort();
        providers
    }

    /// Cache lookup; always a miss while benchmarking.
    fn cached(&self, key: &str) -> Option<CachedValue> {
        if self.is_benchmarking() {
            return None;
        }
        self.cache.get(key)
    }

    fn store(&self, key: String, value: CachedValue) {
        if !self.is_benchmarking() {
            self.cache.set(key, value);
        }
    }

    fn record(
        &self,
        kind: RuleKind,
        bound: &BoundAdapter,
        start: Instant,
        result: &AnalysisResult,
        ground_truth: Option<bool>,
    ) {
        if !self.is_benchmarking() {
            return;
        }
        if let Some(sink) = &self.measurements {
            sink.record(Measurement {
                kind,
                provider: bound.model.provider,
                model: bound.model.model.clone(),
                latency: start.elapsed(),
                matches: result.matches,
                confidence: result.confidence,
                ground_truth,
            });
        }
    }
}

/// Bindings for every slot whose model setting parses.
fn initial_bindings(settings: &Settings) -> HashMap<RuleKind, SlotBinding> {
    RuleKind::ALL
        .into_iter()
        .filter_map(|slot| {
            let model = settings.model_for(slot).ok()?;
            let credential = settings
                .credential(model.provider)
                .ok()
                .flatten()
                .map(|c| c.fingerprint());
            Some((slot, SlotBinding { model, credential }))
        })
        .collect()
}

/// Decide an embedding comparison against the slot threshold.
fn similarity_result(similarity: f64, bound: &BoundAdapter) -> AnalysisResult {
    AnalysisResult {
        matches: similarity >= bound.threshold,
        confidence: similarity.clamp(0.0, 1.0),
        explanation: format!(
            "Cosine similarity {:.1}% (threshold: {:.1}%)",
            similarity * 100.0,
            bound.threshold * 100.0
        ),
        provider: bound.model.provider,
        cached: false,
        had_json_error: false,
    }
}

/// Combine a backend verdict with the slot threshold.
fn combine(verdict: Verdict, bound: &BoundAdapter, kind: RuleKind) -> AnalysisResult {
    let clears_threshold = verdict.confidence >= bound.threshold;
    let matches = verdict.matches && clears_threshold;

    let explanation = if verdict.matches && !clears_threshold {
        tracing::debug!(
            kind = %kind,
            confidence = verdict.confidence,
            threshold = bound.threshold,
            "Near miss: backend matched below threshold"
        );
        format!(
            "{} (below threshold: {:.1}% < {:.1}%)",
            verdict.explanation,
            verdict.confidence * 100.0,
            bound.threshold * 100.0
        )
    } else {
        verdict.explanation
    };

    AnalysisResult {
        matches,
        confidence: verdict.confidence,
        explanation,
        provider: bound.model.provider,
        cached: false,
        had_json_error: verdict.had_json_error,
    }
}

fn service_description(provider: ProviderId, settings: &Settings) -> String {
    match provider {
        ProviderId::LmStudio => format!("a running LM Studio server at {}", settings.lmstudio_url),
        ProviderId::OnDevice => "a ready on-device model".to_string(),
        other => format!("a reachable {} service", other.display_name()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::benchmark::RecordingSink;
    use crate::settings::SETTINGS_KEY;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Scripted backend behavior shared by every fake adapter.
    #[derive(Default)]
    pub(crate) struct Script {
        pub embeddings: Mutex<HashMap<String, Vec<f32>>>,
        pub verdicts: Mutex<HashMap<String, Verdict>>,
        pub unhealthy: AtomicBool,
        pub embed_calls: AtomicUsize,
        pub prompt_calls: AtomicUsize,
        pub image_calls: AtomicUsize,
        pub health_checks: AtomicUsize,
        pub created: Mutex<Vec<ProviderId>>,
        /// Simulated backend latency per call
        pub latency: Mutex<Duration>,
    }

    impl Script {
        async fn simulate_latency(&self) {
            let latency = *self.latency.lock();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
        }

        pub fn embedding(&self, text: &str, vector: Vec<f32>) {
            self.embeddings.lock().insert(text.to_string(), vector);
        }

        /// Verdict returned for `criteria`.
        pub fn verdict(&self, criteria: &str, matches: bool, confidence: f64) {
            self.verdicts.lock().insert(
                criteria.to_string(),
                Verdict {
                    matches,
                    confidence,
                    explanation: format!("scripted for {}", criteria),
                    had_json_error: false,
                },
            );
        }
    }

    struct FakeAdapter {
        id: ProviderId,
        script: Arc<Script>,
    }

    #[async_trait]
    impl ProviderAdapter for FakeAdapter {
        fn id(&self) -> ProviderId {
            self.id
        }

        async fn get_embedding(&self, text: &str, _model: &str) -> Result<Vec<f32>, ProviderError> {
            self.script.embed_calls.fetch_add(1, Ordering::SeqCst);
            self.script.simulate_latency().await;
            self.script
                .embeddings
                .lock()
                .get(text)
                .cloned()
                .ok_or_else(|| ProviderError::Backend {
                    status: 400,
                    body: format!("no embedding for {}", text),
                })
        }

        async fn analyze_with_prompt(
            &self,
            _text: &str,
            criteria: &str,
            _model: &str,
        ) -> Result<Verdict, ProviderError> {
            self.script.prompt_calls.fetch_add(1, Ordering::SeqCst);
            self.script.simulate_latency().await;
            self.script
                .verdicts
                .lock()
                .get(criteria)
                .cloned()
                .ok_or_else(|| ProviderError::MalformedResponse("no verdict".into()))
        }

        async fn analyze_image(
            &self,
            _image_base64: &str,
            criteria: &str,
            model: &str,
            _options: &ImageOptions,
        ) -> Result<Verdict, ProviderError> {
            self.script.image_calls.fetch_add(1, Ordering::SeqCst);
            self.analyze_with_prompt("", criteria, model).await
        }

        async fn health_check(&self) -> bool {
            self.script.health_checks.fetch_add(1, Ordering::SeqCst);
            !self.script.unhealthy.load(Ordering::SeqCst)
        }
    }

    pub(crate) struct FakeFactory {
        pub script: Arc<Script>,
    }

    impl AdapterFactory for FakeFactory {
        fn create(
            &self,
            provider: ProviderId,
            _settings: &Settings,
        ) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
            self.script.created.lock().push(provider);
            Ok(Arc::new(FakeAdapter {
                id: provider,
                script: self.script.clone(),
            }))
        }
    }

    pub(crate) fn test_settings() -> Settings {
        Settings {
            openai_api_key: Some("sk-test".to_string()),
            credentials_from_env: false,
            ..Settings::default()
        }
    }

    pub(crate) async fn service_with(
        settings: Settings,
    ) -> (Arc<LlmService>, Arc<MemoryStorage>, Arc<Script>) {
        let storage = Arc::new(MemoryStorage::new());
        settings.save(storage.as_ref()).await.unwrap();
        let script = Arc::new(Script::default());
        let context = ServiceContext::new(
            storage.clone(),
            Arc::new(FakeFactory {
                script: script.clone(),
            }),
        );
        (Arc::new(LlmService::new(context).await), storage, script)
    }

    async fn update_settings(storage: &MemoryStorage, change: impl FnOnce(&mut Settings)) {
        let mut settings = Settings::load(storage).await;
        change(&mut settings);
        settings.save(storage).await.unwrap();
    }

    #[tokio::test]
    async fn test_embedding_end_to_end() {
        let (service, _storage, script) = service_with(test_settings()).await;
        script.embedding("Buy one get one free", vec![2.0, 21f32.sqrt()]);
        script.embedding("advertisement", vec![1.0, 0.0]);

        let result = service
            .analyze_by_embedding("Buy one get one free", "advertisement", None)
            .await
            .unwrap();
        assert!(result.matches);
        assert_eq!(result.explanation, "Cosine similarity 40.0% (threshold: 32.0%)");
        assert!((result.confidence - 0.4).abs() < 1e-6);
        assert_eq!(result.provider, ProviderId::OpenAi);
        assert!(!result.cached);
        assert_eq!(script.embed_calls.load(Ordering::SeqCst), 2);

        let again = service
            .analyze_by_embedding("Buy one get one free", "advertisement", None)
            .await
            .unwrap();
        assert!(again.cached);
        assert_eq!(again.explanation, result.explanation);
        assert_eq!(script.embed_calls.load(Ordering::SeqCst), 2);

        // Individual embeddings were cached as well.
        service
            .get_embedding("advertisement", TextType::Criteria)
            .await
            .unwrap();
        assert_eq!(script.embed_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_embedding_failure_aborts_pair() {
        let (service, _storage, script) = service_with(test_settings()).await;
        script.embedding("advertisement", vec![1.0, 0.0]);

        let err = service
            .analyze_by_embedding("unknown text", "advertisement", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Provider(ProviderError::Backend { .. })));
    }

    #[tokio::test]
    async fn test_prompt_decision_combination() {
        let (service, _storage, script) = service_with(test_settings()).await;
        script.verdict("weak", true, 0.5);
        script.verdict("strong", true, 0.8);
        script.verdict("negative", false, 0.95);
        script.verdict("exact", true, 0.7);

        let weak = service.analyze_by_prompt("t", "weak", None).await.unwrap();
        assert!(!weak.matches);
        assert!(weak.explanation.contains("below threshold"));

        assert!(service.analyze_by_prompt("t", "strong", None).await.unwrap().matches);
        assert!(!service.analyze_by_prompt("t", "negative", None).await.unwrap().matches);
        assert!(service.analyze_by_prompt("t", "exact", None).await.unwrap().matches);

        let cached = service.analyze_by_prompt("t", "strong", None).await.unwrap();
        assert!(cached.cached);
        assert_eq!(script.prompt_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_images_never_cached() {
        let (service, _storage, script) = service_with(test_settings()).await;
        script.verdict("shows a face", true, 0.9);

        for _ in 0..2 {
            let result = service
                .analyze_by_image("AAAA", "shows a face", Some("el-1"), &ImageOptions::default())
                .await
                .unwrap();
            assert!(result.matches);
            assert!(!result.cached);
        }
        assert_eq!(script.image_calls.load(Ordering::SeqCst), 2);
        assert!(service.cache().is_empty());
    }

    #[tokio::test]
    async fn test_missing_credential_is_slot_specific() {
        let settings = Settings {
            openai_api_key: None,
            ..test_settings()
        };
        let (service, _storage, script) = service_with(settings).await;

        let err = service.analyze_by_prompt("t", "c", None).await.unwrap_err();
        match err {
            ServiceError::ProviderUnavailable {
                slot,
                provider,
                missing,
            } => {
                assert_eq!(slot, RuleKind::Prompt);
                assert_eq!(provider, ProviderId::OpenAi);
                assert!(missing.contains("OPENAI_API_KEY"));
            }
            other => panic!("Expected ProviderUnavailable, got {other:?}"),
        }
        assert!(script.created.lock().is_empty());
        assert!(!service.can_execute_rule_type(RuleKind::Prompt).await);
    }

    #[tokio::test]
    async fn test_can_execute_rule_type() {
        let settings = Settings {
            embedding_model: "openrouter:some/model".to_string(),
            openrouter_api_key: Some("or".to_string()),
            vision_model: "lmstudio:llava".to_string(),
            ..test_settings()
        };
        let (service, _storage, _script) = service_with(settings).await;

        assert!(service.can_execute_rule_type(RuleKind::Prompt).await);
        assert!(service.can_execute_rule_type(RuleKind::Vision).await);
        assert!(!service.can_execute_rule_type(RuleKind::Embedding).await);
    }

    #[tokio::test]
    async fn test_local_service_probe_is_cached() {
        let settings = Settings {
            prompt_model: "lmstudio:qwen2.5-7b".to_string(),
            ..test_settings()
        };
        let (service, _storage, script) = service_with(settings).await;
        script.unhealthy.store(true, Ordering::SeqCst);

        for _ in 0..2 {
            let err = service.analyze_by_prompt("t", "c", None).await.unwrap_err();
            assert!(
                matches!(&err, ServiceError::ProviderUnavailable { missing, .. } if missing.contains("localhost:1234"))
            );
        }
        assert_eq!(script.health_checks.load(Ordering::SeqCst), 1);
        assert_eq!(script.prompt_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_provider_switch_evicts_adapter() {
        let (service, storage, script) = service_with(test_settings()).await;
        script.verdict("c", true, 0.9);

        service.analyze_by_prompt("t", "c", None).await.unwrap();
        assert_eq!(service.pooled_providers(), vec![ProviderId::OpenAi]);

        update_settings(&storage, |s| {
            s.prompt_model = "gemini:gemini-2.0-flash".to_string();
            s.gemini_api_key = Some("g".to_string());
        })
        .await;

        let result = service.analyze_by_prompt("t", "c", None).await.unwrap();
        assert_eq!(result.provider, ProviderId::Gemini);
        assert!(!result.cached);
        assert_eq!(service.pooled_providers(), vec![ProviderId::Gemini]);
        assert_eq!(
            *script.created.lock(),
            vec![ProviderId::OpenAi, ProviderId::Gemini]
        );
    }

    #[tokio::test]
    async fn test_credential_change_recreates_adapter() {
        let (service, storage, script) = service_with(test_settings()).await;
        script.verdict("c", true, 0.9);
        service.analyze_by_prompt("t", "c", None).await.unwrap();

        update_settings(&storage, |s| s.openai_api_key = Some("sk-rotated".to_string())).await;
        service.analyze_by_prompt("t", "other", None).await.ok();

        assert_eq!(
            *script.created.lock(),
            vec![ProviderId::OpenAi, ProviderId::OpenAi]
        );
    }

    #[tokio::test]
    async fn test_settings_change_clears_cache_only_for_model_changes() {
        let (service, storage, script) = service_with(test_settings()).await;
        script.verdict("c", true, 0.9);
        service.analyze_by_prompt("t", "c", None).await.unwrap();
        assert_eq!(service.cache().len(), 1);

        update_settings(&storage, |s| s.prompt_threshold = 0.95).await;
        let outcome = service.apply_settings_change().await.unwrap();
        assert!(outcome.models_changed.is_empty());
        assert_eq!(service.cache().len(), 1);
        assert_eq!(service.threshold(RuleKind::Prompt), 0.95);

        update_settings(&storage, |s| s.prompt_model = "openai:gpt-4o".to_string()).await;
        let outcome = service.apply_settings_change().await.unwrap();
        assert_eq!(outcome.models_changed, vec![RuleKind::Prompt]);
        assert!(outcome.evicted.is_empty());
        assert!(service.cache().is_empty());
        assert_eq!(storage.get(SETTINGS_KEY).await.unwrap().unwrap()["prompt_model"], "openai:gpt-4o");
    }

    #[tokio::test]
    async fn test_benchmarking_bypasses_cache() {
        let storage = Arc::new(MemoryStorage::new());
        test_settings().save(storage.as_ref()).await.unwrap();
        let script = Arc::new(Script::default());
        let sink = Arc::new(RecordingSink::new());
        let context = ServiceContext::new(
            storage.clone(),
            Arc::new(FakeFactory {
                script: script.clone(),
            }),
        )
        .with_measurements(sink.clone());
        let service = LlmService::new(context).await;
        script.verdict("c", true, 0.9);

        service.set_benchmarking(true);
        service.analyze_by_prompt("t", "c", Some(true)).await.unwrap();
        service.analyze_by_prompt("t", "c", Some(true)).await.unwrap();

        assert_eq!(script.prompt_calls.load(Ordering::SeqCst), 2);
        assert!(service.cache().is_empty());
        let measurements = sink.measurements();
        assert_eq!(measurements.len(), 2);
        assert_eq!(measurements[0].ground_truth, Some(true));
        assert_eq!(measurements[0].kind, RuleKind::Prompt);
    }

    #[tokio::test]
    async fn test_get_or_create_provider() {
        let (service, _storage, script) = service_with(test_settings()).await;

        let a = service.get_or_create_provider("lmstudio").unwrap();
        let b = service.get_or_create_provider("lmstudio").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(script.created.lock().len(), 1);

        assert!(matches!(
            service.get_or_create_provider("bard"),
            Err(ServiceError::UnknownProvider(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_model_setting() {
        let settings = Settings {
            prompt_model: "gpt-4o".to_string(),
            ..test_settings()
        };
        let (service, _storage, _script) = service_with(settings).await;
        assert!(matches!(
            service.analyze_by_prompt("t", "c", None).await,
            Err(ServiceError::ModelSpec {
                slot: RuleKind::Prompt,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_model_change_seen_by_analysis_clears_cache() {
        let (service, storage, script) = service_with(test_settings()).await;
        script.verdict("c", true, 0.9);
        script.embedding("t", vec![1.0, 0.0]);
        service.analyze_by_prompt("t", "c", None).await.unwrap();
        service.get_embedding("t", TextType::Content).await.unwrap();
        assert_eq!(service.cache().len(), 2);

        // The next analysis reconciles the slot before anyone reloads settings.
        update_settings(&storage, |s| s.prompt_model = "openai:gpt-4o".to_string()).await;
        let result = service.analyze_by_prompt("t", "c", None).await.unwrap();
        assert!(!result.cached);
        assert_eq!(script.prompt_calls.load(Ordering::SeqCst), 2);

        assert_eq!(service.cache().len(), 1);
        assert!(service.cache().get("prompt:openai:gpt-4o-mini:t:c").is_none());
        assert!(service.cache().get("prompt:openai:gpt-4o:t:c").is_some());

        // Nothing left to report, and the new model's entry survives.
        let outcome = service.apply_settings_change().await.unwrap();
        assert!(outcome.models_changed.is_empty());
        assert_eq!(service.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_threshold_edit_applies_to_cached_verdicts() {
        let (service, storage, script) = service_with(test_settings()).await;
        script.verdict("c", true, 0.75);

        let first = service.analyze_by_prompt("t", "c", None).await.unwrap();
        assert!(first.matches);

        update_settings(&storage, |s| s.prompt_threshold = 0.8).await;
        let raised = service.analyze_by_prompt("t", "c", None).await.unwrap();
        assert!(raised.cached);
        assert!(!raised.matches);
        assert!(raised.explanation.contains("below threshold: 75.0% < 80.0%"));

        update_settings(&storage, |s| s.prompt_threshold = 0.5).await;
        let lowered = service.analyze_by_prompt("t", "c", None).await.unwrap();
        assert!(lowered.cached);
        assert!(lowered.matches);
        assert_eq!(lowered.explanation, "scripted for c");
        assert_eq!(script.prompt_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_threshold_edit_applies_to_cached_similarity() {
        let (service, storage, script) = service_with(test_settings()).await;
        script.embedding("Buy one get one free", vec![2.0, 21f32.sqrt()]);
        script.embedding("advertisement", vec![1.0, 0.0]);

        let first = service
            .analyze_by_embedding("Buy one get one free", "advertisement", None)
            .await
            .unwrap();
        assert!(first.matches);

        update_settings(&storage, |s| s.embedding_threshold = 0.5).await;
        let raised = service
            .analyze_by_embedding("Buy one get one free", "advertisement", None)
            .await
            .unwrap();
        assert!(raised.cached);
        assert!(!raised.matches);
        assert_eq!(raised.explanation, "Cosine similarity 40.0% (threshold: 50.0%)");
        assert_eq!(script.embed_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cached_value_untagged() {
        let embedding: CachedValue = serde_json::from_str("[0.5, 1.0]").unwrap();
        assert_eq!(embedding, CachedValue::Embedding(vec![0.5, 1.0]));

        let similarity: CachedValue = serde_json::from_str("0.4").unwrap();
        assert_eq!(similarity, CachedValue::Similarity(0.4));

        let verdict: CachedValue =
            serde_json::from_str(r#"{"matches":true,"confidence":0.9,"explanation":"x"}"#).unwrap();
        assert!(matches!(verdict, CachedValue::Verdict(v) if v.matches));
    }
}
