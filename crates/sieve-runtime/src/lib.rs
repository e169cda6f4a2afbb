//! # sieve-runtime
//!
//! LLM-backed analysis for sieve rules.
//!
//! This crate turns parsed rules from `sieve-core` into decisions by
//! delegating to one of several interchangeable backends:
//! - OpenAI and Gemini cloud APIs
//! - A local LM Studio server
//! - An on-device model supplied by the host
//! - The OpenRouter federated router
//!
//! [`LlmService`] owns the provider pool, the persistent analysis cache and
//! the threshold logic. [`BatchAnalyzer`] streams per-element results for
//! a whole page over a cancellable channel.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sieve_core::RuleSet;
//! use sieve_runtime::{
//!     stream_channel, AnalysisRequest, BatchAnalyzer, BuiltinAdapterFactory, FileStorage,
//!     LlmService, ServiceContext,
//! };
//!
//! let storage = Arc::new(FileStorage::new(".sieve"));
//! let context = ServiceContext::new(storage, Arc::new(BuiltinAdapterFactory::new()));
//! let service = Arc::new(LlmService::new(context).await);
//!
//! let rules = RuleSet::from_lines("div.post:contains-meaning-prompt('is a sponsored post')")?;
//! let (port, mut results) = stream_channel(32);
//! let request: AnalysisRequest = serde_json::from_str(&request_json)?;
//! tokio::spawn(async move { BatchAnalyzer::new(service).analyze_stream(&rules, request, port).await });
//! while let Some(message) = results.recv().await {
//!     println!("{:?}", message);
//! }
//! ```

pub mod analyzer;
pub mod availability;
pub mod benchmark;
pub mod cache;
pub mod prompts;
pub mod providers;
pub mod service;
pub mod settings;
pub mod storage;

pub use analyzer::{
    stream_channel, AnalysisRequest, BatchAnalyzer, ElementInput, ElementResult, StreamMessage,
    StreamOutcome, StreamPort, StreamSummary,
};
pub use availability::{Availability, AvailabilityCache, AVAILABILITY_TTL};
pub use benchmark::{Measurement, MeasurementSink, RecordingSink};
pub use cache::{CacheConfig, CacheStats, CacheStore};
pub use providers::{
    AdapterFactory, ApiCredential, BuiltinAdapterFactory, Capability, ImageOptions,
    OnDeviceAvailability, OnDeviceModel, OnDeviceSession, ProviderAdapter, ProviderError,
    ProviderId, UsageTotals, Verdict,
};
pub use service::{
    AnalysisResult, BoundAdapter, CachedValue, LlmService, ReloadOutcome, ServiceContext,
    ServiceError, TextType,
};
pub use settings::{ModelSpec, ModelSpecError, Settings, UiPreferences};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
