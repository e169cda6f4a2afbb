//! Streaming batch analysis.
//!
//! [`BatchAnalyzer::analyze_stream`] evaluates candidate elements against
//! the enabled rules through the [`LlmService`] and reports one
//! [`StreamMessage::Result`] per element as soon as that element is done,
//! then a single [`StreamMessage::Complete`]. The consumer may drop its
//! receiver at any time; the analyzer notices before each element and
//! before each send and stops quietly.
//!
//! Elements are evaluated one at a time and each element's rules in
//! declaration order, which bounds in-flight backend calls and makes the
//! best-match tie-break deterministic.

use serde::{Deserialize, Serialize};
use sieve_core::{Rule, RuleKind, RuleSet};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::providers::ImageOptions;
use crate::service::{AnalysisResult, LlmService, ServiceError};

/// A batch of candidate elements captured from one page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub elements: Vec<ElementInput>,

    /// Page the elements came from, used for domain scoping
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementInput {
    pub id: String,
    pub text: String,
    /// Selector the element was captured with
    pub selector: String,
    /// Expected answer for benchmark runs
    #[serde(default)]
    pub ground_truth: Option<bool>,
}

/// Per-element verdict sent to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementResult {
    pub element_id: String,
    pub matches: bool,
    /// Id of the winning rule
    pub rule: Option<String>,
    pub confidence: f64,
    pub threshold: Option<f64>,
}

impl ElementResult {
    fn no_match(element_id: &str) -> Self {
        Self {
            element_id: element_id.to_string(),
            matches: false,
            rule: None,
            confidence: 0.0,
            threshold: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamMessage {
    Result { data: ElementResult },
    Complete,
    Error { error: String },
}

/// Why a stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    /// Every element was evaluated and `Complete` was sent
    Completed,
    /// Pre-flight found nothing to do; only `Complete` was sent
    Skipped(&'static str),
    /// The consumer went away
    Disconnected,
    /// An analysis failed and `Error` was sent
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSummary {
    /// Elements whose evaluation finished
    pub evaluated: usize,
    /// Result messages delivered
    pub emitted: usize,
    pub matched: usize,
    pub outcome: StreamOutcome,
}

/// Producer half of a stream channel.
///
/// Send failures mean the consumer disconnected; they are logged, never
/// returned.
#[derive(Debug, Clone)]
pub struct StreamPort {
    sender: mpsc::Sender<StreamMessage>,
}

impl StreamPort {
    pub fn new(sender: mpsc::Sender<StreamMessage>) -> Self {
        Self { sender }
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Send `message`, returning whether it was delivered to the channel.
    pub async fn send(&self, message: StreamMessage) -> bool {
        match self.sender.send(message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(message = ?e.0, "Stream consumer disconnected, dropping message");
                false
            }
        }
    }
}

/// Create a stream port and the consumer's receiver.
pub fn stream_channel(capacity: usize) -> (StreamPort, mpsc::Receiver<StreamMessage>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (StreamPort::new(sender), receiver)
}

/// Tracks the winning rule for one element.
///
/// The highest confidence among matching rules wins; on an exact tie the
/// rule evaluated first keeps it.
#[derive(Debug, Default)]
struct BestMatch<'a> {
    winner: Option<(&'a Rule, f64, f64)>,
    /// Highest confidence seen on any rule, with its threshold
    strongest: Option<(f64, f64)>,
}

impl<'a> BestMatch<'a> {
    fn observe(&mut self, rule: &'a Rule, result: &AnalysisResult, threshold: f64) {
        if self.strongest.map_or(true, |(c, _)| result.confidence > c) {
            self.strongest = Some((result.confidence, threshold));
        }
        if !result.matches {
            return;
        }
        if self.winner.map_or(true, |(_, c, _)| result.confidence > c) {
            self.winner = Some((rule, result.confidence, threshold));
        }
    }

    fn into_result(self, element_id: &str) -> ElementResult {
        match (self.winner, self.strongest) {
            (Some((rule, confidence, threshold)), _) => ElementResult {
                element_id: element_id.to_string(),
                matches: true,
                rule: Some(rule.id.clone()),
                confidence,
                threshold: Some(threshold),
            },
            (None, Some((confidence, threshold))) => ElementResult {
                confidence,
                threshold: Some(threshold),
                ..ElementResult::no_match(element_id)
            },
            (None, None) => ElementResult::no_match(element_id),
        }
    }
}

pub struct BatchAnalyzer {
    service: Arc<LlmService>,
}

impl BatchAnalyzer {
    pub fn new(service: Arc<LlmService>) -> Self {
        Self { service }
    }

    /// Evaluate `request` against `rules`, streaming results into `port`.
    pub async fn analyze_stream(
        &self,
        rules: &RuleSet,
        request: AnalysisRequest,
        port: StreamPort,
    ) -> StreamSummary {
        let mut summary = StreamSummary {
            evaluated: 0,
            emitted: 0,
            matched: 0,
            outcome: StreamOutcome::Completed,
        };

        if let Some(reason) = self.preflight(rules).await {
            tracing::info!(reason, "Skipping batch analysis");
            port.send(StreamMessage::Complete).await;
            summary.outcome = StreamOutcome::Skipped(reason);
            return summary;
        }

        let executable = self.executable_kinds(rules).await;
        let url = request.url.as_deref();
        tracing::info!(
            elements = request.elements.len(),
            rules = rules.len(),
            "Starting batch analysis"
        );

        for element in &request.elements {
            if !port.is_open() {
                tracing::debug!(evaluated = summary.evaluated, "Consumer gone before element");
                summary.outcome = StreamOutcome::Disconnected;
                return summary;
            }

            let result = match self.evaluate_element(rules, element, url, &executable).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(element = %element.id, error = %e, "Element analysis failed");
                    port.send(StreamMessage::Error {
                        error: e.to_string(),
                    })
                    .await;
                    summary.outcome = StreamOutcome::Failed;
                    return summary;
                }
            };
            summary.evaluated += 1;

            if !port.is_open() {
                tracing::debug!(evaluated = summary.evaluated, "Consumer gone before send");
                summary.outcome = StreamOutcome::Disconnected;
                return summary;
            }
            if result.matches {
                summary.matched += 1;
            }
            if !port.send(StreamMessage::Result { data: result }).await {
                summary.outcome = StreamOutcome::Disconnected;
                return summary;
            }
            summary.emitted += 1;
        }

        if port.is_open() {
            port.send(StreamMessage::Complete).await;
        } else {
            summary.outcome = StreamOutcome::Disconnected;
        }

        tracing::info!(
            evaluated = summary.evaluated,
            matched = summary.matched,
            "Batch analysis finished"
        );
        summary
    }

    /// Evaluate the vision rules that apply to one element's screenshot.
    pub async fn analyze_screenshot(
        &self,
        rules: &RuleSet,
        element_id: &str,
        selector: &str,
        url: Option<&str>,
        image_base64: &str,
        options: &ImageOptions,
    ) -> Result<ElementResult, ServiceError> {
        if !self.service.can_execute_rule_type(RuleKind::Vision).await {
            return Ok(ElementResult::no_match(element_id));
        }

        let mut best = BestMatch::default();
        for rule in rules
            .applicable(selector, url)
            .filter(|r| r.kind() == RuleKind::Vision)
        {
            let result = self
                .service
                .analyze_by_image(image_base64, rule.text(), Some(element_id), options)
                .await?;
            best.observe(rule, &result, self.service.threshold(RuleKind::Vision));
        }
        Ok(best.into_result(element_id))
    }

    /// Reason to skip the whole batch, if any.
    async fn preflight(&self, rules: &RuleSet) -> Option<&'static str> {
        if !self.service.is_blocking_enabled().await {
            return Some("blocking disabled");
        }
        if self.executable_kinds(rules).await.is_empty() {
            return Some("no executable rules");
        }
        None
    }

    async fn executable_kinds(&self, rules: &RuleSet) -> Vec<RuleKind> {
        let mut kinds = Vec::new();
        for kind in rules.enabled_kinds() {
            if self.service.can_execute_rule_type(kind).await {
                kinds.push(kind);
            }
        }
        kinds
    }

    async fn evaluate_element(
        &self,
        rules: &RuleSet,
        element: &ElementInput,
        url: Option<&str>,
        executable: &[RuleKind],
    ) -> Result<ElementResult, ServiceError> {
        let mut best = BestMatch::default();

        for rule in rules.applicable(&element.selector, url) {
            let kind = rule.kind();
            if !executable.contains(&kind) {
                continue;
            }
            let result = match kind {
                RuleKind::Embedding => {
                    self.service
                        .analyze_by_embedding(&element.text, rule.text(), element.ground_truth)
                        .await?
                }
                RuleKind::Prompt => {
                    self.service
                        .analyze_by_prompt(&element.text, rule.text(), element.ground_truth)
                        .await?
                }
                // Screenshots arrive through analyze_screenshot.
                RuleKind::Vision => continue,
            };

            let threshold = self.service.threshold(kind);
            if result.matches {
                tracing::debug!(element = %element.id, rule = %rule.id, confidence = result.confidence, "Rule matched");
            }
            best.observe(rule, &result, threshold);
        }

        Ok(best.into_result(&element.id))
    }
}
