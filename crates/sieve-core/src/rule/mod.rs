//! Rule model and rule sets.
//!
//! A rule binds a selector and a classification criterion to one of three
//! evaluation kinds. Rules are written in a small DSL:
//!
//! ```text
//! [domain1,domain2#?#]selector:contains-meaning-{embedding|prompt|vision}('text')
//! ```

pub mod domain;
mod parser;

pub use parser::{parse, render, validate};

use domain::domain_matches;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur when parsing rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("Invalid rule format: {0}")]
    InvalidFormat(String),

    #[error("Invalid domain '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: String },

    #[error("Failed to parse rule file: {0}")]
    RuleFile(String),
}

/// The evaluation kind of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Embedding,
    Prompt,
    Vision,
}

impl RuleKind {
    /// All kinds, in evaluation-slot order.
    pub const ALL: [RuleKind; 3] = [RuleKind::Embedding, RuleKind::Prompt, RuleKind::Vision];

    /// The DSL keyword for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Embedding => "embedding",
            RuleKind::Prompt => "prompt",
            RuleKind::Vision => "vision",
        }
    }

    pub(crate) fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "embedding" => Some(RuleKind::Embedding),
            "prompt" => Some(RuleKind::Prompt),
            "vision" => Some(RuleKind::Vision),
            _ => None,
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind-specific part of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Reference phrase compared by vector similarity.
    Embedding {
        #[serde(rename = "containsText")]
        contains_text: String,
    },

    /// Instruction sent to a text-completion backend.
    Prompt { prompt: String },

    /// Instruction sent to an image-capable backend.
    Vision { criteria: String },
}

impl Condition {
    /// Build a condition of the given kind around its text.
    pub fn new(kind: RuleKind, text: impl Into<String>) -> Self {
        let text = text.into();
        match kind {
            RuleKind::Embedding => Condition::Embedding {
                contains_text: text,
            },
            RuleKind::Prompt => Condition::Prompt { prompt: text },
            RuleKind::Vision => Condition::Vision { criteria: text },
        }
    }

    pub fn kind(&self) -> RuleKind {
        match self {
            Condition::Embedding { .. } => RuleKind::Embedding,
            Condition::Prompt { .. } => RuleKind::Prompt,
            Condition::Vision { .. } => RuleKind::Vision,
        }
    }

    /// The quoted text of the rule, whatever its kind.
    pub fn text(&self) -> &str {
        match self {
            Condition::Embedding { contains_text } => contains_text,
            Condition::Prompt { prompt } => prompt,
            Condition::Vision { criteria } => criteria,
        }
    }
}

/// A parsed rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Opaque unique identifier
    pub id: String,

    /// DOM query string, compared as an opaque string
    pub selector: String,

    pub enabled: bool,

    /// Canonical source text; re-parses to an equivalent rule
    pub rule_string: String,

    /// Domain and path patterns; empty applies everywhere
    #[serde(default)]
    pub domains: Vec<String>,

    #[serde(flatten)]
    pub condition: Condition,
}

impl Rule {
    /// Build a rule from its parts, rendering the canonical rule string.
    ///
    /// Domains are not validated here; use [`parse`] on untrusted input.
    pub fn new(
        id: impl Into<String>,
        domains: Vec<String>,
        selector: impl Into<String>,
        condition: Condition,
    ) -> Self {
        let selector = selector.into();
        let rule_string = render(&domains, &selector, &condition);
        Self {
            id: id.into(),
            selector,
            enabled: true,
            rule_string,
            domains,
            condition,
        }
    }

    pub fn kind(&self) -> RuleKind {
        self.condition.kind()
    }

    pub fn text(&self) -> &str {
        self.condition.text()
    }

    /// Whether this rule is scoped to the page at `url`.
    pub fn applies_to(&self, url: &str) -> bool {
        self.domains.is_empty() || self.domains.iter().any(|d| domain_matches(d, url))
    }

    /// Structural equality ignoring the id and enabled flag.
    pub fn is_equivalent(&self, other: &Rule) -> bool {
        self.selector == other.selector
            && self.domains == other.domains
            && self.condition == other.condition
    }
}

/// An ordered collection of rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

/// One entry of a YAML rule file.
#[derive(Debug, Deserialize)]
struct RuleEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    rule: String,
}

fn default_enabled() -> bool {
    true
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Parse newline-separated rule strings.
    ///
    /// Blank lines and lines starting with `!` are skipped. Ids are assigned
    /// as `rule-{n}` in file order.
    pub fn from_lines(text: &str) -> Result<Self, RuleError> {
        let mut rules = Vec::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('!') {
                continue;
            }
            let mut rule = parse(line)?;
            rule.id = format!("rule-{}", rules.len() + 1);
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    /// Parse a YAML list of `{id?, enabled?, rule}` entries.
    pub fn from_yaml(yaml: &str) -> Result<Self, RuleError> {
        let entries: Vec<RuleEntry> =
            serde_yaml::from_str(yaml).map_err(|e| RuleError::RuleFile(e.to_string()))?;

        let mut rules = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let mut rule = parse(&entry.rule)?;
            rule.id = entry.id.unwrap_or_else(|| format!("rule-{}", index + 1));
            rule.enabled = entry.enabled;
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Enabled rules in declaration order.
    pub fn enabled(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    /// Enabled rules whose selector equals `selector` and whose domains
    /// cover `url` (when a url is known).
    pub fn applicable<'a>(
        &'a self,
        selector: &'a str,
        url: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Rule> + 'a {
        self.enabled()
            .filter(move |r| r.selector == selector)
            .filter(move |r| url.map_or(true, |u| r.applies_to(u)))
    }

    /// The distinct kinds present among enabled rules.
    pub fn enabled_kinds(&self) -> Vec<RuleKind> {
        let mut kinds: Vec<RuleKind> = self.enabled().map(Rule::kind).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}

impl From<Vec<Rule>> for RuleSet {
    fn from(rules: Vec<Rule>) -> Self {
        Self::new(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES_YAML: &str = r#"
- id: "ads"
  rule: "div.post:contains-meaning-embedding('advertisement')"
- rule: "example.org#?#article:contains-meaning-prompt('is clickbait')"
  enabled: false
- id: "promo"
  rule: "img.banner:contains-meaning-vision('promotional banner')"
"#;

    #[test]
    fn test_rule_new_renders_rule_string() {
        let rule = Rule::new(
            "r1",
            vec!["example.org".to_string()],
            "div",
            Condition::new(RuleKind::Prompt, "is spam"),
        );
        assert_eq!(
            rule.rule_string,
            "example.org#?#div:contains-meaning-prompt('is spam')"
        );
        assert!(rule.is_equivalent(&parse(&rule.rule_string).unwrap()));
    }

    #[test]
    fn test_rule_set_from_yaml() {
        let set = RuleSet::from_yaml(RULES_YAML).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.rules()[0].id, "ads");
        assert_eq!(set.rules()[1].id, "rule-2");
        assert!(!set.rules()[1].enabled);
        assert_eq!(set.enabled().count(), 2);
        assert_eq!(
            set.enabled_kinds(),
            vec![RuleKind::Embedding, RuleKind::Vision]
        );
    }

    #[test]
    fn test_rule_set_from_yaml_bad_rule() {
        let yaml = "- rule: \"div:contains-meaning-magic('x')\"\n";
        assert!(matches!(
            RuleSet::from_yaml(yaml),
            Err(RuleError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_rule_set_from_lines_skips_comments() {
        let text = "! my rules\n\ndiv:contains-meaning-embedding('ads')\n  span:contains-meaning-prompt('spoiler')  \n";
        let set = RuleSet::from_lines(text).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.rules()[1].id, "rule-2");
        assert_eq!(set.rules()[1].selector, "span");
    }

    #[test]
    fn test_applicable_filters_selector_and_domain() {
        let set = RuleSet::from_lines(
            "div:contains-meaning-embedding('ads')\n\
             news.com#?#div:contains-meaning-prompt('politics')\n\
             span:contains-meaning-embedding('ads')",
        )
        .unwrap();

        let on_news: Vec<_> = set
            .applicable("div", Some("https://news.com/today"))
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(on_news, vec!["rule-1", "rule-2"]);

        let elsewhere: Vec<_> = set
            .applicable("div", Some("https://blog.org/"))
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(elsewhere, vec!["rule-1"]);

        assert_eq!(set.applicable("div", None).count(), 2);
    }

    #[test]
    fn test_rule_serializes_flat() {
        let rule = parse("div:contains-meaning-vision('nsfw')").unwrap();
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["type"], "vision");
        assert_eq!(json["criteria"], "nsfw");
        assert_eq!(json["ruleString"], "div:contains-meaning-vision('nsfw')");
        let back: Rule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }
}
