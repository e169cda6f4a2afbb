//! Rule DSL parsing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::domain::validate_domain;
use super::{Condition, Rule, RuleError, RuleKind};

/// Separator between the domain list and the selector.
const DOMAIN_SEPARATOR: &str = "#?#";

/// Marker between the selector and the rule kind.
const MEANING_MARKER: &str = ":contains-meaning-";

/// Parse a rule string into a [`Rule`].
///
/// The returned rule keeps `rule_string` byte-identical to the input, is
/// enabled, and carries an id derived from the rule string.
///
/// # Errors
///
/// * [`RuleError::InvalidFormat`] when the string is not a rule
/// * [`RuleError::InvalidDomain`] when a domain token is malformed
pub fn parse(rule_string: &str) -> Result<Rule, RuleError> {
    let marker = rule_string.find(MEANING_MARKER).ok_or_else(|| {
        RuleError::InvalidFormat(format!("missing '{}' in '{}'", MEANING_MARKER, rule_string))
    })?;

    // The separator is only looked for before the marker so rule text may contain it.
    let head = &rule_string[..marker];
    let (domains, selector) = match head.find(DOMAIN_SEPARATOR) {
        Some(pos) => (
            parse_domain_list(&head[..pos])?,
            &head[pos + DOMAIN_SEPARATOR.len()..],
        ),
        None => (Vec::new(), head),
    };

    if selector.trim().is_empty() {
        return Err(RuleError::InvalidFormat("selector is empty".to_string()));
    }

    let rest = &rule_string[marker + MEANING_MARKER.len()..];
    let open = rest.find('(').ok_or_else(|| {
        RuleError::InvalidFormat(format!("missing '(' after rule kind in '{}'", rule_string))
    })?;

    let keyword = &rest[..open];
    let kind = RuleKind::from_keyword(keyword).ok_or_else(|| {
        RuleError::InvalidFormat(format!(
            "unknown rule kind '{}', expected embedding, prompt or vision",
            keyword
        ))
    })?;

    let text = parse_quoted_argument(&rest[open..])?;

    Ok(Rule {
        id: rule_id(rule_string),
        selector: selector.to_string(),
        enabled: true,
        rule_string: rule_string.to_string(),
        domains,
        condition: Condition::new(kind, text),
    })
}

/// Check whether a rule string parses.
pub fn validate(rule_string: &str) -> bool {
    parse(rule_string).is_ok()
}

/// Render the canonical rule string for a set of rule parts.
pub fn render(domains: &[String], selector: &str, condition: &Condition) -> String {
    let mut out = String::new();
    if !domains.is_empty() {
        out.push_str(&domains.join(","));
        out.push_str(DOMAIN_SEPARATOR);
    }
    out.push_str(selector);
    out.push_str(MEANING_MARKER);
    out.push_str(condition.kind().as_str());
    out.push_str("('");
    out.push_str(condition.text());
    out.push_str("')");
    out
}

fn parse_domain_list(list: &str) -> Result<Vec<String>, RuleError> {
    if list.trim().is_empty() {
        return Err(RuleError::InvalidFormat(format!(
            "empty domain list before '{}'",
            DOMAIN_SEPARATOR
        )));
    }

    list.split(',')
        .map(str::trim)
        .map(|token| validate_domain(token).map(|_| token.to_string()))
        .collect()
}

/// Parse `('text')` or `("text")`; the closing quote must match the opening one.
fn parse_quoted_argument(arg: &str) -> Result<&str, RuleError> {
    let inner = arg
        .strip_prefix('(')
        .and_then(|a| a.strip_suffix(')'))
        .ok_or_else(|| {
            RuleError::InvalidFormat(format!("argument must be wrapped in parentheses: {}", arg))
        })?;

    let quote = inner
        .chars()
        .next()
        .filter(|c| *c == '\'' || *c == '"')
        .ok_or_else(|| RuleError::InvalidFormat(format!("argument must be quoted: {}", inner)))?;

    let text = inner
        .strip_prefix(quote)
        .and_then(|t| t.strip_suffix(quote))
        .ok_or_else(|| RuleError::InvalidFormat(format!("unterminated quote in {}", inner)))?;

    if text.trim().is_empty() {
        return Err(RuleError::InvalidFormat("rule text is empty".to_string()));
    }

    Ok(text)
}

fn rule_id(rule_string: &str) -> String {
    let mut hasher = DefaultHasher::new();
    rule_string.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
