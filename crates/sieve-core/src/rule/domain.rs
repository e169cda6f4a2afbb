//! Domain patterns a rule can be scoped to.
//!
//! A domain token is one of:
//! - `localhost`
//! - `file://` (local files)
//! - a path fragment such as `reddit.com/r/news` or `/watch`
//! - a dotted hostname pattern, optionally with `*` wildcards
//!   (`*.example.org`, `cdn*.example.com`)

use lazy_static::lazy_static;
use regex::Regex;

use super::RuleError;

lazy_static! {
    /// Dotted hostname with optional `*` wildcards and port.
    /// No empty labels, so leading, trailing and doubled dots are rejected.
    static ref HOSTNAME_PATTERN: Regex = Regex::new(
        r"^[A-Za-z0-9*-]+(\.[A-Za-z0-9*-]+)+(:\d{1,5})?$"
    ).unwrap();
}

/// Validate a single domain token.
pub fn validate_domain(token: &str) -> Result<(), RuleError> {
    let invalid = |reason: &str| RuleError::InvalidDomain {
        domain: token.to_string(),
        reason: reason.to_string(),
    };

    if token.is_empty() {
        return Err(invalid("empty domain"));
    }

    if token == "localhost" || token == "file://" {
        return Ok(());
    }

    if token.chars().any(char::is_control) {
        return Err(invalid("contains control characters"));
    }

    // Path fragments may carry a query or fragment.
    if token.contains('/') {
        return Ok(());
    }

    if token.chars().any(|c| c.is_whitespace() || c == '#' || c == '?') {
        return Err(invalid("contains whitespace, '#' or '?'"));
    }

    if token.chars().all(|c| c == '*' || c == '.') {
        return Err(invalid("bare wildcard"));
    }

    if token.starts_with('.') || token.ends_with('.') {
        return Err(invalid("leading or trailing dot"));
    }

    if !HOSTNAME_PATTERN.is_match(token) {
        return Err(invalid("not a dotted hostname pattern"));
    }

    Ok(())
}

/// Split a URL into (scheme, host, path). Host is lowercased, port dropped.
fn split_url(url: &str) -> (&str, String, &str) {
    let (scheme, rest) = match url.find("://") {
        Some(pos) => (&url[..pos], &url[pos + 3..]),
        None => ("", url),
    };

    let path_start = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..path_start];
    let path = &rest[path_start..];

    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    let host = host_port.split(':').next().unwrap_or(host_port);

    (scheme, host.to_ascii_lowercase(), path)
}

/// Whether the domain pattern covers the page at `url`.
///
/// Plain hostnames also cover their sub-domains. Wildcard patterns match
/// exactly what the wildcard allows, so `*.example.org` covers
/// `www.example.org` but not `example.org`.
pub fn domain_matches(pattern: &str, url: &str) -> bool {
    let (scheme, host, path) = split_url(url);

    if pattern == "file://" {
        return scheme.eq_ignore_ascii_case("file");
    }

    if pattern == "localhost" {
        return host == "localhost";
    }

    if pattern.contains('/') {
        if pattern.starts_with("file://") {
            return url.starts_with(pattern);
        }
        if pattern.starts_with('/') {
            return path.starts_with(pattern);
        }
        let location = format!("{}{}", host, path);
        let pattern = pattern.to_ascii_lowercase();
        return location.starts_with(&pattern)
            || location
                .strip_prefix("www.")
                .is_some_and(|l| l.starts_with(&pattern));
    }

    let pattern = pattern.to_ascii_lowercase();
    let pattern = pattern.split(':').next().unwrap_or(&pattern);

    if pattern.contains('*') {
        return wildcard_match(pattern.as_bytes(), host.as_bytes());
    }

    host == pattern
        || host
            .strip_suffix(pattern)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Glob match where `*` matches one or more characters.
///
/// Iterative with a single backtrack point, so it runs in O(pattern * text)
/// however many stars the pattern holds.
fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    // (pattern index after the last star, text index it resumes from)
    let mut resume: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                // The star takes text[t] unconditionally.
                p += 1;
                t += 1;
                resume = Some((p, t));
            }
            Some(c) if *c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match resume {
                Some((star_p, star_t)) => {
                    p = star_p;
                    t = star_t + 1;
                    resume = Some((star_p, t));
                }
                None => return false,
            },
        }
    }

    p == pattern.len()
}
