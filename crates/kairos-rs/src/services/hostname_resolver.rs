//! Maps a request `Host` header to a service identity.
//!
//! Adapted from the path-matcher's regex-compilation technique: each
//! configured hostname pattern is compiled once into an anchored regex;
//! matching returns the **pattern string itself** as the service
//! identity (not the raw hostname), so every hostname that matches a
//! wildcard pattern shares one [`crate::services::service_instance::ServiceInstance`].

use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum HostnameResolveError {
    #[error("no service matches hostname: {hostname}")]
    NoMatchingService { hostname: String },
    #[error("invalid hostname pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternKind {
    Exact,
    Wildcard,
    Regex,
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    pattern: String,
    kind: PatternKind,
    regex: Arc<Regex>,
}

/// Compiles and ranks hostname patterns so resolution always prefers
/// exact matches over wildcard/regex ones, and earlier declarations
/// over later ones within the same category.
///
/// Compilation failure is a hard configuration error: a failed regex
/// never silently falls back to glob matching and loses capture
/// groups.
#[derive(Debug)]
pub struct HostnameResolver {
    patterns: Vec<CompiledPattern>,
}

impl HostnameResolver {
    pub fn new(raw_patterns: &[String]) -> Result<Self, HostnameResolveError> {
        let mut patterns = Vec::with_capacity(raw_patterns.len());
        for (declared_order, pattern) in raw_patterns.iter().enumerate() {
            let kind = classify(pattern);
            let regex_source = to_anchored_regex(pattern);
            let regex = Regex::new(&regex_source).map_err(|e| HostnameResolveError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            patterns.push(CompiledPattern {
                pattern: pattern.clone(),
                kind,
                regex: Arc::new(regex),
            });
            let _ = declared_order;
        }
        Ok(Self { patterns })
    }

    /// Resolves `hostname` to `(service identity, capture groups)`.
    /// Exact patterns are tried before wildcard/regex patterns; within
    /// a category, declaration order (first-declared wins) is preserved
    /// because patterns are scanned in the order they were compiled.
    pub fn resolve<'a>(
        &'a self,
        hostname: &str,
    ) -> Result<(&'a str, Vec<String>), HostnameResolveError> {
        for kind in [PatternKind::Exact, PatternKind::Wildcard, PatternKind::Regex] {
            for compiled in self.patterns.iter().filter(|p| p.kind == kind) {
                if let Some(captures) = compiled.regex.captures(hostname) {
                    let groups = (1..captures.len())
                        .map(|i| captures.get(i).map(|m| m.as_str().to_string()).unwrap_or_default())
                        .collect();
                    return Ok((compiled.pattern.as_str(), groups));
                }
            }
        }
        Err(HostnameResolveError::NoMatchingService {
            hostname: hostname.to_string(),
        })
    }
}

fn classify(pattern: &str) -> PatternKind {
    if pattern.starts_with('*') {
        PatternKind::Wildcard
    } else if pattern.contains(['\\', '+', '(', ')', '[', ']', '{', '}', '|', '^', '$', '?']) {
        PatternKind::Regex
    } else {
        PatternKind::Exact
    }
}

/// Converts a hostname pattern into an anchored regex source.
/// - Exact patterns: every `.` is escaped literally.
/// - Wildcard patterns (`*.example.com`): `*` becomes `[^.]+`, the rest
///   is escaped literally.
/// - Anything else is treated as a regex the operator wrote directly
///   (already capable of capture groups) and is anchored as-is.
fn to_anchored_regex(pattern: &str) -> String {
    match classify(pattern) {
        PatternKind::Exact => format!("^{}$", regex::escape(pattern)),
        PatternKind::Wildcard => {
            let escaped = regex::escape(&pattern[1..]);
            format!("^[^.]+{}$", escaped)
        }
        PatternKind::Regex => format!("^{}$", pattern),
    }
}

/// Expands `$1..$9` placeholders in a backend URL template using the
/// capture groups returned by [`HostnameResolver::resolve`]. Expansion
/// happens before URL validation, per §4.A.
pub fn expand_backend_url(template: &str, captures: &[String]) -> String {
    let mut result = template.to_string();
    for (i, value) in captures.iter().enumerate().take(9) {
        let placeholder = format!("${}", i + 1);
        result = result.replace(&placeholder, value);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_beats_wildcard() {
        let resolver = HostnameResolver::new(&[
            "*.example.com".to_string(),
            "a.example.com".to_string(),
        ])
        .unwrap();
        let (identity, _) = resolver.resolve("a.example.com").unwrap();
        assert_eq!(identity, "a.example.com");
    }

    #[test]
    fn wildcard_shares_identity_across_hostnames() {
        let resolver = HostnameResolver::new(&["*.example.com".to_string()]).unwrap();
        let (id_a, _) = resolver.resolve("a.example.com").unwrap();
        let (id_b, _) = resolver.resolve("b.example.com").unwrap();
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn regex_pattern_captures_groups_for_url_expansion() {
        let resolver =
            HostnameResolver::new(&[r"(.+)\.(.+)\.com".to_string()]).unwrap();
        let (_, captures) = resolver.resolve("a.b.com").unwrap();
        let expanded = expand_backend_url("https://$1-$2.origin", &captures);
        assert_eq!(expanded, "https://a-b.origin");
    }

    #[test]
    fn invalid_regex_is_a_hard_error_not_a_glob_fallback() {
        let result = HostnameResolver::new(&["a(b".to_string()]);
        assert!(matches!(
            result,
            Err(HostnameResolveError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn no_match_is_reported() {
        let resolver = HostnameResolver::new(&["a.example.com".to_string()]).unwrap();
        assert!(resolver.resolve("unknown.example.com").is_err());
    }
}
