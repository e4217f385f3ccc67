//! Route matching logic.
//!
//! # Responsibilities
//! - Match host header (exact match, case-insensitive, port ignored)
//! - Match path prefix segment by segment, capturing `{param}` segments
//!
//! # Design Decisions
//! - Host matching is case-insensitive (per HTTP spec)
//! - Path matching is case-sensitive
//! - `/api` matches `/api` and `/api/x`, never `/apix`
//! - No regex to guarantee O(n) matching

use std::collections::HashMap;

/// Matches the Host header.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// The host is normalized to lowercase for case-insensitive matching.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_lowercase(),
        }
    }

    pub fn matches(&self, host: Option<&str>) -> bool {
        host.map(strip_port)
            .is_some_and(|name| name.eq_ignore_ascii_case(&self.expected_host))
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A path prefix whose segments may be `{name}` captures.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        let raw = pattern.into();
        let segments = raw
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| match s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) => Segment::Param(name.to_string()),
                None => Segment::Literal(s.to_string()),
            })
            .collect();
        Self { raw, segments }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Ordering key: more segments first, then more literal segments.
    pub fn specificity(&self) -> (usize, usize) {
        let literals = self
            .segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count();
        (self.segments.len(), literals)
    }

    /// Captured parameters when `path` starts with this pattern.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let mut parts = path.split('/').filter(|s| !s.is_empty());
        let mut params = HashMap::new();

        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_matcher() {
        let matcher = HostMatcher::new("example.com");
        assert!(matcher.matches(Some("example.com")));
        assert!(matcher.matches(Some("EXAMPLE.COM")));
        assert!(matcher.matches(Some("example.com:8080")));
        assert!(!matcher.matches(Some("other.com")));
        assert!(!matcher.matches(None));
    }

    #[test]
    fn test_path_prefix() {
        let pattern = PathPattern::new("/api");
        assert!(pattern.matches("/api").is_some());
        assert!(pattern.matches("/api/v1").is_some());
        assert!(pattern.matches("/apix").is_none());
        assert!(pattern.matches("/images").is_none());

        assert!(PathPattern::new("/").matches("/anything").is_some());
    }

    #[test]
    fn test_path_params() {
        let pattern = PathPattern::new("/users/{id}");
        let params = pattern.matches("/users/42/orders").unwrap();
        assert_eq!(params.get("id").map(String::as_str), Some("42"));
        assert!(pattern.matches("/users").is_none());
        assert_eq!(pattern.specificity(), (2, 1));
    }
}
