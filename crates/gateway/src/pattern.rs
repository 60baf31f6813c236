//! Parameterized URL pattern compilation and matching.
//!
//! Patterns are segment templates with `:name` captures, e.g.
//! `/v1/router/list/:thing`. A pattern may be registered with a leading
//! method tag (`[get]/v1/...`); the tag is stripped before compilation.

use std::collections::HashMap;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A compiled path pattern.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    literal: String,
    segments: Vec<Segment>,
}

/// Split a leading `[verb]` tag off a registered pattern.
pub fn strip_method_tag(pattern: &str) -> (Option<String>, &str) {
    if let Some(rest) = pattern.strip_prefix('[') {
        if let Some((verb, path)) = rest.split_once(']') {
            return (Some(verb.to_lowercase()), path);
        }
    }
    (None, pattern)
}

impl RoutePattern {
    /// Compile a pattern string. Fails on an empty pattern, a pattern not
    /// starting with `/`, or an unnamed `:` capture.
    pub fn compile(pattern: &str) -> Result<Self> {
        if !pattern.starts_with('/') {
            return Err(GatewayError::InvalidPattern(pattern.to_string()));
        }
        let mut segments = Vec::new();
        for part in pattern.split('/') {
            if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(GatewayError::InvalidPattern(pattern.to_string()));
                }
                segments.push(Segment::Param(name.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Ok(Self {
            literal: pattern.to_string(),
            segments,
        })
    }

    /// The pattern string as registered (method tag already stripped).
    pub fn literal(&self) -> &str {
        &self.literal
    }

    /// Match a concrete path, returning named captures on success. The query
    /// string, if present, is not part of the match.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let path = path.split('?').next().unwrap_or(path);
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut captures = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts.iter()) {
            match segment {
                Segment::Literal(lit) => {
                    if lit != part {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    captures.insert(name.clone(), (*part).to_string());
                }
            }
        }
        Some(captures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_path_matches() {
        let p = RoutePattern::compile("/v1/red/hello").unwrap();
        let captures = p.matches("/v1/red/hello").unwrap();
        assert!(captures.is_empty());
        assert!(p.matches("/v1/red/bye").is_none());
        assert!(p.matches("/v1/red").is_none());
        assert!(p.matches("/v1/red/hello/extra").is_none());
    }

    #[test]
    fn param_segments_capture() {
        let p = RoutePattern::compile("/v1/offers/validate/:phone/:code").unwrap();
        let captures = p.matches("/v1/offers/validate/5551234/9x2").unwrap();
        assert_eq!(captures["phone"], "5551234");
        assert_eq!(captures["code"], "9x2");
    }

    #[test]
    fn matching_is_case_sensitive() {
        let p = RoutePattern::compile("/v1/Red/hello").unwrap();
        assert!(p.matches("/v1/red/hello").is_none());
        assert!(p.matches("/v1/Red/hello").is_some());
    }

    #[test]
    fn query_string_is_ignored() {
        let p = RoutePattern::compile("/v1/router/list/:thing").unwrap();
        let captures = p.matches("/v1/router/list/routes?token=abc").unwrap();
        assert_eq!(captures["thing"], "routes");
    }

    #[test]
    fn trailing_slash_is_the_authors_choice() {
        let p = RoutePattern::compile("/v1/red/hello").unwrap();
        assert!(p.matches("/v1/red/hello/").is_none());
        let p = RoutePattern::compile("/v1/red/hello/").unwrap();
        assert!(p.matches("/v1/red/hello/").is_some());
        assert!(p.matches("/v1/red/hello").is_none());
    }

    #[test]
    fn method_tag_is_stripped() {
        let (method, path) = strip_method_tag("[get]/v1/router/health");
        assert_eq!(method.as_deref(), Some("get"));
        assert_eq!(path, "/v1/router/health");

        let (method, path) = strip_method_tag("/v1/router/health");
        assert_eq!(method, None);
        assert_eq!(path, "/v1/router/health");

        let (method, path) = strip_method_tag("[POST]/v1/router/message");
        assert_eq!(method.as_deref(), Some("post"));
        assert_eq!(path, "/v1/router/message");
    }

    #[test]
    fn malformed_patterns_fail_to_compile() {
        assert!(RoutePattern::compile("").is_err());
        assert!(RoutePattern::compile("v1/red").is_err());
        assert!(RoutePattern::compile("/v1/:/x").is_err());
    }
}
