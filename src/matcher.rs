//! Request matching logic.
//!
//! One matcher is shared by the socket listener and the interception
//! bridge, so both paths always agree on what a pattern accepts.

use crate::config::{MappingEntry, RequestPattern};
use regex::Regex;

/// Matches one request dimension (url or body).
#[derive(Debug, Clone)]
pub enum TextMatcher {
    /// Dimension not constrained
    Any,
    /// Pattern is not a valid regex; substring containment only
    Contains(String),
    /// Substring containment first, regex as fallback
    Regex { literal: String, regex: Regex },
}

impl TextMatcher {
    /// Build a matcher from an optional pattern string.
    pub fn new(pattern: Option<&str>) -> Self {
        match pattern {
            None => TextMatcher::Any,
            Some(p) => Self::with_literal(p.to_string(), p),
        }
    }

    /// Build a matcher whose substring form differs from its regex source.
    pub fn with_literal(literal: String, regex_source: &str) -> Self {
        match Regex::new(regex_source) {
            Ok(regex) => TextMatcher::Regex { literal, regex },
            Err(_) => TextMatcher::Contains(literal),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, TextMatcher::Any)
    }

    pub fn matches(&self, text: &str) -> bool {
        match self {
            TextMatcher::Any => true,
            TextMatcher::Contains(literal) => text.contains(literal.as_str()),
            TextMatcher::Regex { literal, regex } => {
                text.contains(literal.as_str()) || regex.is_match(text)
            }
        }
    }
}

/// A request pattern prepared for matching.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    method: Option<String>,
    url: TextMatcher,
    data: TextMatcher,
}

impl CompiledPattern {
    /// Compile a pattern.
    ///
    /// The substring form of `data` is escaped the same way request bodies
    /// are serialized (see [`serialize_body`]). Its regex form keeps the
    /// pattern as written, with each quote matched as the backslash-escaped
    /// quote found in the serialized body.
    pub fn compile(pattern: &RequestPattern) -> Self {
        let data = match pattern.data.as_deref() {
            None => TextMatcher::Any,
            Some(d) => TextMatcher::with_literal(escape_fragment(d), &d.replace('"', r#"\\""#)),
        };
        Self {
            method: pattern.method.clone(),
            url: TextMatcher::new(pattern.url.as_deref()),
            data,
        }
    }

    /// Apply the method, url and body checks in that order.
    pub fn matches(&self, request: &RequestDescriptor) -> bool {
        if let Some(method) = &self.method {
            if !method.eq_ignore_ascii_case(&request.method) {
                return false;
            }
        }

        if !self.url.matches(&request.url) {
            return false;
        }

        if self.data.is_any() {
            return true;
        }
        match &request.body {
            Some(body) => self.data.matches(body),
            None => false,
        }
    }
}

/// A mapping entry with its pattern compiled.
#[derive(Debug, Clone)]
pub struct CompiledEntry {
    pub entry: MappingEntry,
    pub pattern: CompiledPattern,
}

impl CompiledEntry {
    pub fn new(entry: MappingEntry) -> Self {
        let pattern = CompiledPattern::compile(&entry.request);
        Self { entry, pattern }
    }
}

/// What the matcher knows about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// Uppercase HTTP method
    pub method: String,
    /// URL including the query string
    pub url: String,
    /// Serialized body, `None` when the request carried no body
    pub body: Option<String>,
}

impl RequestDescriptor {
    pub fn new(method: &str, url: impl Into<String>, body: Option<&[u8]>) -> Self {
        Self {
            method: method.to_uppercase(),
            url: url.into(),
            body: body
                .filter(|b| !b.is_empty())
                .map(|b| serialize_body(&String::from_utf8_lossy(b))),
        }
    }
}

/// Find the first entry matching the request. Later entries are never
/// consulted once one matches.
pub fn find_match<'a>(
    entries: &'a [CompiledEntry],
    request: &RequestDescriptor,
) -> Option<&'a CompiledEntry> {
    entries.iter().find(|e| e.pattern.matches(request))
}

/// Serialize a raw body to the text that `data` patterns are compared with:
/// its JSON string encoding without the surrounding quotes.
pub fn serialize_body(body: &str) -> String {
    escape_fragment(body)
}

/// Escape quotes, backslashes and control characters as JSON does.
pub fn escape_fragment(text: &str) -> String {
    let quoted = serde_json::Value::String(text.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}
