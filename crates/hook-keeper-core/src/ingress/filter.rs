//! Field extraction and subscriber-side event filters.

use crate::EventSet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Field sources
// ============================================================================

/// Where a value is read from in an inbound delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum FieldSource {
    /// Read the value from an HTTP request header.
    Header {
        /// Case-insensitive header name (e.g. `"Circleci-Event-Type"`).
        name: String,
    },

    /// Read the value from a dot-separated JSON path in the body.
    ///
    /// All segments must be object keys.
    JsonPath { path: String },

    /// Always use a fixed value.
    Static { value: String },
}

impl FieldSource {
    /// Whether resolving this source needs the parsed body
    pub fn needs_body(&self) -> bool {
        matches!(self, Self::JsonPath { .. })
    }

    /// Resolve against lowercased headers and the parsed body, if any
    ///
    /// Returns `None` when the header or path is absent.
    pub fn resolve(
        &self,
        headers: &HashMap<String, String>,
        payload: Option<&serde_json::Value>,
    ) -> Option<String> {
        match self {
            Self::Header { name } => headers.get(&name.to_ascii_lowercase()).cloned(),
            Self::JsonPath { path } => resolve_json_string(payload?, path),
            Self::Static { value } => Some(value.clone()),
        }
    }
}

/// Traverse a dot-separated JSON path and return a reference to the value.
///
/// Example: `resolve_json_path(&json, "pipeline.id")` returns `&json["pipeline"]["id"]`.
pub fn resolve_json_path<'a>(
    value: &'a serde_json::Value,
    path: &str,
) -> Option<&'a serde_json::Value> {
    path.split('.')
        .fold(Some(value), |current, key| current.and_then(|v| v.get(key)))
}

/// Resolve a JSON path to a string; numbers and booleans are stringified
pub fn resolve_json_string(value: &serde_json::Value, path: &str) -> Option<String> {
    let node = resolve_json_path(value, path)?;
    match node {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Regex applied to one string field of the payload
///
/// Used by comment-triggered subscriptions (e.g. `^/deploy\b` on `comment.body`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ContentFilterSpec", into = "ContentFilterSpec")]
pub struct ContentFilter {
    path: String,
    regex: Regex,
}

#[derive(Serialize, Deserialize)]
struct ContentFilterSpec {
    path: String,
    pattern: String,
}

impl ContentFilter {
    /// Compile a content filter
    ///
    /// # Errors
    ///
    /// Returns the regex compilation error for an invalid pattern.
    pub fn new(path: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            path: path.into(),
            regex: Regex::new(pattern)?,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    /// True when the field exists, is a string, and matches
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        resolve_json_path(payload, &self.path)
            .and_then(|v| v.as_str())
            .is_some_and(|s| self.regex.is_match(s))
    }
}

impl PartialEq for ContentFilter {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.regex.as_str() == other.regex.as_str()
    }
}

impl TryFrom<ContentFilterSpec> for ContentFilter {
    type Error = regex::Error;

    fn try_from(spec: ContentFilterSpec) -> Result<Self, Self::Error> {
        Self::new(spec.path, &spec.pattern)
    }
}

impl From<ContentFilter> for ContentFilterSpec {
    fn from(filter: ContentFilter) -> Self {
        Self {
            pattern: filter.regex.as_str().to_string(),
            path: filter.path,
        }
    }
}

/// A subscriber's predicate over inbound events
///
/// Empty sets match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub event_types: EventSet,

    #[serde(default)]
    pub actions: EventSet,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentFilter>,
}

impl EventFilter {
    /// Filter accepting the given event types
    pub fn for_events(event_types: EventSet) -> Self {
        Self {
            event_types,
            ..Default::default()
        }
    }

    /// Restrict to the given actions
    pub fn with_actions(mut self, actions: EventSet) -> Self {
        self.actions = actions;
        self
    }

    /// Require a content match
    pub fn with_content(mut self, content: ContentFilter) -> Self {
        self.content = Some(content);
        self
    }

    /// Why the event does not pass, or `None` when it does
    pub fn mismatch(
        &self,
        event_type: &str,
        action: Option<&str>,
        payload: &serde_json::Value,
    ) -> Option<String> {
        if !self.event_types.is_empty() && !self.event_types.contains(event_type) {
            return Some(format!("event type '{}' not subscribed", event_type));
        }

        if !self.actions.is_empty() {
            match action {
                Some(action) if self.actions.contains(action) => {}
                Some(action) => return Some(format!("action '{}' not subscribed", action)),
                None => return Some("event carries no action".to_string()),
            }
        }

        if let Some(content) = &self.content {
            if !content.matches(payload) {
                return Some(format!(
                    "content at '{}' does not match '{}'",
                    content.path(),
                    content.pattern()
                ));
            }
        }

        None
    }
}

#[cfg(test)]
#[path = "filter_tests.rs"]
mod tests;
