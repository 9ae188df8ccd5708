//! One line of a node's JSONL log.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single self-contained log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonLogEntry {
    /// RFC 3339 UTC timestamp with milliseconds
    pub ts: String,
    pub level: String,
    /// Node the entry was written by
    pub node: String,
    pub target: String,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    /// Enclosing spans, root first, joined with `" > "`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl JsonLogEntry {
    pub fn new(
        level: impl Into<String>,
        node: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            node: node.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// Value of a structured field rendered as a string.
    pub fn field(&self, name: &str) -> Option<String> {
        let value = self.fields.as_ref()?.get(name)?;
        Some(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_is_one_line() {
        let entry = JsonLogEntry::new("info", "a1b2c3d4", "peersync_core::peers", "Peer connected");
        let json = entry.to_json_line().unwrap();
        assert!(!json.contains('\n'));
        assert!(json.contains("\"node\":\"a1b2c3d4\""));
        assert!(!json.contains("\"fields\""));

        let parsed = JsonLogEntry::from_json_line(&json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_field_lookup() {
        let entry = JsonLogEntry::new("debug", "n", "t", "Published record").with_fields(
            serde_json::json!({ "record_type": "task", "version": 3 }),
        );
        assert_eq!(entry.field("record_type").as_deref(), Some("task"));
        assert_eq!(entry.field("version").as_deref(), Some("3"));
        assert_eq!(entry.field("missing"), None);
    }
}
