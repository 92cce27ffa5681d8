//! Record types flowing through the forwarding pipeline.
//!
//! Producers hand over plain JSON objects. The kind of each object is
//! resolved once, at the producer boundary, by probing its discriminant
//! field in a fixed priority order: `line`, then `type`, then `stats`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered JSON object holding a record's fields.
///
/// Insertion order is preserved on the wire (`serde_json` is built with
/// `preserve_order`).
pub type Fields = serde_json::Map<String, Value>;

/// The three kinds of records the forwarder routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Container log lines
    Logs,
    /// Docker lifecycle events
    Events,
    /// Resource usage samples
    Stats,
}

impl RecordKind {
    /// All kinds, in discriminant priority order.
    pub fn all() -> &'static [RecordKind] {
        &[RecordKind::Logs, RecordKind::Events, RecordKind::Stats]
    }

    /// The field whose presence identifies this kind.
    pub fn discriminant(&self) -> &'static str {
        match self {
            RecordKind::Logs => "line",
            RecordKind::Events => "type",
            RecordKind::Stats => "stats",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Logs => write!(f, "logs"),
            RecordKind::Events => write!(f, "events"),
            RecordKind::Stats => write!(f, "stats"),
        }
    }
}

/// One event object produced by a source.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// A log line (`line` field present)
    Log(Fields),
    /// A Docker event (`type` field present)
    Event(Fields),
    /// A stats sample (`stats` field present)
    Stats(Fields),
    /// No discriminant found; cannot be routed
    Unclassified(Fields),
}

impl Record {
    /// Tag a raw object by its discriminant field.
    ///
    /// A field counts as present when the key exists and its value is
    /// truthy: `null`, `false`, `0` and `""` are treated as missing, while
    /// objects and arrays always count, even when empty.
    pub fn classify(fields: Fields) -> Self {
        let present = |key: &str| fields.get(key).is_some_and(is_truthy);

        if present(RecordKind::Logs.discriminant()) {
            Record::Log(fields)
        } else if present(RecordKind::Events.discriminant()) {
            Record::Event(fields)
        } else if present(RecordKind::Stats.discriminant()) {
            Record::Stats(fields)
        } else {
            Record::Unclassified(fields)
        }
    }

    /// Parse a JSON object and classify it.
    ///
    /// Non-object JSON values become an [`Record::Unclassified`] with no
    /// fields.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        match serde_json::from_str::<Value>(raw)? {
            Value::Object(fields) => Ok(Self::classify(fields)),
            _ => Ok(Record::Unclassified(Fields::new())),
        }
    }

    /// Build a log record: `line` first, then the container metadata.
    pub fn log(line: impl Into<Value>, meta: Fields) -> Self {
        Record::Log(with_leading(RecordKind::Logs, line.into(), meta))
    }

    /// Build an event record: `type` first, then the container metadata.
    pub fn event(event_type: impl Into<String>, meta: Fields) -> Self {
        Record::Event(with_leading(
            RecordKind::Events,
            Value::String(event_type.into()),
            meta,
        ))
    }

    /// Build a stats record: `stats` first, then the container metadata.
    pub fn stats(stats: Value, meta: Fields) -> Self {
        Record::Stats(with_leading(RecordKind::Stats, stats, meta))
    }

    /// The routing kind, or `None` when unclassified.
    pub fn kind(&self) -> Option<RecordKind> {
        match self {
            Record::Log(_) => Some(RecordKind::Logs),
            Record::Event(_) => Some(RecordKind::Events),
            Record::Stats(_) => Some(RecordKind::Stats),
            Record::Unclassified(_) => None,
        }
    }

    pub fn fields(&self) -> &Fields {
        match self {
            Record::Log(fields)
            | Record::Event(fields)
            | Record::Stats(fields)
            | Record::Unclassified(fields) => fields,
        }
    }
}

fn with_leading(kind: RecordKind, value: Value, meta: Fields) -> Fields {
    let mut fields = Fields::with_capacity(meta.len() + 1);
    fields.insert(kind.discriminant().to_string(), value);
    for (key, value) in meta {
        fields.entry(key).or_insert(value);
    }
    fields
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Fields {
        match value {
            Value::Object(fields) => fields,
            other => panic!("expected object, got {}", other),
        }
    }

    #[test]
    fn test_classify_priority_order() {
        let all = object(json!({"stats": {}, "type": "start", "line": "hi"}));
        assert_eq!(Record::classify(all).kind(), Some(RecordKind::Logs));

        let event_and_stats = object(json!({"stats": {}, "type": "die"}));
        assert_eq!(
            Record::classify(event_and_stats).kind(),
            Some(RecordKind::Events)
        );

        let stats = object(json!({"stats": {"cpu": 1.5}, "name": "web"}));
        assert_eq!(Record::classify(stats).kind(), Some(RecordKind::Stats));
    }

    #[test]
    fn test_classify_unresolvable() {
        let record = Record::classify(object(json!({"name": "web", "id": "abc"})));
        assert_eq!(record.kind(), None);
        assert!(matches!(record, Record::Unclassified(_)));
    }

    #[test]
    fn test_null_discriminant_is_absent() {
        let record = Record::classify(object(json!({"line": null, "stats": {"cpu": 2}})));
        assert_eq!(record.kind(), Some(RecordKind::Stats));
    }

    #[test]
    fn test_falsy_discriminant_is_absent() {
        let empty_line = object(json!({"line": "", "type": "start"}));
        assert_eq!(Record::classify(empty_line).kind(), Some(RecordKind::Events));

        let false_type = object(json!({"type": false, "stats": {"cpu": 2}}));
        assert_eq!(Record::classify(false_type).kind(), Some(RecordKind::Stats));

        let zero_line = object(json!({"line": 0}));
        assert_eq!(Record::classify(zero_line).kind(), None);
    }

    #[test]
    fn test_empty_containers_are_present() {
        let record = Record::classify(object(json!({"line": [], "stats": {}})));
        assert_eq!(record.kind(), Some(RecordKind::Logs));

        let record = Record::classify(object(json!({"stats": {}})));
        assert_eq!(record.kind(), Some(RecordKind::Stats));
    }

    #[test]
    fn test_from_json() {
        let record = Record::from_json(r#"{"type":"start","name":"db"}"#).unwrap();
        assert_eq!(record.kind(), Some(RecordKind::Events));

        let record = Record::from_json("[1, 2, 3]").unwrap();
        assert_eq!(record.kind(), None);
        assert!(record.fields().is_empty());

        assert!(Record::from_json("not json").is_err());
    }

    #[test]
    fn test_constructors_put_discriminant_first() {
        let meta = object(json!({"name": "web", "line": "ignored"}));
        let record = Record::log("hello", meta);

        let keys: Vec<&str> = record.fields().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["line", "name"]);
        assert_eq!(record.fields()["line"], json!("hello"));
    }

    #[test]
    fn test_kind_display_and_serde() {
        assert_eq!(RecordKind::Events.to_string(), "events");
        assert_eq!(serde_json::to_string(&RecordKind::Stats).unwrap(), "\"stats\"");
    }
}
