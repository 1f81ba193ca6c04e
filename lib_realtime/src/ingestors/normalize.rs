//! # Payload Normalization
//!
//! Maps one raw upstream payload (a Logstash-style JSON document) onto a
//! [`NormalizedLogEvent`]. Fields under a nested `parsed` object win over their
//! top-level counterparts. Whatever is not mapped is preserved in `metadata`.

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::core::event::{LogLevel, NormalizedLogEvent};
use crate::errors::MalformedMessage;

/// Metadata key holding an unrecognized level string.
pub const LEVEL_RAW_KEY: &str = "level_raw";

// Top-level keys consumed by the mapping. `parsed` is consumed only when it is an object.
const MAPPED_TOP_LEVEL: &[&str] = &[
    "_id",
    "id",
    "@metadata",
    "@timestamp",
    "timestamp",
    "level",
    "message",
    "source",
    "service_name",
    "environment",
];

// Keys consumed from the nested `parsed` object.
const MAPPED_PARSED: &[&str] = &["level", "message", "source", "service_name", "environment", "timestamp"];

// Non-empty strings and numbers are usable text; everything else counts as absent.
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn fallback_id() -> String {
    let now = Utc::now();
    format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros())
}

/// Decodes and normalizes one raw payload.
pub fn normalize(raw: &str) -> Result<NormalizedLogEvent, MalformedMessage> {
    let value: Value = serde_json::from_str(raw)?;
    normalize_value(value)
}

/// Normalizes an already decoded payload. Anything but a JSON object is rejected.
pub fn normalize_value(value: Value) -> Result<NormalizedLogEvent, MalformedMessage> {
    let Value::Object(top) = value else {
        return Err(MalformedMessage::NotAnObject);
    };
    let empty = Map::new();
    let parsed = match top.get("parsed") {
        Some(Value::Object(parsed)) => parsed,
        _ => &empty,
    };
    let pick = |key: &str| text(parsed.get(key)).or_else(|| text(top.get(key)));

    let id = text(top.get("_id"))
        .or_else(|| text(top.get("id")))
        .or_else(|| text(top.get("@metadata").and_then(|m| m.get("_id"))))
        .unwrap_or_else(fallback_id);

    let timestamp = text(top.get("@timestamp"))
        .or_else(|| text(parsed.get("timestamp")))
        .or_else(|| text(top.get("timestamp")))
        .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));

    let source = pick("source").or_else(|| text(top.get("host").and_then(|h| h.get("name"))));

    let mut metadata: Map<String, Value> = top
        .iter()
        .filter(|(k, v)| !MAPPED_TOP_LEVEL.contains(&k.as_str()) && !(k.as_str() == "parsed" && v.is_object()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (k, v) in parsed.iter().filter(|(k, _)| !MAPPED_PARSED.contains(&k.as_str())) {
        metadata.insert(k.clone(), v.clone());
    }

    let level = match pick("level") {
        None => LogLevel::Info,
        Some(raw) => LogLevel::parse(&raw).unwrap_or_else(|| {
            log::debug!("Unknown level '{}' on event {}, using info", raw, id);
            metadata.insert(LEVEL_RAW_KEY.to_string(), Value::String(raw));
            LogLevel::Info
        }),
    };

    Ok(NormalizedLogEvent {
        id,
        timestamp,
        level,
        message: pick("message").unwrap_or_default(),
        source,
        service_name: pick("service_name"),
        environment: pick("environment"),
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parsed_fields_take_precedence() {
        let event = normalize(r#"{"parsed": {"level": "ERROR", "message": "boom"}, "level": "info", "message": "outer"}"#)
            .unwrap();
        assert_eq!(event.level, LogLevel::Error);
        assert_eq!(event.message, "boom");
    }

    #[test]
    fn defaults_for_an_empty_object() {
        let event = normalize("{}").unwrap();
        assert_eq!(event.level, LogLevel::Info);
        assert_eq!(event.message, "");
        assert!(event.source.is_none());
        assert!(!event.id.is_empty());
        assert!(chrono::DateTime::parse_from_rfc3339(&event.timestamp).is_ok());
        assert!(event.metadata.is_empty());
    }

    #[test]
    fn id_and_timestamp_sources() {
        let event = normalize_value(json!({
            "@metadata": {"_id": "meta-1"},
            "@timestamp": "2024-05-01T10:00:00Z",
            "parsed": {"timestamp": "ignored"}
        }))
        .unwrap();
        assert_eq!(event.id, "meta-1");
        assert_eq!(event.timestamp, "2024-05-01T10:00:00Z");

        let event = normalize_value(json!({"_id": "top", "id": "other", "parsed": {"timestamp": "2024-05-01"}})).unwrap();
        assert_eq!(event.id, "top");
        assert_eq!(event.timestamp, "2024-05-01");

        let event = normalize_value(json!({"id": 42})).unwrap();
        assert_eq!(event.id, "42");
    }

    #[test]
    fn source_falls_back_to_host_name() {
        let event = normalize_value(json!({"host": {"name": "web-3"}})).unwrap();
        assert_eq!(event.source.as_deref(), Some("web-3"));
        assert_eq!(event.metadata.get("host"), Some(&json!({"name": "web-3"})));

        let event = normalize_value(json!({"source": "api", "host": {"name": "web-3"}})).unwrap();
        assert_eq!(event.source.as_deref(), Some("api"));
    }

    #[test]
    fn unmapped_fields_land_in_metadata() {
        let event = normalize_value(json!({
            "service_name": "billing",
            "request_id": "r-1",
            "shared": "top",
            "parsed": {"environment": "prod", "user": "u-9", "shared": "nested"}
        }))
        .unwrap();
        assert_eq!(event.service_name.as_deref(), Some("billing"));
        assert_eq!(event.environment.as_deref(), Some("prod"));
        assert_eq!(event.metadata.get("request_id"), Some(&json!("r-1")));
        assert_eq!(event.metadata.get("user"), Some(&json!("u-9")));
        assert_eq!(event.metadata.get("shared"), Some(&json!("nested")));
        assert!(!event.metadata.contains_key("parsed"));

        let event = normalize_value(json!({"message": "outer", "parsed": "level=error msg=boom"})).unwrap();
        assert_eq!(event.level, LogLevel::Info);
        assert_eq!(event.message, "outer");
        assert_eq!(event.metadata.get("parsed"), Some(&json!("level=error msg=boom")));
    }

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(normalize(r#"{"level": "WARNING"}"#).unwrap().level, LogLevel::Warning);

        for raw in ["fatal", "alert", "emergency", "err", "verbose"] {
            let event = normalize_value(json!({"level": raw})).unwrap();
            assert_eq!(event.level, LogLevel::Info);
            assert_eq!(event.metadata.get(LEVEL_RAW_KEY), Some(&json!(raw)));
        }
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(matches!(normalize("not json"), Err(MalformedMessage::Json(_))));
        assert!(matches!(normalize("[1, 2]"), Err(MalformedMessage::NotAnObject)));
        assert!(matches!(normalize("\"text\""), Err(MalformedMessage::NotAnObject)));
    }
}
