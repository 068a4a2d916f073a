//! Ingest payload normalization.
//!
//! Client SDKs send either a flat report (`error_class`, `message`,
//! `backtrace`) or a nested one (`exception.class`, `exception.message`,
//! `exception.backtrace`). [`ErrorPayload::from_value`] accepts both and
//! never fails: fields of the wrong type are treated as absent.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::backtrace::{raw_frames, RawFrame};

/// Replacement for sensitive request parameter values.
pub const FILTERED: &str = "[FILTERED]";

/// Request parameter names whose values are never stored.
pub const DEFAULT_SENSITIVE_KEYS: &[&str] = &[
    "password",
    "password_confirmation",
    "token",
    "api_key",
    "secret",
    "credit_card",
    "cvv",
];

/// Timestamp as supplied by the client.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RawTimestamp {
    /// No timestamp, or one of an unusable type.
    #[default]
    Missing,
    /// An ISO-8601-ish string.
    Text(String),
    /// Seconds since the Unix epoch.
    Epoch(f64),
    /// Already a timestamp (in-process callers).
    Native(DateTime<Utc>),
}

impl RawTimestamp {
    fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::String(s)) => Self::Text(s.clone()),
            Some(Value::Number(n)) => n.as_f64().map_or(Self::Missing, Self::Epoch),
            _ => Self::Missing,
        }
    }

    /// Resolve to a concrete time. Anything unusable falls back to `now`.
    #[must_use]
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Missing => now,
            Self::Native(ts) => *ts,
            Self::Text(s) => parse_timestamp(s).unwrap_or(now),
            Self::Epoch(secs) => from_epoch(*secs).unwrap_or(now),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn from_epoch(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1_000_000_000.0).round() as u32;
    DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
}

/// Parse the timestamp formats SDKs commonly send.
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f %z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(ts) = DateTime::parse_from_str(s, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    if let Some(naive) = s.strip_suffix(" UTC") {
        if let Ok(ts) = NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S%.f") {
            return Some(Utc.from_utc_datetime(&ts));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&ts));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| Utc.from_utc_datetime(&ts))
}

/// Request metadata attached to a report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestInfo {
    pub id: Option<String>,
    pub method: Option<String>,
    pub url: Option<String>,
    pub path: Option<String>,
    pub controller: Option<String>,
    pub action: Option<String>,
    /// Unsanitized; see [`sanitize_params`].
    pub params: Map<String, Value>,
    pub headers: Map<String, Value>,
}

/// The user affected by an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserInfo {
    pub id: Option<String>,
    pub email: Option<String>,
    /// The whole user object as sent.
    pub data: Map<String, Value>,
}

/// A normalized error report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorPayload {
    pub error_class: Option<String>,
    pub message: Option<String>,
    pub backtrace: Vec<RawFrame>,
    pub timestamp: RawTimestamp,
    pub environment: Option<String>,
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub release: Option<String>,
    pub server_name: Option<String>,
    pub request: RequestInfo,
    pub user: UserInfo,
    pub context: Map<String, Value>,
    pub tags: Map<String, Value>,
    pub extra: Map<String, Value>,
    pub breadcrumbs: Vec<Value>,
}

impl ErrorPayload {
    /// Normalize a raw JSON report. Non-object input yields an empty report.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let Some(root) = value.as_object() else {
            return Self::default();
        };
        let exception = root.get("exception").and_then(Value::as_object);
        let from_exception = |key: &str| exception.and_then(|e| e.get(key));

        let request = root.get("request").and_then(Value::as_object);
        let request_field = |key: &str| request.and_then(|r| r.get(key));

        let user = root.get("user").and_then(Value::as_object);

        let backtrace_value = match root.get("backtrace") {
            Some(v) if !v.is_null() => Some(v),
            _ => from_exception("backtrace"),
        };

        Self {
            error_class: text(root.get("error_class")).or_else(|| text(from_exception("class"))),
            message: text(root.get("message")).or_else(|| text(from_exception("message"))),
            backtrace: raw_frames(backtrace_value),
            timestamp: RawTimestamp::from_value(root.get("timestamp")),
            environment: text(root.get("environment")),
            commit: text(root.get("commit")),
            branch: text(root.get("branch")),
            release: text(root.get("release")),
            server_name: text(root.get("server_name")).or_else(|| text(root.get("host"))),
            request: RequestInfo {
                id: text(request_field("id")).or_else(|| text(root.get("request_id"))),
                method: text(request_field("method")),
                url: text(request_field("url")),
                path: text(request_field("path")),
                controller: text(request_field("controller")),
                action: text(request_field("action")),
                params: object(request_field("params")),
                headers: object(request_field("headers")),
            },
            user: UserInfo {
                id: text(user.and_then(|u| u.get("id"))),
                email: text(user.and_then(|u| u.get("email"))),
                data: user.cloned().unwrap_or_default(),
            },
            context: object(root.get("context")),
            tags: object(root.get("tags")),
            extra: object(root.get("extra")),
            breadcrumbs: match root.get("breadcrumbs") {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            },
        }
    }
}

/// Scalar JSON values as text; everything else is absent.
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn object(value: Option<&Value>) -> Map<String, Value> {
    value
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Replace sensitive values at every nesting depth.
///
/// Keys are compared case-insensitively against `sensitive_keys`, which are
/// expected in lowercase. Objects nested inside arrays are walked too.
#[must_use]
pub fn sanitize_params(params: &Map<String, Value>, sensitive_keys: &[String]) -> Map<String, Value> {
    params
        .iter()
        .map(|(key, value)| {
            let lowered = key.to_lowercase();
            let cleaned = if sensitive_keys.iter().any(|k| *k == lowered) {
                Value::String(FILTERED.to_string())
            } else {
                sanitize_value(value, sensitive_keys)
            };
            (key.clone(), cleaned)
        })
        .collect()
}

fn sanitize_value(value: &Value, sensitive_keys: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_params(map, sensitive_keys)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_value(item, sensitive_keys))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// The default sensitive key list as owned strings.
#[must_use]
pub fn default_sensitive_keys() -> Vec<String> {
    DEFAULT_SENSITIVE_KEYS.iter().map(|k| (*k).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap_or_default()
    }

    #[test]
    fn test_flat_shape() {
        let payload = ErrorPayload::from_value(&json!({
            "error_class": "NoMethodError",
            "message": "boom",
            "backtrace": ["app/models/user.rb:42:in `full_name'"],
        }));
        assert_eq!(payload.error_class.as_deref(), Some("NoMethodError"));
        assert_eq!(payload.message.as_deref(), Some("boom"));
        assert_eq!(payload.backtrace.len(), 1);
    }

    #[test]
    fn test_exception_shape() {
        let payload = ErrorPayload::from_value(&json!({
            "exception": {
                "class": "CustomError",
                "message": "Something went wrong",
                "backtrace": ["app/a.rb:1:in `x'", "app/b.rb:2:in `y'"],
            }
        }));
        assert_eq!(payload.error_class.as_deref(), Some("CustomError"));
        assert_eq!(payload.message.as_deref(), Some("Something went wrong"));
        assert_eq!(payload.backtrace.len(), 2);
    }

    #[test]
    fn test_flat_fields_win_over_exception() {
        let payload = ErrorPayload::from_value(&json!({
            "error_class": "Flat",
            "exception": {"class": "Nested"},
        }));
        assert_eq!(payload.error_class.as_deref(), Some("Flat"));
    }

    #[test]
    fn test_fallback_fields() {
        let payload = ErrorPayload::from_value(&json!({
            "host": "web-3",
            "request_id": "req_9",
            "user": {"id": 17, "email": "a@example.com", "name": "Ann"},
        }));
        assert_eq!(payload.server_name.as_deref(), Some("web-3"));
        assert_eq!(payload.request.id.as_deref(), Some("req_9"));
        assert_eq!(payload.user.id.as_deref(), Some("17"));
        assert_eq!(payload.user.data.get("name"), Some(&json!("Ann")));
    }

    #[test]
    fn test_wrong_types_are_ignored() {
        let payload = ErrorPayload::from_value(&json!({
            "error_class": ["not", "a", "string"],
            "backtrace": "app/a.rb:1:in `x'",
            "context": "nope",
            "breadcrumbs": {"a": 1},
            "request": {"params": null},
        }));
        assert_eq!(payload.error_class, None);
        assert!(payload.backtrace.is_empty());
        assert!(payload.context.is_empty());
        assert!(payload.breadcrumbs.is_empty());
        assert!(payload.request.params.is_empty());
    }

    #[test]
    fn test_non_object_payload() {
        assert_eq!(ErrorPayload::from_value(&json!(42)), ErrorPayload::default());
    }

    #[test]
    fn test_timestamp_rfc3339() {
        let payload = ErrorPayload::from_value(&json!({"timestamp": "2024-12-21T10:00:00Z"}));
        let expected = Utc.with_ymd_and_hms(2024, 12, 21, 10, 0, 0).single();
        assert_eq!(Some(payload.timestamp.resolve(now())), expected);
    }

    #[test]
    fn test_timestamp_epoch_seconds() {
        let payload = ErrorPayload::from_value(&json!({"timestamp": 1_700_000_000}));
        assert_eq!(payload.timestamp.resolve(now()).timestamp(), 1_700_000_000);

        let fractional = RawTimestamp::Epoch(1_700_000_000.25).resolve(now());
        assert_eq!(fractional.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_timestamp_other_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 12, 23, 20, 53, 17).single();
        assert_eq!(parse_timestamp("2025-12-23 20:53:17 UTC"), expected);
        assert_eq!(parse_timestamp("2025-12-23 20:53:17 +0000"), expected);
        assert_eq!(parse_timestamp("2025-12-23T20:53:17"), expected);
        assert_eq!(
            parse_timestamp("2025-12-23"),
            Utc.with_ymd_and_hms(2025, 12, 23, 0, 0, 0).single()
        );
    }

    #[test]
    fn test_timestamp_fallbacks() {
        assert_eq!(RawTimestamp::Text("invalid".into()).resolve(now()), now());
        assert_eq!(RawTimestamp::Missing.resolve(now()), now());
        assert_eq!(RawTimestamp::Epoch(f64::NAN).resolve(now()), now());
        let earlier = now() - Duration::hours(3);
        assert_eq!(RawTimestamp::Native(earlier).resolve(now()), earlier);
    }

    #[test]
    fn test_sanitize_top_level() {
        let params = json!({
            "name": "John",
            "password": "secret123",
            "Password_Confirmation": "secret123",
            "TOKEN": "api_token_123",
        });
        let cleaned = sanitize_params(
            params.as_object().unwrap_or(&Map::new()),
            &default_sensitive_keys(),
        );
        assert_eq!(cleaned["name"], json!("John"));
        assert_eq!(cleaned["password"], json!(FILTERED));
        assert_eq!(cleaned["Password_Confirmation"], json!(FILTERED));
        assert_eq!(cleaned["TOKEN"], json!(FILTERED));
    }

    #[test]
    fn test_sanitize_nested() {
        let params = json!({"user": {"password": "x", "name": "John"}});
        let cleaned = sanitize_params(
            params.as_object().unwrap_or(&Map::new()),
            &default_sensitive_keys(),
        );
        assert_eq!(
            Value::Object(cleaned),
            json!({"user": {"password": "[FILTERED]", "name": "John"}})
        );
    }

    #[test]
    fn test_sanitize_deep_and_in_arrays() {
        let params = json!({
            "order": {"payment": {"credit_card": "4111", "cvv": "123", "amount": 5}},
            "cards": [{"secret": "s", "label": "work"}],
            "secret": {"nested": "whole subtree filtered"},
        });
        let cleaned = Value::Object(sanitize_params(
            params.as_object().unwrap_or(&Map::new()),
            &default_sensitive_keys(),
        ));
        assert_eq!(
            cleaned,
            json!({
                "order": {"payment": {"credit_card": FILTERED, "cvv": FILTERED, "amount": 5}},
                "cards": [{"secret": FILTERED, "label": "work"}],
                "secret": FILTERED,
            })
        );
    }
}
