//! Backtrace normalization.
//!
//! SDKs report frames in several shapes: plain strings
//! (`app/models/user.rb:42:in 'full_name'`), structured objects
//! (`{"file": .., "line": .., "function": ..}`) and `{"raw": ".."}` wrappers
//! for lines the SDK could not parse itself. Each shape is captured as a
//! [`RawFrame`] at the boundary and converges on the canonical [`Frame`].

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Path fragments that mark third-party or runtime code.
const LIBRARY_MARKERS: &[&str] = &[
    "/gems/",
    "vendor/",
    "/ruby/",
    "/site-packages/",
    "node_modules/",
    "/.cargo/registry/",
    "/rustc/",
];

/// Path prefixes that mark application code.
const APP_PREFIXES: &[&str] = &["app/", "lib/"];

/// Path segments that mark application code.
const APP_SEGMENTS: &[&str] = &["/app/", "/lib/"];

/// `<file>:<line>:in <quote><function><quote>`. The greedy function capture
/// backtracks over exactly one closing quote, so the quote never leaks into
/// the function name.
static FRAME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(.+):([0-9]+):in [`'](.+)[`']$").ok());

/// A backtrace frame as received from a client, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFrame {
    /// A conventional one-line frame string.
    Text(String),
    /// A frame the SDK already split into fields.
    Structured(StructuredFrame),
    /// `{"raw": "..."}`: a line the SDK gave up parsing.
    Raw(String),
    /// Anything else (numbers, nulls, nested arrays).
    Opaque(Value),
}

/// Fields of a structured client frame. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredFrame {
    pub file: Option<String>,
    pub line: Option<i64>,
    pub function: Option<String>,
    pub context: Option<Value>,
}

/// Source location extracted from a single raw frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameLocation {
    pub file: Option<String>,
    pub line: Option<i64>,
    pub function: Option<String>,
}

/// A normalized backtrace frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub file: String,
    pub line: Option<i64>,
    pub function: Option<String>,
    /// Source lines around the frame, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub in_app: bool,
}

impl RawFrame {
    /// Classify a JSON value into one of the frame shapes.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::Text(s.clone()),
            Value::Object(map) => {
                if !map.contains_key("file") {
                    if let Some(Value::String(raw)) = map.get("raw") {
                        return Self::Raw(raw.clone());
                    }
                }
                Self::Structured(StructuredFrame {
                    file: map.get("file").and_then(Value::as_str).map(String::from),
                    line: map.get("line").and_then(line_number),
                    function: map
                        .get("function")
                        .and_then(Value::as_str)
                        .map(String::from),
                    context: map.get("context").filter(|v| !v.is_null()).cloned(),
                })
            }
            other => Self::Opaque(other.clone()),
        }
    }

    /// The file/line/function this frame points at, if it can be determined.
    ///
    /// Strings that do not follow the frame convention yield an empty
    /// location.
    #[must_use]
    pub fn location(&self) -> FrameLocation {
        match self {
            Self::Text(s) | Self::Raw(s) => parse_frame_line(s).unwrap_or_default(),
            Self::Structured(frame) => FrameLocation {
                file: frame.file.clone(),
                line: frame.line,
                function: frame.function.clone(),
            },
            Self::Opaque(_) => FrameLocation::default(),
        }
    }

    /// Convert to the canonical frame. Never fails: unparseable input keeps
    /// its text as `file` and is marked as not in-app.
    #[must_use]
    pub fn normalize(&self) -> Frame {
        match self {
            Self::Text(s) | Self::Raw(s) => match parse_frame_line(s) {
                Some(location) => {
                    let file = location.file.unwrap_or_default();
                    Frame {
                        in_app: is_in_app(&file),
                        file,
                        line: location.line,
                        function: location.function,
                        context: None,
                    }
                }
                None => placeholder(s.clone()),
            },
            Self::Structured(frame) => {
                let file = frame.file.clone().unwrap_or_default();
                Frame {
                    in_app: is_in_app(&file),
                    file,
                    line: frame.line,
                    function: frame.function.clone(),
                    context: frame.context.clone(),
                }
            }
            Self::Opaque(value) => placeholder(value.to_string()),
        }
    }
}

fn placeholder(file: String) -> Frame {
    Frame {
        file,
        line: None,
        function: None,
        context: None,
        in_app: false,
    }
}

fn line_number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse a conventional frame line. Returns `None` when the line does not
/// follow the `<file>:<line>:in '<function>'` convention.
#[must_use]
pub fn parse_frame_line(line: &str) -> Option<FrameLocation> {
    let pattern = FRAME_PATTERN.as_ref()?;
    let caps = pattern.captures(line)?;
    Some(FrameLocation {
        file: Some(caps[1].to_string()),
        line: caps[2].parse().ok(),
        function: Some(caps[3].to_string()),
    })
}

/// Read a backtrace value of unknown shape. Non-array values yield no frames.
#[must_use]
pub fn raw_frames(value: Option<&Value>) -> Vec<RawFrame> {
    match value {
        Some(Value::Array(items)) => items.iter().map(RawFrame::from_value).collect(),
        _ => Vec::new(),
    }
}

/// Normalize every frame, preserving order.
#[must_use]
pub fn normalize(frames: &[RawFrame]) -> Vec<Frame> {
    frames.iter().map(RawFrame::normalize).collect()
}

/// Whether a path belongs to application code rather than a dependency or
/// the language runtime.
#[must_use]
pub fn is_in_app(path: &str) -> bool {
    if path.is_empty() || LIBRARY_MARKERS.iter().any(|m| path.contains(m)) {
        return false;
    }

    APP_PREFIXES.iter().any(|p| path.starts_with(p))
        || APP_SEGMENTS.iter().any(|s| path.contains(s))
}

/// In-app frames of a backtrace.
///
/// Falls back to the full list when no frame is in-app, so callers always
/// have something to show.
#[must_use]
pub fn app_frames(frames: &[Frame]) -> Vec<&Frame> {
    let app: Vec<&Frame> = frames.iter().filter(|f| f.in_app).collect();
    if app.is_empty() {
        frames.iter().collect()
    } else {
        app
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parses_app_frame() {
        let frame = RawFrame::Text("app/models/user.rb:42:in `full_name'".to_string()).normalize();
        assert_eq!(frame.file, "app/models/user.rb");
        assert_eq!(frame.line, Some(42));
        assert_eq!(frame.function.as_deref(), Some("full_name"));
        assert!(frame.in_app);
    }

    #[test]
    fn test_gem_frame_not_in_app() {
        let frame =
            RawFrame::Text("/gems/activerecord/lib/ar.rb:10:in `save'".to_string()).normalize();
        assert_eq!(frame.file, "/gems/activerecord/lib/ar.rb");
        assert_eq!(frame.line, Some(10));
        assert_eq!(frame.function.as_deref(), Some("save"));
        assert!(!frame.in_app);
    }

    #[test]
    fn test_single_quote_style() {
        let frame =
            RawFrame::Text("app/models/user.rb:7:in 'User#full_name'".to_string()).normalize();
        assert_eq!(frame.function.as_deref(), Some("User#full_name"));
    }

    #[test]
    fn test_unmatched_string_becomes_file() {
        let frame = RawFrame::Text("something went sideways".to_string()).normalize();
        assert_eq!(frame.file, "something went sideways");
        assert_eq!(frame.line, None);
        assert_eq!(frame.function, None);
        assert!(!frame.in_app);
    }

    #[test]
    fn test_raw_wrapper_is_parsed_as_text() {
        let raw = RawFrame::from_value(&json!({"raw": "lib/tasks/sync.rb:3:in `run'"}));
        assert_eq!(raw, RawFrame::Raw("lib/tasks/sync.rb:3:in `run'".to_string()));
        let frame = raw.normalize();
        assert_eq!(frame.file, "lib/tasks/sync.rb");
        assert!(frame.in_app);
    }

    #[test]
    fn test_structured_frame_recomputes_in_app() {
        let raw = RawFrame::from_value(&json!({
            "file": "/usr/lib/ruby/3.3.0/net/http.rb",
            "line": "99",
            "function": "request",
            "in_app": true,
            "context": ["a", "b"],
        }));
        let frame = raw.normalize();
        assert_eq!(frame.line, Some(99));
        assert_eq!(frame.function.as_deref(), Some("request"));
        assert_eq!(frame.context, Some(json!(["a", "b"])));
        assert!(!frame.in_app, "client in_app flag is not trusted");
    }

    #[test]
    fn test_opaque_values_become_placeholders() {
        let frames = normalize(&raw_frames(Some(&json!([42, null, ["x"]]))));
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].file, "42");
        assert!(frames.iter().all(|f| !f.in_app && f.line.is_none()));
    }

    #[test]
    fn test_non_array_backtrace_is_empty() {
        assert!(raw_frames(Some(&json!("app/a.rb:1:in `x'"))).is_empty());
        assert!(raw_frames(None).is_empty());
    }

    #[test]
    fn test_in_app_rules() {
        assert!(is_in_app("app/controllers/users_controller.rb"));
        assert!(is_in_app("lib/reflex/client.rb"));
        assert!(is_in_app("/srv/www/current/app/models/user.rb"));
        assert!(is_in_app("/srv/www/current/lib/tasks.rb"));
        assert!(!is_in_app(""));
        assert!(!is_in_app("config/initializers/setup.rb"));
        assert!(!is_in_app("/srv/www/vendor/bundle/app/x.rb"));
        assert!(!is_in_app("/usr/local/lib/ruby/3.3.0/set.rb"));
        assert!(!is_in_app("/home/u/.gem/gems/rack-3.0/lib/rack.rb"));
    }

    #[test]
    fn test_app_frames_filters_in_app() {
        let frames = normalize(&raw_frames(Some(&json!([
            "app/models/user.rb:42:in `full_name'",
            "/gems/activerecord/lib/ar.rb:10:in `save'",
        ]))));
        let app = app_frames(&frames);
        assert_eq!(app.len(), 1);
        assert_eq!(app[0].file, "app/models/user.rb");
    }

    #[test]
    fn test_app_frames_falls_back_to_full_list() {
        let frames = normalize(&raw_frames(Some(&json!([
            "/gems/rack/lib/rack.rb:1:in `call'",
            "/gems/puma/lib/puma.rb:2:in `run'",
        ]))));
        let app = app_frames(&frames);
        assert_eq!(app.len(), 2);
        assert_eq!(app[1].file, "/gems/puma/lib/puma.rb");
    }

    #[test]
    fn test_location_of_unmatched_text_is_empty() {
        let location = RawFrame::Text("no location here".to_string()).location();
        assert_eq!(location, FrameLocation::default());
    }
}
