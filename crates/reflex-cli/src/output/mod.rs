//! Output formatting for the reflex CLI
//!
//! Provides concise text and JSON output formats.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::io::{self, Write};

/// Fields rendered first, without a label, in text output.
const ID_KEYS: [&str; 4] = ["id", "group_id", "event_id", "job_id"];

/// Output format selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// JSON format - machine-readable output
    Json,
    /// Plain text format - one record per line
    #[default]
    Text,
}

/// Formatter that can output data in text or JSON format
#[derive(Debug, Clone)]
pub struct Formatter {
    format: OutputFormat,
}

impl Formatter {
    /// Create a new formatter with the specified output format
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Format data according to the configured output format
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails
    pub fn format<T: Serialize>(&self, data: &T) -> Result<String> {
        match self.format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(data)?),
            OutputFormat::Text => Ok(render_text(&serde_json::to_value(data)?)),
        }
    }

    /// Format and print data to stdout
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails
    pub fn print<T: Serialize>(&self, data: &T) -> Result<()> {
        let output = self.format(data)?;
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{output}")?;
        Ok(())
    }

    /// Format and print a list with a custom empty message
    ///
    /// For JSON format, wraps the array in a named object with a count field.
    /// For text, prints one record per line.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails
    pub fn print_list<T: Serialize>(
        &self,
        data: &[T],
        empty_message: &str,
        collection_name: &str,
    ) -> Result<()> {
        let output = match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&list_envelope(data, collection_name)?)?
            }
            OutputFormat::Text if data.is_empty() => empty_message.to_string(),
            OutputFormat::Text => self.format(&data)?,
        };
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{output}")?;
        Ok(())
    }
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new(OutputFormat::default())
    }
}

fn list_envelope<T: Serialize>(data: &[T], collection_name: &str) -> Result<Value> {
    let mut envelope = serde_json::Map::new();
    envelope.insert(collection_name.to_string(), serde_json::to_value(data)?);
    envelope.insert("count".to_string(), serde_json::json!(data.len()));
    Ok(Value::Object(envelope))
}

/// Render a JSON value as concise text
fn render_text(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut parts: Vec<String> = ID_KEYS
                .iter()
                .filter_map(|key| map.get(*key))
                .map(render_field_value)
                .collect();

            for (key, val) in map {
                if ID_KEYS.contains(&key.as_str()) {
                    continue;
                }
                match val {
                    Value::Array(arr) if arr.is_empty() => {}
                    Value::Null => {}
                    _ => parts.push(format!("{key}:{}", render_field_value(val))),
                }
            }
            parts.join("  ")
        }
        Value::Array(arr) => arr.iter().map(render_text).collect::<Vec<_>>().join("\n"),
        _ => render_field_value(value),
    }
}

/// Render a single field value as concise text
fn render_field_value(value: &Value) -> String {
    match value {
        Value::String(s) => {
            if s.contains(' ') || s.contains('\n') {
                format!("\"{}\"", s.replace('\n', "\\n"))
            } else {
                s.clone()
            }
        }
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(render_field_value).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| format!("{k}:{}", render_field_value(v)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize)]
    struct Group {
        error_class: String,
        id: String,
        message: Option<String>,
        event_count: i64,
        tags: Vec<String>,
    }

    fn group(id: &str) -> Group {
        Group {
            error_class: "NoMethodError".to_string(),
            id: id.to_string(),
            message: Some("undefined method 'foo' for nil".to_string()),
            event_count: 3,
            tags: vec![],
        }
    }

    #[test]
    fn test_output_format_default() {
        assert_eq!(OutputFormat::default(), OutputFormat::Text);
        assert_eq!(Formatter::default().format, OutputFormat::Text);
    }

    #[test]
    fn test_json_output() {
        let output = Formatter::new(OutputFormat::Json).format(&group("eg-1")).unwrap();
        let parsed: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["id"], "eg-1");
        assert_eq!(parsed["event_count"], 3);
    }

    #[test]
    fn test_text_puts_id_first_and_quotes_spaces() {
        let output = Formatter::new(OutputFormat::Text).format(&group("eg-1")).unwrap();
        assert!(output.starts_with("eg-1  "));
        assert!(output.contains("error_class:NoMethodError"));
        assert!(output.contains("message:\"undefined method 'foo' for nil\""));
        assert!(!output.contains("tags"));
    }

    #[test]
    fn test_text_skips_nulls() {
        let mut data = group("eg-2");
        data.message = None;
        let output = Formatter::new(OutputFormat::Text).format(&data).unwrap();
        assert!(!output.contains("message"));
        assert!(!output.contains("null"));
    }

    #[test]
    fn test_text_array_one_line_each() {
        let output = Formatter::new(OutputFormat::Text)
            .format(&vec![group("eg-1"), group("eg-2")])
            .unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("eg-2"));
    }

    #[test]
    fn test_text_nested_object_inline() {
        let value = serde_json::json!({"id": "ev-1", "context": {"user_id": "u1", "branch": null}});
        assert_eq!(render_text(&value), "ev-1  context:{user_id:u1}");
    }

    #[test]
    fn test_list_envelope() {
        let envelope = list_envelope(&[group("eg-1")], "groups").unwrap();
        assert_eq!(envelope["count"], 1);
        assert_eq!(envelope["groups"][0]["id"], "eg-1");
    }
}
