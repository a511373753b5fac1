// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns stdin lines into log events.

use logship::LogEvent;
use serde_json::{Map, Value};

/// Logger and level used for lines that don't carry their own.
#[derive(Debug, Clone)]
pub struct LineDefaults {
    pub logger: String,
    pub level: String,
}

impl Default for LineDefaults {
    fn default() -> Self {
        Self {
            logger: "stdin".to_string(),
            level: "INFO".to_string(),
        }
    }
}

/// Parses one line. Blank lines yield nothing. A JSON object supplies `message`, `level` and
/// `logger`, and its other scalar fields become diagnostic context; anything else is taken
/// verbatim as the message.
#[must_use]
pub fn parse_line(line: &str, defaults: &LineDefaults) -> Option<LogEvent> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return None;
    }
    if trimmed.trim_start().starts_with('{') {
        if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(trimmed) {
            return Some(from_object(fields, defaults));
        }
    }
    Some(LogEvent::new(
        trimmed,
        defaults.logger.as_str(),
        defaults.level.as_str(),
    ))
}

fn from_object(mut fields: Map<String, Value>, defaults: &LineDefaults) -> LogEvent {
    let message = fields.remove("message").map(scalar).unwrap_or_default();
    let level = fields
        .remove("level")
        .map(scalar)
        .map(|level| level.to_uppercase())
        .unwrap_or_else(|| defaults.level.clone());
    let logger = fields
        .remove("logger")
        .map(scalar)
        .unwrap_or_else(|| defaults.logger.clone());

    let mut event = LogEvent::new(message, logger, level);
    event.mdc = fields
        .into_iter()
        .filter(|(_, value)| !matches!(value, Value::Null | Value::Array(_) | Value::Object(_)))
        .map(|(key, value)| (key, scalar(value)))
        .collect();
    event
}

fn scalar(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_lines_are_skipped() {
        let defaults = LineDefaults::default();
        assert!(parse_line("", &defaults).is_none());
        assert!(parse_line("   \n", &defaults).is_none());
    }

    #[test]
    fn test_plain_line_uses_defaults() {
        let defaults = LineDefaults {
            logger: "nginx".to_string(),
            level: "WARN".to_string(),
        };
        let event = parse_line("GET /health 200\n", &defaults).unwrap();
        assert_eq!(event.message, "GET /health 200");
        assert_eq!(event.logger, "nginx");
        assert_eq!(event.level, "WARN");
        assert!(event.mdc.is_empty());
    }

    #[test]
    fn test_json_line_supplies_fields() {
        let line = r#"{"message":"payment captured","level":"error","logger":"billing","amount":42,"retry":true,"customer":"c-9","tags":["a"],"extra":null}"#;
        let event = parse_line(line, &LineDefaults::default()).unwrap();

        assert_eq!(event.message, "payment captured");
        assert_eq!(event.level, "ERROR");
        assert_eq!(event.logger, "billing");
        assert_eq!(event.mdc.len(), 3);
        assert_eq!(event.mdc["amount"], "42");
        assert_eq!(event.mdc["retry"], "true");
        assert_eq!(event.mdc["customer"], "c-9");
    }

    #[test]
    fn test_json_line_without_level_uses_default() {
        let event = parse_line(r#"{"message":"hi"}"#, &LineDefaults::default()).unwrap();
        assert_eq!(event.level, "INFO");
        assert_eq!(event.logger, "stdin");
    }

    #[test]
    fn test_invalid_json_is_taken_verbatim() {
        let event = parse_line("{not json", &LineDefaults::default()).unwrap();
        assert_eq!(event.message, "{not json");
    }
}
