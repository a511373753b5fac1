// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The document shape written to the data stream.
//!
//! Records are built once per captured event by [`crate::transform`] and never mutated
//! afterwards. Optional fields and empty maps are left out of the serialized document so
//! that indexed documents don't carry empty objects.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// A typed diagnostic context value.
///
/// Values that were configured for numeric coercion but failed to parse become [`Null`].
///
/// [`Null`]: DiagnosticValue::Null
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DiagnosticValue {
    Long(i64),
    Double(f64),
    String(String),
    Null,
}

/// One entry of a linearized error cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogException {
    pub class_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub message: String,
    pub logger: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    pub level: String,
    #[serde(rename = "@timestamp", with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mdc: Option<BTreeMap<String, DiagnosticValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_list: Option<Vec<LogException>>,
}

impl LogRecord {
    /// Creates a record stamped with the current time and no context.
    #[must_use]
    pub fn new(
        message: impl Into<String>,
        logger: impl Into<String>,
        level: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            logger: logger.into(),
            thread: None,
            level: level.into(),
            timestamp: OffsetDateTime::now_utc(),
            mdc: None,
            context: None,
            context_name: None,
            exception_list: None,
        }
    }

    pub fn to_document(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn sample() -> LogRecord {
        let mut record = LogRecord::new("hello world", "app::handler", "INFO");
        record.timestamp = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        record
    }

    #[test]
    fn test_minimal_record_omits_absent_fields() {
        let json: Value = serde_json::from_str(&sample().to_document().unwrap()).unwrap();
        let object = json.as_object().unwrap();

        assert_eq!(object["message"], "hello world");
        assert_eq!(object["logger"], "app::handler");
        assert_eq!(object["level"], "INFO");
        assert_eq!(object["@timestamp"], "2023-11-14T22:13:20Z");
        for absent in ["thread", "mdc", "context", "contextName", "exceptionList"] {
            assert!(!object.contains_key(absent), "{absent} should be omitted");
        }
    }

    #[test]
    fn test_typed_diagnostic_values() {
        let mut record = sample();
        record.mdc = Some(BTreeMap::from([
            ("duration_ms".to_string(), DiagnosticValue::Long(42)),
            ("ratio".to_string(), DiagnosticValue::Double(0.5)),
            ("user".to_string(), DiagnosticValue::String("alice".to_string())),
            ("broken".to_string(), DiagnosticValue::Null),
        ]));

        let json: Value = serde_json::from_str(&record.to_document().unwrap()).unwrap();
        assert_eq!(json["mdc"]["duration_ms"], 42);
        assert_eq!(json["mdc"]["ratio"], 0.5);
        assert_eq!(json["mdc"]["user"], "alice");
        assert!(json["mdc"]["broken"].is_null());
    }

    #[test]
    fn test_exception_list_uses_camel_case() {
        let mut record = sample();
        record.context_name = Some("checkout".to_string());
        record.exception_list = Some(vec![LogException {
            class_name: "ParseIntError".to_string(),
            message: "invalid digit found in string".to_string(),
            stack_trace: None,
        }]);

        let json: Value = serde_json::from_str(&record.to_document().unwrap()).unwrap();
        assert_eq!(json["contextName"], "checkout");
        assert_eq!(json["exceptionList"][0]["className"], "ParseIntError");
        assert!(json["exceptionList"][0].get("stackTrace").is_none());
    }

    #[test]
    fn test_document_parses_back() {
        let mut record = sample();
        record.thread = Some("worker-1".to_string());
        record.context = Some(BTreeMap::from([("host".to_string(), "web-1".to_string())]));

        let parsed: LogRecord = serde_json::from_str(&record.to_document().unwrap()).unwrap();
        assert_eq!(parsed, record);
    }
}
