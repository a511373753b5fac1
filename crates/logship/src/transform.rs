// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns captured log events into [`LogRecord`]s.
//!
//! Shaping is pure and stateless apart from the compiled [`FieldShaping`] rules:
//! - diagnostic entries with blank values are dropped, configured keys are coerced to
//!   integers or floats (unparseable values become `null`), everything else stays a string;
//! - process-context entries are kept only when their key fully matches the configured
//!   filter and their value isn't blank;
//! - maps that end up empty are omitted.

use crate::config::ShipperConfig;
use crate::record::{DiagnosticValue, LogException, LogRecord};
use regex::Regex;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::error::Error;
use time::OffsetDateTime;
use tracing::warn;

/// A log event as handed over by the logging framework.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub message: String,
    pub logger: String,
    pub thread: Option<String>,
    pub level: String,
    pub timestamp: OffsetDateTime,
    /// Per call-site key-value data.
    pub mdc: BTreeMap<String, String>,
    /// Key-value data shared by every event of the process.
    pub context: BTreeMap<String, String>,
    pub context_name: Option<String>,
    pub exceptions: Option<Vec<LogException>>,
}

impl LogEvent {
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
            mdc: BTreeMap::new(),
            context: BTreeMap::new(),
            context_name: None,
            exceptions: None,
        }
    }
}

/// Compiled shaping rules.
#[derive(Debug, Clone, Default)]
pub struct FieldShaping {
    context_filter: Option<Regex>,
    long_keys: BTreeSet<String>,
    double_keys: BTreeSet<String>,
}

impl FieldShaping {
    /// Compiles the rules. An invalid filter pattern is logged and treated as no filter.
    #[must_use]
    pub fn new(
        context_key_filter: Option<&str>,
        long_keys: BTreeSet<String>,
        double_keys: BTreeSet<String>,
    ) -> Self {
        let context_filter = context_key_filter.and_then(|pattern| {
            match Regex::new(&format!("^(?:{pattern})$")) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("LOGSHIP | Ignoring invalid context key filter '{pattern}': {e}");
                    None
                }
            }
        });
        Self {
            context_filter,
            long_keys,
            double_keys,
        }
    }

    #[must_use]
    pub fn from_config(config: &ShipperConfig) -> Self {
        Self::new(
            config.context_key_filter.as_deref(),
            config.long_keys.clone(),
            config.double_keys.clone(),
        )
    }

    pub fn has_context_filter(&self) -> bool {
        self.context_filter.is_some()
    }

    #[must_use]
    pub fn shape(&self, event: LogEvent) -> LogRecord {
        let mdc: BTreeMap<String, DiagnosticValue> = event
            .mdc
            .into_iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(key, value)| {
                let typed = self.coerce(&key, value);
                (key, typed)
            })
            .collect();

        let context: BTreeMap<String, String> = event
            .context
            .into_iter()
            .filter(|(key, value)| {
                !value.trim().is_empty()
                    && self
                        .context_filter
                        .as_ref()
                        .map_or(true, |filter| filter.is_match(key))
            })
            .collect();

        LogRecord {
            message: event.message,
            logger: event.logger,
            thread: event.thread,
            level: event.level,
            timestamp: event.timestamp,
            mdc: (!mdc.is_empty()).then_some(mdc),
            context: (!context.is_empty()).then_some(context),
            context_name: event.context_name,
            exception_list: event.exceptions.filter(|list| !list.is_empty()),
        }
    }

    fn coerce(&self, key: &str, value: String) -> DiagnosticValue {
        if self.long_keys.contains(key) {
            value
                .trim()
                .parse::<i64>()
                .map_or(DiagnosticValue::Null, DiagnosticValue::Long)
        } else if self.double_keys.contains(key) {
            match value.trim().parse::<f64>() {
                Ok(number) if number.is_finite() => DiagnosticValue::Double(number),
                _ => DiagnosticValue::Null,
            }
        } else {
            DiagnosticValue::String(value)
        }
    }
}

/// Linearizes an error and its `source()` chain.
///
/// Sources are tracked by address and vtable, so a wrapper sharing its address with the error
/// it wraps still counts as distinct. The walk stops at the first repeat, so chains that loop
/// back on themselves still produce a finite list. A captured `backtrace` is attached
/// to the first frame.
#[must_use]
pub fn exception_chain(
    error: &(dyn Error + 'static),
    backtrace: Option<&Backtrace>,
) -> Vec<LogException> {
    let mut frames = vec![LogException {
        class_name: error_class_name(error),
        message: error.to_string(),
        stack_trace: backtrace.and_then(render_backtrace),
    }];

    let mut seen: HashSet<*const (dyn Error + 'static)> = HashSet::new();
    seen.insert(error_address(error));

    let mut cause = error.source();
    while let Some(current) = cause {
        if !seen.insert(error_address(current)) {
            break;
        }
        frames.push(LogException {
            class_name: error_class_name(current),
            message: current.to_string(),
            stack_trace: None,
        });
        cause = current.source();
    }
    frames
}

fn error_address(error: &(dyn Error + 'static)) -> *const (dyn Error + 'static) {
    error
}

/// Best-effort type name: the leading path of the `Debug` representation, e.g.
/// `ParseIntError` for `ParseIntError { kind: InvalidDigit }`.
fn error_class_name(error: &dyn Error) -> String {
    let debug = format!("{error:?}");
    let name: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();
    if name.is_empty() {
        "Error".to_string()
    } else {
        name
    }
}

fn render_backtrace(backtrace: &Backtrace) -> Option<Vec<String>> {
    if backtrace.status() != BacktraceStatus::Captured {
        return None;
    }
    let lines: Vec<String> = backtrace
        .to_string()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    (!lines.is_empty()).then_some(lines)
}
