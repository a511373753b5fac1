// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `tracing` integration.
//!
//! [`ShipperLayer`] turns every event seen by a subscriber into a [`LogEvent`] and hands it
//! to a [`LogSender`]. Fields of the enclosing spans, root first, become diagnostic context;
//! the event's own fields override them. Events from this crate and from the HTTP stack it
//! uses are ignored, so shipping never feeds on itself.

use crate::record::LogException;
use crate::shipper::LogSender;
use crate::transform::{exception_chain, LogEvent};
use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const IGNORED_TARGETS: &[&str] = &[
    "logship",
    "reqwest",
    "hyper",
    "hyper_util",
    "h2",
    "rustls",
];

fn is_ignored(target: &str) -> bool {
    IGNORED_TARGETS.iter().any(|ignored| {
        target
            .strip_prefix(ignored)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
    })
}

/// Fields recorded on a span, kept in its extensions.
#[derive(Debug, Default)]
struct SpanFields(BTreeMap<String, String>);

#[derive(Default)]
struct FieldVisitor {
    capture_backtraces: bool,
    message: Option<String>,
    fields: BTreeMap<String, String>,
    exceptions: Option<Vec<LogException>>,
}

impl FieldVisitor {
    fn new(capture_backtraces: bool) -> Self {
        Self {
            capture_backtraces,
            ..Self::default()
        }
    }

    fn insert(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.to_string());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.to_string());
    }

    fn record_error(&mut self, _field: &Field, value: &(dyn Error + 'static)) {
        // First error wins; its chain already covers the causes.
        if self.exceptions.is_none() {
            let backtrace = self.capture_backtraces.then(Backtrace::force_capture);
            self.exceptions = Some(exception_chain(value, backtrace.as_ref()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, format!("{value:?}"));
    }
}

/// Ships `tracing` events. Install it on a registry-based subscriber.
#[derive(Debug, Clone)]
pub struct ShipperLayer {
    sender: LogSender,
    capture_backtraces: bool,
}

impl ShipperLayer {
    #[must_use]
    pub fn new(sender: LogSender) -> Self {
        Self {
            sender,
            capture_backtraces: false,
        }
    }

    /// Attach a backtrace of the logging call site to events carrying an error.
    #[must_use]
    pub fn with_backtraces(mut self, capture: bool) -> Self {
        self.capture_backtraces = capture;
        self
    }
}

impl<S> Layer<S> for ShipperLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        span.extensions_mut().insert(SpanFields(visitor.fields));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<SpanFields>() {
            Some(fields) => fields.0.extend(visitor.fields),
            None => extensions.insert(SpanFields(visitor.fields)),
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if is_ignored(metadata.target()) || self.sender.is_closed() {
            return;
        }

        let mut mdc = BTreeMap::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(fields) = span.extensions().get::<SpanFields>() {
                    mdc.extend(fields.0.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }

        let mut visitor = FieldVisitor::new(self.capture_backtraces);
        event.record(&mut visitor);
        mdc.extend(visitor.fields);

        let mut log_event = LogEvent::new(
            visitor.message.unwrap_or_default(),
            metadata.target(),
            metadata.level().as_str(),
        );
        log_event.thread = std::thread::current().name().map(str::to_string);
        log_event.mdc = mdc;
        log_event.exceptions = visitor.exceptions;
        self.sender.send_event(log_event);
    }
}
