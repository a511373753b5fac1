// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Errors surfaced to the owner of a [`crate::shipper::LogShipper`].
///
/// Only configuration and session-open failures ever reach the caller; everything that
/// happens in steady state is counted and logged instead.
#[derive(Debug, thiserror::Error)]
pub enum ShipperError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to open bulk session: {0}")]
    SessionOpen(#[source] SessionError),

    #[error("Shipper already started")]
    AlreadyStarted,

    #[error("Shipper not started")]
    NotStarted,
}

/// Errors raised by a batching session or by index provisioning.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Session is closed")]
    Closed,

    #[error("Failed to serialize document: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}
