// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Contract between the shipping pipeline and the document store.
//!
//! The pipeline only ever talks to a store through these traits: it opens one
//! [`BatchSession`] at startup, feeds it `create` operations one document at a time, asks it
//! to flush periodically, and closes it on shutdown. Each unit of work inside a flushed batch
//! is reported back through exactly one [`BulkOutcome`].

use crate::config::RetentionConfig;
use crate::errors::SessionError;
use async_trait::async_trait;
use std::sync::Arc;

/// Bulk operation types the pipeline emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    /// Append a new document with an auto-generated id. Never overwrites.
    Create,
}

impl OperationType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
        }
    }
}

/// Outcome of one unit of work in a flushed batch.
#[derive(Debug, Clone, Copy)]
pub enum BulkOutcome<'a> {
    /// The store acknowledged the document.
    ItemOk { operation: OperationType },
    /// The request succeeded but the store rejected this document.
    ItemFailed {
        operation: OperationType,
        reason: &'a str,
    },
    /// The whole request failed; none of its `operations` documents got an item outcome.
    BatchFailed {
        error: &'a SessionError,
        operations: usize,
    },
}

/// Receives bulk outcomes. Called from whatever task performs the flush, once per document
/// (or once per failed request), so implementations must be cheap and must not block.
pub trait OutcomeCallback: Send + Sync {
    fn on_outcome(&self, outcome: BulkOutcome<'_>);
}

/// Parameters for opening a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub target: String,
    /// Pending operations that trigger an implicit flush.
    pub batch_size: usize,
    /// Stop inspecting a batch at its first failed item. The items after it are still
    /// reported, as failures.
    pub fail_fast: bool,
}

/// Buffers write operations and submits them in bulk.
///
/// Implementations serialize their own internal state; the pipeline calls `create` from the
/// indexer task and `flush` from the flush task concurrently.
#[async_trait]
pub trait BatchSession: Send + Sync {
    /// Buffers a `create` of `document` (serialized JSON) into `target`. May flush when the
    /// buffer reaches the batch size, in which case transport failures surface here.
    async fn create(&self, target: &str, document: String) -> Result<(), SessionError>;

    /// Submits every pending operation.
    async fn flush(&self) -> Result<(), SessionError>;

    /// Flushes what is left and releases the session. Later `create` calls fail with
    /// [`SessionError::Closed`].
    async fn close(&self) -> Result<(), SessionError>;
}

/// Opens batching sessions.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn open_session(
        &self,
        settings: SessionSettings,
        callback: Arc<dyn OutcomeCallback>,
    ) -> Result<Arc<dyn BatchSession>, SessionError>;
}

/// Creates templates, lifecycle policy and data stream for a prefix. Idempotent.
#[async_trait]
pub trait IndexProvisioner: Send + Sync {
    /// Returns `true` when the infrastructure was created or already existed.
    async fn ensure_index_infrastructure(
        &self,
        prefix: &str,
        retention: &RetentionConfig,
    ) -> Result<bool, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_type_name() {
        assert_eq!(OperationType::Create.as_str(), "create");
    }

    #[test]
    fn test_bulk_outcome_debug_format() {
        let error = SessionError::Closed;
        let outcome = BulkOutcome::BatchFailed {
            error: &error,
            operations: 3,
        };
        let debug_str = format!("{outcome:?}");
        assert!(debug_str.contains("BatchFailed"));
        assert!(debug_str.contains("operations: 3"));
    }
}
