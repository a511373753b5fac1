// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory store and session for pipeline tests.

use crate::config::RetentionConfig;
use crate::errors::SessionError;
use crate::session::{
    BatchSession, BulkOutcome, DocumentStore, IndexProvisioner, OperationType, OutcomeCallback,
    SessionSettings,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub(crate) struct MemorySession {
    callback: Mutex<Option<Arc<dyn OutcomeCallback>>>,
    batch_size: AtomicUsize,
    pending: tokio::sync::Mutex<Vec<(String, String)>>,
    delivered: Mutex<Vec<(String, String)>>,
    closed: AtomicBool,
    fail_flushes: AtomicBool,
    reject_containing: Mutex<Option<String>>,
    flush_delay: Mutex<Option<Duration>>,
    non_empty_flushes: AtomicUsize,
    close_calls: AtomicUsize,
}

impl MemorySession {
    pub(crate) fn delivered(&self) -> Vec<String> {
        self.delivered_with_targets()
            .into_iter()
            .map(|(_, document)| document)
            .collect()
    }

    pub(crate) fn delivered_with_targets(&self) -> Vec<(String, String)> {
        self.delivered
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_fail_flushes(&self, fail: bool) {
        self.fail_flushes.store(fail, Ordering::SeqCst);
    }

    /// Reject every document containing `needle` with an item failure.
    pub(crate) fn reject_containing(&self, needle: &str) {
        *self.reject_containing.lock().unwrap() = Some(needle.to_string());
    }

    /// Make every flush hang for `delay` before doing anything.
    pub(crate) fn set_flush_delay(&self, delay: Duration) {
        *self.flush_delay.lock().unwrap() = Some(delay);
    }

    /// Flushes that carried at least one document.
    pub(crate) fn non_empty_flushes(&self) -> usize {
        self.non_empty_flushes.load(Ordering::SeqCst)
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn report(&self, outcome: BulkOutcome<'_>) {
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback.on_outcome(outcome);
        }
    }
}

#[async_trait]
impl BatchSession for MemorySession {
    async fn create(&self, target: &str, document: String) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let full = {
            let mut pending = self.pending.lock().await;
            pending.push((target.to_string(), document));
            pending.len() >= self.batch_size.load(Ordering::SeqCst).max(1)
        };
        if full {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SessionError> {
        let delay = *self.flush_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        // Held until every outcome is reported, so concurrent flushes deliver in order.
        let mut pending = self.pending.lock().await;
        let batch = std::mem::take(&mut *pending);
        if batch.is_empty() {
            return Ok(());
        }
        self.non_empty_flushes.fetch_add(1, Ordering::SeqCst);

        if self.fail_flushes.load(Ordering::SeqCst) {
            let error = SessionError::Status {
                status: 503,
                body: "unavailable".to_string(),
            };
            self.report(BulkOutcome::BatchFailed {
                error: &error,
                operations: batch.len(),
            });
            return Err(error);
        }

        let needle = self.reject_containing.lock().unwrap().clone();
        for (target, document) in batch {
            if needle.as_deref().is_some_and(|n| document.contains(n)) {
                self.report(BulkOutcome::ItemFailed {
                    operation: OperationType::Create,
                    reason: "document rejected",
                });
            } else {
                self.delivered.lock().unwrap().push((target, document));
                self.report(BulkOutcome::ItemOk {
                    operation: OperationType::Create,
                });
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.flush().await
    }
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    pub(crate) session: Arc<MemorySession>,
    fail_open: AtomicBool,
    opened: AtomicUsize,
}

impl MemoryStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing() -> Arc<Self> {
        let store = Self::default();
        store.fail_open.store(true, Ordering::SeqCst);
        Arc::new(store)
    }

    pub(crate) fn sessions_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn open_session(
        &self,
        settings: SessionSettings,
        callback: Arc<dyn OutcomeCallback>,
    ) -> Result<Arc<dyn BatchSession>, SessionError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(SessionError::Transport("connection refused".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.session
            .batch_size
            .store(settings.batch_size, Ordering::SeqCst);
        *self.session.callback.lock().unwrap() = Some(callback);
        Ok(Arc::clone(&self.session) as Arc<dyn BatchSession>)
    }
}

/// Provisioner that takes `delay` and then reports `result`, recording whether anything was
/// delivered before it finished.
pub(crate) struct SlowProvisioner {
    pub(crate) delay: Duration,
    pub(crate) result: Result<bool, ()>,
    pub(crate) session: Arc<MemorySession>,
    pub(crate) delivered_before_ready: AtomicUsize,
    pub(crate) calls: AtomicUsize,
}

impl SlowProvisioner {
    pub(crate) fn new(delay: Duration, session: Arc<MemorySession>) -> Arc<Self> {
        Arc::new(Self {
            delay,
            result: Ok(true),
            session,
            delivered_before_ready: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn failing(delay: Duration, session: Arc<MemorySession>) -> Arc<Self> {
        Arc::new(Self {
            delay,
            result: Err(()),
            session,
            delivered_before_ready: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl IndexProvisioner for SlowProvisioner {
    async fn ensure_index_infrastructure(
        &self,
        _prefix: &str,
        _retention: &RetentionConfig,
    ) -> Result<bool, SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.delivered_before_ready
            .store(self.session.delivered().len(), Ordering::SeqCst);
        self.result.map_err(|()| SessionError::Status {
            status: 403,
            body: "forbidden".to_string(),
        })
    }
}
