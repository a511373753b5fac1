// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery bookkeeping for one shipper instance.
//!
//! The counters double as the session's [`OutcomeCallback`], so every bulk outcome lands
//! here regardless of which task performed the flush.

use crate::session::{BulkOutcome, OutcomeCallback};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, warn};

#[derive(Debug, Default)]
pub struct Counters {
    received: AtomicU64,
    indexed_ok: AtomicU64,
    item_failed: AtomicU64,
    request_error: AtomicU64,
    lost_in_failed_requests: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    /// Records taken off the queue by the indexer.
    pub received: u64,
    pub indexed_ok: u64,
    pub item_failed: u64,
    /// Bulk requests that failed as a whole.
    pub request_error: u64,
    /// Documents that were part of a failed bulk request.
    pub lost_in_failed_requests: u64,
    /// Records evicted by the queue before the indexer saw them.
    pub dropped: u64,
}

impl CountersSnapshot {
    /// Records received but not yet accounted for by any bulk outcome.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.received
            .saturating_sub(self.indexed_ok + self.item_failed + self.lost_in_failed_requests)
    }
}

impl Counters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_dropped(&self, dropped: u64) {
        self.dropped.store(dropped, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            received: self.received.load(Ordering::Relaxed),
            indexed_ok: self.indexed_ok.load(Ordering::Relaxed),
            item_failed: self.item_failed.load(Ordering::Relaxed),
            request_error: self.request_error.load(Ordering::Relaxed),
            lost_in_failed_requests: self.lost_in_failed_requests.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl OutcomeCallback for Counters {
    fn on_outcome(&self, outcome: BulkOutcome<'_>) {
        match outcome {
            BulkOutcome::ItemOk { .. } => {
                self.indexed_ok.fetch_add(1, Ordering::Relaxed);
            }
            BulkOutcome::ItemFailed { operation, reason } => {
                self.item_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    operation = operation.as_str(),
                    "LOGSHIP | Bulk item failed: {reason}"
                );
            }
            BulkOutcome::BatchFailed { error, operations } => {
                self.request_error.fetch_add(1, Ordering::Relaxed);
                self.lost_in_failed_requests
                    .fetch_add(operations as u64, Ordering::Relaxed);
                error!(operations, "LOGSHIP | Bulk request failed: {error}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SessionError;
    use crate::session::OperationType;
    use std::sync::Arc;
    use tracing_test::traced_test;

    #[test]
    fn test_counters_start_at_zero() {
        assert_eq!(Counters::new().snapshot(), CountersSnapshot::default());
    }

    #[test]
    #[traced_test]
    fn test_outcomes_update_counters() {
        let counters = Counters::new();
        for _ in 0..4 {
            counters.record_received();
        }
        counters.on_outcome(BulkOutcome::ItemOk {
            operation: OperationType::Create,
        });
        counters.on_outcome(BulkOutcome::ItemFailed {
            operation: OperationType::Create,
            reason: "mapper_parsing_exception",
        });
        let error = SessionError::Transport("connection reset".to_string());
        counters.on_outcome(BulkOutcome::BatchFailed {
            error: &error,
            operations: 2,
        });

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.received, 4);
        assert_eq!(snapshot.indexed_ok, 1);
        assert_eq!(snapshot.item_failed, 1);
        assert_eq!(snapshot.request_error, 1);
        assert_eq!(snapshot.lost_in_failed_requests, 2);
        assert_eq!(snapshot.in_flight(), 0);

        assert!(logs_contain("mapper_parsing_exception"));
        assert!(logs_contain("connection reset"));
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let counters = Arc::new(Counters::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counters = Arc::clone(&counters);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        counters.record_received();
                        counters.on_outcome(BulkOutcome::ItemOk {
                            operation: OperationType::Create,
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.received, 40_000);
        assert_eq!(snapshot.indexed_ok, 40_000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let counters = Counters::new();
        counters.record_received();
        counters.set_dropped(3);
        let json = serde_json::to_value(counters.snapshot()).unwrap();
        assert_eq!(json["received"], 1);
        assert_eq!(json["dropped"], 3);
    }
}
