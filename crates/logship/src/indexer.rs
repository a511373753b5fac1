// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Moves records from the queue into the bulk session.
//!
//! The loop waits on the queue for at most the poll interval, so it re-checks the shutdown
//! signals at a bounded rate even when nothing is logged. Until the startup gate opens, records
//! stay in the queue: a full batch in the session would otherwise flush before the data stream
//! is provisioned. Once the queue is closed it drains everything still buffered, gate or not,
//! before reporting [`IndexerState::Stopped`].

use crate::counters::Counters;
use crate::errors::SessionError;
use crate::gate::StartupGate;
use crate::queue::BoundedEventQueue;
use crate::record::LogRecord;
use crate::session::{BatchSession, BulkOutcome, OperationType, OutcomeCallback};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerState {
    Running,
    /// The queue is closed; buffered records are being forwarded.
    Draining,
    Stopped,
}

pub(crate) struct IndexerLoop {
    queue: Arc<BoundedEventQueue<LogRecord>>,
    session: Arc<dyn BatchSession>,
    gate: StartupGate,
    counters: Arc<Counters>,
    target: String,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    state: watch::Sender<IndexerState>,
}

impl IndexerLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        queue: Arc<BoundedEventQueue<LogRecord>>,
        session: Arc<dyn BatchSession>,
        gate: StartupGate,
        counters: Arc<Counters>,
        target: String,
        poll_interval: Duration,
        running: Arc<AtomicBool>,
        cancel_token: CancellationToken,
    ) -> (Self, watch::Receiver<IndexerState>) {
        let (state, state_rx) = watch::channel(IndexerState::Running);
        (
            Self {
                queue,
                session,
                gate,
                counters,
                target,
                poll_interval,
                running,
                cancel_token,
                state,
            },
            state_rx,
        )
    }

    pub(crate) async fn run(self) {
        debug!(data_stream = %self.target, "LOGSHIP | Indexer started");
        loop {
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => {
                    if self.running.load(Ordering::Acquire) {
                        warn!("LOGSHIP | Indexer cancelled while the shipper was still running");
                    } else {
                        debug!("LOGSHIP | Indexer cancelled during shutdown");
                    }
                    break;
                }
                done = self.step() => {
                    if done {
                        break;
                    }
                }
            }
        }
        self.state.send_replace(IndexerState::Stopped);
        debug!("LOGSHIP | Indexer stopped");
    }

    /// Handles one queue wait. Returns `true` once the queue is closed and empty.
    async fn step(&self) -> bool {
        if !self.gate.is_open() && !self.queue.is_closed() {
            // Bounded so a queue closed by stop is noticed.
            let _ = tokio::time::timeout(self.poll_interval, self.gate.wait()).await;
            return false;
        }
        let next = self.queue.receive(self.poll_interval).await;
        if self.queue.is_closed() && *self.state.borrow() == IndexerState::Running {
            debug!(
                buffered = self.queue.len(),
                "LOGSHIP | Queue closed, draining"
            );
            self.state.send_replace(IndexerState::Draining);
        }
        match next {
            Some(record) => {
                self.index(record).await;
                false
            }
            None => self.queue.is_closed() && self.queue.is_empty(),
        }
    }

    async fn index(&self, record: LogRecord) {
        self.counters.record_received();
        let document = match record.to_document() {
            Ok(document) => document,
            Err(e) => {
                let reason = format!("unserializable record: {e}");
                self.counters.on_outcome(BulkOutcome::ItemFailed {
                    operation: OperationType::Create,
                    reason: &reason,
                });
                return;
            }
        };
        match self.session.create(&self.target, document).await {
            Ok(()) => {}
            // Outcomes of an implicit flush have already been reported.
            Err(SessionError::Closed) => {
                warn!("LOGSHIP | Session closed, record not indexed");
            }
            Err(e) => debug!("LOGSHIP | Implicit flush failed: {e}"),
        }
    }
}
