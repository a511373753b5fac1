// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle controller tying the pipeline together.
//!
//! ```text
//!   producers ── LogSender ──> BoundedEventQueue ──> IndexerLoop ──┐
//!                                                                 │ create
//!                                                                 v
//!   provisioning ──> StartupGate ──> FlushLoop ───── flush ──> BatchSession ──> Counters
//! ```
//!
//! [`LogShipper::start`] opens the session and spawns the indexer, the flush loop and (when
//! enabled) index provisioning. The startup gate holds back both the flush loop and the
//! indexer, so no batch reaches the store before the data stream is set up. [`LogShipper::stop`] closes the queue, lets the indexer drain
//! it, flushes once more, tears the tasks down and closes the session. Every wait during
//! shutdown is bounded by the configured flush timeout.

use crate::config::{GateFailurePolicy, ShipperConfig};
use crate::counters::{Counters, CountersSnapshot};
use crate::errors::{SessionError, ShipperError};
use crate::flusher::{bounded, FlushLoop, FlushState};
use crate::gate::StartupGate;
use crate::indexer::{IndexerLoop, IndexerState};
use crate::layer::ShipperLayer;
use crate::queue::BoundedEventQueue;
use crate::record::LogRecord;
use crate::session::{
    BatchSession, DocumentStore, IndexProvisioner, OutcomeCallback, SessionSettings,
};
use crate::transform::{FieldShaping, LogEvent};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn, Dispatch};

/// Cheap, cloneable handle producers use to hand records to the shipper.
///
/// Sending never blocks under the default overflow policy and never fails loudly: the return
/// value only says whether the record was accepted without evicting an older one.
#[derive(Clone)]
pub struct LogSender {
    queue: Arc<BoundedEventQueue<LogRecord>>,
    shaping: Arc<FieldShaping>,
    context: Arc<BTreeMap<String, String>>,
    context_name: Option<String>,
}

impl LogSender {
    pub(crate) fn new(
        queue: Arc<BoundedEventQueue<LogRecord>>,
        shaping: Arc<FieldShaping>,
        context: BTreeMap<String, String>,
        context_name: Option<String>,
    ) -> Self {
        Self {
            queue,
            shaping,
            context: Arc::new(context),
            context_name,
        }
    }

    pub fn send(&self, record: LogRecord) -> bool {
        self.queue.enqueue(record)
    }

    /// Fills in the process context, shapes the event and enqueues it.
    pub fn send_event(&self, mut event: LogEvent) -> bool {
        for (key, value) in self.context.iter() {
            event
                .context
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        if event.context_name.is_none() {
            event.context_name.clone_from(&self.context_name);
        }
        self.send(self.shaping.shape(event))
    }

    /// `true` once the shipper has been stopped.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl std::fmt::Debug for LogSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSender")
            .field("buffered", &self.queue.len())
            .field("closed", &self.queue.is_closed())
            .finish_non_exhaustive()
    }
}

struct Tasks {
    session: Arc<dyn BatchSession>,
    indexer: JoinHandle<()>,
    indexer_state: watch::Receiver<IndexerState>,
    indexer_cancel: CancellationToken,
    flusher: JoinHandle<()>,
    flusher_state: watch::Receiver<FlushState>,
    flusher_cancel: CancellationToken,
    provisioning: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort(&self) {
        self.indexer_cancel.cancel();
        self.flusher_cancel.cancel();
        self.indexer.abort();
        self.flusher.abort();
        if let Some(provisioning) = &self.provisioning {
            provisioning.abort();
        }
    }
}

enum Lifecycle {
    Idle,
    Started(Box<Tasks>),
    /// `start` failed to open the session.
    Failed,
    Stopped,
}

pub struct LogShipper {
    config: Arc<ShipperConfig>,
    store: Arc<dyn DocumentStore>,
    provisioner: Option<Arc<dyn IndexProvisioner>>,
    queue: Arc<BoundedEventQueue<LogRecord>>,
    shaping: Arc<FieldShaping>,
    counters: Arc<Counters>,
    gate: StartupGate,
    running: Arc<AtomicBool>,
    diagnostics: Dispatch,
    lifecycle: Mutex<Lifecycle>,
}

impl LogShipper {
    /// Creates a stopped shipper. Records can be sent right away; they are buffered until
    /// [`LogShipper::start`] runs.
    ///
    /// The shipper's own diagnostics go to the dispatcher that is current at construction
    /// unless [`LogShipper::with_diagnostics`] says otherwise.
    #[must_use]
    pub fn new(config: ShipperConfig, store: Arc<dyn DocumentStore>) -> Self {
        let queue = Arc::new(BoundedEventQueue::new(
            config.queue_capacity,
            config.overflow_policy,
        ));
        let shaping = Arc::new(FieldShaping::from_config(&config));
        Self {
            config: Arc::new(config),
            store,
            provisioner: None,
            queue,
            shaping,
            counters: Arc::new(Counters::new()),
            gate: StartupGate::new(),
            running: Arc::new(AtomicBool::new(false)),
            diagnostics: tracing::dispatcher::get_default(Dispatch::clone),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Provisions the index infrastructure on start. Without a provisioner, or with
    /// provisioning disabled, the startup gate opens immediately.
    #[must_use]
    pub fn with_provisioner(mut self, provisioner: Arc<dyn IndexProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Sends the shipper's own diagnostics to `dispatch`.
    #[must_use]
    pub fn with_diagnostics(mut self, dispatch: Dispatch) -> Self {
        self.diagnostics = dispatch;
        self
    }

    #[must_use]
    pub fn sender(&self) -> LogSender {
        LogSender::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.shaping),
            self.config.context_properties.clone(),
            self.config.context_name.clone(),
        )
    }

    /// A `tracing` layer that ships every event through this shipper.
    #[must_use]
    pub fn layer(&self) -> ShipperLayer {
        ShipperLayer::new(self.sender()).with_backtraces(self.config.capture_backtraces)
    }

    pub fn config(&self) -> &ShipperConfig {
        &self.config
    }

    pub fn gate(&self) -> &StartupGate {
        &self.gate
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn counters(&self) -> CountersSnapshot {
        self.counters.set_dropped(self.queue.dropped());
        self.counters.snapshot()
    }

    /// Opens the session and launches the background tasks.
    ///
    /// # Errors
    ///
    /// [`ShipperError::InvalidConfig`] if the configuration doesn't validate,
    /// [`ShipperError::SessionOpen`] if the store can't be reached and
    /// [`ShipperError::AlreadyStarted`] on any call after the first.
    pub async fn start(&self) -> Result<(), ShipperError> {
        self.start_inner()
            .with_subscriber(self.diagnostics.clone())
            .await
    }

    async fn start_inner(&self) -> Result<(), ShipperError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return Err(ShipperError::AlreadyStarted);
        }
        self.config.validate()?;

        let settings = SessionSettings {
            target: self.config.target.clone(),
            batch_size: self.config.batch_size,
            fail_fast: false,
        };
        let callback = Arc::clone(&self.counters) as Arc<dyn OutcomeCallback>;
        let session = match self.store.open_session(settings, callback).await {
            Ok(session) => session,
            Err(e) => {
                error!("LOGSHIP | Failed to open bulk session: {e}");
                *lifecycle = Lifecycle::Failed;
                return Err(ShipperError::SessionOpen(e));
            }
        };
        self.running.store(true, Ordering::Release);

        let indexer_cancel = CancellationToken::new();
        let (indexer, indexer_state) = IndexerLoop::new(
            Arc::clone(&self.queue),
            Arc::clone(&session),
            self.gate.clone(),
            Arc::clone(&self.counters),
            self.config.target.clone(),
            self.config.poll_interval,
            Arc::clone(&self.running),
            indexer_cancel.clone(),
        );
        let indexer = tokio::spawn(indexer.run().with_subscriber(self.diagnostics.clone()));

        let flusher_cancel = CancellationToken::new();
        let (flusher, flusher_state) = FlushLoop::new(
            Arc::clone(&session),
            self.gate.clone(),
            self.config.flush_interval,
            self.config.tick,
            self.config.flush_timeout,
            Arc::clone(&self.running),
            flusher_cancel.clone(),
        );
        let flusher = tokio::spawn(flusher.run().with_subscriber(self.diagnostics.clone()));

        let provisioning = self.launch_provisioning();

        *lifecycle = Lifecycle::Started(Box::new(Tasks {
            session,
            indexer,
            indexer_state,
            indexer_cancel,
            flusher,
            flusher_state,
            flusher_cancel,
            provisioning,
        }));
        info!(
            data_stream = %self.config.target,
            batch_size = self.config.batch_size,
            queue_capacity = self.queue.capacity(),
            "LOGSHIP | Shipper started"
        );
        Ok(())
    }

    fn launch_provisioning(&self) -> Option<JoinHandle<()>> {
        let settings = &self.config.provisioning;
        let provisioner = match &self.provisioner {
            Some(provisioner) if settings.enabled => Arc::clone(provisioner),
            _ => {
                debug!("LOGSHIP | Provisioning disabled, opening startup gate");
                self.gate.open();
                return None;
            }
        };

        let gate = self.gate.clone();
        let prefix = self.config.target.clone();
        let retention = settings.retention.clone();
        let policy = settings.failure_policy;
        let limit = settings.timeout;
        let task = async move {
            let attempt = provisioner.ensure_index_infrastructure(&prefix, &retention);
            let outcome = match limit {
                Some(limit) => tokio::time::timeout(limit, attempt)
                    .await
                    .unwrap_or(Err(SessionError::Timeout(limit))),
                None => attempt.await,
            };
            let failure = match outcome {
                Ok(true) => {
                    info!("LOGSHIP | Index infrastructure ready for {prefix}");
                    gate.open();
                    return;
                }
                Ok(false) => "infrastructure incomplete".to_string(),
                Err(e) => e.to_string(),
            };
            match policy {
                GateFailurePolicy::Open => {
                    warn!("LOGSHIP | Provisioning {prefix} failed ({failure}), flushing anyway");
                    gate.open();
                }
                GateFailurePolicy::KeepClosed => {
                    error!("LOGSHIP | Provisioning {prefix} failed ({failure}), flushing disabled");
                }
            }
        };
        Some(tokio::spawn(task.with_subscriber(self.diagnostics.clone())))
    }

    /// Drains, flushes and closes. Returns the final counters.
    ///
    /// Safe to call more than once, and after a failed [`LogShipper::start`]; the session is
    /// closed at most once.
    ///
    /// # Errors
    ///
    /// [`ShipperError::NotStarted`] if `start` was never called.
    pub async fn stop(&self) -> Result<CountersSnapshot, ShipperError> {
        self.stop_inner()
            .with_subscriber(self.diagnostics.clone())
            .await
    }

    async fn stop_inner(&self) -> Result<CountersSnapshot, ShipperError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let tasks = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle => {
                *lifecycle = Lifecycle::Idle;
                return Err(ShipperError::NotStarted);
            }
            Lifecycle::Failed | Lifecycle::Stopped => {
                self.queue.close();
                return Ok(self.counters());
            }
            Lifecycle::Started(tasks) => tasks,
        };
        let limit = self.config.flush_timeout;

        self.running.store(false, Ordering::Release);
        self.queue.close();

        let mut indexer_state = tasks.indexer_state.clone();
        if tokio::time::timeout(
            limit,
            indexer_state.wait_for(|state| *state == IndexerState::Stopped),
        )
        .await
        .is_err()
        {
            warn!(
                buffered = self.queue.len(),
                "LOGSHIP | Indexer did not drain within {limit:?}"
            );
        }

        if let Err(e) = bounded(limit, tasks.session.flush()).await {
            warn!("LOGSHIP | Final flush failed: {e}");
        }

        tasks.flusher_cancel.cancel();
        let mut flusher_state = tasks.flusher_state.clone();
        if tokio::time::timeout(
            limit,
            flusher_state.wait_for(|state| *state == FlushState::Stopped),
        )
        .await
        .is_err()
        {
            warn!("LOGSHIP | Flush loop did not stop within {limit:?}");
        }
        tasks.abort();

        if let Err(e) = bounded(limit, tasks.session.close()).await {
            warn!("LOGSHIP | Failed to close bulk session: {e}");
        }

        let counters = self.counters();
        info!(
            received = counters.received,
            indexed_ok = counters.indexed_ok,
            item_failed = counters.item_failed,
            request_error = counters.request_error,
            lost_in_failed_requests = counters.lost_in_failed_requests,
            dropped = counters.dropped,
            "LOGSHIP | Shipper stopped"
        );
        Ok(counters)
    }
}

impl Drop for LogShipper {
    fn drop(&mut self) {
        if let Lifecycle::Started(tasks) = self.lifecycle.get_mut() {
            self.running.store(false, Ordering::Release);
            self.queue.close();
            tasks.abort();
        }
    }
}
