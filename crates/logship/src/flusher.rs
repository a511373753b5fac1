// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-based flushing of the bulk session.
//!
//! The session flushes on its own when a batch fills up. This loop covers the quiet periods:
//! once per tick it checks how long ago the last flush happened and, if the flush interval
//! has elapsed and the startup gate is open, flushes whatever is pending.

use crate::errors::SessionError;
use crate::gate::StartupGate;
use crate::session::BatchSession;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Running,
    Stopped,
}

/// Runs a session operation, turning an overrun of `limit` into [`SessionError::Timeout`].
pub(crate) async fn bounded<F>(limit: Duration, operation: F) -> Result<(), SessionError>
where
    F: Future<Output = Result<(), SessionError>>,
{
    tokio::time::timeout(limit, operation)
        .await
        .unwrap_or(Err(SessionError::Timeout(limit)))
}

pub(crate) struct FlushLoop {
    session: Arc<dyn BatchSession>,
    gate: StartupGate,
    flush_interval: Duration,
    tick: Duration,
    flush_timeout: Duration,
    running: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    state: watch::Sender<FlushState>,
}

impl FlushLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session: Arc<dyn BatchSession>,
        gate: StartupGate,
        flush_interval: Duration,
        tick: Duration,
        flush_timeout: Duration,
        running: Arc<AtomicBool>,
        cancel_token: CancellationToken,
    ) -> (Self, watch::Receiver<FlushState>) {
        let (state, state_rx) = watch::channel(FlushState::Running);
        (
            Self {
                session,
                gate,
                flush_interval,
                tick,
                flush_timeout,
                running,
                cancel_token,
                state,
            },
            state_rx,
        )
    }

    pub(crate) async fn run(self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_flush: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => {
                    if self.running.load(Ordering::Acquire) {
                        warn!("LOGSHIP | Flush loop cancelled while the shipper was still running");
                    } else {
                        debug!("LOGSHIP | Flush loop cancelled during shutdown");
                    }
                    break;
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let Some(last) = last_flush else {
                        last_flush = Some(now);
                        continue;
                    };
                    if now.duration_since(last) < self.flush_interval {
                        continue;
                    }
                    if !self.gate.is_open() {
                        debug!("LOGSHIP | Index infrastructure not ready, postponing flush");
                        continue;
                    }
                    self.flush_once().await;
                    last_flush = Some(Instant::now());
                }
            }
        }
        self.state.send_replace(FlushState::Stopped);
    }

    async fn flush_once(&self) {
        match bounded(self.flush_timeout, self.session.flush()).await {
            Ok(()) => debug!("LOGSHIP | Periodic flush completed"),
            Err(e) => warn!("LOGSHIP | Periodic flush failed: {e}"),
        }
    }
}
