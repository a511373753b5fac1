// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One-shot readiness signal between index provisioning and the first flush.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct GateState {
    open: AtomicBool,
    opened: Notify,
}

/// Starts closed and opens exactly once. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct StartupGate {
    state: Arc<GateState>,
}

impl StartupGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the gate. Returns `false` if it was already open.
    pub fn open(&self) -> bool {
        let first = self
            .state
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.state.opened.notify_waiters();
        }
        first
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    /// Resolves once the gate is open.
    pub async fn wait(&self) {
        loop {
            let notified = self.state.opened.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_open() {
                return;
            }
            notified.await;
        }
    }
}
