// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Elasticsearch / Opensearch backed [`DocumentStore`].
//!
//! Documents are buffered as NDJSON `create` operations and submitted to `/_bulk`. Each
//! item of the response is reported through the session's [`OutcomeCallback`]; a request
//! that fails as a whole is reported once, with the number of operations it carried.

pub mod provision;

use crate::config::ConnectionConfig;
use crate::errors::SessionError;
use crate::session::{
    BatchSession, BulkOutcome, DocumentStore, OperationType, OutcomeCallback, SessionSettings,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, warn};

const NDJSON: &str = "application/x-ndjson";

/// Builds the HTTP client for `connection`, falling back to reqwest defaults if the
/// configured client can't be built.
#[must_use]
pub fn get_client(connection: &ConnectionConfig) -> Client {
    match Client::builder()
        .connect_timeout(connection.connect_timeout)
        .timeout(connection.request_timeout)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("LOGSHIP | Failed to build HTTP client: {e}, using reqwest defaults");
            Client::new()
        }
    }
}

#[derive(Clone)]
enum Credentials {
    Anonymous,
    Basic {
        username: String,
        password: Option<String>,
    },
    ApiKey(String),
}

impl Credentials {
    fn from_connection(connection: &ConnectionConfig) -> Self {
        if let Some(api_key) = &connection.api_key {
            Credentials::ApiKey(api_key.clone())
        } else if let Some(username) = &connection.username {
            Credentials::Basic {
                username: username.clone(),
                password: connection.password.clone(),
            }
        } else {
            Credentials::Anonymous
        }
    }

    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Credentials::Anonymous => request,
            Credentials::Basic { username, password } => request.basic_auth(username, password.as_ref()),
            Credentials::ApiKey(api_key) => request.header("Authorization", format!("ApiKey {api_key}")),
        }
    }
}

/// Thin REST client shared by the bulk sessions and the provisioner.
#[derive(Clone)]
pub struct ElasticsearchStore {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl ElasticsearchStore {
    #[must_use]
    pub fn new(connection: &ConnectionConfig) -> Self {
        Self {
            client: get_client(connection),
            base_url: connection.base_url(),
            credentials: Credentials::from_connection(connection),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        self.credentials.apply(self.client.request(method, url))
    }

    /// Sends `request` and turns transport failures and non-success statuses into errors.
    async fn send(request: RequestBuilder) -> Result<Response, SessionError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SessionError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

impl std::fmt::Debug for ElasticsearchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticsearchStore")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DocumentStore for ElasticsearchStore {
    async fn open_session(
        &self,
        settings: SessionSettings,
        callback: Arc<dyn OutcomeCallback>,
    ) -> Result<Arc<dyn BatchSession>, SessionError> {
        let response = Self::send(self.request(reqwest::Method::GET, "/")).await?;
        let info: Value = response.json().await.unwrap_or(Value::Null);
        debug!(
            cluster = info["cluster_name"].as_str().unwrap_or("unknown"),
            version = info["version"]["number"].as_str().unwrap_or("unknown"),
            "LOGSHIP | Connected to {}",
            self.base_url
        );
        Ok(Arc::new(BulkSession {
            store: self.clone(),
            settings,
            callback,
            pending: Mutex::new(Vec::new()),
            request_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }))
    }
}

struct PendingOperation {
    operation: OperationType,
    /// Action line and source line, both newline terminated.
    lines: String,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

impl BulkItem {
    fn failure_reason(&self) -> Option<String> {
        match &self.error {
            Some(error) => {
                let kind = error["type"].as_str().unwrap_or("error");
                Some(match error["reason"].as_str() {
                    Some(reason) => format!("{kind}: {reason}"),
                    None => kind.to_string(),
                })
            }
            None if self.status >= 300 => Some(format!("status {}", self.status)),
            None => None,
        }
    }
}

/// A batch taken off the pending buffer. Dropped unresolved, it reports the whole batch as
/// failed, so a flush cancelled mid-request still accounts for every operation it carried.
struct InFlightBatch<'a> {
    callback: &'a dyn OutcomeCallback,
    operations: usize,
    started: Instant,
    resolved: bool,
}

impl<'a> InFlightBatch<'a> {
    fn new(callback: &'a dyn OutcomeCallback, operations: usize) -> Self {
        Self {
            callback,
            operations,
            started: Instant::now(),
            resolved: false,
        }
    }

    fn resolve(mut self) {
        self.resolved = true;
    }
}

impl Drop for InFlightBatch<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let error = SessionError::Timeout(self.started.elapsed());
        warn!(
            operations = self.operations,
            "LOGSHIP | Bulk request abandoned before completion"
        );
        self.callback.on_outcome(BulkOutcome::BatchFailed {
            error: &error,
            operations: self.operations,
        });
    }
}

/// Buffers `create` operations and submits them to `/_bulk`.
pub struct BulkSession {
    store: ElasticsearchStore,
    settings: SessionSettings,
    callback: Arc<dyn OutcomeCallback>,
    pending: Mutex<Vec<PendingOperation>>,
    /// One bulk request at a time; batches go out in the order they were taken.
    request_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl BulkSession {
    fn pending(&self) -> MutexGuard<'_, Vec<PendingOperation>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn pending_operations(&self) -> usize {
        self.pending().len()
    }

    fn report_items(&self, batch: &[PendingOperation], response: &BulkResponse) {
        let mut items = response.items.iter();
        for (position, pending) in batch.iter().enumerate() {
            let Some(item) = items.next() else {
                warn!(
                    missing = batch.len() - position,
                    "LOGSHIP | Bulk response is missing items"
                );
                for rest in &batch[position..] {
                    self.callback.on_outcome(BulkOutcome::ItemFailed {
                        operation: rest.operation,
                        reason: "no item in bulk response",
                    });
                }
                return;
            };
            let item = item
                .get(pending.operation.as_str())
                .or_else(|| item.values().next());
            match item.and_then(BulkItem::failure_reason) {
                None if item.is_some() => self.callback.on_outcome(BulkOutcome::ItemOk {
                    operation: pending.operation,
                }),
                reason => {
                    let reason = reason.unwrap_or_else(|| "empty bulk item".to_string());
                    self.callback.on_outcome(BulkOutcome::ItemFailed {
                        operation: pending.operation,
                        reason: &reason,
                    });
                    if self.settings.fail_fast {
                        debug!(
                            skipped = batch.len() - position - 1,
                            "LOGSHIP | Stopping at first failed bulk item"
                        );
                        for rest in &batch[position + 1..] {
                            self.callback.on_outcome(BulkOutcome::ItemFailed {
                                operation: rest.operation,
                                reason: "skipped after an earlier failure",
                            });
                        }
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl BatchSession for BulkSession {
    async fn create(&self, target: &str, document: String) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        let action = serde_json::to_string(&json!({ "create": { "_index": target } }))?;
        let mut lines = String::with_capacity(action.len() + document.len() + 2);
        lines.push_str(&action);
        lines.push('\n');
        lines.push_str(&document);
        lines.push('\n');

        let full = {
            let mut pending = self.pending();
            pending.push(PendingOperation {
                operation: OperationType::Create,
                lines,
            });
            pending.len() >= self.settings.batch_size.max(1)
        };
        if full {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SessionError> {
        let _request = self.request_lock.lock().await;
        let batch = std::mem::take(&mut *self.pending());
        if batch.is_empty() {
            return Ok(());
        }
        let in_flight = InFlightBatch::new(self.callback.as_ref(), batch.len());
        let body: String = batch.iter().map(|op| op.lines.as_str()).collect();

        let request = self
            .store
            .request(reqwest::Method::POST, "/_bulk")
            .header("Content-Type", NDJSON)
            .body(body);
        let result = match ElasticsearchStore::send(request).await {
            Ok(response) => response
                .json::<BulkResponse>()
                .await
                .map_err(SessionError::from),
            Err(e) => Err(e),
        };
        in_flight.resolve();

        match result {
            Ok(response) => {
                debug!(
                    operations = batch.len(),
                    errors = response.errors,
                    "LOGSHIP | Bulk request completed"
                );
                self.report_items(&batch, &response);
                Ok(())
            }
            Err(e) => {
                self.callback.on_outcome(BulkOutcome::BatchFailed {
                    error: &e,
                    operations: batch.len(),
                });
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.flush().await
    }
}
