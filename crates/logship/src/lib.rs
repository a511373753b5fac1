// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # logship
//!
//! Buffers application log events in memory and ships them to an Elasticsearch or
//! Opensearch data stream through the bulk API.
//!
//! - [`shipper`]: lifecycle controller, [`LogShipper`] and its [`LogSender`] handle
//! - [`layer`]: `tracing` layer feeding events into a shipper
//! - [`transform`]: shaping of events into indexable [`LogRecord`]s
//! - [`queue`]: bounded, drop-oldest buffer between producers and the indexer
//! - [`elastic`]: bulk session and data stream provisioning over HTTP
//! - [`session`]: traits the pipeline uses to talk to a document store
//!
//! ```rust,ignore
//! let config = ShipperConfig::from_env()?;
//! let store = Arc::new(ElasticsearchStore::new(&config.connection));
//! let shipper = LogShipper::new(config, store.clone()).with_provisioner(store);
//! tracing_subscriber::registry().with(shipper.layer()).init();
//! shipper.start().await?;
//! // ...
//! let counters = shipper.stop().await?;
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod counters;
pub mod elastic;
pub mod errors;
mod flusher;
pub mod gate;
mod indexer;
pub mod layer;
pub mod queue;
pub mod record;
pub mod session;
pub mod shipper;
pub mod transform;

#[cfg(test)]
mod test_support;

pub use config::{
    ConnectionConfig, GateFailurePolicy, OverflowPolicy, ProvisioningConfig, RetentionConfig,
    ShipperConfig,
};
pub use counters::CountersSnapshot;
pub use elastic::ElasticsearchStore;
pub use errors::{SessionError, ShipperError};
pub use flusher::FlushState;
pub use indexer::IndexerState;
pub use layer::ShipperLayer;
pub use record::{DiagnosticValue, LogException, LogRecord};
pub use shipper::{LogSender, LogShipper};
pub use transform::{exception_chain, FieldShaping, LogEvent};
