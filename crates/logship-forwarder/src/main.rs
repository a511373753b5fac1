// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod lines;

use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, Dispatch};
use tracing_subscriber::EnvFilter;

use lines::{parse_line, LineDefaults};
use logship::{ElasticsearchStore, LogShipper, ShipperConfig};

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("LOGSHIP_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");
    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("could not parse log level in configuration: {e}");
            EnvFilter::new("info")
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    if let Err(e) = tracing::dispatcher::set_global_default(dispatch.clone()) {
        eprintln!("setting default subscriber failed: {e}");
    }
    debug!("Logging subsystem enabled");

    let config = match ShipperConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error reading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let defaults = LineDefaults {
        logger: env::var("LOGSHIP_LOGGER").unwrap_or_else(|_| "stdin".to_string()),
        level: env::var("LOGSHIP_LEVEL")
            .map(|val| val.to_uppercase())
            .unwrap_or_else(|_| "INFO".to_string()),
    };

    let store = Arc::new(ElasticsearchStore::new(&config.connection));
    info!(
        "Shipping stdin to {} data stream {}",
        store.base_url(),
        config.target
    );
    let shipper = LogShipper::new(config, store.clone())
        .with_provisioner(store)
        .with_diagnostics(dispatch);
    if let Err(e) = shipper.start().await {
        error!("Unable to start shipper: {e}");
        return ExitCode::FAILURE;
    }

    let sender = shipper.sender();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(event) = parse_line(&line, &defaults) {
                        sender.send_event(event);
                    }
                }
                Ok(None) => {
                    debug!("End of input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {e}");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    match shipper.stop().await {
        Ok(counters) => {
            info!(
                received = counters.received,
                indexed_ok = counters.indexed_ok,
                item_failed = counters.item_failed,
                request_error = counters.request_error,
                dropped = counters.dropped,
                "Forwarder finished"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to stop shipper: {e}");
            ExitCode::FAILURE
        }
    }
}
