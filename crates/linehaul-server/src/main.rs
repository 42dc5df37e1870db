// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, process::ExitCode, sync::Arc};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use linehaul::{
    sink::DEFAULT_BIGQUERY_URL, BigQueryConfig, BigQuerySink, Server, ServerConfig, TableRef,
};
use tokio_util::sync::CancellationToken;

const DEFAULT_API_MAX_IDLE_CONNECTIONS: usize = 10;

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("LINEHAUL_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,reqwest=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let table: TableRef = match env::var("LINEHAUL_TABLE") {
        Ok(raw) => match raw.parse() {
            Ok(table) => table,
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        Err(_) => {
            error!("LINEHAUL_TABLE is not set. Shutting down.");
            return ExitCode::FAILURE;
        }
    };

    let Ok(access_token) = env::var("LINEHAUL_API_TOKEN") else {
        error!("LINEHAUL_API_TOKEN is not set. Shutting down.");
        return ExitCode::FAILURE;
    };

    let max_idle_connections = env::var("LINEHAUL_API_MAX_IDLE_CONNECTIONS")
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .filter(|val| *val > 0)
        .unwrap_or(DEFAULT_API_MAX_IDLE_CONNECTIONS);
    let base_url =
        env::var("LINEHAUL_API_URL").unwrap_or_else(|_| DEFAULT_BIGQUERY_URL.to_string());
    let https_proxy = env::var("HTTPS_PROXY").ok();

    let sink = match BigQuerySink::new(BigQueryConfig {
        access_token,
        base_url,
        https_proxy,
        max_idle_connections,
    }) {
        Ok(sink) => sink,
        Err(e) => {
            error!("Unable to build BigQuery client: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let config = ServerConfig::from_os_env();
    let server = Server::new(config, Arc::new(sink), table);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt.");
                shutdown.cancel();
            }
            Err(e) => error!("Unable to listen for interrupt: {}", e),
        }
    });

    match server.run(cancel, None).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
