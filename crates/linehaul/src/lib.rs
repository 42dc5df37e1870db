// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingests syslog-framed package download events over TCP and streams them to BigQuery.
//!
//! Connections feed a bounded event queue; a single dispatcher drains it into per-day batches and
//! delivers each batch from its own task with bounded retries.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod dispatcher;
pub mod errors;
pub mod event;
pub mod framing;
pub mod sender;
pub mod serializer;
pub mod server;
pub mod sink;
pub mod syslog;

pub use batch::{Batch, BatchAssembler, BatchRecord, PartitionKey};
pub use config::ServerConfig;
pub use errors::{ConfigError, DecodeError, FramingError, ServerError, SinkError};
pub use event::{Download, File, Installer, UserAgent};
pub use sender::{BatchSender, RetryPolicy};
pub use serializer::{EventSerializer, TimestampFormat};
pub use server::Server;
pub use sink::{BigQueryConfig, BigQuerySink, Sink, TableRef};
