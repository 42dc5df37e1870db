// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the ingestion pipeline.

use reqwest::StatusCode;

/// Terminal conditions raised by the line framer. Both are connection-fatal.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("line exceeds maximum length of {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("stream closed with {} unterminated bytes", line.len())]
    TruncatedLine { line: Vec<u8> },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to parse the syslog envelope around an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid syslog message: {0}")]
pub struct SyslogParseError(pub String);

/// Failure to parse the body of a download event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventParseError {
    #[error("unknown event format")]
    UnknownFormat,
    #[error("expected {expected} fields, got {actual}")]
    FieldCount { expected: usize, actual: usize },
    #[error("invalid timestamp: {0}")]
    Timestamp(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Why a single line produced no event. The line is dropped either way.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("line is not valid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("line does not carry the expected token")]
    TokenMismatch,
    #[error(transparent)]
    Envelope(#[from] SyslogParseError),
    #[error(transparent)]
    Event(#[from] EventParseError),
}

/// Errors returned by a [`crate::sink::Sink`] delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{status}: sink rejected request: {body}")]
    Status { status: StatusCode, body: String },
    #[error("{count} rows failed to insert")]
    InsertErrors { count: usize },
    #[error("failed to serialize payload: {0}")]
    Serialization(String),
}

impl SinkError {
    /// Whether another attempt could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::InsertErrors { .. } | Self::Serialization(_) => false,
        }
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{name} must be a finite, non-negative number, got {value}")]
    InvalidNumber { name: &'static str, value: f64 },
    #[error("invalid table reference {0:?}, expected project.dataset.table")]
    Table(String),
}

/// Unrecoverable conditions that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("{0} task terminated unexpectedly")]
    TaskFailed(&'static str),
}
