// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-connection ingestion: read chunks, frame lines, decode events, enqueue them.
//!
//! Nothing escapes a connection handler. Framing failures drop the connection, decode failures drop
//! the line, and read errors are treated as the peer going away.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::decoder::decode_line;
use crate::errors::FramingError;
use crate::event::Download;
use crate::framing::{FramingFailure, LineFramer};

/// How long closing a stream may take before we give up on it.
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(30);
const UNKNOWN_PEER: &str = "Unknown";

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub token: Option<Arc<str>>,
    pub max_line_size: usize,
    pub recv_size: usize,
}

/// Best-effort peer identification for logging.
///
/// A peer that disconnects right after connecting can make this fail, so it never aborts handling.
pub fn describe_peer(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| UNKNOWN_PEER.to_string())
}

enum Outcome {
    Eof,
    QueueClosed,
}

/// Drives one connection to completion, pushing decoded events onto `queue`.
///
/// Pushing suspends while the queue is full, which throttles this connection only.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: String,
    queue: mpsc::Sender<Download>,
    config: ConnectionConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connection_id = Uuid::new_v4();
    debug!("{{{}}}: Connection received from {}.", connection_id, peer);

    match receive_events(&mut stream, &queue, &config, connection_id).await {
        Ok(Outcome::Eof) => debug!("{{{}}}: Connection lost from {}.", connection_id, peer),
        Ok(Outcome::QueueClosed) => {
            debug!("{{{}}}: Event queue closed; Dropping connection.", connection_id)
        }
        Err(FramingError::LineTooLong { limit }) => debug!(
            "{{{}}}: Buffer too large (limit {} bytes); Dropping connection.",
            connection_id, limit
        ),
        Err(FramingError::TruncatedLine { line }) => debug!(
            "{{{}}}: Truncated line {:?}; Dropping connection.",
            connection_id,
            String::from_utf8_lossy(&line)
        ),
        Err(FramingError::Io(e)) => {
            debug!("{{{}}}: I/O error {}; Dropping connection.", connection_id, e)
        }
    }

    if timeout(CLOSE_GRACE_PERIOD, stream.shutdown()).await.is_err() {
        debug!("{{{}}}: Timed out closing connection.", connection_id);
    }
}

async fn receive_events<S>(
    stream: &mut S,
    queue: &mpsc::Sender<Download>,
    config: &ConnectionConfig,
    connection_id: Uuid,
) -> Result<Outcome, FramingError>
where
    S: AsyncRead + Unpin,
{
    let token = config.token.clone();
    let mut framer = LineFramer::new(
        move |line: &[u8]| decode_line(line, token.as_deref()),
        config.max_line_size,
    );
    let mut buf = vec![0u8; config.recv_size];

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                // A broken stream is indistinguishable from the peer hanging up.
                trace!("{{{}}}: Read error {}; treating as end of stream.", connection_id, e);
                0
            }
        };

        // Lines completed ahead of a framing failure are still enqueued.
        let (mut events, mut failure) = FramingFailure::split(framer.receive(&buf[..n]));
        if n == 0 && failure.is_none() {
            let (rest, close_failure) = FramingFailure::split(framer.close());
            events.extend(rest);
            failure = close_failure;
        }

        for event in events {
            trace!("{{{}}}: Received Event: {:?}", connection_id, event);
            if queue.send(event).await.is_err() {
                return Ok(Outcome::QueueClosed);
            }
        }

        if let Some(error) = failure {
            return Err(error);
        }
        if n == 0 {
            return Ok(Outcome::Eof);
        }
    }
}
