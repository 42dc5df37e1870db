// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires the listener, the event queue and the dispatcher together and supervises them.
//!
//! The listener owns every connection task and the dispatcher owns every send task, so tearing
//! down either one tears down its children with it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::BatchAssembler;
use crate::config::ServerConfig;
use crate::connection::{describe_peer, handle_connection, ConnectionConfig};
use crate::dispatcher::Dispatcher;
use crate::errors::ServerError;
use crate::event::Download;
use crate::sender::BatchSender;
use crate::serializer::EventSerializer;
use crate::sink::{Sink, TableRef};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const LISTENER_TASK: &str = "listener";
const DISPATCHER_TASK: &str = "dispatcher";

pub struct Server {
    config: ServerConfig,
    sink: Arc<dyn Sink>,
    table: TableRef,
    serializer: EventSerializer,
}

impl Server {
    pub fn new(config: ServerConfig, sink: Arc<dyn Sink>, table: TableRef) -> Self {
        Self {
            config,
            sink,
            table,
            serializer: EventSerializer::default(),
        }
    }

    #[must_use]
    pub fn with_serializer(mut self, serializer: EventSerializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Serves until `cancel` fires, which is a clean exit.
    ///
    /// `ready` receives the bound address once the listener accepts connections. If the listener or
    /// the dispatcher stops on its own, everything else is torn down and an error is returned.
    pub async fn run(
        self,
        cancel: CancellationToken,
        ready: Option<oneshot::Sender<SocketAddr>>,
    ) -> Result<(), ServerError> {
        self.config.validate()?;

        let address = self.config.bind_address();
        let bind_error = |source| ServerError::Bind {
            address: address.clone(),
            source,
        };
        let listener = TcpListener::bind(&address).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity);
        let sender = BatchSender::new(
            self.sink,
            self.table,
            self.config.retry,
            self.config.api_timeout,
        );
        info!("Listening on {} and sending to {}", local_addr, sender.table());

        let dispatcher = Dispatcher::new(
            queue_rx,
            BatchAssembler::new(self.serializer),
            sender,
            self.config.batch_size,
            self.config.batch_timeout,
            self.config.max_in_flight_sends,
        );
        let connection_config = ConnectionConfig {
            token: self.config.token.as_deref().map(Arc::from),
            max_line_size: self.config.max_line_size,
            recv_size: self.config.recv_size,
        };

        let mut dispatcher_handle = tokio::spawn(dispatcher.run());
        let mut listener_handle = tokio::spawn(accept_loop(listener, queue_tx, connection_config));

        if let Some(ready) = ready {
            // The caller may have stopped waiting; serving goes on regardless.
            let _ = ready.send(local_addr);
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Shutting down.");
                Ok(())
            }
            result = &mut dispatcher_handle => {
                error!("Dispatcher task died: {:?}", result);
                Err(ServerError::TaskFailed(DISPATCHER_TASK))
            }
            result = &mut listener_handle => {
                error!("Listener task died: {:?}", result);
                Err(ServerError::TaskFailed(LISTENER_TASK))
            }
        };

        // Aborting the listener drops its connections, which closes the queue for the dispatcher.
        listener_handle.abort();
        dispatcher_handle.abort();
        let _ = listener_handle.await;
        let _ = dispatcher_handle.await;
        result
    }
}

/// Accepts connections forever, one handler task per connection.
async fn accept_loop(
    listener: TcpListener,
    queue: mpsc::Sender<Download>,
    config: ConnectionConfig,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let peer = describe_peer(&stream);
                    connections.spawn(handle_connection(stream, peer, queue.clone(), config.clone()));
                }
                Err(e) if is_connection_error(&e) => {
                    debug!("Connection failed before it was accepted: {}", e);
                }
                Err(e) => {
                    warn!("Error accepting connection: {}", e);
                    sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(finished) = connections.join_next() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("Connection handler panicked: {:?}", e);
                    }
                }
            }
        }
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}
