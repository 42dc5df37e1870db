// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drains the event queue into batches and hands each one to its own send task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error};

use crate::batch::BatchAssembler;
use crate::event::Download;
use crate::sender::BatchSender;

/// Result of one accumulation cycle.
struct Drained {
    events: Vec<Download>,
    queue_closed: bool,
}

pub struct Dispatcher {
    queue: mpsc::Receiver<Download>,
    assembler: BatchAssembler,
    sender: BatchSender,
    batch_size: usize,
    batch_timeout: Duration,
    in_flight: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    pub fn new(
        queue: mpsc::Receiver<Download>,
        assembler: BatchAssembler,
        sender: BatchSender,
        batch_size: usize,
        batch_timeout: Duration,
        max_in_flight_sends: Option<usize>,
    ) -> Self {
        Self {
            queue,
            assembler,
            sender,
            batch_size,
            batch_timeout,
            in_flight: max_in_flight_sends.map(|limit| Arc::new(Semaphore::new(limit))),
        }
    }

    /// Runs until every sender handle of the queue is gone, then flushes what is left and waits for
    /// outstanding sends.
    pub async fn run(mut self) {
        let mut sends = JoinSet::new();
        loop {
            let drained = self.drain().await;
            if !drained.events.is_empty() {
                self.dispatch(drained.events, &mut sends).await;
            }
            while let Some(result) = sends.try_join_next() {
                log_send_result(result);
            }
            if drained.queue_closed {
                break;
            }
        }

        debug!("Event queue closed; waiting for {} send(s).", sends.len());
        while let Some(result) = sends.join_next().await {
            log_send_result(result);
        }
    }

    /// Collects events until the batch is full, the cycle's deadline passes, or the queue closes.
    async fn drain(&mut self) -> Drained {
        let mut events = Vec::with_capacity(self.batch_size);
        let deadline = Instant::now() + self.batch_timeout;
        loop {
            match timeout_at(deadline, self.queue.recv()).await {
                Ok(Some(event)) => {
                    events.push(event);
                    if events.len() >= self.batch_size {
                        debug!("{} items accumulated, sending batch.", events.len());
                        return Drained {
                            events,
                            queue_closed: false,
                        };
                    }
                }
                Ok(None) => {
                    return Drained {
                        events,
                        queue_closed: true,
                    }
                }
                Err(_) => {
                    if !events.is_empty() {
                        debug!("Batch timed out; Sending {} items.", events.len());
                    }
                    return Drained {
                        events,
                        queue_closed: false,
                    };
                }
            }
        }
    }

    async fn dispatch(&self, events: Vec<Download>, sends: &mut JoinSet<()>) {
        for batch in self.assembler.compute_batches(events) {
            let permit = match &self.in_flight {
                // The semaphore is never closed, so acquiring only waits.
                Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
                None => None,
            };
            let sender = self.sender.clone();
            sends.spawn(async move {
                let _permit = permit;
                sender.send(batch).await;
            });
        }
    }
}

fn log_send_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("Send task panicked: {}", e);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::batch::BatchRecord;
    use crate::errors::SinkError;
    use crate::event::File;
    use crate::sender::{RetryPolicy, DEFAULT_API_TIMEOUT};
    use crate::sink::{Sink, TableRef};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::sleep;

    #[derive(Default)]
    struct RecordingSink {
        inserts: Mutex<Vec<(String, usize)>>,
    }

    impl RecordingSink {
        fn inserts(&self) -> Vec<(String, usize)> {
            self.inserts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn insert_all(
            &self,
            _table: &TableRef,
            template_suffix: &str,
            rows: &[BatchRecord],
        ) -> Result<(), SinkError> {
            self.inserts
                .lock()
                .unwrap()
                .push((template_suffix.to_string(), rows.len()));
            Ok(())
        }
    }

    /// Blocks every insert until a permit is released.
    struct GatedSink {
        started: AtomicUsize,
        gate: Semaphore,
    }

    #[async_trait]
    impl Sink for GatedSink {
        async fn insert_all(
            &self,
            _table: &TableRef,
            _template_suffix: &str,
            _rows: &[BatchRecord],
        ) -> Result<(), SinkError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.unwrap();
            Ok(())
        }
    }

    fn event(day: u32) -> Download {
        Download {
            timestamp: Utc.with_ymd_and_hms(2018, 7, day, 2, 19, 20).unwrap(),
            url: "/packages/x".to_string(),
            file: File::default(),
            tls_protocol: None,
            tls_cipher: None,
            country_code: None,
            details: None,
        }
    }

    fn dispatcher(
        sink: Arc<dyn Sink>,
        batch_size: usize,
        batch_timeout: Duration,
        max_in_flight_sends: Option<usize>,
        api_timeout: Duration,
    ) -> (mpsc::Sender<Download>, Dispatcher) {
        let (tx, rx) = mpsc::channel(64);
        let sender = BatchSender::new(
            sink,
            "proj.ds.downloads".parse().unwrap(),
            RetryPolicy::default(),
            api_timeout,
        );
        let dispatcher = Dispatcher::new(
            rx,
            BatchAssembler::default(),
            sender,
            batch_size,
            batch_timeout,
            max_in_flight_sends,
        );
        (tx, dispatcher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_is_sent_before_timeout() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, dispatcher) =
            dispatcher(sink.clone(), 3, Duration::from_secs(30), None, DEFAULT_API_TIMEOUT);
        let handle = tokio::spawn(dispatcher.run());

        for _ in 0..3 {
            tx.send(event(20)).await.unwrap();
        }
        sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.inserts(), vec![("20180720".to_string(), 3)]);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_is_sent_on_timeout() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, dispatcher) =
            dispatcher(sink.clone(), 10, Duration::from_secs(5), None, DEFAULT_API_TIMEOUT);
        let handle = tokio::spawn(dispatcher.run());

        tx.send(event(20)).await.unwrap();
        tx.send(event(20)).await.unwrap();
        sleep(Duration::from_secs(4)).await;
        assert!(sink.inserts().is_empty());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.inserts(), vec![("20180720".to_string(), 2)]);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_cycles_send_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, dispatcher) =
            dispatcher(sink.clone(), 10, Duration::from_secs(5), None, DEFAULT_API_TIMEOUT);
        let handle = tokio::spawn(dispatcher.run());

        sleep(Duration::from_secs(60)).await;
        assert!(sink.inserts().is_empty());

        drop(tx);
        handle.await.unwrap();
        assert!(sink.inserts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_send_per_day() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, dispatcher) =
            dispatcher(sink.clone(), 3, Duration::from_secs(30), None, DEFAULT_API_TIMEOUT);
        let handle = tokio::spawn(dispatcher.run());

        tx.send(event(21)).await.unwrap();
        tx.send(event(20)).await.unwrap();
        tx.send(event(21)).await.unwrap();
        sleep(Duration::from_secs(1)).await;

        let mut inserts = sink.inserts();
        inserts.sort();
        assert_eq!(
            inserts,
            vec![("20180720".to_string(), 1), ("20180721".to_string(), 2)]
        );

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_queue_flushes_remaining_events() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, dispatcher) =
            dispatcher(sink.clone(), 10, Duration::from_secs(30), None, DEFAULT_API_TIMEOUT);

        tx.send(event(20)).await.unwrap();
        tx.send(event(20)).await.unwrap();
        drop(tx);
        dispatcher.run().await;

        assert_eq!(sink.inserts(), vec![("20180720".to_string(), 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_sends_are_capped() {
        let sink = Arc::new(GatedSink {
            started: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        });
        let (tx, dispatcher) = dispatcher(
            sink.clone(),
            1,
            Duration::from_secs(30),
            Some(1),
            Duration::from_secs(3600),
        );
        let handle = tokio::spawn(dispatcher.run());

        tx.send(event(20)).await.unwrap();
        tx.send(event(21)).await.unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.started.load(Ordering::SeqCst), 1);

        sink.gate.add_permits(10);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.started.load(Ordering::SeqCst), 2);

        drop(tx);
        handle.await.unwrap();
    }
}
