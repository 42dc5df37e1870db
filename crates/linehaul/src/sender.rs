// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Best-effort delivery of a single batch.
//!
//! Each attempt is bounded by a hard timeout. Transient failures are retried with capped exponential
//! backoff; once attempts run out, or the sink rejects the batch outright, the batch is logged and
//! dropped. Nothing here is ever re-queued and no error escapes [`BatchSender::send`].

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use crate::batch::Batch;
use crate::errors::SinkError;
use crate::sink::{Sink, TableRef};

pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 15;
pub const DEFAULT_RETRY_MAX_WAIT: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Seconds waited after the first failure; doubles after each further failure.
    pub multiplier: f64,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            max_wait: DEFAULT_RETRY_MAX_WAIT,
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(62) as i32;
        let secs = (self.multiplier * 2f64.powi(exponent)).min(self.max_wait.as_secs_f64());
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }
}

/// Delivers batches for one destination table. Cheap to clone into each send task.
#[derive(Clone)]
pub struct BatchSender {
    sink: Arc<dyn Sink>,
    table: Arc<TableRef>,
    retry_policy: RetryPolicy,
    api_timeout: Duration,
}

impl BatchSender {
    pub fn new(
        sink: Arc<dyn Sink>,
        table: TableRef,
        retry_policy: RetryPolicy,
        api_timeout: Duration,
    ) -> Self {
        Self {
            sink,
            table: Arc::new(table),
            retry_policy,
            api_timeout,
        }
    }

    #[must_use]
    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Sends the batch, logging and discarding it if delivery fails.
    pub async fn send(&self, batch: Batch) {
        match self.send_with_retry(&batch).await {
            Ok(attempts) => debug!(
                "Sent {} items to {}{} after {} attempt(s)",
                batch.len(),
                self.table,
                batch.partition_key,
                attempts
            ),
            Err(SinkError::Timeout) => error!(
                "Timed out sending {} items to {}{}; Dropping them.",
                batch.len(),
                self.table,
                batch.partition_key
            ),
            Err(e) => error!(
                "Error sending {} items to {}{}: {}; Dropping them.",
                batch.len(),
                self.table,
                batch.partition_key,
                e
            ),
        }
    }

    /// Returns the number of attempts used on success, or the last error.
    async fn send_with_retry(&self, batch: &Batch) -> Result<u32, SinkError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match timeout(
                self.api_timeout,
                self.sink.insert_all(
                    &self.table,
                    batch.partition_key.as_str(),
                    &batch.records,
                ),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SinkError::Timeout),
            };

            match result {
                Ok(()) => return Ok(attempt),
                Err(e) if e.is_transient() && attempt < self.retry_policy.max_attempts => {
                    let wait = self.retry_policy.backoff(attempt);
                    warn!(
                        "Attempt {}/{} sending {} items failed: {}. Retrying in {:?}.",
                        attempt,
                        self.retry_policy.max_attempts,
                        batch.len(),
                        e,
                        wait
                    );
                    sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::batch::{BatchAssembler, BatchRecord};
    use crate::event::{Download, File};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tracing_test::traced_test;

    enum Behaviour {
        FailTimes(u32),
        AlwaysFail,
        Hang,
        Reject,
    }

    struct ScriptedSink {
        behaviour: Behaviour,
        calls: AtomicU32,
    }

    impl ScriptedSink {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Sink for ScriptedSink {
        async fn insert_all(
            &self,
            _table: &TableRef,
            _template_suffix: &str,
            _rows: &[BatchRecord],
        ) -> Result<(), SinkError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.behaviour {
                Behaviour::FailTimes(n) if call <= n => {
                    Err(SinkError::Transport("connection reset".into()))
                }
                Behaviour::FailTimes(_) => Ok(()),
                Behaviour::AlwaysFail => Err(SinkError::Transport("connection reset".into())),
                Behaviour::Hang => std::future::pending().await,
                Behaviour::Reject => Err(SinkError::InsertErrors { count: 1 }),
            }
        }
    }

    fn batch() -> Batch {
        let event = Download {
            timestamp: Utc.with_ymd_and_hms(2018, 7, 20, 0, 0, 0).unwrap(),
            url: "/a".to_string(),
            file: File::default(),
            tls_protocol: None,
            tls_cipher: None,
            country_code: None,
            details: None,
        };
        BatchAssembler::default()
            .compute_batches(vec![event])
            .next()
            .unwrap()
    }

    fn sender(sink: Arc<ScriptedSink>, max_attempts: u32) -> BatchSender {
        BatchSender::new(
            sink,
            "proj.ds.downloads".parse().unwrap(),
            RetryPolicy {
                max_attempts,
                ..RetryPolicy::default()
            },
            DEFAULT_API_TIMEOUT,
        )
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(2));
        assert_eq!(policy.backoff(8), Duration::from_secs(60));
        assert_eq!(policy.backoff(1000), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_success() {
        let sink = ScriptedSink::new(Behaviour::FailTimes(3));
        sender(sink.clone(), 15).send(batch()).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_exhaustion_drops_batch() {
        let sink = ScriptedSink::new(Behaviour::AlwaysFail);
        sender(sink.clone(), 5).send(batch()).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 5);
        assert!(logs_contain("Error sending 1 items"));
        assert!(logs_contain("Dropping them"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_timeouts_drop_batch() {
        let sink = ScriptedSink::new(Behaviour::Hang);
        let start = tokio::time::Instant::now();
        sender(sink.clone(), 3).send(batch()).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        // Three 15s attempts plus 0.5s and 1s of backoff.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(46_500));
        assert!(elapsed < Duration::from_secs(47));
        assert!(logs_contain("Timed out sending 1 items"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_permanent_failure_is_not_retried() {
        let sink = ScriptedSink::new(Behaviour::Reject);
        sender(sink.clone(), 15).send(batch()).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert!(logs_contain("Dropping them"));
    }
}
