// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Groups drained events into per-day batches ready for the sink.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::Serialize;
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

use crate::event::Download;
use crate::serializer::EventSerializer;

/// Table suffix a batch is written to: the event's UTC calendar day as `YYYYMMDD`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub struct PartitionKey(String);

impl PartitionKey {
    #[must_use]
    pub fn for_timestamp(timestamp: &DateTime<Utc>) -> Self {
        Self(timestamp.format("%Y%m%d").to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One row of an insert request. The sink deduplicates on `insertId`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchRecord {
    #[serde(rename = "insertId")]
    pub insertion_id: Uuid,
    pub json: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub partition_key: PartitionKey,
    pub records: Vec<BatchRecord>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchAssembler {
    serializer: EventSerializer,
}

impl BatchAssembler {
    #[must_use]
    pub fn new(serializer: EventSerializer) -> Self {
        Self { serializer }
    }

    /// Splits events into one batch per partition key.
    ///
    /// Events are stably sorted by key, so within a batch they keep their drain order. Every record
    /// gets a freshly generated insertion id.
    pub fn compute_batches(&self, events: Vec<Download>) -> Batches<'_> {
        let mut keyed: Vec<(PartitionKey, Download)> = events
            .into_iter()
            .map(|event| (PartitionKey::for_timestamp(&event.timestamp), event))
            .collect();
        keyed.sort_by(|(a, _), (b, _)| a.cmp(b));

        Batches {
            serializer: &self.serializer,
            events: keyed.into_iter().peekable(),
        }
    }
}

/// Lazy iterator returned by [`BatchAssembler::compute_batches`].
pub struct Batches<'a> {
    serializer: &'a EventSerializer,
    events: std::iter::Peekable<std::vec::IntoIter<(PartitionKey, Download)>>,
}

impl Batches<'_> {
    fn record(&self, event: &Download) -> Option<BatchRecord> {
        match self.serializer.serialize(event) {
            Ok(json) => Some(BatchRecord {
                insertion_id: Uuid::new_v4(),
                json,
            }),
            Err(e) => {
                error!("Failed to serialize event {:?}: {}. Dropping it.", event.url, e);
                None
            }
        }
    }
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        loop {
            let (partition_key, first) = self.events.next()?;
            let mut records: Vec<BatchRecord> = self.record(&first).into_iter().collect();
            while let Some((_, event)) = self.events.next_if(|(key, _)| *key == partition_key) {
                records.extend(self.record(&event));
            }
            if !records.is_empty() {
                return Some(Batch {
                    partition_key,
                    records,
                });
            }
        }
    }
}
