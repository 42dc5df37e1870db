// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::Value;

use crate::event::Download;

/// How event timestamps are written into sink rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimestampFormat {
    /// Fractional seconds since the Unix epoch, which BigQuery accepts for TIMESTAMP columns.
    #[default]
    EpochSeconds,
    Rfc3339,
}

/// Converts events into the JSON rows handed to the sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventSerializer {
    timestamp_format: TimestampFormat,
}

impl EventSerializer {
    #[must_use]
    pub fn new(timestamp_format: TimestampFormat) -> Self {
        Self { timestamp_format }
    }

    pub fn serialize(&self, event: &Download) -> Result<Value, serde_json::Error> {
        let mut row = serde_json::to_value(event)?;
        if let (TimestampFormat::EpochSeconds, Value::Object(fields)) =
            (self.timestamp_format, &mut row)
        {
            let ts = &event.timestamp;
            let seconds =
                ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_micros()) / 1_000_000.0;
            fields.insert("timestamp".to_string(), Value::from(seconds));
        }
        Ok(row)
    }
}
