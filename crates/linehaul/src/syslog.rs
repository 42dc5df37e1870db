// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parser for the syslog envelope CDN log streaming wraps around each event.
//!
//! Lines look like `<134>2018-07-20T02:19:20Z cache-itm18828 linehaul[411617]: <message>`.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::errors::SyslogParseError;

/// Highest valid PRI value: facility 23 (local7), severity 7 (debug).
const MAX_PRIORITY: u16 = 191;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyslogMessage {
    pub facility: u8,
    pub severity: u8,
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub appname: String,
    pub procid: u32,
    pub message: String,
}

fn envelope_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    RE.get_or_init(|| {
        Regex::new(r"^<(\d{1,3})>(\S+) (\S+) ([^\s\[]+)\[(\d+)\]: (.*)$")
            .expect("syslog envelope regex is valid")
    })
}

/// Parses a syslog line into its envelope fields and message body.
pub fn parse(line: &str) -> Result<SyslogMessage, SyslogParseError> {
    let caps = envelope_regex()
        .captures(line)
        .ok_or_else(|| SyslogParseError(format!("malformed envelope: {line:?}")))?;

    let priority: u16 = caps[1]
        .parse()
        .map_err(|_| SyslogParseError(format!("invalid priority {:?}", &caps[1])))?;
    if priority > MAX_PRIORITY {
        return Err(SyslogParseError(format!(
            "priority {priority} out of range"
        )));
    }

    let timestamp = DateTime::parse_from_rfc3339(&caps[2])
        .map_err(|e| SyslogParseError(format!("invalid timestamp {:?}: {e}", &caps[2])))?
        .with_timezone(&Utc);

    let procid = caps[5]
        .parse()
        .map_err(|_| SyslogParseError(format!("invalid procid {:?}", &caps[5])))?;

    // Both fit in a u8: priority is bounded by MAX_PRIORITY.
    let facility = (priority / 8) as u8;
    let severity = (priority % 8) as u8;

    Ok(SyslogMessage {
        facility,
        severity,
        timestamp,
        hostname: caps[3].to_string(),
        appname: caps[4].to_string(),
        procid,
        message: caps[6].to_string(),
    })
}
