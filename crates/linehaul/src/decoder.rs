// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns one framed line into a [`Download`], or nothing.

use subtle::ConstantTimeEq;
use tracing::trace;

use crate::errors::DecodeError;
use crate::event::{self, Download};
use crate::syslog;

/// Decodes a line, reporting which stage rejected it.
///
/// When a token is configured the line must begin with it; the token is stripped before the syslog
/// envelope is parsed. The prefix comparison runs in constant time over the token's length.
pub fn parse_line(line: &[u8], token: Option<&str>) -> Result<Download, DecodeError> {
    let mut line = std::str::from_utf8(line)?;

    if let Some(token) = token {
        line = strip_token(line, token).ok_or(DecodeError::TokenMismatch)?;
    }

    let msg = syslog::parse(line)?;
    Ok(event::parse(&msg.message)?)
}

/// Like [`parse_line`], but drops rejected lines with a trace log. Used as the framer callback.
pub fn decode_line(line: &[u8], token: Option<&str>) -> Option<Download> {
    match parse_line(line, token) {
        Ok(event) => Some(event),
        Err(e) => {
            trace!("Dropping line: {}", e);
            None
        }
    }
}

fn strip_token<'a>(line: &'a str, token: &str) -> Option<&'a str> {
    let prefix = line.as_bytes().get(..token.len())?;
    if bool::from(prefix.ct_eq(token.as_bytes())) {
        // The matched prefix is a whole UTF-8 string, so this is a char boundary.
        line.get(token.len()..)
    } else {
        None
    }
}
