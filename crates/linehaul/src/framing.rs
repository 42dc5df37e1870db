// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Newline framing for byte streams.
//!
//! [`LineCodec`] is a [`Decoder`] that splits a buffer on `\n` while refusing to buffer more than
//! `max_line_size` bytes for a single line. [`LineFramer`] pairs the codec with its own buffer and a
//! decode callback, so a connection handler can push raw chunks in and get decoded items out.
//!
//! The framing result is independent of how the stream was chunked: a line longer than the limit is
//! rejected whether or not its terminator arrived in the same read.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::errors::FramingError;

/// Default upper bound for a single line, in bytes.
pub const DEFAULT_MAX_LINE_SIZE: usize = 16384;

#[derive(Debug, Clone)]
pub struct LineCodec {
    max_line_size: usize,
    // Where to resume scanning for a newline, so partial lines are not rescanned on every chunk.
    next_index: usize,
}

impl LineCodec {
    #[must_use]
    pub fn new(max_line_size: usize) -> Self {
        Self {
            max_line_size,
            next_index: 0,
        }
    }

    #[must_use]
    pub fn max_line_size(&self) -> usize {
        self.max_line_size
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_SIZE)
    }
}

impl Decoder for LineCodec {
    type Item = BytesMut;
    type Error = FramingError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, FramingError> {
        // A terminator is acceptable up to index max_line_size (a line of exactly the limit).
        let read_to = buf.len().min(self.max_line_size.saturating_add(1));
        let start = self.next_index.min(read_to);

        match buf[start..read_to].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let newline = start + offset;
                self.next_index = 0;
                let mut line = buf.split_to(newline + 1);
                line.truncate(newline);
                if line.last() == Some(&b'\r') {
                    line.truncate(newline - 1);
                }
                Ok(Some(line))
            }
            None if buf.len() > self.max_line_size => {
                self.next_index = 0;
                Err(FramingError::LineTooLong {
                    limit: self.max_line_size,
                })
            }
            None => {
                self.next_index = read_to;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, FramingError> {
        match self.decode(buf)? {
            Some(line) => Ok(Some(line)),
            None if buf.is_empty() => Ok(None),
            None => {
                self.next_index = 0;
                Err(FramingError::TruncatedLine {
                    line: buf.split().to_vec(),
                })
            }
        }
    }
}

/// A terminal framing error, together with the items completed earlier in the same call.
///
/// Lines that precede the failing one are still valid and belong to the caller.
#[derive(Debug)]
pub struct FramingFailure<T> {
    pub items: Vec<T>,
    pub error: FramingError,
}

impl<T> FramingFailure<T> {
    /// Splits a framing result into the items it produced and its terminal error, if any.
    pub fn split(result: Result<Vec<T>, Self>) -> (Vec<T>, Option<FramingError>) {
        match result {
            Ok(items) => (items, None),
            Err(Self { items, error }) => (items, Some(error)),
        }
    }
}

/// Buffers raw chunks and runs a callback over every complete line.
///
/// Callback results of `None` are skipped, which is how undecodable lines are dropped without
/// affecting the rest of the stream.
pub struct LineFramer<F> {
    codec: LineCodec,
    buffer: BytesMut,
    callback: F,
}

impl<F, T> LineFramer<F>
where
    F: FnMut(&[u8]) -> Option<T>,
{
    pub fn new(callback: F, max_line_size: usize) -> Self {
        Self {
            codec: LineCodec::new(max_line_size),
            buffer: BytesMut::new(),
            callback,
        }
    }

    /// Feeds a chunk of bytes, returning the decoded results of every line it completed.
    pub fn receive(&mut self, data: &[u8]) -> Result<Vec<T>, FramingFailure<T>> {
        self.buffer.extend_from_slice(data);
        self.drain(false)
    }

    /// Signals end of input. Fails with [`FramingError::TruncatedLine`] if an unterminated line
    /// is still buffered.
    pub fn close(&mut self) -> Result<Vec<T>, FramingFailure<T>> {
        self.drain(true)
    }

    fn drain(&mut self, eof: bool) -> Result<Vec<T>, FramingFailure<T>> {
        let mut items = Vec::new();
        loop {
            let decoded = if eof {
                self.codec.decode_eof(&mut self.buffer)
            } else {
                self.codec.decode(&mut self.buffer)
            };
            match decoded {
                Ok(Some(line)) => items.extend((self.callback)(&line)),
                Ok(None) => return Ok(items),
                Err(error) => return Err(FramingFailure { items, error }),
            }
        }
    }
}
