/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Incremental framing of client requests carried over HTTP/1.1.
//!
//! Transports deliver client requests as a byte stream with no guarantee that reads line up with message
//! boundaries. A [`Parser`] buffers partial input across calls to [`execute`](Parser::execute) and hands
//! the body of each complete message, as delimited by its `Content-Length` header, to a
//! [`MsgProcessor`]. Request lines and headers are parsed by [`httparse`].
//!
//! ```ignore
//! let mut parser = Parser::new();
//! let consumed = parser.execute(&bytes[..split], &mut processor)?;
//! let consumed = parser.execute(&bytes[split..], &mut processor)?;
//! ```

use std::{fmt, str};

/// Largest header section (request line and headers) the parser accepts.
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Most headers a message may carry.
pub const MAX_HEADERS: usize = 64;

/// Largest body the parser accepts.
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Receives the body of every complete message.
pub trait MsgProcessor {
    fn msg(&mut self, body: Vec<u8>);
}

impl<F: FnMut(Vec<u8>)> MsgProcessor for F {
    fn msg(&mut self, body: Vec<u8>) {
        self(body)
    }
}

enum State {
    Headers,
    Body { content_length: usize },
}

pub struct Parser {
    state: State,
    buffer: Vec<u8>,
}

impl Parser {
    pub fn new() -> Parser {
        Parser {
            state: State::Headers,
            buffer: Vec::new(),
        }
    }

    /// Feed `data` to the parser, emitting every message it completes to `processor`. Returns the number
    /// of bytes consumed, which is all of `data` unless an error occurs.
    ///
    /// On error the partially parsed message is discarded and the parser starts afresh.
    pub fn execute<P: MsgProcessor>(&mut self, data: &[u8], processor: &mut P) -> Result<usize, FramingError> {
        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                State::Headers => {
                    let (head_len, content_length) = match parse_head(&self.buffer) {
                        Ok(Some(head)) => head,
                        Ok(None) if self.buffer.len() > MAX_HEADER_SIZE => {
                            self.reset();
                            return Err(FramingError::HeaderTooLarge);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            self.reset();
                            return Err(err);
                        }
                    };
                    self.buffer.drain(..head_len);
                    self.state = State::Body { content_length };
                }
                State::Body { content_length } => {
                    if self.buffer.len() < content_length {
                        break;
                    }
                    let rest = self.buffer.split_off(content_length);
                    let body = std::mem::replace(&mut self.buffer, rest);
                    self.state = State::Headers;
                    log::debug!("Framed a message with a body of {} bytes", body.len());
                    processor.msg(body);
                }
            }
        }

        Ok(data.len())
    }

    /// Whether the parser holds part of a message.
    pub fn is_partial(&self) -> bool {
        !self.buffer.is_empty() || matches!(self.state, State::Body { .. })
    }

    fn reset(&mut self) {
        self.state = State::Headers;
        self.buffer.clear();
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

// Parse the request line and headers at the start of `buffer`. Returns the length of the head and the
// length of the body, or `None` if the head is not complete yet.
fn parse_head(buffer: &[u8]) -> Result<Option<(usize, usize)>, FramingError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let head_len = match request.parse(buffer)? {
        httparse::Status::Complete(head_len) => head_len,
        httparse::Status::Partial => return Ok(None),
    };
    if head_len > MAX_HEADER_SIZE {
        return Err(FramingError::HeaderTooLarge);
    }

    let mut content_length = None;
    for header in request.headers.iter() {
        let value = str::from_utf8(header.value)
            .map_err(|_| FramingError::MalformedHeader)?
            .trim();
        if header.name.eq_ignore_ascii_case("content-length") {
            let length = value
                .parse::<usize>()
                .map_err(|_| FramingError::InvalidContentLength { value: value.to_string() })?;
            if content_length.is_some_and(|previous| previous != length) {
                return Err(FramingError::InvalidContentLength { value: value.to_string() });
            }
            content_length = Some(length);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            return Err(FramingError::UnsupportedTransferEncoding { value: value.to_string() });
        }
    }

    let content_length = content_length.unwrap_or(0);
    if content_length > MAX_BODY_SIZE {
        return Err(FramingError::BodyTooLarge { content_length });
    }
    Ok(Some((head_len, content_length)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    HeaderTooLarge,
    MalformedRequestLine,
    MalformedHeader,
    InvalidContentLength { value: String },
    UnsupportedTransferEncoding { value: String },
    BodyTooLarge { content_length: usize },
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::HeaderTooLarge => write!(
                f,
                "header section exceeds {} bytes or {} headers",
                MAX_HEADER_SIZE, MAX_HEADERS
            ),
            FramingError::MalformedRequestLine => write!(f, "malformed request line"),
            FramingError::MalformedHeader => write!(f, "malformed header"),
            FramingError::InvalidContentLength { value } => write!(f, "invalid Content-Length: {}", value),
            FramingError::UnsupportedTransferEncoding { value } => {
                write!(f, "unsupported Transfer-Encoding: {}", value)
            }
            FramingError::BodyTooLarge { content_length } => write!(
                f,
                "body of {} bytes exceeds {} bytes",
                content_length, MAX_BODY_SIZE
            ),
        }
    }
}

impl std::error::Error for FramingError {}

impl From<httparse::Error> for FramingError {
    fn from(err: httparse::Error) -> Self {
        match err {
            httparse::Error::HeaderName | httparse::Error::HeaderValue => FramingError::MalformedHeader,
            httparse::Error::TooManyHeaders => FramingError::HeaderTooLarge,
            _ => FramingError::MalformedRequestLine,
        }
    }
}
