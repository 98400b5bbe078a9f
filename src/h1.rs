// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! HTTP/1.1 message codec for the H1Q dialects.
//!
//! Each bidirectional QUIC stream carries exactly one HTTP/1.1 exchange:
//! a request or status line, header lines, then a body delimited either
//! by `Content-Length` or by the stream FIN. Pseudo-headers bridge to
//! the header-list representation used by the rest of the session
//! (`:method`, `:path`, `:authority`, `:status`).
//!
//! `Connection: close` doubles as the dialect's drain signal: the
//! session latches it onto egress messages while draining and reports
//! it when seen on ingress.

use crate::Error;
use crate::Header;
use crate::NameValue;
use crate::Result;

/// An event produced while parsing an HTTP/1.1 message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The request or response head was fully parsed.
    Headers {
        list: Vec<Header>,
        has_body: bool,
    },

    /// A chunk of body data.
    Body { data: Vec<u8> },

    /// The message is complete.
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    StartLine,
    HeaderFields,
    Body,
    Done,
}

/// An HTTP/1.1 message parser and serializer for one stream.
pub struct Codec {
    parse_responses: bool,
    state: State,
    buf: Vec<u8>,
    start_line: Option<Vec<Header>>,
    headers: Vec<Header>,
    content_remaining: Option<u64>,
    saw_close: bool,
    complete: bool,
}

impl Codec {
    /// Creates a parser for requests (the server side of a stream).
    pub fn request_parser() -> Codec {
        Codec::new(false)
    }

    /// Creates a parser for responses (the client side of a stream).
    pub fn response_parser() -> Codec {
        Codec::new(true)
    }

    fn new(parse_responses: bool) -> Codec {
        Codec {
            parse_responses,
            state: State::StartLine,
            buf: Vec::new(),
            start_line: None,
            headers: Vec::new(),
            content_remaining: None,
            saw_close: false,
            complete: false,
        }
    }

    /// Whether the codec has seen the end of the message.
    pub fn message_complete(&self) -> bool {
        self.complete
    }

    /// Whether the peer signalled `Connection: close`.
    pub fn saw_connection_close(&self) -> bool {
        self.saw_close
    }

    /// Feeds ingress bytes to the parser, appending produced events.
    ///
    /// Returns the number of bytes consumed. Bytes arriving after the
    /// message completed are not consumed; the caller treats them as a
    /// protocol error.
    pub fn decode(
        &mut self, data: &[u8], fin: bool, events: &mut Vec<Event>,
    ) -> Result<usize> {
        let mut consumed = 0;

        while consumed < data.len() || (fin && !self.complete) {
            match self.state {
                State::StartLine | State::HeaderFields => {
                    let n = self.feed_line(&data[consumed..], events)?;

                    if n == 0 {
                        if fin && consumed == data.len() {
                            // FIN inside the message head.
                            return Err(Error::MessageError);
                        }

                        break;
                    }

                    consumed += n;
                },

                State::Body => {
                    let remaining = match self.content_remaining {
                        Some(v) => v as usize,
                        None => usize::MAX,
                    };

                    let n = std::cmp::min(remaining, data.len() - consumed);

                    if n > 0 {
                        events.push(Event::Body {
                            data: data[consumed..consumed + n].to_vec(),
                        });

                        consumed += n;

                        if let Some(v) = &mut self.content_remaining {
                            *v -= n as u64;
                        }
                    }

                    if self.content_remaining == Some(0) ||
                        (fin &&
                            consumed == data.len() &&
                            self.content_remaining.is_none())
                    {
                        self.state = State::Done;
                        self.complete = true;

                        events.push(Event::Complete);
                    } else if n == 0 {
                        break;
                    }
                },

                State::Done => break,
            }
        }

        Ok(consumed)
    }

    fn feed_line(
        &mut self, data: &[u8], events: &mut Vec<Event>,
    ) -> Result<usize> {
        let nl = match find_crlf(&self.buf, data) {
            Some(v) => v,
            None => {
                self.buf.extend_from_slice(data);
                return Ok(data.len());
            },
        };

        // `nl` counts bytes taken from `data`; the line spans the
        // carried-over buffer plus that much input, minus the CRLF.
        let mut line = std::mem::take(&mut self.buf);
        line.extend_from_slice(&data[..nl]);
        line.truncate(line.len() - 2);

        match self.state {
            State::StartLine => {
                if line.is_empty() {
                    return Err(Error::MessageError);
                }

                let pseudo = if self.parse_responses {
                    parse_status_line(&line)?
                } else {
                    parse_request_line(&line)?
                };

                self.start_line = Some(pseudo);
                self.state = State::HeaderFields;
            },

            State::HeaderFields => {
                if line.is_empty() {
                    self.finish_head(events)?;
                } else {
                    let (name, value) = parse_header_field(&line)?;

                    if name.eq_ignore_ascii_case(b"content-length") {
                        let v = std::str::from_utf8(&value)
                            .ok()
                            .and_then(|s| s.trim().parse::<u64>().ok())
                            .ok_or(Error::MessageError)?;

                        self.content_remaining = Some(v);
                    }

                    if name.eq_ignore_ascii_case(b"connection") &&
                        value.eq_ignore_ascii_case(b"close")
                    {
                        self.saw_close = true;
                    }

                    self.headers.push(Header(name, value));
                }
            },

            _ => unreachable!(),
        }

        Ok(nl)
    }

    fn finish_head(&mut self, events: &mut Vec<Event>) -> Result<()> {
        let mut list = self.start_line.take().ok_or(Error::MessageError)?;
        list.append(&mut self.headers);

        // A request without Content-Length has no body; a response
        // without one is delimited by the FIN.
        if !self.parse_responses && self.content_remaining.is_none() {
            self.content_remaining = Some(0);
        }

        let has_body = self.content_remaining != Some(0);

        events.push(Event::Headers { list, has_body });

        if has_body {
            self.state = State::Body;
        } else {
            self.state = State::Done;
            self.complete = true;

            events.push(Event::Complete);
        }

        Ok(())
    }

    /// Serializes a message head.
    ///
    /// The presence of `:status` selects the status-line form. When
    /// `close` is set a `Connection: close` field is appended, which is
    /// how draining sessions signal shutdown on this dialect.
    pub fn encode_headers<T: NameValue>(
        headers: &[T], close: bool, out: &mut Vec<u8>,
    ) -> Result<()> {
        let find = |name: &[u8]| {
            headers
                .iter()
                .find(|h| h.name() == name)
                .map(|h| h.value().to_vec())
        };

        if let Some(status) = find(b":status") {
            out.extend_from_slice(b"HTTP/1.1 ");
            out.extend_from_slice(&status);
            out.extend_from_slice(b" ");
            out.extend_from_slice(status_reason(&status));
            out.extend_from_slice(b"\r\n");
        } else {
            let method = find(b":method").ok_or(Error::MessageError)?;
            let path = find(b":path").ok_or(Error::MessageError)?;

            out.extend_from_slice(&method);
            out.extend_from_slice(b" ");
            out.extend_from_slice(&path);
            out.extend_from_slice(b" HTTP/1.1\r\n");

            if let Some(authority) = find(b":authority") {
                out.extend_from_slice(b"Host: ");
                out.extend_from_slice(&authority);
                out.extend_from_slice(b"\r\n");
            }
        }

        for h in headers {
            if h.name().starts_with(b":") {
                continue;
            }

            out.extend_from_slice(h.name());
            out.extend_from_slice(b": ");
            out.extend_from_slice(h.value());
            out.extend_from_slice(b"\r\n");
        }

        if close {
            out.extend_from_slice(b"Connection: close\r\n");
        }

        out.extend_from_slice(b"\r\n");

        Ok(())
    }
}

fn find_crlf(carried: &[u8], data: &[u8]) -> Option<usize> {
    // The CRLF may straddle the carried-over bytes and the new input.
    if carried.last() == Some(&b'\r') && data.first() == Some(&b'\n') {
        return Some(1);
    }

    let mut prev = None;

    for (i, b) in data.iter().enumerate() {
        if prev == Some(b'\r') && *b == b'\n' {
            return Some(i + 1);
        }

        prev = Some(*b);
    }

    None
}

fn parse_request_line(line: &[u8]) -> Result<Vec<Header>> {
    let mut parts = line.split(|b| *b == b' ');

    let method = parts.next().ok_or(Error::MessageError)?;
    let path = parts.next().ok_or(Error::MessageError)?;
    let version = parts.next().ok_or(Error::MessageError)?;

    if method.is_empty() || path.is_empty() || !version.starts_with(b"HTTP/1.")
    {
        return Err(Error::MessageError);
    }

    Ok(vec![
        Header::new(b":method", method),
        Header::new(b":path", path),
    ])
}

fn parse_status_line(line: &[u8]) -> Result<Vec<Header>> {
    let mut parts = line.split(|b| *b == b' ');

    let version = parts.next().ok_or(Error::MessageError)?;
    let status = parts.next().ok_or(Error::MessageError)?;

    if !version.starts_with(b"HTTP/1.") || status.len() != 3 {
        return Err(Error::MessageError);
    }

    Ok(vec![Header::new(b":status", status)])
}

fn parse_header_field(line: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let colon = line
        .iter()
        .position(|b| *b == b':')
        .ok_or(Error::MessageError)?;

    let name = line[..colon].to_vec();

    let mut value = &line[colon + 1..];

    while value.first() == Some(&b' ') {
        value = &value[1..];
    }

    if name.is_empty() {
        return Err(Error::MessageError);
    }

    Ok((name, value.to_vec()))
}

fn status_reason(status: &[u8]) -> &'static [u8] {
    match status {
        b"200" => b"OK",
        b"204" => b"No Content",
        b"304" => b"Not Modified",
        b"400" => b"Bad Request",
        b"404" => b"Not Found",
        b"408" => b"Request Timeout",
        b"500" => b"Internal Server Error",
        b"503" => b"Service Unavailable",
        _ => b"",
    }
}
