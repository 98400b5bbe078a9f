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

//! HTTP-over-QUIC session core.
//!
//! This crate implements the per-connection engine that multiplexes HTTP
//! request/response exchanges over a QUIC transport: concurrent
//! bidirectional request streams, typed unidirectional control streams,
//! QPACK encoder/decoder stream plumbing, server push, egress scheduling
//! under flow control, and a two-phase GOAWAY drain protocol.
//!
//! Three wire dialects run on the same core, selected by the ALPN token
//! negotiated by the transport:
//!
//! * `h1q-fb`, `h1q`, `hq-*`: HTTP/1.1 messages framed directly onto
//!   bidirectional QUIC streams, no control streams.
//! * `h1q-fb-v2`: as above, plus one unidirectional control stream per
//!   direction carrying GOAWAY for orderly shutdown.
//! * `h3-*`, `h3-fb-*`: the full profile with varint-framed requests,
//!   QPACK header compression, control and QPACK unidirectional streams,
//!   server push, and an optional partial-reliability extension.
//!
//! The QUIC transport itself is not part of this crate. It is reached
//! through the [`transport::Transport`] trait, and the session is driven
//! sans-IO: the embedder forwards transport readiness by calling
//! [`Session::poll()`] for ingress and [`Session::flush()`] for egress,
//! plus the explicit notification methods (`on_reset()`,
//! `on_delivery_ack()`, `on_timeout()`, ...) for edge events.
//!
//! ## Configuration
//!
//! ```
//! let mut config = hqsession::Config::new();
//! config.set_qpack_max_table_capacity(4096);
//! config.set_qpack_blocked_streams(16);
//! config.set_max_header_list_size(16 * 1024);
//! ```
//!
//! A session is then created from an established transport with
//! [`Session::with_transport()`], which reads the negotiated ALPN, picks
//! the dialect, opens the egress control streams the dialect requires and
//! emits the initial SETTINGS.
//!
//! ## Driving a session
//!
//! [`Session::poll()`] returns one `(stream_id, Event)` pair at a time,
//! edge-triggered, until [`Error::Done`]. [`Session::flush()`] drains
//! buffered egress towards the transport, control streams first, then
//! request streams in scheduler order, and must be called whenever
//! [`Session::has_pending_egress()`] reports work after a burst of
//! `send_*` calls or acked flow control.

#[macro_use]
extern crate log;

use std::fmt;

pub mod frame;
pub mod h1;
pub mod priority;
pub mod qpack;
pub mod reliability;
pub mod session;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub mod test_utils;

pub use crate::priority::Priority;
pub use crate::session::DrainState;
pub use crate::session::Event;
pub use crate::session::Session;

/// A specialized [`Result`] type for session operations.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// An HTTP-over-QUIC session error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// There is no error or no work to do.
    Done,

    /// The provided buffer is too short.
    BufferTooShort,

    /// Internal error in the session.
    InternalError,

    /// ALPN negotiation did not produce a supported protocol, or the
    /// egress control streams could not be opened.
    ConnectFailed,

    /// The peer is exhibiting behavior that causes excessive load.
    ExcessiveLoad,

    /// A stream ID or push ID was used incorrectly, such as exceeding an
    /// advertised limit or being reused.
    IdError,

    /// A partial-reliability body offset was non-monotonic or otherwise
    /// ill-ordered.
    OffsetError,

    /// The peer created a stream that will not be accepted.
    StreamCreationError,

    /// A required critical stream was closed.
    ClosedCriticalStream,

    /// No SETTINGS frame at the beginning of the control stream.
    MissingSettings,

    /// A frame was received which is not permitted in the current state.
    FrameUnexpected,

    /// A frame violated layout or size rules.
    FrameError,

    /// QPACK header block decompression failure.
    QpackDecompressionFailed,

    /// Error originated from the transport layer.
    TransportError(transport::Error),

    /// The underlying QUIC stream doesn't have enough capacity for the
    /// operation to complete. The application should retry later on.
    StreamBlocked,

    /// Error in the payload of a SETTINGS frame.
    SettingsError,

    /// Server rejected the request; it is safe to retry.
    RequestRejected,

    /// Request or its response cancelled.
    RequestCancelled,

    /// An HTTP message was malformed and cannot be processed.
    MessageError,

    /// A stream was used in a direction or role it does not support.
    WrongStream,

    /// More typed unidirectional streams than the dialect permits.
    WrongStreamCount,

    /// The preface of a peer unidirectional stream denoted an unknown
    /// stream type.
    UnknownStreamType,

    /// Catch-all protocol violation.
    GeneralProtocolError,
}

impl Error {
    /// Maps an error to the application error code sent on the wire.
    pub fn to_wire(self) -> u64 {
        match self {
            Error::Done => wire::HTTP_NO_ERROR,
            Error::InternalError => wire::HTTP_INTERNAL_ERROR,
            Error::ConnectFailed => wire::HTTP_CONNECT_ERROR,
            Error::ExcessiveLoad => wire::HTTP_EXCESSIVE_LOAD,
            Error::IdError => wire::HTTP_LIMIT_EXCEEDED,
            Error::OffsetError => wire::HTTP_GENERAL_PROTOCOL_ERROR,
            Error::StreamCreationError => wire::HTTP_WRONG_STREAM_DIRECTION,
            Error::ClosedCriticalStream => wire::HTTP_CLOSED_CRITICAL_STREAM,
            Error::MissingSettings => wire::HTTP_MISSING_SETTINGS,
            Error::FrameUnexpected => wire::HTTP_UNEXPECTED_FRAME,
            Error::FrameError => wire::HTTP_MALFORMED_FRAME,
            Error::QpackDecompressionFailed => wire::HTTP_GENERAL_PROTOCOL_ERROR,
            Error::RequestRejected => wire::HTTP_REQUEST_REJECTED,
            Error::RequestCancelled => wire::HTTP_REQUEST_CANCELLED,
            Error::MessageError => wire::HTTP_GENERAL_PROTOCOL_ERROR,
            Error::WrongStream => wire::HTTP_WRONG_STREAM,
            Error::WrongStreamCount => wire::HTTP_WRONG_STREAM_COUNT,
            Error::UnknownStreamType => wire::HTTP_UNKNOWN_STREAM_TYPE,
            Error::GeneralProtocolError => wire::HTTP_GENERAL_PROTOCOL_ERROR,

            Error::BufferTooShort |
            Error::TransportError { .. } |
            Error::StreamBlocked => wire::HTTP_INTERNAL_ERROR,

            Error::SettingsError => wire::HTTP_MALFORMED_FRAME_SETTINGS,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl std::convert::From<transport::Error> for Error {
    fn from(err: transport::Error) -> Self {
        match err {
            transport::Error::Done => Error::Done,

            _ => Error::TransportError(err),
        }
    }
}

impl std::convert::From<octets::BufferTooShortError> for Error {
    fn from(_err: octets::BufferTooShortError) -> Self {
        Error::BufferTooShort
    }
}

/// Application error codes shared with the peer on the wire.
///
/// These values predate the final HTTP/3 error code space and must not be
/// renumbered: RESET_STREAM / STOP_SENDING / CONNECTION_CLOSE carrying
/// them are interpreted by independent implementations.
pub mod wire {
    pub const HTTP_STOPPING: u64 = 0x00;
    pub const HTTP_NO_ERROR: u64 = 0x01;
    pub const HTTP_PUSH_REFUSED: u64 = 0x02;
    pub const HTTP_INTERNAL_ERROR: u64 = 0x03;
    pub const HTTP_REQUEST_CANCELLED: u64 = 0x05;
    pub const HTTP_INCOMPLETE_REQUEST: u64 = 0x06;
    pub const HTTP_CONNECT_ERROR: u64 = 0x07;
    pub const HTTP_EXCESSIVE_LOAD: u64 = 0x08;
    pub const HTTP_VERSION_FALLBACK: u64 = 0x09;
    pub const HTTP_WRONG_STREAM: u64 = 0x0A;
    pub const HTTP_LIMIT_EXCEEDED: u64 = 0x0B;
    pub const HTTP_DUPLICATE_PUSH: u64 = 0x0C;
    pub const HTTP_UNKNOWN_STREAM_TYPE: u64 = 0x0D;
    pub const HTTP_WRONG_STREAM_COUNT: u64 = 0x0E;
    pub const HTTP_CLOSED_CRITICAL_STREAM: u64 = 0x0F;
    pub const HTTP_WRONG_STREAM_DIRECTION: u64 = 0x10;
    pub const HTTP_EARLY_RESPONSE: u64 = 0x11;
    pub const HTTP_MISSING_SETTINGS: u64 = 0x12;
    pub const HTTP_UNEXPECTED_FRAME: u64 = 0x13;
    pub const HTTP_REQUEST_REJECTED: u64 = 0x14;
    pub const HTTP_GENERAL_PROTOCOL_ERROR: u64 = 0xFF;

    /// Base for per-frame-type malformed frame codes.
    pub const HTTP_MALFORMED_FRAME: u64 = 0x0100;

    pub const HTTP_MALFORMED_FRAME_PUSH_PROMISE: u64 =
        HTTP_MALFORMED_FRAME + crate::frame::PUSH_PROMISE_FRAME_TYPE_ID;

    pub const HTTP_MALFORMED_FRAME_SETTINGS: u64 =
        HTTP_MALFORMED_FRAME + crate::frame::SETTINGS_FRAME_TYPE_ID;

    /// Local-only code: the client gave up on a 0-RTT attempt.
    pub const GIVEUP_ZERO_RTT: u64 = 0x1000_0000;
}

/// The wire dialect spoken on a connection, fixed at ALPN time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    /// HTTP/1.1 framed over QUIC, no control streams.
    H1qV1,

    /// HTTP/1.1 framed over QUIC with a GOAWAY control stream.
    H1qV2,

    /// The full HTTP/3-like profile.
    H3,
}

impl Dialect {
    /// Resolves a negotiated ALPN token to a dialect, if supported.
    pub fn from_alpn(alpn: &[u8]) -> Option<Dialect> {
        match alpn {
            b"h1q-fb" | b"h1q" => Some(Dialect::H1qV1),

            b"h1q-fb-v2" => Some(Dialect::H1qV2),

            _ if alpn.starts_with(b"hq-") => Some(Dialect::H1qV1),

            _ if alpn.starts_with(b"h3-fb-") || alpn.starts_with(b"h3-") =>
                Some(Dialect::H3),

            _ => None,
        }
    }

    /// Whether the dialect multiplexes frames through the varint TLV codec
    /// (as opposed to raw HTTP/1.1 messages).
    pub fn is_framed(self) -> bool {
        matches!(self, Dialect::H3)
    }

    /// Whether the dialect uses unidirectional control streams.
    pub fn has_control_streams(self) -> bool {
        matches!(self, Dialect::H1qV2 | Dialect::H3)
    }
}

/// A trait for types with associated string name and value.
pub trait NameValue {
    /// Returns the object's name.
    fn name(&self) -> &[u8];

    /// Returns the object's value.
    fn value(&self) -> &[u8];
}

impl NameValue for (&[u8], &[u8]) {
    fn name(&self) -> &[u8] {
        self.0
    }

    fn value(&self) -> &[u8] {
        self.1
    }
}

/// An owned name-value pair representing a raw HTTP header.
#[derive(Clone, PartialEq, Eq)]
pub struct Header(pub(crate) Vec<u8>, pub(crate) Vec<u8>);

fn try_print_as_readable(hdr: &[u8], f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(hdr) {
        Ok(s) => f.write_str(&s.escape_default().to_string()),
        Err(_) => write!(f, "{:?}", hdr),
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use std::fmt::Write;

        f.write_char('"')?;
        try_print_as_readable(&self.0, f)?;
        f.write_str(": ")?;
        try_print_as_readable(&self.1, f)?;
        f.write_char('"')
    }
}

impl Header {
    /// Creates a new header.
    ///
    /// Both `name` and `value` will be cloned.
    pub fn new(name: &[u8], value: &[u8]) -> Self {
        Self(name.to_vec(), value.to_vec())
    }
}

impl NameValue for Header {
    fn name(&self) -> &[u8] {
        &self.0
    }

    fn value(&self) -> &[u8] {
        &self.1
    }
}

/// The session configuration.
pub struct Config {
    pub(crate) max_header_list_size: Option<u64>,
    pub(crate) qpack_max_table_capacity: Option<u64>,
    pub(crate) qpack_blocked_streams: Option<u64>,
    pub(crate) num_placeholders: Option<u64>,
    pub(crate) max_push_id: Option<u64>,
    pub(crate) max_concurrent_outgoing_streams: u64,
    pub(crate) transaction_timeout: Option<std::time::Duration>,
    pub(crate) idle_timeout: Option<std::time::Duration>,
    pub(crate) partial_reliability: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

impl Config {
    /// Creates a new configuration object with default settings.
    pub const fn new() -> Config {
        Config {
            max_header_list_size: None,
            qpack_max_table_capacity: None,
            qpack_blocked_streams: None,
            num_placeholders: None,
            max_push_id: None,
            max_concurrent_outgoing_streams: 100,
            transaction_timeout: None,
            idle_timeout: None,
            partial_reliability: false,
        }
    }

    /// Sets the `MAX_HEADER_LIST_SIZE` setting.
    ///
    /// By default no limit is enforced. A received request or response
    /// whose decompressed header section exceeds this limit fails the
    /// session with [`Error::ExcessiveLoad`].
    ///
    /// [`Error::ExcessiveLoad`]: enum.Error.html#variant.ExcessiveLoad
    pub fn set_max_header_list_size(&mut self, v: u64) {
        self.max_header_list_size = Some(v);
    }

    /// Sets the `HEADER_TABLE_SIZE` setting.
    ///
    /// The default value is `0`.
    pub fn set_qpack_max_table_capacity(&mut self, v: u64) {
        self.qpack_max_table_capacity = Some(v);
    }

    /// Sets the `QPACK_BLOCKED_STREAMS` setting.
    ///
    /// The default value is `0`.
    pub fn set_qpack_blocked_streams(&mut self, v: u64) {
        self.qpack_blocked_streams = Some(v);
    }

    /// Sets the push ID budget advertised by a client via MAX_PUSH_ID.
    ///
    /// Servers ignore this. By default no pushes are permitted.
    pub fn set_max_push_id(&mut self, v: u64) {
        self.max_push_id = Some(v);
    }

    /// Caps how many locally-initiated request streams may be open at
    /// once. The default is 100.
    pub fn set_max_concurrent_outgoing_streams(&mut self, v: u64) {
        self.max_concurrent_outgoing_streams = v;
    }

    /// Arms the per-transaction idle timeout.
    ///
    /// On the server side an expired transaction that has not started a
    /// response is answered with a `408` and its ingress is discarded.
    pub fn set_transaction_timeout(&mut self, v: std::time::Duration) {
        self.transaction_timeout = Some(v);
    }

    /// Arms the session idle timeout, which only fires while no streams
    /// are open.
    pub fn set_idle_timeout(&mut self, v: std::time::Duration) {
        self.idle_timeout = Some(v);
    }

    /// Enables the partial-reliability extension (H3 only): bodies are
    /// carried unframed and either side may skip or reject body ranges.
    pub fn enable_partial_reliability(&mut self, enabled: bool) {
        self.partial_reliability = enabled;
    }
}
