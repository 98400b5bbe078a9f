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

//! The seam between the session core and the QUIC transport.
//!
//! The transport (handshake, packetization, congestion, per-stream flow
//! control accounting) lives outside this crate. The session reaches it
//! exclusively through the [`Transport`] trait; the concrete
//! implementation is expected to wrap a real QUIC socket.
//!
//! All stream operations address streams by their QUIC stream ID. IDs
//! follow the standard encoding: the second-least-significant bit
//! distinguishes bidirectional from unidirectional streams, the
//! least-significant bit client- from server-initiated ones.

use std::fmt;

/// A specialized [`Result`] type for transport operations.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// A transport-level error surfaced into the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// There is no data to read or no room to write; retry later.
    Done,

    /// No stream credit left to open a new stream.
    StreamLimit,

    /// The peer reset the stream with the given application error code.
    StreamReset(u64),

    /// The peer sent STOP_SENDING with the given application error code.
    StreamStopped(u64),

    /// The stream does not exist or was already collected.
    InvalidStreamState,

    /// A flow control limit was violated.
    FlowControl,
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

/// The side of a stream to shut down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shutdown {
    /// Stop receiving stream data (STOP_SENDING).
    Read  = 0,

    /// Stop sending stream data (RESET_STREAM).
    Write = 1,
}

/// The operations the session core needs from a QUIC transport.
///
/// Methods that move stream data may accept or return fewer bytes than
/// offered; the session owns all retry buffering. Nothing here blocks.
pub trait Transport {
    /// The ALPN protocol negotiated during the handshake.
    fn application_proto(&self) -> &[u8];

    /// Whether this endpoint is the server side of the connection.
    fn is_server(&self) -> bool;

    /// Whether the handshake has completed.
    fn is_established(&self) -> bool;

    /// Allocates a new locally-initiated bidirectional stream.
    fn open_bidi(&mut self) -> Result<u64>;

    /// Allocates a new locally-initiated unidirectional stream.
    fn open_uni(&mut self) -> Result<u64>;

    /// Streams with buffered ingress (data, FIN or reset) to consume.
    fn readable(&self) -> Vec<u64>;

    /// Reads stream data, consuming it. Returns the number of bytes read
    /// and whether the FIN was reached.
    fn recv(&mut self, id: u64, out: &mut [u8]) -> Result<(usize, bool)>;

    /// Reads stream data without consuming it.
    fn peek(&mut self, id: u64, out: &mut [u8]) -> Result<(usize, bool)>;

    /// Writes stream data, returning how many bytes were accepted.
    fn send(&mut self, id: u64, buf: &[u8], fin: bool) -> Result<usize>;

    /// Remaining stream-level flow control window, in bytes.
    fn capacity(&self, id: u64) -> Result<usize>;

    /// How many bytes the connection will accept in one flush pass.
    fn connection_capacity(&self) -> usize;

    /// Whether all ingress data on the stream, including the FIN, has
    /// been consumed.
    fn finished(&self, id: u64) -> bool;

    /// Shuts down one side of a stream with an application error code.
    fn shutdown(&mut self, id: u64, direction: Shutdown, err: u64)
        -> Result<()>;

    /// Applies urgency/incremental scheduling hints to a stream.
    fn stream_priority(
        &mut self, id: u64, urgency: u8, incremental: bool,
    ) -> Result<()>;

    /// The stream offset of the next byte that will be accepted by
    /// `send()`.
    fn write_offset(&self, id: u64) -> Result<u64>;

    /// Bytes accepted by `send()` but not yet committed to the wire.
    fn write_buffered(&self, id: u64) -> Result<u64>;

    /// Requests a delivery notification once every byte below `offset`
    /// has been acknowledged by the peer. The notification is forwarded
    /// into the session through `Session::on_delivery_ack()`.
    fn register_delivery(&mut self, id: u64, offset: u64) -> Result<()>;

    /// Declares egress data below the stream offset expired (partial
    /// reliability).
    fn send_data_expired(&mut self, id: u64, offset: u64) -> Result<()>;

    /// Declares ingress data below the stream offset rejected (partial
    /// reliability).
    fn send_data_rejected(&mut self, id: u64, offset: u64) -> Result<()>;

    /// Closes the connection with an application error code.
    fn close(&mut self, err: u64, reason: &[u8]) -> Result<()>;
}

/// Returns true if the stream is bidirectional.
pub fn is_bidi(stream_id: u64) -> bool {
    (stream_id & 0x2) == 0
}

/// Returns true if the stream is unidirectional.
pub fn is_uni(stream_id: u64) -> bool {
    !is_bidi(stream_id)
}

/// Returns true if the stream was initiated by the server.
pub fn is_server_initiated(stream_id: u64) -> bool {
    (stream_id & 0x1) == 1
}

/// Returns true if the stream was created locally.
pub fn is_local(stream_id: u64, is_server: bool) -> bool {
    is_server_initiated(stream_id) == is_server
}
