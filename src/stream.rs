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

//! Per-stream state.
//!
//! Each stream couples an ingress half (a state machine that consumes
//! the wire preface and frames as transport data arrives) with an egress
//! half (a chained write buffer drained by the session's flush pass).
//! The same type backs request streams, typed unidirectional streams and
//! push streams; the session decides which states apply based on the
//! stream's type and the dialect.

use std::collections::VecDeque;
use std::time::Instant;

use crate::frame;
use crate::h1;
use crate::priority::Priority;
use crate::reliability::OffsetTracker;
use crate::transport::Transport;
use crate::Dialect;
use crate::Error;
use crate::Result;

pub const HTTP3_CONTROL_STREAM_TYPE_ID: u64 = 0x0;
pub const HTTP3_PUSH_STREAM_TYPE_ID: u64 = 0x1;
pub const QPACK_ENCODER_STREAM_TYPE_ID: u64 = 0x2;
pub const QPACK_DECODER_STREAM_TYPE_ID: u64 = 0x3;
pub const H1Q_CONTROL_STREAM_TYPE_ID: u64 = 0xF0;

const MAX_STATE_BUF_SIZE: usize = (1 << 24) - 1;

/// A sentinel state length for unframed (partially-reliable) bodies.
const UNBOUNDED: usize = usize::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    Control,
    Request,
    Push,
    QpackEncoder,
    QpackDecoder,
    Unknown,
}

impl Type {
    /// Resolves a unidirectional stream preface varint for the dialect.
    pub fn deserialize(v: u64, dialect: Dialect) -> Type {
        match (dialect, v) {
            (Dialect::H3, HTTP3_CONTROL_STREAM_TYPE_ID) => Type::Control,
            (Dialect::H3, HTTP3_PUSH_STREAM_TYPE_ID) => Type::Push,
            (Dialect::H3, QPACK_ENCODER_STREAM_TYPE_ID) => Type::QpackEncoder,
            (Dialect::H3, QPACK_DECODER_STREAM_TYPE_ID) => Type::QpackDecoder,

            (Dialect::H1qV2, H1Q_CONTROL_STREAM_TYPE_ID) => Type::Control,

            _ => Type::Unknown,
        }
    }

    /// The preface varint announcing this stream type.
    pub fn serialize(self, dialect: Dialect) -> Option<u64> {
        match (dialect, self) {
            (Dialect::H3, Type::Control) => Some(HTTP3_CONTROL_STREAM_TYPE_ID),
            (Dialect::H3, Type::Push) => Some(HTTP3_PUSH_STREAM_TYPE_ID),
            (Dialect::H3, Type::QpackEncoder) =>
                Some(QPACK_ENCODER_STREAM_TYPE_ID),
            (Dialect::H3, Type::QpackDecoder) =>
                Some(QPACK_DECODER_STREAM_TYPE_ID),

            (Dialect::H1qV2, Type::Control) =>
                Some(H1Q_CONTROL_STREAM_TYPE_ID),

            _ => None,
        }
    }
}

/// A header block parked on missing QPACK inserts, with what it was
/// going to become.
#[derive(Debug)]
pub enum PendingBlock {
    Headers(Vec<u8>),
    Trailers(Vec<u8>),
    Promise(u64, Vec<u8>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Reading the stream's type.
    StreamType,

    /// Reading the push ID.
    PushId,

    /// Reading the stream's current frame's type.
    FrameType,

    /// Reading the stream's current frame's payload length.
    FramePayloadLen,

    /// Reading the stream's current frame's payload.
    FramePayload,

    /// Reading DATA payload.
    Data,

    /// Reading a QPACK instruction.
    QpackInstruction,

    /// Feeding an HTTP/1.1 codec.
    Message,

    /// Reading and discarding data.
    Drain,

    /// All data has been read.
    Finished,
}

/// A chained egress buffer.
///
/// Bytes the transport refuses during a flush are put back at the head,
/// so the wire order is never disturbed.
#[derive(Debug, Default)]
pub struct WriteBuf {
    chain: VecDeque<Vec<u8>>,
    len: usize,
}

impl WriteBuf {
    pub fn append(&mut self, buf: Vec<u8>) {
        if buf.is_empty() {
            return;
        }

        self.len += buf.len();
        self.chain.push_back(buf);
    }

    /// Takes up to `max` bytes off the head of the chain.
    pub fn pop(&mut self, max: usize) -> Option<Vec<u8>> {
        if max == 0 {
            return None;
        }

        let mut head = self.chain.pop_front()?;

        if head.len() > max {
            let rest = head.split_off(max);
            self.chain.push_front(rest);
        }

        self.len -= head.len();

        Some(head)
    }

    /// Puts refused bytes back at the head of the chain.
    pub fn unpop(&mut self, buf: Vec<u8>) {
        if buf.is_empty() {
            return;
        }

        self.len += buf.len();
        self.chain.push_front(buf);
    }

    /// Drops up to `max` bytes off the head, returning how many were
    /// dropped.
    pub fn trim_front(&mut self, max: usize) -> usize {
        let mut dropped = 0;

        while dropped < max {
            match self.pop(max - dropped) {
                Some(buf) => dropped += buf.len(),
                None => break,
            }
        }

        dropped
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.chain.clear();
        self.len = 0;
    }
}

/// One HTTP-over-QUIC stream.
pub struct Stream {
    /// The corresponding transport stream's ID.
    id: u64,

    /// The stream's type (if known).
    ty: Option<Type>,

    dialect: Dialect,

    /// The current ingress state.
    state: State,

    /// The buffer holding partial data for the current state.
    state_buf: Vec<u8>,

    /// The expected amount of bytes required to complete the state.
    state_len: usize,

    /// How many bytes have been read for the current state.
    state_off: usize,

    /// The type of the frame currently being parsed.
    frame_type: Option<u64>,

    /// Whether the stream was created locally, or by the peer.
    is_local: bool,

    /// Whether the peer has initialized the stream (sent SETTINGS on a
    /// control stream, HEADERS on a request stream).
    remote_initialized: bool,

    /// Whether a message head has been queued for egress.
    local_initialized: bool,

    /// The push ID tied to this stream, if it is a push stream.
    pub push_id: Option<u64>,

    /// A nascent push stream parks here until its promise arrives.
    pub push_parked: bool,

    /// HTTP/1.1 codec, present on request streams of the H1Q dialects.
    pub h1: Option<h1::Codec>,

    /// Body bytes decoded by the HTTP/1.1 codec, awaiting the
    /// application.
    pub h1_body: VecDeque<u8>,

    // Ingress message progress.
    pub headers_received: bool,
    pub trailers_received: bool,
    codec_complete: bool,
    eom_fired: bool,
    read_paused: bool,

    /// A header block waiting on QPACK inserts.
    pub blocked: Option<PendingBlock>,

    /// Total ingress bytes consumed, used to anchor the
    /// partial-reliability body base.
    pub ingress_offset: u64,

    /// Whether the egress head carried `Connection: close` (H1Q-v1
    /// drain).
    pub goaway_latched: bool,

    /// Whether a `Data` event has been triggered for this stream.
    data_event_triggered: bool,

    // Egress half.
    pub write_buf: WriteBuf,
    pub pending_eom: bool,
    pub eom_sent: bool,
    pub priority: Priority,

    /// Set while the scheduler holds the stream.
    pub scheduled: bool,

    /// Set while the stream logically has egress pending, whether or not
    /// flow control currently admits it into the scheduler.
    pub enqueued: bool,

    /// Stream offset of the next byte to hand to the transport.
    pub emitted: u64,

    /// Byte-event offsets, recorded at encode time.
    pub headers_end_offset: Option<u64>,
    pub first_body_offset: Option<u64>,
    pub fin_offset: Option<u64>,

    /// Outstanding delivery callbacks; the stream is kept alive until
    /// they all fire or cancel.
    pub delivery_refs: usize,

    // Partial reliability.
    pub pr_ingress: Option<OffsetTracker>,
    pub pr_egress: Option<OffsetTracker>,
    pub bytes_skipped: u64,

    /// An expired-data stream offset that arrived before the message
    /// head anchored the offset map.
    pub pending_expired: Option<u64>,

    // Terminal flags.
    pub reset_received: Option<u64>,
    pub aborted: bool,

    pub deadline: Option<Instant>,
}

impl Stream {
    /// Creates a request stream.
    pub fn new_request(id: u64, is_local: bool, dialect: Dialect) -> Stream {
        let state = if dialect.is_framed() {
            State::FrameType
        } else {
            State::Message
        };

        Stream::new(id, Some(Type::Request), state, is_local, dialect)
    }

    /// Creates the session's half of a typed egress unidirectional
    /// stream. It has no ingress.
    pub fn new_uni_egress(id: u64, ty: Type, dialect: Dialect) -> Stream {
        Stream::new(id, Some(ty), State::Finished, true, dialect)
    }

    /// Creates a peer unidirectional stream whose preface was already
    /// consumed by the dispatcher.
    pub fn new_uni_ingress(id: u64, ty: Type, dialect: Dialect) -> Stream {
        let state = match ty {
            Type::Control | Type::Push => State::FrameType,

            Type::QpackEncoder | Type::QpackDecoder => State::QpackInstruction,

            _ => State::Drain,
        };

        Stream::new(id, Some(ty), state, false, dialect)
    }

    fn new(
        id: u64, ty: Option<Type>, state: State, is_local: bool,
        dialect: Dialect,
    ) -> Stream {
        Stream {
            id,
            ty,
            dialect,

            state,

            // Pre-allocate a buffer to avoid multiple tiny early
            // allocations.
            state_buf: vec![0; 16],

            // Expect one byte for the initial state, to parse the
            // initial varint length.
            state_len: 1,
            state_off: 0,

            frame_type: None,

            is_local,
            remote_initialized: false,
            local_initialized: false,

            push_id: None,
            push_parked: false,

            h1: None,
            h1_body: VecDeque::new(),

            headers_received: false,
            trailers_received: false,
            codec_complete: false,
            eom_fired: false,
            read_paused: false,

            blocked: None,
            ingress_offset: 0,
            goaway_latched: false,

            data_event_triggered: false,

            write_buf: WriteBuf::default(),
            pending_eom: false,
            eom_sent: false,
            priority: Priority::default(),

            scheduled: false,
            enqueued: false,

            emitted: 0,

            headers_end_offset: None,
            first_body_offset: None,
            fin_offset: None,

            delivery_refs: 0,

            pr_ingress: None,
            pr_egress: None,
            bytes_skipped: 0,
            pending_expired: None,

            reset_received: None,
            aborted: false,

            deadline: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ty(&self) -> Option<Type> {
        self.ty
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    /// Marks the egress head as queued.
    pub fn initialize_local(&mut self) {
        self.local_initialized = true;
    }

    /// Whether the egress head has been queued.
    pub fn local_initialized(&self) -> bool {
        self.local_initialized
    }

    pub fn remote_initialized(&self) -> bool {
        self.remote_initialized
    }

    pub fn pause_read(&mut self) {
        self.read_paused = true;
    }

    pub fn resume_read(&mut self) {
        self.read_paused = false;
    }

    pub fn read_paused(&self) -> bool {
        self.read_paused
    }

    /// Sets the frame type and transitions to the next state.
    pub fn set_frame_type(&mut self, ty: u64) -> Result<()> {
        assert_eq!(self.state, State::FrameType);

        match (self.ty, self.dialect) {
            (Some(Type::Control), Dialect::H3) => {
                // Control stream starts uninitialized and only SETTINGS
                // is accepted in that state. Other frames cause an
                // error. Once initialized, no more SETTINGS are
                // permitted.
                match (ty, self.remote_initialized) {
                    // Initialize control stream.
                    (frame::SETTINGS_FRAME_TYPE_ID, false) =>
                        self.remote_initialized = true,

                    // Non-SETTINGS frames not allowed on control stream
                    // before initialization.
                    (_, false) => return Err(Error::MissingSettings),

                    // Additional SETTINGS frame.
                    (frame::SETTINGS_FRAME_TYPE_ID, true) =>
                        return Err(Error::FrameUnexpected),

                    // Frames that can't be received on control stream
                    // after initialization.
                    (frame::DATA_FRAME_TYPE_ID, true) =>
                        return Err(Error::FrameUnexpected),

                    (frame::HEADERS_FRAME_TYPE_ID, true) =>
                        return Err(Error::FrameUnexpected),

                    (frame::PUSH_PROMISE_FRAME_TYPE_ID, true) =>
                        return Err(Error::FrameUnexpected),

                    // All other frames are ignored after initialization.
                    (_, true) => (),
                }
            },

            (Some(Type::Control), _) => {
                // The H1Q-v2 control stream only ever carries GOAWAY;
                // SETTINGS in particular is a protocol violation there.
                match ty {
                    frame::GOAWAY_FRAME_TYPE_ID => (),

                    frame::SETTINGS_FRAME_TYPE_ID |
                    frame::DATA_FRAME_TYPE_ID |
                    frame::HEADERS_FRAME_TYPE_ID |
                    frame::PUSH_PROMISE_FRAME_TYPE_ID =>
                        return Err(Error::FrameUnexpected),

                    _ => (),
                }
            },

            (Some(Type::Request), _) => {
                // Request stream starts uninitialized and only HEADERS
                // is accepted. Other frames cause an error.
                if !self.is_local {
                    match (ty, self.remote_initialized) {
                        (frame::HEADERS_FRAME_TYPE_ID, false) =>
                            self.remote_initialized = true,

                        (frame::DATA_FRAME_TYPE_ID, false) =>
                            return Err(Error::FrameUnexpected),

                        (frame::CANCEL_PUSH_FRAME_TYPE_ID, _) =>
                            return Err(Error::FrameUnexpected),

                        (frame::SETTINGS_FRAME_TYPE_ID, _) =>
                            return Err(Error::FrameUnexpected),

                        (frame::GOAWAY_FRAME_TYPE_ID, _) =>
                            return Err(Error::FrameUnexpected),

                        (frame::MAX_PUSH_FRAME_TYPE_ID, _) =>
                            return Err(Error::FrameUnexpected),

                        // All other frames can be ignored regardless of
                        // stream state.
                        _ => (),
                    }
                } else {
                    match (ty, self.remote_initialized) {
                        (frame::HEADERS_FRAME_TYPE_ID, false) =>
                            self.remote_initialized = true,

                        _ => (),
                    }
                }
            },

            (Some(Type::Push), _) => {
                match ty {
                    // Frames that can never be received on push streams.
                    frame::CANCEL_PUSH_FRAME_TYPE_ID =>
                        return Err(Error::FrameUnexpected),

                    frame::SETTINGS_FRAME_TYPE_ID =>
                        return Err(Error::FrameUnexpected),

                    frame::PUSH_PROMISE_FRAME_TYPE_ID =>
                        return Err(Error::FrameUnexpected),

                    frame::GOAWAY_FRAME_TYPE_ID =>
                        return Err(Error::FrameUnexpected),

                    frame::MAX_PUSH_FRAME_TYPE_ID =>
                        return Err(Error::FrameUnexpected),

                    _ => (),
                }
            },

            _ => return Err(Error::FrameUnexpected),
        }

        self.frame_type = Some(ty);

        self.state_transition(State::FramePayloadLen, 1, true)?;

        Ok(())
    }

    /// Returns the stream's current frame type, if any.
    pub fn frame_type(&self) -> Option<u64> {
        self.frame_type
    }

    /// Sets the frame's payload length and transitions to the next
    /// state.
    pub fn set_frame_payload_len(&mut self, len: u64) -> Result<()> {
        assert_eq!(self.state, State::FramePayloadLen);

        if matches!(self.ty, Some(Type::Control | Type::Request | Type::Push))
        {
            let (state, resize) = match self.frame_type {
                Some(frame::DATA_FRAME_TYPE_ID) => (State::Data, false),

                // These frame types can never have 0 payload length
                // because they always have fields that must be
                // populated.
                Some(
                    frame::GOAWAY_FRAME_TYPE_ID |
                    frame::PUSH_PROMISE_FRAME_TYPE_ID |
                    frame::CANCEL_PUSH_FRAME_TYPE_ID |
                    frame::MAX_PUSH_FRAME_TYPE_ID,
                ) => {
                    if len == 0 {
                        return Err(Error::FrameError);
                    }

                    (State::FramePayload, true)
                },

                _ => (State::FramePayload, true),
            };

            self.state_transition(state, len as usize, resize)?;

            return Ok(());
        }

        Err(Error::InternalError)
    }

    /// Tries to fill the state buffer by reading data from the
    /// transport.
    ///
    /// When not enough data can be read to complete the state, this
    /// returns `Error::Done`.
    pub fn try_fill_buffer(&mut self, t: &mut dyn Transport) -> Result<()> {
        // If no bytes are required to be read, return early.
        if self.state_buffer_complete() {
            return Ok(());
        }

        let buf = &mut self.state_buf[self.state_off..self.state_len];

        let read = match t.recv(self.id, buf) {
            Ok((len, _)) => len,

            Err(e) => {
                // The stream is not readable anymore, so re-arm the Data
                // event.
                if e == crate::transport::Error::Done {
                    self.reset_data_event();
                }

                return Err(e.into());
            },
        };

        trace!("read {} bytes on stream {}", read, self.id);

        self.state_off += read;
        self.ingress_offset += read as u64;

        if !self.state_buffer_complete() {
            self.reset_data_event();

            return Err(Error::Done);
        }

        Ok(())
    }

    /// Tries to fill the state buffer from a byte slice, for tests that
    /// don't want to stand up a transport.
    #[cfg(test)]
    pub fn try_fill_buffer_for_tests(
        &mut self, stream: &mut std::io::Cursor<Vec<u8>>,
    ) -> Result<()> {
        if self.state_buffer_complete() {
            return Ok(());
        }

        let buf = &mut self.state_buf[self.state_off..self.state_len];

        let read = std::io::Read::read(stream, buf).unwrap();

        self.state_off += read;

        if !self.state_buffer_complete() {
            return Err(Error::Done);
        }

        Ok(())
    }

    /// Tries to parse a varint (including length) from the state buffer.
    pub fn try_consume_varint(&mut self) -> Result<u64> {
        if self.state_off == 1 {
            self.state_len = octets::varint_parse_len(self.state_buf[0]);
            self.state_buf.resize(self.state_len, 0);
        }

        // Return early if we don't have enough data in the state buffer
        // to parse the whole varint.
        if !self.state_buffer_complete() {
            return Err(Error::Done);
        }

        let varint = octets::Octets::with_slice(&self.state_buf).get_varint()?;

        Ok(varint)
    }

    /// Tries to parse a frame from the state buffer.
    ///
    /// If successful, returns the `frame::Frame` and the payload length.
    pub fn try_consume_frame(&mut self) -> Result<(frame::Frame, u64)> {
        // Processing a frame other than DATA, so re-arm the Data event.
        self.reset_data_event();

        let payload_len = self.state_len as u64;

        let frame = frame::Frame::from_bytes(
            self.frame_type.ok_or(Error::InternalError)?,
            payload_len,
            &self.state_buf,
        )?;

        self.state_transition(State::FrameType, 1, true)?;

        Ok((frame, payload_len))
    }

    /// Tries to read DATA payload from the transport.
    pub fn try_consume_data(
        &mut self, t: &mut dyn Transport, out: &mut [u8],
    ) -> Result<(usize, bool)> {
        let left = std::cmp::min(out.len(), self.state_len - self.state_off);

        let (len, fin) = match t.recv(self.id, &mut out[..left]) {
            Ok(v) => v,

            Err(e) => {
                // The stream is not readable anymore, so re-arm the Data
                // event.
                if e == crate::transport::Error::Done {
                    self.reset_data_event();
                }

                return Err(e.into());
            },
        };

        if self.state_len != UNBOUNDED {
            self.state_off += len;
        }

        self.ingress_offset += len as u64;

        if self.state_buffer_complete() {
            self.state_transition(State::FrameType, 1, true)?;
        }

        Ok((len, fin))
    }

    /// Switches to an unbounded body, used by partially-reliable
    /// streams where the body follows the head unframed.
    pub fn start_unframed_body(&mut self) -> Result<()> {
        self.state_transition(State::Data, UNBOUNDED, false)
    }

    /// Marks the stream's ingress as finished.
    pub fn finished(&mut self) {
        let _ = self.state_transition(State::Finished, 0, false);
    }

    /// Whether the ingress state machine is at a clean message boundary,
    /// so a transport FIN here ends the message rather than truncating
    /// it.
    pub fn at_frame_boundary(&self) -> bool {
        match self.state {
            State::FrameType => self.state_off == 0,

            State::Data => self.state_len == UNBOUNDED,

            State::Finished | State::Drain => true,

            _ => false,
        }
    }

    /// Records that the message codec saw the end of the message.
    pub fn mark_codec_complete(&mut self) {
        self.codec_complete = true;
    }

    /// Gives up on the ingress half without firing the end-of-message
    /// gate, e.g. when a timed-out transaction discards its request.
    pub fn abandon_ingress(&mut self) {
        self.codec_complete = true;
        self.eom_fired = true;
        self.h1_body.clear();

        let _ = self.state_transition(State::Drain, 0, false);
    }

    pub fn codec_complete(&self) -> bool {
        self.codec_complete
    }

    /// The two-input end-of-message gate: fires exactly once, when the
    /// codec has completed the message and the transport has delivered
    /// the FIN.
    pub fn fire_eom_gate(&mut self, transport_eof: bool) -> bool {
        if self.eom_fired {
            return false;
        }

        if !self.codec_complete || !transport_eof {
            return false;
        }

        self.eom_fired = true;

        true
    }

    pub fn eom_fired(&self) -> bool {
        self.eom_fired
    }

    /// Tries to update the data triggered state for the stream.
    ///
    /// This returns `true` if a Data event was not already triggered
    /// before the last reset, and updates the state. Returns `false`
    /// otherwise.
    pub fn try_trigger_data_event(&mut self) -> bool {
        if self.data_event_triggered {
            return false;
        }

        self.data_event_triggered = true;

        true
    }

    /// Resets the data triggered state.
    pub fn reset_data_event(&mut self) {
        self.data_event_triggered = false;
    }

    /// Whether the egress half still has something for the scheduler.
    pub fn has_pending_egress(&self) -> bool {
        !self.write_buf.is_empty() || (self.pending_eom && !self.eom_sent)
    }

    /// The stream offset one past everything queued so far.
    pub fn queued_offset(&self) -> u64 {
        self.emitted + self.write_buf.len() as u64
    }

    /// Whether the stream has served its purpose and can be reaped.
    ///
    /// A detached stream lingers while it still has unflushed egress or
    /// unacked delivery callbacks.
    pub fn is_complete(&self) -> bool {
        // Push streams only have one half: egress when locally
        // initiated, ingress when peer initiated.
        let no_ingress = self.ty == Some(Type::Push) && self.is_local;
        let no_egress = self.ty == Some(Type::Push) && !self.is_local;

        let ingress_done = no_ingress ||
            (self.eom_fired && self.h1_body.is_empty()) ||
            self.reset_received.is_some() ||
            self.aborted;

        let egress_done = no_egress ||
            self.aborted ||
            (!self.has_pending_egress() &&
                (self.eom_sent || self.reset_received.is_some()));

        ingress_done && egress_done && self.delivery_refs == 0
    }

    /// Returns true if the state buffer has enough data to complete the
    /// state.
    fn state_buffer_complete(&self) -> bool {
        self.state_len != UNBOUNDED && self.state_off == self.state_len
    }

    /// Transitions the stream to a new state, and optionally resets the
    /// state buffer.
    fn state_transition(
        &mut self, new_state: State, expected_len: usize, resize: bool,
    ) -> Result<()> {
        // Some states don't need the state buffer, so don't resize it if
        // not necessary.
        if resize {
            // A peer can influence the size of the state buffer (e.g.
            // with the payload size of a GREASE frame), so we need to
            // limit the maximum size to avoid DoS.
            if expected_len > MAX_STATE_BUF_SIZE {
                return Err(Error::ExcessiveLoad);
            }

            self.state_buf.resize(expected_len, 0);
        }

        self.state = new_state;
        self.state_off = 0;
        self.state_len = expected_len;

        Ok(())
    }
}
