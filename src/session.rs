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

//! The per-connection session engine.
//!
//! A [`Session`] owns every stream of one HTTP-over-QUIC connection and
//! multiplexes transactions over the transport: it dispatches peer
//! unidirectional streams by their preface, enforces the control-stream
//! rules of the negotiated dialect, schedules egress under flow control,
//! binds server pushes to their promises, and walks the drain protocol
//! to an orderly close.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use smallvec::SmallVec;

use crate::frame;
use crate::h1;
use crate::priority::EgressQueue;
use crate::priority::Priority;
use crate::qpack;
use crate::stream;
use crate::stream::PendingBlock;
use crate::stream::Stream;
use crate::transport;
use crate::transport::Transport;
use crate::wire;
use crate::Config;
use crate::Dialect;
use crate::Error;
use crate::Header;
use crate::NameValue;
use crate::Result;

/// The largest stream id a QUIC varint can carry, advertised by the
/// first GOAWAY to mean "no more new streams".
const GOAWAY_MAX_STREAM_ID: u64 = (1 << 62) - 1;

/// New request-stream reads dispatched per poll sweep; the rest wait for
/// the next sweep so egress is never starved.
const MAX_READS_PER_LOOP: usize = 16;

/// Progress of the connection towards orderly shutdown.
///
/// The H1Q-v1 path walks NONE → PENDING → CLOSE_SENT / CLOSE_RECEIVED →
/// DONE on `Connection: close` markers; the control-stream dialects walk
/// NONE → PENDING → FIRST_GOAWAY → SECOND_GOAWAY → DONE on GOAWAY
/// delivery. The state never moves backwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrainState {
    None,
    Pending,
    CloseSent,
    CloseReceived,
    FirstGoaway,
    SecondGoaway,
    Done,
}

/// A session event, keyed by the stream it happened on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Request or response headers were received.
    Headers {
        /// The list of received header fields.
        list: Vec<Header>,

        /// Whether data will follow the headers on the stream.
        has_body: bool,
    },

    /// Body data is ready; drain it with [`Session::recv_body()`].
    ///
    /// [`Session::recv_body()`]: struct.Session.html#method.recv_body
    Data,

    /// Trailing headers were received.
    Trailers { list: Vec<Header> },

    /// The message completed: the codec saw the end of the message and
    /// the transport delivered the FIN. Fires exactly once per stream.
    Finished,

    /// The stream was reset, or the transaction errored; the payload is
    /// the application error code.
    Reset(u64),

    /// The transaction idle timeout fired.
    TimedOut,

    /// A push promise arrived on this request stream.
    PushPromise { push_id: u64, list: Vec<Header> },

    /// A nascent push stream was bound to its promise; subsequent
    /// events for the pushed response use this stream's id.
    PushBound { push_id: u64 },

    /// A pending push was cancelled before it was bound.
    PushCanceled { push_id: u64 },

    /// GOAWAY was received with the given stream bound.
    GoAway(u64),

    /// The peer skipped body bytes below this body offset.
    DataExpired(u64),

    /// The peer rejected body bytes below this body offset.
    DataRejected(u64),
}

#[derive(Clone, Debug, Default)]
struct Settings {
    header_table_size: Option<u64>,
    max_header_list_size: Option<u64>,
    qpack_blocked_streams: Option<u64>,
    num_placeholders: Option<u64>,
    raw: Option<Vec<(u64, u64)>>,
}

struct QpackStreams {
    encoder_stream_id: Option<u64>,
    decoder_stream_id: Option<u64>,
}

struct PromisedPush {
    parent_stream_id: u64,
    deadline: Option<Instant>,
}

/// An HTTP-over-QUIC session.
pub struct Session {
    is_server: bool,
    dialect: Dialect,

    local_settings: Settings,
    peer_settings: Option<Settings>,

    streams: HashMap<u64, Stream>,

    control_stream_id: Option<u64>,
    peer_control_stream_id: Option<u64>,

    local_qpack_streams: QpackStreams,
    peer_qpack_streams: QpackStreams,

    /// Egress typed streams, flushed before request streams in creation
    /// order.
    control_flush_order: Vec<u64>,

    qpack_encoder: qpack::Encoder,
    qpack_decoder: qpack::Decoder,

    // Server push.
    max_push_id: Option<u64>,
    next_push_id: u64,
    promised_pushes: HashMap<u64, PromisedPush>,
    nascent_pushes: HashMap<u64, u64>,
    push_ids_by_stream: HashMap<u64, u64>,

    // Drain.
    drain_state: DrainState,
    local_goaway_id: Option<u64>,
    peer_goaway_id: Option<u64>,
    max_seen_request_stream_id: Option<u64>,
    goaway_ack_offset: Option<u64>,
    close_when_idle: bool,

    // Loop state.
    events: VecDeque<(u64, Event)>,
    pending_reads: BTreeSet<u64>,
    blocked_streams: BTreeSet<u64>,
    fc_blocked: BTreeSet<u64>,
    ignored_streams: BTreeSet<u64>,
    pending_drop: Option<(u64, Error)>,
    dropping: bool,
    closed: bool,

    egress_queue: EgressQueue,

    transaction_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,
    partial_reliability: bool,
    max_concurrent_outgoing: u64,
    replay_safe: bool,
}

impl Session {
    /// Creates a session over an established transport.
    ///
    /// Reads the negotiated ALPN, fixes the dialect, opens the egress
    /// typed streams the dialect requires and queues the initial
    /// SETTINGS. [`Error::ConnectFailed`] means the ALPN was not
    /// supported or a required stream could not be opened; in both cases
    /// the transport has been closed.
    ///
    /// [`Error::ConnectFailed`]: ../enum.Error.html#variant.ConnectFailed
    pub fn with_transport(
        t: &mut dyn Transport, config: &Config,
    ) -> Result<Session> {
        let alpn = t.application_proto().to_vec();

        let dialect = match Dialect::from_alpn(&alpn) {
            Some(v) => v,

            None => {
                error!(
                    "connect failed: ALPN {:?} not supported",
                    String::from_utf8_lossy(&alpn)
                );

                let _ = t.close(
                    wire::HTTP_VERSION_FALLBACK,
                    b"ALPN not supported",
                );

                return Err(Error::ConnectFailed);
            },
        };

        let is_server = t.is_server();

        if !is_server && !t.is_established() {
            return Err(Error::InternalError);
        }

        let local_settings = Settings {
            header_table_size: config.qpack_max_table_capacity,
            max_header_list_size: config.max_header_list_size,
            qpack_blocked_streams: config.qpack_blocked_streams,
            num_placeholders: config.num_placeholders,
            raw: None,
        };

        let mut qpack_decoder = qpack::Decoder::new();
        qpack_decoder.set_max_table_capacity(
            local_settings.header_table_size.unwrap_or(0),
        );
        qpack_decoder.set_max_blocked_streams(
            local_settings.qpack_blocked_streams.unwrap_or(0),
        );

        let mut session = Session {
            is_server,
            dialect,

            local_settings,
            peer_settings: None,

            streams: HashMap::new(),

            control_stream_id: None,
            peer_control_stream_id: None,

            local_qpack_streams: QpackStreams {
                encoder_stream_id: None,
                decoder_stream_id: None,
            },

            peer_qpack_streams: QpackStreams {
                encoder_stream_id: None,
                decoder_stream_id: None,
            },

            control_flush_order: Vec::new(),

            qpack_encoder: qpack::Encoder::new(),
            qpack_decoder,

            max_push_id: if is_server { None } else { config.max_push_id },
            next_push_id: 0,
            promised_pushes: HashMap::new(),
            nascent_pushes: HashMap::new(),
            push_ids_by_stream: HashMap::new(),

            drain_state: DrainState::None,
            local_goaway_id: None,
            peer_goaway_id: None,
            max_seen_request_stream_id: None,
            goaway_ack_offset: None,
            close_when_idle: false,

            events: VecDeque::new(),
            pending_reads: BTreeSet::new(),
            blocked_streams: BTreeSet::new(),
            fc_blocked: BTreeSet::new(),
            ignored_streams: BTreeSet::new(),
            pending_drop: None,
            dropping: false,
            closed: false,

            egress_queue: EgressQueue::new(),

            transaction_timeout: config.transaction_timeout,
            idle_timeout: config.idle_timeout,
            idle_deadline: None,
            partial_reliability: config.partial_reliability &&
                dialect == Dialect::H3,
            max_concurrent_outgoing: config.max_concurrent_outgoing_streams,
            replay_safe: false,
        };

        session.idle_deadline =
            session.idle_timeout.map(|v| Instant::now() + v);

        if let Err(e) = session.open_egress_control_streams(t, config) {
            let _ = t.close(e.to_wire(), b"Error opening control stream");
            return Err(Error::ConnectFailed);
        }

        trace!(
            "session created, dialect={:?} server={}",
            dialect,
            is_server
        );

        Ok(session)
    }

    fn open_egress_control_streams(
        &mut self, t: &mut dyn Transport, config: &Config,
    ) -> Result<()> {
        match self.dialect {
            Dialect::H1qV1 => (),

            Dialect::H1qV2 => {
                let id = self.open_uni_stream(t, stream::Type::Control)?;
                self.control_stream_id = Some(id);
            },

            Dialect::H3 => {
                let id = self.open_uni_stream(t, stream::Type::Control)?;
                self.control_stream_id = Some(id);

                self.send_settings(id)?;

                if !self.is_server {
                    if let Some(max) = config.max_push_id {
                        self.queue_control_frame(
                            id,
                            &frame::Frame::MaxPushId { push_id: max },
                        )?;
                    }
                }

                let enc = self.open_uni_stream(t, stream::Type::QpackEncoder)?;
                self.local_qpack_streams.encoder_stream_id = Some(enc);

                let dec = self.open_uni_stream(t, stream::Type::QpackDecoder)?;
                self.local_qpack_streams.decoder_stream_id = Some(dec);
            },
        }

        Ok(())
    }

    fn open_uni_stream(
        &mut self, t: &mut dyn Transport, ty: stream::Type,
    ) -> Result<u64> {
        let id = t.open_uni()?;

        // Control and QPACK streams are the most important to schedule.
        let _ = t.stream_priority(id, 0, true);

        let mut s = Stream::new_uni_egress(id, ty, self.dialect);

        let preface = ty
            .serialize(self.dialect)
            .ok_or(Error::InternalError)?;

        let mut d = [0; 8];
        let mut b = octets::OctetsMut::with_slice(&mut d);
        b.put_varint(preface)?;
        let off = b.off();

        s.write_buf.append(d[..off].to_vec());

        self.streams.insert(id, s);
        self.control_flush_order.push(id);

        Ok(id)
    }

    fn send_settings(&mut self, control_id: u64) -> Result<()> {
        let frame = frame::Frame::Settings {
            header_table_size: self.local_settings.header_table_size,
            max_header_list_size: self.local_settings.max_header_list_size,
            qpack_blocked_streams: self.local_settings.qpack_blocked_streams,
            num_placeholders: self.local_settings.num_placeholders,
            grease: None,
            raw: None,
        };

        self.queue_control_frame(control_id, &frame)
    }

    fn queue_control_frame(
        &mut self, control_id: u64, frame: &frame::Frame,
    ) -> Result<()> {
        let mut d = vec![0; frame.wire_len() + 16];
        let mut b = octets::OctetsMut::with_slice(&mut d);

        let len = frame.to_bytes(&mut b)?;
        d.truncate(len);

        let s = self
            .streams
            .get_mut(&control_id)
            .ok_or(Error::InternalError)?;

        trace!("tx frm {:?} stream={}", frame, control_id);

        s.write_buf.append(d);

        Ok(())
    }

    /// The dialect fixed by ALPN negotiation.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Whether this endpoint is the downstream (server) side.
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Current drain progress.
    pub fn drain_state(&self) -> DrainState {
        self.drain_state
    }

    /// Whether a shutdown has been requested or observed.
    pub fn is_draining(&self) -> bool {
        self.drain_state != DrainState::None
    }

    /// Whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Raw peer settings, in receipt order, including unknown ones.
    pub fn peer_settings_raw(&self) -> Option<&[(u64, u64)]> {
        self.peer_settings.as_ref()?.raw.as_deref()
    }

    /// The peer's HEADER_TABLE_SIZE, once SETTINGS arrived.
    pub fn peer_header_table_size(&self) -> Option<u64> {
        self.peer_settings.as_ref()?.header_table_size
    }

    /// The peer's MAX_HEADER_LIST_SIZE, once SETTINGS arrived.
    pub fn peer_max_header_list_size(&self) -> Option<u64> {
        self.peer_settings.as_ref()?.max_header_list_size
    }

    /// The peer's QPACK_BLOCKED_STREAMS, once SETTINGS arrived.
    pub fn peer_qpack_blocked_streams(&self) -> Option<u64> {
        self.peer_settings.as_ref()?.qpack_blocked_streams
    }

    /// The peer's NUM_PLACEHOLDERS: parsed and retained, never acted
    /// on.
    pub fn peer_num_placeholders(&self) -> Option<u64> {
        self.peer_settings.as_ref()?.num_placeholders
    }

    /// Inserts a header into the QPACK dynamic table so later header
    /// sections can reference it. Requires the peer to have granted
    /// table capacity via its HEADER_TABLE_SIZE setting.
    pub fn qpack_insert(&mut self, name: &[u8], value: &[u8]) -> Result<u64> {
        self.qpack_encoder
            .insert(name, value)
            .map_err(|_| Error::InternalError)
    }

    /// The push id bound to a stream, if it is a push stream.
    pub fn push_id(&self, stream_id: u64) -> Option<u64> {
        self.push_ids_by_stream.get(&stream_id).copied()
    }

    /// The number of live transactions (request and push streams).
    pub fn transaction_count(&self) -> usize {
        self.streams
            .values()
            .filter(|s| {
                matches!(
                    s.ty(),
                    Some(stream::Type::Request | stream::Type::Push)
                )
            })
            .count()
    }

    /// Whether another poll sweep is needed before the session is
    /// quiescent (deferred reads, parked blocks, queued events).
    pub fn needs_poll(&self) -> bool {
        !self.events.is_empty() || !self.pending_reads.is_empty()
    }

    /// Whether a flush pass has work to do.
    pub fn has_pending_egress(&self) -> bool {
        self.streams.values().any(|s| s.has_pending_egress())
    }

    /// Marks 0-RTT data as replay-safe.
    pub fn on_replay_safe(&mut self) {
        self.replay_safe = true;
    }

    /// Whether 0-RTT data has been declared replay-safe.
    pub fn is_replay_safe(&self) -> bool {
        self.replay_safe
    }

    /// The stream bound announced by the last GOAWAY this side sent.
    pub fn local_goaway_id(&self) -> Option<u64> {
        self.local_goaway_id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Done);
        }

        Ok(())
    }

    /// Opens a new transaction and sends its request headers.
    ///
    /// Upstream only. Fails with [`Error::RequestRejected`] once the
    /// session is draining beyond the point where the peer would accept
    /// the stream, and with [`Error::StreamBlocked`] when concurrency or
    /// stream credit is exhausted.
    ///
    /// [`Error::RequestRejected`]: ../enum.Error.html#variant.RequestRejected
    /// [`Error::StreamBlocked`]: ../enum.Error.html#variant.StreamBlocked
    pub fn send_request<T: NameValue>(
        &mut self, t: &mut dyn Transport, headers: &[T], fin: bool,
    ) -> Result<u64> {
        self.ensure_open()?;

        if self.is_server {
            return Err(Error::WrongStream);
        }

        // After a GOAWAY from the peer, new requests must not be
        // initiated.
        if self.peer_goaway_id.is_some() ||
            self.drain_state > DrainState::Pending
        {
            return Err(Error::RequestRejected);
        }

        let outgoing = self
            .streams
            .values()
            .filter(|s| s.ty() == Some(stream::Type::Request) && s.is_local())
            .count() as u64;

        if outgoing >= self.max_concurrent_outgoing {
            return Err(Error::StreamBlocked);
        }

        let stream_id = match t.open_bidi() {
            Ok(v) => v,

            Err(transport::Error::StreamLimit) |
            Err(transport::Error::Done) => return Err(Error::StreamBlocked),

            Err(e) => return Err(e.into()),
        };

        let mut s = Stream::new_request(stream_id, true, self.dialect);

        if !self.dialect.is_framed() {
            s.h1 = Some(h1::Codec::response_parser());
        }

        s.deadline = self.transaction_timeout.map(|v| Instant::now() + v);

        self.streams.insert(stream_id, s);
        self.idle_deadline = None;

        self.send_headers_on(t, stream_id, headers, fin)?;

        Ok(stream_id)
    }

    /// Sends response headers on the given stream with default priority.
    pub fn send_response<T: NameValue>(
        &mut self, t: &mut dyn Transport, stream_id: u64, headers: &[T],
        fin: bool,
    ) -> Result<()> {
        let priority = Default::default();

        self.send_response_with_priority(t, stream_id, headers, &priority, fin)
    }

    /// Sends response headers with the given priority.
    pub fn send_response_with_priority<T: NameValue>(
        &mut self, t: &mut dyn Transport, stream_id: u64, headers: &[T],
        priority: &Priority, fin: bool,
    ) -> Result<()> {
        self.ensure_open()?;

        let s = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::FrameUnexpected)?;

        if !matches!(s.ty(), Some(stream::Type::Request | stream::Type::Push))
        {
            return Err(Error::FrameUnexpected);
        }

        s.priority = *priority;

        let _ = t.stream_priority(
            stream_id,
            priority.urgency(),
            priority.incremental(),
        );

        self.send_headers_on(t, stream_id, headers, fin)
    }

    fn send_headers_on<T: NameValue>(
        &mut self, t: &mut dyn Transport, stream_id: u64, headers: &[T],
        fin: bool,
    ) -> Result<()> {
        let framed = self.dialect.is_framed();

        let payload = if framed {
            let headers_len = headers
                .iter()
                .fold(0, |acc, h| acc + h.value().len() + h.name().len() + 32);

            let mut header_block = vec![0; headers_len];
            let len = self
                .qpack_encoder
                .encode(headers, &mut header_block)
                .map_err(|_| Error::InternalError)?;
            header_block.truncate(len);

            let frame = frame::Frame::Headers { header_block };

            let mut d = vec![0; frame.wire_len() + 16];
            let mut b = octets::OctetsMut::with_slice(&mut d);
            let len = frame.to_bytes(&mut b)?;
            d.truncate(len);

            d
        } else {
            let close = self.dialect == Dialect::H1qV1 &&
                self.drain_state >= DrainState::Pending;

            let mut d = Vec::new();
            h1::Codec::encode_headers(headers, close, &mut d)?;

            d
        };

        let latched = !framed &&
            self.dialect == Dialect::H1qV1 &&
            self.drain_state >= DrainState::Pending;

        let partial_reliability = self.partial_reliability;

        let s = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::FrameUnexpected)?;

        if s.local_initialized() {
            return Err(Error::FrameUnexpected);
        }

        trace!(
            "tx HEADERS stream={} len={} fin={}",
            stream_id,
            payload.len(),
            fin
        );

        s.write_buf.append(payload);
        s.headers_end_offset = Some(s.queued_offset());
        s.goaway_latched = latched;
        s.initialize_local();

        if partial_reliability &&
            matches!(s.ty(), Some(stream::Type::Request | stream::Type::Push))
        {
            let mut tracker = crate::reliability::OffsetTracker::new();
            tracker.start_body(s.queued_offset())?;
            s.pr_egress = Some(tracker);
        }

        if fin {
            s.pending_eom = true;
        }

        self.schedule_egress(t, stream_id);

        Ok(())
    }

    /// Queues body bytes on the given stream.
    ///
    /// Returns the number of bytes accepted, which is capped by the
    /// stream's current flow-control window so back-pressure reaches the
    /// caller; [`Error::Done`] means nothing could be accepted yet.
    ///
    /// [`Error::Done`]: ../enum.Error.html#variant.Done
    pub fn send_body(
        &mut self, t: &mut dyn Transport, stream_id: u64, body: &[u8],
        fin: bool,
    ) -> Result<usize> {
        self.ensure_open()?;

        let framed = self.dialect.is_framed();
        let partial_reliability = self.partial_reliability;

        let stream_cap = t.capacity(stream_id).unwrap_or(0);

        let s = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::FrameUnexpected)?;

        if !s.local_initialized() || s.eom_sent || s.pending_eom {
            return Err(Error::FrameUnexpected);
        }

        // Avoid sending 0-length DATA frames when the fin flag is false.
        if body.is_empty() && !fin {
            return Err(Error::Done);
        }

        let unframed = !framed || partial_reliability;

        let overhead = if unframed {
            0
        } else {
            octets::varint_len(frame::DATA_FRAME_TYPE_ID) +
                octets::varint_len(body.len() as u64)
        };

        // Admit only what the current window plus what is already
        // buffered would let through; a zero budget defers the egress
        // signal entirely.
        let budget = stream_cap.saturating_sub(s.write_buf.len());
        let usable = budget.saturating_sub(overhead);

        let body_len = std::cmp::min(body.len(), usable);

        // If we can't queue the entire body, the fin must wait for the
        // rest.
        let fin = if body_len != body.len() { false } else { fin };

        if body_len == 0 && !fin {
            return Err(Error::Done);
        }

        if body_len > 0 {
            if s.first_body_offset.is_none() {
                s.first_body_offset =
                    Some(s.queued_offset() + overhead as u64);
            }

            if unframed {
                s.write_buf.append(body[..body_len].to_vec());
            } else {
                let frame = frame::Frame::Data {
                    payload: body[..body_len].to_vec(),
                };

                let mut d = vec![0; frame.wire_len() + 16];
                let mut b = octets::OctetsMut::with_slice(&mut d);
                let len = frame.to_bytes(&mut b)?;
                d.truncate(len);

                s.write_buf.append(d);
            }
        }

        trace!(
            "tx DATA stream={} len={} fin={}",
            stream_id,
            body_len,
            fin
        );

        if fin {
            s.pending_eom = true;
        }

        self.schedule_egress(t, stream_id);

        Ok(body_len)
    }

    /// Queues trailing headers, ending the message.
    pub fn send_trailers<T: NameValue>(
        &mut self, t: &mut dyn Transport, stream_id: u64, headers: &[T],
    ) -> Result<()> {
        self.ensure_open()?;

        if !self.dialect.is_framed() {
            return Err(Error::FrameUnexpected);
        }

        let headers_len = headers
            .iter()
            .fold(0, |acc, h| acc + h.value().len() + h.name().len() + 32);

        let mut header_block = vec![0; headers_len];
        let len = self
            .qpack_encoder
            .encode(headers, &mut header_block)
            .map_err(|_| Error::InternalError)?;
        header_block.truncate(len);

        let frame = frame::Frame::Headers { header_block };

        let mut d = vec![0; frame.wire_len() + 16];
        let mut b = octets::OctetsMut::with_slice(&mut d);
        let len = frame.to_bytes(&mut b)?;
        d.truncate(len);

        let s = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::FrameUnexpected)?;

        if !s.local_initialized() || s.eom_sent || s.pending_eom {
            return Err(Error::FrameUnexpected);
        }

        s.write_buf.append(d);
        s.pending_eom = true;

        self.schedule_egress(t, stream_id);

        Ok(())
    }

    /// Promises a push on the given request stream, returning the push
    /// id. Downstream and H3 only, bounded by the client's MAX_PUSH_ID.
    pub fn push_promise<T: NameValue>(
        &mut self, t: &mut dyn Transport, parent_stream_id: u64,
        headers: &[T],
    ) -> Result<u64> {
        self.ensure_open()?;

        if !self.is_server || self.dialect != Dialect::H3 {
            return Err(Error::WrongStream);
        }

        if self.max_push_id.map_or(true, |max| self.next_push_id > max) {
            return Err(Error::IdError);
        }

        match self.streams.get(&parent_stream_id) {
            Some(s)
                if s.ty() == Some(stream::Type::Request) && !s.eom_sent => {},

            _ => return Err(Error::FrameUnexpected),
        }

        let push_id = self.next_push_id;

        let headers_len = headers
            .iter()
            .fold(0, |acc, h| acc + h.value().len() + h.name().len() + 32);

        let mut header_block = vec![0; headers_len];
        let len = self
            .qpack_encoder
            .encode(headers, &mut header_block)
            .map_err(|_| Error::InternalError)?;
        header_block.truncate(len);

        let frame = frame::Frame::PushPromise {
            push_id,
            header_block,
        };

        let mut d = vec![0; frame.wire_len() + 16];
        let mut b = octets::OctetsMut::with_slice(&mut d);
        let len = frame.to_bytes(&mut b)?;
        d.truncate(len);

        let s = self
            .streams
            .get_mut(&parent_stream_id)
            .ok_or(Error::FrameUnexpected)?;

        s.write_buf.append(d);

        self.next_push_id += 1;

        self.schedule_egress(t, parent_stream_id);

        Ok(push_id)
    }

    /// Opens the unidirectional stream carrying a previously promised
    /// push. Respond on the returned stream id with `send_response()`
    /// and `send_body()`.
    pub fn open_push_stream(
        &mut self, t: &mut dyn Transport, push_id: u64,
    ) -> Result<u64> {
        self.ensure_open()?;

        if !self.is_server || self.dialect != Dialect::H3 {
            return Err(Error::WrongStream);
        }

        if push_id >= self.next_push_id {
            return Err(Error::IdError);
        }

        let stream_id = t.open_uni()?;

        let mut s =
            Stream::new_uni_egress(stream_id, stream::Type::Push, self.dialect);

        let mut d = [0; 16];
        let mut b = octets::OctetsMut::with_slice(&mut d);
        b.put_varint(stream::HTTP3_PUSH_STREAM_TYPE_ID)?;
        b.put_varint(push_id)?;
        let off = b.off();

        s.write_buf.append(d[..off].to_vec());
        s.push_id = Some(push_id);
        s.deadline = self.transaction_timeout.map(|v| Instant::now() + v);

        self.streams.insert(stream_id, s);
        self.push_ids_by_stream.insert(stream_id, push_id);
        self.idle_deadline = None;

        Ok(stream_id)
    }

    /// Aborts a transaction: resets egress, stops ingress, and drops
    /// everything buffered.
    pub fn send_abort(
        &mut self, t: &mut dyn Transport, stream_id: u64, e: Error,
    ) -> Result<()> {
        self.ensure_open()?;

        let code = e.to_wire();

        let s = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::FrameUnexpected)?;

        let _ = t.shutdown(stream_id, transport::Shutdown::Write, code);

        // Egress push streams have no ingress half to stop.
        let has_ingress =
            !(s.ty() == Some(stream::Type::Push) && s.is_local());

        if has_ingress {
            let _ = t.shutdown(stream_id, transport::Shutdown::Read, code);
        }

        s.aborted = true;
        s.write_buf.clear();
        s.pending_eom = false;
        s.delivery_refs = 0;

        self.unschedule(stream_id);
        self.maybe_reap(t, stream_id);

        Ok(())
    }

    /// Sends STOP_SENDING on a stream's ingress without touching egress.
    pub fn stop_sending(
        &mut self, t: &mut dyn Transport, stream_id: u64, e: Error,
    ) -> Result<()> {
        self.ensure_open()?;

        t.shutdown(stream_id, transport::Shutdown::Read, e.to_wire())?;

        Ok(())
    }

    /// Pauses delivery of ingress events for a stream.
    ///
    /// Pausing an egress push stream is a protocol misuse and drops the
    /// connection. Repeated pauses are no-ops.
    pub fn pause_ingress(
        &mut self, t: &mut dyn Transport, stream_id: u64,
    ) -> Result<()> {
        self.ensure_open()?;

        let s = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::FrameUnexpected)?;

        if s.ty() == Some(stream::Type::Push) && s.is_local() {
            let e = Error::WrongStream;
            self.drop_connection(t, e.to_wire());
            return Err(e);
        }

        s.pause_read();

        Ok(())
    }

    /// Resumes a paused stream; a no-op if it was not paused.
    pub fn resume_ingress(&mut self, stream_id: u64) -> Result<()> {
        self.ensure_open()?;

        let s = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::FrameUnexpected)?;

        if s.read_paused() {
            s.resume_read();
            self.pending_reads.insert(stream_id);
        }

        Ok(())
    }

    /// Declares egress body below `body_offset` expendable (partial
    /// reliability, sender side). Already-sent bytes stay sent; queued
    /// bytes below the offset are dropped.
    pub fn skip_body_to(
        &mut self, t: &mut dyn Transport, stream_id: u64, body_offset: u64,
    ) -> Result<()> {
        self.ensure_open()?;

        if !self.partial_reliability {
            return Err(Error::FrameUnexpected);
        }

        let s = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::FrameUnexpected)?;

        let res: Result<(u64, u64)> = (|| {
            let tracker = s.pr_egress.as_mut().ok_or(Error::OffsetError)?;

            tracker.advance(body_offset)?;

            Ok((tracker.body_to_stream(0)?, tracker.body_to_stream(body_offset)?))
        })();

        let (body_base, stream_offset) = match res {
            Ok(v) => v,

            Err(e) => {
                // Ill-ordered offsets abort the transaction.
                self.events
                    .push_back((stream_id, Event::Reset(e.to_wire())));
                let _ = self.send_abort(t, stream_id, e);

                return Err(e);
            },
        };

        // Never "unsend" wire-committed bytes, and never touch queued
        // head bytes: the queued body tail below the new offset is all
        // that may be dropped.
        if s.emitted >= body_base && stream_offset > s.emitted {
            let gap = (stream_offset - s.emitted) as usize;

            let trimmed = s.write_buf.trim_front(gap);
            s.bytes_skipped += gap as u64;
            s.emitted = stream_offset;

            trace!(
                "stream={} skipped {} queued bytes to offset {}",
                stream_id,
                trimmed,
                stream_offset
            );
        }

        t.send_data_expired(stream_id, stream_offset)?;

        self.sync_egress_state(t, stream_id);

        Ok(())
    }

    /// Rejects ingress body below `body_offset` (partial reliability,
    /// receiver side).
    pub fn reject_body_to(
        &mut self, t: &mut dyn Transport, stream_id: u64, body_offset: u64,
    ) -> Result<()> {
        self.ensure_open()?;

        if !self.partial_reliability {
            return Err(Error::FrameUnexpected);
        }

        let s = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::FrameUnexpected)?;

        let res = (|| {
            let tracker = s.pr_ingress.as_mut().ok_or(Error::OffsetError)?;

            tracker.advance(body_offset)?;

            tracker.body_to_stream(body_offset)
        })();

        let stream_offset = match res {
            Ok(v) => v,

            Err(e) => {
                self.events
                    .push_back((stream_id, Event::Reset(e.to_wire())));
                let _ = self.send_abort(t, stream_id, e);

                return Err(e);
            },
        };

        t.send_data_rejected(stream_id, stream_offset)?;

        Ok(())
    }

    /// Initiates graceful shutdown.
    ///
    /// On the control-stream dialects the server emits the first GOAWAY
    /// with the sentinel bound; the second GOAWAY follows once the first
    /// is acknowledged. On H1Q-v1 subsequent egress heads carry
    /// `Connection: close`.
    pub fn graceful_shutdown(&mut self, t: &mut dyn Transport) {
        if self.closed || self.drain_state != DrainState::None {
            return;
        }

        self.drain_state = DrainState::Pending;

        self.send_goaway(t);
        self.check_for_shutdown(t);
    }

    /// Drains like [`graceful_shutdown()`] and closes the connection as
    /// soon as no transactions remain.
    ///
    /// [`graceful_shutdown()`]: struct.Session.html#method.graceful_shutdown
    pub fn close_when_idle(&mut self, t: &mut dyn Transport) {
        if self.closed {
            return;
        }

        self.close_when_idle = true;

        self.graceful_shutdown(t);
        self.check_for_shutdown(t);
    }

    fn send_goaway(&mut self, t: &mut dyn Transport) {
        match self.dialect {
            Dialect::H1qV1 => {
                // Drain rides on each message's Connection: close; the
                // latch is applied as heads are encoded.
            },

            Dialect::H1qV2 | Dialect::H3 => {
                // Only the server originates GOAWAYs.
                if !self.is_server {
                    return;
                }

                if self.drain_state == DrainState::Done {
                    return;
                }

                let goaway_id = if self.drain_state <= DrainState::Pending {
                    GOAWAY_MAX_STREAM_ID
                } else {
                    self.max_seen_request_stream_id.unwrap_or(0)
                };

                let control_id = match self.control_stream_id {
                    Some(v) => v,

                    None => {
                        self.drain_state = DrainState::Done;
                        return;
                    },
                };

                if self
                    .queue_control_frame(
                        control_id,
                        &frame::Frame::GoAway { id: goaway_id },
                    )
                    .is_err()
                {
                    // Shortcut to shutdown.
                    error!("error generating GOAWAY");
                    self.drain_state = DrainState::Done;
                    return;
                }

                // The next drain step happens when every byte queued so
                // far, GOAWAY included, is delivered.
                let ack_offset = {
                    let s = match self.streams.get_mut(&control_id) {
                        Some(v) => v,
                        None => return,
                    };

                    let base = t
                        .write_offset(control_id)
                        .unwrap_or(s.emitted)
                        .saturating_add(
                            t.write_buffered(control_id).unwrap_or(0),
                        );

                    let off = base + s.write_buf.len() as u64;

                    s.delivery_refs += 1;

                    off
                };

                if t.register_delivery(control_id, ack_offset).is_err() {
                    error!("error registering GOAWAY delivery");
                    self.drain_state = DrainState::Done;
                    return;
                }

                trace!(
                    "tx GOAWAY max_stream_id={} ack_offset={}",
                    goaway_id,
                    ack_offset
                );

                self.goaway_ack_offset = Some(ack_offset);
                self.local_goaway_id = Some(goaway_id);

                self.drain_state = if self.drain_state <= DrainState::Pending {
                    DrainState::FirstGoaway
                } else {
                    DrainState::SecondGoaway
                };
            },
        }
    }

    /// Forcibly errors every transaction and closes the transport.
    /// Idempotent and safe to call from anywhere.
    pub fn drop_connection(&mut self, t: &mut dyn Transport, code: u64) {
        if self.dropping || self.closed {
            return;
        }

        self.dropping = true;

        let ids: Vec<u64> = self
            .streams
            .iter()
            .filter(|(_, s)| {
                matches!(
                    s.ty(),
                    Some(stream::Type::Request | stream::Type::Push)
                )
            })
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            self.events.push_back((id, Event::Reset(code)));
        }

        self.streams.clear();
        self.pending_reads.clear();
        self.blocked_streams.clear();
        self.fc_blocked.clear();
        self.promised_pushes.clear();
        self.nascent_pushes.clear();

        let _ = t.close(code, b"dropped");

        self.drain_state = DrainState::Done;
        self.closed = true;
        self.dropping = false;
    }

    /// Queues a connection drop to be performed at the next poll entry,
    /// for errors discovered mid-iteration that must not tear the
    /// session down in place.
    pub fn drop_connection_on_next_poll(&mut self, code: u64, e: Error) {
        if self.pending_drop.is_none() {
            self.pending_drop = Some((code, e));
        }
    }

    fn fatal(
        &mut self, t: &mut dyn Transport, e: Error, reason: &[u8],
    ) -> Error {
        error!(
            "connection error {:?}: {}",
            e,
            String::from_utf8_lossy(reason)
        );

        self.drop_connection(t, e.to_wire());

        e
    }

    /// Processes buffered ingress and returns the next event.
    ///
    /// Events are edge-triggered. [`Error::Done`] means the session is
    /// quiescent for now.
    ///
    /// [`Error::Done`]: ../enum.Error.html#variant.Done
    pub fn poll(&mut self, t: &mut dyn Transport) -> Result<(u64, Event)> {
        // A drop queued during the previous iteration wins over
        // everything else.
        if let Some((code, e)) = self.pending_drop.take() {
            self.drop_connection(t, code);
            return Err(e);
        }

        if self.closed {
            if let Some(ev) = self.events.pop_front() {
                return Ok(ev);
            }

            return Err(Error::Done);
        }

        // Critical streams first.
        self.process_control_streams(t)?;

        if let Some(ev) = self.events.pop_front() {
            return Ok(ev);
        }

        // Readable sweep, bounded by the reads budget.
        self.sweep_readable(t)?;

        if let Some(ev) = self.events.pop_front() {
            return Ok(ev);
        }

        Err(Error::Done)
    }

    fn process_control_streams(&mut self, t: &mut dyn Transport) -> Result<()> {
        let critical: SmallVec<[u64; 4]> = [
            self.peer_control_stream_id,
            self.peer_qpack_streams.encoder_stream_id,
            self.peer_qpack_streams.decoder_stream_id,
        ]
        .iter()
        .flatten()
        .copied()
        .collect();

        for id in critical {
            if t.finished(id) {
                return Err(self.fatal(
                    t,
                    Error::ClosedCriticalStream,
                    b"Critical stream closed.",
                ));
            }

            match self.process_readable_stream(t, id) {
                Ok(()) => (),

                Err(Error::Done) => (),

                Err(e) => return Err(e),
            }

            if t.finished(id) {
                return Err(self.fatal(
                    t,
                    Error::ClosedCriticalStream,
                    b"Critical stream closed.",
                ));
            }
        }

        Ok(())
    }

    fn sweep_readable(&mut self, t: &mut dyn Transport) -> Result<()> {
        let mut candidates: Vec<u64> =
            std::mem::take(&mut self.pending_reads).into_iter().collect();

        for id in t.readable() {
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }

        let mut reads = 0;

        for (i, &id) in candidates.iter().enumerate() {
            if self.closed {
                break;
            }

            // Critical streams are handled before the sweep.
            if Some(id) == self.peer_control_stream_id ||
                Some(id) == self.peer_qpack_streams.encoder_stream_id ||
                Some(id) == self.peer_qpack_streams.decoder_stream_id
            {
                continue;
            }

            if self.ignored_streams.contains(&id) {
                continue;
            }

            // New peer-initiated stream?
            if !self.streams.contains_key(&id) {
                if transport::is_local(id, self.is_server) {
                    continue;
                }

                if !self.check_new_stream(t, id)? {
                    continue;
                }
            }

            if let Some(s) = self.streams.get(&id) {
                if s.read_paused() || s.push_parked || s.blocked.is_some() {
                    continue;
                }
            } else {
                continue;
            }

            let is_transaction = self.streams.get(&id).map_or(false, |s| {
                matches!(
                    s.ty(),
                    Some(stream::Type::Request | stream::Type::Push)
                )
            });

            if is_transaction {
                if reads >= MAX_READS_PER_LOOP {
                    // Defer the rest to the next sweep.
                    self.pending_reads
                        .extend(candidates[i..].iter().copied());
                    break;
                }

                reads += 1;
            }

            match self.process_readable_stream(t, id) {
                Ok(()) | Err(Error::Done) => (),

                Err(e) => return Err(e),
            }

            self.finish_ingress(t, id);
        }

        Ok(())
    }

    /// Applies the dialect's stream acceptance policy to a new
    /// peer-initiated stream. Returns whether a stream object now
    /// exists.
    fn check_new_stream(
        &mut self, t: &mut dyn Transport, id: u64,
    ) -> Result<bool> {
        let bidi = transport::is_bidi(id);

        match self.dialect {
            Dialect::H1qV1 => {
                // Reject all unidirectional streams and all
                // server-initiated streams.
                if !bidi || transport::is_server_initiated(id) {
                    self.reject_stream(t, id, wire::HTTP_WRONG_STREAM);
                    return Ok(false);
                }
            },

            Dialect::H1qV2 | Dialect::H3 => {
                // Reject all bidirectional, server-initiated streams.
                if bidi && transport::is_server_initiated(id) {
                    self.reject_stream(t, id, wire::HTTP_WRONG_STREAM);
                    return Ok(false);
                }

                // Cancel any stream that is out of the range allowed by
                // GOAWAY. The bound is asymmetric: upstream compares
                // against the peer-advertised id, downstream against
                // the largest peer id already seen, since streams may
                // arrive out of order below it.
                if self.drain_state != DrainState::None {
                    let rejected = if !self.is_server {
                        self.peer_goaway_id.map_or(false, |max| id > max)
                    } else {
                        bidi &&
                            self.max_seen_request_stream_id
                                .map_or(false, |max| id > max)
                    };

                    if rejected {
                        self.reject_stream(
                            t,
                            id,
                            wire::HTTP_REQUEST_REJECTED,
                        );
                        return Ok(false);
                    }
                }

                if !bidi {
                    return self.dispatch_uni_preface(t, id);
                }
            },
        }

        // A new peer request stream.
        let mut s = Stream::new_request(id, false, self.dialect);

        if !self.dialect.is_framed() {
            s.h1 = Some(if self.is_server {
                h1::Codec::request_parser()
            } else {
                h1::Codec::response_parser()
            });
        }

        s.deadline = self.transaction_timeout.map(|v| Instant::now() + v);

        self.streams.insert(id, s);
        self.idle_deadline = None;

        if self.is_server {
            self.max_seen_request_stream_id = Some(
                self.max_seen_request_stream_id
                    .map_or(id, |max| max.max(id)),
            );
        }

        Ok(true)
    }

    /// Reads the preface of a peer unidirectional stream without
    /// consuming more than it, then hands the stream to its handler.
    fn dispatch_uni_preface(
        &mut self, t: &mut dyn Transport, id: u64,
    ) -> Result<bool> {
        let mut buf = [0; 24];

        let (n, _fin) = match t.peek(id, &mut buf) {
            Ok(v) => v,

            Err(transport::Error::Done) => return Ok(false),

            Err(e) => return Err(e.into()),
        };

        if n == 0 {
            return Ok(false);
        }

        let ty_len = octets::varint_parse_len(buf[0]);

        if n < ty_len {
            // Not enough of the preface yet.
            return Ok(false);
        }

        let mut b = octets::Octets::with_slice(&buf[..n]);
        let ty_val = b.get_varint()?;

        let ty = stream::Type::deserialize(ty_val, self.dialect);

        trace!("new uni stream {} preface={:#x} {:?}", id, ty_val, ty);

        match ty {
            stream::Type::Unknown => {
                // Includes grease: refuse politely and forget.
                let _ = t.shutdown(
                    id,
                    transport::Shutdown::Read,
                    wire::HTTP_UNKNOWN_STREAM_TYPE,
                );

                self.ignored_streams.insert(id);

                Ok(false)
            },

            stream::Type::Push => {
                if self.is_server {
                    return Err(self.fatal(
                        t,
                        Error::WrongStream,
                        b"Server received push stream.",
                    ));
                }

                // The PushId varint follows the preface.
                let push_id = match b.get_varint() {
                    Ok(v) => v,

                    // Wait for the rest of the PushId.
                    Err(_) => return Ok(false),
                };

                let consumed = b.off();

                let mut scratch = vec![0; consumed];
                t.recv(id, &mut scratch).map_err(Error::from)?;

                self.accept_nascent_push(t, id, push_id)?;

                Ok(true)
            },

            ty => {
                // Consume the preface and register the typed stream.
                let mut scratch = vec![0; ty_len];
                t.recv(id, &mut scratch).map_err(Error::from)?;

                self.accept_typed_stream(t, id, ty)?;

                Ok(true)
            },
        }
    }

    fn accept_typed_stream(
        &mut self, t: &mut dyn Transport, id: u64, ty: stream::Type,
    ) -> Result<()> {
        let duplicate = match ty {
            stream::Type::Control => self.peer_control_stream_id.is_some(),
            stream::Type::QpackEncoder =>
                self.peer_qpack_streams.encoder_stream_id.is_some(),
            stream::Type::QpackDecoder =>
                self.peer_qpack_streams.decoder_stream_id.is_some(),

            _ => return Err(Error::InternalError),
        };

        // Only one stream per typed role may exist.
        if duplicate {
            return Err(self.fatal(
                t,
                Error::WrongStreamCount,
                b"Received multiple typed streams",
            ));
        }

        match ty {
            stream::Type::Control => self.peer_control_stream_id = Some(id),
            stream::Type::QpackEncoder =>
                self.peer_qpack_streams.encoder_stream_id = Some(id),
            stream::Type::QpackDecoder =>
                self.peer_qpack_streams.decoder_stream_id = Some(id),

            _ => unreachable!(),
        }

        trace!("open peer typed stream {} ({:?})", id, ty);

        self.streams
            .insert(id, Stream::new_uni_ingress(id, ty, self.dialect));

        Ok(())
    }

    fn accept_nascent_push(
        &mut self, t: &mut dyn Transport, id: u64, push_id: u64,
    ) -> Result<()> {
        // PushId ↔ stream id is a bimap; a reused push id is fatal.
        if self.nascent_pushes.contains_key(&push_id) ||
            self.push_ids_by_stream.values().any(|p| *p == push_id)
        {
            return Err(self.fatal(t, Error::IdError, b"Reused push ID"));
        }

        let mut s = Stream::new_uni_ingress(id, stream::Type::Push, self.dialect);
        s.push_id = Some(push_id);
        s.deadline = self.transaction_timeout.map(|v| Instant::now() + v);

        self.push_ids_by_stream.insert(id, push_id);
        self.idle_deadline = None;

        if self.promised_pushes.contains_key(&push_id) {
            self.streams.insert(id, s);
            self.bind_push(id, push_id);
        } else {
            // Hold the stream until its promise arrives.
            s.push_parked = true;
            self.streams.insert(id, s);
            self.nascent_pushes.insert(push_id, id);

            trace!("push stream {} parked awaiting promise {}", id, push_id);
        }

        Ok(())
    }

    fn bind_push(&mut self, stream_id: u64, push_id: u64) {
        self.promised_pushes.remove(&push_id);
        self.nascent_pushes.remove(&push_id);

        if let Some(s) = self.streams.get_mut(&stream_id) {
            s.push_parked = false;
        }

        self.events
            .push_back((stream_id, Event::PushBound { push_id }));
        self.pending_reads.insert(stream_id);

        trace!("push {} bound to stream {}", push_id, stream_id);
    }

    fn reject_stream(&mut self, t: &mut dyn Transport, id: u64, code: u64) {
        trace!("rejecting stream {} with {:#x}", id, code);

        let _ = t.shutdown(id, transport::Shutdown::Read, code);
        let _ = t.shutdown(id, transport::Shutdown::Write, code);

        self.ignored_streams.insert(id);
    }

    fn process_readable_stream(
        &mut self, t: &mut dyn Transport, id: u64,
    ) -> Result<()> {
        // We need to get a fresh reference to the stream for each
        // iteration, because frame processing below needs to borrow the
        // session again.
        while let Some(s) = self.streams.get_mut(&id) {
            if s.blocked.is_some() {
                break;
            }

            match s.state() {
                stream::State::FrameType => {
                    s.try_fill_buffer(t)?;

                    let varint = match s.try_consume_varint() {
                        Ok(v) => v,

                        Err(_) => continue,
                    };

                    if let Err(e) = s.set_frame_type(varint) {
                        return Err(self.fatal(
                            t,
                            e,
                            b"Error handling frame type.",
                        ));
                    }
                },

                stream::State::FramePayloadLen => {
                    s.try_fill_buffer(t)?;

                    let payload_len = match s.try_consume_varint() {
                        Ok(v) => v,

                        Err(_) => continue,
                    };

                    if Some(frame::DATA_FRAME_TYPE_ID) == s.frame_type() {
                        trace!(
                            "rx frm DATA stream={} wire_payload_len={}",
                            id,
                            payload_len
                        );
                    }

                    if let Err(e) = s.set_frame_payload_len(payload_len) {
                        return Err(self.fatal(t, e, b"Malformed frame."));
                    }
                },

                stream::State::FramePayload => {
                    s.try_fill_buffer(t)?;

                    let (frame, payload_len) = match s.try_consume_frame() {
                        Ok(frame) => frame,

                        Err(Error::Done) => return Err(Error::Done),

                        Err(e) =>
                            return Err(self.fatal(
                                t,
                                e,
                                b"Error handling frame.",
                            )),
                    };

                    self.process_frame(t, id, frame, payload_len)?;
                },

                stream::State::Data => {
                    if !s.try_trigger_data_event() {
                        break;
                    }

                    self.events.push_back((id, Event::Data));

                    break;
                },

                stream::State::QpackInstruction => {
                    self.process_qpack_stream(t, id)?;

                    break;
                },

                stream::State::Message => {
                    self.process_message_stream(t, id)?;

                    break;
                },

                stream::State::Drain => {
                    // Discard incoming data on the stream.
                    let _ = t.shutdown(
                        id,
                        transport::Shutdown::Read,
                        wire::HTTP_NO_ERROR,
                    );

                    break;
                },

                stream::State::Finished => break,

                stream::State::StreamType | stream::State::PushId => {
                    // Prefaces are consumed by the dispatcher before a
                    // stream object exists.
                    return Err(Error::InternalError);
                },
            }
        }

        Ok(())
    }

    /// Post-read bookkeeping: fires the end-of-message gate and flags
    /// data past the end of the message.
    fn finish_ingress(&mut self, t: &mut dyn Transport, id: u64) {
        let finished = t.finished(id);

        let Some(s) = self.streams.get_mut(&id) else {
            return;
        };

        if !matches!(s.ty(), Some(stream::Type::Request | stream::Type::Push))
        {
            return;
        }

        if finished && !s.codec_complete() {
            if s.headers_received && s.at_frame_boundary() {
                s.mark_codec_complete();
            } else if s.blocked.is_none() {
                // FIN truncated the message.
                self.events.push_back((
                    id,
                    Event::Reset(wire::HTTP_GENERAL_PROTOCOL_ERROR),
                ));

                let _ = self.send_abort(t, id, Error::MessageError);

                return;
            }
        }

        if let Some(s) = self.streams.get_mut(&id) {
            if s.fire_eom_gate(finished) {
                s.finished();
                self.events.push_back((id, Event::Finished));
            }
        }

        self.maybe_reap(t, id);
    }

    fn process_qpack_stream(
        &mut self, t: &mut dyn Transport, id: u64,
    ) -> Result<()> {
        let is_encoder_stream =
            Some(id) == self.peer_qpack_streams.encoder_stream_id;

        let mut d = [0; 4096];
        let mut inserts = 0;

        loop {
            let (n, _fin) = match t.recv(id, &mut d) {
                Ok(v) => v,

                Err(transport::Error::Done) => break,

                Err(e) => return Err(e.into()),
            };

            if n == 0 {
                break;
            }

            if let Some(s) = self.streams.get_mut(&id) {
                s.ingress_offset += n as u64;
            }

            let res = if is_encoder_stream {
                self.qpack_decoder.on_encoder_instruction(&d[..n])
            } else {
                self.qpack_encoder
                    .on_decoder_instruction(&d[..n])
                    .map(|_| 0)
            };

            match res {
                Ok(v) => inserts += v,

                Err(_) =>
                    return Err(self.fatal(
                        t,
                        Error::QpackDecompressionFailed,
                        b"Malformed QPACK instruction.",
                    )),
            }
        }

        if inserts > 0 {
            self.retry_blocked_streams(t)?;
        }

        Ok(())
    }

    /// Re-attempts header decoding for streams parked on missing QPACK
    /// inserts.
    fn retry_blocked_streams(&mut self, t: &mut dyn Transport) -> Result<()> {
        let parked: Vec<u64> =
            std::mem::take(&mut self.blocked_streams).into_iter().collect();

        for id in parked {
            let Some(s) = self.streams.get_mut(&id) else {
                continue;
            };

            let Some(block) = s.blocked.take() else {
                continue;
            };

            let raw = match &block {
                PendingBlock::Headers(b) |
                PendingBlock::Trailers(b) |
                PendingBlock::Promise(_, b) => b.clone(),
            };

            let max_size = self
                .local_settings
                .max_header_list_size
                .unwrap_or(u64::MAX);

            match self.qpack_decoder.decode(&raw, max_size) {
                Ok(list) => {
                    match block {
                        PendingBlock::Headers(_) => {
                            let has_body = !t.finished(id);
                            self.deliver_headers(t, id, list, has_body)?;
                        },

                        PendingBlock::Trailers(_) => {
                            self.events
                                .push_back((id, Event::Trailers { list }));
                        },

                        PendingBlock::Promise(push_id, _) => {
                            self.deliver_push_promise(id, push_id, list);
                        },
                    }

                    // Resume parsing whatever queued up behind the
                    // blocked section.
                    self.pending_reads.insert(id);
                    self.finish_ingress(t, id);
                },

                Err(qpack::Error::Blocked) => {
                    if let Some(s) = self.streams.get_mut(&id) {
                        s.blocked = Some(block);
                    }
                    self.blocked_streams.insert(id);
                },

                Err(qpack::Error::HeaderListTooLarge) => {
                    return Err(self.fatal(
                        t,
                        Error::ExcessiveLoad,
                        b"Header list too large.",
                    ));
                },

                Err(_) => {
                    return Err(self.fatal(
                        t,
                        Error::QpackDecompressionFailed,
                        b"Error parsing headers.",
                    ));
                },
            }
        }

        Ok(())
    }

    fn process_message_stream(
        &mut self, t: &mut dyn Transport, id: u64,
    ) -> Result<()> {
        let mut d = [0; 4096];

        loop {
            let (n, fin) = match t.recv(id, &mut d) {
                Ok(v) => v,

                Err(transport::Error::Done) => break,

                Err(e) => return Err(e.into()),
            };

            let Some(s) = self.streams.get_mut(&id) else {
                break;
            };

            s.ingress_offset += n as u64;

            let mut h1_events = Vec::new();

            let Some(codec) = s.h1.as_mut() else {
                return Err(Error::InternalError);
            };

            let consumed = match codec.decode(&d[..n], fin, &mut h1_events) {
                Ok(v) => v,

                Err(_) => {
                    self.events.push_back((
                        id,
                        Event::Reset(wire::HTTP_GENERAL_PROTOCOL_ERROR),
                    ));

                    let _ = self.send_abort(t, id, Error::MessageError);

                    return Ok(());
                },
            };

            let mut data_ready = false;
            let mut saw_headers = None;

            for ev in h1_events {
                match ev {
                    h1::Event::Headers { list, has_body } => {
                        s.headers_received = true;
                        saw_headers = Some((list, has_body));
                    },

                    h1::Event::Body { data } => {
                        s.h1_body.extend(data);
                        data_ready = true;
                    },

                    h1::Event::Complete => {
                        s.mark_codec_complete();
                    },
                }
            }

            let close_seen =
                s.h1.as_ref().map_or(false, |c| c.saw_connection_close());

            let completed =
                s.h1.as_ref().map_or(false, |c| c.message_complete());

            if let Some((list, has_body)) = saw_headers {
                self.events
                    .push_back((id, Event::Headers { list, has_body }));
            }

            if data_ready && s.try_trigger_data_event() {
                self.events.push_back((id, Event::Data));
            }

            if close_seen {
                self.on_peer_close_marker();
            }

            // Bytes left over after the message completed are a
            // protocol error.
            if completed && consumed < n {
                self.events.push_back((
                    id,
                    Event::Reset(wire::HTTP_GENERAL_PROTOCOL_ERROR),
                ));

                let _ = self.send_abort(t, id, Error::GeneralProtocolError);

                return Ok(());
            }

            if n < d.len() {
                break;
            }
        }

        Ok(())
    }

    /// The peer's `Connection: close` marker advances the H1Q-v1 drain
    /// walk.
    fn on_peer_close_marker(&mut self) {
        if self.dialect != Dialect::H1qV1 {
            return;
        }

        self.drain_state = match self.drain_state {
            DrainState::None | DrainState::Pending => DrainState::CloseReceived,

            DrainState::CloseSent => DrainState::Done,

            other => other,
        };
    }

    fn process_frame(
        &mut self, t: &mut dyn Transport, stream_id: u64, frame: frame::Frame,
        payload_len: u64,
    ) -> Result<()> {
        trace!(
            "rx frm {:?} stream={} payload_len={}",
            frame,
            stream_id,
            payload_len
        );

        match frame {
            frame::Frame::Settings {
                header_table_size,
                max_header_list_size,
                qpack_blocked_streams,
                num_placeholders,
                raw,
                ..
            } => {
                // The per-stream state machine only admits SETTINGS on
                // the H3 control stream, exactly once.
                self.peer_settings = Some(Settings {
                    header_table_size,
                    max_header_list_size,
                    qpack_blocked_streams,
                    // Parsed but deliberately not enforced.
                    num_placeholders,
                    raw,
                });

                // The peer's table size caps our encoder.
                self.qpack_encoder
                    .set_max_table_capacity(header_table_size.unwrap_or(0));
            },

            frame::Frame::Headers { header_block } => {
                self.process_headers_frame(t, stream_id, header_block)?;
            },

            frame::Frame::Data { .. } => {
                // DATA payloads are consumed in the Data state; a frame
                // object only materializes for zero-length payloads.
            },

            frame::Frame::GoAway { id } => {
                self.process_goaway(t, stream_id, id)?;
            },

            frame::Frame::MaxPushId { push_id } => {
                if Some(stream_id) != self.peer_control_stream_id {
                    return Err(self.fatal(
                        t,
                        Error::FrameUnexpected,
                        b"MAX_PUSH_ID received on non-control stream",
                    ));
                }

                if !self.is_server {
                    return Err(self.fatal(
                        t,
                        Error::FrameUnexpected,
                        b"MAX_PUSH_ID received by client",
                    ));
                }

                if self.max_push_id.map_or(false, |max| push_id < max) {
                    return Err(self.fatal(
                        t,
                        Error::IdError,
                        b"MAX_PUSH_ID reduced limit",
                    ));
                }

                self.max_push_id = Some(push_id);
            },

            frame::Frame::PushPromise {
                push_id,
                header_block,
            } => {
                self.process_push_promise(t, stream_id, push_id, header_block)?;
            },

            frame::Frame::CancelPush { push_id } => {
                if Some(stream_id) != self.peer_control_stream_id {
                    return Err(self.fatal(
                        t,
                        Error::FrameUnexpected,
                        b"CANCEL_PUSH received on non-control stream",
                    ));
                }

                self.process_cancel_push(t, push_id)?;
            },

            frame::Frame::Unknown { .. } => (),
        }

        Ok(())
    }

    fn process_headers_frame(
        &mut self, t: &mut dyn Transport, stream_id: u64, header_block: Vec<u8>,
    ) -> Result<()> {
        let max_size = self
            .local_settings
            .max_header_list_size
            .unwrap_or(u64::MAX);

        let is_trailers = self
            .streams
            .get(&stream_id)
            .map_or(false, |s| s.headers_received);

        if self
            .streams
            .get(&stream_id)
            .map_or(false, |s| s.trailers_received)
        {
            return Err(self.fatal(
                t,
                Error::FrameUnexpected,
                b"HEADERS after trailers",
            ));
        }

        match self.qpack_decoder.decode(&header_block, max_size) {
            Ok(list) =>
                if is_trailers {
                    if let Some(s) = self.streams.get_mut(&stream_id) {
                        s.trailers_received = true;
                    }

                    self.events.push_back((stream_id, Event::Trailers { list }));
                } else {
                    let has_body = !t.finished(stream_id);

                    self.deliver_headers(t, stream_id, list, has_body)?;
                },

            Err(qpack::Error::Blocked) => {
                let limit = self.qpack_decoder.max_blocked_streams();

                if (self.blocked_streams.len() as u64) >= limit {
                    return Err(self.fatal(
                        t,
                        Error::ExcessiveLoad,
                        b"Too many blocked streams",
                    ));
                }

                trace!("stream {} blocked on QPACK inserts", stream_id);

                if let Some(s) = self.streams.get_mut(&stream_id) {
                    s.blocked = Some(if is_trailers {
                        PendingBlock::Trailers(header_block)
                    } else {
                        PendingBlock::Headers(header_block)
                    });
                }

                self.blocked_streams.insert(stream_id);
            },

            Err(qpack::Error::HeaderListTooLarge) => {
                return Err(self.fatal(
                    t,
                    Error::ExcessiveLoad,
                    b"Header list too large.",
                ));
            },

            Err(_) => {
                return Err(self.fatal(
                    t,
                    Error::QpackDecompressionFailed,
                    b"Error parsing headers.",
                ));
            },
        }

        Ok(())
    }

    fn deliver_headers(
        &mut self, _t: &mut dyn Transport, stream_id: u64, list: Vec<Header>,
        has_body: bool,
    ) -> Result<()> {
        let partial_reliability = self.partial_reliability;

        let mut expired = None;

        if let Some(s) = self.streams.get_mut(&stream_id) {
            s.headers_received = true;

            // In partially-reliable mode the body follows the head
            // unframed; anchor the offset map here.
            if partial_reliability &&
                matches!(
                    s.ty(),
                    Some(stream::Type::Request | stream::Type::Push)
                )
            {
                let mut tracker = crate::reliability::OffsetTracker::new();
                tracker.start_body(s.ingress_offset)?;

                // An expired signal may have beaten the head here.
                if let Some(off) = s.pending_expired.take() {
                    expired = tracker.stream_to_body(off).ok();
                }

                s.pr_ingress = Some(tracker);

                s.start_unframed_body()?;
            }
        }

        self.events
            .push_back((stream_id, Event::Headers { list, has_body }));

        if let Some(off) = expired {
            self.events.push_back((stream_id, Event::DataExpired(off)));
        }

        Ok(())
    }

    fn process_goaway(
        &mut self, t: &mut dyn Transport, stream_id: u64, id: u64,
    ) -> Result<()> {
        if Some(stream_id) != self.peer_control_stream_id {
            return Err(self.fatal(
                t,
                Error::FrameUnexpected,
                b"GOAWAY received on non-control stream",
            ));
        }

        // Only servers originate GOAWAY on these dialects.
        if self.is_server {
            return Err(self.fatal(
                t,
                Error::FrameUnexpected,
                b"GOAWAY received by server",
            ));
        }

        if let Some(received_id) = self.peer_goaway_id {
            if id > received_id {
                return Err(self.fatal(
                    t,
                    Error::IdError,
                    b"GOAWAY with ID larger than previously received",
                ));
            }
        }

        self.peer_goaway_id = Some(id);

        self.drain_state = match self.drain_state {
            DrainState::None | DrainState::Pending => DrainState::FirstGoaway,

            DrainState::FirstGoaway => DrainState::Done,

            other => other,
        };

        // Abort locally-initiated streams above the bound; they were
        // never processed and are safe to retry elsewhere.
        let doomed: Vec<u64> = self
            .streams
            .iter()
            .filter(|(sid, s)| {
                s.ty() == Some(stream::Type::Request) &&
                    s.is_local() &&
                    **sid > id
            })
            .map(|(sid, _)| *sid)
            .collect();

        for sid in doomed {
            self.events
                .push_back((sid, Event::Reset(wire::HTTP_REQUEST_REJECTED)));

            let _ = self.send_abort(t, sid, Error::RequestCancelled);
        }

        self.events.push_back((stream_id, Event::GoAway(id)));

        self.check_for_shutdown(t);

        Ok(())
    }

    fn process_push_promise(
        &mut self, t: &mut dyn Transport, stream_id: u64, push_id: u64,
        header_block: Vec<u8>,
    ) -> Result<()> {
        if self.is_server {
            return Err(self.fatal(
                t,
                Error::FrameUnexpected,
                b"PUSH_PROMISE received by server",
            ));
        }

        if !transport::is_bidi(stream_id) {
            return Err(self.fatal(
                t,
                Error::FrameUnexpected,
                b"PUSH_PROMISE received on non-request stream",
            ));
        }

        if self.max_push_id.map_or(true, |max| push_id > max) {
            return Err(self.fatal(
                t,
                Error::IdError,
                b"PUSH_PROMISE beyond advertised MAX_PUSH_ID",
            ));
        }

        // A promise may arrive for a nascent stream, but never for a
        // push id already promised or bound.
        let nascent = self.nascent_pushes.contains_key(&push_id);

        let duplicate = self.promised_pushes.contains_key(&push_id) ||
            (!nascent &&
                self.push_ids_by_stream.values().any(|p| *p == push_id));

        if duplicate {
            let _ = t.close(
                wire::HTTP_MALFORMED_FRAME_PUSH_PROMISE,
                b"Duplicate push promise",
            );
            self.closed = true;

            return Err(Error::IdError);
        }

        let max_size = self
            .local_settings
            .max_header_list_size
            .unwrap_or(u64::MAX);

        match self.qpack_decoder.decode(&header_block, max_size) {
            Ok(list) => {
                self.deliver_push_promise(stream_id, push_id, list);
            },

            Err(qpack::Error::Blocked) => {
                if let Some(s) = self.streams.get_mut(&stream_id) {
                    s.blocked =
                        Some(PendingBlock::Promise(push_id, header_block));
                }

                self.blocked_streams.insert(stream_id);
            },

            Err(_) => {
                let _ = t.close(
                    wire::HTTP_MALFORMED_FRAME_PUSH_PROMISE,
                    b"Malformed push promise",
                );
                self.closed = true;

                return Err(Error::QpackDecompressionFailed);
            },
        }

        Ok(())
    }

    fn deliver_push_promise(
        &mut self, parent_stream_id: u64, push_id: u64, list: Vec<Header>,
    ) {
        self.promised_pushes.insert(push_id, PromisedPush {
            parent_stream_id,
            deadline: self.transaction_timeout.map(|v| Instant::now() + v),
        });

        self.events.push_back((parent_stream_id, Event::PushPromise {
            push_id,
            list,
        }));

        if let Some(&sid) = self.nascent_pushes.get(&push_id) {
            self.bind_push(sid, push_id);
        }
    }

    fn process_cancel_push(
        &mut self, t: &mut dyn Transport, push_id: u64,
    ) -> Result<()> {
        if self.is_server {
            // The client is no longer interested: forget the promise.
            if push_id >= self.next_push_id {
                return Err(self.fatal(
                    t,
                    Error::IdError,
                    b"CANCEL_PUSH for unpromised push",
                ));
            }

            return Ok(());
        }

        // The server can only cancel pushes inside the id budget we
        // advertised, same as when it promises them.
        if self.max_push_id.map_or(true, |max| push_id > max) {
            return Err(self.fatal(
                t,
                Error::IdError,
                b"CANCEL_PUSH beyond advertised MAX_PUSH_ID",
            ));
        }

        if let Some(promise) = self.promised_pushes.remove(&push_id) {
            self.events.push_back((
                promise.parent_stream_id,
                Event::PushCanceled { push_id },
            ));
        }

        if let Some(sid) = self.nascent_pushes.remove(&push_id) {
            let _ = t.shutdown(
                sid,
                transport::Shutdown::Read,
                wire::HTTP_REQUEST_CANCELLED,
            );

            self.push_ids_by_stream.remove(&sid);
            self.streams.remove(&sid);
        }

        Ok(())
    }

    /// Reads request or response body data into the provided buffer.
    ///
    /// Call whenever [`poll()`] returns a [`Data`] event; the event
    /// re-arms once all buffered data is read.
    ///
    /// [`poll()`]: struct.Session.html#method.poll
    /// [`Data`]: enum.Event.html#variant.Data
    pub fn recv_body(
        &mut self, t: &mut dyn Transport, stream_id: u64, out: &mut [u8],
    ) -> Result<usize> {
        self.ensure_open()?;

        let mut total = 0;

        if !self.dialect.is_framed() {
            // HTTP/1.1 bodies were already decoded into the stream's
            // buffer.
            let s = self
                .streams
                .get_mut(&stream_id)
                .ok_or(Error::Done)?;

            while total < out.len() {
                match s.h1_body.pop_front() {
                    Some(b) => {
                        out[total] = b;
                        total += 1;
                    },

                    None => break,
                }
            }

            if s.h1_body.is_empty() {
                s.reset_data_event();
            }
        } else {
            // Try to consume all buffered data for the stream, even
            // across multiple DATA frames.
            while total < out.len() {
                let s = self
                    .streams
                    .get_mut(&stream_id)
                    .ok_or(Error::Done)?;

                if s.state() != stream::State::Data {
                    break;
                }

                let (read, fin) =
                    match s.try_consume_data(t, &mut out[total..]) {
                        Ok(v) => v,

                        Err(Error::Done) => break,

                        Err(e) => return Err(e),
                    };

                total += read;

                if read == 0 || fin {
                    break;
                }

                // If a whole DATA frame was consumed and another one is
                // queued behind it, keep parsing so the rest is
                // returned too.
                match self.process_readable_stream(t, stream_id) {
                    Ok(()) => (),

                    Err(Error::Done) => (),

                    Err(e) => return Err(e),
                }

                if t.finished(stream_id) {
                    break;
                }
            }
        }

        self.finish_ingress(t, stream_id);

        if total == 0 {
            return Err(Error::Done);
        }

        Ok(total)
    }

    /// Flushes buffered egress towards the transport: typed streams
    /// first in creation order, then request and push streams in
    /// scheduler order, within the connection's budget. Returns the
    /// number of bytes written.
    pub fn flush(&mut self, t: &mut dyn Transport) -> Result<usize> {
        if self.closed {
            return Ok(0);
        }

        // QPACK housekeeping piggybacks on the flush pass: encoder
        // inserts and decoder acknowledgments ride their own streams.
        if let Some(ins) = self.qpack_encoder.take_instructions() {
            if let Some(id) = self.local_qpack_streams.encoder_stream_id {
                if let Some(s) = self.streams.get_mut(&id) {
                    s.write_buf.append(ins);
                }
            }
        }

        if let Some(ins) = self.qpack_decoder.take_instructions() {
            if let Some(id) = self.local_qpack_streams.decoder_stream_id {
                if let Some(s) = self.streams.get_mut(&id) {
                    s.write_buf.append(ins);
                }
            }
        }

        let mut budget = t.connection_capacity();
        let mut total = 0;

        // Control streams drain before request streams.
        for id in self.control_flush_order.clone() {
            total += self.flush_stream(t, id, &mut budget)?;
        }

        while budget > 0 {
            let id = match self.egress_queue.next() {
                Some(v) => v,

                None => break,
            };

            total += self.flush_stream(t, id, &mut budget)?;

            let Some(s) = self.streams.get_mut(&id) else {
                continue;
            };

            if s.has_pending_egress() {
                let cap = t.capacity(id).unwrap_or(0);

                if cap == 0 {
                    // Window exhausted: the stream stays logically
                    // enqueued but leaves the scheduler until credit
                    // returns.
                    s.scheduled = false;
                    self.fc_blocked.insert(id);
                } else if budget > 0 {
                    // The transport refused bytes; re-queue and let the
                    // next flush retry.
                    self.egress_queue.push(id, &s.priority);
                    break;
                } else {
                    self.egress_queue.push(id, &s.priority);
                }
            } else {
                s.scheduled = false;
                s.enqueued = false;

                self.maybe_reap(t, id);
            }
        }

        self.check_for_shutdown(t);

        Ok(total)
    }

    fn flush_stream(
        &mut self, t: &mut dyn Transport, id: u64, budget: &mut usize,
    ) -> Result<usize> {
        let Some(s) = self.streams.get_mut(&id) else {
            return Ok(0);
        };

        let mut total = 0;

        while *budget > 0 {
            let cap = t.capacity(id).unwrap_or(0);

            if cap == 0 {
                break;
            }

            let max = std::cmp::min(cap, *budget);

            let Some(chunk) = s.write_buf.pop(max) else {
                break;
            };

            let accepted = match t.send(id, &chunk, false) {
                Ok(v) => v,

                Err(transport::Error::Done) => {
                    s.write_buf.unpop(chunk);
                    break;
                },

                Err(transport::Error::StreamStopped(code)) => {
                    s.write_buf.clear();
                    s.pending_eom = false;
                    s.aborted = true;

                    self.events.push_back((id, Event::Reset(code)));

                    return Ok(total);
                },

                Err(e) => return Err(e.into()),
            };

            s.emitted += accepted as u64;
            *budget -= accepted;
            total += accepted;

            if accepted < chunk.len() {
                s.write_buf.unpop(chunk[accepted..].to_vec());
                break;
            }
        }

        // FIN rides its own zero-length write once everything queued is
        // out.
        if s.write_buf.is_empty() && s.pending_eom && !s.eom_sent {
            match t.send(id, &[], true) {
                Ok(_) => {
                    s.eom_sent = true;
                    s.pending_eom = false;
                    s.fin_offset = Some(s.emitted);

                    // Keep the transaction alive until the final byte
                    // is acknowledged.
                    if t.register_delivery(id, s.emitted).is_ok() {
                        s.delivery_refs += 1;
                    }

                    trace!("tx fin stream={} offset={}", id, s.emitted);

                    if s.goaway_latched {
                        self.h1_close_sent();
                    }
                },

                Err(transport::Error::Done) => (),

                Err(_) => (),
            }
        }

        Ok(total)
    }

    /// The local `Connection: close` marker finished sending; advance
    /// the H1Q-v1 drain walk.
    fn h1_close_sent(&mut self) {
        if self.dialect != Dialect::H1qV1 {
            return;
        }

        self.drain_state = match self.drain_state {
            DrainState::Pending => DrainState::CloseSent,

            DrainState::CloseReceived => DrainState::Done,

            other => other,
        };
    }

    fn schedule_egress(&mut self, t: &mut dyn Transport, id: u64) {
        let Some(s) = self.streams.get_mut(&id) else {
            return;
        };

        if !s.has_pending_egress() {
            return;
        }

        s.enqueued = true;

        // Typed streams are flushed unconditionally, not scheduled.
        if self.control_flush_order.contains(&id) {
            return;
        }

        if s.scheduled {
            return;
        }

        let cap = t.capacity(id).unwrap_or(0);

        if cap == 0 {
            // Invariant: a stream only enters the scheduler with a
            // positive window.
            self.fc_blocked.insert(id);
            return;
        }

        self.fc_blocked.remove(&id);
        s.scheduled = true;
        self.egress_queue.push(id, &s.priority);
    }

    fn sync_egress_state(&mut self, t: &mut dyn Transport, id: u64) {
        let Some(s) = self.streams.get_mut(&id) else {
            return;
        };

        if s.has_pending_egress() {
            self.schedule_egress(t, id);
        } else if !s.scheduled {
            s.enqueued = false;
            self.fc_blocked.remove(&id);
        }
    }

    fn unschedule(&mut self, id: u64) {
        if let Some(s) = self.streams.get_mut(&id) {
            if s.scheduled {
                let priority = s.priority;
                s.scheduled = false;
                self.egress_queue.remove(id, &priority);
            }

            s.enqueued = false;
        }

        self.fc_blocked.remove(&id);
    }

    /// Transport notification: the stream's flow-control window grew.
    pub fn on_flow_control_update(
        &mut self, t: &mut dyn Transport, id: u64,
    ) -> Result<()> {
        self.ensure_open()?;

        if self.fc_blocked.contains(&id) {
            if let Some(s) = self.streams.get(&id) {
                if s.has_pending_egress() && t.capacity(id).unwrap_or(0) > 0 {
                    self.fc_blocked.remove(&id);

                    if let Some(s) = self.streams.get_mut(&id) {
                        s.scheduled = true;
                        let priority = s.priority;
                        self.egress_queue.push(id, &priority);
                    }
                }
            }
        }

        Ok(())
    }

    /// Transport notification: the peer reset the stream.
    pub fn on_reset(
        &mut self, t: &mut dyn Transport, id: u64, code: u64,
    ) -> Result<()> {
        self.ensure_open()?;

        // A reset control or QPACK stream kills the connection.
        if Some(id) == self.peer_control_stream_id ||
            Some(id) == self.peer_qpack_streams.encoder_stream_id ||
            Some(id) == self.peer_qpack_streams.decoder_stream_id
        {
            return Err(self.fatal(
                t,
                Error::ClosedCriticalStream,
                b"Critical stream reset.",
            ));
        }

        let Some(s) = self.streams.get_mut(&id) else {
            return Ok(());
        };

        if !matches!(s.ty(), Some(stream::Type::Request | stream::Type::Push))
        {
            return Ok(());
        }

        s.reset_received = Some(code);

        // The reply reset depends on direction and ingress progress:
        // an upstream transaction was simply cancelled; a downstream
        // one that never started ingress is safe for the peer to
        // retry.
        let reply = if !self.is_server {
            wire::HTTP_REQUEST_CANCELLED
        } else if !s.headers_received {
            wire::HTTP_REQUEST_REJECTED
        } else {
            wire::HTTP_NO_ERROR
        };

        let egress_open = !s.eom_sent;

        s.write_buf.clear();
        s.pending_eom = false;
        s.delivery_refs = 0;

        if egress_open {
            let _ = t.shutdown(id, transport::Shutdown::Write, reply);
        }

        self.events.push_back((id, Event::Reset(code)));

        self.unschedule(id);
        self.maybe_reap(t, id);

        Ok(())
    }

    /// Transport notification: the peer sent STOP_SENDING.
    pub fn on_stop_sending(
        &mut self, t: &mut dyn Transport, id: u64, code: u64,
    ) -> Result<()> {
        self.ensure_open()?;

        if Some(id) == self.control_stream_id ||
            Some(id) == self.local_qpack_streams.encoder_stream_id ||
            Some(id) == self.local_qpack_streams.decoder_stream_id
        {
            return Err(self.fatal(
                t,
                Error::ClosedCriticalStream,
                b"Critical stream stopped.",
            ));
        }

        let Some(s) = self.streams.get_mut(&id) else {
            return Ok(());
        };

        // The peer is not interested in this egress anymore: reset it
        // with the peer's code. Ingress may still be in flight (e.g. a
        // final response racing the STOP_SENDING), so only the write
        // half dies here.
        s.write_buf.clear();
        s.pending_eom = false;
        s.eom_sent = true;
        s.delivery_refs = 0;

        let _ = t.shutdown(id, transport::Shutdown::Write, code);

        self.events.push_back((id, Event::Reset(code)));

        self.unschedule(id);
        self.maybe_reap(t, id);

        Ok(())
    }

    /// Transport notification: every byte below `offset` was delivered.
    pub fn on_delivery_ack(
        &mut self, t: &mut dyn Transport, id: u64, offset: u64,
    ) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        if let Some(s) = self.streams.get_mut(&id) {
            if s.delivery_refs > 0 {
                s.delivery_refs -= 1;
            }
        }

        // The GOAWAY handshake advances on the control stream's acks.
        if Some(id) == self.control_stream_id &&
            self.goaway_ack_offset.map_or(false, |ack| offset >= ack)
        {
            self.goaway_ack_offset = None;

            match self.drain_state {
                DrainState::FirstGoaway => self.send_goaway(t),

                DrainState::SecondGoaway => {
                    self.drain_state = DrainState::Done;
                },

                _ => (),
            }
        }

        self.maybe_reap(t, id);
        self.check_for_shutdown(t);

        Ok(())
    }

    /// Transport notification: a registered delivery callback was
    /// cancelled (e.g. the stream was reset underneath it).
    pub fn on_delivery_cancel(&mut self, id: u64) {
        if let Some(s) = self.streams.get_mut(&id) {
            if s.delivery_refs > 0 {
                s.delivery_refs -= 1;
            }
        }
    }

    /// Transport notification (partial reliability): the peer expired
    /// egress data below the stream offset.
    pub fn on_data_expired(
        &mut self, t: &mut dyn Transport, id: u64, stream_offset: u64,
    ) -> Result<()> {
        self.ensure_open()?;

        let Some(s) = self.streams.get_mut(&id) else {
            return Ok(());
        };

        // The signal can outrun the message head; park it until the
        // offset map is anchored.
        if self.partial_reliability && s.pr_ingress.is_none() {
            s.pending_expired = Some(stream_offset);
            return Ok(());
        }

        let res = (|| {
            let tracker = s.pr_ingress.as_ref().ok_or(Error::OffsetError)?;

            tracker.stream_to_body(stream_offset)
        })();

        match res {
            Ok(body_offset) => {
                self.events.push_back((id, Event::DataExpired(body_offset)));
            },

            Err(e) => {
                self.events.push_back((id, Event::Reset(e.to_wire())));
                let _ = self.send_abort(t, id, e);
            },
        }

        Ok(())
    }

    /// Transport notification (partial reliability): the peer rejected
    /// ingress data below the stream offset.
    pub fn on_data_rejected(
        &mut self, t: &mut dyn Transport, id: u64, stream_offset: u64,
    ) -> Result<()> {
        self.ensure_open()?;

        let Some(s) = self.streams.get_mut(&id) else {
            return Ok(());
        };

        let res = (|| {
            let tracker = s.pr_egress.as_ref().ok_or(Error::OffsetError)?;

            tracker.stream_to_body(stream_offset)
        })();

        match res {
            Ok(body_offset) => {
                // Bytes below the offset that never reached the wire
                // can be dropped; committed bytes and queued head bytes
                // stay.
                let body_base = s
                    .pr_egress
                    .as_ref()
                    .and_then(|tr| tr.body_to_stream(0).ok())
                    .unwrap_or(0);

                if s.emitted >= body_base && stream_offset > s.emitted {
                    let gap = (stream_offset - s.emitted) as usize;

                    s.write_buf.trim_front(gap);
                    s.bytes_skipped += gap as u64;
                    s.emitted = stream_offset;
                }

                self.events
                    .push_back((id, Event::DataRejected(body_offset)));

                self.sync_egress_state(t, id);
            },

            Err(e) => {
                self.events.push_back((id, Event::Reset(e.to_wire())));
                let _ = self.send_abort(t, id, e);
            },
        }

        Ok(())
    }

    /// The next deadline the embedder should arm a timer for.
    pub fn timeout(&self) -> Option<Instant> {
        let stream_deadlines = self
            .streams
            .values()
            .filter_map(|s| s.deadline);

        let promise_deadlines = self
            .promised_pushes
            .values()
            .filter_map(|p| p.deadline);

        let idle = if self.transaction_count() == 0 {
            self.idle_deadline
        } else {
            None
        };

        stream_deadlines
            .chain(promise_deadlines)
            .chain(idle)
            .min()
    }

    /// Fires expired timers.
    ///
    /// A downstream transaction that never started its response is
    /// answered with a `408` and its ingress discarded; everything else
    /// is errored. The session idle timer closes the connection when no
    /// transactions remain.
    pub fn on_timeout(
        &mut self, t: &mut dyn Transport, now: Instant,
    ) -> Result<()> {
        self.ensure_open()?;

        let expired: Vec<u64> = self
            .streams
            .iter()
            .filter(|(_, s)| {
                matches!(
                    s.ty(),
                    Some(stream::Type::Request | stream::Type::Push)
                ) && s.deadline.map_or(false, |d| d <= now)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            let respond_408 = match self.streams.get(&id) {
                Some(s) =>
                    self.is_server &&
                        s.ty() == Some(stream::Type::Request) &&
                        !s.local_initialized(),

                None => continue,
            };

            self.events.push_back((id, Event::TimedOut));

            if respond_408 {
                trace!("transaction {} timed out, sending 408", id);

                let headers = vec![Header::new(b":status", b"408")];

                // Discard whatever else the peer sends.
                let _ = t.shutdown(
                    id,
                    transport::Shutdown::Read,
                    wire::HTTP_REQUEST_REJECTED,
                );

                if let Some(s) = self.streams.get_mut(&id) {
                    s.deadline = None;
                    s.abandon_ingress();
                }

                let _ = self.send_response(t, id, &headers, true);
            } else {
                if let Some(s) = self.streams.get_mut(&id) {
                    s.deadline = None;
                }

                let _ = self.send_abort(t, id, Error::RequestCancelled);
            }
        }

        // Promised pushes with no stream bound only ever see the
        // transaction-level timer.
        let stale: Vec<u64> = self
            .promised_pushes
            .iter()
            .filter(|(_, p)| p.deadline.map_or(false, |d| d <= now))
            .map(|(id, _)| *id)
            .collect();

        for push_id in stale {
            if let Some(p) = self.promised_pushes.remove(&push_id) {
                self.events.push_back((
                    p.parent_stream_id,
                    Event::PushCanceled { push_id },
                ));
            }
        }

        if self.transaction_count() == 0 {
            if let Some(idle) = self.idle_deadline {
                if idle <= now {
                    trace!("session idle timeout");

                    let _ = t.close(wire::HTTP_NO_ERROR, b"idle timeout");
                    self.closed = true;
                }
            }
        }

        Ok(())
    }

    fn maybe_reap(&mut self, t: &mut dyn Transport, id: u64) {
        let complete = self
            .streams
            .get(&id)
            .map_or(false, |s| {
                matches!(
                    s.ty(),
                    Some(stream::Type::Request | stream::Type::Push)
                ) && s.is_complete()
            });

        if !complete {
            return;
        }

        self.unschedule(id);

        self.streams.remove(&id);
        self.pending_reads.remove(&id);
        self.blocked_streams.remove(&id);

        if let Some(push_id) = self.push_ids_by_stream.remove(&id) {
            self.nascent_pushes.remove(&push_id);
        }

        trace!("stream {} reaped", id);

        if self.transaction_count() == 0 {
            self.idle_deadline =
                self.idle_timeout.map(|v| Instant::now() + v);
        }

        self.check_for_shutdown(t);
    }

    /// Whether drain has progressed far enough that an idle session may
    /// be destroyed.
    pub fn is_closeable(&self) -> bool {
        if self.transaction_count() != 0 {
            return false;
        }

        // Upstream peers with a control stream originate no GOAWAYs:
        // once they want to go away they just stop creating streams, so
        // any progress past NONE is as good as DONE for them.
        let upstream_shortcut = self.dialect.has_control_streams() &&
            !self.is_server &&
            self.drain_state >= DrainState::Pending;

        match self.drain_state {
            DrainState::Done => true,

            DrainState::None => false,

            // Mid-walk: servers finish the GOAWAY handshake first; the
            // marker-based dialect may cut the wait short when asked to
            // close on idle.
            _ =>
                upstream_shortcut ||
                    (self.close_when_idle &&
                        self.dialect == Dialect::H1qV1),
        }
    }

    fn check_for_shutdown(&mut self, t: &mut dyn Transport) {
        if self.closed || !self.is_closeable() {
            return;
        }

        // Let queued control bytes (the second GOAWAY in particular)
        // reach the transport first.
        if self.has_pending_egress() {
            return;
        }

        trace!("session drained, closing");

        let _ = t.close(wire::HTTP_NO_ERROR, b"drained");
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils::default_config;
    use crate::test_utils::get_request;
    use crate::test_utils::ok_response;
    use crate::test_utils::raw_request;
    use crate::test_utils::FakeTransport;
    use crate::test_utils::Pipe;

    fn server_only(alpn: &[u8]) -> (Session, FakeTransport) {
        let mut st = FakeTransport::new(true, alpn);
        let session = Session::with_transport(&mut st, &default_config()).unwrap();

        (session, st)
    }

    #[test]
    fn connect_setup() {
        let mut pipe = Pipe::new().unwrap();

        assert_eq!(pipe.client.dialect(), crate::Dialect::H3);
        assert!(!pipe.client.is_server());
        assert!(pipe.server.is_server());

        // SETTINGS apply once each side polls its peer control stream.
        assert_eq!(pipe.poll_client(), Err(Error::Done));
        assert_eq!(pipe.poll_server(), Err(Error::Done));

        assert!(pipe.client.peer_settings_raw().is_some());
        assert!(pipe.server.peer_settings_raw().is_some());

        assert_eq!(pipe.server.peer_header_table_size(), Some(4096));
        assert_eq!(pipe.server.peer_qpack_blocked_streams(), Some(16));

        assert_eq!(pipe.client.drain_state(), DrainState::None);
        assert_eq!(pipe.server.drain_state(), DrainState::None);
    }

    #[test]
    fn unsupported_alpn() {
        let mut t = FakeTransport::new(false, b"spdy/3");

        assert_eq!(
            Session::with_transport(&mut t, &default_config()).err(),
            Some(Error::ConnectFailed)
        );

        assert!(t.closed().is_some());
    }

    #[test]
    fn uni_credit_exhausted_fails_connect() {
        let mut t = FakeTransport::new(false, b"h3-29");
        t.set_uni_credit(1);

        assert_eq!(
            Session::with_transport(&mut t, &default_config()).err(),
            Some(Error::ConnectFailed)
        );
    }

    #[test]
    fn simple_get() {
        let mut pipe = Pipe::new().unwrap();

        let stream_id = pipe
            .client
            .send_request(&mut pipe.ct, &get_request(), true)
            .unwrap();
        assert_eq!(stream_id, 0);

        pipe.advance().unwrap();

        let ev = pipe.poll_server().unwrap();
        match ev {
            (0, Event::Headers { list, has_body }) => {
                assert!(!has_body);
                assert!(list.contains(&Header::new(b":method", b"GET")));
                assert!(list.contains(&Header::new(b":path", b"/")));
            },

            ev => panic!("unexpected {:?}", ev),
        }

        assert_eq!(pipe.poll_server(), Ok((0, Event::Finished)));
        assert_eq!(pipe.poll_server(), Err(Error::Done));

        let resp = vec![
            Header::new(b":status", b"200"),
            Header::new(b"server", b"hq-session-test"),
        ];

        pipe.server
            .send_response(&mut pipe.st, 0, &resp, false)
            .unwrap();

        let body = [b'x'; 100];
        assert_eq!(
            pipe.server.send_body(&mut pipe.st, 0, &body, true),
            Ok(100)
        );

        pipe.advance().unwrap();

        // Headers + body + framing on the wire, FIN set.
        assert!(pipe.st.sent(0) > 110);
        assert!(pipe.st.sent_fin(0));

        match pipe.poll_client().unwrap() {
            (0, Event::Headers { list, has_body }) => {
                assert!(has_body);
                assert!(list.contains(&Header::new(b":status", b"200")));
            },

            ev => panic!("unexpected {:?}", ev),
        }

        assert_eq!(pipe.poll_client(), Ok((0, Event::Data)));

        let mut out = [0; 256];
        assert_eq!(pipe.client.recv_body(&mut pipe.ct, 0, &mut out), Ok(100));
        assert!(out[..100].iter().all(|b| *b == b'x'));

        assert_eq!(pipe.poll_client(), Ok((0, Event::Finished)));
        assert_eq!(pipe.poll_client(), Err(Error::Done));

        // Both transactions are gone once the exchange completes.
        assert_eq!(pipe.client.transaction_count(), 0);
        assert_eq!(pipe.server.transaction_count(), 0);
    }

    #[test]
    fn post_with_trailers() {
        let mut pipe = Pipe::new().unwrap();

        let stream_id = pipe
            .client
            .send_request(&mut pipe.ct, &get_request(), false)
            .unwrap();

        pipe.client
            .send_body(&mut pipe.ct, stream_id, b"upload", false)
            .unwrap();

        let trailers = vec![Header::new(b"checksum", b"abc123")];
        pipe.client
            .send_trailers(&mut pipe.ct, stream_id, &trailers)
            .unwrap();

        pipe.advance().unwrap();

        match pipe.poll_server().unwrap() {
            (0, Event::Headers { has_body, .. }) => assert!(has_body),
            ev => panic!("unexpected {:?}", ev),
        }

        assert_eq!(pipe.poll_server(), Ok((0, Event::Data)));

        let mut out = [0; 64];
        assert_eq!(pipe.server.recv_body(&mut pipe.st, 0, &mut out), Ok(6));

        assert_eq!(
            pipe.poll_server(),
            Ok((0, Event::Trailers {
                list: trailers.clone()
            }))
        );

        assert_eq!(pipe.poll_server(), Ok((0, Event::Finished)));
    }

    #[test]
    fn h1q_v1_roundtrip() {
        let mut pipe = Pipe::with_alpn(b"h1q-fb").unwrap();

        assert_eq!(pipe.client.dialect(), crate::Dialect::H1qV1);

        let stream_id = pipe
            .client
            .send_request(&mut pipe.ct, &get_request(), true)
            .unwrap();

        pipe.advance().unwrap();

        match pipe.poll_server().unwrap() {
            (0, Event::Headers { list, .. }) => {
                assert!(list.contains(&Header::new(b":method", b"GET")));
            },

            ev => panic!("unexpected {:?}", ev),
        }

        assert_eq!(pipe.poll_server(), Ok((0, Event::Finished)));

        pipe.server
            .send_response(&mut pipe.st, stream_id, &ok_response(), false)
            .unwrap();
        pipe.server
            .send_body(&mut pipe.st, stream_id, b"hello world", true)
            .unwrap();

        pipe.advance().unwrap();

        match pipe.poll_client().unwrap() {
            (0, Event::Headers { list, has_body }) => {
                assert!(has_body);
                assert_eq!(list[0], Header::new(b":status", b"200"));
            },

            ev => panic!("unexpected {:?}", ev),
        }

        assert_eq!(pipe.poll_client(), Ok((0, Event::Data)));

        let mut out = [0; 64];
        assert_eq!(pipe.client.recv_body(&mut pipe.ct, 0, &mut out), Ok(11));
        assert_eq!(&out[..11], b"hello world");

        assert_eq!(pipe.poll_client(), Ok((0, Event::Finished)));
    }

    #[test]
    fn h1q_v1_connection_close_drain() {
        let mut pipe = Pipe::with_alpn(b"h1q-fb").unwrap();

        let stream_id = pipe
            .client
            .send_request(&mut pipe.ct, &get_request(), true)
            .unwrap();

        pipe.advance().unwrap();
        pipe.drain_server();

        // Drain rides the response's Connection: close marker.
        pipe.server.graceful_shutdown(&mut pipe.st);
        assert_eq!(pipe.server.drain_state(), DrainState::Pending);

        pipe.server
            .send_response(&mut pipe.st, stream_id, &ok_response(), true)
            .unwrap();

        pipe.advance().unwrap();

        assert_eq!(pipe.server.drain_state(), DrainState::CloseSent);

        pipe.drain_client();
        assert_eq!(pipe.client.drain_state(), DrainState::CloseReceived);

        // New requests are refused past this point.
        assert_eq!(
            pipe.client.send_request(&mut pipe.ct, &get_request(), true),
            Err(Error::RequestRejected)
        );
    }

    #[test]
    fn h1q_v2_goaway_drain() {
        let mut pipe = Pipe::with_alpn(b"h1q-fb-v2").unwrap();

        assert_eq!(pipe.client.dialect(), crate::Dialect::H1qV2);

        let stream_id = pipe
            .client
            .send_request(&mut pipe.ct, &get_request(), true)
            .unwrap();

        pipe.advance().unwrap();
        pipe.drain_server();

        pipe.server.close_when_idle(&mut pipe.st);
        assert_eq!(pipe.server.drain_state(), DrainState::FirstGoaway);

        pipe.server
            .send_response(&mut pipe.st, stream_id, &ok_response(), true)
            .unwrap();

        pipe.advance().unwrap();

        let goaways: Vec<u64> = pipe
            .drain_client()
            .into_iter()
            .filter_map(|(_, ev)| match ev {
                Event::GoAway(id) => Some(id),
                _ => None,
            })
            .collect();

        assert_eq!(goaways, vec![(1 << 62) - 1, stream_id]);

        assert_eq!(pipe.server.drain_state(), DrainState::Done);
        assert!(pipe.server.is_closed());
    }

    #[test]
    fn h1q_v1_rejects_uni_streams() {
        let (mut session, mut st) = server_only(b"h1q-fb");

        st.inject(2, b"anything", false);

        assert_eq!(session.poll(&mut st), Err(Error::Done));

        assert_eq!(st.stop_code(2), Some(wire::HTTP_WRONG_STREAM));
        assert_eq!(st.reset_code(2), Some(wire::HTTP_WRONG_STREAM));
        assert!(!session.is_closed());
    }

    #[test]
    fn unknown_uni_stream_type_rejected() {
        let (mut session, mut st) = server_only(b"h3-29");

        // 0x21 is a reserved (grease-style) stream type.
        st.inject(2, &[0x21, 1, 2, 3], false);

        assert_eq!(session.poll(&mut st), Err(Error::Done));

        assert_eq!(st.stop_code(2), Some(wire::HTTP_UNKNOWN_STREAM_TYPE));
        assert!(!session.is_closed());
    }

    #[test]
    fn goaway_before_settings_is_fatal() {
        let (mut session, mut st) = server_only(b"h3-29");

        // CONTROL preface, then GOAWAY before any SETTINGS.
        st.inject(2, &[0x00, 0x06, 0x01, 0x00], false);

        assert_eq!(session.poll(&mut st), Err(Error::MissingSettings));
        assert_eq!(st.closed(), Some(wire::HTTP_MISSING_SETTINGS));
    }

    #[test]
    fn duplicate_control_stream_is_fatal() {
        let (mut session, mut st) = server_only(b"h3-29");

        // CONTROL preface + empty SETTINGS.
        st.inject(2, &[0x00, 0x04, 0x00], false);
        assert_eq!(session.poll(&mut st), Err(Error::Done));

        st.inject(6, &[0x00, 0x04, 0x00], false);
        assert_eq!(session.poll(&mut st), Err(Error::WrongStreamCount));
        assert_eq!(st.closed(), Some(wire::HTTP_WRONG_STREAM_COUNT));
    }

    #[test]
    fn settings_on_h1q_v2_control_is_fatal() {
        let (mut session, mut st) = server_only(b"h1q-fb-v2");

        // H1Q control preface (two-byte varint 0xF0), then SETTINGS.
        st.inject(2, &[0x40, 0xF0, 0x04, 0x00], false);

        assert_eq!(session.poll(&mut st), Err(Error::FrameUnexpected));
        assert_eq!(st.closed(), Some(wire::HTTP_UNEXPECTED_FRAME));
    }

    #[test]
    fn settings_arrive_once_with_placeholders_ignored() {
        let (mut session, mut st) = server_only(b"h3-29");

        // SETTINGS carrying NUM_PLACEHOLDERS, which is parsed but
        // never enforced.
        st.inject(2, &[0x00, 0x04, 0x02, 0x09, 0x08], false);
        assert_eq!(session.poll(&mut st), Err(Error::Done));

        assert_eq!(session.peer_num_placeholders(), Some(8));

        // A second SETTINGS on the same stream is fatal.
        st.inject(2, &[0x04, 0x00], false);
        assert_eq!(session.poll(&mut st), Err(Error::FrameUnexpected));
    }

    #[test]
    fn closed_critical_stream_is_fatal() {
        let (mut session, mut st) = server_only(b"h3-29");

        st.inject(2, &[0x00, 0x04, 0x00], false);
        assert_eq!(session.poll(&mut st), Err(Error::Done));

        // The peer closes its control stream mid-session.
        st.inject(2, &[], true);

        assert_eq!(session.poll(&mut st), Err(Error::ClosedCriticalStream));
        assert_eq!(st.closed(), Some(wire::HTTP_CLOSED_CRITICAL_STREAM));
    }

    #[test]
    fn goaway_twice_and_close() {
        let mut pipe = Pipe::new().unwrap();

        // Three requests land out of order, ids 0, 8 and 16.
        for id in [0u64, 8, 16] {
            pipe.st.inject(id, &raw_request(&get_request()), true);
        }

        let events = pipe.drain_server();
        assert_eq!(events.len(), 6);

        pipe.server.close_when_idle(&mut pipe.st);
        assert_eq!(pipe.server.drain_state(), DrainState::FirstGoaway);

        for id in [0u64, 8, 16] {
            pipe.server
                .send_response(&mut pipe.st, id, &ok_response(), true)
                .unwrap();
        }

        pipe.advance().unwrap();

        // Both GOAWAYs went out: the sentinel first, then the largest
        // accepted stream id.
        let goaways: Vec<u64> = pipe
            .drain_client()
            .into_iter()
            .filter_map(|(_, ev)| match ev {
                Event::GoAway(id) => Some(id),
                _ => None,
            })
            .collect();

        assert_eq!(goaways, vec![(1 << 62) - 1, 16]);

        assert_eq!(pipe.server.drain_state(), DrainState::Done);
        assert!(pipe.server.is_closed());
        assert_eq!(pipe.st.closed(), Some(wire::HTTP_NO_ERROR));
    }

    #[test]
    fn draining_server_rejects_streams_beyond_bound() {
        let mut pipe = Pipe::new().unwrap();

        for id in [0u64, 8, 16] {
            pipe.st.inject(id, &raw_request(&get_request()), true);
        }

        pipe.drain_server();

        pipe.server.graceful_shutdown(&mut pipe.st);

        // Beyond the largest accepted id: rejected, retryable.
        pipe.st.inject(20, &raw_request(&get_request()), true);
        assert_eq!(pipe.poll_server(), Err(Error::Done));

        assert_eq!(st_code(&pipe, 20), Some(wire::HTTP_REQUEST_REJECTED));

        // Below the bound: still accepted, streams arrive out of order.
        pipe.st.inject(12, &raw_request(&get_request()), true);

        match pipe.poll_server().unwrap() {
            (12, Event::Headers { .. }) => (),
            ev => panic!("unexpected {:?}", ev),
        }
    }

    fn st_code(pipe: &Pipe, id: u64) -> Option<u64> {
        pipe.st.stop_code(id)
    }

    #[test]
    fn client_aborts_streams_beyond_goaway_bound() {
        let mut pipe = Pipe::new().unwrap();

        let first = pipe
            .client
            .send_request(&mut pipe.ct, &get_request(), true)
            .unwrap();
        pipe.advance().unwrap();

        pipe.drain_server();
        pipe.server
            .send_response(&mut pipe.st, first, &ok_response(), true)
            .unwrap();

        pipe.server.close_when_idle(&mut pipe.st);

        // The client races two more requests before it sees any GOAWAY.
        let a = pipe
            .client
            .send_request(&mut pipe.ct, &get_request(), true)
            .unwrap();
        let b = pipe
            .client
            .send_request(&mut pipe.ct, &get_request(), true)
            .unwrap();

        pipe.advance().unwrap();

        let events = pipe.drain_client();

        // Second GOAWAY bounds accepted streams at `first`; the raced
        // requests come back retryable.
        assert!(events.contains(&(a, Event::Reset(wire::HTTP_REQUEST_REJECTED))));
        assert!(events.contains(&(b, Event::Reset(wire::HTTP_REQUEST_REJECTED))));

        assert_eq!(pipe.client.drain_state(), DrainState::Done);
    }

    #[test]
    fn flow_control_pause_and_resume() {
        let mut pipe = Pipe::new().unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), true)
            .unwrap();
        pipe.advance().unwrap();
        pipe.drain_server();

        // Pin the response stream's window down before responding.
        pipe.st.set_stream_capacity(0, 10);

        pipe.server
            .send_response(&mut pipe.st, 0, &ok_response(), false)
            .unwrap();

        pipe.advance().unwrap();

        // The 100-byte body does not fit; egress is paused on the
        // transaction.
        let body = [b'y'; 100];
        let accepted = match pipe.server.send_body(&mut pipe.st, 0, &body, true)
        {
            Ok(v) => v,
            Err(Error::Done) => 0,
            Err(e) => panic!("unexpected {:?}", e),
        };

        assert!(accepted < 100);

        // The window grows; egress resumes without loss or duplication.
        pipe.st.set_stream_capacity(0, 200);
        pipe.server.on_flow_control_update(&mut pipe.st, 0).unwrap();

        let mut sent = accepted;
        while sent < 100 {
            match pipe.server.send_body(&mut pipe.st, 0, &body[sent..], true) {
                Ok(n) => sent += n,
                Err(Error::Done) => pipe.advance().unwrap(),
                Err(e) => panic!("unexpected {:?}", e),
            }
        }

        pipe.advance().unwrap();
        assert!(pipe.st.sent_fin(0));

        let mut total = 0;
        let mut finished = false;

        loop {
            match pipe.poll_client() {
                Ok((0, Event::Data)) => {
                    let mut out = [0; 256];
                    while let Ok(n) =
                        pipe.client.recv_body(&mut pipe.ct, 0, &mut out)
                    {
                        total += n;
                    }
                },

                Ok((0, Event::Finished)) => finished = true,

                Ok(_) => (),

                Err(Error::Done) => break,

                Err(e) => panic!("unexpected {:?}", e),
            }
        }

        assert_eq!(total, 100);
        assert!(finished);
    }

    #[test]
    fn peer_reset_reply_codes() {
        // Downstream, mid-ingress: the reply reset carries NO_ERROR.
        let mut pipe = Pipe::new().unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), false)
            .unwrap();
        pipe.advance().unwrap();
        pipe.drain_server();

        pipe.client
            .send_abort(&mut pipe.ct, 0, Error::RequestCancelled)
            .unwrap();
        pipe.advance().unwrap();

        let events = pipe.drain_server();
        assert!(events
            .contains(&(0, Event::Reset(wire::HTTP_REQUEST_CANCELLED))));

        assert_eq!(pipe.st.reset_code(0), Some(wire::HTTP_NO_ERROR));
        assert_eq!(pipe.server.transaction_count(), 0);

        // Upstream: the reply reset is a cancellation.
        let mut pipe = Pipe::new().unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), false)
            .unwrap();
        pipe.advance().unwrap();
        pipe.drain_server();

        pipe.server
            .send_abort(&mut pipe.st, 0, Error::InternalError)
            .unwrap();
        pipe.advance().unwrap();

        let events = pipe.drain_client();
        assert!(events.contains(&(0, Event::Reset(wire::HTTP_INTERNAL_ERROR))));

        assert_eq!(pipe.ct.reset_code(0), Some(wire::HTTP_REQUEST_CANCELLED));
        assert_eq!(pipe.client.transaction_count(), 0);
    }

    #[test]
    fn push_promise_then_bind() {
        let mut pipe = Pipe::new().unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), false)
            .unwrap();
        pipe.advance().unwrap();
        pipe.drain_server();

        let push_headers = vec![
            Header::new(b":method", b"GET"),
            Header::new(b":path", b"/style.css"),
        ];

        let push_id = pipe
            .server
            .push_promise(&mut pipe.st, 0, &push_headers)
            .unwrap();
        assert_eq!(push_id, 0);

        let push_stream = pipe
            .server
            .open_push_stream(&mut pipe.st, push_id)
            .unwrap();

        pipe.server
            .send_response(&mut pipe.st, push_stream, &ok_response(), false)
            .unwrap();
        pipe.server
            .send_body(&mut pipe.st, push_stream, b"body{}", true)
            .unwrap();

        pipe.advance().unwrap();

        let mut saw_promise = false;
        let mut bound_stream = None;

        for (id, ev) in pipe.drain_client() {
            match ev {
                Event::PushPromise { push_id: p, list } => {
                    assert_eq!(id, 0);
                    assert_eq!(p, push_id);
                    assert_eq!(list, push_headers);
                    saw_promise = true;
                },

                Event::PushBound { push_id: p } => {
                    assert_eq!(p, push_id);
                    bound_stream = Some(id);
                },

                _ => (),
            }
        }

        assert!(saw_promise);

        let bound = bound_stream.expect("push stream not bound");
        assert_eq!(bound, push_stream);
        assert_eq!(pipe.client.push_id(bound), Some(push_id));

        let mut out = [0; 64];
        assert_eq!(
            pipe.client.recv_body(&mut pipe.ct, bound, &mut out),
            Ok(6)
        );
        assert_eq!(&out[..6], b"body{}");
    }

    #[test]
    fn nascent_push_waits_for_promise() {
        let mut pipe = Pipe::new().unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), false)
            .unwrap();
        pipe.advance().unwrap();
        pipe.drain_server();

        // Hold the parent stream so the promise arrives after the push
        // stream itself.
        pipe.st.hold(0);

        let push_id = pipe
            .server
            .push_promise(&mut pipe.st, 0, &get_request())
            .unwrap();
        let push_stream = pipe
            .server
            .open_push_stream(&mut pipe.st, push_id)
            .unwrap();

        pipe.server
            .send_response(&mut pipe.st, push_stream, &ok_response(), true)
            .unwrap();

        pipe.advance().unwrap();

        // The nascent stream parks, nothing is delivered.
        assert_eq!(pipe.poll_client(), Err(Error::Done));

        pipe.st.release(0);
        pipe.advance().unwrap();

        let events = pipe.drain_client();

        let promise_at = events
            .iter()
            .position(|(_, ev)| matches!(ev, Event::PushPromise { .. }));
        let bound_at = events
            .iter()
            .position(|(_, ev)| matches!(ev, Event::PushBound { .. }));

        assert!(promise_at.is_some());
        assert!(bound_at.is_some());
        assert!(promise_at < bound_at);
    }

    #[test]
    fn push_to_server_is_fatal() {
        let (mut session, mut st) = server_only(b"h3-29");

        // PUSH preface + push id on a client uni stream.
        st.inject(2, &[0x01, 0x00], false);

        assert_eq!(session.poll(&mut st), Err(Error::WrongStream));
        assert!(st.closed().is_some());
    }

    #[test]
    fn cancel_push_for_unpromised_id_is_fatal() {
        let (mut session, mut st) = server_only(b"h3-29");

        // CONTROL preface, empty SETTINGS, then CANCEL_PUSH for a push
        // the server never promised.
        st.inject(2, &[0x00, 0x04, 0x00, 0x03, 0x01, 0x00], false);

        assert_eq!(session.poll(&mut st), Err(Error::IdError));
        assert_eq!(st.closed(), Some(wire::HTTP_LIMIT_EXCEEDED));
    }

    #[test]
    fn cancel_push_cleans_pending_pushes() {
        let mut pipe = Pipe::new().unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), false)
            .unwrap();
        pipe.advance().unwrap();
        pipe.drain_server();

        // A promise with no stream yet: cancelling it surfaces to the
        // parent transaction.
        let first = pipe
            .server
            .push_promise(&mut pipe.st, 0, &get_request())
            .unwrap();

        pipe.advance().unwrap();
        pipe.drain_client();

        pipe.ct.inject(3, &[0x03, 0x01, first as u8], false);

        assert_eq!(
            pipe.poll_client(),
            Ok((0, Event::PushCanceled { push_id: first }))
        );

        // A nascent stream with no promise yet: cancelling it stops the
        // parked stream.
        pipe.st.hold(0);

        let second = pipe
            .server
            .push_promise(&mut pipe.st, 0, &get_request())
            .unwrap();
        let push_stream = pipe
            .server
            .open_push_stream(&mut pipe.st, second)
            .unwrap();

        pipe.server
            .send_response(&mut pipe.st, push_stream, &ok_response(), true)
            .unwrap();

        pipe.advance().unwrap();

        // Parked, nothing delivered.
        assert_eq!(pipe.poll_client(), Err(Error::Done));

        pipe.ct.inject(3, &[0x03, 0x01, second as u8], false);

        assert_eq!(pipe.poll_client(), Err(Error::Done));

        assert_eq!(
            pipe.ct.stop_code(push_stream),
            Some(wire::HTTP_REQUEST_CANCELLED)
        );
        assert!(pipe.client.push_id(push_stream).is_none());
    }

    #[test]
    fn cancel_push_beyond_advertised_limit_is_fatal() {
        let mut pipe = Pipe::new().unwrap();

        // The client advertised MAX_PUSH_ID 16; cancelling id 17 is out
        // of the budget the server was ever granted.
        pipe.ct.inject(3, &[0x03, 0x01, 0x11], false);

        assert_eq!(pipe.poll_client(), Err(Error::IdError));
        assert_eq!(pipe.ct.closed(), Some(wire::HTTP_LIMIT_EXCEEDED));
    }

    #[test]
    fn qpack_blocked_header_resumes() {
        let mut pipe = Pipe::new().unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), true)
            .unwrap();
        pipe.advance().unwrap();
        pipe.drain_server();

        // The server's encoder inserts into the dynamic table; the
        // matching instruction is withheld so the header block arrives
        // first and blocks.
        pipe.st.hold(7);

        pipe.server.qpack_insert(b"x-dyn", b"on").unwrap();

        let resp = vec![
            Header::new(b":status", b"200"),
            Header::new(b"x-dyn", b"on"),
        ];

        pipe.server
            .send_response(&mut pipe.st, 0, &resp, true)
            .unwrap();

        pipe.advance().unwrap();

        // Zero bytes parse until the insert arrives.
        assert_eq!(pipe.poll_client(), Err(Error::Done));

        pipe.st.release(7);
        pipe.advance().unwrap();

        match pipe.poll_client().unwrap() {
            (0, Event::Headers { list, .. }) => {
                assert!(list.contains(&Header::new(b"x-dyn", b"on")));
            },

            ev => panic!("unexpected {:?}", ev),
        }

        assert_eq!(pipe.poll_client(), Ok((0, Event::Finished)));
    }

    #[test]
    fn reads_per_loop_cap() {
        let (mut session, mut st) = server_only(b"h3-29");

        // 20 concurrent requests, one loop's budget is 16.
        for i in 0..20u64 {
            st.inject(i * 4, &raw_request(&get_request()), true);
        }

        let mut events = 0;

        for _ in 0..32 {
            session.poll(&mut st).unwrap();
            events += 1;
        }

        // The rest of the sweep was deferred to the next loop.
        assert!(session.needs_poll());

        while session.poll(&mut st).is_ok() {
            events += 1;
        }

        assert_eq!(events, 40);
        assert!(!session.needs_poll());
    }

    #[test]
    fn transaction_timeout_sends_408() {
        let mut server_config = default_config();
        server_config.set_transaction_timeout(Duration::from_secs(5));

        let mut pipe =
            Pipe::with_config(b"h3-29", &default_config(), &server_config)
                .unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), false)
            .unwrap();
        pipe.advance().unwrap();
        pipe.drain_server();

        let deadline = pipe.server.timeout().expect("no deadline armed");

        pipe.server
            .on_timeout(&mut pipe.st, deadline + Duration::from_secs(1))
            .unwrap();

        let events = pipe.drain_server();
        assert!(events.contains(&(0, Event::TimedOut)));

        assert_eq!(pipe.st.stop_code(0), Some(wire::HTTP_REQUEST_REJECTED));

        pipe.advance().unwrap();

        let mut saw_408 = false;

        for (_, ev) in pipe.drain_client() {
            if let Event::Headers { list, .. } = ev {
                saw_408 = list.contains(&Header::new(b":status", b"408"));
            }
        }

        assert!(saw_408);
    }

    #[test]
    fn partial_reliability_skip() {
        let mut config = default_config();
        config.enable_partial_reliability(true);

        let mut pipe = Pipe::with_config(b"h3-29", &config, &config).unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), true)
            .unwrap();
        pipe.advance().unwrap();
        pipe.drain_server();

        pipe.server
            .send_response(&mut pipe.st, 0, &ok_response(), false)
            .unwrap();

        let body = [b'z'; 50];
        assert_eq!(pipe.server.send_body(&mut pipe.st, 0, &body, false), Ok(50));

        pipe.advance().unwrap();

        // Skip ahead: body bytes below offset 80 are expendable.
        pipe.server.skip_body_to(&mut pipe.st, 0, 80).unwrap();

        // Ill-ordered offsets abort the transaction, so going backwards
        // must fail before any damage.
        // (checked on a fresh stream in partial_reliability_bad_offset)

        let tail = [b'w'; 20];
        assert_eq!(pipe.server.send_body(&mut pipe.st, 0, &tail, true), Ok(20));

        pipe.advance().unwrap();

        let mut expired_at = None;
        let mut total = 0;
        let mut finished = false;

        loop {
            match pipe.poll_client() {
                Ok((0, Event::DataExpired(off))) => expired_at = Some(off),

                Ok((0, Event::Data)) => {
                    let mut out = [0; 256];
                    while let Ok(n) =
                        pipe.client.recv_body(&mut pipe.ct, 0, &mut out)
                    {
                        total += n;
                    }
                },

                Ok((0, Event::Finished)) => finished = true,

                Ok(_) => (),

                Err(Error::Done) => break,

                Err(e) => panic!("unexpected {:?}", e),
            }
        }

        // The skipped range never arrives; the remainder lands at body
        // offsets >= 80.
        assert_eq!(expired_at, Some(80));
        assert_eq!(total, 70);
        assert!(finished);
    }

    #[test]
    fn partial_reliability_bad_offset() {
        let mut config = default_config();
        config.enable_partial_reliability(true);

        let mut pipe = Pipe::with_config(b"h3-29", &config, &config).unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), true)
            .unwrap();
        pipe.advance().unwrap();
        pipe.drain_server();

        pipe.server
            .send_response(&mut pipe.st, 0, &ok_response(), false)
            .unwrap();
        pipe.advance().unwrap();

        pipe.server.skip_body_to(&mut pipe.st, 0, 80).unwrap();

        assert_eq!(
            pipe.server.skip_body_to(&mut pipe.st, 0, 50),
            Err(Error::OffsetError)
        );

        // The transaction was aborted.
        assert_eq!(pipe.server.transaction_count(), 0);
    }

    #[test]
    fn pause_resume_idempotent() {
        let mut pipe = Pipe::new().unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), false)
            .unwrap();
        pipe.advance().unwrap();
        pipe.drain_server();

        pipe.server.pause_ingress(&mut pipe.st, 0).unwrap();
        pipe.server.pause_ingress(&mut pipe.st, 0).unwrap();

        pipe.client
            .send_body(&mut pipe.ct, 0, b"payload", true)
            .unwrap();
        pipe.advance().unwrap();

        // Paused: nothing is delivered.
        assert_eq!(pipe.poll_server(), Err(Error::Done));

        pipe.server.resume_ingress(0).unwrap();
        pipe.server.resume_ingress(0).unwrap();

        assert_eq!(pipe.poll_server(), Ok((0, Event::Data)));
    }

    #[test]
    fn pausing_egress_push_drops_connection() {
        let mut pipe = Pipe::new().unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), false)
            .unwrap();
        pipe.advance().unwrap();
        pipe.drain_server();

        let push_id = pipe
            .server
            .push_promise(&mut pipe.st, 0, &get_request())
            .unwrap();
        let push_stream = pipe
            .server
            .open_push_stream(&mut pipe.st, push_id)
            .unwrap();

        assert_eq!(
            pipe.server.pause_ingress(&mut pipe.st, push_stream),
            Err(Error::WrongStream)
        );

        assert!(pipe.server.is_closed());
    }

    #[test]
    fn push_without_credit_fails() {
        let mut client_config = default_config();
        client_config.set_max_push_id(0);

        let mut pipe =
            Pipe::with_config(b"h3-29", &client_config, &default_config())
                .unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), false)
            .unwrap();
        pipe.advance().unwrap();
        pipe.drain_server();

        // MAX_PUSH_ID of 0 grants exactly one push.
        pipe.server.push_promise(&mut pipe.st, 0, &get_request()).unwrap();

        assert_eq!(
            pipe.server
                .push_promise(&mut pipe.st, 0, &get_request())
                .err(),
            Some(Error::IdError)
        );
    }

    #[test]
    fn upstream_drain_is_done_at_pending() {
        let mut pipe = Pipe::new().unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), true)
            .unwrap();
        pipe.advance().unwrap();
        pipe.drain_server();

        pipe.server
            .send_response(&mut pipe.st, 0, &ok_response(), true)
            .unwrap();
        pipe.advance().unwrap();
        pipe.drain_client();

        // Clients originate no GOAWAYs: pending is as far as their
        // walk goes, and an idle session closes right away.
        pipe.client.graceful_shutdown(&mut pipe.ct);

        assert_eq!(pipe.client.drain_state(), DrainState::Pending);
        assert!(pipe.client.is_closed());
    }

    #[test]
    fn drain_state_never_regresses() {
        let mut pipe = Pipe::new().unwrap();

        for id in [0u64, 8] {
            pipe.st.inject(id, &raw_request(&get_request()), true);
        }
        pipe.drain_server();

        let mut last = pipe.server.drain_state();

        pipe.server.close_when_idle(&mut pipe.st);

        for id in [0u64, 8] {
            pipe.server
                .send_response(&mut pipe.st, id, &ok_response(), true)
                .unwrap();

            assert!(pipe.server.drain_state() >= last);
            last = pipe.server.drain_state();

            pipe.advance().unwrap();

            assert!(pipe.server.drain_state() >= last);
            last = pipe.server.drain_state();
        }

        assert_eq!(pipe.server.drain_state(), DrainState::Done);
    }

    #[test]
    fn stop_sending_aborts_transaction() {
        let mut pipe = Pipe::new().unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), true)
            .unwrap();
        pipe.advance().unwrap();
        pipe.drain_server();

        pipe.server
            .send_response(&mut pipe.st, 0, &ok_response(), false)
            .unwrap();

        // The client loses interest in the response.
        pipe.client
            .stop_sending(&mut pipe.ct, 0, Error::RequestCancelled)
            .unwrap();
        pipe.advance().unwrap();

        let events = pipe.drain_server();
        assert!(events
            .contains(&(0, Event::Reset(wire::HTTP_REQUEST_CANCELLED))));

        assert_eq!(pipe.server.transaction_count(), 0);
    }

    #[test]
    fn drop_connection_errors_all_transactions() {
        let mut pipe = Pipe::new().unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), false)
            .unwrap();
        pipe.client
            .send_request(&mut pipe.ct, &get_request(), false)
            .unwrap();

        pipe.client
            .drop_connection(&mut pipe.ct, wire::HTTP_INTERNAL_ERROR);

        // Idempotent.
        pipe.client
            .drop_connection(&mut pipe.ct, wire::HTTP_INTERNAL_ERROR);

        let events = pipe.drain_client();

        assert!(events.contains(&(0, Event::Reset(wire::HTTP_INTERNAL_ERROR))));
        assert!(events.contains(&(4, Event::Reset(wire::HTTP_INTERNAL_ERROR))));

        assert!(pipe.client.is_closed());
        assert_eq!(pipe.ct.closed(), Some(wire::HTTP_INTERNAL_ERROR));
    }

    #[test]
    fn deferred_drop_runs_at_next_poll() {
        let mut pipe = Pipe::new().unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), false)
            .unwrap();

        pipe.client.drop_connection_on_next_poll(
            wire::GIVEUP_ZERO_RTT,
            Error::InternalError,
        );

        assert!(!pipe.client.is_closed());

        assert_eq!(pipe.poll_client(), Err(Error::InternalError));
        assert!(pipe.client.is_closed());
        assert_eq!(pipe.ct.closed(), Some(wire::GIVEUP_ZERO_RTT));
    }

    #[test]
    fn concurrency_limit_blocks_new_requests() {
        let mut client_config = default_config();
        client_config.set_max_concurrent_outgoing_streams(2);

        let mut pipe =
            Pipe::with_config(b"h3-29", &client_config, &default_config())
                .unwrap();

        pipe.client
            .send_request(&mut pipe.ct, &get_request(), false)
            .unwrap();
        pipe.client
            .send_request(&mut pipe.ct, &get_request(), false)
            .unwrap();

        assert_eq!(
            pipe.client
                .send_request(&mut pipe.ct, &get_request(), false)
                .err(),
            Some(Error::StreamBlocked)
        );
    }
}
