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

//! Testing utilities: an in-memory transport and a connected
//! client/server session pair.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use crate::session::Session;
use crate::transport;
use crate::transport::Shutdown;
use crate::transport::Transport;
use crate::Config;
use crate::Result;

const DEFAULT_STREAM_CAPACITY: usize = 1 << 20;
const DEFAULT_CONNECTION_CAPACITY: usize = 1 << 24;

#[derive(Default)]
struct FakeStream {
    // Ingress: bytes the peer sent us, awaiting recv().
    recv_buf: VecDeque<u8>,
    recv_fin: bool,
    fin_signalled: bool,
    stopped: bool,

    // Egress: bytes accepted from the session, awaiting transfer.
    out: Vec<u8>,
    out_fin: bool,
    fin_moved: bool,
    cap: usize,
    write_off: u64,
    delivery: Vec<u64>,

    // Signals awaiting transfer.
    reset_out: Option<u64>,
    stop_out: Option<u64>,
    expired_out: Option<u64>,
    rejected_out: Option<u64>,

    // Signals received, kept for assertions.
    reset_sent: Option<u64>,
    stop_sent: Option<u64>,

    // Test hook: withhold this stream's bytes from transfer.
    held: bool,
}

impl FakeStream {
    fn with_capacity(cap: usize) -> FakeStream {
        FakeStream {
            cap,
            ..Default::default()
        }
    }
}

/// An in-memory stand-in for a QUIC transport.
///
/// Bytes written by a session accumulate per stream until
/// [`Pipe::advance()`] moves them to the peer transport, instantly
/// "acknowledging" them for delivery callbacks.
pub struct FakeTransport {
    server: bool,
    alpn: Vec<u8>,
    streams: BTreeMap<u64, FakeStream>,
    next_bidi: u64,
    next_uni: u64,
    bidi_credit: u64,
    uni_credit: u64,
    conn_cap: usize,
    closed: Option<u64>,
}

impl FakeTransport {
    pub fn new(server: bool, alpn: &[u8]) -> FakeTransport {
        FakeTransport {
            server,
            alpn: alpn.to_vec(),
            streams: BTreeMap::new(),
            next_bidi: if server { 1 } else { 0 },
            next_uni: if server { 3 } else { 2 },
            bidi_credit: 100,
            uni_credit: 100,
            conn_cap: DEFAULT_CONNECTION_CAPACITY,
            closed: None,
        }
    }

    fn stream(&mut self, id: u64) -> &mut FakeStream {
        self.streams
            .entry(id)
            .or_insert_with(|| FakeStream::with_capacity(DEFAULT_STREAM_CAPACITY))
    }

    /// Makes peer bytes appear on a stream, as if delivered by the
    /// network.
    pub fn inject(&mut self, id: u64, data: &[u8], fin: bool) {
        let s = self.stream(id);

        s.recv_buf.extend(data.iter().copied());

        if fin {
            s.recv_fin = true;
        }
    }

    pub fn set_stream_capacity(&mut self, id: u64, cap: usize) {
        self.stream(id).cap = cap;
    }

    pub fn set_connection_capacity(&mut self, cap: usize) {
        self.conn_cap = cap;
    }

    pub fn set_uni_credit(&mut self, credit: u64) {
        self.uni_credit = credit;
    }

    /// Withholds a stream's egress from transfer until released.
    pub fn hold(&mut self, id: u64) {
        self.stream(id).held = true;
    }

    pub fn release(&mut self, id: u64) {
        self.stream(id).held = false;
    }

    /// Total bytes the session handed to this stream.
    pub fn sent(&self, id: u64) -> u64 {
        self.streams.get(&id).map_or(0, |s| s.write_off)
    }

    pub fn sent_fin(&self, id: u64) -> bool {
        self.streams.get(&id).map_or(false, |s| s.out_fin)
    }

    /// The RESET_STREAM code this endpoint sent, if any.
    pub fn reset_code(&self, id: u64) -> Option<u64> {
        self.streams.get(&id).and_then(|s| s.reset_sent)
    }

    /// The STOP_SENDING code this endpoint sent, if any.
    pub fn stop_code(&self, id: u64) -> Option<u64> {
        self.streams.get(&id).and_then(|s| s.stop_sent)
    }

    pub fn closed(&self) -> Option<u64> {
        self.closed
    }
}

impl Transport for FakeTransport {
    fn application_proto(&self) -> &[u8] {
        &self.alpn
    }

    fn is_server(&self) -> bool {
        self.server
    }

    fn is_established(&self) -> bool {
        true
    }

    fn open_bidi(&mut self) -> transport::Result<u64> {
        if self.bidi_credit == 0 {
            return Err(transport::Error::StreamLimit);
        }

        self.bidi_credit -= 1;

        let id = self.next_bidi;
        self.next_bidi += 4;

        self.stream(id);

        Ok(id)
    }

    fn open_uni(&mut self) -> transport::Result<u64> {
        if self.uni_credit == 0 {
            return Err(transport::Error::StreamLimit);
        }

        self.uni_credit -= 1;

        let id = self.next_uni;
        self.next_uni += 4;

        self.stream(id);

        Ok(id)
    }

    fn readable(&self) -> Vec<u64> {
        self.streams
            .iter()
            .filter(|(_, s)| {
                !s.stopped &&
                    (!s.recv_buf.is_empty() ||
                        (s.recv_fin && !s.fin_signalled))
            })
            .map(|(id, _)| *id)
            .collect()
    }

    fn recv(&mut self, id: u64, out: &mut [u8]) -> transport::Result<(usize, bool)> {
        let s = self.stream(id);

        if s.stopped {
            return Err(transport::Error::Done);
        }

        if s.recv_buf.is_empty() {
            if s.recv_fin && !s.fin_signalled {
                s.fin_signalled = true;
                return Ok((0, true));
            }

            return Err(transport::Error::Done);
        }

        let mut n = 0;

        while n < out.len() {
            match s.recv_buf.pop_front() {
                Some(b) => {
                    out[n] = b;
                    n += 1;
                },

                None => break,
            }
        }

        let fin = s.recv_fin && s.recv_buf.is_empty();

        if fin {
            s.fin_signalled = true;
        }

        Ok((n, fin))
    }

    fn peek(&mut self, id: u64, out: &mut [u8]) -> transport::Result<(usize, bool)> {
        let s = self.stream(id);

        if s.recv_buf.is_empty() {
            return Err(transport::Error::Done);
        }

        let n = std::cmp::min(out.len(), s.recv_buf.len());

        for (i, b) in s.recv_buf.iter().take(n).enumerate() {
            out[i] = *b;
        }

        let fin = s.recv_fin && n == s.recv_buf.len();

        Ok((n, fin))
    }

    fn send(&mut self, id: u64, buf: &[u8], fin: bool) -> transport::Result<usize> {
        let s = self.stream(id);

        if s.reset_sent.is_some() {
            return Err(transport::Error::InvalidStreamState);
        }

        let accepted = std::cmp::min(buf.len(), s.cap);

        if accepted == 0 && !buf.is_empty() {
            return Err(transport::Error::Done);
        }

        s.out.extend_from_slice(&buf[..accepted]);
        s.cap -= accepted;
        s.write_off += accepted as u64;

        if fin && accepted == buf.len() {
            s.out_fin = true;
        }

        Ok(accepted)
    }

    fn capacity(&self, id: u64) -> transport::Result<usize> {
        Ok(self.streams.get(&id).map_or(DEFAULT_STREAM_CAPACITY, |s| s.cap))
    }

    fn connection_capacity(&self) -> usize {
        self.conn_cap
    }

    fn finished(&self, id: u64) -> bool {
        self.streams
            .get(&id)
            .map_or(false, |s| s.recv_fin && s.recv_buf.is_empty())
    }

    fn shutdown(
        &mut self, id: u64, direction: Shutdown, err: u64,
    ) -> transport::Result<()> {
        let s = self.stream(id);

        match direction {
            Shutdown::Read => {
                s.stopped = true;
                s.recv_buf.clear();
                s.stop_out = Some(err);
                s.stop_sent = Some(err);
            },

            Shutdown::Write => {
                s.reset_out = Some(err);
                s.reset_sent = Some(err);
                s.out.clear();
                s.out_fin = false;
            },
        }

        Ok(())
    }

    fn stream_priority(
        &mut self, _id: u64, _urgency: u8, _incremental: bool,
    ) -> transport::Result<()> {
        Ok(())
    }

    fn write_offset(&self, id: u64) -> transport::Result<u64> {
        Ok(self.streams.get(&id).map_or(0, |s| s.write_off))
    }

    fn write_buffered(&self, _id: u64) -> transport::Result<u64> {
        Ok(0)
    }

    fn register_delivery(&mut self, id: u64, offset: u64) -> transport::Result<()> {
        self.stream(id).delivery.push(offset);

        Ok(())
    }

    fn send_data_expired(&mut self, id: u64, offset: u64) -> transport::Result<()> {
        let s = self.stream(id);

        s.expired_out = Some(offset);

        if offset > s.write_off {
            s.write_off = offset;
        }

        Ok(())
    }

    fn send_data_rejected(&mut self, id: u64, offset: u64) -> transport::Result<()> {
        self.stream(id).rejected_out = Some(offset);

        Ok(())
    }

    fn close(&mut self, err: u64, _reason: &[u8]) -> transport::Result<()> {
        if self.closed.is_none() {
            self.closed = Some(err);
        }

        Ok(())
    }
}

enum Notice {
    Reset(u64, u64),
    StopSending(u64, u64),
    DataExpired(u64, u64),
    DataRejected(u64, u64),
}

/// Moves everything buffered in `src` to `dst`, returning delivery acks
/// owed to the `src` session and notifications owed to the `dst`
/// session.
fn transfer(
    src: &mut FakeTransport, dst: &mut FakeTransport,
) -> (Vec<(u64, u64)>, Vec<Notice>) {
    let mut acks = Vec::new();
    let mut notices = Vec::new();

    let ids: Vec<u64> = src.streams.keys().copied().collect();

    for id in ids {
        let (data, fin, reset, stop, expired, rejected, ready_acks) = {
            let s = src.stream(id);

            if s.held {
                continue;
            }

            let data = std::mem::take(&mut s.out);

            let fin = s.out_fin && !s.fin_moved;
            if fin {
                s.fin_moved = true;
            }

            let mut ready = Vec::new();
            let write_off = s.write_off;
            s.delivery.retain(|off| {
                if *off <= write_off {
                    ready.push((id, *off));
                    false
                } else {
                    true
                }
            });

            (
                data,
                fin,
                s.reset_out.take(),
                s.stop_out.take(),
                s.expired_out.take(),
                s.rejected_out.take(),
                ready,
            )
        };

        if !data.is_empty() || fin {
            let d = dst.stream(id);

            d.recv_buf.extend(data.iter().copied());

            if fin {
                d.recv_fin = true;
            }
        }

        acks.extend(ready_acks);

        if let Some(code) = reset {
            notices.push(Notice::Reset(id, code));
        }

        if let Some(code) = stop {
            notices.push(Notice::StopSending(id, code));
        }

        if let Some(off) = expired {
            notices.push(Notice::DataExpired(id, off));
        }

        if let Some(off) = rejected {
            notices.push(Notice::DataRejected(id, off));
        }
    }

    (acks, notices)
}

fn apply_notices(
    session: &mut Session, t: &mut FakeTransport, notices: Vec<Notice>,
) {
    for n in notices {
        match n {
            Notice::Reset(id, code) => {
                let _ = session.on_reset(t, id, code);
            },

            Notice::StopSending(id, code) => {
                let _ = session.on_stop_sending(t, id, code);
            },

            Notice::DataExpired(id, off) => {
                let _ = session.on_data_expired(t, id, off);
            },

            Notice::DataRejected(id, off) => {
                let _ = session.on_data_rejected(t, id, off);
            },
        }
    }
}

/// A connected client/server session pair over fake transports.
pub struct Pipe {
    pub client: Session,
    pub server: Session,
    pub ct: FakeTransport,
    pub st: FakeTransport,
}

impl Pipe {
    pub fn new() -> Result<Pipe> {
        Pipe::with_config(b"h3-29", &default_config(), &default_config())
    }

    pub fn with_alpn(alpn: &[u8]) -> Result<Pipe> {
        Pipe::with_config(alpn, &default_config(), &default_config())
    }

    pub fn with_config(
        alpn: &[u8], client_config: &Config, server_config: &Config,
    ) -> Result<Pipe> {
        let mut ct = FakeTransport::new(false, alpn);
        let mut st = FakeTransport::new(true, alpn);

        let client = Session::with_transport(&mut ct, client_config)?;
        let server = Session::with_transport(&mut st, server_config)?;

        let mut pipe = Pipe {
            client,
            server,
            ct,
            st,
        };

        pipe.advance()?;

        Ok(pipe)
    }

    /// Flushes both sessions and shuttles bytes, acks and signals until
    /// nothing moves.
    pub fn advance(&mut self) -> Result<()> {
        loop {
            let mut progress = 0;

            progress += self.client.flush(&mut self.ct)?;
            progress += self.server.flush(&mut self.st)?;

            let (acks, notices) = transfer(&mut self.ct, &mut self.st);
            progress += acks.len() + notices.len();

            for (id, off) in acks {
                let _ = self.client.on_delivery_ack(&mut self.ct, id, off);
            }

            apply_notices(&mut self.server, &mut self.st, notices);

            let (acks, notices) = transfer(&mut self.st, &mut self.ct);
            progress += acks.len() + notices.len();

            for (id, off) in acks {
                let _ = self.server.on_delivery_ack(&mut self.st, id, off);
            }

            apply_notices(&mut self.client, &mut self.ct, notices);

            if progress == 0 {
                break;
            }
        }

        Ok(())
    }

    pub fn poll_client(&mut self) -> Result<(u64, crate::Event)> {
        self.client.poll(&mut self.ct)
    }

    pub fn poll_server(&mut self) -> Result<(u64, crate::Event)> {
        self.server.poll(&mut self.st)
    }

    /// Drains all pending events on one side.
    pub fn drain_client(&mut self) -> Vec<(u64, crate::Event)> {
        let mut out = Vec::new();

        while let Ok(ev) = self.poll_client() {
            out.push(ev);
        }

        out
    }

    pub fn drain_server(&mut self) -> Vec<(u64, crate::Event)> {
        let mut out = Vec::new();

        while let Ok(ev) = self.poll_server() {
            out.push(ev);
        }

        out
    }
}

pub fn default_config() -> Config {
    let mut config = Config::new();

    config.set_qpack_max_table_capacity(4096);
    config.set_qpack_blocked_streams(16);
    config.set_max_push_id(16);

    config
}

/// Serializes a request head the way a remote H3 peer would, for
/// injection tests.
pub fn raw_request(headers: &[crate::Header]) -> Vec<u8> {
    let mut block = vec![0; 1024];

    let mut enc = crate::qpack::Encoder::new();
    let len = enc.encode(headers, &mut block).unwrap();
    block.truncate(len);

    let frame = crate::frame::Frame::Headers {
        header_block: block,
    };

    let mut d = vec![0; frame.wire_len() + 16];
    let mut b = octets::OctetsMut::with_slice(&mut d);
    let len = frame.to_bytes(&mut b).unwrap();
    d.truncate(len);

    d
}

pub fn get_request() -> Vec<crate::Header> {
    vec![
        crate::Header::new(b":method", b"GET"),
        crate::Header::new(b":scheme", b"https"),
        crate::Header::new(b":authority", b"example.org"),
        crate::Header::new(b":path", b"/"),
    ]
}

pub fn ok_response() -> Vec<crate::Header> {
    vec![crate::Header::new(b":status", b"200")]
}
