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

//! Header compression for the H3 dialect.
//!
//! The encoder emits static-table references, literals, and (when the
//! peer has granted dynamic table capacity) dynamic-table references
//! backed by insertions on the encoder stream. The decoder tracks the
//! peer's inserts from its encoder stream and reports header blocks that
//! reference entries it has not received yet as [`Error::Blocked`]; the
//! session parks such streams until the missing inserts arrive. Strings
//! are carried as raw literals on both paths.

use crate::Header;
use crate::NameValue;

/// A specialized [`Result`] type for QPACK operations.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// A QPACK error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The provided buffer is too short.
    BufferTooShort,

    /// The header block uses huffman-coded strings, which this codec
    /// does not emit or accept.
    InvalidHuffmanEncoding,

    /// The QPACK static table index provided doesn't exist.
    InvalidStaticTableIndex,

    /// The QPACK dynamic table index provided doesn't exist.
    InvalidDynamicTableIndex,

    /// An encoder or decoder stream instruction is malformed.
    InvalidInstruction,

    /// The decoded header list exceeded the size limit.
    HeaderListTooLarge,

    /// The header block references dynamic table entries that have not
    /// been received yet.
    Blocked,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl std::convert::From<octets::BufferTooShortError> for Error {
    fn from(_err: octets::BufferTooShortError) -> Self {
        Error::BufferTooShort
    }
}

const INDEXED: u8 = 0b1000_0000;
const INDEXED_WITH_POST_BASE: u8 = 0b0001_0000;
const LITERAL: u8 = 0b0010_0000;
const LITERAL_WITH_NAME_REF: u8 = 0b0100_0000;

// Encoder stream instruction patterns.
const INSERT_WITH_NAME_REF: u8 = 0b1000_0000;
const INSERT_WITH_LITERAL_NAME: u8 = 0b0100_0000;
const SET_CAPACITY: u8 = 0b0010_0000;

// Decoder stream instruction patterns.
const SECTION_ACK: u8 = 0b1000_0000;
const STREAM_CANCEL: u8 = 0b0100_0000;

/// A prefix of the QPACK static table, in table order.
const STATIC_TABLE: [(&[u8], &[u8]); 42] = [
    (b":authority", b""),
    (b":path", b"/"),
    (b"age", b"0"),
    (b"content-disposition", b""),
    (b"content-length", b"0"),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"referer", b""),
    (b"set-cookie", b""),
    (b":method", b"CONNECT"),
    (b":method", b"DELETE"),
    (b":method", b"GET"),
    (b":method", b"HEAD"),
    (b":method", b"OPTIONS"),
    (b":method", b"POST"),
    (b":method", b"PUT"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"103"),
    (b":status", b"200"),
    (b":status", b"304"),
    (b":status", b"404"),
    (b":status", b"503"),
    (b"accept", b"*/*"),
    (b"accept", b"application/dns-message"),
    (b"accept-encoding", b"gzip, deflate, br"),
    (b"accept-ranges", b"bytes"),
    (b"access-control-allow-headers", b"cache-control"),
    (b"access-control-allow-headers", b"content-type"),
    (b"access-control-allow-origin", b"*"),
    (b"cache-control", b"max-age=0"),
    (b"cache-control", b"max-age=2592000"),
    (b"cache-control", b"max-age=604800"),
    (b"cache-control", b"no-cache"),
    (b"cache-control", b"no-store"),
    (b"cache-control", b"public, max-age=31536000"),
];

/// A QPACK encoder.
#[derive(Default)]
pub struct Encoder {
    max_table_capacity: u64,
    table: Vec<(Vec<u8>, Vec<u8>)>,
    pending_instructions: Vec<u8>,
    capacity_emitted: bool,
}

impl Encoder {
    /// Creates a new QPACK encoder.
    pub fn new() -> Encoder {
        Encoder::default()
    }

    /// Sets the dynamic table capacity granted by the peer's
    /// HEADER_TABLE_SIZE setting.
    pub fn set_max_table_capacity(&mut self, v: u64) {
        self.max_table_capacity = v;
    }

    /// Inserts a header into the dynamic table, queueing the matching
    /// encoder stream instruction. Fails when the peer granted no table.
    pub fn insert(&mut self, name: &[u8], value: &[u8]) -> Result<u64> {
        let entry_size = (name.len() + value.len() + 32) as u64;

        if entry_size > self.max_table_capacity {
            return Err(Error::InvalidInstruction);
        }

        if !self.capacity_emitted {
            let mut ins = [0; 16];
            let mut b = octets::OctetsMut::with_slice(&mut ins);

            encode_int(self.max_table_capacity, SET_CAPACITY, 5, &mut b)?;

            let off = b.off();
            self.pending_instructions.extend_from_slice(&ins[..off]);

            self.capacity_emitted = true;
        }

        let mut ins = vec![0; name.len() + value.len() + 16];
        let mut b = octets::OctetsMut::with_slice(&mut ins);

        encode_int(
            name.len() as u64,
            INSERT_WITH_LITERAL_NAME,
            5,
            &mut b,
        )?;
        b.put_bytes(name)?;
        encode_str(value, 7, &mut b)?;

        let off = b.off();
        self.pending_instructions.extend_from_slice(&ins[..off]);

        self.table.push((name.to_vec(), value.to_vec()));

        Ok(self.table.len() as u64 - 1)
    }

    /// Takes the encoder stream bytes queued by `insert()`.
    pub fn take_instructions(&mut self) -> Option<Vec<u8>> {
        if self.pending_instructions.is_empty() {
            return None;
        }

        Some(std::mem::take(&mut self.pending_instructions))
    }

    /// Consumes feedback arriving on the peer's decoder stream.
    ///
    /// Insert count increments, section acknowledgments and stream
    /// cancellations are parsed and discarded; this encoder never risks
    /// eviction so it has no use for them beyond validation.
    pub fn on_decoder_instruction(&mut self, buf: &[u8]) -> Result<()> {
        let mut b = octets::Octets::with_slice(buf);

        while b.cap() > 0 {
            let first = b.peek_u8()?;

            if first & SECTION_ACK == SECTION_ACK {
                decode_int(&mut b, 7)?;
            } else if first & STREAM_CANCEL == STREAM_CANCEL {
                decode_int(&mut b, 6)?;
            } else {
                let increment = decode_int(&mut b, 6)?;

                if increment == 0 {
                    return Err(Error::InvalidInstruction);
                }
            }
        }

        Ok(())
    }

    /// Encodes a list of headers into a QPACK header block.
    pub fn encode<T: NameValue>(
        &mut self, headers: &[T], out: &mut [u8],
    ) -> Result<usize> {
        let mut b = octets::OctetsMut::with_slice(out);

        // The largest dynamic table entry referenced by this block, plus
        // one; zero when only the static table is used.
        let required = headers
            .iter()
            .filter_map(|h| self.lookup_dynamic(h))
            .max()
            .map(|idx| idx + 1)
            .unwrap_or(0);

        // Required Insert Count.
        encode_int(
            if required == 0 { 0 } else { required + 1 },
            0,
            8,
            &mut b,
        )?;

        // Base, equal to the Required Insert Count (delta zero).
        encode_int(0, 0, 7, &mut b)?;

        for h in headers {
            if let Some(idx) = self.lookup_dynamic(h) {
                // Relative index under a base of `required`.
                let rel = required - 1 - idx;

                encode_int(rel, INDEXED, 6, &mut b)?;

                continue;
            }

            match lookup_static(h) {
                Some((idx, true)) => {
                    const STATIC: u8 = 0x40;

                    // Encode as statically indexed.
                    encode_int(idx, INDEXED | STATIC, 6, &mut b)?;
                },

                Some((idx, false)) => {
                    const STATIC: u8 = 0x10;

                    // Encode value as literal with static name reference.
                    encode_int(idx, LITERAL_WITH_NAME_REF | STATIC, 4, &mut b)?;
                    encode_str(h.value(), 7, &mut b)?;
                },

                None => {
                    // Encode as fully literal.
                    encode_int(h.name().len() as u64, LITERAL, 3, &mut b)?;
                    b.put_bytes(h.name())?;

                    encode_str(h.value(), 7, &mut b)?;
                },
            };
        }

        Ok(b.off())
    }

    fn lookup_dynamic<T: NameValue>(&self, h: &T) -> Option<u64> {
        self.table
            .iter()
            .position(|(n, v)| {
                h.name().eq_ignore_ascii_case(n) && h.value() == &v[..]
            })
            .map(|idx| idx as u64)
    }
}

/// A QPACK decoder.
#[derive(Default)]
pub struct Decoder {
    max_table_capacity: u64,
    max_blocked_streams: u64,
    table: Vec<(Vec<u8>, Vec<u8>)>,
    capacity: u64,
    pending_instruction: Vec<u8>,
    pending_increments: u64,
}

impl Decoder {
    /// Creates a new QPACK decoder.
    pub fn new() -> Decoder {
        Decoder::default()
    }

    /// Sets the dynamic table capacity offered to the peer via the
    /// HEADER_TABLE_SIZE setting.
    pub fn set_max_table_capacity(&mut self, v: u64) {
        self.max_table_capacity = v;
    }

    /// Sets the blocked-streams budget offered to the peer.
    pub fn set_max_blocked_streams(&mut self, v: u64) {
        self.max_blocked_streams = v;
    }

    /// How many streams may be parked on missing inserts at once.
    pub fn max_blocked_streams(&self) -> u64 {
        self.max_blocked_streams
    }

    /// The number of dynamic table inserts processed so far.
    pub fn insert_count(&self) -> u64 {
        self.table.len() as u64
    }

    /// Processes bytes from the peer's encoder stream.
    ///
    /// Instructions may be split across transport reads; incomplete
    /// trailing bytes are retained for the next call. Returns the number
    /// of inserts applied.
    pub fn on_encoder_instruction(&mut self, buf: &[u8]) -> Result<u64> {
        let mut pending = std::mem::take(&mut self.pending_instruction);
        pending.extend_from_slice(buf);

        let mut inserts = 0;
        let mut consumed = 0;

        loop {
            let input = &pending[consumed..];

            if input.is_empty() {
                break;
            }

            match self.parse_encoder_instruction(input) {
                Ok((n, inserted)) => {
                    consumed += n;

                    if inserted {
                        inserts += 1;
                    }
                },

                Err(Error::BufferTooShort) => break,

                Err(e) => return Err(e),
            }
        }

        pending.drain(..consumed);
        self.pending_instruction = pending;
        self.pending_increments += inserts;

        Ok(inserts)
    }

    /// Takes the decoder stream bytes acknowledging processed inserts.
    pub fn take_instructions(&mut self) -> Option<Vec<u8>> {
        if self.pending_increments == 0 {
            return None;
        }

        let mut out = [0; 16];
        let mut b = octets::OctetsMut::with_slice(&mut out);

        encode_int(self.pending_increments, 0, 6, &mut b).ok()?;
        self.pending_increments = 0;

        let off = b.off();
        Some(out[..off].to_vec())
    }

    /// Decodes a QPACK header block into a list of headers.
    ///
    /// [`Error::Blocked`] means the block references inserts that have
    /// not arrived on the encoder stream yet; retry after the next
    /// successful `on_encoder_instruction()`.
    ///
    /// [`Error::Blocked`]: enum.Error.html#variant.Blocked
    pub fn decode(&mut self, buf: &[u8], max_size: u64) -> Result<Vec<Header>> {
        let mut b = octets::Octets::with_slice(buf);

        let mut out = Vec::new();

        let mut left = max_size;

        let encoded_insert_count = decode_int(&mut b, 8)?;

        let req_insert_count = if encoded_insert_count == 0 {
            0
        } else {
            encoded_insert_count - 1
        };

        if req_insert_count > self.insert_count() {
            return Err(Error::Blocked);
        }

        let first = b.peek_u8()?;
        let sign = first & 0x80 == 0x80;
        let delta_base = decode_int(&mut b, 7)?;

        let base = if sign {
            req_insert_count
                .checked_sub(delta_base + 1)
                .ok_or(Error::InvalidDynamicTableIndex)?
        } else {
            req_insert_count + delta_base
        };

        trace!(
            "header block ric={} base={} len={}",
            req_insert_count,
            base,
            buf.len()
        );

        while b.cap() > 0 {
            let first = b.peek_u8()?;

            let (name, value) = match Representation::from_byte(first) {
                Representation::Indexed => {
                    const STATIC: u8 = 0x40;

                    let s = first & STATIC == STATIC;
                    let index = decode_int(&mut b, 6)?;

                    if s {
                        let (name, value) = lookup_static_index(index)?;

                        (name.to_vec(), value.to_vec())
                    } else {
                        let abs = base
                            .checked_sub(index + 1)
                            .ok_or(Error::InvalidDynamicTableIndex)?;

                        self.lookup_dynamic_index(abs)?
                    }
                },

                Representation::IndexedWithPostBase => {
                    let index = decode_int(&mut b, 4)?;

                    self.lookup_dynamic_index(base + index)?
                },

                Representation::LiteralWithNameRef => {
                    const STATIC: u8 = 0x10;

                    let s = first & STATIC == STATIC;
                    let index = decode_int(&mut b, 4)?;

                    let name = if s {
                        lookup_static_index(index)?.0.to_vec()
                    } else {
                        let abs = base
                            .checked_sub(index + 1)
                            .ok_or(Error::InvalidDynamicTableIndex)?;

                        self.lookup_dynamic_index(abs)?.0
                    };

                    let value = decode_str(&mut b, 7)?;

                    (name, value)
                },

                Representation::Literal => {
                    if first & 0x08 == 0x08 {
                        return Err(Error::InvalidHuffmanEncoding);
                    }

                    let name_len = decode_int(&mut b, 3)? as usize;
                    let name = b.get_bytes(name_len)?.to_vec();

                    let value = decode_str(&mut b, 7)?;

                    (name, value)
                },

                Representation::LiteralWithPostBase => {
                    let index = decode_int(&mut b, 3)?;

                    let name = self.lookup_dynamic_index(base + index)?.0;
                    let value = decode_str(&mut b, 7)?;

                    (name, value)
                },
            };

            left = left
                .checked_sub((name.len() + value.len()) as u64)
                .ok_or(Error::HeaderListTooLarge)?;

            out.push(Header(name, value));
        }

        Ok(out)
    }

    fn parse_encoder_instruction(
        &mut self, input: &[u8],
    ) -> Result<(usize, bool)> {
        let mut b = octets::Octets::with_slice(input);

        let first = b.peek_u8()?;

        if first & INSERT_WITH_NAME_REF == INSERT_WITH_NAME_REF {
            const STATIC: u8 = 0x40;

            let s = first & STATIC == STATIC;
            let index = decode_int(&mut b, 6)?;

            let name = if s {
                lookup_static_index(index)?.0.to_vec()
            } else {
                let abs = self
                    .insert_count()
                    .checked_sub(index + 1)
                    .ok_or(Error::InvalidDynamicTableIndex)?;

                self.lookup_dynamic_index(abs)?.0
            };

            let value = decode_str(&mut b, 7)?;

            self.push_entry(name, value)?;

            return Ok((b.off(), true));
        }

        if first & INSERT_WITH_LITERAL_NAME == INSERT_WITH_LITERAL_NAME {
            if first & 0x20 == 0x20 {
                return Err(Error::InvalidHuffmanEncoding);
            }

            let name_len = decode_int(&mut b, 5)? as usize;
            let name = b.get_bytes(name_len)?.to_vec();

            let value = decode_str(&mut b, 7)?;

            self.push_entry(name, value)?;

            return Ok((b.off(), true));
        }

        if first & SET_CAPACITY == SET_CAPACITY {
            let capacity = decode_int(&mut b, 5)?;

            if capacity > self.max_table_capacity {
                return Err(Error::InvalidInstruction);
            }

            self.capacity = capacity;

            return Ok((b.off(), false));
        }

        // Duplicate.
        let index = decode_int(&mut b, 5)?;

        let abs = self
            .insert_count()
            .checked_sub(index + 1)
            .ok_or(Error::InvalidDynamicTableIndex)?;

        let (name, value) = self.lookup_dynamic_index(abs)?;

        self.push_entry(name, value)?;

        Ok((b.off(), true))
    }

    fn push_entry(&mut self, name: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let entry_size = (name.len() + value.len() + 32) as u64;

        if entry_size > self.capacity {
            return Err(Error::InvalidInstruction);
        }

        self.table.push((name, value));

        Ok(())
    }

    fn lookup_dynamic_index(&self, abs: u64) -> Result<(Vec<u8>, Vec<u8>)> {
        self.table
            .get(abs as usize)
            .cloned()
            .ok_or(Error::InvalidDynamicTableIndex)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Representation {
    Indexed,
    IndexedWithPostBase,
    Literal,
    LiteralWithNameRef,
    LiteralWithPostBase,
}

impl Representation {
    pub fn from_byte(b: u8) -> Representation {
        if b & INDEXED == INDEXED {
            return Representation::Indexed;
        }

        if b & LITERAL_WITH_NAME_REF == LITERAL_WITH_NAME_REF {
            return Representation::LiteralWithNameRef;
        }

        if b & LITERAL == LITERAL {
            return Representation::Literal;
        }

        if b & INDEXED_WITH_POST_BASE == INDEXED_WITH_POST_BASE {
            return Representation::IndexedWithPostBase;
        }

        Representation::LiteralWithPostBase
    }
}

fn lookup_static<T: NameValue>(h: &T) -> Option<(u64, bool)> {
    let mut name_match = None;

    for (i, e) in STATIC_TABLE.iter().enumerate() {
        // Match header name first.
        if h.name().len() == e.0.len() && h.name().eq_ignore_ascii_case(e.0) {
            // No header value to match, return early.
            if e.1.is_empty() {
                return Some((i as u64, false));
            }

            // Match header value.
            if h.value().len() == e.1.len() && h.value() == e.1 {
                return Some((i as u64, true));
            }

            // Remember name-only match for later, but keep searching.
            name_match = Some((i as u64, false));
        }
    }

    name_match
}

fn lookup_static_index(idx: u64) -> Result<(&'static [u8], &'static [u8])> {
    STATIC_TABLE
        .get(idx as usize)
        .copied()
        .ok_or(Error::InvalidStaticTableIndex)
}

fn encode_int(
    mut v: u64, first: u8, prefix: usize, b: &mut octets::OctetsMut,
) -> Result<()> {
    let mask = 2u64.pow(prefix as u32) - 1;

    // Encode I on N bits.
    if v < mask {
        b.put_u8(first | v as u8)?;
        return Ok(());
    }

    // Encode (2^N - 1) on N bits.
    b.put_u8(first | mask as u8)?;

    v -= mask;

    while v >= 128 {
        // Encode (I % 128 + 128) on 8 bits.
        b.put_u8((v % 128 + 128) as u8)?;

        v >>= 7;
    }

    // Encode I on 8 bits.
    b.put_u8(v as u8)?;

    Ok(())
}

fn encode_str(v: &[u8], prefix: usize, b: &mut octets::OctetsMut) -> Result<()> {
    // H bit unset, raw bytes follow.
    encode_int(v.len() as u64, 0, prefix, b)?;

    b.put_bytes(v)?;

    Ok(())
}

fn decode_int(b: &mut octets::Octets, prefix: usize) -> Result<u64> {
    let mask = 2u64.pow(prefix as u32) - 1;

    let mut val = u64::from(b.get_u8()?);
    val &= mask;

    if val < mask {
        return Ok(val);
    }

    let mut shift = 0;

    while b.cap() > 0 {
        let byte = b.get_u8()?;

        let inc = u64::from(byte & 0x7f)
            .checked_shl(shift)
            .ok_or(Error::BufferTooShort)?;

        val = val.checked_add(inc).ok_or(Error::BufferTooShort)?;

        shift += 7;

        if byte & 0x80 == 0 {
            return Ok(val);
        }
    }

    Err(Error::BufferTooShort)
}

fn decode_str(b: &mut octets::Octets, prefix: usize) -> Result<Vec<u8>> {
    let first = b.peek_u8()?;

    let huffman_bit = 1 << prefix;

    if first & huffman_bit == huffman_bit {
        return Err(Error::InvalidHuffmanEncoding);
    }

    let len = decode_int(b, prefix)? as usize;

    Ok(b.get_bytes(len)?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_static_and_literal() {
        let mut encoded = [0u8; 512];

        let headers = vec![
            Header::new(b":method", b"GET"),
            Header::new(b":scheme", b"https"),
            Header::new(b":authority", b"example.org"),
            Header::new(b":path", b"/index.html"),
            Header::new(b"user-agent", b"hq-client"),
            Header::new(b"x-custom", b"a-value"),
        ];

        let mut enc = Encoder::new();
        let len = enc.encode(&headers, &mut encoded).unwrap();

        let mut dec = Decoder::new();
        assert_eq!(dec.decode(&encoded[..len], u64::MAX), Ok(headers));
    }

    #[test]
    fn header_list_too_large() {
        let mut encoded = [0u8; 128];

        let headers = vec![Header::new(b":method", b"GET")];

        let mut enc = Encoder::new();
        let len = enc.encode(&headers, &mut encoded).unwrap();

        let mut dec = Decoder::new();
        assert_eq!(
            dec.decode(&encoded[..len], 5),
            Err(Error::HeaderListTooLarge)
        );
    }

    #[test]
    fn dynamic_roundtrip_via_encoder_stream() {
        let mut enc = Encoder::new();
        enc.set_max_table_capacity(4096);

        enc.insert(b"x-dyn", b"on").unwrap();

        let mut dec = Decoder::new();
        dec.set_max_table_capacity(4096);

        let ins = enc.take_instructions().unwrap();
        assert_eq!(dec.on_encoder_instruction(&ins), Ok(1));
        assert_eq!(dec.insert_count(), 1);

        let mut encoded = [0u8; 128];
        let headers = vec![Header::new(b"x-dyn", b"on")];
        let len = enc.encode(&headers, &mut encoded).unwrap();

        assert_eq!(dec.decode(&encoded[..len], u64::MAX), Ok(headers));

        // The decoder acknowledges the insert exactly once.
        assert!(dec.take_instructions().is_some());
        assert!(dec.take_instructions().is_none());
    }

    #[test]
    fn blocked_until_insert_arrives() {
        let mut enc = Encoder::new();
        enc.set_max_table_capacity(4096);

        enc.insert(b"x-dyn", b"on").unwrap();
        let ins = enc.take_instructions().unwrap();

        let mut encoded = [0u8; 128];
        let headers = vec![Header::new(b"x-dyn", b"on")];
        let len = enc.encode(&headers, &mut encoded).unwrap();

        let mut dec = Decoder::new();
        dec.set_max_table_capacity(4096);

        // The block lands before the matching insert.
        assert_eq!(dec.decode(&encoded[..len], u64::MAX), Err(Error::Blocked));

        dec.on_encoder_instruction(&ins).unwrap();

        assert_eq!(dec.decode(&encoded[..len], u64::MAX), Ok(headers));
    }

    #[test]
    fn instruction_split_across_reads() {
        let mut enc = Encoder::new();
        enc.set_max_table_capacity(4096);

        enc.insert(b"x-split", b"yes").unwrap();
        let ins = enc.take_instructions().unwrap();

        let mut dec = Decoder::new();
        dec.set_max_table_capacity(4096);

        let (a, b) = ins.split_at(3);

        assert_eq!(dec.on_encoder_instruction(a), Ok(0));
        assert_eq!(dec.on_encoder_instruction(b), Ok(1));
    }

    #[test]
    fn capacity_not_granted() {
        let mut enc = Encoder::new();

        assert_eq!(
            enc.insert(b"x-dyn", b"on"),
            Err(Error::InvalidInstruction)
        );
    }

    #[test]
    fn huffman_rejected() {
        // Fully literal field line with the huffman bit set on the name.
        let block = [0x00, 0x00, LITERAL | 0x08 | 0x1, b'a', 0x01, b'b'];

        let mut dec = Decoder::new();
        assert_eq!(
            dec.decode(&block, u64::MAX),
            Err(Error::InvalidHuffmanEncoding)
        );
    }
}
