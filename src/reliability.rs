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

//! Offset bookkeeping for the partial-reliability extension.
//!
//! In partially-reliable mode the body is carried unframed after the
//! message head, so HTTP body offsets and QUIC stream offsets differ by
//! a constant recorded when the body starts. Skips and rejections are
//! validated to be monotonic in body space before being translated to
//! stream space.

use crate::Error;
use crate::Result;

/// Maps HTTP body offsets to QUIC stream offsets for one direction of
/// one stream.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    body_base: Option<u64>,
    watermark: u64,
}

impl OffsetTracker {
    pub fn new() -> OffsetTracker {
        OffsetTracker::default()
    }

    /// Records where the body begins on the stream. May only happen
    /// once.
    pub fn start_body(&mut self, stream_offset: u64) -> Result<()> {
        if self.body_base.is_some() {
            return Err(Error::OffsetError);
        }

        self.body_base = Some(stream_offset);

        Ok(())
    }

    /// Whether the body has started.
    pub fn started(&self) -> bool {
        self.body_base.is_some()
    }

    /// Translates a body offset to its stream offset.
    pub fn body_to_stream(&self, body_offset: u64) -> Result<u64> {
        let base = self.body_base.ok_or(Error::OffsetError)?;

        base.checked_add(body_offset).ok_or(Error::OffsetError)
    }

    /// Translates a stream offset back to a body offset.
    pub fn stream_to_body(&self, stream_offset: u64) -> Result<u64> {
        let base = self.body_base.ok_or(Error::OffsetError)?;

        stream_offset.checked_sub(base).ok_or(Error::OffsetError)
    }

    /// Validates and records a new skip/reject watermark, in body space.
    /// The watermark only moves forward.
    pub fn advance(&mut self, body_offset: u64) -> Result<()> {
        if !self.started() {
            return Err(Error::OffsetError);
        }

        if body_offset <= self.watermark {
            return Err(Error::OffsetError);
        }

        self.watermark = body_offset;

        Ok(())
    }

    /// The highest body offset skipped or expired so far.
    pub fn watermark(&self) -> u64 {
        self.watermark
    }
}
