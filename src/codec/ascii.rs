// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! ASCII framing.
//!
//! One frame per line: a `:` start delimiter, the unit, PDU and LRC as
//! uppercase hex pairs, and a CR LF trailer.

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::{
    error::FrameError,
    frame::{Adu, UnitId},
};

use super::{FrameEvent, DEFAULT_MAX_BUFFER_LENGTH};

const START: u8 = b':';
const CR: u8 = b'\r';
const LF: u8 = b'\n';

// `:`, unit and a one-byte exception PDU in hex, the LRC and CR LF.
const MIN_FRAME_LEN: usize = 9;

/// Encode one ASCII frame.
#[must_use]
pub fn encode(unit: UnitId, pdu: &[u8]) -> Bytes {
    debug_assert!(!pdu.is_empty());
    let mut buf = BytesMut::with_capacity(MIN_FRAME_LEN + pdu.len() * 2);
    buf.put_u8(START);
    put_hex(&mut buf, unit);
    let mut lrc = unit;
    for byte in pdu {
        put_hex(&mut buf, *byte);
        lrc = lrc.wrapping_add(*byte);
    }
    put_hex(&mut buf, lrc.wrapping_neg());
    buf.put_u8(CR);
    buf.put_u8(LF);
    buf.freeze()
}

/// Decode one complete ASCII frame including delimiters.
pub fn decode(frame: &[u8]) -> Result<Adu, FrameError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort);
    }
    if frame[0] != START {
        return Err(FrameError::StartDelimiter(frame[0]));
    }
    if frame[frame.len() - 2..] != [CR, LF] {
        return Err(FrameError::TooShort);
    }
    decode_payload(&frame[1..frame.len() - 2])
}

/// Decode the hex payload between the start delimiter and CR LF.
fn decode_payload(payload: &[u8]) -> Result<Adu, FrameError> {
    if payload.len() % 2 != 0 {
        return Err(FrameError::TooShort);
    }
    let mut data: SmallVec<[u8; 256]> = SmallVec::with_capacity(payload.len() / 2);
    for pair in payload.chunks(2) {
        data.push(from_hex(pair[0])? << 4 | from_hex(pair[1])?);
    }
    // Unit, at least one PDU byte and the LRC.
    if data.len() < 3 {
        return Err(FrameError::TooShort);
    }
    let lrc = data[data.len() - 1];
    let sum = data
        .iter()
        .fold(0u8, |acc, byte| acc.wrapping_add(*byte));
    if sum != 0 {
        return Err(FrameError::Checksum {
            expected: u16::from(lrc),
            actual: u16::from(calc_lrc(&data[..data.len() - 1])),
        });
    }
    Ok(Adu {
        transaction_id: None,
        unit: data[0],
        pdu: Bytes::copy_from_slice(&data[1..data.len() - 1]),
        checksum: Some(u16::from(lrc)),
    })
}

/// The longitudinal redundancy check: the negated modulo-256 sum.
#[must_use]
pub fn calc_lrc(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, byte| acc.wrapping_add(*byte))
        .wrapping_neg()
}

fn put_hex(buf: &mut BytesMut, byte: u8) {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    buf.put_u8(DIGITS[usize::from(byte >> 4)]);
    buf.put_u8(DIGITS[usize::from(byte & 0x0F)]);
}

fn from_hex(digit: u8) -> Result<u8, FrameError> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => Err(FrameError::NonHexDigit(digit)),
    }
}

/// Streaming ASCII decoder, resumable across arbitrary chunk boundaries.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_buffer_length: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::with_max_buffer_length(DEFAULT_MAX_BUFFER_LENGTH)
    }
}

impl Decoder {
    #[must_use]
    pub fn with_max_buffer_length(max_buffer_length: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_buffer_length,
        }
    }

    /// Buffer a chunk and emit one event per CR LF terminated frame.
    pub fn feed(&mut self, chunk: &[u8], events: &mut Vec<FrameEvent>) {
        if self.buf.is_empty() {
            if let Some(first) = chunk.first() {
                if *first != START {
                    log::warn!("Discarding {} byte(s) without start delimiter", chunk.len());
                    events.push(FrameEvent::Error(FrameError::StartDelimiter(*first)));
                    return;
                }
            }
        }
        self.buf.extend_from_slice(chunk);

        while let Some(end) = find_crlf(&self.buf) {
            let frame = self.buf.split_to(end + 2);
            match decode(&frame) {
                Ok(adu) => events.push(FrameEvent::Adu(adu)),
                Err(err) => {
                    log::warn!("Discarding malformed frame ({} byte(s)): {err}", frame.len());
                    events.push(FrameEvent::Error(err));
                }
            }
            // Anything left over must start the next frame.
            if let Some(&first) = self.buf.first() {
                if first != START {
                    let discarded = self.buf.split().freeze();
                    events.push(FrameEvent::Error(FrameError::StartDelimiter(first)));
                    log::warn!("Discarding {} byte(s) without start delimiter", discarded.len());
                }
            }
        }

        if self.buf.len() > self.max_buffer_length {
            let discarded = self.buf.split().freeze();
            log::warn!("Reassembly buffer overflow, discarding {} byte(s)", discarded.len());
            events.push(FrameEvent::BufferOverflow(discarded));
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == [CR, LF])
}
