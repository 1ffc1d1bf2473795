// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTU framing.
//!
//! RTU frames are delimited by silence on the wire, not by anything in
//! the byte stream itself. The decoder therefore collects bytes until
//! the configured end-of-frame timeout elapses and then consumes the
//! whole buffer as one frame. With a timeout of zero every fed chunk is
//! taken as a complete frame immediately.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    error::FrameError,
    frame::{Adu, UnitId},
};

use super::{FrameEvent, DEFAULT_MAX_BUFFER_LENGTH};

// Unit, a one-byte exception PDU and the CRC.
const MIN_FRAME_LEN: usize = 5;

const CRC_BYTE_COUNT: usize = 2;

/// Encode one RTU frame: unit, PDU, CRC-16 (little-endian).
#[must_use]
pub fn encode(unit: UnitId, pdu: &[u8]) -> Bytes {
    debug_assert!(!pdu.is_empty());
    let mut buf = BytesMut::with_capacity(1 + pdu.len() + CRC_BYTE_COUNT);
    buf.put_u8(unit);
    buf.put_slice(pdu);
    let crc = calc_crc(&buf);
    buf.put_u16_le(crc);
    buf.freeze()
}

/// Decode one complete RTU frame.
pub fn decode(frame: &[u8]) -> Result<Adu, FrameError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort);
    }
    let (adu_data, crc_data) = frame.split_at(frame.len() - CRC_BYTE_COUNT);
    let expected = LittleEndian::read_u16(crc_data);
    let actual = calc_crc(adu_data);
    if expected != actual {
        return Err(FrameError::Checksum { expected, actual });
    }
    Ok(Adu {
        transaction_id: None,
        unit: adu_data[0],
        pdu: Bytes::copy_from_slice(&adu_data[1..]),
        checksum: Some(expected),
    })
}

/// The standard Modbus CRC-16 (polynomial `0xA001`).
#[must_use]
pub fn calc_crc(data: &[u8]) -> u16 {
    let mut crc = 0xFFFF;
    for x in data {
        crc ^= u16::from(*x);
        for _ in 0..8 {
            let crc_odd = (crc & 0x0001) != 0;
            crc >>= 1;
            if crc_odd {
                crc ^= 0xA001;
            }
        }
    }
    crc
}

/// Streaming RTU decoder.
///
/// The owner is responsible for the end-of-frame timing: whenever
/// [`feed`](Self::feed) leaves bytes buffered (`pending() == true`) it
/// must (re)start a timer of [`eof_timeout`](Self::eof_timeout) and call
/// [`flush`](Self::flush) on expiry.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    eof_timeout: Duration,
    max_buffer_length: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl Decoder {
    #[must_use]
    pub fn new(eof_timeout: Duration) -> Self {
        Self {
            buf: BytesMut::new(),
            eof_timeout,
            max_buffer_length: DEFAULT_MAX_BUFFER_LENGTH,
        }
    }

    #[must_use]
    pub fn with_max_buffer_length(eof_timeout: Duration, max_buffer_length: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            eof_timeout,
            max_buffer_length,
        }
    }

    /// The configured inter-frame silence.
    #[must_use]
    pub const fn eof_timeout(&self) -> Duration {
        self.eof_timeout
    }

    /// `true` if bytes are buffered awaiting the end-of-frame timer.
    #[must_use]
    pub fn pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Buffer a chunk. Without an end-of-frame timeout the chunk is
    /// decoded right away; otherwise the caller restarts its timer.
    pub fn feed(&mut self, chunk: &[u8], events: &mut Vec<FrameEvent>) {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.max_buffer_length {
            let discarded = self.buf.split().freeze();
            log::warn!("Reassembly buffer overflow, discarding {} byte(s)", discarded.len());
            events.push(FrameEvent::BufferOverflow(discarded));
            return;
        }
        if self.eof_timeout.is_zero() {
            self.flush(events);
        }
    }

    /// Consume the whole buffered content as one frame.
    pub fn flush(&mut self, events: &mut Vec<FrameEvent>) {
        if self.buf.is_empty() {
            return;
        }
        let frame = self.buf.split().freeze();
        match decode(&frame) {
            Ok(adu) => events.push(FrameEvent::Adu(adu)),
            Err(err) => {
                log::warn!("Discarding malformed frame ({} byte(s)): {err}", frame.len());
                events.push(FrameEvent::Error(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: [u8; 8] = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];

    #[test]
    fn test_calc_crc() {
        let msg = [0x01, 0x03, 0x08, 0x2B, 0x00, 0x02];
        assert_eq!(calc_crc(&msg), 0x63B6);

        let msg = [0x01, 0x03, 0x04, 0x00, 0x20, 0x00, 0x00];
        assert_eq!(calc_crc(&msg), 0xF9FB);
    }

    #[test]
    fn encode_frame() {
        let frame = encode(0x01, &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(&frame[..], &FRAME);
    }

    #[test]
    fn crc_trails_little_endian() {
        let frame = encode(0x01, &[0x03, 0x08, 0x2B, 0x00, 0x02]);
        let crc = calc_crc(&frame[..frame.len() - 2]);
        assert_eq!(LittleEndian::read_u16(&frame[frame.len() - 2..]), crc);
    }

    #[test]
    fn decode_frame_immediately_without_timeout() {
        let mut decoder = Decoder::default();
        let mut events = Vec::new();
        decoder.feed(&FRAME, &mut events);
        assert_eq!(events.len(), 1);
        let FrameEvent::Adu(adu) = &events[0] else {
            panic!("unexpected event: {events:?}");
        };
        assert_eq!(adu.unit, 0x01);
        assert_eq!(&adu.pdu[..], &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(adu.checksum, Some(0xCDC5));
        assert_eq!(adu.transaction_id, None);
    }

    #[test]
    fn single_byte_corruption_fails_the_checksum() {
        for i in 0..FRAME.len() {
            let mut frame = FRAME;
            frame[i] ^= 0x40;
            let mut decoder = Decoder::default();
            let mut events = Vec::new();
            decoder.feed(&frame, &mut events);
            assert!(
                matches!(events[..], [FrameEvent::Error(FrameError::Checksum { .. })]),
                "corrupted byte {i}: {events:?}"
            );
        }
    }

    #[test]
    fn frames_are_buffered_until_flush() {
        let mut decoder = Decoder::new(Duration::from_millis(10));
        let mut events = Vec::new();
        decoder.feed(&FRAME[..4], &mut events);
        assert!(events.is_empty());
        assert!(decoder.pending());
        decoder.feed(&FRAME[4..], &mut events);
        assert!(events.is_empty());

        decoder.flush(&mut events);
        assert!(!decoder.pending());
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], FrameEvent::Adu(adu) if adu.unit == 0x01));
    }

    #[test]
    fn one_event_per_fed_frame() {
        let mut decoder = Decoder::default();
        let mut events = Vec::new();
        for _ in 0..3 {
            decoder.feed(&FRAME, &mut events);
        }
        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .all(|ev| matches!(ev, FrameEvent::Adu(adu) if adu.unit == 0x01)));
    }

    #[test]
    fn undersized_frame_is_rejected() {
        let mut decoder = Decoder::default();
        let mut events = Vec::new();
        decoder.feed(&FRAME[..4], &mut events);
        assert_eq!(events, vec![FrameEvent::Error(FrameError::TooShort)]);
    }

    #[test]
    fn buffer_overflow_discards_bytes() {
        let mut decoder = Decoder::with_max_buffer_length(Duration::from_millis(10), 16);
        let mut events = Vec::new();
        decoder.feed(&[0u8; 17], &mut events);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            FrameEvent::BufferOverflow(bytes) if bytes.len() == 17
        ));
        assert!(!decoder.pending());
    }
}
