// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MBAP (Modbus TCP/IP) framing.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    error::FrameError,
    frame::{Adu, UnitId},
};

use super::{FrameEvent, DEFAULT_MAX_BUFFER_LENGTH};

pub(crate) const HEADER_LEN: usize = 7;

const PROTOCOL_ID: u16 = 0x0000;

/// Encode one MBAP frame.
#[must_use]
pub fn encode(transaction_id: u16, unit: UnitId, pdu: &[u8]) -> Bytes {
    debug_assert!(!pdu.is_empty());
    let mut buf = BytesMut::with_capacity(HEADER_LEN + pdu.len());
    buf.put_u16(transaction_id);
    buf.put_u16(PROTOCOL_ID);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16((pdu.len() + 1) as u16);
    buf.put_u8(unit);
    buf.put_slice(pdu);
    buf.freeze()
}

/// Rewrite the transaction id of an already-encoded frame.
pub fn update_transaction_id(frame: &mut [u8], transaction_id: u16) -> bool {
    if frame.len() < 2 {
        return false;
    }
    BigEndian::write_u16(&mut frame[0..2], transaction_id);
    true
}

/// Decode one complete MBAP frame.
///
/// Mostly useful for tests; production code feeds the streaming
/// [`Decoder`].
pub fn decode(frame: &[u8]) -> Result<Adu, FrameError> {
    let mut decoder = Decoder::default();
    let mut events = Vec::new();
    decoder.feed(frame, &mut events);
    match events.pop() {
        Some(FrameEvent::Adu(adu)) if events.is_empty() => Ok(adu),
        Some(FrameEvent::Error(err)) => Err(err),
        _ => Err(FrameError::Incomplete),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    transaction_id: u16,
    length: u16,
    unit: UnitId,
}

/// Streaming MBAP decoder, resumable across arbitrary chunk boundaries.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    /// Parsed header of the frame currently being reassembled.
    header: Option<Header>,
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
            header: None,
            max_buffer_length,
        }
    }

    /// Buffer a chunk and emit one event per complete or malformed frame.
    pub fn feed(&mut self, chunk: &[u8], events: &mut Vec<FrameEvent>) {
        self.buf.extend_from_slice(chunk);
        loop {
            if self.header.is_none() {
                if self.buf.len() < HEADER_LEN {
                    break;
                }
                match self.parse_header() {
                    Ok(header) => self.header = Some(header),
                    Err(err) => {
                        // An MBAP stream offers no resynchronization
                        // point, so the buffered bytes are unusable.
                        log::warn!("Discarding {} byte(s) after {err}", self.buf.len());
                        self.buf.clear();
                        events.push(FrameEvent::Error(err));
                        break;
                    }
                }
            }

            let Some(header) = self.header else {
                break;
            };
            let pdu_len = usize::from(header.length) - 1;
            if self.buf.len() < pdu_len {
                break;
            }
            let pdu = self.buf.split_to(pdu_len).freeze();
            self.header = None;
            events.push(FrameEvent::Adu(Adu {
                transaction_id: Some(header.transaction_id),
                unit: header.unit,
                pdu,
                checksum: None,
            }));
        }

        if self.buf.len() > self.max_buffer_length {
            let discarded = self.buf.split().freeze();
            self.header = None;
            log::warn!("Reassembly buffer overflow, discarding {} byte(s)", discarded.len());
            events.push(FrameEvent::BufferOverflow(discarded));
        }
    }

    fn parse_header(&mut self) -> Result<Header, FrameError> {
        debug_assert!(self.buf.len() >= HEADER_LEN);
        let protocol_id = BigEndian::read_u16(&self.buf[2..4]);
        if protocol_id != PROTOCOL_ID {
            return Err(FrameError::ProtocolId(protocol_id));
        }
        let length = BigEndian::read_u16(&self.buf[4..6]);
        if length < 2 {
            return Err(FrameError::Length(length));
        }
        let header_data = self.buf.split_to(HEADER_LEN);
        Ok(Header {
            transaction_id: BigEndian::read_u16(&header_data[0..2]),
            length,
            unit: header_data[6],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: [u8; 12] = [
        0x00, 0x01, // transaction id
        0x00, 0x00, // protocol id
        0x00, 0x06, // length
        0xFF, // unit
        0x03, 0x00, 0x00, 0x00, 0x0A, // pdu
    ];

    fn feed(decoder: &mut Decoder, chunk: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        decoder.feed(chunk, &mut events);
        events
    }

    #[test]
    fn encode_frame() {
        let frame = encode(0x0001, 0xFF, &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(&frame[..], &FRAME);
    }

    #[test]
    fn encoded_length_field_covers_unit_and_pdu() {
        let pdu = [0x03, 0x00, 0x00, 0x00, 0x0A];
        let frame = encode(0, 0x11, &pdu);
        assert_eq!(BigEndian::read_u16(&frame[4..6]), pdu.len() as u16 + 1);
        assert_eq!(BigEndian::read_u16(&frame[2..4]), 0);
    }

    #[test]
    fn rewrite_transaction_id() {
        let mut frame = BytesMut::from(&FRAME[..]);
        assert!(update_transaction_id(&mut frame, 0x1234));
        assert_eq!(&frame[0..2], &[0x12, 0x34]);
        assert_eq!(&frame[2..], &FRAME[2..]);
    }

    #[test]
    fn decode_single_frame() {
        let mut decoder = Decoder::default();
        let events = feed(&mut decoder, &FRAME);
        assert_eq!(events.len(), 1);
        let FrameEvent::Adu(adu) = &events[0] else {
            panic!("unexpected event: {events:?}");
        };
        assert_eq!(adu.transaction_id, Some(1));
        assert_eq!(adu.unit, 0xFF);
        assert_eq!(&adu.pdu[..], &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(adu.checksum, None);
    }

    #[test]
    fn decode_across_every_split_point() {
        for split in 1..FRAME.len() {
            let mut decoder = Decoder::default();
            let mut events = feed(&mut decoder, &FRAME[..split]);
            events.extend(feed(&mut decoder, &FRAME[split..]));
            assert_eq!(events.len(), 1, "split at {split}");
            assert!(matches!(&events[0], FrameEvent::Adu(adu) if adu.transaction_id == Some(1)));
        }
    }

    #[test]
    fn decode_back_to_back_frames() {
        let mut frames = Vec::new();
        frames.extend_from_slice(&FRAME);
        frames.extend_from_slice(&FRAME);
        frames.extend_from_slice(&FRAME);

        // Arbitrary chunking must not affect the event count.
        for chunk_len in [1, 5, 7, 12, 35] {
            let mut decoder = Decoder::default();
            let mut events = Vec::new();
            for chunk in frames.chunks(chunk_len) {
                decoder.feed(chunk, &mut events);
            }
            assert_eq!(events.len(), 3, "chunk length {chunk_len}");
            assert!(events
                .iter()
                .all(|ev| matches!(ev, FrameEvent::Adu(adu) if adu.unit == 0xFF)));
        }
    }

    #[test]
    fn reject_invalid_protocol_id() {
        let mut frame = FRAME;
        frame[3] = 0x01;
        let mut decoder = Decoder::default();
        let events = feed(&mut decoder, &frame);
        assert_eq!(events, vec![FrameEvent::Error(FrameError::ProtocolId(1))]);
    }

    #[test]
    fn reject_undersized_length() {
        let mut frame = FRAME;
        frame[5] = 0x01;
        let mut decoder = Decoder::default();
        let events = feed(&mut decoder, &frame);
        assert_eq!(events, vec![FrameEvent::Error(FrameError::Length(1))]);
    }

    #[test]
    fn buffer_overflow_discards_bytes() {
        let mut decoder = Decoder::with_max_buffer_length(16);
        // A header announcing more payload than the buffer may hold.
        let mut frame = FRAME.to_vec();
        frame[4] = 0x01; // length = 0x0106
        frame.extend_from_slice(&[0u8; 20]);
        let events = feed(&mut decoder, &frame);
        assert_eq!(events.len(), 1);
        let FrameEvent::BufferOverflow(discarded) = &events[0] else {
            panic!("unexpected event: {events:?}");
        };
        assert_eq!(discarded.len(), frame.len() - HEADER_LEN);
    }
}
