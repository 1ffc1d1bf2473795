// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Framing transport selection and request/response matching.

use std::{collections::HashMap, time::Duration};

use bytes::{Bytes, BytesMut};

use crate::{
    codec::{self, FrameEvent, DEFAULT_MAX_BUFFER_LENGTH},
    error::Result,
    frame::{Adu, UnitId},
    master::transaction::{Transaction, TransactionId},
};

/// Which framing wraps the PDUs on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportConfig {
    /// MBAP framing (Modbus TCP/IP), multiplexed by transaction id.
    Ip,
    /// RTU framing delimited by inter-frame silence.
    Rtu {
        /// Inter-frame silence. [`Duration::ZERO`] decodes every chunk
        /// of received bytes as one complete frame.
        eof_timeout: Duration,
    },
    /// ASCII framing, `:` … CR LF.
    Ascii,
}

/// A streaming decoder for any of the three framings.
#[derive(Debug)]
pub(crate) enum FrameDecoder {
    Ip(codec::ip::Decoder),
    Rtu(codec::rtu::Decoder),
    Ascii(codec::ascii::Decoder),
}

impl FrameDecoder {
    pub(crate) fn new(config: TransportConfig, max_buffer_length: usize) -> Self {
        match config {
            TransportConfig::Ip => {
                Self::Ip(codec::ip::Decoder::with_max_buffer_length(max_buffer_length))
            }
            TransportConfig::Rtu { eof_timeout } => Self::Rtu(
                codec::rtu::Decoder::with_max_buffer_length(eof_timeout, max_buffer_length),
            ),
            TransportConfig::Ascii => Self::Ascii(codec::ascii::Decoder::with_max_buffer_length(
                max_buffer_length,
            )),
        }
    }

    pub(crate) fn feed(&mut self, chunk: &[u8], events: &mut Vec<FrameEvent>) {
        match self {
            Self::Ip(decoder) => decoder.feed(chunk, events),
            Self::Rtu(decoder) => decoder.feed(chunk, events),
            Self::Ascii(decoder) => decoder.feed(chunk, events),
        }
    }

    /// The end-of-frame timeout to (re)arm after the last fed chunk, if
    /// the framing is time-delimited and bytes are buffered.
    pub(crate) fn eof_pending(&self) -> Option<Duration> {
        match self {
            Self::Rtu(decoder) if !decoder.eof_timeout().is_zero() && decoder.pending() => {
                Some(decoder.eof_timeout())
            }
            _ => None,
        }
    }

    /// Consume buffered bytes as one frame after the end-of-frame timer
    /// expired. A no-op for stream-delimited framings.
    pub(crate) fn flush(&mut self, events: &mut Vec<FrameEvent>) {
        if let Self::Rtu(decoder) = self {
            decoder.flush(events);
        }
    }
}

/// Encode a PDU into a complete frame for the configured framing.
pub(crate) fn encode_adu(
    config: TransportConfig,
    transaction_id: u16,
    unit: UnitId,
    pdu: &[u8],
) -> Bytes {
    match config {
        TransportConfig::Ip => codec::ip::encode(transaction_id, unit, pdu),
        TransportConfig::Rtu { .. } => codec::rtu::encode(unit, pdu),
        TransportConfig::Ascii => codec::ascii::encode(unit, pdu),
    }
}

/// Pairs requests with responses.
///
/// IP framing multiplexes on the MBAP transaction id and admits many
/// in-flight transactions; the serial framings carry no correlation
/// token, so a response always belongs to the single outstanding
/// transaction.
#[derive(Debug)]
enum Matcher {
    Ip {
        next_id: u16,
        outstanding: HashMap<u16, TransactionId>,
    },
    Serial {
        outstanding: Option<TransactionId>,
    },
}

/// The master-side transport: framing codec plus matching state.
#[derive(Debug)]
pub(crate) struct MasterTransport {
    config: TransportConfig,
    decoder: FrameDecoder,
    matcher: Matcher,
}

impl MasterTransport {
    pub(crate) fn new(config: TransportConfig) -> Self {
        let matcher = match config {
            TransportConfig::Ip => Matcher::Ip {
                next_id: 0,
                outstanding: HashMap::new(),
            },
            TransportConfig::Rtu { .. } | TransportConfig::Ascii => {
                Matcher::Serial { outstanding: None }
            }
        };
        Self {
            config,
            decoder: FrameDecoder::new(config, DEFAULT_MAX_BUFFER_LENGTH),
            matcher,
        }
    }

    /// `true` if another request may be dispatched right now.
    pub(crate) fn can_send(&self) -> bool {
        match &self.matcher {
            Matcher::Ip { .. } => true,
            Matcher::Serial { outstanding } => outstanding.is_none(),
        }
    }

    /// Encode (or re-stamp) the transaction's frame and register it as
    /// outstanding. The encoded frame is cached on the transaction so a
    /// retry only rewrites the transaction id.
    pub(crate) fn prepare(&mut self, txn: &mut Transaction) -> Result<Bytes> {
        match &mut self.matcher {
            Matcher::Ip {
                next_id,
                outstanding,
            } => {
                let transaction_id = *next_id;
                // Wrap within 0..=0xFFFE.
                *next_id = if *next_id >= 0xFFFE { 0 } else { *next_id + 1 };
                if txn.encoded.is_none() {
                    let pdu = txn.request.encode()?;
                    let frame = codec::ip::encode(transaction_id, txn.unit, &pdu);
                    txn.encoded = Some(BytesMut::from(&frame[..]));
                }
                let Some(frame) = txn.encoded.as_mut() else {
                    unreachable!()
                };
                codec::ip::update_transaction_id(frame, transaction_id);
                txn.last_transaction_id = Some(transaction_id);
                outstanding.insert(transaction_id, txn.id);
                Ok(Bytes::copy_from_slice(frame))
            }
            Matcher::Serial { outstanding } => {
                if txn.encoded.is_none() {
                    let pdu = txn.request.encode()?;
                    let frame = encode_adu(self.config, 0, txn.unit, &pdu);
                    txn.encoded = Some(BytesMut::from(&frame[..]));
                }
                let Some(frame) = txn.encoded.as_ref() else {
                    unreachable!()
                };
                *outstanding = Some(txn.id);
                Ok(Bytes::copy_from_slice(frame))
            }
        }
    }

    /// Resolve an incoming ADU to the transaction it answers.
    ///
    /// Unknown transaction ids yield `None`; the frame is dropped.
    pub(crate) fn match_adu(&mut self, adu: &Adu) -> Option<TransactionId> {
        match &mut self.matcher {
            Matcher::Ip { outstanding, .. } => adu
                .transaction_id
                .and_then(|transaction_id| outstanding.remove(&transaction_id)),
            Matcher::Serial { outstanding } => outstanding.take(),
        }
    }

    /// Drop the outstanding registration of a transaction, e.g. after
    /// its response timed out.
    pub(crate) fn forget(&mut self, txn: &Transaction) {
        match &mut self.matcher {
            Matcher::Ip { outstanding, .. } => {
                if let Some(transaction_id) = txn.last_transaction_id {
                    outstanding.remove(&transaction_id);
                }
            }
            Matcher::Serial { outstanding } => {
                if *outstanding == Some(txn.id) {
                    *outstanding = None;
                }
            }
        }
    }

    /// The transaction a serial frame error belongs to, if any.
    pub(crate) fn serial_outstanding(&self) -> Option<TransactionId> {
        match &self.matcher {
            Matcher::Ip { .. } => None,
            Matcher::Serial { outstanding } => *outstanding,
        }
    }

    pub(crate) fn feed(&mut self, chunk: &[u8], events: &mut Vec<FrameEvent>) {
        self.decoder.feed(chunk, events);
    }

    pub(crate) fn eof_pending(&self) -> Option<Duration> {
        self.decoder.eof_pending()
    }

    pub(crate) fn flush(&mut self, events: &mut Vec<FrameEvent>) {
        self.decoder.flush(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Request;
    use tokio::sync::mpsc;

    fn transaction(id: TransactionId) -> (Transaction, mpsc::UnboundedReceiver<crate::master::TransactionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Transaction::new(
                id,
                Request::ReadHoldingRegisters(0, 1),
                0x11,
                0,
                Duration::from_millis(100),
                None,
                event_tx,
            ),
            event_rx,
        )
    }

    #[test]
    fn ip_transaction_ids_are_monotonic_and_wrap() {
        let mut transport = MasterTransport::new(TransportConfig::Ip);
        let (mut txn, _rx) = transaction(1);
        let frame = transport.prepare(&mut txn).unwrap();
        assert_eq!(&frame[0..2], &[0x00, 0x00]);
        let frame = transport.prepare(&mut txn).unwrap();
        assert_eq!(&frame[0..2], &[0x00, 0x01]);

        let Matcher::Ip { next_id, .. } = &mut transport.matcher else {
            panic!("wrong matcher");
        };
        *next_id = 0xFFFE;
        let frame = transport.prepare(&mut txn).unwrap();
        assert_eq!(&frame[0..2], &[0xFF, 0xFE]);
        let frame = transport.prepare(&mut txn).unwrap();
        assert_eq!(&frame[0..2], &[0x00, 0x00]);
    }

    #[test]
    fn ip_matches_by_transaction_id_and_drops_unknown() {
        let mut transport = MasterTransport::new(TransportConfig::Ip);
        let (mut txn, _rx) = transaction(7);
        let _ = transport.prepare(&mut txn).unwrap();

        let adu = Adu {
            transaction_id: Some(0),
            unit: 0x11,
            pdu: Bytes::from_static(&[0x03, 0x02, 0x00, 0x2A]),
            checksum: None,
        };
        assert_eq!(transport.match_adu(&adu), Some(7));
        // Consumed; a duplicate is unknown now.
        assert_eq!(transport.match_adu(&adu), None);
    }

    #[test]
    fn serial_admits_one_outstanding_transaction() {
        let mut transport = MasterTransport::new(TransportConfig::Rtu {
            eof_timeout: Duration::ZERO,
        });
        assert!(transport.can_send());
        let (mut txn, _rx) = transaction(3);
        let _ = transport.prepare(&mut txn).unwrap();
        assert!(!transport.can_send());

        let adu = Adu {
            transaction_id: None,
            unit: 0x11,
            pdu: Bytes::from_static(&[0x03, 0x02, 0x00, 0x2A]),
            checksum: Some(0),
        };
        assert_eq!(transport.match_adu(&adu), Some(3));
        assert!(transport.can_send());
    }

    #[test]
    fn forget_clears_the_outstanding_registration() {
        let mut transport = MasterTransport::new(TransportConfig::Ip);
        let (mut txn, _rx) = transaction(9);
        let _ = transport.prepare(&mut txn).unwrap();
        transport.forget(&txn);

        let adu = Adu {
            transaction_id: Some(0),
            unit: 0x11,
            pdu: Bytes::from_static(&[0x03, 0x02, 0x00, 0x2A]),
            checksum: None,
        };
        assert_eq!(transport.match_adu(&adu), None);
    }
}
