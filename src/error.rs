// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Library Error type

use thiserror::Error;

/// A specialized [`Result`](std::result::Result) type for Modbus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by this library.
#[derive(Debug, Error)]
pub enum Error {
    /// A message was constructed with an out-of-range field.
    #[error("invalid argument `{field}`: {reason}")]
    InvalidArgument {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: &'static str,
    },

    /// Malformed bytes on the wire. The frame is dropped and the
    /// transport keeps running.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),

    /// No response arrived within the transaction timeout.
    #[error("response timeout")]
    ResponseTimeout,

    /// A partial frame outgrew the reassembly buffer.
    #[error("incomplete frame exceeded the reassembly buffer")]
    IncompleteResponseFrame,

    /// A response decoded cleanly but does not belong to the request.
    #[error("invalid response data: {0}")]
    InvalidResponseData(&'static str),

    /// The transaction was cancelled before it produced a result.
    #[error("transaction cancelled")]
    Cancelled,

    /// The master or slave was destroyed while the operation was pending.
    #[error("instance destroyed")]
    Destroyed,

    /// General I/O error reported by a connection or listener.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frame-level decoding errors.
///
/// These never terminate the byte source they occurred on; the offending
/// frame is discarded and decoding resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The buffer ended in the middle of a fixed-length field.
    #[error("unexpected end of frame")]
    Incomplete,
    /// Invalid function code.
    #[error("invalid function code: 0x{0:0>2X}")]
    FnCode(u8),
    /// Invalid exception code inside an exception response.
    #[error("invalid exception code: 0x{0:0>2X}")]
    ExceptionCode(u8),
    /// The byte-count field disagrees with the payload.
    #[error("invalid byte count: {0}")]
    ByteCount(u8),
    /// Checksum verification failed (RTU CRC-16 or ASCII LRC).
    #[error("checksum mismatch: expected = 0x{expected:0>4X}, actual = 0x{actual:0>4X}")]
    Checksum {
        /// Checksum carried by the frame.
        expected: u16,
        /// Checksum computed over the received bytes.
        actual: u16,
    },
    /// MBAP protocol identifier is not zero.
    #[error("invalid protocol identifier: {0}")]
    ProtocolId(u16),
    /// MBAP length field is too small to carry a PDU.
    #[error("invalid data length: {0}")]
    Length(u16),
    /// A file-record sub-item carries a reference type other than `0x06`.
    #[error("invalid reference type: 0x{0:0>2X}")]
    ReferenceType(u8),
    /// An ASCII frame does not begin with `:`.
    #[error("invalid start delimiter: 0x{0:0>2X}")]
    StartDelimiter(u8),
    /// An ASCII frame contains a byte outside `0-9A-F`.
    #[error("invalid hex digit: 0x{0:0>2X}")]
    NonHexDigit(u8),
    /// The decoded ASCII payload is too short to carry unit, PDU and LRC.
    #[error("frame too short")]
    TooShort,
}
