// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Modbus message catalogue and the application data unit.

pub mod file;

use std::{error, fmt};

use bytes::Bytes;

use crate::error::{Error, FrameError, Result};

pub use self::file::{FileRecord, FileSubRequest, FileSubResponse};

/// The slave address carried in every ADU, `0..=255`.
///
/// IP framing calls this byte the *unit identifier*, serial framing the
/// *slave address*; this library sticks to *unit* throughout.
pub type UnitId = u8;

/// A 16-bit data-table offset.
///
/// Offsets start at zero on the wire. Device manuals frequently number
/// coils and registers from one instead, in which case the documented
/// number minus one is what goes into a request.
pub type Address = u16;

/// The state of one coil or discrete input.
///
/// Requests and responses use plain `bool`s; the `0xFF00`/`0x0000` wire
/// encoding is confined to the codecs.
pub type Coil = bool;

/// One 16-bit register value, transmitted big-endian.
pub type Word = u16;

/// How many coils or registers an operation covers.
pub type Quantity = u16;

/// Added to a function code to mark a response as an exception response.
pub(crate) const EXCEPTION_FLAG: u8 = 0x80;

/// The function codes covered by this library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    /// `0x01`
    ReadCoils,
    /// `0x02`
    ReadDiscreteInputs,
    /// `0x03`
    ReadHoldingRegisters,
    /// `0x04`
    ReadInputRegisters,
    /// `0x05`
    WriteSingleCoil,
    /// `0x06`
    WriteSingleRegister,
    /// `0x0F`
    WriteMultipleCoils,
    /// `0x10`
    WriteMultipleRegisters,
    /// `0x14`
    ReadFileRecord,
    /// `0x15`
    WriteFileRecord,
    /// `0x17`
    ReadWriteMultipleRegisters,
}

impl FunctionCode {
    /// Look up the catalogue entry for a raw function code.
    ///
    /// Exception-response codes (`> 0x80`) are not resolved here; strip
    /// the flag first.
    #[must_use]
    pub fn new(value: u8) -> Option<Self> {
        let code = match value {
            0x01 => Self::ReadCoils,
            0x02 => Self::ReadDiscreteInputs,
            0x03 => Self::ReadHoldingRegisters,
            0x04 => Self::ReadInputRegisters,
            0x05 => Self::WriteSingleCoil,
            0x06 => Self::WriteSingleRegister,
            0x0F => Self::WriteMultipleCoils,
            0x10 => Self::WriteMultipleRegisters,
            0x14 => Self::ReadFileRecord,
            0x15 => Self::WriteFileRecord,
            0x17 => Self::ReadWriteMultipleRegisters,
            _ => return None,
        };
        Some(code)
    }

    /// The raw function code.
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::ReadCoils => 0x01,
            Self::ReadDiscreteInputs => 0x02,
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleCoil => 0x05,
            Self::WriteSingleRegister => 0x06,
            Self::WriteMultipleCoils => 0x0F,
            Self::WriteMultipleRegisters => 0x10,
            Self::ReadFileRecord => 0x14,
            Self::WriteFileRecord => 0x15,
            Self::ReadWriteMultipleRegisters => 0x17,
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:0>2X}", self.value())
    }
}

/// A slave exception code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    SlaveDeviceFailure = 0x04,
    Acknowledge = 0x05,
    SlaveDeviceBusy = 0x06,
    NegativeAcknowledge = 0x07,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDevice = 0x0B,
}

impl ExceptionCode {
    /// Look up the exception code for a raw byte.
    #[must_use]
    pub fn new(value: u8) -> Option<Self> {
        let code = match value {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::SlaveDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::SlaveDeviceBusy,
            0x07 => Self::NegativeAcknowledge,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetDevice,
            _ => return None,
        };
        Some(code)
    }

    /// The raw exception code.
    #[must_use]
    pub const fn value(self) -> u8 {
        self as u8
    }

    pub(crate) fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal function",
            Self::IllegalDataAddress => "Illegal data address",
            Self::IllegalDataValue => "Illegal data value",
            Self::SlaveDeviceFailure => "Slave device failure",
            Self::Acknowledge => "Acknowledge",
            Self::SlaveDeviceBusy => "Slave device busy",
            Self::NegativeAcknowledge => "Negative acknowledge",
            Self::MemoryParityError => "Memory parity error",
            Self::GatewayPathUnavailable => "Gateway path unavailable",
            Self::GatewayTargetDevice => "Gateway target device failed to respond",
        }
    }
}

impl TryFrom<u8> for ExceptionCode {
    type Error = FrameError;

    fn try_from(value: u8) -> std::result::Result<Self, FrameError> {
        Self::new(value).ok_or(FrameError::ExceptionCode(value))
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl error::Error for ExceptionCode {}

/// A request represents a message from the master (client) to the
/// slave (server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils(Address, Quantity),
    ReadDiscreteInputs(Address, Quantity),
    ReadHoldingRegisters(Address, Quantity),
    ReadInputRegisters(Address, Quantity),
    WriteSingleCoil(Address, Coil),
    WriteSingleRegister(Address, Word),
    WriteMultipleCoils(Address, Vec<Coil>),
    WriteMultipleRegisters(Address, Vec<Word>),
    ReadFileRecord(Vec<FileSubRequest>),
    WriteFileRecord(Vec<FileRecord>),
    ReadWriteMultipleRegisters(Address, Quantity, Address, Vec<Word>),
}

/// The data of a successful request.
///
/// `ReadCoils`/`ReadDiscreteInputs`: the length of the result `Vec` is
/// always a multiple of 8. Only the values of the first bits/coils that
/// have actually been requested are defined. The value of the remaining
/// bits depend on the slave implementation and those coils should be
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ReadCoils(Vec<Coil>),
    ReadDiscreteInputs(Vec<Coil>),
    ReadHoldingRegisters(Vec<Word>),
    ReadInputRegisters(Vec<Word>),
    WriteSingleCoil(Address, Coil),
    WriteSingleRegister(Address, Word),
    WriteMultipleCoils(Address, Quantity),
    WriteMultipleRegisters(Address, Quantity),
    ReadFileRecord(Vec<FileSubResponse>),
    WriteFileRecord(Vec<FileRecord>),
    ReadWriteMultipleRegisters(Vec<Word>),
}

impl Request {
    /// The function code of this request.
    #[must_use]
    pub const fn function_code(&self) -> FunctionCode {
        use Request::*;
        match self {
            ReadCoils(_, _) => FunctionCode::ReadCoils,
            ReadDiscreteInputs(_, _) => FunctionCode::ReadDiscreteInputs,
            ReadHoldingRegisters(_, _) => FunctionCode::ReadHoldingRegisters,
            ReadInputRegisters(_, _) => FunctionCode::ReadInputRegisters,
            WriteSingleCoil(_, _) => FunctionCode::WriteSingleCoil,
            WriteSingleRegister(_, _) => FunctionCode::WriteSingleRegister,
            WriteMultipleCoils(_, _) => FunctionCode::WriteMultipleCoils,
            WriteMultipleRegisters(_, _) => FunctionCode::WriteMultipleRegisters,
            ReadFileRecord(_) => FunctionCode::ReadFileRecord,
            WriteFileRecord(_) => FunctionCode::WriteFileRecord,
            ReadWriteMultipleRegisters(_, _, _, _) => FunctionCode::ReadWriteMultipleRegisters,
        }
    }

    /// Check all field ranges.
    ///
    /// Called by the encoder before any bytes are produced; also useful
    /// to validate a request built from untrusted input up front.
    pub fn validate(&self) -> Result<()> {
        use Request::*;
        match self {
            ReadCoils(address, quantity) | ReadDiscreteInputs(address, quantity) => {
                check_quantity("quantity", *quantity, 1, 2000)?;
                check_address_range("address", *address, *quantity)
            }
            ReadHoldingRegisters(address, quantity) | ReadInputRegisters(address, quantity) => {
                check_quantity("quantity", *quantity, 1, 125)?;
                check_address_range("address", *address, *quantity)
            }
            WriteSingleCoil(_, _) | WriteSingleRegister(_, _) => Ok(()),
            WriteMultipleCoils(address, coils) => {
                let quantity = check_len("states", coils.len(), 1, 1968)?;
                check_address_range("address", *address, quantity)
            }
            WriteMultipleRegisters(address, words) => {
                let quantity = check_len("values", words.len(), 1, 123)?;
                check_address_range("address", *address, quantity)
            }
            ReadFileRecord(sub_requests) => {
                check_len("subRequests", sub_requests.len(), 1, 35)?;
                sub_requests.iter().try_for_each(FileSubRequest::validate)
            }
            WriteFileRecord(records) => {
                check_len("subRequests", records.len(), 1, 27)?;
                records.iter().try_for_each(FileRecord::validate)
            }
            ReadWriteMultipleRegisters(_, read_quantity, _, write_words) => {
                check_quantity("readQuantity", *read_quantity, 1, 125)?;
                check_len("writeValues", write_words.len(), 1, 121)?;
                Ok(())
            }
        }
    }
}

impl Response {
    /// The function code of this response.
    #[must_use]
    pub const fn function_code(&self) -> FunctionCode {
        use Response::*;
        match self {
            ReadCoils(_) => FunctionCode::ReadCoils,
            ReadDiscreteInputs(_) => FunctionCode::ReadDiscreteInputs,
            ReadHoldingRegisters(_) => FunctionCode::ReadHoldingRegisters,
            ReadInputRegisters(_) => FunctionCode::ReadInputRegisters,
            WriteSingleCoil(_, _) => FunctionCode::WriteSingleCoil,
            WriteSingleRegister(_, _) => FunctionCode::WriteSingleRegister,
            WriteMultipleCoils(_, _) => FunctionCode::WriteMultipleCoils,
            WriteMultipleRegisters(_, _) => FunctionCode::WriteMultipleRegisters,
            ReadFileRecord(_) => FunctionCode::ReadFileRecord,
            WriteFileRecord(_) => FunctionCode::WriteFileRecord,
            ReadWriteMultipleRegisters(_) => FunctionCode::ReadWriteMultipleRegisters,
        }
    }

    /// Check all field ranges.
    pub fn validate(&self) -> Result<()> {
        use Response::*;
        match self {
            ReadCoils(coils) | ReadDiscreteInputs(coils) => {
                check_len("states", coils.len(), 1, 2000).map(drop)
            }
            ReadHoldingRegisters(words) | ReadInputRegisters(words)
            | ReadWriteMultipleRegisters(words) => check_len("data", words.len(), 1, 125).map(drop),
            WriteSingleCoil(_, _) | WriteSingleRegister(_, _) => Ok(()),
            WriteMultipleCoils(_, quantity) => check_quantity("quantity", *quantity, 1, 1968),
            WriteMultipleRegisters(_, quantity) => check_quantity("quantity", *quantity, 1, 123),
            ReadFileRecord(sub_responses) => {
                check_len("subResponses", sub_responses.len(), 1, 35)?;
                sub_responses.iter().try_for_each(FileSubResponse::validate)
            }
            WriteFileRecord(records) => {
                check_len("subResponses", records.len(), 1, 27)?;
                records.iter().try_for_each(FileRecord::validate)
            }
        }
    }
}

fn check_quantity(field: &'static str, value: Quantity, min: u16, max: u16) -> Result<()> {
    if value < min || value > max {
        return Err(Error::InvalidArgument {
            field,
            reason: "out of range",
        });
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn check_len(field: &'static str, len: usize, min: usize, max: usize) -> Result<Quantity> {
    if len < min || len > max {
        return Err(Error::InvalidArgument {
            field,
            reason: "length out of range",
        });
    }
    Ok(len as Quantity)
}

fn check_address_range(field: &'static str, address: Address, quantity: Quantity) -> Result<()> {
    if usize::from(address) + usize::from(quantity) > 0x1_0000 {
        return Err(Error::InvalidArgument {
            field,
            reason: "address range exceeds 0xFFFF",
        });
    }
    Ok(())
}

/// Convert a possibly signed register value into its wire form.
///
/// Accepts `-32768..=65535`; negative values wrap into the upper half
/// of the unsigned range.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn word_from_signed(value: i32) -> Result<Word> {
    if !(-0x8000..=0xFFFF).contains(&value) {
        return Err(Error::InvalidArgument {
            field: "value",
            reason: "must be within -32768..=65535",
        });
    }
    let value = if value < 0 { value + 0x1_0000 } else { value };
    Ok(value as Word)
}

/// A slave exception response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionResponse {
    /// The function code of the failed request (without the exception flag).
    pub function: u8,
    /// Why the request failed.
    pub exception: ExceptionCode,
}

impl fmt::Display for ExceptionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus function {}: {}", self.function, self.exception)
    }
}

impl error::Error for ExceptionResponse {}

/// Represents a message from the master (client) to the slave (server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPdu(pub Request);

impl From<Request> for RequestPdu {
    fn from(from: Request) -> Self {
        RequestPdu(from)
    }
}

impl From<RequestPdu> for Request {
    fn from(from: RequestPdu) -> Self {
        from.0
    }
}

/// Represents a message from the slave (server) to the master (client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePdu(pub std::result::Result<Response, ExceptionResponse>);

impl From<Response> for ResponsePdu {
    fn from(from: Response) -> Self {
        ResponsePdu(Ok(from))
    }
}

impl From<ExceptionResponse> for ResponsePdu {
    fn from(from: ExceptionResponse) -> Self {
        ResponsePdu(Err(from))
    }
}

impl From<ResponsePdu> for std::result::Result<Response, ExceptionResponse> {
    fn from(from: ResponsePdu) -> Self {
        from.0
    }
}

/// One complete application data unit, framing stripped.
///
/// `transaction_id` is carried by IP framing only; `checksum` by RTU
/// (CRC-16) and ASCII (LRC) framing only. The first byte of `pdu` is the
/// function code; decoders never produce an empty `pdu`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    pub transaction_id: Option<u16>,
    pub unit: UnitId,
    pub pdu: Bytes,
    pub checksum: Option<u16>,
}

impl Adu {
    /// The raw function code, i.e. the first PDU byte.
    #[must_use]
    pub fn function_code(&self) -> u8 {
        debug_assert!(!self.pdu.is_empty());
        self.pdu[0]
    }

    /// `true` if the PDU carries an exception response.
    #[must_use]
    pub fn is_exception(&self) -> bool {
        self.function_code() > EXCEPTION_FLAG
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Request::*;
        match self {
            ReadCoils(address, quantity) => {
                write!(f, "ReadCoils (start: {address}, quantity: {quantity})")
            }
            ReadDiscreteInputs(address, quantity) => write!(
                f,
                "ReadDiscreteInputs (start: {address}, quantity: {quantity})"
            ),
            ReadHoldingRegisters(address, quantity) => write!(
                f,
                "ReadHoldingRegisters (start: {address}, quantity: {quantity})"
            ),
            ReadInputRegisters(address, quantity) => write!(
                f,
                "ReadInputRegisters (start: {address}, quantity: {quantity})"
            ),
            WriteSingleCoil(address, state) => {
                write!(f, "WriteSingleCoil (address: {address}, state: {state})")
            }
            WriteSingleRegister(address, value) => {
                write!(f, "WriteSingleRegister (address: {address}, value: {value})")
            }
            WriteMultipleCoils(address, coils) => write!(
                f,
                "WriteMultipleCoils (start: {address}, quantity: {})",
                coils.len()
            ),
            WriteMultipleRegisters(address, words) => write!(
                f,
                "WriteMultipleRegisters (start: {address}, quantity: {})",
                words.len()
            ),
            ReadFileRecord(sub_requests) => {
                write!(f, "ReadFileRecord ({} sub-requests)", sub_requests.len())
            }
            WriteFileRecord(records) => {
                write!(f, "WriteFileRecord ({} sub-requests)", records.len())
            }
            ReadWriteMultipleRegisters(read_address, read_quantity, write_address, words) => {
                write!(
                    f,
                    "ReadWriteMultipleRegisters (read start: {read_address}, read quantity: \
                     {read_quantity}, write start: {write_address}, write quantity: {})",
                    words.len()
                )
            }
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Response::*;
        match self {
            ReadCoils(coils) | ReadDiscreteInputs(coils) => {
                write!(f, "{} ({} states)", self.function_code(), coils.len())
            }
            ReadHoldingRegisters(words) | ReadInputRegisters(words)
            | ReadWriteMultipleRegisters(words) => {
                write!(f, "{} ({} registers)", self.function_code(), words.len())
            }
            WriteSingleCoil(address, state) => {
                write!(f, "WriteSingleCoil (address: {address}, state: {state})")
            }
            WriteSingleRegister(address, value) => {
                write!(f, "WriteSingleRegister (address: {address}, value: {value})")
            }
            WriteMultipleCoils(address, quantity) => write!(
                f,
                "WriteMultipleCoils (start: {address}, quantity: {quantity})"
            ),
            WriteMultipleRegisters(address, quantity) => write!(
                f,
                "WriteMultipleRegisters (start: {address}, quantity: {quantity})"
            ),
            ReadFileRecord(sub_responses) => {
                write!(f, "ReadFileRecord ({} sub-responses)", sub_responses.len())
            }
            WriteFileRecord(records) => {
                write!(f, "WriteFileRecord ({} sub-responses)", records.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_code_round_trip() {
        for value in [
            0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0F, 0x10, 0x14, 0x15, 0x17,
        ] {
            assert_eq!(FunctionCode::new(value).unwrap().value(), value);
        }
        assert_eq!(FunctionCode::new(0x07), None);
        assert_eq!(FunctionCode::new(0x81), None);
    }

    #[test]
    fn exception_code_round_trip() {
        for value in [1u8, 2, 3, 4, 5, 6, 7, 8, 0x0A, 0x0B] {
            assert_eq!(ExceptionCode::new(value).unwrap().value(), value);
        }
        assert_eq!(ExceptionCode::new(0), None);
        assert_eq!(ExceptionCode::new(9), None);
        assert_eq!(ExceptionCode::new(0x0C), None);
    }

    #[test]
    fn validate_read_coils_quantity() {
        assert!(Request::ReadCoils(0, 1).validate().is_ok());
        assert!(Request::ReadCoils(0, 2000).validate().is_ok());
        assert!(Request::ReadCoils(0, 0).validate().is_err());
        assert!(Request::ReadCoils(0, 2001).validate().is_err());
    }

    #[test]
    fn validate_address_overflow() {
        assert!(Request::ReadCoils(0xFFFF, 1).validate().is_ok());
        assert!(Request::ReadCoils(0xFFFF, 2).validate().is_err());
        assert!(Request::ReadHoldingRegisters(0xFF90, 113).validate().is_ok());
        assert!(Request::ReadHoldingRegisters(0xFF90, 125).validate().is_err());
    }

    #[test]
    fn validate_write_multiple() {
        assert!(Request::WriteMultipleCoils(0, vec![true; 1968])
            .validate()
            .is_ok());
        assert!(Request::WriteMultipleCoils(0, vec![true; 1969])
            .validate()
            .is_err());
        assert!(Request::WriteMultipleRegisters(0, vec![0; 123])
            .validate()
            .is_ok());
        assert!(Request::WriteMultipleRegisters(0, vec![0; 124])
            .validate()
            .is_err());
        assert!(Request::WriteMultipleRegisters(0, vec![])
            .validate()
            .is_err());
    }

    #[test]
    fn validate_read_write_multiple() {
        assert!(
            Request::ReadWriteMultipleRegisters(0, 125, 0, vec![0; 121])
                .validate()
                .is_ok()
        );
        assert!(
            Request::ReadWriteMultipleRegisters(0, 126, 0, vec![0; 121])
                .validate()
                .is_err()
        );
        assert!(
            Request::ReadWriteMultipleRegisters(0, 1, 0, vec![0; 122])
                .validate()
                .is_err()
        );
    }

    #[test]
    fn signed_register_values() {
        assert_eq!(word_from_signed(0).unwrap(), 0);
        assert_eq!(word_from_signed(-1).unwrap(), 0xFFFF);
        assert_eq!(word_from_signed(-32768).unwrap(), 0x8000);
        assert_eq!(word_from_signed(65535).unwrap(), 0xFFFF);
        assert!(word_from_signed(-32769).is_err());
        assert!(word_from_signed(65536).is_err());
    }

    #[test]
    fn exception_response_display() {
        let rsp = ExceptionResponse {
            function: 2,
            exception: ExceptionCode::IllegalDataValue,
        };
        assert_eq!(format!("{rsp}"), "Modbus function 2: Illegal data value");
    }
}
