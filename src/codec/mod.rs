// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bit-exact PDU codecs for the message catalogue.

pub mod ascii;
pub mod ip;
pub mod rtu;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    error::{FrameError, Result},
    frame::{
        file::REFERENCE_TYPE, Adu, Coil, ExceptionCode, ExceptionResponse, FileRecord,
        FileSubRequest, FileSubResponse, Quantity, Request, RequestPdu, Response, ResponsePdu,
        Word, EXCEPTION_FLAG,
    },
};

/// Upper bound for a framing decoder's reassembly buffer.
pub const DEFAULT_MAX_BUFFER_LENGTH: usize = 1000;

/// What a streaming framing decoder produced for a fed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// One complete, verified frame.
    Adu(Adu),
    /// A malformed frame was discarded; decoding continues.
    Error(FrameError),
    /// The reassembly buffer outgrew its cap; the discarded bytes are
    /// handed back so nothing is lost silently.
    BufferOverflow(Bytes),
}

/// A byte reader that tracks its offset and reports underflow explicitly.
#[derive(Debug)]
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn read_u8(&mut self) -> std::result::Result<u8, FrameError> {
        let byte = *self.buf.get(self.pos).ok_or(FrameError::Incomplete)?;
        self.pos += 1;
        Ok(byte)
    }

    pub(crate) fn read_u16(&mut self) -> std::result::Result<u16, FrameError> {
        let end = self.pos + 2;
        if end > self.buf.len() {
            return Err(FrameError::Incomplete);
        }
        let word = BigEndian::read_u16(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(word)
    }

    pub(crate) fn take(&mut self, len: usize) -> std::result::Result<&'a [u8], FrameError> {
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(FrameError::Incomplete);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

/// Canonical wire value of a coil state.
pub(crate) const fn bool_to_coil(state: bool) -> u16 {
    if state {
        0xFF00
    } else {
        0x0000
    }
}

/// Any non-zero value counts as `ON` on input; only the encoder is
/// required to produce the canonical `0xFF00`.
pub(crate) const fn coil_to_bool(coil: u16) -> bool {
    coil != 0
}

pub(crate) fn packed_coils_len(quantity: usize) -> usize {
    quantity.div_ceil(8)
}

/// Pack coil states LSB-first into bytes.
pub(crate) fn pack_coils(coils: &[Coil]) -> Vec<u8> {
    let mut packed = vec![0; packed_coils_len(coils.len())];
    for (i, coil) in coils.iter().enumerate() {
        packed[i / 8] |= u8::from(*coil) << (i % 8);
    }
    packed
}

/// Unpack `count` coil states from LSB-first packed bytes.
pub(crate) fn unpack_coils(bytes: &[u8], count: Quantity) -> Vec<Coil> {
    (0..count)
        .map(|i| (bytes[usize::from(i) / 8] >> (i % 8)) & 0b1 > 0)
        .collect()
}

fn put_words(data: &mut BytesMut, words: &[Word]) {
    for word in words {
        data.put_u16(*word);
    }
}

fn read_words(cursor: &mut Cursor<'_>, count: usize) -> std::result::Result<Vec<Word>, FrameError> {
    let mut words = Vec::with_capacity(count);
    for _ in 0..count {
        words.push(cursor.read_u16()?);
    }
    Ok(words)
}

#[allow(clippy::cast_possible_truncation)]
impl Request {
    /// Encode the request into a PDU, validating all fields first.
    pub fn encode(&self) -> Result<Bytes> {
        self.validate()?;
        use Request::*;
        let mut data = BytesMut::with_capacity(8);
        data.put_u8(self.function_code().value());
        match self {
            ReadCoils(address, quantity)
            | ReadDiscreteInputs(address, quantity)
            | ReadHoldingRegisters(address, quantity)
            | ReadInputRegisters(address, quantity) => {
                data.put_u16(*address);
                data.put_u16(*quantity);
            }
            WriteSingleCoil(address, state) => {
                data.put_u16(*address);
                data.put_u16(bool_to_coil(*state));
            }
            WriteSingleRegister(address, word) => {
                data.put_u16(*address);
                data.put_u16(*word);
            }
            WriteMultipleCoils(address, coils) => {
                data.put_u16(*address);
                data.put_u16(coils.len() as u16);
                let packed = pack_coils(coils);
                data.put_u8(packed.len() as u8);
                data.put_slice(&packed);
            }
            WriteMultipleRegisters(address, words) => {
                data.put_u16(*address);
                data.put_u16(words.len() as u16);
                data.put_u8((words.len() * 2) as u8);
                put_words(&mut data, words);
            }
            ReadFileRecord(sub_requests) => {
                data.put_u8((sub_requests.len() * 7) as u8);
                for sub in sub_requests {
                    data.put_u8(REFERENCE_TYPE);
                    data.put_u16(sub.file_number);
                    data.put_u16(sub.record_number);
                    data.put_u16(sub.record_length);
                }
            }
            WriteFileRecord(records) => {
                let byte_count: usize = records.iter().map(|r| 7 + r.record_data.len() * 2).sum();
                data.put_u8(byte_count as u8);
                for record in records {
                    data.put_u8(REFERENCE_TYPE);
                    data.put_u16(record.file_number);
                    data.put_u16(record.record_number);
                    data.put_u16(record.record_data.len() as u16);
                    put_words(&mut data, &record.record_data);
                }
            }
            ReadWriteMultipleRegisters(read_address, read_quantity, write_address, words) => {
                data.put_u16(*read_address);
                data.put_u16(*read_quantity);
                data.put_u16(*write_address);
                data.put_u16(words.len() as u16);
                data.put_u8((words.len() * 2) as u8);
                put_words(&mut data, words);
            }
        }
        Ok(data.freeze())
    }

    /// Decode a request PDU.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        use crate::frame::FunctionCode as Fc;
        let mut cursor = Cursor::new(buf);
        let fn_code = cursor.read_u8()?;
        let function = Fc::new(fn_code).ok_or(FrameError::FnCode(fn_code))?;
        let req = match function {
            Fc::ReadCoils => Request::ReadCoils(cursor.read_u16()?, cursor.read_u16()?),
            Fc::ReadDiscreteInputs => {
                Request::ReadDiscreteInputs(cursor.read_u16()?, cursor.read_u16()?)
            }
            Fc::ReadHoldingRegisters => {
                Request::ReadHoldingRegisters(cursor.read_u16()?, cursor.read_u16()?)
            }
            Fc::ReadInputRegisters => {
                Request::ReadInputRegisters(cursor.read_u16()?, cursor.read_u16()?)
            }
            Fc::WriteSingleCoil => {
                Request::WriteSingleCoil(cursor.read_u16()?, coil_to_bool(cursor.read_u16()?))
            }
            Fc::WriteSingleRegister => {
                Request::WriteSingleRegister(cursor.read_u16()?, cursor.read_u16()?)
            }
            Fc::WriteMultipleCoils => {
                let address = cursor.read_u16()?;
                let quantity = cursor.read_u16()?;
                let byte_count = cursor.read_u8()?;
                if usize::from(byte_count) != packed_coils_len(usize::from(quantity)) {
                    return Err(FrameError::ByteCount(byte_count).into());
                }
                let packed = cursor.take(usize::from(byte_count))?;
                Request::WriteMultipleCoils(address, unpack_coils(packed, quantity))
            }
            Fc::WriteMultipleRegisters => {
                let address = cursor.read_u16()?;
                let quantity = cursor.read_u16()?;
                let byte_count = cursor.read_u8()?;
                if usize::from(byte_count) != usize::from(quantity) * 2 {
                    return Err(FrameError::ByteCount(byte_count).into());
                }
                Request::WriteMultipleRegisters(
                    address,
                    read_words(&mut cursor, usize::from(quantity))?,
                )
            }
            Fc::ReadFileRecord => {
                let byte_count = cursor.read_u8()?;
                if byte_count % 7 != 0 {
                    return Err(FrameError::ByteCount(byte_count).into());
                }
                let mut sub_requests = Vec::with_capacity(usize::from(byte_count) / 7);
                for _ in 0..byte_count / 7 {
                    let reference_type = cursor.read_u8()?;
                    if reference_type != REFERENCE_TYPE {
                        return Err(FrameError::ReferenceType(reference_type).into());
                    }
                    sub_requests.push(FileSubRequest {
                        file_number: cursor.read_u16()?,
                        record_number: cursor.read_u16()?,
                        record_length: cursor.read_u16()?,
                    });
                }
                Request::ReadFileRecord(sub_requests)
            }
            Fc::WriteFileRecord => {
                let byte_count = cursor.read_u8()?;
                Request::WriteFileRecord(decode_file_records(&mut cursor, byte_count)?)
            }
            Fc::ReadWriteMultipleRegisters => {
                let read_address = cursor.read_u16()?;
                let read_quantity = cursor.read_u16()?;
                let write_address = cursor.read_u16()?;
                let write_quantity = cursor.read_u16()?;
                let byte_count = cursor.read_u8()?;
                if usize::from(byte_count) != usize::from(write_quantity) * 2 {
                    return Err(FrameError::ByteCount(byte_count).into());
                }
                Request::ReadWriteMultipleRegisters(
                    read_address,
                    read_quantity,
                    write_address,
                    read_words(&mut cursor, usize::from(write_quantity))?,
                )
            }
        };
        req.validate()?;
        Ok(req)
    }
}

#[allow(clippy::cast_possible_truncation)]
impl Response {
    /// Encode the response into a PDU, validating all fields first.
    pub fn encode(&self) -> Result<Bytes> {
        self.validate()?;
        use Response::*;
        let mut data = BytesMut::with_capacity(8);
        data.put_u8(self.function_code().value());
        match self {
            ReadCoils(coils) | ReadDiscreteInputs(coils) => {
                let packed = pack_coils(coils);
                data.put_u8(packed.len() as u8);
                data.put_slice(&packed);
            }
            ReadHoldingRegisters(words) | ReadInputRegisters(words)
            | ReadWriteMultipleRegisters(words) => {
                data.put_u8((words.len() * 2) as u8);
                put_words(&mut data, words);
            }
            WriteSingleCoil(address, state) => {
                data.put_u16(*address);
                data.put_u16(bool_to_coil(*state));
            }
            WriteSingleRegister(address, word) => {
                data.put_u16(*address);
                data.put_u16(*word);
            }
            WriteMultipleCoils(address, quantity) | WriteMultipleRegisters(address, quantity) => {
                data.put_u16(*address);
                data.put_u16(*quantity);
            }
            ReadFileRecord(sub_responses) => {
                let byte_count: usize = sub_responses
                    .iter()
                    .map(|s| 2 + s.record_data.len() * 2)
                    .sum();
                data.put_u8(byte_count as u8);
                for sub in sub_responses {
                    data.put_u8((1 + sub.record_data.len() * 2) as u8);
                    data.put_u8(REFERENCE_TYPE);
                    put_words(&mut data, &sub.record_data);
                }
            }
            WriteFileRecord(records) => {
                let byte_count: usize = records.iter().map(|r| 7 + r.record_data.len() * 2).sum();
                data.put_u8(byte_count as u8);
                for record in records {
                    data.put_u8(REFERENCE_TYPE);
                    data.put_u16(record.file_number);
                    data.put_u16(record.record_number);
                    data.put_u16(record.record_data.len() as u16);
                    put_words(&mut data, &record.record_data);
                }
            }
        }
        Ok(data.freeze())
    }

    /// Decode a response PDU.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        use crate::frame::FunctionCode as Fc;
        let mut cursor = Cursor::new(buf);
        let fn_code = cursor.read_u8()?;
        let function = Fc::new(fn_code).ok_or(FrameError::FnCode(fn_code))?;
        let rsp = match function {
            Fc::ReadCoils | Fc::ReadDiscreteInputs => {
                let byte_count = cursor.read_u8()?;
                let packed = cursor.take(usize::from(byte_count))?;
                let coils = unpack_coils(packed, u16::from(byte_count) * 8);
                if function == Fc::ReadCoils {
                    Response::ReadCoils(coils)
                } else {
                    Response::ReadDiscreteInputs(coils)
                }
            }
            Fc::ReadHoldingRegisters | Fc::ReadInputRegisters | Fc::ReadWriteMultipleRegisters => {
                let byte_count = cursor.read_u8()?;
                if byte_count % 2 != 0 {
                    return Err(FrameError::ByteCount(byte_count).into());
                }
                let words = read_words(&mut cursor, usize::from(byte_count) / 2)?;
                match function {
                    Fc::ReadHoldingRegisters => Response::ReadHoldingRegisters(words),
                    Fc::ReadInputRegisters => Response::ReadInputRegisters(words),
                    _ => Response::ReadWriteMultipleRegisters(words),
                }
            }
            Fc::WriteSingleCoil => {
                Response::WriteSingleCoil(cursor.read_u16()?, coil_to_bool(cursor.read_u16()?))
            }
            Fc::WriteSingleRegister => {
                Response::WriteSingleRegister(cursor.read_u16()?, cursor.read_u16()?)
            }
            Fc::WriteMultipleCoils => {
                Response::WriteMultipleCoils(cursor.read_u16()?, cursor.read_u16()?)
            }
            Fc::WriteMultipleRegisters => {
                Response::WriteMultipleRegisters(cursor.read_u16()?, cursor.read_u16()?)
            }
            Fc::ReadFileRecord => {
                let byte_count = cursor.read_u8()?;
                let mut remaining = usize::from(byte_count);
                let mut sub_responses = Vec::new();
                while remaining > 0 {
                    let sub_len = cursor.read_u8()?;
                    if sub_len < 3 || sub_len % 2 == 0 {
                        return Err(FrameError::ByteCount(sub_len).into());
                    }
                    let reference_type = cursor.read_u8()?;
                    if reference_type != REFERENCE_TYPE {
                        return Err(FrameError::ReferenceType(reference_type).into());
                    }
                    let record_data = read_words(&mut cursor, usize::from(sub_len - 1) / 2)?;
                    remaining = remaining
                        .checked_sub(1 + usize::from(sub_len))
                        .ok_or(FrameError::ByteCount(byte_count))?;
                    sub_responses.push(FileSubResponse { record_data });
                }
                Response::ReadFileRecord(sub_responses)
            }
            Fc::WriteFileRecord => {
                let byte_count = cursor.read_u8()?;
                Response::WriteFileRecord(decode_file_records(&mut cursor, byte_count)?)
            }
        };
        rsp.validate()?;
        Ok(rsp)
    }
}

fn decode_file_records(
    cursor: &mut Cursor<'_>,
    byte_count: u8,
) -> Result<Vec<FileRecord>> {
    let mut remaining = usize::from(byte_count);
    let mut records = Vec::new();
    while remaining > 0 {
        let reference_type = cursor.read_u8()?;
        if reference_type != REFERENCE_TYPE {
            return Err(FrameError::ReferenceType(reference_type).into());
        }
        let file_number = cursor.read_u16()?;
        let record_number = cursor.read_u16()?;
        let record_length = cursor.read_u16()?;
        let record_data = read_words(cursor, usize::from(record_length))?;
        remaining = remaining
            .checked_sub(7 + usize::from(record_length) * 2)
            .ok_or(FrameError::ByteCount(byte_count))?;
        records.push(FileRecord {
            file_number,
            record_number,
            record_data,
        });
    }
    Ok(records)
}

impl ExceptionResponse {
    /// Encode the exception response into its two-byte PDU.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        debug_assert!(self.function < EXCEPTION_FLAG);
        let mut data = BytesMut::with_capacity(2);
        data.put_u8(self.function + EXCEPTION_FLAG);
        data.put_u8(self.exception.value());
        data.freeze()
    }

    /// Decode an exception-response PDU.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let fn_code = cursor.read_u8()?;
        if fn_code <= EXCEPTION_FLAG {
            return Err(FrameError::FnCode(fn_code).into());
        }
        let exception = ExceptionCode::try_from(cursor.read_u8()?)?;
        Ok(ExceptionResponse {
            function: fn_code - EXCEPTION_FLAG,
            exception,
        })
    }
}

impl RequestPdu {
    /// Encode the wrapped request.
    pub fn encode(&self) -> Result<Bytes> {
        self.0.encode()
    }
}

impl ResponsePdu {
    /// Decode either a regular response or an exception response,
    /// discriminated by the exception flag in the function code.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let fn_code = *buf.first().ok_or(FrameError::Incomplete)?;
        if fn_code > EXCEPTION_FLAG {
            ExceptionResponse::decode(buf).map(Into::into)
        } else {
            Response::decode(buf).map(Into::into)
        }
    }

    /// Encode the wrapped response.
    pub fn encode(&self) -> Result<Bytes> {
        match &self.0 {
            Ok(rsp) => rsp.encode(),
            Err(ex) => Ok(ex.encode()),
        }
    }
}
