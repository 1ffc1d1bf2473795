// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types

///////////////////////////////////////////////////////////////////
/// Modules
///////////////////////////////////////////////////////////////////
pub use crate::{connection, master, slave};

///////////////////////////////////////////////////////////////////
/// Structs
///////////////////////////////////////////////////////////////////
pub use crate::error::{Error, Result};
pub use crate::frame::{
    Address, Adu, Coil, ExceptionCode, ExceptionResponse, FunctionCode, Quantity, Request,
    RequestPdu, Response, ResponsePdu, UnitId, Word,
};
pub use crate::master::{
    Master, MasterConfig, MasterEvent, TransactionEvent, TransactionHandle, TransactionOptions,
};
pub use crate::slave::{Slave, SlaveConfig, SlaveEvent};
pub use crate::transport::TransportConfig;

///////////////////////////////////////////////////////////////////
/// Traits
///////////////////////////////////////////////////////////////////
pub use crate::connection::{Connection, Listener};
pub use crate::slave::Service;
