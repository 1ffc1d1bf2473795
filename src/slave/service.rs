// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The request handler invoked by a [`Slave`](super::Slave).

use std::future::Future;

use crate::frame::{ExceptionCode, Request, Response, UnitId};

/// Handles one decoded request and produces the response.
///
/// Returning `Err(code)` answers with the matching exception response.
/// The returned [`Response`] must carry the request's function code;
/// anything else is answered with
/// [`ExceptionCode::SlaveDeviceFailure`].
pub trait Service {
    /// The future response value.
    type Future: Future<Output = Result<Response, ExceptionCode>> + Send;

    /// Process the request for the addressed unit asynchronously.
    fn call(&self, unit: UnitId, request: Request) -> Self::Future;
}

impl<F, Fut> Service for F
where
    F: Fn(UnitId, Request) -> Fut,
    Fut: Future<Output = Result<Response, ExceptionCode>> + Send,
{
    type Future = Fut;

    fn call(&self, unit: UnitId, request: Request) -> Self::Future {
        self(unit, request)
    }
}
