// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Master-side transactions.

use std::{sync::Arc, time::Duration};

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio_util::time::delay_queue;

use crate::{
    error::Error,
    frame::{Request, ResponsePdu, UnitId},
};

use super::Command;

/// Identifies one transaction within its master.
pub type TransactionId = u64;

/// Everything a transaction may tell its owner, in order: at most one
/// [`Timeout`](TransactionEvent::Timeout), then at most one of
/// [`Response`](TransactionEvent::Response) or
/// [`Error`](TransactionEvent::Error), then exactly one
/// [`Complete`](TransactionEvent::Complete) per execution.
///
/// After [`Cancelled`](TransactionEvent::Cancelled) only `Complete`
/// follows; late responses and timeouts are consumed silently.
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    /// An attempt timed out. Retries may still succeed.
    Timeout,
    /// The final response, regular or exception.
    Response(ResponsePdu),
    /// The final error after all retries were spent.
    Error(Arc<Error>),
    /// The transaction finished. Repeatable transactions deliver this
    /// once per execution.
    Complete(Result<ResponsePdu, Arc<Error>>),
    /// The transaction was cancelled.
    Cancelled,
}

/// How to run a request as a transaction.
///
/// Unset fields fall back to the master's configured defaults.
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// The request to send.
    pub request: Request,
    /// The addressed unit.
    pub unit: Option<UnitId>,
    /// How often to re-dispatch after an error or exception response.
    pub max_retries: Option<u32>,
    /// How long to wait for the response of a single attempt.
    pub timeout: Option<Duration>,
    /// Re-execute this long after each completion. `None` runs once.
    pub interval: Option<Duration>,
}

impl TransactionOptions {
    #[must_use]
    pub fn new(request: Request) -> Self {
        Self {
            request,
            unit: None,
            max_retries: None,
            timeout: None,
            interval: None,
        }
    }

    #[must_use]
    pub fn unit(mut self, unit: UnitId) -> Self {
        self.unit = Some(unit);
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

impl From<Request> for TransactionOptions {
    fn from(request: Request) -> Self {
        Self::new(request)
    }
}

/// The caller's side of a running transaction.
///
/// Events arrive on [`next_event`](Self::next_event);
/// [`completed`](Self::completed) is a shortcut that waits for the final
/// outcome. Dropping the handle does not cancel the transaction.
#[derive(Debug)]
pub struct TransactionHandle {
    id: TransactionId,
    events: mpsc::UnboundedReceiver<TransactionEvent>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl TransactionHandle {
    pub(crate) fn new(
        id: TransactionId,
        events: mpsc::UnboundedReceiver<TransactionEvent>,
        cmd_tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            events,
            cmd_tx,
        }
    }

    /// The transaction's id within its master.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Cancel the transaction. Idempotent; the final `Complete` event
    /// still fires.
    pub fn cancel(&self) {
        let _ = self.cmd_tx.send(Command::Cancel(self.id));
    }

    /// The next transaction event, or `None` once the master dropped
    /// the transaction.
    pub async fn next_event(&mut self) -> Option<TransactionEvent> {
        self.events.recv().await
    }

    /// Wait for the next completion and discard intermediate events.
    pub async fn completed(&mut self) -> Result<ResponsePdu, Arc<Error>> {
        while let Some(event) = self.events.recv().await {
            if let TransactionEvent::Complete(result) = event {
                return result;
            }
        }
        Err(Arc::new(Error::Destroyed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransactionState {
    Queued,
    InFlight,
    Completed,
    Cancelled,
}

/// Master-side bookkeeping of one transaction.
#[derive(Debug)]
pub(crate) struct Transaction {
    pub(crate) id: TransactionId,
    pub(crate) request: Request,
    pub(crate) unit: UnitId,
    pub(crate) max_retries: u32,
    pub(crate) timeout: Duration,
    pub(crate) interval: Option<Duration>,
    pub(crate) state: TransactionState,
    pub(crate) failures: u32,
    /// `Timeout` is reported at most once per execution.
    pub(crate) timeout_emitted: bool,
    /// Guards the one-`Complete`-per-execution rule.
    pub(crate) completed: bool,
    pub(crate) events: mpsc::UnboundedSender<TransactionEvent>,
    /// The encoded frame, kept for retries. IP framing re-stamps the
    /// transaction id in place.
    pub(crate) encoded: Option<BytesMut>,
    /// MBAP transaction id of the current attempt.
    pub(crate) last_transaction_id: Option<u16>,
    pub(crate) timeout_key: Option<delay_queue::Key>,
    pub(crate) repeat_key: Option<delay_queue::Key>,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        request: Request,
        unit: UnitId,
        max_retries: u32,
        timeout: Duration,
        interval: Option<Duration>,
        events: mpsc::UnboundedSender<TransactionEvent>,
    ) -> Self {
        Self {
            id,
            request,
            unit,
            max_retries,
            timeout,
            interval,
            state: TransactionState::Queued,
            failures: 0,
            timeout_emitted: false,
            completed: false,
            events,
            encoded: None,
            last_transaction_id: None,
            timeout_key: None,
            repeat_key: None,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state == TransactionState::Cancelled
    }

    pub(crate) fn is_repeatable(&self) -> bool {
        self.interval.is_some()
    }

    /// Reset the per-execution state for a repeated run.
    pub(crate) fn reset_for_repeat(&mut self) {
        self.state = TransactionState::Queued;
        self.failures = 0;
        self.timeout_emitted = false;
        self.completed = false;
        self.repeat_key = None;
    }
}
