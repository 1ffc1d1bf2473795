// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Modbus master: a bounded-concurrency transaction scheduler.
//!
//! A [`Master`] owns one [`Connection`] and one framing transport. User
//! requests become [`Transaction`]s that are queued, dispatched under
//! the configured concurrency bound, matched with their responses and
//! retried on errors or exception responses. All scheduling state lives
//! in one task; commands, connection events and timer expirations are
//! processed strictly in order.

pub mod transaction;

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::Poll,
    time::Duration,
};

use futures_util::future::poll_fn;
use tokio::sync::mpsc;
use tokio_util::time::{delay_queue, DelayQueue};

use crate::{
    codec::FrameEvent,
    connection::{Connection, ConnectionEvent},
    error::Error,
    frame::{Adu, ResponsePdu, UnitId},
    transport::{MasterTransport, TransportConfig},
};

pub use self::transaction::{
    TransactionEvent, TransactionHandle, TransactionId, TransactionOptions,
};
use self::transaction::{Transaction, TransactionState};

/// Master configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterConfig {
    /// Demote unobserved transaction errors to debug logging instead of
    /// reporting them at error level.
    pub suppress_transaction_errors: bool,
    /// Re-dispatch a transaction when a valid exception response
    /// arrives and retries remain.
    pub retry_on_exception: bool,
    /// Upper bound on in-flight transactions. Only IP framing can
    /// multiplex; serial framings dispatch one request at a time
    /// regardless.
    pub max_concurrent_requests: usize,
    /// Unit address used when a transaction does not name one.
    pub default_unit: UnitId,
    /// Default for [`TransactionOptions::max_retries`].
    pub default_max_retries: u32,
    /// Default for [`TransactionOptions::timeout`].
    pub default_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            suppress_transaction_errors: false,
            retry_on_exception: true,
            max_concurrent_requests: 1,
            default_unit: 0,
            default_max_retries: 3,
            default_timeout: Duration::from_millis(100),
        }
    }
}

/// Lifecycle events of a [`Master`].
#[derive(Debug)]
pub enum MasterEvent {
    /// The connection is up.
    Connected,
    /// The connection went down. Emitted once per open cycle.
    Disconnected,
    /// An error that is not attributable to a single transaction.
    Error(Error),
}

#[derive(Debug)]
pub(crate) enum Command {
    Execute(Transaction),
    Cancel(TransactionId),
    Destroy,
}

/// A Modbus master (client).
///
/// Dropping the master while transaction handles are alive keeps the
/// scheduler running until those handles are gone; [`Self::destroy`]
/// shuts it down explicitly.
#[derive(Debug)]
pub struct Master {
    config: MasterConfig,
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: Option<mpsc::UnboundedReceiver<MasterEvent>>,
    next_transaction_id: AtomicU64,
}

impl Master {
    /// Run a master over the given connection and framing.
    ///
    /// The connection must be freshly created; the master takes its
    /// event stream and opens it. Must be called within a Tokio
    /// runtime.
    #[must_use]
    pub fn new(
        connection: Box<dyn Connection>,
        transport: TransportConfig,
        config: MasterConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(Actor::new(connection, transport, config.clone(), cmd_rx, event_tx).run());
        Self {
            config,
            cmd_tx,
            events: Some(event_rx),
            next_transaction_id: AtomicU64::new(1),
        }
    }

    /// A master talking Modbus TCP to `addr`, with auto-reconnect.
    #[cfg(feature = "tcp")]
    #[must_use]
    pub fn tcp(addr: std::net::SocketAddr) -> Self {
        use crate::connection::tcp::{TcpConfig, TcpConnection};
        Self::new(
            Box::new(TcpConnection::new(TcpConfig::new(addr))),
            TransportConfig::Ip,
            MasterConfig::default(),
        )
    }

    /// A master talking MBAP-framed Modbus over UDP datagrams.
    #[cfg(feature = "udp")]
    #[must_use]
    pub fn udp(addr: std::net::SocketAddr) -> Self {
        use crate::connection::udp::UdpConnection;
        Self::new(
            Box::new(UdpConnection::new(addr)),
            TransportConfig::Ip,
            MasterConfig::default(),
        )
    }

    /// A master talking Modbus RTU over a serial line.
    #[cfg(feature = "serial")]
    #[must_use]
    pub fn serial(
        config: crate::connection::serial::SerialConfig,
        eof_timeout: Duration,
    ) -> Self {
        use crate::connection::serial::SerialConnection;
        Self::new(
            Box::new(SerialConnection::new(config)),
            TransportConfig::Rtu { eof_timeout },
            MasterConfig::default(),
        )
    }

    /// Queue a transaction for execution.
    ///
    /// Returns immediately; progress arrives on the handle. Requests
    /// with out-of-range fields fail without touching the wire.
    pub fn execute(&self, options: impl Into<TransactionOptions>) -> TransactionHandle {
        let options = options.into();
        let id = self.next_transaction_id.fetch_add(1, Ordering::Relaxed);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = TransactionHandle::new(id, event_rx, self.cmd_tx.clone());

        if let Err(err) = options.request.validate() {
            let err = Arc::new(err);
            let _ = event_tx.send(TransactionEvent::Error(Arc::clone(&err)));
            let _ = event_tx.send(TransactionEvent::Complete(Err(err)));
            return handle;
        }

        let txn = Transaction::new(
            id,
            options.request,
            options.unit.unwrap_or(self.config.default_unit),
            options
                .max_retries
                .unwrap_or(self.config.default_max_retries),
            options.timeout.unwrap_or(self.config.default_timeout),
            options.interval,
            event_tx.clone(),
        );
        if self.cmd_tx.send(Command::Execute(txn)).is_err() {
            let _ = event_tx.send(TransactionEvent::Complete(Err(Arc::new(Error::Destroyed))));
        }
        handle
    }

    /// Hand out the lifecycle event receiver. Yields `None` on
    /// subsequent calls; there is exactly one consumer.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<MasterEvent>> {
        self.events.take()
    }

    /// Cancel all transactions and release the connection. Operations
    /// after this are no-ops.
    pub fn destroy(&self) {
        let _ = self.cmd_tx.send(Command::Destroy);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    ResponseTimeout(TransactionId),
    Repeat(TransactionId),
    RtuEof,
}

struct Actor {
    config: MasterConfig,
    connection: Box<dyn Connection>,
    conn_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    conn_events_gone: bool,
    transport: MasterTransport,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<MasterEvent>,
    transactions: HashMap<TransactionId, Transaction>,
    pending: VecDeque<TransactionId>,
    repeatable: Vec<TransactionId>,
    in_flight: usize,
    timers: DelayQueue<TimerKind>,
    rtu_eof_key: Option<delay_queue::Key>,
    conn_open: bool,
    was_open: bool,
}

enum Step {
    Cmd(Option<Command>),
    Conn(Option<ConnectionEvent>),
    Timer(TimerKind),
}

impl Actor {
    fn new(
        mut connection: Box<dyn Connection>,
        transport: TransportConfig,
        config: MasterConfig,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        event_tx: mpsc::UnboundedSender<MasterEvent>,
    ) -> Self {
        let (conn_events, conn_events_gone) = match connection.take_events() {
            Some(rx) => (rx, false),
            None => {
                // The connection was used before; without its events the
                // master can only fail every transaction by timeout.
                log::error!("Connection event stream already taken");
                let (tx, rx) = mpsc::unbounded_channel();
                drop(tx);
                (rx, true)
            }
        };
        Self {
            config,
            connection,
            conn_events,
            conn_events_gone,
            transport: MasterTransport::new(transport),
            cmd_rx,
            event_tx,
            transactions: HashMap::new(),
            pending: VecDeque::new(),
            repeatable: Vec::new(),
            in_flight: 0,
            timers: DelayQueue::new(),
            rtu_eof_key: None,
            conn_open: false,
            was_open: false,
        }
    }

    async fn run(mut self) {
        if let Err(err) = self.connection.open().await {
            let _ = self.event_tx.send(MasterEvent::Error(err));
        }
        loop {
            let step = {
                let Self {
                    cmd_rx,
                    conn_events,
                    conn_events_gone,
                    timers,
                    ..
                } = &mut self;
                tokio::select! {
                    cmd = cmd_rx.recv() => Step::Cmd(cmd),
                    event = conn_events.recv(), if !*conn_events_gone => Step::Conn(event),
                    expired = poll_fn(|cx| match timers.poll_expired(cx) {
                        Poll::Ready(Some(expired)) => Poll::Ready(expired),
                        // An empty queue stays pending; inserts only
                        // happen between polls of this loop.
                        Poll::Ready(None) | Poll::Pending => Poll::Pending,
                    }) => Step::Timer(expired.into_inner()),
                }
            };
            match step {
                Step::Cmd(Some(Command::Execute(txn))) => self.handle_execute(txn).await,
                Step::Cmd(Some(Command::Cancel(id))) => self.handle_cancel(id),
                Step::Cmd(Some(Command::Destroy) | None) => break,
                Step::Conn(Some(event)) => self.handle_connection_event(event).await,
                Step::Conn(None) => self.conn_events_gone = true,
                Step::Timer(kind) => self.handle_timer(kind).await,
            }
        }
        self.shutdown().await;
    }

    async fn handle_execute(&mut self, txn: Transaction) {
        let id = txn.id;
        log::debug!("Execute transaction #{id}: {}", txn.request);
        if txn.is_repeatable() {
            self.repeatable.push(id);
        }
        self.transactions.insert(id, txn);
        self.pending.push_back(id);
        self.drain().await;
    }

    /// Dispatch queued transactions while the concurrency bound, the
    /// transport and the connection allow it.
    async fn drain(&mut self) {
        while self.conn_open
            && self.in_flight < self.config.max_concurrent_requests
            && self.transport.can_send()
        {
            let Some(id) = self.pending.pop_front() else {
                break;
            };
            let Some(txn) = self.transactions.get_mut(&id) else {
                continue;
            };
            txn.state = TransactionState::InFlight;
            self.in_flight += 1;

            let frame = match self.transport.prepare(txn) {
                Ok(frame) => frame,
                Err(err) => {
                    // Out-of-range fields; retrying cannot help.
                    self.in_flight -= 1;
                    self.finish_with_error(id, err);
                    continue;
                }
            };
            match self.connection.write(frame).await {
                Ok(()) => {
                    let Some(txn) = self.transactions.get_mut(&id) else {
                        continue;
                    };
                    let key = self.timers.insert(TimerKind::ResponseTimeout(id), txn.timeout);
                    txn.timeout_key = Some(key);
                    log::debug!("Transaction #{id} dispatched");
                }
                Err(err) => {
                    self.in_flight -= 1;
                    self.error_branch(id, err);
                    break;
                }
            }
        }
    }

    /// A dispatched transaction failed: retry at the head of the queue
    /// or surface the error.
    fn error_branch(&mut self, id: TransactionId, err: Error) {
        let Some(txn) = self.transactions.get_mut(&id) else {
            return;
        };
        if let Some(key) = txn.timeout_key.take() {
            self.timers.try_remove(&key);
        }
        self.transport.forget(txn);
        if txn.is_cancelled() {
            self.remove_transaction(id);
            return;
        }
        txn.failures += 1;
        if txn.failures <= txn.max_retries {
            log::debug!(
                "Transaction #{id} failed ({err}), retry {} of {}",
                txn.failures,
                txn.max_retries
            );
            txn.state = TransactionState::Queued;
            self.pending.push_front(id);
            return;
        }
        self.finish_with_error(id, err);
    }

    fn finish_with_error(&mut self, id: TransactionId, err: Error) {
        let err = Arc::new(err);
        let Some(txn) = self.transactions.get_mut(&id) else {
            return;
        };
        log::debug!("Transaction #{id} failed: {err}");
        txn.state = TransactionState::Completed;
        Self::emit(&self.config, txn, TransactionEvent::Error(Arc::clone(&err)));
        Self::emit_complete(&self.config, txn, Err(err));
        self.after_completion(id);
    }

    /// A response (regular or exception) arrived for the transaction.
    fn response_branch(&mut self, id: TransactionId, pdu: ResponsePdu) {
        let retry_on_exception = self.config.retry_on_exception;
        let Some(txn) = self.transactions.get_mut(&id) else {
            return;
        };
        self.transport.forget(txn);
        if txn.is_cancelled() {
            self.remove_transaction(id);
            return;
        }
        if pdu.0.is_err() && retry_on_exception && txn.failures <= txn.max_retries {
            txn.failures += 1;
            log::debug!(
                "Transaction #{id} answered with an exception, retry {} of {}",
                txn.failures,
                txn.max_retries
            );
            txn.state = TransactionState::Queued;
            self.pending.push_front(id);
            return;
        }
        if pdu.0.is_ok() {
            txn.failures = 0;
        }
        txn.state = TransactionState::Completed;
        Self::emit(&self.config, txn, TransactionEvent::Response(pdu.clone()));
        Self::emit_complete(&self.config, txn, Ok(pdu));
        self.after_completion(id);
    }

    /// Schedule the next execution of a repeatable transaction or drop
    /// the bookkeeping of a finished one.
    fn after_completion(&mut self, id: TransactionId) {
        let conn_open = self.conn_open;
        let Some(txn) = self.transactions.get_mut(&id) else {
            return;
        };
        if txn.is_repeatable() && !txn.is_cancelled() {
            // With the connection down the transaction stays idle; it
            // is re-queued when the connection comes back.
            if conn_open {
                if let Some(interval) = txn.interval {
                    let key = self.timers.insert(TimerKind::Repeat(id), interval);
                    txn.repeat_key = Some(key);
                }
            }
        } else {
            self.remove_transaction(id);
        }
    }

    fn remove_transaction(&mut self, id: TransactionId) {
        if let Some(txn) = self.transactions.remove(&id) {
            if let Some(key) = txn.timeout_key {
                self.timers.try_remove(&key);
            }
            if let Some(key) = txn.repeat_key {
                self.timers.try_remove(&key);
            }
        }
        self.repeatable.retain(|other| *other != id);
        self.pending.retain(|other| *other != id);
    }

    fn handle_cancel(&mut self, id: TransactionId) {
        let Some(txn) = self.transactions.get_mut(&id) else {
            return;
        };
        if txn.is_cancelled() {
            return;
        }
        log::debug!("Transaction #{id} cancelled");
        let state = txn.state;
        txn.state = TransactionState::Cancelled;
        Self::emit(&self.config, txn, TransactionEvent::Cancelled);
        Self::emit_complete(&self.config, txn, Err(Arc::new(Error::Cancelled)));
        match state {
            TransactionState::InFlight => {
                // Keep the transport registration so the eventual
                // response or timeout is consumed silently.
                self.repeatable.retain(|other| *other != id);
            }
            _ => self.remove_transaction(id),
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Open => {
                log::debug!("Connected");
                self.conn_open = true;
                self.was_open = true;
                let _ = self.event_tx.send(MasterEvent::Connected);
                let repeatable = self.repeatable.clone();
                for id in repeatable {
                    if let Some(txn) = self.transactions.get_mut(&id) {
                        if txn.state == TransactionState::Completed {
                            if let Some(key) = txn.repeat_key.take() {
                                self.timers.try_remove(&key);
                            }
                            txn.reset_for_repeat();
                            self.pending.push_back(id);
                        }
                    }
                }
                self.drain().await;
            }
            ConnectionEvent::Close => {
                self.conn_open = false;
                if self.was_open {
                    log::debug!("Disconnected");
                    self.was_open = false;
                    let _ = self.event_tx.send(MasterEvent::Disconnected);
                }
            }
            ConnectionEvent::Error(err) => {
                let _ = self.event_tx.send(MasterEvent::Error(err));
            }
            ConnectionEvent::Data(bytes) => {
                let mut events = Vec::new();
                self.transport.feed(&bytes, &mut events);
                self.rearm_eof_timer();
                for event in events {
                    self.handle_frame_event(event);
                }
                self.drain().await;
            }
        }
    }

    fn handle_frame_event(&mut self, event: FrameEvent) {
        match event {
            FrameEvent::Adu(adu) => self.handle_adu(adu),
            FrameEvent::Error(err) => {
                // On a serial link the malformed frame can only belong
                // to the outstanding transaction.
                if let Some(id) = self.transport.serial_outstanding() {
                    self.in_flight = self.in_flight.saturating_sub(1);
                    self.error_branch(id, err.into());
                } else {
                    let _ = self.event_tx.send(MasterEvent::Error(err.into()));
                }
            }
            FrameEvent::BufferOverflow(bytes) => {
                log::warn!("Receive buffer overflow, {} byte(s) discarded", bytes.len());
                let _ = self
                    .event_tx
                    .send(MasterEvent::Error(Error::IncompleteResponseFrame));
            }
        }
    }

    fn handle_adu(&mut self, adu: Adu) {
        let Some(id) = self.transport.match_adu(&adu) else {
            log::debug!("Dropping response for unknown transaction");
            return;
        };
        self.in_flight = self.in_flight.saturating_sub(1);
        let Some(txn) = self.transactions.get_mut(&id) else {
            return;
        };
        if let Some(key) = txn.timeout_key.take() {
            self.timers.try_remove(&key);
        }
        if adu.unit != txn.unit {
            log::warn!(
                "Transaction #{id}: response unit {} does not match requested unit {}",
                adu.unit,
                txn.unit
            );
            self.error_branch(id, Error::InvalidResponseData("unit mismatch"));
            return;
        }
        match ResponsePdu::decode(&adu.pdu) {
            Ok(pdu) => self.response_branch(id, pdu),
            Err(err) => self.error_branch(id, err),
        }
    }

    async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::ResponseTimeout(id) => {
                let Some(txn) = self.transactions.get_mut(&id) else {
                    return;
                };
                txn.timeout_key = None;
                self.in_flight = self.in_flight.saturating_sub(1);
                if !txn.is_cancelled() && !txn.timeout_emitted {
                    txn.timeout_emitted = true;
                    Self::emit(&self.config, txn, TransactionEvent::Timeout);
                }
                self.error_branch(id, Error::ResponseTimeout);
                self.drain().await;
            }
            TimerKind::Repeat(id) => {
                let Some(txn) = self.transactions.get_mut(&id) else {
                    return;
                };
                txn.repeat_key = None;
                if txn.is_cancelled() {
                    return;
                }
                txn.reset_for_repeat();
                self.pending.push_back(id);
                self.drain().await;
            }
            TimerKind::RtuEof => {
                self.rtu_eof_key = None;
                let mut events = Vec::new();
                self.transport.flush(&mut events);
                for event in events {
                    self.handle_frame_event(event);
                }
                self.drain().await;
            }
        }
    }

    /// Restart the end-of-frame timer after received data, as long as
    /// the framing buffers between chunks.
    fn rearm_eof_timer(&mut self) {
        if let Some(key) = self.rtu_eof_key.take() {
            self.timers.try_remove(&key);
        }
        if let Some(timeout) = self.transport.eof_pending() {
            self.rtu_eof_key = Some(self.timers.insert(TimerKind::RtuEof, timeout));
        }
    }

    async fn shutdown(&mut self) {
        let ids: Vec<_> = self.transactions.keys().copied().collect();
        for id in ids {
            let Some(txn) = self.transactions.get_mut(&id) else {
                continue;
            };
            if !txn.is_cancelled() {
                txn.state = TransactionState::Cancelled;
                Self::emit(&self.config, txn, TransactionEvent::Cancelled);
                Self::emit_complete(&self.config, txn, Err(Arc::new(Error::Cancelled)));
            }
        }
        self.transactions.clear();
        self.pending.clear();
        self.repeatable.clear();
        self.timers.clear();
        self.connection.close().await;
        log::debug!("Master destroyed");
    }

    fn emit(config: &MasterConfig, txn: &Transaction, event: TransactionEvent) {
        let is_error = matches!(
            &event,
            TransactionEvent::Error(_) | TransactionEvent::Complete(Err(_))
        );
        if txn.events.send(event).is_err() && is_error {
            if config.suppress_transaction_errors {
                log::debug!("Unobserved error of transaction #{}", txn.id);
            } else {
                log::error!("Unobserved error of transaction #{}", txn.id);
            }
        }
    }

    fn emit_complete(
        config: &MasterConfig,
        txn: &mut Transaction,
        result: Result<ResponsePdu, Arc<Error>>,
    ) {
        if txn.completed {
            return;
        }
        txn.completed = true;
        Self::emit(config, txn, TransactionEvent::Complete(result));
    }
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("in_flight", &self.in_flight)
            .field("pending", &self.pending.len())
            .field("conn_open", &self.conn_open)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::{Connection, ConnectionEvent},
        error::Result,
        frame::Request,
    };

    use async_trait::async_trait;
    use bytes::Bytes;

    #[derive(Debug)]
    struct MockConnection {
        open: bool,
        auto_open: bool,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
        events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
        written_tx: mpsc::UnboundedSender<Bytes>,
    }

    struct MockHandle {
        written_rx: mpsc::UnboundedReceiver<Bytes>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    }

    fn mock_connection(auto_open: bool) -> (Box<dyn Connection>, MockHandle) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let connection = MockConnection {
            open: false,
            auto_open,
            event_tx: event_tx.clone(),
            events: Some(event_rx),
            written_tx,
        };
        (Box::new(connection), MockHandle { written_rx, event_tx })
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn open(&mut self) -> Result<()> {
            if self.auto_open {
                self.open = true;
                let _ = self.event_tx.send(ConnectionEvent::Open);
            }
            Ok(())
        }

        async fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn is_opening(&self) -> bool {
            false
        }

        async fn write(&mut self, bytes: Bytes) -> Result<()> {
            let _ = self.written_tx.send(bytes);
            Ok(())
        }

        fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
            self.events.take()
        }
    }

    /// An MBAP response frame echoing the request's transaction id and unit.
    fn response_frame(request_frame: &[u8], pdu: &[u8]) -> Bytes {
        let mut frame = Vec::with_capacity(7 + pdu.len());
        frame.extend_from_slice(&request_frame[0..2]);
        frame.extend_from_slice(&[0x00, 0x00]);
        #[allow(clippy::cast_possible_truncation)]
        frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        frame.push(request_frame[6]);
        frame.extend_from_slice(pdu);
        Bytes::from(frame)
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_retry_at_head_then_surface() {
        let (connection, mut mock) = mock_connection(true);
        let master = Master::new(connection, TransportConfig::Ip, MasterConfig::default());

        let mut first = master.execute(
            TransactionOptions::new(Request::ReadHoldingRegisters(0, 1))
                .max_retries(1)
                .timeout(Duration::from_millis(50)),
        );
        let mut second = master.execute(
            TransactionOptions::new(Request::ReadInputRegisters(0, 1))
                .max_retries(0)
                .timeout(Duration::from_millis(50)),
        );

        // First attempt, then the retry of the same request, and only
        // afterwards the second transaction.
        let w1 = mock.written_rx.recv().await.unwrap();
        assert_eq!(w1[7], 0x03);
        let w2 = mock.written_rx.recv().await.unwrap();
        assert_eq!(w2[7], 0x03);
        let w3 = mock.written_rx.recv().await.unwrap();
        assert_eq!(w3[7], 0x04);

        assert!(matches!(
            first.next_event().await,
            Some(TransactionEvent::Timeout)
        ));
        assert!(matches!(
            first.next_event().await,
            Some(TransactionEvent::Error(err)) if matches!(err.as_ref(), Error::ResponseTimeout)
        ));
        assert!(matches!(
            first.next_event().await,
            Some(TransactionEvent::Complete(Err(_)))
        ));

        assert!(second.completed().await.is_err());
        master.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn exception_responses_are_retried_then_delivered() {
        let (connection, mut mock) = mock_connection(true);
        let master = Master::new(connection, TransportConfig::Ip, MasterConfig::default());

        let mut handle = master.execute(
            TransactionOptions::new(Request::ReadHoldingRegisters(0, 1))
                .max_retries(1)
                .timeout(Duration::from_millis(50)),
        );

        // `retry_on_exception` admits retries while failures have not
        // exhausted max_retries yet; answer until the master gives up.
        for _ in 0..3 {
            let written = mock.written_rx.recv().await.unwrap();
            let _ = mock
                .event_tx
                .send(ConnectionEvent::Data(response_frame(&written, &[0x83, 0x02])));
        }

        let Some(TransactionEvent::Response(pdu)) = handle.next_event().await else {
            panic!("expected a response event");
        };
        let rsp = pdu.0.unwrap_err();
        assert_eq!(rsp.function, 3);
        assert_eq!(rsp.exception, crate::frame::ExceptionCode::IllegalDataAddress);

        assert!(matches!(
            handle.next_event().await,
            Some(TransactionEvent::Complete(Ok(pdu))) if pdu.0.is_err()
        ));
        master.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn responses_complete_transactions() {
        let (connection, mut mock) = mock_connection(true);
        let master = Master::new(connection, TransportConfig::Ip, MasterConfig::default());

        let mut handle = master.execute(Request::ReadHoldingRegisters(0, 2));
        let written = mock.written_rx.recv().await.unwrap();
        let _ = mock.event_tx.send(ConnectionEvent::Data(response_frame(
            &written,
            &[0x03, 0x04, 0x89, 0x02, 0x42, 0xC7],
        )));

        let pdu = handle.completed().await.unwrap();
        assert_eq!(
            pdu.0.unwrap(),
            crate::frame::Response::ReadHoldingRegisters(vec![0x8902, 0x42C7])
        );
        master.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_never_exceeds_the_concurrency_bound() {
        let (connection, mut mock) = mock_connection(true);
        let master = Master::new(
            connection,
            TransportConfig::Ip,
            MasterConfig {
                max_concurrent_requests: 2,
                ..MasterConfig::default()
            },
        );

        let handles: Vec<_> = (0..3)
            .map(|_| {
                master.execute(
                    TransactionOptions::new(Request::ReadCoils(0, 1))
                        .max_retries(0)
                        .timeout(Duration::from_millis(50)),
                )
            })
            .collect();

        let _ = mock.written_rx.recv().await.unwrap();
        let _ = mock.written_rx.recv().await.unwrap();

        // The third dispatch waits for a free slot.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(mock.written_rx.try_recv().is_err());

        // A timeout frees a slot and the third request goes out.
        let _ = mock.written_rx.recv().await.unwrap();

        drop(handles);
        master.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_suppresses_response_events() {
        let (connection, mut mock) = mock_connection(true);
        let master = Master::new(connection, TransportConfig::Ip, MasterConfig::default());

        let mut handle = master.execute(
            TransactionOptions::new(Request::ReadCoils(0, 1))
                .max_retries(0)
                .timeout(Duration::from_secs(10)),
        );
        let written = mock.written_rx.recv().await.unwrap();

        handle.cancel();
        assert!(matches!(
            handle.next_event().await,
            Some(TransactionEvent::Cancelled)
        ));
        assert!(matches!(
            handle.next_event().await,
            Some(TransactionEvent::Complete(Err(err))) if matches!(err.as_ref(), Error::Cancelled)
        ));

        // The late response is consumed without further events.
        let _ = mock.event_tx.send(ConnectionEvent::Data(response_frame(
            &written,
            &[0x01, 0x01, 0x01],
        )));
        master.destroy();
        assert!(handle.next_event().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transactions_queue_while_disconnected() {
        let (connection, mut mock) = mock_connection(false);
        let master = Master::new(connection, TransportConfig::Ip, MasterConfig::default());

        let _handle = master.execute(Request::ReadCoils(0, 1));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(mock.written_rx.try_recv().is_err());

        let _ = mock.event_tx.send(ConnectionEvent::Open);
        let written = mock.written_rx.recv().await.unwrap();
        assert_eq!(written[7], 0x01);
        master.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn repeatable_transactions_are_rescheduled() {
        let (connection, mut mock) = mock_connection(true);
        let master = Master::new(connection, TransportConfig::Ip, MasterConfig::default());

        let mut handle = master.execute(
            TransactionOptions::new(Request::ReadHoldingRegisters(0, 1))
                .interval(Duration::from_millis(100)),
        );

        for _ in 0..2 {
            let written = mock.written_rx.recv().await.unwrap();
            let _ = mock.event_tx.send(ConnectionEvent::Data(response_frame(
                &written,
                &[0x03, 0x02, 0x00, 0x2A],
            )));
            assert!(handle.completed().await.is_ok());
        }

        handle.cancel();
        master.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_requests_fail_without_touching_the_wire() {
        let (connection, mut mock) = mock_connection(true);
        let master = Master::new(connection, TransportConfig::Ip, MasterConfig::default());

        let mut handle = master.execute(Request::ReadCoils(0, 0));
        assert!(matches!(
            handle.next_event().await,
            Some(TransactionEvent::Error(err))
                if matches!(err.as_ref(), Error::InvalidArgument { .. })
        ));
        assert!(handle.completed().await.is_err());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(mock.written_rx.try_recv().is_err());
        master.destroy();
    }
}
