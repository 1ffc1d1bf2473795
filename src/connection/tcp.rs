// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! TCP stream connection and TCP listener.

use std::{
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use socket2::{Domain, Socket, Type};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
};

use crate::error::Result;

use super::{
    pump_stream, ClientEvent, Connection, ConnectionEvent, LinkState, Listener, ListenerEvent,
    RemoteClient, RemoteClientDriver, RemoteInfo,
};

/// First reconnect delay; doubled on every failed attempt.
const RECONNECT_STEP: Duration = Duration::from_millis(250);

/// Configuration of a [`TcpConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConfig {
    /// Remote endpoint, conventionally port 502.
    pub addr: SocketAddr,
    /// Re-establish the link automatically after it drops.
    pub auto_reconnect: bool,
    /// How long the link must stay up before the reconnect backoff is
    /// considered recovered and resets to its initial step.
    pub min_connect_time: Duration,
    /// Upper bound for the reconnect backoff.
    pub max_reconnect_time: Duration,
}

impl TcpConfig {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            auto_reconnect: true,
            min_connect_time: Duration::from_millis(2500),
            max_reconnect_time: Duration::from_millis(5000),
        }
    }
}

/// A TCP client connection with optional auto-reconnect.
#[derive(Debug)]
pub struct TcpConnection {
    config: TcpConfig,
    state: Arc<LinkState>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    write_tx: mpsc::UnboundedSender<Bytes>,
    shutdown_tx: watch::Sender<bool>,
}

impl TcpConnection {
    #[must_use]
    pub fn new(config: TcpConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (write_tx, _) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            state: Arc::new(LinkState::default()),
            event_tx,
            events: Some(event_rx),
            write_tx,
            shutdown_tx,
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn open(&mut self) -> Result<()> {
        if self.state.is_open() || self.state.is_opening() {
            return Ok(());
        }
        self.state.set_opening(true);
        let _ = self.shutdown_tx.send(false);

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        self.write_tx = write_tx;

        tokio::spawn(manage(
            self.config.clone(),
            Arc::clone(&self.state),
            self.event_tx.clone(),
            write_rx,
            self.shutdown_tx.subscribe(),
        ));
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    fn is_opening(&self) -> bool {
        self.state.is_opening()
    }

    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        if !self.state.is_open() {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        }
        // Flushed by the I/O task; write failures surface as events.
        let _ = self.write_tx.send(bytes);
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.take()
    }
}

/// Connect/reconnect loop of a [`TcpConnection`].
async fn manage(
    config: TcpConfig,
    state: Arc<LinkState>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    mut write_rx: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = RECONNECT_STEP;
    loop {
        state.set_opening(true);
        let connected = tokio::select! {
            result = TcpStream::connect(config.addr) => result,
            _ = shutdown_rx.changed() => break,
        };
        state.set_opening(false);

        match connected {
            Ok(stream) => {
                log::debug!("Connected to {}", config.addr);
                state.set_open(true);
                let _ = event_tx.send(ConnectionEvent::Open);
                let connected_at = Instant::now();

                pump_stream(stream, &mut write_rx, &event_tx, &mut shutdown_rx).await;

                state.set_open(false);
                let _ = event_tx.send(ConnectionEvent::Close);
                if connected_at.elapsed() >= config.min_connect_time {
                    backoff = RECONNECT_STEP;
                }
            }
            Err(err) => {
                log::debug!("Connecting to {} failed: {err}", config.addr);
                let _ = event_tx.send(ConnectionEvent::Error(err.into()));
            }
        }

        if !config.auto_reconnect || *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => break,
        }
        backoff = (backoff * 2).min(config.max_reconnect_time);
    }
    state.set_opening(false);
    state.set_open(false);
}

/// A TCP listener accepting remote Modbus clients.
#[derive(Debug)]
pub struct TcpServerListener {
    addr: SocketAddr,
    bound: Option<std::net::TcpListener>,
    state: Arc<LinkState>,
    event_tx: mpsc::UnboundedSender<ListenerEvent>,
    events: Option<mpsc::UnboundedReceiver<ListenerEvent>>,
    shutdown_tx: watch::Sender<bool>,
}

impl TcpServerListener {
    /// A listener that binds `addr` when it is opened.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            addr,
            bound: None,
            state: Arc::new(LinkState::default()),
            event_tx,
            events: Some(event_rx),
            shutdown_tx,
        }
    }

    /// A listener bound right away, so an ephemeral port (`addr` with
    /// port 0) can be queried via [`local_addr`](Self::local_addr)
    /// before the listener is opened.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let bound = bind_std(addr)?;
        let addr = bound.local_addr()?;
        let mut listener = Self::new(addr);
        listener.bound = Some(bound);
        Ok(listener)
    }

    /// The bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Listener for TcpServerListener {
    async fn open(&mut self) -> Result<()> {
        if self.state.is_open() || self.state.is_opening() {
            return Ok(());
        }
        self.state.set_opening(true);
        let _ = self.shutdown_tx.send(false);
        let bound = match self.bound.take() {
            Some(bound) => Ok(bound),
            None => bind_std(self.addr),
        };
        let listener = match bound.and_then(TcpListener::from_std) {
            Ok(listener) => listener,
            Err(err) => {
                self.state.set_opening(false);
                return Err(err.into());
            }
        };
        self.state.set_opening(false);
        self.state.set_open(true);
        let _ = self.event_tx.send(ListenerEvent::Open);

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.state),
            self.event_tx.clone(),
            self.shutdown_tx.subscribe(),
        ));
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    fn is_opening(&self) -> bool {
        self.state.is_opening()
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ListenerEvent>> {
        self.events.take()
    }
}

/// Configure and open the listening socket.
fn bind_std(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => Socket::new(Domain::IPV4, Type::STREAM, None)?,
        SocketAddr::V6(_) => Socket::new(Domain::IPV6, Type::STREAM, None)?,
    };
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<LinkState>,
    event_tx: mpsc::UnboundedSender<ListenerEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::debug!("Client connected from {peer}");
                    let (client, driver) = RemoteClient::channel(RemoteInfo::Socket(peer));
                    tokio::spawn(client_io(stream, driver, shutdown_rx.clone()));
                    let _ = event_tx.send(ListenerEvent::Client(client));
                }
                Err(err) => {
                    let _ = event_tx.send(ListenerEvent::Error(err.into()));
                }
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    state.set_open(false);
    let _ = event_tx.send(ListenerEvent::Close);
}

/// Per-client I/O: reads become `Data` events, queued writes go out.
/// Ends when the peer hangs up, the client is destroyed or the
/// listener shuts down.
async fn client_io(
    mut stream: TcpStream,
    driver: RemoteClientDriver,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let RemoteClientDriver {
        mut write_rx,
        event_tx,
        mut closed_rx,
    } = driver;
    let mut read_buf = BytesMut::with_capacity(4096);
    loop {
        // `read_buf` reports EOF for a full buffer otherwise.
        read_buf.reserve(4096);
        tokio::select! {
            result = stream.read_buf(&mut read_buf) => match result {
                Ok(0) => break,
                Ok(_) => {
                    let _ = event_tx.send(ClientEvent::Data(read_buf.split().freeze()));
                }
                Err(err) => {
                    let _ = event_tx.send(ClientEvent::Error(err.into()));
                    break;
                }
            },
            queued = write_rx.recv() => match queued {
                Some(bytes) => {
                    if let Err(err) = stream.write_all(&bytes).await {
                        let _ = event_tx.send(ClientEvent::Error(err.into()));
                        break;
                    }
                }
                None => break,
            },
            _ = closed_rx.changed() => {
                if *closed_rx.borrow() {
                    break;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    let _ = event_tx.send(ClientEvent::Close);
}
