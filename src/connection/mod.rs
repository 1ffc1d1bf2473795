// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Abstract byte connections and listeners.
//!
//! The protocol engine never touches sockets directly; it consumes the
//! traits in this module. The `tcp`, `udp` and `serial` submodules ship
//! ready-made implementations for the common cases, anything else (e.g.
//! WebSocket) can be supplied externally by implementing the same traits.

#[cfg(feature = "serial")]
pub mod serial;
#[cfg(feature = "tcp")]
pub mod tcp;
#[cfg(feature = "udp")]
pub mod udp;

use std::{fmt, net::SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};

/// Events emitted by a [`Connection`].
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The link is up.
    Open,
    /// The link went down. With auto-reconnect enabled an `Open` may
    /// follow later.
    Close,
    /// The connection failed; it stays usable unless a `Close` follows.
    Error(Error),
    /// Bytes arrived.
    Data(Bytes),
}

/// A bidirectional byte stream or datagram link.
///
/// Implementations deliver everything that happens on the link through
/// the event receiver handed out by [`take_events`](Self::take_events);
/// the methods never block beyond what the underlying primitive does.
#[async_trait]
pub trait Connection: fmt::Debug + Send {
    /// Establish the link. A no-op if already open or opening.
    async fn open(&mut self) -> Result<()>;

    /// Tear the link down and stop any reconnect attempts.
    async fn close(&mut self);

    /// `true` while the link is established.
    fn is_open(&self) -> bool;

    /// `true` while a connect (or reconnect) attempt is running.
    fn is_opening(&self) -> bool;

    /// Queue bytes for transmission.
    ///
    /// Write failures surface as [`ConnectionEvent::Error`].
    async fn write(&mut self, bytes: Bytes) -> Result<()>;

    /// Hand out the event receiver. Yields `None` on subsequent calls;
    /// there is exactly one consumer.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;
}

/// Events emitted by a [`Listener`].
#[derive(Debug)]
pub enum ListenerEvent {
    /// The listener accepts clients now.
    Open,
    /// The listener shut down.
    Close,
    /// The listener failed.
    Error(Error),
    /// A remote client connected.
    Client(RemoteClient),
}

/// A passive endpoint accepting remote clients.
#[async_trait]
pub trait Listener: fmt::Debug + Send {
    /// Start accepting clients. A no-op if already open or opening.
    async fn open(&mut self) -> Result<()>;

    /// Stop accepting clients and destroy all of them.
    async fn close(&mut self);

    /// `true` while the listener accepts clients.
    fn is_open(&self) -> bool;

    /// `true` while the listener is binding.
    fn is_opening(&self) -> bool;

    /// Hand out the event receiver. Yields `None` on subsequent calls;
    /// there is exactly one consumer.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ListenerEvent>>;
}

/// Where a remote client connected from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteInfo {
    /// An IP endpoint (TCP or UDP).
    Socket(SocketAddr),
    /// A path-addressed endpoint, e.g. a Unix socket or a pty.
    Path(String),
}

impl fmt::Display for RemoteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(addr) => addr.fmt(f),
            Self::Path(path) => path.fmt(f),
        }
    }
}

/// Events emitted by a [`RemoteClient`].
#[derive(Debug)]
pub enum ClientEvent {
    /// Bytes arrived from the client.
    Data(Bytes),
    /// The client disconnected.
    Close,
    /// The client link failed.
    Error(Error),
}

/// One connected remote peer of a [`Listener`].
///
/// Writes are queued and flushed by the listener's I/O task; dropping
/// the client or calling [`destroy`](Self::destroy) closes the link.
#[derive(Debug)]
pub struct RemoteClient {
    remote_info: RemoteInfo,
    write_tx: mpsc::UnboundedSender<Bytes>,
    closed_tx: watch::Sender<bool>,
    events: Option<mpsc::UnboundedReceiver<ClientEvent>>,
}

impl RemoteClient {
    /// Create a client together with the driver half used by the
    /// listener implementation to pump bytes in and out.
    #[must_use]
    pub fn channel(remote_info: RemoteInfo) -> (Self, RemoteClientDriver) {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let client = Self {
            remote_info,
            write_tx,
            closed_tx,
            events: Some(event_rx),
        };
        let driver = RemoteClientDriver {
            write_rx,
            event_tx,
            closed_rx,
        };
        (client, driver)
    }

    /// Where the client connected from.
    #[must_use]
    pub fn remote_info(&self) -> &RemoteInfo {
        &self.remote_info
    }

    /// Queue bytes for transmission to the client.
    pub fn write(&self, bytes: Bytes) {
        // A failed send means the I/O task is gone; the matching Close
        // event is already in the queue.
        let _ = self.write_tx.send(bytes);
    }

    /// Close the link to the client.
    pub fn destroy(&self) {
        let _ = self.closed_tx.send(true);
    }

    /// Hand out the event receiver. Yields `None` on subsequent calls.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events.take()
    }
}

/// The listener-side half of a [`RemoteClient`].
#[derive(Debug)]
pub struct RemoteClientDriver {
    /// Bytes queued via [`RemoteClient::write`].
    pub write_rx: mpsc::UnboundedReceiver<Bytes>,
    /// Where to deliver [`ClientEvent`]s.
    pub event_tx: mpsc::UnboundedSender<ClientEvent>,
    /// Flips to `true` when [`RemoteClient::destroy`] is called.
    pub closed_rx: watch::Receiver<bool>,
}

/// Open/opening flags shared between a connection handle and its I/O task.
#[cfg(any(feature = "tcp", feature = "udp", feature = "serial"))]
#[derive(Debug, Default)]
pub(crate) struct LinkState {
    open: std::sync::atomic::AtomicBool,
    opening: std::sync::atomic::AtomicBool,
}

#[cfg(any(feature = "tcp", feature = "udp", feature = "serial"))]
impl LinkState {
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub(crate) fn is_opening(&self) -> bool {
        self.opening.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub(crate) fn set_open(&self, open: bool) {
        self.open.store(open, std::sync::atomic::Ordering::Relaxed);
    }

    pub(crate) fn set_opening(&self, opening: bool) {
        self.opening
            .store(opening, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Pump a byte stream: reads become `Data` events, queued writes go out,
/// a shutdown signal ends the loop. Returns once the stream is done.
#[cfg(any(feature = "tcp", feature = "serial"))]
pub(crate) async fn pump_stream<S>(
    stream: S,
    write_rx: &mut mpsc::UnboundedReceiver<Bytes>,
    event_tx: &mpsc::UnboundedSender<ConnectionEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    tokio::pin!(stream);
    let mut read_buf = BytesMut::with_capacity(4096);
    loop {
        // `read_buf` reports EOF for a full buffer otherwise.
        read_buf.reserve(4096);
        tokio::select! {
            result = stream.read_buf(&mut read_buf) => match result {
                Ok(0) => break,
                Ok(_) => {
                    let _ = event_tx.send(ConnectionEvent::Data(read_buf.split().freeze()));
                }
                Err(err) => {
                    let _ = event_tx.send(ConnectionEvent::Error(err.into()));
                    break;
                }
            },
            queued = write_rx.recv() => match queued {
                Some(bytes) => {
                    if let Err(err) = stream.write_all(&bytes).await {
                        let _ = event_tx.send(ConnectionEvent::Error(err.into()));
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
