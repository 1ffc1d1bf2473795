// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! UDP datagram connection.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch},
};

use crate::error::Result;

use super::{Connection, ConnectionEvent, LinkState};

/// A connected UDP socket. One datagram carries one frame.
#[derive(Debug)]
pub struct UdpConnection {
    addr: SocketAddr,
    state: Arc<LinkState>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    write_tx: mpsc::UnboundedSender<Bytes>,
    shutdown_tx: watch::Sender<bool>,
}

impl UdpConnection {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (write_tx, _) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            addr,
            state: Arc::new(LinkState::default()),
            event_tx,
            events: Some(event_rx),
            write_tx,
            shutdown_tx,
        }
    }
}

#[async_trait]
impl Connection for UdpConnection {
    async fn open(&mut self) -> Result<()> {
        if self.state.is_open() || self.state.is_opening() {
            return Ok(());
        }
        self.state.set_opening(true);
        let _ = self.shutdown_tx.send(false);

        let bind_addr: SocketAddr = if self.addr.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(err) => {
                self.state.set_opening(false);
                return Err(err.into());
            }
        };
        if let Err(err) = socket.connect(self.addr).await {
            self.state.set_opening(false);
            return Err(err.into());
        }

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        self.write_tx = write_tx;
        self.state.set_opening(false);
        self.state.set_open(true);
        let _ = self.event_tx.send(ConnectionEvent::Open);

        tokio::spawn(pump_socket(
            socket,
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
        let _ = self.write_tx.send(bytes);
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.take()
    }
}

async fn pump_socket(
    socket: UdpSocket,
    state: Arc<LinkState>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    mut write_rx: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // The maximum ADU fits comfortably; datagrams are never fragmented
    // by this library.
    let mut read_buf = [0u8; 1024];
    loop {
        tokio::select! {
            result = socket.recv(&mut read_buf) => match result {
                Ok(len) => {
                    let _ = event_tx.send(ConnectionEvent::Data(
                        Bytes::copy_from_slice(&read_buf[..len]),
                    ));
                }
                Err(err) => {
                    let _ = event_tx.send(ConnectionEvent::Error(err.into()));
                }
            },
            queued = write_rx.recv() => match queued {
                Some(bytes) => {
                    if let Err(err) = socket.send(&bytes).await {
                        let _ = event_tx.send(ConnectionEvent::Error(err.into()));
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
    state.set_open(false);
    let _ = event_tx.send(ConnectionEvent::Close);
}
