// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serial port connection.

use std::{io, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_serial::SerialPortBuilderExt as _;

use crate::error::Result;

use super::{pump_stream, Connection, ConnectionEvent, LinkState};

/// Configuration of a [`SerialConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub path: String,
    /// Baud rate, e.g. 9600 or 19200.
    pub baud_rate: u32,
}

/// A serial port connection.
#[derive(Debug)]
pub struct SerialConnection {
    config: SerialConfig,
    state: Arc<LinkState>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    write_tx: mpsc::UnboundedSender<Bytes>,
    shutdown_tx: watch::Sender<bool>,
}

impl SerialConnection {
    #[must_use]
    pub fn new(config: SerialConfig) -> Self {
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
impl Connection for SerialConnection {
    async fn open(&mut self) -> Result<()> {
        if self.state.is_open() || self.state.is_opening() {
            return Ok(());
        }
        self.state.set_opening(true);
        let _ = self.shutdown_tx.send(false);

        let stream = match tokio_serial::new(&self.config.path, self.config.baud_rate)
            .open_native_async()
        {
            Ok(stream) => stream,
            Err(err) => {
                self.state.set_opening(false);
                return Err(io::Error::new(io::ErrorKind::Other, err).into());
            }
        };

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        self.write_tx = write_tx;
        self.state.set_opening(false);
        self.state.set_open(true);
        let _ = self.event_tx.send(ConnectionEvent::Open);

        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut write_rx = write_rx;
            pump_stream(stream, &mut write_rx, &event_tx, &mut shutdown_rx).await;
            state.set_open(false);
            let _ = event_tx.send(ConnectionEvent::Close);
        });
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
