// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Modbus slave: a per-client request dispatcher.
//!
//! A [`Slave`] owns one [`Listener`] and a [`Service`]. For every
//! accepted [`RemoteClient`] it decodes ADUs with the configured
//! framing, invokes the service and writes the encoded response back.
//! Requests of one client are processed in arrival order; different
//! clients are independent of each other.

pub mod service;

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;

use crate::{
    codec::{FrameEvent, DEFAULT_MAX_BUFFER_LENGTH},
    connection::{ClientEvent, Listener, ListenerEvent, RemoteClient, RemoteInfo},
    error::Error,
    frame::{ExceptionCode, Request, ResponsePdu, UnitId},
    transport::{encode_adu, FrameDecoder, TransportConfig},
};

pub use self::service::Service;

/// Slave configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveConfig {
    /// Upper bound on simultaneously served clients; `0` is unbounded.
    /// Clients beyond the limit are destroyed right away.
    pub max_clients: usize,
    /// Demote client errors to debug logging instead of reporting them
    /// at warn level.
    pub suppress_client_errors: bool,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            max_clients: 0,
            suppress_client_errors: true,
        }
    }
}

/// Events emitted by a [`Slave`].
#[derive(Debug)]
pub enum SlaveEvent {
    /// A client was accepted.
    ClientConnected(RemoteInfo),
    /// A client went away.
    ClientDisconnected(RemoteInfo),
    /// A request was decoded and is about to be handled.
    Request {
        client: RemoteInfo,
        unit: UnitId,
        request: Request,
    },
    /// A response was written back to the client.
    Response {
        client: RemoteInfo,
        unit: UnitId,
        response: ResponsePdu,
    },
    /// A frame- or transport-level error on one client.
    ClientError {
        client: RemoteInfo,
        error: Error,
    },
    /// A listener-level error.
    Error(Error),
}

#[derive(Debug)]
enum SlaveCommand {
    Destroy,
}

/// A Modbus slave (server).
#[derive(Debug)]
pub struct Slave {
    cmd_tx: mpsc::UnboundedSender<SlaveCommand>,
    events: Option<mpsc::UnboundedReceiver<SlaveEvent>>,
}

impl Slave {
    /// Serve `service` over the given listener and framing.
    ///
    /// The listener must be freshly created; the slave takes its event
    /// stream and opens it. Must be called within a Tokio runtime.
    #[must_use]
    pub fn new<S>(
        listener: Box<dyn Listener>,
        transport: TransportConfig,
        service: S,
        config: SlaveConfig,
    ) -> Self
    where
        S: Service + Send + Sync + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(
            Actor {
                listener,
                transport,
                service: Arc::new(service),
                config,
                cmd_rx,
                event_tx,
                active_clients: 0,
            }
            .run(),
        );
        Self {
            cmd_tx,
            events: Some(event_rx),
        }
    }

    /// A Modbus TCP slave bound to `addr`.
    #[cfg(feature = "tcp")]
    #[must_use]
    pub fn tcp<S>(addr: std::net::SocketAddr, service: S) -> Self
    where
        S: Service + Send + Sync + 'static,
    {
        use crate::connection::tcp::TcpServerListener;
        Self::new(
            Box::new(TcpServerListener::new(addr)),
            TransportConfig::Ip,
            service,
            SlaveConfig::default(),
        )
    }

    /// Hand out the event receiver. Yields `None` on subsequent calls;
    /// there is exactly one consumer.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SlaveEvent>> {
        self.events.take()
    }

    /// Close the listener and all clients. Operations after this are
    /// no-ops.
    pub fn destroy(&self) {
        let _ = self.cmd_tx.send(SlaveCommand::Destroy);
    }
}

struct Actor<S> {
    listener: Box<dyn Listener>,
    transport: TransportConfig,
    service: Arc<S>,
    config: SlaveConfig,
    cmd_rx: mpsc::UnboundedReceiver<SlaveCommand>,
    event_tx: mpsc::UnboundedSender<SlaveEvent>,
    active_clients: usize,
}

impl<S> Actor<S>
where
    S: Service + Send + Sync + 'static,
{
    async fn run(mut self) {
        let mut listener_events = match self.listener.take_events() {
            Some(rx) => rx,
            None => {
                log::error!("Listener event stream already taken");
                return;
            }
        };
        if let Err(err) = self.listener.open().await {
            let _ = self.event_tx.send(SlaveEvent::Error(err));
            return;
        }
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SlaveCommand::Destroy) | None => break,
                },
                event = listener_events.recv() => match event {
                    Some(ListenerEvent::Client(client)) => self.accept(client, &done_tx),
                    Some(ListenerEvent::Open) => log::debug!("Listening"),
                    Some(ListenerEvent::Close) => log::debug!("Listener closed"),
                    Some(ListenerEvent::Error(err)) => {
                        let _ = self.event_tx.send(SlaveEvent::Error(err));
                    }
                    None => break,
                },
                Some(()) = done_rx.recv() => {
                    self.active_clients = self.active_clients.saturating_sub(1);
                }
            }
        }
        self.listener.close().await;
        log::debug!("Slave destroyed");
    }

    fn accept(&mut self, client: RemoteClient, done_tx: &mpsc::UnboundedSender<()>) {
        if self.config.max_clients > 0 && self.active_clients >= self.config.max_clients {
            log::warn!(
                "Rejecting client {}: limit of {} reached",
                client.remote_info(),
                self.config.max_clients
            );
            client.destroy();
            return;
        }
        self.active_clients += 1;
        let _ = self
            .event_tx
            .send(SlaveEvent::ClientConnected(client.remote_info().clone()));
        tokio::spawn(serve_client(
            client,
            self.transport,
            Arc::clone(&self.service),
            self.config.suppress_client_errors,
            self.event_tx.clone(),
            done_tx.clone(),
        ));
    }
}

/// Decode, dispatch and respond for one client until it goes away.
async fn serve_client<S>(
    mut client: RemoteClient,
    transport: TransportConfig,
    service: Arc<S>,
    suppress_client_errors: bool,
    event_tx: mpsc::UnboundedSender<SlaveEvent>,
    done_tx: mpsc::UnboundedSender<()>,
) where
    S: Service + Send + Sync + 'static,
{
    let info = client.remote_info().clone();
    let Some(mut client_events) = client.take_events() else {
        let _ = done_tx.send(());
        return;
    };
    let mut decoder = FrameDecoder::new(transport, DEFAULT_MAX_BUFFER_LENGTH);
    let mut frame_events = Vec::new();

    loop {
        let eof_timeout = decoder.eof_pending();
        tokio::select! {
            event = client_events.recv() => match event {
                Some(ClientEvent::Data(bytes)) => {
                    decoder.feed(&bytes, &mut frame_events);
                    for frame_event in frame_events.drain(..) {
                        dispatch(
                            frame_event,
                            &client,
                            &info,
                            transport,
                            &*service,
                            suppress_client_errors,
                            &event_tx,
                        )
                        .await;
                    }
                }
                Some(ClientEvent::Error(error)) => {
                    report_client_error(&info, error, suppress_client_errors, &event_tx);
                }
                Some(ClientEvent::Close) | None => break,
            },
            () = tokio::time::sleep(eof_timeout.unwrap_or(Duration::from_secs(86_400))),
                if eof_timeout.is_some() =>
            {
                decoder.flush(&mut frame_events);
                for frame_event in frame_events.drain(..) {
                    dispatch(
                        frame_event,
                        &client,
                        &info,
                        transport,
                        &*service,
                        suppress_client_errors,
                        &event_tx,
                    )
                    .await;
                }
            }
        }
    }

    log::debug!("Client {info} disconnected");
    let _ = event_tx.send(SlaveEvent::ClientDisconnected(info));
    let _ = done_tx.send(());
}

/// The per-ADU pipeline: decode the request, invoke the service, encode
/// and write the response.
async fn dispatch<S>(
    frame_event: FrameEvent,
    client: &RemoteClient,
    info: &RemoteInfo,
    transport: TransportConfig,
    service: &S,
    suppress_client_errors: bool,
    event_tx: &mpsc::UnboundedSender<SlaveEvent>,
) where
    S: Service,
{
    let adu = match frame_event {
        FrameEvent::Adu(adu) => adu,
        FrameEvent::Error(err) => {
            report_client_error(info, err.into(), suppress_client_errors, event_tx);
            return;
        }
        FrameEvent::BufferOverflow(bytes) => {
            log::warn!(
                "Client {info}: receive buffer overflow, {} byte(s) discarded",
                bytes.len()
            );
            report_client_error(
                info,
                Error::IncompleteResponseFrame,
                suppress_client_errors,
                event_tx,
            );
            return;
        }
    };

    let request = match Request::decode(&adu.pdu) {
        Ok(request) => request,
        Err(error) => {
            report_client_error(info, error, suppress_client_errors, event_tx);
            return;
        }
    };
    let _ = event_tx.send(SlaveEvent::Request {
        client: info.clone(),
        unit: adu.unit,
        request: request.clone(),
    });

    let function = request.function_code();
    let mut response = match service.call(adu.unit, request).await {
        Ok(response) if response.function_code() == function => ResponsePdu::from(response),
        Ok(response) => {
            log::error!(
                "Client {info}: service answered {} with function code {}",
                function,
                response.function_code()
            );
            exception_pdu(function.value(), ExceptionCode::SlaveDeviceFailure)
        }
        Err(exception) => exception_pdu(function.value(), exception),
    };

    let pdu = match response.encode() {
        Ok(pdu) => pdu,
        Err(error) => {
            // The service produced an out-of-range response.
            log::error!("Client {info}: {error}");
            response = exception_pdu(function.value(), ExceptionCode::SlaveDeviceFailure);
            let Ok(pdu) = response.encode() else {
                unreachable!()
            };
            pdu
        }
    };
    client.write(encode_adu(
        transport,
        adu.transaction_id.unwrap_or(0),
        adu.unit,
        &pdu,
    ));
    let _ = event_tx.send(SlaveEvent::Response {
        client: info.clone(),
        unit: adu.unit,
        response,
    });
}

fn exception_pdu(function: u8, exception: ExceptionCode) -> ResponsePdu {
    ResponsePdu::from(crate::frame::ExceptionResponse {
        function,
        exception,
    })
}

fn report_client_error(
    info: &RemoteInfo,
    error: Error,
    suppress: bool,
    event_tx: &mpsc::UnboundedSender<SlaveEvent>,
) {
    if suppress {
        log::debug!("Client {info}: {error}");
    } else {
        log::warn!("Client {info}: {error}");
    }
    let _ = event_tx.send(SlaveEvent::ClientError {
        client: info.clone(),
        error,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec,
        connection::RemoteClientDriver,
        frame::Response,
    };

    use async_trait::async_trait;

    /// A listener fed by hand from the test body.
    #[derive(Debug)]
    struct MockListener {
        open: bool,
        events: Option<mpsc::UnboundedReceiver<ListenerEvent>>,
    }

    fn mock_listener() -> (Box<dyn Listener>, mpsc::UnboundedSender<ListenerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Box::new(MockListener {
                open: false,
                events: Some(event_rx),
            }),
            event_tx,
        )
    }

    #[async_trait]
    impl Listener for MockListener {
        async fn open(&mut self) -> crate::error::Result<()> {
            self.open = true;
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

        fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ListenerEvent>> {
            self.events.take()
        }
    }

    fn test_service(
        _unit: UnitId,
        request: Request,
    ) -> impl std::future::Future<Output = Result<Response, ExceptionCode>> + Send {
        async move {
            match request {
                Request::ReadHoldingRegisters(_, 2) => {
                    Ok(Response::ReadHoldingRegisters(vec![0x1122, 0x3344]))
                }
                Request::ReadHoldingRegisters(_, _) => Err(ExceptionCode::IllegalDataAddress),
                _ => Err(ExceptionCode::IllegalFunction),
            }
        }
    }

    fn connect_client(
        listener_tx: &mpsc::UnboundedSender<ListenerEvent>,
    ) -> (RemoteClientDriver, RemoteInfo) {
        let info = RemoteInfo::Socket("127.0.0.1:50200".parse().unwrap());
        let (client, driver) = RemoteClient::channel(info.clone());
        listener_tx.send(ListenerEvent::Client(client)).unwrap();
        (driver, info)
    }

    #[tokio::test]
    async fn requests_are_answered_in_order() {
        let (listener, listener_tx) = mock_listener();
        let slave = Slave::new(
            listener,
            TransportConfig::Ip,
            test_service,
            SlaveConfig::default(),
        );
        let (mut driver, _info) = connect_client(&listener_tx);

        let frame = codec::ip::encode(0x0007, 0x11, &[0x03, 0x00, 0x00, 0x00, 0x02]);
        driver.event_tx.send(ClientEvent::Data(frame)).unwrap();

        let written = driver.write_rx.recv().await.unwrap();
        assert_eq!(
            &written[..],
            &[
                0x00, 0x07, // transaction id echoed
                0x00, 0x00, // protocol id
                0x00, 0x07, // length
                0x11, // unit echoed
                0x03, 0x04, 0x11, 0x22, 0x33, 0x44,
            ]
        );
        slave.destroy();
    }

    #[tokio::test]
    async fn service_errors_become_exception_responses() {
        let (listener, listener_tx) = mock_listener();
        let slave = Slave::new(
            listener,
            TransportConfig::Ip,
            test_service,
            SlaveConfig::default(),
        );
        let (mut driver, _info) = connect_client(&listener_tx);

        let frame = codec::ip::encode(0x0001, 0x11, &[0x03, 0x00, 0x00, 0x00, 0x05]);
        driver.event_tx.send(ClientEvent::Data(frame)).unwrap();

        let written = driver.write_rx.recv().await.unwrap();
        assert_eq!(&written[7..], &[0x83, 0x02]);
        slave.destroy();
    }

    #[tokio::test]
    async fn malformed_requests_are_dropped() {
        let (listener, listener_tx) = mock_listener();
        let mut slave = Slave::new(
            listener,
            TransportConfig::Ip,
            test_service,
            SlaveConfig::default(),
        );
        let mut events = slave.take_events().unwrap();
        let (driver, _info) = connect_client(&listener_tx);

        // Unknown function code 0x07 fails request decoding.
        let frame = codec::ip::encode(0x0001, 0x11, &[0x07]);
        driver.event_tx.send(ClientEvent::Data(frame)).unwrap();

        loop {
            match events.recv().await.unwrap() {
                SlaveEvent::ClientError { error, .. } => {
                    assert!(matches!(error, Error::InvalidFrame(_)));
                    break;
                }
                SlaveEvent::ClientConnected(_) => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        slave.destroy();
    }

    #[tokio::test]
    async fn clients_beyond_the_limit_are_destroyed() {
        let (listener, listener_tx) = mock_listener();
        let slave = Slave::new(
            listener,
            TransportConfig::Ip,
            test_service,
            SlaveConfig {
                max_clients: 1,
                suppress_client_errors: true,
            },
        );

        let (_first_driver, _) = connect_client(&listener_tx);
        let (second_driver, _) = connect_client(&listener_tx);

        let mut closed_rx = second_driver.closed_rx;
        closed_rx.changed().await.unwrap();
        assert!(*closed_rx.borrow());
        slave.destroy();
    }

    #[tokio::test]
    async fn rtu_requests_are_answered_with_crc() {
        let (listener, listener_tx) = mock_listener();
        let slave = Slave::new(
            listener,
            TransportConfig::Rtu {
                eof_timeout: Duration::ZERO,
            },
            test_service,
            SlaveConfig::default(),
        );
        let (mut driver, _info) = connect_client(&listener_tx);

        let frame = codec::rtu::encode(0x11, &[0x03, 0x00, 0x6B, 0x00, 0x02]);
        driver.event_tx.send(ClientEvent::Data(frame)).unwrap();

        let written = driver.write_rx.recv().await.unwrap();
        let adu = codec::rtu::decode(&written).unwrap();
        assert_eq!(adu.unit, 0x11);
        assert_eq!(&adu.pdu[..], &[0x03, 0x04, 0x11, 0x22, 0x33, 0x44]);
        slave.destroy();
    }
}
