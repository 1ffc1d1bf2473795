// SPDX-FileCopyrightText: Copyright (c) 2026 the modbus-link authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Drive a real master against a real slave over loopback TCP.

#![cfg(feature = "tcp")]

use std::time::Duration;

use modbus_link::{
    connection::tcp::TcpServerListener,
    frame::{FileRecord, FileSubRequest, FileSubResponse},
    prelude::*,
};

/// Answers reads with predictable data and echoes writes.
fn test_service(
    _unit: UnitId,
    request: Request,
) -> impl std::future::Future<Output = std::result::Result<Response, ExceptionCode>> + Send {
    async move {
        match request {
            Request::ReadHoldingRegisters(0x6666, _) => Err(ExceptionCode::IllegalDataAddress),
            Request::ReadHoldingRegisters(start, quantity) => Ok(Response::ReadHoldingRegisters(
                (start..start + quantity).collect(),
            )),
            Request::ReadCoils(_, quantity) => Ok(Response::ReadCoils(
                (0..quantity).map(|i| i % 2 == 0).collect(),
            )),
            Request::WriteSingleCoil(address, state) => {
                Ok(Response::WriteSingleCoil(address, state))
            }
            Request::WriteMultipleRegisters(address, words) => {
                Ok(Response::WriteMultipleRegisters(address, words.len() as u16))
            }
            Request::ReadFileRecord(sub_requests) => Ok(Response::ReadFileRecord(
                sub_requests
                    .iter()
                    .map(|sub| FileSubResponse {
                        record_data: vec![sub.file_number; usize::from(sub.record_length)],
                    })
                    .collect(),
            )),
            Request::WriteFileRecord(records) => Ok(Response::WriteFileRecord(records)),
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }
}

async fn completed(transaction: &mut TransactionHandle) -> anyhow::Result<ResponsePdu> {
    transaction
        .completed()
        .await
        .map_err(|err| anyhow::anyhow!("transaction failed: {err}"))
}

fn options(request: Request) -> TransactionOptions {
    TransactionOptions::new(request)
        .unit(0x2A)
        .timeout(Duration::from_millis(1000))
}

#[tokio::test]
async fn tcp_master_talks_to_slave() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let listener = TcpServerListener::bind("127.0.0.1:0".parse()?)?;
    let addr = listener.local_addr();
    let slave = Slave::new(
        Box::new(listener),
        TransportConfig::Ip,
        test_service,
        SlaveConfig::default(),
    );
    let master = Master::tcp(addr);

    let checks = async {
        // Holding registers round trip.
        let mut transaction =
            master.execute(options(Request::ReadHoldingRegisters(0x10, 4)));
        let pdu = completed(&mut transaction).await?;
        assert_eq!(
            pdu.0.unwrap(),
            Response::ReadHoldingRegisters(vec![0x10, 0x11, 0x12, 0x13])
        );

        // Coils with a quantity that is not a multiple of eight; the
        // response pads to full bytes.
        let mut transaction = master.execute(options(Request::ReadCoils(0, 3)));
        let pdu = completed(&mut transaction).await?;
        let Ok(Response::ReadCoils(coils)) = pdu.0 else {
            anyhow::bail!("unexpected response");
        };
        assert_eq!(&coils[..3], &[true, false, true]);

        // Write echo.
        let mut transaction = master.execute(options(Request::WriteSingleCoil(0x0001, true)));
        let pdu = completed(&mut transaction).await?;
        assert_eq!(pdu.0.unwrap(), Response::WriteSingleCoil(0x0001, true));

        // File-record access.
        let mut transaction = master.execute(options(Request::ReadFileRecord(vec![
            FileSubRequest {
                file_number: 4,
                record_number: 1,
                record_length: 2,
            },
        ])));
        let pdu = completed(&mut transaction).await?;
        assert_eq!(
            pdu.0.unwrap(),
            Response::ReadFileRecord(vec![FileSubResponse {
                record_data: vec![4, 4],
            }])
        );

        let records = vec![FileRecord {
            file_number: 4,
            record_number: 7,
            record_data: vec![0x06AF, 0x04BE],
        }];
        let mut transaction =
            master.execute(options(Request::WriteFileRecord(records.clone())));
        let pdu = completed(&mut transaction).await?;
        assert_eq!(pdu.0.unwrap(), Response::WriteFileRecord(records));

        // Exception responses surface after the retries are spent.
        let mut transaction = master.execute(
            options(Request::ReadHoldingRegisters(0x6666, 1)).max_retries(0),
        );
        let pdu = completed(&mut transaction).await?;
        let exception = pdu.0.unwrap_err();
        assert_eq!(exception.function, 0x03);
        assert_eq!(exception.exception, ExceptionCode::IllegalDataAddress);

        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        () = tokio::time::sleep(Duration::from_millis(10_000)) => {
            panic!("timeout - perhaps we have a lockup or a thread was killed")
        }
        result = checks => result?,
    }

    master.destroy();
    slave.destroy();
    Ok(())
}

#[tokio::test]
async fn master_reports_connection_lifecycle() -> anyhow::Result<()> {
    let listener = TcpServerListener::bind("127.0.0.1:0".parse()?)?;
    let addr = listener.local_addr();
    let slave = Slave::new(
        Box::new(listener),
        TransportConfig::Ip,
        test_service,
        SlaveConfig::default(),
    );

    let mut master = Master::tcp(addr);
    let mut events = master.take_events().unwrap();

    let wait_connected = async {
        loop {
            // The first connect attempt may race the listener setup;
            // the reconnect backoff covers that.
            match events.recv().await {
                Some(MasterEvent::Connected) => break,
                Some(_) => continue,
                None => panic!("master event stream ended"),
            }
        }
    };
    tokio::select! {
        () = tokio::time::sleep(Duration::from_millis(10_000)) => {
            panic!("timeout - perhaps we have a lockup or a thread was killed")
        }
        () = wait_connected => {}
    }

    master.destroy();
    slave.destroy();
    Ok(())
}
