//! Drives several concurrent subscriptions and QoS 1 publishes against an
//! in-memory mock broker (see `transport::mock`), exercising the same
//! connection runtime a real TCP broker would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mqtt_runtime::connection::Completion;
use mqtt_runtime::pool::TokioPool;
use mqtt_runtime::transport::mock;
use mqtt_runtime::{ClientConfig, Connection, QoS, RuntimeConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let (client_transport, mut broker_side) = mock::pair();

    // A minimal broker double: CONNACK every CONNECT, SUBACK/UNSUBACK every
    // SUBSCRIBE/UNSUBSCRIBE, and PUBACK every QoS 1 PUBLISH.
    tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut buf = vec![0u8; 4096];
        loop {
            let n = match broker_side.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            let packet_type = buf[0] >> 4;
            match packet_type {
                1 => {
                    let _ = broker_side.write_all(&[0x20, 0x02, 0x00, 0x00]).await;
                }
                8 => {
                    let packet_id = [buf[2], buf[3]];
                    let _ = broker_side
                        .write_all(&[0x90, 0x03, packet_id[0], packet_id[1], 0x00])
                        .await;
                }
                10 => {
                    let packet_id = [buf[2], buf[3]];
                    let _ = broker_side
                        .write_all(&[0xB0, 0x02, packet_id[0], packet_id[1]])
                        .await;
                }
                3 => {
                    // QoS lives in the fixed header flags; only QoS 1 carries
                    // a packet id, right after the topic name.
                    if (buf[0] >> 1) & 0x03 == 1 {
                        let topic_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                        let id_offset = 4 + topic_len;
                        let packet_id = [buf[id_offset], buf[id_offset + 1]];
                        let _ = broker_side
                            .write_all(&[0x40, 0x02, packet_id[0], packet_id[1]])
                            .await;
                    }
                }
                _ => {}
            }
        }
    });

    let conn = Connection::connect(
        client_transport,
        ClientConfig::new("multi-demo"),
        RuntimeConfig::default(),
        Arc::new(TokioPool::new()),
        Vec::new(),
        Duration::from_secs(5),
    )
    .await
    .expect("connect");
    tracing::info!("connected");

    let received = Arc::new(AtomicUsize::new(0));
    let filters = ["sensors/+/temp", "sensors/+/humidity", "alerts/#"];
    for filter in filters {
        let counter = received.clone();
        let handle = conn
            .subscribe(
                filter,
                QoS::AtLeastOnce,
                Completion::Waitable,
                Arc::new(move |topic, _payload, _qos| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tracing::info!(topic, "matched");
                }),
            )
            .await
            .expect("subscribe");
        let status = handle.wait(Duration::from_secs(5)).await;
        tracing::info!(filter, ?status, "subscribed");
    }

    for i in 0..5 {
        let handle = conn
            .publish(
                format!("sensors/{i}/temp"),
                format!("{}", 20 + i).into_bytes(),
                QoS::AtLeastOnce,
                false,
                Completion::Waitable,
            )
            .await
            .expect("publish");
        let status = handle.wait(Duration::from_secs(5)).await;
        tracing::info!(i, ?status, "published");
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    tracing::info!(count = received.load(Ordering::SeqCst), "total delivered");

    conn.disconnect(false, Duration::from_secs(5)).await;
}
