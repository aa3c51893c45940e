//! Connects to a broker, subscribes to a topic, publishes one QoS 1 message
//! to it, and prints what comes back.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mqtt_runtime::connection::Completion;
use mqtt_runtime::pool::TokioPool;
use mqtt_runtime::transport::Connector;
use mqtt_runtime::{ClientConfig, Connection, QoS, RuntimeConfig, TcpConnector};

#[derive(Parser)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:1883")]
    broker: String,
    #[arg(long, default_value = "demo-client")]
    client_id: String,
    #[arg(long, default_value = "demo/topic")]
    topic: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let connector = TcpConnector::default();
    let transport = connector.connect(&args.broker).await?;

    let config = ClientConfig::new(args.client_id);
    let conn = Connection::connect(
        transport,
        config,
        RuntimeConfig::default(),
        Arc::new(TokioPool::new()),
        Vec::new(),
        Duration::from_secs(5),
    )
    .await?;
    tracing::info!("connected");

    let topic = args.topic.clone();
    let handle = conn
        .subscribe(
            topic.clone(),
            QoS::AtLeastOnce,
            Completion::Waitable,
            Arc::new(|topic, payload, qos| {
                tracing::info!(
                    topic,
                    ?qos,
                    payload = %String::from_utf8_lossy(payload),
                    "inbound publish"
                );
            }),
        )
        .await?;
    tracing::info!(status = ?handle.wait(Duration::from_secs(5)).await, "subscribe complete");

    let handle = conn
        .publish(
            topic.as_str(),
            b"hello from mqtt-runtime".as_slice(),
            QoS::AtLeastOnce,
            false,
            Completion::Waitable,
        )
        .await?;
    tracing::info!(status = ?handle.wait(Duration::from_secs(5)).await, "publish complete");

    tokio::time::sleep(Duration::from_secs(1)).await;
    conn.disconnect(false, Duration::from_secs(5)).await;
    Ok(())
}
