//! ViBus bus-position publisher
//!
//! Publishes sample bus telemetry to `vibus/autobus/{id}/posizione`, for
//! exercising a running `vibus-live` without a real fleet.
//!
//! ## Usage
//!
//! ```bash
//! # One message for SVT101 on line 1
//! publish-bus --bus-id SVT101 --line 1 --lat 45.55 --lon 11.55
//!
//! # Ten messages, one per second, drifting east
//! publish-bus --bus-id SVT101 --line 1 --repeat 10 --interval-ms 1000
//! ```

use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Duration};
use vibus_live::protocol::{bus_position_topic, BusPositionWire, WirePosition};
use vibus_live::transport::mqtt::generate_client_id;

/// Longitude step per repeated message
const DRIFT_DEGREES: f64 = 0.0005;

#[derive(Parser)]
#[command(
    name = "publish-bus",
    about = "Publish sample bus-position telemetry to a ViBus broker"
)]
struct Args {
    #[arg(long, required = true)]
    bus_id: String,

    #[arg(long, required = true)]
    line: String,

    #[arg(long)]
    line_name: Option<String>,

    #[arg(long, default_value_t = 45.5455)]
    lat: f64,

    #[arg(long, default_value_t = 11.5354)]
    lon: f64,

    #[arg(long, default_value_t = 25.0)]
    speed: f64,

    #[arg(long, default_value_t = 90.0)]
    bearing: f64,

    /// Minutes behind schedule (negative when early)
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    delay: f64,

    #[arg(long, default_value_t = 0)]
    passengers: i64,

    #[arg(long, default_value = "in_service")]
    status: String,

    /// Number of messages to publish
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    #[arg(long, default_value = "localhost", env = "VIBUS_BROKER_HOST")]
    broker_host: String,

    #[arg(long, default_value_t = 1883, env = "VIBUS_BROKER_PORT")]
    broker_port: u16,
}

impl Args {
    fn payload(&self, step: u32) -> BusPositionWire {
        BusPositionWire {
            bus_id: self.bus_id.clone(),
            line: self.line.clone(),
            line_name: self.line_name.clone(),
            position: Some(WirePosition {
                lat: self.lat,
                lon: self.lon + DRIFT_DEGREES * f64::from(step),
            }),
            speed: Some(self.speed),
            bearing: Some(self.bearing),
            delay: Some(self.delay),
            passengers: Some(self.passengers),
            status: Some(self.status.clone()),
            timestamp: Some(Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()),
            ..Default::default()
        }
    }
}

async fn connect(host: &str, port: u16) -> Result<AsyncClient, Box<dyn std::error::Error>> {
    let mut options = MqttOptions::new(generate_client_id("publish-bus"), host, port);
    options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(options, 10);
    let (connected_tx, connected_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut connected_tx = Some(connected_tx);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if let Some(tx) = connected_tx.take() {
                        let _ = tx.send(());
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("MQTT eventloop error: {e}");
                    break;
                }
            }
        }
    });

    println!("Connecting to MQTT broker {host}:{port}...");
    timeout(Duration::from_secs(10), connected_rx)
        .await
        .map_err(|_| format!("no ConnAck from {host}:{port} within 10s"))?
        .map_err(|_| format!("connection to {host}:{port} failed"))?;

    Ok(client)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.bus_id.trim().is_empty() || args.line.trim().is_empty() {
        eprintln!("✗ --bus-id and --line must not be blank");
        std::process::exit(1);
    }

    let client = match connect(&args.broker_host, args.broker_port).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("✗ {e}");
            std::process::exit(1);
        }
    };

    let topic = bus_position_topic(&args.bus_id);
    for step in 0..args.repeat {
        let payload = serde_json::to_string(&args.payload(step))?;
        client
            .publish(&topic, QoS::AtLeastOnce, false, payload.clone())
            .await?;
        println!("📤 {topic} {payload}");

        if step + 1 < args.repeat {
            sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    // Let the event loop flush the last publish
    sleep(Duration::from_millis(500)).await;
    client.disconnect().await?;
    println!("✓ Published {} message(s)", args.repeat);
    Ok(())
}
