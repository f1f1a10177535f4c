//! Roomwatch Room Monitoring Daemon
//!
//! Subscribes to per-room sensor streams on the broker, fuses them into
//! snapshots and publishes fault and occupancy alerts.

use anyhow::Result;
use roomwatch_engine::{Collaborators, Dispatcher, RoomRouter};
use roomwatch_io::jsonl::{JsonLinesFactSink, JsonStateStore};
use roomwatch_io::topic;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod config;
mod mqtt;

use config::AppConfig;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    tracing::info!("╔══════════════════════════════════════════╗");
    tracing::info!("║      Roomwatch Room Monitoring Daemon    ║");
    tracing::info!("║            Version 0.1.0                 ║");
    tracing::info!("╚══════════════════════════════════════════╝");

    // Load configuration
    let config = AppConfig::load()?;
    tracing::info!("Configuration loaded from {:?}", config.config_path);
    config.validate_rooms()?;
    let engine_config = config.engine_config()?;

    // Persistence sinks
    let data_dir = PathBuf::from(&config.data_directory);
    let facts = Arc::new(JsonLinesFactSink::open(&data_dir)?);
    let states = Arc::new(JsonStateStore::open(&data_dir)?);
    tracing::info!("Persisting to {}", data_dir.display());

    // Broker connection
    let (client, mut eventloop) =
        AsyncClient::new(mqtt::options(&config.mqtt), config.mqtt.channel_capacity);
    let publisher = Arc::new(mqtt::MqttPublisher::new(client.clone()));

    let dispatcher = Arc::new(Dispatcher::new(
        engine_config,
        Collaborators {
            publisher,
            facts: facts.clone(),
            states,
        },
    ));
    tracing::info!("Fault rules loaded: {}", dispatcher.fault_rules().len());

    let mut router = RoomRouter::new(dispatcher);
    let subscriptions = topic::subscriptions(&config.rooms);

    print_system_status(&config);

    tracing::info!("Roomwatch is now monitoring {} rooms", config.rooms.len());
    tracing::info!("Press Ctrl+C to stop");

    serve(&client, &mut eventloop, &mut router, &subscriptions, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    })
    .await;

    // Cleanup
    tracing::info!("Shutting down...");
    drain(router, &mut eventloop).await;
    disconnect(&client, &mut eventloop).await;

    facts.flush()?;
    tracing::info!("Roomwatch shutdown complete");

    Ok(())
}

/// Route broker traffic until `shutdown` resolves. Connection errors pause
/// polling for [`RECONNECT_DELAY`] without delaying shutdown.
async fn serve(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    router: &mut RoomRouter,
    subscriptions: &[String],
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);

    let mut backing_off = false;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(RECONNECT_DELAY), if backing_off => {
                backing_off = false;
            }
            event = eventloop.poll(), if !backing_off => {
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        tracing::trace!(topic = %publish.topic, bytes = publish.payload.len(), "Message received");
                        router.route(mqtt::delivery(client, publish));
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("Connected to broker");
                        // Subscriptions are renewed on every connect
                        for filter in subscriptions {
                            if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                                tracing::error!(%filter, "Subscribe failed: {}", e);
                            }
                        }
                        tracing::info!("Subscribed to {} topics", subscriptions.len());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("MQTT connection error: {}", e);
                        backing_off = true;
                    }
                }
            }
        }
    }
}

/// Wait for every queued reading while the event loop keeps flushing acks
/// and alerts. New deliveries are left unacknowledged for redelivery.
async fn drain(router: RoomRouter, eventloop: &mut EventLoop) {
    let shutdown = router.shutdown();
    tokio::pin!(shutdown);

    let mut backing_off = false;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(RECONNECT_DELAY), if backing_off => {
                backing_off = false;
            }
            event = eventloop.poll(), if !backing_off => {
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        tracing::debug!(topic = %publish.topic, "Ignoring message during shutdown");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("MQTT connection error during shutdown: {}", e);
                        backing_off = true;
                    }
                }
            }
        }
    }
}

async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.disconnect().await {
        tracing::warn!("Disconnect request failed: {}", e);
        return;
    }

    let flushed = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    if flushed.is_err() {
        tracing::warn!("Timed out waiting for broker disconnect");
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,roomwatch=debug,roomwatch_engine=debug,roomwatch_io=debug"));

    let json = std::env::var("ROOMWATCH_LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false))
            .init();
    }
}

fn print_system_status(config: &AppConfig) {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_memory();

    tracing::info!("╭─────────────── System Status ───────────────╮");
    tracing::info!("│ Hostname: {:>32} │", System::host_name().unwrap_or_default());
    tracing::info!("│ OS: {:>38} │", System::name().unwrap_or_default());
    tracing::info!("│ Memory: {:>26} MB / {} MB │",
        sys.used_memory() / 1024 / 1024,
        sys.total_memory() / 1024 / 1024);
    tracing::info!("├──────────────── Configuration ────────────────┤");
    tracing::info!("│ Broker: {:>34} │", format!("{}:{}", config.mqtt.host, config.mqtt.port));
    tracing::info!("│ Rooms: {:>35} │", config.rooms.join(","));
    tracing::info!("│ Time Zone: {:>31} │", config.timezone);
    tracing::info!("│ Data: {:>36} │", config.data_directory);
    tracing::info!("│ CO₂ History: {:>26} samples │", config.occupancy.history_capacity);
    tracing::info!("╰──────────────────────────────────────────────╯");
}
