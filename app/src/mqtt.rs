//! MQTT transport
//!
//! Broker-backed [`Publisher`] and [`Acknowledge`] implementations. Manual
//! acknowledgments are enabled so a delivery is only confirmed once its room
//! worker has handled it.

use crate::config::MqttConfig;
use rumqttc::{AsyncClient, MqttOptions, Publish, QoS};
use roomwatch_io::{Acknowledge, BoxFuture, Delivery, IoError, Publisher, Result};
use std::time::Duration;

pub fn options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(false);
    options.set_manual_acks(true);

    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or_default());
    }
    options
}

/// Publishes alerts at QoS 1
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl Publisher for MqttPublisher {
    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(|e| IoError::Publish(e.to_string()))
        })
    }
}

struct MqttAck {
    client: AsyncClient,
    publish: Publish,
}

impl Acknowledge for MqttAck {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            self.client
                .ack(&self.publish)
                .await
                .map_err(|e| IoError::Ack(e.to_string()))
        })
    }
}

/// Wrap an incoming publish so it is acknowledged through `client`
pub fn delivery(client: &AsyncClient, publish: Publish) -> Delivery {
    let topic = publish.topic.clone();
    let payload = publish.payload.to_vec();

    Delivery::new(
        topic,
        payload,
        Box::new(MqttAck {
            client: client.clone(),
            publish,
        }),
    )
}
