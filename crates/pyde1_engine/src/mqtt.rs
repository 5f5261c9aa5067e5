//! External notification transport. Grounded on `alsuren-mijia-homie`'s use
//! of `rumqttc` — the only MQTT client crate attested anywhere in the
//! retrieval pack — for `MqttOptions`/`LastWill`/`QoS`/keep-alive setup;
//! `AsyncClient`/`EventLoop` here stand in for that crate's lower-level
//! `EventLoop::poll` pump, one per connection.

use std::time::Duration;

use pyde1_core::config::MqttConfig;
use pyde1_core::message::EventPayload;
use pyde1_core::EventBus;
use rumqttc::{AsyncClient, Event as MqttEvent, LastWill, MqttOptions, Packet, QoS};
use tracing::{error, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(15);
const EVENT_LOOP_CAPACITY: usize = 64;
const WILL_TOPIC_SUFFIX: &str = "$state";

/// Publishes every bus event as JSON under `{TOPIC_ROOT}/{Kind}` and
/// subscribes to `update/de1/*` so external consumers can issue commands.
/// Runs until the bus has no more publishers, or the connection is
/// cancelled by dropping the returned `JoinHandle`.
pub async fn spawn(config: &MqttConfig, bus: EventBus) -> Result<tokio::task::JoinHandle<()>, rumqttc::ClientError> {
    let topic_root = config.topic_root.clone();
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_last_will(LastWill {
        topic: format!("{topic_root}/{WILL_TOPIC_SUFFIX}"),
        message: "lost".into(),
        qos: QoS::AtLeastOnce,
        retain: true,
    });

    let (client, mut event_loop) = AsyncClient::new(options, EVENT_LOOP_CAPACITY);
    client
        .subscribe("update/de1/#", QoS::AtLeastOnce)
        .await?;
    client
        .publish(
            format!("{topic_root}/{WILL_TOPIC_SUFFIX}"),
            QoS::AtLeastOnce,
            true,
            "ready",
        )
        .await?;

    let poll_client = client.clone();
    let handle = tokio::spawn(async move {
        let mut sub = bus.subscribe(None);
        loop {
            tokio::select! {
                event = sub.recv() => {
                    let Some(event) = event else { break };
                    publish_event(&poll_client, &topic_root, &event.payload).await;
                }
                polled = event_loop.poll() => {
                    match polled {
                        Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                            info!(topic = %publish.topic, "received MQTT command");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "MQTT connection error, retrying");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    });
    Ok(handle)
}

async fn publish_event(client: &AsyncClient, topic_root: &str, payload: &EventPayload) {
    let topic = format!("{topic_root}/{}", payload.kind());
    match serde_json::to_vec(payload) {
        Ok(body) => {
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, true, body).await {
                error!(error = %e, "failed to publish notification event");
            }
        }
        Err(e) => error!(error = %e, "failed to serialize event for MQTT notification"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn topic_follows_topic_root_slash_kind() {
        let payload = EventPayload::WaterLevel(pyde1_core::message::WaterLevelPayload {
            level_mm: 1.0,
            low_water_threshold_mm: 0.5,
        });
        assert_eq!(format!("pyde1/{}", payload.kind()), "pyde1/WaterLevel");
    }
}
