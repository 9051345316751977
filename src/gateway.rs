// MIT License - Copyright (c) 2026 Peter Wright
// MQTT side of the bridge: command subscriptions in, publications out

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{MqttConfig, parse_mqtt_url};
use crate::diagnostics::Diagnostics;
use crate::engine::EngineHandle;
use crate::error::{BridgeError, Result};
use crate::mapping::{MappingTable, Publication};

/// Size of the client's outgoing request queue.
const MQTT_REQUEST_CAPACITY: usize = 256;

/// Time allowed to flush the offline status on shutdown.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Somewhere publications can be handed off without waiting on the network.
pub trait Publisher: Send + Sync {
    fn publish(&self, publication: &Publication) -> Result<()>;
}

impl Publisher for AsyncClient {
    fn publish(&self, publication: &Publication) -> Result<()> {
        self.try_publish(
            publication.topic.as_str(),
            QoS::AtLeastOnce,
            publication.retain,
            publication.payload.as_bytes(),
        )?;
        Ok(())
    }
}

/// In-process consumer, e.g. a test harness.
impl Publisher for mpsc::UnboundedSender<Publication> {
    fn publish(&self, publication: &Publication) -> Result<()> {
        self.send(publication.clone()).map_err(|_| {
            BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "publication receiver dropped",
            ))
        })
    }
}

/// Publish and log failures. Publishing is never fatal.
pub fn publish(publisher: &dyn Publisher, publication: &Publication) {
    match publisher.publish(publication) {
        Ok(()) => debug!("Published to {}: {}", publication.topic, publication.payload),
        Err(e) => error!("Failed to publish to {}: {e}", publication.topic),
    }
}

/// Resolve one incoming MQTT message and queue the resulting command.
///
/// Returns whether a command was queued. Rejections are logged and reported
/// on the diagnostics error topic.
pub fn route_command(
    mapping: &MappingTable,
    engine: &EngineHandle,
    diagnostics: &Diagnostics,
    publisher: &dyn Publisher,
    topic: &str,
    payload: &[u8],
) -> bool {
    let request = match mapping.resolve_outbound(topic, payload) {
        Ok(Some(request)) => request,
        Ok(None) => {
            debug!("No outbound rule matches {topic}");
            return false;
        }
        Err(e) => {
            warn!("Cannot resolve command on {topic}: {e}");
            publish(publisher, &diagnostics.error(&e, Some(topic)));
            return false;
        }
    };

    info!(
        "MQTT command on {topic} -> {} via {}",
        request.message.kind, request.rule
    );
    match engine.accept(request) {
        Ok(()) => true,
        Err(e) => {
            warn!("Rejected command on {topic}: {e}");
            publish(publisher, &diagnostics.error(&e, Some(topic)));
            false
        }
    }
}

/// Build client options: credentials, keep-alive and a retained `offline`
/// last will on the status topic.
pub fn mqtt_options(config: &MqttConfig, diagnostics: &Diagnostics) -> Result<MqttOptions> {
    let (host, port) = parse_mqtt_url(&config.url)?;
    let mut options = MqttOptions::new(&config.client_id, host, port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or_default());
    }
    let will = diagnostics.offline();
    options.set_last_will(LastWill::new(
        will.topic,
        will.payload,
        QoS::AtLeastOnce,
        will.retain,
    ));
    Ok(options)
}

/// Owns the rumqttc client and its event loop.
pub struct MqttGateway {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttGateway {
    pub fn new(config: &MqttConfig, diagnostics: &Diagnostics) -> Result<Self> {
        let options = mqtt_options(config, diagnostics)?;
        let (client, eventloop) = AsyncClient::new(options, MQTT_REQUEST_CAPACITY);
        Ok(Self { client, eventloop })
    }

    /// Cloneable publishing handle.
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Drive the connection until shutdown. rumqttc reconnects on the next
    /// poll after an error.
    pub async fn run(
        mut self,
        mapping: &MappingTable,
        engine: &EngineHandle,
        diagnostics: &Diagnostics,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let subscriptions = mapping.subscriptions();
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = self.eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // rumqttc does not resubscribe after a broker reconnect.
                    info!("MQTT: connected, subscribing to {} topics", subscriptions.len());
                    for filter in &subscriptions {
                        if let Err(e) = self.client.subscribe(filter, QoS::AtLeastOnce).await {
                            error!("Failed to subscribe to {filter}: {e}");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(msg))) => {
                    route_command(
                        mapping,
                        engine,
                        diagnostics,
                        &self.client,
                        &msg.topic,
                        &msg.payload,
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT event loop error: {e}");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        self.disconnect(diagnostics).await;
    }

    /// Publish `offline` and disconnect, giving the event loop a short
    /// window to flush both.
    async fn disconnect(mut self, diagnostics: &Diagnostics) {
        publish(&self.client, &diagnostics.offline());
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect: {e}");
            return;
        }
        let flush = async {
            while self.eventloop.poll().await.is_ok() {}
        };
        if tokio::time::timeout(DISCONNECT_GRACE, flush).await.is_err() {
            debug!("MQTT disconnect did not complete in time");
        }
        info!("MQTT disconnected");
    }
}
