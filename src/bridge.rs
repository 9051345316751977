// MIT License - Copyright (c) 2026 Peter Wright
// Bridge supervisor: builds the pipeline and keeps the panel link alive
//
// The link task is the only reader and writer of the transport. It races
// incoming bytes, newly accepted requests and the pending deadline, and hands
// each to the engine. When the transport fails the engine is told the link is
// down and the supervisor reconnects with backoff.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{Level, debug, error, info, warn};

use crate::backoff::Backoff;
use crate::codec::Codec;
use crate::config::{BridgeConfig, ReconnectConfig};
use crate::diagnostics::Diagnostics;
use crate::engine::{Action, Engine, EngineHandle};
use crate::error::{BridgeError, Result};
use crate::gateway::{self, MqttGateway, Publisher};
use crate::mapping::MappingTable;
use crate::protocol::Catalog;
use crate::transport::{Connector, TransportChannels};

/// Owns one panel link across reconnects.
pub struct LinkSupervisor<C: Connector> {
    connector: C,
    engine: EngineHandle,
    publisher: Arc<dyn Publisher>,
    backoff: Backoff,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl<C: Connector> LinkSupervisor<C> {
    pub fn new(
        connector: C,
        engine: EngineHandle,
        publisher: Arc<dyn Publisher>,
        reconnect: &ReconnectConfig,
    ) -> Self {
        Self {
            connector,
            engine,
            publisher,
            backoff: Backoff::from_config(reconnect),
            connect_timeout: Duration::from_millis(reconnect.connect_timeout_ms),
            write_timeout: Duration::from_millis(reconnect.write_timeout_ms),
        }
    }

    /// Connect, drive, reconnect; until `shutdown` turns true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let actions = self.engine.with(|e| e.link_connecting());
            self.publish_all(actions);

            let endpoint = self.connector.describe();
            info!("Connecting to panel at {endpoint}");
            let connected = tokio::select! {
                _ = shutdown.changed() => break,
                result = tokio::time::timeout(self.connect_timeout, self.connector.connect()) => result,
            };

            let failure = match connected {
                Ok(Ok(channels)) => {
                    info!("Panel link to {endpoint} established");
                    let started = Instant::now();
                    let result = self.drive(channels, &mut shutdown).await;
                    self.backoff.record_session(started.elapsed());
                    match result {
                        Ok(()) => break,
                        Err(e) => e,
                    }
                }
                Ok(Err(e)) => e,
                Err(_) => BridgeError::Link(format!(
                    "connect to {endpoint} timed out after {}ms",
                    self.connect_timeout.as_millis()
                )),
            };
            if failure_level(&failure) == Level::ERROR {
                error!("Panel link to {endpoint} failed: {failure}");
            } else {
                warn!("Panel link to {endpoint} failed: {failure}");
            }
            let actions = self.engine.with(|e| e.link_down(&failure.to_string()));
            self.publish_all(actions);

            let delay = self.backoff.next_delay();
            info!(
                "Reconnecting in {}ms (attempt {})",
                delay.as_millis(),
                self.backoff.attempt()
            );
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let actions = self.engine.with(|e| e.link_down("shutdown"));
        self.publish_all(actions);
        info!("Panel link stopped");
    }

    /// Run one connection. `Ok` on shutdown, `Err` when the link failed.
    async fn drive(
        &self,
        mut channels: TransportChannels,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let actions = self.engine.with(|e| {
            let mut actions = e.link_up();
            actions.extend(e.poll_transmit(Instant::now()));
            actions
        });
        self.apply(actions, &channels.tx).await?;

        loop {
            let deadline = self.engine.with(|e| e.next_deadline());
            let actions = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                chunk = channels.rx.recv() => match chunk {
                    Some(chunk) => self.engine.with(|e| e.handle_bytes(&chunk, Instant::now())),
                    None => return Err(BridgeError::Link("transport closed".into())),
                },
                _ = self.engine.notified() => {
                    self.engine.with(|e| e.poll_transmit(Instant::now()))
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.engine.with(|e| e.poll_timeout(Instant::now()))
                }
            };
            self.apply(actions, &channels.tx).await?;
        }
    }

    /// Carry out engine actions. Publications are always delivered; the
    /// first write failure or reset request is returned after the rest.
    async fn apply(&self, actions: Vec<Action>, tx: &mpsc::Sender<Bytes>) -> Result<()> {
        let mut failure = None;
        for action in actions {
            match action {
                Action::Publish(publication) => {
                    gateway::publish(self.publisher.as_ref(), &publication)
                }
                Action::Write(_) if failure.is_some() => {}
                Action::Write(frame) => {
                    debug!("Writing {:?}", String::from_utf8_lossy(&frame));
                    match tokio::time::timeout(self.write_timeout, tx.send(frame)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => {
                            failure = Some(BridgeError::Link("transport closed".into()));
                        }
                        Err(_) => {
                            failure = Some(BridgeError::Link(format!(
                                "write timed out after {}ms",
                                self.write_timeout.as_millis()
                            )));
                        }
                    }
                }
                Action::ResetLink(reason) => {
                    warn!("Resetting panel link: {reason}");
                    failure.get_or_insert(BridgeError::Link(reason));
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn publish_all(&self, actions: Vec<Action>) {
        for action in actions {
            if let Action::Publish(publication) = action {
                gateway::publish(self.publisher.as_ref(), &publication);
            }
        }
    }
}

/// The assembled pipeline: catalog, codec, mapping table and engine, built
/// once from configuration.
pub struct Bridge {
    config: BridgeConfig,
    mapping: Arc<MappingTable>,
    diagnostics: Diagnostics,
    engine: EngineHandle,
}

impl Bridge {
    /// Compile the catalog and rules. Any inconsistency is a configuration
    /// error.
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        let catalog = Arc::new(Catalog::compile(&config.protocol.messages)?);
        let mapping = Arc::new(MappingTable::compile(&config.mapping, &catalog)?);
        let codec = Arc::new(Codec::new(catalog, &config.protocol.framing));
        let diagnostics = Diagnostics::new(config.diagnostics.clone());
        let engine = Engine::new(
            codec,
            mapping.clone(),
            diagnostics.clone(),
            config.engine.clone(),
        );
        info!(
            "Bridge ready: {} message kinds, {} command topics",
            config.protocol.messages.len(),
            mapping.subscriptions().len()
        );
        Ok(Self {
            config: config.clone(),
            mapping,
            diagnostics,
            engine: EngineHandle::new(engine),
        })
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn mapping(&self) -> &MappingTable {
        &self.mapping
    }

    /// Supervisor for a link opened by `connector`.
    pub fn supervisor<C: Connector>(
        &self,
        connector: C,
        publisher: Arc<dyn Publisher>,
    ) -> LinkSupervisor<C> {
        LinkSupervisor::new(
            connector,
            self.engine.clone(),
            publisher,
            &self.config.reconnect,
        )
    }

    /// Hand one MQTT message to the engine, as the gateway does.
    pub fn route_command(&self, publisher: &dyn Publisher, topic: &str, payload: &[u8]) -> bool {
        gateway::route_command(
            &self.mapping,
            &self.engine,
            &self.diagnostics,
            publisher,
            topic,
            payload,
        )
    }

    /// Run the MQTT gateway and the panel link until `shutdown`.
    ///
    /// The gateway is stopped after the link so that the final link state
    /// and any purged requests are still published.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let gateway = MqttGateway::new(&self.config.mqtt, &self.diagnostics)?;
        info!("MQTT: connecting to {}", self.config.mqtt.url);
        let publisher: Arc<dyn Publisher> = Arc::new(gateway.client());
        let supervisor = self.supervisor(self.config.transport.clone(), publisher);

        let (mqtt_stop_tx, mqtt_stop_rx) = watch::channel(false);
        let mapping = self.mapping.clone();
        let engine = self.engine.clone();
        let diagnostics = self.diagnostics.clone();
        let mqtt_handle = tokio::spawn(async move {
            gateway
                .run(&mapping, &engine, &diagnostics, mqtt_stop_rx)
                .await;
        });

        supervisor.run(shutdown).await;

        let _ = mqtt_stop_tx.send(true);
        if let Err(e) = mqtt_handle.await {
            warn!("MQTT task ended abnormally: {e}");
        }
        Ok(())
    }
}

/// Transient transport failures are expected while the panel is away.
fn failure_level(failure: &BridgeError) -> Level {
    if failure.is_retryable() {
        Level::WARN
    } else {
        Level::ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiagnosticsConfig, EngineConfig};
    use crate::engine::LinkState;
    use crate::engine::tests::parts;
    use crate::mapping::Publication;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Hands out prepared in-memory links, one per connect.
    struct MemoryConnector {
        links: Mutex<VecDeque<TransportChannels>>,
    }

    impl Connector for MemoryConnector {
        async fn connect(&self) -> Result<TransportChannels> {
            self.links
                .lock()
                .pop_front()
                .ok_or_else(|| BridgeError::Link("no panel".into()))
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }
    }

    /// Panel side of an in-memory link.
    struct Panel {
        to_bridge: mpsc::Sender<Bytes>,
        from_bridge: mpsc::Receiver<Bytes>,
    }

    fn link() -> (TransportChannels, Panel) {
        let (to_bridge, rx) = mpsc::channel(8);
        let (tx, from_bridge) = mpsc::channel(8);
        (
            TransportChannels::from_parts(rx, tx),
            Panel {
                to_bridge,
                from_bridge,
            },
        )
    }

    fn setup(
        links: Vec<TransportChannels>,
    ) -> (
        LinkSupervisor<MemoryConnector>,
        EngineHandle,
        mpsc::UnboundedReceiver<Publication>,
    ) {
        let (codec, mapping) = parts();
        let engine = EngineHandle::new(Engine::new(
            codec,
            mapping,
            Diagnostics::new(DiagnosticsConfig::default()),
            EngineConfig::default(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = MemoryConnector {
            links: Mutex::new(links.into()),
        };
        let supervisor =
            LinkSupervisor::new(connector, engine.clone(), Arc::new(tx), &ReconnectConfig::default());
        (supervisor, engine, rx)
    }

    async fn next_on(rx: &mut mpsc::UnboundedReceiver<Publication>, topic: &str) -> Publication {
        loop {
            let publication = rx.recv().await.unwrap();
            if publication.topic == topic {
                return publication;
            }
        }
    }

    async fn wait_for_link(engine: &EngineHandle, rx: &mut mpsc::UnboundedReceiver<Publication>) {
        while engine.with(|e| e.link_state()) != LinkState::Ready {
            next_on(rx, "ja2mqtt/status").await;
        }
    }

    fn arm(engine: &EngineHandle, mode: &str) {
        let (_, mapping) = parts();
        let request = mapping
            .resolve_outbound("alarm/arm", mode.as_bytes())
            .unwrap()
            .unwrap();
        engine.accept(request).unwrap();
    }

    #[test]
    fn test_failure_level() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(failure_level(&BridgeError::Io(refused)), Level::WARN);
        assert_eq!(
            failure_level(&BridgeError::Link("transport closed".into())),
            Level::WARN
        );
        assert_eq!(
            failure_level(&BridgeError::config("bad serial settings")),
            Level::ERROR
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_on_silent_panel() {
        let (channels, mut panel) = link();
        let (supervisor, engine, mut rx) = setup(vec![channels]);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(shutdown_rx));

        wait_for_link(&engine, &mut rx).await;
        let start = Instant::now();
        arm(&engine, "AWAY");
        assert_eq!(panel.from_bridge.recv().await.unwrap().as_ref(), b"ARM AWAY\n");

        let timeout = next_on(&mut rx, "ja2mqtt/diag/timeout").await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        let json: serde_json::Value = serde_json::from_str(&timeout.payload).unwrap();
        assert_eq!(json["reason"], "deadline");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        drop(panel);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_transport_closes() {
        let (first, panel) = link();
        let (second, mut panel2) = link();
        let (supervisor, engine, mut rx) = setup(vec![first, second]);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(shutdown_rx));

        wait_for_link(&engine, &mut rx).await;
        drop(panel);
        let down = next_on(&mut rx, "ja2mqtt/status").await;
        let json: serde_json::Value = serde_json::from_str(&down.payload).unwrap();
        assert_eq!(json["state"], "disconnected");

        wait_for_link(&engine, &mut rx).await;
        arm(&engine, "HOME");
        assert_eq!(panel2.from_bridge.recv().await.unwrap().as_ref(), b"ARM HOME\n");
        panel2.to_bridge.send(Bytes::from_static(b"OK\n")).await.unwrap();
        let ack = next_on(&mut rx, "alarm/ack").await;
        assert_eq!(ack.payload, "Ok 1");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_waiting_to_reconnect() {
        let (supervisor, engine, mut rx) = setup(Vec::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(shutdown_rx));

        // First connect fails immediately and the supervisor backs off.
        let mut states = Vec::new();
        while states.len() < 2 {
            let status = next_on(&mut rx, "ja2mqtt/status").await;
            let json: serde_json::Value = serde_json::from_str(&status.payload).unwrap();
            states.push(json["state"].as_str().unwrap().to_string());
        }
        assert_eq!(states, vec!["connecting", "disconnected"]);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(engine.with(|e| e.link_state()), LinkState::Disconnected);
    }
}
