// MIT License - Copyright (c) 2026 Peter Wright
// Translation engine: request queue, response pairing, timeouts, link health

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{Codec, Decoded, FrameDecoder};
use crate::config::EngineConfig;
use crate::diagnostics::{Diagnostics, TimeoutReason};
use crate::error::{BridgeError, Result};
use crate::mapping::{MappingTable, OutboundRequest, Publication};
use crate::protocol::{MessageClass, ProtocolMessage};

/// Request-pairing state of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    AwaitingResponse,
    LinkDown,
}

/// Health of the panel link, published on the status topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Ready,
    /// Up, but recent frames were malformed.
    Degraded,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Ready => "ready",
            LinkState::Degraded => "degraded",
        }
    }

    fn is_up(self) -> bool {
        matches!(self, LinkState::Ready | LinkState::Degraded)
    }
}

/// The single in-flight command.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: u32,
    pub request: OutboundRequest,
    pub deadline: Instant,
}

/// Side effects requested by the engine. The link task carries them out.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write a frame to the transport.
    Write(Bytes),
    Publish(Publication),
    /// Drop and reconnect the link.
    ResetLink(String),
}

/// Sans-IO state machine. Owns the queue, the pending request and the
/// stream decoder; all time comes in through `now` arguments.
pub struct Engine {
    codec: Arc<Codec>,
    mapping: Arc<MappingTable>,
    diagnostics: Diagnostics,
    config: EngineConfig,
    decoder: FrameDecoder,
    queue: VecDeque<OutboundRequest>,
    pending: Option<PendingRequest>,
    next_id: u32,
    link: LinkState,
    /// Consecutive malformed frames.
    frame_errors: u32,
    /// Consecutive good frames while degraded.
    clean_frames: u32,
}

impl Engine {
    pub fn new(
        codec: Arc<Codec>,
        mapping: Arc<MappingTable>,
        diagnostics: Diagnostics,
        config: EngineConfig,
    ) -> Self {
        Self {
            codec,
            mapping,
            diagnostics,
            config,
            decoder: FrameDecoder::new(),
            queue: VecDeque::new(),
            pending: None,
            next_id: 1,
            link: LinkState::Disconnected,
            frame_errors: 0,
            clean_frames: 0,
        }
    }

    pub fn state(&self) -> EngineState {
        if !self.link.is_up() {
            EngineState::LinkDown
        } else if self.pending.is_some() {
            EngineState::AwaitingResponse
        } else {
            EngineState::Idle
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }

    pub fn pending(&self) -> Option<&PendingRequest> {
        self.pending.as_ref()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Queue a request. Never blocks; refused while the link is down or
    /// the queue is full.
    pub fn accept(&mut self, request: OutboundRequest) -> Result<()> {
        if self.state() == EngineState::LinkDown {
            return Err(BridgeError::LinkDown);
        }
        // Reject unencodable commands now rather than when they reach the head.
        self.codec
            .encode(&request.message.clone().with_correlation(1))?;
        if self.queue.len() >= self.config.queue_capacity {
            return Err(BridgeError::Backpressure {
                capacity: self.config.queue_capacity,
            });
        }
        debug!(
            "Queued {} from {} ({} waiting)",
            request.message.kind,
            request.topic,
            self.queue.len() + 1
        );
        self.queue.push_back(request);
        Ok(())
    }

    /// Send the queue head if nothing is in flight.
    pub fn poll_transmit(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state() != EngineState::Idle {
            return actions;
        }
        while let Some(request) = self.queue.pop_front() {
            let id = self.next_sequence();
            let message = request.message.clone().with_correlation(id);
            match self.codec.encode(&message) {
                Ok(frame) => {
                    debug!("Sending {} (seq {id})", message.kind);
                    actions.push(Action::Write(frame));
                    self.pending = Some(PendingRequest {
                        id,
                        request,
                        deadline: now + self.config.request_timeout(),
                    });
                    break;
                }
                Err(e) => {
                    warn!("Cannot encode {}: {e}", message.kind);
                    actions.push(Action::Publish(
                        self.diagnostics.error(&e, Some(&request.topic)),
                    ));
                }
            }
        }
        actions
    }

    /// Feed bytes read from the link.
    pub fn handle_bytes(&mut self, chunk: &[u8], now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        for decoded in self.decoder.decode(&self.codec, chunk) {
            match decoded {
                Decoded::Message(msg) => {
                    self.record_frame(true, &mut actions);
                    self.handle_message(msg, &mut actions);
                }
                Decoded::Malformed { error, raw } => {
                    warn!("Malformed frame {:?}: {error}", String::from_utf8_lossy(&raw));
                    actions.push(Action::Publish(self.diagnostics.frame_error(&error, &raw)));
                    self.record_frame(false, &mut actions);
                }
            }
        }
        actions.extend(self.poll_transmit(now));
        actions
    }

    /// Expire the pending request if its deadline has passed.
    pub fn poll_timeout(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(pending) = self.pending.take_if(|p| p.deadline <= now) {
            warn!(
                "Request {} ({}) timed out",
                pending.id, pending.request.message.kind
            );
            actions.push(Action::Publish(self.diagnostics.request_timeout(
                Some(pending.id),
                &pending.request,
                TimeoutReason::Deadline,
            )));
        }
        actions.extend(self.poll_transmit(now));
        actions
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    pub fn link_connecting(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.set_link(LinkState::Connecting, &mut actions);
        actions
    }

    /// A fresh connection is ready.
    pub fn link_up(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.decoder.reset();
        self.frame_errors = 0;
        self.clean_frames = 0;
        self.set_link(LinkState::Ready, &mut actions);
        actions
    }

    /// The connection is gone: every pending and queued request is reported
    /// and dropped.
    pub fn link_down(&mut self, reason: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.link.is_up() {
            warn!("Link down: {reason}");
        }
        if let Some(pending) = self.pending.take() {
            actions.push(Action::Publish(self.diagnostics.request_timeout(
                Some(pending.id),
                &pending.request,
                TimeoutReason::LinkDown,
            )));
        }
        for request in self.queue.drain(..) {
            actions.push(Action::Publish(self.diagnostics.request_timeout(
                None,
                &request,
                TimeoutReason::LinkDown,
            )));
        }
        self.decoder.reset();
        self.set_link(LinkState::Disconnected, &mut actions);
        actions
    }

    fn next_sequence(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = if id >= self.config.max_sequence { 1 } else { id + 1 };
        id
    }

    fn handle_message(&mut self, mut msg: ProtocolMessage, actions: &mut Vec<Action>) {
        if msg.class == MessageClass::Command {
            debug!("Ignoring echoed command {}", msg.kind);
            return;
        }
        if self.completes_pending(&msg) {
            if let Some(pending) = self.pending.take() {
                debug!("{} completes request {}", msg.kind, pending.id);
                msg.correlation = Some(pending.id);
                self.publish_inbound(&msg, actions);
                if let Some(reply_to) = &pending.request.reply_to {
                    actions.push(Action::Publish(self.diagnostics.response(
                        reply_to,
                        pending.id,
                        &pending.request,
                        &msg,
                    )));
                }
            }
            return;
        }
        match msg.class {
            MessageClass::Response => warn!(
                "Dropping unmatched {} (correlation {:?}, pending {:?})",
                msg.kind,
                msg.correlation,
                self.pending.as_ref().map(|p| p.id)
            ),
            _ => self.publish_inbound(&msg, actions),
        }
    }

    fn completes_pending(&self, msg: &ProtocolMessage) -> bool {
        let Some(pending) = &self.pending else {
            return false;
        };
        let expected = self
            .codec
            .catalog()
            .get(&pending.request.message.kind)
            .map(|spec| spec.responses.as_slice())
            .unwrap_or_default();
        let kind_ok = if expected.is_empty() {
            msg.class == MessageClass::Response
        } else {
            expected.iter().any(|k| *k == msg.kind)
        };
        kind_ok && msg.correlation.is_none_or(|id| id == pending.id)
    }

    fn publish_inbound(&self, msg: &ProtocolMessage, actions: &mut Vec<Action>) {
        for result in self.mapping.resolve_inbound(msg) {
            match result {
                Ok(publication) => actions.push(Action::Publish(publication)),
                Err(e) => {
                    warn!("{e}");
                    actions.push(Action::Publish(self.diagnostics.error(&e, None)));
                }
            }
        }
    }

    fn record_frame(&mut self, ok: bool, actions: &mut Vec<Action>) {
        if ok {
            self.frame_errors = 0;
            if self.link == LinkState::Degraded {
                self.clean_frames += 1;
                if self.clean_frames >= self.config.recover_after {
                    self.set_link(LinkState::Ready, actions);
                }
            }
            return;
        }
        self.clean_frames = 0;
        self.frame_errors += 1;
        if self.link == LinkState::Ready && self.frame_errors >= self.config.degraded_after {
            self.set_link(LinkState::Degraded, actions);
        }
        if let Some(limit) = self.config.reconnect_after_frame_errors
            && self.frame_errors >= limit
        {
            actions.push(Action::ResetLink(format!(
                "{} consecutive frame errors",
                self.frame_errors
            )));
        }
    }

    fn set_link(&mut self, state: LinkState, actions: &mut Vec<Action>) {
        if self.link == state {
            return;
        }
        info!("Link {} -> {}", self.link.as_str(), state.as_str());
        self.link = state;
        if state == LinkState::Ready {
            self.clean_frames = 0;
        }
        actions.push(Action::Publish(self.diagnostics.link_state(state)));
    }
}

/// Shared handle used by the MQTT side to hand requests to the link task.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<Mutex<Engine>>,
    notify: Arc<Notify>,
}

impl EngineHandle {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueue and wake the link task.
    pub fn accept(&self, request: OutboundRequest) -> Result<()> {
        self.engine.lock().accept(request)?;
        self.notify.notify_one();
        Ok(())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> R {
        f(&mut self.engine.lock())
    }

    pub fn state(&self) -> EngineState {
        self.engine.lock().state()
    }

    /// Resolves after the next successful `accept`.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{DiagnosticsConfig, MappingConfig, MessageDef, FramingConfig};
    use crate::protocol::Catalog;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Deserialize)]
    struct Fixture {
        messages: Vec<MessageDef>,
        mapping: MappingConfig,
    }

    pub(crate) const FIXTURE: &str = r#"
        [[messages]]
        kind = "Set"
        class = "command"
        format = "{pin} SET {section}"
        params.section = { type = "int", min = 1, max = 8 }
        responses = ["Ok", "Error", "SectionState"]

        [[messages]]
        kind = "Arm"
        class = "command"
        format = "ARM {mode}"
        params.mode = { type = "enum", values = ["AWAY", "HOME"] }

        [[messages]]
        kind = "Ping"
        class = "command"
        format = "PING {seq}"
        responses = ["Pong"]

        [[messages]]
        kind = "Ok"
        class = "response"
        format = "OK"

        [[messages]]
        kind = "Pong"
        class = "response"
        format = "PONG {seq}"

        [[messages]]
        kind = "Error"
        class = "response"
        format = "ERROR: {code} {reason}"
        params.code = { type = "int" }
        params.reason = { type = "rest" }

        [[messages]]
        kind = "SectionState"
        class = "event"
        format = "STATE {section} {state}"
        params.section = { type = "int" }
        params.state = { type = "enum", values = ["ARMED", "READY"] }

        [[messages]]
        kind = "ZoneStatus"
        class = "event"
        format = "ZONE {zone} {open}"
        params.zone = { type = "int", min = 1, max = 32 }
        params.open = { type = "bool" }

        [[mapping.inbound]]
        kind = "ZoneStatus"
        topic = "alarm/zone/{zone}"
        payload = "{open}"
        transforms.open = { map = { "true" = "OPEN", "false" = "CLOSED" } }

        [[mapping.inbound]]
        kind = "SectionState"
        topic = "alarm/section/{section}"
        payload = "{state}"
        retain = true

        [[mapping.inbound]]
        kind = "Ok|Error"
        topic = "alarm/ack"
        payload = "{kind} {correlation}"

        [[mapping.outbound]]
        name = "arm"
        topic = "alarm/arm"
        kind = "Arm"
        params.mode = "{payload}"
        reply_topic = "alarm/arm/result"

        [[mapping.outbound]]
        name = "set"
        topic = "alarm/section/+/set"
        kind = "Set"
        params = { pin = "1234", section = "{segments.2}" }

        [[mapping.outbound]]
        name = "ping"
        topic = "alarm/ping"
        kind = "Ping"
    "#;

    pub(crate) fn parts() -> (Arc<Codec>, Arc<MappingTable>) {
        let fixture: Fixture = toml::from_str(FIXTURE).unwrap();
        let catalog = Arc::new(Catalog::compile(&fixture.messages).unwrap());
        let mapping = MappingTable::compile(&fixture.mapping, &catalog).unwrap();
        let codec = Codec::new(catalog, &FramingConfig::default());
        (Arc::new(codec), Arc::new(mapping))
    }

    fn engine(config: EngineConfig) -> Engine {
        let (codec, mapping) = parts();
        let mut engine = Engine::new(codec, mapping, Diagnostics::new(DiagnosticsConfig::default()), config);
        engine.link_up();
        engine
    }

    fn request(topic: &str, payload: &str) -> OutboundRequest {
        let (_, mapping) = parts();
        mapping.resolve_outbound(topic, payload.as_bytes()).unwrap().unwrap()
    }

    fn writes(actions: &[Action]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Write(b) => Some(String::from_utf8_lossy(b).into_owned()),
                _ => None,
            })
            .collect()
    }

    fn published<'a>(actions: &'a [Action], topic: &str) -> Vec<&'a Publication> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Publish(p) if p.topic == topic => Some(p),
                _ => None,
            })
            .collect()
    }

    fn json(p: &Publication) -> serde_json::Value {
        serde_json::from_str(&p.payload).unwrap()
    }

    #[test]
    fn test_fifo_after_completion() {
        let mut engine = engine(EngineConfig::default());
        let now = Instant::now();
        engine.accept(request("alarm/arm", "AWAY")).unwrap();
        engine.accept(request("alarm/arm", "HOME")).unwrap();

        let actions = engine.poll_transmit(now);
        assert_eq!(writes(&actions), vec!["ARM AWAY\n"]);
        assert_eq!(engine.state(), EngineState::AwaitingResponse);
        assert!(engine.poll_transmit(now).is_empty());

        let actions = engine.handle_bytes(b"OK\n", now);
        assert_eq!(published(&actions, "alarm/ack")[0].payload, "Ok 1");
        let reply = published(&actions, "alarm/arm/result");
        assert_eq!(json(reply[0])["kind"], "Ok");
        assert_eq!(writes(&actions), vec!["ARM HOME\n"]);
        assert_eq!(engine.pending().unwrap().id, 2);
    }

    #[test]
    fn test_unmatched_response_dropped() {
        let mut engine = engine(EngineConfig::default());
        let now = Instant::now();
        let actions = engine.handle_bytes(b"OK\n", now);
        assert!(published(&actions, "alarm/ack").is_empty());
        assert_eq!(engine.state(), EngineState::Idle);

        engine.accept(request("alarm/ping", "")).unwrap();
        assert_eq!(writes(&engine.poll_transmit(now)), vec!["PING 1\n"]);
        let actions = engine.handle_bytes(b"PONG 9\n", now);
        assert!(actions.is_empty());
        assert_eq!(engine.state(), EngineState::AwaitingResponse);
        engine.handle_bytes(b"PONG 1\n", now);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_timeout_reports_once_then_sends_next() {
        let mut engine = engine(EngineConfig::default());
        let t0 = Instant::now();
        engine.accept(request("alarm/arm", "AWAY")).unwrap();
        engine.accept(request("alarm/arm", "HOME")).unwrap();
        engine.poll_transmit(t0);
        assert_eq!(engine.next_deadline(), Some(t0 + Duration::from_secs(5)));

        assert!(engine.poll_timeout(t0 + Duration::from_secs(4)).is_empty());
        let actions = engine.poll_timeout(t0 + Duration::from_secs(5));
        let timeouts = published(&actions, "ja2mqtt/diag/timeout");
        assert_eq!(timeouts.len(), 1);
        assert_eq!(json(timeouts[0])["id"], 1);
        assert_eq!(writes(&actions), vec!["ARM HOME\n"]);

        let later = t0 + Duration::from_secs(6);
        assert!(published(&engine.poll_timeout(later), "ja2mqtt/diag/timeout").is_empty());
    }

    #[test]
    fn test_link_drop_purges_everything() {
        let mut engine = engine(EngineConfig::default());
        let now = Instant::now();
        engine.accept(request("alarm/arm", "AWAY")).unwrap();
        engine.accept(request("alarm/arm", "HOME")).unwrap();
        engine.poll_transmit(now);

        let actions = engine.link_down("connection reset");
        let timeouts = published(&actions, "ja2mqtt/diag/timeout");
        assert_eq!(timeouts.len(), 2);
        assert!(timeouts.iter().all(|p| json(p)["reason"] == "link_down"));
        assert_eq!(json(published(&actions, "ja2mqtt/status")[0])["state"], "disconnected");
        assert_eq!(engine.state(), EngineState::LinkDown);
        assert!(matches!(
            engine.accept(request("alarm/arm", "AWAY")),
            Err(BridgeError::LinkDown)
        ));

        engine.link_up();
        assert_eq!(engine.state(), EngineState::Idle);
        engine.accept(request("alarm/arm", "AWAY")).unwrap();
        assert_eq!(writes(&engine.poll_transmit(now)).len(), 1);
    }

    #[test]
    fn test_backpressure() {
        let mut engine = engine(EngineConfig {
            queue_capacity: 2,
            ..EngineConfig::default()
        });
        engine.accept(request("alarm/arm", "AWAY")).unwrap();
        engine.accept(request("alarm/arm", "AWAY")).unwrap();
        assert!(matches!(
            engine.accept(request("alarm/arm", "HOME")),
            Err(BridgeError::Backpressure { capacity: 2 })
        ));
        assert_eq!(engine.queued(), 2);
    }

    #[test]
    fn test_invalid_payload_rejected_on_accept() {
        let mut engine = engine(EngineConfig::default());
        let err = engine.accept(request("alarm/section/9/set", "")).unwrap_err();
        assert!(matches!(err, BridgeError::Payload { .. }));
        assert_eq!(engine.queued(), 0);
    }

    #[test]
    fn test_events_publish_immediately_and_can_complete() {
        let mut engine = engine(EngineConfig::default());
        let now = Instant::now();
        let actions = engine.handle_bytes(b"ZONE 3 1\n", now);
        assert_eq!(published(&actions, "alarm/zone/3")[0].payload, "OPEN");

        engine.accept(request("alarm/section/2/set", "")).unwrap();
        assert_eq!(writes(&engine.poll_transmit(now)), vec!["1234 SET 2\n"]);
        let actions = engine.handle_bytes(b"STATE 2 ARMED\n", now);
        let section = published(&actions, "alarm/section/2");
        assert_eq!(section[0].payload, "ARMED");
        assert!(section[0].retain);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_echo_ignored() {
        let mut engine = engine(EngineConfig::default());
        let now = Instant::now();
        engine.accept(request("alarm/arm", "AWAY")).unwrap();
        engine.poll_transmit(now);
        assert!(engine.handle_bytes(b"ARM AWAY\n", now).is_empty());
        assert_eq!(engine.state(), EngineState::AwaitingResponse);
    }

    #[test]
    fn test_degraded_and_recovery() {
        let mut engine = engine(EngineConfig::default());
        let now = Instant::now();
        let actions = engine.handle_bytes(b"JUNK\nJUNK\nJUNK\n", now);
        assert_eq!(published(&actions, "ja2mqtt/diag/frame").len(), 3);
        assert_eq!(engine.link_state(), LinkState::Degraded);
        assert_eq!(engine.state(), EngineState::Idle);

        engine.handle_bytes(b"ZONE 1 0\nZONE 1 0\nZONE 1 0\nZONE 1 0\n", now);
        assert_eq!(engine.link_state(), LinkState::Degraded);
        let actions = engine.handle_bytes(b"ZONE 1 0\n", now);
        assert_eq!(json(published(&actions, "ja2mqtt/status")[0])["state"], "ready");
    }

    #[test]
    fn test_frame_error_limit_resets_link() {
        let mut engine = engine(EngineConfig {
            reconnect_after_frame_errors: Some(2),
            ..EngineConfig::default()
        });
        let now = Instant::now();
        let actions = engine.handle_bytes(b"JUNK\nZONE 1 0\nJUNK\n", now);
        assert!(!actions.iter().any(|a| matches!(a, Action::ResetLink(_))));
        let actions = engine.handle_bytes(b"JUNK\n", now);
        assert!(actions.iter().any(|a| matches!(a, Action::ResetLink(_))));
    }

    #[test]
    fn test_sequence_wraps() {
        let mut engine = engine(EngineConfig {
            max_sequence: 2,
            ..EngineConfig::default()
        });
        let now = Instant::now();
        let mut sent = Vec::new();
        for _ in 0..3 {
            engine.accept(request("alarm/ping", "")).unwrap();
            sent.extend(writes(&engine.poll_transmit(now)));
            let id = engine.pending().unwrap().id;
            engine.handle_bytes(format!("PONG {id}\n").as_bytes(), now);
        }
        assert_eq!(sent, vec!["PING 1\n", "PING 2\n", "PING 1\n"]);
    }

    #[tokio::test]
    async fn test_handle_notifies_on_accept() {
        let handle = EngineHandle::new(engine(EngineConfig::default()));
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.notified().await });
        handle.accept(request("alarm/arm", "AWAY")).unwrap();
        task.await.unwrap();
        assert_eq!(handle.with(|e| e.queued()), 1);
        assert_eq!(handle.state(), EngineState::Idle);
    }
}
