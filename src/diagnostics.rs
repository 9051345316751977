// MIT License - Copyright (c) 2026 Peter Wright
// JSON payloads for bridge status and diagnostic topics

use chrono::Utc;
use serde::Serialize;
use tracing::error;

use crate::config::DiagnosticsConfig;
use crate::engine::LinkState;
use crate::error::{BridgeError, FrameError};
use crate::mapping::{OutboundRequest, Publication};
use crate::protocol::ProtocolMessage;

/// Link state reported by the broker's last will.
pub const OFFLINE: &str = "offline";

// Published messages share the {now, op, ...} flat structure

#[derive(Serialize)]
struct MqttLinkState<'a> {
    now: u64,
    op: &'static str,
    state: &'a str,
}

#[derive(Serialize)]
struct MqttFrameError<'a> {
    now: u64,
    op: &'static str,
    error: String,
    raw: &'a str,
}

#[derive(Serialize)]
struct MqttRequestTimeout<'a> {
    now: u64,
    op: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u32>,
    kind: &'a str,
    topic: &'a str,
    reason: &'static str,
}

#[derive(Serialize)]
struct MqttError<'a> {
    now: u64,
    op: &'static str,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    topic: Option<&'a str>,
}

#[derive(Serialize)]
struct MqttResponse<'a> {
    now: u64,
    op: &'static str,
    id: u32,
    request: &'a str,
    kind: &'a str,
    params: serde_json::Map<String, serde_json::Value>,
}

/// Why a pending or queued request was given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    /// No response before the deadline.
    Deadline,
    /// The link went down first.
    LinkDown,
}

impl TimeoutReason {
    fn as_str(self) -> &'static str {
        match self {
            TimeoutReason::Deadline => "deadline",
            TimeoutReason::LinkDown => "link_down",
        }
    }
}

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

fn to_json(payload: &impl Serialize) -> String {
    match serde_json::to_string(payload) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize MQTT payload: {e}");
            String::new()
        }
    }
}

/// Builds diagnostic publications for the configured topics.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    topics: DiagnosticsConfig,
}

impl Diagnostics {
    pub fn new(topics: DiagnosticsConfig) -> Self {
        Self { topics }
    }

    pub fn status_topic(&self) -> &str {
        &self.topics.status_topic
    }

    /// Retained link state.
    pub fn link_state(&self, state: LinkState) -> Publication {
        self.status(state.as_str())
    }

    /// Retained `offline` status, used as the MQTT last will.
    pub fn offline(&self) -> Publication {
        self.status(OFFLINE)
    }

    fn status(&self, state: &str) -> Publication {
        let msg = MqttLinkState {
            now: now_epoch_ms(),
            op: "LINK_STATE",
            state,
        };
        Publication {
            topic: self.topics.status_topic.clone(),
            payload: to_json(&msg),
            retain: true,
        }
    }

    pub fn frame_error(&self, error: &FrameError, raw: &[u8]) -> Publication {
        let raw = String::from_utf8_lossy(raw);
        let msg = MqttFrameError {
            now: now_epoch_ms(),
            op: "FRAME_ERROR",
            error: error.to_string(),
            raw: &raw,
        };
        Publication {
            topic: self.topics.frame_error_topic.clone(),
            payload: to_json(&msg),
            retain: false,
        }
    }

    /// One per abandoned request. `id` is absent for requests never sent.
    pub fn request_timeout(
        &self,
        id: Option<u32>,
        request: &OutboundRequest,
        reason: TimeoutReason,
    ) -> Publication {
        let msg = MqttRequestTimeout {
            now: now_epoch_ms(),
            op: "REQUEST_TIMEOUT",
            id,
            kind: &request.message.kind,
            topic: &request.topic,
            reason: reason.as_str(),
        };
        Publication {
            topic: self.topics.timeout_topic.clone(),
            payload: to_json(&msg),
            retain: false,
        }
    }

    /// A per-message error, with the MQTT topic that caused it if any.
    pub fn error(&self, err: &BridgeError, topic: Option<&str>) -> Publication {
        let msg = MqttError {
            now: now_epoch_ms(),
            op: err.op(),
            error: err.to_string(),
            topic,
        };
        Publication {
            topic: self.topics.error_topic.clone(),
            payload: to_json(&msg),
            retain: false,
        }
    }

    /// Summary of a completed request, for the rule's reply topic.
    pub fn response(
        &self,
        reply_to: &str,
        id: u32,
        request: &OutboundRequest,
        response: &ProtocolMessage,
    ) -> Publication {
        let msg = MqttResponse {
            now: now_epoch_ms(),
            op: "RESPONSE",
            id,
            request: &request.message.kind,
            kind: &response.kind,
            params: response
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        };
        Publication {
            topic: reply_to.to_string(),
            payload: to_json(&msg),
            retain: false,
        }
    }
}
