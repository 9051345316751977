// MIT License - Copyright (c) 2026 Peter Wright
// Error taxonomy for the bridge

/// Why a received frame could not be turned into a protocol message.
///
/// Frame errors never end a session: the decoder drops the offending frame
/// and carries on from the next terminator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("checksum mismatch (computed {computed}, received {received})")]
    Checksum { computed: String, received: String },

    #[error("frame carries no checksum")]
    MissingChecksum,

    #[error("frame is not valid UTF-8 text")]
    Encoding,

    #[error("frame matches no known message: {body:?}")]
    Unrecognized { body: String },

    #[error("invalid parameter `{param}` in {kind}: {reason}")]
    InvalidParameter {
        kind: String,
        param: String,
        reason: String,
    },

    #[error("no terminator within {limit} bytes")]
    Oversized { limit: usize },
}

/// All errors that can occur in the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Invalid payload for {kind}: {reason}")]
    Payload { kind: String, reason: String },

    #[error("Rule {rule} cannot be resolved: {reason}")]
    Resolution { rule: String, reason: String },

    #[error("Request queue full (capacity {capacity})")]
    Backpressure { capacity: usize },

    #[error("Link error: {0}")]
    Link(String),

    #[error("Link is down, request refused")]
    LinkDown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

impl BridgeError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        BridgeError::Config(msg.into())
    }

    pub(crate) fn payload(kind: &str, reason: impl Into<String>) -> Self {
        BridgeError::Payload {
            kind: kind.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn resolution(rule: &str, reason: impl Into<String>) -> Self {
        BridgeError::Resolution {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error is transient and the link should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Io(_) | BridgeError::Link(_) | BridgeError::LinkDown
        )
    }

    /// The `op` name used when the error is reported on a diagnostics topic.
    pub fn op(&self) -> &'static str {
        match self {
            BridgeError::Io(_) | BridgeError::Link(_) => "LINK_ERROR",
            BridgeError::Frame(_) => "FRAME_ERROR",
            BridgeError::Payload { .. } => "PAYLOAD_ERROR",
            BridgeError::Resolution { .. } => "RESOLUTION_ERROR",
            BridgeError::Backpressure { .. } => "BACKPRESSURE",
            BridgeError::LinkDown => "LINK_DOWN",
            BridgeError::Config(_) => "CONFIG_ERROR",
            BridgeError::Mqtt(_) => "MQTT_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
