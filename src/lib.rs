// MIT License - Copyright (c) 2026 Peter Wright
// Serial alarm-panel protocol to MQTT bridge
//
//! # ja2mqtt
//!
//! Bridges a line-oriented alarm-panel protocol (JA-121T style, over a
//! serial port or a TCP-serial converter) to an MQTT broker.
//!
//! The wire protocol is not hardcoded: the message catalog, framing and
//! checksum are declared in configuration, as are the mapping rules between
//! panel messages and MQTT topics.
//!
//! ## Pipeline
//!
//! ```text
//! transport bytes -> Codec -> ProtocolMessage -> Engine -> MappingTable -> MQTT
//! MQTT -> MappingTable -> Engine queue -> Codec -> transport bytes
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use ja2mqtt::{Bridge, BridgeConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig::load("ja2mqtt.toml".as_ref(), None)?;
//!     let bridge = Bridge::from_config(&config)?;
//!
//!     let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         let _ = shutdown_tx.send(true);
//!     });
//!     bridge.run(shutdown_rx).await?;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod constants;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod mapping;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use bridge::{Bridge, LinkSupervisor};
pub use codec::{Codec, Decoded, FrameDecoder};
pub use config::BridgeConfig;
pub use engine::{Action, Engine, EngineHandle, EngineState, LinkState};
pub use error::{BridgeError, FrameError, Result};
pub use gateway::{MqttGateway, Publisher};
pub use mapping::{MappingTable, OutboundRequest, Publication};
pub use protocol::{Catalog, MessageClass, ProtocolMessage, Value};
pub use transport::{Connector, TransportChannels};
