// MIT License - Copyright (c) 2026 Peter Wright
// Byte-stream transports to the panel
//
// A transport owns the connection and exposes it as a pair of byte channels.
// It knows nothing about framing or requests. When it fails it closes the
// channels, and dropping the channels closes it.

pub mod serial;
pub mod simulator;
pub mod tcp;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::TransportConfig;
use crate::error::Result;

/// Channels for bidirectional communication with a transport.
pub struct TransportChannels {
    /// Bytes read from the link. `None` once the transport has stopped.
    pub rx: mpsc::Receiver<Bytes>,
    /// Bytes to write to the link.
    pub tx: mpsc::Sender<Bytes>,
    _guard: CloseGuard,
}

/// Stops the transport's tasks and threads when the channels are dropped.
struct CloseGuard {
    closed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl TransportChannels {
    pub(crate) fn new(
        rx: mpsc::Receiver<Bytes>,
        tx: mpsc::Sender<Bytes>,
        closed: Arc<AtomicBool>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            rx,
            tx,
            _guard: CloseGuard { closed, tasks },
        }
    }

    /// Wrap an existing channel pair, e.g. an in-memory link in tests.
    pub fn from_parts(rx: mpsc::Receiver<Bytes>, tx: mpsc::Sender<Bytes>) -> Self {
        Self::new(rx, tx, Arc::new(AtomicBool::new(false)), Vec::new())
    }
}

/// Opens a fresh transport for each connection attempt.
pub trait Connector: Send + Sync {
    fn connect(&self) -> impl Future<Output = Result<TransportChannels>> + Send;

    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;
}

impl Connector for TransportConfig {
    async fn connect(&self) -> Result<TransportChannels> {
        match self {
            TransportConfig::Tcp { host, port } => tcp::connect(host, *port).await,
            TransportConfig::Serial(config) => serial::open(config),
            TransportConfig::Simulator(config) => Ok(simulator::spawn(config)),
        }
    }

    fn describe(&self) -> String {
        match self {
            TransportConfig::Tcp { host, port } => format!("tcp://{host}:{port}"),
            TransportConfig::Serial(config) => {
                format!("serial://{}@{}", config.port, config.baud_rate)
            }
            TransportConfig::Simulator(_) => "simulator".to_string(),
        }
    }
}
