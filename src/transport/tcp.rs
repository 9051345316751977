// MIT License - Copyright (c) 2026 Peter Wright
// TCP transport for serial-over-IP converters (ser2net and friends)

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::TransportChannels;
use crate::constants::{CHANNEL_CAPACITY, READ_BUFFER_SIZE};
use crate::error::{BridgeError, Result};

/// Connect to `host:port` and start the reader and writer tasks.
pub async fn connect(host: &str, port: u16) -> Result<TransportChannels> {
    info!("Connecting to panel at {host}:{port}");

    let stream = TcpStream::connect((host, port)).await.map_err(|e| {
        error!("TCP connect failed: {e}");
        BridgeError::Io(e)
    })?;
    stream.set_nodelay(true)?;
    debug!("TCP socket connected");

    let (reader, writer) = stream.into_split();
    let (in_tx, in_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

    let reader_handle = spawn_reader_task(reader, in_tx);
    let writer_handle = spawn_writer_task(writer, out_rx);

    Ok(TransportChannels::new(
        in_rx,
        out_tx,
        Arc::new(AtomicBool::new(false)),
        vec![reader_handle, writer_handle],
    ))
}

/// Forward everything read from the socket. Ends on EOF or error, which
/// closes the read channel.
fn spawn_reader_task(
    mut reader: OwnedReadHalf,
    tx: mpsc::Sender<Bytes>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("Reader: connection closed");
                    break;
                }
                Ok(n) => {
                    if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        // Receiver dropped
                        break;
                    }
                }
                Err(e) => {
                    warn!("Reader: {e}");
                    break;
                }
            }
        }
    })
}

fn spawn_writer_task(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = writer.write_all(&data).await {
                warn!("Writer: {e}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
}
