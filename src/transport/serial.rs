// MIT License - Copyright (c) 2026 Peter Wright
// Serial transport for panels wired to a local UART or USB adapter
//
// Uses blocking threads:
// - Reader thread: reads from the port with a short timeout, sends to channel
// - Writer thread: receives from channel, writes to the port
//
// The transport stops when the channels are dropped, when a write fails, or
// when the port disappears (detected via consecutive empty reads).

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use serialport::{DataBits, SerialPort, StopBits};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::TransportChannels;
use crate::config::{FlowControl, Parity, SerialConfig};
use crate::constants::{
    CHANNEL_CAPACITY, READ_BUFFER_SIZE, SERIAL_DISCONNECT_THRESHOLD, SERIAL_READ_TIMEOUT,
};
use crate::error::{BridgeError, Result};

fn data_bits(bits: u8) -> Result<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(BridgeError::config(format!("unsupported data bits: {other}"))),
    }
}

fn stop_bits(bits: u8) -> Result<StopBits> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(BridgeError::config(format!("unsupported stop bits: {other}"))),
    }
}

fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn flow_control(flow: FlowControl) -> serialport::FlowControl {
    match flow {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::Hardware => serialport::FlowControl::Hardware,
        FlowControl::Software => serialport::FlowControl::Software,
    }
}

fn open_port(config: &SerialConfig) -> Result<Box<dyn SerialPort>> {
    serialport::new(&config.port, config.baud_rate)
        .data_bits(data_bits(config.data_bits)?)
        .stop_bits(stop_bits(config.stop_bits)?)
        .parity(parity(config.parity))
        .flow_control(flow_control(config.flow_control))
        .timeout(SERIAL_READ_TIMEOUT)
        .open()
        .map_err(|e| BridgeError::Link(format!("cannot open {}: {e}", config.port)))
}

/// Open the port and start the reader and writer threads.
pub fn open(config: &SerialConfig) -> Result<TransportChannels> {
    info!(
        "Opening serial port {} at {} baud",
        config.port, config.baud_rate
    );
    let port_read = open_port(config)?;
    let port_write = port_read
        .try_clone()
        .map_err(|e| BridgeError::Link(format!("cannot clone {}: {e}", config.port)))?;

    let (in_tx, in_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let closed = Arc::new(AtomicBool::new(false));

    let closed_reader = closed.clone();
    std::thread::Builder::new()
        .name("serial-reader".into())
        .spawn(move || {
            let mut port = port_read;
            let mut buf = [0u8; READ_BUFFER_SIZE];
            let mut empty_reads = 0u32;

            while !closed_reader.load(Ordering::Relaxed) {
                match port.read(&mut buf) {
                    Ok(n) if n > 0 => {
                        empty_reads = 0;
                        if in_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {
                        empty_reads += 1;
                        if empty_reads > SERIAL_DISCONNECT_THRESHOLD {
                            warn!("Serial port returned no data {empty_reads} times, closing");
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        empty_reads = 0;
                    }
                    Err(e) => {
                        warn!("Serial read failed: {e}");
                        break;
                    }
                }
            }
            debug!("Serial reader stopped");
        })?;

    let closed_writer = closed.clone();
    std::thread::Builder::new()
        .name("serial-writer".into())
        .spawn(move || {
            let mut port = port_write;
            while let Some(data) = out_rx.blocking_recv() {
                if closed_writer.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = port.write_all(&data).and_then(|_| port.flush()) {
                    warn!("Serial write failed: {e}");
                    break;
                }
            }
            debug!("Serial writer stopped");
        })?;

    Ok(TransportChannels::new(in_rx, out_tx, closed, Vec::new()))
}
