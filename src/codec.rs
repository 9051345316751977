// MIT License - Copyright (c) 2026 Peter Wright
// Frame codec: terminator framing, optional checksum, catalog lookup

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::config::{ChecksumKind, FramingConfig};
use crate::constants::CRC_TABLE;
use crate::error::{BridgeError, FrameError, Result};
use crate::protocol::{Catalog, ProtocolMessage};

impl ChecksumKind {
    /// Checksum of `body` as upper-case hex, or `None` when checksums are off.
    pub fn compute(&self, body: &[u8]) -> Option<String> {
        match self {
            ChecksumKind::None => None,
            ChecksumKind::Xor8 => Some(format!("{:02X}", body.iter().fold(0u8, |acc, b| acc ^ b))),
            ChecksumKind::Crc16 => Some(format!("{:04X}", crc16(body))),
        }
    }
}

/// CRC-16 over the reflected 0x8005 polynomial, initial value 0xFFFF (CRC-16/MODBUS).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc = (crc >> 8) ^ CRC_TABLE[((crc ^ byte as u16) & 0xFF) as usize];
    }
    crc
}

/// Encoder/decoder for one configured wire protocol. Immutable and shared.
#[derive(Debug)]
pub struct Codec {
    catalog: Arc<Catalog>,
    terminator: Vec<u8>,
    checksum: ChecksumKind,
    separator: char,
    max_frame_len: usize,
}

impl Codec {
    pub fn new(catalog: Arc<Catalog>, framing: &FramingConfig) -> Self {
        Self {
            catalog,
            terminator: framing.terminator.as_bytes().to_vec(),
            checksum: framing.checksum,
            separator: framing.checksum_separator,
            max_frame_len: framing.max_frame_len,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Build the byte-exact frame for a command.
    pub fn encode(&self, msg: &ProtocolMessage) -> Result<Bytes> {
        let spec = self
            .catalog
            .get(&msg.kind)
            .ok_or_else(|| BridgeError::payload(&msg.kind, "unknown message kind"))?;
        if spec.class != msg.class {
            return Err(BridgeError::payload(
                &msg.kind,
                format!("is a {}, not a {}", spec.class, msg.class),
            ));
        }
        let body = spec.render(msg)?;
        // Decoding takes the first catalog entry that matches, which may not be this one.
        match self.catalog.parse_body(&body) {
            Ok(decoded) if decoded.kind == msg.kind => {}
            Ok(decoded) => {
                return Err(BridgeError::payload(
                    &msg.kind,
                    format!("body {body:?} would decode as {}", decoded.kind),
                ));
            }
            Err(e) => {
                return Err(BridgeError::payload(
                    &msg.kind,
                    format!("body {body:?} would not decode: {e}"),
                ));
            }
        }
        let terminator = String::from_utf8_lossy(&self.terminator);
        if body.contains(terminator.as_ref()) || body.contains(['\r', '\n']) {
            return Err(BridgeError::payload(&msg.kind, "body contains a frame terminator"));
        }
        if self.checksum != ChecksumKind::None && body.contains(self.separator) {
            return Err(BridgeError::payload(
                &msg.kind,
                format!("body contains the checksum separator '{}'", self.separator),
            ));
        }

        let mut frame = BytesMut::with_capacity(body.len() + 8);
        frame.extend_from_slice(body.as_bytes());
        if let Some(sum) = self.checksum.compute(body.as_bytes()) {
            let mut sep = [0u8; 4];
            frame.extend_from_slice(self.separator.encode_utf8(&mut sep).as_bytes());
            frame.extend_from_slice(sum.as_bytes());
        }
        frame.extend_from_slice(&self.terminator);
        Ok(frame.freeze())
    }

    /// Decode one frame with the terminator already removed.
    pub fn decode_frame(&self, frame: &[u8]) -> std::result::Result<ProtocolMessage, FrameError> {
        let frame = frame.strip_suffix(b"\r").unwrap_or(frame);
        let text = std::str::from_utf8(frame).map_err(|_| FrameError::Encoding)?;

        let body = match self.checksum {
            ChecksumKind::None => text,
            kind => {
                let (body, received) = text
                    .rsplit_once(self.separator)
                    .ok_or(FrameError::MissingChecksum)?;
                let computed = kind.compute(body.as_bytes()).unwrap_or_default();
                if !computed.eq_ignore_ascii_case(received) {
                    return Err(FrameError::Checksum {
                        computed,
                        received: received.to_string(),
                    });
                }
                body
            }
        };

        let mut msg = self.catalog.parse_body(body)?;
        msg.raw = Bytes::copy_from_slice(frame);
        Ok(msg)
    }

    fn terminator_len(&self) -> usize {
        self.terminator.len()
    }

    fn find_terminator(&self, buf: &[u8]) -> Option<usize> {
        buf.windows(self.terminator.len())
            .position(|w| w == self.terminator.as_slice())
    }
}

/// Output of the stream decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(ProtocolMessage),
    Malformed { error: FrameError, raw: Bytes },
}

/// Resumable stream decoder. Keeps unterminated bytes between reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// Skipping an oversized frame until the next terminator.
    discarding: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns every complete frame it finishes.
    pub fn decode(&mut self, codec: &Codec, chunk: &[u8]) -> Vec<Decoded> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        let term_len = codec.terminator_len();

        loop {
            match codec.find_terminator(&self.buf) {
                Some(pos) => {
                    let frame = self.buf.split_to(pos).freeze();
                    self.buf.advance(term_len);
                    if self.discarding {
                        debug!("Resynchronised after oversized frame");
                        self.discarding = false;
                        continue;
                    }
                    if frame.len() > codec.max_frame_len() {
                        warn!("Dropping {} byte frame (limit {})", frame.len(), codec.max_frame_len());
                        out.push(Decoded::Malformed {
                            error: FrameError::Oversized {
                                limit: codec.max_frame_len(),
                            },
                            raw: frame,
                        });
                        continue;
                    }
                    let body = frame.strip_suffix(b"\r").unwrap_or(&frame);
                    if body.is_empty() {
                        continue;
                    }
                    match codec.decode_frame(&frame) {
                        Ok(msg) => out.push(Decoded::Message(msg)),
                        Err(error) => out.push(Decoded::Malformed { error, raw: frame }),
                    }
                }
                None => {
                    if self.buf.len() > codec.max_frame_len() {
                        // Keep a possible partial terminator at the tail.
                        let keep = term_len.saturating_sub(1).min(self.buf.len());
                        let dropped = self.buf.split_to(self.buf.len() - keep).freeze();
                        if !self.discarding {
                            warn!(
                                "No terminator within {} bytes, discarding",
                                codec.max_frame_len()
                            );
                            out.push(Decoded::Malformed {
                                error: FrameError::Oversized {
                                    limit: codec.max_frame_len(),
                                },
                                raw: dropped,
                            });
                            self.discarding = true;
                        }
                    }
                    break;
                }
            }
        }
        out
    }

    /// Bytes received after the last terminator.
    pub fn leftover(&self) -> &[u8] {
        &self.buf
    }

    /// Drop buffered bytes, e.g. after the link was reset.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }
}
