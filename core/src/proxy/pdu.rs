//! Proxy PDU segmentation and reassembly
//!
//! Every bearer frame starts with a one-byte header packing a 2-bit SAR
//! marker and a 6-bit message type: `[SAR:2 | TYPE:6] payload...`. A PDU
//! that fits in one frame is sent "complete"; anything larger is split into
//! a "first" frame, zero or more "continuation" frames and a "last" frame.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest reassembled PDU accepted from a bearer
pub const MAX_REASSEMBLED_SIZE: usize = 4096;

/// Smallest transfer size that still leaves room for one payload byte
pub const MIN_SEGMENTED_TRANSFER_SIZE: usize = 5;

/// Segmentation marker (upper two header bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SarMarker {
    Complete = 0b00,
    First = 0b01,
    Continuation = 0b10,
    Last = 0b11,
}

impl SarMarker {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => SarMarker::Complete,
            0b01 => SarMarker::First,
            0b10 => SarMarker::Continuation,
            _ => SarMarker::Last,
        }
    }
}

/// Proxy PDU message type (lower six header bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyPduType {
    Network,
    MeshBeacon,
    ProxyConfiguration,
    Provisioning,
    Reserved(u8),
}

impl ProxyPduType {
    pub fn code(&self) -> u8 {
        match self {
            ProxyPduType::Network => 0x00,
            ProxyPduType::MeshBeacon => 0x01,
            ProxyPduType::ProxyConfiguration => 0x02,
            ProxyPduType::Provisioning => 0x03,
            ProxyPduType::Reserved(code) => code & 0x3F,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code & 0x3F {
            0x00 => ProxyPduType::Network,
            0x01 => ProxyPduType::MeshBeacon,
            0x02 => ProxyPduType::ProxyConfiguration,
            0x03 => ProxyPduType::Provisioning,
            other => ProxyPduType::Reserved(other),
        }
    }
}

/// Errors for segmentation and reassembly
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SarError {
    #[error("Transfer size {0} too small to segment")]
    TransferSizeTooSmall(usize),
    #[error("Empty bearer frame")]
    EmptyFrame,
    #[error("{0:?} segment without a preceding first segment")]
    UnexpectedSegment(SarMarker),
    #[error("Segment type {found:?} does not match in-flight type {expected:?}")]
    TypeMismatch {
        expected: ProxyPduType,
        found: ProxyPduType,
    },
    #[error("Reassembled PDU exceeds 4096 bytes")]
    Overflow,
}

/// One-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyFrameHeader {
    pub sar: SarMarker,
    pub pdu_type: ProxyPduType,
}

impl ProxyFrameHeader {
    pub fn new(sar: SarMarker, pdu_type: ProxyPduType) -> Self {
        Self { sar, pdu_type }
    }

    pub fn to_byte(&self) -> u8 {
        ((self.sar as u8) << 6) | self.pdu_type.code()
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            sar: SarMarker::from_bits(byte >> 6),
            pdu_type: ProxyPduType::from_code(byte),
        }
    }
}

/// A complete proxy PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPdu {
    pub pdu_type: ProxyPduType,
    pub payload: Vec<u8>,
}

impl ProxyPdu {
    pub fn new(pdu_type: ProxyPduType, payload: Vec<u8>) -> Self {
        Self { pdu_type, payload }
    }
}

fn frame(sar: SarMarker, pdu_type: ProxyPduType, chunk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunk.len() + 1);
    out.push(ProxyFrameHeader::new(sar, pdu_type).to_byte());
    out.extend_from_slice(chunk);
    out
}

/// Split a PDU into bearer frames for the given maximum transfer size.
///
/// Payloads of at most `max_transfer_size - 3` bytes travel as one complete
/// frame; larger ones are cut into `max_transfer_size - 4` byte segments.
pub fn segment(
    pdu_type: ProxyPduType,
    payload: &[u8],
    max_transfer_size: usize,
) -> Result<Vec<Vec<u8>>, SarError> {
    if max_transfer_size < MIN_SEGMENTED_TRANSFER_SIZE {
        return Err(SarError::TransferSizeTooSmall(max_transfer_size));
    }

    if payload.len() <= max_transfer_size - 3 {
        return Ok(vec![frame(SarMarker::Complete, pdu_type, payload)]);
    }

    let chunk_size = max_transfer_size - 4;
    let chunks: Vec<&[u8]> = payload.chunks(chunk_size).collect();
    let last_index = chunks.len() - 1;

    let frames = chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            let sar = match index {
                0 => SarMarker::First,
                i if i == last_index => SarMarker::Last,
                _ => SarMarker::Continuation,
            };
            frame(sar, pdu_type, chunk)
        })
        .collect();

    Ok(frames)
}

/// Inbound reassembly state for one session
#[derive(Debug, Default)]
pub struct Reassembler {
    in_flight: Option<(ProxyPduType, Vec<u8>)>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a segmented PDU is partially received
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Drop any partial PDU
    pub fn reset(&mut self) {
        self.in_flight = None;
    }

    /// Feed one bearer frame. Returns a PDU when one completes.
    ///
    /// On error the partial buffer is discarded and the reassembler is ready
    /// for the next first/complete frame.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<ProxyPdu>, SarError> {
        let (&header_byte, body) = frame.split_first().ok_or(SarError::EmptyFrame)?;
        let header = ProxyFrameHeader::from_byte(header_byte);

        match header.sar {
            SarMarker::Complete => {
                self.in_flight = None;
                Ok(Some(ProxyPdu::new(header.pdu_type, body.to_vec())))
            }
            SarMarker::First => {
                if body.len() > MAX_REASSEMBLED_SIZE {
                    self.in_flight = None;
                    return Err(SarError::Overflow);
                }
                self.in_flight = Some((header.pdu_type, body.to_vec()));
                Ok(None)
            }
            SarMarker::Continuation | SarMarker::Last => {
                let (pdu_type, mut buffer) = self
                    .in_flight
                    .take()
                    .ok_or(SarError::UnexpectedSegment(header.sar))?;
                if pdu_type != header.pdu_type {
                    return Err(SarError::TypeMismatch {
                        expected: pdu_type,
                        found: header.pdu_type,
                    });
                }
                if buffer.len() + body.len() > MAX_REASSEMBLED_SIZE {
                    return Err(SarError::Overflow);
                }
                buffer.extend_from_slice(body);
                if header.sar == SarMarker::Last {
                    Ok(Some(ProxyPdu::new(pdu_type, buffer)))
                } else {
                    self.in_flight = Some((pdu_type, buffer));
                    Ok(None)
                }
            }
        }
    }
}
