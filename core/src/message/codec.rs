// Network codec: network PDU framing between access payloads and proxy PDUs

use crate::config::{ConfigError, KeyMaterial};
use thiserror::Error;
use zeroize::Zeroizing;

/// IVI|NID, CTL|TTL, SEQ(3), SRC(2), DST(2)
pub const NETWORK_HEADER_LEN: usize = 9;

/// MIC length for access (CTL=0) PDUs
pub const ACCESS_MIC_LEN: usize = 4;

/// MIC length for control (CTL=1) PDUs, including proxy configuration
pub const CONTROL_MIC_LEN: usize = 8;

/// Errors produced while encoding or decoding network PDUs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Codec not configured: {0}")]
    Configuration(#[from] ConfigError),

    /// NID, AID or MIC did not match our keys
    #[error("Authentication failed: {0}")]
    Authentication(&'static str),

    #[error("Malformed PDU: {0}")]
    Malformed(String),
}

impl CodecError {
    /// True for errors that point at a key mismatch rather than garbage
    pub fn is_authentication(&self) -> bool {
        matches!(self, CodecError::Authentication(_))
    }
}

/// Network header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    pub ctl: bool,
    pub ttl: u8,
    pub seq: u32,
    pub src: u16,
    pub dst: u16,
}

/// A decoded network PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMessage {
    pub header: PduHeader,
    /// Access payload (CTL=0) or proxy configuration payload
    pub payload: Vec<u8>,
}

/// Network layer collaborator: owns key material and turns access payloads
/// into network PDUs and back.
pub trait MeshCodec: Send + Sync {
    /// Wrap an access payload (unsegmented, application key)
    fn encode_access(&self, header: &PduHeader, access: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Wrap a proxy configuration message (CTL=1, TTL=0, DST unassigned)
    fn encode_proxy_config(&self, seq: u32, src: u16, payload: &[u8])
        -> Result<Vec<u8>, CodecError>;

    /// Unwrap a network PDU carrying an access message
    fn decode_network(&self, pdu: &[u8]) -> Result<NetworkMessage, CodecError>;

    /// Unwrap a proxy configuration PDU
    fn decode_proxy_config(&self, pdu: &[u8]) -> Result<NetworkMessage, CodecError>;

    /// Make sure a minimal local record exists for `address` before traffic
    /// to or from it is routed.
    fn ensure_node_record(&self, _address: u16) {}
}

/// Reference codec with the mesh network header layout and keyed BLAKE3
/// integrity checks. Payloads are sent in the clear.
pub struct ClearCodec {
    nid: u8,
    aid: u8,
    ivi: u8,
    net_key: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for ClearCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClearCodec")
            .field("nid", &format_args!("0x{:02X}", self.nid))
            .field("aid", &format_args!("0x{:02X}", self.aid))
            .field("ivi", &self.ivi)
            .finish()
    }
}

impl ClearCodec {
    pub fn new(keys: &KeyMaterial) -> Result<Self, CodecError> {
        let net_key = Zeroizing::new(keys.net_key_bytes()?);
        let app_key = Zeroizing::new(keys.app_key_bytes()?);

        let nid = blake3::derive_key("meshlight nid", &net_key[..])[0] & 0x7F;
        let aid = blake3::derive_key("meshlight aid", &app_key[..])[0] & 0x3F;
        let mac_key = Zeroizing::new(blake3::derive_key("meshlight netmic", &net_key[..]));

        Ok(Self {
            nid,
            aid,
            ivi: (keys.iv_index & 1) as u8,
            net_key: mac_key,
        })
    }

    /// Network identifier derived from the network key
    pub fn nid(&self) -> u8 {
        self.nid
    }

    /// Application key identifier
    pub fn aid(&self) -> u8 {
        self.aid
    }

    fn mic(&self, data: &[u8], len: usize) -> Vec<u8> {
        blake3::keyed_hash(&self.net_key, data).as_bytes()[..len].to_vec()
    }

    fn frame(&self, header: &PduHeader, transport: &[u8]) -> Vec<u8> {
        let mic_len = if header.ctl {
            CONTROL_MIC_LEN
        } else {
            ACCESS_MIC_LEN
        };
        let mut out = Vec::with_capacity(NETWORK_HEADER_LEN + transport.len() + mic_len);
        out.push((self.ivi << 7) | self.nid);
        out.push(((header.ctl as u8) << 7) | (header.ttl & 0x7F));
        out.extend_from_slice(&(header.seq & 0x00FF_FFFF).to_be_bytes()[1..]);
        out.extend_from_slice(&header.src.to_be_bytes());
        out.extend_from_slice(&header.dst.to_be_bytes());
        out.extend_from_slice(transport);
        let mic = self.mic(&out, mic_len);
        out.extend_from_slice(&mic);
        out
    }

    fn unframe(&self, pdu: &[u8]) -> Result<NetworkMessage, CodecError> {
        if pdu.len() < NETWORK_HEADER_LEN + ACCESS_MIC_LEN {
            return Err(CodecError::Malformed(format!(
                "network PDU of {} bytes",
                pdu.len()
            )));
        }
        if pdu[0] & 0x7F != self.nid || pdu[0] >> 7 != self.ivi {
            return Err(CodecError::Authentication("NID/IVI mismatch"));
        }
        let ctl = pdu[1] & 0x80 != 0;
        let mic_len = if ctl { CONTROL_MIC_LEN } else { ACCESS_MIC_LEN };
        if pdu.len() < NETWORK_HEADER_LEN + mic_len {
            return Err(CodecError::Malformed("control PDU too short".into()));
        }
        let (body, mic) = pdu.split_at(pdu.len() - mic_len);
        if self.mic(body, mic_len) != mic {
            return Err(CodecError::Authentication("NetMIC mismatch"));
        }

        let header = PduHeader {
            ctl,
            ttl: pdu[1] & 0x7F,
            seq: u32::from_be_bytes([0, pdu[2], pdu[3], pdu[4]]),
            src: u16::from_be_bytes([pdu[5], pdu[6]]),
            dst: u16::from_be_bytes([pdu[7], pdu[8]]),
        };
        Ok(NetworkMessage {
            header,
            payload: body[NETWORK_HEADER_LEN..].to_vec(),
        })
    }
}

impl MeshCodec for ClearCodec {
    fn encode_access(&self, header: &PduHeader, access: &[u8]) -> Result<Vec<u8>, CodecError> {
        if header.ctl {
            return Err(CodecError::Malformed("access message with CTL set".into()));
        }
        if access.is_empty() {
            return Err(CodecError::Malformed("empty access payload".into()));
        }
        // Unsegmented lower transport: SEG=0, AKF=1, AID
        let mut transport = Vec::with_capacity(access.len() + 1);
        transport.push(0x40 | self.aid);
        transport.extend_from_slice(access);
        Ok(self.frame(header, &transport))
    }

    fn encode_proxy_config(
        &self,
        seq: u32,
        src: u16,
        payload: &[u8],
    ) -> Result<Vec<u8>, CodecError> {
        let header = PduHeader {
            ctl: true,
            ttl: 0,
            seq,
            src,
            dst: crate::address::UNASSIGNED_ADDRESS,
        };
        Ok(self.frame(&header, payload))
    }

    fn decode_network(&self, pdu: &[u8]) -> Result<NetworkMessage, CodecError> {
        let mut msg = self.unframe(pdu)?;
        if msg.header.ctl {
            return Err(CodecError::Malformed("transport control message".into()));
        }
        let (&lower, access) = msg
            .payload
            .split_first()
            .ok_or_else(|| CodecError::Malformed("missing lower transport header".into()))?;
        if lower & 0x80 != 0 {
            return Err(CodecError::Malformed(
                "segmented lower transport not supported".into(),
            ));
        }
        if lower & 0x40 == 0 || lower & 0x3F != self.aid {
            return Err(CodecError::Authentication("AID mismatch"));
        }
        let access = access.to_vec();
        msg.payload = access;
        Ok(msg)
    }

    fn decode_proxy_config(&self, pdu: &[u8]) -> Result<NetworkMessage, CodecError> {
        let msg = self.unframe(pdu)?;
        if !msg.header.ctl {
            return Err(CodecError::Malformed("proxy configuration without CTL".into()));
        }
        Ok(msg)
    }
}
