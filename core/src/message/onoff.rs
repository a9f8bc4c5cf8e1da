//! Access layer messages: Generic OnOff and proxy configuration
//!
//! Generic OnOff uses two-octet SIG opcodes. Proxy configuration messages
//! carry a one-octet opcode followed by big-endian addresses.

use super::codec::CodecError;
use std::sync::atomic::{AtomicU8, Ordering};

pub const OPCODE_ONOFF_GET: u16 = 0x8201;
pub const OPCODE_ONOFF_SET: u16 = 0x8202;
pub const OPCODE_ONOFF_SET_UNACK: u16 = 0x8203;
pub const OPCODE_ONOFF_STATUS: u16 = 0x8204;

/// Parsed access opcode and the length it occupied
fn read_opcode(access: &[u8]) -> Result<(u32, usize), CodecError> {
    let first = *access
        .first()
        .ok_or_else(|| CodecError::Malformed("empty access payload".into()))?;
    match first >> 6 {
        0b00 | 0b01 => {
            if first == 0x7F {
                return Err(CodecError::Malformed("reserved opcode 0x7F".into()));
            }
            Ok((first as u32, 1))
        }
        0b10 => {
            if access.len() < 2 {
                return Err(CodecError::Malformed("truncated 2-octet opcode".into()));
            }
            Ok((((first as u32) << 8) | access[1] as u32, 2))
        }
        _ => {
            if access.len() < 3 {
                return Err(CodecError::Malformed("truncated vendor opcode".into()));
            }
            Ok((
                ((first as u32) << 16) | ((access[1] as u32) << 8) | access[2] as u32,
                3,
            ))
        }
    }
}

/// Generic OnOff client/server messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnOffMessage {
    Get,
    Set { on: bool, tid: u8, acknowledged: bool },
    Status {
        present: bool,
        target: Option<bool>,
        /// Raw Generic Default Transition Time encoding
        remaining: Option<u8>,
    },
}

impl OnOffMessage {
    pub fn opcode(&self) -> u16 {
        match self {
            OnOffMessage::Get => OPCODE_ONOFF_GET,
            OnOffMessage::Set {
                acknowledged: true, ..
            } => OPCODE_ONOFF_SET,
            OnOffMessage::Set { .. } => OPCODE_ONOFF_SET_UNACK,
            OnOffMessage::Status { .. } => OPCODE_ONOFF_STATUS,
        }
    }

    /// Acknowledged messages expect a Status in return
    pub fn expects_status(&self) -> bool {
        matches!(
            self,
            OnOffMessage::Get
                | OnOffMessage::Set {
                    acknowledged: true,
                    ..
                }
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.opcode().to_be_bytes().to_vec();
        match *self {
            OnOffMessage::Get => {}
            OnOffMessage::Set { on, tid, .. } => {
                out.push(on as u8);
                out.push(tid);
            }
            OnOffMessage::Status {
                present,
                target,
                remaining,
            } => {
                out.push(present as u8);
                if let Some(target) = target {
                    out.push(target as u8);
                    out.push(remaining.unwrap_or(0));
                }
            }
        }
        out
    }

    /// Decode an access payload. `Ok(None)` means a well formed message of
    /// some other model.
    pub fn decode(access: &[u8]) -> Result<Option<Self>, CodecError> {
        let (opcode, len) = read_opcode(access)?;
        let params = &access[len..];
        let bool_param = |b: u8| -> Result<bool, CodecError> {
            match b {
                0 => Ok(false),
                1 => Ok(true),
                other => Err(CodecError::Malformed(format!(
                    "invalid onoff value 0x{:02X}",
                    other
                ))),
            }
        };

        let msg = match opcode {
            x if x == OPCODE_ONOFF_GET as u32 => OnOffMessage::Get,
            x if x == OPCODE_ONOFF_SET as u32 || x == OPCODE_ONOFF_SET_UNACK as u32 => {
                if params.len() < 2 {
                    return Err(CodecError::Malformed("short OnOff Set".into()));
                }
                OnOffMessage::Set {
                    on: bool_param(params[0])?,
                    tid: params[1],
                    acknowledged: x == OPCODE_ONOFF_SET as u32,
                }
            }
            x if x == OPCODE_ONOFF_STATUS as u32 => match params.len() {
                1 => OnOffMessage::Status {
                    present: bool_param(params[0])?,
                    target: None,
                    remaining: None,
                },
                3 => OnOffMessage::Status {
                    present: bool_param(params[0])?,
                    target: Some(bool_param(params[1])?),
                    remaining: Some(params[2]),
                },
                n => {
                    return Err(CodecError::Malformed(format!(
                        "OnOff Status with {} parameter bytes",
                        n
                    )))
                }
            },
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

/// Transaction identifier source; one increment per logical Set
#[derive(Debug, Default)]
pub struct TidCounter(AtomicU8);

impl TidCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next TID, wrapping at 256
    pub fn next(&self) -> u8 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

// ============================================================================
// PROXY CONFIGURATION
// ============================================================================

pub const OPCODE_SET_FILTER_TYPE: u8 = 0x00;
pub const OPCODE_ADD_ADDRESSES: u8 = 0x01;
pub const OPCODE_REMOVE_ADDRESSES: u8 = 0x02;
pub const OPCODE_FILTER_STATUS: u8 = 0x03;

/// Proxy filter kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    AcceptList,
    RejectList,
}

impl FilterType {
    pub fn code(&self) -> u8 {
        match self {
            FilterType::AcceptList => 0x00,
            FilterType::RejectList => 0x01,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            0x00 => Ok(FilterType::AcceptList),
            0x01 => Ok(FilterType::RejectList),
            other => Err(CodecError::Malformed(format!(
                "unknown filter type 0x{:02X}",
                other
            ))),
        }
    }
}

/// Messages exchanged with the proxy server itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyConfigMessage {
    SetFilterType(FilterType),
    AddAddresses(Vec<u16>),
    RemoveAddresses(Vec<u16>),
    FilterStatus { filter_type: FilterType, list_size: u16 },
}

impl ProxyConfigMessage {
    pub fn encode(&self) -> Vec<u8> {
        let push_addresses = |out: &mut Vec<u8>, addresses: &[u16]| {
            for address in addresses {
                out.extend_from_slice(&address.to_be_bytes());
            }
        };
        match self {
            ProxyConfigMessage::SetFilterType(t) => vec![OPCODE_SET_FILTER_TYPE, t.code()],
            ProxyConfigMessage::AddAddresses(addresses) => {
                let mut out = vec![OPCODE_ADD_ADDRESSES];
                push_addresses(&mut out, addresses);
                out
            }
            ProxyConfigMessage::RemoveAddresses(addresses) => {
                let mut out = vec![OPCODE_REMOVE_ADDRESSES];
                push_addresses(&mut out, addresses);
                out
            }
            ProxyConfigMessage::FilterStatus {
                filter_type,
                list_size,
            } => {
                let mut out = vec![OPCODE_FILTER_STATUS, filter_type.code()];
                out.extend_from_slice(&list_size.to_be_bytes());
                out
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let (opcode, params) = payload
            .split_first()
            .ok_or_else(|| CodecError::Malformed("empty proxy configuration".into()))?;
        let addresses = |params: &[u8]| -> Result<Vec<u16>, CodecError> {
            if params.len() % 2 != 0 {
                return Err(CodecError::Malformed("odd address list length".into()));
            }
            Ok(params
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect())
        };
        match *opcode {
            OPCODE_SET_FILTER_TYPE => match params {
                [t] => Ok(ProxyConfigMessage::SetFilterType(FilterType::from_code(*t)?)),
                _ => Err(CodecError::Malformed("bad Set Filter Type length".into())),
            },
            OPCODE_ADD_ADDRESSES => Ok(ProxyConfigMessage::AddAddresses(addresses(params)?)),
            OPCODE_REMOVE_ADDRESSES => {
                Ok(ProxyConfigMessage::RemoveAddresses(addresses(params)?))
            }
            OPCODE_FILTER_STATUS => match params {
                [t, hi, lo] => Ok(ProxyConfigMessage::FilterStatus {
                    filter_type: FilterType::from_code(*t)?,
                    list_size: u16::from_be_bytes([*hi, *lo]),
                }),
                _ => Err(CodecError::Malformed("bad Filter Status length".into())),
            },
            other => Err(CodecError::Malformed(format!(
                "unknown proxy configuration opcode 0x{:02X}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_encoding() {
        let ack = OnOffMessage::Set {
            on: true,
            tid: 7,
            acknowledged: true,
        };
        assert_eq!(ack.encode(), vec![0x82, 0x02, 0x01, 0x07]);
        assert!(ack.expects_status());

        let unack = OnOffMessage::Set {
            on: false,
            tid: 8,
            acknowledged: false,
        };
        assert_eq!(unack.encode(), vec![0x82, 0x03, 0x00, 0x08]);
        assert!(!unack.expects_status());
    }

    #[test]
    fn test_status_decoding() {
        let short = OnOffMessage::decode(&[0x82, 0x04, 0x01]).unwrap();
        assert_eq!(
            short,
            Some(OnOffMessage::Status {
                present: true,
                target: None,
                remaining: None
            })
        );

        let long = OnOffMessage::decode(&[0x82, 0x04, 0x00, 0x01, 0x05]).unwrap();
        assert_eq!(
            long,
            Some(OnOffMessage::Status {
                present: false,
                target: Some(true),
                remaining: Some(5)
            })
        );
    }

    #[test]
    fn test_other_models_are_not_errors() {
        // Light Lightness Status
        assert_eq!(OnOffMessage::decode(&[0x82, 0x4E, 0x00, 0x10]).unwrap(), None);
        // Vendor opcode
        assert_eq!(OnOffMessage::decode(&[0xC1, 0x11, 0x02]).unwrap(), None);
    }

    #[test]
    fn test_malformed_status() {
        assert!(OnOffMessage::decode(&[0x82, 0x04]).is_err());
        assert!(OnOffMessage::decode(&[0x82, 0x04, 0x02]).is_err());
        assert!(OnOffMessage::decode(&[0x82]).is_err());
        assert!(OnOffMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_tid_wraps() {
        let tids = TidCounter::new();
        for expected in 0..=255u8 {
            assert_eq!(tids.next(), expected);
        }
        assert_eq!(tids.next(), 0);
    }

    #[test]
    fn test_proxy_config_encoding() {
        assert_eq!(
            ProxyConfigMessage::SetFilterType(FilterType::AcceptList).encode(),
            vec![0x00, 0x00]
        );
        assert_eq!(
            ProxyConfigMessage::AddAddresses(vec![0x0001]).encode(),
            vec![0x01, 0x00, 0x01]
        );
        let status = ProxyConfigMessage::decode(&[0x03, 0x00, 0x00, 0x03]).unwrap();
        assert_eq!(
            status,
            ProxyConfigMessage::FilterStatus {
                filter_type: FilterType::AcceptList,
                list_size: 3
            }
        );
    }

    #[test]
    fn test_proxy_config_rejects_garbage() {
        assert!(ProxyConfigMessage::decode(&[]).is_err());
        assert!(ProxyConfigMessage::decode(&[0x01, 0xC0]).is_err());
        assert!(ProxyConfigMessage::decode(&[0x09]).is_err());
        assert!(ProxyConfigMessage::decode(&[0x00, 0x05]).is_err());
    }
}
