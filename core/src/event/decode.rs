//! Cairo event decoding against ABI descriptors.
//!
//! Cairo-1 events split their members across the two log arrays: `kind: key`
//! members land in `keys[1..]` (after the selector), `kind: data` members in
//! `data`. Scalars take one felt; `u256` takes two (low then high).

use std::collections::HashSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use starknet_types_core::felt::Felt;
use thiserror::Error;
use tracing::debug;

use crate::helpers::padded_hex;
use crate::types::Log;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberKind {
    #[serde(rename = "key")]
    Key,
    #[serde(rename = "data")]
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    #[serde(rename = "felt")]
    Felt,
    #[serde(rename = "bool")]
    Bool,
    /// Unsigned integer of up to 128 bits, one felt on the wire.
    #[serde(rename = "uint")]
    Uint { bits: u16 },
    /// Two felts on the wire: low 128 bits then high 128 bits.
    #[serde(rename = "u256")]
    U256,
    #[serde(rename = "address")]
    Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMember {
    pub name: String,
    pub kind: MemberKind,
    #[serde(rename = "type")]
    pub ty: ParamType,
}

/// Descriptor for one event of a source ABI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAbi {
    pub name: String,
    pub selector: Felt,
    pub members: Vec<EventMember>,
}

impl EventAbi {
    /// Build a descriptor whose selector is derived from the event name.
    pub fn named(name: impl Into<String>, members: Vec<EventMember>) -> EventAbi {
        let name = name.into();
        let selector = crate::helpers::selector_from_name(&name);
        EventAbi { name, selector, members }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedValue {
    Felt(Felt),
    Bool(bool),
    Uint(u128),
    U256 { low: Felt, high: Felt },
    Address(Felt),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub name: String,
    pub params: Vec<(String, DecodedValue)>,
}

impl DecodedEvent {
    pub fn get(&self, name: &str) -> Option<&DecodedValue> {
        self.params.iter().find(|(param, _)| param == name).map(|(_, value)| value)
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("event keys exhausted decoding member '{0}'")]
    KeysExhausted(String),

    #[error("event data exhausted decoding member '{0}'")]
    DataExhausted(String),

    #[error("member '{member}' value does not fit {bits} bits")]
    ValueOutOfRange { member: String, bits: u16 },

    #[error("member '{0}' is not a boolean")]
    NotABool(String),

    #[error("log selector does not match descriptor")]
    SelectorMismatch,
}

pub fn decode_event(abi: &EventAbi, log: &Log) -> Result<DecodedEvent, DecodeError> {
    if log.selector() != Some(&abi.selector) {
        return Err(DecodeError::SelectorMismatch);
    }

    let mut keys = log.keys.iter().skip(1);
    let mut data = log.data.iter();
    let mut params = Vec::with_capacity(abi.members.len());

    for member in &abi.members {
        let mut next = || -> Result<Felt, DecodeError> {
            match member.kind {
                MemberKind::Key => keys
                    .next()
                    .copied()
                    .ok_or_else(|| DecodeError::KeysExhausted(member.name.clone())),
                MemberKind::Data => data
                    .next()
                    .copied()
                    .ok_or_else(|| DecodeError::DataExhausted(member.name.clone())),
            }
        };

        let value = match member.ty {
            ParamType::Felt => DecodedValue::Felt(next()?),
            ParamType::Address => DecodedValue::Address(next()?),
            ParamType::Bool => {
                let felt = next()?;
                if felt == Felt::ZERO {
                    DecodedValue::Bool(false)
                } else if felt == Felt::ONE {
                    DecodedValue::Bool(true)
                } else {
                    return Err(DecodeError::NotABool(member.name.clone()));
                }
            }
            ParamType::Uint { bits } => {
                let felt = next()?;
                let value = felt_to_u128(&felt).ok_or_else(|| DecodeError::ValueOutOfRange {
                    member: member.name.clone(),
                    bits,
                })?;
                if bits < 128 && value >> bits != 0 {
                    return Err(DecodeError::ValueOutOfRange {
                        member: member.name.clone(),
                        bits,
                    });
                }
                DecodedValue::Uint(value)
            }
            ParamType::U256 => {
                let low = next()?;
                let high = next()?;
                DecodedValue::U256 { low, high }
            }
        };
        params.push((member.name.clone(), value));
    }

    Ok(DecodedEvent { name: abi.name.clone(), params })
}

fn felt_to_u128(felt: &Felt) -> Option<u128> {
    let bytes = felt.to_bytes_be();
    if bytes[..16].iter().any(|b| *b != 0) {
        return None;
    }
    let mut lower = [0u8; 16];
    lower.copy_from_slice(&bytes[16..]);
    Some(u128::from_be_bytes(lower))
}

/// Deduplicated logging of decode failures: the first failure per selector is
/// logged, the rest stay quiet so a mis-declared ABI cannot flood the logs.
#[derive(Debug, Default)]
pub struct DecodeFailureLog {
    seen: Mutex<HashSet<Felt>>,
}

impl DecodeFailureLog {
    pub fn new() -> Self {
        DecodeFailureLog::default()
    }

    pub fn report(&self, source_name: &str, selector: &Felt, error: &DecodeError) {
        let mut seen = self.seen.lock().unwrap();
        if seen.insert(*selector) {
            debug!(
                source = source_name,
                selector = %padded_hex(selector),
                error = %error,
                "dropping undecodable event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer_abi() -> EventAbi {
        EventAbi::named(
            "Transfer",
            vec![
                EventMember {
                    name: "from".to_string(),
                    kind: MemberKind::Key,
                    ty: ParamType::Address,
                },
                EventMember {
                    name: "to".to_string(),
                    kind: MemberKind::Key,
                    ty: ParamType::Address,
                },
                EventMember {
                    name: "value".to_string(),
                    kind: MemberKind::Data,
                    ty: ParamType::U256,
                },
            ],
        )
    }

    fn transfer_log(abi: &EventAbi) -> Log {
        Log {
            address: Felt::from(0xe4c20_u64),
            block_hash: Felt::ONE,
            block_number: 100,
            transaction_hash: Felt::TWO,
            transaction_index: 0,
            log_index: 0,
            keys: vec![abi.selector, Felt::from(0xaa_u64), Felt::from(0xbb_u64)],
            data: vec![Felt::from(1_000u64), Felt::ZERO],
            removed: false,
        }
    }

    #[test]
    fn test_decode_transfer_event() {
        let abi = transfer_abi();
        let decoded = decode_event(&abi, &transfer_log(&abi)).unwrap();

        assert_eq!(decoded.name, "Transfer");
        assert_eq!(decoded.get("from"), Some(&DecodedValue::Address(Felt::from(0xaa_u64))));
        assert_eq!(decoded.get("to"), Some(&DecodedValue::Address(Felt::from(0xbb_u64))));
        assert_eq!(
            decoded.get("value"),
            Some(&DecodedValue::U256 { low: Felt::from(1_000u64), high: Felt::ZERO })
        );
    }

    #[test]
    fn test_decode_fails_when_data_is_short() {
        let abi = transfer_abi();
        let mut log = transfer_log(&abi);
        log.data.pop();

        assert!(matches!(decode_event(&abi, &log), Err(DecodeError::DataExhausted(_))));
    }

    #[test]
    fn test_uint_bounds_are_enforced() {
        let abi = EventAbi::named(
            "Tick",
            vec![EventMember {
                name: "n".to_string(),
                kind: MemberKind::Data,
                ty: ParamType::Uint { bits: 8 },
            }],
        );
        let mut log = transfer_log(&abi);
        log.keys = vec![abi.selector];
        log.data = vec![Felt::from(300u64)];

        assert!(matches!(
            decode_event(&abi, &log),
            Err(DecodeError::ValueOutOfRange { bits: 8, .. })
        ));

        log.data = vec![Felt::from(255u64)];
        let decoded = decode_event(&abi, &log).unwrap();
        assert_eq!(decoded.get("n"), Some(&DecodedValue::Uint(255)));
    }

    #[test]
    fn test_selector_mismatch_rejected() {
        let abi = transfer_abi();
        let mut log = transfer_log(&abi);
        log.keys[0] = Felt::from(0xbad_u64);
        assert!(matches!(decode_event(&abi, &log), Err(DecodeError::SelectorMismatch)));
    }
}
