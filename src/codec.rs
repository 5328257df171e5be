//! Wire format of the beacon's manufacturer-data field.
//!
//! Three encodings exist and a deployment picks exactly one of them through
//! [`PayloadKind`]:
//!
//! * identity: UTF-8 text such as `Scooter-1A2B`
//! * timestamp: 6 bytes, big-endian milliseconds since the epoch (low 48 bits)
//! * combined: identity text followed by the 6 timestamp bytes

use std::fmt;

use rand::Rng as _;
use serde_derive::Deserialize;

use crate::error::BeaconError;

pub const DEFAULT_TAG: &str = "Scooter-";

/// Length of an encoded timestamp.
pub const TIMESTAMP_LEN: usize = 6;

const TIMESTAMP_MASK: u64 = (1 << 48) - 1;

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadKind {
    Identity,
    #[default]
    Timestamp,
    Combined,
}

impl PayloadKind {
    pub fn carries_identity(&self) -> bool {
        matches!(self, PayloadKind::Identity | PayloadKind::Combined)
    }

    pub fn carries_timestamp(&self) -> bool {
        matches!(self, PayloadKind::Timestamp | PayloadKind::Combined)
    }
}

/// Writes the low 48 bits of `corrected_now_ms` as big-endian.
pub fn encode_timestamp(corrected_now_ms: i64) -> Result<[u8; TIMESTAMP_LEN], BeaconError> {
    if corrected_now_ms < 0 {
        return Err(BeaconError::Encoding(format!(
            "timestamp {corrected_now_ms} precedes the epoch"
        )));
    }
    let wide = (corrected_now_ms as u64 & TIMESTAMP_MASK).to_be_bytes();
    let mut out = [0u8; TIMESTAMP_LEN];
    out.copy_from_slice(&wide[8 - TIMESTAMP_LEN..]);
    Ok(out)
}

/// Reads the trailing 6 bytes of `bytes` as a big-endian timestamp.
///
/// Leading content is ignored so that a combined payload can be passed whole.
pub fn decode_timestamp(bytes: &[u8]) -> Result<i64, BeaconError> {
    if bytes.len() < TIMESTAMP_LEN {
        return Err(BeaconError::Decoding(format!(
            "timestamp needs {TIMESTAMP_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let mut wide = [0u8; 8];
    wide[8 - TIMESTAMP_LEN..].copy_from_slice(&bytes[bytes.len() - TIMESTAMP_LEN..]);
    Ok(u64::from_be_bytes(wide) as i64)
}

pub fn encode_identity(tag: &str, suffix_hex: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(tag.len() + suffix_hex.len());
    out.extend_from_slice(tag.as_bytes());
    out.extend_from_slice(suffix_hex.as_bytes());
    out
}

/// Decodes identity text. The result is not trusted as a beacon until the
/// caller has checked its tag.
pub fn decode_identity(bytes: &[u8]) -> Result<String, BeaconError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|err| BeaconError::Decoding(format!("identity is not UTF-8: {err}")))
}

/// Identity of one broadcasting session, e.g. `Scooter-04F2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    tag: String,
    suffix: u16,
}

impl DeviceIdentity {
    pub fn new(tag: &str, suffix: u16) -> Self {
        DeviceIdentity {
            tag: tag.to_string(),
            suffix,
        }
    }

    /// Mints a fresh identity with a random suffix.
    pub fn generate(tag: &str) -> Self {
        Self::new(tag, rand::thread_rng().r#gen())
    }

    /// Accepts only `<tag>` followed by exactly four upper-case hex digits.
    pub fn parse(tag: &str, text: &str) -> Option<Self> {
        let suffix = text.strip_prefix(tag)?;
        if suffix.len() != 4
            || !suffix
                .chars()
                .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
        {
            return None;
        }
        u16::from_str_radix(suffix, 16)
            .ok()
            .map(|suffix| Self::new(tag, suffix))
    }

    pub fn suffix_hex(&self) -> String {
        format!("{:04X}", self.suffix)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode_identity(&self.tag, &self.suffix_hex())
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:04X}", self.tag, self.suffix)
    }
}

/// A decoded (or to-be-encoded) manufacturer-data payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconPayload {
    Identity(String),
    Timestamp(i64),
    Combined { identity: String, timestamp: i64 },
}

impl BeaconPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            BeaconPayload::Identity(_) => PayloadKind::Identity,
            BeaconPayload::Timestamp(_) => PayloadKind::Timestamp,
            BeaconPayload::Combined { .. } => PayloadKind::Combined,
        }
    }

    pub fn identity(&self) -> Option<&str> {
        match self {
            BeaconPayload::Identity(identity) | BeaconPayload::Combined { identity, .. } => {
                Some(identity)
            }
            BeaconPayload::Timestamp(_) => None,
        }
    }

    pub fn timestamp(&self) -> Option<i64> {
        match self {
            BeaconPayload::Timestamp(timestamp) | BeaconPayload::Combined { timestamp, .. } => {
                Some(*timestamp)
            }
            BeaconPayload::Identity(_) => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BeaconError> {
        match self {
            BeaconPayload::Identity(identity) => Ok(identity.as_bytes().to_vec()),
            BeaconPayload::Timestamp(timestamp) => Ok(encode_timestamp(*timestamp)?.to_vec()),
            BeaconPayload::Combined {
                identity,
                timestamp,
            } => {
                let mut out = identity.as_bytes().to_vec();
                out.extend_from_slice(&encode_timestamp(*timestamp)?);
                Ok(out)
            }
        }
    }

    /// Decodes `bytes` strictly as `kind`; the other encodings are rejected.
    /// A combined payload must lead with a `<tag>XXXX` identity.
    pub fn decode(kind: PayloadKind, tag: &str, bytes: &[u8]) -> Result<Self, BeaconError> {
        match kind {
            PayloadKind::Identity => decode_identity(bytes).map(BeaconPayload::Identity),
            PayloadKind::Timestamp => {
                if bytes.len() != TIMESTAMP_LEN {
                    return Err(BeaconError::Decoding(format!(
                        "timestamp payload must be {TIMESTAMP_LEN} bytes, got {}",
                        bytes.len()
                    )));
                }
                decode_timestamp(bytes).map(BeaconPayload::Timestamp)
            }
            PayloadKind::Combined => {
                let timestamp = decode_timestamp(bytes)?;
                let identity = decode_identity(&bytes[..bytes.len() - TIMESTAMP_LEN])?;
                if DeviceIdentity::parse(tag, &identity).is_none() {
                    return Err(BeaconError::Decoding(format!(
                        "combined payload has no {tag}XXXX identity"
                    )));
                }
                Ok(BeaconPayload::Combined {
                    identity,
                    timestamp,
                })
            }
        }
    }
}
