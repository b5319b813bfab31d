use base64::{engine::general_purpose::STANDARD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::leaf::HashVersion;

pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;
pub const MAX_DEDUP_KEY_BYTES: usize = 256;
pub const MAX_ORIGIN_BYTES: usize = 128;

/// One accepted vote. Immutable once it has been enqueued.
///
/// Field order is part of the leaf hash (borsh encodes fields in declaration
/// order), so it must never change under an existing [`HashVersion`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Record {
    /// Opaque signed vote payload.
    #[serde(serialize_with = "ser_b64", deserialize_with = "de_b64")]
    pub payload: Vec<u8>,
    /// Deduplication key extracted from the payload, one per voter.
    pub dedup_key: String,
    /// Polling station the record arrived from.
    pub origin: String,
    /// Unix milliseconds at which intake accepted the record.
    pub arrival_time: i64,
}

impl Record {
    pub fn new(
        payload: Vec<u8>,
        dedup_key: impl Into<String>,
        origin: impl Into<String>,
        arrival_time: i64,
    ) -> Self {
        Self {
            payload,
            dedup_key: dedup_key.into(),
            origin: origin.into(),
            arrival_time,
        }
    }

    /// Structural checks applied at intake.
    pub fn validate(&self) -> Result<()> {
        if self.payload.is_empty() {
            return Err(Error::IntakeRejected("empty payload".to_string()));
        }
        if self.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(Error::IntakeRejected(format!(
                "payload is {} bytes (max {})",
                self.payload.len(),
                MAX_PAYLOAD_BYTES
            )));
        }
        if self.dedup_key.trim().is_empty() {
            return Err(Error::IntakeRejected("missing dedup key".to_string()));
        }
        if self.dedup_key.len() > MAX_DEDUP_KEY_BYTES {
            return Err(Error::IntakeRejected("dedup key too long".to_string()));
        }
        if self.origin.len() > MAX_ORIGIN_BYTES {
            return Err(Error::IntakeRejected("origin too long".to_string()));
        }
        if self.arrival_time < 0 {
            return Err(Error::IntakeRejected("negative timestamp".to_string()));
        }
        Ok(())
    }

    /// Borsh encoding hashed into the leaf.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("borsh encoding into a Vec is infallible")
    }

    pub fn leaf(&self, version: HashVersion) -> Digest {
        version.hash_record(self)
    }

    pub fn dedup_digest(&self, version: HashVersion) -> Digest {
        version.hash_dedup_key(&self.dedup_key)
    }
}

fn ser_b64<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn de_b64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    let s = <String as Deserialize>::deserialize(deserializer)?;
    STANDARD.decode(s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_bytes_layout() {
        let r = Record::new(b"A".to_vec(), "k", "s", 1);
        let bytes = r.canonical_bytes();
        // u32 len + payload, u32 len + key, u32 len + origin, i64
        assert_eq!(bytes.len(), 4 + 1 + 4 + 1 + 4 + 1 + 8);
        assert_eq!(&bytes[..5], &[1, 0, 0, 0, b'A']);
        assert_eq!(&bytes[bytes.len() - 8..], &1i64.to_le_bytes());
    }

    #[test]
    fn json_payload_is_base64() {
        let r = Record::new(b"vote".to_vec(), "k", "s", 1);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["payload"], "dm90ZQ==");
        let back: Record = serde_json::from_value(v).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn validation() {
        assert!(Record::new(b"x".to_vec(), "k", "s", 1).validate().is_ok());
        assert!(Record::new(vec![], "k", "s", 1).validate().is_err());
        assert!(Record::new(b"x".to_vec(), " ", "s", 1).validate().is_err());
        assert!(Record::new(b"x".to_vec(), "k", "s", -1).validate().is_err());
        assert!(Record::new(vec![0; MAX_PAYLOAD_BYTES + 1], "k", "s", 1)
            .validate()
            .is_err());
    }
}
