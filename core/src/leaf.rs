use std::fmt;
use std::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::digest::{hashv, Digest};
use crate::error::Error;
use crate::state::Record;

// Leaves and interior nodes are hashed under different prefixes so that an
// interior node can never be passed off as a leaf (second pre-image).
pub const LEAF_PREFIX: &[u8] = &[0];
pub const INTERMEDIATE_PREFIX: &[u8] = &[1];

/// Hash function version. Stored with every batch and archive entry so that
/// old batches are always verified with the algorithm they were built with.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    BorshSerialize,
    BorshDeserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HashVersion {
    /// SHA-256 over `0x00 || borsh(record)`, interior nodes SHA-256 over
    /// `0x01 || min || max`.
    #[default]
    V1,
}

impl HashVersion {
    pub const CURRENT: HashVersion = HashVersion::V1;

    pub fn as_str(&self) -> &'static str {
        match self {
            HashVersion::V1 => "v1",
        }
    }

    /// Hash raw leaf content.
    pub fn hash_leaf(&self, content: &[u8]) -> Digest {
        match self {
            HashVersion::V1 => hashv(&[LEAF_PREFIX, content]),
        }
    }

    /// Hash one record into its leaf.
    pub fn hash_record(&self, record: &Record) -> Digest {
        self.hash_leaf(&record.canonical_bytes())
    }

    /// Combine two children. The pair is put in ascending order first, which
    /// is what makes the root independent of leaf order.
    pub fn hash_intermediate(&self, a: &Digest, b: &Digest) -> Digest {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        match self {
            HashVersion::V1 => hashv(&[INTERMEDIATE_PREFIX, lo.as_ref(), hi.as_ref()]),
        }
    }

    /// Digest of a dedup key as submitted to the ledger.
    pub fn hash_dedup_key(&self, dedup_key: &str) -> Digest {
        match self {
            HashVersion::V1 => hashv(&[dedup_key.as_bytes()]),
        }
    }
}

impl fmt::Display for HashVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "v1" => Ok(HashVersion::V1),
            other => Err(Error::UnsupportedHashVersion(other.to_string())),
        }
    }
}

/// Leaf digests for a record list, in the same order.
pub fn hash_records(version: HashVersion, records: &[Record]) -> Vec<Digest> {
    records.iter().map(|r| version.hash_record(r)).collect()
}
