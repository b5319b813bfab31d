use openvote_core::{
    hash_records, ArchivedBatch, Digest, HashVersion, MerkleTree, Proof, Record,
};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

use crate::utils::{max_batch_file_bytes, read_file_with_limit, write_file};

/// A batch's record list on disk, as JSON (optionally gzip-compressed).
///
/// Accepts the aggregator's archive format (`GET /batch/{id}`); ledger id
/// and root are optional so a bare record list can be hashed too.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_batch_id: Option<u64>,
    #[serde(default)]
    pub hash_version: HashVersion,
    /// Root claimed by whoever wrote the file. Never trusted for verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<Digest>,
    pub records: Vec<Record>,
}

impl From<ArchivedBatch> for BatchFile {
    fn from(batch: ArchivedBatch) -> Self {
        Self {
            ledger_batch_id: Some(batch.ledger_batch_id),
            hash_version: batch.hash_version,
            root: Some(batch.root),
            records: batch.records,
        }
    }
}

impl BatchFile {
    pub fn read(path: &Path, is_compressed: bool) -> io::Result<Self> {
        let buf = read_file_with_limit(path, is_compressed, max_batch_file_bytes())?;
        serde_json::from_slice(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn save(&self, path: &Path, compress: bool) -> io::Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        write_file(path, &data, compress)
    }

    pub fn leaves(&self) -> Vec<Digest> {
        hash_records(self.hash_version, &self.records)
    }

    pub fn tree(&self) -> MerkleTree {
        MerkleTree::new(self.hash_version, &self.leaves())
    }

    /// Root recomputed from the records.
    pub fn compute_root(&self) -> Digest {
        self.tree().root()
    }

    pub fn find(&self, dedup_key: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.dedup_key == dedup_key)
    }
}

/// Output of `openvote prove`, input of `openvote verify`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_batch_id: Option<u64>,
    pub dedup_key: String,
    pub leaf: Digest,
    pub root: Digest,
    pub proof: Proof,
}

impl InclusionProof {
    /// Proof for the record filed under `dedup_key`, `None` if absent.
    pub fn build(batch: &BatchFile, dedup_key: &str) -> Option<Self> {
        let record = batch.find(dedup_key)?;
        let leaf = record.leaf(batch.hash_version);
        let tree = batch.tree();
        let proof = tree.prove(&leaf).ok()?;
        Some(Self {
            ledger_batch_id: batch.ledger_batch_id,
            dedup_key: dedup_key.to_string(),
            leaf,
            root: tree.root(),
            proof,
        })
    }

    pub fn read(path: &Path) -> io::Result<Self> {
        let buf = read_file_with_limit(path, false, max_batch_file_bytes())?;
        serde_json::from_slice(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openvote_core::verify;

    fn batch() -> BatchFile {
        BatchFile {
            ledger_batch_id: Some(4),
            hash_version: HashVersion::V1,
            root: None,
            records: ["A", "B", "C", "D", "E"]
                .iter()
                .map(|s| Record::new(s.as_bytes().to_vec(), format!("voter-{}", s), "station", 1))
                .collect(),
        }
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("ov_cli_{}_{}", rand::random::<u32>(), name))
    }

    #[test]
    fn roundtrip_compressed_file() {
        let b = batch();
        let path = temp_path("batch.json.gz");
        b.save(&path, true).unwrap();
        let back = BatchFile::read(&path, true).unwrap();
        assert_eq!(back, b);
        assert_eq!(back.compute_root(), b.compute_root());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn reads_archive_format() {
        let json = serde_json::json!({
            "ledger_batch_id": 2,
            "hash_version": "v1",
            "root": "00".repeat(32),
            "records": [{ "payload": "QQ==", "dedup_key": "voter-A", "origin": "s", "arrival_time": 1 }],
        });
        let path = temp_path("archive.json");
        std::fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

        let b = BatchFile::read(&path, false).unwrap();
        assert_eq!(b.ledger_batch_id, Some(2));
        assert_eq!(b.records[0].payload, b"A".to_vec());
        // The claimed root is kept but never used
        assert_ne!(Some(b.compute_root()), b.root);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn proofs_verify_for_every_member() {
        let b = batch();
        for r in &b.records {
            let p = InclusionProof::build(&b, &r.dedup_key).unwrap();
            assert_eq!(p.root, b.compute_root());
            assert!(verify(&p.proof, &p.leaf, &p.root));
        }
        assert!(InclusionProof::build(&b, "voter-Z").is_none());
    }
}
