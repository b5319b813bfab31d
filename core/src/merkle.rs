//! Order-independent Merkle tree over a batch's leaf multiset.
//!
//! Construction rules, shared by the committer and every verifier:
//!
//! 1. Leaves are sorted ascending before the first level is built.
//! 2. Adjacent nodes are paired; each pair is hashed in ascending order
//!    (see [`HashVersion::hash_intermediate`]).
//! 3. On a level with an odd node count the last node is carried forward to
//!    the next level unchanged. It is never paired with a copy of itself.
//! 4. An empty leaf set has root [`EMPTY_ROOT`]; a single leaf is its own root.

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::leaf::HashVersion;

/// Root of an empty batch: SHA-256 of empty input.
pub const EMPTY_ROOT: Digest = Digest([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);

/// Which side of the running node the sibling sits on once the pair is put
/// in canonical order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: Digest,
    pub side: Side,
}

/// Inclusion proof, ordered from the leaf level upwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub hash_version: HashVersion,
    pub steps: Vec<ProofStep>,
}

impl Proof {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn siblings(&self) -> Vec<Digest> {
        self.steps.iter().map(|s| s.sibling).collect()
    }
}

#[derive(Clone, Debug)]
pub struct MerkleTree {
    hash_version: HashVersion,
    /// `levels[0]` holds the sorted leaves, the last level holds the root.
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    pub fn new(hash_version: HashVersion, leaves: &[Digest]) -> Self {
        let mut level = leaves.to_vec();
        level.sort_unstable();

        let mut levels = vec![level];
        while levels[levels.len() - 1].len() > 1 {
            let next = levels[levels.len() - 1]
                .chunks(2)
                .map(|pair| match pair {
                    [a, b] => hash_version.hash_intermediate(a, b),
                    [carried] => *carried,
                    _ => unreachable!("chunks(2) yields one or two nodes"),
                })
                .collect();
            levels.push(next);
        }

        Self {
            hash_version,
            levels,
        }
    }

    pub fn hash_version(&self) -> HashVersion {
        self.hash_version
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Sorted leaves as used for the first level.
    pub fn leaves(&self) -> &[Digest] {
        &self.levels[0]
    }

    pub fn root(&self) -> Digest {
        match self.levels.last().and_then(|top| top.first()) {
            Some(root) => *root,
            None => EMPTY_ROOT,
        }
    }

    /// Proof for `target`. Levels where the node is carried forward add no step.
    pub fn prove(&self, target: &Digest) -> Result<Proof> {
        let mut index = self.levels[0]
            .binary_search(target)
            .map_err(|_| Error::NotFound)?;

        let mut steps = Vec::with_capacity(self.levels.len());
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = index ^ 1;
            if let Some(sibling) = level.get(sibling_index) {
                let node = &level[index];
                let side = if sibling < node { Side::Left } else { Side::Right };
                steps.push(ProofStep {
                    sibling: *sibling,
                    side,
                });
            }
            index /= 2;
        }

        Ok(Proof {
            hash_version: self.hash_version,
            steps,
        })
    }
}

/// Root of `leaves` under the current hash version.
pub fn build_root(leaves: &[Digest]) -> Digest {
    MerkleTree::new(HashVersion::CURRENT, leaves).root()
}

/// Inclusion proof for `target` within `leaves`, `Error::NotFound` if absent.
pub fn prove_inclusion(leaves: &[Digest], target: &Digest) -> Result<Proof> {
    MerkleTree::new(HashVersion::CURRENT, leaves).prove(target)
}

/// Recompute the path from `leaf` with the canonical-pair rule and compare
/// to `root`. Pure, no I/O.
pub fn verify(proof: &Proof, leaf: &Digest, root: &Digest) -> bool {
    let node = proof.steps.iter().fold(*leaf, |node, step| {
        proof.hash_version.hash_intermediate(&node, &step.sibling)
    });
    node == *root
}
