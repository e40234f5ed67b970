//! Merkle Batching
//!
//! Builds a binary hash tree over a batch of record hashes and produces
//! per-leaf inclusion proofs. A level with an odd number of nodes pairs its
//! last node with a copy of itself.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hashing::combine;

/// Complete tree, stored level by level from the leaves up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    levels: Vec<Vec<String>>,
}

impl MerkleTree {
    pub fn root(&self) -> &str {
        // build_tree never produces an empty top level
        &self.levels[self.levels.len() - 1][0]
    }

    pub fn leaves(&self) -> &[String] {
        &self.levels[0]
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Number of levels including leaves and root
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Inclusion proof for the leaf at `index`
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count() {
            return None;
        }

        let mut siblings = Vec::with_capacity(self.levels.len() - 1);
        let mut position = index;

        for level in &self.levels[..self.levels.len() - 1] {
            let is_right_child = position % 2 == 1;
            let sibling_index = if is_right_child { position - 1 } else { position + 1 };

            // odd tail node pairs with itself
            let sibling_hash = level
                .get(sibling_index)
                .unwrap_or(&level[position])
                .clone();

            siblings.push(ProofStep {
                hash: sibling_hash,
                position: if is_right_child {
                    SiblingPosition::Left
                } else {
                    SiblingPosition::Right
                },
            });
            position /= 2;
        }

        Some(MerkleProof {
            leaf_hash: self.levels[0][index].clone(),
            siblings,
            root: self.root().to_string(),
            index,
        })
    }
}

/// Which side of the running hash a sibling is combined on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiblingPosition {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: String,
    pub position: SiblingPosition,
}

/// Inclusion proof, siblings ordered leaf to root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_hash: String,
    pub siblings: Vec<ProofStep>,
    pub root: String,
    pub index: usize,
}

impl MerkleProof {
    pub fn verify(&self) -> bool {
        verify_proof(self)
    }

    /// Root obtained by folding the leaf with every sibling
    pub fn computed_root(&self) -> String {
        self.siblings
            .iter()
            .fold(self.leaf_hash.clone(), |running, step| match step.position {
                SiblingPosition::Left => combine(&step.hash, &running),
                SiblingPosition::Right => combine(&running, &step.hash),
            })
    }

    pub fn size(&self) -> usize {
        self.siblings.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "Merkle proof for leaf {}: {} siblings, root: {}",
            self.index,
            self.siblings.len(),
            self.root
        )
    }
}

/// Build the tree bottom-up. `None` for an empty batch.
pub fn build_tree(hashes: &[String]) -> Option<MerkleTree> {
    if hashes.is_empty() {
        return None;
    }

    let mut levels = vec![hashes.to_vec()];

    while levels[levels.len() - 1].len() > 1 {
        let current = &levels[levels.len() - 1];
        let next: Vec<String> = current
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => combine(left, right),
                [single] => combine(single, single),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
        levels.push(next);
    }

    let tree = MerkleTree { levels };
    debug!(
        "Built Merkle tree over {} leaves, root: {}",
        tree.leaf_count(),
        tree.root()
    );
    Some(tree)
}

pub fn root(hashes: &[String]) -> Option<String> {
    build_tree(hashes).map(|tree| tree.root().to_string())
}

pub fn proof(hashes: &[String], index: usize) -> Option<MerkleProof> {
    build_tree(hashes).and_then(|tree| tree.proof(index))
}

pub fn verify_proof(proof: &MerkleProof) -> bool {
    proof.computed_root() == proof.root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::digest;

    fn leaves(count: usize) -> Vec<String> {
        (0..count)
            .map(|i| digest(format!("record-{}", i).as_bytes()))
            .collect()
    }

    #[test]
    fn test_empty_batch_has_no_tree() {
        assert!(build_tree(&[]).is_none());
        assert!(root(&[]).is_none());
        assert!(proof(&[], 0).is_none());
    }

    #[test]
    fn test_single_leaf() {
        let hashes = leaves(1);
        assert_eq!(root(&hashes).unwrap(), hashes[0]);

        let p = proof(&hashes, 0).unwrap();
        assert!(p.siblings.is_empty());
        assert_eq!(p.root, hashes[0]);
        assert!(verify_proof(&p));
    }

    #[test]
    fn test_two_leaves() {
        let hashes = leaves(2);
        assert_eq!(root(&hashes).unwrap(), combine(&hashes[0], &hashes[1]));

        let p = proof(&hashes, 1).unwrap();
        assert_eq!(
            p.siblings,
            vec![ProofStep {
                hash: hashes[0].clone(),
                position: SiblingPosition::Left
            }]
        );
        assert!(p.verify());
    }

    #[test]
    fn test_three_leaves_duplicate_last() {
        let hashes = leaves(3);
        let left = combine(&hashes[0], &hashes[1]);
        let right = combine(&hashes[2], &hashes[2]);
        assert_eq!(root(&hashes).unwrap(), combine(&left, &right));

        let p = proof(&hashes, 2).unwrap();
        assert_eq!(p.siblings.len(), 2);
        assert_eq!(p.siblings[0].hash, hashes[2]);
        assert_eq!(p.siblings[0].position, SiblingPosition::Right);
        assert_eq!(p.siblings[1].hash, left);
        assert_eq!(p.siblings[1].position, SiblingPosition::Left);
        assert!(verify_proof(&p));
    }

    #[test]
    fn test_round_trip_every_index() {
        for count in 1..=17 {
            let hashes = leaves(count);
            let tree = build_tree(&hashes).unwrap();
            assert_eq!(root(&hashes).unwrap(), tree.root());

            for i in 0..count {
                let p = tree.proof(i).unwrap();
                assert_eq!(p.leaf_hash, hashes[i]);
                assert!(verify_proof(&p), "count {} index {}", count, i);
            }
            assert!(tree.proof(count).is_none());
        }
    }

    #[test]
    fn test_tamper_changes_root() {
        for count in 3..=8 {
            let hashes = leaves(count);
            let original = root(&hashes).unwrap();

            for i in 0..count {
                let mut tampered = hashes.clone();
                let flipped = if tampered[i].starts_with('0') { "1" } else { "0" };
                tampered[i].replace_range(0..1, flipped);
                assert_ne!(root(&tampered).unwrap(), original);
            }
        }
    }

    #[test]
    fn test_forged_proof_fails() {
        let hashes = leaves(5);
        let mut p = proof(&hashes, 3).unwrap();
        p.leaf_hash = digest(b"forged");
        assert!(!verify_proof(&p));

        let mut p = proof(&hashes, 3).unwrap();
        p.siblings[0].position = SiblingPosition::Right;
        assert!(!p.verify());
    }

    #[test]
    fn test_proof_serializes_positions_lowercase() {
        let p = proof(&leaves(2), 0).unwrap();
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["siblings"][0]["position"], "right");
    }
}
