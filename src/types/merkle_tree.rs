//! Merkle tree helpers for transaction and state commitments.
//!
//! Behavior:
//! - An empty list of leaves yields `SHA-256("")`.
//! - Odd layers are padded by duplicating the last node before pairing.
//! - Root construction is performed in-place to minimize allocations.
//! - Inclusion proofs record each sibling with its side of the concatenation.

use crate::types::hash::Hash;
use serde::{Deserialize, Serialize};

/// A single step in a Merkle inclusion proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// Sibling hash at this level.
    pub hash: Hash,
    /// True when the sibling sits on the left side of the concatenation.
    pub is_left: bool,
}

/// Utility functions to build Merkle roots and proofs from leaf hashes.
pub struct MerkleTree;

impl MerkleTree {
    fn hash_pair(left: Hash, right: Hash) -> Hash {
        Hash::builder()
            .chain(left.as_slice())
            .chain(right.as_slice())
            .finalize()
    }

    /// Root of an empty leaf list.
    pub fn empty_root() -> Hash {
        Hash::sha256(b"")
    }

    /// Computes a Merkle root from the provided leaf hashes.
    ///
    /// This performs an in-place reduction; when a level has an odd number
    /// of nodes the last node is duplicated for hashing that pair.
    pub fn root(mut nodes: Vec<Hash>) -> Hash {
        if nodes.is_empty() {
            return Self::empty_root();
        }

        let mut len = nodes.len();
        while len > 1 {
            let mut write = 0;
            let mut read = 0;

            while read < len {
                let left = nodes[read];
                let right = if read + 1 < len {
                    nodes[read + 1]
                } else {
                    left
                };

                nodes[write] = Self::hash_pair(left, right);

                write += 1;
                read += 2;
            }

            len = write;
        }

        nodes[0]
    }

    /// Builds an inclusion proof for the leaf at `index`.
    ///
    /// Returns `None` when the leaf list is empty or the index is out of
    /// bounds. The proof pairs with [`MerkleTree::verify_proof`].
    pub fn proof(leaves: &[Hash], index: usize) -> Option<Vec<ProofStep>> {
        if leaves.is_empty() || index >= leaves.len() {
            return None;
        }

        let mut proof = Vec::new();
        let mut level = leaves.to_vec();
        let mut idx = index;

        while level.len() > 1 {
            if level.len() % 2 == 1 {
                let last = *level.last().expect("level is non-empty");
                level.push(last);
            }

            let (sibling, is_left) = if idx % 2 == 0 {
                (level[idx + 1], false)
            } else {
                (level[idx - 1], true)
            };
            proof.push(ProofStep {
                hash: sibling,
                is_left,
            });

            let mut next = Vec::with_capacity(level.len() / 2);
            for pair in level.chunks(2) {
                next.push(Self::hash_pair(pair[0], pair[1]));
            }
            level = next;
            idx /= 2;
        }

        Some(proof)
    }

    /// Verifies an inclusion proof against a known root.
    pub fn verify_proof(leaf: Hash, proof: &[ProofStep], root: Hash) -> bool {
        let mut current = leaf;
        for step in proof {
            current = if step.is_left {
                Self::hash_pair(step.hash, current)
            } else {
                Self::hash_pair(current, step.hash)
            };
        }
        current == root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(data: &[u8]) -> Hash {
        Hash::sha256(data)
    }

    #[test]
    fn empty_returns_hash_of_empty_string() {
        assert_eq!(MerkleTree::root(Vec::new()), Hash::sha256(b""));
    }

    #[test]
    fn single_leaf_returns_leaf() {
        let a = leaf(b"a");
        assert_eq!(MerkleTree::root(vec![a]), a);
    }

    #[test]
    fn even_number_of_leaves_matches_manual_reduction() {
        let a = leaf(b"a");
        let b = leaf(b"b");
        let c = leaf(b"c");
        let d = leaf(b"d");

        let level1 = [MerkleTree::hash_pair(a, b), MerkleTree::hash_pair(c, d)];
        let expected = MerkleTree::hash_pair(level1[0], level1[1]);

        assert_eq!(MerkleTree::root(vec![a, b, c, d]), expected);
    }

    #[test]
    fn odd_number_of_leaves_duplicates_last_for_padding() {
        let a = leaf(b"a");
        let b = leaf(b"b");
        let c = leaf(b"c");

        let left = MerkleTree::hash_pair(a, b);
        let right = MerkleTree::hash_pair(c, c);
        let expected = MerkleTree::hash_pair(left, right);

        assert_eq!(MerkleTree::root(vec![a, b, c]), expected);
    }

    #[test]
    fn proof_verifies_for_every_index() {
        let leaves: Vec<Hash> = (0u8..7).map(|i| leaf(&[i])).collect();
        let root = MerkleTree::root(leaves.clone());

        for (i, l) in leaves.iter().enumerate() {
            let proof = MerkleTree::proof(&leaves, i).expect("proof exists");
            assert!(
                MerkleTree::verify_proof(*l, &proof, root),
                "proof failed for index {i}"
            );
        }
    }

    #[test]
    fn proof_fails_with_wrong_leaf() {
        let leaves: Vec<Hash> = (0u8..4).map(|i| leaf(&[i])).collect();
        let root = MerkleTree::root(leaves.clone());
        let proof = MerkleTree::proof(&leaves, 1).expect("proof exists");

        assert!(!MerkleTree::verify_proof(leaf(b"other"), &proof, root));
    }

    #[test]
    fn proof_fails_with_wrong_root() {
        let leaves: Vec<Hash> = (0u8..4).map(|i| leaf(&[i])).collect();
        let proof = MerkleTree::proof(&leaves, 0).expect("proof exists");

        assert!(!MerkleTree::verify_proof(leaves[0], &proof, leaf(b"bogus")));
    }

    #[test]
    fn proof_rejects_out_of_bounds_index() {
        let leaves = vec![leaf(b"a")];
        assert!(MerkleTree::proof(&leaves, 1).is_none());
        assert!(MerkleTree::proof(&[], 0).is_none());
    }

    #[test]
    fn single_leaf_proof_is_empty() {
        let leaves = vec![leaf(b"only")];
        let proof = MerkleTree::proof(&leaves, 0).expect("proof exists");
        assert!(proof.is_empty());
        assert!(MerkleTree::verify_proof(leaves[0], &proof, leaves[0]));
    }
}
