// Copyright (C) 2024, 2025 NimPool Developers (see AUTHORS)
//
// This file is part of NimPool
//
// NimPool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// NimPool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// NimPool. If not, see <https://www.gnu.org/licenses/>.

//! Merkle trees over byte leaves.
//!
//! Trees split their leaves into a left half of `ceil(n / 2)` and a right
//! half, hash each leaf on its own and hash inner nodes as `left || right`.
//! An empty tree hashes to the digest of the empty string.

use super::codec::{Decode, DecodeError, Encode, Reader};
use super::{HASH_SIZE, Hash};

/// Root of the tree built from `values`.
pub fn compute_root<T: AsRef<[u8]>>(values: &[T]) -> Hash {
    match values.len() {
        0 => Hash::compute(&[]),
        1 => Hash::compute(values[0].as_ref()),
        len => {
            let mid = len.div_ceil(2);
            let left = compute_root(&values[..mid]);
            let right = compute_root(&values[mid..]);
            hash_pair(&left, &right)
        }
    }
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut concat = [0u8; HASH_SIZE * 2];
    concat[..HASH_SIZE].copy_from_slice(left.as_bytes());
    concat[HASH_SIZE..].copy_from_slice(right.as_bytes());
    Hash::compute(&concat)
}

/// One sibling on the way from a leaf to the root. `left` is set when the
/// sibling sits on the left of the running hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerklePathNode {
    pub left: bool,
    pub hash: Hash,
}

/// Inclusion proof for a single leaf.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MerklePath {
    pub nodes: Vec<MerklePathNode>,
}

impl MerklePath {
    /// Build the proof for `leaf` inside `values`. If the leaf occurs more
    /// than once the first occurrence wins. Returns an empty path when the
    /// leaf is missing, which will not reproduce the root.
    pub fn compute<T: AsRef<[u8]>>(values: &[T], leaf: &[u8]) -> Self {
        let leaf_hash = Hash::compute(leaf);
        let mut nodes = Vec::new();
        Self::walk(values, &leaf_hash, &mut nodes);
        MerklePath { nodes }
    }

    fn walk<T: AsRef<[u8]>>(
        values: &[T],
        leaf_hash: &Hash,
        nodes: &mut Vec<MerklePathNode>,
    ) -> (bool, Hash) {
        match values.len() {
            0 => (false, Hash::compute(&[])),
            1 => {
                let hash = Hash::compute(values[0].as_ref());
                (hash == *leaf_hash, hash)
            }
            len => {
                let mid = len.div_ceil(2);
                let (left_contains, left) = Self::walk(&values[..mid], leaf_hash, nodes);
                let (right_contains, right) = Self::walk(&values[mid..], leaf_hash, nodes);
                let hash = hash_pair(&left, &right);
                if left_contains {
                    nodes.push(MerklePathNode {
                        left: false,
                        hash: right,
                    });
                    (true, hash)
                } else if right_contains {
                    nodes.push(MerklePathNode {
                        left: true,
                        hash: left,
                    });
                    (true, hash)
                } else {
                    (false, hash)
                }
            }
        }
    }

    /// Root reached by hashing `leaf` up along this path.
    pub fn compute_root(&self, leaf: &[u8]) -> Hash {
        self.nodes
            .iter()
            .fold(Hash::compute(leaf), |root, node| match node.left {
                true => hash_pair(&node.hash, &root),
                false => hash_pair(&root, &node.hash),
            })
    }
}

/// Layout: u8 node count, the left flags packed MSB first, then the hashes.
impl Encode for MerklePath {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.nodes.len() as u8);
        let mut flags = vec![0u8; self.nodes.len().div_ceil(8)];
        for (i, node) in self.nodes.iter().enumerate() {
            if node.left {
                flags[i / 8] |= 0x80 >> (i % 8);
            }
        }
        out.extend_from_slice(&flags);
        for node in &self.nodes {
            node.hash.encode(out);
        }
    }
}

impl Decode for MerklePath {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let count = reader.read_u8()? as usize;
        let flags = reader.read_bytes(count.div_ceil(8))?.to_vec();
        let mut nodes = Vec::with_capacity(count);
        for i in 0..count {
            let left = flags[i / 8] & (0x80 >> (i % 8)) != 0;
            nodes.push(MerklePathNode {
                left,
                hash: Hash::decode(reader)?,
            });
        }
        Ok(MerklePath { nodes })
    }
}
