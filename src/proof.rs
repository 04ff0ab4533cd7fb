use std::collections::{HashMap, HashSet};

use ethereum_types::H256;

use crate::codec::decode_node;
use crate::error::{ProofError, TrieError};
use crate::hasher::Hasher;
use crate::keccak::keccak_hash;
use crate::nibbles::Nibbles;
use crate::node::Node;
use crate::Trie;

impl Trie {
    /// Builds a Merkle proof for `key` against the current root: the ordered,
    /// digest-deduplicated canonical encodings of every node the lookup walks
    /// through that is addressed by hash, plus the root itself.
    ///
    /// The proof is produced even when the key is absent, witnessing the
    /// point where the walk terminates so verifiers can confirm exclusion.
    pub fn prove(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, TrieError> {
        let path = Nibbles::from_bytes(key);
        let mut pos = 0;
        let mut nodes = Vec::new();
        let mut current = self.root.clone();
        loop {
            match current {
                Node::Null | Node::Value(_) => break,
                Node::Short(n) => {
                    nodes.push(Node::Short(n.clone()));
                    if !path.starts_with(pos, &n.key) {
                        break;
                    }
                    pos += n.key.len();
                    current = n.val.clone();
                }
                Node::Full(n) => {
                    nodes.push(Node::Full(n.clone()));
                    if pos >= path.len() {
                        break;
                    }
                    let idx = path.at(pos) as usize;
                    pos += 1;
                    current = n.children[idx].clone();
                }
                Node::Hash(digest) => {
                    current = self.resolve_hash(&digest, &path, pos)?;
                }
            }
        }

        // Re-derive each traversed node's commit-time form: nodes small
        // enough to be inlined never appear as separate proof entries.
        let mut hasher = Hasher::new(0, 0, None);
        let mut seen = HashSet::new();
        let mut proof = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            if let Some((digest, encoded)) = hasher.proof_encoding(node, i == 0) {
                if seen.insert(digest) {
                    proof.push(encoded);
                }
            }
        }
        Ok(proof)
    }
}

/// Verifies a Merkle proof for `key` against an expected root digest.
///
/// Returns `Ok(Some(value))` when the proof shows the key bound to `value`,
/// `Ok(None)` when it shows the key absent (the walk reaches a null slot or a
/// diverging path), and an error when the proof is incomplete or malformed.
pub fn verify_proof(
    root: H256,
    key: &[u8],
    proof: &[Vec<u8>],
) -> Result<Option<Vec<u8>>, ProofError> {
    let index: HashMap<H256, &[u8]> = proof
        .iter()
        .map(|entry| (H256(keccak_hash(entry)), entry.as_slice()))
        .collect();

    let path = Nibbles::from_bytes(key);
    let mut pos = 0;
    let mut node = decode_indexed(&index, root)?;
    loop {
        match node {
            Node::Null => return Ok(None),
            Node::Value(value) => {
                return Ok(if pos == path.len() { Some(value) } else { None });
            }
            Node::Short(n) => {
                if !path.starts_with(pos, &n.key) {
                    return Ok(None);
                }
                pos += n.key.len();
                node = n.val.clone();
            }
            Node::Full(n) => {
                if pos >= path.len() {
                    return Ok(None);
                }
                let idx = path.at(pos) as usize;
                pos += 1;
                node = n.children[idx].clone();
            }
            Node::Hash(digest) => {
                node = decode_indexed(&index, digest)?;
            }
        }
    }
}

fn decode_indexed(index: &HashMap<H256, &[u8]>, digest: H256) -> Result<Node, ProofError> {
    let encoded = index
        .get(&digest)
        .ok_or(ProofError::MissingProofNode(digest))?;
    Ok(decode_node(encoded, Some(digest), 0)?)
}
