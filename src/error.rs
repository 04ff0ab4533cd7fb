use std::fmt;

use ethereum_types::H256;
use rlp::DecoderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrieError {
    #[error("missing trie node: {0}")]
    MissingNode(Box<MissingNodeError>),
    #[error("no database configured for this trie")]
    NoDatabase,
    #[error("invalid root: expected {expected} bytes, got {got}")]
    InvalidRoot { expected: usize, got: usize },
    #[error("invalid node encoding: {0}")]
    InvalidNode(#[from] DecoderError),
    #[error("database error: {0}")]
    DbError(anyhow::Error),
    #[error("lock error: panicked while holding a store lock")]
    LockError,
}

/// Context for a digest the store could not produce: the committed root the
/// lookup started from, the digest that was absent, and how far along the key
/// the walk had come.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingNodeError {
    pub root_hash: H256,
    pub node_hash: H256,
    pub key: Vec<u8>,
    pub pos: usize,
}

impl fmt::Display for MissingNodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {:#x} not found (root {:#x}, key 0x{}, nibble {})",
            self.node_hash,
            self.root_hash,
            hex::encode(&self.key),
            self.pos
        )
    }
}

impl From<MissingNodeError> for TrieError {
    fn from(value: MissingNodeError) -> Self {
        TrieError::MissingNode(Box::new(value))
    }
}

/// Failure modes of proof verification. These are returned as values rather
/// than raised through `TrieError`: a bad proof is an answer, not a fault.
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("proof is missing the node for digest {0:#x}")]
    MissingProofNode(H256),
    #[error("invalid proof node encoding: {0}")]
    InvalidNode(#[from] DecoderError),
}
