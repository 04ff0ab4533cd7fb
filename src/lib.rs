mod codec;
pub mod db;
pub mod error;
mod hasher;
mod keccak;
mod nibbles;
pub mod node;
mod proof;
mod trie_iter;

use std::sync::Arc;

use ethereum_types::H256;
use lazy_static::lazy_static;
use tracing::trace;

use crate::hasher::Hasher;
use crate::keccak::keccak_hash;
use crate::nibbles::TERMINATOR;
use crate::node::{FullNode, Node, NodeFlags, ShortNode};

pub use crate::db::{InMemoryTrieDB, TrieDB, WriteBatch};
pub use crate::error::{MissingNodeError, ProofError, TrieError};
pub use crate::keccak::HASH_LENGTH;
pub use crate::nibbles::Nibbles;
pub use crate::proof::verify_proof;
pub use crate::trie_iter::TrieIterator;

lazy_static! {
    // Hash of an empty trie, equal to keccak of the empty node's encoding
    pub static ref EMPTY_TRIE_HASH: H256 = H256(keccak_hash(rlp::NULL_RLP));
}

/// Reserved store key holding the digest of the last committed root.
pub const STATE_ROOT_KEY: [u8; 1] = [0x73];

/// How many commit generations a clean cached node survives unused before the
/// hasher evicts its subtree down to a digest.
pub const DEFAULT_CACHE_LIMIT: u64 = 16;

/// An opaque user value as stored in the trie.
pub type TrieValue = Vec<u8>;

/// Patricia Merkle Trie over a content-addressed node store.
///
/// `root` reflects in-memory mutations; `original_root` always equals the
/// digest of the last committed (or opened) state, which is what snapshots
/// roll back to.
pub struct Trie {
    db: Option<Arc<dyn TrieDB>>,
    pub root: Node,
    original_root: H256,
    cache_gen: u64,
    cache_limit: u64,
}

impl Default for Trie {
    fn default() -> Self {
        Self::new_temp()
    }
}

impl Trie {
    /// Creates an empty trie with no backing store. Operations that need to
    /// materialize nodes will fail with [`TrieError::NoDatabase`].
    pub fn new() -> Self {
        Self {
            db: None,
            root: Node::Null,
            original_root: *EMPTY_TRIE_HASH,
            cache_gen: 0,
            cache_limit: DEFAULT_CACHE_LIMIT,
        }
    }

    /// Creates an empty trie over the given store.
    pub fn with_db(db: Arc<dyn TrieDB>) -> Self {
        Self {
            db: Some(db),
            ..Self::new()
        }
    }

    /// Creates a trie over a temporary in-memory store.
    pub fn new_temp() -> Self {
        Self::with_db(Arc::new(InMemoryTrieDB::default()))
    }

    pub fn with_cache_limit(mut self, cache_limit: u64) -> Self {
        self.cache_limit = cache_limit;
        self
    }

    /// Opens a trie from an already-initialized store. With no explicit root
    /// the last committed root is recovered from [`STATE_ROOT_KEY`]; a
    /// non-empty root must exist in the store.
    pub fn open(db: Arc<dyn TrieDB>, root: Option<H256>) -> Result<Self, TrieError> {
        let root = match root {
            Some(root) => root,
            None => match db.get(&STATE_ROOT_KEY)? {
                Some(bytes) if bytes.len() == HASH_LENGTH => H256::from_slice(&bytes),
                Some(bytes) => {
                    return Err(TrieError::InvalidRoot {
                        expected: HASH_LENGTH,
                        got: bytes.len(),
                    });
                }
                None => *EMPTY_TRIE_HASH,
            },
        };
        if root != *EMPTY_TRIE_HASH && !db.contains(root.as_bytes())? {
            return Err(MissingNodeError {
                root_hash: root,
                node_hash: root,
                key: Vec::new(),
                pos: 0,
            }
            .into());
        }
        trace!(root = %root, "opened trie");
        let mut trie = Self::with_db(db);
        trie.inject(root);
        Ok(trie)
    }

    /// Resets the trie to the empty state, dropping all in-memory nodes.
    pub fn close(&mut self) {
        self.root = Node::Null;
        self.original_root = *EMPTY_TRIE_HASH;
        self.cache_gen = 0;
    }

    /// Resets the in-memory state to the given committed root, to be
    /// materialized from the store on demand.
    pub fn inject(&mut self, root: H256) {
        self.root = if root == *EMPTY_TRIE_HASH {
            Node::Null
        } else {
            Node::Hash(root)
        };
        self.original_root = root;
    }

    /// Creates an independent trie over the same store, positioned at `root`
    /// (default: this trie's last committed root). The two tries share no
    /// in-memory nodes, so mutating one never disturbs the other.
    pub fn snapshot(&self, root: Option<H256>) -> Result<Self, TrieError> {
        let db = self.db.clone().ok_or(TrieError::NoDatabase)?;
        let mut snapshot = Self::with_db(db).with_cache_limit(self.cache_limit);
        snapshot.inject(root.unwrap_or(self.original_root));
        Ok(snapshot)
    }

    /// The digest of the last committed (or opened) state.
    pub fn original_root(&self) -> H256 {
        self.original_root
    }

    /// Retrieves the value stored under `key`. Subtrees materialized from the
    /// store along the way are spliced into the in-memory tree so later
    /// operations don't fetch them again.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<TrieValue>, TrieError> {
        let path = Nibbles::from_bytes(key);
        let root = self.root.clone();
        let (value, resolved) = self.get_inner(&root, &path, 0)?;
        if let Some(new_root) = resolved {
            self.root = new_root;
        }
        Ok(value)
    }

    /// Inserts a value under `key`, replacing any previous one. An empty
    /// value removes the key: the persisted layout reserves empty byte
    /// strings for absence.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), TrieError> {
        if value.is_empty() {
            self.remove(key)?;
            return Ok(());
        }
        let path = Nibbles::from_bytes(key);
        let root = self.root.clone();
        let (_, new_root) = self.insert_inner(root, &path, 0, Node::Value(value.to_vec()))?;
        self.root = new_root;
        Ok(())
    }

    /// Removes `key` from the trie, reporting whether it was present.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool, TrieError> {
        let path = Nibbles::from_bytes(key);
        let root = self.root.clone();
        let (found, new_root) = self.remove_inner(root, &path, 0)?;
        self.root = new_root;
        Ok(found)
    }

    /// Computes the root digest of the current in-memory state without
    /// persisting anything.
    pub fn root_hash(&mut self) -> H256 {
        if self.root.is_null() {
            return *EMPTY_TRIE_HASH;
        }
        let mut hasher = Hasher::new(self.cache_gen, self.cache_limit, None);
        let (hash_form, cached) = hasher.hash(&self.root, true);
        self.root = cached;
        match hash_form {
            Node::Hash(digest) => digest,
            _ => unreachable!("the root is always promoted to a digest"),
        }
    }

    /// Hashes the current state into `batch` (node writes in post-order, the
    /// state-root write last) and advances the commit generation. The caller
    /// applies the batch to the store.
    pub fn commit(&mut self, batch: &mut WriteBatch) -> H256 {
        let digest = if self.root.is_null() {
            *EMPTY_TRIE_HASH
        } else {
            let mut hasher = Hasher::new(self.cache_gen, self.cache_limit, Some(batch));
            let (hash_form, cached) = hasher.hash(&self.root, true);
            self.root = cached;
            match hash_form {
                Node::Hash(digest) => digest,
                _ => unreachable!("the root is always promoted to a digest"),
            }
        };
        batch.put(STATE_ROOT_KEY.to_vec(), digest.as_bytes().to_vec());
        self.original_root = digest;
        self.cache_gen += 1;
        trace!(root = %digest, writes = batch.len(), "committed trie");
        digest
    }

    /// Commits into a fresh batch and applies it to the store atomically.
    pub fn persist(&mut self) -> Result<H256, TrieError> {
        self.db()?;
        let mut batch = WriteBatch::default();
        let digest = self.commit(&mut batch);
        self.db()?.put_batch(batch)?;
        Ok(digest)
    }

    /// Ordered traversal over all live entries reachable from the current
    /// root, materializing stored subtrees on demand.
    pub fn iter(&self) -> TrieIterator {
        TrieIterator::new(self.db.clone(), self.root.clone(), self.original_root)
    }

    fn db(&self) -> Result<&dyn TrieDB, TrieError> {
        self.db.as_deref().ok_or(TrieError::NoDatabase)
    }

    fn new_flags(&self) -> NodeFlags {
        NodeFlags::new_dirty(self.cache_gen)
    }

    /// Materializes the node stored under `digest`. `key`/`pos` are the walk
    /// position, reported when the store cannot produce the node.
    pub(crate) fn resolve_hash(
        &self,
        digest: &H256,
        key: &Nibbles,
        pos: usize,
    ) -> Result<Node, TrieError> {
        let db = self.db()?;
        let Some(encoded) = db.get(digest.as_bytes())? else {
            trace!(node = %digest, "trie node missing from store");
            return Err(MissingNodeError {
                root_hash: self.original_root,
                node_hash: *digest,
                key: key.to_bytes(),
                pos,
            }
            .into());
        };
        Ok(codec::decode_node(&encoded, Some(*digest), self.cache_gen)?)
    }

    /// Recursive lookup. Returns the value (if any) and, when a `Hash` node
    /// was resolved somewhere below, the rebuilt subtree to splice in.
    fn get_inner(
        &self,
        node: &Node,
        key: &Nibbles,
        pos: usize,
    ) -> Result<(Option<TrieValue>, Option<Node>), TrieError> {
        match node {
            Node::Null => Ok((None, None)),
            Node::Value(value) => Ok((Some(value.clone()), None)),
            Node::Short(n) => {
                if !key.starts_with(pos, &n.key) {
                    return Ok((None, None));
                }
                let (value, resolved) = self.get_inner(&n.val, key, pos + n.key.len())?;
                let replacement = resolved.map(|new_val| {
                    Node::from(ShortNode {
                        key: n.key.clone(),
                        val: new_val,
                        flags: n.flags.clone(),
                    })
                });
                Ok((value, replacement))
            }
            Node::Full(n) => {
                if pos >= key.len() {
                    return Ok((None, None));
                }
                let idx = key.at(pos) as usize;
                let (value, resolved) = self.get_inner(&n.children[idx], key, pos + 1)?;
                let replacement = resolved.map(|new_child| {
                    let mut full = (**n).clone();
                    full.children[idx] = new_child;
                    Node::from(full)
                });
                Ok((value, replacement))
            }
            Node::Hash(digest) => {
                let resolved = self.resolve_hash(digest, key, pos)?;
                let (value, inner) = self.get_inner(&resolved, key, pos)?;
                Ok((value, Some(inner.unwrap_or(resolved))))
            }
        }
    }

    /// Recursive insertion rewrite. Returns whether the subtree changed and
    /// its new root; unchanged subtrees are handed back as-is so parents can
    /// keep their caches.
    fn insert_inner(
        &self,
        node: Node,
        key: &Nibbles,
        pos: usize,
        value: Node,
    ) -> Result<(bool, Node), TrieError> {
        if pos == key.len() {
            if let Node::Value(old) = &node {
                let changed = !matches!(&value, Node::Value(new) if new == old);
                return Ok((changed, value));
            }
            return Ok((true, value));
        }
        match node {
            Node::Null => Ok((
                true,
                Node::from(ShortNode::new(key.offset(pos), value, self.new_flags())),
            )),
            Node::Short(ref n) => {
                let matchlen = key.count_prefix(pos, &n.key);
                if matchlen == n.key.len() {
                    let (changed, new_val) =
                        self.insert_inner(n.val.clone(), key, pos + matchlen, value)?;
                    if !changed {
                        return Ok((false, node));
                    }
                    return Ok((
                        true,
                        Node::from(ShortNode::new(n.key.clone(), new_val, self.new_flags())),
                    ));
                }
                // The paths diverge inside this node: split into a branch
                // holding both subtrees, keeping any shared prefix in a
                // wrapping short.
                let mut branch = FullNode::new(self.new_flags());
                let existing_idx = n.key.at(matchlen) as usize;
                branch.children[existing_idx] = if matchlen + 1 == n.key.len() {
                    n.val.clone()
                } else {
                    Node::from(ShortNode::new(
                        n.key.offset(matchlen + 1),
                        n.val.clone(),
                        self.new_flags(),
                    ))
                };
                let incoming_idx = key.at(pos + matchlen) as usize;
                branch.children[incoming_idx] = if pos + matchlen + 1 == key.len() {
                    value
                } else {
                    Node::from(ShortNode::new(
                        key.offset(pos + matchlen + 1),
                        value,
                        self.new_flags(),
                    ))
                };
                let branch = Node::from(branch);
                if matchlen == 0 {
                    return Ok((true, branch));
                }
                Ok((
                    true,
                    Node::from(ShortNode::new(
                        key.slice(pos, pos + matchlen),
                        branch,
                        self.new_flags(),
                    )),
                ))
            }
            Node::Full(ref n) => {
                let idx = key.at(pos) as usize;
                let (changed, new_child) =
                    self.insert_inner(n.children[idx].clone(), key, pos + 1, value)?;
                if !changed {
                    return Ok((false, node));
                }
                let mut full = (**n).clone();
                full.children[idx] = new_child;
                full.flags = self.new_flags();
                Ok((true, Node::from(full)))
            }
            Node::Hash(digest) => {
                let resolved = self.resolve_hash(&digest, key, pos)?;
                let (changed, new_node) = self.insert_inner(resolved.clone(), key, pos, value)?;
                if !changed {
                    return Ok((false, resolved));
                }
                Ok((true, new_node))
            }
            Node::Value(_) => unreachable!("value node above its terminator position"),
        }
    }

    /// Recursive removal rewrite: `(found, new_subtree)`. Keeps the canonical
    /// shape by merging consecutive shorts and collapsing branches left with
    /// a single live child.
    fn remove_inner(
        &self,
        node: Node,
        key: &Nibbles,
        pos: usize,
    ) -> Result<(bool, Node), TrieError> {
        match node {
            Node::Null => Ok((false, Node::Null)),
            // only reached once the whole key, terminator included, matched
            Node::Value(_) => Ok((true, Node::Null)),
            Node::Short(ref n) => {
                let matchlen = key.count_prefix(pos, &n.key);
                if matchlen < n.key.len() {
                    return Ok((false, node));
                }
                if pos + matchlen == key.len() {
                    return Ok((true, Node::Null));
                }
                let (found, child) = self.remove_inner(n.val.clone(), key, pos + n.key.len())?;
                if !found {
                    return Ok((false, node));
                }
                let new_node = match child {
                    // merge consecutive shorts so the canonical shape survives
                    Node::Short(c) => Node::from(ShortNode::new(
                        n.key.concat(&c.key),
                        c.val.clone(),
                        self.new_flags(),
                    )),
                    other => Node::from(ShortNode::new(n.key.clone(), other, self.new_flags())),
                };
                Ok((true, new_node))
            }
            Node::Full(ref n) => {
                let idx = key.at(pos) as usize;
                let (found, new_child) =
                    self.remove_inner(n.children[idx].clone(), key, pos + 1)?;
                if !found {
                    return Ok((false, node));
                }
                let mut full = (**n).clone();
                full.children[idx] = new_child;
                full.flags = self.new_flags();

                // A branch left with a single live child is illegal in a
                // committed trie; collapse it into a short.
                let mut live = None;
                let mut multiple = false;
                for (i, child) in full.children.iter().enumerate() {
                    if !child.is_null() {
                        if live.is_some() {
                            multiple = true;
                            break;
                        }
                        live = Some(i);
                    }
                }
                if !multiple {
                    if let Some(i) = live {
                        if i == 16 {
                            return Ok((
                                true,
                                Node::from(ShortNode::new(
                                    Nibbles::single(TERMINATOR),
                                    full.children[16].clone(),
                                    self.new_flags(),
                                )),
                            ));
                        }
                        // Materialize the survivor just enough to know
                        // whether its key can be merged upward.
                        let child = match &full.children[i] {
                            Node::Hash(digest) => self.resolve_hash(digest, key, pos)?,
                            other => other.clone(),
                        };
                        if let Node::Short(c) = &child {
                            return Ok((
                                true,
                                Node::from(ShortNode::new(
                                    Nibbles::single(i as u8).concat(&c.key),
                                    c.val.clone(),
                                    self.new_flags(),
                                )),
                            ));
                        }
                        return Ok((
                            true,
                            Node::from(ShortNode::new(
                                Nibbles::single(i as u8),
                                child,
                                self.new_flags(),
                            )),
                        ));
                    }
                }
                Ok((true, Node::from(full)))
            }
            Node::Hash(digest) => {
                let resolved = self.resolve_hash(&digest, key, pos)?;
                let (found, new_node) = self.remove_inner(resolved.clone(), key, pos)?;
                if !found {
                    return Ok((false, resolved));
                }
                Ok((true, new_node))
            }
        }
    }
}
