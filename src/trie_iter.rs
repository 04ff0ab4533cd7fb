use std::cmp::Ordering;
use std::sync::Arc;

use ethereum_types::H256;

use crate::codec::decode_node;
use crate::db::TrieDB;
use crate::error::{MissingNodeError, TrieError};
use crate::nibbles::{Nibbles, TERMINATOR};
use crate::node::Node;

/// Ordered traversal over the live entries of a trie.
///
/// The stack holds `(path, node)` pairs, pushed in reverse so entries pop in
/// lexicographic terminated-nibble order: within a branch the value slot (16)
/// comes after all nibble children. Stored subtrees are materialized lazily;
/// a missing node ends the iteration with an error item.
///
/// The iterator works over a snapshot of the root taken at creation time and
/// does not observe later mutations of the trie.
pub struct TrieIterator {
    db: Option<Arc<dyn TrieDB>>,
    root_hash: H256,
    stack: Vec<(Nibbles, Node)>,
}

impl TrieIterator {
    pub(crate) fn new(db: Option<Arc<dyn TrieDB>>, root: Node, root_hash: H256) -> Self {
        let mut stack = Vec::new();
        if !root.is_null() {
            stack.push((Nibbles::default(), root));
        }
        Self {
            db,
            root_hash,
            stack,
        }
    }

    /// Positions the iterator at the first entry >= `key` in iteration order,
    /// without visiting the lesser siblings of the nodes on the way down.
    pub fn advance(&mut self, key: &[u8]) -> Result<(), TrieError> {
        let Some((root_path, root_node)) = self.stack.pop() else {
            return Ok(());
        };
        let target = Nibbles::from_bytes(key);
        let mut pos = root_path.len();
        let mut path = root_path;
        let mut node = root_node;

        loop {
            match node {
                Node::Null => break,
                Node::Value(_) => {
                    // descent only follows exact prefix matches, so this is
                    // the target position itself
                    self.stack.push((path, node));
                    break;
                }
                Node::Short(n) => match target.compare_prefix(pos, &n.key) {
                    // the whole subtree sorts before the target
                    Ordering::Greater => break,
                    // the whole subtree sorts after the target
                    Ordering::Less => {
                        self.stack.push((path, Node::Short(n)));
                        break;
                    }
                    Ordering::Equal => {
                        path = path.concat(&n.key);
                        pos += n.key.len();
                        node = n.val.clone();
                    }
                },
                Node::Full(n) => {
                    if pos >= target.len() {
                        self.stack.push((path, Node::Full(n)));
                        break;
                    }
                    let choice = target.at(pos) as usize;
                    // children greater than the target's branch stay on the
                    // stack; the branch itself is skipped so lesser children
                    // are never visited
                    for i in ((choice + 1)..17).rev() {
                        if !n.children[i].is_null() {
                            self.stack
                                .push((path.append_new(i as u8), n.children[i].clone()));
                        }
                    }
                    path = path.append_new(choice as u8);
                    pos += 1;
                    node = n.children[choice].clone();
                }
                Node::Hash(digest) => {
                    node = self.resolve(&digest, &path)?;
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, digest: &H256, path: &Nibbles) -> Result<Node, TrieError> {
        let Some(db) = self.db.as_deref() else {
            return Err(TrieError::NoDatabase);
        };
        let Some(encoded) = db.get(digest.as_bytes())? else {
            return Err(MissingNodeError {
                root_hash: self.root_hash,
                node_hash: *digest,
                key: packed_prefix(path),
                pos: path.len(),
            }
            .into());
        };
        Ok(decode_node(&encoded, Some(*digest), 0)?)
    }
}

impl Iterator for TrieIterator {
    type Item = Result<(Vec<u8>, Vec<u8>), TrieError>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((path, node)) = self.stack.pop() {
            match node {
                Node::Null => {}
                Node::Value(value) => return Some(Ok((path.to_bytes(), value))),
                Node::Short(n) => {
                    self.stack.push((path.concat(&n.key), n.val.clone()));
                }
                Node::Full(n) => {
                    for (choice, child) in n.children.iter().enumerate().rev() {
                        if !child.is_null() {
                            self.stack
                                .push((path.append_new(choice as u8), child.clone()));
                        }
                    }
                }
                Node::Hash(digest) => match self.resolve(&digest, &path) {
                    Ok(resolved) => self.stack.push((path, resolved)),
                    Err(err) => {
                        self.stack.clear();
                        return Some(Err(err));
                    }
                },
            }
        }
        None
    }
}

/// Byte form of a possibly half-open nibble path, for error context only: the
/// terminator and any trailing half-byte are dropped.
fn packed_prefix(path: &Nibbles) -> Vec<u8> {
    let mut nibbles = path.as_slice().to_vec();
    if nibbles.last() == Some(&TERMINATOR) {
        nibbles.pop();
    }
    if nibbles.len() % 2 == 1 {
        nibbles.pop();
    }
    Nibbles::from_hex(nibbles).to_bytes()
}
