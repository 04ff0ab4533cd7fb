use ethereum_types::H256;

use crate::codec::encode_node;
use crate::db::WriteBatch;
use crate::keccak::{keccak_hash, HASH_LENGTH};
use crate::node::{empty_children, FullNode, Node, NodeFlags, ShortNode};

/// Bottom-up node hasher.
///
/// For every node it produces a pair `(hash_form, cached_form)`: the hash form
/// is what the parent embeds in its own encoding (a `Hash` node, or the node
/// itself when its encoding is shorter than a digest), the cached form is the
/// same subtree with freshly computed digests memoized in its flags, which the
/// trie swaps in for the old root.
///
/// When a batch is supplied every hashed node's `(digest, encoding)` pair is
/// appended to it in post-order.
pub(crate) struct Hasher<'a> {
    batch: Option<&'a mut WriteBatch>,
    cache_gen: u64,
    cache_limit: u64,
}

impl<'a> Hasher<'a> {
    pub fn new(cache_gen: u64, cache_limit: u64, batch: Option<&'a mut WriteBatch>) -> Self {
        Self {
            batch,
            cache_gen,
            cache_limit,
        }
    }

    pub fn hash(&mut self, node: &Node, force: bool) -> (Node, Node) {
        if let Some(cached) = node.cached_hash() {
            if self.batch.is_none() {
                return (Node::Hash(cached), node.clone());
            }
            // Persisted nodes whose cache generation fell out of the retention
            // window collapse to their digest, dropping the cached subtree.
            if node.can_unload(self.cache_gen, self.cache_limit) {
                return (Node::Hash(cached), Node::Hash(cached));
            }
            if !node.is_dirty() {
                return (Node::Hash(cached), node.clone());
            }
        }

        match node {
            Node::Null => (Node::Null, Node::Null),
            Node::Hash(digest) => (Node::Hash(*digest), Node::Hash(*digest)),
            Node::Value(_) => (node.clone(), node.clone()),
            Node::Short(_) | Node::Full(_) => {
                let (collapsed, cached) = self.hash_children(node);
                let (hash_form, digest) = self.store(collapsed, force);
                (hash_form, self.apply_stored_flags(cached, digest))
            }
        }
    }

    /// Replaces each child by its hash form, returning the collapsed node the
    /// codec can encode alongside the equivalent subtree with caches intact.
    fn hash_children(&mut self, node: &Node) -> (Node, Node) {
        match node {
            Node::Short(n) => {
                let (collapsed_val, cached_val) = match &n.val {
                    value @ Node::Value(_) => (value.clone(), value.clone()),
                    child => self.hash(child, false),
                };
                (
                    Node::from(ShortNode {
                        key: n.key.clone(),
                        val: collapsed_val,
                        flags: NodeFlags::default(),
                    }),
                    Node::from(ShortNode {
                        key: n.key.clone(),
                        val: cached_val,
                        flags: n.flags.clone(),
                    }),
                )
            }
            Node::Full(n) => {
                let mut collapsed_children = empty_children();
                let mut cached_children = empty_children();
                for i in 0..16 {
                    if !n.children[i].is_null() {
                        let (collapsed, cached) = self.hash(&n.children[i], false);
                        collapsed_children[i] = collapsed;
                        cached_children[i] = cached;
                    }
                }
                collapsed_children[16] = n.children[16].clone();
                cached_children[16] = n.children[16].clone();
                (
                    Node::from(FullNode {
                        children: collapsed_children,
                        flags: NodeFlags::default(),
                    }),
                    Node::from(FullNode {
                        children: cached_children,
                        flags: n.flags.clone(),
                    }),
                )
            }
            other => (other.clone(), other.clone()),
        }
    }

    /// Proof generation view of a node: the digest and canonical encoding of
    /// its collapsed form, produced with exactly the inline-vs-hash rule the
    /// commit path uses. `None` when the node would be inlined into its
    /// parent (and thus never appears as a separate proof entry).
    pub fn proof_encoding(&mut self, node: &Node, force: bool) -> Option<(H256, Vec<u8>)> {
        let (collapsed, _) = self.hash_children(node);
        hashed_encoding(&collapsed, force)
    }

    /// Applies the inline-vs-hash rule to a collapsed node: encodings of at
    /// least digest width (or the forced root) are replaced by their digest
    /// and, when a batch is present, persisted.
    fn store(&mut self, collapsed: Node, force: bool) -> (Node, Option<H256>) {
        match hashed_encoding(&collapsed, force) {
            None => (collapsed, None),
            Some((digest, encoded)) => {
                if let Some(batch) = self.batch.as_mut() {
                    batch.put(digest.as_bytes().to_vec(), encoded);
                }
                (Node::Hash(digest), Some(digest))
            }
        }
    }

    fn apply_stored_flags(&self, cached: Node, digest: Option<H256>) -> Node {
        match cached {
            Node::Short(n) => {
                let mut short = (*n).clone();
                short.flags = self.stored_flags(&short.flags, digest);
                Node::from(short)
            }
            Node::Full(n) => {
                let mut full = (*n).clone();
                full.flags = self.stored_flags(&full.flags, digest);
                Node::from(full)
            }
            other => other,
        }
    }

    fn stored_flags(&self, old: &NodeFlags, digest: Option<H256>) -> NodeFlags {
        let mut flags = old.clone();
        flags.hash = digest;
        // The dirty bit only clears once the encoding actually reached a
        // batch; a plain root-hash pass must not starve a later commit of its
        // node writes.
        if digest.is_some() && self.batch.is_some() {
            flags.dirty = false;
            flags.gen = self.cache_gen;
        }
        flags
    }
}

/// The single inline-vs-hash decision point, shared by commit hashing and
/// proof generation: returns the digest and canonical encoding when the node
/// is large enough to be addressed by hash (or is the root), `None` when it
/// stays inline.
pub(crate) fn hashed_encoding(collapsed: &Node, force: bool) -> Option<(H256, Vec<u8>)> {
    let encoded = encode_node(collapsed);
    if encoded.len() < HASH_LENGTH && !force {
        return None;
    }
    Some((H256(keccak_hash(&encoded)), encoded))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nibbles::Nibbles;
    use hex_literal::hex;

    fn leaf(key: &[u8], value: &[u8]) -> Node {
        Node::from(ShortNode::new(
            Nibbles::from_bytes(key),
            Node::Value(value.to_vec()),
            NodeFlags::new_dirty(0),
        ))
    }

    #[test]
    fn small_node_stays_inline_unless_forced() {
        let node = leaf(&[0xAA, 0xBB], &[0x01]);
        let mut hasher = Hasher::new(0, 16, None);
        let (inline_form, _) = hasher.hash(&node, false);
        assert_eq!(inline_form, node);

        let (forced, _) = hasher.hash(&node, true);
        assert_eq!(
            forced,
            Node::Hash(H256(hex!(
                "b1656f9e400408a38cf1ff3eba2bc26665ae65d9fb88f59032fa00dbcbf46885"
            )))
        );
    }

    #[test]
    fn commit_writes_digest_keyed_encodings() {
        let big_value = vec![0x7F; 40];
        let node = leaf(&[0xAA, 0xBB], &big_value);
        let mut batch = WriteBatch::default();
        let mut hasher = Hasher::new(0, 16, Some(&mut batch));
        let (hash_form, cached) = hasher.hash(&node, true);

        let Node::Hash(digest) = hash_form else {
            panic!("forced hash expected");
        };
        let ops = batch.into_ops();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].0, digest.as_bytes().to_vec());
        assert_eq!(ops[0].1, encode_node(&node));

        // the cached tree now carries a clean digest
        assert_eq!(cached.cached_hash(), Some(digest));
        assert!(!cached.is_dirty());
    }

    #[test]
    fn root_hash_pass_keeps_nodes_dirty() {
        let node = leaf(&[0xAA, 0xBB], &vec![0x7F; 40]);
        let mut hasher = Hasher::new(0, 16, None);
        let (_, cached) = hasher.hash(&node, true);
        assert!(cached.cached_hash().is_some());
        assert!(cached.is_dirty());

        // a later commit of the cached tree still emits the node write
        let mut batch = WriteBatch::default();
        let mut hasher = Hasher::new(0, 16, Some(&mut batch));
        hasher.hash(&cached, true);
        assert_eq!(batch.into_ops().len(), 1);
    }

    #[test]
    fn clean_node_is_not_rewritten() {
        let node = leaf(&[0xAA, 0xBB], &vec![0x7F; 40]);
        let mut batch = WriteBatch::default();
        let (_, cached) = Hasher::new(0, 16, Some(&mut batch)).hash(&node, true);
        assert_eq!(batch.into_ops().len(), 1);

        let mut batch = WriteBatch::default();
        let (hash_form, _) = Hasher::new(1, 16, Some(&mut batch)).hash(&cached, true);
        assert!(matches!(hash_form, Node::Hash(_)));
        assert!(batch.into_ops().is_empty());
    }

    #[test]
    fn stale_generation_unloads_to_digest() {
        let node = leaf(&[0xAA, 0xBB], &vec![0x7F; 40]);
        let mut batch = WriteBatch::default();
        let (_, cached) = Hasher::new(0, 2, Some(&mut batch)).hash(&node, true);

        // within the window the subtree survives
        let mut batch = WriteBatch::default();
        let (_, kept) = Hasher::new(2, 2, Some(&mut batch)).hash(&cached, true);
        assert!(kept.is_short());

        // past the window only the digest remains
        let mut batch = WriteBatch::default();
        let (_, unloaded) = Hasher::new(3, 2, Some(&mut batch)).hash(&cached, true);
        assert!(unloaded.is_hash());
    }

    #[test]
    fn proof_encoding_matches_store_decision() {
        let small = leaf(&[0xAA, 0xBB], &[0x01]);
        let mut hasher = Hasher::new(0, 16, None);
        assert!(hasher.proof_encoding(&small, false).is_none());

        let (digest, encoded) = hasher.proof_encoding(&small, true).unwrap();
        assert_eq!(encoded, encode_node(&small));
        assert_eq!(digest, H256(keccak_hash(&encoded)));
    }
}
