use std::array;
use std::sync::Arc;

use ethereum_types::H256;

use crate::nibbles::Nibbles;

/// A node in the Patricia Merkle Trie.
///
/// Untouched subtrees are shared between tree versions through the `Arc`
/// handles; rewrite paths build fresh nodes down the mutated spine only.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// The empty subtree.
    Null,
    /// A path-compression node: a shared nibble prefix over a single child.
    /// The child is a `Value` (making this a leaf) or a `Full`/`Hash` node
    /// (making this an extension). The key ends with the terminator nibble
    /// exactly when the child is a `Value`.
    Short(Arc<ShortNode>),
    /// A 17-slot branch: one child per nibble plus slot 16 for the value of
    /// the key terminating at this branch.
    Full(Arc<FullNode>),
    /// An opaque user value, always terminal.
    Value(Vec<u8>),
    /// A subtree present only by the digest of its canonical encoding.
    Hash(H256),
}

/// Hash-cache metadata carried by `Short` and `Full` nodes.
///
/// `hash` caches the node's digest from its last hashing; `dirty` marks nodes
/// whose encoding has not been persisted since their last mutation; `gen`
/// records the commit generation that produced the cache, driving eviction.
#[derive(Debug, Clone, Default)]
pub struct NodeFlags {
    pub hash: Option<H256>,
    pub dirty: bool,
    pub gen: u64,
}

impl NodeFlags {
    /// Flags for a node freshly produced by a rewrite.
    pub(crate) fn new_dirty(gen: u64) -> Self {
        Self {
            hash: None,
            dirty: true,
            gen,
        }
    }

    /// Flags for a node materialized from the store under a known digest.
    pub(crate) fn decoded(hash: Option<H256>, gen: u64) -> Self {
        Self {
            hash,
            dirty: false,
            gen,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShortNode {
    pub key: Nibbles,
    pub val: Node,
    pub flags: NodeFlags,
}

impl ShortNode {
    pub fn new(key: Nibbles, val: Node, flags: NodeFlags) -> Self {
        debug_assert!(!key.is_empty(), "short node with empty key");
        Self { key, val, flags }
    }
}

// Structural equality only: the hash-cache flags are not part of a node's
// identity.
impl PartialEq for ShortNode {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.val == other.val
    }
}

#[derive(Debug, Clone)]
pub struct FullNode {
    pub children: [Node; 17],
    pub flags: NodeFlags,
}

impl FullNode {
    pub fn new(flags: NodeFlags) -> Self {
        Self {
            children: empty_children(),
            flags,
        }
    }
}

impl PartialEq for FullNode {
    fn eq(&self, other: &Self) -> bool {
        self.children == other.children
    }
}

pub fn empty_children() -> [Node; 17] {
    array::from_fn(|_| Node::Null)
}

impl Default for Node {
    fn default() -> Self {
        Node::Null
    }
}

impl From<ShortNode> for Node {
    fn from(value: ShortNode) -> Self {
        Node::Short(Arc::new(value))
    }
}

impl From<FullNode> for Node {
    fn from(value: FullNode) -> Self {
        Node::Full(Arc::new(value))
    }
}

impl Node {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Node::Null)
    }

    #[inline]
    pub fn is_hash(&self) -> bool {
        matches!(self, Node::Hash(_))
    }

    #[inline]
    pub fn is_short(&self) -> bool {
        matches!(self, Node::Short(_))
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        matches!(self, Node::Full(_))
    }

    #[inline]
    pub fn is_value(&self) -> bool {
        matches!(self, Node::Value(_))
    }

    /// A leaf is a `Short` whose child is a `Value`.
    pub fn is_leaf(&self) -> bool {
        match self {
            Node::Short(n) => n.val.is_value(),
            _ => false,
        }
    }

    /// The digest cached by the last hashing pass, if still valid. Mutations
    /// reset it by giving rewritten nodes fresh flags.
    pub(crate) fn cached_hash(&self) -> Option<H256> {
        match self {
            Node::Short(n) => n.flags.hash,
            Node::Full(n) => n.flags.hash,
            _ => None,
        }
    }

    pub(crate) fn is_dirty(&self) -> bool {
        match self {
            Node::Short(n) => n.flags.dirty,
            Node::Full(n) => n.flags.dirty,
            _ => false,
        }
    }

    /// Whether the hasher may drop this node's cached subtree, keeping only
    /// its digest: the node is persisted and its cache generation fell out of
    /// the retention window.
    pub(crate) fn can_unload(&self, cache_gen: u64, cache_limit: u64) -> bool {
        let flags = match self {
            Node::Short(n) => &n.flags,
            Node::Full(n) => &n.flags,
            _ => return false,
        };
        flags.hash.is_some() && !flags.dirty && flags.gen + cache_limit < cache_gen
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn leaf_predicate() {
        let leaf = Node::from(ShortNode::new(
            Nibbles::from_bytes(&[0xAB]),
            Node::Value(vec![1]),
            NodeFlags::default(),
        ));
        assert!(leaf.is_leaf());
        assert!(leaf.is_short());

        let extension = Node::from(ShortNode::new(
            Nibbles::from_raw(&[0xAB]),
            Node::Full(Arc::new(FullNode::new(NodeFlags::default()))),
            NodeFlags::default(),
        ));
        assert!(!extension.is_leaf());
    }

    #[test]
    fn equality_ignores_flags() {
        let a = Node::from(ShortNode::new(
            Nibbles::from_bytes(&[0xAB]),
            Node::Value(vec![1]),
            NodeFlags::new_dirty(7),
        ));
        let b = Node::from(ShortNode::new(
            Nibbles::from_bytes(&[0xAB]),
            Node::Value(vec![1]),
            NodeFlags::decoded(Some(H256::zero()), 0),
        ));
        assert_eq!(a, b);
    }

    #[test]
    fn unload_requires_clean_persisted_node() {
        let mut flags = NodeFlags::decoded(Some(H256::zero()), 0);
        let node = |flags: NodeFlags| {
            Node::from(ShortNode::new(
                Nibbles::from_bytes(&[0x01]),
                Node::Value(vec![2]),
                flags,
            ))
        };
        // gen 0 + limit 2 < current 3
        assert!(node(flags.clone()).can_unload(3, 2));
        assert!(!node(flags.clone()).can_unload(2, 2));
        flags.dirty = true;
        assert!(!node(flags).can_unload(3, 2));
    }
}
