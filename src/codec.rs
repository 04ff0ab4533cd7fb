// RLP encoding and decoding for trie nodes. This is the canonical encoding:
// the same bytes are hashed, stored in the DB and shipped inside proofs.
//
// Encoding operates on collapsed nodes, i.e. nodes whose children have
// already been reduced by the hasher to either a digest or a small inline
// node. Decoding restores `Hash` children for 32-byte references and recurses
// into inline lists.

use ethereum_types::H256;
use rlp::{DecoderError, Prototype, Rlp, RlpStream};

use crate::keccak::HASH_LENGTH;
use crate::nibbles::Nibbles;
use crate::node::{empty_children, FullNode, Node, NodeFlags, ShortNode};

pub(crate) fn encode_node(node: &Node) -> Vec<u8> {
    match node {
        Node::Null => rlp::NULL_RLP.to_vec(),
        Node::Short(n) => {
            let mut stream = RlpStream::new_list(2);
            stream.append(&n.key.encode_compact());
            append_child(&mut stream, &n.val);
            stream.out().to_vec()
        }
        Node::Full(n) => {
            let mut stream = RlpStream::new_list(17);
            for child in &n.children[..16] {
                append_child(&mut stream, child);
            }
            match &n.children[16] {
                Node::Value(value) => stream.append(value),
                _ => stream.append_empty_data(),
            };
            stream.out().to_vec()
        }
        Node::Value(value) => rlp::encode(value).to_vec(),
        Node::Hash(digest) => rlp::encode(&digest.as_bytes().to_vec()).to_vec(),
    }
}

fn append_child(stream: &mut RlpStream, child: &Node) {
    match child {
        Node::Null => {
            stream.append_empty_data();
        }
        Node::Hash(digest) => {
            stream.append(&digest.as_bytes().to_vec());
        }
        Node::Value(value) => {
            stream.append(value);
        }
        inline => {
            stream.append_raw(&encode_node(inline), 1);
        }
    }
}

/// Decodes a node from its canonical encoding. `hash` is the digest the bytes
/// were fetched under, cached into the node's flags; `gen` stamps the current
/// cache generation.
pub(crate) fn decode_node(bytes: &[u8], hash: Option<H256>, gen: u64) -> Result<Node, DecoderError> {
    decode_node_rlp(&Rlp::new(bytes), hash, gen)
}

fn decode_node_rlp(rlp: &Rlp, hash: Option<H256>, gen: u64) -> Result<Node, DecoderError> {
    match rlp.prototype()? {
        Prototype::Null | Prototype::Data(0) => Ok(Node::Null),
        Prototype::List(2) => {
            let compact: Vec<u8> = rlp.val_at(0)?;
            let key = Nibbles::decode_compact(&compact);
            if key.is_empty() {
                return Err(DecoderError::Custom("short node with empty key"));
            }
            let val = if key.is_leaf() {
                Node::Value(rlp.val_at(1)?)
            } else {
                decode_ref(&rlp.at(1)?, gen)?
            };
            Ok(Node::from(ShortNode {
                key,
                val,
                flags: NodeFlags::decoded(hash, gen),
            }))
        }
        Prototype::List(17) => {
            let mut children = empty_children();
            for (i, slot) in children.iter_mut().enumerate().take(16) {
                *slot = decode_ref(&rlp.at(i)?, gen)?;
            }
            let value: Vec<u8> = rlp.val_at(16)?;
            if !value.is_empty() {
                children[16] = Node::Value(value);
            }
            Ok(Node::from(FullNode {
                children,
                flags: NodeFlags::decoded(hash, gen),
            }))
        }
        Prototype::Data(len) if len == HASH_LENGTH => Ok(Node::Hash(H256::from_slice(rlp.data()?))),
        _ => Err(DecoderError::Custom("expected a 2 or 17 item node list")),
    }
}

fn decode_ref(rlp: &Rlp, gen: u64) -> Result<Node, DecoderError> {
    if rlp.is_list() {
        // An inline child: encoded in place because it is shorter than a digest.
        decode_node_rlp(rlp, None, gen)
    } else {
        let data = rlp.data()?;
        match data.len() {
            0 => Ok(Node::Null),
            len if len == HASH_LENGTH => Ok(Node::Hash(H256::from_slice(data))),
            _ => Err(DecoderError::Custom("invalid node reference length")),
        }
    }
}
