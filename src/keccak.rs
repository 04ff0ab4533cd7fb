use sha3::{Digest, Keccak256};

/// Width in bytes of a node digest. Child encodings shorter than this are
/// inlined into their parent instead of being referenced by hash.
pub const HASH_LENGTH: usize = 32;

pub fn keccak_hash(data: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data.as_ref());
    hasher.finalize().into()
}
