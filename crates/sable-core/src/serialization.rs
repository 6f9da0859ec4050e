// Consensus-critical. Changes require a network upgrade + tests.
//! Canonical serialization helpers.
//!
//! Rule: all consensus-critical objects are encoded with Borsh.
//! Do not use JSON or non-canonical formats for hashing/signing/consensus.

use crate::constants::*;
use crate::types::{Block, BlockHash, BlockHeader, CoreError, Hash32, Transaction, TxId};
use borsh::to_vec;

/// Encode a value with canonical Borsh encoding.
pub fn to_bytes<T: borsh::BorshSerialize>(v: &T) -> Result<Vec<u8>, CoreError> {
    to_vec(v).map_err(|_| CoreError::InvalidValue("borsh serialization failed"))
}

/// Hash bytes with blake3 and return 32 bytes.
pub fn hash32(domain_sep: &[u8], bytes: &[u8]) -> Hash32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain_sep);
    hasher.update(bytes);
    let out = hasher.finalize();
    let mut arr = [0u8; HASH32_LEN];
    arr.copy_from_slice(out.as_bytes());
    Hash32(arr)
}

/// Canonical transaction id (txid) = BLAKE3(DS_TX || borsh(tx)).
pub fn txid(tx: &Transaction) -> Result<TxId, CoreError> {
    let bytes = to_bytes(tx)?;
    if bytes.len() > MAX_TX_BYTES {
        return Err(CoreError::InvalidValue("tx exceeds MAX_TX_BYTES"));
    }
    Ok(hash32(DS_TX, &bytes))
}

/// Serialized transaction size in bytes; the unit for fee rates and block size.
pub fn tx_size(tx: &Transaction) -> Result<usize, CoreError> {
    Ok(to_bytes(tx)?.len())
}

/// Canonical block header hash = BLAKE3(DS_BLOCK_HEADER || borsh(header)).
pub fn block_header_hash(h: &BlockHeader) -> Result<BlockHash, CoreError> {
    let bytes = to_bytes(h)?;
    Ok(hash32(DS_BLOCK_HEADER, &bytes))
}

/// Binary merkle root over transaction ids.
///
/// Odd levels pair the last node with the zero hash. An empty list hashes to zero.
pub fn tx_merkle_root(txs: &[Transaction]) -> Result<Hash32, CoreError> {
    let mut level = txs.iter().map(txid).collect::<Result<Vec<_>, _>>()?;
    if level.is_empty() {
        return Ok(Hash32::zero());
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).copied().unwrap_or_else(Hash32::zero);
                let mut bytes = [0u8; 64];
                bytes[..32].copy_from_slice(pair[0].as_bytes());
                bytes[32..].copy_from_slice(right.as_bytes());
                hash32(DS_TX_MERKLE, &bytes)
            })
            .collect();
    }
    Ok(level[0])
}

impl Block {
    /// Hash of this block's header.
    pub fn hash(&self) -> Result<BlockHash, CoreError> {
        block_header_hash(&self.header)
    }

    /// Serialized block size in bytes.
    pub fn size(&self) -> Result<usize, CoreError> {
        Ok(to_bytes(self)?.len())
    }
}
