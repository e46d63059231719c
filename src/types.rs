//! Core chain types: hashes, outpoints, transactions and blocks

use serde::{Deserialize, Serialize};

use crate::constants::COINBASE_PREVOUT_INDEX;

/// Hash type: 256-bit hash
pub type Hash = [u8; 32];

/// Public key hash: RIPEMD160(SHA256(pubkey))
pub type Hash160 = [u8; 20];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Render a hash the way block explorers do (byte-reversed hex).
pub fn hash_to_hex(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// OutPoint: 𝒪 = ℍ × ℕ₃₂
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash, index: u32) -> Self {
        Self { hash, index }
    }

    /// The prevout carried by a coinbase input.
    pub fn null() -> Self {
        Self {
            hash: [0u8; 32],
            index: COINBASE_PREVOUT_INDEX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash == [0u8; 32] && self.index == COINBASE_PREVOUT_INDEX
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", hash_to_hex(&self.hash), self.index)
    }
}

/// Transaction Input: ℐ = 𝒪 × 𝕊 × ℕ₃₂
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub script_sig: ByteString,
    pub sequence: u32,
}

/// Transaction Output: 𝒯 = ℤ × 𝕊
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: i64,
    pub script_pubkey: ByteString,
}

impl TransactionOutput {
    /// The null output (value -1, empty script) marks a spent coin.
    pub fn null() -> Self {
        Self {
            value: -1,
            script_pubkey: Vec::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.value == -1
    }
}

/// Transaction: 𝒯𝒳 = ℤ × ℐ* × 𝒯* × ℕ₃₂
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

/// Block Header: ℋ = ℤ × ℍ × ℍ × ℕ₃₂ × ℕ₃₂ × ℕ₃₂
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

/// Block: ℬ = ℋ × 𝒯𝒳*
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}
