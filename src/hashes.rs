//! Hash primitives: SHA-256, double SHA-256, HASH160 and SipHash-2-4

use bitcoin_hashes::{sha256d, Hash as BitcoinHash};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::types::{Hash, Hash160};

/// Single SHA-256.
pub fn sha256(data: &[u8]) -> Hash {
    let digest = Sha256::digest(data);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&digest);
    hash
}

/// SHA256(SHA256(x)), the transaction and block identifier hash.
pub fn sha256d(data: &[u8]) -> Hash {
    sha256d::Hash::hash(data).into_inner()
}

/// HASH160(x) = RIPEMD160(SHA256(x))
pub fn hash160(data: &[u8]) -> Hash160 {
    let sha = Sha256::digest(data);
    let digest = Ripemd160::digest(sha);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest);
    hash
}

/// SipHash-2-4: 64-bit keyed hash with 2 compression and 4 finalization rounds.
///
/// For key (k0, k1) and message m:
/// 1. v0..v3 = k ⊕ "somepseudorandomlygeneratedbytes"
/// 2. For each 8-byte little-endian word w: v3 ⊕= w; 2 × SipRound; v0 ⊕= w
/// 3. Last word b = (|m| mod 256) << 56 | trailing bytes, compressed as above
/// 4. v2 ⊕= 0xff; 4 × SipRound; return v0 ⊕ v1 ⊕ v2 ⊕ v3
pub fn siphash24(k0: u64, k1: u64, data: &[u8]) -> u64 {
    let mut state = SipState::new(k0, k1);

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        state.compress(u64::from_le_bytes(word));
    }

    let tail = chunks.remainder();
    let mut last = (data.len() as u64 & 0xff) << 56;
    for (i, byte) in tail.iter().enumerate() {
        last |= (*byte as u64) << (8 * i);
    }
    state.compress(last);

    state.finalize()
}

struct SipState {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

impl SipState {
    fn new(k0: u64, k1: u64) -> Self {
        Self {
            v0: k0 ^ 0x736f6d6570736575,
            v1: k1 ^ 0x646f72616e646f6d,
            v2: k0 ^ 0x6c7967656e657261,
            v3: k1 ^ 0x7465646279746573,
        }
    }

    #[inline]
    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    #[inline]
    fn compress(&mut self, word: u64) {
        self.v3 ^= word;
        self.round();
        self.round();
        self.v0 ^= word;
    }

    fn finalize(mut self) -> u64 {
        self.v2 ^= 0xff;
        for _ in 0..4 {
            self.round();
        }
        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }
}
