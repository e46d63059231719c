//! Key store: public-key-hash indexed table of key pairs
//!
//! Shared by the wallet and by script validation. Readers proceed
//! concurrently; writers exclude every reader. No operation performs I/O
//! while holding the lock.

use std::collections::HashMap;

use parking_lot::RwLock;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use tracing::debug;

use crate::error::{ChainError, Result};
use crate::hashes::hash160;
use crate::types::Hash160;

/// KeyPair: (HASH160(pubkey), pubkey, privkey), immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    key_id: Hash160,
    public_key: PublicKey,
    private_key: SecretKey,
}

impl KeyPair {
    /// Derive the compressed public key and its hash from a private key.
    pub fn new(private_key: SecretKey) -> Self {
        let secp = Secp256k1::signing_only();
        let public_key = PublicKey::from_secret_key(&secp, &private_key);
        let key_id = hash160(&public_key.serialize());
        Self {
            key_id,
            public_key,
            private_key,
        }
    }

    /// Build a key pair from 32 raw private key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let private_key =
            SecretKey::from_slice(bytes).map_err(|e| ChainError::InvalidKey(e.to_string()))?;
        Ok(Self::new(private_key))
    }

    pub fn key_id(&self) -> &Hash160 {
        &self.key_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn private_key(&self) -> &SecretKey {
        &self.private_key
    }
}

/// Concurrent mapping from public-key hash to key pair.
#[derive(Debug, Default)]
pub struct KeyStore {
    keys: RwLock<HashMap<Hash160, KeyPair>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// AddKey: derive the pair outside the lock, then insert exclusively.
    pub fn add_key(&self, private_key: SecretKey) -> Hash160 {
        let key_pair = KeyPair::new(private_key);
        let key_id = key_pair.key_id;

        self.keys.write().insert(key_id, key_pair);
        debug!(key_id = %hex::encode(key_id), "Added key to keystore");
        key_id
    }

    /// AddKeyPairs: insert a batch under a single exclusive acquisition.
    pub fn add_key_pairs<I>(&self, key_pairs: I)
    where
        I: IntoIterator<Item = KeyPair>,
    {
        let mut keys = self.keys.write();
        for key_pair in key_pairs {
            keys.insert(key_pair.key_id, key_pair);
        }
    }

    pub fn get_key_pair(&self, pubkey_hash: &[u8]) -> Option<KeyPair> {
        let key_id: Hash160 = pubkey_hash.try_into().ok()?;
        self.keys.read().get(&key_id).cloned()
    }

    /// GetKeyPairByPubKey: hash the serialized public key, then look it up.
    pub fn get_key_pair_by_pubkey(&self, pubkey: &[u8]) -> Option<KeyPair> {
        self.get_key_pair(&hash160(pubkey))
    }

    /// GetKeyPairs: every present pair, read under one shared acquisition so
    /// the result reflects a single moment between writers.
    pub fn get_key_pairs<H: AsRef<[u8]>>(&self, pubkey_hashes: &[H]) -> Vec<KeyPair> {
        let mut found = Vec::with_capacity(pubkey_hashes.len());

        let keys = self.keys.read();
        for pubkey_hash in pubkey_hashes {
            let key_id: Option<Hash160> = pubkey_hash.as_ref().try_into().ok();
            if let Some(key_pair) = key_id.and_then(|id| keys.get(&id)) {
                found.push(key_pair.clone());
            }
        }
        found
    }

    pub fn contains(&self, pubkey_hash: &Hash160) -> bool {
        self.keys.read().contains_key(pubkey_hash)
    }

    pub fn key_ids(&self) -> Vec<Hash160> {
        self.keys.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}
