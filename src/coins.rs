//! UTXO set: a transactional in-memory view over unspent outputs
//!
//! ```text
//! ┌─────────────────┐
//! │    CoinsMap     │  ← block-sized changes, tombstones, freshness
//! └────────┬────────┘
//!          │ fetch on miss / flush
//! ┌────────▼────────┐
//! │    CoinStore    │  ← backing store (read-mostly)
//! └─────────────────┘
//! ```
//!
//! The map has no internal locking. The chain-state owner holds an
//! exclusive lock across every block application.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::constants::MEMPOOL_HEIGHT;
use crate::error::{ChainError, Result};
use crate::serialize::{read_varint, write_varint, Decodable, Encodable};
use crate::types::{OutPoint, TransactionOutput};

/// Coin: 𝒞 = 𝒯 × ℤ × 𝔹 × 𝔹
///
/// An output plus the height it was created at, whether it came from a
/// coinbase, and whether it has never been written to the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    out: TransactionOutput,
    height: i32,
    is_coinbase: bool,
    fresh: bool,
}

impl Coin {
    /// NewFreshCoin: a coin that the backing store has never seen.
    pub fn new_fresh(out: TransactionOutput, height: i32, is_coinbase: bool) -> Self {
        Self {
            out,
            height,
            is_coinbase,
            fresh: true,
        }
    }

    /// A coin as loaded from the backing store.
    pub fn new_stored(out: TransactionOutput, height: i32, is_coinbase: bool) -> Self {
        Self {
            out,
            height,
            is_coinbase,
            fresh: false,
        }
    }

    /// A coin created by a transaction that only lives in the mempool.
    pub fn new_mempool(out: TransactionOutput) -> Self {
        Self::new_fresh(out, MEMPOOL_HEIGHT, false)
    }

    /// The "empty" sentinel returned for absent or spent outpoints.
    pub fn empty() -> Self {
        Self {
            out: TransactionOutput::null(),
            height: 0,
            is_coinbase: false,
            fresh: false,
        }
    }

    pub fn is_spent(&self) -> bool {
        self.out.is_null()
    }

    pub fn is_mempool_coin(&self) -> bool {
        self.height == MEMPOOL_HEIGHT
    }

    pub fn output(&self) -> &TransactionOutput {
        &self.out
    }

    pub fn amount(&self) -> i64 {
        self.out.value
    }

    pub fn script_pubkey(&self) -> &[u8] {
        &self.out.script_pubkey
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn is_coinbase(&self) -> bool {
        self.is_coinbase
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Independent copy suitable for an undo record.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    fn with_fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    /// Tombstone left behind when a coin is spent.
    fn tombstone() -> Self {
        Self::empty()
    }
}

impl Default for Coin {
    fn default() -> Self {
        Self::empty()
    }
}

/// Persistent form: varint(height × 2 + coinbase) ‖ output.
///
/// Freshness is cache state and is not persisted; decoded coins are stored coins.
impl Encodable for Coin {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize> {
        if self.is_spent() {
            return Err(ChainError::Encode("cannot serialize a spent coin".to_string()));
        }
        if self.height < 0 {
            return Err(ChainError::Encode(format!(
                "cannot serialize coin at height {}",
                self.height
            )));
        }
        let code = (self.height as u64) * 2 + self.is_coinbase as u64;
        let len = write_varint(writer, code)?;
        Ok(len + self.out.consensus_encode(writer)?)
    }
}

impl Decodable for Coin {
    fn consensus_decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let code = read_varint(reader)?;
        let height = i32::try_from(code >> 1)
            .map_err(|_| ChainError::Decode(format!("coin height code {} out of range", code)))?;
        let out = TransactionOutput::consensus_decode(reader)?;
        Ok(Coin::new_stored(out, height, code & 1 == 1))
    }
}

/// Backing store consulted on cache misses and written on flush.
pub trait CoinStore: Send + Sync {
    /// Look up an unspent coin.
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin>;

    /// Apply a batch: `Some` writes the coin, `None` deletes the outpoint.
    fn batch_write(&self, changes: Vec<(OutPoint, Option<Coin>)>) -> Result<()>;
}

/// In-memory backing store.
#[derive(Debug, Default)]
pub struct MemoryCoinStore {
    coins: RwLock<HashMap<OutPoint, Coin>>,
}

impl MemoryCoinStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.coins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.read().is_empty()
    }
}

impl CoinStore for MemoryCoinStore {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.coins.read().get(outpoint).cloned()
    }

    fn batch_write(&self, changes: Vec<(OutPoint, Option<Coin>)>) -> Result<()> {
        let mut coins = self.coins.write();
        for (outpoint, coin) in changes {
            match coin {
                Some(coin) => {
                    coins.insert(outpoint, coin.with_fresh(false));
                }
                None => {
                    coins.remove(&outpoint);
                }
            }
        }
        Ok(())
    }
}

/// CoinsMap: 𝒪 → {Unspent(𝒞), Spent, Absent}
///
/// A spent entry is a tombstone coin (`is_spent()`); an absent outpoint has
/// no entry at all.
#[derive(Default)]
pub struct CoinsMap {
    entries: HashMap<OutPoint, Coin>,
    dirty: HashSet<OutPoint>,
    backend: Option<std::sync::Arc<dyn CoinStore>>,
}

impl std::fmt::Debug for CoinsMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinsMap")
            .field("entries", &self.entries.len())
            .field("dirty", &self.dirty.len())
            .field("has_backend", &self.backend.is_some())
            .finish()
    }
}

/// Cache-state equality: the same cached outpoints in the same states.
/// Coins held only by a backing store are not compared.
impl PartialEq for CoinsMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl CoinsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(backend: std::sync::Arc<dyn CoinStore>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::default()
        }
    }

    /// FetchCoin: the cached entry, populated from the backing store on miss.
    ///
    /// Returns tombstones as well; callers check `is_spent()`.
    pub fn fetch_coin(&mut self, outpoint: &OutPoint) -> Option<&Coin> {
        if !self.entries.contains_key(outpoint) {
            let loaded = self.backend.as_ref()?.get_coin(outpoint)?;
            trace!(%outpoint, "Loaded coin from backing store");
            self.entries.insert(*outpoint, loaded.with_fresh(false));
        }
        self.entries.get(outpoint)
    }

    /// AccessCoin: an owned copy of the current coin, or the empty sentinel.
    pub fn access_coin(&mut self, outpoint: &OutPoint) -> Coin {
        self.fetch_coin(outpoint).cloned().unwrap_or_else(Coin::empty)
    }

    pub fn have_coin(&mut self, outpoint: &OutPoint) -> bool {
        self.fetch_coin(outpoint).map_or(false, |coin| !coin.is_spent())
    }

    /// SpendCoin: Unspent → Spent. Returns the coin that was spent.
    ///
    /// A fresh coin is erased outright since the backing store never saw it.
    /// Spending an absent or already spent outpoint is a caller bug; a
    /// tombstone is recorded and `None` returned.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        let previous = self.fetch_coin(outpoint).cloned();

        match previous {
            Some(coin) if !coin.is_spent() => {
                if coin.fresh {
                    self.entries.remove(outpoint);
                    self.dirty.remove(outpoint);
                } else {
                    self.entries.insert(*outpoint, Coin::tombstone());
                    self.dirty.insert(*outpoint);
                }
                Some(coin.with_fresh(false))
            }
            _ => {
                warn!(%outpoint, "Spending a coin that is absent or already spent");
                self.entries.insert(*outpoint, Coin::tombstone());
                self.dirty.insert(*outpoint);
                None
            }
        }
    }

    /// AddCoin: Absent/Spent → Unspent.
    ///
    /// Overwriting an unspent entry requires `possible_overwrite` (BIP30
    /// duplicate coinbase). The stored coin is fresh when neither the cache
    /// nor the backing store holds a copy of the outpoint.
    pub fn add_coin(&mut self, outpoint: OutPoint, coin: Coin, possible_overwrite: bool) -> Result<()> {
        if coin.is_spent() {
            return Err(ChainError::UtxoConsistency(format!(
                "cannot add spent coin at {}",
                outpoint
            )));
        }

        let existing = self
            .fetch_coin(&outpoint)
            .map(|existing| (existing.is_spent(), existing.fresh));
        let fresh = match existing {
            Some((false, existing_fresh)) => {
                if !possible_overwrite {
                    return Err(ChainError::UtxoConsistency(format!(
                        "attempted to overwrite unspent coin at {}",
                        outpoint
                    )));
                }
                existing_fresh
            }
            // A tombstone still has to delete the stored copy on flush.
            Some((true, _)) => false,
            None => true,
        };

        self.entries.insert(outpoint, coin.with_fresh(fresh));
        self.dirty.insert(outpoint);
        Ok(())
    }

    /// Drop a clean entry from the cache so the next access reloads it.
    pub fn uncache(&mut self, outpoint: &OutPoint) {
        if !self.dirty.contains(outpoint) {
            self.entries.remove(outpoint);
        }
    }

    /// Write dirty entries to the backing store and clear freshness.
    ///
    /// Returns the number of changes written.
    pub fn flush(&mut self) -> Result<usize> {
        let backend = self.backend.clone().ok_or_else(|| {
            ChainError::UtxoConsistency("flush requires a backing store".to_string())
        })?;

        let mut changes = Vec::with_capacity(self.dirty.len());
        for outpoint in self.dirty.drain() {
            match self.entries.get(&outpoint) {
                Some(coin) if !coin.is_spent() => changes.push((outpoint, Some(coin.clone()))),
                _ => changes.push((outpoint, None)),
            }
        }
        let written = changes.len();
        backend.batch_write(changes)?;

        self.entries.retain(|_, coin| !coin.is_spent());
        for coin in self.entries.values_mut() {
            coin.fresh = false;
        }
        Ok(written)
    }

    /// Number of cached entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Cached unspent coins.
    pub fn unspent(&self) -> impl Iterator<Item = (&OutPoint, &Coin)> {
        self.entries.iter().filter(|(_, coin)| !coin.is_spent())
    }

    /// The cached state of an outpoint without consulting the backing store.
    pub fn peek(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.entries.get(outpoint)
    }
}
