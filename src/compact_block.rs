//! BIP152 compact blocks: header, nonce, 48-bit short transaction IDs and
//! prefilled transactions
//!
//! Wire layout:
//!
//! ```text
//! header (80) ‖ nonce (LE64)
//! ‖ varint(#short_ids) ‖ { LE32(id) ‖ LE16(id >> 32) }*
//! ‖ varint(#prefilled) ‖ { varint(index delta) ‖ tx }*
//! ```
//!
//! Prefilled indices are differential on the wire (each is the gap to the
//! previous index minus one) and absolute in memory.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::block::compute_merkle_root;
use crate::constants::*;
use crate::error::{ChainError, Result};
use crate::hashes::{sha256, siphash24};
use crate::serialize::*;
use crate::types::*;

/// Protocol command name of the message.
pub const COMMAND: &str = "cmpctblock";

const MAX_PREFILLED_INDEX: u64 = u16::MAX as u64;

/// A transaction sent in full, at its absolute position in the block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefilledTransaction {
    pub index: u16,
    pub tx: Transaction,
}

/// ShortIdKeys: ℋ × ℕ → ℕ × ℕ
///
/// 1. buf = header80 ‖ LE64(nonce)
/// 2. h = SHA256(buf)
/// 3. k0 = LE64(h[0..8]), k1 = LE64(h[8..16])
pub fn derive_short_id_keys(header: &BlockHeader, nonce: u64) -> Result<(u64, u64)> {
    let mut buf = Vec::with_capacity(BLOCK_HEADER_SIZE + 8);
    buf.extend_from_slice(&header_bytes(header));
    buf.extend_from_slice(&nonce.to_le_bytes());
    let digest = sha256(&buf);

    let k0 = digest
        .get(0..8)
        .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| ChainError::SaltDerivation("digest too short for k0".to_string()))?;
    let k1 = digest
        .get(8..16)
        .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| ChainError::SaltDerivation("digest too short for k1".to_string()))?;
    Ok((k0, k1))
}

/// ShortId(k0, k1, h) = SipHash-2-4(k0, k1, h) & (2⁴⁸ - 1)
pub fn short_id(k0: u64, k1: u64, tx_hash: &Hash) -> u64 {
    siphash24(k0, k1, tx_hash) & SHORT_TXID_MASK
}

/// Compact block message.
///
/// The SipHash keys are derived from the header and nonce at construction
/// and on decode; they are never transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactBlock {
    header: BlockHeader,
    nonce: u64,
    short_ids: Vec<u64>,
    prefilled: Vec<PrefilledTransaction>,
    k0: u64,
    k1: u64,
}

impl CompactBlock {
    /// Assemble a message from its parts, deriving the short-ID keys.
    pub fn new(
        header: BlockHeader,
        nonce: u64,
        short_ids: Vec<u64>,
        prefilled: Vec<PrefilledTransaction>,
    ) -> Result<Self> {
        let (k0, k1) = derive_short_id_keys(&header, nonce)?;
        Ok(Self {
            header,
            nonce,
            short_ids,
            prefilled,
            k0,
            k1,
        })
    }

    /// NewCompactBlock: prefill the coinbase, short IDs for the rest.
    pub fn from_block(block: &Block, nonce: u64) -> Result<Self> {
        let Some(coinbase) = block.transactions.first() else {
            return Err(ChainError::BlockValidation(
                "cannot build a compact block from an empty block".to_string(),
            ));
        };
        let (k0, k1) = derive_short_id_keys(&block.header, nonce)?;

        let short_ids: Vec<u64> = block.transactions[1..]
            .iter()
            .map(|tx| short_id(k0, k1, &txid(tx)))
            .collect();

        debug!(
            block = %hash_to_hex(&block_hash(&block.header)),
            short_ids = short_ids.len(),
            "Built compact block"
        );

        Ok(Self {
            header: block.header,
            nonce,
            short_ids,
            prefilled: vec![PrefilledTransaction {
                index: 0,
                tx: coinbase.clone(),
            }],
            k0,
            k1,
        })
    }

    /// `from_block` with a random nonce.
    pub fn from_block_random(block: &Block) -> Result<Self> {
        Self::from_block(block, rand::random::<u64>())
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn block_hash(&self) -> Hash {
        block_hash(&self.header)
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn short_ids(&self) -> &[u64] {
        &self.short_ids
    }

    pub fn prefilled(&self) -> &[PrefilledTransaction] {
        &self.prefilled
    }

    pub fn short_id_keys(&self) -> (u64, u64) {
        (self.k0, self.k1)
    }

    /// Short ID of a transaction hash under this message's keys.
    pub fn short_id(&self, tx_hash: &Hash) -> u64 {
        short_id(self.k0, self.k1, tx_hash)
    }

    /// Number of transactions in the announced block.
    pub fn tx_count(&self) -> usize {
        self.short_ids.len() + self.prefilled.len()
    }

    pub fn command(&self) -> &'static str {
        COMMAND
    }

    /// Upper bound on the encoded size, reported to the transport.
    ///
    /// 80 + 8 + 3 + 6·|short_ids| + 3 + |prefilled|·(3 + max_block_size)
    pub fn max_payload_length(&self, max_block_size: u64) -> u64 {
        let fixed = (BLOCK_HEADER_SIZE + 8 + 3 + 3) as u64;
        let ids = (SHORT_TXID_LENGTH as u64).saturating_mul(self.short_ids.len() as u64);
        let prefilled = (self.prefilled.len() as u64).saturating_mul(max_block_size.saturating_add(3));
        fixed.saturating_add(ids).saturating_add(prefilled)
    }

    /// Encode for a peer speaking protocol version `pver`.
    pub fn encode<W: Write + ?Sized>(&self, writer: &mut W, pver: u32) -> Result<usize> {
        check_version(pver)?;

        let mut len = self.header.consensus_encode(writer)?;
        len += write_u64_le(writer, self.nonce)?;

        len += write_varint(writer, self.short_ids.len() as u64)?;
        for &id in &self.short_ids {
            if id & !SHORT_TXID_MASK != 0 {
                return Err(ChainError::Encode(format!(
                    "short id {:#x} exceeds 48 bits",
                    id
                )));
            }
            len += write_u32_le(writer, id as u32)?;
            len += write_u16_le(writer, (id >> 32) as u16)?;
        }

        len += write_varint(writer, self.prefilled.len() as u64)?;
        let mut previous: Option<u16> = None;
        for prefilled in &self.prefilled {
            let delta = match previous {
                None => prefilled.index,
                Some(last) if prefilled.index > last => prefilled.index - last - 1,
                Some(last) => {
                    return Err(ChainError::Encode(format!(
                        "prefilled index {} does not follow {}",
                        prefilled.index, last
                    )))
                }
            };
            len += write_varint(writer, delta as u64)?;
            len += prefilled.tx.consensus_encode(writer)?;
            previous = Some(prefilled.index);
        }
        Ok(len)
    }

    /// Decode from a peer speaking protocol version `pver`.
    pub fn decode<R: Read + ?Sized>(reader: &mut R, pver: u32) -> Result<Self> {
        check_version(pver)?;

        let header = BlockHeader::consensus_decode(reader)?;
        let nonce = read_u64_le(reader)?;

        let count = read_length(reader)?;
        let mut short_ids = Vec::with_capacity(prealloc(count));
        for _ in 0..count {
            let low = read_u32_le(reader)? as u64;
            let high = read_u16_le(reader)? as u64;
            short_ids.push(low | (high << 32));
        }

        let count = read_length(reader)?;
        let mut prefilled = Vec::with_capacity(prealloc(count));
        let mut previous: Option<u64> = None;
        for _ in 0..count {
            let delta = read_varint(reader)?;
            if delta > MAX_PREFILLED_INDEX {
                return Err(index_overflow());
            }
            let index = match previous {
                None => delta,
                Some(last) => last + delta + 1,
            };
            if index > MAX_PREFILLED_INDEX {
                return Err(index_overflow());
            }
            let tx = Transaction::consensus_decode(reader)?;
            prefilled.push(PrefilledTransaction {
                index: index as u16,
                tx,
            });
            previous = Some(index);
        }

        Self::new(header, nonce, short_ids, prefilled)
    }

    pub fn to_bytes(&self, pver: u32) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.encode(&mut bytes, pver)?;
        Ok(bytes)
    }

    /// Decode a complete message, rejecting trailing bytes.
    pub fn from_bytes(bytes: &[u8], pver: u32) -> Result<Self> {
        let mut cursor = bytes;
        let message = Self::decode(&mut cursor, pver)?;
        if !cursor.is_empty() {
            return Err(ChainError::Decode(format!(
                "{} trailing bytes after {}",
                cursor.len(),
                COMMAND
            )));
        }
        Ok(message)
    }

    /// Rebuild the block from prefilled transactions and mempool candidates.
    ///
    /// 1. Place prefilled transactions at their indices
    /// 2. Assign the remaining slots, in order, to the short IDs
    /// 3. Fill a slot from the candidate whose short ID matches; a slot
    ///    matched by two different transactions stays empty
    /// 4. No empty slot: verify the merkle root and return the block
    pub fn reconstruct<'a, I>(&self, candidates: I) -> Result<Reconstruction>
    where
        I: IntoIterator<Item = &'a Transaction>,
    {
        self.reconstruct_by(candidates, |hash| self.short_id(hash))
    }

    fn reconstruct_by<'a, I, F>(&self, candidates: I, short_id_of: F) -> Result<Reconstruction>
    where
        I: IntoIterator<Item = &'a Transaction>,
        F: Fn(&Hash) -> u64,
    {
        let total = self.tx_count();
        if total == 0 {
            return Err(ChainError::BlockValidation(
                "compact block announces no transactions".to_string(),
            ));
        }
        if total as u64 > MAX_PREFILLED_INDEX + 1 {
            return Err(ChainError::BlockValidation(format!(
                "compact block announces {} transactions, more than 16-bit indices address",
                total
            )));
        }

        let mut slots: Vec<Option<Transaction>> = vec![None; total];
        for prefilled in &self.prefilled {
            let index = prefilled.index as usize;
            let Some(slot) = slots.get_mut(index) else {
                return Err(ChainError::BlockValidation(format!(
                    "prefilled index {} out of range for {} transactions",
                    index, total
                )));
            };
            if slot.is_some() {
                return Err(ChainError::BlockValidation(format!(
                    "prefilled index {} appears twice",
                    index
                )));
            }
            *slot = Some(prefilled.tx.clone());
        }

        let open_slots = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i);
        let mut slot_by_id: HashMap<u64, usize> = HashMap::with_capacity(self.short_ids.len());
        for (&id, slot) in self.short_ids.iter().zip(open_slots) {
            if slot_by_id.insert(id, slot).is_some() {
                return Err(ChainError::BlockValidation(format!(
                    "duplicate short id {:#014x}",
                    id
                )));
            }
        }

        let mut matched: HashMap<usize, Hash> = HashMap::new();
        let mut ambiguous: HashSet<usize> = HashSet::new();
        for tx in candidates {
            let hash = txid(tx);
            let Some(&slot) = slot_by_id.get(&short_id_of(&hash)) else {
                continue;
            };
            if ambiguous.contains(&slot) {
                continue;
            }
            match matched.get(&slot) {
                Some(existing) if *existing == hash => {}
                Some(_) => {
                    ambiguous.insert(slot);
                    matched.remove(&slot);
                    slots[slot] = None;
                }
                None => {
                    matched.insert(slot, hash);
                    slots[slot] = Some(tx.clone());
                }
            }
        }

        let partial = PartialBlock {
            header: self.header,
            slots,
        };
        if partial.is_complete() {
            Ok(Reconstruction::Complete(partial.into_block()?))
        } else {
            debug!(
                block = %hash_to_hex(&self.block_hash()),
                missing = partial.missing().len(),
                ambiguous = ambiguous.len(),
                "Compact block needs missing transactions"
            );
            Ok(Reconstruction::Incomplete(partial))
        }
    }
}

impl Encodable for CompactBlock {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize> {
        self.encode(writer, PROTOCOL_VERSION)
    }
}

impl Decodable for CompactBlock {
    fn consensus_decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Self::decode(reader, PROTOCOL_VERSION)
    }
}

fn check_version(pver: u32) -> Result<()> {
    if pver < SHORT_IDS_BLOCKS_VERSION {
        return Err(ChainError::ProtocolVersion {
            command: COMMAND,
            version: pver,
        });
    }
    Ok(())
}

fn index_overflow() -> ChainError {
    ChainError::Decode("index overflowed 16-bits".to_string())
}

/// Outcome of `CompactBlock::reconstruct`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconstruction {
    Complete(Block),
    /// Some transactions must be requested from the peer.
    Incomplete(PartialBlock),
}

/// A block with holes at the indices still to be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialBlock {
    header: BlockHeader,
    slots: Vec<Option<Transaction>>,
}

impl PartialBlock {
    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    /// Absolute indices of the transactions still missing, ascending.
    ///
    /// A partial block never holds more than 65536 slots.
    pub fn missing(&self) -> Vec<u16> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i as u16)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Complete the block with the requested transactions, in `missing()` order.
    pub fn fill(mut self, transactions: Vec<Transaction>) -> Result<Block> {
        let missing = self.missing();
        if transactions.len() != missing.len() {
            return Err(ChainError::BlockValidation(format!(
                "expected {} missing transactions, got {}",
                missing.len(),
                transactions.len()
            )));
        }
        for (index, tx) in missing.into_iter().zip(transactions) {
            self.slots[index as usize] = Some(tx);
        }
        self.into_block()
    }

    fn into_block(self) -> Result<Block> {
        let transactions: Vec<Transaction> = self.slots.into_iter().flatten().collect();
        let merkle_root = compute_merkle_root(&transactions)?;
        if merkle_root != self.header.merkle_root {
            return Err(ChainError::BlockValidation(format!(
                "reconstructed merkle root {} does not match header",
                hash_to_hex(&merkle_root)
            )));
        }
        Ok(Block {
            header: self.header,
            transactions,
        })
    }
}
