//! Chain state owner: block tree, active chain, UTXO set and event emission
//!
//! One mutex serializes every chain mutation. Events produced by a mutation
//! are queued under that lock with a ticket and delivered after it is
//! released, strictly in ticket order, so subscribers see a linearized
//! stream and may read chain state from their callbacks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::block::{check_block_structure, compute_merkle_root, connect_block, disconnect_block, DisconnectResult};
use crate::coins::{Coin, CoinStore, CoinsMap};
use crate::config::ChainConfig;
use crate::error::{ChainError, Result};
use crate::notification::{ChainNotifier, Notification, TipUpdatedEvent};
use crate::pow::block_proof;
use crate::compact_block::CompactBlock;
use crate::serialize::{block_hash, block_size};
use crate::types::*;
use crate::undo::BlockUndo;

/// Validation state of a block known to the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    Valid,
    /// Failed to connect, or descends from a block that did.
    Invalid,
}

/// BlockIndex: a node of the block tree.
///
/// The parent is referenced by hash; the tree owns every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndex {
    pub hash: Hash,
    pub prev: Option<Hash>,
    pub height: i32,
    /// Σ block_proof over the block and all its ancestors.
    pub chain_work: u128,
    pub header: BlockHeader,
    pub status: BlockStatus,
}

/// Arena of block index nodes keyed by block hash.
#[derive(Debug, Default)]
pub struct BlockTree {
    nodes: HashMap<Hash, BlockIndex>,
}

impl BlockTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: BlockIndex) {
        self.nodes.insert(index.hash, index);
    }

    pub fn get(&self, hash: &Hash) -> Option<&BlockIndex> {
        self.nodes.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn parent(&self, index: &BlockIndex) -> Option<&BlockIndex> {
        index.prev.as_ref().and_then(|prev| self.nodes.get(prev))
    }

    /// Ancestor of `hash` at `height`, walking parent links.
    pub fn ancestor(&self, hash: &Hash, height: i32) -> Option<&BlockIndex> {
        let mut current = self.nodes.get(hash)?;
        if height < 0 || height > current.height {
            return None;
        }
        while current.height > height {
            current = self.parent(current)?;
        }
        Some(current)
    }

    /// Last common ancestor of two blocks.
    pub fn find_fork(&self, a: &Hash, b: &Hash) -> Option<&BlockIndex> {
        let a = self.nodes.get(a)?;
        let b = self.nodes.get(b)?;
        let height = a.height.min(b.height);
        let mut a = self.ancestor(&a.hash, height)?;
        let mut b = self.ancestor(&b.hash, height)?;
        while a.hash != b.hash {
            a = self.parent(a)?;
            b = self.parent(b)?;
        }
        Some(a)
    }

    /// Mark `hash` and every known descendant invalid. Returns how many
    /// nodes were marked.
    fn invalidate(&mut self, hash: &Hash) -> usize {
        let Some(height) = self.nodes.get(hash).map(|root| root.height) else {
            return 0;
        };
        let doomed: Vec<Hash> = self
            .nodes
            .values()
            .filter(|node| node.height >= height)
            .filter(|node| self.ancestor(&node.hash, height).map(|a| a.hash) == Some(*hash))
            .map(|node| node.hash)
            .collect();
        for hash in &doomed {
            if let Some(index) = self.nodes.get_mut(hash) {
                index.status = BlockStatus::Invalid;
            }
        }
        doomed.len()
    }
}

struct ChainInner {
    tree: BlockTree,
    /// Active chain, `active[h]` is the block at height h.
    active: Vec<Hash>,
    coins: CoinsMap,
    blocks: HashMap<Hash, Arc<Block>>,
    undo: HashMap<Hash, BlockUndo>,
    initial_download: bool,
    next_ticket: u64,
}

impl ChainInner {
    fn tip(&self) -> Result<&BlockIndex> {
        self.active
            .last()
            .and_then(|hash| self.tree.get(hash))
            .ok_or_else(|| ChainError::UnknownBlock("active chain has no tip".to_string()))
    }

    fn block(&self, hash: &Hash) -> Result<Arc<Block>> {
        self.blocks
            .get(hash)
            .cloned()
            .ok_or_else(|| ChainError::UnknownBlock(hash_to_hex(hash)))
    }
}

/// The chain state: explicitly constructed, shared by handle.
pub struct ChainState {
    config: ChainConfig,
    notifier: ChainNotifier,
    inner: Mutex<ChainInner>,
    serving: Mutex<u64>,
    turn: Condvar,
}

impl std::fmt::Debug for ChainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ChainState")
            .field("height", &(inner.active.len() as i64 - 1))
            .field("blocks", &inner.tree.len())
            .field("coins", &inner.coins)
            .finish()
    }
}

impl ChainState {
    /// Start a chain at `genesis`. Genesis outputs are not spendable and are
    /// not added to the UTXO set.
    pub fn new(config: ChainConfig, genesis: Block, backend: Option<Arc<dyn CoinStore>>) -> Result<Self> {
        check_block_structure(&genesis)?;
        let hash = block_hash(&genesis.header);
        let index = BlockIndex {
            hash,
            prev: None,
            height: 0,
            chain_work: block_proof(genesis.header.bits)?,
            header: genesis.header,
            status: BlockStatus::Valid,
        };

        let coins = match backend {
            Some(backend) => CoinsMap::with_backend(backend),
            None => CoinsMap::new(),
        };
        let initial_download = !tip_is_recent(&genesis.header, config.max_tip_age_secs);

        let mut tree = BlockTree::new();
        tree.insert(index);
        let mut blocks = HashMap::new();
        blocks.insert(hash, Arc::new(genesis));

        info!(genesis = %hash_to_hex(&hash), "Initialized chain state");
        Ok(Self {
            config,
            notifier: ChainNotifier::new(),
            inner: Mutex::new(ChainInner {
                tree,
                active: vec![hash],
                coins,
                blocks,
                undo: HashMap::new(),
                initial_download,
                next_ticket: 0,
            }),
            serving: Mutex::new(0),
            turn: Condvar::new(),
        })
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn notifier(&self) -> &ChainNotifier {
        &self.notifier
    }

    /// ProcessBlock: accept a block into the tree and activate the chain
    /// with the most work.
    ///
    /// Emits `BlockAccepted`, then for a tip change `BlockDisconnected` for
    /// each block leaving the active chain, `BlockConnected` for each block
    /// joining it and finally `ChainTipUpdated`. If a block of the new
    /// branch fails to connect it is marked invalid, the previous chain is
    /// restored and the error returned; the events of the attempt are still
    /// delivered.
    ///
    /// Returns true when the block became the new tip.
    pub fn process_block(&self, block: Block) -> Result<bool> {
        let mut events = Vec::new();
        let (ticket, result) = {
            let mut inner = self.inner.lock();
            let result = self.accept_block(&mut inner, block, &mut events);
            let ticket = if events.is_empty() {
                None
            } else {
                let ticket = inner.next_ticket;
                inner.next_ticket += 1;
                Some(ticket)
            };
            (ticket, result)
        };

        if let Some(ticket) = ticket {
            self.deliver(ticket, events);
        }
        result
    }

    /// Deliver one mutation's events once every earlier ticket is served.
    fn deliver(&self, ticket: u64, events: Vec<Notification>) {
        let mut serving = self.serving.lock();
        while *serving != ticket {
            self.turn.wait(&mut serving);
        }
        drop(serving);

        for event in events {
            self.notifier.send_notification(event);
        }

        *self.serving.lock() += 1;
        self.turn.notify_all();
    }

    fn accept_block(&self, inner: &mut ChainInner, block: Block, events: &mut Vec<Notification>) -> Result<bool> {
        check_block_structure(&block)?;
        if compute_merkle_root(&block.transactions)? != block.header.merkle_root {
            return Err(ChainError::BlockValidation("merkle root mismatch".to_string()));
        }
        let size = block_size(&block);
        if size > self.config.max_block_size {
            return Err(ChainError::BlockValidation(format!(
                "block size {} exceeds maximum {}",
                size, self.config.max_block_size
            )));
        }

        let hash = block_hash(&block.header);
        if inner.tree.contains(&hash) {
            return Err(ChainError::BlockValidation(format!(
                "block {} already known",
                hash_to_hex(&hash)
            )));
        }
        let parent = inner
            .tree
            .get(&block.header.prev_block_hash)
            .ok_or_else(|| {
                ChainError::UnknownBlock(format!(
                    "parent {} of block {}",
                    hash_to_hex(&block.header.prev_block_hash),
                    hash_to_hex(&hash)
                ))
            })?;
        if parent.status == BlockStatus::Invalid {
            return Err(ChainError::BlockValidation(format!(
                "block {} descends from an invalid block",
                hash_to_hex(&hash)
            )));
        }

        let index = BlockIndex {
            hash,
            prev: Some(parent.hash),
            height: parent.height + 1,
            chain_work: parent.chain_work.saturating_add(block_proof(block.header.bits)?),
            header: block.header,
            status: BlockStatus::Valid,
        };
        let block = Arc::new(block);
        inner.tree.insert(index.clone());
        inner.blocks.insert(hash, block.clone());
        events.push(Notification::BlockAccepted(block));

        if index.chain_work <= inner.tip()?.chain_work {
            debug!(block = %hash_to_hex(&hash), height = index.height, "Accepted block on side branch");
            return Ok(false);
        }

        self.activate_branch(inner, &index, events)?;
        Ok(true)
    }

    /// Make `new_tip` the tip: disconnect to the fork point, connect the branch.
    fn activate_branch(
        &self,
        inner: &mut ChainInner,
        new_tip: &BlockIndex,
        events: &mut Vec<Notification>,
    ) -> Result<()> {
        let old_tip = inner.tip()?.hash;
        let fork = inner
            .tree
            .find_fork(&old_tip, &new_tip.hash)
            .cloned()
            .ok_or_else(|| ChainError::UnknownBlock("no common ancestor with active chain".to_string()))?;

        let mut branch = Vec::new();
        let mut cursor = new_tip.clone();
        while cursor.hash != fork.hash {
            branch.push(cursor.hash);
            cursor = inner
                .tree
                .parent(&cursor)
                .cloned()
                .ok_or_else(|| ChainError::UnknownBlock(hash_to_hex(&cursor.hash)))?;
        }
        branch.reverse();

        let detached = self.disconnect_to(inner, fork.height, events)?;

        for hash in &branch {
            if let Err(err) = self.connect_tip(inner, hash, events) {
                let invalidated = inner.tree.invalidate(hash);
                warn!(
                    block = %hash_to_hex(hash),
                    %err,
                    invalidated,
                    "Block failed to connect, restoring previous chain"
                );
                self.disconnect_to(inner, fork.height, events)?;
                for hash in &detached {
                    self.connect_tip(inner, hash, events)?;
                }
                return Err(err);
            }
        }

        if !detached.is_empty() {
            info!(
                depth = detached.len(),
                fork = %hash_to_hex(&fork.hash),
                "Chain reorganization"
            );
        }

        if inner.initial_download && tip_is_recent(&new_tip.header, self.config.max_tip_age_secs) {
            inner.initial_download = false;
            info!(height = new_tip.height, "Leaving initial block download");
        }

        info!(
            tip = %hash_to_hex(&new_tip.hash),
            height = new_tip.height,
            "Updated chain tip"
        );
        events.push(Notification::ChainTipUpdated(TipUpdatedEvent {
            tip: new_tip.clone(),
            fork: Some(fork),
            is_initial_download: inner.initial_download,
        }));
        Ok(())
    }

    /// Disconnect active blocks above `height`; returns them lowest first.
    fn disconnect_to(
        &self,
        inner: &mut ChainInner,
        height: i32,
        events: &mut Vec<Notification>,
    ) -> Result<Vec<Hash>> {
        let mut detached = Vec::new();
        while inner.active.len() as i64 - 1 > height as i64 {
            let hash = inner.tip()?.hash;
            let block = inner.block(&hash)?;
            let undo = inner
                .undo
                .remove(&hash)
                .ok_or_else(|| ChainError::UtxoConsistency(format!("no undo data for {}", hash_to_hex(&hash))))?;

            if disconnect_block(&block, &undo, &mut inner.coins)? == DisconnectResult::Unclean {
                warn!(block = %hash_to_hex(&hash), "Disconnected block left the UTXO set unclean");
            }
            inner.active.pop();
            detached.push(hash);
            events.push(Notification::BlockDisconnected(block));
        }
        detached.reverse();
        Ok(detached)
    }

    /// Connect a child of the current tip.
    fn connect_tip(&self, inner: &mut ChainInner, hash: &Hash, events: &mut Vec<Notification>) -> Result<()> {
        let block = inner.block(hash)?;
        let height = inner.active.len() as i32;
        let undo = connect_block(&block, &mut inner.coins, height, self.config.coinbase_maturity)?;
        inner.undo.insert(*hash, undo);
        inner.active.push(*hash);
        events.push(Notification::BlockConnected(block));
        Ok(())
    }

    /// Announce a stored block as a `cmpctblock` payload at the configured
    /// protocol version.
    pub fn compact_block_message(&self, hash: &Hash) -> Result<Vec<u8>> {
        let block = self
            .block(hash)
            .ok_or_else(|| ChainError::UnknownBlock(hash_to_hex(hash)))?;
        CompactBlock::from_block_random(&block)?.to_bytes(self.config.protocol_version)
    }

    /// Decode a peer's `cmpctblock` payload at the configured protocol
    /// version, bounded by the configured maximum block size.
    pub fn read_compact_block(&self, payload: &[u8]) -> Result<CompactBlock> {
        let compact = CompactBlock::from_bytes(payload, self.config.protocol_version)?;
        let limit = compact.max_payload_length(self.config.max_block_size);
        if payload.len() as u64 > limit {
            return Err(ChainError::Decode(format!(
                "cmpctblock payload of {} bytes exceeds {}",
                payload.len(),
                limit
            )));
        }
        Ok(compact)
    }

    pub fn tip(&self) -> Result<BlockIndex> {
        self.inner.lock().tip().cloned()
    }

    pub fn height(&self) -> i32 {
        self.inner.lock().active.len() as i32 - 1
    }

    /// Hash of the active block at `height`.
    pub fn block_hash_at(&self, height: i32) -> Option<Hash> {
        let index = usize::try_from(height).ok()?;
        self.inner.lock().active.get(index).copied()
    }

    /// Unspent coin at `outpoint` in the active chain's UTXO set.
    pub fn coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        let mut inner = self.inner.lock();
        inner
            .coins
            .fetch_coin(outpoint)
            .filter(|coin| !coin.is_spent())
            .cloned()
    }

    pub fn block_index(&self, hash: &Hash) -> Option<BlockIndex> {
        self.inner.lock().tree.get(hash).cloned()
    }

    pub fn block(&self, hash: &Hash) -> Option<Arc<Block>> {
        self.inner.lock().blocks.get(hash).cloned()
    }

    /// Undo data of an active block.
    pub fn block_undo(&self, hash: &Hash) -> Option<BlockUndo> {
        self.inner.lock().undo.get(hash).cloned()
    }

    pub fn is_initial_download(&self) -> bool {
        self.inner.lock().initial_download
    }

    /// Write the UTXO cache to its backing store.
    pub fn flush(&self) -> Result<usize> {
        self.inner.lock().coins.flush()
    }
}

fn tip_is_recent(header: &BlockHeader, max_age_secs: u64) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    now.saturating_sub(header.timestamp as u64) <= max_age_secs
}
