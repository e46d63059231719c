//! Block application against the UTXO set: connect with undo, disconnect by undo

use tracing::{debug, warn};

use crate::coins::CoinsMap;
use crate::error::{ChainError, Result};
use crate::hashes::sha256d;
use crate::serialize::{block_hash, txid};
use crate::transaction::{check_tx_inputs, is_coinbase, tx_add_coins, tx_spend_coins, total_output_value};
use crate::types::*;
use crate::undo::{BlockUndo, TxUndo};

/// Outcome of reversing a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectResult {
    /// Every output and input matched the undo data.
    Clean,
    /// The UTXO set did not match the undo data; it was repaired best-effort.
    Unclean,
}

/// Structural checks a block must pass before touching the UTXO set.
pub fn check_block_structure(block: &Block) -> Result<()> {
    let Some(first) = block.transactions.first() else {
        return Err(ChainError::BlockValidation(
            "block must have at least one transaction".to_string(),
        ));
    };
    if !is_coinbase(first) {
        return Err(ChainError::BlockValidation(
            "first transaction must be coinbase".to_string(),
        ));
    }
    if let Some(i) = block.transactions.iter().skip(1).position(is_coinbase) {
        return Err(ChainError::BlockValidation(format!(
            "unexpected coinbase at index {}",
            i + 1
        )));
    }
    Ok(())
}

/// ConnectBlock: ℬ × 𝒰𝒮 × ℕ → 𝒰𝒮 × BlockUndo
///
/// For block b = (h, txs) at height height:
/// 1. Check b is non-empty with exactly one coinbase, in first position
/// 2. For each tx ∈ txs in order:
///    - Pre-check inputs against us (unspent, mature, value range)
///    - TxSpendCoins(tx, us, undo) then TxAddCoins(tx, us, height)
/// 3. Coinbase output ≤ subsidy + fees is left to the validator
/// 4. On any failure, replay collected undo in reverse and return the error
///
/// Later transactions see the outputs of earlier ones in the same block.
pub fn connect_block(
    block: &Block,
    coins: &mut CoinsMap,
    height: i32,
    coinbase_maturity: u32,
) -> Result<BlockUndo> {
    check_block_structure(block)?;

    let mut undo = BlockUndo::new();
    for (i, tx) in block.transactions.iter().enumerate() {
        if let Err(err) = apply_transaction(tx, coins, height, coinbase_maturity, &mut undo) {
            warn!(
                block = %hash_to_hex(&block_hash(&block.header)),
                tx_index = i,
                %err,
                "Block application failed, rolling back"
            );
            rollback(&block.transactions[..i], &undo, coins);
            return Err(err);
        }
    }

    debug!(
        block = %hash_to_hex(&block_hash(&block.header)),
        height,
        txs = block.transactions.len(),
        "Connected block to UTXO set"
    );
    Ok(undo)
}

fn apply_transaction(
    tx: &Transaction,
    coins: &mut CoinsMap,
    height: i32,
    coinbase_maturity: u32,
    undo: &mut BlockUndo,
) -> Result<()> {
    if is_coinbase(tx) {
        total_output_value(tx)?;
        return tx_add_coins(tx, coins, height);
    }

    check_tx_inputs(tx, coins, height, coinbase_maturity)?;

    let mut tx_undo = TxUndo::new();
    tx_spend_coins(tx, coins, Some(&mut tx_undo));
    if let Err(err) = tx_add_coins(tx, coins, height) {
        restore_inputs(tx, &tx_undo, coins);
        return Err(err);
    }
    undo.push(tx_undo);
    Ok(())
}

/// Reverse the already-applied prefix of a block.
fn rollback(applied: &[Transaction], undo: &BlockUndo, coins: &mut CoinsMap) {
    let mut tx_undo = undo.tx_undo().iter().rev();
    for tx in applied.iter().rev() {
        remove_outputs(tx, coins);
        if !is_coinbase(tx) {
            if let Some(record) = tx_undo.next() {
                restore_inputs(tx, record, coins);
            }
        }
    }
}

/// Remove a transaction's outputs; false if any was missing or altered.
fn remove_outputs(tx: &Transaction, coins: &mut CoinsMap) -> bool {
    let tx_id = txid(tx);
    let mut clean = true;
    for (index, output) in tx.outputs.iter().enumerate() {
        let outpoint = OutPoint::new(tx_id, index as u32);
        match coins.spend_coin(&outpoint) {
            Some(coin) if coin.output() == output => {}
            _ => clean = false,
        }
    }
    clean
}

/// Re-insert the coins a transaction spent; sentinel entries are skipped.
fn restore_inputs(tx: &Transaction, undo: &TxUndo, coins: &mut CoinsMap) -> bool {
    let mut clean = true;
    for (input, coin) in tx.inputs.iter().zip(undo.coins()).rev() {
        if coin.is_spent() {
            clean = false;
            continue;
        }
        let overwrite = coins.have_coin(&input.prevout);
        if overwrite {
            clean = false;
        }
        if coins.add_coin(input.prevout, coin.deep_copy(), overwrite).is_err() {
            clean = false;
        }
    }
    clean
}

/// DisconnectBlock: ℬ × BlockUndo × 𝒰𝒮 → 𝒰𝒮
///
/// For transactions in reverse block order:
/// 1. Remove every output the transaction created
/// 2. Re-insert the coins recorded in its undo (skipping empty sentinels)
pub fn disconnect_block(block: &Block, undo: &BlockUndo, coins: &mut CoinsMap) -> Result<DisconnectResult> {
    check_block_structure(block)?;

    let spending = block.transactions.len() - 1;
    if undo.len() != spending {
        return Err(ChainError::UtxoConsistency(format!(
            "undo has {} records for {} non-coinbase transactions",
            undo.len(),
            spending
        )));
    }
    for (tx, record) in block.transactions[1..].iter().zip(undo.tx_undo()) {
        if record.len() != tx.inputs.len() {
            return Err(ChainError::UtxoConsistency(format!(
                "undo has {} coins for transaction {} with {} inputs",
                record.len(),
                hash_to_hex(&txid(tx)),
                tx.inputs.len()
            )));
        }
    }

    let mut clean = true;
    for (i, tx) in block.transactions.iter().enumerate().rev() {
        clean &= remove_outputs(tx, coins);
        if i > 0 {
            clean &= restore_inputs(tx, &undo.tx_undo()[i - 1], coins);
        }
    }

    let hash = block_hash(&block.header);
    if clean {
        debug!(block = %hash_to_hex(&hash), "Disconnected block from UTXO set");
        Ok(DisconnectResult::Clean)
    } else {
        warn!(block = %hash_to_hex(&hash), "Disconnected block with inconsistent UTXO set");
        Ok(DisconnectResult::Unclean)
    }
}

/// Merkle root of the transaction IDs, duplicating the last hash on odd levels.
pub fn compute_merkle_root(transactions: &[Transaction]) -> Result<Hash> {
    if transactions.is_empty() {
        return Err(ChainError::BlockValidation(
            "cannot compute merkle root of empty block".to_string(),
        ));
    }

    let mut level: Vec<Hash> = transactions.iter().map(txid).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            let mut combined = [0u8; 64];
            combined[..32].copy_from_slice(&pair[0]);
            combined[32..].copy_from_slice(right);
            next.push(sha256d(&combined));
        }
        level = next;
    }
    Ok(level[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SEQUENCE_FINAL;

    fn coinbase(tag: u8, value: i64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint::null(),
                script_sig: vec![tag],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TransactionOutput {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn spend(prevout: OutPoint, value: i64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout,
                script_sig: vec![],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TransactionOutput {
                value,
                script_pubkey: vec![0x52],
            }],
            lock_time: 0,
        }
    }

    fn block(transactions: Vec<Transaction>) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: [0; 32],
                merkle_root: compute_merkle_root(&transactions).unwrap_or([0; 32]),
                timestamp: 1_600_000_000,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions,
        }
    }

    #[test]
    fn test_connect_rejects_empty_block() {
        let mut coins = CoinsMap::new();
        assert!(matches!(
            connect_block(&block(vec![]), &mut coins, 1, 0),
            Err(ChainError::BlockValidation(_))
        ));
    }

    #[test]
    fn test_connect_rejects_missing_coinbase() {
        let mut coins = CoinsMap::new();
        let b = block(vec![spend(OutPoint::new([1; 32], 0), 1)]);
        assert!(connect_block(&b, &mut coins, 1, 0).is_err());
    }

    #[test]
    fn test_connect_and_disconnect_restore_state() {
        let mut coins = CoinsMap::new();
        let genesis_cb = coinbase(0, 50);
        connect_block(&block(vec![genesis_cb.clone()]), &mut coins, 1, 0).unwrap();
        let mut before: Vec<(OutPoint, i64)> = coins.unspent().map(|(o, c)| (*o, c.amount())).collect();
        before.sort();

        let pay = spend(OutPoint::new(txid(&genesis_cb), 0), 40);
        let chained = spend(OutPoint::new(txid(&pay), 0), 30);
        let b = block(vec![coinbase(1, 50), pay, chained.clone()]);

        let snapshot_len = coins.len();
        let undo = connect_block(&b, &mut coins, 2, 0).unwrap();
        assert_eq!(undo.len(), 2);
        assert!(coins.have_coin(&OutPoint::new(txid(&chained), 0)));

        assert_eq!(disconnect_block(&b, &undo, &mut coins).unwrap(), DisconnectResult::Clean);
        let mut after: Vec<(OutPoint, i64)> = coins.unspent().map(|(o, c)| (*o, c.amount())).collect();
        after.sort();
        assert_eq!(before, after);
        assert_eq!(coins.len(), snapshot_len);
    }

    #[test]
    fn test_failed_connect_rolls_back() {
        let mut coins = CoinsMap::new();
        let cb0 = coinbase(0, 50);
        connect_block(&block(vec![cb0.clone()]), &mut coins, 1, 0).unwrap();

        let mut reference = CoinsMap::new();
        connect_block(&block(vec![cb0.clone()]), &mut reference, 1, 0).unwrap();

        let pay = spend(OutPoint::new(txid(&cb0), 0), 40);
        let double = spend(OutPoint::new(txid(&cb0), 0), 39);
        let b = block(vec![coinbase(1, 50), pay, double]);

        let err = connect_block(&b, &mut coins, 2, 0).unwrap_err();
        assert!(matches!(err, ChainError::UtxoConsistency(_)));
        assert_eq!(coins, reference);
    }

    #[test]
    fn test_disconnect_rejects_mismatched_undo() {
        let mut coins = CoinsMap::new();
        let b = block(vec![coinbase(0, 50), spend(OutPoint::new([4; 32], 0), 1)]);
        assert!(disconnect_block(&b, &BlockUndo::new(), &mut coins).is_err());
    }

    #[test]
    fn test_disconnect_skips_sentinel_undo() {
        let mut coins = CoinsMap::new();
        let tx = spend(OutPoint::new([4; 32], 0), 1);
        let b = block(vec![coinbase(0, 50), tx.clone()]);

        let mut record = TxUndo::new();
        tx_spend_coins(&tx, &mut coins, Some(&mut record));
        tx_add_coins(&tx, &mut coins, 1).unwrap();
        let mut undo = BlockUndo::new();
        undo.push(record);

        let result = disconnect_block(&b, &undo, &mut coins).unwrap();
        assert_eq!(result, DisconnectResult::Unclean);
        assert!(!coins.have_coin(&OutPoint::new([4; 32], 0)));
    }

    #[test]
    fn test_merkle_root_single_tx_is_txid() {
        let cb = coinbase(0, 50);
        assert_eq!(compute_merkle_root(&[cb.clone()]).unwrap(), txid(&cb));
    }

    #[test]
    fn test_merkle_root_odd_level_duplicates_last() {
        let txs = vec![coinbase(0, 1), coinbase(1, 1), coinbase(2, 1)];
        let four = vec![txs[0].clone(), txs[1].clone(), txs[2].clone(), txs[2].clone()];
        assert_eq!(
            compute_merkle_root(&txs).unwrap(),
            compute_merkle_root(&four).unwrap()
        );
    }
}
