//! Transaction-level UTXO operations

use std::collections::HashSet;

use tracing::trace;

use crate::coins::{Coin, CoinsMap};
use crate::constants::*;
use crate::error::{ChainError, Result};
use crate::serialize::txid;
use crate::types::*;
use crate::undo::TxUndo;

/// Check if transaction is coinbase
pub fn is_coinbase(tx: &Transaction) -> bool {
    tx.inputs.len() == 1 && tx.inputs[0].prevout.is_null()
}

/// TxSpendCoins: 𝒯𝒳 × 𝒰𝒮 → 𝒰𝒮 × TxUndo
///
/// For transaction tx:
/// 1. If tx is coinbase: return (nothing to spend)
/// 2. For each input i: undo[i] = DeepCopy(us(i.prevout)); us = us \ {i.prevout}
/// 3. Store undo into txundo if provided
///
/// Inputs are presumed present. A missing input leaves the empty sentinel
/// in its undo slot, which disconnect skips.
pub fn tx_spend_coins(tx: &Transaction, coins: &mut CoinsMap, txundo: Option<&mut TxUndo>) {
    if is_coinbase(tx) {
        return;
    }

    let mut undo_coins = Vec::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        let coin = coins.access_coin(&input.prevout);
        undo_coins.push(coin.deep_copy());
        coins.spend_coin(&input.prevout);
    }

    if let Some(txundo) = txundo {
        txundo.set_undo_coins(undo_coins);
    }
}

/// TxAddCoins: 𝒯𝒳 × 𝒰𝒮 × ℕ → 𝒰𝒮
///
/// For transaction tx at height h:
/// us' = us ∪ {(txid, i) ↦ NewFreshCoin(tx.outputs[i], h, coinbase) : i ∈ [0, |tx.outputs|)}
///
/// Coinbase outputs may overwrite (BIP30). For any other transaction a
/// collision with an unspent coin is detected before anything is added,
/// so a failure leaves the map untouched.
pub fn tx_add_coins(tx: &Transaction, coins: &mut CoinsMap, height: i32) -> Result<()> {
    let coinbase = is_coinbase(tx);
    let tx_id = txid(tx);

    if !coinbase {
        for index in 0..tx.outputs.len() as u32 {
            let outpoint = OutPoint::new(tx_id, index);
            if coins.have_coin(&outpoint) {
                return Err(ChainError::UtxoConsistency(format!(
                    "output {} already exists",
                    outpoint
                )));
            }
        }
    }

    for (index, output) in tx.outputs.iter().enumerate() {
        let outpoint = OutPoint::new(tx_id, index as u32);
        let coin = Coin::new_fresh(output.clone(), height, coinbase);
        coins.add_coin(outpoint, coin, coinbase)?;
    }
    trace!(txid = %hash_to_hex(&tx_id), outputs = tx.outputs.len(), height, "Added transaction outputs");
    Ok(())
}

/// CheckTxInputs: 𝒯𝒳 × 𝒰𝒮 × ℕ → ℤ
///
/// Validator pre-check run before `tx_spend_coins`:
/// 1. If tx is coinbase: return 0
/// 2. Every input must reference a distinct unspent coin
/// 3. Coinbase inputs must be at least `coinbase_maturity` blocks deep
/// 4. Σ inputs ≥ Σ outputs, all values within [0, MAX_MONEY]
/// 5. Return fee = Σ inputs - Σ outputs
pub fn check_tx_inputs(
    tx: &Transaction,
    coins: &mut CoinsMap,
    spend_height: i32,
    coinbase_maturity: u32,
) -> Result<i64> {
    if is_coinbase(tx) {
        return Ok(0);
    }
    if tx.inputs.is_empty() {
        return Err(ChainError::TransactionValidation(
            "transaction has no inputs".to_string(),
        ));
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    let mut total_in = 0i64;
    for (i, input) in tx.inputs.iter().enumerate() {
        if !seen.insert(input.prevout) {
            return Err(ChainError::UtxoConsistency(format!(
                "input {} spends coin {} already spent by this transaction",
                i, input.prevout
            )));
        }
        let coin = coins.access_coin(&input.prevout);
        if coin.is_spent() {
            return Err(ChainError::UtxoConsistency(format!(
                "input {} spends missing or spent coin {}",
                i, input.prevout
            )));
        }
        check_coinbase_maturity(&coin, spend_height, coinbase_maturity)?;

        total_in = total_in
            .checked_add(coin.amount())
            .filter(|v| money_range(*v))
            .ok_or_else(|| {
                ChainError::TransactionValidation("input values out of range".to_string())
            })?;
    }

    let total_out = total_output_value(tx)?;
    if total_in < total_out {
        return Err(ChainError::TransactionValidation(format!(
            "insufficient input value: in {} < out {}",
            total_in, total_out
        )));
    }
    Ok(total_in - total_out)
}

/// Coinbase outputs become spendable `coinbase_maturity` blocks after creation.
pub fn check_coinbase_maturity(coin: &Coin, spend_height: i32, coinbase_maturity: u32) -> Result<()> {
    if coin.is_coinbase() && (spend_height as i64 - coin.height() as i64) < coinbase_maturity as i64 {
        return Err(ChainError::TransactionValidation(format!(
            "premature spend of coinbase created at height {} (spend height {})",
            coin.height(),
            spend_height
        )));
    }
    Ok(())
}

/// Σ outputs, each and the total within [0, MAX_MONEY].
pub fn total_output_value(tx: &Transaction) -> Result<i64> {
    let mut total = 0i64;
    for (i, output) in tx.outputs.iter().enumerate() {
        if !money_range(output.value) {
            return Err(ChainError::TransactionValidation(format!(
                "invalid output value {} at index {}",
                output.value, i
            )));
        }
        total += output.value;
        if !money_range(total) {
            return Err(ChainError::TransactionValidation(
                "total output value out of range".to_string(),
            ));
        }
    }
    Ok(total)
}

fn money_range(value: i64) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coinbase(value: i64, tag: u8) -> Transaction {
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

    #[test]
    fn test_is_coinbase() {
        assert!(is_coinbase(&coinbase(50, 0)));
        assert!(!is_coinbase(&spend(OutPoint::new([1; 32], 0), 1)));
    }

    #[test]
    fn test_spend_coinbase_is_noop() {
        let mut coins = CoinsMap::new();
        let mut undo = TxUndo::new();
        tx_spend_coins(&coinbase(50, 0), &mut coins, Some(&mut undo));
        assert!(undo.is_empty());
        assert!(coins.is_empty());
    }

    #[test]
    fn test_add_then_spend_records_undo() {
        let mut coins = CoinsMap::new();
        let cb = coinbase(50, 0);
        tx_add_coins(&cb, &mut coins, 10).unwrap();

        let tx = spend(OutPoint::new(txid(&cb), 0), 49);
        let mut undo = TxUndo::new();
        tx_spend_coins(&tx, &mut coins, Some(&mut undo));

        assert_eq!(undo.len(), 1);
        assert_eq!(undo.coins()[0].amount(), 50);
        assert_eq!(undo.coins()[0].height(), 10);
        assert!(!coins.have_coin(&OutPoint::new(txid(&cb), 0)));
    }

    #[test]
    fn test_spend_missing_input_yields_sentinel() {
        let mut coins = CoinsMap::new();
        let mut undo = TxUndo::new();
        tx_spend_coins(&spend(OutPoint::new([3; 32], 0), 1), &mut coins, Some(&mut undo));
        assert!(undo.coins()[0].is_spent());
    }

    #[test]
    fn test_add_coins_collision_leaves_map_untouched() {
        let mut coins = CoinsMap::new();
        let tx = Transaction {
            outputs: vec![
                TransactionOutput { value: 1, script_pubkey: vec![] },
                TransactionOutput { value: 2, script_pubkey: vec![] },
            ],
            ..spend(OutPoint::new([1; 32], 0), 0)
        };
        let id = txid(&tx);
        coins
            .add_coin(OutPoint::new(id, 1), Coin::new_fresh(tx.outputs[1].clone(), 1, false), false)
            .unwrap();

        assert!(tx_add_coins(&tx, &mut coins, 2).is_err());
        assert!(!coins.have_coin(&OutPoint::new(id, 0)));
    }

    #[test]
    fn test_coinbase_may_overwrite() {
        let mut coins = CoinsMap::new();
        let cb = coinbase(50, 0);
        tx_add_coins(&cb, &mut coins, 1).unwrap();
        tx_add_coins(&cb, &mut coins, 2).unwrap();
        assert_eq!(coins.access_coin(&OutPoint::new(txid(&cb), 0)).height(), 2);
    }

    #[test]
    fn test_check_tx_inputs_fee() {
        let mut coins = CoinsMap::new();
        let cb = coinbase(50, 0);
        tx_add_coins(&cb, &mut coins, 1).unwrap();
        let tx = spend(OutPoint::new(txid(&cb), 0), 45);
        assert_eq!(check_tx_inputs(&tx, &mut coins, 101, COINBASE_MATURITY).unwrap(), 5);
    }

    #[test]
    fn test_check_tx_inputs_immature_coinbase() {
        let mut coins = CoinsMap::new();
        let cb = coinbase(50, 0);
        tx_add_coins(&cb, &mut coins, 1).unwrap();
        let tx = spend(OutPoint::new(txid(&cb), 0), 45);
        assert!(matches!(
            check_tx_inputs(&tx, &mut coins, 100, COINBASE_MATURITY),
            Err(ChainError::TransactionValidation(_))
        ));
    }

    #[test]
    fn test_check_tx_inputs_missing() {
        let mut coins = CoinsMap::new();
        let tx = spend(OutPoint::new([8; 32], 0), 1);
        assert!(matches!(
            check_tx_inputs(&tx, &mut coins, 1, COINBASE_MATURITY),
            Err(ChainError::UtxoConsistency(_))
        ));
    }

    #[test]
    fn test_check_tx_inputs_overspend() {
        let mut coins = CoinsMap::new();
        let cb = coinbase(50, 0);
        tx_add_coins(&cb, &mut coins, 1).unwrap();
        let tx = spend(OutPoint::new(txid(&cb), 0), 51);
        assert!(check_tx_inputs(&tx, &mut coins, 200, COINBASE_MATURITY).is_err());
    }

    #[test]
    fn test_check_tx_inputs_duplicate_prevout() {
        let mut coins = CoinsMap::new();
        let cb = coinbase(50, 0);
        tx_add_coins(&cb, &mut coins, 1).unwrap();
        let mut tx = spend(OutPoint::new(txid(&cb), 0), 100);
        tx.inputs.push(tx.inputs[0].clone());
        assert!(matches!(
            check_tx_inputs(&tx, &mut coins, 200, COINBASE_MATURITY),
            Err(ChainError::UtxoConsistency(_))
        ));
        assert!(coins.have_coin(&OutPoint::new(txid(&cb), 0)));
    }

    #[test]
    fn test_total_output_value_rejects_negative() {
        let tx = spend(OutPoint::new([1; 32], 0), -1);
        assert!(total_output_value(&tx).is_err());
    }
}
