//! Undo records: the coins a block consumed, kept to reverse it exactly

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::coins::Coin;
use crate::error::{ChainError, Result};
use crate::serialize::{prealloc, read_length, write_varint, Decodable, Encodable};

/// TxUndo: coins matching 1:1 the inputs of one transaction.
///
/// Entries are deep copies taken before the inputs were spent. An entry
/// may be the empty sentinel if the caller spent an absent outpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxUndo {
    coins: Vec<Coin>,
}

impl TxUndo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_undo_coins(&mut self, coins: Vec<Coin>) {
        self.coins = coins;
    }

    pub fn coins(&self) -> &[Coin] {
        &self.coins
    }

    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }
}

/// BlockUndo: one `TxUndo` per non-coinbase transaction, in block order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    tx_undo: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, undo: TxUndo) {
        self.tx_undo.push(undo);
    }

    pub fn tx_undo(&self) -> &[TxUndo] {
        &self.tx_undo
    }

    pub fn len(&self) -> usize {
        self.tx_undo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx_undo.is_empty()
    }
}

/// Undo files carry no spent sentinels; a sentinel entry is rejected.
impl Encodable for TxUndo {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize> {
        let mut len = write_varint(writer, self.coins.len() as u64)?;
        for coin in &self.coins {
            len += coin.consensus_encode(writer)?;
        }
        Ok(len)
    }
}

impl Decodable for TxUndo {
    fn consensus_decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let count = read_length(reader)?;
        let mut coins = Vec::with_capacity(prealloc(count));
        for _ in 0..count {
            coins.push(Coin::consensus_decode(reader)?);
        }
        Ok(TxUndo { coins })
    }
}

impl Encodable for BlockUndo {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize> {
        let mut len = write_varint(writer, self.tx_undo.len() as u64)?;
        for undo in &self.tx_undo {
            len += undo.consensus_encode(writer)?;
        }
        Ok(len)
    }
}

impl Decodable for BlockUndo {
    fn consensus_decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let count = read_length(reader)?;
        let mut tx_undo = Vec::with_capacity(prealloc(count));
        for _ in 0..count {
            tx_undo.push(TxUndo::consensus_decode(reader)?);
        }
        if tx_undo.iter().any(|undo| undo.is_empty()) {
            return Err(ChainError::Decode(
                "transaction undo record without coins".to_string(),
            ));
        }
        Ok(BlockUndo { tx_undo })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{deserialize, serialize};
    use crate::types::TransactionOutput;

    fn coin(value: i64, height: i32, coinbase: bool) -> Coin {
        Coin::new_stored(
            TransactionOutput {
                value,
                script_pubkey: vec![0xac],
            },
            height,
            coinbase,
        )
    }

    #[test]
    fn test_block_undo_encoding() {
        let mut first = TxUndo::new();
        first.set_undo_coins(vec![coin(50, 10, true), coin(3, 4, false)]);
        let mut second = TxUndo::new();
        second.set_undo_coins(vec![coin(1, 2, false)]);

        let mut undo = BlockUndo::new();
        undo.push(first);
        undo.push(second);

        let bytes = serialize(&undo).unwrap();
        let decoded: BlockUndo = deserialize(&bytes).unwrap();
        assert_eq!(decoded, undo);
        assert_eq!(decoded.tx_undo()[0].coins()[0].height(), 10);
        assert!(decoded.tx_undo()[0].coins()[0].is_coinbase());
    }

    #[test]
    fn test_sentinel_entry_not_persisted() {
        let mut undo = TxUndo::new();
        undo.set_undo_coins(vec![Coin::empty()]);
        assert!(serialize(&undo).is_err());
    }

    #[test]
    fn test_empty_tx_undo_rejected_on_decode() {
        // one tx undo record with zero coins
        let bytes = [0x01, 0x00];
        assert!(deserialize::<BlockUndo>(&bytes).is_err());
    }
}
