//! # Chainstate-Core
//!
//! Chain state core of a Bitcoin Cash full node: the UTXO set and its
//! transaction-level operations, undo records, the chain notifier, the key
//! store and the BIP152 compact-block codec.
//!
//! ## Architecture
//!
//! The crate follows a layered architecture:
//! - Primitives (hashes, canonical serialization, proof of work)
//! - UTXO set (`CoinsMap` over an optional `CoinStore`)
//! - Transaction and block application with undo
//! - Chain state owner (block tree, active chain, notifications)
//! - Peer-facing codecs (compact blocks)
//!
//! ## Design Principles
//!
//! 1. **Exact Reversal**: connecting a block then disconnecting it with its
//!    undo data leaves the UTXO set identical
//! 2. **Bit-Exact Wire Formats**: compact blocks match BIP152 byte for byte
//! 3. **Exact Version Pinning**: consensus-critical cryptography is pinned
//! 4. **Explicit Ownership**: the chain state is a constructed value passed
//!    by handle, never a process-wide singleton
//!
//! ## Usage
//!
//! ```rust
//! use chainstate_core::coins::CoinsMap;
//! use chainstate_core::serialize::txid;
//! use chainstate_core::transaction::{tx_add_coins, tx_spend_coins};
//! use chainstate_core::undo::TxUndo;
//! use chainstate_core::types::*;
//!
//! let coinbase = Transaction {
//!     version: 1,
//!     inputs: vec![TransactionInput {
//!         prevout: OutPoint::null(),
//!         script_sig: vec![0x01],
//!         sequence: 0xffffffff,
//!     }],
//!     outputs: vec![TransactionOutput { value: 50, script_pubkey: vec![0x51] }],
//!     lock_time: 0,
//! };
//!
//! let mut coins = CoinsMap::new();
//! tx_add_coins(&coinbase, &mut coins, 10).unwrap();
//!
//! let spend = Transaction {
//!     version: 1,
//!     inputs: vec![TransactionInput {
//!         prevout: OutPoint::new(txid(&coinbase), 0),
//!         script_sig: vec![],
//!         sequence: 0xffffffff,
//!     }],
//!     outputs: vec![TransactionOutput { value: 49, script_pubkey: vec![0x51] }],
//!     lock_time: 0,
//! };
//! let mut undo = TxUndo::new();
//! tx_spend_coins(&spend, &mut coins, Some(&mut undo));
//! tx_add_coins(&spend, &mut coins, 11).unwrap();
//!
//! assert_eq!(undo.coins()[0].height(), 10);
//! assert_eq!(coins.access_coin(&OutPoint::new(txid(&spend), 0)).amount(), 49);
//! ```

pub mod types;
pub mod constants;
pub mod error;
pub mod config;
pub mod hashes;
pub mod serialize;
pub mod pow;
pub mod keystore;
pub mod coins;
pub mod undo;
pub mod transaction;
pub mod block;
pub mod notification;
pub mod compact_block;
pub mod chain;

// Re-export commonly used types
pub use types::*;
pub use constants::*;
pub use error::{ChainError, Result};
pub use config::ChainConfig;
pub use coins::{Coin, CoinStore, CoinsMap, MemoryCoinStore};
pub use undo::{BlockUndo, TxUndo};
pub use keystore::{KeyPair, KeyStore};
pub use notification::{ChainNotifier, Notification, NotificationType, Subscription, TipUpdatedEvent};
pub use compact_block::{CompactBlock, PartialBlock, PrefilledTransaction, Reconstruction};
pub use chain::{BlockIndex, BlockStatus, BlockTree, ChainState};
