use crate::crypto::PublicKeyHex;
use crate::economics::{inflated_value, Credits, ITEM_REQUEST_COST};
use crate::transaction::{RequestPricing, Transaction, TxKind, TxSignature};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::chain::Block;

/// Economic state of one held item. Dropped entirely when the item is released.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemState {
    pub holder: PublicKeyHex,
    /// Timestamp of the request that made `holder` the holder.
    pub request_time: u64,
    /// Failed attempts since the item last changed hands.
    pub demand: u64,
    pub value: Credits,
    pub escrow: Credits,
}

impl ItemState {
    fn held_by(holder: &str, request_time: u64) -> Self {
        ItemState {
            holder: holder.to_string(),
            request_time,
            demand: 0,
            value: ITEM_REQUEST_COST,
            escrow: 0.0,
        }
    }
}

/// Materialized view of the chain: balances, holds and per-item economics.
///
/// Only ever produced by folding blocks in order with [`LedgerState::apply_block`];
/// nothing else mutates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub items: BTreeMap<String, ItemState>,
    pub balances: BTreeMap<PublicKeyHex, Credits>,
    /// Every uid ever requested or released.
    pub known_items: BTreeSet<String>,
    /// User signatures already included in a block.
    #[serde(default)]
    pub mined_signatures: BTreeSet<String>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay `blocks` from an empty state.
    pub fn from_blocks(blocks: &[Block]) -> Self {
        let mut state = Self::new();
        for block in blocks {
            state.apply_block(block);
        }
        state
    }

    pub fn get_balance(&self, key: &str) -> Credits {
        self.balances.get(key).copied().unwrap_or(0.0)
    }

    pub fn holder_of(&self, uid: &str) -> Option<&str> {
        self.items.get(uid).map(|item| item.holder.as_str())
    }

    pub fn allocation(&self) -> BTreeSet<String> {
        self.items.keys().cloned().collect()
    }

    pub fn is_held(&self, uid: &str) -> bool {
        self.items.contains_key(uid)
    }

    /// Current value of `uid`; free items are worth the base request cost.
    pub fn item_value(&self, uid: &str) -> Credits {
        self.items
            .get(uid)
            .map(|item| item.value)
            .unwrap_or(ITEM_REQUEST_COST)
    }

    pub fn item_demand(&self, uid: &str) -> u64 {
        self.items.get(uid).map(|item| item.demand).unwrap_or(0)
    }

    pub fn item_escrow(&self, uid: &str) -> Credits {
        self.items.get(uid).map(|item| item.escrow).unwrap_or(0.0)
    }

    pub fn is_mined(&self, tx: &Transaction) -> bool {
        match &tx.signature {
            TxSignature::Signed(sig) => self.mined_signatures.contains(sig),
            _ => false,
        }
    }

    fn credit(&mut self, key: &str, amount: Credits) {
        *self.balances.entry(key.to_string()).or_insert(0.0) += amount;
    }

    fn debit(&mut self, key: &str, amount: Credits) {
        *self.balances.entry(key.to_string()).or_insert(0.0) -= amount;
    }

    pub fn apply_block(&mut self, block: &Block) {
        for tx in &block.transactions {
            self.apply_transaction(tx);
        }
    }

    pub fn apply_transaction(&mut self, tx: &Transaction) {
        if let TxSignature::Signed(sig) = &tx.signature {
            self.mined_signatures.insert(sig.clone());
        }

        match &tx.kind {
            TxKind::Coinbase { amount } => self.credit(&tx.requester, *amount),
            TxKind::Request { amount, pricing } => {
                self.debit(&tx.requester, *amount);
                self.known_items.insert(tx.uid.clone());
                match pricing {
                    RequestPricing::Regular | RequestPricing::Buyout => {
                        self.items.insert(
                            tx.uid.clone(),
                            ItemState::held_by(&tx.requester, tx.timestamp),
                        );
                    }
                    RequestPricing::Penalty => {
                        if let Some(item) = self.items.get_mut(&tx.uid) {
                            item.escrow += *amount;
                            item.value = inflated_value(item.value, item.demand);
                            item.demand += 1;
                        }
                    }
                    RequestPricing::Unpriced => {}
                }
            }
            TxKind::Release { amount } => {
                self.credit(&tx.requester, *amount);
                self.known_items.insert(tx.uid.clone());
                self.items.remove(&tx.uid);
            }
            TxKind::Transfer { amount, recipient } => {
                // System transfers are paid out of funds the block already collected.
                if !tx.is_system() {
                    self.debit(&tx.requester, *amount);
                }
                self.credit(recipient, *amount);
            }
            TxKind::BuyoutOffer { .. } => {}
        }
    }

    /// Debit a pending buyout offer. Offers only ever live in the mempool.
    pub(crate) fn reserve_offer(&mut self, tx: &Transaction) {
        if let TxKind::BuyoutOffer { amount } = tx.kind {
            self.debit(&tx.requester, amount);
        }
    }
}
