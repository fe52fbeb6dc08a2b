//! Pending transactions and the admission rules that price them

use crate::blockchain::{Block, Blockchain, LedgerState};
use crate::economics::{penalty_amount, split_escrow, Credits, ITEM_REQUEST_COST};
use crate::error::ChainError;
use crate::transaction::{RequestPricing, Transaction, TxKind, TxSignature, TxType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

/// Upper bound on pending transactions held by one node.
pub const MAX_MEMPOOL_SIZE: usize = 10_000;

/// Transactions admitted but not yet mined, in admission order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mempool {
    transactions: Vec<Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn get_all_transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn get_transaction(&self, id: &str) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.id() == id)
    }

    /// A pending transaction from the same requester for the same item and kind.
    pub fn contains_pending(&self, requester: &str, uid: &str, tx_type: TxType) -> bool {
        self.transactions
            .iter()
            .any(|tx| tx.requester == requester && tx.uid == uid && tx.tx_type() == tx_type)
    }

    pub(crate) fn add_transaction(&mut self, tx: Transaction) -> Result<(), ChainError> {
        if self.transactions.len() >= MAX_MEMPOOL_SIZE {
            return Err(ChainError::InvalidTransaction(format!(
                "Mempool is full ({} transactions)",
                MAX_MEMPOOL_SIZE
            )));
        }
        self.transactions.push(tx);
        Ok(())
    }

    pub fn remove_transaction(&mut self, id: &str) -> Option<Transaction> {
        let pos = self.transactions.iter().position(|tx| tx.id() == id)?;
        Some(self.transactions.remove(pos))
    }

    pub(crate) fn remove_ids(&mut self, ids: &HashSet<String>) {
        self.transactions.retain(|tx| !ids.contains(&tx.id()));
    }

    /// Transactions eligible for mining, oldest first. Buyout offers are never mined.
    pub fn minable(&self, max: Option<usize>) -> Vec<Transaction> {
        let eligible = self
            .transactions
            .iter()
            .filter(|tx| tx.tx_type() != TxType::BuyoutOffer)
            .cloned();
        match max {
            Some(max) => eligible.take(max).collect(),
            None => eligible.collect(),
        }
    }

    /// Standing buyout offers recorded for `uid`.
    pub fn buyout_offers(&self, uid: &str) -> Vec<&Transaction> {
        self.transactions
            .iter()
            .filter(|tx| tx.tx_type() == TxType::BuyoutOffer && tx.uid == uid)
            .collect()
    }

    /// Drop every pending transaction whose user signature appears in `block`.
    pub fn purge_mined(&mut self, block: &Block) {
        let mined: HashSet<&str> = block
            .transactions
            .iter()
            .filter_map(|tx| match &tx.signature {
                TxSignature::Signed(sig) => Some(sig.as_str()),
                _ => None,
            })
            .collect();
        if mined.is_empty() {
            return;
        }
        self.transactions.retain(|tx| match &tx.signature {
            TxSignature::Signed(sig) => !mined.contains(sig.as_str()),
            _ => true,
        });
    }

    /// Drop offers for items that were released or whose holder is now the bidder.
    pub fn purge_stale_offers(&mut self, state: &LedgerState) {
        let before = self.transactions.len();
        self.transactions.retain(|tx| {
            if tx.tx_type() != TxType::BuyoutOffer {
                return true;
            }
            match state.holder_of(&tx.uid) {
                Some(holder) => holder != tx.requester,
                None => false,
            }
        });
        let dropped = before - self.transactions.len();
        if dropped > 0 {
            debug!("Purged {} stale buyout offers", dropped);
        }
    }

    pub fn clear(&mut self) {
        self.transactions.clear();
    }
}

impl Blockchain {
    /// Chain state with every pending transaction folded in. Used for admission
    /// checks only; never persisted as authoritative balance.
    pub fn provisional_state(&self) -> LedgerState {
        let mut state = self.state.clone();
        for tx in self.mempool.get_all_transactions() {
            match tx.kind {
                TxKind::BuyoutOffer { .. } => state.reserve_offer(tx),
                _ => state.apply_transaction(tx),
            }
        }
        state
    }

    /// Chain balance plus the delta of pending transactions.
    pub fn pending_balance(&self, key: &str) -> Credits {
        self.provisional_state().get_balance(key)
    }

    pub fn buyout_offers(&self, uid: &str) -> Vec<&Transaction> {
        self.mempool.buyout_offers(uid)
    }

    /// Validate `tx` against the chain plus pending transactions, assign its amount,
    /// and add it to the mempool. Returns the transaction as admitted.
    pub fn submit_transaction(&mut self, mut tx: Transaction) -> Result<Transaction, ChainError> {
        if tx.tx_type() == TxType::Coinbase {
            return Err(ChainError::CoinbaseNotAllowed);
        }
        if tx.is_system() {
            return Err(ChainError::InvalidSignature(
                "System seals are minted by the mining step only".to_string(),
            ));
        }

        tx.validate_signature()?;
        tx.validate_stateless()?;

        if self.state.is_mined(&tx) {
            return Err(ChainError::DuplicateTransaction(format!(
                "{} for {} is already in the chain",
                tx.tx_type().as_str(),
                tx.uid
            )));
        }
        if tx.tx_type() != TxType::BuyoutOffer
            && self.mempool.contains_pending(&tx.requester, &tx.uid, tx.tx_type())
        {
            return Err(ChainError::DuplicateTransaction(format!(
                "{} for {} is already pending",
                tx.tx_type().as_str(),
                tx.uid
            )));
        }

        let view = self.provisional_state();
        let available = view.get_balance(&tx.requester);
        let insufficient = |needed: Credits| ChainError::InsufficientFunds { needed, available };

        match &tx.kind {
            TxKind::Request { .. } => match view.items.get(&tx.uid) {
                None => {
                    if available < ITEM_REQUEST_COST {
                        return Err(insufficient(ITEM_REQUEST_COST));
                    }
                    tx.price(ITEM_REQUEST_COST, Some(RequestPricing::Regular));
                }
                Some(item) if item.holder == tx.requester => {
                    return Err(ChainError::ItemAlreadyHeld(tx.uid.clone()));
                }
                Some(item) => {
                    if available >= item.value {
                        tx.price(item.value, Some(RequestPricing::Buyout));
                    } else {
                        let penalty = penalty_amount(item.value, item.demand);
                        if available < penalty {
                            return Err(insufficient(penalty));
                        }
                        tx.price(penalty, Some(RequestPricing::Penalty));
                    }
                }
            },
            TxKind::Release { .. } => match view.items.get(&tx.uid) {
                Some(item) if item.holder == tx.requester => {
                    let (holder_share, _) = split_escrow(item.escrow);
                    let refund = item.value + holder_share;
                    tx.price(refund, None);
                }
                _ => return Err(ChainError::ItemNotHeld(tx.uid.clone())),
            },
            TxKind::Transfer { amount, .. } => {
                if available < *amount {
                    return Err(insufficient(*amount));
                }
            }
            TxKind::BuyoutOffer { amount } => match view.items.get(&tx.uid) {
                None => {
                    return Err(ChainError::InvalidTransaction(format!(
                        "Cannot offer for {}: item is not held",
                        tx.uid
                    )));
                }
                Some(item) if item.holder == tx.requester => {
                    return Err(ChainError::ItemAlreadyHeld(tx.uid.clone()));
                }
                Some(_) => {
                    if available < *amount {
                        return Err(insufficient(*amount));
                    }
                }
            },
            TxKind::Coinbase { .. } => return Err(ChainError::CoinbaseNotAllowed),
        }

        self.mempool.add_transaction(tx.clone())?;
        info!(
            "Admitted {} for {} (amount {:.4})",
            tx.tx_type().as_str(),
            tx.uid,
            tx.amount()
        );
        Ok(tx)
    }

    /// Boolean form of [`Blockchain::submit_transaction`].
    pub fn submit_to_mempool(&mut self, tx: Transaction) -> bool {
        match self.submit_transaction(tx) {
            Ok(_) => true,
            Err(e) => {
                debug!("Rejected transaction: {}", e);
                false
            }
        }
    }
}
