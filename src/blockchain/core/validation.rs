use crate::economics::{
    credits_eq, penalty_amount, split_escrow, Credits, CREDIT_TOLERANCE, ITEM_REQUEST_COST,
    MINING_REWARD,
};
use crate::error::ChainError;
use crate::transaction::{RequestPricing, SystemSeal, Transaction, TxKind, TxSignature};
use std::collections::HashSet;

use super::chain::Block;
use super::state::LedgerState;

/// Rejects a block that carries the same user signature twice.
pub fn validate_no_duplicate_transactions(block: &Block) -> Result<(), ChainError> {
    let mut seen = HashSet::new();
    for tx in &block.transactions {
        if let TxSignature::Signed(sig) = &tx.signature {
            if !seen.insert(sig.as_str()) {
                return Err(ChainError::InvalidBlock(format!(
                    "Transaction {} for {} appears twice in block {}",
                    tx.tx_type().as_str(),
                    tx.uid,
                    block.index
                )));
            }
        }
    }
    Ok(())
}

fn require_funds(state: &LedgerState, tx: &Transaction, needed: Credits) -> Result<(), ChainError> {
    let available = state.get_balance(&tx.requester);
    if available + CREDIT_TOLERANCE < needed {
        return Err(ChainError::InsufficientFunds { needed, available });
    }
    Ok(())
}

fn require_amount(tx: &Transaction, expected: Credits) -> Result<(), ChainError> {
    if !credits_eq(tx.amount(), expected) {
        return Err(ChainError::InvalidTransaction(format!(
            "{} for {} carries amount {}, expected {}",
            tx.tx_type().as_str(),
            tx.uid,
            tx.amount(),
            expected
        )));
    }
    Ok(())
}

/// Removes and returns the first unconsumed system transfer matching `pred`.
fn take_system_transfer<'a, F>(pending: &mut Vec<&'a Transaction>, pred: F) -> Option<&'a Transaction>
where
    F: Fn(&Transaction) -> bool,
{
    let pos = pending.iter().position(|tx| pred(tx))?;
    Some(pending.remove(pos))
}

/// Replays `block` on top of `state`, checking every transaction against the
/// allocation and balance rules. Fails on the first violation.
///
/// The coinbase is checked last: its amount depends on the escrow released by the
/// block, and the reward is not spendable inside the block that mints it.
pub fn validate_block_transactions(state: &LedgerState, block: &Block) -> Result<(), ChainError> {
    let mut state = state.clone();

    let (coinbase, rest) = block
        .transactions
        .split_first()
        .ok_or_else(|| ChainError::InvalidBlock("Block has no transactions.".to_string()))?;

    if !matches!(coinbase.kind, TxKind::Coinbase { .. })
        || coinbase.system_seal() != Some(SystemSeal::Coinbase)
    {
        return Err(ChainError::InvalidBlock(
            "First transaction in a block must be a Coinbase transaction.".to_string(),
        ));
    }
    coinbase.validate_size()?;

    let mut miner_escrow: Credits = 0.0;
    let mut unmatched: Vec<&Transaction> = Vec::new();

    for tx in rest {
        tx.validate_size()?;

        if matches!(tx.kind, TxKind::Coinbase { .. }) {
            return Err(ChainError::InvalidBlock(
                "Only the first transaction may be a coinbase.".to_string(),
            ));
        }
        if !tx.seal_allowed() {
            return Err(ChainError::InvalidBlock(format!(
                "{} for {} carries a forbidden system seal",
                tx.tx_type().as_str(),
                tx.uid
            )));
        }

        if tx.is_system() {
            // Buyout payments and escrow payouts are matched to the request that follows.
            unmatched.push(tx);
            state.apply_transaction(tx);
            continue;
        }

        tx.validate_stateless()?;
        tx.validate_signature()?;
        if state.is_mined(tx) {
            return Err(ChainError::DuplicateTransaction(format!(
                "{} for {} is already in the chain",
                tx.tx_type().as_str(),
                tx.uid
            )));
        }

        match &tx.kind {
            TxKind::Request { amount, pricing } => {
                let item = state.items.get(&tx.uid).cloned();
                match (pricing, item) {
                    (RequestPricing::Regular, None) => {
                        require_amount(tx, ITEM_REQUEST_COST)?;
                        require_funds(&state, tx, *amount)?;
                    }
                    (RequestPricing::Regular, Some(_)) => {
                        return Err(ChainError::ItemAlreadyHeld(tx.uid.clone()));
                    }
                    (RequestPricing::Buyout | RequestPricing::Penalty, None) => {
                        return Err(ChainError::InvalidTransaction(format!(
                            "Contended request for {} but the item is free",
                            tx.uid
                        )));
                    }
                    (_, Some(item)) if item.holder == tx.requester => {
                        return Err(ChainError::ItemAlreadyHeld(tx.uid.clone()));
                    }
                    (RequestPricing::Buyout, Some(item)) => {
                        require_amount(tx, item.value)?;
                        require_funds(&state, tx, *amount)?;

                        take_system_transfer(&mut unmatched, |t| {
                            t.system_seal() == Some(SystemSeal::BuyoutPayment)
                                && t.requester == tx.requester
                                && t.recipient() == Some(item.holder.as_str())
                                && credits_eq(t.amount(), *amount)
                        })
                        .ok_or_else(|| {
                            ChainError::InvalidBlock(format!(
                                "Buyout of {} has no matching payment to the holder",
                                tx.uid
                            ))
                        })?;

                        if item.escrow > 0.0 {
                            let (holder_share, miner_share) = split_escrow(item.escrow);
                            take_system_transfer(&mut unmatched, |t| {
                                t.system_seal() == Some(SystemSeal::EscrowDistribution)
                                    && t.recipient() == Some(item.holder.as_str())
                                    && credits_eq(t.amount(), holder_share)
                            })
                            .ok_or_else(|| {
                                ChainError::InvalidBlock(format!(
                                    "Buyout of {} has no matching escrow distribution",
                                    tx.uid
                                ))
                            })?;
                            miner_escrow += miner_share;
                        }
                    }
                    (RequestPricing::Penalty, Some(item)) => {
                        require_amount(tx, penalty_amount(item.value, item.demand))?;
                        require_funds(&state, tx, *amount)?;
                        if state.get_balance(&tx.requester) >= item.value {
                            return Err(ChainError::InvalidTransaction(format!(
                                "Penalty on {} from a requester who can afford the buyout",
                                tx.uid
                            )));
                        }
                    }
                    (RequestPricing::Unpriced, _) => {
                        return Err(ChainError::InvalidTransaction(format!(
                            "Request for {} was never priced",
                            tx.uid
                        )));
                    }
                }
            }
            TxKind::Release { .. } => {
                let item = state
                    .items
                    .get(&tx.uid)
                    .filter(|item| item.holder == tx.requester)
                    .ok_or_else(|| ChainError::ItemNotHeld(tx.uid.clone()))?;
                let (holder_share, miner_share) = split_escrow(item.escrow);
                require_amount(tx, item.value + holder_share)?;
                miner_escrow += miner_share;
            }
            TxKind::Transfer { amount, .. } => {
                require_funds(&state, tx, *amount)?;
            }
            TxKind::BuyoutOffer { .. } => {
                return Err(ChainError::InvalidBlock(format!(
                    "Buyout offer for {} cannot be mined",
                    tx.uid
                )));
            }
            TxKind::Coinbase { .. } => {
                return Err(ChainError::InvalidBlock(
                    "Only the first transaction may be a coinbase.".to_string(),
                ));
            }
        }

        state.apply_transaction(tx);
    }

    if let Some(orphan) = unmatched.first() {
        return Err(ChainError::InvalidBlock(format!(
            "System transfer {} is not backed by a buyout",
            orphan.uid
        )));
    }

    let allowed = MINING_REWARD + miner_escrow;
    if coinbase.amount() > allowed + CREDIT_TOLERANCE * allowed.max(1.0) {
        return Err(ChainError::InvalidBlock(format!(
            "Coinbase amount {} exceeds reward plus escrow share {}",
            coinbase.amount(),
            allowed
        )));
    }

    Ok(())
}
