//! Block assembly and proof-of-work sealing

use crate::blockchain::{hash_meets_difficulty, Block, Blockchain, LedgerState, SharedChain};
use crate::economics::{penalty_amount, split_escrow, Credits, ITEM_REQUEST_COST, MINING_REWARD};
use crate::error::ChainError;
use crate::transaction::{RequestPricing, SystemSeal, Transaction, TxKind};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// How many times `mine_shared` rebuilds its template when the tip moves during PoW.
pub const MAX_TEMPLATE_RETRIES: usize = 5;

/// Increment the nonce until the block hash has `difficulty` leading zero hex digits.
pub fn mine_block(mut block: Block, difficulty: usize) -> Result<Block, ChainError> {
    loop {
        block.hash = block.compute_hash();
        if hash_meets_difficulty(&block.hash, difficulty) {
            return Ok(block);
        }
        block.nonce = block.nonce.checked_add(1).ok_or_else(|| {
            ChainError::InvalidBlock("Nonce space exhausted while mining".to_string())
        })?;
    }
}

/// An unsealed block plus what committing it will remove from the mempool.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub block: Block,
    pub difficulty: usize,
    /// Ids of every mempool transaction taken for this template, valid or not.
    pub consumed: HashSet<String>,
}

impl BlockTemplate {
    /// False when every candidate was dropped and only the coinbase remains.
    pub fn has_payload(&self) -> bool {
        self.block.transactions.len() > 1
    }
}

/// Running simulation of a block being assembled.
struct Assembly<'a> {
    miner: &'a str,
    state: LedgerState,
    included: Vec<Transaction>,
    miner_escrow: Credits,
}

impl<'a> Assembly<'a> {
    fn new(miner: &'a str, state: LedgerState) -> Self {
        Assembly {
            miner,
            state,
            included: Vec::new(),
            miner_escrow: 0.0,
        }
    }

    fn include(&mut self, tx: Transaction) {
        self.state.apply_transaction(&tx);
        self.included.push(tx);
    }

    fn funds(&self, tx: &Transaction, needed: Credits) -> Result<(), ChainError> {
        let available = self.state.get_balance(&tx.requester);
        if available < needed {
            return Err(ChainError::InsufficientFunds { needed, available });
        }
        Ok(())
    }

    /// Re-price `tx` against the simulated state and include it together with any
    /// system transfers it requires.
    fn try_include(&mut self, mut tx: Transaction) -> Result<(), ChainError> {
        if matches!(tx.kind, TxKind::Coinbase { .. }) {
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
                "{} for {} is already mined",
                tx.tx_type().as_str(),
                tx.uid
            )));
        }

        match tx.kind.clone() {
            TxKind::Request { .. } => match self.state.items.get(&tx.uid).cloned() {
                None => {
                    self.funds(&tx, ITEM_REQUEST_COST)?;
                    tx.price(ITEM_REQUEST_COST, Some(RequestPricing::Regular));
                    self.include(tx);
                }
                Some(item) if item.holder == tx.requester => {
                    return Err(ChainError::ItemAlreadyHeld(tx.uid.clone()));
                }
                Some(item) => {
                    let available = self.state.get_balance(&tx.requester);
                    if available >= item.value {
                        let payment = Transaction::system_transfer(
                            tx.requester.clone(),
                            item.holder.clone(),
                            format!("BUYOUT_{}_{}", tx.uid, tx.timestamp),
                            item.value,
                            SystemSeal::BuyoutPayment,
                        );
                        self.include(payment);

                        if item.escrow > 0.0 {
                            let (holder_share, miner_share) = split_escrow(item.escrow);
                            let distribution = Transaction::system_transfer(
                                self.miner,
                                item.holder.clone(),
                                format!("ESCROW_TO_HOLDER_{}_{}", tx.uid, tx.timestamp),
                                holder_share,
                                SystemSeal::EscrowDistribution,
                            );
                            self.include(distribution);
                            self.miner_escrow += miner_share;
                        }

                        tx.price(item.value, Some(RequestPricing::Buyout));
                        self.include(tx);
                    } else {
                        let penalty = penalty_amount(item.value, item.demand);
                        self.funds(&tx, penalty)?;
                        tx.price(penalty, Some(RequestPricing::Penalty));
                        self.include(tx);
                    }
                }
            },
            TxKind::Release { .. } => {
                let item = self
                    .state
                    .items
                    .get(&tx.uid)
                    .filter(|item| item.holder == tx.requester)
                    .cloned()
                    .ok_or_else(|| ChainError::ItemNotHeld(tx.uid.clone()))?;
                let (holder_share, miner_share) = split_escrow(item.escrow);
                tx.price(item.value + holder_share, None);
                self.miner_escrow += miner_share;
                self.include(tx);
            }
            TxKind::Transfer { amount, .. } => {
                self.funds(&tx, amount)?;
                self.include(tx);
            }
            TxKind::BuyoutOffer { .. } => {
                return Err(ChainError::InvalidTransaction(format!(
                    "Buyout offer for {} is not minable",
                    tx.uid
                )));
            }
            TxKind::Coinbase { .. } => return Err(ChainError::CoinbaseNotAllowed),
        }
        Ok(())
    }

    fn into_block(self, index: u64, prev_hash: String) -> Block {
        let coinbase = Transaction::coinbase(
            self.miner,
            format!("COINBASE_BLOCK_{}", index),
            MINING_REWARD + self.miner_escrow,
            SystemSeal::Coinbase,
        );
        let mut transactions = Vec::with_capacity(self.included.len() + 1);
        transactions.push(coinbase);
        transactions.extend(self.included);
        Block::new(index, prev_hash, transactions)
    }
}

impl Blockchain {
    /// Build an unsealed block from up to `max` pending transactions.
    ///
    /// Candidates that no longer validate against the running simulation are
    /// dropped. Returns `None` when nothing is pending.
    pub fn prepare_block(
        &self,
        miner: &str,
        max: Option<usize>,
    ) -> Result<Option<BlockTemplate>, ChainError> {
        let candidates = self.mempool.minable(max);
        if candidates.is_empty() {
            return Ok(None);
        }

        let consumed = candidates.iter().map(Transaction::id).collect();
        let mut assembly = Assembly::new(miner, self.state.clone());
        for tx in candidates {
            let label = format!("{} for {}", tx.tx_type().as_str(), tx.uid);
            if let Err(e) = assembly.try_include(tx) {
                warn!("Dropping {} from block template: {}", label, e);
            }
        }

        Ok(Some(BlockTemplate {
            block: assembly.into_block(self.blocks.len() as u64, self.last_hash()),
            difficulty: self.difficulty,
            consumed,
        }))
    }

    /// Like [`Blockchain::prepare_block`] for explicit transactions, failing on the
    /// first one that does not validate.
    pub(crate) fn assemble_strict(
        &self,
        miner: &str,
        transactions: Vec<Transaction>,
    ) -> Result<BlockTemplate, ChainError> {
        let mut assembly = Assembly::new(miner, self.state.clone());
        for tx in transactions {
            assembly.try_include(tx)?;
        }
        Ok(BlockTemplate {
            block: assembly.into_block(self.blocks.len() as u64, self.last_hash()),
            difficulty: self.difficulty,
            consumed: HashSet::new(),
        })
    }

    /// Append a sealed template, provided the tip has not moved since it was prepared.
    pub fn commit_block(
        &mut self,
        template: &BlockTemplate,
        sealed: Block,
    ) -> Result<Block, ChainError> {
        if template.block.index != self.blocks.len() as u64
            || template.block.prev_hash != self.last_hash()
        {
            return Err(ChainError::StaleTemplate);
        }
        self.add_block(sealed.clone())?;
        self.mempool.remove_ids(&template.consumed);
        Ok(sealed)
    }

    /// Mine pending transactions into a new block on the calling thread.
    pub fn mine(&mut self, miner: &str, max: Option<usize>) -> Result<Option<Block>, ChainError> {
        let template = match self.prepare_block(miner, max)? {
            Some(template) => template,
            None => return Ok(None),
        };
        if !template.has_payload() {
            self.mempool.remove_ids(&template.consumed);
            info!("No valid transactions to mine");
            return Ok(None);
        }

        let sealed = mine_block(template.block.clone(), template.difficulty)?;
        let block = self.commit_block(&template, sealed)?;
        info!("Mined block {} ({})", block.index, block.hash);
        Ok(Some(block))
    }
}

/// Mine against a shared ledger without holding its lock during proof-of-work.
///
/// The template is prepared under a read lock, sealed on a blocking thread and
/// committed under the write lock. If a peer block moved the tip in between, the
/// template is rebuilt.
pub async fn mine_shared(
    chain: &SharedChain,
    miner: &str,
    max: Option<usize>,
) -> Result<Option<Block>, ChainError> {
    for attempt in 0..MAX_TEMPLATE_RETRIES {
        let template = {
            let guard = chain.read().await;
            guard.prepare_block(miner, max)?
        };
        let template = match template {
            Some(template) => template,
            None => return Ok(None),
        };
        if !template.has_payload() {
            chain.write().await.mempool.remove_ids(&template.consumed);
            info!("No valid transactions to mine");
            return Ok(None);
        }

        let unsealed = template.block.clone();
        let difficulty = template.difficulty;
        let sealed = tokio::task::spawn_blocking(move || mine_block(unsealed, difficulty))
            .await
            .map_err(|e| ChainError::InvalidBlock(format!("Mining task failed: {}", e)))??;

        let mut guard = chain.write().await;
        match guard.commit_block(&template, sealed) {
            Ok(block) => {
                info!("Mined block {} ({})", block.index, block.hash);
                return Ok(Some(block));
            }
            Err(ChainError::StaleTemplate) => {
                debug!("Chain tip moved during mining (attempt {}), rebuilding template", attempt + 1);
            }
            Err(e) => return Err(e),
        }
    }
    Err(ChainError::StaleTemplate)
}
