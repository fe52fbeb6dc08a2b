use crate::crypto::{sha256_hex, PublicKeyHex};
use crate::economics::{Credits, GENESIS_CREDITS};
use crate::error::ChainError;
use crate::mempool::Mempool;
use crate::miner::mine_block;
use crate::transaction::{SystemSeal, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::state::LedgerState;
use super::validation::{validate_block_transactions, validate_no_duplicate_transactions};

/// `prev_hash` of the genesis block: 64 ASCII zeros.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";
/// Fixed genesis timestamp so every node derives the same genesis hash.
pub const GENESIS_TIMESTAMP: u64 = 1672531200000;
pub const GENESIS_UID: &str = "GENESIS";

/// True when the hex digest starts with `difficulty` zero characters.
pub fn hash_meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub prev_hash: String,
    pub transactions: Vec<Transaction>,
    pub nonce: u64,
    pub timestamp: u64,
    /// Digest of the fields above; never part of its own preimage.
    pub hash: String,
}

impl Block {
    pub fn new(index: u64, prev_hash: impl Into<String>, transactions: Vec<Transaction>) -> Self {
        let mut block = Block {
            index,
            prev_hash: prev_hash.into(),
            transactions,
            nonce: 0,
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// The deterministic genesis block minting the initial supply to `genesis_key`.
    pub fn genesis(genesis_key: &str) -> Self {
        let coinbase =
            Transaction::coinbase(genesis_key, GENESIS_UID, GENESIS_CREDITS, SystemSeal::Genesis)
                .with_timestamp(GENESIS_TIMESTAMP);
        let mut block = Block {
            index: 0,
            prev_hash: GENESIS_PREV_HASH.to_string(),
            transactions: vec![coinbase],
            nonce: 0,
            timestamp: GENESIS_TIMESTAMP,
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// SHA-256 over the canonical (sorted-key) JSON of
    /// `{index, prev_hash, transactions, nonce, timestamp}`.
    pub fn compute_hash(&self) -> String {
        let payload = serde_json::json!({
            "index": self.index,
            "prev_hash": self.prev_hash,
            "transactions": self.transactions,
            "nonce": self.nonce,
            "timestamp": self.timestamp,
        });
        sha256_hex(payload.to_string().as_bytes())
    }

    pub fn meets_difficulty(&self, difficulty: usize) -> bool {
        hash_meets_difficulty(&self.hash, difficulty)
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }
}

/// The ledger shared between local actions and network callbacks.
pub type SharedChain = Arc<RwLock<Blockchain>>;

/// The ledger: blocks, pending transactions and the state derived from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blockchain {
    pub blocks: Vec<Block>,
    pub difficulty: usize,
    pub genesis_key: PublicKeyHex,
    #[serde(default)]
    pub mempool: Mempool,
    #[serde(default)]
    pub state: LedgerState,
}

impl Blockchain {
    pub fn new(genesis_key: impl Into<PublicKeyHex>, difficulty: usize) -> Self {
        let genesis_key = genesis_key.into();
        let genesis = Block::genesis(&genesis_key);
        let mut blockchain = Blockchain {
            blocks: vec![genesis],
            difficulty,
            genesis_key,
            mempool: Mempool::new(),
            state: LedgerState::new(),
        };
        blockchain.rebuild_state();
        blockchain
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn last_block(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn last_hash(&self) -> String {
        self.blocks
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_else(|| GENESIS_PREV_HASH.to_string())
    }

    pub fn balance(&self, key: &str) -> Credits {
        self.state.get_balance(key)
    }

    pub fn allocation(&self) -> BTreeSet<String> {
        self.state.allocation()
    }

    /// Items from `known` that nobody currently holds.
    pub fn available<'a, I>(&self, known: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        known
            .into_iter()
            .filter(|uid| !self.state.is_held(uid))
            .cloned()
            .collect()
    }

    pub fn known_items(&self) -> &BTreeSet<String> {
        &self.state.known_items
    }

    pub fn holder_of(&self, uid: &str) -> Option<&str> {
        self.state.holder_of(uid)
    }

    pub fn item_value(&self, uid: &str) -> Credits {
        self.state.item_value(uid)
    }

    pub fn item_demand_counter(&self, uid: &str) -> u64 {
        self.state.item_demand(uid)
    }

    pub fn item_escrow(&self, uid: &str) -> Credits {
        self.state.item_escrow(uid)
    }

    pub fn item_request_time(&self, uid: &str) -> Option<u64> {
        self.state.items.get(uid).map(|item| item.request_time)
    }

    /// Recompute the derived state by replaying every block.
    pub fn rebuild_state(&mut self) {
        self.state = LedgerState::from_blocks(&self.blocks);
    }

    /// Append a sealed block received from a peer or produced by the local miner.
    ///
    /// The block must extend the current tip, carry its own recomputed hash, satisfy
    /// the difficulty and pass transaction validation. On any failure the chain is
    /// left untouched.
    pub fn add_block(&mut self, block: Block) -> Result<(), ChainError> {
        let tip = self.last_hash();
        validate_block(&self.state, &tip, self.blocks.len(), self.difficulty, &block)?;

        self.mempool.purge_mined(&block);
        let index = block.index;
        let tx_count = block.transactions.len();
        self.blocks.push(block);
        self.rebuild_state();
        self.mempool.purge_stale_offers(&self.state);

        info!("Appended block {} ({} transactions)", index, tx_count);
        Ok(())
    }

    /// Local single-shot path: price `transactions` like the miner does, failing
    /// on the first invalid one, seal the block and append it.
    pub fn add_transactions(
        &mut self,
        miner: &str,
        transactions: Vec<Transaction>,
    ) -> Result<Block, ChainError> {
        let template = self.assemble_strict(miner, transactions)?;
        let block = mine_block(template.block, template.difficulty)?;
        self.add_block(block.clone())?;
        Ok(block)
    }

    /// Index of the first block that fails its hash, index, linkage or signature check.
    ///
    /// Block 0 must be the deterministic genesis for this chain's key, and no later
    /// transaction may carry a seal its kind does not allow.
    pub fn find_bad_block(&self) -> Option<usize> {
        let genesis = Block::genesis(&self.genesis_key);
        self.blocks.iter().enumerate().find_map(|(i, block)| {
            let sound = if i == 0 {
                *block == genesis
            } else {
                block.index == i as u64
                    && block.hash == block.compute_hash()
                    && block.prev_hash == self.blocks[i - 1].hash
                    && block
                        .transactions
                        .iter()
                        .all(|tx| tx.verify() && tx.seal_allowed())
            };

            (!sound).then_some(i)
        })
    }

    pub fn integrity_check(&self) -> bool {
        !self.blocks.is_empty() && self.find_bad_block().is_none()
    }

    /// Truncate the chain before its first bad block.
    ///
    /// Returns `false` when no repair was needed. A corrupted genesis is replaced
    /// by the deterministic genesis for this chain's genesis key.
    pub fn repair(&mut self) -> bool {
        let bad = match self.find_bad_block() {
            Some(bad) => bad,
            None if self.blocks.is_empty() => 0,
            None => return false,
        };

        warn!("Repairing chain: truncating at block {} of {}", bad, self.blocks.len());
        if bad == 0 {
            self.blocks = vec![Block::genesis(&self.genesis_key)];
        } else {
            self.blocks.truncate(bad);
        }

        for block in &mut self.blocks {
            block.hash = block.compute_hash();
        }

        self.rebuild_state();
        self.mempool.purge_stale_offers(&self.state);
        true
    }

    /// Adopt `candidate` if it is strictly longer than the local chain, passes
    /// integrity verification and replays block by block under the same rules as
    /// [`Blockchain::add_block`]. Returns the new length.
    pub fn replace_chain(&mut self, candidate: Vec<Block>) -> Result<usize, ChainError> {
        if candidate.len() <= self.blocks.len() {
            return Err(ChainError::ChainRejected(format!(
                "candidate length {} is not longer than local length {}",
                candidate.len(),
                self.blocks.len()
            )));
        }

        let mut reconstructed = Blockchain {
            blocks: candidate,
            difficulty: self.difficulty,
            genesis_key: self.genesis_key.clone(),
            mempool: Mempool::new(),
            state: LedgerState::new(),
        };

        if let Some(bad) = reconstructed.find_bad_block() {
            return Err(ChainError::ChainRejected(format!(
                "candidate failed integrity verification at block {}",
                bad
            )));
        }

        let mut state = LedgerState::from_blocks(&reconstructed.blocks[..1]);
        for (i, pair) in reconstructed.blocks.windows(2).enumerate() {
            let (prev, block) = (&pair[0], &pair[1]);
            validate_block(&state, &prev.hash, i + 1, self.difficulty, block).map_err(|e| {
                ChainError::ChainRejected(format!("candidate block {} rejected: {}", i + 1, e))
            })?;
            state.apply_block(block);
        }
        reconstructed.state = state;

        for block in &reconstructed.blocks {
            self.mempool.purge_mined(block);
        }
        self.blocks = reconstructed.blocks;
        self.state = reconstructed.state;
        self.mempool.purge_stale_offers(&self.state);

        info!("Replaced local chain; new length {}", self.blocks.len());
        Ok(self.blocks.len())
    }
}

/// Checks `block` as the next block after `tip` at height `expected_index`.
fn validate_block(
    state: &LedgerState,
    tip: &str,
    expected_index: usize,
    difficulty: usize,
    block: &Block,
) -> Result<(), ChainError> {
    if block.index != expected_index as u64 {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid block index. Expected {}, but got {}.",
            expected_index, block.index
        )));
    }

    if block.prev_hash != tip {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid previous block hash. Expected {}, but got {}.",
            tip, block.prev_hash
        )));
    }

    let recomputed = block.compute_hash();
    if block.hash != recomputed {
        return Err(ChainError::InvalidBlock(format!(
            "Block hash mismatch. Expected {}, but got {}.",
            recomputed, block.hash
        )));
    }

    if !block.meets_difficulty(difficulty) {
        return Err(ChainError::InvalidBlock(
            "Invalid Proof-of-Work: Block hash does not meet difficulty target.".to_string(),
        ));
    }

    validate_no_duplicate_transactions(block)?;
    validate_block_transactions(state, block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::economics::{ITEM_REQUEST_COST, MINING_REWARD};
    use crate::transaction::{RequestPricing, TxSignature};

    /// `chain`'s blocks plus one sealed block carrying `transactions`.
    fn extended(chain: &Blockchain, transactions: Vec<Transaction>) -> Vec<Block> {
        let block = Block::new(chain.len() as u64, chain.last_hash(), transactions);
        let mut blocks = chain.blocks.clone();
        blocks.push(mine_block(block, chain.difficulty).unwrap());
        blocks
    }

    fn coinbase_to(miner: &str, amount: Credits) -> Transaction {
        Transaction::coinbase(miner, "COINBASE_BLOCK_1", amount, SystemSeal::Coinbase)
    }

    fn rejection(result: Result<usize, ChainError>) -> String {
        match result {
            Err(ChainError::ChainRejected(reason)) => reason,
            other => panic!("expected a rejected chain, got {:?}", other),
        }
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let key = KeyPair::generate().unwrap().public_key_hex();
        let a = Blockchain::new(key.clone(), 2);
        let b = Blockchain::new(key.clone(), 3);

        assert_eq!(a.blocks[0].hash, b.blocks[0].hash);
        assert_eq!(a.blocks[0].prev_hash, GENESIS_PREV_HASH);
        assert_eq!(a.balance(&key), GENESIS_CREDITS);
        assert!(a.integrity_check());
    }

    #[test]
    fn test_hash_difficulty_prefix() {
        assert!(hash_meets_difficulty("00ab", 2));
        assert!(!hash_meets_difficulty("0a0b", 2));
        assert!(hash_meets_difficulty("abcd", 0));
        assert!(!hash_meets_difficulty("0", 2));
    }

    #[test]
    fn test_hash_excludes_itself() {
        let mut block = Block::new(1, GENESIS_PREV_HASH, vec![]);
        let before = block.compute_hash();
        block.hash = "tampered".to_string();
        assert_eq!(block.compute_hash(), before);
        block.nonce += 1;
        assert_ne!(block.compute_hash(), before);
    }

    #[test]
    fn test_repair_on_sound_chain_is_noop() {
        let key = KeyPair::generate().unwrap().public_key_hex();
        let mut chain = Blockchain::new(key, 1);
        assert_eq!(chain.find_bad_block(), None);
        assert!(!chain.repair());
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_corrupted_genesis_is_regenerated() {
        let key = KeyPair::generate().unwrap().public_key_hex();
        let mut chain = Blockchain::new(key.clone(), 1);
        chain.blocks[0].nonce = 42;

        assert_eq!(chain.find_bad_block(), Some(0));
        assert!(chain.repair());
        assert!(chain.integrity_check());
        assert_eq!(chain.blocks[0], Block::genesis(&key));
    }

    #[test]
    fn test_replace_chain_rejects_equal_length() {
        let key = KeyPair::generate().unwrap().public_key_hex();
        let mut chain = Blockchain::new(key.clone(), 1);
        let candidate = Blockchain::new(key, 1).blocks;
        let err = chain.replace_chain(candidate).unwrap_err();
        assert!(matches!(err, ChainError::ChainRejected(_)));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_replace_chain_requires_proof_of_work() {
        let key = KeyPair::generate().unwrap().public_key_hex();
        let attacker = KeyPair::generate().unwrap().public_key_hex();
        let mut chain = Blockchain::new(key, 4);

        let coinbase = coinbase_to(&attacker, MINING_REWARD);
        let mut block = Block::new(1, chain.last_hash(), vec![coinbase]);
        while block.meets_difficulty(chain.difficulty) {
            block.nonce += 1;
            block.hash = block.compute_hash();
        }
        let mut candidate = chain.blocks.clone();
        candidate.push(block.clone());

        let mut local = chain.clone();
        assert!(local.add_block(block).is_err());

        let reason = rejection(chain.replace_chain(candidate));
        assert!(reason.contains("Proof-of-Work"), "unexpected reason: {}", reason);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.balance(&attacker), 0.0);
    }

    #[test]
    fn test_replace_chain_rejects_inflated_coinbase() {
        let key = KeyPair::generate().unwrap().public_key_hex();
        let attacker = KeyPair::generate().unwrap().public_key_hex();
        let mut chain = Blockchain::new(key, 1);

        let coinbase = coinbase_to(&attacker, 1_000_000.0);
        let candidate = extended(&chain, vec![coinbase]);

        let reason = rejection(chain.replace_chain(candidate));
        assert!(reason.contains("block 1"), "unexpected reason: {}", reason);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.balance(&attacker), 0.0);
    }

    #[test]
    fn test_system_seal_on_user_request_is_corruption() {
        let key = KeyPair::generate().unwrap().public_key_hex();
        let attacker = KeyPair::generate().unwrap().public_key_hex();
        let mut chain = Blockchain::new(key, 1);

        let coinbase = coinbase_to(&attacker, MINING_REWARD);
        let mut request = Transaction::request(attacker.clone(), "X");
        request.price(ITEM_REQUEST_COST, Some(RequestPricing::Regular));
        request.signature = TxSignature::System(SystemSeal::BuyoutPayment);
        assert!(request.verify());

        let candidate = extended(&chain, vec![coinbase, request]);
        let forged = Blockchain {
            blocks: candidate.clone(),
            ..chain.clone()
        };
        assert_eq!(forged.find_bad_block(), Some(1));

        let reason = rejection(chain.replace_chain(candidate));
        assert!(reason.contains("integrity"), "unexpected reason: {}", reason);
        assert_eq!(chain.holder_of("X"), None);
    }

    #[test]
    fn test_replace_chain_rejects_foreign_genesis() {
        let key = KeyPair::generate().unwrap().public_key_hex();
        let other = KeyPair::generate().unwrap().public_key_hex();
        let mut chain = Blockchain::new(key, 1);

        let mut foreign = Blockchain::new(other.clone(), 1);
        foreign.add_transactions(&other, vec![]).unwrap();

        let reason = rejection(chain.replace_chain(foreign.blocks));
        assert!(reason.contains("block 0"), "unexpected reason: {}", reason);
        assert_eq!(chain.blocks[0], Block::genesis(&chain.genesis_key));
    }
}
