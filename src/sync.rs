//! Chain synchronization bookkeeping for Holdchain
//!
//! Tracks what each connected peer has told us about its chain:
//! - Advertised chain length (from chain responses and gossiped blocks)
//! - Blocks and whole chains received, and verification failures
//! - Longest-chain replacement statistics
//! - The node's overall sync state
//!
//! The network layer feeds this module; the node orchestrator reads it to decide
//! whom to ask for chains.

use crate::error::ChainError;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Verification failures after which a peer is no longer asked for chains.
pub const MAX_SYNC_FAILURES: u32 = 3;

/// Seconds without any message before a peer is considered stale.
pub const STALE_PEER_SECS: u64 = 300;

/// Peer sync information
#[derive(Debug, Clone)]
pub struct PeerSyncInfo {
    pub address: String,
    pub advertised_length: usize,
    pub last_seen: Instant,
    pub blocks_received: u64,
    pub chains_received: u64,
    pub sync_failures: u32,
    pub is_syncing: bool,
}

impl PeerSyncInfo {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            advertised_length: 0,
            last_seen: Instant::now(),
            blocks_received: 0,
            chains_received: 0,
            sync_failures: 0,
            is_syncing: false,
        }
    }

    pub fn is_unreliable(&self) -> bool {
        self.sync_failures >= MAX_SYNC_FAILURES
    }

    pub fn is_stale(&self) -> bool {
        self.last_seen.elapsed() > Duration::from_secs(STALE_PEER_SECS)
    }
}

/// Sync statistics
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub blocks_accepted: u64,
    pub chains_replaced: u64,
    pub chains_kept: u64,
    pub verification_failures: u64,
    pub last_replacement: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    Synced,
    Failed,
}

pub struct ChainSync {
    peers: RwLock<HashMap<String, PeerSyncInfo>>,
    sync_state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
}

impl ChainSync {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            sync_state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Register a peer. Returns `false` if it was already known.
    pub async fn register_peer(&self, address: &str) -> bool {
        let mut peers = self.peers.write().await;
        if peers.contains_key(address) {
            return false;
        }
        peers.insert(address.to_string(), PeerSyncInfo::new(address));
        true
    }

    pub async fn remove_peer(&self, address: &str) -> Result<(), ChainError> {
        self.peers
            .write()
            .await
            .remove(address)
            .ok_or_else(|| ChainError::NetworkError("Peer not found".to_string()))?;
        Ok(())
    }

    /// Record that `address` has at least `length` blocks.
    pub async fn update_peer_length(&self, address: &str, length: usize) {
        let mut peers = self.peers.write().await;
        let peer = peers
            .entry(address.to_string())
            .or_insert_with(|| PeerSyncInfo::new(address));
        peer.advertised_length = peer.advertised_length.max(length);
        peer.last_seen = Instant::now();
    }

    pub async fn touch(&self, address: &str) {
        if let Some(peer) = self.peers.write().await.get_mut(address) {
            peer.last_seen = Instant::now();
        }
    }

    pub async fn is_unreliable(&self, address: &str) -> bool {
        self.peers
            .read()
            .await
            .get(address)
            .map(PeerSyncInfo::is_unreliable)
            .unwrap_or(false)
    }

    pub async fn record_block_received(&self, address: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(address) {
            peer.blocks_received += 1;
            peer.last_seen = Instant::now();
        }
        self.stats.write().await.blocks_accepted += 1;
    }

    /// Record a chain response that passed verification. `replaced` is whether it
    /// was adopted (it was strictly longer).
    pub async fn record_chain_received(&self, address: &str, replaced: bool) {
        {
            let mut peers = self.peers.write().await;
            if let Some(peer) = peers.get_mut(address) {
                peer.chains_received += 1;
                peer.is_syncing = false;
                peer.last_seen = Instant::now();
            }
        }

        let mut stats = self.stats.write().await;
        if replaced {
            stats.chains_replaced += 1;
            stats.last_replacement = Some(Instant::now());
        } else {
            stats.chains_kept += 1;
        }
        drop(stats);
        self.set_sync_state(SyncState::Synced).await;
    }

    /// Record a block or chain from `address` that failed verification.
    pub async fn record_sync_failure(&self, address: &str) {
        {
            let mut peers = self.peers.write().await;
            if let Some(peer) = peers.get_mut(address) {
                peer.sync_failures += 1;
                peer.is_syncing = false;
                peer.last_seen = Instant::now();
                if peer.is_unreliable() {
                    warn!("Peer {} marked as unreliable", address);
                }
            }
        }
        self.stats.write().await.verification_failures += 1;
    }

    /// Mark the listed peers as asked for their chain.
    pub async fn begin_sync(&self, addresses: &[String]) {
        if addresses.is_empty() {
            return;
        }
        {
            let mut peers = self.peers.write().await;
            for address in addresses {
                if let Some(peer) = peers.get_mut(address) {
                    peer.is_syncing = true;
                }
            }
        }
        self.set_sync_state(SyncState::Syncing).await;
    }

    /// Re-derive the sync state from the local length and what peers advertise.
    pub async fn check_sync_health(&self, local_length: usize) -> SyncState {
        let peers = self.peers.read().await;

        let state = if peers.is_empty() {
            SyncState::Idle
        } else {
            let reliable: Vec<_> = peers.values().filter(|p| !p.is_unreliable()).collect();
            let best = reliable.iter().map(|p| p.advertised_length).max();
            match best {
                None => SyncState::Failed,
                Some(best) if local_length >= best => SyncState::Synced,
                Some(best) => {
                    debug!("Local chain is {} blocks behind best peer", best - local_length);
                    SyncState::Syncing
                }
            }
        };
        drop(peers);

        self.set_sync_state(state).await;
        state
    }

    pub async fn get_sync_state(&self) -> SyncState {
        *self.sync_state.read().await
    }

    async fn set_sync_state(&self, state: SyncState) {
        *self.sync_state.write().await = state;
    }

    pub async fn get_stats(&self) -> SyncStats {
        self.stats.read().await.clone()
    }

    pub async fn get_peer_info(&self, address: &str) -> Option<PeerSyncInfo> {
        self.peers.read().await.get(address).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn cleanup_stale_peers(&self) -> usize {
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|address, p| {
            if p.is_stale() {
                debug!("Removing stale peer: {}", address);
            }
            !p.is_stale()
        });
        before - peers.len()
    }
}

impl Default for ChainSync {
    fn default() -> Self {
        Self::new()
    }
}
