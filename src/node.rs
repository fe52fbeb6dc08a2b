//! Node orchestration: one shared ledger, the gossip network, and the background
//! tasks (integrity monitor, auto-sync, event processing) that tie them together.

use crate::blockchain::{Block, Blockchain, SharedChain};
use crate::config::{Config, StorageBackend};
use crate::error::ChainError;
use crate::miner::mine_shared;
use crate::network::{NetworkEvent, NetworkNode};
use crate::persistence::{Database, InMemoryPersistence, Persistence, SnapshotFile};
use crate::sync::SyncState;
use crate::transaction::Transaction;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Booting,
    Syncing,
    Ready,
    Degraded,
}

/// Point-in-time view of the node for status output.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub state: NodeState,
    pub sync_state: SyncState,
    pub length: usize,
    pub tip: String,
    pub difficulty: usize,
    pub mempool_size: usize,
    pub peers: usize,
    pub integrity: bool,
}

/// The persistence backend named by `config`. An unopenable database falls back
/// to memory so the node can still run.
pub fn open_persistence(config: &Config) -> Arc<dyn Persistence> {
    match config.ledger.backend {
        StorageBackend::Snapshot => Arc::new(SnapshotFile::new(&config.ledger.snapshot_path)),
        StorageBackend::Sqlite => {
            let path = std::path::Path::new(&config.ledger.snapshot_path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!("Failed to create data dir {}: {}", parent.display(), e);
                }
            }
            match Database::open(&config.ledger.snapshot_path) {
                Ok(db) => Arc::new(db),
                Err(e) => {
                    warn!(
                        "Failed to open DB at {}: {}. Falling back to in-memory persistence.",
                        config.ledger.snapshot_path, e
                    );
                    Arc::new(InMemoryPersistence::new())
                }
            }
        }
    }
}

pub struct Node {
    pub config: Config,
    pub persistence: Arc<dyn Persistence>,
    pub blockchain: SharedChain,
    pub network: Arc<NetworkNode>,
    pub state: Arc<RwLock<NodeState>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<NetworkEvent>>>,
    last_integrity: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Build a node from configuration, choosing the persistence backend it names.
    pub fn init(config: Config) -> Result<Self, ChainError> {
        config.validate()?;
        let persistence = open_persistence(&config);
        Self::with_persistence(config, persistence)
    }

    /// Build a node on top of an explicit backend. Loads the saved ledger if any,
    /// otherwise starts from the configured genesis.
    pub fn with_persistence(config: Config, persistence: Arc<dyn Persistence>) -> Result<Self, ChainError> {
        let mut blockchain = match persistence.load() {
            Ok(Some(chain)) => chain,
            Ok(None) => {
                info!("No saved ledger found, starting from genesis");
                Blockchain::new(config.ledger.genesis_key.clone(), config.ledger.difficulty)
            }
            Err(e) => {
                warn!("Failed to load ledger from persistence: {}. Creating new chain.", e);
                Blockchain::new(config.ledger.genesis_key.clone(), config.ledger.difficulty)
            }
        };

        if blockchain.genesis_key != config.ledger.genesis_key {
            return Err(ChainError::ConfigError(format!(
                "saved ledger was created for genesis key {}, config names {}",
                blockchain.genesis_key, config.ledger.genesis_key
            )));
        }
        blockchain.difficulty = config.ledger.difficulty;
        if blockchain.repair() {
            warn!("Saved ledger was corrupt; repaired to {} blocks", blockchain.len());
        }

        let blockchain: SharedChain = Arc::new(RwLock::new(blockchain));
        let network = NetworkNode::new(Arc::clone(&blockchain))
            .with_heartbeat(Duration::from_secs(config.network.heartbeat_secs.max(1)));
        let events = network.subscribe();
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            persistence,
            blockchain,
            network: Arc::new(network),
            state: Arc::new(RwLock::new(NodeState::Booting)),
            events: Mutex::new(Some(events)),
            last_integrity: AtomicBool::new(true),
            shutdown,
        })
    }

    /// Bind the P2P listener, dial bootstrap peers and spawn the background tasks.
    /// Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ChainError> {
        let network_config = &self.config.network;
        let addr = self
            .network
            .start_server(&network_config.listen_host, network_config.p2p_port)
            .await?;
        self.set_state(NodeState::Syncing).await;

        for peer in &network_config.bootstrap_peers {
            let Some((host, port)) = peer.rsplit_once(':') else {
                warn!("Ignoring bootstrap peer without a port: {}", peer);
                continue;
            };
            let Ok(port) = port.parse::<u16>() else {
                warn!("Ignoring bootstrap peer with a bad port: {}", peer);
                continue;
            };
            match self.network.connect_peer(host.to_string(), port).await {
                Ok(address) => info!("Connected to bootstrap peer {}", address),
                Err(e) => warn!("Failed to connect to bootstrap peer {}: {}", peer, e),
            }
        }

        if let Some(events) = self.events.lock().await.take() {
            let node = Arc::clone(self);
            tokio::spawn(async move { node.process_events(events).await });
        }

        if self.config.monitor.interval_secs > 0 {
            let node = Arc::clone(self);
            let period = Duration::from_secs(self.config.monitor.interval_secs);
            tokio::spawn(async move { node.run_integrity_monitor(period).await });
        }

        if network_config.sync_interval_secs > 0 {
            let node = Arc::clone(self);
            let period = Duration::from_secs(network_config.sync_interval_secs);
            tokio::spawn(async move { node.run_auto_sync(period).await });
        }

        self.sync_now().await;
        self.set_state(NodeState::Ready).await;
        info!("Node ready on {} with {} blocks", addr, self.blockchain.read().await.len());
        Ok(addr)
    }

    pub async fn state(&self) -> NodeState {
        *self.state.read().await
    }

    async fn set_state(&self, state: NodeState) {
        let mut current = self.state.write().await;
        if *current != state {
            debug!("Node state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// Admit a signed transaction and tell peers about it.
    pub async fn submit(&self, tx: Transaction) -> Result<Transaction, ChainError> {
        let admitted = self.blockchain.write().await.submit_transaction(tx)?;
        if let Err(e) = self.network.broadcast_transaction(&admitted) {
            debug!("Could not gossip transaction: {}", e);
        }
        self.save().await?;
        Ok(admitted)
    }

    /// Mine with the configured miner key.
    pub async fn mine(&self) -> Result<Option<Block>, ChainError> {
        let miner = self.config.miner.public_key.clone().ok_or_else(|| {
            ChainError::ConfigError("miner.public_key must be set to mine".to_string())
        })?;
        self.mine_as(&miner).await
    }

    /// Mine pending transactions for `miner`, broadcast the block and save.
    pub async fn mine_as(&self, miner: &str) -> Result<Option<Block>, ChainError> {
        let block = mine_shared(&self.blockchain, miner, self.config.miner.max_transactions).await?;
        if let Some(block) = &block {
            let sent = self.network.broadcast_block(block)?;
            info!("Mined block {} and sent it to {} peers", block.index, sent);
            self.save().await?;
        }
        Ok(block)
    }

    /// Ask peers for their chains; a longer valid one replaces ours when it arrives.
    pub async fn sync_now(&self) -> usize {
        self.network.request_chain_from_peers().await
    }

    /// One integrity-monitor round. Logs only when the status changes and repairs a
    /// broken chain. Returns whether a repair happened.
    pub async fn check_integrity(&self) -> Result<bool, ChainError> {
        let sound = self.blockchain.read().await.integrity_check();
        let was_sound = self.last_integrity.swap(sound, Ordering::SeqCst);
        if sound != was_sound {
            if sound {
                info!("Chain integrity restored");
            } else {
                warn!("Chain integrity check failed");
            }
        }
        if sound {
            return Ok(false);
        }

        self.set_state(NodeState::Degraded).await;
        let repaired = self.blockchain.write().await.repair();
        if repaired {
            self.save().await?;
            self.last_integrity.store(true, Ordering::SeqCst);
            info!("Chain repaired to {} blocks", self.blockchain.read().await.len());
        }
        self.set_state(NodeState::Ready).await;
        Ok(repaired)
    }

    pub async fn status(&self) -> NodeStatus {
        let (length, tip, difficulty, mempool_size, integrity) = {
            let chain = self.blockchain.read().await;
            (
                chain.len(),
                chain.last_hash(),
                chain.difficulty,
                chain.mempool.len(),
                chain.integrity_check(),
            )
        };
        NodeStatus {
            state: self.state().await,
            sync_state: self.network.sync().get_sync_state().await,
            length,
            tip,
            difficulty,
            mempool_size,
            peers: self.network.peer_count(),
            integrity,
        }
    }

    /// Persist the whole ledger through the configured backend.
    pub async fn save(&self) -> Result<(), ChainError> {
        let chain = self.blockchain.read().await;
        self.persistence.save(&chain)
    }

    /// Stop background tasks and the network, then write a final snapshot.
    pub async fn shutdown(&self) -> Result<(), ChainError> {
        info!("Shutting down node");
        self.shutdown.send_replace(true);
        self.network.stop();
        self.save().await
    }

    async fn process_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<NetworkEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            match event {
                NetworkEvent::BlockAccepted { index, from } => {
                    debug!("Block {} from {} appended", index, from);
                    self.save_logged().await;
                }
                NetworkEvent::ChainReplaced { length, from } => {
                    info!("Adopted chain of length {} from {}", length, from);
                    self.save_logged().await;
                }
                NetworkEvent::ChainKept { from, reason } => {
                    debug!("Kept current chain after response from {}: {}", from, reason);
                }
                NetworkEvent::BlockRejected { index, from, reason } => {
                    debug!("Block {} from {} rejected: {}", index, from, reason);
                }
                NetworkEvent::TransactionSeen { id, from } => {
                    debug!("Peer {} gossiped transaction {}", from, id);
                }
                NetworkEvent::PeerList { from, peers } => {
                    debug!("Peer {} knows {} other peers", from, peers.len());
                }
                NetworkEvent::PeerConnected { .. } | NetworkEvent::PeerDisconnected { .. } => {}
            }
        }
    }

    async fn run_integrity_monitor(self: Arc<Self>, period: Duration) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_integrity().await {
                        error!("Integrity monitor failed to save repaired chain: {}", e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run_auto_sync(self: Arc<Self>, period: Duration) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let asked = self.sync_now().await;
                    let length = self.blockchain.read().await.len();
                    let state = self.network.sync().check_sync_health(length).await;
                    debug!("Auto-sync asked {} peers; local length {} ({:?})", asked, length, state);
                    self.network.sync().cleanup_stale_peers().await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn save_logged(&self) {
        if let Err(e) = self.save().await {
            error!("Failed to save ledger: {}", e);
        }
    }
}
