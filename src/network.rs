//! Peer-to-peer gossip for Holdchain
//!
//! Every connection carries newline-terminated JSON envelopes `{type, payload, sender}`.
//! Each peer gets a reader task that routes incoming messages into the ledger and a
//! writer task that drains the peer's own outbound queue, so a slow peer never holds
//! up delivery to the others.

use crate::blockchain::{Block, SharedChain};
use crate::error::ChainError;
use crate::sync::ChainSync;
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);
/// Longest accepted frame, terminator excluded. Sized for a full `chain_response`.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
    #[error("Peer {0} is not connected")]
    PeerNotFound(String),
    #[error("Peer {0} closed its outbound queue")]
    PeerClosed(String),
    #[error("Network node is not running")]
    NotRunning,
    #[error("Frame exceeds {0} bytes")]
    FrameTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    PeerAnnounce,
    PeerList,
    RequestChain,
    ChainResponse,
    NewBlock,
    NewTransaction,
    Ping,
    Pong,
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub sender: Option<String>,
}

impl Message {
    pub fn new(kind: MessageType, payload: Value, sender: Option<String>) -> Self {
        Self {
            kind,
            payload,
            sender,
        }
    }

    /// Encode as a single newline-terminated line.
    pub fn to_line(&self) -> Result<String, NetworkError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, NetworkError> {
        Ok(serde_json::from_str(line.trim_end())?)
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, NetworkError> {
        Ok(serde_json::from_slice(frame)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnouncePayload {
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerListPayload {
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainPayload {
    pub chain: Vec<Block>,
    pub length: usize,
}

/// What the network did with the ledger, for whoever owns the node.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    PeerConnected { address: String },
    PeerDisconnected { address: String },
    PeerList { from: String, peers: Vec<String> },
    BlockAccepted { index: u64, from: String },
    BlockRejected { index: u64, from: String, reason: String },
    ChainReplaced { length: usize, from: String },
    ChainKept { from: String, reason: String },
    TransactionSeen { id: String, from: String },
}

/// A live connection. Identity is the remote address.
#[derive(Debug)]
pub struct Peer {
    address: String,
    outbound: mpsc::UnboundedSender<Message>,
    close_tx: watch::Sender<bool>,
    close_rx: watch::Receiver<bool>,
    connected_at: DateTime<Utc>,
    blocks_received: AtomicU64,
    transactions_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

/// Diagnostic counters for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStats {
    pub address: String,
    pub connected_at: DateTime<Utc>,
    pub blocks_received: u64,
    pub transactions_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

impl Peer {
    pub(crate) fn new(address: impl Into<String>, outbound: mpsc::UnboundedSender<Message>) -> Self {
        let (close_tx, close_rx) = watch::channel(false);
        Self {
            address: address.into(),
            outbound,
            close_tx,
            close_rx,
            connected_at: Utc::now(),
            blocks_received: AtomicU64::new(0),
            transactions_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Queue `message` for this peer's writer task.
    pub fn send(&self, message: Message) -> Result<(), NetworkError> {
        self.outbound
            .send(message)
            .map_err(|_| NetworkError::PeerClosed(self.address.clone()))
    }

    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close_rx.borrow() || self.outbound.is_closed()
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.close_rx.clone()
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats {
            address: self.address.clone(),
            connected_at: self.connected_at,
            blocks_received: self.blocks_received.load(Ordering::Relaxed),
            transactions_received: self.transactions_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// Connected peers, guarded by one lock for add, remove and broadcast.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer`, returning any previous connection with the same address.
    pub fn insert(&self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        self.peers.lock().insert(peer.address.clone(), peer)
    }

    /// Remove `peer` unless its address has since been taken by a newer connection.
    pub fn remove(&self, peer: &Arc<Peer>) -> bool {
        let mut peers = self.peers.lock();
        match peers.get(&peer.address) {
            Some(current) if Arc::ptr_eq(current, peer) => {
                peers.remove(&peer.address);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, address: &str) -> Option<Arc<Peer>> {
        self.peers.lock().get(address).cloned()
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.peers.lock().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Push `message` onto every peer's queue. Returns how many accepted it.
    pub fn broadcast(&self, message: &Message) -> usize {
        let peers = self.peers.lock();
        peers
            .values()
            .filter(|peer| peer.send(message.clone()).is_ok())
            .count()
    }

    pub fn stats(&self) -> Vec<PeerStats> {
        let mut stats: Vec<_> = self.peers.lock().values().map(|p| p.stats()).collect();
        stats.sort_by(|a, b| a.address.cmp(&b.address));
        stats
    }

    pub fn close_all(&self) {
        for peer in self.peers.lock().drain().map(|(_, peer)| peer) {
            peer.close();
        }
    }
}

pub struct NetworkNode {
    chain: SharedChain,
    sync: Arc<ChainSync>,
    peers: PeerRegistry,
    known_addresses: Mutex<BTreeSet<String>>,
    local_address: RwLock<Option<String>>,
    events: Mutex<Option<mpsc::UnboundedSender<NetworkEvent>>>,
    heartbeat: Duration,
    shutdown: watch::Sender<bool>,
}

impl NetworkNode {
    pub fn new(chain: SharedChain) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            chain,
            sync: Arc::new(ChainSync::new()),
            peers: PeerRegistry::new(),
            known_addresses: Mutex::new(BTreeSet::new()),
            local_address: RwLock::new(None),
            events: Mutex::new(None),
            heartbeat: DEFAULT_HEARTBEAT,
            shutdown,
        }
    }

    /// Idle time after which a connection sends a ping.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Route ledger events to the returned receiver. Replaces any earlier subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<NetworkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        rx
    }

    pub fn chain(&self) -> &SharedChain {
        &self.chain
    }

    pub fn sync(&self) -> &Arc<ChainSync> {
        &self.sync
    }

    pub fn local_address(&self) -> Option<String> {
        self.local_address.read().clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_addresses(&self) -> Vec<String> {
        self.peers.addresses()
    }

    pub fn list_peers(&self) -> Vec<PeerStats> {
        self.peers.stats()
    }

    /// Addresses learned from announcements and peer lists. Informational only;
    /// nothing dials them automatically.
    pub fn known_addresses(&self) -> Vec<String> {
        self.known_addresses.lock().iter().cloned().collect()
    }

    /// Bind the listener and spawn the accept loop. Port 0 picks a free port.
    pub async fn start_server(self: &Arc<Self>, host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
        let listener = TcpListener::bind((host, port)).await?;
        let local = listener.local_addr()?;
        *self.local_address.write() = Some(local.to_string());
        info!("P2P listener on {}", local);

        let node = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            debug!("Inbound connection from {}", remote);
                            node.attach(stream, remote.to_string()).await;
                        }
                        Err(e) => warn!("Failed to accept connection: {}", e),
                    },
                    _ = shutdown.changed() => break,
                }
            }
            info!("P2P listener on {} stopped", local);
        });

        Ok(local)
    }

    /// Dial `host:port` and announce ourselves. Returns the peer's address.
    pub async fn connect_peer(self: &Arc<Self>, host: String, port: u16) -> Result<String, NetworkError> {
        if *self.shutdown.borrow() {
            return Err(NetworkError::NotRunning);
        }
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        let address = match stream.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => format!("{}:{}", host, port),
        };

        let peer = self.attach(stream, address.clone()).await;
        let announce = AnnouncePayload {
            address: self.local_address(),
        };
        peer.send(self.message(MessageType::PeerAnnounce, serde_json::to_value(announce)?))?;
        Ok(address)
    }

    pub fn broadcast(&self, message: &Message) -> usize {
        self.peers.broadcast(message)
    }

    pub fn broadcast_block(&self, block: &Block) -> Result<usize, NetworkError> {
        let message = self.message(MessageType::NewBlock, serde_json::to_value(block)?);
        let sent = self.broadcast(&message);
        debug!("Broadcast block {} to {} peers", block.index, sent);
        Ok(sent)
    }

    pub fn broadcast_transaction(&self, tx: &Transaction) -> Result<usize, NetworkError> {
        let message = self.message(MessageType::NewTransaction, serde_json::to_value(tx)?);
        Ok(self.broadcast(&message))
    }

    pub fn send_to(&self, address: &str, message: Message) -> Result<(), NetworkError> {
        self.peers
            .get(address)
            .ok_or_else(|| NetworkError::PeerNotFound(address.to_string()))?
            .send(message)
    }

    pub fn request_chain_from(&self, address: &str) -> Result<(), NetworkError> {
        self.send_to(address, self.message(MessageType::RequestChain, Value::Null))
    }

    /// Ask every connected peer not marked unreliable for its chain.
    pub async fn request_chain_from_peers(&self) -> usize {
        let mut eligible = Vec::new();
        for address in self.peers.addresses() {
            if !self.sync.is_unreliable(&address).await {
                eligible.push(address);
            }
        }
        // Marked before sending so a fast response cannot be overwritten.
        self.sync.begin_sync(&eligible).await;

        eligible
            .iter()
            .filter(|address| match self.request_chain_from(address) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Could not request chain from {}: {}", address, e);
                    false
                }
            })
            .count()
    }

    /// Stop accepting connections and close every peer.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        self.peers.close_all();
    }

    fn message(&self, kind: MessageType, payload: Value) -> Message {
        Message::new(kind, payload, self.local_address())
    }

    fn emit(&self, event: NetworkEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    async fn attach(self: &Arc<Self>, stream: TcpStream, address: String) -> Arc<Peer> {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Peer::new(address.clone(), tx));

        if let Some(previous) = self.peers.insert(Arc::clone(&peer)) {
            previous.close();
        }
        self.sync.register_peer(&address).await;
        info!("Peer connected: {}", address);
        self.emit(NetworkEvent::PeerConnected { address });

        tokio::spawn(write_loop(
            Arc::clone(&peer),
            write_half,
            rx,
            self.heartbeat,
            self.local_address(),
        ));
        tokio::spawn(read_loop(Arc::clone(self), Arc::clone(&peer), read_half));
        peer
    }

    async fn disconnect(&self, peer: &Arc<Peer>) {
        peer.close();
        if self.peers.remove(peer) {
            let _ = self.sync.remove_peer(peer.address()).await;
            info!("Peer disconnected: {}", peer.address());
            self.emit(NetworkEvent::PeerDisconnected {
                address: peer.address().to_string(),
            });
        }
    }

    async fn route(&self, peer: &Arc<Peer>, message: Message) -> Result<(), NetworkError> {
        self.sync.touch(peer.address()).await;

        match message.kind {
            MessageType::PeerAnnounce => {
                let announce: AnnouncePayload = serde_json::from_value(message.payload)?;
                if let Some(address) = announce.address.or(message.sender) {
                    self.learn_addresses(std::iter::once(address));
                }
                let peers = self
                    .known_addresses()
                    .into_iter()
                    .chain(self.peers.addresses())
                    .filter(|a| a != peer.address())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                let list = serde_json::to_value(PeerListPayload { peers })?;
                peer.send(self.message(MessageType::PeerList, list))?;
            }
            MessageType::PeerList => {
                let list: PeerListPayload = serde_json::from_value(message.payload)?;
                self.learn_addresses(list.peers.iter().cloned());
                self.emit(NetworkEvent::PeerList {
                    from: peer.address().to_string(),
                    peers: list.peers,
                });
            }
            MessageType::RequestChain => {
                let chain = self.chain.read().await.blocks.clone();
                let length = chain.len();
                let payload = serde_json::to_value(ChainPayload { chain, length })?;
                peer.send(self.message(MessageType::ChainResponse, payload))?;
            }
            MessageType::ChainResponse => {
                let payload: ChainPayload = serde_json::from_value(message.payload)?;
                self.handle_chain(peer, payload).await;
            }
            MessageType::NewBlock => {
                let block: Block = serde_json::from_value(message.payload)?;
                peer.blocks_received.fetch_add(1, Ordering::Relaxed);
                self.handle_block(peer, block).await;
            }
            MessageType::NewTransaction => {
                let tx: Transaction = serde_json::from_value(message.payload)?;
                peer.transactions_received.fetch_add(1, Ordering::Relaxed);
                self.emit(NetworkEvent::TransactionSeen {
                    id: tx.id(),
                    from: peer.address().to_string(),
                });
            }
            MessageType::Ping => {
                peer.send(self.message(MessageType::Pong, Value::Null))?;
            }
            MessageType::Pong => {}
        }
        Ok(())
    }

    fn learn_addresses(&self, addresses: impl Iterator<Item = String>) {
        let own = self.local_address();
        let mut known = self.known_addresses.lock();
        for address in addresses {
            if Some(&address) != own.as_ref() {
                known.insert(address);
            }
        }
    }

    /// Append a gossiped block only if it is exactly the next one we expect.
    async fn handle_block(&self, peer: &Arc<Peer>, block: Block) {
        let from = peer.address().to_string();
        let index = block.index;

        let mut chain = self.chain.write().await;
        let expected = chain.len() as u64;
        if index != expected {
            drop(chain);
            debug!("Dropping block {} from {}: expected index {}", index, from, expected);
            if index > expected {
                self.sync.update_peer_length(&from, index as usize + 1).await;
            }
            return;
        }
        let result = chain.add_block(block);
        drop(chain);

        match result {
            Ok(()) => {
                info!("Accepted block {} from {}", index, from);
                self.sync.update_peer_length(&from, index as usize + 1).await;
                self.sync.record_block_received(&from).await;
                self.emit(NetworkEvent::BlockAccepted { index, from });
            }
            Err(e) => {
                warn!("Rejected block {} from {}: {}", index, from, e);
                self.sync.record_sync_failure(&from).await;
                self.emit(NetworkEvent::BlockRejected {
                    index,
                    from,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn handle_chain(&self, peer: &Arc<Peer>, payload: ChainPayload) {
        let from = peer.address().to_string();
        let candidate_len = payload.chain.len();
        if payload.length != candidate_len {
            debug!(
                "Peer {} advertised length {} but sent {} blocks",
                from, payload.length, candidate_len
            );
        }
        self.sync.update_peer_length(&from, candidate_len).await;

        let (local_len, result) = {
            let mut chain = self.chain.write().await;
            let local_len = chain.len();
            (local_len, chain.replace_chain(payload.chain))
        };

        match result {
            Ok(length) => {
                self.sync.record_chain_received(&from, true).await;
                self.emit(NetworkEvent::ChainReplaced { length, from });
            }
            Err(e) => {
                info!("{} (offered by {})", e, from);
                if candidate_len > local_len {
                    self.sync.record_sync_failure(&from).await;
                } else {
                    self.sync.record_chain_received(&from, false).await;
                }
                let reason = match e {
                    ChainError::ChainRejected(reason) => reason,
                    other => other.to_string(),
                };
                self.emit(NetworkEvent::ChainKept { from, reason });
            }
        }
    }
}

async fn write_loop(
    peer: Arc<Peer>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    heartbeat: Duration,
    sender: Option<String>,
) {
    let mut closed = peer.closed();
    loop {
        let message = tokio::select! {
            next = outbound.recv() => match next {
                Some(message) => message,
                None => break,
            },
            _ = tokio::time::sleep(heartbeat) => {
                Message::new(MessageType::Ping, Value::Null, sender.clone())
            },
            _ = closed.changed() => break,
        };

        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!("Could not encode message for {}: {}", peer.address(), e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!("Write to {} failed: {}", peer.address(), e);
            break;
        }
        peer.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    peer.close();
    let _ = writer.shutdown().await;
}

/// Reads one newline-terminated frame into `buf`, terminator stripped.
/// Returns `false` at end of stream.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<bool, NetworkError>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = (&mut *reader)
        .take(MAX_FRAME_SIZE as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    if read == 0 {
        return Ok(false);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge(MAX_FRAME_SIZE));
    }
    Ok(true)
}

async fn read_loop(node: Arc<NetworkNode>, peer: Arc<Peer>, reader: OwnedReadHalf) {
    let mut reader = BufReader::new(reader);
    let mut frame = Vec::new();
    let mut closed = peer.closed();

    loop {
        if *closed.borrow() {
            break;
        }
        let next = tokio::select! {
            next = read_frame(&mut reader, &mut frame) => next,
            _ = closed.changed() => break,
        };

        match next {
            Ok(true) => {}
            Ok(false) => {
                debug!("Peer {} closed the connection", peer.address());
                break;
            }
            Err(NetworkError::Io(e)) => {
                debug!("Read from {} failed: {}", peer.address(), e);
                break;
            }
            Err(e) => {
                warn!("Dropping peer {}: {}", peer.address(), e);
                break;
            }
        }
        if frame.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        peer.messages_received.fetch_add(1, Ordering::Relaxed);

        let routed = match Message::from_frame(&frame) {
            Ok(message) => node.route(&peer, message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = routed {
            warn!("Dropping peer {}: {}", peer.address(), e);
            break;
        }
    }

    node.disconnect(&peer).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Blockchain;
    use crate::config::DEVNET_GENESIS_KEY;
    use tokio::sync::RwLock as AsyncRwLock;
    use tokio::time::{sleep, timeout, Instant};

    fn shared_chain() -> SharedChain {
        Arc::new(AsyncRwLock::new(Blockchain::new(DEVNET_GENESIS_KEY, 1)))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn test_message_wire_format() {
        let msg = Message::new(MessageType::RequestChain, Value::Null, Some("127.0.0.1:6000".into()));
        let line = msg.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "request_chain");
        assert_eq!(value["sender"], "127.0.0.1:6000");
        assert_eq!(Message::from_line(&line).unwrap(), msg);
    }

    #[test]
    fn test_missing_payload_and_sender_default() {
        let msg = Message::from_line(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Ping);
        assert_eq!(msg.payload, Value::Null);
        assert!(msg.sender.is_none());
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(matches!(
            Message::from_line("{not json"),
            Err(NetworkError::MalformedFrame(_))
        ));
        assert!(Message::from_line(r#"{"type":"shout","payload":null}"#).is_err());
    }

    #[test]
    fn test_peer_identity_is_address() {
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        assert_eq!(Peer::new("10.0.0.1:6000", tx_a), Peer::new("10.0.0.1:6000", tx_b));
    }

    #[test]
    fn test_broadcast_skips_closed_peers() {
        let registry = PeerRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        registry.insert(Arc::new(Peer::new("a", tx_a)));
        registry.insert(Arc::new(Peer::new("b", tx_b)));
        drop(rx_b);

        let msg = Message::new(MessageType::Ping, Value::Null, None);
        assert_eq!(registry.broadcast(&msg), 1);
        assert_eq!(rx_a.try_recv().unwrap(), msg);
    }

    #[test]
    fn test_registry_keeps_newer_connection() {
        let registry = PeerRegistry::new();
        let (tx_old, _rx_old) = mpsc::unbounded_channel();
        let (tx_new, _rx_new) = mpsc::unbounded_channel();
        let old = Arc::new(Peer::new("a", tx_old));
        let new = Arc::new(Peer::new("a", tx_new));

        registry.insert(Arc::clone(&old));
        assert!(registry.insert(Arc::clone(&new)).is_some());
        assert!(!registry.remove(&old));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(&new));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_connect_announce_and_peer_list() {
        timeout(Duration::from_secs(10), async {
            let server = Arc::new(NetworkNode::new(shared_chain()));
            let addr = server.start_server("127.0.0.1", 0).await.unwrap();

            let client = Arc::new(NetworkNode::new(shared_chain()));
            let client_addr = client.start_server("127.0.0.1", 0).await.unwrap();
            let mut events = client.subscribe();
            client
                .connect_peer("127.0.0.1".to_string(), addr.port())
                .await
                .unwrap();

            assert!(wait_for(|| server.peer_count() == 1).await);
            let event = events.recv().await.unwrap();
            assert!(matches!(event, NetworkEvent::PeerConnected { .. }));
            let event = events.recv().await.unwrap();
            assert!(matches!(event, NetworkEvent::PeerList { .. }));
            assert!(server.known_addresses().contains(&client_addr.to_string()));
        })
        .await
        .expect("test_connect_announce_and_peer_list timed out");
    }

    #[tokio::test]
    async fn test_heartbeat_ping_is_answered() {
        timeout(Duration::from_secs(10), async {
            let server = Arc::new(NetworkNode::new(shared_chain()));
            let addr = server.start_server("127.0.0.1", 0).await.unwrap();
            let client = Arc::new(
                NetworkNode::new(shared_chain()).with_heartbeat(Duration::from_millis(50)),
            );
            let peer = client
                .connect_peer("127.0.0.1".to_string(), addr.port())
                .await
                .unwrap();

            // announce + at least one ping sent, pong and peer list received
            assert!(
                wait_for(|| client
                    .list_peers()
                    .iter()
                    .any(|p| p.address == peer && p.messages_sent >= 2 && p.messages_received >= 2))
                .await
            );
        })
        .await
        .expect("test_heartbeat_ping_is_answered timed out");
    }

    #[tokio::test]
    async fn test_malformed_frame_drops_peer() {
        timeout(Duration::from_secs(10), async {
            let server = Arc::new(NetworkNode::new(shared_chain()));
            let addr = server.start_server("127.0.0.1", 0).await.unwrap();

            let mut raw = TcpStream::connect(addr).await.unwrap();
            assert!(wait_for(|| server.peer_count() == 1).await);
            raw.write_all(b"this is not json\n").await.unwrap();
            assert!(wait_for(|| server.peer_count() == 0).await);
        })
        .await
        .expect("test_malformed_frame_drops_peer timed out");
    }

    #[tokio::test]
    async fn test_oversized_frame_drops_peer() {
        timeout(Duration::from_secs(30), async {
            let server = Arc::new(NetworkNode::new(shared_chain()));
            let addr = server.start_server("127.0.0.1", 0).await.unwrap();

            let mut raw = TcpStream::connect(addr).await.unwrap();
            assert!(wait_for(|| server.peer_count() == 1).await);
            let chunk = vec![b'x'; 1024 * 1024];
            let mut sent = 0;
            while sent <= MAX_FRAME_SIZE {
                if raw.write_all(&chunk).await.is_err() {
                    break;
                }
                sent += chunk.len();
            }
            assert!(wait_for(|| server.peer_count() == 0).await);
        })
        .await
        .expect("test_oversized_frame_drops_peer timed out");
    }

    #[tokio::test]
    async fn test_read_frame_bounds_and_strips_terminator() {
        let mut input: &[u8] = b"{\"type\":\"ping\"}\r\nlast";
        let mut buf = Vec::new();
        assert!(read_frame(&mut input, &mut buf).await.unwrap());
        assert_eq!(Message::from_frame(&buf).unwrap().kind, MessageType::Ping);
        assert!(read_frame(&mut input, &mut buf).await.unwrap());
        assert_eq!(buf, b"last");
        assert!(!read_frame(&mut input, &mut buf).await.unwrap());

        let long = vec![b'a'; MAX_FRAME_SIZE + 10];
        let mut input: &[u8] = &long;
        assert!(matches!(
            read_frame(&mut input, &mut buf).await,
            Err(NetworkError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_partial_frames_are_buffered() {
        timeout(Duration::from_secs(10), async {
            let server = Arc::new(NetworkNode::new(shared_chain()));
            let addr = server.start_server("127.0.0.1", 0).await.unwrap();

            let raw = TcpStream::connect(addr).await.unwrap();
            let (read_half, mut write_half) = raw.into_split();
            write_half.write_all(b"{\"type\":\"pi").await.unwrap();
            sleep(Duration::from_millis(50)).await;
            write_half
                .write_all(b"ng\"}\n{\"type\":\"request_chain\"}\n")
                .await
                .unwrap();

            let mut lines = BufReader::new(read_half).lines();
            let first = Message::from_line(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert_eq!(first.kind, MessageType::Pong);
            let second = Message::from_line(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert_eq!(second.kind, MessageType::ChainResponse);
            let payload: ChainPayload = serde_json::from_value(second.payload).unwrap();
            assert_eq!(payload.length, 1);
            assert_eq!(payload.chain.len(), 1);
        })
        .await
        .expect("test_partial_frames_are_buffered timed out");
    }

    #[tokio::test]
    async fn test_stop_closes_peers() {
        timeout(Duration::from_secs(10), async {
            let server = Arc::new(NetworkNode::new(shared_chain()));
            let addr = server.start_server("127.0.0.1", 0).await.unwrap();
            let client = Arc::new(NetworkNode::new(shared_chain()));
            client
                .connect_peer("127.0.0.1".to_string(), addr.port())
                .await
                .unwrap();
            assert!(wait_for(|| server.peer_count() == 1).await);

            server.stop();
            assert_eq!(server.peer_count(), 0);
            assert!(wait_for(|| client.peer_count() == 0).await);
            assert!(matches!(
                server.connect_peer("127.0.0.1".to_string(), addr.port()).await,
                Err(NetworkError::NotRunning)
            ));
        })
        .await
        .expect("test_stop_closes_peers timed out");
    }
}
