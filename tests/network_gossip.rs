use holdchain::blockchain::{Blockchain, SharedChain};
use holdchain::config::DEVNET_GENESIS_KEY;
use holdchain::crypto::KeyPair;
use holdchain::miner::mine_shared;
use holdchain::network::{NetworkEvent, NetworkNode};
use holdchain::sync::SyncState;
use holdchain::transaction::Transaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, timeout, Instant};

const WAIT: Duration = Duration::from_secs(10);

/// A chain of `length` blocks on the shared devnet genesis.
fn chain_of(length: usize, miner: &str) -> Blockchain {
    let mut chain = Blockchain::new(DEVNET_GENESIS_KEY, 1);
    while chain.len() < length {
        chain.add_transactions(miner, vec![]).unwrap();
    }
    chain
}

fn shared(chain: Blockchain) -> SharedChain {
    Arc::new(RwLock::new(chain))
}

async fn listening_node(chain: SharedChain) -> (Arc<NetworkNode>, u16) {
    let node = Arc::new(NetworkNode::new(chain));
    let addr = node.start_server("127.0.0.1", 0).await.unwrap();
    (node, addr.port())
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < WAIT {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn wait_for_length(chain: &SharedChain, length: usize) -> bool {
    let start = Instant::now();
    while start.elapsed() < WAIT {
        if chain.read().await.len() == length {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn next_matching<F: Fn(&NetworkEvent) -> bool>(
    events: &mut mpsc::UnboundedReceiver<NetworkEvent>,
    matches: F,
) -> NetworkEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel open");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected network event")
}

#[tokio::test]
async fn test_broadcast_block_extends_peer_at_matching_length() {
    let miner = KeyPair::generate().unwrap().public_key_hex();
    let base = chain_of(5, &miner);
    let x_chain = shared(base.clone());
    let y_chain = shared(base);

    let (y, y_port) = listening_node(y_chain.clone()).await;
    let mut y_events = y.subscribe();
    let (x, _) = listening_node(x_chain.clone()).await;
    x.connect_peer("127.0.0.1".to_string(), y_port).await.unwrap();
    assert!(wait_until(|| y.peer_count() == 1).await);

    let block = x_chain
        .write()
        .await
        .add_transactions(&miner, vec![])
        .unwrap();
    assert_eq!(block.index, 5);
    assert_eq!(x.broadcast_block(&block).unwrap(), 1);

    let event = next_matching(&mut y_events, |e| {
        matches!(e, NetworkEvent::BlockAccepted { .. })
    })
    .await;
    assert!(matches!(event, NetworkEvent::BlockAccepted { index: 5, .. }));
    assert_eq!(y_chain.read().await.len(), 6);
    assert_eq!(y_chain.read().await.last_hash(), block.hash);
    assert!(y_chain.read().await.integrity_check());
}

#[tokio::test]
async fn test_block_with_unexpected_index_is_dropped() {
    let miner = KeyPair::generate().unwrap().public_key_hex();
    let base = chain_of(3, &miner);
    let x_chain = shared(base.clone());
    let y_chain = shared(base);

    let (y, y_port) = listening_node(y_chain.clone()).await;
    let (x, _) = listening_node(x_chain.clone()).await;
    x.connect_peer("127.0.0.1".to_string(), y_port).await.unwrap();
    assert!(wait_until(|| y.peer_count() == 1).await);
    let x_addr = y.peer_addresses().remove(0);

    let (skipped, ahead) = {
        let mut chain = x_chain.write().await;
        let skipped = chain.add_transactions(&miner, vec![]).unwrap();
        let ahead = chain.add_transactions(&miner, vec![]).unwrap();
        (skipped, ahead)
    };
    x.broadcast_block(&ahead).unwrap();

    // the peer's advertised length tells us the block arrived and was set aside
    let sync = Arc::clone(y.sync());
    let start = Instant::now();
    loop {
        let seen = sync
            .get_peer_info(&x_addr)
            .await
            .map_or(0, |p| p.advertised_length);
        if seen == 5 {
            break;
        }
        assert!(start.elapsed() < WAIT, "block never reached the peer");
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(y_chain.read().await.len(), 3);

    // in order, both apply
    x.broadcast_block(&skipped).unwrap();
    x.broadcast_block(&ahead).unwrap();
    assert!(wait_for_length(&y_chain, 5).await);
}

#[tokio::test]
async fn test_sync_adopts_longer_valid_chain_and_keeps_local_otherwise() {
    let miner = KeyPair::generate().unwrap().public_key_hex();
    let base = chain_of(6, &miner);

    let y_chain = shared(base.clone());
    let (y, y_port) = listening_node(y_chain.clone()).await;
    let mut y_events = y.subscribe();

    // a peer with a longer chain that fails verification
    let mut forged = base.clone();
    forged.add_transactions(&miner, vec![]).unwrap();
    forged.add_transactions(&miner, vec![]).unwrap();
    forged.blocks[4].nonce += 1;
    let (w, _) = listening_node(shared(forged)).await;
    w.connect_peer("127.0.0.1".to_string(), y_port).await.unwrap();
    assert!(wait_until(|| y.peer_count() == 1).await);

    assert_eq!(y.request_chain_from_peers().await, 1);
    let event = next_matching(&mut y_events, |e| matches!(e, NetworkEvent::ChainKept { .. })).await;
    if let NetworkEvent::ChainKept { reason, .. } = event {
        assert!(reason.contains("integrity"), "unexpected reason: {}", reason);
    }
    assert_eq!(y_chain.read().await.len(), 6);
    assert_eq!(y.sync().get_stats().await.verification_failures, 1);

    // a peer with a longer, sound chain
    let mut longer = base;
    longer.add_transactions(&miner, vec![]).unwrap();
    longer.add_transactions(&miner, vec![]).unwrap();
    let expected_tip = longer.last_hash();
    let (z, _) = listening_node(shared(longer)).await;
    z.connect_peer("127.0.0.1".to_string(), y_port).await.unwrap();
    assert!(wait_until(|| y.peer_count() == 2).await);

    y.request_chain_from_peers().await;
    let event = next_matching(&mut y_events, |e| {
        matches!(e, NetworkEvent::ChainReplaced { .. })
    })
    .await;
    assert!(matches!(event, NetworkEvent::ChainReplaced { length: 8, .. }));
    assert_eq!(y_chain.read().await.len(), 8);
    assert_eq!(y_chain.read().await.last_hash(), expected_tip);
    assert_eq!(y.sync().get_stats().await.chains_replaced, 1);
    assert_eq!(y.sync().get_sync_state().await, SyncState::Synced);
}

#[tokio::test]
async fn test_mined_block_reaches_peer_and_clears_its_mempool() {
    let genesis = {
        let mut secret = [0u8; 32];
        secret[31] = 1;
        KeyPair::from_secret_bytes(&secret).unwrap()
    };
    let miner = KeyPair::generate().unwrap().public_key_hex();

    let x_chain = shared(Blockchain::new(DEVNET_GENESIS_KEY, 1));
    let y_chain = shared(Blockchain::new(DEVNET_GENESIS_KEY, 1));
    let (y, y_port) = listening_node(y_chain.clone()).await;
    let mut y_events = y.subscribe();
    let (x, _) = listening_node(x_chain.clone()).await;
    x.connect_peer("127.0.0.1".to_string(), y_port).await.unwrap();
    assert!(wait_until(|| y.peer_count() == 1).await);

    let tx = Transaction::request(genesis.public_key_hex(), "X")
        .signed(&genesis)
        .unwrap();
    let admitted = x_chain.write().await.submit_transaction(tx.clone()).unwrap();
    y_chain.write().await.submit_transaction(tx).unwrap();
    x.broadcast_transaction(&admitted).unwrap();
    let seen = next_matching(&mut y_events, |e| {
        matches!(e, NetworkEvent::TransactionSeen { .. })
    })
    .await;
    assert!(matches!(seen, NetworkEvent::TransactionSeen { id, .. } if id == admitted.id()));

    let block = mine_shared(&x_chain, &miner, None).await.unwrap().unwrap();
    x.broadcast_block(&block).unwrap();

    assert!(wait_for_length(&y_chain, 2).await);
    let y_chain = y_chain.read().await;
    assert!(y_chain.mempool.is_empty());
    assert_eq!(y_chain.holder_of("X"), Some(DEVNET_GENESIS_KEY));
}
