use holdchain::config::{Config, StorageBackend, DEVNET_GENESIS_KEY};
use holdchain::crypto::KeyPair;
use holdchain::node::Node;
use holdchain::transaction::Transaction;
use std::time::Duration;

/// Secret key 1 pairs with the devnet genesis key, so it owns the genesis credits.
fn devnet_genesis() -> KeyPair {
    let mut secret = [0u8; 32];
    secret[31] = 1;
    let key = KeyPair::from_secret_bytes(&secret).unwrap();
    assert_eq!(key.public_key_hex(), DEVNET_GENESIS_KEY);
    key
}

fn config_for(dir: &tempfile::TempDir, backend: StorageBackend) -> Config {
    let mut config = Config::default();
    config.ledger.difficulty = 1;
    config.ledger.backend = backend;
    config.ledger.snapshot_path = dir
        .path()
        .join("data")
        .join("ledger.db")
        .to_string_lossy()
        .into_owned();
    config.network.listen_host = "127.0.0.1".to_string();
    config.network.p2p_port = 0;
    config
}

async fn exercise_backend(backend: StorageBackend) {
    let dir = tempfile::tempdir().unwrap();
    let genesis = devnet_genesis();
    let miner = KeyPair::generate().unwrap();
    let other = KeyPair::generate().unwrap();

    let mut config = config_for(&dir, backend);
    config.miner.public_key = Some(miner.public_key_hex());

    let original = {
        let node = Node::init(config.clone()).unwrap();
        node.submit(
            Transaction::request(genesis.public_key_hex(), "X")
                .signed(&genesis)
                .unwrap(),
        )
        .await
        .unwrap();
        node.submit(
            Transaction::transfer(genesis.public_key_hex(), other.public_key_hex(), 7.25)
                .signed(&genesis)
                .unwrap(),
        )
        .await
        .unwrap();
        node.mine().await.unwrap().expect("block mined");

        // left pending so the mempool is part of the image
        node.submit(
            Transaction::request(other.public_key_hex(), "X")
                .signed(&other)
                .unwrap(),
        )
        .await
        .unwrap();
        node.shutdown().await.unwrap();
        let chain = node.blockchain.read().await.clone();
        chain
    };

    let reloaded = Node::init(config).unwrap();
    let chain = reloaded.blockchain.read().await;
    assert_eq!(chain.blocks, original.blocks);
    assert_eq!(chain.mempool, original.mempool);
    assert_eq!(chain.state, original.state);
    assert_eq!(chain.len(), 2);
    assert_eq!(chain.mempool.len(), 1);
    assert_eq!(chain.holder_of("X"), Some(DEVNET_GENESIS_KEY));
    assert_eq!(chain.balance(&other.public_key_hex()), 7.25);
    assert!(chain.integrity_check());
}

#[tokio::test]
async fn test_snapshot_backend_round_trip() {
    tokio::time::timeout(Duration::from_secs(30), exercise_backend(StorageBackend::Snapshot))
        .await
        .expect("snapshot round trip timed out");
}

#[tokio::test]
async fn test_sqlite_backend_round_trip() {
    tokio::time::timeout(Duration::from_secs(30), exercise_backend(StorageBackend::Sqlite))
        .await
        .expect("sqlite round trip timed out");
}

#[tokio::test]
async fn test_corrupt_snapshot_is_repaired_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir, StorageBackend::Snapshot);
    let miner = KeyPair::generate().unwrap().public_key_hex();

    {
        let node = Node::init(config.clone()).unwrap();
        let mut chain = node.blockchain.write().await;
        for _ in 0..3 {
            chain.add_transactions(&miner, vec![]).unwrap();
        }
        chain.blocks[2].timestamp += 1;
        chain.snapshot(&config.ledger.snapshot_path).unwrap();
    }

    let node = Node::init(config).unwrap();
    let chain = node.blockchain.read().await;
    assert_eq!(chain.len(), 2);
    assert!(chain.integrity_check());
}
