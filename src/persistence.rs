//! Persistence backends for Holdchain: snapshot file, SQLite database, in-memory

use crate::blockchain::{Block, Blockchain, LedgerState};
use crate::error::ChainError;
use crate::mempool::Mempool;
use crate::transaction::Transaction;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Abstraction for persistence backends. Implementations must save the whole
/// ledger atomically: a crash leaves either the old image or the new one.
pub trait Persistence: Send + Sync {
    fn save(&self, chain: &Blockchain) -> Result<(), ChainError>;
    /// `None` when nothing has been saved yet.
    fn load(&self) -> Result<Option<Blockchain>, ChainError>;
}

/// A single JSON image of the ledger (blocks, difficulty, mempool, derived state).
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Persistence for SnapshotFile {
    fn save(&self, chain: &Blockchain) -> Result<(), ChainError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let bytes = serde_json::to_vec_pretty(chain)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| ChainError::IoError(format!("Failed to persist snapshot: {}", e.error)))?;

        debug!("Wrote snapshot of {} blocks to {}", chain.len(), self.path.display());
        Ok(())
    }

    fn load(&self) -> Result<Option<Blockchain>, ChainError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)?;
        let mut chain: Blockchain = serde_json::from_slice(&bytes)?;
        // Derived state is never trusted from disk.
        chain.rebuild_state();
        info!("Loaded snapshot of {} blocks from {}", chain.len(), self.path.display());
        Ok(Some(chain))
    }
}

impl Blockchain {
    /// Write the whole ledger to `path` atomically.
    pub fn snapshot(&self, path: impl AsRef<Path>) -> Result<(), ChainError> {
        SnapshotFile::new(path.as_ref()).save(self)
    }

    /// Read a ledger previously written with [`Blockchain::snapshot`].
    pub fn load(path: impl AsRef<Path>) -> Result<Blockchain, ChainError> {
        let path = path.as_ref();
        SnapshotFile::new(path).load()?.ok_or_else(|| {
            ChainError::IoError(format!("No snapshot at {}", path.display()))
        })
    }
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                idx INTEGER PRIMARY KEY,
                hash TEXT NOT NULL,
                prev_hash TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                nonce INTEGER NOT NULL,
                transactions TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create blocks table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| {
            ChainError::DatabaseError(format!("Failed to create metadata table: {}", e))
        })?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ChainError> {
        self.conn
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }

    /// Replace the stored ledger with `chain` inside one SQLite transaction.
    pub fn save_blockchain(&self, chain: &Blockchain) -> Result<(), ChainError> {
        let conn_guard = self.lock()?;
        let tx = conn_guard.unchecked_transaction().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to start transaction: {}", e))
        })?;

        tx.execute("DELETE FROM blocks", [])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to clear blocks: {}", e)))?;

        for block in &chain.blocks {
            let transactions_json = serde_json::to_string(&block.transactions).map_err(|e| {
                ChainError::DatabaseError(format!("Failed to serialize transactions: {}", e))
            })?;
            tx.execute(
                "INSERT INTO blocks (idx, hash, prev_hash, timestamp, nonce, transactions)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    block.index as i64,
                    block.hash,
                    block.prev_hash,
                    block.timestamp as i64,
                    block.nonce as i64,
                    transactions_json,
                ],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to save block: {}", e)))?;
        }

        let mempool_json = serde_json::to_string(&chain.mempool).map_err(|e| {
            ChainError::DatabaseError(format!("Failed to serialize mempool: {}", e))
        })?;
        for (key, value) in [
            ("difficulty", chain.difficulty.to_string()),
            ("genesis_key", chain.genesis_key.clone()),
            ("mempool", mempool_json),
        ] {
            tx.execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to save {}: {}", key, e)))?;
        }

        tx.commit().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to commit transaction: {}", e))
        })?;
        Ok(())
    }

    fn metadata(conn: &Connection, key: &str) -> Result<Option<String>, ChainError> {
        conn.query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| ChainError::DatabaseError(format!("Failed to read {}: {}", key, e)))
    }

    /// Load the stored blocks and rebuild derived state by replay.
    pub fn load_blockchain(&self) -> Result<Option<Blockchain>, ChainError> {
        let conn_guard = self.lock()?;
        let mut stmt = conn_guard
            .prepare(
                "SELECT idx, hash, prev_hash, timestamp, nonce, transactions
                 FROM blocks ORDER BY idx ASC",
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                let index: i64 = row.get(0)?;
                let hash: String = row.get(1)?;
                let prev_hash: String = row.get(2)?;
                let timestamp: i64 = row.get(3)?;
                let nonce: i64 = row.get(4)?;
                let transactions_json: String = row.get(5)?;
                Ok((index, hash, prev_hash, timestamp, nonce, transactions_json))
            })
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query blocks: {}", e)))?;

        let mut blocks = Vec::new();
        for row in rows {
            let (index, hash, prev_hash, timestamp, nonce, transactions_json) = row
                .map_err(|e| ChainError::DatabaseError(format!("Failed to load block: {}", e)))?;
            let transactions: Vec<Transaction> = serde_json::from_str(&transactions_json)?;
            blocks.push(Block {
                index: index as u64,
                prev_hash,
                transactions,
                nonce: nonce as u64,
                timestamp: timestamp as u64,
                hash,
            });
        }

        if blocks.is_empty() {
            return Ok(None);
        }

        let difficulty = Self::metadata(&conn_guard, "difficulty")?
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(2);
        let genesis_key = Self::metadata(&conn_guard, "genesis_key")?.unwrap_or_default();
        let mempool = match Self::metadata(&conn_guard, "mempool")? {
            Some(json) => serde_json::from_str(&json)?,
            None => Mempool::new(),
        };

        let mut chain = Blockchain {
            blocks,
            difficulty,
            genesis_key,
            mempool,
            state: LedgerState::new(),
        };
        chain.rebuild_state();
        Ok(Some(chain))
    }
}

impl Persistence for Database {
    fn save(&self, chain: &Blockchain) -> Result<(), ChainError> {
        self.save_blockchain(chain)
    }

    fn load(&self) -> Result<Option<Blockchain>, ChainError> {
        self.load_blockchain()
    }
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    saved: Arc<Mutex<Option<Blockchain>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks in the last saved image.
    pub fn saved_len(&self) -> usize {
        self.saved
            .lock()
            .map(|saved| saved.as_ref().map_or(0, Blockchain::len))
            .unwrap_or(0)
    }
}

impl Persistence for InMemoryPersistence {
    fn save(&self, chain: &Blockchain) -> Result<(), ChainError> {
        let mut saved = self
            .saved
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))?;
        *saved = Some(chain.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<Blockchain>, ChainError> {
        let saved = self
            .saved
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))?;
        Ok(saved.clone())
    }
}
