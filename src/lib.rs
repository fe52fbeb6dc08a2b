//! Holdchain - a proof-of-work ledger of exclusive item holds and the credits that
//! price contention for them
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`blockchain`] - Blocks, the chain, derived item/balance state, integrity and repair
//! - [`transaction`] - Transaction kinds, signing and verification
//! - [`mempool`] - Pending transactions and admission rules
//! - [`economics`] - Reward, request cost, penalty and escrow arithmetic
//!
//! ## Consensus & Mining
//! - [`miner`] - Proof-of-work sealing and block templates
//!
//! ## Cryptography
//! - [`crypto`] - Key pairs and signatures (secp256k1)
//!
//! ## State Management
//! - [`persistence`] - Snapshot file, SQLite and in-memory backends
//!
//! ## Networking
//! - [`network`] - Line-delimited JSON gossip between peers
//! - [`sync`] - Peer chain heights and longest-chain bookkeeping
//! - [`node`] - Orchestrates the ledger, network and background tasks
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod economics;
pub mod mempool;
pub mod transaction;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod miner;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// State Management
// ============================================================================
pub mod persistence;

// ============================================================================
// Networking
// ============================================================================
pub mod network;
pub mod node;
pub mod sync;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
