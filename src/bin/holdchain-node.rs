#![forbid(unsafe_code)]
//! Holdchain node: run a peer, generate keys, inspect or repair the saved ledger

use clap::{Parser, Subcommand};
use colored::*;
use holdchain::config::{load_config, Config};
use holdchain::crypto::KeyPair;
use holdchain::node::{open_persistence, Node};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = "config.toml")]
    config: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs a node until interrupted
    Run {
        /// Mine pending transactions every N seconds (requires miner.public_key)
        #[arg(long)]
        mine_interval: Option<u64>,
    },
    /// Generates a new key pair
    Keygen,
    /// Shows the saved ledger without starting the network
    Status {
        /// Also show the balance of this public key
        #[arg(long)]
        key: Option<String>,
    },
    /// Checks the saved ledger and truncates it before the first bad block
    Repair,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Keygen => keygen()?,
        Commands::Run { mine_interval } => {
            let config = load_config(&cli.config)?;
            run(config, *mine_interval).await?;
        }
        Commands::Status { key } => {
            let config = load_config(&cli.config)?;
            status(&config, key.as_deref())?;
        }
        Commands::Repair => {
            let config = load_config(&cli.config)?;
            repair(&config)?;
        }
    }

    Ok(())
}

fn keygen() -> Result<(), Box<dyn std::error::Error>> {
    let keypair = KeyPair::generate()?;
    println!("{}", "New key pair".bright_cyan().bold());
    println!("  public: {}", keypair.public_key_hex().bright_green());
    println!("  secret: {}", keypair.secret_hex().bright_yellow());
    println!("{}", "Keep the secret key private.".dimmed());
    Ok(())
}

async fn run(config: Config, mine_interval: Option<u64>) -> Result<(), Box<dyn std::error::Error>> {
    let node = Arc::new(Node::init(config)?);
    let addr = node.start().await?;

    println!("{}", "Holdchain node running".bright_cyan().bold());
    println!("  listening: {}", addr.to_string().bright_yellow());
    println!("  blocks:    {}", node.blockchain.read().await.len());
    println!("  peers:     {}", node.network.peer_count());

    if let Some(secs) = mine_interval.filter(|s| *s > 0) {
        if node.config.miner.public_key.is_none() {
            return Err("--mine-interval needs miner.public_key in the config".into());
        }
        let miner = Arc::clone(&node);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            loop {
                ticker.tick().await;
                if miner.blockchain.read().await.mempool.is_empty() {
                    continue;
                }
                match miner.mine().await {
                    Ok(Some(block)) => info!("Mined block {}", block.index),
                    Ok(None) => {}
                    Err(e) => error!("Mining failed: {}", e),
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    println!("{}", "Shutting down...".yellow());
    node.shutdown().await?;
    Ok(())
}

fn status(config: &Config, key: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let persistence = open_persistence(config);
    let Some(chain) = persistence.load()? else {
        println!("{}", "No saved ledger yet.".yellow());
        return Ok(());
    };

    let integrity = if chain.integrity_check() {
        "sound".bright_green()
    } else {
        "CORRUPT".bright_red().bold()
    };
    println!("{}", "Ledger status".bright_cyan().bold());
    println!("  blocks:     {}", chain.len());
    println!("  tip:        {}", chain.last_hash());
    println!("  difficulty: {}", chain.difficulty);
    println!("  mempool:    {}", chain.mempool.len());
    println!("  integrity:  {}", integrity);

    let allocation = chain.allocation();
    println!("  held items: {}", allocation.len());
    for uid in &allocation {
        let holder = chain.holder_of(uid).unwrap_or("?");
        println!(
            "    {} held by {}… value {:.4}",
            uid.bright_white(),
            &holder[..holder.len().min(16)],
            chain.item_value(uid)
        );
    }

    if let Some(key) = key {
        println!(
            "  balance:    {:.4} (pending {:.4})",
            chain.balance(key),
            chain.pending_balance(key)
        );
    }
    Ok(())
}

fn repair(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let persistence = open_persistence(config);
    let Some(mut chain) = persistence.load()? else {
        println!("{}", "No saved ledger yet.".yellow());
        return Ok(());
    };

    match chain.find_bad_block() {
        None => {
            println!("{}", "Chain is sound; no repair needed.".bright_green());
        }
        Some(bad) => {
            println!("First bad block: {}", bad.to_string().bright_red());
            chain.repair();
            persistence.save(&chain)?;
            println!(
                "{} {} blocks kept.",
                "Repaired.".bright_green(),
                chain.len()
            );
        }
    }
    Ok(())
}
