//! `utxod`: validates blocks and loose transactions into a local chain store.

mod config;
mod import;
mod relay;
mod store;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use utxod_chainstate::ValidationEngine;
use utxod_consensus::{chain_params, hash256_to_hex};
use utxod_primitives::address::Address;
use utxod_primitives::block::Block;
use utxod_primitives::genesis::genesis_block;
use utxod_primitives::transaction::Transaction;

use crate::config::{Config, Overrides};
use crate::store::{Store, Verifier};

type Engine = ValidationEngine<Arc<Store>, Verifier>;

#[derive(Parser, Debug)]
#[command(name = "utxod", version, about = "UTXO chain validation node")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a file of length-framed raw blocks
    Import { file: PathBuf },
    /// Submit a hex-encoded transaction to the pending pool
    SubmitTx { hex: String },
    /// Submit a hex-encoded block
    SubmitBlock { hex: String },
    /// Print the chain tip and store statistics
    Status,
    /// Print the balance of an address
    Balance { address: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref(), &cli.overrides)?;
    init_logging(config.log_level.as_deref());

    let store = Arc::new(Store::open(&config)?);
    let mut engine = ValidationEngine::with_header_cache_capacity(
        Arc::clone(&store),
        chain_params(config.network),
        config.engine,
        Verifier::new(config.script_checks),
        config.header_cache_capacity,
    );
    let relay = relay::spawn(engine.subscribe());
    info!(
        "utxod {} on {} ({:?} backend)",
        env!("CARGO_PKG_VERSION"),
        config.network.as_str(),
        config.backend
    );
    seed_genesis(&mut engine)?;

    let engine = match cli.command {
        Command::Import { file } => run_import(engine, file).await?,
        Command::SubmitTx { hex } => {
            submit_tx(&mut engine, &hex)?;
            engine
        }
        Command::SubmitBlock { hex } => {
            submit_block(&mut engine, &hex)?;
            engine
        }
        Command::Status => {
            print_status(&mut engine)?;
            engine
        }
        Command::Balance { address } => {
            print_balance(&engine, &address)?;
            engine
        }
    };

    drop(engine);
    let counts = relay
        .join()
        .map_err(|_| anyhow!("relay thread panicked"))?;
    debug!("relay: {counts:?}");
    store.persist().context("failed to sync store")?;
    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: Option<&str>) {
    let env = env_logger::Env::default().default_filter_or(level.unwrap_or("info"));
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .init();
}

fn seed_genesis(engine: &mut Engine) -> anyhow::Result<()> {
    if engine.store().mainchain_tip_hash()?.is_some() {
        return Ok(());
    }
    let genesis = genesis_block(engine.params().network);
    let hash = genesis.hash();
    if hash != engine.params().consensus.hash_genesis_block {
        return Err(anyhow!(
            "built-in genesis {} does not match network parameters",
            hash256_to_hex(&hash)
        ));
    }
    engine
        .process_block(&genesis, true, None)
        .context("failed to store genesis block")?;
    info!("stored genesis block {}", hash256_to_hex(&hash));
    Ok(())
}

async fn run_import(mut engine: Engine, file: PathBuf) -> anyhow::Result<Engine> {
    let cancel = Arc::new(AtomicBool::new(false));
    let signal = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the block in flight");
            signal.store(true, Ordering::SeqCst);
        }
    });

    let (engine, summary) = tokio::task::spawn_blocking(move || {
        let summary = import::import_file(&mut engine, &file, &cancel);
        (engine, summary)
    })
    .await
    .context("import worker failed")?;
    let summary = summary?;
    println!(
        "read {} blocks: {} accepted, {} rejected{}",
        summary.read,
        summary.accepted,
        summary.rejected,
        if summary.cancelled { " (interrupted)" } else { "" }
    );
    Ok(engine)
}

fn decode_hex(input: &str) -> anyhow::Result<Vec<u8>> {
    hex::decode(input.trim()).context("invalid hex")
}

fn submit_tx(engine: &mut Engine, input: &str) -> anyhow::Result<()> {
    let tx = Transaction::decode(&decode_hex(input)?).context("invalid transaction")?;
    let txid = hash256_to_hex(&tx.txid());
    match engine.process_transaction(&tx, true) {
        Ok(true) => println!("accepted {txid}"),
        Ok(false) => println!("rejected {txid}"),
        Err(err) => match err.as_validation() {
            Some(reason) if reason.is_missing_inputs() => {
                println!("orphan {txid}: waiting for inputs")
            }
            Some(reason) => return Err(anyhow!("rejected {txid}: {reason}")),
            None => return Err(err.into()),
        },
    }
    Ok(())
}

fn submit_block(engine: &mut Engine, input: &str) -> anyhow::Result<()> {
    let block = Block::decode(&decode_hex(input)?).context("invalid block")?;
    let hash = hash256_to_hex(&block.hash());
    match engine.process_block(&block, true, None) {
        Ok(_) => {
            if engine.store().is_block_orphan(&block.hash())? {
                println!("orphan {hash}: parent unknown");
            } else {
                println!("accepted {hash}");
            }
            Ok(())
        }
        Err(err) => match err.as_validation() {
            Some(reason) => Err(anyhow!("rejected {hash}: {reason}")),
            None => Err(err.into()),
        },
    }
}

fn print_status(engine: &mut Engine) -> anyhow::Result<()> {
    let network = engine.params().network;
    println!("network: {}", network.as_str());
    match engine.store().mainchain_tip_hash()? {
        Some(tip) => {
            let height = engine
                .store()
                .block_record(&tip)?
                .map(|record| record.height)
                .ok_or_else(|| anyhow!("tip {} has no block record", hash256_to_hex(&tip)))?;
            println!("tip: {} (height {height})", hash256_to_hex(&tip));
        }
        None => println!("tip: none"),
    }
    match engine.latest_checkpoint_hash()? {
        Some(hash) => {
            let height = engine.height_of_checkpoint(&hash).unwrap_or(0);
            println!("checkpoint: {} (height {height})", hash256_to_hex(&hash));
        }
        None => println!("checkpoint: none"),
    }
    let stats = engine.store().stats()?;
    println!("blocks: {}", stats.blocks);
    println!("transactions: {}", stats.txs);
    println!("outputs: {}", stats.outputs);
    println!("utxos: {}", stats.utxos);
    println!("pending: {}", stats.unconfirmed_txs);
    Ok(())
}

fn print_balance(engine: &Engine, address: &str) -> anyhow::Result<()> {
    let params = engine.params();
    Address::decode(
        address,
        params.pubkey_address_prefix,
        params.script_address_prefix,
    )
    .with_context(|| format!("invalid address {address}"))?;
    let balance = engine.store().address_balance(address)?;
    let ledger = engine.store().address_ledger_balance(address)?;
    if balance != ledger {
        warn!("{address}: utxo balance {balance} disagrees with ledger {ledger}");
    }
    println!("{address}: {}", format_amount(balance));
    Ok(())
}

fn format_amount(amount: i64) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{sign}{}.{:08}", abs / 100_000_000, abs % 100_000_000)
}
