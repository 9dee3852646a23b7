use batch_selector::{
    config::Config,
    state::{LocalProcessor, StateCache},
    BatchNum, BatchOrchestrator, OnChainTransaction, PoolTransaction,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Everything one selection needs, as read from disk
#[derive(Debug, Deserialize)]
struct Snapshot {
    cache: StateCache,
    pending: Vec<PoolTransaction>,
    #[serde(default)]
    fixed_on_chain: Vec<OnChainTransaction>,
    #[serde(default)]
    future_on_chain: Vec<OnChainTransaction>,
    next_batch: BatchNum,
}

/// Selects one batch from a ledger snapshot and prints it as JSON.
///
/// Usage: `batch-selector <config.toml> <snapshot.json> [--streaming]`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let streaming = args.iter().any(|arg| arg == "--streaming");
    let paths: Vec<&String> = args.iter().filter(|arg| !arg.starts_with("--")).collect();
    let [config_path, snapshot_path] = paths.as_slice() else {
        anyhow::bail!("usage: batch-selector <config.toml> <snapshot.json> [--streaming]");
    };

    let config = Config::load(config_path)?;
    info!("Selector starting with config: {:?}", config);

    let snapshot: Snapshot = serde_json::from_str(&std::fs::read_to_string(snapshot_path)?)?;
    info!(
        "Loaded snapshot: {} accounts, {} pending txs, batch {}",
        snapshot.cache.len(),
        snapshot.pending.len(),
        snapshot.next_batch
    );

    // The cache doubles as the authorization source
    let auths = Arc::new(snapshot.cache.clone());
    let processor = Arc::new(Mutex::new(LocalProcessor::new(snapshot.cache)));
    let orchestrator = BatchOrchestrator::new(processor, auths, &config);

    let selection = if streaming {
        orchestrator
            .select_streaming(
                snapshot.pending,
                snapshot.fixed_on_chain,
                snapshot.future_on_chain,
                snapshot.next_batch,
            )
            .await?
    } else {
        orchestrator
            .select_grouped(
                snapshot.pending,
                snapshot.fixed_on_chain,
                snapshot.future_on_chain,
                snapshot.next_batch,
            )
            .await?
    };

    println!("{}", serde_json::to_string_pretty(&selection)?);
    Ok(())
}
