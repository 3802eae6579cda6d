//! Process entry point for an EP bucket: loads configuration, opens the
//! KVStore, warms up one `VBucket` per configured id, and spawns the
//! background tasks that keep the durable write pipeline moving. Carries no
//! wire protocol or business logic of its own: everything reachable from
//! here is the machinery `ep-core`/`ep-kvstore` already implement.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use ep_core::{CheckpointDestroyer, CheckpointRemover, DurabilityTimeoutTask, ExpiryPager, Flusher, RuntimeContext};
use ep_kvstore::RocksKvStore;
use ep_server::cli::Cli;
use ep_server::warmup;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = cli.load_config()?;
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    std::fs::create_dir_all(&config.data_dir).context("creating data directory")?;

    info!(data_dir = %config.data_dir.display(), num_vbuckets = cli.num_vbuckets, "starting ep-server");

    let ctx = RuntimeContext::new(config.clone());
    let store = Arc::new(RocksKvStore::open(&config.data_dir).context("opening kvstore")?);
    let vbuckets = Arc::new(warmup::open_vbuckets(store.as_ref(), cli.num_vbuckets, &ctx).context("warming up vbuckets")?);

    let flusher = Arc::new(Flusher::new(store.clone(), ctx.flusher_metrics.clone(), config.flusher_batch_size));
    ep_metrics::spawn_monitored_task("flusher", flusher.run(vbuckets.clone(), config.background_task_interval));

    let destroyer = Arc::new(CheckpointDestroyer::new(ctx.reclamation_metrics.clone()));
    ep_metrics::spawn_monitored_task("checkpoint_destroyer", destroyer.clone().run(config.background_task_interval));

    let remover = Arc::new(CheckpointRemover::new(config.clone(), ctx.reclamation_metrics.clone(), destroyer));
    ep_metrics::spawn_monitored_task("checkpoint_remover", remover.run(vbuckets.clone(), config.background_task_interval));

    ep_metrics::spawn_monitored_task("expiry_pager", ExpiryPager::run(vbuckets.clone(), config.expiry_pager_interval));

    ep_metrics::spawn_monitored_task(
        "durability_timeout",
        DurabilityTimeoutTask::run(vbuckets.clone(), config.background_task_interval),
    );

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received, exiting");
    Ok(())
}

/// `EnvFilter`-driven subscriber in the style of the reference workspace's
/// `telemetry-subscribers` crate: reads `RUST_LOG`, defaults
/// to `info`, human-readable unless `--json-logs` is set.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
