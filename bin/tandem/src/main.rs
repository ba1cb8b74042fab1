//! Runs one tandem instance next to an execution client.
//!
//! Instances share a Redis: a lease there decides the leader, which builds
//! blocks through its engine and appends them to a stream that every other
//! instance replays into its own engine.

use std::sync::Arc;

use clap::Parser as _;
use eyre::WrapErr as _;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use redis::aio::ConnectionManager;
use tandem_block_builder::BlockBuilder;
use tandem_engine::EngineClient;
use tandem_leadership::{
    Lease, LeaseEvent, LeaseStore, LocalLease, Manager, MemoryLeaseStore, RedisLease,
    RedisLeaseStore,
};
use tandem_replication::{MemoryLog, RedisReplication, ReplicatedState};
use tandem_telemetry_util::init_tracing;
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod args;

use args::{Args, Config};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let config = Args::parse().resolve()?;
    init_tracing(config.log_format, config.log_filter.as_deref())?;

    if let Some(address) = config.metrics_address {
        PrometheusBuilder::new()
            .with_http_listener(address)
            .add_global_label("instance_id", config.instance_id.clone())
            .install()
            .wrap_err("failed to install prometheus exporter")?;
        describe_metrics();
        info!(%address, "serving metrics");
    }

    let engine = EngineClient::new(config.engine_client())?;
    info!(
        instance_id = %config.instance_id,
        engine_url = %config.engine_url,
        dev = config.dev,
        "starting",
    );

    if config.dev {
        let log = MemoryLog::new();
        let state = Arc::new(log.replication(config.instance_id.clone()));
        let (lease, events) = LocalLease::new(MemoryLeaseStore::default(), config.lease());
        return run(&config, engine, state, lease, events).await;
    }

    let client = redis::Client::open(config.redis_url.as_str())
        .wrap_err_with(|| format!("invalid redis url `{}`", config.redis_url))?;
    let connection = ConnectionManager::new(client)
        .await
        .wrap_err("failed connecting to redis")?;
    let state =
        RedisReplication::new(connection.clone(), &config.instance_id, config.redis_timeout).await?;
    let (lease, events) = RedisLease::new(
        RedisLeaseStore::new(connection, config.redis_timeout),
        config.lease(),
    );
    run(&config, engine, state, lease, events).await
}

async fn run<S, L>(
    config: &Config,
    engine: EngineClient,
    state: S,
    lease: Lease<L>,
    events: mpsc::UnboundedReceiver<LeaseEvent>,
) -> eyre::Result<()>
where
    S: ReplicatedState,
    L: LeaseStore,
{
    let lease_shutdown = CancellationToken::new();
    let lease_task = lease.spawn(lease_shutdown.clone());

    let builder = BlockBuilder::new(engine, state, config.block_builder(), CancellationToken::new());
    let handle = Manager::new(builder, lease, events, Default::default()).spawn();

    wait_for_signal().await?;

    let result = handle.shutdown(config.shutdown_timeout).await;
    lease_shutdown.cancel();
    let _ = lease_task.await;
    info!("shutdown complete");
    result
}

async fn wait_for_signal() -> eyre::Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).wrap_err("failed to install SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down gracefully"),
        _ = sigint.recv() => info!("received SIGINT, shutting down gracefully"),
    }
    Ok(())
}

fn describe_metrics() {
    describe_gauge!("tandem_is_leader", "1 while this instance produces blocks");
    describe_gauge!(
        "tandem_execution_head_height",
        "Height of the execution head as last seen by this instance"
    );
    describe_counter!("tandem_blocks_built_total", "Blocks built and published as leader");
    describe_counter!(
        "tandem_blocks_finalized_total",
        "Blocks made canonical, by who applied them"
    );
    describe_counter!(
        "tandem_empty_blocks_skipped_total",
        "Build attempts skipped because the pool was empty"
    );
    describe_counter!(
        "tandem_log_entries_discarded_total",
        "Log entries acknowledged without being applied"
    );
    describe_histogram!(
        "tandem_engine_request_duration_seconds",
        "Latency of execution client calls, by endpoint"
    );
    describe_counter!(
        "tandem_engine_request_errors_total",
        "Failed execution client calls, by endpoint"
    );
}
