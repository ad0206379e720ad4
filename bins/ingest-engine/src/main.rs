//! Ingest engine: consumes configured Kafka topics and writes them into
//! transactionally-versioned, partitioned tables in object storage.
//!
//! Loads and validates an `EngineConfig` document, builds the shared state
//! every topic pipeline needs (object store client, table writer, schema
//! manager client, dead-letter router, per-dependency circuit breakers,
//! health registry), spawns one `TopicPipeline` task per configured topic
//! plus the health/metrics server, and waits for `SIGINT`/`SIGTERM` to drive
//! a bounded graceful shutdown.

mod optimizer_task;
mod pipeline;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ingest_core::{CircuitStatus, CommitCache, EngineConfig, GlobalMemoryTracker};
use ingest_io::{build_object_store, DeadLetterRouter, HealthRegistry, SchemaRegistryClient, TableWriter};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use validator::Validate;

#[derive(Parser, Debug)]
#[command(name = "ingest-engine", about = "Streaming log-to-table ingest engine")]
struct Cli {
    /// Path to the engine's YAML configuration document.
    #[arg(short, long, default_value = "config/engine.yaml")]
    config: PathBuf,
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let parsed: EngineConfig = serde_yaml::from_str(&text)
        .with_context(|| format!("failed to parse {} as YAML", path.display()))?;

    // Layer `INGEST__`-prefixed environment overrides on top of the parsed
    // document (e.g. `INGEST__STORE__SECRET_KEY` overrides `store.secretKey`).
    let layered = config::Config::builder()
        .add_source(config::Config::try_from(&parsed)?)
        .add_source(config::Environment::with_prefix("INGEST").separator("__"))
        .build()
        .context("failed to layer environment overrides onto configuration")?;
    let engine_config: EngineConfig = layered
        .try_deserialize()
        .context("failed to deserialize layered configuration")?;
    engine_config.validate().context("configuration failed validation")?;
    engine_config.validate_topics().context("topic configuration failed validation")?;
    Ok(engine_config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    info!(topics = config.topics.len(), config = %cli.config.display(), "loaded configuration");

    let registry = ingest_core::TopicRegistry::from_config(&config);
    let commit_cache = Arc::new(CommitCache::new());
    let store = build_object_store(&config.store)?;
    let table_writer = Arc::new(TableWriter::new(store.clone(), commit_cache));
    let optimizer = Arc::new(ingest_io::Optimizer::new(store));
    let schema_registry =
        SchemaRegistryClient::new(config.schema_registry.endpoint.clone(), Duration::from_secs(config.schema_registry.cache_ttl_seconds));
    let dlr = Arc::new(DeadLetterRouter::new(&config.broker.endpoints).context("failed to construct dead-letter producer")?);
    let health = HealthRegistry::new();
    // Shared across every topic pipeline (the memory budget is a global
    // setting, not per-topic) so a memory-hungry topic sheds its own oldest
    // batch before a quieter sibling is ever asked to.
    let memory = GlobalMemoryTracker::new();

    // One breaker per topic — a schema break or a persistently failing store
    // on one topic must not stop a healthy sibling topic.
    let circuits: HashMap<String, Arc<CircuitStatus>> = registry
        .iter()
        .map(|(logical_name, _)| {
            let circuit = CircuitStatus::new(
                config.circuit.failure_threshold,
                config.circuit.success_threshold,
                Duration::from_secs(config.circuit.open_timeout_seconds),
            );
            (logical_name.to_string(), circuit)
        })
        .collect();

    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    let health_addr: SocketAddr = config
        .global
        .health_bind_addr
        .parse()
        .with_context(|| format!("invalid global.healthBindAddr '{}'", config.global.health_bind_addr))?;
    let health_for_server = health.clone();
    tasks.spawn(async move {
        if let Err(e) = ingest_io::health::serve(health_addr, health_for_server).await {
            error!(error = %e, "health server exited");
        }
    });

    for (logical_name, spec) in registry.iter() {
        let circuit = circuits.get(logical_name).expect("circuit built for every registered topic").clone();
        let driver = pipeline::TopicPipeline::new(
            logical_name.to_string(),
            spec.clone(),
            config.broker.clone(),
            config.global.clone(),
            table_writer.clone(),
            schema_registry.clone(),
            dlr.clone(),
            circuit,
            health.clone(),
            memory.clone(),
            shutdown.clone(),
        );
        tasks.spawn(async move { driver.run().await });

        // One optimizer worker per table: ticks independently of
        // ingest and never blocks it.
        let optimizer_driver = optimizer_task::OptimizerTask::new(
            logical_name.to_string(),
            spec.clone(),
            table_writer.clone(),
            optimizer.clone(),
            config.global.reader_max_lookback_hours,
            shutdown.clone(),
        );
        tasks.spawn(async move { optimizer_driver.run().await });
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received; draining open batches");
    shutdown.cancel();

    let grace = Duration::from_secs(config.global.graceful_stop_seconds);
    let drain = async {
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "pipeline task panicked during shutdown");
            }
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        error!(grace_seconds = grace.as_secs(), "graceful stop window elapsed; aborting remaining tasks");
        tasks.abort_all();
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
