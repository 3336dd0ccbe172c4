//! Mediaflow Worker Binary
//!
//! Consumes the shared RPC queue and dispatches requests to every built-in
//! capability enabled in `[capabilities.<name>]`. Runs until Ctrl-C, then
//! stops taking new deliveries and lets in-flight ones finish.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

use mediaflow_core::capabilities::builtin_catalog;
use mediaflow_core::config::ConfigManager;
use mediaflow_core::logging::init_structured_logging;
use mediaflow_core::messaging::{
    BackoffPolicy, ConnectionManager, ConsumerSettings, JsonRpcDispatcher, RabbitMqConnector,
    RpcConsumer,
};
use mediaflow_core::registry::{discover, global, CapabilityRegistry};
use mediaflow_core::stages::StageConfigLoader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging();

    let manager = ConfigManager::load().context("loading configuration")?;
    let config = manager.config();
    info!(
        environment = manager.environment(),
        broker = %manager.broker_url_redacted(),
        queue = %config.broker.rpc_queue,
        "Starting mediaflow worker"
    );

    let capabilities = discover(&builtin_catalog(), &manager.capability_settings());
    if capabilities.is_empty() {
        warn!("No capability is remote_enabled; the worker will answer every call with -32601");
    }

    let stage_loader = StageConfigLoader::new(manager.stages_directory());
    let registry = CapabilityRegistry::build_with_stage_loader(capabilities, &stage_loader)
        .context("building capability registry")?;
    let registry = global::install(registry).context("installing capability registry")?;
    info!(methods = ?registry.list_methods(), "Capabilities registered");

    let connection = Arc::new(ConnectionManager::new(
        Arc::new(RabbitMqConnector::new(&config.broker)),
        BackoffPolicy::from_config(&config.broker.reconnect),
    ));
    let consumer = RpcConsumer::new(
        Arc::clone(&connection),
        JsonRpcDispatcher::new(registry),
        ConsumerSettings::from_config(config),
    );
    let handle = consumer
        .start_consuming()
        .await
        .context("starting RPC consumer")?;
    info!("Worker ready");

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    handle.shutdown();
    match handle.join().await {
        Ok(stats) => info!(
            received = stats.received,
            replied = stats.replied,
            error_replies = stats.error_replies,
            reply_failures = stats.reply_failures,
            "Consumer drained"
        ),
        Err(e) => warn!(error = %e, "Consumer stopped with an error"),
    }
    connection.close().await.context("closing broker connection")?;

    info!("Worker stopped");
    Ok(())
}
