//! Fleetbus dispatcher binary.
//!
//! Wires the Redis broker to the dispatcher core, joins the election and
//! runs until a shutdown signal arrives.

mod config;

use std::sync::Arc;

use anyhow::Context;
use fleetbus_dispatcher::Dispatcher;
use shared_bus::{ChannelBus, KeyValue, RedisBroker};
use shared_types::SystemClock;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::RuntimeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let runtime = RuntimeConfig::from_env();
    init_tracing(&runtime.log_filter);

    info!(url = %runtime.redis_url, instance = %runtime.dispatcher.instance_name, "starting");
    let broker = Arc::new(
        RedisBroker::connect(&runtime.redis_url)
            .await
            .context("broker connection failed")?,
    );
    let bus: Arc<dyn ChannelBus> = broker.clone();
    let kv: Arc<dyn KeyValue> = broker;

    let dispatcher = Dispatcher::new(runtime.dispatcher, bus, kv, Arc::new(SystemClock));
    dispatcher
        .initialize()
        .await
        .context("dispatcher initialization failed")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    dispatcher.close().await;
    Ok(())
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
