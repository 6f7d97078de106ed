//! Order server
//!
//! Accepts orders over HTTP, dispatches `match` orders straight to a courier
//! and publishes `fifo` orders to the broker queue.

use anyhow::{Context, Result};
use clap::Parser;
use order_dispatch::api::{order_router, serve};
use order_dispatch::config::bind_addr;
use order_dispatch::{
    AmqpConnector, CliOverrides, HttpCourierClient, OrderDispatcher, PgOrderStore, ProcessRole,
    QueueManager,
};
use services_common::{init_tracing, shutdown_on_ctrl_c};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

const SERVICE_NAME: &str = "order-server";

#[derive(Debug, Parser)]
#[command(name = SERVICE_NAME, version, about = "Courier order intake server")]
struct Cli {
    #[command(flatten)]
    overrides: CliOverrides,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("order_dispatch")?;

    let cli = Cli::parse();
    let config = cli.overrides.resolve(ProcessRole::OrderServer)?;

    info!("Starting {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));
    info!("Couriers: {:?}", config.couriers.endpoints);

    let cancel = shutdown_on_ctrl_c();

    let store = PgOrderStore::connect(&config.database.url, config.database.max_connections)
        .await
        .context("connect order database")?;
    store.run_migrations().await.context("run migrations")?;

    let queue = Arc::new(QueueManager::new(
        config.queue.to_queue_config(),
        Arc::new(AmqpConnector::new(config.queue.uri.clone())),
    ));
    let courier = HttpCourierClient::new(config.couriers.endpoints.clone());
    let dispatcher = Arc::new(OrderDispatcher::new(
        Arc::new(store),
        Arc::new(courier),
        queue.clone(),
    ));

    let sender = tokio::spawn({
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        async move { queue.run_sender(cancel).await }
    });

    let addr = bind_addr(&config.server.order_addr);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    let served = serve(
        listener,
        order_router(dispatcher),
        cancel.clone(),
        config.server.shutdown_timeout(),
    )
    .await;

    // A failed listener must stop the sender too.
    cancel.cancel();

    match sender.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Queue sender aborted: {}", e),
        Err(e) => error!("Queue sender task failed: {}", e),
    }

    served?;
    info!("Server stopped");
    Ok(())
}
