//! Courier worker
//!
//! Consumes `fifo` orders from the broker queue and cooks them, and serves
//! the courier endpoint the order server calls for `match` orders.

use anyhow::{Context, Result};
use clap::Parser;
use order_dispatch::api::{courier_router, serve};
use order_dispatch::config::bind_addr;
use order_dispatch::{
    AmqpConnector, CliOverrides, HttpCourierClient, OrderDispatcher, PgOrderStore, ProcessRole,
    QueueManager,
};
use services_common::{init_tracing, shutdown_on_ctrl_c};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const SERVICE_NAME: &str = "courier-worker";

#[derive(Debug, Parser)]
#[command(name = SERVICE_NAME, version, about = "Courier queue worker and endpoint")]
struct Cli {
    #[command(flatten)]
    overrides: CliOverrides,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("order_dispatch")?;

    let cli = Cli::parse();
    let config = cli.overrides.resolve(ProcessRole::CourierWorker)?;

    info!("Starting {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));

    let cancel = shutdown_on_ctrl_c();

    let store = PgOrderStore::connect(&config.database.url, config.database.max_connections)
        .await
        .context("connect order database")?;
    store.run_migrations().await.context("run migrations")?;

    let queue = Arc::new(QueueManager::new(
        config.queue.to_queue_config(),
        Arc::new(AmqpConnector::new(config.queue.uri.clone())),
    ));
    // The worker never calls other couriers.
    let dispatcher = Arc::new(OrderDispatcher::new(
        Arc::new(store),
        Arc::new(HttpCourierClient::new(Vec::new())),
        queue.clone(),
    ));

    let receiver = tokio::spawn({
        let queue = Arc::clone(&queue);
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = cancel.clone();
        async move {
            queue
                .run_receiver(cancel, move |body| {
                    let dispatcher = Arc::clone(&dispatcher);
                    async move {
                        debug!("Received message: {}", String::from_utf8_lossy(&body));
                        dispatcher.handle_message(&body).await
                    }
                })
                .await
        }
    });

    let addr = bind_addr(&config.server.worker_addr);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    let served = serve(
        listener,
        courier_router(dispatcher),
        cancel.clone(),
        config.server.shutdown_timeout(),
    )
    .await;

    cancel.cancel();

    match receiver.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Queue receiver aborted: {}", e),
        Err(e) => error!("Queue receiver task failed: {}", e),
    }

    served?;
    info!("Server stopped");
    Ok(())
}
