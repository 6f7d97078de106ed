//! Common test utilities and fixtures

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use order_dispatch::{
    DispatchMode, InMemoryBroker, InMemoryOrderStore, OrderRecord, OrderRequest, OrderStatus,
    OrderStore, QueueConfig,
};

static INIT: Once = Once::new();

/// Initialize logging for tests
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "order_dispatch=debug,warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

/// Queue name used by every integration test
pub const TEST_QUEUE: &str = "courier_orders_test";

/// Queue settings with short delays so reconnect paths run quickly
pub fn fast_queue_config() -> QueueConfig {
    QueueConfig {
        queue_name: TEST_QUEUE.to_string(),
        enqueue_timeout: Duration::from_millis(200),
        publish_timeout: Duration::from_millis(500),
        reconnect_delay: Duration::from_millis(50),
        ..QueueConfig::default()
    }
}

/// Order request with a dispatch mode already attached
pub fn order_request(id: &str, prep_time: i64, mode: DispatchMode) -> OrderRequest {
    OrderRequest::new(id, format!("Dish {id}"), prep_time).with_mode(mode)
}

/// Fresh in-memory store and broker
pub fn memory_backends() -> (Arc<InMemoryOrderStore>, InMemoryBroker) {
    (Arc::new(InMemoryOrderStore::new()), InMemoryBroker::new())
}

/// Record with fixed id and timestamps, for seeding stores directly
pub fn seeded_record(
    order_id: &str,
    external_id: &str,
    mode: DispatchMode,
    prep_time: i64,
    elapsed_ms: i64,
) -> OrderRecord {
    let mut record = OrderRecord::started(&OrderRequest::new(external_id, "Seeded", prep_time), mode);
    record.order_id = order_id.to_string();
    record.status = OrderStatus::Finished;
    record.updated_at = record.created_at + chrono::Duration::milliseconds(elapsed_ms);
    record
}

/// Poll the store until the order reaches `status` or `max_wait` passes
pub async fn wait_for_status(
    store: &dyn OrderStore,
    external_id: &str,
    status: OrderStatus,
    max_wait: Duration,
) -> bool {
    tokio::time::timeout(max_wait, async {
        loop {
            if let Ok(record) = store.get_order_by_external_id(external_id).await
                && record.status == status
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .is_ok()
}

/// Wait for a condition with timeout
pub async fn wait_for_condition<F>(mut condition: F, max_wait: Duration) -> bool
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(max_wait, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
