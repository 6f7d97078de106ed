//! Order dispatcher
//!
//! Persists incoming orders and routes them either straight to a courier
//! (`match`) or through the queue to the courier worker (`fifo`). Both paths
//! end in the cooking simulation, which moves the order from `Started` through
//! `Cooking` to `Finished`.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::courier::CourierCaller;
use crate::error::{DispatchError, DispatchResult};
use crate::lifecycle::OrderLifecycleManager;
use crate::order::{DispatchMode, OrderRecord, OrderRequest, OrderStatus};
use crate::persistence::OrderStore;
use crate::queue::MessageSink;

/// Order dispatcher
pub struct OrderDispatcher {
    store: Arc<dyn OrderStore>,
    courier: Arc<dyn CourierCaller>,
    sink: Arc<dyn MessageSink>,
    lifecycle: OrderLifecycleManager,
}

impl OrderDispatcher {
    /// Create a dispatcher over its three collaborators
    pub fn new(
        store: Arc<dyn OrderStore>,
        courier: Arc<dyn CourierCaller>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            store,
            courier,
            sink,
            lifecycle: OrderLifecycleManager::new(),
        }
    }

    /// Validate and persist a new order in `Started` status.
    ///
    /// The request must carry its dispatch mode.
    pub async fn save_order(&self, request: &OrderRequest) -> DispatchResult<OrderRecord> {
        let mode = request
            .dispatch_mode
            .ok_or_else(|| DispatchError::validation("order type is required"))?;
        self.lifecycle.validate_request(request)?;

        let record = self
            .store
            .create_order(OrderRecord::started(request, mode))
            .await?;

        info!(
            order_id = %record.order_id,
            external_id = %record.external_id,
            mode = %mode,
            "Order saved"
        );
        Ok(record)
    }

    /// Hand the order to a courier synchronously
    pub async fn call_courier_direct(&self, request: &OrderRequest) -> DispatchResult<()> {
        self.courier.send_order(request).await
    }

    /// Buffer the order for the courier worker
    pub async fn enqueue_order(&self, request: &OrderRequest) -> DispatchResult<()> {
        let message = serde_json::to_value(request)?;
        self.sink.enqueue(message).await
    }

    /// Cook the order: `Cooking`, wait prep time, `Finished`.
    ///
    /// Every step is persisted. A record that cannot move to `Cooking` fails
    /// with `InvalidTransition` before anything is written.
    pub async fn simulate_cooking(&self, mut record: OrderRecord) -> DispatchResult<OrderRecord> {
        self.lifecycle.transition(&mut record, OrderStatus::Cooking)?;
        let mut record = self.store.save_model(record).await?;
        info!(order_id = %record.order_id, prep_time = record.prep_time, "Order cooking");

        let prep_secs = u64::try_from(record.prep_time).unwrap_or_default();
        tokio::time::sleep(Duration::from_secs(prep_secs)).await;

        self.lifecycle.transition(&mut record, OrderStatus::Finished)?;
        let record = self.store.save_model(record).await?;
        info!(order_id = %record.order_id, "Order finished");
        Ok(record)
    }

    /// Run the cooking simulation detached.
    ///
    /// Errors and panics are logged; the handle resolves once cooking ends
    /// either way. Shutdown does not wait for it.
    pub fn spawn_cooking(self: &Arc<Self>, record: OrderRecord) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        let order_id = record.order_id.clone();

        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(dispatcher.simulate_cooking(record))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(DispatchError::from_panic("cooking", payload.as_ref())));

            if let Err(e) = outcome {
                error!(order_id = %order_id, "Cooking failed: {}", e);
            }
        })
    }

    /// Average pickup delay in seconds for a dispatch mode
    pub async fn average_delay(&self, mode: DispatchMode) -> DispatchResult<f64> {
        self.store.average_delay(mode).await
    }

    /// Save and route one order.
    ///
    /// `match` calls a courier and then cooks in the background; `fifo`
    /// returns once the order is buffered for the worker.
    pub async fn dispatch(self: &Arc<Self>, request: OrderRequest, mode: DispatchMode) -> DispatchResult<()> {
        let request = request.with_mode(mode);
        let record = self.save_order(&request).await?;

        match mode {
            DispatchMode::Match => {
                self.call_courier_direct(&request).await?;
                self.spawn_cooking(record);
            }
            DispatchMode::Fifo => {
                self.enqueue_order(&request).await?;
            }
        }

        Ok(())
    }

    /// Dispatch orders in sequence, stopping at the first failure.
    ///
    /// Orders before the failing one stay accepted.
    pub async fn dispatch_batch(
        self: &Arc<Self>,
        requests: Vec<OrderRequest>,
        mode: DispatchMode,
    ) -> DispatchResult<()> {
        for request in requests {
            let external_id = request.id.clone();
            if let Err(e) = self.dispatch(request, mode).await {
                error!(external_id = %external_id, mode = %mode, "Dispatch failed: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Worker side of `fifo`: decode, look up, cook in the background
    pub async fn handle_message(self: &Arc<Self>, body: &[u8]) -> DispatchResult<()> {
        let request: OrderRequest = serde_json::from_slice(body)?;
        let record = self.store.get_order_by_external_id(&request.id).await?;

        info!(order_id = %record.order_id, external_id = %record.external_id, "Order received from queue");
        self.spawn_cooking(record);
        Ok(())
    }

    /// Courier side of `match`: confirm the order exists.
    ///
    /// Cooking is driven by the dispatcher that placed the call.
    pub async fn accept_courier_order(&self, request: &OrderRequest) -> DispatchResult<OrderRecord> {
        let record = self.store.get_order_by_external_id(&request.id).await?;
        info!(order_id = %record.order_id, external_id = %record.external_id, "Courier accepted order");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::courier::MockCourierCaller;
    use crate::memory::InMemoryOrderStore;
    use crate::persistence::MockOrderStore;
    use crate::queue::MockMessageSink;
    use mockall::predicate::eq;

    fn request(id: &str, prep_time: i64) -> OrderRequest {
        OrderRequest::new(id, "Bibimbap", prep_time)
    }

    fn dispatcher(
        store: Arc<dyn OrderStore>,
        courier: MockCourierCaller,
        sink: MockMessageSink,
    ) -> Arc<OrderDispatcher> {
        Arc::new(OrderDispatcher::new(store, Arc::new(courier), Arc::new(sink)))
    }

    #[tokio::test]
    async fn test_save_order_creates_started_record() {
        let mut store = MockOrderStore::new();
        store
            .expect_create_order()
            .withf(|record| record.external_id == "o1" && record.status == OrderStatus::Started)
            .times(1)
            .returning(|mut record| {
                record.order_id = "ORDER000000001".to_string();
                Ok(record)
            });

        let dispatcher = dispatcher(Arc::new(store), MockCourierCaller::new(), MockMessageSink::new());
        let record = dispatcher
            .save_order(&request("o1", 2).with_mode(DispatchMode::Fifo))
            .await
            .unwrap();

        assert_eq!(record.order_id, "ORDER000000001");
        assert_eq!(record.dispatch_mode, DispatchMode::Fifo);
    }

    #[tokio::test]
    async fn test_save_order_requires_mode_and_valid_fields() {
        let mut store = MockOrderStore::new();
        store.expect_create_order().never();
        let dispatcher = dispatcher(Arc::new(store), MockCourierCaller::new(), MockMessageSink::new());

        let err = dispatcher.save_order(&request("o1", 2)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation { .. }));

        let err = dispatcher
            .save_order(&request("o1", 0).with_mode(DispatchMode::Match))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_persistence_error_propagates() {
        let mut store = MockOrderStore::new();
        store
            .expect_create_order()
            .returning(|_| Err(anyhow::anyhow!("connection refused").context("save order error").into()));

        let dispatcher = dispatcher(Arc::new(store), MockCourierCaller::new(), MockMessageSink::new());
        let err = dispatcher
            .dispatch(request("o1", 1), DispatchMode::Fifo)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_fifo_enqueues_wire_message() {
        let mut sink = MockMessageSink::new();
        sink.expect_enqueue()
            .with(eq(serde_json::json!({
                "id": "o1",
                "name": "Bibimbap",
                "prepTime": 2,
                "orderType": "fifo"
            })))
            .times(1)
            .returning(|_| Ok(()));
        let mut courier = MockCourierCaller::new();
        courier.expect_send_order().never();

        let store = Arc::new(InMemoryOrderStore::new());
        let dispatcher = dispatcher(store.clone(), courier, sink);
        dispatcher.dispatch(request("o1", 2), DispatchMode::Fifo).await.unwrap();

        let record = store.get_order_by_external_id("o1").await.unwrap();
        assert_eq!(record.status, OrderStatus::Started);
    }

    #[tokio::test]
    async fn test_fifo_surfaces_queue_busy() {
        let mut sink = MockMessageSink::new();
        sink.expect_enqueue()
            .returning(|_| Err(DispatchError::QueueBusy { waited_ms: 1000 }));

        let dispatcher = dispatcher(
            Arc::new(InMemoryOrderStore::new()),
            MockCourierCaller::new(),
            sink,
        );
        let err = dispatcher
            .dispatch(request("o1", 2), DispatchMode::Fifo)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::QueueBusy { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_calls_courier_then_cooks() {
        let mut courier = MockCourierCaller::new();
        courier
            .expect_send_order()
            .withf(|order| order.id == "o1" && order.dispatch_mode == Some(DispatchMode::Match))
            .times(1)
            .returning(|_| Ok(()));

        let store = Arc::new(InMemoryOrderStore::new());
        let dispatcher = dispatcher(store.clone(), courier, MockMessageSink::new());
        dispatcher.dispatch(request("o1", 3), DispatchMode::Match).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        let record = store.get_order_by_external_id("o1").await.unwrap();
        assert_eq!(record.status, OrderStatus::Finished);
    }

    #[tokio::test]
    async fn test_match_courier_rejection_skips_cooking() {
        let mut courier = MockCourierCaller::new();
        courier.expect_send_order().returning(|_| {
            Err(DispatchError::CourierRejected {
                status: 500,
                body: "kitchen closed".to_string(),
            })
        });

        let store = Arc::new(InMemoryOrderStore::new());
        let dispatcher = dispatcher(store.clone(), courier, MockMessageSink::new());
        let err = dispatcher
            .dispatch(request("o1", 1), DispatchMode::Match)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("kitchen closed"));
        let record = store.get_order_by_external_id("o1").await.unwrap();
        assert_eq!(record.status, OrderStatus::Started);
    }

    #[tokio::test]
    async fn test_batch_stops_at_first_failure() {
        let mut sink = MockMessageSink::new();
        sink.expect_enqueue().times(1).returning(|_| Ok(()));

        let store = Arc::new(InMemoryOrderStore::new());
        let dispatcher = dispatcher(store.clone(), MockCourierCaller::new(), sink);
        let batch = vec![request("o1", 1), request("", 1), request("o3", 1)];

        let err = dispatcher.dispatch_batch(batch, DispatchMode::Fifo).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation { .. }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulate_cooking_finishes_after_prep_time() {
        let store = Arc::new(InMemoryOrderStore::new());
        let dispatcher = dispatcher(store.clone(), MockCourierCaller::new(), MockMessageSink::new());
        let record = dispatcher
            .save_order(&request("o1", 2).with_mode(DispatchMode::Fifo))
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let finished = dispatcher.simulate_cooking(record).await.unwrap();

        assert_eq!(finished.status, OrderStatus::Finished);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_simulate_cooking_rejects_finished_record() {
        let mut store = MockOrderStore::new();
        store.expect_save_model().never();
        let dispatcher = dispatcher(Arc::new(store), MockCourierCaller::new(), MockMessageSink::new());

        let mut record = OrderRecord::started(&request("o1", 1), DispatchMode::Fifo);
        record.order_id = "ORDER000000001".to_string();
        record.status = OrderStatus::Finished;

        let err = dispatcher.simulate_cooking(record).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransition { .. }));
    }

    struct PanickingStore;

    #[async_trait::async_trait]
    impl OrderStore for PanickingStore {
        async fn create_order(&self, record: OrderRecord) -> DispatchResult<OrderRecord> {
            Ok(record)
        }

        async fn save_model(&self, _record: OrderRecord) -> DispatchResult<OrderRecord> {
            panic!("disk on fire")
        }

        async fn get_order_by_external_id(&self, external_id: &str) -> DispatchResult<OrderRecord> {
            Err(DispatchError::OrderNotFound {
                external_id: external_id.to_string(),
            })
        }

        async fn average_delay(&self, _mode: DispatchMode) -> DispatchResult<f64> {
            Ok(0.0)
        }
    }

    #[tokio::test]
    async fn test_spawn_cooking_contains_panics() {
        let dispatcher = dispatcher(
            Arc::new(PanickingStore),
            MockCourierCaller::new(),
            MockMessageSink::new(),
        );

        let mut record = OrderRecord::started(&request("o1", 1), DispatchMode::Fifo);
        record.order_id = "ORDER000000001".to_string();

        assert!(dispatcher.spawn_cooking(record).await.is_ok());
    }

    #[tokio::test]
    async fn test_handle_message_errors() {
        let dispatcher = dispatcher(
            Arc::new(InMemoryOrderStore::new()),
            MockCourierCaller::new(),
            MockMessageSink::new(),
        );

        let err = dispatcher.handle_message(b"not json").await.unwrap_err();
        assert!(matches!(err, DispatchError::Serialization(_)));

        let err = dispatcher
            .handle_message(br#"{"id":"ghost","name":"A","prepTime":1,"orderType":"fifo"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::OrderNotFound { .. }));
    }

    #[tokio::test]
    async fn test_accept_courier_order_only_looks_up() {
        let store = Arc::new(InMemoryOrderStore::new());
        let dispatcher = dispatcher(store.clone(), MockCourierCaller::new(), MockMessageSink::new());
        dispatcher
            .save_order(&request("o1", 1).with_mode(DispatchMode::Match))
            .await
            .unwrap();

        let record = dispatcher.accept_courier_order(&request("o1", 1)).await.unwrap();
        assert_eq!(record.status, OrderStatus::Started);
        assert!(dispatcher.accept_courier_order(&request("o2", 1)).await.is_err());
    }
}
