//! In-process order store
//!
//! Keeps records in a `BTreeMap` keyed by order id, so the latest id is the
//! last key. The table mutex plays the role of the row lock: allocation and
//! insert happen under one guard.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{DispatchError, DispatchResult};
use crate::order::{DispatchMode, OrderRecord};
use crate::persistence::{OrderStore, next_order_id};

#[derive(Debug, Default)]
struct Tables {
    orders: BTreeMap<String, OrderRecord>,
    by_external_id: FxHashMap<String, String>,
}

/// Order store backed by process memory
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    tables: Mutex<Tables>,
}

impl InMemoryOrderStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record verbatim, bypassing id allocation and timestamping.
    ///
    /// Used to seed fixtures with known timestamps or corrupted ids.
    pub fn import_record(&self, record: OrderRecord) {
        let mut tables = self.tables.lock();
        tables
            .by_external_id
            .insert(record.external_id.clone(), record.order_id.clone());
        tables.orders.insert(record.order_id.clone(), record);
    }

    /// Number of stored orders
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.lock().orders.len()
    }

    /// Whether no order is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.lock().orders.is_empty()
    }

    /// All records ordered by order id
    #[must_use]
    pub fn orders(&self) -> Vec<OrderRecord> {
        self.tables.lock().orders.values().cloned().collect()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create_order(&self, mut record: OrderRecord) -> DispatchResult<OrderRecord> {
        let mut tables = self.tables.lock();

        if tables.by_external_id.contains_key(&record.external_id) {
            return Err(anyhow::anyhow!(
                "save order error: duplicate external id {}",
                record.external_id
            )
            .into());
        }

        let latest = tables.orders.keys().next_back().map(String::as_str);
        record.order_id = next_order_id(latest)?;

        let now = Utc::now();
        record.created_at = now;
        record.updated_at = now;

        tables
            .by_external_id
            .insert(record.external_id.clone(), record.order_id.clone());
        tables.orders.insert(record.order_id.clone(), record.clone());

        debug!("Order {} persisted", record.order_id);
        Ok(record)
    }

    async fn save_model(&self, mut record: OrderRecord) -> DispatchResult<OrderRecord> {
        if record.order_id.is_empty() {
            return Err(DispatchError::validation("cannot save an order without order id"));
        }

        let mut tables = self.tables.lock();

        if let Some(existing) = tables.orders.get(&record.order_id) {
            record.created_at = existing.created_at;
        }
        record.updated_at = Utc::now().max(record.created_at);

        tables
            .by_external_id
            .insert(record.external_id.clone(), record.order_id.clone());
        tables.orders.insert(record.order_id.clone(), record.clone());

        debug!("Order {} saved with status {}", record.order_id, record.status);
        Ok(record)
    }

    async fn get_order_by_external_id(&self, external_id: &str) -> DispatchResult<OrderRecord> {
        let tables = self.tables.lock();

        tables
            .by_external_id
            .get(external_id)
            .and_then(|order_id| tables.orders.get(order_id))
            .filter(|record| record.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| DispatchError::OrderNotFound {
                external_id: external_id.to_string(),
            })
    }

    async fn average_delay(&self, mode: DispatchMode) -> DispatchResult<f64> {
        let tables = self.tables.lock();

        let (sum, count) = tables
            .orders
            .values()
            .filter(|record| record.dispatch_mode == mode && record.deleted_at.is_none())
            .fold((0.0_f64, 0_u32), |(sum, count), record| {
                (sum + record.pickup_delay_secs(), count + 1)
            });

        if count == 0 {
            return Ok(0.0);
        }
        Ok(sum / f64::from(count))
    }
}
