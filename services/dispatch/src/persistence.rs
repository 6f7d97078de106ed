//! Order persistence layer
//!
//! `PostgreSQL` backend for order records. The order id sequence is allocated
//! inside the insert transaction: a transaction-scoped advisory lock
//! serializes allocators (it also covers the empty table, where there is no
//! row to lock), then the latest record is read and row-locked with
//! `FOR UPDATE`. Every insert funnels through that one lock, so the sequence
//! is a throughput ceiling; the id scheme is not meant for several databases
//! or sharded tables.

use anyhow::Context;
use async_trait::async_trait;
use services_common::constants::{ORDER_ID_DIGITS, ORDER_ID_PREFIX};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info};

use crate::error::{DispatchError, DispatchResult};
use crate::order::{DispatchMode, OrderRecord, OrderStatus};

/// Advisory lock key guarding the order id sequence
const ORDER_ID_LOCK_KEY: i64 = 0x4f52_4445_52;

/// Storage capability required by the dispatcher
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Allocate an order id and insert the record in one transaction.
    ///
    /// Returns the stored record with its id and timestamps.
    async fn create_order(&self, record: OrderRecord) -> DispatchResult<OrderRecord>;

    /// Upsert a record by order id, refreshing `updated_at`
    async fn save_model(&self, record: OrderRecord) -> DispatchResult<OrderRecord>;

    /// Latest record with the given client-supplied id
    async fn get_order_by_external_id(&self, external_id: &str) -> DispatchResult<OrderRecord>;

    /// Mean of `(updated_at - created_at) - prep_time` in seconds, `0.0` when empty
    async fn average_delay(&self, mode: DispatchMode) -> DispatchResult<f64>;
}

/// Next id in the sequence after `latest`.
///
/// `None` starts the sequence at 1. A stored id whose suffix is not a plain
/// decimal number means the table is corrupted.
pub fn next_order_id(latest: Option<&str>) -> DispatchResult<String> {
    let Some(latest) = latest else {
        return Ok(format_order_id(1));
    };

    let dirty = || DispatchError::DirtyData {
        order_id: latest.to_string(),
    };

    let suffix = latest.strip_prefix(ORDER_ID_PREFIX).ok_or_else(dirty)?;
    if suffix.is_empty()
        || suffix.len() > ORDER_ID_DIGITS
        || !suffix.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(dirty());
    }
    let index: u64 = suffix.parse().map_err(|_| dirty())?;

    let next = index + 1;
    if next.to_string().len() > ORDER_ID_DIGITS {
        return Err(anyhow::anyhow!("order id sequence exhausted at {latest}").into());
    }

    Ok(format_order_id(next))
}

/// `ORDER` followed by the zero-padded counter
#[must_use]
pub fn format_order_id(index: u64) -> String {
    format!("{ORDER_ID_PREFIX}{index:0width$}", width = ORDER_ID_DIGITS)
}

/// `PostgreSQL` order store
#[derive(Debug, Clone)]
pub struct PgOrderStore {
    /// Database pool
    db_pool: PgPool,
}

impl PgOrderStore {
    /// Create new store over an existing pool
    #[must_use]
    pub const fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// Open a pool against `database_url`
    pub async fn connect(database_url: &str, max_connections: u32) -> DispatchResult<Self> {
        let db_pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("connect to order database")?;

        Ok(Self::new(db_pool))
    }

    /// Underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.db_pool
    }

    /// Create tables if they don't exist
    pub async fn run_migrations(&self) -> DispatchResult<()> {
        run_migrations(&self.db_pool).await
    }

    /// Allocate the next order id.
    ///
    /// Must run on the connection of the transaction that performs the
    /// insert; both locks are released at commit or rollback.
    pub async fn generate_unique_key(conn: &mut PgConnection) -> DispatchResult<String> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(ORDER_ID_LOCK_KEY)
            .execute(&mut *conn)
            .await
            .context("acquire order id lock")?;

        let latest: Option<String> = sqlx::query_scalar(
            r"
            SELECT order_id FROM orders
            ORDER BY order_id DESC
            LIMIT 1
            FOR UPDATE
            ",
        )
        .fetch_optional(&mut *conn)
        .await
        .context("lock latest order id")?;

        next_order_id(latest.as_deref())
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn create_order(&self, mut record: OrderRecord) -> DispatchResult<OrderRecord> {
        let mut tx = self
            .db_pool
            .begin()
            .await
            .context("begin order transaction")?;

        record.order_id = Self::generate_unique_key(&mut tx).await?;

        let row = sqlx::query(
            r"
            INSERT INTO orders (
                order_id, external_id, name, prep_time, dispatch_mode, status,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, now(), now()
            )
            RETURNING created_at, updated_at
            ",
        )
        .bind(&record.order_id)
        .bind(&record.external_id)
        .bind(&record.name)
        .bind(record.prep_time)
        .bind(record.dispatch_mode.as_str())
        .bind(record.status.as_str())
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("save order {}", record.order_id))?;

        tx.commit().await.context("commit order transaction")?;

        record.created_at = row.try_get("created_at").context("decode created_at")?;
        record.updated_at = row.try_get("updated_at").context("decode updated_at")?;

        debug!("Order {} persisted", record.order_id);
        Ok(record)
    }

    async fn save_model(&self, mut record: OrderRecord) -> DispatchResult<OrderRecord> {
        if record.order_id.is_empty() {
            return Err(DispatchError::validation("cannot save an order without order id"));
        }

        let row = sqlx::query(
            r"
            INSERT INTO orders (
                order_id, external_id, name, prep_time, dispatch_mode, status,
                created_at, updated_at, deleted_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, now(), $8
            )
            ON CONFLICT (order_id) DO UPDATE SET
                name = EXCLUDED.name,
                prep_time = EXCLUDED.prep_time,
                dispatch_mode = EXCLUDED.dispatch_mode,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at,
                deleted_at = EXCLUDED.deleted_at
            RETURNING created_at, updated_at
            ",
        )
        .bind(&record.order_id)
        .bind(&record.external_id)
        .bind(&record.name)
        .bind(record.prep_time)
        .bind(record.dispatch_mode.as_str())
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.deleted_at)
        .fetch_one(&self.db_pool)
        .await
        .with_context(|| format!("update order {}", record.order_id))?;

        record.created_at = row.try_get("created_at").context("decode created_at")?;
        record.updated_at = row.try_get("updated_at").context("decode updated_at")?;

        debug!("Order {} saved with status {}", record.order_id, record.status);
        Ok(record)
    }

    async fn get_order_by_external_id(&self, external_id: &str) -> DispatchResult<OrderRecord> {
        let row = sqlx::query(
            r"
            SELECT
                order_id, external_id, name, prep_time, dispatch_mode, status,
                created_at, updated_at, deleted_at
            FROM orders
            WHERE external_id = $1 AND deleted_at IS NULL
            ORDER BY order_id DESC
            LIMIT 1
            ",
        )
        .bind(external_id)
        .fetch_optional(&self.db_pool)
        .await
        .with_context(|| format!("load order {external_id}"))?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(DispatchError::OrderNotFound {
                external_id: external_id.to_string(),
            }),
        }
    }

    async fn average_delay(&self, mode: DispatchMode) -> DispatchResult<f64> {
        let average: Option<f64> = sqlx::query_scalar(
            r"
            SELECT AVG(
                EXTRACT(EPOCH FROM (updated_at - created_at)) - prep_time
            )::DOUBLE PRECISION
            FROM orders
            WHERE dispatch_mode = $1 AND deleted_at IS NULL
            ",
        )
        .bind(mode.as_str())
        .fetch_one(&self.db_pool)
        .await
        .with_context(|| format!("average delay of {mode} orders"))?;

        Ok(average.unwrap_or(0.0))
    }
}

fn record_from_row(row: &PgRow) -> DispatchResult<OrderRecord> {
    let dispatch_mode: String = row.try_get("dispatch_mode").context("decode dispatch_mode")?;
    let status: String = row.try_get("status").context("decode status")?;

    Ok(OrderRecord {
        order_id: row.try_get("order_id").context("decode order_id")?,
        external_id: row.try_get("external_id").context("decode external_id")?,
        name: row.try_get("name").context("decode name")?,
        prep_time: row.try_get("prep_time").context("decode prep_time")?,
        dispatch_mode: parse_dispatch_mode(&dispatch_mode)?,
        status: parse_order_status(&status)?,
        created_at: row.try_get("created_at").context("decode created_at")?,
        updated_at: row.try_get("updated_at").context("decode updated_at")?,
        deleted_at: row.try_get("deleted_at").context("decode deleted_at")?,
    })
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> DispatchResult<()> {
    info!("Running database migrations");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS orders (
            order_id VARCHAR(32) PRIMARY KEY,
            external_id VARCHAR(191) NOT NULL UNIQUE,
            name TEXT NOT NULL,
            prep_time BIGINT NOT NULL,
            dispatch_mode VARCHAR(32) NOT NULL,
            status VARCHAR(16) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            deleted_at TIMESTAMPTZ
        )
        ",
    )
    .execute(pool)
    .await
    .context("create orders table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_dispatch_mode ON orders (dispatch_mode)")
        .execute(pool)
        .await
        .context("create dispatch mode index")?;

    info!("Database migrations completed");
    Ok(())
}

/// Parse order status from its stored representation
pub fn parse_order_status(s: &str) -> DispatchResult<OrderStatus> {
    match s {
        "Started" => Ok(OrderStatus::Started),
        "Cooking" => Ok(OrderStatus::Cooking),
        "Finished" => Ok(OrderStatus::Finished),
        _ => Err(anyhow::anyhow!("Invalid order status: {}", s).into()),
    }
}

/// Parse dispatch mode from its stored representation
pub fn parse_dispatch_mode(s: &str) -> DispatchResult<DispatchMode> {
    match s {
        "match" => Ok(DispatchMode::Match),
        "fifo" => Ok(DispatchMode::Fifo),
        _ => Err(anyhow::anyhow!("Invalid dispatch mode: {}", s).into()),
    }
}
