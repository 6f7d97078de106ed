//! Order definitions and structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use services_common::constants::MILLIS_PER_SEC;

use crate::error::DispatchError;

/// Order request as received from the transport and carried on the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client-supplied order id
    pub id: String,
    /// Display name
    pub name: String,
    /// Preparation time in seconds
    #[serde(rename = "prepTime")]
    pub prep_time: i64,
    /// Dispatch mode, assigned server-side per endpoint
    #[serde(
        rename = "orderType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub dispatch_mode: Option<DispatchMode>,
}

impl OrderRequest {
    /// Create a request without a dispatch mode
    pub fn new(id: impl Into<String>, name: impl Into<String>, prep_time: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            prep_time,
            dispatch_mode: None,
        }
    }

    /// Same request tagged with the given dispatch mode
    #[must_use]
    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = Some(mode);
        self
    }
}

/// How an order reaches a courier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Direct courier call during request handling
    Match,
    /// Queued handoff to the courier worker
    Fifo,
}

impl DispatchMode {
    /// Wire and storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::Fifo => "fifo",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchMode {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "match" => Ok(Self::Match),
            "fifo" => Ok(Self::Fifo),
            other => Err(DispatchError::validation(format!(
                "order type [{other}] is invalid, please use match or fifo"
            ))),
        }
    }
}

/// Order status, forward-only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Saved, not yet picked up by a courier
    Started,
    /// Kitchen is preparing the order
    Cooking,
    /// Ready and picked up
    Finished,
}

impl OrderStatus {
    /// Storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "Started",
            Self::Cooking => "Cooking",
            Self::Finished => "Finished",
        }
    }

    /// Whether no further transition is possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    /// System-generated sequence key, `ORDER` + 9 digits
    pub order_id: String,
    /// Client-supplied id, unique
    pub external_id: String,
    /// Display name
    pub name: String,
    /// Preparation time in seconds
    pub prep_time: i64,
    /// Dispatch mode
    pub dispatch_mode: DispatchMode,
    /// Lifecycle status
    pub status: OrderStatus,
    /// Set by the store on insert
    pub created_at: DateTime<Utc>,
    /// Refreshed by the store on every save
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker, unused
    pub deleted_at: Option<DateTime<Utc>>,
}

impl OrderRecord {
    /// Build an unsaved record in `Started` status.
    ///
    /// `order_id` stays empty and the timestamps are provisional until the
    /// store allocates an id and stamps them inside the insert transaction.
    #[must_use]
    pub fn started(request: &OrderRequest, mode: DispatchMode) -> Self {
        let now = Utc::now();
        Self {
            order_id: String::new(),
            external_id: request.id.clone(),
            name: request.name.clone(),
            prep_time: request.prep_time,
            dispatch_mode: mode,
            status: OrderStatus::Started,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Seconds between creation and the last update, minus prep time
    #[must_use]
    pub fn pickup_delay_secs(&self) -> f64 {
        let elapsed = (self.updated_at - self.created_at).num_milliseconds() as f64 / MILLIS_PER_SEC as f64;
        elapsed - self.prep_time as f64
    }
}
