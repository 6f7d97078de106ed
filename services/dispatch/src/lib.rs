//! Courier order dispatch
//!
//! Food-delivery orders reach a courier on one of two paths:
//!
//! - `match`: the order server calls a randomly chosen courier endpoint while
//!   handling the request, then cooks the order in the background
//! - `fifo`: the order server buffers the order for a broker queue; the courier
//!   worker consumes it and cooks it
//!
//! Every order is persisted with a sequential `ORDER` + 9 digit id and moves
//! forward through `Started`, `Cooking` and `Finished`. The average pickup
//! delay per dispatch mode is derived from the stored timestamps.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod api;
pub mod broker;
pub mod config;
pub mod courier;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod order;
pub mod persistence;
pub mod queue;
pub mod service;

pub use broker::{AmqpConnector, BrokerConnector, BrokerSession, InMemoryBroker};
pub use config::{CliOverrides, DispatchConfig, ProcessRole};
pub use courier::{CourierCaller, HttpCourierClient};
pub use error::{DispatchError, DispatchResult};
pub use memory::InMemoryOrderStore;
pub use order::{DispatchMode, OrderRecord, OrderRequest, OrderStatus};
pub use persistence::{OrderStore, PgOrderStore};
pub use queue::{ConnectionState, MessageSink, QueueConfig, QueueManager};
pub use service::OrderDispatcher;
