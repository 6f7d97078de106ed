//! HTTP transport for the order server and the courier worker
//!
//! The courier endpoint only acknowledges known orders; `match` orders are
//! cooked by the dispatcher that called the courier, so each order cooks once.

use axum::{
    Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use services_common::constants::MILLIS_PER_SEC;

use crate::courier::SEND_ORDER_PATH;
use crate::error::DispatchError;
use crate::order::{DispatchMode, OrderRequest};
use crate::service::OrderDispatcher;

/// `code` of a successful response
pub const CODE_SUCCESS: i32 = 0;
/// `code` of a failed response
pub const CODE_FAILED: i32 = 1;

/// Response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    /// `0` on success, `1` on failure
    pub code: i32,
    /// Human readable outcome
    pub message: String,
    /// Average pickup delay in milliseconds, only on delay queries
    #[serde(rename = "averageDelayMs", default, skip_serializing_if = "Option::is_none")]
    pub average_delay_ms: Option<f64>,
}

impl ApiMessage {
    /// Success envelope
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            code: CODE_SUCCESS,
            message: message.into(),
            average_delay_ms: None,
        }
    }

    /// Failure envelope
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: CODE_FAILED,
            message: message.into(),
            average_delay_ms: None,
        }
    }
}

impl DispatchError {
    /// HTTP status reported for this error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::OrderNotFound { .. } => StatusCode::NOT_FOUND,
            Self::QueueBusy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(ApiMessage::failure(self.to_string()))).into_response()
    }
}

fn bad_json(rejection: &JsonRejection) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiMessage::failure(format!("input json format err: {}", rejection.body_text()))),
    )
        .into_response()
}

fn accepted() -> Response {
    (StatusCode::ACCEPTED, Json(ApiMessage::success("received"))).into_response()
}

/// Routes of the order server
pub fn order_router(dispatcher: Arc<OrderDispatcher>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/api/sendOrder/random", post(send_random))
        .route("/api/sendOrder/fifo", post(send_fifo))
        .route("/api/delay/:order_type", get(average_delay))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

/// Routes of the courier worker
pub fn courier_router(dispatcher: Arc<OrderDispatcher>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route(SEND_ORDER_PATH, post(courier_send_order))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

async fn ping() -> &'static str {
    "pong"
}

async fn send_random(
    State(dispatcher): State<Arc<OrderDispatcher>>,
    payload: Result<Json<Vec<OrderRequest>>, JsonRejection>,
) -> Response {
    dispatch_orders(&dispatcher, payload, DispatchMode::Match).await
}

async fn send_fifo(
    State(dispatcher): State<Arc<OrderDispatcher>>,
    payload: Result<Json<Vec<OrderRequest>>, JsonRejection>,
) -> Response {
    dispatch_orders(&dispatcher, payload, DispatchMode::Fifo).await
}

async fn dispatch_orders(
    dispatcher: &Arc<OrderDispatcher>,
    payload: Result<Json<Vec<OrderRequest>>, JsonRejection>,
    mode: DispatchMode,
) -> Response {
    let Json(orders) = match payload {
        Ok(orders) => orders,
        Err(rejection) => return bad_json(&rejection),
    };

    info!(count = orders.len(), mode = %mode, "Orders received");
    match dispatcher.dispatch_batch(orders, mode).await {
        Ok(()) => accepted(),
        Err(e) => e.into_response(),
    }
}

async fn average_delay(
    State(dispatcher): State<Arc<OrderDispatcher>>,
    Path(order_type): Path<String>,
) -> Response {
    let mode = match order_type.parse::<DispatchMode>() {
        Ok(mode) => mode,
        Err(e) => return e.into_response(),
    };

    match dispatcher.average_delay(mode).await {
        Ok(average_secs) => {
            let average_ms = average_secs * MILLIS_PER_SEC as f64;
            let body = ApiMessage {
                average_delay_ms: Some(average_ms),
                ..ApiMessage::success(format!("Average dispatch delay is {average_ms}"))
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn courier_send_order(
    State(dispatcher): State<Arc<OrderDispatcher>>,
    payload: Result<Json<OrderRequest>, JsonRejection>,
) -> Response {
    let Json(order) = match payload {
        Ok(order) => order,
        Err(rejection) => return bad_json(&rejection),
    };

    match dispatcher.accept_courier_order(&order).await {
        Ok(_) => accepted(),
        Err(e) => {
            warn!(external_id = %order.id, "Courier received invalid order: {}", e);
            e.into_response()
        }
    }
}

/// Serve `router` until `cancel` fires.
///
/// In-flight requests get `drain_timeout` to finish; the server is dropped
/// after that.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
    drain_timeout: Duration,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!("Listening on {}", addr);

    let server = axum::serve(listener, router)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result?,
        () = async {
            cancel.cancelled().await;
            tokio::time::sleep(drain_timeout).await;
        } => {
            warn!("Server force shutdown after {}ms drain", drain_timeout.as_millis());
        }
    }

    info!("Listener on {} closed", addr);
    Ok(())
}
