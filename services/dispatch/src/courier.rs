//! Courier HTTP client

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{debug, info};
use url::Url;

use crate::error::{DispatchError, DispatchResult};
use crate::order::OrderRequest;

/// Path appended to every courier endpoint
pub const SEND_ORDER_PATH: &str = "/api/sendOrder";

/// Hands an order to a courier
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CourierCaller: Send + Sync {
    /// Deliver the order to one courier; no retry
    async fn send_order(&self, order: &OrderRequest) -> DispatchResult<()>;
}

/// Calls one of the configured courier endpoints, chosen uniformly at random.
///
/// A final status of 300 or above is a rejection. `reqwest` follows
/// redirects first (307/308 keep the POST body), so only a redirect it does
/// not follow, such as 304, is rejected as such.
#[derive(Debug, Clone)]
pub struct HttpCourierClient {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpCourierClient {
    /// Client over a fresh `reqwest` connection pool
    pub fn new(endpoints: Vec<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoints)
    }

    /// Client over an existing `reqwest` client
    pub fn with_client(client: reqwest::Client, endpoints: Vec<String>) -> Self {
        Self { client, endpoints }
    }

    fn pick_endpoint(&self) -> DispatchResult<&str> {
        self.endpoints
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .ok_or(DispatchError::Unconfigured)
    }
}

/// `<endpoint>/api/sendOrder`, keeping any base path of the endpoint
pub fn send_order_url(endpoint: &str) -> DispatchResult<Url> {
    let invalid = || DispatchError::InvalidEndpoint {
        url: endpoint.to_string(),
    };

    let mut url = Url::parse(endpoint).map_err(|_| invalid())?;
    if url.cannot_be_a_base() {
        return Err(invalid());
    }

    let path = format!("{}{}", url.path().trim_end_matches('/'), SEND_ORDER_PATH);
    url.set_path(&path);
    Ok(url)
}

#[async_trait]
impl CourierCaller for HttpCourierClient {
    async fn send_order(&self, order: &OrderRequest) -> DispatchResult<()> {
        let endpoint = self.pick_endpoint()?;
        let url = send_order_url(endpoint)?;

        debug!(order_id = %order.id, %url, "Calling courier");
        let response = self.client.post(url.clone()).json(order).send().await?;

        let status = response.status();
        if status.as_u16() >= 300 {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::CourierRejected {
                status: status.as_u16(),
                body,
            });
        }

        info!(order_id = %order.id, %url, "Courier accepted order");
        Ok(())
    }
}
