//! Load generator
//!
//! Posts two random orders per second to the order server until interrupted.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use order_dispatch::OrderRequest;
use rand::Rng;
use rand::seq::SliceRandom;
use services_common::{init_tracing, shutdown_on_ctrl_c};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

const ORDERS_PER_TICK: usize = 2;
const TICK: Duration = Duration::from_secs(1);
const MIN_PREP_SECS: i64 = 3;
const MAX_PREP_SECS: i64 = 15;

const ADJECTIVES: &[&str] = &[
    "spicy", "crispy", "smoky", "tangy", "golden", "savory", "zesty", "hearty", "sticky", "fresh",
];
const DISHES: &[&str] = &[
    "ramen", "tacos", "curry", "dumplings", "burrito", "pho", "risotto", "falafel", "bibimbap",
    "lasagna",
];

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TestType {
    Match,
    Fifo,
}

impl TestType {
    const fn path(self) -> &'static str {
        match self {
            Self::Match => "api/sendOrder/random",
            Self::Fifo => "api/sendOrder/fifo",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "order-generator", version, about = "Random order load generator")]
struct Cli {
    /// Order server base url
    #[arg(long, default_value = "http://localhost:8080/")]
    url: String,

    /// Dispatch path to exercise
    #[arg(long = "type", value_enum, default_value = "fifo")]
    test_type: TestType,
}

fn random_order(rng: &mut impl Rng) -> OrderRequest {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("plain");
    let dish = DISHES.choose(rng).copied().unwrap_or("rice");
    OrderRequest::new(
        Uuid::new_v4().to_string(),
        format!("{adjective} {dish}"),
        rng.gen_range(MIN_PREP_SECS..=MAX_PREP_SECS),
    )
}

fn target_url(base: &str, test_type: TestType) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("configured url {base} is invalid"))?;
    let path = format!("{}/{}", url.path().trim_end_matches('/'), test_type.path());
    url.set_path(&path);
    Ok(url)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("order_generator")?;

    let cli = Cli::parse();
    let target = target_url(&cli.url, cli.test_type)?;
    let client = reqwest::Client::new();
    let cancel = shutdown_on_ctrl_c();
    let mut ticker = tokio::time::interval(TICK);

    info!("Sending {} orders per second to {}", ORDERS_PER_TICK, target);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let orders: Vec<OrderRequest> = {
            let mut rng = rand::thread_rng();
            (0..ORDERS_PER_TICK).map(|_| random_order(&mut rng)).collect()
        };

        match client.post(target.clone()).json(&orders).send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                info!(%status, "API result: {}", body);
            }
            Err(e) => warn!("Call {} failed: {}", target, e),
        }
    }

    info!("Generator stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_url() {
        assert_eq!(
            target_url("http://localhost:8080/", TestType::Fifo).unwrap().as_str(),
            "http://localhost:8080/api/sendOrder/fifo"
        );
        assert_eq!(
            target_url("http://host/base", TestType::Match).unwrap().as_str(),
            "http://host/base/api/sendOrder/random"
        );
    }

    #[test]
    fn test_random_order_bounds() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let order = random_order(&mut rng);
            assert!((MIN_PREP_SECS..=MAX_PREP_SECS).contains(&order.prep_time));
            assert!(!order.name.is_empty());
        }
    }
}
