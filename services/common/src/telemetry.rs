//! Tracing setup shared by the service binaries

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the default directive, which enables `info` for the
/// given crate target and for `tower_http`.
pub fn init_tracing(crate_target: &str) -> Result<()> {
    let default_directive = format!("{}=info,tower_http=info", crate_target.replace('-', "_"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .try_init()?;

    Ok(())
}
