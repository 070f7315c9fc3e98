//! Tracing setup for host applications.
//!
//! The library itself logs through the `log` facade. Hosts that want
//! structured output call [`init`] once at startup; it bridges `log`
//! records into `tracing` and installs a formatting subscriber filtered
//! by `IFTRACK_LOG` (falling back to `info`).

use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Returns an error if one is already set.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    LogTracer::init()?;

    let filter = EnvFilter::try_from_env("IFTRACK_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;

    tracing::debug!("tracing initialized");
    Ok(())
}
