//! RPC Worker Service
//!
//! Request/response workers on RabbitMQ.
//!
//! ## Architecture
//!
//! ```text
//! Producer (api, cli, ...)
//!   ↓ publish {service}:orders  (reply_to, correlation_id)
//! RabbitMQ
//!   ↓ consume
//! Runtime ── WorkerRegistry ── OrdersWorker / PingWorker
//!   ↓ Response (status header + JSON body)
//! reply_to queue of the producer
//! ```
//!
//! ## Configuration
//!
//! - `SERVICE_NAME`: queue prefix
//! - `WORKERS`: comma-separated worker names, e.g. `orders,ping`
//! - `BROKER_URL`: AMQP URL
//! - `DEBUG`: include tracebacks in error replies
//! - `APP_ENV`: `production` switches logs to JSON

pub mod workers;

use amqp_worker::{metrics, Runtime, Settings, StartupPolicy};
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tracing::{debug, info};

/// Run the RPC worker service
///
/// This is the main entry point. It:
/// 1. Sets up error reports and structured logging
/// 2. Loads worker settings from the environment
/// 3. Connects to the broker and starts every configured worker
/// 4. Waits for SIGINT / SIGTERM
///
/// # Errors
///
/// Returns an error if:
/// - Settings are missing or invalid
/// - The broker connection fails
/// - Any configured worker fails to start
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let settings = Settings::from_env().wrap_err("Failed to load worker settings")?;
    let settings = Arc::new(settings);
    info!(
        service = %settings.service_name,
        workers = ?settings.workers,
        connection_name = %settings.connection.connection_name,
        debug = settings.debug,
        "Starting RPC worker service"
    );

    let registry = workers::registry().wrap_err("Failed to register workers")?;

    let runtime = Runtime::connect(settings, &registry, StartupPolicy::FailFast)
        .await
        .wrap_err("Failed to start workers")?;

    runtime
        .wait_for_shutdown()
        .await
        .wrap_err("Error waiting for shutdown signal")?;

    debug!(metrics = %metrics::render_metrics(), "Final metrics");
    info!("RPC worker service stopped");
    Ok(())
}
