//! Dispatch runtime.
//!
//! Resolves the configured worker names through the registry, instantiates
//! each worker once and binds it to the shared channel. Started workers are
//! kept for the lifetime of the process.

use crate::broker::Channel;
use crate::error::WorkerError;
use crate::registry::WorkerRegistry;
use crate::settings::Settings;
use crate::worker::WorkerHandle;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, instrument};

/// What the runtime does when a worker fails to start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartupPolicy {
    /// Abort startup on the first failing worker and stop the ones already started
    #[default]
    FailFast,
    /// Log and record the failure, then start the remaining workers
    Continue,
}

/// A worker that could not be started under [`StartupPolicy::Continue`].
#[derive(Debug)]
pub struct WorkerFailure {
    pub worker: String,
    pub error: WorkerError,
}

/// Running set of workers on one channel.
pub struct Runtime {
    settings: Arc<Settings>,
    channel: Arc<dyn Channel>,
    workers: Vec<Arc<WorkerHandle>>,
    failures: Vec<WorkerFailure>,
}

impl Runtime {
    /// Start every worker named in `settings.workers`, in order.
    #[instrument(skip_all, fields(service = %settings.service_name))]
    pub async fn start(
        settings: Arc<Settings>,
        registry: &WorkerRegistry,
        channel: Arc<dyn Channel>,
        policy: StartupPolicy,
    ) -> Result<Self, WorkerError> {
        let mut workers: Vec<Arc<WorkerHandle>> = Vec::with_capacity(settings.workers.len());
        let mut failures = Vec::new();

        for name in &settings.workers {
            match start_worker(name, &settings, registry, &channel).await {
                Ok(handle) => {
                    info!(worker = %name, queue = %handle.queue_name(), "Worker started");
                    workers.push(handle);
                }
                Err(e) => match policy {
                    StartupPolicy::FailFast => {
                        error!(worker = %name, error = %e, "Worker failed to start, aborting startup");
                        for started in &workers {
                            started.abort();
                        }
                        return Err(WorkerError::Startup {
                            worker: name.clone(),
                            source: Box::new(e),
                        });
                    }
                    StartupPolicy::Continue => {
                        error!(worker = %name, error = %e, "Worker failed to start, continuing");
                        failures.push(WorkerFailure {
                            worker: name.clone(),
                            error: e,
                        });
                    }
                },
            }
        }

        info!(
            started = workers.len(),
            failed = failures.len(),
            "Runtime started"
        );
        Ok(Self {
            settings,
            channel,
            workers,
            failures,
        })
    }

    /// Connect to the broker from `settings` and start the workers.
    #[cfg(feature = "amqp")]
    pub async fn connect(
        settings: Arc<Settings>,
        registry: &WorkerRegistry,
        policy: StartupPolicy,
    ) -> Result<Self, WorkerError> {
        let channel = crate::broker::AmqpChannel::connect(&settings).await?;
        Self::start(settings, registry, Arc::new(channel), policy).await
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// The shared channel, e.g. for a [`Producer`](crate::Producer)
    pub fn channel(&self) -> Arc<dyn Channel> {
        Arc::clone(&self.channel)
    }

    /// Started workers, in configuration order
    pub fn workers(&self) -> &[Arc<WorkerHandle>] {
        &self.workers
    }

    /// Workers skipped under [`StartupPolicy::Continue`]
    pub fn failures(&self) -> &[WorkerFailure] {
        &self.failures
    }

    /// Park until SIGINT or SIGTERM, then stop the consume loops.
    pub async fn wait_for_shutdown(self) -> Result<(), WorkerError> {
        shutdown_signal().await?;
        for worker in &self.workers {
            worker.abort();
        }
        info!("Runtime stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("service", &self.settings.service_name)
            .field("workers", &self.workers)
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

async fn start_worker(
    name: &str,
    settings: &Arc<Settings>,
    registry: &WorkerRegistry,
    channel: &Arc<dyn Channel>,
) -> Result<Arc<WorkerHandle>, WorkerError> {
    let worker = registry.resolve(name, settings)?;
    let handle = Arc::new(WorkerHandle::new(worker, settings));
    handle.consume(Arc::clone(channel)).await?;
    Ok(handle)
}

async fn shutdown_signal() -> Result<(), WorkerError> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(|e| WorkerError::illegal_state(format!("failed to install SIGTERM handler: {e}")))?;
    #[cfg(unix)]
    let terminate = sigterm.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => {
            result.map_err(|e| WorkerError::illegal_state(format!("failed to listen for Ctrl+C: {e}")))?;
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
    Ok(())
}
