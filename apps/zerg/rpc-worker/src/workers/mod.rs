//! Workers served by this service

mod orders;
mod ping;

pub use orders::{NewOrder, OrdersWorker};
pub use ping::PingWorker;

use amqp_worker::{WorkerError, WorkerRegistry};

/// Registry with every worker this service can run.
///
/// Which ones actually start is decided by `WORKERS`.
pub fn registry() -> Result<WorkerRegistry, WorkerError> {
    WorkerRegistry::new()
        .with_worker("orders", |settings| OrdersWorker::new(settings.debug))?
        .with_worker("ping", |settings| PingWorker::new(&settings.service_name))
}
