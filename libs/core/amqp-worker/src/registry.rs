//! Worker registry.
//!
//! Maps the identifiers listed in [`Settings::workers`] to factories. Workers
//! are registered explicitly at startup; there is no discovery by name.

use crate::error::WorkerError;
use crate::settings::Settings;
use crate::worker::Worker;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

type WorkerFactory = Box<dyn Fn(&Arc<Settings>) -> Arc<dyn Worker> + Send + Sync>;

/// Identifier → worker factory.
#[derive(Default)]
pub struct WorkerRegistry {
    factories: BTreeMap<String, WorkerFactory>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`. Names must be unique.
    pub fn register<F, W>(&mut self, name: impl Into<String>, factory: F) -> Result<(), WorkerError>
    where
        F: Fn(&Arc<Settings>) -> W + Send + Sync + 'static,
        W: Worker + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(WorkerError::invalid_argument("worker name must not be empty"));
        }
        if self.factories.contains_key(&name) {
            return Err(WorkerError::invalid_argument(format!(
                "worker '{name}' is already registered"
            )));
        }
        self.factories.insert(
            name,
            Box::new(move |settings| Arc::new(factory(settings)) as Arc<dyn Worker>),
        );
        Ok(())
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_worker<F, W>(mut self, name: impl Into<String>, factory: F) -> Result<Self, WorkerError>
    where
        F: Fn(&Arc<Settings>) -> W + Send + Sync + 'static,
        W: Worker + 'static,
    {
        self.register(name, factory)?;
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate the worker registered under `name`.
    pub fn resolve(&self, name: &str, settings: &Arc<Settings>) -> Result<Arc<dyn Worker>, WorkerError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| WorkerError::UnknownWorker(name.to_string()))?;
        Ok(factory(settings))
    }
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}
