use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::config::ArchivistConfig;
use crate::events::InProcEventBus;
use crate::gateway::StorageGateway;
use crate::notify::{JobInfoRepository, Notifier};
use crate::store::EntityStore;

use super::supervisor::ArchivistRuntime;

/// Builder for constructing an `ArchivistRuntime` with explicit dependencies.
///
/// The builder validates that all required dependencies are provided before
/// constructing the runtime. Each dependency is configured via a `with_*` method.
///
/// # Example
///
/// ```ignore
/// use archivist::*;
///
/// let runtime = ArchivistRuntimeBuilder::new(config)
///     .with_store(store)
///     .with_gateway(gateway)
///     .with_notifier(notifier)
///     .with_jobs(jobs)
///     .build()?;
/// let sender = runtime.start().await;
/// ```
pub struct ArchivistRuntimeBuilder<S, G, N>
where
    S: EntityStore + ?Sized + 'static,
    G: StorageGateway + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    config: ArchivistConfig,
    store: Option<Arc<S>>,
    gateway: Option<Arc<G>>,
    notifier: Option<Arc<N>>,
    jobs: Option<Arc<dyn JobInfoRepository>>,
    events: Option<Arc<InProcEventBus>>,
}

impl<S, G, N> fmt::Debug for ArchivistRuntimeBuilder<S, G, N>
where
    S: EntityStore + ?Sized + 'static,
    G: StorageGateway + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ArchivistRuntimeBuilder");
        debug.field("config", &self.config);
        debug.field("store_set", &self.store.is_some());
        debug.field("gateway_set", &self.gateway.is_some());
        debug.field("notifier_set", &self.notifier.is_some());
        debug.field("jobs_set", &self.jobs.is_some());
        debug.field("events_set", &self.events.is_some());

        if self.store.is_some() {
            debug.field("store_type", &type_name::<S>());
        }
        if self.gateway.is_some() {
            debug.field("gateway_type", &type_name::<G>());
        }
        if self.notifier.is_some() {
            debug.field("notifier_type", &type_name::<N>());
        }

        debug.finish()
    }
}

impl<S, G, N> ArchivistRuntimeBuilder<S, G, N>
where
    S: EntityStore + ?Sized + 'static,
    G: StorageGateway + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    /// Create a new builder with the given configuration.
    pub fn new(config: ArchivistConfig) -> Self {
        Self {
            config,
            store: None,
            gateway: None,
            notifier: None,
            jobs: None,
            events: None,
        }
    }

    /// Set the entity store.
    pub fn with_store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the storage gateway client.
    pub fn with_gateway(mut self, gateway: Arc<G>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the administrator notifier.
    pub fn with_notifier(mut self, notifier: Arc<N>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set the job metadata repository.
    pub fn with_jobs(mut self, jobs: Arc<dyn JobInfoRepository>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Share an existing event bus. A new one is created otherwise.
    pub fn with_events(mut self, events: Arc<InProcEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the `ArchivistRuntime` with all configured dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if any required dependency is missing.
    pub fn build(self) -> anyhow::Result<ArchivistRuntime<S, G, N>> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let gateway = self
            .gateway
            .ok_or_else(|| anyhow::anyhow!("gateway dependency missing"))?;
        let notifier = self
            .notifier
            .ok_or_else(|| anyhow::anyhow!("notifier dependency missing"))?;
        let jobs = self
            .jobs
            .ok_or_else(|| anyhow::anyhow!("jobs dependency missing"))?;
        let events = self.events.unwrap_or_else(|| {
            Arc::new(InProcEventBus::new(
                self.config.lifecycle.event_bus_capacity.max(1),
            ))
        });

        Ok(ArchivistRuntime::new(
            self.config,
            store,
            gateway,
            notifier,
            jobs,
            events,
        ))
    }
}
