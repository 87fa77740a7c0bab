use std::any::type_name;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::ArchivistConfig;
use crate::entity::Tenant;
use crate::events::{Envelope, InProcEventBus};
use crate::gateway::StorageGateway;
use crate::intake::EventIntake;
use crate::lifecycle::LifecycleService;
use crate::notify::{JobInfoRepository, Notifier};
use crate::scheduler::BulkScheduler;
use crate::store::EntityStore;

/// Token for signaling graceful shutdown to background tasks.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Wires the lifecycle service to its intake and sweeper tasks.
pub struct ArchivistRuntime<S, G, N>
where
    S: EntityStore + ?Sized + 'static,
    G: StorageGateway + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    config: ArchivistConfig,
    lifecycle: Arc<LifecycleService<S, G, N>>,
    intake: Arc<EventIntake<S, G, N>>,
    scheduler: Arc<BulkScheduler<S, G, N>>,
    events: Arc<InProcEventBus>,
    shutdown_token: ShutdownToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S, G, N> fmt::Debug for ArchivistRuntime<S, G, N>
where
    S: EntityStore + ?Sized + 'static,
    G: StorageGateway + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task_count = self
            .task_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("ArchivistRuntime")
            .field("config", &self.config)
            .field("store_type", &type_name::<S>())
            .field("gateway_type", &type_name::<G>())
            .field("notifier_type", &type_name::<N>())
            .field("events", &self.events)
            .field("task_count", &task_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl<S, G, N> ArchivistRuntime<S, G, N>
where
    S: EntityStore + ?Sized + 'static,
    G: StorageGateway + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    /// Create a runtime from its collaborators. Nothing runs until [`Self::start`].
    pub fn new(
        config: ArchivistConfig,
        store: Arc<S>,
        gateway: Arc<G>,
        notifier: Arc<N>,
        jobs: Arc<dyn JobInfoRepository>,
        events: Arc<InProcEventBus>,
    ) -> Self {
        let lifecycle = Arc::new(LifecycleService::new(
            store,
            gateway,
            notifier,
            jobs,
            events.clone(),
            config.lifecycle.clone(),
        ));
        let intake = Arc::new(EventIntake::new(
            Arc::clone(&lifecycle),
            events.clone(),
            &config.lifecycle,
        ));
        let tenants = config.tenants.iter().cloned().map(Tenant::from).collect();
        let scheduler = Arc::new(BulkScheduler::new(Arc::clone(&lifecycle), tenants));

        Self {
            config,
            lifecycle,
            intake,
            scheduler,
            events,
            shutdown_token: ShutdownToken::new(),
            task_handles: Mutex::new(Vec::new()),
        }
    }

    /// Get the runtime configuration.
    pub fn config(&self) -> &ArchivistConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> Arc<LifecycleService<S, G, N>> {
        Arc::clone(&self.lifecycle)
    }

    pub fn intake(&self) -> Arc<EventIntake<S, G, N>> {
        Arc::clone(&self.intake)
    }

    pub fn scheduler(&self) -> Arc<BulkScheduler<S, G, N>> {
        Arc::clone(&self.scheduler)
    }

    /// Get a clone of the lifecycle/dead-letter event bus.
    pub fn events(&self) -> Arc<InProcEventBus> {
        Arc::clone(&self.events)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Start the intake loop and the periodic sweeper.
    ///
    /// Returns the sender the message transport pushes envelopes into.
    pub async fn start(&self) -> mpsc::Sender<Envelope> {
        let capacity = self.config.lifecycle.tenant_queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);

        let intake = Arc::clone(&self.intake).spawn(receiver, self.shutdown_token.clone());
        let sweeper = Arc::clone(&self.scheduler).spawn(
            Duration::from_millis(self.config.lifecycle.sweep_interval_ms),
            self.shutdown_token.clone(),
        );

        let mut handles = self.task_handles.lock().await;
        handles.push(intake);
        handles.push(sweeper);
        tracing::info!(tenants = ?self.config.tenants, "archivist runtime started");

        sender
    }

    /// Gracefully shut down the intake and the sweeper.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of archivist runtime");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.task_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Runtime task failed: {:?}", e),
                Err(_) => {
                    tracing::warn!("Runtime task timed out during shutdown")
                }
            }
        }

        tracing::info!("Archivist runtime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::task::yield_now().await;
        token.cancel();

        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("waiter should wake up")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_after_cancel() {
        let token = ShutdownToken::default();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect("already cancelled");
    }
}
