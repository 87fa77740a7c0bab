//! Inbound message handling.
//!
//! Every envelope gets a fresh [`CallContext`] built from its tenant, so
//! nothing set up for one message can be observed by the next. What happens
//! to a message whose handler failed is decided here, by the configured
//! [`FailurePolicy`], never inside the handler itself.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::config::{FailurePolicy, LifecycleConfig};
use crate::entity::Tenant;
use crate::error::LifecycleError;
use crate::events::{Envelope, EventPublisher, InboundMessage};
use crate::gateway::{CallContext, StorageGateway};
use crate::lifecycle::{LifecycleService, Outcome};
use crate::notify::Notifier;
use crate::runtime::ShutdownToken;
use crate::store::EntityStore;
use crate::telemetry;

/// How often the dispatcher retries handing over buffered envelopes.
const BACKLOG_RETRY: Duration = Duration::from_millis(10);

/// Final fate of one envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The handler succeeded, possibly after retries.
    Handled(Outcome),
    /// The handler failed and the message was logged and dropped.
    Dropped,
    /// The handler failed and the envelope went to the dead-letter channel.
    DeadLettered,
}

/// Dispatches inbound messages to the lifecycle service.
pub struct EventIntake<S, G, N>
where
    S: EntityStore + ?Sized + 'static,
    G: StorageGateway + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    lifecycle: Arc<LifecycleService<S, G, N>>,
    dead_letters: Arc<dyn EventPublisher<Envelope>>,
    policy: FailurePolicy,
    tenant_queue_capacity: usize,
}

impl<S, G, N> fmt::Debug for EventIntake<S, G, N>
where
    S: EntityStore + ?Sized + 'static,
    G: StorageGateway + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventIntake")
            .field("policy", &self.policy)
            .field("tenant_queue_capacity", &self.tenant_queue_capacity)
            .finish()
    }
}

impl<S, G, N> EventIntake<S, G, N>
where
    S: EntityStore + ?Sized + 'static,
    G: StorageGateway + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    pub fn new(
        lifecycle: Arc<LifecycleService<S, G, N>>,
        dead_letters: Arc<dyn EventPublisher<Envelope>>,
        config: &LifecycleConfig,
    ) -> Self {
        Self {
            lifecycle,
            dead_letters,
            policy: config.failure_policy,
            tenant_queue_capacity: config.tenant_queue_capacity.max(1),
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Run the handler for one envelope once.
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<Outcome, LifecycleError> {
        let ctx = CallContext::for_tenant(envelope.tenant.clone());
        match &envelope.message {
            InboundMessage::Aip(event) => self.lifecycle.handle_aip_event(&ctx, event).await,
            InboundMessage::Broadcast(event) => self.lifecycle.handle_broadcast(&ctx, event).await,
            InboundMessage::Job(event) => Ok(self.lifecycle.handle_job_event(&ctx, event).await),
        }
    }

    /// Handle one envelope and apply the failure policy to the result.
    pub async fn handle(&self, envelope: Envelope) -> Disposition {
        let tenant = envelope.tenant.clone();
        let kind = envelope.message.kind();
        let correlation_id = envelope.correlation_id;

        let disposition = telemetry::instrument_intake(&tenant, kind, correlation_id, async {
            let mut retries = 0u32;
            loop {
                let err = match self.dispatch(&envelope).await {
                    Ok(outcome) => return Disposition::Handled(outcome),
                    Err(err) => err,
                };

                match self.policy {
                    FailurePolicy::Retry {
                        attempts,
                        backoff_ms,
                    } if err.is_retryable() && retries < attempts => {
                        retries += 1;
                        tracing::warn!(retries, "message handling failed, retrying: {err}");
                        tokio::time::sleep(Duration::from_millis(
                            backoff_ms.saturating_mul(u64::from(retries)),
                        ))
                        .await;
                    }
                    FailurePolicy::DeadLetter => {
                        tracing::error!("message handling failed, dead-lettering: {err}");
                        if let Err(publish_err) = self.dead_letters.publish(envelope.clone()).await {
                            tracing::error!("dead letter not published: {publish_err}");
                        }
                        return Disposition::DeadLettered;
                    }
                    FailurePolicy::LogAndContinue | FailurePolicy::Retry { .. } => {
                        tracing::error!(retries, "message handling failed, dropping: {err}");
                        return Disposition::Dropped;
                    }
                }
            }
        })
        .await;

        let outcome = match &disposition {
            Disposition::Handled(outcome) => outcome.as_str(),
            Disposition::Dropped | Disposition::DeadLettered => "failed",
        };
        telemetry::record_event_handled(&tenant, kind, outcome);
        disposition
    }

    /// Consume envelopes until `receiver` closes or `shutdown` fires.
    ///
    /// Messages of one tenant are handled one after another, in arrival
    /// order, by a dedicated worker; different tenants proceed in parallel.
    /// The dispatcher never waits on a worker: when a tenant's queue is full
    /// its envelopes pile up in that tenant's backlog, in order, while other
    /// tenants keep flowing. On shutdown the workers drain what they already
    /// buffered.
    pub fn spawn(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<Envelope>,
        shutdown: ShutdownToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut lanes: HashMap<Tenant, TenantLane> = HashMap::new();

            loop {
                let mut backlogged = false;
                for (tenant, lane) in lanes.iter_mut().filter(|(_, lane)| lane.is_backlogged()) {
                    backlogged |= lane.flush(tenant);
                }

                let envelope = tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Event intake shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(BACKLOG_RETRY), if backlogged => continue,
                    envelope = receiver.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };

                let tenant = envelope.tenant.clone();
                lanes
                    .entry(tenant.clone())
                    .or_insert_with(|| self.spawn_tenant_worker(tenant.clone()))
                    .offer(&tenant, envelope);
            }

            for (tenant, lane) in lanes {
                lane.close(&tenant).await;
            }
        })
    }

    fn spawn_tenant_worker(self: &Arc<Self>, tenant: Tenant) -> TenantLane {
        let (sender, mut rx) = mpsc::channel::<Envelope>(self.tenant_queue_capacity);
        let intake = Arc::clone(self);
        tracing::debug!(tenant = %tenant, "starting intake worker");
        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                intake.handle(envelope).await;
            }
            tracing::debug!(tenant = %tenant, "intake worker stopped");
        });
        TenantLane {
            sender,
            handle,
            backlog: VecDeque::new(),
        }
    }
}

/// One tenant's worker and the envelopes its queue could not take yet.
struct TenantLane {
    sender: mpsc::Sender<Envelope>,
    handle: JoinHandle<()>,
    backlog: VecDeque<Envelope>,
}

impl TenantLane {
    fn is_backlogged(&self) -> bool {
        !self.backlog.is_empty()
    }

    fn offer(&mut self, tenant: &Tenant, envelope: Envelope) {
        let was_backlogged = self.is_backlogged();
        self.backlog.push_back(envelope);
        if self.flush(tenant) && !was_backlogged {
            tracing::warn!(tenant = %tenant, "tenant intake queue full, buffering");
        }
    }

    // Hand over as much of the backlog as the queue takes without waiting.
    // Returns whether envelopes are still waiting.
    fn flush(&mut self, tenant: &Tenant) -> bool {
        while let Some(envelope) = self.backlog.pop_front() {
            match self.sender.try_send(envelope) {
                Ok(()) => {}
                Err(TrySendError::Full(envelope)) => {
                    self.backlog.push_front(envelope);
                    return true;
                }
                Err(TrySendError::Closed(envelope)) => {
                    tracing::error!(
                        tenant = %tenant,
                        correlation_id = %envelope.correlation_id,
                        "tenant worker stopped, message dropped"
                    );
                }
            }
        }
        false
    }

    async fn close(self, tenant: &Tenant) {
        let TenantLane {
            sender,
            handle,
            backlog,
        } = self;
        for envelope in backlog {
            if sender.send(envelope).await.is_err() {
                tracing::error!(tenant = %tenant, "tenant worker stopped, backlog dropped");
                break;
            }
        }
        drop(sender);
        if let Err(err) = handle.await {
            tracing::warn!(tenant = %tenant, "intake worker failed: {err:?}");
        }
    }
}
