use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::entity::{AipState, RejectedSip, SipId, SipState, Tenant};
use crate::error::{GatewayError, LifecycleError, NotificationError, SweepError};
use crate::gateway::{rejected_sips, AipSubmission, CallContext, StorageGateway};
use crate::lifecycle::LifecycleService;
use crate::notify::{deletion_rejected_notification, Notifier};
use crate::runtime::ShutdownToken;
use crate::store::{EntityStore, PageRequest, SipFilter};
use crate::telemetry;

/// Totals of one submission sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubmissionReport {
    pub batches: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// The storage service was unreachable; remaining AIPs stay CREATED.
    pub interrupted: bool,
}

/// Totals of one deletion sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub pages: usize,
    pub deleted: usize,
    pub rejected: Vec<RejectedSip>,
    /// SIPs left untouched because their page hit a transient failure.
    pub skipped: usize,
}

/// Result of both sweeps for one tenant.
#[derive(Debug)]
pub struct TenantSweep {
    pub tenant: Tenant,
    pub submission: Result<SubmissionReport, SweepError>,
    pub deletion: Result<DeletionReport, SweepError>,
}

/// Turns the entities awaiting outbound action into size-bounded requests.
pub struct BulkScheduler<S, G, N>
where
    S: EntityStore + ?Sized + 'static,
    G: StorageGateway + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    lifecycle: Arc<LifecycleService<S, G, N>>,
    tenants: Vec<Tenant>,
}

impl<S, G, N> fmt::Debug for BulkScheduler<S, G, N>
where
    S: EntityStore + ?Sized + 'static,
    G: StorageGateway + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkScheduler")
            .field("tenants", &self.tenants)
            .field(
                "submission_batch_size",
                &self.lifecycle.config().submission_batch_size,
            )
            .field(
                "deletion_page_size",
                &self.lifecycle.config().deletion_page_size,
            )
            .finish()
    }
}

impl<S, G, N> BulkScheduler<S, G, N>
where
    S: EntityStore + ?Sized + 'static,
    G: StorageGateway + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    pub fn new(lifecycle: Arc<LifecycleService<S, G, N>>, tenants: Vec<Tenant>) -> Self {
        Self { lifecycle, tenants }
    }

    pub fn tenants(&self) -> &[Tenant] {
        &self.tenants
    }

    /// Submit every CREATED AIP of the tenant, one batch at a time.
    ///
    /// Batch membership is re-read from the store before each request, so an
    /// interrupted sweep simply resumes from the AIPs still CREATED.
    pub async fn submission_sweep(&self, ctx: &CallContext) -> Result<SubmissionReport, SweepError> {
        let span = telemetry::sweep_span(ctx.tenant(), "submission");
        let timer = telemetry::record_sweep_start(ctx.tenant(), "submission");
        let result = self.submit_all(ctx).instrument(span).await;
        telemetry::record_sweep_end(timer, if result.is_ok() { "completed" } else { "aborted" });
        result
    }

    async fn submit_all(&self, ctx: &CallContext) -> Result<SubmissionReport, SweepError> {
        let tenant = ctx.tenant();
        let store = self.lifecycle.store();
        let gateway = self.lifecycle.gateway();
        let batch_size = self.lifecycle.config().submission_batch_size.max(1);

        let mut report = SubmissionReport::default();
        let mut submitted: HashSet<_> = HashSet::new();

        loop {
            let pending = store
                .find_aips_by_state(tenant, AipState::Created, batch_size)
                .await?;
            if pending.is_empty() {
                break;
            }
            // Rows that stay CREATED after being answered would be offered forever.
            if pending.iter().all(|aip| submitted.contains(aip.aip_id())) {
                tracing::warn!(count = pending.len(), "CREATED AIPs did not move after submission");
                break;
            }

            let batch: Vec<AipSubmission> = pending
                .iter()
                .map(|aip| AipSubmission {
                    aip_id: aip.aip_id().clone(),
                    sip_id: aip.sip_id().clone(),
                })
                .collect();
            submitted.extend(batch.iter().map(|s| s.aip_id.clone()));

            let outcome = match gateway.store(ctx, batch.clone()).await {
                Ok(outcome) => outcome,
                Err(GatewayError::Transient(reason)) => {
                    tracing::warn!(batch = batch.len(), "storage request interrupted: {reason}");
                    report.interrupted = true;
                    break;
                }
                Err(err) => return Err(LifecycleError::from(err).into()),
            };

            report.batches += 1;
            report.rejected += outcome.rejected.len();
            report.accepted += batch.len().saturating_sub(outcome.rejected.len());
            self.lifecycle.record_submission(ctx, &batch, &outcome).await?;

            if pending.len() < batch_size {
                break;
            }
        }

        Ok(report)
    }

    /// Ask the storage service to delete the AIPs of every TO_BE_DELETED SIP.
    ///
    /// SIPs are handled one page at a time. The deletion call itself runs
    /// under an elevated copy of `ctx`. Refused SIPs stay TO_BE_DELETED and
    /// are offered again by the next sweep.
    pub async fn deletion_sweep(&self, ctx: &CallContext) -> Result<DeletionReport, SweepError> {
        let span = telemetry::sweep_span(ctx.tenant(), "deletion");
        let timer = telemetry::record_sweep_start(ctx.tenant(), "deletion");
        let result = self.delete_all(ctx).instrument(span).await;
        telemetry::record_sweep_end(timer, if result.is_ok() { "completed" } else { "aborted" });
        result
    }

    async fn delete_all(&self, ctx: &CallContext) -> Result<DeletionReport, SweepError> {
        let tenant = ctx.tenant();
        let store = self.lifecycle.store();
        let gateway = self.lifecycle.gateway();
        let notifier = self.lifecycle.notifier();
        let page_size = self.lifecycle.config().deletion_page_size.max(1);
        let filter = SipFilter::in_state(SipState::ToBeDeleted);

        let mut report = DeletionReport::default();
        // SIPs left TO_BE_DELETED by earlier pages sort before the unseen ones.
        let mut offset = 0;

        loop {
            let page = store
                .search_sips(tenant, &filter, PageRequest::new(offset, page_size))
                .await?;
            if page.is_empty() {
                break;
            }
            let last_page = page.len() < page_size;
            let ids: Vec<SipId> = page.iter().map(|sip| sip.sip_id().clone()).collect();
            let requested: BTreeSet<SipId> = ids.iter().cloned().collect();
            report.pages += 1;

            let answer = gateway
                .delete_aips_from_sips(&ctx.elevated(), requested.clone())
                .await;
            let rejected = match rejected_sips(answer) {
                Ok(rejected) => rejected,
                Err(err) => {
                    tracing::warn!(page = ids.len(), "deletion request interrupted: {err}");
                    report.skipped += ids.len();
                    offset += ids.len();
                    if last_page {
                        break;
                    }
                    continue;
                }
            };

            let (rejected, unknown): (Vec<_>, Vec<_>) = rejected
                .into_iter()
                .partition(|r| requested.contains(&r.sip_id));
            if !unknown.is_empty() {
                tracing::warn!(count = unknown.len(), "storage service rejected SIPs outside the request");
            }

            if !rejected.is_empty() {
                telemetry::record_deletion_rejections(tenant, rejected.len());
                match notifier
                    .notify(tenant, deletion_rejected_notification(&rejected))
                    .await
                {
                    Ok(()) => {}
                    Err(err @ NotificationError::Client(_)) => {
                        return Err(SweepError::Notification(err));
                    }
                    Err(err @ NotificationError::Server(_)) => {
                        tracing::error!("deletion rejection notification not delivered: {err}");
                    }
                }
            }

            let outcome = self
                .lifecycle
                .record_deletion_page(ctx, &ids, &rejected)
                .await?;
            report.deleted += outcome
                .transitions()
                .iter()
                .filter(|t| t.to == SipState::Deleted)
                .count();
            offset += rejected.len();
            report.rejected.extend(rejected);

            if last_page {
                break;
            }
        }

        Ok(report)
    }

    /// Run both sweeps for every configured tenant.
    ///
    /// A failing tenant is logged and does not stop the others.
    pub async fn run_once(&self) -> Vec<TenantSweep> {
        let mut sweeps = Vec::with_capacity(self.tenants.len());
        for tenant in &self.tenants {
            let ctx = CallContext::for_tenant(tenant.clone());

            let submission = self.submission_sweep(&ctx).await;
            if let Err(err) = &submission {
                tracing::error!(tenant = %tenant, "submission sweep failed: {err}");
            }
            let deletion = self.deletion_sweep(&ctx).await;
            if let Err(err) = &deletion {
                tracing::error!(tenant = %tenant, "deletion sweep failed: {err}");
            }

            sweeps.push(TenantSweep {
                tenant: tenant.clone(),
                submission,
                deletion,
            });
        }
        sweeps
    }

    /// Run [`BulkScheduler::run_once`] every `interval` until shutdown.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: ShutdownToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Bulk scheduler shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        self.run_once().await;
                    }
                }
            }
        })
    }
}
