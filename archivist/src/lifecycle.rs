//! SIP/AIP state machine.
//!
//! [`LifecycleService`] owns every transition of SIP and AIP records. Each
//! transition reads the current snapshots, computes the next ones and writes
//! them back as one [`Changeset`], while holding an async lock keyed by
//! (tenant, SIP). Two events touching AIPs of the same SIP therefore never
//! aggregate from a torn view of the siblings.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;
use tracing::Instrument;

use crate::config::LifecycleConfig;
use crate::entity::{
    AipEntity, AipId, AipState, RejectedSip, SipEntity, SipId, SipState, Tenant,
};
use crate::error::LifecycleError;
use crate::events::{
    AipEvent, AipEventState, BroadcastEntityEvent, BroadcastEventType, EventPublisher,
    JobEvent, JobEventType, LifecycleEvent,
};
use crate::gateway::{retrieve_all_aips, AipSubmission, CallContext, StorageGateway, StoreOutcome};
use crate::notify::{job_failed_notification, JobInfoRepository, Notifier};
use crate::store::{Changeset, EntityStore, PageRequest, SipFilter};
use crate::telemetry;

/// A SIP state change produced by a transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SipTransition {
    pub sip_id: SipId,
    pub from: SipState,
    pub to: SipState,
}

/// What handling one message or one batch did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Records were written. Lists the SIP state changes, possibly none.
    Applied(Vec<SipTransition>),
    /// The entities were already in the target state.
    Unchanged,
    /// The message sub-type is not acted upon.
    Ignored,
    /// The referenced entity does not exist (any more).
    Missing,
    /// An administrator notification was attempted; no record changed.
    Notified,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Applied(_) => "applied",
            Outcome::Unchanged => "unchanged",
            Outcome::Ignored => "ignored",
            Outcome::Missing => "missing",
            Outcome::Notified => "notified",
        }
    }

    pub fn transitions(&self) -> &[SipTransition] {
        match self {
            Outcome::Applied(transitions) => transitions,
            _ => &[],
        }
    }

    /// Combine the outcomes of several AIPs named by one message.
    pub fn merge(self, other: Outcome) -> Outcome {
        match (self, other) {
            (Outcome::Applied(mut a), Outcome::Applied(b)) => {
                a.extend(b);
                Outcome::Applied(a)
            }
            (applied @ Outcome::Applied(_), _) | (_, applied @ Outcome::Applied(_)) => applied,
            (Outcome::Notified, _) | (_, Outcome::Notified) => Outcome::Notified,
            (Outcome::Unchanged, _) | (_, Outcome::Unchanged) => Outcome::Unchanged,
            (Outcome::Missing, _) | (_, Outcome::Missing) => Outcome::Missing,
            (Outcome::Ignored, Outcome::Ignored) => Outcome::Ignored,
        }
    }
}

/// Which SIPs a deletion request targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeletionSelector {
    SipIds(BTreeSet<SipId>),
    Session(String),
    Provider(String),
}

// SIPs in these states are driven by the deletion sequence only.
fn in_deletion(state: SipState) -> bool {
    matches!(
        state,
        SipState::ToBeDeleted | SipState::Deleted | SipState::Incomplete
    )
}

/// Derive a SIP's state from the states of its AIPs.
///
/// A child in STORE_ERROR or AIP_REJECTED pins the SIP to STORE_ERROR whatever
/// its siblings do, until that child recovers. Once every failing child
/// recovered but some are still in flight, the SIP falls back to QUEUED.
/// SIPs in the deletion sequence and SIPs without children keep their
/// current state.
pub fn aggregate_sip_state(current: SipState, children: &[AipState]) -> SipState {
    if in_deletion(current) || children.is_empty() {
        return current;
    }
    if children
        .iter()
        .any(|s| matches!(s, AipState::StoreError | AipState::Rejected))
    {
        return SipState::StoreError;
    }
    if children.iter().all(|s| *s == AipState::Indexed) {
        return SipState::Indexed;
    }
    if children.iter().any(|s| *s == AipState::IndexError) {
        return SipState::IndexError;
    }
    if children
        .iter()
        .all(|s| matches!(s, AipState::Stored | AipState::Indexed))
    {
        return SipState::Stored;
    }
    if current.is_error() {
        SipState::Queued
    } else {
        current
    }
}

/// Cause appended to a SIP when one of its AIPs failed to be stored.
pub fn storage_failure_cause(aip_id: &AipId, cause: &str) -> String {
    format!("Storage of AIP({aip_id}) failed: {cause}")
}

/// Cause appended to a SIP when one of its AIPs was refused at submission.
pub fn submission_rejected_cause(aip_id: &AipId, reason: &str) -> String {
    format!("Storage request for AIP({aip_id}) rejected: {reason}")
}

/// Cause appended to a SIP when the storage service refused its deletion.
pub fn deletion_rejected_cause(reason: &str) -> String {
    format!("Deletion rejected by the archival storage: {reason}")
}

const LOCK_TABLE_PRUNE_THRESHOLD: usize = 1024;

/// Re-runs of one transition after losing a write race, before giving up.
const MAX_CONFLICT_RETRIES: u32 = 8;

// The in-process lock only orders writers of this service; writers elsewhere
// are caught by the store's version check, and the transition is re-run.
async fn retry_on_conflict<F, Fut>(mut transition: F) -> Result<Outcome, LifecycleError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Outcome, LifecycleError>>,
{
    let mut conflicts = 0;
    loop {
        match transition().await {
            Err(LifecycleError::Conflict(conflict)) if conflicts < MAX_CONFLICT_RETRIES => {
                conflicts += 1;
                tracing::debug!(
                    sip_id = %conflict.sip_id,
                    conflicts,
                    "SIP changed concurrently, re-running transition"
                );
            }
            result => return result,
        }
    }
}

/// Per-(tenant, SIP) async locks.
#[derive(Default)]
struct SipLocks {
    inner: parking_lot::Mutex<HashMap<(Tenant, SipId), Arc<tokio::sync::Mutex<()>>>>,
}

impl SipLocks {
    async fn lock(&self, tenant: &Tenant, sip_id: &SipId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock();
            if map.len() > LOCK_TABLE_PRUNE_THRESHOLD {
                map.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(
                map.entry((tenant.clone(), sip_id.clone()))
                    .or_default(),
            )
        };
        lock.lock_owned().await
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// The lifecycle state machine.
pub struct LifecycleService<S, G, N>
where
    S: EntityStore + ?Sized + 'static,
    G: StorageGateway + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    store: Arc<S>,
    gateway: Arc<G>,
    notifier: Arc<N>,
    jobs: Arc<dyn JobInfoRepository>,
    events: Arc<dyn EventPublisher<LifecycleEvent>>,
    config: LifecycleConfig,
    locks: SipLocks,
}

impl<S, G, N> fmt::Debug for LifecycleService<S, G, N>
where
    S: EntityStore + ?Sized + 'static,
    G: StorageGateway + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleService")
            .field("store_type", &std::any::type_name::<S>())
            .field("gateway_type", &std::any::type_name::<G>())
            .field("notifier_type", &std::any::type_name::<N>())
            .field("config", &self.config)
            .field("locked_sips", &self.locks.len())
            .finish()
    }
}

impl<S, G, N> LifecycleService<S, G, N>
where
    S: EntityStore + ?Sized + 'static,
    G: StorageGateway + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    pub fn new(
        store: Arc<S>,
        gateway: Arc<G>,
        notifier: Arc<N>,
        jobs: Arc<dyn JobInfoRepository>,
        events: Arc<dyn EventPublisher<LifecycleEvent>>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            jobs,
            events,
            config,
            locks: SipLocks::default(),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn gateway(&self) -> Arc<G> {
        Arc::clone(&self.gateway)
    }

    pub fn notifier(&self) -> Arc<N> {
        Arc::clone(&self.notifier)
    }

    /// Apply a storage confirmation or failure.
    pub async fn handle_aip_event(
        &self,
        ctx: &CallContext,
        event: &AipEvent,
    ) -> Result<Outcome, LifecycleError> {
        match event.aip_state {
            AipEventState::StorageError => {
                retry_on_conflict(move || self.aip_storage_failed(ctx, event)).await
            }
            AipEventState::Stored => {
                retry_on_conflict(move || self.aip_stored(ctx, &event.aip_id)).await
            }
            AipEventState::Deleted => retry_on_conflict(move || self.aip_deleted(ctx, event)).await,
            AipEventState::Pending
            | AipEventState::Valid
            | AipEventState::StoringMetadata
            | AipEventState::Updated => Ok(Outcome::Ignored),
        }
    }

    /// Apply an indexing outcome to every AIP it names.
    pub async fn handle_broadcast(
        &self,
        ctx: &CallContext,
        event: &BroadcastEntityEvent,
    ) -> Result<Outcome, LifecycleError> {
        let indexed = match event.event_type {
            BroadcastEventType::Indexed => true,
            BroadcastEventType::IndexError => false,
            BroadcastEventType::Create
            | BroadcastEventType::Update
            | BroadcastEventType::Delete => return Ok(Outcome::Ignored),
        };

        let mut outcome = Outcome::Missing;
        for aip_id in &event.aip_ids {
            let next = if indexed {
                retry_on_conflict(move || self.aip_indexed(ctx, aip_id)).await?
            } else {
                retry_on_conflict(move || self.aip_index_failed(ctx, aip_id)).await?
            };
            outcome = outcome.merge(next);
        }
        Ok(outcome)
    }

    /// Notify administrators of a failed job. Never fails.
    pub async fn handle_job_event(&self, ctx: &CallContext, event: &JobEvent) -> Outcome {
        match event.job_event_type {
            JobEventType::Failed => self.job_failed(ctx, &event.job_id).await,
            JobEventType::Queued
            | JobEventType::Running
            | JobEventType::Succeeded
            | JobEventType::Aborted => Outcome::Ignored,
        }
    }

    async fn job_failed(&self, ctx: &CallContext, job_id: &str) -> Outcome {
        let tenant = ctx.tenant();
        let info = match self.jobs.find_job(tenant, job_id).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                tracing::warn!(tenant = %tenant, job_id, "failed job not found");
                return Outcome::Missing;
            }
            Err(err) => {
                tracing::error!(tenant = %tenant, job_id, "failed job lookup error: {err:#}");
                return Outcome::Missing;
            }
        };

        let notification = job_failed_notification(job_id, &info);
        if let Err(err) = self.notifier.notify(tenant, notification).await {
            tracing::error!(tenant = %tenant, job_id, "job failure notification not sent: {err}");
        }
        Outcome::Notified
    }

    // Lock the SIP owning `aip_id` and return the AIP as seen under the lock.
    async fn lock_aip(
        &self,
        tenant: &Tenant,
        aip_id: &AipId,
    ) -> Result<Option<(OwnedMutexGuard<()>, AipEntity)>, LifecycleError> {
        let Some(aip) = self.store.find_aip(tenant, aip_id).await? else {
            tracing::debug!(tenant = %tenant, aip_id = %aip_id, "AIP not found, event already resolved");
            return Ok(None);
        };
        let guard = self.locks.lock(tenant, aip.sip_id()).await;
        Ok(self
            .store
            .find_aip(tenant, aip_id)
            .await?
            .map(|aip| (guard, aip)))
    }

    async fn aip_storage_failed(
        &self,
        ctx: &CallContext,
        event: &AipEvent,
    ) -> Result<Outcome, LifecycleError> {
        let tenant = ctx.tenant();
        let Some((_guard, aip)) = self.lock_aip(tenant, &event.aip_id).await? else {
            return Ok(Outcome::Missing);
        };

        let cause = event
            .failure_cause
            .clone()
            .unwrap_or_else(|| "unknown cause".to_string());
        let sip = self.store.find_sip(tenant, aip.sip_id()).await?;

        let sip_flagged = sip.as_ref().map_or(true, |sip| {
            sip.state() == SipState::StoreError || in_deletion(sip.state())
        });
        if aip.state() == AipState::StoreError
            && aip.error_message() == Some(cause.as_str())
            && sip_flagged
        {
            return Ok(Outcome::Unchanged);
        }

        let mut changes = Changeset::new();
        let mut transitions = Vec::new();
        if let Some(sip) = sip {
            if !in_deletion(sip.state()) {
                let from = sip.state();
                let next = sip
                    .with_state(SipState::StoreError)
                    .with_rejection_cause(storage_failure_cause(aip.aip_id(), &cause));
                push_transition(&mut transitions, next.sip_id(), from, next.state());
                changes = changes.upsert_sip(next);
            }
        } else {
            tracing::warn!(tenant = %tenant, sip_id = %aip.sip_id(), "owning SIP not found");
        }
        changes = changes.upsert_aip(aip.with_error(AipState::StoreError, cause));

        self.commit(tenant, changes, transitions).await
    }

    async fn aip_stored(
        &self,
        ctx: &CallContext,
        aip_id: &AipId,
    ) -> Result<Outcome, LifecycleError> {
        let tenant = ctx.tenant();
        let Some((_guard, aip)) = self.lock_aip(tenant, aip_id).await? else {
            return Ok(Outcome::Missing);
        };
        if matches!(aip.state(), AipState::Stored | AipState::Indexed) {
            return Ok(Outcome::Unchanged);
        }

        let next = aip.with_state(AipState::Stored);
        let (changes, transitions) = self.reaggregate(tenant, next).await?;
        self.commit(tenant, changes, transitions).await
    }

    async fn aip_indexed(
        &self,
        ctx: &CallContext,
        aip_id: &AipId,
    ) -> Result<Outcome, LifecycleError> {
        let tenant = ctx.tenant();
        let Some((_guard, aip)) = self.lock_aip(tenant, aip_id).await? else {
            return Ok(Outcome::Missing);
        };
        if aip.state() == AipState::Indexed {
            return Ok(Outcome::Unchanged);
        }

        let next = aip.with_state(AipState::Indexed);
        let (changes, transitions) = self.reaggregate(tenant, next).await?;
        self.commit(tenant, changes, transitions).await
    }

    async fn aip_index_failed(
        &self,
        ctx: &CallContext,
        aip_id: &AipId,
    ) -> Result<Outcome, LifecycleError> {
        let tenant = ctx.tenant();
        let Some((_guard, aip)) = self.lock_aip(tenant, aip_id).await? else {
            return Ok(Outcome::Missing);
        };
        if aip.state() == AipState::IndexError {
            return Ok(Outcome::Unchanged);
        }

        let next = aip.with_state(AipState::IndexError);
        let (changes, transitions) = self.reaggregate(tenant, next).await?;
        self.commit(tenant, changes, transitions).await
    }

    // Write `aip` and re-derive its SIP from the updated sibling set. Once every
    // sibling is indexed the tracking rows are dropped instead.
    //
    // The SIP is read before its siblings and always written back, so a sibling
    // committed elsewhere after the SIP read fails this changeset's version check.
    async fn reaggregate(
        &self,
        tenant: &Tenant,
        aip: AipEntity,
    ) -> Result<(Changeset, Vec<SipTransition>), LifecycleError> {
        let Some(sip) = self.store.find_sip(tenant, aip.sip_id()).await? else {
            tracing::warn!(tenant = %tenant, sip_id = %aip.sip_id(), "owning SIP not found");
            return Ok((Changeset::new().upsert_aip(aip), Vec::new()));
        };

        let mut siblings = self.store.find_aips_by_sip(tenant, aip.sip_id()).await?;
        match siblings.iter_mut().find(|s| s.aip_id() == aip.aip_id()) {
            Some(slot) => *slot = aip.clone(),
            None => siblings.push(aip.clone()),
        }
        let states: Vec<AipState> = siblings.iter().map(AipEntity::state).collect();

        let from = sip.state();
        let to = aggregate_sip_state(from, &states);
        let mut transitions = Vec::new();
        let mut changes = Changeset::new();

        if to == SipState::Indexed {
            for sibling in siblings {
                changes = changes.remove_aip(sibling.aip_id().clone());
            }
        } else {
            changes = changes.upsert_aip(aip);
        }
        if to == from {
            changes = changes.upsert_sip(sip);
        } else {
            push_transition(&mut transitions, sip.sip_id(), from, to);
            changes = changes.upsert_sip(sip.with_state(to));
        }
        Ok((changes, transitions))
    }

    async fn aip_deleted(
        &self,
        ctx: &CallContext,
        event: &AipEvent,
    ) -> Result<Outcome, LifecycleError> {
        let tenant = ctx.tenant();
        let _guard = self.locks.lock(tenant, &event.sip_id).await;

        let mut changes = Changeset::new();
        if self.store.find_aip(tenant, &event.aip_id).await?.is_some() {
            changes = changes.remove_aip(event.aip_id.clone());
        }

        let Some(sip) = self.store.find_sip(tenant, &event.sip_id).await? else {
            tracing::debug!(tenant = %tenant, sip_id = %event.sip_id, "SIP not found for deleted AIP");
            return if changes.is_empty() {
                Ok(Outcome::Missing)
            } else {
                self.commit(tenant, changes, Vec::new()).await
            };
        };

        let remote = retrieve_all_aips(
            self.gateway.as_ref(),
            ctx,
            sip.sip_id(),
            self.config.remote_page_size,
        )
        .await?;
        let fully_deleted = remote.iter().all(|aip| aip.state == AipState::Deleted);

        let from = sip.state();
        let to = if fully_deleted {
            SipState::Deleted
        } else {
            SipState::Incomplete
        };

        if fully_deleted {
            for local in self.store.find_aips_by_sip(tenant, sip.sip_id()).await? {
                if local.aip_id() != &event.aip_id {
                    changes = changes.remove_aip(local.aip_id().clone());
                }
            }
        }

        let mut transitions = Vec::new();
        if to != from {
            push_transition(&mut transitions, sip.sip_id(), from, to);
            changes = changes.upsert_sip(sip.with_state(to));
        }

        if changes.is_empty() {
            return Ok(Outcome::Unchanged);
        }
        self.commit(tenant, changes, transitions).await
    }

    /// Mark SIPs for deletion.
    ///
    /// SIPs that never reached the storage service (CREATED) are deleted at
    /// once together with their AIP rows. QUEUED SIPs and SIPs already in the
    /// deletion sequence are refused. Every other SIP moves to TO_BE_DELETED
    /// and is handled by the next deletion sweep.
    pub async fn request_deletion(
        &self,
        ctx: &CallContext,
        selector: DeletionSelector,
    ) -> Result<Vec<RejectedSip>, LifecycleError> {
        let tenant = ctx.tenant();
        let mut rejected = Vec::new();

        let targets = match selector {
            DeletionSelector::SipIds(ids) => {
                let mut found = Vec::with_capacity(ids.len());
                for sip_id in ids {
                    match self.store.find_sip(tenant, &sip_id).await? {
                        Some(sip) => found.push(sip),
                        None => rejected.push(RejectedSip::new(sip_id, "SIP not found")),
                    }
                }
                found
            }
            DeletionSelector::Session(session) => {
                self.search_all(tenant, &SipFilter::in_session(session)).await?
            }
            DeletionSelector::Provider(provider_id) => {
                self.search_all(tenant, &SipFilter::from_provider(provider_id))
                    .await?
            }
        };

        for target in targets {
            let _guard = self.locks.lock(tenant, target.sip_id()).await;
            // Re-read under the lock: an event may have moved the SIP meanwhile.
            let Some(sip) = self.store.find_sip(tenant, target.sip_id()).await? else {
                continue;
            };

            let from = sip.state();
            let (changes, to) = match from {
                SipState::Queued | SipState::ToBeDeleted | SipState::Deleted => {
                    rejected.push(RejectedSip::new(
                        sip.sip_id().clone(),
                        format!("SIP in state {from} cannot be deleted"),
                    ));
                    continue;
                }
                SipState::Created => {
                    let mut changes = Changeset::new();
                    for aip in self.store.find_aips_by_sip(tenant, sip.sip_id()).await? {
                        changes = changes.remove_aip(aip.aip_id().clone());
                    }
                    (changes, SipState::Deleted)
                }
                SipState::Stored
                | SipState::StoreError
                | SipState::Indexed
                | SipState::IndexError
                | SipState::Incomplete => (Changeset::new(), SipState::ToBeDeleted),
            };

            let mut transitions = Vec::new();
            push_transition(&mut transitions, sip.sip_id(), from, to);
            self.commit(tenant, changes.upsert_sip(sip.with_state(to)), transitions)
                .await?;
        }

        Ok(rejected)
    }

    async fn search_all(
        &self,
        tenant: &Tenant,
        filter: &SipFilter,
    ) -> Result<Vec<SipEntity>, LifecycleError> {
        let page_size = self.config.deletion_page_size;
        let mut all = Vec::new();
        let mut page = PageRequest::first(page_size);
        loop {
            let found = self.store.search_sips(tenant, filter, page).await?;
            let len = found.len();
            all.extend(found);
            if len < page_size {
                return Ok(all);
            }
            page = PageRequest::new(page.offset + len, page_size);
        }
    }

    /// Record the answer to one storage request.
    ///
    /// Accepted AIPs move to QUEUED. Refused AIPs move to AIP_REJECTED and
    /// flag their SIP STORE_ERROR with the reason appended. A CREATED SIP
    /// whose AIPs have all been queued moves to QUEUED.
    pub async fn record_submission(
        &self,
        ctx: &CallContext,
        batch: &[AipSubmission],
        outcome: &StoreOutcome,
    ) -> Result<Outcome, LifecycleError> {
        let tenant = ctx.tenant();
        let refused: HashMap<&AipId, &str> = outcome
            .rejected
            .iter()
            .map(|r| (&r.aip_id, r.reason.as_str()))
            .collect();

        let mut by_sip: BTreeMap<&SipId, Vec<&AipSubmission>> = BTreeMap::new();
        for submission in batch {
            by_sip.entry(&submission.sip_id).or_default().push(submission);
        }

        let mut result = Outcome::Unchanged;
        for (sip_id, submissions) in by_sip {
            let _guard = self.locks.lock(tenant, sip_id).await;

            let mut siblings = self.store.find_aips_by_sip(tenant, sip_id).await?;
            let mut changes = Changeset::new();
            let mut causes = Vec::new();

            for submission in submissions {
                let Some(slot) = siblings
                    .iter_mut()
                    .find(|aip| aip.aip_id() == &submission.aip_id)
                else {
                    tracing::debug!(tenant = %tenant, aip_id = %submission.aip_id, "submitted AIP vanished");
                    continue;
                };
                // Only CREATED rows belong to this batch; anything else moved on.
                if slot.state() != AipState::Created {
                    continue;
                }
                let next = match refused.get(&submission.aip_id) {
                    Some(reason) => {
                        causes.push(submission_rejected_cause(&submission.aip_id, reason));
                        slot.clone().with_error(AipState::Rejected, *reason)
                    }
                    None => slot.clone().with_state(AipState::Queued),
                };
                *slot = next.clone();
                changes = changes.upsert_aip(next);
            }

            if changes.is_empty() {
                continue;
            }

            let mut transitions = Vec::new();
            if let Some(sip) = self.store.find_sip(tenant, sip_id).await? {
                let from = sip.state();
                let next = if in_deletion(from) {
                    None
                } else if !causes.is_empty() {
                    Some(causes.into_iter().fold(
                        sip.with_state(SipState::StoreError),
                        |sip, cause| sip.with_rejection_cause(cause),
                    ))
                } else if from == SipState::Created
                    && siblings.iter().all(|aip| aip.state() != AipState::Created)
                {
                    Some(sip.with_state(SipState::Queued))
                } else {
                    None
                };
                if let Some(next) = next {
                    push_transition(&mut transitions, next.sip_id(), from, next.state());
                    changes = changes.upsert_sip(next);
                }
            }

            result = result.merge(self.commit(tenant, changes, transitions).await?);
        }

        let accepted = batch.len().saturating_sub(outcome.rejected.len());
        telemetry::record_aips_submitted(tenant, accepted, outcome.rejected.len());
        self.announce(
            tenant,
            LifecycleEvent::aips_submitted(tenant.clone(), accepted, outcome.rejected.len()),
        )
        .await;
        Ok(result)
    }

    /// Record the answer to one deletion request.
    ///
    /// SIPs of `page` not listed in `rejected` move to DELETED and lose their
    /// AIP rows. Refused SIPs stay TO_BE_DELETED with the reason appended to
    /// their history, unless it repeats the latest recorded cause.
    pub async fn record_deletion_page(
        &self,
        ctx: &CallContext,
        page: &[SipId],
        rejected: &[RejectedSip],
    ) -> Result<Outcome, LifecycleError> {
        let tenant = ctx.tenant();
        let refused: HashMap<&SipId, &str> = rejected
            .iter()
            .map(|r| (&r.sip_id, r.reason.as_str()))
            .collect();

        let mut result = Outcome::Unchanged;
        for sip_id in page {
            let _guard = self.locks.lock(tenant, sip_id).await;
            let Some(sip) = self.store.find_sip(tenant, sip_id).await? else {
                continue;
            };
            if sip.state() != SipState::ToBeDeleted {
                continue;
            }

            let outcome = match refused.get(sip_id) {
                Some(reason) => {
                    let cause = deletion_rejected_cause(reason);
                    if sip.last_rejection_cause() == Some(cause.as_str()) {
                        Outcome::Unchanged
                    } else {
                        let next = sip.with_rejection_cause(cause);
                        self.commit(tenant, Changeset::new().upsert_sip(next), Vec::new())
                            .await?
                    }
                }
                None => {
                    let mut changes = Changeset::new();
                    for aip in self.store.find_aips_by_sip(tenant, sip_id).await? {
                        changes = changes.remove_aip(aip.aip_id().clone());
                    }
                    let mut transitions = Vec::new();
                    push_transition(&mut transitions, sip_id, sip.state(), SipState::Deleted);
                    changes = changes.upsert_sip(sip.with_state(SipState::Deleted));
                    self.commit(tenant, changes, transitions).await?
                }
            };
            result = result.merge(outcome);
        }

        let refused_ids: Vec<SipId> = rejected
            .iter()
            .filter(|r| page.contains(&r.sip_id))
            .map(|r| r.sip_id.clone())
            .collect();
        if !refused_ids.is_empty() {
            self.announce(tenant, LifecycleEvent::deletion_rejected(tenant.clone(), refused_ids))
                .await;
        }
        Ok(result)
    }

    // Persist one unit of work, then announce its SIP transitions.
    async fn commit(
        &self,
        tenant: &Tenant,
        changes: Changeset,
        transitions: Vec<SipTransition>,
    ) -> Result<Outcome, LifecycleError> {
        if changes.is_empty() {
            return Ok(Outcome::Unchanged);
        }
        let span = telemetry::commit_span(
            tenant,
            changes.sips.len(),
            changes.aips.len(),
            changes.removed_aips.len(),
        );
        self.store
            .apply(tenant, changes)
            .instrument(span)
            .await
            .map_err(LifecycleError::from_apply)?;

        for transition in &transitions {
            telemetry::record_sip_transition(
                tenant,
                &transition.sip_id,
                transition.from,
                transition.to,
            );
            let event = LifecycleEvent::sip_state_changed(
                tenant.clone(),
                transition.sip_id.clone(),
                transition.from,
                transition.to,
            );
            self.announce(tenant, event).await;
        }
        Ok(Outcome::Applied(transitions))
    }

    // Lifecycle events are informational; a failed publish never undoes a commit.
    async fn announce(&self, tenant: &Tenant, event: LifecycleEvent) {
        if let Err(err) = self.events.publish(event).await {
            tracing::warn!(tenant = %tenant, "lifecycle event not published: {err}");
        }
    }
}

fn push_transition(transitions: &mut Vec<SipTransition>, sip_id: &SipId, from: SipState, to: SipState) {
    if from != to {
        transitions.push(SipTransition {
            sip_id: sip_id.clone(),
            from,
            to,
        });
    }
}
