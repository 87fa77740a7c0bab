use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::{AipEntity, AipId, AipState, SipEntity, SipId, SipState, Tenant};

/// Trait for durable SIP/AIP record backends.
///
/// Every operation is scoped to one tenant. Reads return snapshots; writes
/// only happen through [`EntityStore::apply`], which persists a whole
/// [`Changeset`] atomically.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Look up a SIP by its external id.
    async fn find_sip(
        &self,
        tenant: &Tenant,
        sip_id: &SipId,
    ) -> anyhow::Result<Option<SipEntity>>;

    /// Search SIPs matching `filter`, ordered by internal id.
    async fn search_sips(
        &self,
        tenant: &Tenant,
        filter: &SipFilter,
        page: PageRequest,
    ) -> anyhow::Result<Vec<SipEntity>>;

    /// Look up an AIP by its external id.
    async fn find_aip(
        &self,
        tenant: &Tenant,
        aip_id: &AipId,
    ) -> anyhow::Result<Option<AipEntity>>;

    /// All AIP rows owned by a SIP.
    async fn find_aips_by_sip(
        &self,
        tenant: &Tenant,
        sip_id: &SipId,
    ) -> anyhow::Result<Vec<AipEntity>>;

    /// Up to `limit` AIPs in `state`, oldest first.
    async fn find_aips_by_state(
        &self,
        tenant: &Tenant,
        state: AipState,
        limit: usize,
    ) -> anyhow::Result<Vec<AipEntity>>;

    /// Persist a changeset in one unit of work.
    ///
    /// A SIP snapshot is written only if its stored row still carries the
    /// snapshot's [`SipEntity::version`]; the row then moves one version
    /// ahead. Otherwise nothing of the changeset is written and the error
    /// wraps a [`StoreConflict`]. SIPs without a stored row are inserted.
    async fn apply(&self, tenant: &Tenant, changes: Changeset) -> anyhow::Result<()>;
}

/// A SIP row changed between the read and the write of a transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("SIP {sip_id} changed concurrently (read at version {expected})")]
pub struct StoreConflict {
    pub sip_id: SipId,
    pub expected: i64,
}

/// Offset/limit pagination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }
}

/// Criteria for [`EntityStore::search_sips`]. Unset fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipFilter {
    pub states: Vec<SipState>,
    pub session: Option<String>,
    pub provider_id: Option<String>,
    pub sip_ids: Option<BTreeSet<SipId>>,
}

impl SipFilter {
    pub fn in_state(state: SipState) -> Self {
        Self {
            states: vec![state],
            ..Self::default()
        }
    }

    pub fn in_session(session: impl Into<String>) -> Self {
        Self {
            session: Some(session.into()),
            ..Self::default()
        }
    }

    pub fn from_provider(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: Some(provider_id.into()),
            ..Self::default()
        }
    }

    pub fn with_ids(ids: impl IntoIterator<Item = SipId>) -> Self {
        Self {
            sip_ids: Some(ids.into_iter().collect()),
            ..Self::default()
        }
    }

    /// In-memory evaluation, shared by non-SQL backends.
    pub fn matches(&self, sip: &SipEntity) -> bool {
        (self.states.is_empty() || self.states.contains(&sip.state()))
            && self
                .session
                .as_deref()
                .map_or(true, |s| sip.session() == Some(s))
            && self
                .provider_id
                .as_deref()
                .map_or(true, |p| sip.provider_id() == Some(p))
            && self
                .sip_ids
                .as_ref()
                .map_or(true, |ids| ids.contains(sip.sip_id()))
    }
}

/// Writes produced by one lifecycle transition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Changeset {
    pub sips: Vec<SipEntity>,
    pub aips: Vec<AipEntity>,
    pub removed_aips: Vec<AipId>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_sip(mut self, sip: SipEntity) -> Self {
        self.sips.push(sip);
        self
    }

    pub fn upsert_aip(mut self, aip: AipEntity) -> Self {
        self.aips.push(aip);
        self
    }

    pub fn remove_aip(mut self, aip_id: AipId) -> Self {
        self.removed_aips.push(aip_id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sips.is_empty() && self.aips.is_empty() && self.removed_aips.is_empty()
    }
}
