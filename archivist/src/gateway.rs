//! Client-side contract of the archival-storage service.
//!
//! The storage service itself is an external collaborator; this module only
//! defines the calls the lifecycle core depends on and normalises their
//! answers. [`CallContext`] is passed explicitly to every call so that tenant
//! and privileges never leak from one unit of work into the next.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entity::{AipId, AipState, RejectedAip, RejectedSip, SipId, Tenant};
use crate::error::GatewayError;

/// Privilege under which an outbound call is made.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The service's own tenant-scoped identity.
    #[default]
    Service,
    /// Internal system principal, only used for deletion requests.
    System,
}

/// Tenant and principal of one unit of work.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallContext {
    tenant: Tenant,
    role: Role,
}

impl CallContext {
    pub fn for_tenant(tenant: impl Into<Tenant>) -> Self {
        Self {
            tenant: tenant.into(),
            role: Role::Service,
        }
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// A copy of this context running as the system principal.
    ///
    /// `self` keeps its own role, so the elevation ends with the call that
    /// receives the returned value.
    pub fn elevated(&self) -> Self {
        Self {
            tenant: self.tenant.clone(),
            role: Role::System,
        }
    }
}

/// Identity of one AIP inside a storage request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AipSubmission {
    pub aip_id: AipId,
    pub sip_id: SipId,
}

/// Answer to a storage request.
///
/// AIPs of the batch that are not listed as rejected were accepted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOutcome {
    pub rejected: Vec<RejectedAip>,
}

impl StoreOutcome {
    pub fn accepted_all() -> Self {
        Self::default()
    }

    pub fn with_rejected(rejected: Vec<RejectedAip>) -> Self {
        Self { rejected }
    }
}

/// Answer to a deletion request that reached the storage service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionResponse {
    /// Deletion scheduled; the list holds SIPs that were nonetheless refused.
    Accepted(Vec<RejectedSip>),
    /// Structured "unprocessable entity" answer.
    Unprocessable(Vec<RejectedSip>),
}

/// Remote view of one AIP.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AipSummary {
    pub aip_id: AipId,
    pub sip_id: SipId,
    pub state: AipState,
}

/// One page of a remote listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePage<T> {
    pub content: Vec<T>,
    pub page: usize,
    pub total_pages: usize,
}

impl<T> RemotePage<T> {
    pub fn has_next(&self) -> bool {
        self.page + 1 < self.total_pages
    }
}

/// Outbound calls to the archival-storage service.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Submit a batch of AIPs for durable storage.
    async fn store(
        &self,
        ctx: &CallContext,
        batch: Vec<AipSubmission>,
    ) -> Result<StoreOutcome, GatewayError>;

    /// Request deletion of every AIP belonging to `sip_ids`.
    async fn delete_aips_from_sips(
        &self,
        ctx: &CallContext,
        sip_ids: BTreeSet<SipId>,
    ) -> Result<DeletionResponse, GatewayError>;

    /// List the AIPs the storage service holds for a SIP.
    async fn retrieve_aip_entities(
        &self,
        ctx: &CallContext,
        sip_id: &SipId,
        page: usize,
        size: usize,
    ) -> Result<RemotePage<AipSummary>, GatewayError>;
}

/// Fold every deletion answer shape into the list of refused SIPs.
///
/// Transient failures are returned unchanged: nothing was decided for the
/// requested SIPs, so they must stay untouched until the next sweep.
pub fn rejected_sips(
    result: Result<DeletionResponse, GatewayError>,
) -> Result<Vec<RejectedSip>, GatewayError> {
    match result {
        Ok(DeletionResponse::Accepted(rejected))
        | Ok(DeletionResponse::Unprocessable(rejected)) => Ok(rejected),
        Err(GatewayError::Client { rejected, .. }) => Ok(rejected),
        Err(err @ GatewayError::Transient(_)) => Err(err),
    }
}

/// Walk every page of a SIP's remote AIP listing.
pub async fn retrieve_all_aips<G>(
    gateway: &G,
    ctx: &CallContext,
    sip_id: &SipId,
    page_size: usize,
) -> Result<Vec<AipSummary>, GatewayError>
where
    G: StorageGateway + ?Sized,
{
    let mut all = Vec::new();
    let mut page = 0;
    loop {
        let current = gateway
            .retrieve_aip_entities(ctx, sip_id, page, page_size)
            .await?;
        let has_next = current.has_next() && !current.content.is_empty();
        all.extend(current.content);
        if !has_next {
            return Ok(all);
        }
        page += 1;
    }
}
