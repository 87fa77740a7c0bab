use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use archivist::*;
use async_trait::async_trait;
use parking_lot::Mutex;

#[derive(Default)]
struct TenantTables {
    sips: HashMap<SipId, SipEntity>,
    aips: HashMap<AipId, AipEntity>,
}

/// Entity store backed by per-tenant hash maps.
///
/// Listings are ordered by internal id, and SIP writes are version checked,
/// like the SQL backend.
#[derive(Clone, Default)]
pub struct InMemoryEntityStore {
    tenants: Arc<Mutex<HashMap<Tenant, TenantTables>>>,
    applies: Arc<Mutex<usize>>,
    failing_applies: Arc<Mutex<usize>>,
    conflicts: Arc<Mutex<usize>>,
    interleaved: Arc<Mutex<bool>>,
    stalled: Arc<Mutex<HashSet<Tenant>>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a SIP row directly, bypassing the lifecycle.
    pub fn insert_sip(&self, tenant: &Tenant, sip: SipEntity) {
        self.tenants
            .lock()
            .entry(tenant.clone())
            .or_default()
            .sips
            .insert(sip.sip_id().clone(), sip);
    }

    /// Seed an AIP row directly, bypassing the lifecycle.
    pub fn insert_aip(&self, tenant: &Tenant, aip: AipEntity) {
        self.tenants
            .lock()
            .entry(tenant.clone())
            .or_default()
            .aips
            .insert(aip.aip_id().clone(), aip);
    }

    pub fn sip(&self, tenant: &Tenant, sip_id: &SipId) -> Option<SipEntity> {
        self.tenants
            .lock()
            .get(tenant)
            .and_then(|tables| tables.sips.get(sip_id).cloned())
    }

    pub fn aip(&self, tenant: &Tenant, aip_id: &AipId) -> Option<AipEntity> {
        self.tenants
            .lock()
            .get(tenant)
            .and_then(|tables| tables.aips.get(aip_id).cloned())
    }

    pub fn aips_of(&self, tenant: &Tenant, sip_id: &SipId) -> Vec<AipEntity> {
        let tenants = self.tenants.lock();
        let mut aips: Vec<AipEntity> = tenants
            .get(tenant)
            .map(|tables| {
                tables
                    .aips
                    .values()
                    .filter(|aip| aip.sip_id() == sip_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        aips.sort_by_key(AipEntity::id);
        aips
    }

    pub fn sip_count(&self, tenant: &Tenant) -> usize {
        self.tenants.lock().get(tenant).map_or(0, |t| t.sips.len())
    }

    pub fn aip_count(&self, tenant: &Tenant) -> usize {
        self.tenants.lock().get(tenant).map_or(0, |t| t.aips.len())
    }

    /// Number of changesets written so far.
    pub fn apply_count(&self) -> usize {
        *self.applies.lock()
    }

    /// Make the next `count` calls to `apply` fail without writing anything.
    pub fn fail_next_applies(&self, count: usize) {
        *self.failing_applies.lock() = count;
    }

    /// Number of changesets refused by the SIP version check.
    pub fn conflict_count(&self) -> usize {
        *self.conflicts.lock()
    }

    /// Yield to the scheduler before every call, so concurrent callers
    /// interleave between their reads and their writes.
    pub fn interleave_calls(&self) {
        *self.interleaved.lock() = true;
    }

    /// Make every call for `tenant` hang forever.
    pub fn stall_tenant(&self, tenant: &Tenant) {
        self.stalled.lock().insert(tenant.clone());
    }

    async fn checkpoint(&self, tenant: &Tenant) {
        let stalled = self.stalled.lock().contains(tenant);
        if stalled {
            std::future::pending::<()>().await;
        }
        let interleaved = *self.interleaved.lock();
        if interleaved {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn find_sip(
        &self,
        tenant: &Tenant,
        sip_id: &SipId,
    ) -> anyhow::Result<Option<SipEntity>> {
        self.checkpoint(tenant).await;
        Ok(self.sip(tenant, sip_id))
    }

    async fn search_sips(
        &self,
        tenant: &Tenant,
        filter: &SipFilter,
        page: PageRequest,
    ) -> anyhow::Result<Vec<SipEntity>> {
        self.checkpoint(tenant).await;
        let tenants = self.tenants.lock();
        let Some(tables) = tenants.get(tenant) else {
            return Ok(Vec::new());
        };
        let mut matching: Vec<&SipEntity> =
            tables.sips.values().filter(|sip| filter.matches(sip)).collect();
        matching.sort_by_key(|sip| sip.id());
        Ok(matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn find_aip(
        &self,
        tenant: &Tenant,
        aip_id: &AipId,
    ) -> anyhow::Result<Option<AipEntity>> {
        self.checkpoint(tenant).await;
        Ok(self.aip(tenant, aip_id))
    }

    async fn find_aips_by_sip(
        &self,
        tenant: &Tenant,
        sip_id: &SipId,
    ) -> anyhow::Result<Vec<AipEntity>> {
        self.checkpoint(tenant).await;
        Ok(self.aips_of(tenant, sip_id))
    }

    async fn find_aips_by_state(
        &self,
        tenant: &Tenant,
        state: AipState,
        limit: usize,
    ) -> anyhow::Result<Vec<AipEntity>> {
        self.checkpoint(tenant).await;
        let tenants = self.tenants.lock();
        let Some(tables) = tenants.get(tenant) else {
            return Ok(Vec::new());
        };
        let mut matching: Vec<&AipEntity> = tables
            .aips
            .values()
            .filter(|aip| aip.state() == state)
            .collect();
        matching.sort_by_key(|aip| aip.id());
        Ok(matching.into_iter().take(limit).cloned().collect())
    }

    async fn apply(&self, tenant: &Tenant, changes: Changeset) -> anyhow::Result<()> {
        self.checkpoint(tenant).await;
        {
            let mut failing = self.failing_applies.lock();
            if *failing > 0 {
                *failing -= 1;
                anyhow::bail!("simulated store outage");
            }
        }

        let mut tenants = self.tenants.lock();
        let tables = tenants.entry(tenant.clone()).or_default();
        for sip in &changes.sips {
            let stale = tables
                .sips
                .get(sip.sip_id())
                .is_some_and(|stored| stored.version() != sip.version());
            if stale {
                *self.conflicts.lock() += 1;
                return Err(StoreConflict {
                    sip_id: sip.sip_id().clone(),
                    expected: sip.version(),
                }
                .into());
            }
        }
        for sip in changes.sips {
            tables.sips.insert(sip.sip_id().clone(), sip.committed());
        }
        for aip in changes.aips {
            tables.aips.insert(aip.aip_id().clone(), aip);
        }
        for aip_id in &changes.removed_aips {
            tables.aips.remove(aip_id);
        }
        *self.applies.lock() += 1;
        tracing::trace!(tenant = %tenant, "changeset applied");
        Ok(())
    }
}
