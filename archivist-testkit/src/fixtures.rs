use std::sync::Arc;

use archivist::*;

use crate::{InMemoryEntityStore, InMemoryJobRegistry, MockStorageGateway, RecordingNotifier};

pub const TEST_TENANT: &str = "project-a";

pub type TestLifecycle = LifecycleService<InMemoryEntityStore, MockStorageGateway, RecordingNotifier>;
pub type TestScheduler = BulkScheduler<InMemoryEntityStore, MockStorageGateway, RecordingNotifier>;
pub type TestIntake = EventIntake<InMemoryEntityStore, MockStorageGateway, RecordingNotifier>;

pub fn sip_id(n: usize) -> SipId {
    SipId::new(format!("URN:SIP:{n:04}"))
}

pub fn aip_id(sip: usize, n: usize) -> AipId {
    AipId::new(format!("URN:AIP:{sip:04}:{n}"))
}

pub fn aip_event(aip_id: &AipId, sip_id: &SipId, state: AipEventState) -> AipEvent {
    AipEvent {
        aip_id: aip_id.clone(),
        sip_id: sip_id.clone(),
        aip_state: state,
        failure_cause: None,
    }
}

pub fn storage_error_event(aip_id: &AipId, sip_id: &SipId, cause: &str) -> AipEvent {
    AipEvent {
        failure_cause: Some(cause.to_string()),
        ..aip_event(aip_id, sip_id, AipEventState::StorageError)
    }
}

pub fn broadcast(event_type: BroadcastEventType, aip_ids: &[AipId]) -> BroadcastEntityEvent {
    BroadcastEntityEvent {
        event_type,
        aip_ids: aip_ids.to_vec(),
    }
}

/// A lifecycle service wired to in-memory collaborators.
pub struct Harness {
    pub tenant: Tenant,
    pub ctx: CallContext,
    pub store: Arc<InMemoryEntityStore>,
    pub gateway: Arc<MockStorageGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub jobs: Arc<InMemoryJobRegistry>,
    pub events: Arc<InProcEventBus>,
    pub lifecycle: Arc<TestLifecycle>,
    pub scheduler: Arc<TestScheduler>,
    pub intake: Arc<TestIntake>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(LifecycleConfig::default())
    }

    pub fn with_config(config: LifecycleConfig) -> Self {
        let tenant = Tenant::new(TEST_TENANT);
        let store = Arc::new(InMemoryEntityStore::new());
        let gateway = Arc::new(MockStorageGateway::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let jobs = Arc::new(InMemoryJobRegistry::new());
        let events = Arc::new(InProcEventBus::new(config.event_bus_capacity.max(1)));

        let lifecycle = Arc::new(LifecycleService::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&notifier),
            jobs.clone(),
            events.clone(),
            config.clone(),
        ));
        let scheduler = Arc::new(BulkScheduler::new(
            Arc::clone(&lifecycle),
            vec![tenant.clone()],
        ));
        let intake = Arc::new(EventIntake::new(
            Arc::clone(&lifecycle),
            events.clone(),
            &config,
        ));

        Self {
            ctx: CallContext::for_tenant(tenant.clone()),
            tenant,
            store,
            gateway,
            notifier,
            jobs,
            events,
            lifecycle,
            scheduler,
            intake,
        }
    }

    /// Seed SIP `n` in `sip_state` with `aips` AIPs in `aip_state`.
    pub fn seed_sip(
        &self,
        n: usize,
        sip_state: SipState,
        aips: usize,
        aip_state: AipState,
    ) -> (SipId, Vec<AipId>) {
        let id = sip_id(n);
        self.store
            .insert_sip(&self.tenant, SipEntity::new(id.clone()).with_state(sip_state));
        let aip_ids: Vec<AipId> = (0..aips).map(|i| aip_id(n, i)).collect();
        for aip in &aip_ids {
            self.store.insert_aip(
                &self.tenant,
                AipEntity::new(aip.clone(), id.clone()).with_state(aip_state),
            );
        }
        (id, aip_ids)
    }

    /// A second lifecycle service over the same collaborators, standing in
    /// for another process. It shares no in-process locks with `lifecycle`.
    pub fn peer_lifecycle(&self) -> Arc<TestLifecycle> {
        Arc::new(LifecycleService::new(
            Arc::clone(&self.store),
            Arc::clone(&self.gateway),
            Arc::clone(&self.notifier),
            self.jobs.clone(),
            self.events.clone(),
            self.lifecycle.config().clone(),
        ))
    }

    pub fn sip_state(&self, sip_id: &SipId) -> Option<SipState> {
        self.store.sip(&self.tenant, sip_id).map(|sip| sip.state())
    }

    pub fn aip_state(&self, aip_id: &AipId) -> Option<AipState> {
        self.store.aip(&self.tenant, aip_id).map(|aip| aip.state())
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
