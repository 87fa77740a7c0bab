use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use archivist::*;
use async_trait::async_trait;
use parking_lot::Mutex;

#[derive(Clone, Debug)]
pub struct StoreCall {
    pub ctx: CallContext,
    pub batch: Vec<AipSubmission>,
}

#[derive(Clone, Debug)]
pub struct DeletionCall {
    pub ctx: CallContext,
    pub sip_ids: BTreeSet<SipId>,
}

type DeletionAnswer =
    Arc<dyn Fn(&BTreeSet<SipId>, Vec<RejectedSip>) -> Result<DeletionResponse, GatewayError> + Send + Sync>;

/// Scriptable storage service.
///
/// By default every AIP is accepted, every deletion is accepted and every
/// SIP has no remote AIPs. Failures queued with `fail_next_*` are returned
/// once each, in order, before the scripted answers resume.
#[derive(Clone)]
pub struct MockStorageGateway {
    store_calls: Arc<Mutex<Vec<StoreCall>>>,
    deletion_calls: Arc<Mutex<Vec<DeletionCall>>>,
    retrieve_calls: Arc<Mutex<Vec<(CallContext, SipId, usize)>>>,
    refused_aips: Arc<Mutex<HashMap<AipId, String>>>,
    refused_sips: Arc<Mutex<HashMap<SipId, String>>>,
    store_failures: Arc<Mutex<VecDeque<GatewayError>>>,
    deletion_failures: Arc<Mutex<VecDeque<GatewayError>>>,
    remote_aips: Arc<Mutex<HashMap<SipId, Vec<AipSummary>>>>,
    deletion_answer: Arc<Mutex<Option<DeletionAnswer>>>,
}

impl MockStorageGateway {
    pub fn new() -> Self {
        Self {
            store_calls: Arc::new(Mutex::new(Vec::new())),
            deletion_calls: Arc::new(Mutex::new(Vec::new())),
            retrieve_calls: Arc::new(Mutex::new(Vec::new())),
            refused_aips: Arc::new(Mutex::new(HashMap::new())),
            refused_sips: Arc::new(Mutex::new(HashMap::new())),
            store_failures: Arc::new(Mutex::new(VecDeque::new())),
            deletion_failures: Arc::new(Mutex::new(VecDeque::new())),
            remote_aips: Arc::new(Mutex::new(HashMap::new())),
            deletion_answer: Arc::new(Mutex::new(None)),
        }
    }

    /// Refuse `aip_id` in every storage request that contains it.
    pub fn refuse_aip(&self, aip_id: AipId, reason: impl Into<String>) {
        self.refused_aips.lock().insert(aip_id, reason.into());
    }

    /// Refuse to delete `sip_id` in every deletion request that contains it.
    pub fn refuse_deletion(&self, sip_id: SipId, reason: impl Into<String>) {
        self.refused_sips.lock().insert(sip_id, reason.into());
    }

    pub fn allow_deletion(&self, sip_id: &SipId) {
        self.refused_sips.lock().remove(sip_id);
    }

    pub fn fail_next_store(&self, error: GatewayError) {
        self.store_failures.lock().push_back(error);
    }

    pub fn fail_next_deletion(&self, error: GatewayError) {
        self.deletion_failures.lock().push_back(error);
    }

    /// Shape the deletion answer from the requested ids and the refusals
    /// that apply to them.
    pub fn answer_deletions_with<F>(&self, answer: F)
    where
        F: Fn(&BTreeSet<SipId>, Vec<RejectedSip>) -> Result<DeletionResponse, GatewayError>
            + Send
            + Sync
            + 'static,
    {
        *self.deletion_answer.lock() = Some(Arc::new(answer));
    }

    /// Set what the storage service holds for a SIP.
    pub fn set_remote_aips(&self, sip_id: &SipId, aips: Vec<(AipId, AipState)>) {
        let summaries = aips
            .into_iter()
            .map(|(aip_id, state)| AipSummary {
                aip_id,
                sip_id: sip_id.clone(),
                state,
            })
            .collect();
        self.remote_aips.lock().insert(sip_id.clone(), summaries);
    }

    pub fn store_calls(&self) -> Vec<StoreCall> {
        self.store_calls.lock().clone()
    }

    pub fn deletion_calls(&self) -> Vec<DeletionCall> {
        self.deletion_calls.lock().clone()
    }

    /// Number of remote listing pages fetched.
    pub fn retrieve_count(&self) -> usize {
        self.retrieve_calls.lock().len()
    }

    pub fn assert_store_call_count_eq(&self, expected: usize) {
        let actual = self.store_calls.lock().len();
        assert_eq!(actual, expected, "Expected {} store calls, got {}", expected, actual);
    }
}

impl Default for MockStorageGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageGateway for MockStorageGateway {
    async fn store(
        &self,
        ctx: &CallContext,
        batch: Vec<AipSubmission>,
    ) -> Result<StoreOutcome, GatewayError> {
        self.store_calls.lock().push(StoreCall {
            ctx: ctx.clone(),
            batch: batch.clone(),
        });
        if let Some(error) = self.store_failures.lock().pop_front() {
            return Err(error);
        }

        let refused = self.refused_aips.lock();
        let rejected = batch
            .iter()
            .filter_map(|s| {
                refused
                    .get(&s.aip_id)
                    .map(|reason| RejectedAip::new(s.aip_id.clone(), reason.clone()))
            })
            .collect();
        Ok(StoreOutcome::with_rejected(rejected))
    }

    async fn delete_aips_from_sips(
        &self,
        ctx: &CallContext,
        sip_ids: BTreeSet<SipId>,
    ) -> Result<DeletionResponse, GatewayError> {
        self.deletion_calls.lock().push(DeletionCall {
            ctx: ctx.clone(),
            sip_ids: sip_ids.clone(),
        });
        if let Some(error) = self.deletion_failures.lock().pop_front() {
            return Err(error);
        }

        let rejected: Vec<RejectedSip> = {
            let refused = self.refused_sips.lock();
            sip_ids
                .iter()
                .filter_map(|id| {
                    refused
                        .get(id)
                        .map(|reason| RejectedSip::new(id.clone(), reason.clone()))
                })
                .collect()
        };

        let answer = self.deletion_answer.lock().clone();
        match answer {
            Some(answer) => answer(&sip_ids, rejected),
            None => Ok(DeletionResponse::Accepted(rejected)),
        }
    }

    async fn retrieve_aip_entities(
        &self,
        ctx: &CallContext,
        sip_id: &SipId,
        page: usize,
        size: usize,
    ) -> Result<RemotePage<AipSummary>, GatewayError> {
        self.retrieve_calls
            .lock()
            .push((ctx.clone(), sip_id.clone(), page));

        let all = self
            .remote_aips
            .lock()
            .get(sip_id)
            .cloned()
            .unwrap_or_default();
        let size = size.max(1);
        let total_pages = all.len().div_ceil(size);
        let content = all.into_iter().skip(page * size).take(size).collect();
        Ok(RemotePage {
            content,
            page,
            total_pages,
        })
    }
}
