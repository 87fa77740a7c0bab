use std::collections::HashMap;
use std::sync::Arc;

use archivist::*;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Notifier that keeps every notification it was handed.
///
/// Notifications are recorded even when a failure is configured, so tests
/// can tell "attempted" from "never sent".
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(Tenant, Notification)>>>,
    failure: Arc<Mutex<Option<fn(String) -> NotificationError>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call with a client error.
    pub fn fail_with_client_error(&self) {
        *self.failure.lock() = Some(NotificationError::Client);
    }

    /// Answer every call with a server error.
    pub fn fail_with_server_error(&self) {
        *self.failure.lock() = Some(NotificationError::Server);
    }

    pub fn recover(&self) {
        *self.failure.lock() = None;
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().iter().map(|(_, n)| n.clone()).collect()
    }

    pub fn notifications_for(&self, tenant: &Tenant) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|(t, _)| t == tenant)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        tenant: &Tenant,
        notification: Notification,
    ) -> Result<(), NotificationError> {
        self.sent.lock().push((tenant.clone(), notification));
        match *self.failure.lock() {
            Some(failure) => Err(failure("simulated notifier failure".to_string())),
            None => Ok(()),
        }
    }
}

/// Job metadata keyed by (tenant, job id).
#[derive(Clone, Default)]
pub struct InMemoryJobRegistry {
    jobs: Arc<Mutex<HashMap<(Tenant, String), JobInfo>>>,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tenant: &Tenant, job_id: impl Into<String>, info: JobInfo) {
        self.jobs.lock().insert((tenant.clone(), job_id.into()), info);
    }
}

#[async_trait]
impl JobInfoRepository for InMemoryJobRegistry {
    async fn find_job(&self, tenant: &Tenant, job_id: &str) -> anyhow::Result<Option<JobInfo>> {
        Ok(self
            .jobs
            .lock()
            .get(&(tenant.clone(), job_id.to_string()))
            .cloned())
    }
}
