//! Error types for lifecycle handling and bulk sweeps.

use thiserror::Error;

use crate::entity::RejectedSip;
use crate::store::StoreConflict;

/// Failure of a call to the archival-storage service.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Timeout, connection failure or 5xx. The call may be retried later.
    #[error("storage service unavailable: {0}")]
    Transient(String),

    /// 4xx answer. Deletion calls may still carry a rejection list.
    #[error("storage service refused the request (status {status})")]
    Client {
        status: u16,
        rejected: Vec<RejectedSip>,
    },
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// Failure to deliver an administrator notification.
#[derive(Error, Debug)]
pub enum NotificationError {
    /// The request was malformed or the client is misconfigured.
    #[error("notification client error: {0}")]
    Client(String),

    /// The notifier service failed to process a valid request.
    #[error("notification service error: {0}")]
    Server(String),
}

/// Failure while applying a lifecycle transition.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("entity store failure: {0}")]
    Store(#[from] anyhow::Error),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Another writer updated the SIP first. Re-running the transition
    /// against fresh snapshots resolves it.
    #[error(transparent)]
    Conflict(StoreConflict),
}

impl LifecycleError {
    /// Whether replaying the same message later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LifecycleError::Store(_) | LifecycleError::Conflict(_) => true,
            LifecycleError::Gateway(err) => err.is_transient(),
        }
    }

    /// Classify a failed [`crate::store::EntityStore::apply`].
    pub fn from_apply(err: anyhow::Error) -> Self {
        match err.downcast::<StoreConflict>() {
            Ok(conflict) => LifecycleError::Conflict(conflict),
            Err(err) => LifecycleError::Store(err),
        }
    }
}

/// Failure that aborts a bulk sweep.
#[derive(Error, Debug)]
pub enum SweepError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("could not notify administrators of rejected deletions: {0}")]
    Notification(NotificationError),
}

impl From<anyhow::Error> for SweepError {
    fn from(err: anyhow::Error) -> Self {
        SweepError::Lifecycle(LifecycleError::Store(err))
    }
}
