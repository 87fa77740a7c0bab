use std::fmt::Write as _;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entity::{RejectedSip, Tenant};
use crate::error::NotificationError;

/// Severity of an administrator notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// Role a notification is addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetRole {
    Admin,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub level: NotificationLevel,
    pub target_role: TargetRole,
}

impl Notification {
    /// An ERROR notification for the administrators.
    pub fn admin_error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            level: NotificationLevel::Error,
            target_role: TargetRole::Admin,
        }
    }
}

/// Delivery of notifications to a role.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        tenant: &Tenant,
        notification: Notification,
    ) -> Result<(), NotificationError>;
}

/// What the local job runner knows about a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub class_name: String,
    pub stack_trace: Option<String>,
}

/// Lookup of job metadata by id.
#[async_trait]
pub trait JobInfoRepository: Send + Sync {
    async fn find_job(&self, tenant: &Tenant, job_id: &str) -> anyhow::Result<Option<JobInfo>>;
}

/// Notification sent when the storage service refuses to delete SIPs.
pub fn deletion_rejected_notification(rejected: &[RejectedSip]) -> Notification {
    let mut message = format!(
        "The archival storage refused to delete the AIPs of {} SIP(s). \
         They stay TO_BE_DELETED and will be retried on the next sweep:\n",
        rejected.len()
    );
    for sip in rejected {
        let _ = writeln!(message, "- SIP({}): {}", sip.sip_id, sip.reason);
    }
    Notification::admin_error("Errors during SIP deletions", message)
}

/// Notification sent when a job of the local runner fails.
pub fn job_failed_notification(job_id: &str, info: &JobInfo) -> Notification {
    let message = match &info.stack_trace {
        Some(trace) => format!("Job {job_id} ({}) failed:\n{trace}", info.class_name),
        None => format!("Job {job_id} ({}) failed without a stack trace", info.class_name),
    };
    Notification::admin_error(format!("{} failed", info.class_name), message)
}
