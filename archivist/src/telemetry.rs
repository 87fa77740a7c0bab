//! Tracing and telemetry instrumentation for archivist.
//!
//! This module provides helper functions for creating tracing spans and recording
//! metrics during message handling and bulk sweeps. All functions work both with
//! and without the `metrics` feature flag.
//!
//! # Example
//!
//! ```ignore
//! use archivist::telemetry::{intake_span, record_event_handled};
//!
//! let span = intake_span(&tenant, "aip", correlation_id);
//! let _enter = span.enter();
//! // ... handle the message
//! record_event_handled(&tenant, "aip", "applied");
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info_span, Instrument, Span};
use uuid::Uuid;

use crate::entity::{SipState, Tenant};

/// Create a tracing span for handling one inbound message.
#[must_use]
pub fn intake_span(tenant: &Tenant, kind: &str, correlation_id: Uuid) -> Span {
    info_span!(
        "archivist.intake",
        tenant = %tenant,
        message_kind = kind,
        correlation_id = %correlation_id,
    )
}

/// Create a tracing span for one bulk sweep of a tenant.
///
/// `sweep` is either `submission` or `deletion`.
#[must_use]
pub fn sweep_span(tenant: &Tenant, sweep: &'static str) -> Span {
    info_span!("archivist.sweep", tenant = %tenant, sweep = sweep)
}

/// Create a tracing span for persisting one changeset.
#[must_use]
pub fn commit_span(tenant: &Tenant, sips: usize, aips: usize, removed_aips: usize) -> Span {
    info_span!(
        "archivist.commit",
        tenant = %tenant,
        sips,
        aips,
        removed_aips,
    )
}

/// Instrument a future with an intake span.
pub fn instrument_intake<F>(
    tenant: &Tenant,
    kind: &str,
    correlation_id: Uuid,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(intake_span(tenant, kind, correlation_id))
}

/// Record the result of handling one inbound message.
///
/// `outcome` is an [`crate::lifecycle::Outcome`] name, or `failed`.
pub fn record_event_handled(tenant: &Tenant, kind: &str, outcome: &str) {
    tracing::debug!(tenant = %tenant, message_kind = kind, outcome, "message handled");

    #[cfg(feature = "metrics")]
    crate::metrics::record_event_handled(tenant.as_str(), kind, outcome);
}

/// Record a SIP state change.
pub fn record_sip_transition(
    tenant: &Tenant,
    sip_id: impl AsRef<str>,
    from: SipState,
    to: SipState,
) {
    tracing::info!(
        tenant = %tenant,
        sip_id = %sip_id.as_ref(),
        from = %from,
        to = %to,
        "SIP state changed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_sip_transition(tenant.as_str(), from.as_str(), to.as_str());
}

/// Record the answer to one storage request.
pub fn record_aips_submitted(tenant: &Tenant, accepted: usize, rejected: usize) {
    tracing::info!(tenant = %tenant, accepted, rejected, "AIP batch submitted");

    #[cfg(feature = "metrics")]
    crate::metrics::record_aips_submitted(tenant.as_str(), accepted, rejected);
}

/// Record SIPs the storage service refused to delete.
pub fn record_deletion_rejections(tenant: &Tenant, rejected: usize) {
    tracing::warn!(tenant = %tenant, rejected, "SIP deletions rejected");

    #[cfg(feature = "metrics")]
    crate::metrics::record_deletion_rejections(tenant.as_str(), rejected);
}

/// Start timing a sweep. Pass the handle to [`record_sweep_end`].
pub fn record_sweep_start(tenant: &Tenant, sweep: &'static str) -> SweepTimingHandle {
    SweepTimingHandle {
        tenant: tenant.clone(),
        sweep,
        start: Instant::now(),
    }
}

/// Finish timing a sweep and update the duration histogram.
///
/// `status` is `completed` or `aborted`.
pub fn record_sweep_end(handle: SweepTimingHandle, status: &str) {
    let duration_secs = handle.start.elapsed().as_secs_f64();
    tracing::info!(
        tenant = %handle.tenant,
        sweep = handle.sweep,
        status,
        duration_secs,
        "sweep finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_sweep_duration(
        handle.tenant.as_str(),
        handle.sweep,
        status,
        duration_secs,
    );
}

/// Handle for tracking sweep duration.
#[derive(Debug)]
pub struct SweepTimingHandle {
    tenant: Tenant,
    sweep: &'static str,
    start: Instant,
}

impl SweepTimingHandle {
    #[must_use]
    pub fn sweep(&self) -> &'static str {
        self.sweep
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
