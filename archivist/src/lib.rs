//! Archivist - SIP/AIP lifecycle tracking for an archival ingest pipeline.
//!
//! Every submission information package (SIP) produces one or more archival
//! information packages (AIPs) that are persisted by a remote storage service
//! and later indexed by a catalog. This crate keeps the lifecycle state of both
//! in step with the notifications those services emit, and drives the bulk
//! work they need: submitting pending AIPs for storage and deleting SIPs.
//!
//! # Core Concepts
//!
//! - **Entities**: [`SipEntity`] and [`AipEntity`] are immutable snapshots.
//!   Handlers derive new snapshots and commit them as a [`Changeset`].
//!
//! - **Store**: The [`EntityStore`] trait abstracts persistence. All reads and
//!   writes are scoped by [`Tenant`].
//!
//! - **Gateway**: The [`StorageGateway`] trait is the client to the remote
//!   storage service. Calls carry an explicit [`CallContext`].
//!
//! - **Lifecycle**: [`LifecycleService`] owns the state machine and the
//!   SIP aggregation rule ([`aggregate_sip_state`]).
//!
//! - **Intake**: [`EventIntake`] decodes inbound [`Envelope`]s and applies
//!   the configured [`FailurePolicy`] when a handler fails.
//!
//! - **Scheduler**: [`BulkScheduler`] runs the submission and deletion sweeps.
//!
//! - **Runtime**: [`ArchivistRuntime`] ties the intake and the sweeper together
//!   and shuts them down gracefully.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL persistence support via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use archivist::*;
//!
//! let config = ArchivistConfig::load(Path::new("archivist.toml"))?;
//! let runtime = ArchivistRuntimeBuilder::new(config)
//!     .with_store(store)
//!     .with_gateway(gateway)
//!     .with_notifier(notifier)
//!     .with_jobs(jobs)
//!     .build()?;
//! let inbound = runtime.start().await;
//! inbound.send(Envelope::decode(&bytes)?).await?;
//! ```

/// Configuration structures for the lifecycle, intake and persistence.
///
/// The `config` module defines [`ArchivistConfig`] and its sections, loaded
/// from TOML with environment overrides.
pub mod config;

/// Domain identifiers, states and entity snapshots.
pub mod entity;

/// Error types shared by the lifecycle, the gateway and the sweeps.
pub mod error;

/// Inbound messages and the in-process lifecycle event bus.
///
/// The `events` module provides:
/// - [`Envelope`] and [`InboundMessage`] for decoded inbound notifications
/// - [`LifecycleEvent`] and [`LifecycleEventPayload`] for outbound events
/// - [`EventPublisher`] and [`EventSubscriber`] for pub/sub patterns
/// - [`InProcEventBus`] for in-process broadcasting and dead letters
pub mod events;

/// Storage service client contract.
pub mod gateway;

/// Inbound message dispatch and failure handling.
pub mod intake;

/// SIP/AIP state machine.
///
/// The `lifecycle` module provides [`LifecycleService`], which reacts to
/// storage and index notifications, records submission and deletion results,
/// and accepts deletion requests.
pub mod lifecycle;

#[cfg(feature = "metrics")]
/// Prometheus metrics for the lifecycle and the sweeps.
pub mod metrics;

/// Administrator notifications and job metadata lookup.
pub mod notify;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides a PostgreSQL-backed implementation
/// of the entity store when the `postgres` feature is enabled.
pub mod persistence;

/// Runtime wiring and graceful shutdown.
///
/// The `runtime` module provides:
/// - [`ArchivistRuntime`] - owns the intake and sweeper tasks
/// - [`ArchivistRuntimeBuilder`] - validates dependencies before construction
/// - [`ShutdownToken`] - graceful shutdown signaling
pub mod runtime;

/// Periodic submission and deletion sweeps.
pub mod scheduler;

/// Entity persistence contract.
pub mod store;

/// Tracing spans and metric recording hooks.
pub mod telemetry;

pub use config::*;
pub use entity::*;
pub use error::*;
pub use events::*;
pub use gateway::*;
pub use intake::*;
pub use lifecycle::*;
pub use notify::*;
pub use runtime::*;
pub use scheduler::*;
pub use store::*;
