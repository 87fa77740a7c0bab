/// Runtime builder for constructing archivist instances.
pub mod builder;
/// Runtime supervisor owning the intake and sweeper tasks.
pub mod supervisor;

pub use builder::ArchivistRuntimeBuilder;
pub use supervisor::{ArchivistRuntime, ShutdownToken};
