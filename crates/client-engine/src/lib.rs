#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-process engine for `pubforge` (pending-book generation jobs, progress
//! tracking, reconnection and queue caching).

/// Public API types for the engine crate.
pub mod api;
/// Backend HTTP API and the [`backend::JobBackend`] seam.
pub mod backend;
/// Generic expiring key/value cache with event-driven invalidation.
pub mod cache;
/// Typed queue snapshots served through the cache.
pub mod queue;
/// Persisted active-job record used to reattach after a restart.
pub mod reconnect;

mod coordinator;
mod job;
mod state;
mod worker;

#[cfg(test)]
mod testing;

pub use api::{
    CoordinatorConfig, CoordinatorHandle, Job, JobStatus, JobWatch, LogEntry, LogLevel,
    ProgressDelta, UnitEvent, UnitStatus,
};
pub use backend::{HttpBackend, JobBackend};
pub use cache::{ExportedEntry, InvalidationEvent, TtlCache};
pub use coordinator::Coordinator;
pub use queue::{QueueCache, QueueCacheFile, QueueConfig, QueueSnapshot, QueueStore};
pub use reconnect::{ActiveJobRecord, ActiveJobStore, RecoveryError};
