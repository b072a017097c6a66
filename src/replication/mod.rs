//! Replication changelog replay.
//!
//! Per-replica logs are read through [`ReplicaCursor`]s and merged into one
//! CSN-ordered stream by a [`CompositeCursor`]; [`DomainCursor`] is the
//! composite used for a whole replication domain.

pub mod composite;
pub mod cursor;
pub mod domain;
pub mod memory;
pub mod progress;
pub mod types;

pub use composite::{CompositeCursor, CursorPolicy, CursorSet};
pub use cursor::{DomainCursorId, ReplicaCursor, ReplicationDomainDb};
pub use domain::{DomainCursor, ReplicaRegistrar};
pub use memory::{MemoryChangelogDb, MemoryReplicaCursor};
pub use progress::ServerState;
pub use types::{BaseDn, Csn, CsnParseError, ReplicaId, ResumePoint, UpdateRecord};
