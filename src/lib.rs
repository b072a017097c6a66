//! Ordered replay of multi-master replication changelogs.
//!
//! Every replica of a replication domain keeps its own update log, ordered by
//! CSN. This crate merges those logs into a single globally ordered stream
//! while replicas keep joining.

pub mod error;
pub mod replication;

pub use error::{ChangelogError, Result, StorageError, StorageErrorKind};
