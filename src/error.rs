//! Error types for changelog replay.

use std::fmt;

use thiserror::Error;

use crate::replication::types::{Csn, ReplicaId};

/// Classification of a storage failure, decided by the storage collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
  /// The replica log does not exist (or was purged past the resume point).
  ReplicaLogMissing,
  /// Transient I/O failure; the caller may retry.
  Io,
  /// The underlying log is damaged.
  Corrupt,
  Other,
}

impl StorageErrorKind {
  pub fn is_transient(self) -> bool {
    matches!(self, StorageErrorKind::Io)
  }
}

impl fmt::Display for StorageErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let value = match self {
      StorageErrorKind::ReplicaLogMissing => "replica log missing",
      StorageErrorKind::Io => "io",
      StorageErrorKind::Corrupt => "corrupt",
      StorageErrorKind::Other => "other",
    };
    write!(f, "{value}")
  }
}

/// Failure reported by a replica log store or one of its cursors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct StorageError {
  pub kind: StorageErrorKind,
  pub message: String,
}

impl StorageError {
  pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }
}

#[derive(Debug, Error)]
pub enum ChangelogError {
  /// Forwarded unchanged from the storage collaborator.
  #[error("storage error: {0}")]
  Storage(#[from] StorageError),

  #[error("cursor is closed")]
  CursorClosed,

  #[error("replica {0} already has an active cursor")]
  DuplicateReplica(ReplicaId),

  #[error("cursor opened for replica {requested} reads replica {opened}")]
  ReplicaMismatch {
    requested: ReplicaId,
    opened: ReplicaId,
  },

  #[error("csn {csn} does not follow {previous} for replica {replica_id}")]
  OutOfOrder {
    replica_id: ReplicaId,
    previous: Csn,
    csn: Csn,
  },

  #[error("serialization error: {0}")]
  Serialization(String),

  #[error("version mismatch: found {found}, supported {supported}")]
  VersionMismatch { found: u32, supported: u32 },
}

pub type Result<T> = std::result::Result<T, ChangelogError>;
