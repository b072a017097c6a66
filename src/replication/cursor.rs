//! Collaborator contracts: per-replica cursors and the domain changelog db.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::types::{BaseDn, Csn, ReplicaId, UpdateRecord};
use crate::error::Result;

/// Ordered iterator over one replica's persisted update log.
///
/// `next` yields records in strictly increasing CSN order. `Ok(None)` means
/// the cursor has caught up with the log; a later call may yield again once
/// the replica appends more changes.
pub trait ReplicaCursor: Send {
  fn replica_id(&self) -> ReplicaId;

  fn next(&mut self) -> Result<Option<UpdateRecord>>;

  /// Releases storage resources. Called exactly once by the owner.
  fn close(&mut self);
}

/// Process-unique handle under which a domain cursor is known to its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainCursorId(u64);

impl DomainCursorId {
  pub(crate) fn next() -> Self {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
  }

  pub fn get(self) -> u64 {
    self.0
  }
}

impl fmt::Display for DomainCursorId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "cursor-{}", self.0)
  }
}

/// Storage and registry collaborator for one or more replication domains.
///
/// Implementations are shared between domain cursors, so `unregister_cursor`
/// may be called concurrently from several threads.
pub trait ReplicationDomainDb: Send + Sync {
  /// Opens a cursor over `replica_id`'s log in `base_dn`, positioned so the
  /// first `next` returns the first record strictly after `start_after`
  /// (or the first record of the log when `None`).
  fn cursor_from(
    &self,
    base_dn: &BaseDn,
    replica_id: ReplicaId,
    start_after: Option<Csn>,
  ) -> Result<Box<dyn ReplicaCursor>>;

  /// Stops considering `cursor` a reader of the domain's logs.
  fn unregister_cursor(&self, base_dn: &BaseDn, cursor: DomainCursorId);
}
