//! In-memory replica logs implementing [`ReplicationDomainDb`].
//!
//! Logs live for the lifetime of the db and are never purged. Cursors read
//! the shared log, so records published after a cursor was opened are still
//! seen by it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::cursor::{DomainCursorId, ReplicaCursor, ReplicationDomainDb};
use super::domain::DomainCursor;
use super::progress::ServerState;
use super::types::{BaseDn, Csn, ReplicaId, ResumePoint, UpdateRecord};
use crate::error::{ChangelogError, Result};

type ReplicaLog = Arc<RwLock<Vec<UpdateRecord>>>;

#[derive(Debug, Default)]
pub struct MemoryChangelogDb {
  logs: RwLock<BTreeMap<(BaseDn, ReplicaId), ReplicaLog>>,
  readers: Mutex<BTreeMap<BaseDn, BTreeSet<DomainCursorId>>>,
}

impl MemoryChangelogDb {
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends `record` to the log of the replica that originated it.
  pub fn publish(&self, base_dn: &BaseDn, record: UpdateRecord) -> Result<()> {
    let replica_id = record.replica_id();
    let log = self.replica_log(base_dn, replica_id);
    let mut log = log.write();

    if let Some(last) = log.last() {
      if last.csn >= record.csn {
        return Err(ChangelogError::OutOfOrder {
          replica_id,
          previous: last.csn,
          csn: record.csn,
        });
      }
    }

    log.push(record);
    Ok(())
  }

  /// Replicas that published at least one record in `base_dn`, in ascending
  /// id order. Logs created only by opening a cursor are not listed.
  pub fn replica_ids(&self, base_dn: &BaseDn) -> Vec<ReplicaId> {
    self
      .logs
      .read()
      .iter()
      .filter(|((dn, _), log)| dn == base_dn && !log.read().is_empty())
      .map(|((_, replica_id), _)| *replica_id)
      .collect()
  }

  /// Newest CSN published by `replica_id` in `base_dn`.
  pub fn newest_csn(&self, base_dn: &BaseDn, replica_id: ReplicaId) -> Option<Csn> {
    let logs = self.logs.read();
    let log = logs.get(&(base_dn.clone(), replica_id))?;
    let newest = log.read().last().map(|record| record.csn);
    newest
  }

  /// Opens a registered domain cursor over every known replica of `base_dn`.
  ///
  /// Replicas listed in `state` resume after their recorded CSN; the others
  /// replay from the start of their log.
  pub fn open_domain_cursor(
    self: &Arc<Self>,
    base_dn: BaseDn,
    state: &ServerState,
  ) -> Result<DomainCursor> {
    let domain_db: Arc<dyn ReplicationDomainDb> = Arc::clone(self) as Arc<dyn ReplicationDomainDb>;
    let cursor = DomainCursor::with_server_state(base_dn.clone(), domain_db, state)?;
    for replica_id in self.replica_ids(&base_dn) {
      cursor.add_replica(replica_id, state.get(replica_id))?;
    }

    self
      .readers
      .lock()
      .entry(base_dn.clone())
      .or_default()
      .insert(cursor.id());
    debug!(%base_dn, cursor = %cursor.id(), "domain cursor registered");
    Ok(cursor)
  }

  /// Domain cursors currently reading `base_dn`.
  pub fn registered_cursors(&self, base_dn: &BaseDn) -> Vec<DomainCursorId> {
    self
      .readers
      .lock()
      .get(base_dn)
      .map(|ids| ids.iter().copied().collect())
      .unwrap_or_default()
  }

  fn replica_log(&self, base_dn: &BaseDn, replica_id: ReplicaId) -> ReplicaLog {
    let key = (base_dn.clone(), replica_id);
    if let Some(log) = self.logs.read().get(&key) {
      return Arc::clone(log);
    }
    Arc::clone(self.logs.write().entry(key).or_default())
  }
}

impl ReplicationDomainDb for MemoryChangelogDb {
  fn cursor_from(
    &self,
    base_dn: &BaseDn,
    replica_id: ReplicaId,
    start_after: Option<Csn>,
  ) -> Result<Box<dyn ReplicaCursor>> {
    let log = self.replica_log(base_dn, replica_id);
    let resume = ResumePoint::from(start_after);
    let position = log.read().partition_point(|record| !resume.includes(record.csn));

    Ok(Box::new(MemoryReplicaCursor {
      replica_id,
      log,
      position,
      closed: false,
    }))
  }

  fn unregister_cursor(&self, base_dn: &BaseDn, cursor: DomainCursorId) {
    let mut readers = self.readers.lock();
    if let Some(ids) = readers.get_mut(base_dn) {
      ids.remove(&cursor);
      if ids.is_empty() {
        readers.remove(base_dn);
      }
    }
  }
}

/// Cursor over one in-memory replica log.
#[derive(Debug)]
pub struct MemoryReplicaCursor {
  replica_id: ReplicaId,
  log: ReplicaLog,
  position: usize,
  closed: bool,
}

impl ReplicaCursor for MemoryReplicaCursor {
  fn replica_id(&self) -> ReplicaId {
    self.replica_id
  }

  fn next(&mut self) -> Result<Option<UpdateRecord>> {
    if self.closed {
      return Err(ChangelogError::CursorClosed);
    }

    let record = self.log.read().get(self.position).cloned();
    if record.is_some() {
      self.position += 1;
    }
    Ok(record)
  }

  fn close(&mut self) {
    self.closed = true;
  }
}
