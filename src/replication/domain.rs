//! Domain cursor: merged replay of every replica log of one base DN.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::composite::{CompositeCursor, CursorPolicy, CursorSet};
use super::cursor::{DomainCursorId, ReplicationDomainDb};
use super::progress::ServerState;
use super::types::{BaseDn, Csn, ReplicaId, ResumePoint, UpdateRecord};
use crate::error::{ChangelogError, Result};

#[derive(Debug, Default)]
struct PendingState {
  closed: bool,
  replicas: BTreeMap<ReplicaId, ResumePoint>,
}

/// Replicas registered but not yet opened. Written from any thread, drained
/// by the iteration thread.
#[derive(Debug, Default)]
struct PendingReplicas {
  state: Mutex<PendingState>,
}

impl PendingReplicas {
  fn register(&self, replica_id: ReplicaId, resume: ResumePoint) -> Result<()> {
    let mut state = self.state.lock();
    if state.closed {
      return Err(ChangelogError::CursorClosed);
    }
    merge_oldest(&mut state.replicas, replica_id, resume);
    Ok(())
  }

  /// Swaps out everything registered so far. Later registrations land in the
  /// next drain.
  fn take(&self) -> BTreeMap<ReplicaId, ResumePoint> {
    std::mem::take(&mut self.state.lock().replicas)
  }

  /// Puts back registrations that could not be opened.
  fn restore(&self, entries: BTreeMap<ReplicaId, ResumePoint>) {
    let mut state = self.state.lock();
    if state.closed {
      return;
    }
    for (replica_id, resume) in entries {
      merge_oldest(&mut state.replicas, replica_id, resume);
    }
  }

  fn len(&self) -> usize {
    self.state.lock().replicas.len()
  }

  fn close(&self) {
    let mut state = self.state.lock();
    state.closed = true;
    state.replicas.clear();
  }
}

/// Keeps whichever resume point replays more history.
fn merge_oldest(
  replicas: &mut BTreeMap<ReplicaId, ResumePoint>,
  replica_id: ReplicaId,
  resume: ResumePoint,
) {
  replicas
    .entry(replica_id)
    .and_modify(|known| *known = (*known).min(resume))
    .or_insert(resume);
}

/// Cloneable handle for registering replicas with a domain cursor from other
/// threads while it is being iterated.
#[derive(Debug, Clone)]
pub struct ReplicaRegistrar {
  base_dn: BaseDn,
  pending: Arc<PendingReplicas>,
}

impl ReplicaRegistrar {
  /// Asks the cursor to replay `replica_id` starting strictly after
  /// `start_after`, or from the beginning of its log when `None`.
  ///
  /// The cursor is opened on the next advance. Registering the same replica
  /// again before that keeps the oldest resume point.
  pub fn add_replica(&self, replica_id: ReplicaId, start_after: Option<Csn>) -> Result<()> {
    let resume = ResumePoint::from(start_after);
    self.pending.register(replica_id, resume)?;
    debug!(base_dn = %self.base_dn, replica_id, %resume, "replica registered");
    Ok(())
  }
}

/// Merge policy of a domain cursor: opens registered replicas and never
/// retires a slot because its log ran dry.
struct DomainPolicy {
  id: DomainCursorId,
  base_dn: BaseDn,
  domain_db: Arc<dyn ReplicationDomainDb>,
  pending: Arc<PendingReplicas>,
}

impl CursorPolicy for DomainPolicy {
  type Data = ();

  fn incorporate_new_cursors(&mut self, cursors: &mut CursorSet<()>) -> Result<()> {
    let mut drained = self.pending.take();
    while let Some((replica_id, resume)) = drained.pop_first() {
      if cursors.contains(replica_id) {
        debug!(
          base_dn = %self.base_dn,
          replica_id,
          %resume,
          "replica already replaying, registration dropped"
        );
        continue;
      }

      let opened = self
        .domain_db
        .cursor_from(&self.base_dn, replica_id, resume.start_after())
        .and_then(|mut cursor| {
          let opened_id = cursor.replica_id();
          if opened_id != replica_id {
            cursor.close();
            return Err(ChangelogError::ReplicaMismatch {
              requested: replica_id,
              opened: opened_id,
            });
          }
          cursors.add_cursor(cursor, ())
        });
      if let Err(error) = opened {
        // Nothing of this snapshot may be lost: retry it on the next advance.
        drained.insert(replica_id, resume);
        self.pending.restore(drained);
        return Err(error);
      }
      debug!(base_dn = %self.base_dn, replica_id, %resume, "replica cursor opened");
    }
    Ok(())
  }

  fn is_cursor_no_longer_needed_for(&self, _data: &()) -> bool {
    // An idle replica is still part of the domain.
    false
  }

  fn cursor_removed(&mut self, _data: ()) {}

  fn detach(&mut self) {
    self.pending.close();
    self.domain_db.unregister_cursor(&self.base_dn, self.id);
    debug!(base_dn = %self.base_dn, cursor = %self.id, "domain cursor closed");
  }
}

/// Cursor over all replica logs of one replication domain, merged in CSN
/// order.
///
/// Replicas join through [`DomainCursor::add_replica`] or a
/// [`ReplicaRegistrar`]; iteration (`advance`, `current_record`, `close`)
/// belongs to a single thread.
pub struct DomainCursor {
  inner: CompositeCursor<DomainPolicy>,
  registrar: ReplicaRegistrar,
  server_state: ServerState,
}

impl DomainCursor {
  pub fn new(base_dn: BaseDn, domain_db: Arc<dyn ReplicationDomainDb>) -> Self {
    let pending = Arc::new(PendingReplicas::default());
    let id = DomainCursorId::next();
    let policy = DomainPolicy {
      id,
      base_dn: base_dn.clone(),
      domain_db,
      pending: Arc::clone(&pending),
    };

    Self {
      inner: CompositeCursor::new(policy),
      registrar: ReplicaRegistrar { base_dn, pending },
      server_state: ServerState::new(),
    }
  }

  /// Builds a cursor that resumes every replica of `state` right after the
  /// CSN recorded for it.
  pub fn with_server_state(
    base_dn: BaseDn,
    domain_db: Arc<dyn ReplicationDomainDb>,
    state: &ServerState,
  ) -> Result<Self> {
    let mut cursor = Self::new(base_dn, domain_db);
    for (replica_id, csn) in state.iter() {
      cursor.add_replica(replica_id, Some(csn))?;
    }
    cursor.server_state = state.clone();
    Ok(cursor)
  }

  pub fn id(&self) -> DomainCursorId {
    self.inner.policy().id
  }

  pub fn base_dn(&self) -> &BaseDn {
    &self.inner.policy().base_dn
  }

  /// See [`ReplicaRegistrar::add_replica`].
  pub fn add_replica(&self, replica_id: ReplicaId, start_after: Option<Csn>) -> Result<()> {
    self.registrar.add_replica(replica_id, start_after)
  }

  pub fn registrar(&self) -> ReplicaRegistrar {
    self.registrar.clone()
  }

  /// Registrations not yet turned into cursors.
  pub fn pending_replicas(&self) -> usize {
    self.registrar.pending.len()
  }

  pub fn active_replicas(&self) -> Vec<ReplicaId> {
    self.inner.active_replicas()
  }

  /// # Panics
  ///
  /// Panics if the cursor was closed.
  pub fn current_record(&self) -> Option<&UpdateRecord> {
    self.inner.current_record()
  }

  /// Opens pending replicas, then moves to the next record in CSN order.
  pub fn advance(&mut self) -> Result<bool> {
    let available = self.inner.advance()?;
    if let Some(record) = self.inner.current_record() {
      self.server_state.update(record.csn);
    }
    Ok(available)
  }

  /// Last CSN delivered per replica, including positions inherited from
  /// [`DomainCursor::with_server_state`].
  pub fn server_state(&self) -> &ServerState {
    &self.server_state
  }

  pub fn is_closed(&self) -> bool {
    self.inner.is_closed()
  }

  /// Closes every replica cursor, drops undrained registrations and
  /// unregisters from the domain db. Idempotent.
  pub fn close(&mut self) {
    self.inner.close();
  }
}

#[cfg(test)]
mod tests {
  use super::{merge_oldest, PendingReplicas};
  use crate::error::ChangelogError;
  use crate::replication::types::{Csn, ResumePoint};
  use std::collections::BTreeMap;

  #[test]
  fn merge_keeps_oldest_resume_point() {
    let mut replicas = BTreeMap::new();
    merge_oldest(&mut replicas, 1, ResumePoint::After(Csn::new(9, 1, 1)));
    merge_oldest(&mut replicas, 1, ResumePoint::After(Csn::new(4, 1, 1)));
    merge_oldest(&mut replicas, 1, ResumePoint::After(Csn::new(6, 1, 1)));
    assert_eq!(replicas[&1], ResumePoint::After(Csn::new(4, 1, 1)));

    merge_oldest(&mut replicas, 1, ResumePoint::FromStart);
    merge_oldest(&mut replicas, 1, ResumePoint::After(Csn::new(1, 1, 1)));
    assert_eq!(replicas[&1], ResumePoint::FromStart);
  }

  #[test]
  fn take_empties_and_restore_merges() {
    let pending = PendingReplicas::default();
    pending
      .register(1, ResumePoint::After(Csn::new(5, 1, 1)))
      .expect("register");
    let drained = pending.take();
    assert_eq!(pending.len(), 0);

    pending
      .register(1, ResumePoint::After(Csn::new(8, 1, 1)))
      .expect("register");
    pending.restore(drained);
    assert_eq!(
      pending.take().get(&1),
      Some(&ResumePoint::After(Csn::new(5, 1, 1)))
    );
  }

  #[test]
  fn closed_pending_rejects_registrations() {
    let pending = PendingReplicas::default();
    pending.register(2, ResumePoint::FromStart).expect("register");
    pending.close();
    assert_eq!(pending.len(), 0);
    assert!(matches!(
      pending.register(3, ResumePoint::FromStart),
      Err(ChangelogError::CursorClosed)
    ));
    pending.restore(BTreeMap::from([(4, ResumePoint::FromStart)]));
    assert_eq!(pending.len(), 0);
  }
}
