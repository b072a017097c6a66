//! K-way merge over per-replica cursors.
//!
//! A [`CompositeCursor`] owns one slot per replica. Each slot buffers at most
//! one record (the head of its cursor); every [`CompositeCursor::advance`]
//! hands out the smallest head and refills only that slot. Which cursors
//! join and when a drained cursor is dropped is left to a [`CursorPolicy`].

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use super::cursor::ReplicaCursor;
use super::types::{ReplicaId, UpdateRecord};
use crate::error::{ChangelogError, Result};

/// Cursor-flavour hooks driven by [`CompositeCursor`].
pub trait CursorPolicy {
  /// Auxiliary data attached to every slot, opaque to the merge.
  type Data;

  /// Called at the start of every advance to add newly known cursors.
  fn incorporate_new_cursors(&mut self, cursors: &mut CursorSet<Self::Data>) -> Result<()>;

  /// Called whenever a slot is found without a record. Returning `false`
  /// keeps the slot idle; it is polled again on later advances.
  fn is_cursor_no_longer_needed_for(&self, data: &Self::Data) -> bool;

  /// Called after a slot was retired and its cursor closed.
  fn cursor_removed(&mut self, data: Self::Data);

  /// Called once when the composite is closed, after all cursors are closed.
  fn detach(&mut self) {}
}

struct Slot<D> {
  cursor: Box<dyn ReplicaCursor>,
  data: D,
  head: Option<UpdateRecord>,
}

/// Active slots of a composite cursor, keyed by replica.
pub struct CursorSet<D> {
  slots: BTreeMap<ReplicaId, Slot<D>>,
}

impl<D> CursorSet<D> {
  fn new() -> Self {
    Self {
      slots: BTreeMap::new(),
    }
  }

  /// Adds a cursor as a new slot. The cursor is first read on the next merge
  /// step, so adding never touches storage.
  pub fn add_cursor(&mut self, mut cursor: Box<dyn ReplicaCursor>, data: D) -> Result<()> {
    let replica_id = cursor.replica_id();
    if self.slots.contains_key(&replica_id) {
      cursor.close();
      return Err(ChangelogError::DuplicateReplica(replica_id));
    }

    self.slots.insert(
      replica_id,
      Slot {
        cursor,
        data,
        head: None,
      },
    );
    Ok(())
  }

  pub fn contains(&self, replica_id: ReplicaId) -> bool {
    self.slots.contains_key(&replica_id)
  }

  pub fn replica_ids(&self) -> impl Iterator<Item = ReplicaId> + '_ {
    self.slots.keys().copied()
  }

  /// Reads a head for every slot that has none: freshly added cursors and
  /// idle ones that may have been appended to since.
  fn fill_heads(&mut self) -> Result<()> {
    for (replica_id, slot) in self.slots.iter_mut() {
      if slot.head.is_some() {
        continue;
      }
      slot.head = slot.cursor.next().inspect_err(|error| {
        warn!(replica_id = *replica_id, %error, "replica cursor read failed");
      })?;
    }
    Ok(())
  }

  fn idle_replicas(&self) -> Vec<ReplicaId> {
    self
      .slots
      .iter()
      .filter(|(_, slot)| slot.head.is_none())
      .map(|(replica_id, _)| *replica_id)
      .collect()
  }

  fn min_head(&self) -> Option<ReplicaId> {
    self
      .slots
      .iter()
      .filter_map(|(replica_id, slot)| slot.head.as_ref().map(|head| (head.csn, *replica_id)))
      .min()
      .map(|(_, replica_id)| replica_id)
  }

  fn remove(&mut self, replica_id: ReplicaId) -> Option<D> {
    let mut slot = self.slots.remove(&replica_id)?;
    slot.cursor.close();
    Some(slot.data)
  }

  fn close_all(&mut self) {
    for (_, mut slot) in std::mem::take(&mut self.slots) {
      slot.cursor.close();
    }
  }
}

/// Merges per-replica cursors into a single cursor ordered by CSN.
///
/// Not thread-safe: one thread drives `advance`, `current_record` and
/// `close`. Dropping an open composite closes it.
pub struct CompositeCursor<P: CursorPolicy> {
  policy: P,
  cursors: CursorSet<P::Data>,
  current: Option<UpdateRecord>,
  closed: bool,
}

impl<P: CursorPolicy> CompositeCursor<P> {
  pub fn new(policy: P) -> Self {
    Self {
      policy,
      cursors: CursorSet::new(),
      current: None,
      closed: false,
    }
  }

  pub fn policy(&self) -> &P {
    &self.policy
  }

  /// Record at the current position; `None` before the first advance and
  /// once every cursor is exhausted.
  ///
  /// # Panics
  ///
  /// Panics if the cursor was closed.
  pub fn current_record(&self) -> Option<&UpdateRecord> {
    assert!(!self.closed, "current_record called on a closed cursor");
    self.current.as_ref()
  }

  /// Replicas that currently own a slot, idle ones included.
  pub fn active_replicas(&self) -> Vec<ReplicaId> {
    self.cursors.replica_ids().collect()
  }

  pub fn is_closed(&self) -> bool {
    self.closed
  }

  /// Performs one merge step and reports whether a record is current.
  ///
  /// On error the current record and every buffered head are left as they
  /// were, so the call can be retried.
  pub fn advance(&mut self) -> Result<bool> {
    if self.closed {
      return Err(ChangelogError::CursorClosed);
    }

    self.policy.incorporate_new_cursors(&mut self.cursors)?;
    self.cursors.fill_heads()?;
    for replica_id in self.cursors.idle_replicas() {
      self.retire_if_unneeded(replica_id);
    }

    let Some(replica_id) = self.cursors.min_head() else {
      self.current = None;
      return Ok(false);
    };

    let Some(slot) = self.cursors.slots.get_mut(&replica_id) else {
      self.current = None;
      return Ok(false);
    };
    let next = slot.cursor.next().inspect_err(|error| {
      warn!(replica_id, %error, "replica cursor read failed");
    })?;
    let exhausted = next.is_none();
    self.current = std::mem::replace(&mut slot.head, next);

    if let Some(record) = self.current.as_ref() {
      trace!(replica_id, csn = %record.csn, "merge step");
    }
    if exhausted {
      self.retire_if_unneeded(replica_id);
    }

    Ok(self.current.is_some())
  }

  /// Closes every child cursor and detaches the policy. Idempotent.
  pub fn close(&mut self) {
    if self.closed {
      return;
    }
    self.closed = true;
    self.current = None;
    self.cursors.close_all();
    self.policy.detach();
  }

  fn retire_if_unneeded(&mut self, replica_id: ReplicaId) {
    let unneeded = match self.cursors.slots.get(&replica_id) {
      Some(slot) => self.policy.is_cursor_no_longer_needed_for(&slot.data),
      None => false,
    };
    if !unneeded {
      return;
    }
    if let Some(data) = self.cursors.remove(replica_id) {
      debug!(replica_id, "retired exhausted replica cursor");
      self.policy.cursor_removed(data);
    }
  }
}

impl<P: CursorPolicy> Drop for CompositeCursor<P> {
  fn drop(&mut self) {
    self.close();
  }
}
