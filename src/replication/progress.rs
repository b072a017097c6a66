//! Per-replica replay progress, used to resume a domain cursor.

use crate::error::{ChangelogError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::{Csn, ReplicaId};

const SERVER_STATE_VERSION: u32 = 1;

/// Last CSN delivered for every replica of a domain.
///
/// Feeding it back into a new domain cursor resumes strictly after what was
/// already consumed. Storing the encoded bytes is up to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerState {
  replicas: BTreeMap<ReplicaId, Csn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerStateEnvelope {
  version: u32,
  #[serde(default)]
  replicas: BTreeMap<ReplicaId, Csn>,
}

impl ServerState {
  pub fn new() -> Self {
    Self::default()
  }

  /// Records `csn` for its replica unless an equal or newer CSN is already
  /// known. Returns whether the state changed.
  pub fn update(&mut self, csn: Csn) -> bool {
    match self.replicas.get(&csn.replica_id) {
      Some(known) if *known >= csn => false,
      _ => {
        self.replicas.insert(csn.replica_id, csn);
        true
      }
    }
  }

  pub fn get(&self, replica_id: ReplicaId) -> Option<Csn> {
    self.replicas.get(&replica_id).copied()
  }

  pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, Csn)> + '_ {
    self.replicas.iter().map(|(replica_id, csn)| (*replica_id, *csn))
  }

  pub fn encode(&self) -> Result<Vec<u8>> {
    let envelope = ServerStateEnvelope {
      version: SERVER_STATE_VERSION,
      replicas: self.replicas.clone(),
    };
    serde_json::to_vec(&envelope)
      .map_err(|error| ChangelogError::Serialization(format!("encode server state: {error}")))
  }

  pub fn decode(bytes: &[u8]) -> Result<Self> {
    let envelope: ServerStateEnvelope = serde_json::from_slice(bytes)
      .map_err(|error| ChangelogError::Serialization(format!("decode server state: {error}")))?;

    if envelope.version != SERVER_STATE_VERSION {
      return Err(ChangelogError::VersionMismatch {
        found: envelope.version,
        supported: SERVER_STATE_VERSION,
      });
    }

    Ok(Self {
      replicas: envelope.replicas,
    })
  }
}

impl FromIterator<Csn> for ServerState {
  fn from_iter<I: IntoIterator<Item = Csn>>(iter: I) -> Self {
    let mut state = Self::new();
    for csn in iter {
      state.update(csn);
    }
    state
  }
}
