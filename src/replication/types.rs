//! Change sequence numbers and update records.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type ReplicaId = u16;

const TIMESTAMP_HEX_DIGITS: usize = 16;
const REPLICA_ID_HEX_DIGITS: usize = 4;
const SEQNUM_HEX_DIGITS: usize = 8;
const CSN_HEX_DIGITS: usize = TIMESTAMP_HEX_DIGITS + REPLICA_ID_HEX_DIGITS + SEQNUM_HEX_DIGITS;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid csn {raw:?}: {reason}")]
pub struct CsnParseError {
  raw: String,
  reason: &'static str,
}

impl CsnParseError {
  fn new(raw: &str, reason: &'static str) -> Self {
    Self {
      raw: raw.to_string(),
      reason,
    }
  }
}

/// Change sequence number: the logical clock tagging every update.
///
/// Ordered by timestamp, then originating replica, then sequence number, so
/// same-millisecond updates from different replicas still compare
/// deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Csn {
  pub timestamp: u64,
  pub replica_id: ReplicaId,
  pub seqnum: u32,
}

impl Csn {
  pub const fn new(timestamp: u64, replica_id: ReplicaId, seqnum: u32) -> Self {
    Self {
      timestamp,
      replica_id,
      seqnum,
    }
  }
}

impl Ord for Csn {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .timestamp
      .cmp(&other.timestamp)
      .then_with(|| self.replica_id.cmp(&other.replica_id))
      .then_with(|| self.seqnum.cmp(&other.seqnum))
  }
}

impl PartialOrd for Csn {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl fmt::Display for Csn {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{:016x}{:04x}{:08x}",
      self.timestamp, self.replica_id, self.seqnum
    )
  }
}

impl FromStr for Csn {
  type Err = CsnParseError;

  fn from_str(raw: &str) -> Result<Self, Self::Err> {
    if raw.len() != CSN_HEX_DIGITS {
      return Err(CsnParseError::new(raw, "expected 28 hex digits"));
    }
    if !raw.bytes().all(|byte| byte.is_ascii_hexdigit()) {
      return Err(CsnParseError::new(raw, "non-hex character"));
    }

    let (timestamp, rest) = raw.split_at(TIMESTAMP_HEX_DIGITS);
    let (replica_id, seqnum) = rest.split_at(REPLICA_ID_HEX_DIGITS);

    // Widths are fixed above, so radix parsing cannot overflow.
    let timestamp = u64::from_str_radix(timestamp, 16)
      .map_err(|_| CsnParseError::new(raw, "invalid timestamp"))?;
    let replica_id = u16::from_str_radix(replica_id, 16)
      .map_err(|_| CsnParseError::new(raw, "invalid replica id"))?;
    let seqnum =
      u32::from_str_radix(seqnum, 16).map_err(|_| CsnParseError::new(raw, "invalid seqnum"))?;

    Ok(Self::new(timestamp, replica_id, seqnum))
  }
}

impl Serialize for Csn {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for Csn {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let raw = String::deserialize(deserializer)?;
    Csn::from_str(&raw).map_err(serde::de::Error::custom)
  }
}

/// Where a replica cursor starts: from the first record of the log, or
/// strictly after a given CSN.
///
/// `FromStart` orders before every `After`, so the minimum of two resume
/// points is always the one that replays more history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResumePoint {
  FromStart,
  After(Csn),
}

impl ResumePoint {
  pub fn start_after(self) -> Option<Csn> {
    match self {
      ResumePoint::FromStart => None,
      ResumePoint::After(csn) => Some(csn),
    }
  }

  /// Whether a record with `csn` is replayed from this point.
  pub fn includes(self, csn: Csn) -> bool {
    match self {
      ResumePoint::FromStart => true,
      ResumePoint::After(after) => csn > after,
    }
  }
}

impl From<Option<Csn>> for ResumePoint {
  fn from(value: Option<Csn>) -> Self {
    value.map_or(ResumePoint::FromStart, ResumePoint::After)
  }
}

impl fmt::Display for ResumePoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ResumePoint::FromStart => write!(f, "start"),
      ResumePoint::After(csn) => write!(f, "after:{csn}"),
    }
  }
}

/// Base DN of the replication domain (naming context) a cursor covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BaseDn(String);

impl BaseDn {
  pub fn new(dn: impl Into<String>) -> Self {
    Self(dn.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for BaseDn {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// One change read from a replica log. The payload is never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
  pub csn: Csn,
  pub payload: Vec<u8>,
}

impl UpdateRecord {
  pub fn new(csn: Csn, payload: impl Into<Vec<u8>>) -> Self {
    Self {
      csn,
      payload: payload.into(),
    }
  }

  pub fn replica_id(&self) -> ReplicaId {
    self.csn.replica_id
  }
}
