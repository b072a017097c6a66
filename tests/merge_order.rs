use std::collections::BTreeMap;
use std::sync::Arc;

use changelog_replay::replication::{
  BaseDn, Csn, DomainCursor, MemoryChangelogDb, ReplicaId, UpdateRecord,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Random per-replica logs with plenty of cross-replica timestamp collisions.
fn random_logs(rng: &mut StdRng) -> BTreeMap<ReplicaId, Vec<Csn>> {
  let replica_count = rng.gen_range(1..=6);
  let mut logs = BTreeMap::new();

  for _ in 0..replica_count {
    let replica_id = rng.gen_range(1..=64);
    let mut timestamp = rng.gen_range(0..20);
    let mut seqnum = 0_u32;
    let mut csns = Vec::new();

    for _ in 0..rng.gen_range(0..40) {
      if rng.gen_bool(0.5) {
        timestamp += rng.gen_range(1..5);
      }
      seqnum += 1;
      csns.push(Csn::new(timestamp, replica_id, seqnum));
    }
    logs.insert(replica_id, csns);
  }

  logs
}

fn publish_all(dn: &BaseDn, logs: &BTreeMap<ReplicaId, Vec<Csn>>) -> Arc<MemoryChangelogDb> {
  let db = Arc::new(MemoryChangelogDb::new());
  for csns in logs.values() {
    for csn in csns {
      db.publish(dn, UpdateRecord::new(*csn, csn.to_string().into_bytes()))
        .expect("publish");
    }
  }
  db
}

fn drain(cursor: &mut DomainCursor) -> Vec<UpdateRecord> {
  let mut records = Vec::new();
  while cursor.advance().expect("advance") {
    records.push(cursor.current_record().expect("current").clone());
  }
  records
}

fn by_replica(records: &[UpdateRecord]) -> BTreeMap<ReplicaId, Vec<Csn>> {
  let mut grouped: BTreeMap<ReplicaId, Vec<Csn>> = BTreeMap::new();
  for record in records {
    grouped.entry(record.replica_id()).or_default().push(record.csn);
  }
  grouped
}

#[test]
fn merged_output_is_sorted_and_preserves_each_replica_fuzz_like() {
  let mut rng = StdRng::seed_from_u64(0x5eed_c5a1);
  let dn = BaseDn::new("dc=example,dc=com");

  for _ in 0..200 {
    let logs = random_logs(&mut rng);
    let db = publish_all(&dn, &logs);

    let mut cursor = DomainCursor::new(dn.clone(), db.clone());
    for replica_id in logs.keys() {
      cursor.add_replica(*replica_id, None).expect("add replica");
    }
    let records = drain(&mut cursor);

    assert!(records.windows(2).all(|pair| pair[0].csn < pair[1].csn));
    assert!(records
      .iter()
      .all(|record| record.payload == record.csn.to_string().into_bytes()));

    let expected: BTreeMap<ReplicaId, Vec<Csn>> = logs
      .iter()
      .filter(|(_, csns)| !csns.is_empty())
      .map(|(replica_id, csns)| (*replica_id, csns.clone()))
      .collect();
    assert_eq!(by_replica(&records), expected);
  }
}

#[test]
fn random_resume_points_skip_exactly_the_consumed_prefix_fuzz_like() {
  let mut rng = StdRng::seed_from_u64(0x0dd_ba11);
  let dn = BaseDn::new("dc=example,dc=com");

  for _ in 0..200 {
    let logs = random_logs(&mut rng);
    let db = publish_all(&dn, &logs);

    let mut cursor = DomainCursor::new(dn.clone(), db.clone());
    let mut expected = BTreeMap::new();
    for (replica_id, csns) in &logs {
      let skip = rng.gen_range(0..=csns.len());
      let start_after = skip.checked_sub(1).map(|index| csns[index]);
      cursor
        .add_replica(*replica_id, start_after)
        .expect("add replica");

      // A newer registration for the same replica must not hide history.
      if let Some(csn) = csns.last() {
        cursor.add_replica(*replica_id, Some(*csn)).expect("add newer");
      }

      if skip < csns.len() {
        expected.insert(*replica_id, csns[skip..].to_vec());
      }
    }

    let records = drain(&mut cursor);
    assert!(records.windows(2).all(|pair| pair[0].csn < pair[1].csn));
    assert_eq!(by_replica(&records), expected);
  }
}

#[test]
fn interleaved_publishing_keeps_per_replica_order_fuzz_like() {
  let mut rng = StdRng::seed_from_u64(0xfeed_f00d);
  let dn = BaseDn::new("dc=example,dc=com");
  let db = Arc::new(MemoryChangelogDb::new());

  let mut cursor = DomainCursor::new(dn.clone(), db.clone());
  let mut next_timestamp: BTreeMap<ReplicaId, u64> = BTreeMap::new();
  let mut published: BTreeMap<ReplicaId, Vec<Csn>> = BTreeMap::new();
  let mut delivered = Vec::new();

  for round in 0..500_u32 {
    let replica_id = rng.gen_range(1..=5);
    if !next_timestamp.contains_key(&replica_id) {
      cursor.add_replica(replica_id, None).expect("add replica");
    }
    let timestamp = next_timestamp.entry(replica_id).or_insert(0);
    *timestamp += rng.gen_range(1..10);
    let csn = Csn::new(*timestamp, replica_id, round);
    db.publish(&dn, UpdateRecord::new(csn, Vec::new()))
      .expect("publish");
    published.entry(replica_id).or_default().push(csn);

    for _ in 0..rng.gen_range(0..3) {
      if cursor.advance().expect("advance") {
        delivered.push(cursor.current_record().expect("current").clone());
      }
    }
  }
  delivered.extend(drain(&mut cursor));

  assert_eq!(by_replica(&delivered), published);
}
