//! End-to-end replication scenarios across the dirsync crates.

use dirsync_core::{
    ChangeNumberIndex, ChangeNumberIndexer, Clock, Csn, DomainId, EntryAttributes, LogConfig,
    ManualClock, MemoryStateStore, MergeCursor, Modification, MultiDomainServerState,
    PositionStrategy, ReplicaId,
};
use dirsync_engine::{
    AssuredConfig, AssuredOutcome, DomainConfig, MemoryChannel, MemoryReplayHandler,
    ReplicationDomain,
};
use dirsync_protocol::{Opcode, ReplicationMsg};
use dirsync_storage::MemorySegmentStore;
use dirsync_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const CONVERGE: Duration = Duration::from_secs(10);

fn domain() -> DomainId {
    DomainId::new("dc=example,dc=com")
}

fn person(cn: &str) -> EntryAttributes {
    [("cn".to_string(), BTreeSet::from([cn.to_string()]))]
        .into_iter()
        .collect()
}

fn drain(cursor: &mut MergeCursor) -> Vec<Csn> {
    let mut csns = Vec::new();
    while let Some(record) = cursor.next().unwrap() {
        csns.push(record.csn);
    }
    csns
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_replicas_exchange_two_hundred_changes() {
    init_tracing();
    let r1 = TestReplica::start(&domain(), 1);
    let r2 = TestReplica::start(&domain(), 2);
    connect_all(&[&r1, &r2]);

    for i in 0..100 {
        r1.add_entry(&format!("uid=r1-{i},dc=example,dc=com"), &person("one"))
            .unwrap();
        r2.add_entry(&format!("uid=r2-{i},dc=example,dc=com"), &person("two"))
            .unwrap();
    }
    assert!(wait_converged(&[&r1, &r2], CONVERGE).await);
    assert_eq!(r1.directory.len(), 200);
    assert!(wait_until(CONVERGE, || r1.server_state() == r2.server_state()).await);

    for replica in [&r1, &r2] {
        let mut cursor = MergeCursor::open(
            &replica.changelog.changelog,
            &MultiDomainServerState::new(),
            PositionStrategy::AtOrAfter,
        );
        let csns = drain(&mut cursor);
        assert_eq!(csns.len(), 200);
        assert!(csns.windows(2).all(|w| w[0] < w[1]));

        let position = cursor.position().get(&domain()).unwrap().clone();
        let state = replica.server_state();
        assert_eq!(position, state);
        assert_eq!(position.len(), 2);
        for id in [ReplicaId(1), ReplicaId(2)] {
            let log = replica.changelog.replica_log(&domain(), id).unwrap();
            assert_eq!(position.newest(id), log.newest_csn());
        }
    }

    r1.shutdown().await;
    r2.shutdown().await;
}

#[tokio::test]
async fn out_of_order_commits_publish_in_csn_order() {
    let clock = Arc::new(ManualClock::new(5_000));
    let channel = Arc::new(MemoryChannel::new());
    let changelog = memory_changelog();
    let domain = ReplicationDomain::open(
        DomainConfig::new(domain(), ReplicaId(1)),
        Arc::clone(&changelog.changelog),
        channel.clone(),
        Arc::new(MemoryReplayHandler::new()),
        Arc::new(MemoryStateStore::new()),
        clock.clone() as Arc<dyn Clock>,
    )
    .unwrap();

    let c1 = domain.assign().unwrap();
    let c2 = domain.assign().unwrap();
    let c3 = domain.assign().unwrap();
    assert!(c1 < c2 && c2 < c3);

    domain.commit(c3, Opcode::Delete, "uid=c,dc=example,dc=com", Vec::new()).unwrap();
    domain.commit(c2, Opcode::Delete, "uid=b,dc=example,dc=com", Vec::new()).unwrap();
    assert!(channel.is_empty());
    assert_eq!(domain.server_state().newest(ReplicaId(1)), None);

    domain.commit(c1, Opcode::Delete, "uid=a,dc=example,dc=com", Vec::new()).unwrap();
    let published: Vec<Csn> = channel
        .take()
        .into_iter()
        .filter_map(|msg| match msg {
            ReplicationMsg::Update(update) => Some(update.csn),
            _ => None,
        })
        .collect();
    assert_eq!(published, vec![c1, c2, c3]);
    assert_eq!(domain.server_state().newest(ReplicaId(1)), Some(c3));

    let log = changelog.replica_log(&domain.config().domain, ReplicaId(1)).unwrap();
    assert_eq!(log.len(), 3);
}

#[tokio::test]
async fn assured_write_times_out_without_peers() {
    let config = DomainConfig::new(domain(), ReplicaId(1))
        .with_assured(AssuredConfig::safe_data(2).with_timeout(Duration::from_millis(50)));
    let replica = TestReplica::start_with(config, memory_changelog());

    let started = tokio::time::Instant::now();
    let receipt = replica
        .add_entry("uid=lonely,dc=example,dc=com", &person("lonely"))
        .unwrap();
    assert_eq!(receipt.wait().await, AssuredOutcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(50));

    // The change itself went through.
    assert!(replica.directory.entry("uid=lonely,dc=example,dc=com").is_some());
    assert_eq!(replica.domain().assured_stats().timed_out, 1);
    replica.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn assured_write_is_acknowledged_by_peer() {
    init_tracing();
    let config = DomainConfig::new(domain(), ReplicaId(1))
        .with_assured(AssuredConfig::safe_data(2).with_timeout(Duration::from_secs(5)));
    let r1 = TestReplica::start_with(config, memory_changelog());
    let r2 = TestReplica::start(&domain(), 2);
    connect_all(&[&r1, &r2]);

    let receipt = r1
        .add_entry("uid=safe,dc=example,dc=com", &person("safe"))
        .unwrap();
    let outcome = receipt.wait().await;
    assert!(outcome.is_acknowledged(), "{outcome:?}");
    assert!(r2.directory.entry("uid=safe,dc=example,dc=com").is_some());

    r1.shutdown().await;
    r2.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_modifications_converge() {
    let dn = "uid=shared,dc=example,dc=com";
    let r1 = TestReplica::start(&domain(), 1);
    let r2 = TestReplica::start(&domain(), 2);
    connect_all(&[&r1, &r2]);

    r1.add_entry(dn, &person("Shared")).unwrap();
    assert!(wait_until(CONVERGE, || r2.directory.entry(dn).is_some()).await);

    r1.modify(dn, &[Modification::replace("mail", ["one@example.com"])]).unwrap();
    r2.modify(dn, &[Modification::replace("mail", ["two@example.com"])]).unwrap();
    r2.modify(dn, &[Modification::add("description", ["from r2"])]).unwrap();

    assert!(wait_converged(&[&r1, &r2], CONVERGE).await);
    let entry = r1.directory.entry(dn).unwrap();
    assert_eq!(entry["mail"].len(), 1);
    assert!(entry.contains_key("description"));

    r1.shutdown().await;
    r2.shutdown().await;
}

#[tokio::test]
async fn restarted_replica_continues_its_stream() {
    let config = DomainConfig::new(domain(), ReplicaId(7));
    let replica = TestReplica::start_with(config.clone(), file_changelog());
    for i in 0..5 {
        replica
            .add_entry(&format!("uid=u{i},dc=example,dc=com"), &person("u"))
            .unwrap();
    }
    let before = replica.server_state().newest(ReplicaId(7)).unwrap();

    let changelog = replica.shutdown().await.reopen();
    let replica = TestReplica::start_with(config, changelog);
    assert_eq!(replica.server_state().newest(ReplicaId(7)), Some(before));

    let receipt = replica
        .add_entry("uid=after,dc=example,dc=com", &person("after"))
        .unwrap();
    assert!(receipt.csn() > before);
    let log = replica.changelog.replica_log(&domain(), ReplicaId(7)).unwrap();
    assert_eq!(log.len(), 6);
    replica.shutdown().await;
}

#[test]
fn change_numbers_follow_medium_consistency() {
    init_tracing();
    let fixture = memory_changelog();
    let csn = |ts, replica| Csn::new(ts, 0, ReplicaId(replica));
    fixture.publish_all(&domain(), &[csn(10, 1), csn(30, 1)]);
    fixture.publish_all(&domain(), &[csn(20, 2), csn(40, 2)]);

    let index = Arc::new(
        ChangeNumberIndex::open(Arc::new(MemorySegmentStore::new()), LogConfig::default()).unwrap(),
    );
    let mut indexer = ChangeNumberIndexer::new(Arc::clone(&fixture.changelog), Arc::clone(&index)).unwrap();

    // Replica 1 has said nothing past 30, so 40 must wait.
    assert_eq!(indexer.index_available().unwrap(), 3);
    fixture.heartbeat(&domain(), csn(50, 1));
    assert_eq!(indexer.index_available().unwrap(), 1);

    let first = index.oldest().unwrap().unwrap();
    let last = index.newest().unwrap().unwrap();
    assert_eq!(first.csn, csn(10, 1));
    assert_eq!(last.csn, csn(40, 2));
    assert_eq!(last.change_number.as_u64() - first.change_number.as_u64(), 3);
    indexer.close();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn merge_cursor_yields_every_change_once_in_order(
        streams in replica_streams_strategy(1..=4, 0..25)
    ) {
        let fixture = memory_changelog();
        for stream in &streams {
            fixture.publish_all(&domain(), stream);
        }
        let mut expected: Vec<Csn> = streams.iter().flatten().copied().collect();
        expected.sort();

        let mut cursor = MergeCursor::open(
            &fixture.changelog,
            &MultiDomainServerState::new(),
            PositionStrategy::AtOrAfter,
        );
        prop_assert_eq!(drain(&mut cursor), expected);
    }

    #[test]
    fn replaying_history_again_changes_nothing(
        mods in prop::collection::vec(prop::collection::vec(modification_strategy(), 1..3), 1..12)
    ) {
        let dn = "uid=p,dc=example,dc=com";
        let directory = MemoryDirectory::new();
        directory.apply(Csn::new(1, 0, ReplicaId(1)), Opcode::Add, dn, &encode_entry(&person("p")));

        let ops: Vec<(Csn, Vec<u8>)> = mods
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let csn = Csn::new(10 + i as u64, 0, ReplicaId(i as u16 % 3 + 1));
                (csn, encode_modifications(m))
            })
            .collect();
        for (csn, payload) in &ops {
            directory.apply(*csn, Opcode::Modify, dn, payload);
        }
        let settled = directory.entry(dn);

        for (csn, payload) in &ops {
            directory.apply(*csn, Opcode::Modify, dn, payload);
            prop_assert_eq!(directory.entry(dn), settled.clone());
        }
    }
}
