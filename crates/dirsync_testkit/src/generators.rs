//! Property-based test generators using proptest.

use dirsync_core::{Csn, Modification, ReplicaId};
use proptest::prelude::*;
use std::ops::{Range, RangeInclusive};

/// First timestamp of generated replica streams.
pub const STREAM_START: u64 = 1_000;

/// Strategy for replica ids.
pub fn replica_id_strategy() -> impl Strategy<Value = ReplicaId> {
    (1u16..=64).prop_map(ReplicaId)
}

/// Strategy for arbitrary CSNs.
pub fn csn_strategy() -> impl Strategy<Value = Csn> {
    (0u64..(1 << 40), any::<u32>(), any::<u16>())
        .prop_map(|(ts, seq, replica)| Csn::new(ts, seq, ReplicaId(replica)))
}

/// Strategy for the change streams of several replicas.
///
/// Replica `i` gets `ReplicaId(i + 1)`. Each stream is strictly increasing
/// and timestamps of different replicas interleave, with ties broken by the
/// sequence number as a generator would.
pub fn replica_streams_strategy(
    replicas: RangeInclusive<usize>,
    per_replica: Range<usize>,
) -> impl Strategy<Value = Vec<Vec<Csn>>> {
    prop::collection::vec(prop::collection::vec(0u64..20, per_replica), replicas).prop_map(
        |streams| {
            streams
                .into_iter()
                .enumerate()
                .map(|(i, deltas)| build_stream(ReplicaId(i as u16 + 1), &deltas))
                .collect()
        },
    )
}

fn build_stream(replica: ReplicaId, deltas: &[u64]) -> Vec<Csn> {
    let mut ts = STREAM_START;
    let mut seq = 0u32;
    deltas
        .iter()
        .map(|delta| {
            if *delta == 0 {
                seq += 1;
            } else {
                ts += delta;
                seq = 0;
            }
            Csn::new(ts, seq, replica)
        })
        .collect()
}

/// Strategy for a modification on a small attribute and value space, so
/// that concurrent modifications collide often.
pub fn modification_strategy() -> impl Strategy<Value = Modification> {
    let attribute = prop::sample::select(vec!["cn", "mail", "description"]);
    let values = prop::collection::btree_set(prop::sample::select(vec!["a", "b", "c"]), 0..3);
    (0u8..4, attribute, values).prop_map(|(kind, attribute, values)| match kind {
        0 => Modification::add(attribute, values),
        1 if values.is_empty() => Modification::delete_attribute(attribute),
        1 => Modification::delete(attribute, values),
        2 => Modification::delete_attribute(attribute),
        _ => Modification::replace(attribute, values),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn streams_are_strictly_increasing(streams in replica_streams_strategy(2..=5, 1..30)) {
            for (i, stream) in streams.iter().enumerate() {
                prop_assert!(stream.windows(2).all(|w| w[0] < w[1]));
                prop_assert!(stream.iter().all(|csn| csn.replica_id() == ReplicaId(i as u16 + 1)));
            }
        }
    }

    #[test]
    fn equal_deltas_bump_the_sequence() {
        let stream = build_stream(ReplicaId(1), &[5, 0, 0, 3]);
        assert_eq!(stream[0], Csn::new(STREAM_START + 5, 0, ReplicaId(1)));
        assert_eq!(stream[2], Csn::new(STREAM_START + 5, 2, ReplicaId(1)));
        assert_eq!(stream[3], Csn::new(STREAM_START + 8, 0, ReplicaId(1)));
    }
}
