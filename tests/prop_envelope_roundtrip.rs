//! Property tests: the payload envelope round-trips through the wire format
//! bit-exactly.

use proptest::prelude::*;
use prost::Message;
use streamlog::entry::{CheckpointInfo, DataRank, LogData};
use streamlog::format::{CheckpointEntryType, LogEntry};
use uuid::Uuid;

fn arb_uuid() -> impl Strategy<Value = Uuid> {
    any::<u128>().prop_map(Uuid::from_u128)
}

fn arb_rank() -> impl Strategy<Value = DataRank> {
    (any::<u64>(), arb_uuid()).prop_map(|(rank, uuid)| DataRank { rank, uuid })
}

fn arb_checkpoint() -> impl Strategy<Value = CheckpointInfo> {
    (
        prop::sample::select(vec![
            CheckpointEntryType::Start,
            CheckpointEntryType::Continuation,
            CheckpointEntryType::End,
        ]),
        arb_uuid(),
        arb_uuid(),
        any::<i64>(),
    )
        .prop_map(
            |(entry_type, checkpoint_id, checkpointed_stream_id, start)| CheckpointInfo {
                entry_type,
                checkpoint_id,
                checkpointed_stream_id,
                checkpointed_stream_start: start,
            },
        )
}

fn arb_log_data() -> impl Strategy<Value = LogData> {
    (
        prop::collection::vec(any::<u8>(), 0..256),
        prop::collection::btree_set(arb_uuid(), 0..4),
        prop::collection::btree_map(arb_uuid(), any::<u64>(), 0..4),
        prop::option::of(arb_rank()),
        prop::option::of(arb_checkpoint()),
    )
        .prop_map(|(data, streams, backpointers, rank, checkpoint)| {
            let mut d = LogData::new(data);
            d.streams = streams;
            d.backpointers = backpointers;
            d.rank = rank;
            d.checkpoint = checkpoint;
            d
        })
}

proptest! {
    #![proptest_config(ProptestConfig {
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn envelope_roundtrip(data in arb_log_data(), address in any::<u64>()) {
        let wire = data.to_wire(address);
        let bytes = wire.encode_to_vec();
        let decoded = LogEntry::decode(&bytes[..]).unwrap();
        let back = LogData::from_wire(&decoded).unwrap();

        prop_assert_eq!(back.data_type, data.data_type);
        prop_assert_eq!(&back.data, &data.data);
        prop_assert_eq!(back.global_address, Some(address));
        prop_assert_eq!(&back.streams, &data.streams);
        prop_assert_eq!(&back.backpointers, &data.backpointers);
        prop_assert_eq!(back.rank, data.rank);
        prop_assert_eq!(back.checkpoint, data.checkpoint);
    }

    #[test]
    fn reencoding_is_deterministic(data in arb_log_data(), address in any::<u64>()) {
        let first = data.to_wire(address).encode_to_vec();
        let decoded = LogEntry::decode(&first[..]).unwrap();
        let second = decoded.encode_to_vec();
        prop_assert_eq!(first, second);
    }
}
