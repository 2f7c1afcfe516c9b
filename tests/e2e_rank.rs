//! E2E: ranked overwrite policy.

mod support;

use streamlog::{DataRank, LogData, LogError};
use support::open_log;
use uuid::Uuid;

fn ranked(payload: &[u8], rank: u64) -> LogData {
    LogData::new(payload.to_vec()).with_rank(DataRank {
        rank,
        uuid: Uuid::new_v4(),
    })
}

#[test]
fn higher_rank_overwrites_lower() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path(), 4, 1);

    log.append(0, &ranked(b"v1", 1)).unwrap();
    log.append(0, &ranked(b"v2", 2)).unwrap();
    assert_eq!(log.read(0).unwrap().unwrap().data, b"v2");

    let err = log.append(0, &ranked(b"v3", 1)).unwrap_err();
    assert!(matches!(err, LogError::DataOutranked { address: 0 }));
    assert_eq!(log.read(0).unwrap().unwrap().data, b"v2");
}

#[test]
fn equal_rank_same_payload_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path(), 4, 1);

    log.append(3, &ranked(b"same", 5)).unwrap();
    log.append(3, &ranked(b"same", 5)).unwrap();
    assert_eq!(log.read(3).unwrap().unwrap().data, b"same");
}

#[test]
fn equal_rank_different_payload_is_value_adopted() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path(), 4, 1);

    log.append(1, &ranked(b"decided", 5)).unwrap();
    let err = log.append(1, &ranked(b"challenger", 5)).unwrap_err();
    match err {
        LogError::ValueAdopted { address, adopted } => {
            assert_eq!(address, 1);
            assert_eq!(adopted.data, b"decided");
        }
        other => panic!("expected ValueAdopted, got {other:?}"),
    }
    assert_eq!(log.read(1).unwrap().unwrap().data, b"decided");
}

#[test]
fn ranked_append_adopts_unranked_record() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path(), 4, 1);

    log.append(2, &LogData::new(b"plain".to_vec())).unwrap();
    log.append(2, &ranked(b"ranked", 1)).unwrap();
    let got = log.read(2).unwrap().unwrap();
    assert_eq!(got.data, b"ranked");
    assert_eq!(got.rank.unwrap().rank, 1);
}

#[test]
fn unranked_append_never_overwrites() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path(), 4, 1);

    log.append(0, &ranked(b"v1", 9)).unwrap();
    assert!(matches!(
        log.append(0, &LogData::new(b"plain".to_vec())),
        Err(LogError::Overwrite(0))
    ));
}
