//! Response Tests
//!
//! Tests for status mapping and payload helpers.

use harborkv::cluster::{Version, Versioned};
use harborkv::error::HarborError;
use harborkv::protocol::{Response, Status};

fn sibling(value: &[u8], origin: u64) -> Versioned {
    Versioned {
        key: b"k".to_vec(),
        value: Some(value.to_vec()),
        version: Version {
            counter: 1,
            vector: [(origin, 1)].into_iter().collect(),
            timestamp: 10,
            origin,
        },
    }
}

#[test]
fn test_from_result_ok_and_not_found() {
    let ok = Response::from_result(Ok(Some(b"v".to_vec())));
    assert_eq!(ok.status, Status::Ok);
    assert_eq!(ok.payload, Some(b"v".to_vec()));

    let missing = Response::from_result(Err(HarborError::KeyNotFound));
    assert_eq!(missing.status, Status::NotFound);
    assert!(missing.payload.is_none());
}

#[test]
fn test_from_result_error_text() {
    let response = Response::from_result(Err(HarborError::QuorumUnavailable {
        required: 2,
        acked: 1,
    }));

    assert_eq!(response.status, Status::Error);
    assert!(response.text().contains("quorum unavailable"));
}

#[test]
fn test_not_leader_hint() {
    let response = Response::from_result(Err(HarborError::NotLeader { leader: Some(3) }));
    assert_eq!(response.status, Status::NotLeader);
    assert_eq!(response.leader_hint(), Some(3));

    let unknown = Response::not_leader(None);
    assert_eq!(unknown.leader_hint(), None);

    // Only NOT_LEADER responses carry a hint
    assert_eq!(Response::ok(Some(b"3".to_vec())).leader_hint(), None);
}

#[test]
fn test_conflict_carries_siblings() {
    let siblings = vec![sibling(b"a", 1), sibling(b"b", 2)];
    let response = Response::from_result(Err(HarborError::ConcurrentWriteConflict {
        siblings: siblings.clone(),
    }));

    assert_eq!(response.status, Status::Conflict);
    assert_eq!(response.siblings().unwrap(), siblings);
}

#[test]
fn test_siblings_empty_for_other_statuses() {
    assert!(Response::ok(None).siblings().unwrap().is_empty());
    assert!(Response::error("x").siblings().unwrap().is_empty());
}

#[test]
fn test_text_helpers() {
    assert_eq!(Response::error("bad request").text(), "bad request");
    assert_eq!(Response::ok(None).text(), "");
}
