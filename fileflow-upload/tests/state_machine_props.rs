use chrono::{Duration, TimeZone, Utc};
use fileflow_core::TenantId;
use proptest::prelude::*;

use fileflow_upload::{
    AccessType, ObjectLocation, SessionDetail, SessionId, SessionStatus, UploadError, UploadSession,
};

#[derive(Debug, Clone)]
enum Op {
    Activate,
    RecordPart(u32),
    Complete,
    Abort,
    Expire,
    Advance(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Activate),
        (1u32..4).prop_map(Op::RecordPart),
        Just(Op::Complete),
        Just(Op::Abort),
        Just(Op::Expire),
        (1i64..120).prop_map(Op::Advance),
    ]
}

fn session(multipart: bool) -> UploadSession {
    let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let detail = if multipart {
        SessionDetail::Multipart {
            upload_handle: None,
            part_size: 5,
            part_count: 3,
            final_etag: None,
        }
    } else {
        SessionDetail::Single {
            presigned_url: None,
            url_expires_at: None,
            etag: None,
        }
    };
    UploadSession {
        id: SessionId::new(),
        tenant_id: TenantId::new("t"),
        idempotency_key: "k".into(),
        file_name: "f".into(),
        content_type: "application/octet-stream".into(),
        location: ObjectLocation::new("b", "k"),
        access: AccessType::Internal,
        declared_size: 15,
        purpose: None,
        source: None,
        callback_url: None,
        status: SessionStatus::Preparing,
        detail,
        created_at: now,
        updated_at: now,
        expires_at: now + Duration::minutes(60),
        completed_at: None,
        abort_reason: None,
        version: 1,
    }
}

proptest! {
    #[test]
    fn transitions_only_follow_the_lifecycle(multipart in any::<bool>(), ops in prop::collection::vec(op(), 1..40)) {
        let mut current = session(multipart);
        let mut now = current.created_at;

        for op in ops {
            let before = current.status;
            let result = match &op {
                Op::Advance(minutes) => {
                    now += Duration::minutes(*minutes);
                    continue;
                }
                Op::Activate if multipart => current.activate_multipart("h".into(), now),
                Op::Activate => current.activate_single("u".into(), now + Duration::minutes(15), now),
                Op::RecordPart(n) => current.record_part(*n, now),
                Op::Complete => current.complete(Some("etag".into()), now),
                Op::Abort => current.abort("client", now),
                Op::Expire => current.expire(now),
            };

            match result {
                Ok(transition) => {
                    let after = transition.session.status;
                    prop_assert!(after == before || before.can_transition_to(after),
                        "{before} -> {after} via {op:?}");
                    if after == SessionStatus::Completed && before != SessionStatus::Completed {
                        prop_assert_eq!(before, SessionStatus::Active);
                    }
                    if after == SessionStatus::Expired && before != SessionStatus::Expired {
                        prop_assert!(now > current.expires_at);
                    }
                    current = transition.session;
                }
                Err(e) => {
                    let is_concurrent_modification = matches!(e, UploadError::ConcurrentModification { .. });
                    prop_assert!(!is_concurrent_modification);
                }
            }

            if before.is_terminal() {
                prop_assert_eq!(current.status, before);
            }
        }
    }

    #[test]
    fn completed_sessions_reject_every_other_transition(minutes in 0i64..200) {
        let start = session(true);
        let now = start.created_at;
        let active = start.activate_multipart("h".into(), now).unwrap().session;
        let done = active.complete(None, now).unwrap().session;
        let later = now + Duration::minutes(minutes);

        prop_assert!(done.abort("x", later).is_err());
        prop_assert!(done.expire(later).is_err());
        prop_assert!(done.complete(None, later).is_err());
        prop_assert!(done.activate_multipart("h2".into(), later).is_err());
        prop_assert!(done.record_part(1, later).is_err());
    }
}
