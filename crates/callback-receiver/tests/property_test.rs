//! Property-based tests for event decoding, authentication and dispatch.
//!
//! Runs in memory; the HTTP surface is driven through `tower::ServiceExt`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode};
use callback_receiver::{
    AuthGuard, AuthRejection, CallbackReceiver, ChannelCredentials, DispatchStrategy, Dispatcher,
    ErrorInvariant, EventBatch, EventRecord, EventType, HandlerSet, RecordFn,
};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use serde_json::json;
use tower::ServiceExt;

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 64,
        failure_persistence: None,
        ..ProptestConfig::default()
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn event_type_strategy() -> impl Strategy<Value = EventType> {
    prop::sample::select(EventType::ALL.to_vec())
}

/// A subset of event types, each included independently.
fn registered_types_strategy() -> impl Strategy<Value = BTreeSet<EventType>> {
    prop::array::uniform9(any::<bool>()).prop_map(|mask| {
        EventType::ALL
            .iter()
            .zip(mask)
            .filter_map(|(t, on)| on.then_some(*t))
            .collect()
    })
}

/// A wire record: type ordinal, message id and an optional error.
fn wire_record_strategy() -> impl Strategy<Value = serde_json::Value> {
    (
        0i64..9,
        prop::string::string_regex("[a-zA-Z0-9_-]{1,32}").unwrap(),
        prop::option::of((any::<i32>(), "[a-z ]{0,40}")),
    )
        .prop_map(|(ordinal, msg_id, error)| {
            let mut record = json!({
                "type": ordinal,
                "msgid": msg_id,
                "channelkey": "channel",
                "sent_time": 1_700_000_000,
            });
            if let Some((code, message)) = error {
                record["error"] = json!({"code": code, "message": message});
            }
            record
        })
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn prop_ordinal_round_trip(ordinal in 0i64..9) {
        let event_type = EventType::from_ordinal(ordinal).unwrap();
        prop_assert_eq!(i64::from(event_type.ordinal()), ordinal);
        prop_assert_eq!(event_type.as_str().parse::<EventType>().unwrap(), event_type);
    }

    #[test]
    fn prop_out_of_range_ordinal_rejected(ordinal in prop_oneof![i64::MIN..0, 9i64..i64::MAX]) {
        prop_assert!(EventType::from_ordinal(ordinal).is_err());
    }

    #[test]
    fn prop_records_decode_whether_or_not_error_matches_type(
        records in prop::collection::vec(wire_record_strategy(), 0..20)
    ) {
        let raw = Bytes::from(serde_json::to_vec(&records).unwrap());
        let batch = EventBatch::parse(raw.clone(), 1000).unwrap();

        prop_assert_eq!(batch.len(), records.len());
        prop_assert_eq!(batch.raw(), &raw);
        for (record, wire) in batch.iter().zip(&records) {
            prop_assert_eq!(i64::from(record.event_type.ordinal()), wire["type"].as_i64().unwrap());
            let has_error = wire.get("error").is_some();
            let expected = match (record.event_type.is_failure(), has_error) {
                (true, false) => Some(ErrorInvariant::MissingError),
                (false, true) => Some(ErrorInvariant::UnexpectedError),
                _ => None,
            };
            prop_assert_eq!(record.error_invariant(), expected);
        }
    }

    #[test]
    fn prop_arbitrary_bytes_never_panic(raw in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = EventBatch::parse(Bytes::from(raw), 1000);
    }

    #[test]
    fn prop_only_exact_credentials_pass(
        key in "[a-z0-9]{1,16}",
        secret in "[a-z0-9]{1,16}",
        other in "[a-z0-9]{1,16}",
    ) {
        let guard = AuthGuard::new(ChannelCredentials::new(&key, &secret));

        prop_assert_eq!(guard.authenticate(Some((key.as_str(), secret.as_str()))), Ok(()));
        prop_assert_eq!(guard.authenticate(None), Err(AuthRejection::MissingCredentials));
        if other != secret {
            prop_assert!(guard.authenticate(Some((key.as_str(), other.as_str()))).is_err());
        }
        if other != key {
            prop_assert!(guard.authenticate(Some((other.as_str(), secret.as_str()))).is_err());
        }
    }

    #[test]
    fn prop_verification_echoes_challenge(challenge in "[a-zA-Z0-9]{1,64}") {
        let router = CallbackReceiver::builder()
            .with_auth(false)
            .without_default_logger()
            .build()
            .unwrap()
            .router();

        let uri = format!("/callback?echostr={challenge}");
        let (status, body) = runtime().block_on(async move {
            let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let response = router.oneshot(request).await.unwrap();
            let status = response.status();
            let body = response.into_body().collect().await.unwrap().to_bytes();
            (status, body)
        });

        prop_assert_eq!(status, StatusCode::OK);
        prop_assert_eq!(body.as_ref(), challenge.as_bytes());
    }

    #[test]
    fn prop_each_registered_record_dispatched_once(
        registered in registered_types_strategy(),
        types in prop::collection::vec(event_type_strategy(), 0..30),
    ) {
        // (handler slot, record type) for every invocation
        let calls: Arc<Mutex<Vec<(EventType, EventType)>>> = Arc::default();
        let mut handlers = HandlerSet::default();
        for event_type in &registered {
            let calls = calls.clone();
            let slot = *event_type;
            handlers.insert(slot, Arc::new(RecordFn(move |record: EventRecord| {
                let calls = calls.clone();
                async move {
                    calls.lock().push((slot, record.event_type));
                    anyhow::Ok(())
                }
            })));
        }
        let dispatcher = Dispatcher::new(DispatchStrategy::PerType(handlers), Duration::from_secs(5));

        let records: Vec<EventRecord> = types
            .iter()
            .enumerate()
            .map(|(i, t)| EventRecord::new(*t, &format!("m-{i}")))
            .collect();
        let expected = types.iter().filter(|t| registered.contains(*t)).count();
        let batch = EventBatch::new(records, Bytes::new());

        let report = runtime().block_on(dispatcher.dispatch_and_wait(batch));

        prop_assert_eq!(report.records, types.len());
        prop_assert_eq!(report.invoked, expected);
        prop_assert_eq!(report.skipped, types.len() - expected);
        prop_assert_eq!(report.failed, 0);

        let calls = calls.lock();
        prop_assert_eq!(calls.len(), expected);
        for (slot, record_type) in calls.iter() {
            prop_assert_eq!(slot, record_type);
        }
        for event_type in EventType::ALL {
            let sent = types.iter().filter(|t| **t == event_type && registered.contains(*t)).count();
            let handled = calls.iter().filter(|(slot, _)| *slot == event_type).count();
            prop_assert_eq!(handled, sent);
        }

        let distinct: BTreeSet<_> = dispatcher.strategy().registered_types().into_iter().collect();
        prop_assert_eq!(distinct, registered);
    }
}
