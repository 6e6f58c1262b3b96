//! Reducer-level lifecycle scenarios driven through the test harness.

#![allow(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use purchase_session_core::{
    AttemptResolution, Catalog, CatalogError, GatewayError, Offer, ProductId, ProtocolViolation,
    PurchaseAttempt, PurchaseFailure, PurchaseRequestError, Reducer, RetryPolicy, SessionAction,
    SessionEnvironment, SessionError, SessionOperation, SessionPhase, SessionReducer, SessionState,
    StoreGateway,
};
use purchase_session_testing::{
    GatewayCall, MockGateway, PurchaseScript, ReducerTest, purchase_record, test_clock,
};

fn harness(gateway: &Arc<MockGateway>) -> ReducerTest<SessionReducer> {
    let env = SessionEnvironment::new(Arc::clone(gateway) as Arc<dyn StoreGateway>)
        .with_clock(test_clock())
        .with_finalize_retry(RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        });
    ReducerTest::new(SessionReducer, SessionState::new(), env)
}

async fn connected(gateway: &Arc<MockGateway>) -> ReducerTest<SessionReducer> {
    let mut test = harness(gateway);
    test.send(SessionAction::Start);
    test.run_until_settled().await;
    assert_eq!(test.state().phase, SessionPhase::Connected);
    test
}

async fn catalog_ready(gateway: &Arc<MockGateway>) -> ReducerTest<SessionReducer> {
    let mut test = connected(gateway).await;
    test.send(SessionAction::LoadCatalog {
        product_ids: vec![ProductId::from("sub_a"), ProductId::from("sub_b")],
    });
    test.run_until_settled().await;
    assert_eq!(test.state().phase, SessionPhase::CatalogReady);
    test
}

#[tokio::test]
async fn start_connects() {
    let gateway = MockGateway::new();
    let mut test = harness(&gateway);

    test.send(SessionAction::Start);
    assert_eq!(test.state().phase, SessionPhase::Connecting);
    assert_eq!(test.state().epoch, 1);

    test.run_until_settled().await;
    assert_eq!(test.state().phase, SessionPhase::Connected);
}

#[tokio::test]
async fn start_rejected_while_running() {
    let gateway = MockGateway::new();
    let mut test = connected(&gateway).await;

    test.send(SessionAction::Start);
    test.run_until_settled().await;
    assert_eq!(test.state().phase, SessionPhase::Connected);
    assert_eq!(test.state().epoch, 1);
    assert!(matches!(
        test.state().last_error,
        Some(SessionError::Protocol(ProtocolViolation {
            operation: SessionOperation::Start,
            phase: SessionPhase::Connected,
        }))
    ));
}

#[tokio::test]
async fn connect_failure_returns_to_disconnected() {
    let gateway = MockGateway::new();
    gateway.script_connect(Err(GatewayError::new("store unreachable")));
    let mut test = harness(&gateway);

    test.send(SessionAction::Start);
    test.run_until_settled().await;
    assert_eq!(test.state().phase, SessionPhase::Disconnected);
    assert!(matches!(
        test.state().last_error,
        Some(SessionError::Connection { .. })
    ));
}

#[tokio::test]
async fn load_catalog_requires_connection() {
    let gateway = MockGateway::new();
    let mut test = harness(&gateway);

    test.send(SessionAction::LoadCatalog {
        product_ids: vec![ProductId::from("sub_a")],
    });
    test.run_until_settled().await;
    assert_eq!(test.state().phase, SessionPhase::Disconnected);
    assert!(matches!(
        test.state().last_error,
        Some(SessionError::Protocol(_))
    ));
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn empty_product_ids_never_reach_the_gateway() {
    let gateway = MockGateway::new();
    let mut test = connected(&gateway).await;

    test.send(SessionAction::LoadCatalog {
        product_ids: vec![],
    });
    test.run_until_settled().await;
    assert_eq!(test.state().phase, SessionPhase::Connected);
    assert!(matches!(
        test.state().last_error,
        Some(SessionError::Catalog(CatalogError::EmptyProductIds))
    ));
    assert!(
        !gateway
            .calls()
            .iter()
            .any(|call| matches!(call, GatewayCall::QueryCatalog(_)))
    );
}

#[tokio::test]
async fn catalog_failure_reverts_without_catalog() {
    let gateway = MockGateway::new();
    gateway.script_catalog(Err(GatewayError::new("query failed")));
    let mut test = connected(&gateway).await;

    test.send(SessionAction::LoadCatalog {
        product_ids: vec![ProductId::from("sub_a")],
    });
    test.run_until_settled().await;
    assert_eq!(test.state().phase, SessionPhase::Connected);
    assert!(test.state().catalog.is_none());
}

#[tokio::test]
async fn reload_failure_keeps_previous_catalog() {
    let gateway = MockGateway::new();
    let mut test = catalog_ready(&gateway).await;

    gateway.script_catalog(Err(GatewayError::new("query failed")));
    test.send(SessionAction::LoadCatalog {
        product_ids: vec![ProductId::from("sub_a")],
    });
    test.run_until_settled().await;
    assert_eq!(test.state().phase, SessionPhase::CatalogReady);
    assert_eq!(test.state().offers().len(), 2);
    assert!(matches!(
        test.state().last_error,
        Some(SessionError::Catalog(CatalogError::Query(_)))
    ));
}

#[tokio::test]
async fn unknown_product_rejected_before_the_gateway() {
    let gateway = MockGateway::new();
    let mut test = catalog_ready(&gateway).await;

    test.send(SessionAction::RequestPurchase {
        product_id: ProductId::from("sub_z"),
        request_id: 1,
    });
    test.run_until_settled().await;
    assert_eq!(test.state().phase, SessionPhase::CatalogReady);
    assert!(matches!(
        test.state().last_error,
        Some(SessionError::PurchaseRequest(
            PurchaseRequestError::UnknownProduct { .. }
        ))
    ));
    assert!(
        !gateway
            .calls()
            .iter()
            .any(|call| matches!(call, GatewayCall::RequestPurchase(_)))
    );
}

#[tokio::test]
async fn direct_response_resolves_and_finalizes_before_success() {
    let gateway = MockGateway::new();
    let mut test = catalog_ready(&gateway).await;

    test.send(SessionAction::RequestPurchase {
        product_id: ProductId::from("sub_a"),
        request_id: 1,
    });
    assert_eq!(test.state().phase, SessionPhase::RequestingPurchase);
    test.run_until_settled().await;

    assert_eq!(test.state().phase, SessionPhase::PurchaseSucceeded);
    let finalize_calls = gateway
        .calls()
        .iter()
        .filter(|call| matches!(call, GatewayCall::Finalize(_)))
        .count();
    assert_eq!(finalize_calls, 1);
    assert!(matches!(
        test.state().attempt,
        Some(PurchaseAttempt {
            resolution: Some(AttemptResolution::Succeeded(_)),
            ..
        })
    ));
}

#[tokio::test]
async fn duplicate_record_is_finalized_but_resolves_nothing() {
    let gateway = MockGateway::new();
    let mut test = catalog_ready(&gateway).await;
    let epoch = test.state().epoch;

    // Listener wins the race, then the direct response delivers the
    // same transaction again.
    test.send(SessionAction::RequestPurchase {
        product_id: ProductId::from("sub_a"),
        request_id: 1,
    });
    let record = purchase_record("sub_a", "txn-1");
    test.send(SessionAction::PurchaseUpdated {
        epoch,
        record: record.clone(),
    });
    test.send(SessionAction::PurchaseResponse {
        epoch,
        request_id: 1,
        result: Ok(record.clone()),
    });
    test.run_until_settled().await;

    assert_eq!(test.state().phase, SessionPhase::PurchaseSucceeded);
    match &test.state().attempt {
        Some(PurchaseAttempt {
            resolution: Some(AttemptResolution::Succeeded(resolved)),
            ..
        }) => assert_eq!(resolved.transaction_id, "txn-1"),
        other => panic!("unexpected attempt: {other:?}"),
    }
    // Both deliveries were acknowledged.
    let finalize_calls = gateway
        .calls()
        .iter()
        .filter(|call| matches!(call, GatewayCall::Finalize(_)))
        .count();
    assert!(finalize_calls >= 2);
}

#[tokio::test]
async fn late_response_from_a_settled_attempt_does_not_touch_the_next() {
    let gateway = MockGateway::new();
    gateway.script_purchase(PurchaseScript::Defer);
    gateway.script_purchase(PurchaseScript::Defer);
    let mut test = catalog_ready(&gateway).await;
    let epoch = test.state().epoch;

    // Attempt 1 is settled by the listener while its direct call hangs.
    test.send(SessionAction::RequestPurchase {
        product_id: ProductId::from("sub_a"),
        request_id: 1,
    });
    test.send(SessionAction::PurchaseUpdated {
        epoch,
        record: purchase_record("sub_a", "txn-1"),
    });
    test.run_until_settled().await;
    assert_eq!(test.state().phase, SessionPhase::PurchaseSucceeded);

    // Attempt 2 goes out; attempt 1's slow direct call finally fails.
    test.send(SessionAction::RequestPurchase {
        product_id: ProductId::from("sub_a"),
        request_id: 2,
    });
    test.send(SessionAction::PurchaseResponse {
        epoch,
        request_id: 1,
        result: Err(GatewayError::new("late failure of request 1")),
    });
    assert_eq!(test.state().phase, SessionPhase::RequestingPurchase);
    match &test.state().attempt {
        Some(attempt) => {
            assert_eq!(attempt.request_id, 2);
            assert!(attempt.is_pending());
        }
        None => panic!("the second attempt is gone"),
    }

    // A late duplicate success is acknowledged but resolves nothing either.
    test.send(SessionAction::PurchaseResponse {
        epoch,
        request_id: 1,
        result: Ok(purchase_record("sub_a", "txn-old")),
    });
    test.run_until_settled().await;
    assert_eq!(test.state().phase, SessionPhase::RequestingPurchase);
    assert!(
        test.state()
            .attempt
            .as_ref()
            .is_some_and(PurchaseAttempt::is_pending)
    );
    assert!(
        gateway
            .calls()
            .iter()
            .any(|call| matches!(call, GatewayCall::Finalize(record) if record.transaction_id == "txn-old"))
    );
}

#[tokio::test]
async fn unsolicited_record_is_finalized_without_an_attempt() {
    let gateway = MockGateway::new();
    let mut test = catalog_ready(&gateway).await;
    let epoch = test.state().epoch;

    // A renewal arrives with no purchase in flight.
    test.send(SessionAction::PurchaseUpdated {
        epoch,
        record: purchase_record("sub_b", "txn-renewal"),
    });
    test.run_until_settled().await;

    assert_eq!(test.state().phase, SessionPhase::CatalogReady);
    assert!(test.state().attempt.is_none());
    assert!(test.state().last_error.is_none());
    assert!(
        gateway
            .calls()
            .iter()
            .any(|call| matches!(call, GatewayCall::Finalize(record) if record.transaction_id == "txn-renewal"))
    );
}

#[tokio::test]
async fn error_listener_fails_the_attempt() {
    let gateway = MockGateway::new();
    gateway.script_purchase(PurchaseScript::Defer);
    let mut test = catalog_ready(&gateway).await;
    let epoch = test.state().epoch;

    test.send(SessionAction::RequestPurchase {
        product_id: ProductId::from("sub_a"),
        request_id: 1,
    });
    test.send(SessionAction::PurchaseErrored {
        epoch,
        failure: PurchaseFailure {
            product_id: Some(ProductId::from("sub_a")),
            code: Some("E_USER_CANCELLED".to_string()),
            message: "user cancelled".to_string(),
        },
    });

    assert_eq!(test.state().phase, SessionPhase::PurchaseFailed);
    assert!(matches!(
        test.state().last_error,
        Some(SessionError::PurchaseNotification(_))
    ));
}

#[tokio::test]
async fn unmatched_error_is_recorded_out_of_band() {
    let gateway = MockGateway::new();
    let mut test = catalog_ready(&gateway).await;
    let epoch = test.state().epoch;

    test.send(SessionAction::PurchaseErrored {
        epoch,
        failure: PurchaseFailure {
            product_id: Some(ProductId::from("sub_b")),
            code: None,
            message: "orphaned failure".to_string(),
        },
    });

    assert_eq!(test.state().phase, SessionPhase::CatalogReady);
    assert!(test.state().last_error.is_none());
    assert_eq!(test.state().out_of_band_errors.len(), 1);
}

#[tokio::test]
async fn stop_cancels_the_pending_attempt() {
    let gateway = MockGateway::new();
    gateway.script_purchase(PurchaseScript::Defer);
    let mut test = catalog_ready(&gateway).await;

    test.send(SessionAction::RequestPurchase {
        product_id: ProductId::from("sub_a"),
        request_id: 1,
    });
    test.send(SessionAction::Stop);

    assert_eq!(test.state().phase, SessionPhase::Disconnected);
    assert_eq!(test.state().epoch, 2);
    assert!(test.state().catalog.is_none());
    assert!(matches!(
        test.state().attempt,
        Some(PurchaseAttempt {
            resolution: Some(AttemptResolution::Cancelled),
            ..
        })
    ));
}

#[tokio::test]
async fn stale_success_after_stop_is_finalized_without_phase_change() {
    let gateway = MockGateway::new();
    gateway.script_purchase(PurchaseScript::Defer);
    let mut test = catalog_ready(&gateway).await;
    let old_epoch = test.state().epoch;

    test.send(SessionAction::RequestPurchase {
        product_id: ProductId::from("sub_a"),
        request_id: 1,
    });
    test.send(SessionAction::Stop);

    // The store resolves the detached purchase after teardown.
    test.send(SessionAction::PurchaseUpdated {
        epoch: old_epoch,
        record: purchase_record("sub_a", "txn-late"),
    });
    test.run_until_settled().await;

    assert_eq!(test.state().phase, SessionPhase::Disconnected);
    assert!(matches!(
        test.state().attempt,
        Some(PurchaseAttempt {
            resolution: Some(AttemptResolution::Cancelled),
            ..
        })
    ));
    assert!(
        gateway
            .calls()
            .iter()
            .any(|call| matches!(call, GatewayCall::Finalize(record) if record.transaction_id == "txn-late"))
    );
}

#[tokio::test]
async fn finalize_retries_until_success() {
    let gateway = MockGateway::new();
    gateway.script_finalize(Err(GatewayError::new("transient")));
    gateway.script_finalize(Err(GatewayError::new("transient")));
    let mut test = catalog_ready(&gateway).await;

    test.send(SessionAction::RequestPurchase {
        product_id: ProductId::from("sub_a"),
        request_id: 1,
    });
    test.run_until_settled().await;

    assert_eq!(test.state().phase, SessionPhase::PurchaseSucceeded);
    assert!(test.state().last_error.is_none());
    let finalize_calls = gateway
        .calls()
        .iter()
        .filter(|call| matches!(call, GatewayCall::Finalize(_)))
        .count();
    assert_eq!(finalize_calls, 3);
}

#[tokio::test]
async fn exhausted_finalize_still_reports_success() {
    let gateway = MockGateway::new();
    for _ in 0..3 {
        gateway.script_finalize(Err(GatewayError::new("persistent")));
    }
    let mut test = catalog_ready(&gateway).await;

    test.send(SessionAction::RequestPurchase {
        product_id: ProductId::from("sub_a"),
        request_id: 1,
    });
    test.run_until_settled().await;

    assert_eq!(test.state().phase, SessionPhase::PurchaseSucceeded);
    assert!(matches!(
        test.state().last_error,
        Some(SessionError::Finalization { .. })
    ));
}

mod resolution_race {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Delivery {
        Success(&'static str),
        Failure,
    }

    fn deliveries() -> impl Strategy<Value = Vec<Delivery>> {
        prop::collection::vec(
            prop_oneof![
                Just(Delivery::Success("txn-1")),
                Just(Delivery::Success("txn-2")),
                Just(Delivery::Failure),
            ],
            1..6,
        )
    }

    proptest! {
        /// No interleaving of success and failure deliveries writes the
        /// resolution slot more than once.
        #[test]
        fn resolution_is_written_at_most_once(sequence in deliveries()) {
            let gateway = MockGateway::new();
            let env = SessionEnvironment::new(
                Arc::clone(&gateway) as Arc<dyn StoreGateway>
            )
            .with_clock(test_clock());
            let reducer = SessionReducer;

            let mut state = SessionState {
                phase: SessionPhase::CatalogReady,
                epoch: 1,
                catalog: Some(Catalog::new(vec![Offer::new(ProductId::from("sub_a"))])),
                ..SessionState::default()
            };
            drop(reducer.reduce(
                &mut state,
                SessionAction::RequestPurchase {
                    product_id: ProductId::from("sub_a"),
                    request_id: 1,
                },
                &env,
            ));

            let mut first = None;
            for delivery in sequence {
                let action = match delivery {
                    Delivery::Success(txn) => SessionAction::PurchaseUpdated {
                        epoch: 1,
                        record: purchase_record("sub_a", txn),
                    },
                    Delivery::Failure => SessionAction::PurchaseErrored {
                        epoch: 1,
                        failure: PurchaseFailure {
                            product_id: Some(ProductId::from("sub_a")),
                            code: None,
                            message: "declined".to_string(),
                        },
                    },
                };
                drop(reducer.reduce(&mut state, action, &env));
                let resolution = state
                    .attempt
                    .as_ref()
                    .and_then(|attempt| attempt.resolution.clone());
                prop_assert!(resolution.is_some());
                match &first {
                    None => first = resolution,
                    Some(expected) => prop_assert_eq!(resolution.as_ref(), Some(expected)),
                }
            }
        }
    }
}
