//! Resolution of unknown capture outcomes: the background reconciler and
//! provider webhooks.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/expect

mod common;

use common::{harness, key, line, request, Harness};
use fulfillment::{
    CaptureOutcome, MockBehavior, Money, OrderError, OrderId, OrderStatus, PaymentStatus, ReconciliationReport,
    RefundStatus, ReservationsState, ShipmentItem, ShipmentStatus, WebhookOutcome,
};
use serde_json::json;

async fn ambiguous_checkout(h: &Harness, behavior: MockBehavior) -> OrderId {
    h.stock("sku-1", "w1", 5).await;
    h.gateway.set_capture_behavior(behavior);
    let cart = h.cart("alice", vec![line("sku-1", 30, 2)]).await;
    match h.services.orchestrator.checkout(cart.id, request(&["w1"])).await {
        Err(OrderError::AmbiguousPaymentOutcome { order_id }) => {
            assert!(h.services.carts.get(cart.id).await.is_err(), "an ambiguous checkout discards the cart");
            order_id
        },
        other => panic!("expected an ambiguous outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn reconciler_confirms_a_capture_whose_response_was_lost() {
    let h = harness();
    let order_id = ambiguous_checkout(&h, MockBehavior::LoseResponse).await;
    assert_eq!(h.services.ledger.levels(&key("sku-1", "w1")).await.reserved, 2);

    let report = h.services.reconciler.run_once().await;

    assert_eq!(report, ReconciliationReport {
        examined: 1,
        confirmed: 1,
        ..ReconciliationReport::default()
    });
    let order = h.services.orders.require(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.reservations_state, ReservationsState::Committed);
    let levels = h.services.ledger.levels(&key("sku-1", "w1")).await;
    assert_eq!((levels.available, levels.reserved), (3, 0));

    let again = h.services.reconciler.run_once().await;
    assert_eq!(again.examined, 0);
}

#[tokio::test]
async fn unknown_capture_expires_after_the_pending_lifetime() {
    let h = harness();
    let order_id = ambiguous_checkout(&h, MockBehavior::Hang).await;

    let early = h.services.reconciler.run_once().await;
    assert_eq!(early.unresolved, 1);
    assert_eq!(h.services.ledger.levels(&key("sku-1", "w1")).await.reserved, 2);

    h.clock.advance(chrono::Duration::minutes(31));
    let late = h.services.reconciler.run_once().await;

    assert_eq!(late.expired, 1);
    let order = h.services.orders.require(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.payment_status, PaymentStatus::Failed);
    assert_eq!(order.reservations_state, ReservationsState::Released);
    let levels = h.services.ledger.levels(&key("sku-1", "w1")).await;
    assert_eq!((levels.available, levels.reserved), (5, 0));
}

#[tokio::test]
async fn lookup_failures_are_retried_within_a_pass() {
    let h = harness();
    let order_id = ambiguous_checkout(&h, MockBehavior::LoseResponse).await;
    h.gateway.fail_next_lookups(2);

    let report = h.services.reconciler.run_once().await;

    assert_eq!(report.confirmed, 1);
    assert_eq!(
        h.services.orders.require(order_id).await.unwrap().status,
        OrderStatus::Confirmed
    );
}

#[tokio::test]
async fn persistent_lookup_failure_leaves_the_order_for_the_next_pass() {
    let h = harness();
    let order_id = ambiguous_checkout(&h, MockBehavior::LoseResponse).await;
    h.gateway.fail_next_lookups(10);

    let report = h.services.reconciler.run_once().await;

    assert_eq!(report.unresolved, 1);
    let order = h.services.orders.require(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.reservations_state, ReservationsState::Held);
}

#[tokio::test]
async fn capture_webhook_resolves_an_ambiguous_checkout_once() {
    let h = harness();
    let order_id = ambiguous_checkout(&h, MockBehavior::Hang).await;
    let order = h.services.orders.require(order_id).await.unwrap();
    let reference = h
        .gateway
        .record_capture(&order.idempotency_key, CaptureOutcome::Succeeded);
    let payload = json!({ "idempotency_key": order.idempotency_key.as_str() });

    let first = h
        .services
        .webhooks
        .payment_webhook("payment.captured", &reference, &payload)
        .await
        .unwrap();
    let second = h
        .services
        .webhooks
        .payment_webhook("payment.captured", &reference, &payload)
        .await
        .unwrap();

    assert_eq!(first, WebhookOutcome::Processed);
    assert_eq!(second, WebhookOutcome::Duplicate);
    let order = h.services.orders.require(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.payments[0].provider_reference.as_deref(), Some(reference.as_str()));
    assert_eq!(h.services.orders.by_provider_reference(&reference).await, Some(order_id));
    assert_eq!(h.services.ledger.levels(&key("sku-1", "w1")).await.reserved, 0);
}

#[tokio::test]
async fn decline_webhook_cancels_and_releases() {
    let h = harness();
    let order_id = ambiguous_checkout(&h, MockBehavior::Hang).await;
    let order = h.services.orders.require(order_id).await.unwrap();
    let payload = json!({
        "idempotency_key": order.idempotency_key.as_str(),
        "reason": "insufficient funds",
    });

    h.services
        .webhooks
        .payment_webhook("payment.failed", "ch_declined", &payload)
        .await
        .unwrap();

    let order = h.services.orders.require(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.payments[0].failure_reason.as_deref(), Some("insufficient funds"));
    assert_eq!(h.services.ledger.levels(&key("sku-1", "w1")).await.reserved, 0);
}

#[tokio::test]
async fn unmatched_webhook_is_not_remembered() {
    let h = harness();
    let payload = json!({});

    let first = h
        .services
        .webhooks
        .payment_webhook("payment.captured", "ch_unknown", &payload)
        .await;
    let second = h
        .services
        .webhooks
        .payment_webhook("payment.captured", "ch_unknown", &payload)
        .await;
    let ignored = h
        .services
        .webhooks
        .payment_webhook("customer.updated", "cus_1", &payload)
        .await
        .unwrap();

    assert!(matches!(first, Err(OrderError::Validation(_))));
    assert!(matches!(second, Err(OrderError::Validation(_))), "a failed delivery is retried, not deduplicated");
    assert_eq!(ignored, WebhookOutcome::Ignored);
}

#[tokio::test]
async fn late_capture_on_a_cancelled_order_is_refunded() {
    let h = harness();
    let order_id = ambiguous_checkout(&h, MockBehavior::Hang).await;

    let cancelled = h.services.orchestrator.cancel_order(order_id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.reservations_state, ReservationsState::Released);
    assert_eq!(h.services.ledger.levels(&key("sku-1", "w1")).await.reserved, 0);

    let reference = h
        .gateway
        .record_capture(&cancelled.idempotency_key, CaptureOutcome::Succeeded);
    let report = h.services.reconciler.run_once().await;

    assert_eq!(report.confirmed, 1);
    let order = h.services.orders.require(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.payment_status, PaymentStatus::Refunded);
    assert_eq!(h.gateway.refunds(), vec![(reference, Money::from_dollars(60))]);
    let levels = h.services.ledger.levels(&key("sku-1", "w1")).await;
    assert_eq!((levels.available, levels.reserved), (5, 0));
}

#[tokio::test]
async fn capture_reported_after_expiry_is_refunded() {
    let h = harness();
    let order_id = ambiguous_checkout(&h, MockBehavior::Hang).await;
    h.clock.advance(chrono::Duration::minutes(31));
    assert_eq!(h.services.reconciler.run_once().await.expired, 1);

    let order = h.services.orders.require(order_id).await.unwrap();
    let reference = h
        .gateway
        .record_capture(&order.idempotency_key, CaptureOutcome::Succeeded);
    let payload = json!({ "idempotency_key": order.idempotency_key.as_str() });
    let outcome = h
        .services
        .webhooks
        .payment_webhook("payment.captured", &reference, &payload)
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Processed);
    let order = h.services.orders.require(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.payment_status, PaymentStatus::Refunded);
    assert_eq!(order.refunds.len(), 1);
    assert_eq!(order.refunds[0].status, RefundStatus::Succeeded);
    assert_eq!(h.gateway.refunds(), vec![(reference, Money::from_dollars(60))]);
    let levels = h.services.ledger.levels(&key("sku-1", "w1")).await;
    assert_eq!((levels.available, levels.reserved), (5, 0));
}

#[tokio::test]
async fn rejected_refund_of_a_late_capture_is_retried_on_redelivery() {
    let h = harness();
    let order_id = ambiguous_checkout(&h, MockBehavior::Hang).await;
    h.clock.advance(chrono::Duration::minutes(31));
    h.services.reconciler.run_once().await;

    let order = h.services.orders.require(order_id).await.unwrap();
    let reference = h
        .gateway
        .record_capture(&order.idempotency_key, CaptureOutcome::Succeeded);
    let payload = json!({ "idempotency_key": order.idempotency_key.as_str() });
    h.gateway
        .set_refund_behavior(MockBehavior::Decline("processor unavailable".to_string()));

    let failed = h
        .services
        .webhooks
        .payment_webhook("payment.captured", &reference, &payload)
        .await;
    assert_eq!(failed.unwrap_err().kind(), "gateway");
    let order = h.services.orders.require(order_id).await.unwrap();
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert!(h.gateway.refunds().is_empty());

    h.gateway.set_refund_behavior(MockBehavior::Approve);
    let redelivered = h
        .services
        .webhooks
        .payment_webhook("payment.captured", &reference, &payload)
        .await
        .unwrap();

    assert_eq!(redelivered, WebhookOutcome::Processed);
    let order = h.services.orders.require(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.payment_status, PaymentStatus::Refunded);
    assert_eq!(h.gateway.refunds(), vec![(reference, Money::from_dollars(60))]);
}

#[tokio::test]
async fn refund_timeout_is_settled_by_webhook() {
    let h = harness();
    h.stock("sku-1", "w1", 5).await;
    let cart = h.cart("alice", vec![line("sku-1", 30, 1)]).await;
    let order = h.services.orchestrator.checkout(cart.id, request(&["w1"])).await.unwrap();
    let payment_id = order.payments[0].id;
    h.gateway.set_refund_behavior(MockBehavior::Hang);

    let error = h
        .services
        .refunds
        .refund(payment_id, Money::from_dollars(10), "late delivery")
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "gateway");

    let pending = h.services.refunds.refunds(payment_id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, RefundStatus::Pending);
    assert_eq!(
        h.services.refunds.remaining(payment_id).await.unwrap(),
        Money::from_dollars(20),
        "a pending refund still counts against the payment"
    );

    let payload = json!({ "refund_id": pending[0].id.to_string() });
    let outcome = h
        .services
        .webhooks
        .payment_webhook("refund.succeeded", "re_123", &payload)
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Processed);
    let refund = &h.services.refunds.refunds(payment_id).await.unwrap()[0];
    assert_eq!(refund.status, RefundStatus::Succeeded);
    assert_eq!(refund.provider_reference.as_deref(), Some("re_123"));
    assert_eq!(
        h.services.orders.require(order.id).await.unwrap().payment_status,
        PaymentStatus::PartiallyRefunded
    );
}

#[tokio::test]
async fn dispute_webhook_marks_the_order() {
    let h = harness();
    h.stock("sku-1", "w1", 5).await;
    let cart = h.cart("alice", vec![line("sku-1", 30, 1)]).await;
    let order = h.services.orchestrator.checkout(cart.id, request(&["w1"])).await.unwrap();
    let reference = order.payments[0].provider_reference.clone().unwrap();

    h.services
        .webhooks
        .payment_webhook("charge.disputed", &reference, &json!({}))
        .await
        .unwrap();

    assert_eq!(
        h.services.orders.require(order.id).await.unwrap().status,
        OrderStatus::Disputed
    );
}

#[tokio::test]
async fn carrier_webhooks_drive_delivery() {
    let h = harness();
    h.stock("sku-1", "w1", 5).await;
    let cart = h.cart("alice", vec![line("sku-1", 30, 2)]).await;
    let order = h.services.orchestrator.checkout(cart.id, request(&["w1"])).await.unwrap();
    h.services
        .shipments
        .create_shipment(
            order.id,
            vec![ShipmentItem {
                order_item_id: order.items[0].id,
                quantity: 2,
            }],
            "dhl",
            "JD0001",
        )
        .await
        .unwrap();

    let webhooks = &h.services.webhooks;
    assert_eq!(
        webhooks.carrier_webhook("JD0001", "shipped").await.unwrap(),
        WebhookOutcome::Processed
    );
    assert_eq!(
        webhooks.carrier_webhook("JD0001", "in_transit").await.unwrap(),
        WebhookOutcome::Processed
    );
    assert_eq!(
        webhooks.carrier_webhook("JD0001", "in_transit").await.unwrap(),
        WebhookOutcome::Duplicate
    );
    webhooks.carrier_webhook("JD0001", "delivered").await.unwrap();

    let shipment = h.services.shipments.by_tracking_number("JD0001").await.unwrap();
    assert_eq!(shipment.status, ShipmentStatus::Delivered);
    assert_eq!(
        h.services.orders.require(order.id).await.unwrap().status,
        OrderStatus::Delivered
    );

    let unknown = webhooks.carrier_webhook("NOPE", "delivered").await.unwrap_err();
    assert!(matches!(unknown, OrderError::UnknownTrackingNumber(_)));
}
