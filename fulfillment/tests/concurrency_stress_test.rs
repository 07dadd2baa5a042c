//! Concurrency stress tests for last-unit scenarios.
//!
//! Many tasks race for the same stock, coupon uses, and refundable balance.
//! Every counter must end exactly where sequential execution would leave it.
//!
//! Run with: `cargo test --test concurrency_stress_test -- --nocapture`

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/expect

mod common;

use common::{harness, key, line, request};
use fulfillment::{
    CouponCode, CouponDefinition, DiscountKind, LedgerError, Money, OrderError, OrderId, OrderStatus, ShipmentItem,
    StockLevels,
};
use fulfillment_core::environment::Clock;
use std::sync::Arc;

/// 100 concurrent reservations of one unit against 10 in stock.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_last_units_100_concurrent_reservations() {
    println!("🧪 100 concurrent reservations for 10 units");
    let h = harness();
    h.stock("sku-1", "w1", 10).await;
    let ledger = Arc::clone(&h.services.ledger);

    let mut handles = Vec::new();
    for _ in 0..100 {
        let ledger = Arc::clone(&ledger);
        handles.push(tokio::spawn(async move {
            ledger.reserve(&key("sku-1", "w1"), 1, OrderId::new()).await
        }));
    }

    let mut reserved = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => reserved += 1,
            Err(LedgerError::InsufficientStock { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    println!("  ✅ reserved={reserved} rejected={rejected}");
    assert_eq!(reserved, 10);
    assert_eq!(rejected, 90);
    assert_eq!(ledger.levels(&key("sku-1", "w1")).await, StockLevels {
        available: 10,
        reserved: 10,
    });
    assert_eq!(ledger.verify(&key("sku-1", "w1")).await.unwrap().reserved, 10);
}

/// Reservations on different keys never block each other and all succeed.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_independent_keys_do_not_contend() {
    let h = harness();
    for n in 0..20 {
        h.stock(&format!("sku-{n}"), "w1", 5).await;
    }
    let ledger = Arc::clone(&h.services.ledger);

    let mut handles = Vec::new();
    for n in 0..20 {
        for _ in 0..5 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger.reserve(&key(&format!("sku-{n}"), "w1"), 1, OrderId::new()).await
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for n in 0..20 {
        assert_eq!(ledger.levels(&key(&format!("sku-{n}"), "w1")).await.free(), 0);
    }
}

/// 50 full checkouts racing for 20 units: exactly 20 orders get confirmed
/// and the shelf ends empty.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_checkouts_for_limited_stock() {
    println!("🧪 50 concurrent checkouts for 20 units");
    let h = harness();
    h.stock("sku-1", "w1", 20).await;

    let mut carts = Vec::new();
    for n in 0..50 {
        carts.push(h.cart(&format!("customer-{n}"), vec![line("sku-1", 15, 1)]).await);
    }

    let mut handles = Vec::new();
    for cart in carts {
        let orchestrator = Arc::clone(&h.services.orchestrator);
        handles.push(tokio::spawn(async move {
            orchestrator.checkout(cart.id, request(&["w1"])).await
        }));
    }

    let mut confirmed = 0;
    let mut short = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(order) => {
                assert_eq!(order.status, OrderStatus::Confirmed);
                confirmed += 1;
            },
            Err(OrderError::InsufficientStock { .. }) => short += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    println!("  ✅ confirmed={confirmed} short={short}");
    assert_eq!(confirmed, 20);
    assert_eq!(short, 30);
    assert_eq!(h.services.ledger.levels(&key("sku-1", "w1")).await, StockLevels {
        available: 0,
        reserved: 0,
    });
    assert_eq!(h.gateway.capture_calls(), 20);
}

/// A coupon limited to 5 uses, raced by 25 checkouts with plenty of stock.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_coupon_usage_limit_under_contention() {
    let h = harness();
    h.stock("sku-1", "w1", 100).await;
    let coupon = CouponDefinition::new(
        CouponCode::parse("LIMITED").unwrap(),
        DiscountKind::FixedAmount {
            amount: Money::from_dollars(3),
        },
        h.clock.now(),
    )
    .usage_limit(5);
    h.services.coupons.register(coupon).await.unwrap();

    let mut carts = Vec::new();
    for n in 0..25 {
        carts.push(h.cart(&format!("customer-{n}"), vec![line("sku-1", 10, 1)]).await);
    }
    let mut handles = Vec::new();
    for cart in carts {
        let orchestrator = Arc::clone(&h.services.orchestrator);
        handles.push(tokio::spawn(async move {
            orchestrator
                .checkout(cart.id, request(&["w1"]).with_coupon("LIMITED"))
                .await
        }));
    }

    let mut applied = 0;
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(order) => {
                assert_eq!(order.totals.discount, Money::from_dollars(3));
                applied += 1;
            },
            Err(OrderError::Coupon(_)) => exhausted += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(applied, 5);
    assert_eq!(exhausted, 20);
    assert_eq!(h.services.coupons.coupon("LIMITED").await.unwrap().usage_count, 5);
    let levels = h.services.ledger.levels(&key("sku-1", "w1")).await;
    assert_eq!((levels.available, levels.reserved), (95, 0));
}

/// Twenty orders racing to ship under one tracking number: exactly one wins
/// and carrier updates route to it.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_tracking_number_is_claimed_by_one_order() {
    let h = harness();
    h.stock("sku-1", "w1", 20).await;
    let mut orders = Vec::new();
    for n in 0..20 {
        let cart = h.cart(&format!("customer-{n}"), vec![line("sku-1", 10, 1)]).await;
        orders.push(h.services.orchestrator.checkout(cart.id, request(&["w1"])).await.unwrap());
    }

    let mut handles = Vec::new();
    for order in orders {
        let shipments = Arc::clone(&h.services.shipments);
        handles.push(tokio::spawn(async move {
            let items = vec![ShipmentItem {
                order_item_id: order.items[0].id,
                quantity: 1,
            }];
            (order.id, shipments.create_shipment(order.id, items, "ups", "1ZSHARED").await)
        }));
    }

    let mut winners = Vec::new();
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            (order_id, Ok(_)) => winners.push(order_id),
            (_, Err(OrderError::Validation(_))) => rejected += 1,
            (_, Err(other)) => panic!("unexpected error: {other}"),
        }
    }

    println!("  ✅ winners={} rejected={rejected}", winners.len());
    assert_eq!(winners.len(), 1);
    assert_eq!(rejected, 19);
    let shipment = h.services.shipments.by_tracking_number("1ZSHARED").await.unwrap();
    assert_eq!(shipment.order_id, winners[0]);
}

/// 20 concurrent $10 refunds against a $100 payment: exactly 10 go through.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_refunds_never_exceed_the_payment() {
    let h = harness();
    h.stock("sku-1", "w1", 1).await;
    let cart = h.cart("alice", vec![line("sku-1", 100, 1)]).await;
    let order = h.services.orchestrator.checkout(cart.id, request(&["w1"])).await.unwrap();
    let payment_id = order.payments[0].id;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let refunds = Arc::clone(&h.services.refunds);
        handles.push(tokio::spawn(async move {
            refunds.refund(payment_id, Money::from_dollars(10), "partial").await
        }));
    }

    let mut refunded = 0;
    let mut over = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => refunded += 1,
            Err(OrderError::OverRefund { .. }) => over += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(refunded, 10);
    assert_eq!(over, 10);
    let total: u64 = h.gateway.refunds().iter().map(|(_, amount)| amount.cents()).sum();
    assert_eq!(total, Money::from_dollars(100).cents());
    assert_eq!(h.services.refunds.remaining(payment_id).await.unwrap(), Money::ZERO);
}
