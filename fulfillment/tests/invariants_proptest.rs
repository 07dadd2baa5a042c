//! Property tests: whatever sequence of operations runs, stock is never
//! oversold, payments are never over-refunded, and items are never
//! over-shipped.

#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code can use unwrap/expect

mod common;

use common::{harness, key, line, request};
use fulfillment::{AdjustmentReason, Money, OrderError, OrderId, Reservation, ShipmentItem, StockLevels};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum LedgerOp {
    Reserve(u32),
    Release(usize),
    Commit(usize),
    Adjust(i64),
}

fn ledger_op() -> impl Strategy<Value = LedgerOp> {
    prop_oneof![
        3 => (1u32..6).prop_map(LedgerOp::Reserve),
        2 => any::<usize>().prop_map(LedgerOp::Release),
        2 => any::<usize>().prop_map(LedgerOp::Commit),
        1 => (-6i64..=6).prop_filter("non-zero", |delta| *delta != 0).prop_map(LedgerOp::Adjust),
    ]
}

/// Reference model of one inventory record.
#[derive(Default)]
struct Model {
    levels: StockLevels,
    open: Vec<(Reservation, bool)>,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn ledger_matches_model_and_never_oversells(
        initial in 0u32..20,
        ops in prop::collection::vec(ledger_op(), 1..40),
    ) {
        tokio_test::block_on(async {
            let h = harness();
            let record = key("sku-1", "w1");
            let ledger = &h.services.ledger;
            let mut model = Model::default();
            if initial > 0 {
                ledger.receive(&record, initial).await.unwrap();
                model.levels.available = initial;
            }

            for op in ops {
                match op {
                    LedgerOp::Reserve(quantity) => {
                        let result = ledger.reserve(&record, quantity, OrderId::new()).await;
                        if model.levels.free() >= quantity {
                            model.levels.reserved += quantity;
                            model.open.push((result.unwrap(), true));
                        } else {
                            prop_assert!(result.is_err());
                        }
                    },
                    LedgerOp::Release(_) | LedgerOp::Commit(_) if model.open.is_empty() => {},
                    LedgerOp::Release(index) => {
                        let slot = index % model.open.len();
                        let (reservation, held) = model.open[slot].clone();
                        let result = ledger.release(&reservation).await;
                        if held {
                            result.unwrap();
                            model.levels.reserved -= reservation.quantity;
                            model.open[slot].1 = false;
                        }
                    },
                    LedgerOp::Commit(index) => {
                        let slot = index % model.open.len();
                        let (reservation, held) = model.open[slot].clone();
                        let result = ledger.commit(&reservation).await;
                        if held {
                            result.unwrap();
                            model.levels.reserved -= reservation.quantity;
                            model.levels.available -= reservation.quantity;
                            model.open[slot].1 = false;
                        }
                    },
                    LedgerOp::Adjust(delta) => {
                        let result = ledger.adjust(&record, delta, AdjustmentReason::Correction).await;
                        let target = i64::from(model.levels.available) + delta;
                        if target >= i64::from(model.levels.reserved) {
                            result.unwrap();
                            model.levels.available = u32::try_from(target).unwrap();
                        } else {
                            prop_assert!(result.is_err());
                        }
                    },
                }

                let levels = ledger.levels(&record).await;
                prop_assert!(levels.reserved <= levels.available);
                prop_assert_eq!(levels, model.levels);
            }

            prop_assert_eq!(ledger.verify(&record).await.unwrap(), model.levels);
            Ok(())
        })?;
    }

    #[test]
    fn refunds_never_exceed_the_payment(amounts in prop::collection::vec(1u64..6_000, 1..12)) {
        tokio_test::block_on(async {
            let h = harness();
            h.stock("sku-1", "w1", 1).await;
            let cart = h.cart("alice", vec![line("sku-1", 100, 1)]).await;
            let order = h.services.orchestrator.checkout(cart.id, request(&["w1"])).await.unwrap();
            let payment_id = order.payments[0].id;
            let mut refunded = 0u64;

            for cents in amounts {
                let result = h.services.refunds.refund(payment_id, Money::from_cents(cents), "property").await;
                if refunded + cents <= 10_000 {
                    prop_assert!(result.is_ok());
                    refunded += cents;
                } else {
                    let is_over_refund = matches!(result, Err(OrderError::OverRefund { .. }));
                    prop_assert!(is_over_refund);
                }
            }

            let executed: u64 = h.gateway.refunds().iter().map(|(_, amount)| amount.cents()).sum();
            prop_assert_eq!(executed, refunded);
            prop_assert!(executed <= 10_000);
            prop_assert_eq!(
                h.services.refunds.remaining(payment_id).await.unwrap(),
                Money::from_cents(10_000 - refunded)
            );
            Ok(())
        })?;
    }

    #[test]
    fn shipments_never_exceed_the_ordered_quantity(quantities in prop::collection::vec(1u32..5, 1..10)) {
        tokio_test::block_on(async {
            let h = harness();
            h.stock("sku-1", "w1", 10).await;
            let cart = h.cart("alice", vec![line("sku-1", 5, 10)]).await;
            let order = h.services.orchestrator.checkout(cart.id, request(&["w1"])).await.unwrap();
            let item_id = order.items[0].id;
            let mut shipped = 0u32;

            for (n, quantity) in quantities.into_iter().enumerate() {
                let result = h
                    .services
                    .shipments
                    .create_shipment(
                        order.id,
                        vec![ShipmentItem { order_item_id: item_id, quantity }],
                        "ups",
                        &format!("TRK{n:04}"),
                    )
                    .await;
                if shipped + quantity <= 10 {
                    prop_assert!(result.is_ok());
                    shipped += quantity;
                } else {
                    let is_over_shipment = matches!(result, Err(OrderError::OverShipment { .. }));
                    prop_assert!(is_over_shipment);
                }
            }

            let order = h.services.orders.require(order.id).await.unwrap();
            prop_assert_eq!(order.items[0].fulfilled_quantity, shipped);
            prop_assert!(order.items[0].fulfilled_quantity <= order.items[0].quantity);
            Ok(())
        })?;
    }
}
