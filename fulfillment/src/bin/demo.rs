//! Fulfillment walkthrough.
//!
//! Wires the services against the mock payment provider and runs a checkout
//! through shipment and refund, a declined payment, and an ambiguous capture
//! resolved by reconciliation. Prints the metrics snapshot at the end.

use anyhow::Context;
use fulfillment::{
    CartOwner, CheckoutRequest, CouponCode, CouponDefinition, CustomerId, DiscountKind, FulfillmentConfig,
    FulfillmentServices, InventoryKey, LineItem, MockBehavior, MockPaymentGateway, Money, OrderError, ProductId,
    ShipmentItem, ShipmentStatus, ShippingAddress, VariantId, WarehouseId,
};
use fulfillment_core::environment::{Clock, SystemClock};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn address() -> ShippingAddress {
    ShippingAddress {
        recipient: "Ada Lovelace".to_string(),
        line1: "12 Analytical Row".to_string(),
        line2: None,
        city: "London".to_string(),
        region: None,
        postal_code: "N1 9GU".to_string(),
        country: "GB".to_string(),
    }
}

fn widget(quantity: u32) -> LineItem {
    LineItem {
        product_id: ProductId::new("widget"),
        variant_id: VariantId::new("blue"),
        category_id: None,
        name: "Blue widget".to_string(),
        quantity,
        unit_price: Money::from_dollars(25),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = FulfillmentConfig::from_env();
    config.validate().context("invalid configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("fulfillment={0},fulfillment_runtime={0}", config.observability.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let metrics = if config.observability.metrics_enabled {
        let handle = fulfillment_runtime::metrics::install_prometheus_recorder()?;
        fulfillment::metrics::register_business_metrics();
        Some(handle)
    } else {
        None
    };

    let gateway = MockPaymentGateway::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let services = FulfillmentServices::new(config, Arc::new(gateway.clone()), Arc::clone(&clock));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = services.spawn_background_tasks(&shutdown_rx);

    let east = WarehouseId::new("east");
    let west = WarehouseId::new("west");
    let product = ProductId::new("widget");
    let variant = VariantId::new("blue");
    services
        .ledger
        .receive(&InventoryKey::new(product.clone(), variant.clone(), east.clone()), 3)
        .await?;
    services
        .ledger
        .receive(&InventoryKey::new(product, variant, west.clone()), 3)
        .await?;
    let code = CouponCode::parse("WELCOME10").context("coupon code")?;
    services
        .coupons
        .register(
            CouponDefinition::new(
                code,
                DiscountKind::Percentage {
                    percent: 10,
                    max_discount: Some(Money::from_dollars(5)),
                },
                clock.now(),
            )
            .usage_limit_per_user(1),
        )
        .await?;
    let preference = vec![east, west];

    info!("Checkout split across warehouses, with a coupon");
    let cart = services
        .carts
        .create(CartOwner::Customer(CustomerId::new("ada")))
        .await?;
    services.carts.add_item(cart.id, widget(4)).await?;
    let order = services
        .orchestrator
        .checkout(
            cart.id,
            CheckoutRequest::new(address(), preference.clone()).with_coupon("welcome10"),
        )
        .await?;
    info!(number = %order.number, total = %order.totals.total, status = %order.status, "Order confirmed");

    let shipment = services
        .shipments
        .create_shipment(
            order.id,
            vec![ShipmentItem {
                order_item_id: order.items[0].id,
                quantity: 4,
            }],
            "royal-mail",
            "RM000111222GB",
        )
        .await?;
    for status in ["shipped", "in_transit", "delivered"] {
        services.webhooks.carrier_webhook(&shipment.tracking_number, status).await?;
    }
    let delivered = services.orchestrator.order(order.id).await?;
    info!(status = %delivered.status, "Carrier reported delivery");

    let refund = services
        .refunds
        .refund(order.payments[0].id, Money::from_dollars(20), "one widget arrived scratched")
        .await?;
    let after_refund = services.orchestrator.order(order.id).await?;
    info!(amount = %refund.amount, payment_status = %after_refund.payment_status, "Partial refund issued");

    info!("Declined payment");
    gateway.set_capture_behavior(MockBehavior::Decline("card declined".to_string()));
    let cart = services
        .carts
        .create(CartOwner::Customer(CustomerId::new("babbage")))
        .await?;
    services.carts.add_item(cart.id, widget(1)).await?;
    match services
        .orchestrator
        .checkout(cart.id, CheckoutRequest::new(address(), preference.clone()))
        .await
    {
        Err(OrderError::PaymentCaptureFailed { order_id, reason }) => {
            warn!(%order_id, %reason, "Checkout declined; stock released");
        },
        other => anyhow::bail!("expected a declined checkout, got {other:?}"),
    }

    info!("Ambiguous capture resolved by reconciliation");
    gateway.set_capture_behavior(MockBehavior::LoseResponse);
    services.carts.add_item(cart.id, widget(1)).await?;
    let order_id = match services
        .orchestrator
        .checkout(
            cart.id,
            CheckoutRequest::new(address(), preference).with_payment_timeout(std::time::Duration::from_millis(200)),
        )
        .await
    {
        Err(OrderError::AmbiguousPaymentOutcome { order_id }) => order_id,
        other => anyhow::bail!("expected an ambiguous checkout, got {other:?}"),
    };
    let report = services.reconciler.run_once().await;
    let resolved = services.orchestrator.order(order_id).await?;
    info!(?report, status = %resolved.status, "Reconciled");

    for key in services.ledger.keys().await {
        let levels = services.ledger.verify(&key).await?;
        info!(%key, %levels, "Stock");
    }
    let shipped = services
        .shipments
        .by_tracking_number(&shipment.tracking_number)
        .await
        .map(|shipment| shipment.status);
    info!(?shipped, delivered = shipped == Some(ShipmentStatus::Delivered), "Shipment");

    shutdown_tx.send(true).ok();
    for task in background {
        task.await.ok();
    }

    if let Some(handle) = metrics {
        println!("{}", handle.render());
    }
    Ok(())
}
