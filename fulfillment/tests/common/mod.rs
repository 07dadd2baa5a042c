//! Shared fixtures for the integration tests.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use fulfillment::{
    Cart, CartOwner, CheckoutRequest, CustomerId, FulfillmentConfig, FulfillmentServices, InventoryKey, LineItem,
    MockPaymentGateway, Money, PaymentGateway, ProductId, ShippingAddress, VariantId, WarehouseId,
};
use fulfillment_core::environment::Clock;
use fulfillment_testing::{test_clock, ManualClock};
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub services: FulfillmentServices,
    pub gateway: MockPaymentGateway,
    pub clock: Arc<ManualClock>,
}

pub fn config() -> FulfillmentConfig {
    let mut config = FulfillmentConfig::default();
    config.checkout.payment_timeout = Duration::from_millis(100);
    config.checkout.refund_timeout = Duration::from_millis(100);
    config.reconciliation.lookup_initial_delay = Duration::from_millis(1);
    config
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(config: FulfillmentConfig) -> Harness {
    let gateway = MockPaymentGateway::new();
    let clock = Arc::new(ManualClock::starting_at(test_clock().now()));
    let shared_gateway: Arc<dyn PaymentGateway> = Arc::new(gateway.clone());
    let shared_clock: Arc<dyn Clock> = clock.clone();
    Harness {
        services: FulfillmentServices::new(config, shared_gateway, shared_clock),
        gateway,
        clock,
    }
}

pub fn warehouse(id: &str) -> WarehouseId {
    WarehouseId::new(id)
}

pub fn key(product: &str, warehouse_id: &str) -> InventoryKey {
    InventoryKey::new(ProductId::new(product), VariantId::new("std"), warehouse(warehouse_id))
}

pub fn line(product: &str, dollars: u64, quantity: u32) -> LineItem {
    LineItem {
        product_id: ProductId::new(product),
        variant_id: VariantId::new("std"),
        category_id: None,
        name: format!("{product} widget"),
        quantity,
        unit_price: Money::from_dollars(dollars),
    }
}

pub fn address() -> ShippingAddress {
    ShippingAddress {
        recipient: "Grace Hopper".to_string(),
        line1: "1 Compiler Lane".to_string(),
        line2: None,
        city: "Arlington".to_string(),
        region: Some("VA".to_string()),
        postal_code: "22201".to_string(),
        country: "US".to_string(),
    }
}

pub fn request(warehouses: &[&str]) -> CheckoutRequest {
    CheckoutRequest::new(address(), warehouses.iter().map(|id| warehouse(id)).collect())
}

impl Harness {
    pub async fn stock(&self, product: &str, warehouse_id: &str, quantity: u32) {
        self.services
            .ledger
            .receive(&key(product, warehouse_id), quantity)
            .await
            .unwrap();
    }

    pub async fn cart(&self, customer: &str, lines: Vec<LineItem>) -> Cart {
        let carts = &self.services.carts;
        let mut cart = carts
            .create(CartOwner::Customer(CustomerId::new(customer)))
            .await
            .unwrap();
        for line in lines {
            cart = carts.add_item(cart.id, line).await.unwrap();
        }
        cart
    }
}
