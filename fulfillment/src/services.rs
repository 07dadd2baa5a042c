//! Wiring of every fulfillment component around one clock and one payment
//! gateway.

use crate::cart::CartManager;
use crate::config::FulfillmentConfig;
use crate::coupon::CouponEvaluator;
use crate::inventory::InventoryLedger;
use crate::order_book::OrderBook;
use crate::orchestrator::{OrchestratorParts, OrderOrchestrator};
use crate::payment_gateway::PaymentGateway;
use crate::reconciliation::Reconciler;
use crate::refund::RefundProcessor;
use crate::shipment::ShipmentTracker;
use crate::webhooks::WebhookInbox;
use fulfillment_core::environment::Clock;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The assembled fulfillment system.
pub struct FulfillmentServices {
    /// Configuration the services were built from
    pub config: FulfillmentConfig,
    /// Stock
    pub ledger: Arc<InventoryLedger>,
    /// Coupons
    pub coupons: Arc<CouponEvaluator>,
    /// Carts
    pub carts: Arc<CartManager>,
    /// Orders
    pub orders: Arc<OrderBook>,
    /// Checkout, settlement, cancellation
    pub orchestrator: Arc<OrderOrchestrator>,
    /// Refunds
    pub refunds: Arc<RefundProcessor>,
    /// Shipments
    pub shipments: Arc<ShipmentTracker>,
    /// Webhooks
    pub webhooks: Arc<WebhookInbox>,
    /// Ambiguous capture resolution
    pub reconciler: Arc<Reconciler>,
}

impl FulfillmentServices {
    /// Build every component.
    #[must_use]
    pub fn new(config: FulfillmentConfig, gateway: Arc<dyn PaymentGateway>, clock: Arc<dyn Clock>) -> Self {
        let ledger = Arc::new(InventoryLedger::new(Arc::clone(&clock)));
        let coupons = Arc::new(CouponEvaluator::new(Arc::clone(&clock)));
        let carts = Arc::new(CartManager::new(
            Arc::clone(&clock),
            config.cart_ttl(),
            config.pricing.currency.clone(),
        ));
        let orders = Arc::new(OrderBook::new(Arc::clone(&clock)));
        let refunds = Arc::new(RefundProcessor::new(
            Arc::clone(&orders),
            Arc::clone(&gateway),
            config.checkout.refund_timeout,
        ));
        let shipments = Arc::new(ShipmentTracker::new(Arc::clone(&orders), Arc::clone(&clock)));
        let orchestrator = Arc::new(OrderOrchestrator::new(
            OrchestratorParts {
                orders: Arc::clone(&orders),
                ledger: Arc::clone(&ledger),
                coupons: Arc::clone(&coupons),
                carts: Arc::clone(&carts),
                refunds: Arc::clone(&refunds),
                gateway: Arc::clone(&gateway),
                clock: Arc::clone(&clock),
            },
            &config,
        ));
        let webhooks = Arc::new(WebhookInbox::new(
            Arc::clone(&orchestrator),
            Arc::clone(&orders),
            Arc::clone(&refunds),
            Arc::clone(&shipments),
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&orders),
            Arc::clone(&orchestrator),
            gateway,
            clock,
            &config.reconciliation,
        ));

        Self {
            config,
            ledger,
            coupons,
            carts,
            orders,
            orchestrator,
            refunds,
            shipments,
            webhooks,
            reconciler,
        }
    }

    /// Start the cart sweeper and the reconciler. Both stop when `shutdown`
    /// flips to `true`.
    #[must_use]
    pub fn spawn_background_tasks(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            Arc::clone(&self.carts).spawn_sweeper(self.config.carts.sweep_interval, shutdown.clone()),
            Arc::clone(&self.reconciler).spawn(self.config.reconciliation.interval, shutdown.clone()),
        ]
    }
}
