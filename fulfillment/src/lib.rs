//! Order fulfillment and inventory reservation.
//!
//! Turns a cart into a paid order without ever selling the same unit twice,
//! then tracks the order through shipment and refund.
//!
//! # Architecture
//!
//! ```text
//!               ┌────────────────────┐
//!   cart ──────▶│ Order Orchestrator │◀────── webhooks / reconciler
//!               └────────────────────┘
//!          reserve │   apply │   capture │   ship / refund
//!                  ▼         ▼           ▼
//!        ┌───────────┐ ┌──────────┐ ┌─────────┐ ┌──────────────────────┐
//!        │ Inventory │ │  Coupon  │ │ Payment │ │ Order book           │
//!        │  Ledger   │ │Evaluator │ │ Gateway │ │ (orders, payments,   │
//!        └───────────┘ └──────────┘ └─────────┘ │ refunds, shipments)  │
//!                                               └──────────────────────┘
//! ```
//!
//! Inventory records, coupon usage counters, and orders are each single-writer
//! stores keyed by their identity: every operation on one key is linearizable
//! and different keys never contend.
//!
//! ## Checkout saga
//!
//! ```text
//! 1. Reserve every line (multi-warehouse)     ─ failure → release taken lines
//! 2. Apply coupon                              ─ failure → release all
//! 3. Record order (pending / unfulfilled)
//! 4. Capture payment
//!    4a. Succeeded  → commit stock, order confirmed
//!    4b. Declined   → release stock, roll back coupon, order cancelled
//!    4c. Unknown    → keep everything held; reconciliation decides
//! ```
//!
//! # Usage
//!
//! Build a [`FulfillmentServices`] from a [`FulfillmentConfig`], a
//! [`PaymentGateway`] and a clock, stock the ledger, and check out carts
//! through [`OrderOrchestrator`].

/// Shopping carts
pub mod cart;

/// Environment-driven configuration
pub mod config;

/// Coupon validation and usage limits
pub mod coupon;

/// Order workflow errors
pub mod error;

/// Per-key stock ledger
pub mod inventory;

/// Business metrics
pub mod metrics;

/// Checkout saga and order lifecycle
pub mod orchestrator;

/// Order aggregate
pub mod order;

/// Order storage and indexes
pub mod order_book;

/// Payment provider abstraction
pub mod payment_gateway;

/// Ambiguous capture resolution
pub mod reconciliation;

/// Refunds
pub mod refund;

/// Component wiring
pub mod services;

/// Shipments
pub mod shipment;

/// Shared domain types
pub mod types;

/// Inbound webhooks
pub mod webhooks;

pub use cart::{Cart, CartError, CartManager};
pub use config::{ConfigError, FulfillmentConfig};
pub use coupon::{AppliedCoupon, CouponDefinition, CouponError, CouponEvaluator, Discount, DiscountKind};
pub use error::OrderError;
pub use inventory::{AdjustmentReason, InventoryLedger, LedgerError, Reservation, StockLevels};
pub use orchestrator::{CaptureResolution, CheckoutRequest, OrderOrchestrator};
pub use order::{FulfillmentStatus, Order, OrderStatus, PaymentStatus, ReservationsState};
pub use payment_gateway::{
    CaptureOutcome, GatewayError, MockBehavior, MockPaymentGateway, PaymentGateway, PaymentResult, RefundResult,
};
pub use reconciliation::{ReconciliationReport, Reconciler};
pub use refund::{Refund, RefundProcessor, RefundStatus};
pub use services::FulfillmentServices;
pub use shipment::{Shipment, ShipmentItem, ShipmentStatus, ShipmentTracker};
pub use types::{
    CartId, CartOwner, CategoryId, CouponCode, Currency, CustomerId, IdempotencyKey, InventoryKey, LineItem, Money,
    OrderId, OrderItemId, OrderNumber, PaymentId, ProductId, RefundId, ReservationId, SessionId, ShipmentId,
    ShippingAddress, VariantId, WarehouseId,
};
pub use webhooks::{PaymentEvent, WebhookInbox, WebhookOutcome};
