//! Order workflow error taxonomy.
//!
//! Component errors ([`LedgerError`], [`CouponError`], [`CartError`],
//! [`GatewayError`]) convert into [`OrderError`] at the orchestrator boundary.
//! Stock shortfalls are lifted into [`OrderError::InsufficientStock`] so
//! callers see one variant regardless of which warehouse ran out.

use crate::cart::CartError;
use crate::coupon::CouponError;
use crate::inventory::LedgerError;
use crate::payment_gateway::GatewayError;
use crate::types::{Money, OrderId, OrderItemId, PaymentId, ProductId, RefundId, ShipmentId, VariantId};
use fulfillment_core::journal::JournalError;
use thiserror::Error;

/// Errors surfaced by the order orchestrator, shipment tracker, and refund
/// processor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    /// A line could not be reserved from any candidate warehouse
    #[error("insufficient stock for {product_id}/{variant_id}: requested {requested}, available {available}")]
    InsufficientStock {
        /// Product
        product_id: ProductId,
        /// Variant
        variant_id: VariantId,
        /// Units asked for
        requested: u32,
        /// Units free across the candidate warehouses
        available: u32,
    },

    /// The coupon could not be applied
    #[error(transparent)]
    Coupon(#[from] CouponError),

    /// The cart could not be checked out
    #[error(transparent)]
    Cart(#[from] CartError),

    /// The provider declined the capture
    #[error("payment capture failed for order {order_id}: {reason}")]
    PaymentCaptureFailed {
        /// Order
        order_id: OrderId,
        /// Provider's reason
        reason: String,
    },

    /// The capture outcome is unknown; only reconciliation resolves it
    #[error("payment outcome for order {order_id} is unknown; awaiting reconciliation")]
    AmbiguousPaymentOutcome {
        /// Order left pending with its reservations intact
        order_id: OrderId,
    },

    /// The requested change is not allowed from the current state
    #[error("invalid {axis} transition: {from} -> {to}")]
    InvalidStateTransition {
        /// Which state machine rejected it
        axis: &'static str,
        /// Current state
        from: String,
        /// Requested state or action
        to: String,
    },

    /// Shipping this much would exceed the ordered quantity
    #[error("over-shipment of item {order_item_id}: ordered {ordered}, shipped {already_shipped}, requested {requested}")]
    OverShipment {
        /// Order line
        order_item_id: OrderItemId,
        /// Units ordered
        ordered: u32,
        /// Units already in shipments
        already_shipped: u32,
        /// Units requested now
        requested: u32,
    },

    /// Refunding this much would exceed what remains of the payment
    #[error("over-refund of payment {payment_id}: remaining {remaining}, requested {requested}")]
    OverRefund {
        /// Payment
        payment_id: PaymentId,
        /// Amount still refundable
        remaining: Money,
        /// Amount requested
        requested: Money,
    },

    /// No such order
    #[error("order not found: {0}")]
    OrderNotFound(OrderId),

    /// No such payment
    #[error("payment not found: {0}")]
    PaymentNotFound(PaymentId),

    /// No such refund
    #[error("refund not found: {0}")]
    RefundNotFound(RefundId),

    /// No such shipment
    #[error("shipment not found: {0}")]
    ShipmentNotFound(ShipmentId),

    /// No shipment carries this tracking number
    #[error("unknown tracking number: {0}")]
    UnknownTrackingNumber(String),

    /// Malformed request
    #[error("validation failed: {0}")]
    Validation(String),

    /// Payment provider failure, surfaced as-is
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Inventory failure other than a stock shortfall
    #[error(transparent)]
    Ledger(LedgerError),

    /// Events could not be persisted
    #[error(transparent)]
    Journal(#[from] JournalError),
}

impl From<LedgerError> for OrderError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::InsufficientStock {
                product_id,
                variant_id,
                requested,
                available,
                ..
            } => Self::InsufficientStock {
                product_id,
                variant_id,
                requested,
                available,
            },
            other => Self::Ledger(other),
        }
    }
}

impl OrderError {
    /// Shorthand for an order-status rejection.
    pub(crate) fn transition(axis: &'static str, from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            axis,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Stable label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::Coupon(_) => "coupon",
            Self::Cart(_) => "cart",
            Self::PaymentCaptureFailed { .. } => "payment_failed",
            Self::AmbiguousPaymentOutcome { .. } => "ambiguous",
            Self::InvalidStateTransition { .. } => "invalid_transition",
            Self::OverShipment { .. } => "over_shipment",
            Self::OverRefund { .. } => "over_refund",
            Self::OrderNotFound(_)
            | Self::PaymentNotFound(_)
            | Self::RefundNotFound(_)
            | Self::ShipmentNotFound(_)
            | Self::UnknownTrackingNumber(_) => "not_found",
            Self::Validation(_) => "validation",
            Self::Gateway(_) => "gateway",
            Self::Ledger(_) => "ledger",
            Self::Journal(_) => "journal",
        }
    }
}
