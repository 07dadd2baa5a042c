//! Order aggregate.
//!
//! An order owns its items, payment attempts, refunds, and shipments, so every
//! invariant that spans them (refunds never exceed a payment, shipments never
//! exceed an item) is checked inside one reducer call against one consistent
//! state. Three independent status axes move through their own state machines:
//!
//! ```text
//! status:            pending → confirmed → processing → shipped → delivered
//!                    (+ cancelled | refunded | returned | disputed from any non-terminal state)
//! payment_status:    pending → paid | failed;  paid → partially_refunded → refunded
//! fulfillment_status: unfulfilled → partially_fulfilled → fulfilled   (never regresses)
//! ```

use crate::config::PricingConfig;
use crate::coupon::{AppliedCoupon, Discount};
use crate::error::OrderError;
use crate::inventory::Reservation;
use crate::refund::{self, Refund, RefundStatus};
use crate::shipment::{self, Shipment, ShipmentStatus, ShipmentStatusChange};
use crate::types::{
    CartId, CartOwner, Currency, IdempotencyKey, Money, OrderId, OrderItemId, OrderNumber, PaymentId, ProductId,
    RefundId, ShipmentId, ShippingAddress, VariantId,
};
use chrono::{DateTime, Utc};
use fulfillment_core::environment::Clock;
use fulfillment_core::reducer::{Events, Reducer};
use fulfillment_core::smallvec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Status machines
// ============================================================================

/// Lifecycle of the order as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created, payment outcome not yet known
    Pending,
    /// Paid, stock committed
    Confirmed,
    /// Partially shipped or being picked
    Processing,
    /// Every item shipped
    Shipped,
    /// Every shipment delivered
    Delivered,
    /// Cancelled before fulfilment
    Cancelled,
    /// Money returned outside a cancellation
    Refunded,
    /// Goods came back
    Returned,
    /// Customer disputed the charge
    Disputed,
}

impl OrderStatus {
    /// No transition leaves a terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Refunded | Self::Returned)
    }

    const fn is_side_branch(self) -> bool {
        matches!(self, Self::Cancelled | Self::Refunded | Self::Returned | Self::Disputed)
    }

    /// Whether `next` is reachable in one step.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() || self as u8 == next as u8 {
            return false;
        }
        if next.is_side_branch() {
            return true;
        }
        matches!(
            (self, next),
            (Self::Pending, Self::Confirmed)
                | (Self::Confirmed, Self::Processing | Self::Shipped)
                | (Self::Processing, Self::Shipped)
                | (Self::Shipped, Self::Delivered)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Processing => "processing",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
            Self::Returned => "returned",
            Self::Disputed => "disputed",
        })
    }
}

/// Money state of the order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Capture outstanding
    Pending,
    /// Captured
    Paid,
    /// Declined
    Failed,
    /// Some of the capture returned
    PartiallyRefunded,
    /// All of the capture returned
    Refunded,
}

impl PaymentStatus {
    /// Whether `next` is reachable in one step.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Paid | Self::Failed)
                | (Self::Paid | Self::PartiallyRefunded, Self::PartiallyRefunded | Self::Refunded)
        )
    }

    /// Paid and not fully refunded.
    #[must_use]
    pub const fn is_captured(self) -> bool {
        matches!(self, Self::Paid | Self::PartiallyRefunded)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::PartiallyRefunded => "partially_refunded",
            Self::Refunded => "refunded",
        })
    }
}

/// How much of the order has shipped. Never regresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    /// Nothing shipped
    Unfulfilled,
    /// Some units shipped
    PartiallyFulfilled,
    /// Every unit shipped
    Fulfilled,
}

impl FulfillmentStatus {
    /// Whether `next` is reachable without regressing.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        next > self || (self == Self::PartiallyFulfilled && next == Self::PartiallyFulfilled)
    }
}

impl fmt::Display for FulfillmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unfulfilled => "unfulfilled",
            Self::PartiallyFulfilled => "partially_fulfilled",
            Self::Fulfilled => "fulfilled",
        })
    }
}

/// What happened to the stock reserved for the order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationsState {
    /// Reserved, outcome of payment unknown
    Held,
    /// Deducted after capture
    Committed,
    /// Returned to free stock without deduction
    Released,
    /// Deducted, then put back on the shelf by a cancellation
    Restocked,
}

impl ReservationsState {
    const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Held, Self::Committed | Self::Released) | (Self::Committed, Self::Restocked)
        )
    }
}

impl fmt::Display for ReservationsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Held => "held",
            Self::Committed => "committed",
            Self::Released => "released",
            Self::Restocked => "restocked",
        })
    }
}

// ============================================================================
// Entities
// ============================================================================

/// A line on an order. Product facts are frozen at checkout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Identity
    pub id: OrderItemId,
    /// Product
    pub product_id: ProductId,
    /// Variant
    pub variant_id: VariantId,
    /// Name at checkout
    pub name: String,
    /// Units ordered
    pub quantity: u32,
    /// Unit price at checkout
    pub unit_price: Money,
    /// Units in shipments so far
    pub fulfilled_quantity: u32,
}

impl OrderItem {
    /// Units not yet in any shipment
    #[must_use]
    pub const fn unshipped(&self) -> u32 {
        self.quantity.saturating_sub(self.fulfilled_quantity)
    }
}

/// Computed order totals.
///
/// **Invariant**: `total = subtotal + tax + shipping − discount`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    /// Sum of line totals
    pub subtotal: Money,
    /// Coupon reduction of the subtotal
    pub discount: Money,
    /// Tax on the discounted subtotal
    pub tax: Money,
    /// Shipping charge
    pub shipping: Money,
    /// Amount captured
    pub total: Money,
}

impl OrderTotals {
    /// Price an order.
    ///
    /// A money discount is capped at the subtotal; free shipping zeroes the
    /// shipping charge instead. Shipping is also free once the subtotal
    /// reaches the configured threshold. Tax applies to the discounted
    /// subtotal. Returns `None` on overflow.
    #[must_use]
    pub fn compute(subtotal: Money, discount: Option<Discount>, pricing: &PricingConfig) -> Option<Self> {
        let (discount, free_shipping) = match discount {
            Some(Discount::Amount(amount)) => (amount.min(subtotal), false),
            Some(Discount::FreeShipping) => (Money::ZERO, true),
            None => (Money::ZERO, false),
        };
        let over_threshold = pricing
            .free_shipping_threshold
            .is_some_and(|threshold| subtotal >= threshold);
        let shipping = if free_shipping || over_threshold {
            Money::ZERO
        } else {
            pricing.flat_shipping
        };
        let taxable = subtotal.checked_sub(discount)?;
        let tax = taxable.basis_points(pricing.tax_rate_bps);
        let total = taxable.checked_add(tax)?.checked_add(shipping)?;
        Some(Self {
            subtotal,
            discount,
            tax,
            shipping,
            total,
        })
    }

    /// Whether the totals satisfy the order total invariant.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        let charged = self
            .subtotal
            .checked_add(self.tax)
            .and_then(|sum| sum.checked_add(self.shipping));
        charged == self.total.checked_add(self.discount)
    }
}

/// Lifecycle of one capture attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentAttemptStatus {
    /// Sent to the provider, no answer yet
    Pending,
    /// Captured
    Succeeded,
    /// Declined
    Failed,
}

/// One capture attempt. Never mutated after reaching a terminal status; money
/// only flows back through [`Refund`]s.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Identity
    pub id: PaymentId,
    /// Amount captured or attempted
    pub amount: Money,
    /// Currency
    pub currency: Currency,
    /// Key forwarded to the provider
    pub idempotency_key: IdempotencyKey,
    /// Status
    pub status: PaymentAttemptStatus,
    /// Provider's charge identifier
    pub provider_reference: Option<String>,
    /// Provider's decline reason
    pub failure_reason: Option<String>,
    /// Sent at
    pub created_at: DateTime<Utc>,
    /// Outcome known at
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Snapshot of every axis after a change, kept as an append-only timeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChange {
    /// Order status
    pub status: OrderStatus,
    /// Payment status
    pub payment_status: PaymentStatus,
    /// Fulfilment status
    pub fulfillment_status: FulfillmentStatus,
    /// What caused the change
    pub reason: String,
    /// When
    pub at: DateTime<Utc>,
}

/// An order and everything it owns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Internal identity
    pub id: OrderId,
    /// Human-readable identity
    pub number: OrderNumber,
    /// Who placed it
    pub owner: CartOwner,
    /// Cart it was created from
    pub cart_id: Option<CartId>,
    /// Lines
    pub items: Vec<OrderItem>,
    /// Currency
    pub currency: Currency,
    /// Totals
    pub totals: OrderTotals,
    /// Delivery address
    pub shipping_address: ShippingAddress,
    /// Coupon applied at checkout
    pub coupon: Option<AppliedCoupon>,
    /// Stock claimed at checkout
    pub reservations: Vec<Reservation>,
    /// What happened to that stock
    pub reservations_state: ReservationsState,
    /// Order status
    pub status: OrderStatus,
    /// Payment status
    pub payment_status: PaymentStatus,
    /// Fulfilment status
    pub fulfillment_status: FulfillmentStatus,
    /// Capture attempts
    pub payments: Vec<Payment>,
    /// Refunds against those captures
    pub refunds: Vec<Refund>,
    /// Shipments
    pub shipments: Vec<Shipment>,
    /// Timeline of status changes
    pub history: Vec<OrderStatusChange>,
    /// Checkout idempotency key
    pub idempotency_key: IdempotencyKey,
    /// Created
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Whether the order may still be cancelled: nothing shipped and not past
    /// confirmation.
    #[must_use]
    pub fn is_cancellable(&self) -> bool {
        matches!(self.status, OrderStatus::Pending | OrderStatus::Confirmed)
            && self.fulfillment_status == FulfillmentStatus::Unfulfilled
    }

    /// A payment attempt by id
    #[must_use]
    pub fn payment(&self, payment_id: PaymentId) -> Option<&Payment> {
        self.payments.iter().find(|payment| payment.id == payment_id)
    }

    /// The attempt whose outcome is still unknown, if any
    #[must_use]
    pub fn pending_payment(&self) -> Option<&Payment> {
        self.payments
            .iter()
            .find(|payment| payment.status == PaymentAttemptStatus::Pending)
    }

    /// The failed attempt of a cancelled, uncaptured order. The provider can
    /// still report a capture for it after the order lapsed.
    #[must_use]
    pub fn lapsed_payment(&self) -> Option<&Payment> {
        if self.status != OrderStatus::Cancelled || self.payment_status != PaymentStatus::Failed {
            return None;
        }
        self.payments
            .iter()
            .rev()
            .find(|payment| payment.status == PaymentAttemptStatus::Failed)
    }

    /// The attempt that captured funds, if any
    #[must_use]
    pub fn captured_payment(&self) -> Option<&Payment> {
        self.payments
            .iter()
            .find(|payment| payment.status == PaymentAttemptStatus::Succeeded)
    }

    /// A refund by id
    #[must_use]
    pub fn refund(&self, refund_id: RefundId) -> Option<&Refund> {
        self.refunds.iter().find(|refund| refund.id == refund_id)
    }

    /// A shipment by id
    #[must_use]
    pub fn shipment(&self, shipment_id: ShipmentId) -> Option<&Shipment> {
        self.shipments.iter().find(|shipment| shipment.id == shipment_id)
    }

    /// An item by id
    #[must_use]
    pub fn item(&self, item_id: OrderItemId) -> Option<&OrderItem> {
        self.items.iter().find(|item| item.id == item_id)
    }

    /// Amount refunded or being refunded for a payment
    #[must_use]
    pub fn refund_commitments(&self, payment_id: PaymentId) -> Money {
        refund::committed_total(&self.refunds, payment_id)
    }

    fn record_change(&mut self, reason: &str, at: DateTime<Utc>) {
        self.updated_at = at;
        self.history.push(OrderStatusChange {
            status: self.status,
            payment_status: self.payment_status,
            fulfillment_status: self.fulfillment_status,
            reason: reason.to_string(),
            at,
        });
    }
}

// ============================================================================
// Commands and events
// ============================================================================

/// How much to refund.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefundAmount {
    /// Exactly this much
    Exact(Money),
    /// Whatever is still refundable; a no-op when nothing is
    Outstanding,
}

/// Commands accepted by an order.
#[derive(Clone, Debug)]
pub enum OrderCommand {
    /// Create the order
    Place(Box<Order>),
    /// The provider captured a pending attempt
    RecordCapture {
        /// Attempt
        payment_id: PaymentId,
        /// Provider's charge id
        provider_reference: String,
    },
    /// The provider declined a pending attempt
    RecordCaptureFailure {
        /// Attempt
        payment_id: PaymentId,
        /// Provider's reason
        reason: String,
    },
    /// Record what the ledger did with the order's reservations
    SetReservations(ReservationsState),
    /// Cancel before fulfilment
    Cancel,
    /// Start a refund
    RequestRefund {
        /// Caller-chosen id
        refund_id: RefundId,
        /// Payment to refund; the captured one when `None`
        payment_id: Option<PaymentId>,
        /// How much
        amount: RefundAmount,
        /// Why
        reason: String,
    },
    /// The provider executed a refund
    CompleteRefund {
        /// Refund
        refund_id: RefundId,
        /// Provider's refund id
        provider_reference: String,
    },
    /// The provider rejected a refund; its amount is refundable again
    FailRefund {
        /// Refund
        refund_id: RefundId,
        /// Why
        reason: String,
    },
    /// Ship some units
    CreateShipment(Box<Shipment>),
    /// Carrier status change
    UpdateShipment {
        /// Shipment
        shipment_id: ShipmentId,
        /// New status
        status: ShipmentStatus,
    },
    /// Manual status step
    Transition(OrderStatus),
}

/// Facts recorded about an order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    /// Order created
    Placed {
        /// Initial state
        order: Box<Order>,
    },
    /// Capture succeeded
    PaymentCaptured {
        /// Attempt
        payment_id: PaymentId,
        /// Provider's charge id
        provider_reference: String,
        /// Order status afterwards
        status: OrderStatus,
        /// When
        at: DateTime<Utc>,
    },
    /// Capture declined
    PaymentFailed {
        /// Attempt
        payment_id: PaymentId,
        /// Provider's reason
        reason: String,
        /// Order status afterwards
        status: OrderStatus,
        /// When
        at: DateTime<Utc>,
    },
    /// Reservations committed, released, or restocked
    ReservationsChanged {
        /// New state
        state: ReservationsState,
        /// When
        at: DateTime<Utc>,
    },
    /// Order cancelled
    Cancelled {
        /// When
        at: DateTime<Utc>,
    },
    /// Refund started
    RefundRequested {
        /// Pending refund
        refund: Refund,
    },
    /// Refund executed
    RefundCompleted {
        /// Refund
        refund_id: RefundId,
        /// Provider's refund id
        provider_reference: String,
        /// Payment status afterwards
        payment_status: PaymentStatus,
        /// When
        at: DateTime<Utc>,
    },
    /// Refund rejected
    RefundFailed {
        /// Refund
        refund_id: RefundId,
        /// Why
        reason: String,
        /// When
        at: DateTime<Utc>,
    },
    /// Shipment created
    ShipmentCreated {
        /// Shipment
        shipment: Box<Shipment>,
        /// Fulfilment status afterwards
        fulfillment_status: FulfillmentStatus,
        /// Order status afterwards
        status: OrderStatus,
        /// When
        at: DateTime<Utc>,
    },
    /// Carrier reported a status change
    ShipmentStatusChanged {
        /// Shipment
        shipment_id: ShipmentId,
        /// New shipment status
        status: ShipmentStatus,
        /// Order status afterwards
        order_status: OrderStatus,
        /// When
        at: DateTime<Utc>,
    },
    /// Manual status step
    StatusChanged {
        /// New status
        status: OrderStatus,
        /// When
        at: DateTime<Utc>,
    },
}

/// Injected dependencies.
#[derive(Clone)]
pub struct OrderEnvironment {
    /// Event timestamps
    pub clock: Arc<dyn Clock>,
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for one order.
#[derive(Clone, Copy, Debug, Default)]
pub struct OrderReducer;

impl OrderReducer {
    fn require_pending_attempt(order: &Order, payment_id: PaymentId) -> Result<Option<&Payment>, OrderError> {
        let payment = order
            .payment(payment_id)
            .ok_or(OrderError::PaymentNotFound(payment_id))?;
        Ok((payment.status == PaymentAttemptStatus::Pending).then_some(payment))
    }

    fn reduce_capture(
        order: &Order,
        payment_id: PaymentId,
        provider_reference: String,
        at: DateTime<Utc>,
    ) -> Result<Events<OrderEvent>, OrderError> {
        let Some(payment) = Self::require_pending_attempt(order, payment_id)? else {
            if order.lapsed_payment().is_some_and(|lapsed| lapsed.id == payment_id) {
                return Ok(smallvec![OrderEvent::PaymentCaptured {
                    payment_id,
                    provider_reference,
                    status: OrderStatus::Cancelled,
                    at,
                }]);
            }
            return match order.payment(payment_id).map(|payment| payment.status) {
                Some(PaymentAttemptStatus::Succeeded) => Ok(Events::new()),
                _ => Err(OrderError::transition("payment", order.payment_status, PaymentStatus::Paid)),
            };
        };
        if !order.payment_status.can_transition_to(PaymentStatus::Paid) {
            return Err(OrderError::transition("payment", order.payment_status, PaymentStatus::Paid));
        }
        let status = match order.status {
            OrderStatus::Pending => OrderStatus::Confirmed,
            OrderStatus::Cancelled => OrderStatus::Cancelled,
            other => return Err(OrderError::transition("order", other, OrderStatus::Confirmed)),
        };
        Ok(smallvec![OrderEvent::PaymentCaptured {
            payment_id: payment.id,
            provider_reference,
            status,
            at,
        }])
    }

    fn reduce_capture_failure(
        order: &Order,
        payment_id: PaymentId,
        reason: String,
        at: DateTime<Utc>,
    ) -> Result<Events<OrderEvent>, OrderError> {
        let Some(payment) = Self::require_pending_attempt(order, payment_id)? else {
            return match order.payment(payment_id).map(|payment| payment.status) {
                Some(PaymentAttemptStatus::Failed) => Ok(Events::new()),
                _ => Err(OrderError::transition("payment", order.payment_status, PaymentStatus::Failed)),
            };
        };
        let status = match order.status {
            OrderStatus::Pending | OrderStatus::Cancelled => OrderStatus::Cancelled,
            other => return Err(OrderError::transition("order", other, OrderStatus::Cancelled)),
        };
        Ok(smallvec![OrderEvent::PaymentFailed {
            payment_id: payment.id,
            reason,
            status,
            at,
        }])
    }

    fn reduce_cancel(order: &Order, at: DateTime<Utc>) -> Result<Events<OrderEvent>, OrderError> {
        if !order.is_cancellable() {
            return Err(OrderError::transition("order", order.status, OrderStatus::Cancelled));
        }
        Ok(smallvec![OrderEvent::Cancelled { at }])
    }

    fn reduce_request_refund(
        order: &Order,
        refund_id: RefundId,
        payment_id: Option<PaymentId>,
        amount: RefundAmount,
        reason: String,
        at: DateTime<Utc>,
    ) -> Result<Events<OrderEvent>, OrderError> {
        if order.refund(refund_id).is_some() {
            return Ok(Events::new());
        }
        let payment = match payment_id {
            Some(payment_id) => order
                .payment(payment_id)
                .ok_or(OrderError::PaymentNotFound(payment_id))?,
            None => order
                .captured_payment()
                .ok_or_else(|| OrderError::transition("payment", order.payment_status, "refund"))?,
        };
        if payment.status != PaymentAttemptStatus::Succeeded {
            return Err(OrderError::transition("payment", order.payment_status, "refund"));
        }

        let remaining = refund::remaining(payment, &order.refunds);
        let amount = match amount {
            RefundAmount::Exact(amount) if amount.is_zero() => {
                return Err(OrderError::Validation("refund amount must be positive".to_string()));
            },
            RefundAmount::Exact(amount) if amount > remaining => {
                return Err(OrderError::OverRefund {
                    payment_id: payment.id,
                    remaining,
                    requested: amount,
                });
            },
            RefundAmount::Exact(amount) => amount,
            RefundAmount::Outstanding if remaining.is_zero() => return Ok(Events::new()),
            RefundAmount::Outstanding => remaining,
        };

        Ok(smallvec![OrderEvent::RefundRequested {
            refund: Refund::pending(refund_id, payment.id, amount, reason, at),
        }])
    }

    fn reduce_complete_refund(
        order: &Order,
        refund_id: RefundId,
        provider_reference: String,
        at: DateTime<Utc>,
    ) -> Result<Events<OrderEvent>, OrderError> {
        let refund = order.refund(refund_id).ok_or(OrderError::RefundNotFound(refund_id))?;
        match refund.status {
            RefundStatus::Succeeded => return Ok(Events::new()),
            RefundStatus::Failed => return Err(OrderError::transition("refund", refund.status, RefundStatus::Succeeded)),
            RefundStatus::Pending => {},
        }
        let payment = order
            .payment(refund.payment_id)
            .ok_or(OrderError::PaymentNotFound(refund.payment_id))?;
        let refunded = refund::succeeded_total(&order.refunds, payment.id).saturating_add(refund.amount);
        let payment_status = if refunded >= payment.amount {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartiallyRefunded
        };
        if !order.payment_status.can_transition_to(payment_status) {
            return Err(OrderError::transition("payment", order.payment_status, payment_status));
        }
        Ok(smallvec![OrderEvent::RefundCompleted {
            refund_id,
            provider_reference,
            payment_status,
            at,
        }])
    }

    fn reduce_fail_refund(
        order: &Order,
        refund_id: RefundId,
        reason: String,
        at: DateTime<Utc>,
    ) -> Result<Events<OrderEvent>, OrderError> {
        let refund = order.refund(refund_id).ok_or(OrderError::RefundNotFound(refund_id))?;
        match refund.status {
            RefundStatus::Failed => Ok(Events::new()),
            RefundStatus::Succeeded => Err(OrderError::transition("refund", refund.status, RefundStatus::Failed)),
            RefundStatus::Pending => Ok(smallvec![OrderEvent::RefundFailed { refund_id, reason, at }]),
        }
    }

    fn reduce_create_shipment(
        order: &Order,
        shipment: Box<Shipment>,
        at: DateTime<Utc>,
    ) -> Result<Events<OrderEvent>, OrderError> {
        if order.shipment(shipment.id).is_some() {
            return Ok(Events::new());
        }
        let fulfillment_status = shipment::plan_fulfillment(order, &shipment.items)?;
        let shippable = matches!(order.status, OrderStatus::Confirmed | OrderStatus::Processing)
            && order.payment_status.is_captured();
        if !shippable {
            return Err(OrderError::transition("order", order.status, "ship"));
        }
        if order
            .shipments
            .iter()
            .any(|existing| existing.tracking_number == shipment.tracking_number)
        {
            return Err(OrderError::Validation(format!(
                "tracking number {} is already used on this order",
                shipment.tracking_number
            )));
        }

        let status = if fulfillment_status == FulfillmentStatus::Fulfilled {
            OrderStatus::Shipped
        } else {
            OrderStatus::Processing
        };
        Ok(smallvec![OrderEvent::ShipmentCreated {
            shipment,
            fulfillment_status,
            status,
            at,
        }])
    }

    fn reduce_update_shipment(
        order: &Order,
        shipment_id: ShipmentId,
        status: ShipmentStatus,
        at: DateTime<Utc>,
    ) -> Result<Events<OrderEvent>, OrderError> {
        let shipment = order
            .shipment(shipment_id)
            .ok_or(OrderError::ShipmentNotFound(shipment_id))?;
        if shipment.status == status {
            return Ok(Events::new());
        }
        if !shipment.status.can_transition_to(status) {
            return Err(OrderError::transition("shipment", shipment.status, status));
        }

        let all_delivered = order
            .shipments
            .iter()
            .all(|other| other.id == shipment_id || other.status == ShipmentStatus::Delivered);
        let order_status = if status == ShipmentStatus::Delivered
            && all_delivered
            && order.fulfillment_status == FulfillmentStatus::Fulfilled
            && order.status == OrderStatus::Shipped
        {
            OrderStatus::Delivered
        } else {
            order.status
        };
        Ok(smallvec![OrderEvent::ShipmentStatusChanged {
            shipment_id,
            status,
            order_status,
            at,
        }])
    }

    fn reduce_transition(order: &Order, target: OrderStatus, at: DateTime<Utc>) -> Result<Events<OrderEvent>, OrderError> {
        let manual = match target {
            OrderStatus::Processing | OrderStatus::Returned | OrderStatus::Disputed | OrderStatus::Refunded => true,
            OrderStatus::Delivered => order.fulfillment_status == FulfillmentStatus::Fulfilled,
            OrderStatus::Pending | OrderStatus::Confirmed | OrderStatus::Shipped | OrderStatus::Cancelled => false,
        };
        if !manual || !order.status.can_transition_to(target) {
            return Err(OrderError::transition("order", order.status, target));
        }
        Ok(smallvec![OrderEvent::StatusChanged { status: target, at }])
    }
}

impl Reducer for OrderReducer {
    type State = Option<Order>;
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = OrderError;
    type Environment = OrderEnvironment;

    fn reduce(
        &self,
        state: &Option<Order>,
        command: OrderCommand,
        env: &OrderEnvironment,
    ) -> Result<Events<OrderEvent>, OrderError> {
        if let OrderCommand::Place(order) = command {
            if let Some(existing) = state {
                return Err(OrderError::Validation(format!("order {} already exists", existing.id)));
            }
            if order.items.is_empty() || order.items.iter().any(|item| item.quantity == 0) {
                return Err(OrderError::Validation("order must contain positive quantities".to_string()));
            }
            if !order.totals.is_balanced() {
                return Err(OrderError::Validation("order totals do not balance".to_string()));
            }
            return Ok(smallvec![OrderEvent::Placed { order }]);
        }

        let Some(order) = state else {
            return Err(OrderError::Validation("order has not been placed".to_string()));
        };
        let at = env.clock.now();

        match command {
            OrderCommand::Place(_) => Ok(Events::new()),
            OrderCommand::RecordCapture {
                payment_id,
                provider_reference,
            } => Self::reduce_capture(order, payment_id, provider_reference, at),
            OrderCommand::RecordCaptureFailure { payment_id, reason } => {
                Self::reduce_capture_failure(order, payment_id, reason, at)
            },
            OrderCommand::SetReservations(target) => {
                if order.reservations_state == target {
                    return Ok(Events::new());
                }
                if !order.reservations_state.can_transition_to(target) {
                    return Err(OrderError::transition("reservations", order.reservations_state, target));
                }
                Ok(smallvec![OrderEvent::ReservationsChanged { state: target, at }])
            },
            OrderCommand::Cancel => Self::reduce_cancel(order, at),
            OrderCommand::RequestRefund {
                refund_id,
                payment_id,
                amount,
                reason,
            } => Self::reduce_request_refund(order, refund_id, payment_id, amount, reason, at),
            OrderCommand::CompleteRefund {
                refund_id,
                provider_reference,
            } => Self::reduce_complete_refund(order, refund_id, provider_reference, at),
            OrderCommand::FailRefund { refund_id, reason } => Self::reduce_fail_refund(order, refund_id, reason, at),
            OrderCommand::CreateShipment(shipment) => Self::reduce_create_shipment(order, shipment, at),
            OrderCommand::UpdateShipment { shipment_id, status } => {
                Self::reduce_update_shipment(order, shipment_id, status, at)
            },
            OrderCommand::Transition(target) => Self::reduce_transition(order, target, at),
        }
    }

    #[allow(clippy::too_many_lines)] // One arm per event
    fn apply(&self, state: &mut Option<Order>, event: &OrderEvent) {
        if let OrderEvent::Placed { order } = event {
            *state = Some(order.as_ref().clone());
            return;
        }
        let Some(order) = state else {
            return;
        };

        match event {
            OrderEvent::Placed { .. } => {},
            OrderEvent::PaymentCaptured {
                payment_id,
                provider_reference,
                status,
                at,
            } => {
                if let Some(payment) = order.payments.iter_mut().find(|payment| payment.id == *payment_id) {
                    payment.status = PaymentAttemptStatus::Succeeded;
                    payment.provider_reference = Some(provider_reference.clone());
                    payment.resolved_at = Some(*at);
                }
                order.payment_status = PaymentStatus::Paid;
                order.status = *status;
                order.record_change("payment_captured", *at);
            },
            OrderEvent::PaymentFailed {
                payment_id,
                reason,
                status,
                at,
            } => {
                if let Some(payment) = order.payments.iter_mut().find(|payment| payment.id == *payment_id) {
                    payment.status = PaymentAttemptStatus::Failed;
                    payment.failure_reason = Some(reason.clone());
                    payment.resolved_at = Some(*at);
                }
                order.payment_status = PaymentStatus::Failed;
                order.status = *status;
                order.record_change("payment_failed", *at);
            },
            OrderEvent::ReservationsChanged { state, at } => {
                order.reservations_state = *state;
                order.updated_at = *at;
            },
            OrderEvent::Cancelled { at } => {
                order.status = OrderStatus::Cancelled;
                order.record_change("cancelled", *at);
            },
            OrderEvent::RefundRequested { refund } => {
                order.updated_at = refund.created_at;
                order.refunds.push(refund.clone());
            },
            OrderEvent::RefundCompleted {
                refund_id,
                provider_reference,
                payment_status,
                at,
            } => {
                if let Some(refund) = order.refunds.iter_mut().find(|refund| refund.id == *refund_id) {
                    refund.status = RefundStatus::Succeeded;
                    refund.provider_reference = Some(provider_reference.clone());
                    refund.resolved_at = Some(*at);
                }
                order.payment_status = *payment_status;
                order.record_change("refund_completed", *at);
            },
            OrderEvent::RefundFailed { refund_id, reason, at } => {
                if let Some(refund) = order.refunds.iter_mut().find(|refund| refund.id == *refund_id) {
                    refund.status = RefundStatus::Failed;
                    refund.failure_reason = Some(reason.clone());
                    refund.resolved_at = Some(*at);
                }
                order.updated_at = *at;
            },
            OrderEvent::ShipmentCreated {
                shipment,
                fulfillment_status,
                status,
                at,
            } => {
                for shipped in &shipment.items {
                    if let Some(item) = order.items.iter_mut().find(|item| item.id == shipped.order_item_id) {
                        item.fulfilled_quantity = item.fulfilled_quantity.saturating_add(shipped.quantity);
                    }
                }
                order.shipments.push(shipment.as_ref().clone());
                order.fulfillment_status = *fulfillment_status;
                order.status = *status;
                order.record_change("shipment_created", *at);
            },
            OrderEvent::ShipmentStatusChanged {
                shipment_id,
                status,
                order_status,
                at,
            } => {
                if let Some(shipment) = order.shipments.iter_mut().find(|shipment| shipment.id == *shipment_id) {
                    shipment.status = *status;
                    shipment.history.push(ShipmentStatusChange { status: *status, at: *at });
                }
                if order.status == *order_status {
                    order.updated_at = *at;
                } else {
                    order.status = *order_status;
                    order.record_change("shipments_delivered", *at);
                }
            },
            OrderEvent::StatusChanged { status, at } => {
                order.status = *status;
                order.record_change("manual", *at);
            },
        }
    }
}
