//! Order orchestrator.
//!
//! Checkout is a saga: reserve every line, apply the coupon, record the order,
//! capture payment, then commit or compensate. No step holds an inventory or
//! coupon lock across the capture call; only the order's own workflow lock is
//! held, so a webhook for the same order waits while unrelated orders proceed.
//!
//! A capture that times out or fails in transport leaves the order `pending`
//! with its reservations held. Only [`OrderOrchestrator::settle_capture`],
//! called by the webhook inbox or the reconciler, resolves it.

use crate::cart::{Cart, CartError, CartManager};
use crate::config::{FulfillmentConfig, PricingConfig};
use crate::coupon::{AppliedCoupon, CouponEvaluator};
use crate::error::OrderError;
use crate::inventory::{AdjustmentReason, InventoryLedger, Reservation};
use crate::metrics;
use crate::order::{
    FulfillmentStatus, Order, OrderCommand, OrderItem, OrderStatus, OrderTotals, Payment, PaymentAttemptStatus,
    PaymentStatus, RefundAmount, ReservationsState,
};
use crate::order_book::{Claim, OrderBook};
use crate::payment_gateway::{CaptureOutcome, GatewayError, PaymentGateway, PaymentResult};
use crate::refund::RefundProcessor;
use crate::types::{
    CartId, IdempotencyKey, Money, OrderId, OrderItemId, OrderNumber, PaymentId, ShippingAddress, WarehouseId,
};
use fulfillment_core::environment::Clock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything checkout needs besides the cart.
#[derive(Clone, Debug)]
pub struct CheckoutRequest {
    /// Delivery address
    pub shipping_address: ShippingAddress,
    /// Coupon to apply, as typed by the customer
    pub coupon_code: Option<String>,
    /// Warehouses to reserve from, most preferred first
    pub warehouse_preference: Vec<WarehouseId>,
    /// Makes a retried checkout return the original outcome
    pub idempotency_key: IdempotencyKey,
    /// Capture timeout; the configured default when `None`
    pub payment_timeout: Option<Duration>,
}

impl CheckoutRequest {
    /// A request with a fresh idempotency key and no coupon.
    #[must_use]
    pub fn new(shipping_address: ShippingAddress, warehouse_preference: Vec<WarehouseId>) -> Self {
        Self {
            shipping_address,
            coupon_code: None,
            warehouse_preference,
            idempotency_key: IdempotencyKey::generate(),
            payment_timeout: None,
        }
    }

    /// Apply a coupon code
    #[must_use]
    pub fn with_coupon(mut self, code: impl Into<String>) -> Self {
        self.coupon_code = Some(code.into());
        self
    }

    /// Use a caller-chosen idempotency key
    #[must_use]
    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = key;
        self
    }

    /// Override the capture timeout
    #[must_use]
    pub const fn with_payment_timeout(mut self, timeout: Duration) -> Self {
        self.payment_timeout = Some(timeout);
        self
    }
}

/// How an outstanding capture turned out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureResolution {
    /// The provider captured the funds
    Succeeded {
        /// Provider's charge id
        provider_reference: String,
    },
    /// The provider declined
    Failed {
        /// Provider's reason
        reason: String,
    },
    /// The provider has no record and the order is too old to keep waiting
    Expired,
}

impl From<PaymentResult> for CaptureResolution {
    fn from(result: PaymentResult) -> Self {
        match result.outcome {
            CaptureOutcome::Succeeded => Self::Succeeded {
                provider_reference: result.provider_reference,
            },
            CaptureOutcome::Failed { reason } => Self::Failed { reason },
        }
    }
}

/// Shared components the orchestrator coordinates.
pub struct OrchestratorParts {
    /// Orders
    pub orders: Arc<OrderBook>,
    /// Stock
    pub ledger: Arc<InventoryLedger>,
    /// Coupons
    pub coupons: Arc<CouponEvaluator>,
    /// Carts
    pub carts: Arc<CartManager>,
    /// Refunds
    pub refunds: Arc<RefundProcessor>,
    /// Payment provider
    pub gateway: Arc<dyn PaymentGateway>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

/// Coordinates checkout, settlement, cancellation, and manual transitions.
pub struct OrderOrchestrator {
    orders: Arc<OrderBook>,
    ledger: Arc<InventoryLedger>,
    coupons: Arc<CouponEvaluator>,
    carts: Arc<CartManager>,
    refunds: Arc<RefundProcessor>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    pricing: PricingConfig,
    payment_timeout: Duration,
}

impl OrderOrchestrator {
    /// Create an orchestrator over `parts`.
    #[must_use]
    pub fn new(parts: OrchestratorParts, config: &FulfillmentConfig) -> Self {
        Self {
            orders: parts.orders,
            ledger: parts.ledger,
            coupons: parts.coupons,
            carts: parts.carts,
            refunds: parts.refunds,
            gateway: parts.gateway,
            clock: parts.clock,
            pricing: config.pricing.clone(),
            payment_timeout: config.checkout.payment_timeout,
        }
    }

    /// Check out a stored cart.
    ///
    /// The cart is discarded once an order exists for it and the capture did
    /// not fail; a declined customer keeps the cart to retry.
    ///
    /// # Errors
    ///
    /// As [`Self::place_order`], plus [`CartError::NotFound`] and
    /// [`CartError::Expired`] for the cart lookup.
    pub async fn checkout(&self, cart_id: CartId, request: CheckoutRequest) -> Result<Order, OrderError> {
        let cart = self.carts.get(cart_id).await?;
        let result = self.place_order(&cart, request).await;
        if matches!(result, Ok(_) | Err(OrderError::AmbiguousPaymentOutcome { .. })) {
            self.carts.discard(cart_id).await;
        }
        result
    }

    /// Turn a cart snapshot into a paid order, or fail with nothing held.
    ///
    /// # Errors
    ///
    /// - [`OrderError::Cart`] for an empty or expired cart
    /// - [`OrderError::Validation`] for an incomplete address or no warehouses
    /// - [`OrderError::InsufficientStock`] when a line cannot be reserved
    /// - [`OrderError::Coupon`] when the coupon does not apply
    /// - [`OrderError::PaymentCaptureFailed`] when the provider declines; the
    ///   order exists as `cancelled` with nothing held
    /// - [`OrderError::AmbiguousPaymentOutcome`] when the capture outcome is
    ///   unknown; the order stays `pending` with its reservations held
    #[tracing::instrument(skip(self, cart, request), fields(cart_id = %cart.id, lines = cart.lines.len()))]
    pub async fn place_order(&self, cart: &Cart, request: CheckoutRequest) -> Result<Order, OrderError> {
        let started = Instant::now();
        let result = self.place_order_now(cart, request).await;
        let outcome = match &result {
            Ok(_) => "succeeded",
            Err(error) => error.kind(),
        };
        metrics::record_checkout(outcome, started.elapsed().as_secs_f64());
        result
    }

    async fn place_order_now(&self, cart: &Cart, request: CheckoutRequest) -> Result<Order, OrderError> {
        let key = request.idempotency_key.clone();
        match self.orders.claim(&key).await {
            Claim::New => {},
            Claim::Existing(order_id) => {
                tracing::info!(%order_id, "Checkout replayed for an existing order");
                return self.replay_checkout(order_id).await;
            },
            Claim::InFlight => {
                return Err(OrderError::Validation(format!(
                    "a checkout with idempotency key {} is already in progress",
                    key.as_str()
                )));
            },
        }

        let result = self.run_checkout(cart, request).await;
        if result.is_err() {
            self.orders.unclaim(&key).await;
        }
        result
    }

    async fn replay_checkout(&self, order_id: OrderId) -> Result<Order, OrderError> {
        let order = self.orders.require(order_id).await?;
        if order.pending_payment().is_some() {
            return Err(OrderError::AmbiguousPaymentOutcome { order_id });
        }
        if order.payment_status == PaymentStatus::Failed {
            let reason = order
                .payments
                .iter()
                .rev()
                .find_map(|payment| payment.failure_reason.clone())
                .unwrap_or_default();
            return Err(OrderError::PaymentCaptureFailed { order_id, reason });
        }
        Ok(order)
    }

    async fn run_checkout(&self, cart: &Cart, request: CheckoutRequest) -> Result<Order, OrderError> {
        let now = self.clock.now();
        if cart.is_empty() {
            return Err(CartError::Empty(cart.id).into());
        }
        if cart.is_expired(now) {
            return Err(CartError::Expired(cart.id).into());
        }
        let missing = request.shipping_address.missing_fields();
        if !missing.is_empty() {
            return Err(OrderError::Validation(format!(
                "shipping address is missing {}",
                missing.join(", ")
            )));
        }
        if request.warehouse_preference.is_empty() {
            return Err(OrderError::Validation("no candidate warehouses".to_string()));
        }
        let subtotal = cart
            .subtotal()
            .ok_or_else(|| OrderError::Validation("cart subtotal overflows".to_string()))?;

        let order_id = OrderId::new();
        let reservations = self.reserve_cart(cart, &request.warehouse_preference, order_id).await?;

        let coupon = match &request.coupon_code {
            Some(code) => match self
                .coupons
                .apply(code, order_id, cart.owner.customer(), subtotal, &cart.lines)
                .await
            {
                Ok(applied) => Some(applied),
                Err(error) => {
                    tracing::warn!(%error, "Coupon rejected; releasing reservations");
                    self.ledger.release_all(&reservations).await;
                    return Err(error.into());
                },
            },
            None => None,
        };

        let order = match self.build_order(cart, &request, order_id, subtotal, coupon.clone(), reservations.clone()) {
            Ok(order) => order,
            Err(error) => {
                self.compensate(&reservations, coupon.as_ref(), order_id).await;
                return Err(error);
            },
        };
        let order = match self.orders.insert(order).await {
            Ok(order) => order,
            Err(error) => {
                self.compensate(&reservations, coupon.as_ref(), order_id).await;
                return Err(error);
            },
        };
        tracing::info!(%order_id, number = %order.number, total = %order.totals.total, "Order placed; capturing payment");

        let timeout = request.payment_timeout.unwrap_or(self.payment_timeout);
        self.capture(order, timeout).await
    }

    async fn reserve_cart(
        &self,
        cart: &Cart,
        preferences: &[WarehouseId],
        order_id: OrderId,
    ) -> Result<Vec<Reservation>, OrderError> {
        let mut reservations = Vec::new();
        for line in &cart.lines {
            match self
                .ledger
                .reserve_line(&line.product_id, &line.variant_id, line.quantity, preferences, order_id)
                .await
            {
                Ok(taken) => reservations.extend(taken),
                Err(error) => {
                    tracing::warn!(product_id = %line.product_id, %error, "Line could not be reserved; releasing checkout");
                    self.ledger.release_all(&reservations).await;
                    return Err(error.into());
                },
            }
        }
        Ok(reservations)
    }

    async fn compensate(&self, reservations: &[Reservation], coupon: Option<&AppliedCoupon>, order_id: OrderId) {
        self.ledger.release_all(reservations).await;
        if let Some(coupon) = coupon {
            if let Err(error) = self.coupons.rollback(&coupon.code, order_id).await {
                tracing::error!(code = %coupon.code, %error, "Coupon rollback failed");
            }
        }
    }

    fn build_order(
        &self,
        cart: &Cart,
        request: &CheckoutRequest,
        order_id: OrderId,
        subtotal: Money,
        coupon: Option<AppliedCoupon>,
        reservations: Vec<Reservation>,
    ) -> Result<Order, OrderError> {
        let now = self.clock.now();
        let totals = OrderTotals::compute(subtotal, coupon.as_ref().map(|applied| applied.discount), &self.pricing)
            .ok_or_else(|| OrderError::Validation("order totals overflow".to_string()))?;

        let items = cart
            .lines
            .iter()
            .map(|line| OrderItem {
                id: OrderItemId::new(),
                product_id: line.product_id.clone(),
                variant_id: line.variant_id.clone(),
                name: line.name.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
                fulfilled_quantity: 0,
            })
            .collect();

        Ok(Order {
            id: order_id,
            number: OrderNumber::next(now),
            owner: cart.owner.clone(),
            cart_id: Some(cart.id),
            items,
            currency: cart.currency.clone(),
            totals,
            shipping_address: request.shipping_address.clone(),
            coupon,
            reservations,
            reservations_state: ReservationsState::Held,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            fulfillment_status: FulfillmentStatus::Unfulfilled,
            payments: vec![Payment {
                id: PaymentId::new(),
                amount: totals.total,
                currency: cart.currency.clone(),
                idempotency_key: request.idempotency_key.clone(),
                status: PaymentAttemptStatus::Pending,
                provider_reference: None,
                failure_reason: None,
                created_at: now,
                resolved_at: None,
            }],
            refunds: Vec::new(),
            shipments: Vec::new(),
            history: Vec::new(),
            idempotency_key: request.idempotency_key.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn capture(&self, order: Order, timeout: Duration) -> Result<Order, OrderError> {
        let order_id = order.id;
        let payment = order
            .pending_payment()
            .cloned()
            .ok_or(OrderError::AmbiguousPaymentOutcome { order_id })?;

        let _workflow = self.orders.lock(order_id).await;
        let call = self
            .gateway
            .capture(order_id, payment.amount, &payment.currency, &payment.idempotency_key);
        let resolution = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => CaptureResolution::from(result),
            Ok(Err(error)) => {
                metrics::record_payment_capture("ambiguous");
                tracing::warn!(%order_id, %error, "Capture failed in transport; awaiting reconciliation");
                return Err(OrderError::AmbiguousPaymentOutcome { order_id });
            },
            Err(_) => {
                metrics::record_payment_capture("ambiguous");
                tracing::warn!(%order_id, ?timeout, "Capture timed out; awaiting reconciliation");
                return Err(OrderError::AmbiguousPaymentOutcome { order_id });
            },
        };

        let reason = match &resolution {
            CaptureResolution::Failed { reason } => Some(reason.clone()),
            CaptureResolution::Succeeded { .. } | CaptureResolution::Expired => None,
        };
        let order = self.settle_locked(order_id, resolution).await?;
        match reason {
            Some(reason) => Err(OrderError::PaymentCaptureFailed { order_id, reason }),
            None => Ok(order),
        }
    }

    /// Resolve an outstanding capture.
    ///
    /// Settling an order with no outstanding capture returns it unchanged, so
    /// duplicate webhooks and reconciliation passes are harmless.
    ///
    /// # Errors
    ///
    /// [`OrderError::OrderNotFound`], or a ledger or journal failure while
    /// committing or releasing stock.
    #[tracing::instrument(skip(self))]
    pub async fn settle_capture(&self, order_id: OrderId, resolution: CaptureResolution) -> Result<Order, OrderError> {
        let _workflow = self.orders.lock(order_id).await;
        self.settle_locked(order_id, resolution).await
    }

    async fn settle_locked(&self, order_id: OrderId, resolution: CaptureResolution) -> Result<Order, OrderError> {
        let order = self.orders.require(order_id).await?;
        let payment = match (order.pending_payment(), &resolution) {
            (Some(payment), _) => payment.clone(),
            (None, CaptureResolution::Succeeded { .. }) if order.status == OrderStatus::Cancelled => {
                match order.lapsed_payment() {
                    Some(payment) => payment.clone(),
                    None if order.payment_status.is_captured() => return self.refund_late_capture(order_id).await,
                    None => return Ok(order),
                }
            },
            (None, _) => return Ok(order),
        };

        match resolution {
            CaptureResolution::Succeeded { provider_reference } => {
                let (_, order) = self
                    .orders
                    .send(order_id, OrderCommand::RecordCapture {
                        payment_id: payment.id,
                        provider_reference,
                    })
                    .await?;
                metrics::record_payment_capture("succeeded");

                if order.status == OrderStatus::Cancelled {
                    tracing::warn!(%order_id, "Capture landed on a cancelled order; refunding");
                    self.release_reservations(&order).await?;
                    return self.refund_late_capture(order_id).await;
                }

                for reservation in &order.reservations {
                    self.ledger.commit(reservation).await?;
                }
                let (_, order) = self
                    .orders
                    .send(order_id, OrderCommand::SetReservations(ReservationsState::Committed))
                    .await?;
                tracing::info!(%order_id, "Payment captured; order confirmed");
                Ok(order)
            },
            CaptureResolution::Failed { reason } => self.fail_capture(order_id, payment.id, reason, "failed").await,
            CaptureResolution::Expired => {
                self.fail_capture(
                    order_id,
                    payment.id,
                    "capture outcome unknown past the pending order lifetime".to_string(),
                    "expired",
                )
                .await
            },
        }
    }

    /// Refund whatever is still outstanding on a cancelled order the provider
    /// charged anyway. A timed-out refund stays pending for its webhook; any
    /// other failure is returned so the triggering delivery is retried.
    async fn refund_late_capture(&self, order_id: OrderId) -> Result<Order, OrderError> {
        match self
            .refunds
            .refund_locked(order_id, None, RefundAmount::Outstanding, "order cancelled")
            .await
        {
            Ok(_) | Err(OrderError::Gateway(GatewayError::Timeout)) => {},
            Err(error) => {
                tracing::error!(%order_id, %error, "Refund of late capture failed");
                return Err(error);
            },
        }
        self.orders.require(order_id).await
    }

    async fn fail_capture(
        &self,
        order_id: OrderId,
        payment_id: PaymentId,
        reason: String,
        outcome: &'static str,
    ) -> Result<Order, OrderError> {
        let (_, order) = self
            .orders
            .send(order_id, OrderCommand::RecordCaptureFailure { payment_id, reason })
            .await?;
        metrics::record_payment_capture(outcome);
        self.release_reservations(&order).await?;
        self.rollback_coupon(&order).await;
        tracing::warn!(%order_id, outcome, "Payment not captured; order cancelled and stock released");
        self.orders.require(order_id).await
    }

    async fn release_reservations(&self, order: &Order) -> Result<(), OrderError> {
        if order.reservations_state != ReservationsState::Held {
            return Ok(());
        }
        self.ledger.release_all(&order.reservations).await;
        self.orders
            .send(order.id, OrderCommand::SetReservations(ReservationsState::Released))
            .await?;
        Ok(())
    }

    async fn rollback_coupon(&self, order: &Order) {
        if let Some(coupon) = &order.coupon {
            if let Err(error) = self.coupons.rollback(&coupon.code, order.id).await {
                tracing::error!(order_id = %order.id, code = %coupon.code, %error, "Coupon rollback failed");
            }
        }
    }

    /// Cancel an order that has not shipped.
    ///
    /// A pending order releases its reservations; if its capture later
    /// succeeds the money is refunded on settlement. A confirmed order is
    /// refunded in full first, then its committed stock is put back on the
    /// shelf. Either way the coupon use is returned.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidStateTransition`] once anything has shipped or the
    /// order is past confirmation; [`OrderError::Gateway`] when the refund
    /// fails, in which case the order is left as it was.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: OrderId) -> Result<Order, OrderError> {
        let _workflow = self.orders.lock(order_id).await;
        let order = self.orders.require(order_id).await?;
        if !order.is_cancellable() {
            return Err(OrderError::InvalidStateTransition {
                axis: "order",
                from: order.status.to_string(),
                to: OrderStatus::Cancelled.to_string(),
            });
        }

        if order.payment_status.is_captured() {
            self.refunds
                .refund_locked(order_id, None, RefundAmount::Outstanding, "order cancelled")
                .await?;
        }

        self.orders.send(order_id, OrderCommand::Cancel).await?;
        let order = self.orders.require(order_id).await?;
        match order.reservations_state {
            ReservationsState::Held => self.release_reservations(&order).await?,
            ReservationsState::Committed => self.restock(&order).await?,
            ReservationsState::Released | ReservationsState::Restocked => {},
        }
        self.rollback_coupon(&order).await;
        tracing::info!(%order_id, "Order cancelled");
        self.orders.require(order_id).await
    }

    async fn restock(&self, order: &Order) -> Result<(), OrderError> {
        for reservation in &order.reservations {
            self.ledger
                .adjust(
                    &reservation.key,
                    i64::from(reservation.quantity),
                    AdjustmentReason::CancellationRestock(order.id),
                )
                .await?;
        }
        self.orders
            .send(order.id, OrderCommand::SetReservations(ReservationsState::Restocked))
            .await?;
        Ok(())
    }

    /// Apply a manual status change (`processing`, `delivered`, `returned`,
    /// `disputed`, `refunded`).
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidStateTransition`] when the status machine does not
    /// allow it.
    #[tracing::instrument(skip(self))]
    pub async fn update_status(&self, order_id: OrderId, target: OrderStatus) -> Result<Order, OrderError> {
        let _workflow = self.orders.lock(order_id).await;
        let (_, order) = self.orders.send(order_id, OrderCommand::Transition(target)).await?;
        tracing::info!(%order_id, status = %order.status, "Order status updated");
        Ok(order)
    }

    /// An order by id.
    ///
    /// # Errors
    ///
    /// [`OrderError::OrderNotFound`].
    pub async fn order(&self, order_id: OrderId) -> Result<Order, OrderError> {
        self.orders.require(order_id).await
    }

    /// An order by its human-readable number.
    pub async fn order_by_number(&self, number: &str) -> Option<Order> {
        self.orders.by_number(number).await
    }
}
