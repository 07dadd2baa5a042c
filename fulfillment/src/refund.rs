//! Refunds and the refund processor.
//!
//! A refund is recorded as pending on its order before the provider is called,
//! so the amount is reserved against the payment while the call is in flight.
//! Two concurrent refunds of one payment therefore cannot both pass the
//! over-refund check.
//!
//! **Invariant**: for every payment, the sum of its non-failed refunds never
//! exceeds the payment amount.

use crate::error::OrderError;
use crate::metrics;
use crate::order::{Order, OrderCommand, Payment, RefundAmount};
use crate::order_book::OrderBook;
use crate::payment_gateway::{GatewayError, PaymentGateway};
use crate::types::{Money, OrderId, PaymentId, RefundId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of a refund.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    /// Sent to the provider, or about to be
    Pending,
    /// Executed by the provider
    Succeeded,
    /// Rejected by the provider; the amount is refundable again
    Failed,
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        })
    }
}

/// Money returned against one payment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    /// Identity
    pub id: RefundId,
    /// Payment refunded
    pub payment_id: PaymentId,
    /// Amount
    pub amount: Money,
    /// Why
    pub reason: String,
    /// Status
    pub status: RefundStatus,
    /// Provider's refund id
    pub provider_reference: Option<String>,
    /// Provider's rejection reason
    pub failure_reason: Option<String>,
    /// Requested
    pub created_at: DateTime<Utc>,
    /// Outcome known
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Refund {
    /// A refund waiting on the provider.
    #[must_use]
    pub const fn pending(id: RefundId, payment_id: PaymentId, amount: Money, reason: String, at: DateTime<Utc>) -> Self {
        Self {
            id,
            payment_id,
            amount,
            reason,
            status: RefundStatus::Pending,
            provider_reference: None,
            failure_reason: None,
            created_at: at,
            resolved_at: None,
        }
    }
}

fn total_where(refunds: &[Refund], payment_id: PaymentId, include: impl Fn(RefundStatus) -> bool) -> Money {
    refunds
        .iter()
        .filter(|refund| refund.payment_id == payment_id && include(refund.status))
        .fold(Money::ZERO, |sum, refund| sum.saturating_add(refund.amount))
}

/// Pending plus succeeded refunds of a payment.
#[must_use]
pub fn committed_total(refunds: &[Refund], payment_id: PaymentId) -> Money {
    total_where(refunds, payment_id, |status| status != RefundStatus::Failed)
}

/// Succeeded refunds of a payment.
#[must_use]
pub fn succeeded_total(refunds: &[Refund], payment_id: PaymentId) -> Money {
    total_where(refunds, payment_id, |status| status == RefundStatus::Succeeded)
}

/// Amount of `payment` that can still be refunded.
#[must_use]
pub fn remaining(payment: &Payment, refunds: &[Refund]) -> Money {
    payment.amount.saturating_sub(committed_total(refunds, payment.id))
}

/// Executes refunds against the payment provider.
pub struct RefundProcessor {
    orders: Arc<OrderBook>,
    gateway: Arc<dyn PaymentGateway>,
    timeout: Duration,
}

impl RefundProcessor {
    /// Create a processor; provider calls give up after `timeout`.
    #[must_use]
    pub fn new(orders: Arc<OrderBook>, gateway: Arc<dyn PaymentGateway>, timeout: Duration) -> Self {
        Self {
            orders,
            gateway,
            timeout,
        }
    }

    /// Refund `amount` of a payment.
    ///
    /// # Errors
    ///
    /// - [`OrderError::PaymentNotFound`] for an unknown payment
    /// - [`OrderError::OverRefund`] when `amount` exceeds what remains
    /// - [`OrderError::Gateway`] when the provider rejects the refund (the
    ///   refund is marked failed) or times out (the refund stays pending until
    ///   the provider's webhook resolves it)
    #[tracing::instrument(skip(self, reason), fields(amount = amount.cents()))]
    pub async fn refund(&self, payment_id: PaymentId, amount: Money, reason: &str) -> Result<Refund, OrderError> {
        let order_id = self
            .orders
            .by_payment(payment_id)
            .await
            .ok_or(OrderError::PaymentNotFound(payment_id))?;
        let _workflow = self.orders.lock(order_id).await;
        self.refund_locked(order_id, Some(payment_id), RefundAmount::Exact(amount), reason)
            .await?
            .ok_or_else(|| OrderError::Validation("refund amount must be positive".to_string()))
    }

    /// Refund with the order's workflow lock already held by the caller.
    ///
    /// Returns `None` when [`RefundAmount::Outstanding`] finds nothing left.
    pub(crate) async fn refund_locked(
        &self,
        order_id: OrderId,
        payment_id: Option<PaymentId>,
        amount: RefundAmount,
        reason: &str,
    ) -> Result<Option<Refund>, OrderError> {
        let refund_id = RefundId::new();
        let (events, order) = self
            .orders
            .send(
                order_id,
                OrderCommand::RequestRefund {
                    refund_id,
                    payment_id,
                    amount,
                    reason: reason.to_string(),
                },
            )
            .await?;
        if events.is_empty() {
            return Ok(None);
        }

        let refund = order.refund(refund_id).cloned().ok_or(OrderError::RefundNotFound(refund_id))?;
        let charge = order
            .payment(refund.payment_id)
            .and_then(|payment| payment.provider_reference.clone())
            .ok_or(OrderError::PaymentNotFound(refund.payment_id))?;

        let outcome = match tokio::time::timeout(self.timeout, self.gateway.refund(&charge, refund.amount)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(GatewayError::Timeout),
        };

        match outcome {
            Ok(result) => {
                let (_, order) = self
                    .orders
                    .send(
                        order_id,
                        OrderCommand::CompleteRefund {
                            refund_id,
                            provider_reference: result.provider_reference,
                        },
                    )
                    .await?;
                metrics::record_refund(refund.amount.cents());
                tracing::info!(%refund_id, payment_status = %order.payment_status, "Refund completed");
                Ok(order.refund(refund_id).cloned())
            },
            Err(GatewayError::Timeout) => {
                tracing::warn!(%refund_id, "Refund outcome unknown; left pending for the provider webhook");
                Err(OrderError::Gateway(GatewayError::Timeout))
            },
            Err(error) => {
                self.orders
                    .send(
                        order_id,
                        OrderCommand::FailRefund {
                            refund_id,
                            reason: error.to_string(),
                        },
                    )
                    .await?;
                tracing::warn!(%refund_id, %error, "Refund rejected by provider");
                Err(OrderError::Gateway(error))
            },
        }
    }

    /// Resolve a pending refund as executed (provider webhook).
    ///
    /// # Errors
    ///
    /// [`OrderError::RefundNotFound`] or a conflicting terminal status.
    pub async fn confirm(&self, refund_id: RefundId, provider_reference: &str) -> Result<Refund, OrderError> {
        self.resolve(
            refund_id,
            OrderCommand::CompleteRefund {
                refund_id,
                provider_reference: provider_reference.to_string(),
            },
        )
        .await
    }

    /// Resolve a pending refund as rejected (provider webhook).
    ///
    /// # Errors
    ///
    /// [`OrderError::RefundNotFound`] or a conflicting terminal status.
    pub async fn reject(&self, refund_id: RefundId, reason: &str) -> Result<Refund, OrderError> {
        self.resolve(
            refund_id,
            OrderCommand::FailRefund {
                refund_id,
                reason: reason.to_string(),
            },
        )
        .await
    }

    async fn resolve(&self, refund_id: RefundId, command: OrderCommand) -> Result<Refund, OrderError> {
        let order_id = self
            .orders
            .by_refund(refund_id)
            .await
            .ok_or(OrderError::RefundNotFound(refund_id))?;
        let _workflow = self.orders.lock(order_id).await;
        let (events, order) = self.orders.send(order_id, command).await?;
        let refund = order.refund(refund_id).cloned().ok_or(OrderError::RefundNotFound(refund_id))?;
        if !events.is_empty() && refund.status == RefundStatus::Succeeded {
            metrics::record_refund(refund.amount.cents());
        }
        Ok(refund)
    }

    /// Refunds of a payment, oldest first.
    ///
    /// # Errors
    ///
    /// [`OrderError::PaymentNotFound`].
    pub async fn refunds(&self, payment_id: PaymentId) -> Result<Vec<Refund>, OrderError> {
        let order = self.order_for(payment_id).await?;
        Ok(order
            .refunds
            .into_iter()
            .filter(|refund| refund.payment_id == payment_id)
            .collect())
    }

    /// Amount of a payment that can still be refunded.
    ///
    /// # Errors
    ///
    /// [`OrderError::PaymentNotFound`].
    pub async fn remaining(&self, payment_id: PaymentId) -> Result<Money, OrderError> {
        let order = self.order_for(payment_id).await?;
        let payment = order.payment(payment_id).ok_or(OrderError::PaymentNotFound(payment_id))?;
        Ok(remaining(payment, &order.refunds))
    }

    async fn order_for(&self, payment_id: PaymentId) -> Result<Order, OrderError> {
        let order_id = self
            .orders
            .by_payment(payment_id)
            .await
            .ok_or(OrderError::PaymentNotFound(payment_id))?;
        self.orders.require(order_id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::order::tests::paid_order;
    use crate::order::PaymentStatus;
    use crate::payment_gateway::{MockBehavior, MockPaymentGateway};
    use fulfillment_testing::test_clock;

    async fn processor(gateway: &MockPaymentGateway) -> (RefundProcessor, PaymentId) {
        let book = Arc::new(OrderBook::new(Arc::new(test_clock())));
        let order = book.insert(paid_order(10)).await.unwrap();
        let shared: Arc<dyn PaymentGateway> = Arc::new(gateway.clone());
        (
            RefundProcessor::new(book, shared, Duration::from_millis(50)),
            order.payments[0].id,
        )
    }

    #[tokio::test]
    async fn refunds_up_to_the_payment_amount() {
        let gateway = MockPaymentGateway::new();
        let (processor, payment_id) = processor(&gateway).await;

        processor.refund(payment_id, Money::from_dollars(30), "damaged").await.unwrap();
        processor.refund(payment_id, Money::from_dollars(70), "returned").await.unwrap();

        let order = processor.order_for(payment_id).await.unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Refunded);
        assert_eq!(processor.remaining(payment_id).await.unwrap(), Money::ZERO);
        assert_eq!(gateway.refunds().len(), 2);
    }

    #[tokio::test]
    async fn over_refund_is_rejected_without_calling_the_provider() {
        let gateway = MockPaymentGateway::new();
        let (processor, payment_id) = processor(&gateway).await;

        processor.refund(payment_id, Money::from_dollars(30), "damaged").await.unwrap();
        let second = processor.refund(payment_id, Money::from_dollars(80), "damaged").await;

        assert!(matches!(second, Err(OrderError::OverRefund { .. })));
        assert_eq!(gateway.refunds().len(), 1);
        let order = processor.order_for(payment_id).await.unwrap();
        assert_eq!(order.payment_status, PaymentStatus::PartiallyRefunded);
    }

    #[tokio::test]
    async fn rejected_refund_frees_its_amount() {
        let gateway = MockPaymentGateway::new();
        gateway.set_refund_behavior(MockBehavior::Decline("card closed".to_string()));
        let (processor, payment_id) = processor(&gateway).await;

        let result = processor.refund(payment_id, Money::from_dollars(100), "damaged").await;
        assert!(matches!(result, Err(OrderError::Gateway(GatewayError::Rejected(_)))));

        let refunds = processor.refunds(payment_id).await.unwrap();
        assert_eq!(refunds[0].status, RefundStatus::Failed);
        assert_eq!(processor.remaining(payment_id).await.unwrap(), Money::from_dollars(100));
    }

    #[tokio::test]
    async fn timed_out_refund_stays_pending_until_confirmed() {
        let gateway = MockPaymentGateway::new();
        gateway.set_refund_behavior(MockBehavior::Hang);
        let (processor, payment_id) = processor(&gateway).await;

        let result = processor.refund(payment_id, Money::from_dollars(40), "late").await;
        assert_eq!(result.unwrap_err(), OrderError::Gateway(GatewayError::Timeout));

        let pending = processor.refunds(payment_id).await.unwrap().remove(0);
        assert_eq!(pending.status, RefundStatus::Pending);
        assert_eq!(processor.remaining(payment_id).await.unwrap(), Money::from_dollars(60));

        let confirmed = processor.confirm(pending.id, "re_late").await.unwrap();
        assert_eq!(confirmed.status, RefundStatus::Succeeded);
        let again = processor.confirm(pending.id, "re_late").await.unwrap();
        assert_eq!(again, confirmed);
    }

    #[test]
    fn remaining_ignores_failed_refunds() {
        let order = paid_order(1);
        let payment = &order.payments[0];
        let now = test_clock_now();
        let mut failed = Refund::pending(RefundId::new(), payment.id, Money::from_dollars(4), String::new(), now);
        failed.status = RefundStatus::Failed;
        let pending = Refund::pending(RefundId::new(), payment.id, Money::from_dollars(3), String::new(), now);

        assert_eq!(remaining(payment, &[failed, pending]), Money::from_dollars(7));
    }

    fn test_clock_now() -> DateTime<Utc> {
        use fulfillment_core::environment::Clock;
        test_clock().now()
    }
}
