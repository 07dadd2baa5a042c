//! Payment gateway adapter.
//!
//! Thin contract around an external payment processor. The orchestrator only
//! ever talks to [`PaymentGateway`]; [`MockPaymentGateway`] stands in for a
//! real provider in development and tests and can be scripted to approve,
//! decline, hang, or drop responses.

use crate::types::{Currency, IdempotencyKey, Money, OrderId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Payment gateway result
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Boxed future returned by gateway calls
pub type GatewayFuture<T> = Pin<Box<dyn Future<Output = GatewayResult<T>> + Send>>;

/// Transport-level gateway failure.
///
/// During capture every variant means the outcome is unknown: the provider
/// may or may not have charged the customer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// No answer in time
    #[error("payment gateway timeout")]
    Timeout,
    /// The provider could not be reached
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),
    /// The provider rejected the request itself (bad reference, amount)
    #[error("payment gateway rejected the request: {0}")]
    Rejected(String),
}

/// Outcome of a capture as reported by the provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaptureOutcome {
    /// Funds captured
    Succeeded,
    /// Declined
    Failed {
        /// Provider's reason
        reason: String,
    },
}

/// Provider answer to a capture or lookup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentResult {
    /// Outcome
    pub outcome: CaptureOutcome,
    /// Provider's charge identifier
    pub provider_reference: String,
}

/// Provider answer to a refund.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundResult {
    /// Provider's refund identifier
    pub provider_reference: String,
}

/// Payment processor abstraction.
///
/// Implementations must honour the idempotency key: capturing twice with the
/// same key charges once and returns the original result.
pub trait PaymentGateway: Send + Sync {
    /// Capture `amount` for an order.
    ///
    /// # Errors
    ///
    /// Transport failures; a decline is a successful call with a failed
    /// outcome.
    fn capture(
        &self,
        order_id: OrderId,
        amount: Money,
        currency: &Currency,
        idempotency_key: &IdempotencyKey,
    ) -> GatewayFuture<PaymentResult>;

    /// Refund part or all of a captured charge.
    ///
    /// # Errors
    ///
    /// Transport failures or a provider rejection.
    fn refund(&self, provider_reference: &str, amount: Money) -> GatewayFuture<RefundResult>;

    /// Look up what happened to a capture, by idempotency key.
    ///
    /// `Ok(None)` means the provider has no record of it.
    ///
    /// # Errors
    ///
    /// Transport failures.
    fn lookup(&self, idempotency_key: &IdempotencyKey) -> GatewayFuture<Option<PaymentResult>>;
}

// ============================================================================
// Mock
// ============================================================================

/// Scripted response of the mock gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockBehavior {
    /// Succeed
    Approve,
    /// Decline with a reason (captures) or reject (refunds)
    Decline(String),
    /// Never answer and never record anything
    Hang,
    /// Record success at the provider, then never answer
    LoseResponse,
    /// Fail with [`GatewayError::Unavailable`]
    Unavailable,
}

#[derive(Debug)]
struct MockState {
    capture_behavior: MockBehavior,
    refund_behavior: MockBehavior,
    latency: Duration,
    captures: HashMap<IdempotencyKey, PaymentResult>,
    capture_calls: u32,
    refunds: Vec<(String, Money)>,
    failing_lookups: u32,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            capture_behavior: MockBehavior::Approve,
            refund_behavior: MockBehavior::Approve,
            latency: Duration::ZERO,
            captures: HashMap::new(),
            capture_calls: 0,
            refunds: Vec::new(),
            failing_lookups: 0,
        }
    }
}

/// In-memory payment provider for development and testing.
///
/// Clones share state, so a test can keep a handle while the orchestrator
/// owns another.
#[derive(Clone, Debug, Default)]
pub struct MockPaymentGateway {
    state: Arc<Mutex<MockState>>,
}

impl MockPaymentGateway {
    /// A gateway that approves everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A gateway that declines every capture
    #[must_use]
    pub fn declining(reason: impl Into<String>) -> Self {
        let gateway = Self::new();
        gateway.set_capture_behavior(MockBehavior::Decline(reason.into()));
        gateway
    }

    fn lock(&self) -> GatewayResult<MutexGuard<'_, MockState>> {
        self.state
            .lock()
            .map_err(|_| GatewayError::Unavailable("mock gateway state poisoned".to_string()))
    }

    fn update(&self, f: impl FnOnce(&mut MockState)) {
        if let Ok(mut state) = self.lock() {
            f(&mut state);
        }
    }

    /// Script subsequent captures
    pub fn set_capture_behavior(&self, behavior: MockBehavior) {
        self.update(|state| state.capture_behavior = behavior);
    }

    /// Script subsequent refunds
    pub fn set_refund_behavior(&self, behavior: MockBehavior) {
        self.update(|state| state.refund_behavior = behavior);
    }

    /// Simulated network delay for every call
    pub fn set_latency(&self, latency: Duration) {
        self.update(|state| state.latency = latency);
    }

    /// Make the next `count` lookups fail with `Unavailable`
    pub fn fail_next_lookups(&self, count: u32) {
        self.update(|state| state.failing_lookups = count);
    }

    /// Record a capture outcome at the provider, as if it completed out of
    /// band. Returns the provider reference.
    pub fn record_capture(&self, idempotency_key: &IdempotencyKey, outcome: CaptureOutcome) -> String {
        let result = PaymentResult {
            outcome,
            provider_reference: format!("mock_ch_{}", uuid::Uuid::new_v4()),
        };
        let reference = result.provider_reference.clone();
        self.update(|state| {
            state.captures.insert(idempotency_key.clone(), result);
        });
        reference
    }

    /// Number of capture calls received
    #[must_use]
    pub fn capture_calls(&self) -> u32 {
        self.lock().map_or(0, |state| state.capture_calls)
    }

    /// Refunds executed, as `(provider_reference, amount)`
    #[must_use]
    pub fn refunds(&self) -> Vec<(String, Money)> {
        self.lock().map(|state| state.refunds.clone()).unwrap_or_default()
    }

    /// The provider's record for a key
    #[must_use]
    pub fn capture_for(&self, idempotency_key: &IdempotencyKey) -> Option<PaymentResult> {
        self.lock()
            .ok()
            .and_then(|state| state.captures.get(idempotency_key).cloned())
    }
}

impl MockPaymentGateway {
    async fn capture_now(
        self,
        order_id: OrderId,
        amount: Money,
        currency: Currency,
        key: IdempotencyKey,
    ) -> GatewayResult<PaymentResult> {
        let (behavior, latency, existing) = {
            let mut state = self.lock()?;
            state.capture_calls += 1;
            (
                state.capture_behavior.clone(),
                state.latency,
                state.captures.get(&key).cloned(),
            )
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(existing) = existing {
            return Ok(existing);
        }

        let outcome = match behavior {
            MockBehavior::Approve => CaptureOutcome::Succeeded,
            MockBehavior::Decline(reason) => CaptureOutcome::Failed { reason },
            MockBehavior::Unavailable => {
                return Err(GatewayError::Unavailable("connection refused".to_string()));
            },
            MockBehavior::Hang => return futures::future::pending().await,
            MockBehavior::LoseResponse => {
                self.record_capture(&key, CaptureOutcome::Succeeded);
                return futures::future::pending().await;
            },
        };

        let reference = self.record_capture(&key, outcome.clone());
        tracing::info!(
            %order_id,
            amount = amount.cents(),
            %currency,
            provider_reference = %reference,
            ?outcome,
            "Mock capture processed"
        );
        Ok(PaymentResult {
            outcome,
            provider_reference: reference,
        })
    }

    async fn refund_now(self, charge: String, amount: Money) -> GatewayResult<RefundResult> {
        let (behavior, latency) = {
            let state = self.lock()?;
            (state.refund_behavior.clone(), state.latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match behavior {
            MockBehavior::Approve => {},
            MockBehavior::Decline(reason) => return Err(GatewayError::Rejected(reason)),
            MockBehavior::Unavailable => {
                return Err(GatewayError::Unavailable("connection refused".to_string()));
            },
            MockBehavior::Hang | MockBehavior::LoseResponse => return futures::future::pending().await,
        }

        self.lock()?.refunds.push((charge.clone(), amount));
        let reference = format!("mock_re_{}", uuid::Uuid::new_v4());
        tracing::info!(
            charge = %charge,
            amount = amount.cents(),
            refund_reference = %reference,
            "Mock refund processed"
        );
        Ok(RefundResult {
            provider_reference: reference,
        })
    }

    fn lookup_now(&self, key: &IdempotencyKey) -> GatewayResult<Option<PaymentResult>> {
        let mut state = self.lock()?;
        if state.failing_lookups > 0 {
            state.failing_lookups -= 1;
            return Err(GatewayError::Unavailable("lookup failed".to_string()));
        }
        Ok(state.captures.get(key).cloned())
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn capture(
        &self,
        order_id: OrderId,
        amount: Money,
        currency: &Currency,
        idempotency_key: &IdempotencyKey,
    ) -> GatewayFuture<PaymentResult> {
        Box::pin(
            self.clone()
                .capture_now(order_id, amount, currency.clone(), idempotency_key.clone()),
        )
    }

    fn refund(&self, provider_reference: &str, amount: Money) -> GatewayFuture<RefundResult> {
        Box::pin(self.clone().refund_now(provider_reference.to_string(), amount))
    }

    fn lookup(&self, idempotency_key: &IdempotencyKey) -> GatewayFuture<Option<PaymentResult>> {
        Box::pin(futures::future::ready(self.lookup_now(idempotency_key)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key(raw: &str) -> IdempotencyKey {
        IdempotencyKey::new(raw).unwrap()
    }

    #[tokio::test]
    async fn capture_is_idempotent_per_key() {
        let gateway = MockPaymentGateway::new();
        let first = gateway
            .capture(OrderId::new(), Money::from_dollars(10), &Currency::usd(), &key("k1"))
            .await
            .unwrap();
        let second = gateway
            .capture(OrderId::new(), Money::from_dollars(10), &Currency::usd(), &key("k1"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.outcome, CaptureOutcome::Succeeded);
        assert!(first.provider_reference.starts_with("mock_ch_"));
    }

    #[tokio::test]
    async fn declines_are_outcomes_not_errors() {
        let gateway = MockPaymentGateway::declining("card_declined");
        let result = gateway
            .capture(OrderId::new(), Money::from_dollars(10), &Currency::usd(), &key("k2"))
            .await
            .unwrap();

        assert_eq!(
            result.outcome,
            CaptureOutcome::Failed {
                reason: "card_declined".to_string()
            }
        );
    }

    #[tokio::test]
    async fn lost_response_is_still_visible_to_lookup() {
        let gateway = MockPaymentGateway::new();
        gateway.set_capture_behavior(MockBehavior::LoseResponse);

        let timed_out = tokio::time::timeout(
            Duration::from_millis(20),
            gateway.capture(OrderId::new(), Money::from_dollars(10), &Currency::usd(), &key("k3")),
        )
        .await;
        assert!(timed_out.is_err());

        gateway.fail_next_lookups(1);
        assert!(gateway.lookup(&key("k3")).await.is_err());
        let found = gateway.lookup(&key("k3")).await.unwrap().unwrap();
        assert_eq!(found.outcome, CaptureOutcome::Succeeded);
        assert_eq!(gateway.lookup(&key("unknown")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn refunds_are_recorded() {
        let gateway = MockPaymentGateway::new();
        gateway.refund("mock_ch_1", Money::from_dollars(3)).await.unwrap();

        gateway.set_refund_behavior(MockBehavior::Decline("charge_disputed".to_string()));
        assert_eq!(
            gateway.refund("mock_ch_1", Money::from_dollars(3)).await,
            Err(GatewayError::Rejected("charge_disputed".to_string()))
        );
        assert_eq!(gateway.refunds(), vec![("mock_ch_1".to_string(), Money::from_dollars(3))]);
    }
}
