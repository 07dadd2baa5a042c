//! Background resolution of ambiguous captures.
//!
//! A checkout whose capture timed out leaves its order `pending` with stock
//! held. Each pass asks the provider about every such order by idempotency
//! key and settles what it learns. Orders the provider has never heard of are
//! expired once they outlive the pending order lifetime, which returns their
//! stock. Lookup failures leave the order for the next pass.

use crate::config::ReconciliationConfig;
use crate::metrics;
use crate::order_book::OrderBook;
use crate::orchestrator::{CaptureResolution, OrderOrchestrator};
use crate::payment_gateway::{GatewayError, PaymentGateway};
use fulfillment_core::environment::Clock;
use fulfillment_runtime::retry::{retry_when, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Result of one reconciliation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Orders with an outstanding capture
    pub examined: usize,
    /// Captures found successful
    pub confirmed: usize,
    /// Captures found declined
    pub failed: usize,
    /// Orders expired without a provider record
    pub expired: usize,
    /// Orders left for the next pass
    pub unresolved: usize,
}

/// Periodic reconciler.
pub struct Reconciler {
    orders: Arc<OrderBook>,
    orchestrator: Arc<OrderOrchestrator>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    pending_order_ttl: chrono::Duration,
}

impl Reconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(
        orders: Arc<OrderBook>,
        orchestrator: Arc<OrderOrchestrator>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        config: &ReconciliationConfig,
    ) -> Self {
        let policy = RetryPolicy::builder()
            .max_retries(config.lookup_max_retries)
            .initial_delay(config.lookup_initial_delay)
            .max_delay(config.lookup_initial_delay.saturating_mul(8))
            .multiplier(2)
            .build();
        Self {
            orders,
            orchestrator,
            gateway,
            clock,
            policy,
            pending_order_ttl: chrono::Duration::from_std(config.pending_order_ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Examine every order with an outstanding capture once.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> ReconciliationReport {
        let mut report = ReconciliationReport::default();
        for order in self.orders.awaiting_capture().await {
            let Some(payment) = order.pending_payment().cloned() else {
                continue;
            };
            report.examined += 1;

            let lookup = retry_when(
                &self.policy,
                "payment_lookup",
                || self.gateway.lookup(&payment.idempotency_key),
                |error| matches!(error, GatewayError::Timeout | GatewayError::Unavailable(_)),
            )
            .await;

            let resolution = match lookup {
                Ok(Some(result)) => CaptureResolution::from(result),
                Ok(None) if self.clock.now() - order.created_at >= self.pending_order_ttl => CaptureResolution::Expired,
                Ok(None) => {
                    report.unresolved += 1;
                    continue;
                },
                Err(error) => {
                    tracing::warn!(order_id = %order.id, %error, "Provider lookup failed; retrying next pass");
                    metrics::record_reconciliation("lookup_failed");
                    report.unresolved += 1;
                    continue;
                },
            };

            let label = match &resolution {
                CaptureResolution::Succeeded { .. } => "confirmed",
                CaptureResolution::Failed { .. } => "failed",
                CaptureResolution::Expired => "expired",
            };
            match self.orchestrator.settle_capture(order.id, resolution.clone()).await {
                Ok(_) => {
                    metrics::record_reconciliation(label);
                    match resolution {
                        CaptureResolution::Succeeded { .. } => report.confirmed += 1,
                        CaptureResolution::Failed { .. } => report.failed += 1,
                        CaptureResolution::Expired => report.expired += 1,
                    }
                },
                Err(error) => {
                    tracing::error!(order_id = %order.id, %error, "Settling a reconciled capture failed");
                    report.unresolved += 1;
                },
            }
        }

        if report.examined > 0 {
            tracing::info!(?report, "Reconciliation pass complete");
        }
        report
    }

    /// Run a pass every `interval` until `shutdown` flips to `true`.
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("Reconciler stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
