//! Inbound provider and carrier webhooks.
//!
//! Delivery is at-least-once. Each `(provider_reference, event_type)` pair is
//! processed at most once; a delivery that fails is forgotten so the sender's
//! retry is processed again.

use crate::error::OrderError;
use crate::order::OrderStatus;
use crate::order_book::OrderBook;
use crate::orchestrator::{CaptureResolution, OrderOrchestrator};
use crate::refund::RefundProcessor;
use crate::shipment::{ShipmentStatus, ShipmentTracker};
use crate::types::{IdempotencyKey, OrderId, RefundId};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Payment provider events the inbox understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PaymentEvent {
    /// A capture succeeded
    Captured,
    /// A capture was declined
    Failed,
    /// A refund was executed
    RefundSucceeded,
    /// A refund was rejected
    RefundFailed,
    /// The customer disputed the charge
    Disputed,
}

impl PaymentEvent {
    /// Map a provider event name; `None` for events the inbox ignores.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "payment.captured" | "payment.succeeded" => Some(Self::Captured),
            "payment.failed" => Some(Self::Failed),
            "refund.succeeded" => Some(Self::RefundSucceeded),
            "refund.failed" => Some(Self::RefundFailed),
            "charge.disputed" => Some(Self::Disputed),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Captured => "payment.captured",
            Self::Failed => "payment.failed",
            Self::RefundSucceeded => "refund.succeeded",
            Self::RefundFailed => "refund.failed",
            Self::Disputed => "charge.disputed",
        })
    }
}

/// What the inbox did with a delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Applied
    Processed,
    /// Already processed earlier
    Duplicate,
    /// Not an event the inbox acts on
    Ignored,
}

/// Deduplicating entry point for webhooks.
pub struct WebhookInbox {
    orchestrator: Arc<OrderOrchestrator>,
    orders: Arc<OrderBook>,
    refunds: Arc<RefundProcessor>,
    shipments: Arc<ShipmentTracker>,
    seen: Mutex<HashSet<(String, String)>>,
}

impl WebhookInbox {
    /// Create an inbox that has seen nothing.
    #[must_use]
    pub fn new(
        orchestrator: Arc<OrderOrchestrator>,
        orders: Arc<OrderBook>,
        refunds: Arc<RefundProcessor>,
        shipments: Arc<ShipmentTracker>,
    ) -> Self {
        Self {
            orchestrator,
            orders,
            refunds,
            shipments,
            seen: Mutex::new(HashSet::new()),
        }
    }

    async fn first_delivery(&self, reference: &str, event_type: &str) -> bool {
        self.seen
            .lock()
            .await
            .insert((reference.to_string(), event_type.to_string()))
    }

    async fn forget(&self, reference: &str, event_type: &str) {
        self.seen
            .lock()
            .await
            .remove(&(reference.to_string(), event_type.to_string()));
    }

    /// Handle a payment provider webhook.
    ///
    /// # Errors
    ///
    /// [`OrderError::Validation`] when the event cannot be matched to an order
    /// or refund, or any error from applying it. The delivery is not recorded
    /// as seen, so a redelivery is processed again.
    #[tracing::instrument(skip(self, payload))]
    pub async fn payment_webhook(
        &self,
        event_type: &str,
        provider_reference: &str,
        payload: &Value,
    ) -> Result<WebhookOutcome, OrderError> {
        let Some(event) = PaymentEvent::parse(event_type) else {
            tracing::debug!("Ignoring unhandled payment event");
            return Ok(WebhookOutcome::Ignored);
        };
        if !self.first_delivery(provider_reference, event_type).await {
            tracing::info!("Duplicate webhook delivery");
            return Ok(WebhookOutcome::Duplicate);
        }

        match self.apply_payment_event(event, provider_reference, payload).await {
            Ok(()) => Ok(WebhookOutcome::Processed),
            Err(error) => {
                self.forget(provider_reference, event_type).await;
                tracing::warn!(%error, "Webhook processing failed; awaiting redelivery");
                Err(error)
            },
        }
    }

    async fn apply_payment_event(&self, event: PaymentEvent, reference: &str, payload: &Value) -> Result<(), OrderError> {
        match event {
            PaymentEvent::Captured => {
                let order_id = self.locate_order(reference, payload).await?;
                self.orchestrator
                    .settle_capture(order_id, CaptureResolution::Succeeded {
                        provider_reference: reference.to_string(),
                    })
                    .await?;
            },
            PaymentEvent::Failed => {
                let order_id = self.locate_order(reference, payload).await?;
                let reason = payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("declined")
                    .to_string();
                self.orchestrator
                    .settle_capture(order_id, CaptureResolution::Failed { reason })
                    .await?;
            },
            PaymentEvent::RefundSucceeded => {
                self.refunds.confirm(refund_id(payload)?, reference).await?;
            },
            PaymentEvent::RefundFailed => {
                let reason = payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("rejected by provider");
                self.refunds.reject(refund_id(payload)?, reason).await?;
            },
            PaymentEvent::Disputed => {
                let order_id = self.locate_order(reference, payload).await?;
                let order = self.orchestrator.order(order_id).await?;
                if order.status != OrderStatus::Disputed {
                    self.orchestrator.update_status(order_id, OrderStatus::Disputed).await?;
                }
            },
        }
        Ok(())
    }

    async fn locate_order(&self, reference: &str, payload: &Value) -> Result<OrderId, OrderError> {
        if let Some(order_id) = self.orders.by_provider_reference(reference).await {
            return Ok(order_id);
        }
        let key = payload
            .get("idempotency_key")
            .and_then(Value::as_str)
            .and_then(IdempotencyKey::new);
        match key {
            Some(key) => self
                .orders
                .by_attempt_key(&key)
                .await
                .ok_or_else(|| OrderError::Validation(format!("no order for idempotency key {}", key.as_str()))),
            None => Err(OrderError::Validation(format!("no order for provider reference {reference}"))),
        }
    }

    /// Handle a carrier status webhook.
    ///
    /// # Errors
    ///
    /// [`OrderError::Validation`] for an unknown status name, or any error
    /// from the shipment tracker.
    #[tracing::instrument(skip(self))]
    pub async fn carrier_webhook(&self, tracking_number: &str, status: &str) -> Result<WebhookOutcome, OrderError> {
        let parsed = ShipmentStatus::parse(status)
            .ok_or_else(|| OrderError::Validation(format!("unknown shipment status {status}")))?;
        let event_type = format!("carrier.{parsed}");
        if !self.first_delivery(tracking_number, &event_type).await {
            return Ok(WebhookOutcome::Duplicate);
        }
        match self.shipments.carrier_update(tracking_number, parsed).await {
            Ok(_) => Ok(WebhookOutcome::Processed),
            Err(error) => {
                self.forget(tracking_number, &event_type).await;
                Err(error)
            },
        }
    }
}

fn refund_id(payload: &Value) -> Result<RefundId, OrderError> {
    payload
        .get("refund_id")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .map(RefundId::from_uuid)
        .ok_or_else(|| OrderError::Validation("refund webhook without a valid refund_id".to_string()))
}
