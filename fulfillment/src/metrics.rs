//! Business metrics for the fulfillment workflow.
//!
//! Recorded through the `metrics` facade; nothing is exported unless a
//! binary installs a recorder (see `fulfillment_runtime::metrics`).

use crate::inventory::AdjustmentReason;
use metrics::{describe_counter, describe_histogram};

/// Register descriptions for all business metrics.
pub fn register_business_metrics() {
    describe_counter!(
        "fulfillment_checkouts_total",
        "Checkout attempts by outcome (succeeded, or the rejection kind such as insufficient_stock, coupon, payment_failed, ambiguous)"
    );
    describe_histogram!(
        "fulfillment_checkout_duration_seconds",
        "End-to-end checkout latency including payment capture"
    );
    describe_counter!(
        "fulfillment_reservations_total",
        "Inventory reservation operations by outcome (reserved, insufficient, committed, released)"
    );
    describe_counter!(
        "fulfillment_stock_adjustments_total",
        "Manual stock adjustments by reason"
    );
    describe_counter!(
        "fulfillment_payment_captures_total",
        "Payment capture outcomes (succeeded, failed, ambiguous, expired)"
    );
    describe_counter!("fulfillment_refunds_total", "Refunds completed");
    describe_counter!(
        "fulfillment_refunded_cents_total",
        "Money returned to customers, in cents"
    );
    describe_counter!("fulfillment_shipments_total", "Shipments created");
    describe_counter!(
        "fulfillment_coupon_redemptions_total",
        "Coupon applications by outcome (applied, rejected, rolled_back)"
    );
    describe_counter!(
        "fulfillment_reconciliations_total",
        "Pending orders handled by the reconciliation job, by resolution"
    );

    tracing::info!("Business metrics registered");
}

/// Record a finished checkout.
pub fn record_checkout(outcome: &'static str, duration_secs: f64) {
    metrics::counter!("fulfillment_checkouts_total", "outcome" => outcome).increment(1);
    metrics::histogram!("fulfillment_checkout_duration_seconds").record(duration_secs);
}

/// Record a reservation operation.
pub fn record_reservation(outcome: &'static str) {
    metrics::counter!("fulfillment_reservations_total", "outcome" => outcome).increment(1);
}

/// Record a manual stock adjustment.
pub fn record_stock_adjustment(reason: &AdjustmentReason) {
    let reason = match reason {
        AdjustmentReason::Receiving => "receiving",
        AdjustmentReason::Damage => "damage",
        AdjustmentReason::Correction => "correction",
        AdjustmentReason::CancellationRestock(_) => "cancellation_restock",
    };
    metrics::counter!("fulfillment_stock_adjustments_total", "reason" => reason).increment(1);
}

/// Record a payment capture outcome.
pub fn record_payment_capture(outcome: &'static str) {
    metrics::counter!("fulfillment_payment_captures_total", "outcome" => outcome).increment(1);
}

/// Record a completed refund.
///
/// # Arguments
///
/// * `amount_cents` - Refund amount in cents
pub fn record_refund(amount_cents: u64) {
    metrics::counter!("fulfillment_refunds_total").increment(1);
    metrics::counter!("fulfillment_refunded_cents_total").increment(amount_cents);
    tracing::debug!(amount_cents, "Recorded refund metric");
}

/// Record a created shipment.
pub fn record_shipment() {
    metrics::counter!("fulfillment_shipments_total").increment(1);
}

/// Record a coupon application outcome.
pub fn record_coupon_redemption(outcome: &'static str) {
    metrics::counter!("fulfillment_coupon_redemptions_total", "outcome" => outcome).increment(1);
}

/// Record how the reconciliation job resolved a pending order.
pub fn record_reconciliation(resolution: &'static str) {
    metrics::counter!("fulfillment_reconciliations_total", "resolution" => resolution).increment(1);
}
