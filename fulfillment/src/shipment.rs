//! Shipments and the shipment tracker.
//!
//! Shipments are owned by their order: creating one and updating its status
//! are order commands, so the over-shipment check runs against the same state
//! the shipment is appended to.

use crate::error::OrderError;
use crate::metrics;
use crate::order::{FulfillmentStatus, Order, OrderCommand, OrderEvent};
use crate::order_book::OrderBook;
use crate::types::{OrderId, OrderItemId, ShipmentId};
use chrono::{DateTime, Utc};
use fulfillment_core::environment::Clock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Carrier-side lifecycle of a shipment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    /// Label created
    Pending,
    /// Handed to the carrier
    Shipped,
    /// Moving through the carrier network
    InTransit,
    /// Delivered
    Delivered,
    /// Delivery attempt failed
    FailedDelivery,
    /// Sent back to the warehouse
    Returned,
}

impl ShipmentStatus {
    /// Whether `next` is reachable in one step.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Shipped)
                | (Self::Shipped, Self::InTransit | Self::Delivered | Self::FailedDelivery)
                | (Self::InTransit, Self::Delivered | Self::FailedDelivery)
                | (Self::FailedDelivery, Self::InTransit | Self::Returned)
                | (Self::Delivered, Self::Returned)
        )
    }

    /// Parse a carrier status name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "shipped" => Some(Self::Shipped),
            "in_transit" => Some(Self::InTransit),
            "delivered" => Some(Self::Delivered),
            "failed_delivery" => Some(Self::FailedDelivery),
            "returned" => Some(Self::Returned),
            _ => None,
        }
    }
}

impl fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Shipped => "shipped",
            Self::InTransit => "in_transit",
            Self::Delivered => "delivered",
            Self::FailedDelivery => "failed_delivery",
            Self::Returned => "returned",
        })
    }
}

/// Units of one order item in a shipment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentItem {
    /// Order line
    pub order_item_id: OrderItemId,
    /// Units shipped
    pub quantity: u32,
}

/// One entry of a shipment's timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentStatusChange {
    /// Status entered
    pub status: ShipmentStatus,
    /// When
    pub at: DateTime<Utc>,
}

/// A parcel sent for an order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shipment {
    /// Identity
    pub id: ShipmentId,
    /// Owning order
    pub order_id: OrderId,
    /// Carrier name
    pub carrier: String,
    /// Carrier tracking number
    pub tracking_number: String,
    /// Contents
    pub items: Vec<ShipmentItem>,
    /// Current status
    pub status: ShipmentStatus,
    /// Every status entered, oldest first
    pub history: Vec<ShipmentStatusChange>,
    /// Created
    pub created_at: DateTime<Utc>,
}

impl Shipment {
    /// A new shipment in `pending`.
    #[must_use]
    pub fn new(
        order_id: OrderId,
        carrier: String,
        tracking_number: String,
        items: Vec<ShipmentItem>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ShipmentId::new(),
            order_id,
            carrier,
            tracking_number,
            items,
            status: ShipmentStatus::Pending,
            history: vec![ShipmentStatusChange {
                status: ShipmentStatus::Pending,
                at,
            }],
            created_at: at,
        }
    }

    /// Total units in the shipment.
    #[must_use]
    pub fn units(&self) -> u32 {
        self.items.iter().fold(0, |sum, item| sum.saturating_add(item.quantity))
    }
}

/// Check that shipping `items` keeps every order item within its ordered
/// quantity, and return the fulfilment status that shipping them produces.
///
/// Repeated lines for the same item are summed before the check.
///
/// # Errors
///
/// [`OrderError::Validation`] for an empty shipment, a zero quantity, or an
/// item that is not on the order; [`OrderError::OverShipment`] when an item
/// would exceed its ordered quantity.
pub fn plan_fulfillment(order: &Order, items: &[ShipmentItem]) -> Result<FulfillmentStatus, OrderError> {
    if items.is_empty() {
        return Err(OrderError::Validation("shipment has no items".to_string()));
    }

    let mut requested: HashMap<OrderItemId, u32> = HashMap::new();
    for item in items {
        if item.quantity == 0 {
            return Err(OrderError::Validation(format!(
                "shipment quantity for item {} must be positive",
                item.order_item_id
            )));
        }
        let total = requested.entry(item.order_item_id).or_insert(0);
        *total = total.saturating_add(item.quantity);
    }

    for (item_id, quantity) in &requested {
        let item = order
            .item(*item_id)
            .ok_or_else(|| OrderError::Validation(format!("item {item_id} is not on order {}", order.id)))?;
        if item.fulfilled_quantity.saturating_add(*quantity) > item.quantity {
            return Err(OrderError::OverShipment {
                order_item_id: *item_id,
                ordered: item.quantity,
                already_shipped: item.fulfilled_quantity,
                requested: *quantity,
            });
        }
    }

    let fulfilled = order.items.iter().all(|item| {
        let shipping = requested.get(&item.id).copied().unwrap_or(0);
        item.fulfilled_quantity.saturating_add(shipping) == item.quantity
    });
    Ok(if fulfilled {
        FulfillmentStatus::Fulfilled
    } else {
        FulfillmentStatus::PartiallyFulfilled
    })
}

/// Creates shipments and applies carrier status updates.
pub struct ShipmentTracker {
    orders: Arc<OrderBook>,
    clock: Arc<dyn Clock>,
}

impl ShipmentTracker {
    /// Create a tracker over `orders`.
    #[must_use]
    pub fn new(orders: Arc<OrderBook>, clock: Arc<dyn Clock>) -> Self {
        Self { orders, clock }
    }

    /// Ship some units of an order.
    ///
    /// # Errors
    ///
    /// [`OrderError::OverShipment`] when any item would exceed its ordered
    /// quantity, [`OrderError::InvalidStateTransition`] when the order is not
    /// paid and confirmed or processing, [`OrderError::Validation`] for a
    /// tracking number already in use.
    #[tracing::instrument(skip(self, items), fields(lines = items.len()))]
    pub async fn create_shipment(
        &self,
        order_id: OrderId,
        items: Vec<ShipmentItem>,
        carrier: &str,
        tracking_number: &str,
    ) -> Result<Shipment, OrderError> {
        let tracking_number = tracking_number.trim();
        if tracking_number.is_empty() || carrier.trim().is_empty() {
            return Err(OrderError::Validation("carrier and tracking number are required".to_string()));
        }

        let _workflow = self.orders.lock(order_id).await;
        if !self.orders.claim_tracking_number(tracking_number).await {
            return Err(OrderError::Validation(format!(
                "tracking number {tracking_number} is already in use"
            )));
        }

        let shipment = Shipment::new(
            order_id,
            carrier.trim().to_string(),
            tracking_number.to_string(),
            items,
            self.clock.now(),
        );
        let shipment_id = shipment.id;
        let sent = self
            .orders
            .send(order_id, OrderCommand::CreateShipment(Box::new(shipment)))
            .await;
        self.orders.release_tracking_number(tracking_number).await;
        let (events, order) = sent?;

        if let Some(OrderEvent::ShipmentCreated {
            fulfillment_status,
            status,
            ..
        }) = events.first()
        {
            metrics::record_shipment();
            tracing::info!(%fulfillment_status, %status, "Shipment created");
        }
        order
            .shipment(shipment_id)
            .cloned()
            .ok_or(OrderError::ShipmentNotFound(shipment_id))
    }

    /// Move a shipment to `status`. Repeating the current status is a no-op.
    ///
    /// # Errors
    ///
    /// [`OrderError::ShipmentNotFound`] or an invalid shipment transition.
    #[tracing::instrument(skip(self))]
    pub async fn update_status(&self, shipment_id: ShipmentId, status: ShipmentStatus) -> Result<Shipment, OrderError> {
        let order_id = self
            .orders
            .by_shipment(shipment_id)
            .await
            .ok_or(OrderError::ShipmentNotFound(shipment_id))?;
        let _workflow = self.orders.lock(order_id).await;
        let (events, order) = self
            .orders
            .send(order_id, OrderCommand::UpdateShipment { shipment_id, status })
            .await?;

        if let Some(OrderEvent::ShipmentStatusChanged { order_status, .. }) = events.first() {
            tracing::info!(%status, %order_status, "Shipment status changed");
        }
        order
            .shipment(shipment_id)
            .cloned()
            .ok_or(OrderError::ShipmentNotFound(shipment_id))
    }

    /// Apply a carrier status webhook.
    ///
    /// # Errors
    ///
    /// [`OrderError::UnknownTrackingNumber`] or an invalid shipment transition.
    pub async fn carrier_update(&self, tracking_number: &str, status: ShipmentStatus) -> Result<Shipment, OrderError> {
        let (_, shipment_id) = self
            .orders
            .by_tracking_number(tracking_number)
            .await
            .ok_or_else(|| OrderError::UnknownTrackingNumber(tracking_number.to_string()))?;
        self.update_status(shipment_id, status).await
    }

    /// A shipment by tracking number.
    pub async fn by_tracking_number(&self, tracking_number: &str) -> Option<Shipment> {
        let (order_id, shipment_id) = self.orders.by_tracking_number(tracking_number).await?;
        self.orders.get(order_id).await?.shipment(shipment_id).cloned()
    }

    /// Every shipment of an order.
    ///
    /// # Errors
    ///
    /// [`OrderError::OrderNotFound`].
    pub async fn shipments(&self, order_id: OrderId) -> Result<Vec<Shipment>, OrderError> {
        Ok(self.orders.require(order_id).await?.shipments)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::order::tests::{paid_order, pending_order};
    use crate::order::OrderStatus;
    use fulfillment_testing::test_clock;

    async fn tracker_with(order: Order) -> (ShipmentTracker, Order) {
        let clock: Arc<dyn Clock> = Arc::new(test_clock());
        let book = Arc::new(OrderBook::new(Arc::clone(&clock)));
        let order = book.insert(order).await.unwrap();
        (ShipmentTracker::new(book, clock), order)
    }

    fn line(order: &Order, quantity: u32) -> Vec<ShipmentItem> {
        vec![ShipmentItem {
            order_item_id: order.items[0].id,
            quantity,
        }]
    }

    #[test]
    fn shipment_status_machine() {
        assert!(ShipmentStatus::Pending.can_transition_to(ShipmentStatus::Shipped));
        assert!(ShipmentStatus::FailedDelivery.can_transition_to(ShipmentStatus::InTransit));
        assert!(ShipmentStatus::Delivered.can_transition_to(ShipmentStatus::Returned));
        assert!(!ShipmentStatus::Delivered.can_transition_to(ShipmentStatus::InTransit));
        assert!(!ShipmentStatus::Pending.can_transition_to(ShipmentStatus::Delivered));
        assert_eq!(ShipmentStatus::parse("IN_TRANSIT"), Some(ShipmentStatus::InTransit));
    }

    #[test]
    fn duplicate_lines_are_summed_before_the_check() {
        let order = paid_order(5);
        let item = order.items[0].id;
        let items = [
            ShipmentItem {
                order_item_id: item,
                quantity: 3,
            },
            ShipmentItem {
                order_item_id: item,
                quantity: 3,
            },
        ];

        let result = plan_fulfillment(&order, &items);
        assert!(matches!(result, Err(OrderError::OverShipment { requested: 6, .. })));
    }

    #[tokio::test]
    async fn partial_then_full_shipment() {
        let (tracker, order) = tracker_with(paid_order(10)).await;

        tracker.create_shipment(order.id, line(&order, 6), "ups", "1Z-A").await.unwrap();
        let after_first = tracker.orders.get(order.id).await.unwrap();
        assert_eq!(after_first.fulfillment_status, FulfillmentStatus::PartiallyFulfilled);
        assert_eq!(after_first.status, OrderStatus::Processing);

        tracker.create_shipment(order.id, line(&order, 4), "ups", "1Z-B").await.unwrap();
        let after_second = tracker.orders.get(order.id).await.unwrap();
        assert_eq!(after_second.fulfillment_status, FulfillmentStatus::Fulfilled);
        assert_eq!(after_second.status, OrderStatus::Shipped);

        let third = tracker.create_shipment(order.id, line(&order, 1), "ups", "1Z-C").await;
        assert!(matches!(
            third,
            Err(OrderError::OverShipment {
                ordered: 10,
                already_shipped: 10,
                requested: 1,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn rejected_shipment_frees_its_tracking_number() {
        let (tracker, order) = tracker_with(paid_order(2)).await;

        let rejected = tracker.create_shipment(order.id, line(&order, 3), "ups", "1Z-R").await;
        assert!(matches!(rejected, Err(OrderError::OverShipment { .. })));

        let shipment = tracker.create_shipment(order.id, line(&order, 2), "ups", "1Z-R").await.unwrap();
        assert_eq!(shipment.tracking_number, "1Z-R");
        let reused = tracker.create_shipment(order.id, line(&order, 1), "ups", "1Z-R").await;
        assert!(matches!(reused, Err(OrderError::Validation(_))));
    }

    #[tokio::test]
    async fn unpaid_order_cannot_ship() {
        let (tracker, order) = tracker_with(pending_order(1)).await;

        let result = tracker.create_shipment(order.id, line(&order, 1), "ups", "1Z-P").await;
        assert!(matches!(result, Err(OrderError::InvalidStateTransition { .. })));
    }

    #[tokio::test]
    async fn delivery_of_every_shipment_delivers_the_order() {
        let (tracker, order) = tracker_with(paid_order(2)).await;
        tracker.create_shipment(order.id, line(&order, 2), "dhl", "JD1").await.unwrap();

        for status in [ShipmentStatus::Shipped, ShipmentStatus::InTransit, ShipmentStatus::Delivered] {
            tracker.carrier_update("JD1", status).await.unwrap();
        }
        let shipment = tracker.by_tracking_number("JD1").await.unwrap();
        let statuses: Vec<_> = shipment.history.iter().map(|change| change.status).collect();
        assert_eq!(
            statuses,
            vec![
                ShipmentStatus::Pending,
                ShipmentStatus::Shipped,
                ShipmentStatus::InTransit,
                ShipmentStatus::Delivered
            ]
        );
        assert_eq!(tracker.orders.get(order.id).await.unwrap().status, OrderStatus::Delivered);
    }

    #[tokio::test]
    async fn repeated_carrier_status_is_a_noop() {
        let (tracker, order) = tracker_with(paid_order(1)).await;
        tracker.create_shipment(order.id, line(&order, 1), "dhl", "JD2").await.unwrap();

        tracker.carrier_update("JD2", ShipmentStatus::Shipped).await.unwrap();
        let shipment = tracker.carrier_update("JD2", ShipmentStatus::Shipped).await.unwrap();
        assert_eq!(shipment.history.len(), 2);
    }

    #[tokio::test]
    async fn unknown_tracking_number_is_reported() {
        let (tracker, _) = tracker_with(paid_order(1)).await;
        let result = tracker.carrier_update("nope", ShipmentStatus::Shipped).await;
        assert_eq!(result.unwrap_err(), OrderError::UnknownTrackingNumber("nope".to_string()));
    }
}
