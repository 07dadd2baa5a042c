//! Order storage and lookup indexes.
//!
//! Each order is a single-writer store, so the reducer checks in
//! [`crate::order`] see one consistent state per command. Workflows that span
//! several commands and an external call (capture, then commit; request a
//! refund, call the provider, then complete it) additionally take the order's
//! workflow lock, which serialises them per order without touching any other
//! order.

use crate::error::OrderError;
use crate::order::{Order, OrderCommand, OrderEnvironment, OrderEvent, OrderReducer, OrderStatus, PaymentAttemptStatus};
use crate::types::{IdempotencyKey, OrderId, OrderNumber, PaymentId, RefundId, ShipmentId};
use fulfillment_core::environment::Clock;
use fulfillment_core::journal::Journal;
use fulfillment_core::reducer::Events;
use fulfillment_core::stream::StreamId;
use fulfillment_runtime::{InMemoryJournal, KeyedStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

const KIND: &str = "order";

/// Outcome of claiming a checkout idempotency key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Claim {
    /// First use of the key; the caller owns the checkout
    New,
    /// Key already used; the order exists
    Existing(OrderId),
    /// Key already used by a checkout that has not created its order yet
    InFlight,
}

#[derive(Default)]
struct Indexes {
    by_number: HashMap<OrderNumber, OrderId>,
    by_checkout_key: HashMap<IdempotencyKey, Option<OrderId>>,
    by_payment: HashMap<PaymentId, OrderId>,
    by_attempt_key: HashMap<IdempotencyKey, OrderId>,
    by_provider_reference: HashMap<String, OrderId>,
    by_tracking_number: HashMap<String, (OrderId, ShipmentId)>,
    by_shipment: HashMap<ShipmentId, OrderId>,
    by_refund: HashMap<RefundId, OrderId>,
    tracking_claims: HashSet<String>,
}

impl Indexes {
    fn index_order(&mut self, order: &Order) {
        self.by_number.insert(order.number.clone(), order.id);
        for payment in &order.payments {
            self.by_payment.insert(payment.id, order.id);
            self.by_attempt_key.insert(payment.idempotency_key.clone(), order.id);
            if let Some(reference) = &payment.provider_reference {
                self.by_provider_reference.insert(reference.clone(), order.id);
            }
        }
        for refund in &order.refunds {
            self.by_refund.insert(refund.id, order.id);
            if let Some(reference) = &refund.provider_reference {
                self.by_provider_reference.insert(reference.clone(), order.id);
            }
        }
        for shipment in &order.shipments {
            self.by_shipment.insert(shipment.id, order.id);
            self.by_tracking_number
                .insert(shipment.tracking_number.clone(), (order.id, shipment.id));
        }
    }
}

/// All orders, their journal, and secondary indexes.
pub struct OrderBook {
    orders: KeyedStore<OrderId, OrderReducer>,
    journal: Arc<InMemoryJournal<OrderEvent>>,
    indexes: RwLock<Indexes>,
    workflow_locks: Mutex<HashMap<OrderId, Arc<Mutex<()>>>>,
}

impl OrderBook {
    /// Create an empty book.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let journal = Arc::new(InMemoryJournal::new());
        let shared: Arc<dyn Journal<OrderEvent>> = journal.clone();
        let orders = KeyedStore::new(KIND, OrderReducer, OrderEnvironment { clock }).with_journal(shared);
        Self {
            orders,
            journal,
            indexes: RwLock::new(Indexes::default()),
            workflow_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Claim a checkout idempotency key.
    pub async fn claim(&self, key: &IdempotencyKey) -> Claim {
        let mut indexes = self.indexes.write().await;
        match indexes.by_checkout_key.get(key) {
            Some(Some(order_id)) => Claim::Existing(*order_id),
            Some(None) => Claim::InFlight,
            None => {
                indexes.by_checkout_key.insert(key.clone(), None);
                Claim::New
            },
        }
    }

    /// Give up a claim whose checkout failed before creating an order, so the
    /// key can be retried.
    pub async fn unclaim(&self, key: &IdempotencyKey) {
        let mut indexes = self.indexes.write().await;
        if matches!(indexes.by_checkout_key.get(key), Some(None)) {
            indexes.by_checkout_key.remove(key);
        }
    }

    /// Store a new order.
    ///
    /// # Errors
    ///
    /// [`OrderError::Validation`] when the order id is taken or the order is
    /// malformed, or a journal failure.
    pub async fn insert(&self, order: Order) -> Result<Order, OrderError> {
        let order_id = order.id;
        let store = self
            .orders
            .create(order_id, None)
            .await
            .ok_or_else(|| OrderError::Validation(format!("order {order_id} already exists")))?;
        let checkout_key = order.idempotency_key.clone();
        if let Err(error) = store.send(OrderCommand::Place(Box::new(order))).await {
            self.orders.remove(&order_id).await;
            return Err(error);
        }
        let order = store
            .state(Option::clone)
            .await
            .ok_or(OrderError::OrderNotFound(order_id))?;

        let mut indexes = self.indexes.write().await;
        indexes.by_checkout_key.insert(checkout_key, Some(order_id));
        indexes.index_order(&order);
        Ok(order)
    }

    /// Send a command to an order and refresh the indexes.
    ///
    /// Returns the events that were applied (empty for an accepted no-op) and
    /// the order afterwards.
    ///
    /// # Errors
    ///
    /// [`OrderError::OrderNotFound`] or the reducer's rejection.
    pub async fn send(&self, order_id: OrderId, command: OrderCommand) -> Result<(Events<OrderEvent>, Order), OrderError> {
        let store = self
            .orders
            .get(&order_id)
            .await
            .ok_or(OrderError::OrderNotFound(order_id))?;
        let events = store.send(command).await?;
        let order = store
            .state(Option::clone)
            .await
            .ok_or(OrderError::OrderNotFound(order_id))?;
        if !events.is_empty() {
            self.indexes.write().await.index_order(&order);
        }
        Ok((events, order))
    }

    /// Take the order's workflow lock.
    ///
    /// Held across a whole multi-step workflow, including provider calls, so
    /// two workflows on one order never interleave. Never held across two
    /// orders at once.
    pub async fn lock(&self, order_id: OrderId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.workflow_locks.lock().await;
            Arc::clone(locks.entry(order_id).or_default())
        };
        lock.lock_owned().await
    }

    /// Snapshot of one order.
    pub async fn get(&self, order_id: OrderId) -> Option<Order> {
        let store = self.orders.get(&order_id).await?;
        store.state(Option::clone).await
    }

    /// Snapshot of one order, or `OrderNotFound`.
    ///
    /// # Errors
    ///
    /// [`OrderError::OrderNotFound`].
    pub async fn require(&self, order_id: OrderId) -> Result<Order, OrderError> {
        self.get(order_id).await.ok_or(OrderError::OrderNotFound(order_id))
    }

    /// Order by its human-readable number.
    pub async fn by_number(&self, number: &str) -> Option<Order> {
        let number = OrderNumber::parse(number)?;
        let order_id = self.indexes.read().await.by_number.get(&number).copied()?;
        self.get(order_id).await
    }

    /// Order owning a payment attempt.
    pub async fn by_payment(&self, payment_id: PaymentId) -> Option<OrderId> {
        self.indexes.read().await.by_payment.get(&payment_id).copied()
    }

    /// Order owning a capture attempt sent with `key`.
    pub async fn by_attempt_key(&self, key: &IdempotencyKey) -> Option<OrderId> {
        self.indexes.read().await.by_attempt_key.get(key).copied()
    }

    /// Order owning a provider charge or refund reference.
    pub async fn by_provider_reference(&self, reference: &str) -> Option<OrderId> {
        self.indexes.read().await.by_provider_reference.get(reference).copied()
    }

    /// Order and shipment carrying a tracking number.
    pub async fn by_tracking_number(&self, tracking_number: &str) -> Option<(OrderId, ShipmentId)> {
        self.indexes
            .read()
            .await
            .by_tracking_number
            .get(tracking_number)
            .copied()
    }

    /// Order owning a shipment.
    pub async fn by_shipment(&self, shipment_id: ShipmentId) -> Option<OrderId> {
        self.indexes.read().await.by_shipment.get(&shipment_id).copied()
    }

    /// Order owning a refund.
    pub async fn by_refund(&self, refund_id: RefundId) -> Option<OrderId> {
        self.indexes.read().await.by_refund.get(&refund_id).copied()
    }

    /// Reserve a tracking number for a shipment about to be created.
    ///
    /// Returns `false` when any order already ships under the number or
    /// another shipment holds a claim on it. The check and the claim happen
    /// under one index write lock. Every successful claim must be followed by
    /// [`Self::release_tracking_number`] once the shipment command finished.
    pub async fn claim_tracking_number(&self, tracking_number: &str) -> bool {
        let mut indexes = self.indexes.write().await;
        if indexes.by_tracking_number.contains_key(tracking_number) {
            return false;
        }
        indexes.tracking_claims.insert(tracking_number.to_string())
    }

    /// Drop a claim taken by [`Self::claim_tracking_number`]. A shipment that
    /// was created keeps the number through its index entry.
    pub async fn release_tracking_number(&self, tracking_number: &str) {
        self.indexes.write().await.tracking_claims.remove(tracking_number);
    }

    /// Snapshot of every order.
    pub async fn orders(&self) -> Vec<Order> {
        let mut orders = Vec::new();
        for (_, store) in self.orders.entries().await {
            if let Some(order) = store.state(Option::clone).await {
                orders.push(order);
            }
        }
        orders.sort_by_key(|order| order.created_at);
        orders
    }

    /// Orders still waiting on a capture outcome.
    pub async fn awaiting_capture(&self) -> Vec<Order> {
        self.orders()
            .await
            .into_iter()
            .filter(|order| {
                matches!(order.status, OrderStatus::Pending | OrderStatus::Cancelled)
                    && order
                        .payments
                        .iter()
                        .any(|payment| payment.status == PaymentAttemptStatus::Pending)
            })
            .collect()
    }

    /// The journaled events of one order, oldest first.
    ///
    /// # Errors
    ///
    /// A journal failure.
    pub async fn events(&self, order_id: OrderId) -> Result<Vec<OrderEvent>, OrderError> {
        Ok(self.journal.load(StreamId::for_key(KIND, order_id)).await?)
    }

    /// Rebuild an order from its journal and compare with the live state.
    ///
    /// # Errors
    ///
    /// [`OrderError::OrderNotFound`] or a journal failure.
    pub async fn verify(&self, order_id: OrderId) -> Result<bool, OrderError> {
        let store = self
            .orders
            .get(&order_id)
            .await
            .ok_or(OrderError::OrderNotFound(order_id))?;
        Ok(store.compare_with_replay(None, |live, replayed| live == replayed).await?)
    }

    /// Number of orders.
    pub async fn len(&self) -> usize {
        self.orders.len().await
    }

    /// Whether no order exists.
    pub async fn is_empty(&self) -> bool {
        self.orders.is_empty().await
    }
}
