//! Cart manager.
//!
//! Carts accumulate line items with a unit-price snapshot until checkout.
//! Each cart idles out `ttl` after its last change; reading or mutating an
//! expired cart fails with [`CartError::Expired`] and the sweeper drops them.
//! Carts are not journaled: they are destroyed on checkout or expiry.

use crate::types::{CartId, CartOwner, Currency, LineItem, Money, ProductId, VariantId};
use chrono::{DateTime, Utc};
use fulfillment_core::environment::Clock;
use fulfillment_core::journal::JournalError;
use fulfillment_core::reducer::{Events, Reducer};
use fulfillment_core::smallvec;
use fulfillment_runtime::KeyedStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Cart errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CartError {
    /// No such cart
    #[error("cart not found: {0}")]
    NotFound(CartId),

    /// The cart idled past its expiry
    #[error("cart {0} has expired")]
    Expired(CartId),

    /// Checkout of a cart with no lines
    #[error("cart {0} is empty")]
    Empty(CartId),

    /// Added quantities must be positive
    #[error("quantity must be positive")]
    InvalidQuantity,

    /// The cart has no such line
    #[error("cart has no line for {product_id}/{variant_id}")]
    ItemNotFound {
        /// Product
        product_id: ProductId,
        /// Variant
        variant_id: VariantId,
    },

    /// Merged quantity or line total overflowed
    #[error("cart totals overflow")]
    Overflow,

    /// Events could not be persisted
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// A shopping cart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    /// Identity
    pub id: CartId,
    /// Customer or anonymous session
    pub owner: CartOwner,
    /// Currency every price snapshot is in
    pub currency: Currency,
    /// Lines in the order they were first added
    pub lines: Vec<LineItem>,
    /// Created
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
    /// Idle expiry
    pub expires_at: DateTime<Utc>,
}

impl Cart {
    /// Whether the cart has no lines
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Whether the cart has idled out at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Sum of line totals, `None` on overflow
    #[must_use]
    pub fn subtotal(&self) -> Option<Money> {
        self.lines
            .iter()
            .map(LineItem::line_total)
            .try_fold(Money::ZERO, |sum, line| sum.checked_add(line?))
    }

    /// The line for a product variant
    #[must_use]
    pub fn line(&self, product_id: &ProductId, variant_id: &VariantId) -> Option<&LineItem> {
        self.lines.iter().find(|line| line.is_for(product_id, variant_id))
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Commands accepted by a cart.
#[derive(Clone, Debug)]
pub enum CartCommand {
    /// Open the cart
    Create {
        /// Identity
        id: CartId,
        /// Owner
        owner: CartOwner,
        /// Currency
        currency: Currency,
    },
    /// Add units, merging with an existing line
    AddItem(LineItem),
    /// Replace a line's quantity; zero removes it
    SetQuantity {
        /// Product
        product_id: ProductId,
        /// Variant
        variant_id: VariantId,
        /// New quantity
        quantity: u32,
    },
    /// Drop a line
    RemoveItem {
        /// Product
        product_id: ProductId,
        /// Variant
        variant_id: VariantId,
    },
}

/// Facts recorded about a cart. Every event pushes the expiry forward.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CartEvent {
    /// Cart opened
    Created {
        /// Identity
        id: CartId,
        /// Owner
        owner: CartOwner,
        /// Currency
        currency: Currency,
        /// When
        at: DateTime<Utc>,
        /// New expiry
        expires_at: DateTime<Utc>,
    },
    /// Units added (merged into an existing line if present)
    ItemAdded {
        /// Line as submitted
        line: LineItem,
        /// When
        at: DateTime<Utc>,
        /// New expiry
        expires_at: DateTime<Utc>,
    },
    /// Quantity replaced
    QuantityChanged {
        /// Product
        product_id: ProductId,
        /// Variant
        variant_id: VariantId,
        /// New quantity
        quantity: u32,
        /// When
        at: DateTime<Utc>,
        /// New expiry
        expires_at: DateTime<Utc>,
    },
    /// Line dropped
    ItemRemoved {
        /// Product
        product_id: ProductId,
        /// Variant
        variant_id: VariantId,
        /// When
        at: DateTime<Utc>,
        /// New expiry
        expires_at: DateTime<Utc>,
    },
}

/// Injected dependencies.
#[derive(Clone)]
pub struct CartEnvironment {
    /// Expiry clock
    pub clock: Arc<dyn Clock>,
    /// Idle lifetime
    pub ttl: chrono::Duration,
}

/// Reducer for one cart.
#[derive(Clone, Copy, Debug, Default)]
pub struct CartReducer;

impl Reducer for CartReducer {
    type State = Option<Cart>;
    type Command = CartCommand;
    type Event = CartEvent;
    type Error = CartError;
    type Environment = CartEnvironment;

    fn reduce(
        &self,
        state: &Option<Cart>,
        command: CartCommand,
        env: &CartEnvironment,
    ) -> Result<Events<CartEvent>, CartError> {
        let at = env.clock.now();
        let expires_at = at + env.ttl;

        if let CartCommand::Create { id, owner, currency } = command {
            return Ok(match state {
                Some(_) => Events::new(),
                None => smallvec![CartEvent::Created {
                    id,
                    owner,
                    currency,
                    at,
                    expires_at,
                }],
            });
        }

        let Some(cart) = state else {
            return Err(CartError::NotFound(CartId::default()));
        };
        if cart.is_expired(at) {
            return Err(CartError::Expired(cart.id));
        }

        match command {
            CartCommand::Create { .. } => Ok(Events::new()),
            CartCommand::AddItem(line) => {
                if line.quantity == 0 {
                    return Err(CartError::InvalidQuantity);
                }
                let merged = cart
                    .line(&line.product_id, &line.variant_id)
                    .map_or(Some(line.quantity), |existing| existing.quantity.checked_add(line.quantity))
                    .ok_or(CartError::Overflow)?;
                line.unit_price.checked_multiply(merged).ok_or(CartError::Overflow)?;
                Ok(smallvec![CartEvent::ItemAdded { line, at, expires_at }])
            },
            CartCommand::SetQuantity {
                product_id,
                variant_id,
                quantity,
            } => {
                let existing = cart
                    .line(&product_id, &variant_id)
                    .ok_or_else(|| CartError::ItemNotFound {
                        product_id: product_id.clone(),
                        variant_id: variant_id.clone(),
                    })?;
                if quantity == 0 {
                    return Ok(smallvec![CartEvent::ItemRemoved {
                        product_id,
                        variant_id,
                        at,
                        expires_at,
                    }]);
                }
                existing
                    .unit_price
                    .checked_multiply(quantity)
                    .ok_or(CartError::Overflow)?;
                Ok(smallvec![CartEvent::QuantityChanged {
                    product_id,
                    variant_id,
                    quantity,
                    at,
                    expires_at,
                }])
            },
            CartCommand::RemoveItem {
                product_id,
                variant_id,
            } => {
                if cart.line(&product_id, &variant_id).is_none() {
                    return Err(CartError::ItemNotFound {
                        product_id,
                        variant_id,
                    });
                }
                Ok(smallvec![CartEvent::ItemRemoved {
                    product_id,
                    variant_id,
                    at,
                    expires_at,
                }])
            },
        }
    }

    fn apply(&self, state: &mut Option<Cart>, event: &CartEvent) {
        if let CartEvent::Created {
            id,
            owner,
            currency,
            at,
            expires_at,
        } = event
        {
            *state = Some(Cart {
                id: *id,
                owner: owner.clone(),
                currency: currency.clone(),
                lines: Vec::new(),
                created_at: *at,
                updated_at: *at,
                expires_at: *expires_at,
            });
            return;
        }
        let Some(cart) = state else {
            return;
        };

        match event {
            CartEvent::Created { .. } => {},
            CartEvent::ItemAdded { line, at, expires_at } => {
                match cart
                    .lines
                    .iter_mut()
                    .find(|existing| existing.is_for(&line.product_id, &line.variant_id))
                {
                    Some(existing) => existing.quantity = existing.quantity.saturating_add(line.quantity),
                    None => cart.lines.push(line.clone()),
                }
                cart.updated_at = *at;
                cart.expires_at = *expires_at;
            },
            CartEvent::QuantityChanged {
                product_id,
                variant_id,
                quantity,
                at,
                expires_at,
            } => {
                if let Some(line) = cart
                    .lines
                    .iter_mut()
                    .find(|line| line.is_for(product_id, variant_id))
                {
                    line.quantity = *quantity;
                }
                cart.updated_at = *at;
                cart.expires_at = *expires_at;
            },
            CartEvent::ItemRemoved {
                product_id,
                variant_id,
                at,
                expires_at,
            } => {
                cart.lines.retain(|line| !line.is_for(product_id, variant_id));
                cart.updated_at = *at;
                cart.expires_at = *expires_at;
            },
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Creates, mutates, and expires carts.
pub struct CartManager {
    carts: KeyedStore<CartId, CartReducer>,
    clock: Arc<dyn Clock>,
    currency: Currency,
}

impl CartManager {
    /// Create a manager whose carts idle out after `ttl`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, ttl: chrono::Duration, currency: Currency) -> Self {
        let env = CartEnvironment {
            clock: Arc::clone(&clock),
            ttl,
        };
        Self {
            carts: KeyedStore::new("cart", CartReducer, env),
            clock,
            currency,
        }
    }

    async fn send(&self, cart_id: CartId, command: CartCommand) -> Result<Cart, CartError> {
        let store = self.carts.get(&cart_id).await.ok_or(CartError::NotFound(cart_id))?;
        store.send(command).await.map_err(|error| match error {
            CartError::NotFound(_) => CartError::NotFound(cart_id),
            other => other,
        })?;
        store
            .state(Option::clone)
            .await
            .ok_or(CartError::NotFound(cart_id))
    }

    /// Open a new cart.
    ///
    /// # Errors
    ///
    /// Journal failures only.
    pub async fn create(&self, owner: CartOwner) -> Result<Cart, CartError> {
        let id = CartId::new();
        let store = self.carts.get_or_create(&id, || None).await;
        store
            .send(CartCommand::Create {
                id,
                owner,
                currency: self.currency.clone(),
            })
            .await?;
        let cart = store.state(Option::clone).await.ok_or(CartError::NotFound(id))?;
        tracing::debug!(cart_id = %id, "Cart created");
        Ok(cart)
    }

    /// Add units of a product variant. An existing line keeps its original
    /// price snapshot and gains the quantity.
    ///
    /// # Errors
    ///
    /// [`CartError::NotFound`], [`CartError::Expired`], or
    /// [`CartError::InvalidQuantity`].
    pub async fn add_item(&self, cart_id: CartId, line: LineItem) -> Result<Cart, CartError> {
        self.send(cart_id, CartCommand::AddItem(line)).await
    }

    /// Replace a line's quantity; zero removes the line.
    ///
    /// # Errors
    ///
    /// [`CartError::ItemNotFound`] if the cart has no such line.
    pub async fn set_quantity(
        &self,
        cart_id: CartId,
        product_id: ProductId,
        variant_id: VariantId,
        quantity: u32,
    ) -> Result<Cart, CartError> {
        self.send(cart_id, CartCommand::SetQuantity {
            product_id,
            variant_id,
            quantity,
        })
        .await
    }

    /// Remove a line.
    ///
    /// # Errors
    ///
    /// [`CartError::ItemNotFound`] if the cart has no such line.
    pub async fn remove_item(&self, cart_id: CartId, product_id: ProductId, variant_id: VariantId) -> Result<Cart, CartError> {
        self.send(cart_id, CartCommand::RemoveItem {
            product_id,
            variant_id,
        })
        .await
    }

    /// Current contents of a cart.
    ///
    /// # Errors
    ///
    /// [`CartError::NotFound`] or [`CartError::Expired`].
    pub async fn get(&self, cart_id: CartId) -> Result<Cart, CartError> {
        let store = self.carts.get(&cart_id).await.ok_or(CartError::NotFound(cart_id))?;
        let cart = store
            .state(Option::clone)
            .await
            .ok_or(CartError::NotFound(cart_id))?;
        if cart.is_expired(self.clock.now()) {
            return Err(CartError::Expired(cart_id));
        }
        Ok(cart)
    }

    /// Destroy a cart. Returns whether it existed.
    pub async fn discard(&self, cart_id: CartId) -> bool {
        self.carts.remove(&cart_id).await.is_some()
    }

    /// Drop every cart that has idled out. Returns how many were dropped.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut swept = 0;
        for (cart_id, store) in self.carts.entries().await {
            let expired = store
                .state(|cart| cart.as_ref().is_none_or(|cart| cart.is_expired(now)))
                .await;
            if expired && self.carts.remove(&cart_id).await.is_some() {
                swept += 1;
            }
        }
        if swept > 0 {
            tracing::info!(swept, "Expired carts swept");
        }
        swept
    }

    /// Number of live carts, expired ones included until swept.
    pub async fn len(&self) -> usize {
        self.carts.len().await
    }

    /// Whether there are no carts.
    pub async fn is_empty(&self) -> bool {
        self.carts.is_empty().await
    }

    /// Sweep expired carts every `interval` until `shutdown` flips to `true`.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_expired().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("Cart sweeper stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{CustomerId, SessionId};
    use fulfillment_testing::{test_clock, ManualClock};

    fn item(product: &str, cents: u64, quantity: u32) -> LineItem {
        LineItem {
            product_id: ProductId::new(product),
            variant_id: VariantId::new("std"),
            category_id: None,
            name: product.to_string(),
            quantity,
            unit_price: Money::from_cents(cents),
        }
    }

    fn manager() -> (CartManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(test_clock().now()));
        let carts = CartManager::new(clock.clone(), chrono::Duration::minutes(30), Currency::usd());
        (carts, clock)
    }

    #[tokio::test]
    async fn adding_the_same_variant_merges_and_keeps_first_price() {
        let (carts, _) = manager();
        let cart = carts.create(CartOwner::Customer(CustomerId::new("c-1"))).await.unwrap();

        carts.add_item(cart.id, item("sku-x", 1_000, 1)).await.unwrap();
        let cart = carts.add_item(cart.id, item("sku-x", 1_200, 2)).await.unwrap();

        assert_eq!(cart.lines.len(), 1);
        assert_eq!(cart.lines[0].quantity, 3);
        assert_eq!(cart.lines[0].unit_price, Money::from_cents(1_000));
        assert_eq!(cart.subtotal(), Some(Money::from_cents(3_000)));
    }

    #[tokio::test]
    async fn zero_quantity_removes_the_line() {
        let (carts, _) = manager();
        let cart = carts.create(CartOwner::Session(SessionId::new("s-1"))).await.unwrap();
        carts.add_item(cart.id, item("sku-x", 500, 2)).await.unwrap();

        let cart = carts
            .set_quantity(cart.id, ProductId::new("sku-x"), VariantId::new("std"), 0)
            .await
            .unwrap();

        assert!(cart.is_empty());
        assert!(matches!(
            carts.remove_item(cart.id, ProductId::new("sku-x"), VariantId::new("std")).await,
            Err(CartError::ItemNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn idle_carts_expire_and_are_swept() {
        let (carts, clock) = manager();
        let idle = carts.create(CartOwner::Session(SessionId::new("s-1"))).await.unwrap();
        clock.advance(chrono::Duration::minutes(20));
        let busy = carts.create(CartOwner::Session(SessionId::new("s-2"))).await.unwrap();
        clock.advance(chrono::Duration::minutes(15));

        assert_eq!(carts.get(idle.id).await, Err(CartError::Expired(idle.id)));
        assert!(matches!(
            carts.add_item(idle.id, item("sku-x", 100, 1)).await,
            Err(CartError::Expired(_))
        ));
        assert!(carts.get(busy.id).await.is_ok());

        assert_eq!(carts.sweep_expired().await, 1);
        assert_eq!(carts.get(idle.id).await, Err(CartError::NotFound(idle.id)));
        assert_eq!(carts.len().await, 1);
    }

    #[tokio::test]
    async fn every_mutation_extends_the_expiry() {
        let (carts, clock) = manager();
        let cart = carts.create(CartOwner::Session(SessionId::new("s-1"))).await.unwrap();

        clock.advance(chrono::Duration::minutes(25));
        let touched = carts.add_item(cart.id, item("sku-x", 100, 1)).await.unwrap();

        assert_eq!(touched.expires_at, clock.now() + chrono::Duration::minutes(30));
        clock.advance(chrono::Duration::minutes(25));
        assert!(carts.get(cart.id).await.is_ok());
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let (carts, _) = manager();
        let (tx, rx) = watch::channel(false);
        let handle = Arc::new(carts).spawn_sweeper(Duration::from_millis(5), rx);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
