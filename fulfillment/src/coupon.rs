//! Coupon evaluator.
//!
//! Each coupon code is its own single-writer store, so the usage-capacity
//! check and the counter increment happen in one step: two checkouts racing
//! for the last use of a code are serialized and exactly one wins.

use crate::metrics;
use crate::types::{CategoryId, CouponCode, CustomerId, LineItem, Money, OrderId, ProductId};
use chrono::{DateTime, Utc};
use fulfillment_core::environment::Clock;
use fulfillment_core::journal::{Journal, JournalError};
use fulfillment_core::reducer::{Events, Reducer};
use fulfillment_core::smallvec;
use fulfillment_runtime::{InMemoryJournal, KeyedStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Why a coupon could not be applied or managed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CouponError {
    /// Unknown, malformed, or deactivated code
    #[error("coupon not found: {0}")]
    NotFound(String),

    /// Past `expires_at`
    #[error("coupon {0} has expired")]
    Expired(CouponCode),

    /// Before `starts_at`
    #[error("coupon {0} is not active yet")]
    NotYetActive(CouponCode),

    /// Subtotal below `minimum_order`
    #[error("subtotal {subtotal} is below the minimum {minimum} for coupon {code}")]
    BelowMinimum {
        /// Coupon
        code: CouponCode,
        /// Required subtotal
        minimum: Money,
        /// Actual subtotal
        subtotal: Money,
    },

    /// Nothing in the cart matches the eligibility lists
    #[error("no item is eligible for coupon {0}")]
    NotEligible(CouponCode),

    /// Global or per-user limit reached
    #[error("coupon {0} has no remaining uses")]
    UsageExhausted(CouponCode),

    /// The code is taken
    #[error("coupon {0} is already registered")]
    AlreadyRegistered(CouponCode),

    /// The definition is inconsistent
    #[error("invalid coupon definition: {0}")]
    InvalidDefinition(String),

    /// Events could not be persisted
    #[error(transparent)]
    Journal(#[from] JournalError),
}

// ============================================================================
// Definitions
// ============================================================================

/// How a coupon discounts an order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscountKind {
    /// Percent of the eligible subtotal, optionally capped
    Percentage {
        /// 1 to 100
        percent: u32,
        /// Cap on the discount
        max_discount: Option<Money>,
    },
    /// Flat amount, capped at the eligible subtotal
    FixedAmount {
        /// Discount
        amount: Money,
    },
    /// Shipping is free; the subtotal is untouched
    FreeShipping,
}

/// Rules of a coupon.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponDefinition {
    /// Normalised code
    pub code: CouponCode,
    /// Discount type
    pub kind: DiscountKind,
    /// Valid from (inclusive)
    pub starts_at: DateTime<Utc>,
    /// Valid until (exclusive)
    pub expires_at: Option<DateTime<Utc>>,
    /// Minimum order subtotal
    pub minimum_order: Money,
    /// Products the coupon applies to; empty means all
    pub eligible_products: Vec<ProductId>,
    /// Categories the coupon applies to; empty means all
    pub eligible_categories: Vec<CategoryId>,
    /// Total uses across all customers
    pub usage_limit: Option<u32>,
    /// Uses per customer
    pub usage_limit_per_user: Option<u32>,
}

impl CouponDefinition {
    /// A coupon valid from `starts_at` with no other restrictions.
    #[must_use]
    pub const fn new(code: CouponCode, kind: DiscountKind, starts_at: DateTime<Utc>) -> Self {
        Self {
            code,
            kind,
            starts_at,
            expires_at: None,
            minimum_order: Money::ZERO,
            eligible_products: Vec::new(),
            eligible_categories: Vec::new(),
            usage_limit: None,
            usage_limit_per_user: None,
        }
    }

    /// Set the expiry
    #[must_use]
    pub const fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Set the minimum subtotal
    #[must_use]
    pub const fn minimum_order(mut self, minimum: Money) -> Self {
        self.minimum_order = minimum;
        self
    }

    /// Set the global usage limit
    #[must_use]
    pub const fn usage_limit(mut self, limit: u32) -> Self {
        self.usage_limit = Some(limit);
        self
    }

    /// Set the per-customer usage limit
    #[must_use]
    pub const fn usage_limit_per_user(mut self, limit: u32) -> Self {
        self.usage_limit_per_user = Some(limit);
        self
    }

    /// Restrict to these products
    #[must_use]
    pub fn for_products(mut self, products: impl IntoIterator<Item = ProductId>) -> Self {
        self.eligible_products = products.into_iter().collect();
        self
    }

    /// Restrict to these categories
    #[must_use]
    pub fn for_categories(mut self, categories: impl IntoIterator<Item = CategoryId>) -> Self {
        self.eligible_categories = categories.into_iter().collect();
        self
    }

    fn validate(&self) -> Result<(), CouponError> {
        match self.kind {
            DiscountKind::Percentage { percent, .. } if percent == 0 || percent > 100 => {
                return Err(CouponError::InvalidDefinition(format!(
                    "percentage must be between 1 and 100, got {percent}"
                )));
            },
            DiscountKind::FixedAmount { amount } if amount.is_zero() => {
                return Err(CouponError::InvalidDefinition("fixed amount must be positive".to_string()));
            },
            _ => {},
        }
        if self.expires_at.is_some_and(|expires_at| expires_at <= self.starts_at) {
            return Err(CouponError::InvalidDefinition("expiry must be after start".to_string()));
        }
        Ok(())
    }

    fn is_restricted(&self) -> bool {
        !self.eligible_products.is_empty() || !self.eligible_categories.is_empty()
    }

    fn is_eligible(&self, line: &LineItem) -> bool {
        self.eligible_products.contains(&line.product_id)
            || line
                .category_id
                .as_ref()
                .is_some_and(|category| self.eligible_categories.contains(category))
    }
}

/// Discount granted to an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "amount", rename_all = "snake_case")]
pub enum Discount {
    /// Taken off the subtotal
    Amount(Money),
    /// Shipping cost zeroed
    FreeShipping,
}

/// Audit record binding a coupon to the order it was applied to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedCoupon {
    /// Coupon
    pub code: CouponCode,
    /// Order
    pub order_id: OrderId,
    /// Customer charged against the per-user limit, if signed in
    pub customer_id: Option<CustomerId>,
    /// What was granted
    pub discount: Discount,
    /// When
    pub applied_at: DateTime<Utc>,
}

impl AppliedCoupon {
    /// The subtotal reduction; zero for free shipping.
    #[must_use]
    pub const fn amount(&self) -> Money {
        match self.discount {
            Discount::Amount(amount) => amount,
            Discount::FreeShipping => Money::ZERO,
        }
    }
}

/// A registered coupon with its counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    /// Rules
    pub definition: CouponDefinition,
    /// Uses so far
    pub usage_count: u32,
    /// Uses per customer
    pub usage_by_customer: HashMap<CustomerId, u32>,
    /// Live redemptions by order
    pub redemptions: HashMap<OrderId, AppliedCoupon>,
    /// Cleared by deactivation
    pub active: bool,
}

// ============================================================================
// Reducer
// ============================================================================

/// Commands accepted by a coupon.
#[derive(Clone, Debug)]
pub enum CouponCommand {
    /// Create the coupon
    Register(CouponDefinition),
    /// Consume one use for an order
    Redeem {
        /// Order
        order_id: OrderId,
        /// Customer, if signed in
        customer_id: Option<CustomerId>,
        /// Order subtotal before discount
        subtotal: Money,
        /// Cart lines, for eligibility
        lines: Vec<LineItem>,
    },
    /// Give an order's use back
    Rollback {
        /// Order
        order_id: OrderId,
    },
    /// Stop accepting redemptions
    Deactivate,
}

/// Facts recorded about a coupon.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouponEvent {
    /// Coupon created
    Registered {
        /// Rules
        definition: CouponDefinition,
    },
    /// One use consumed
    Redeemed {
        /// Audit record
        applied: AppliedCoupon,
    },
    /// One use returned
    RolledBack {
        /// Order
        order_id: OrderId,
        /// Customer whose use is returned
        customer_id: Option<CustomerId>,
    },
    /// No further redemptions
    Deactivated {
        /// When
        at: DateTime<Utc>,
    },
}

/// Injected dependencies.
#[derive(Clone)]
pub struct CouponEnvironment {
    /// Validity windows are checked against this clock
    pub clock: Arc<dyn Clock>,
}

/// Reducer for one coupon code.
#[derive(Clone, Copy, Debug, Default)]
pub struct CouponReducer;

impl CouponReducer {
    fn validate_redeem(
        coupon: &Coupon,
        customer_id: Option<&CustomerId>,
        subtotal: Money,
        lines: &[LineItem],
        now: DateTime<Utc>,
    ) -> Result<Discount, CouponError> {
        let definition = &coupon.definition;
        let code = || definition.code.clone();

        if !coupon.active {
            return Err(CouponError::NotFound(definition.code.to_string()));
        }
        if now < definition.starts_at {
            return Err(CouponError::NotYetActive(code()));
        }
        if definition.expires_at.is_some_and(|expires_at| now >= expires_at) {
            return Err(CouponError::Expired(code()));
        }
        if subtotal < definition.minimum_order {
            return Err(CouponError::BelowMinimum {
                code: code(),
                minimum: definition.minimum_order,
                subtotal,
            });
        }

        let base = if definition.is_restricted() {
            let eligible = lines
                .iter()
                .filter(|line| definition.is_eligible(line))
                .map(|line| line.line_total().unwrap_or(Money::from_cents(u64::MAX)))
                .fold(Money::ZERO, Money::saturating_add);
            if eligible.is_zero() {
                return Err(CouponError::NotEligible(code()));
            }
            eligible.min(subtotal)
        } else {
            subtotal
        };

        if definition
            .usage_limit
            .is_some_and(|limit| coupon.usage_count >= limit)
        {
            return Err(CouponError::UsageExhausted(code()));
        }
        if let (Some(limit), Some(customer_id)) = (definition.usage_limit_per_user, customer_id) {
            let used = coupon.usage_by_customer.get(customer_id).copied().unwrap_or(0);
            if used >= limit {
                return Err(CouponError::UsageExhausted(code()));
            }
        }

        Ok(match definition.kind {
            DiscountKind::Percentage { percent, max_discount } => {
                let discount = base.percent(percent);
                Discount::Amount(max_discount.map_or(discount, |cap| discount.min(cap)))
            },
            DiscountKind::FixedAmount { amount } => Discount::Amount(amount.min(base)),
            DiscountKind::FreeShipping => Discount::FreeShipping,
        })
    }
}

impl Reducer for CouponReducer {
    type State = Option<Coupon>;
    type Command = CouponCommand;
    type Event = CouponEvent;
    type Error = CouponError;
    type Environment = CouponEnvironment;

    fn reduce(
        &self,
        state: &Option<Coupon>,
        command: CouponCommand,
        env: &CouponEnvironment,
    ) -> Result<Events<CouponEvent>, CouponError> {
        if let CouponCommand::Register(definition) = command {
            if state.is_some() {
                return Err(CouponError::AlreadyRegistered(definition.code));
            }
            definition.validate()?;
            return Ok(smallvec![CouponEvent::Registered { definition }]);
        }

        let Some(coupon) = state else {
            return Err(CouponError::NotFound(String::new()));
        };

        match command {
            CouponCommand::Register(_) => Ok(Events::new()),
            CouponCommand::Redeem {
                order_id,
                customer_id,
                subtotal,
                lines,
            } => {
                if coupon.redemptions.contains_key(&order_id) {
                    return Ok(Events::new());
                }
                let now = env.clock.now();
                let discount = Self::validate_redeem(coupon, customer_id.as_ref(), subtotal, &lines, now)?;
                Ok(smallvec![CouponEvent::Redeemed {
                    applied: AppliedCoupon {
                        code: coupon.definition.code.clone(),
                        order_id,
                        customer_id,
                        discount,
                        applied_at: now,
                    },
                }])
            },
            CouponCommand::Rollback { order_id } => Ok(coupon
                .redemptions
                .get(&order_id)
                .map(|applied| CouponEvent::RolledBack {
                    order_id,
                    customer_id: applied.customer_id.clone(),
                })
                .into_iter()
                .collect()),
            CouponCommand::Deactivate if coupon.active => {
                Ok(smallvec![CouponEvent::Deactivated { at: env.clock.now() }])
            },
            CouponCommand::Deactivate => Ok(Events::new()),
        }
    }

    fn apply(&self, state: &mut Option<Coupon>, event: &CouponEvent) {
        match event {
            CouponEvent::Registered { definition } => {
                *state = Some(Coupon {
                    definition: definition.clone(),
                    usage_count: 0,
                    usage_by_customer: HashMap::new(),
                    redemptions: HashMap::new(),
                    active: true,
                });
            },
            CouponEvent::Redeemed { applied } => {
                if let Some(coupon) = state {
                    coupon.usage_count += 1;
                    if let Some(customer_id) = &applied.customer_id {
                        *coupon.usage_by_customer.entry(customer_id.clone()).or_insert(0) += 1;
                    }
                    coupon.redemptions.insert(applied.order_id, applied.clone());
                }
            },
            CouponEvent::RolledBack { order_id, customer_id } => {
                if let Some(coupon) = state {
                    coupon.usage_count = coupon.usage_count.saturating_sub(1);
                    if let Some(used) = customer_id
                        .as_ref()
                        .and_then(|customer_id| coupon.usage_by_customer.get_mut(customer_id))
                    {
                        *used = used.saturating_sub(1);
                    }
                    coupon.redemptions.remove(order_id);
                }
            },
            CouponEvent::Deactivated { .. } => {
                if let Some(coupon) = state {
                    coupon.active = false;
                }
            },
        }
    }
}

// ============================================================================
// Evaluator
// ============================================================================

/// Validates and consumes coupon codes.
pub struct CouponEvaluator {
    coupons: KeyedStore<CouponCode, CouponReducer>,
    journal: Arc<InMemoryJournal<CouponEvent>>,
}

impl CouponEvaluator {
    /// Create an evaluator with no coupons.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let journal = Arc::new(InMemoryJournal::new());
        let shared: Arc<dyn Journal<CouponEvent>> = journal.clone();
        let coupons = KeyedStore::new("coupon", CouponReducer, CouponEnvironment { clock }).with_journal(shared);
        Self { coupons, journal }
    }

    /// Register a new coupon.
    ///
    /// # Errors
    ///
    /// [`CouponError::AlreadyRegistered`] or [`CouponError::InvalidDefinition`].
    pub async fn register(&self, definition: CouponDefinition) -> Result<(), CouponError> {
        definition.validate()?;
        let code = definition.code.clone();
        let store = self
            .coupons
            .create(code.clone(), None)
            .await
            .ok_or_else(|| CouponError::AlreadyRegistered(code.clone()))?;
        if let Err(error) = store.send(CouponCommand::Register(definition)).await {
            self.coupons.remove(&code).await;
            return Err(error);
        }
        tracing::info!(%code, "Coupon registered");
        Ok(())
    }

    /// Validate a code against an order and consume one use.
    ///
    /// Applying the same code to the same order again returns the original
    /// [`AppliedCoupon`] without consuming another use.
    ///
    /// # Errors
    ///
    /// Any [`CouponError`] validation failure; nothing is consumed then.
    #[tracing::instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn apply(
        &self,
        code: &str,
        order_id: OrderId,
        customer_id: Option<&CustomerId>,
        subtotal: Money,
        lines: &[LineItem],
    ) -> Result<AppliedCoupon, CouponError> {
        let not_found = || CouponError::NotFound(code.to_string());
        let normalized = CouponCode::parse(code).ok_or_else(not_found)?;
        let store = self.coupons.get(&normalized).await.ok_or_else(not_found)?;

        let result = store
            .send(CouponCommand::Redeem {
                order_id,
                customer_id: customer_id.cloned(),
                subtotal,
                lines: lines.to_vec(),
            })
            .await;
        if let Err(error) = result {
            metrics::record_coupon_redemption("rejected");
            tracing::warn!(%error, "Coupon rejected");
            return Err(error);
        }

        let applied = store
            .state(|coupon| {
                coupon
                    .as_ref()
                    .and_then(|coupon| coupon.redemptions.get(&order_id).cloned())
            })
            .await
            .ok_or_else(not_found)?;
        metrics::record_coupon_redemption("applied");
        Ok(applied)
    }

    /// Return the use consumed for `order_id`. Idempotent.
    ///
    /// # Errors
    ///
    /// [`CouponError::NotFound`] for an unknown code, or a journal failure.
    pub async fn rollback(&self, code: &CouponCode, order_id: OrderId) -> Result<(), CouponError> {
        let store = self
            .coupons
            .get(code)
            .await
            .ok_or_else(|| CouponError::NotFound(code.to_string()))?;
        let events = store.send(CouponCommand::Rollback { order_id }).await?;
        if !events.is_empty() {
            metrics::record_coupon_redemption("rolled_back");
            tracing::info!(%code, %order_id, "Coupon use rolled back");
        }
        Ok(())
    }

    /// Stop accepting the code. Existing redemptions are kept.
    ///
    /// # Errors
    ///
    /// [`CouponError::NotFound`] for an unknown code.
    pub async fn deactivate(&self, code: &str) -> Result<(), CouponError> {
        let not_found = || CouponError::NotFound(code.to_string());
        let normalized = CouponCode::parse(code).ok_or_else(not_found)?;
        let store = self.coupons.get(&normalized).await.ok_or_else(not_found)?;
        store.send(CouponCommand::Deactivate).await?;
        Ok(())
    }

    /// Current state of a coupon.
    pub async fn coupon(&self, code: &str) -> Option<Coupon> {
        let store = self.coupons.get(&CouponCode::parse(code)?).await?;
        store.state(Option::clone).await
    }

    /// Every coupon event in the order it was recorded.
    ///
    /// # Errors
    ///
    /// Journal failures.
    pub fn history(&self) -> Result<Vec<CouponEvent>, CouponError> {
        Ok(self.journal.all()?.into_iter().map(|(_, event)| event).collect())
    }
}
