//! Shared value types for the fulfillment workflow.
//!
//! Identifiers, money, and the small validated strings (currency codes,
//! idempotency keys, coupon codes, order numbers) that every component passes
//! around.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Internal identifier backed by a random v4 UUID.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// Identifier owned by an external system (catalog, accounts, sessions).
macro_rules! external_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Wrap an external identifier as a `", stringify!($name), "`")]
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the identifier as a string slice
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

external_id!(
    /// Catalog product identifier
    ProductId
);
external_id!(
    /// Catalog variant identifier (size, colour, ...)
    VariantId
);
external_id!(
    /// Warehouse identifier
    WarehouseId
);
external_id!(
    /// Catalog category identifier, used for coupon eligibility
    CategoryId
);
external_id!(
    /// Registered customer identifier
    CustomerId
);
external_id!(
    /// Anonymous session identifier
    SessionId
);

uuid_id!(
    /// Unique identifier for a cart
    CartId
);
uuid_id!(
    /// Unique identifier for an order
    OrderId
);
uuid_id!(
    /// Unique identifier for a line on an order
    OrderItemId
);
uuid_id!(
    /// Unique identifier for a payment attempt
    PaymentId
);
uuid_id!(
    /// Unique identifier for a refund
    RefundId
);
uuid_id!(
    /// Unique identifier for a shipment
    ShipmentId
);
uuid_id!(
    /// Unique identifier for a stock reservation
    ReservationId
);
uuid_id!(
    /// Unique identifier for an inventory ledger entry
    TransactionId
);

// ============================================================================
// Money
// ============================================================================

/// Amount in minor currency units (cents).
///
/// All arithmetic is checked; prices never go negative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(u64);

impl Money {
    /// Zero.
    pub const ZERO: Self = Self(0);

    /// Creates money from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Creates money from whole currency units
    #[must_use]
    pub const fn from_dollars(dollars: u64) -> Self {
        Self(dollars.saturating_mul(100))
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Whether the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Add two amounts, returning `None` on overflow
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(cents) => Some(Self(cents)),
            None => None,
        }
    }

    /// Subtract, returning `None` if the result would be negative
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(cents) => Some(Self(cents)),
            None => None,
        }
    }

    /// Add, stopping at the maximum
    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Subtract, stopping at zero
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Multiply by a quantity, returning `None` on overflow
    #[must_use]
    pub const fn checked_multiply(self, quantity: u32) -> Option<Self> {
        match self.0.checked_mul(quantity as u64) {
            Some(cents) => Some(Self(cents)),
            None => None,
        }
    }

    /// `percent`% of this amount, rounded down.
    #[must_use]
    pub fn percent(self, percent: u32) -> Self {
        let cents = u128::from(self.0) * u128::from(percent) / 100;
        Self(u64::try_from(cents).unwrap_or(u64::MAX))
    }

    /// `bps` basis points of this amount, rounded half up.
    #[must_use]
    pub fn basis_points(self, bps: u32) -> Self {
        let cents = (u128::from(self.0) * u128::from(bps) + 5_000) / 10_000;
        Self(u64::try_from(cents).unwrap_or(u64::MAX))
    }

    /// Sum an iterator of amounts, returning `None` on overflow
    pub fn checked_sum<I: IntoIterator<Item = Self>>(amounts: I) -> Option<Self> {
        amounts
            .into_iter()
            .try_fold(Self::ZERO, Self::checked_add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// ISO 4217 currency code.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    /// Parse a three-letter code, normalising to upper case.
    #[must_use]
    pub fn parse(code: &str) -> Option<Self> {
        let code = code.trim();
        (code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()))
            .then(|| Self(code.to_ascii_uppercase()))
    }

    /// US dollars
    #[must_use]
    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    /// The code as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Currency {
    fn default() -> Self {
        Self::usd()
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Keys and codes
// ============================================================================

/// Caller-supplied token that makes a checkout safe to retry.
///
/// The same key is forwarded to the payment provider so a capture can be
/// looked up later when its outcome was lost.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Wrap a non-blank key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into();
        (!key.trim().is_empty()).then_some(Self(key))
    }

    /// A fresh random key
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Discount code, unique per tenant and compared case-insensitively.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CouponCode(String);

impl CouponCode {
    /// Maximum accepted length.
    pub const MAX_LEN: usize = 32;

    /// Normalise a raw code. Returns `None` unless it is 1 to 32 ASCII
    /// alphanumeric characters.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let valid = !raw.is_empty()
            && raw.len() <= Self::MAX_LEN
            && raw.chars().all(|c| c.is_ascii_alphanumeric());
        valid.then(|| Self(raw.to_ascii_uppercase()))
    }

    /// The normalised code
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CouponCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one inventory record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryKey {
    /// Product
    pub product_id: ProductId,
    /// Variant of the product
    pub variant_id: VariantId,
    /// Warehouse holding the stock
    pub warehouse_id: WarehouseId,
}

impl InventoryKey {
    /// Build a key
    #[must_use]
    pub const fn new(product_id: ProductId, variant_id: VariantId, warehouse_id: WarehouseId) -> Self {
        Self {
            product_id,
            variant_id,
            warehouse_id,
        }
    }
}

impl fmt::Display for InventoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.product_id, self.variant_id, self.warehouse_id)
    }
}

// ============================================================================
// Order numbers
// ============================================================================

/// Human-readable order identifier, `ORD-YYYYMMDD-NNNNNN`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderNumber(String);

static ORDER_SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl OrderNumber {
    /// Next number for an order created at `at`.
    ///
    /// The sequence is shared by every caller in the process, so numbers never
    /// repeat even across independently wired services.
    pub fn next(at: DateTime<Utc>) -> Self {
        let sequence = ORDER_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1;
        Self(format!("ORD-{}-{sequence:06}", at.format("%Y%m%d")))
    }

    /// Parse `ORD-YYYYMMDD-NNNNNN`. The sequence part may grow past six digits.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.trim().strip_prefix("ORD-")?;
        let (date, sequence) = rest.split_once('-')?;
        let digits = |part: &str| part.bytes().all(|byte| byte.is_ascii_digit());
        (date.len() == 8 && digits(date) && sequence.len() >= 6 && digits(sequence))
            .then(|| Self(format!("ORD-{date}-{sequence}")))
    }

    /// The number as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Line items and owners
// ============================================================================

/// A product line with a price snapshot, as held in a cart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Product
    pub product_id: ProductId,
    /// Variant
    pub variant_id: VariantId,
    /// Category, for coupon eligibility
    pub category_id: Option<CategoryId>,
    /// Display name captured when the item was added
    pub name: String,
    /// Units
    pub quantity: u32,
    /// Unit price captured when the item was added
    pub unit_price: Money,
}

impl LineItem {
    /// `unit_price × quantity`, `None` on overflow
    #[must_use]
    pub const fn line_total(&self) -> Option<Money> {
        self.unit_price.checked_multiply(self.quantity)
    }

    /// Whether this line is for the given product and variant
    #[must_use]
    pub fn is_for(&self, product_id: &ProductId, variant_id: &VariantId) -> bool {
        &self.product_id == product_id && &self.variant_id == variant_id
    }
}

/// Who a cart (and the order created from it) belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CartOwner {
    /// A signed-in customer
    Customer(CustomerId),
    /// An anonymous browsing session
    Session(SessionId),
}

impl CartOwner {
    /// The customer, when the owner is signed in
    #[must_use]
    pub const fn customer(&self) -> Option<&CustomerId> {
        match self {
            Self::Customer(id) => Some(id),
            Self::Session(_) => None,
        }
    }
}

/// Delivery address captured at checkout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingAddress {
    /// Recipient name
    pub recipient: String,
    /// Street line
    pub line1: String,
    /// Optional second line
    pub line2: Option<String>,
    /// City
    pub city: String,
    /// State, province, or region
    pub region: Option<String>,
    /// Postal code
    pub postal_code: String,
    /// ISO country code
    pub country: String,
}

impl ShippingAddress {
    /// Names of required fields that are blank.
    #[must_use]
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("recipient", &self.recipient),
            ("line1", &self.line1),
            ("city", &self.city),
            ("postal_code", &self.postal_code),
            ("country", &self.country),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}
