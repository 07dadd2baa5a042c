//! Configuration for the fulfillment services.
//!
//! Loads configuration from `FULFILLMENT_*` environment variables with
//! sensible defaults. Unparseable values fall back to the default; values that
//! parse but make no sense are caught by [`FulfillmentConfig::validate`].

use crate::types::{Currency, Money};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is out of its allowed range
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Environment variable name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentConfig {
    /// Tax, shipping, and currency
    pub pricing: PricingConfig,
    /// Checkout behaviour
    pub checkout: CheckoutConfig,
    /// Cart lifetime
    pub carts: CartConfig,
    /// Background reconciliation of ambiguous captures
    pub reconciliation: ReconciliationConfig,
    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

/// Pricing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Tax rate in basis points, applied to the discounted subtotal
    pub tax_rate_bps: u32,
    /// Flat shipping charge per order
    pub flat_shipping: Money,
    /// Subtotal at or above which shipping is free
    pub free_shipping_threshold: Option<Money>,
    /// Store currency
    pub currency: Currency,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            tax_rate_bps: 0,
            flat_shipping: Money::ZERO,
            free_shipping_threshold: None,
            currency: Currency::usd(),
        }
    }
}

/// Checkout configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutConfig {
    /// Default time allowed for a payment capture
    pub payment_timeout: Duration,
    /// Time allowed for a refund call
    pub refund_timeout: Duration,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            payment_timeout: Duration::from_secs(10),
            refund_timeout: Duration::from_secs(10),
        }
    }
}

/// Cart configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartConfig {
    /// Idle time after which a cart expires
    pub ttl: Duration,
    /// How often expired carts are swept
    pub sweep_interval: Duration,
}

impl Default for CartConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Reconciliation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Time between reconciliation passes
    pub interval: Duration,
    /// Age after which a pending order unknown to the provider is expired
    pub pending_order_ttl: Duration,
    /// Retries for a failing provider lookup within one pass
    pub lookup_max_retries: u32,
    /// First retry delay for provider lookups
    pub lookup_initial_delay: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            pending_order_ttl: Duration::from_secs(30 * 60),
            lookup_max_retries: 3,
            lookup_initial_delay: Duration::from_millis(200),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log filter directive (trace, debug, info, warn, error)
    pub log_level: String,
    /// Install the Prometheus recorder
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    lookup(name).and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: Duration) -> Duration {
    Duration::from_secs(parsed(lookup, name, default.as_secs()))
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: Duration) -> Duration {
    let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(parsed(lookup, name, default))
}

impl FulfillmentConfig {
    /// Load configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let currency = lookup("FULFILLMENT_CURRENCY")
            .and_then(|code| Currency::parse(&code))
            .unwrap_or(defaults.pricing.currency);

        Self {
            pricing: PricingConfig {
                tax_rate_bps: parsed(&lookup, "FULFILLMENT_TAX_RATE_BPS", defaults.pricing.tax_rate_bps),
                flat_shipping: Money::from_cents(parsed(
                    &lookup,
                    "FULFILLMENT_FLAT_SHIPPING_CENTS",
                    defaults.pricing.flat_shipping.cents(),
                )),
                free_shipping_threshold: lookup("FULFILLMENT_FREE_SHIPPING_THRESHOLD_CENTS")
                    .and_then(|value| value.trim().parse().ok())
                    .map(Money::from_cents),
                currency,
            },
            checkout: CheckoutConfig {
                payment_timeout: millis(&lookup, "FULFILLMENT_PAYMENT_TIMEOUT_MS", defaults.checkout.payment_timeout),
                refund_timeout: millis(&lookup, "FULFILLMENT_REFUND_TIMEOUT_MS", defaults.checkout.refund_timeout),
            },
            carts: CartConfig {
                ttl: seconds(&lookup, "FULFILLMENT_CART_TTL_SECS", defaults.carts.ttl),
                sweep_interval: seconds(
                    &lookup,
                    "FULFILLMENT_CART_SWEEP_INTERVAL_SECS",
                    defaults.carts.sweep_interval,
                ),
            },
            reconciliation: ReconciliationConfig {
                interval: seconds(
                    &lookup,
                    "FULFILLMENT_RECONCILIATION_INTERVAL_SECS",
                    defaults.reconciliation.interval,
                ),
                pending_order_ttl: seconds(
                    &lookup,
                    "FULFILLMENT_PENDING_ORDER_TTL_SECS",
                    defaults.reconciliation.pending_order_ttl,
                ),
                lookup_max_retries: parsed(
                    &lookup,
                    "FULFILLMENT_LOOKUP_MAX_RETRIES",
                    defaults.reconciliation.lookup_max_retries,
                ),
                lookup_initial_delay: millis(
                    &lookup,
                    "FULFILLMENT_LOOKUP_INITIAL_DELAY_MS",
                    defaults.reconciliation.lookup_initial_delay,
                ),
            },
            observability: ObservabilityConfig {
                log_level: lookup("FULFILLMENT_LOG_LEVEL").unwrap_or(defaults.observability.log_level),
                metrics_enabled: parsed(
                    &lookup,
                    "FULFILLMENT_METRICS_ENABLED",
                    defaults.observability.metrics_enabled,
                ),
            },
        }
    }

    /// Reject values that would make the services misbehave.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pricing.tax_rate_bps > 10_000 {
            return Err(invalid("FULFILLMENT_TAX_RATE_BPS", "must not exceed 10000 (100%)"));
        }
        if self.checkout.payment_timeout.is_zero() {
            return Err(invalid("FULFILLMENT_PAYMENT_TIMEOUT_MS", "must be positive"));
        }
        if self.checkout.refund_timeout.is_zero() {
            return Err(invalid("FULFILLMENT_REFUND_TIMEOUT_MS", "must be positive"));
        }
        if self.carts.ttl.is_zero() {
            return Err(invalid("FULFILLMENT_CART_TTL_SECS", "must be positive"));
        }
        if self.carts.sweep_interval.is_zero() {
            return Err(invalid("FULFILLMENT_CART_SWEEP_INTERVAL_SECS", "must be positive"));
        }
        if self.reconciliation.interval.is_zero() {
            return Err(invalid("FULFILLMENT_RECONCILIATION_INTERVAL_SECS", "must be positive"));
        }
        if self.reconciliation.pending_order_ttl < self.checkout.payment_timeout {
            return Err(invalid(
                "FULFILLMENT_PENDING_ORDER_TTL_SECS",
                "must be at least the payment timeout",
            ));
        }
        if Currency::parse(self.pricing.currency.as_str()).is_none() {
            return Err(invalid("FULFILLMENT_CURRENCY", "must be a three-letter ISO code"));
        }
        Ok(())
    }

    /// Cart idle lifetime as a calendar duration.
    #[must_use]
    pub fn cart_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.carts.ttl).unwrap_or(chrono::Duration::MAX)
    }

    /// Pending order lifetime as a calendar duration.
    #[must_use]
    pub fn pending_order_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.reconciliation.pending_order_ttl).unwrap_or(chrono::Duration::MAX)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> FulfillmentConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect();
        FulfillmentConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_are_valid() {
        let config = from_pairs(&[]);
        assert_eq!(config, FulfillmentConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn variables_override_defaults() {
        let config = from_pairs(&[
            ("FULFILLMENT_TAX_RATE_BPS", "825"),
            ("FULFILLMENT_FLAT_SHIPPING_CENTS", "599"),
            ("FULFILLMENT_FREE_SHIPPING_THRESHOLD_CENTS", "5000"),
            ("FULFILLMENT_CURRENCY", "eur"),
            ("FULFILLMENT_PAYMENT_TIMEOUT_MS", "2500"),
            ("FULFILLMENT_CART_TTL_SECS", "60"),
            ("FULFILLMENT_METRICS_ENABLED", "false"),
        ]);

        assert_eq!(config.pricing.tax_rate_bps, 825);
        assert_eq!(config.pricing.flat_shipping, Money::from_cents(599));
        assert_eq!(config.pricing.free_shipping_threshold, Some(Money::from_cents(5000)));
        assert_eq!(config.pricing.currency.as_str(), "EUR");
        assert_eq!(config.checkout.payment_timeout, Duration::from_millis(2500));
        assert_eq!(config.carts.ttl, Duration::from_secs(60));
        assert!(!config.observability.metrics_enabled);
    }

    #[test]
    fn unparseable_values_fall_back() {
        let config = from_pairs(&[("FULFILLMENT_TAX_RATE_BPS", "lots"), ("FULFILLMENT_CURRENCY", "dollars")]);
        assert_eq!(config.pricing.tax_rate_bps, 0);
        assert_eq!(config.pricing.currency, Currency::usd());
    }

    #[test]
    fn nonsense_is_rejected() {
        let config = from_pairs(&[("FULFILLMENT_TAX_RATE_BPS", "20000")]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "FULFILLMENT_TAX_RATE_BPS",
                ..
            })
        ));

        let config = from_pairs(&[("FULFILLMENT_CART_TTL_SECS", "0")]);
        assert!(config.validate().is_err());
    }
}
