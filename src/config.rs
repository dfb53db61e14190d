//! Core configuration.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Tunable parameters for the credit ledger and generation pipeline.
///
/// ```rust
/// use tryon_core::CoreConfig;
/// use rust_decimal_macros::dec;
///
/// let config = CoreConfig::default()
///     .with_unit_price(dec!(0.75))
///     .with_max_concurrent_synthesis(3);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Price charged per overage unit.
    pub unit_price: Decimal,
    /// Default per-period overage cap for newly installed accounts.
    pub default_overage_cap: Decimal,
    /// Trial units seeded when an account installs.
    pub trial_units: u32,
    /// Cap on concurrent synthesis submissions.
    pub max_concurrent_synthesis: usize,
    /// Maximum items in one batch request.
    pub max_batch_items: usize,
    /// Minimum garments in a combined-outfit request.
    pub min_combined_items: usize,
    /// Maximum garments in a combined-outfit request.
    pub max_combined_items: usize,
    /// Per-item upstream timeout, in seconds. A caller that times out
    /// detaches from the shared computation; it does not cancel it.
    pub synthesis_timeout_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            unit_price: dec!(0.50),
            default_overage_cap: dec!(10.00),
            trial_units: 3,
            max_concurrent_synthesis: 5,
            max_batch_items: 6,
            min_combined_items: 2,
            max_combined_items: 8,
            synthesis_timeout_secs: 120,
        }
    }
}

impl CoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit_price(mut self, price: Decimal) -> Self {
        self.unit_price = price;
        self
    }

    pub fn with_overage_cap(mut self, cap: Decimal) -> Self {
        self.default_overage_cap = cap;
        self
    }

    pub fn with_trial_units(mut self, units: u32) -> Self {
        self.trial_units = units;
        self
    }

    pub fn with_max_concurrent_synthesis(mut self, cap: usize) -> Self {
        self.max_concurrent_synthesis = cap.max(1);
        self
    }

    pub fn with_synthesis_timeout(mut self, timeout: Duration) -> Self {
        self.synthesis_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.max_concurrent_synthesis, 5);
        assert_eq!(config.max_batch_items, 6);
        assert_eq!(config.min_combined_items, 2);
        assert_eq!(config.max_combined_items, 8);
        assert_eq!(config.unit_price, dec!(0.50));
    }

    #[test]
    fn test_builder_floors() {
        let config = CoreConfig::new()
            .with_max_concurrent_synthesis(0)
            .with_synthesis_timeout(Duration::from_millis(10));
        assert_eq!(config.max_concurrent_synthesis, 1);
        assert_eq!(config.synthesis_timeout(), Duration::from_secs(1));
    }
}
