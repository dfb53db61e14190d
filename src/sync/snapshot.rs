//! External subscription state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::BillingPeriod;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Last-known state of the external subscription-of-record.
///
/// `currency` is optional: collaborators that do not report one skip the
/// catalog currency check during sync.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub plan_handle: String,
    pub status: SubscriptionStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub included_units: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

impl SubscriptionSnapshot {
    pub fn period(&self) -> BillingPeriod {
        BillingPeriod::new(self.period_start, self.period_end)
    }
}
