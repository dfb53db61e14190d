//! Content-addressed cache keys.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Key for one generation: a subject photo plus a garment set.
///
/// Garment identifiers are sorted and deduplicated at construction, so the
/// same set requested in a different input order resolves to the same
/// entry. The key keeps its components for map equality and exposes a
/// stable in-process digest for logging and result naming.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    subject: String,
    garments: Vec<String>,
}

impl CacheKey {
    /// Key for a single-garment generation.
    pub fn single(subject: impl Into<String>, garment: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            garments: vec![garment.into()],
        }
    }

    /// Key over a whole outfit set, order-independent.
    pub fn combined<I, S>(subject: impl Into<String>, garments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut garments: Vec<String> = garments.into_iter().map(Into::into).collect();
        garments.sort_unstable();
        garments.dedup();
        Self {
            subject: subject.into(),
            garments,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Sorted, deduplicated garment identifiers.
    pub fn garments(&self) -> &[String] {
        &self.garments
    }

    /// Stable hex digest of the key components.
    pub fn digest(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest())
    }
}
