//! Generation cache: content-addressed dedup with at most one concurrent
//! computation per key.
//!
//! The sole-initiator role is granted by an insert-if-absent on the entry
//! map. The initiator reserves a unit, runs the computation on a spawned
//! task, and either commits the deduction and stores a `Done` entry, or
//! releases the reservation and evicts the entry so a later call may retry.
//! Concurrent callers await the same shared future; a caller that times out
//! detaches without cancelling the computation.

mod key;

pub use key::CacheKey;

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::Error;
use crate::ledger::{CreditBreakdown, CreditLedger};
use crate::providers::AssetStore;
use crate::types::{AccountId, AssetRef};

/// How a result was obtained, from the caller's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheDisposition {
    /// Served from a completed entry; no charge, no synthesis.
    Hit,
    /// Joined a computation another caller initiated; no charge here.
    Coalesced,
    /// This caller initiated the computation and was charged one unit.
    Computed,
}

/// Successful outcome of [`GenerationCache::get_or_compute`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheOutcome {
    pub result: AssetRef,
    pub disposition: CacheDisposition,
}

impl CacheOutcome {
    /// Whether this call charged a unit.
    pub fn charged(&self) -> bool {
        self.disposition == CacheDisposition::Computed
    }
}

type SharedResult = Result<AssetRef, ComputeFailure>;
type InFlightFuture = Shared<BoxFuture<'static, SharedResult>>;

/// Clonable failure carried through the shared future to every waiter.
#[derive(Clone, Debug)]
enum ComputeFailure {
    Credits(CreditBreakdown),
    UnknownAccount(AccountId),
    Invariant { reservation_id: Uuid, detail: String },
    Fault { key: String, cause: Arc<Error> },
}

impl ComputeFailure {
    fn fault(key: &CacheKey, cause: Error) -> Self {
        Self::Fault {
            key: key.digest(),
            cause: Arc::new(cause),
        }
    }

    fn into_error(self) -> Error {
        match self {
            Self::Credits(breakdown) => Error::InsufficientCredits { breakdown },
            Self::UnknownAccount(account_id) => Error::AccountNotFound(account_id),
            Self::Invariant {
                reservation_id,
                detail,
            } => Error::ReservationState {
                reservation_id,
                detail,
            },
            Self::Fault { key, cause } => Error::CacheComputation { key, cause },
        }
    }
}

enum EntryState {
    InFlight(InFlightFuture),
    Done {
        result: AssetRef,
        created_at: DateTime<Utc>,
    },
}

/// Content-addressed generation results keyed by (subject, garment set).
pub struct GenerationCache {
    entries: Arc<DashMap<CacheKey, EntryState>>,
    ledger: Arc<CreditLedger>,
    assets: Arc<dyn AssetStore>,
}

impl GenerationCache {
    pub fn new(ledger: Arc<CreditLedger>, assets: Arc<dyn AssetStore>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ledger,
            assets,
        }
    }

    /// Resolve `key`, computing at most once across all concurrent callers
    /// and charging at most one unit per key.
    ///
    /// A `Done` entry returns immediately without touching the ledger. An
    /// in-flight entry is awaited; if the shared computation fails, every
    /// waiter receives the failure and the entry is evicted for retry. On a
    /// true miss this caller becomes sole initiator.
    pub async fn get_or_compute<F, Fut>(
        &self,
        account_id: &AccountId,
        key: CacheKey,
        compute: F,
    ) -> Result<CacheOutcome, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, Error>> + Send + 'static,
    {
        let (disposition, shared) = match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) => match entry.get() {
                EntryState::Done { result, .. } => {
                    debug!(key = %key, "cache hit");
                    return Ok(CacheOutcome {
                        result: result.clone(),
                        disposition: CacheDisposition::Hit,
                    });
                }
                EntryState::InFlight(shared) => (CacheDisposition::Coalesced, shared.clone()),
            },
            Entry::Vacant(slot) => {
                let shared = self.spawn_initiator(account_id.clone(), key, compute());
                slot.insert(EntryState::InFlight(shared.clone()));
                (CacheDisposition::Computed, shared)
            }
        };

        match shared.await {
            Ok(result) => Ok(CacheOutcome {
                result,
                disposition,
            }),
            Err(failure) => Err(failure.into_error()),
        }
    }

    /// Run the full initiator lifecycle on a spawned task so waiter detach
    /// (upstream timeout) never cancels it: reserve, compute, persist, then
    /// commit + Done, or release + evict.
    fn spawn_initiator<Fut>(
        &self,
        account_id: AccountId,
        key: CacheKey,
        computation: Fut,
    ) -> InFlightFuture
    where
        Fut: Future<Output = Result<Bytes, Error>> + Send + 'static,
    {
        let ledger = Arc::clone(&self.ledger);
        let assets = Arc::clone(&self.assets);
        let entries = Arc::clone(&self.entries);
        let digest = key.digest();

        let task = tokio::spawn(async move {
            let reservation = match ledger.reserve(&account_id) {
                Ok(reservation) => reservation,
                Err(err) => {
                    entries.remove(&key);
                    return Err(match err {
                        Error::InsufficientCredits { breakdown } => {
                            ComputeFailure::Credits(breakdown)
                        }
                        Error::AccountNotFound(id) => ComputeFailure::UnknownAccount(id),
                        other => ComputeFailure::fault(&key, other),
                    });
                }
            };

            let data = match computation.await {
                Ok(data) => data,
                Err(err) => {
                    warn!(key = %key, account = %account_id, error = %err, "generation failed; evicting entry");
                    Self::abort_entry(&ledger, &entries, &key, &reservation);
                    return Err(ComputeFailure::fault(&key, err));
                }
            };

            let result = match assets.put(data).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(key = %key, account = %account_id, error = %err, "asset persist failed; evicting entry");
                    Self::abort_entry(&ledger, &entries, &key, &reservation);
                    return Err(ComputeFailure::fault(&key, err));
                }
            };

            if let Err(err) = ledger.commit(&reservation) {
                error!(key = %key, account = %account_id, error = %err, "commit failed after synthesis");
                entries.remove(&key);
                return Err(match err {
                    Error::ReservationState {
                        reservation_id,
                        detail,
                    } => ComputeFailure::Invariant {
                        reservation_id,
                        detail,
                    },
                    other => ComputeFailure::fault(&key, other),
                });
            }

            debug!(key = %key, account = %account_id, result = %result, "generation cached");
            entries.insert(
                key,
                EntryState::Done {
                    result: result.clone(),
                    created_at: Utc::now(),
                },
            );
            Ok(result)
        });

        task.map(move |joined| match joined {
            Ok(outcome) => outcome,
            Err(join_err) => Err(ComputeFailure::Fault {
                key: digest,
                cause: Arc::new(Error::Provider(format!(
                    "synthesis task aborted: {join_err}"
                ))),
            }),
        })
        .boxed()
        .shared()
    }

    fn abort_entry(
        ledger: &CreditLedger,
        entries: &DashMap<CacheKey, EntryState>,
        key: &CacheKey,
        reservation: &crate::ledger::Reservation,
    ) {
        if let Err(state_err) = ledger.release(reservation) {
            error!(key = %key, error = %state_err, "release after failure itself failed");
        }
        entries.remove(key);
    }

    /// Completed entries currently cached. In-flight entries count too.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// When the completed entry for `key` was stored, if there is one.
    pub fn created_at(&self, key: &CacheKey) -> Option<DateTime<Utc>> {
        self.entries.get(key).and_then(|entry| match entry.value() {
            EntryState::Done { created_at, .. } => Some(*created_at),
            EntryState::InFlight(_) => None,
        })
    }

    /// Whether a completed result exists for `key`.
    pub fn contains_done(&self, key: &CacheKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| matches!(entry.value(), EntryState::Done { .. }))
    }

    /// Drop a completed entry, forcing the next request to recompute.
    /// In-flight entries are left alone.
    pub fn evict(&self, key: &CacheKey) -> bool {
        self.entries
            .remove_if(key, |_, state| matches!(state, EntryState::Done { .. }))
            .is_some()
    }

    /// Drop all completed entries.
    pub fn clear(&self) {
        self.entries
            .retain(|_, state| matches!(state, EntryState::InFlight(_)));
    }
}
