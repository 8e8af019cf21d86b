//! Tag-keyed request quotas shared by every chain's indexer.
//!
//! A tag is an arbitrary string such as `transfer_history_chain_1` or
//! `transfer_history_<account>`. Tags without a configured limit are always
//! allowed. A limit either renews every `period` or, with no period, is a
//! lifetime budget. Consumed units are written to the [`ProgressStore`] by
//! [`RateLimiter::persist`] and reloaded with [`RateLimiter::restore`], so a
//! restart does not refill a lifetime budget.

use crate::{
    store::{ProgressStore, QuotaUsage, StoreError},
    types::Address,
};
use chrono::{TimeDelta, Utc};
use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

/// Tag prefix for history-scan quotas.
pub const HISTORY_TAG_PREFIX: &str = "transfer_history";

/// Quota tag charged for every history RPC issued on behalf of `account`.
#[must_use]
pub fn account_tag(account: &Address) -> String {
    format!("{HISTORY_TAG_PREFIX}_{}", account.to_hex_lower())
}

/// Quota tag charged for every history RPC issued by one chain's task group.
#[must_use]
pub fn chain_group_tag(chain_id: u64) -> String {
    format!("{HISTORY_TAG_PREFIX}_chain_{chain_id}")
}

#[derive(Debug, Clone)]
struct Quota {
    limit: u64,
    period: Option<Duration>,
    used: u64,
    window_start: Instant,
    /// Changed since the last [`RateLimiter::take_dirty`].
    dirty: bool,
}

impl Quota {
    fn try_consume(&mut self, now: Instant) -> bool {
        if let Some(period) = self.period {
            if now.duration_since(self.window_start) >= period {
                self.used = 0;
                self.window_start = now;
                self.dirty = true;
            }
        }

        if self.used < self.limit {
            self.used += 1;
            self.dirty = true;
            true
        } else {
            false
        }
    }

    fn usage(&self, tag: &str, now: Instant) -> QuotaUsage {
        let age = TimeDelta::from_std(now.saturating_duration_since(self.window_start))
            .unwrap_or(TimeDelta::zero());
        QuotaUsage { tag: tag.to_string(), used: self.used, window_start: Utc::now() - age }
    }
}

/// Non-blocking quota limiter.
///
/// Cloning is cheap and clones share state, so one limiter is handed to every
/// chain indexer. `allow` never waits: a denied caller is expected to skip its
/// round and try again on its next interval.
#[derive(Clone, Default)]
pub struct RateLimiter {
    quotas: Arc<DashMap<String, Quota>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one unit of the tag's quota. Returns `false` when exhausted.
    #[must_use]
    pub fn allow(&self, tag: &str) -> bool {
        let now = Instant::now();
        match self.quotas.get_mut(tag) {
            Some(mut quota) => {
                let allowed = quota.try_consume(now);
                if !allowed {
                    tracing::debug!(tag, limit = quota.limit, "rate limit quota exhausted");
                }
                allowed
            }
            None => true,
        }
    }

    /// Returns `true` only if every tag allows; stops charging at the first denial.
    #[must_use]
    pub fn allow_all<'a>(&self, tags: impl IntoIterator<Item = &'a str>) -> bool {
        tags.into_iter().all(|tag| self.allow(tag))
    }

    /// Sets or replaces the limit for `tag`.
    ///
    /// Units already consumed in the current window are kept so that reapplying
    /// configuration does not refill an exhausted quota.
    pub fn set_limit(&self, tag: &str, count: u64, period: Option<Duration>) {
        let now = Instant::now();
        self.quotas
            .entry(tag.to_string())
            .and_modify(|quota| {
                quota.limit = count;
                quota.period = period;
            })
            .or_insert(Quota { limit: count, period, used: 0, window_start: now, dirty: false });
    }

    /// Removes the limit for `tag`, making it unlimited again.
    pub fn remove_limit(&self, tag: &str) {
        self.quotas.remove(tag);
    }

    /// Units left in the current window, or `None` for unlimited tags.
    #[must_use]
    pub fn remaining(&self, tag: &str) -> Option<u64> {
        self.quotas.get(tag).map(|quota| {
            let expired = quota
                .period
                .is_some_and(|period| Instant::now().duration_since(quota.window_start) >= period);
            if expired {
                quota.limit
            } else {
                quota.limit.saturating_sub(quota.used)
            }
        })
    }

    #[must_use]
    pub fn tag_count(&self) -> usize {
        self.quotas.len()
    }

    /// Usage of every quota changed since the previous call, marking it clean.
    #[must_use]
    pub fn take_dirty(&self) -> Vec<QuotaUsage> {
        let now = Instant::now();
        let mut usages = Vec::new();
        for mut entry in self.quotas.iter_mut() {
            if entry.dirty {
                entry.dirty = false;
                usages.push(entry.usage(entry.key(), now));
            }
        }
        usages
    }

    /// Writes changed usage to `store`. Returns the number of rows written.
    ///
    /// # Errors
    ///
    /// The store failure; the usage stays dirty for the next call.
    pub async fn persist(&self, store: &dyn ProgressStore) -> Result<usize, StoreError> {
        let usages = self.take_dirty();
        if usages.is_empty() {
            return Ok(0);
        }
        if let Err(e) = store.save_quotas(&usages).await {
            for usage in &usages {
                if let Some(mut quota) = self.quotas.get_mut(&usage.tag) {
                    quota.dirty = true;
                }
            }
            return Err(e);
        }
        Ok(usages.len())
    }

    /// Reapplies persisted usage to tags that already have a limit. Usage of a
    /// periodic quota whose window has since ended is dropped.
    pub fn restore(&self, usages: &[QuotaUsage]) -> usize {
        let now = Instant::now();
        let wall_now = Utc::now();
        let mut restored = 0;
        for usage in usages {
            let Some(mut quota) = self.quotas.get_mut(&usage.tag) else {
                continue;
            };
            let age = (wall_now - usage.window_start).to_std().unwrap_or_default();
            if quota.period.is_some_and(|period| age >= period) {
                quota.used = 0;
                quota.window_start = now;
            } else {
                quota.used = usage.used;
                quota.window_start = now.checked_sub(age).unwrap_or(now);
            }
            quota.dirty = false;
            restored += 1;
        }
        restored
    }

    /// Loads usage from `store` and [`restore`](Self::restore)s it.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn restore_from(&self, store: &dyn ProgressStore) -> Result<usize, StoreError> {
        let usages = store.load_quotas().await?;
        Ok(self.restore(&usages))
    }
}
