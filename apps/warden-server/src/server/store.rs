use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

/// Server-side state attached to one refresh token, keyed by the SHA-256
/// of the token string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRecord {
    pub user_id: String,
    pub scopes: Vec<String>,
    pub expires_at_unix: i64,
}

/// Outcome of an atomic refresh-token redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemOutcome {
    /// First redemption; the record is now marked used.
    Redeemed(RefreshRecord),
    /// The token was redeemed before. Racing redemptions see exactly one
    /// `Redeemed` and this otherwise.
    AlreadyUsed,
    /// No record for this token.
    Unknown,
}

/// Cross-instance mutable state: the revocation blacklist, refresh-token
/// redemption flags, and fixed-window rate counters. A single-process
/// deployment injects [`InMemoryStore`]; a horizontally scaled one swaps
/// in a networked implementation with the same atomicity guarantees.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Adds a token hash to the blacklist. Idempotent. The entry may be
    /// pruned once `expires_at_unix` has passed.
    async fn revoke(&self, token_hash: &str, expires_at_unix: i64);

    async fn is_revoked(&self, token_hash: &str) -> bool;

    async fn put_refresh(&self, token_hash: &str, record: RefreshRecord);

    /// Atomic read-unused-then-mark-used. Must never yield two `Redeemed`
    /// results for one hash, regardless of interleaving.
    async fn redeem_refresh(&self, token_hash: &str, now_unix: i64) -> RedeemOutcome;

    /// Increments the fixed-window counter for `key` and returns the new
    /// count within the window containing `now_unix`.
    async fn increment_window(&self, key: &str, window_secs: u64, now_unix: i64) -> u64;

    /// Drops blacklist and refresh entries whose own expiry has passed.
    async fn prune_expired(&self, now_unix: i64);

    async fn healthy(&self) -> bool;
}

#[derive(Default)]
struct InMemoryInner {
    revoked: HashMap<String, i64>,
    refresh: HashMap<String, (RefreshRecord, bool)>,
    counters: HashMap<String, (i64, u64)>,
}

/// Process-local [`SharedStore`] used for single-instance deployments and
/// tests. One mutex guards all three maps, which makes redemption a true
/// check-and-set.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<InMemoryInner>,
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn revoke(&self, token_hash: &str, expires_at_unix: i64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.revoked.insert(token_hash.to_owned(), expires_at_unix);
        }
    }

    async fn is_revoked(&self, token_hash: &str) -> bool {
        self.inner
            .lock()
            .map_or(false, |inner| inner.revoked.contains_key(token_hash))
    }

    async fn put_refresh(&self, token_hash: &str, record: RefreshRecord) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.refresh.insert(token_hash.to_owned(), (record, false));
        }
    }

    async fn redeem_refresh(&self, token_hash: &str, now_unix: i64) -> RedeemOutcome {
        let Ok(mut inner) = self.inner.lock() else {
            return RedeemOutcome::Unknown;
        };
        match inner.refresh.get_mut(token_hash) {
            None => RedeemOutcome::Unknown,
            Some((record, used)) => {
                if record.expires_at_unix <= now_unix {
                    RedeemOutcome::Unknown
                } else if *used {
                    RedeemOutcome::AlreadyUsed
                } else {
                    *used = true;
                    RedeemOutcome::Redeemed(record.clone())
                }
            }
        }
    }

    async fn increment_window(&self, key: &str, window_secs: u64, now_unix: i64) -> u64 {
        let window_secs = i64::try_from(window_secs.max(1)).unwrap_or(i64::MAX);
        let window_start = now_unix - now_unix.rem_euclid(window_secs);
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let entry = inner.counters.entry(key.to_owned()).or_insert((window_start, 0));
        if entry.0 != window_start {
            *entry = (window_start, 0);
        }
        entry.1 += 1;
        entry.1
    }

    async fn prune_expired(&self, now_unix: i64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.revoked.retain(|_, expires| *expires > now_unix);
            inner
                .refresh
                .retain(|_, (record, _)| record.expires_at_unix > now_unix);
        }
    }

    async fn healthy(&self) -> bool {
        self.inner.lock().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{InMemoryStore, RedeemOutcome, RefreshRecord, SharedStore};

    fn record(user: &str) -> RefreshRecord {
        RefreshRecord {
            user_id: user.to_owned(),
            scopes: vec![String::from("read:civic")],
            expires_at_unix: 10_000,
        }
    }

    #[tokio::test]
    async fn redeem_succeeds_exactly_once() {
        let store = InMemoryStore::default();
        store.put_refresh("hash-a", record("alice")).await;

        let first = store.redeem_refresh("hash-a", 100).await;
        assert!(matches!(first, RedeemOutcome::Redeemed(r) if r.user_id == "alice"));
        assert_eq!(
            store.redeem_refresh("hash-a", 100).await,
            RedeemOutcome::AlreadyUsed
        );
    }

    #[tokio::test]
    async fn redeem_unknown_hash_and_expired_record() {
        let store = InMemoryStore::default();
        assert_eq!(
            store.redeem_refresh("missing", 100).await,
            RedeemOutcome::Unknown
        );

        store.put_refresh("hash-b", record("bob")).await;
        assert_eq!(
            store.redeem_refresh("hash-b", 10_000).await,
            RedeemOutcome::Unknown
        );
    }

    #[tokio::test]
    async fn concurrent_redemptions_yield_one_winner() {
        let store = Arc::new(InMemoryStore::default());
        store.put_refresh("hash-c", record("carol")).await;

        let mut joins = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            joins.push(tokio::spawn(async move {
                store.redeem_refresh("hash-c", 100).await
            }));
        }
        let mut redeemed = 0;
        for join in joins {
            if matches!(join.await.unwrap(), RedeemOutcome::Redeemed(_)) {
                redeemed += 1;
            }
        }
        assert_eq!(redeemed, 1);
    }

    #[tokio::test]
    async fn revocation_is_idempotent_and_prunable() {
        let store = InMemoryStore::default();
        store.revoke("hash-d", 500).await;
        store.revoke("hash-d", 500).await;
        assert!(store.is_revoked("hash-d").await);

        store.prune_expired(499).await;
        assert!(store.is_revoked("hash-d").await);
        store.prune_expired(500).await;
        assert!(!store.is_revoked("hash-d").await);
    }

    #[tokio::test]
    async fn window_counter_resets_on_new_window() {
        let store = InMemoryStore::default();
        assert_eq!(store.increment_window("ip:1", 60, 30).await, 1);
        assert_eq!(store.increment_window("ip:1", 60, 59).await, 2);
        // Next window starts at t=60.
        assert_eq!(store.increment_window("ip:1", 60, 61).await, 1);
    }
}
