use super::{core::AppState, errors::ServiceFailure, metrics::record_rate_limit_hit};

/// Fixed-window counter over the shared store, keyed by surface plus
/// caller identity (subject id, or remote address for anonymous calls).
/// The first `limit` requests inside one window pass; everything after is
/// `RateLimited` until the window rolls over.
pub(crate) async fn check_rate_limit(
    state: &AppState,
    surface: &'static str,
    identity: &str,
    limit: u64,
    now_unix: i64,
) -> Result<(), ServiceFailure> {
    let key = format!("rl:{surface}:{identity}");
    let count = state
        .store
        .increment_window(&key, state.runtime.rate_limit_window_secs, now_unix)
        .await;
    if count > limit {
        record_rate_limit_hit(surface, "over_limit");
        tracing::warn!(surface, identity, count, limit, "rate limit exceeded");
        return Err(ServiceFailure::RateLimited);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::check_rate_limit;
    use crate::server::core::{AppConfig, AppState};
    use crate::server::errors::ServiceFailure;
    use crate::server::store::InMemoryStore;

    fn state() -> AppState {
        AppState::new(&AppConfig::default(), Arc::new(InMemoryStore::default()))
            .expect("state builds")
    }

    #[tokio::test]
    async fn allows_up_to_limit_then_rejects() {
        let state = state();
        for _ in 0..3 {
            assert!(check_rate_limit(&state, "connect", "user-1", 3, 30)
                .await
                .is_ok());
        }
        assert_eq!(
            check_rate_limit(&state, "connect", "user-1", 3, 30).await,
            Err(ServiceFailure::RateLimited)
        );
    }

    #[tokio::test]
    async fn counter_resets_when_window_elapses() {
        let state = state();
        for _ in 0..3 {
            let _ = check_rate_limit(&state, "connect", "user-1", 3, 30).await;
        }
        assert_eq!(
            check_rate_limit(&state, "connect", "user-1", 3, 59).await,
            Err(ServiceFailure::RateLimited)
        );
        // Default window is 60s; t=60 starts a fresh one.
        assert!(check_rate_limit(&state, "connect", "user-1", 3, 60)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn identities_and_surfaces_count_independently() {
        let state = state();
        for _ in 0..3 {
            let _ = check_rate_limit(&state, "connect", "user-1", 3, 30).await;
        }
        assert!(check_rate_limit(&state, "connect", "user-2", 3, 30)
            .await
            .is_ok());
        assert!(check_rate_limit(&state, "send", "user-1", 3, 30)
            .await
            .is_ok());
    }
}
