use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::auth::{Auth, AuthId, AuthStatus};
use crate::registry::AuthRegistry;
use crate::upstream::{ProviderExecutor, RefreshError};

#[derive(Debug, Clone)]
pub struct RefresherConfig {
    pub interval: Duration,
    pub max_concurrent: usize,
    /// Window written before a refresh launches so the next ticks skip the
    /// auth while it is inflight.
    pub pending_backoff: Duration,
    /// Applied after a transient failure; the old token keeps serving.
    pub failure_backoff: Duration,
    /// Quiet period after a successful refresh.
    pub success_backoff: Duration,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_concurrent: 10,
            pending_backoff: Duration::from_secs(60),
            failure_backoff: Duration::from_secs(5 * 60),
            success_backoff: Duration::from_secs(60),
        }
    }
}

/// Background OAuth refresh. One loop per process; per-tick work is bounded
/// by a semaphore so a pile of expiring auths cannot stampede the token
/// endpoints.
pub struct TokenRefresher {
    registry: Arc<AuthRegistry>,
    executors: HashMap<String, Arc<dyn ProviderExecutor>>,
    semaphore: Arc<Semaphore>,
    inflight: Arc<Mutex<HashSet<AuthId>>>,
    config: RefresherConfig,
}

impl TokenRefresher {
    pub fn new(
        registry: Arc<AuthRegistry>,
        executors: HashMap<String, Arc<dyn ProviderExecutor>>,
        config: RefresherConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            registry,
            executors,
            semaphore,
            inflight: Arc::new(Mutex::new(HashSet::new())),
            config,
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    /// One pass over a registry snapshot.
    pub async fn tick(&self) {
        let now = OffsetDateTime::now_utc();
        for auth in self.registry.list().await {
            let Some(executor) = self.executors.get(&auth.provider) else {
                continue;
            };
            if !should_refresh(&auth, executor.refresh_lead(), now) {
                continue;
            }
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                // Concurrency budget spent; the next tick picks the rest up.
                debug!("refresh semaphore exhausted, deferring");
                break;
            };
            {
                let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
                if !inflight.insert(auth.id.clone()) {
                    continue;
                }
            }
            let pending_until = now + self.config.pending_backoff;
            let _ = self
                .registry
                .update(&auth.id, |entry| {
                    entry.next_refresh_after = Some(pending_until);
                })
                .await;

            let registry = self.registry.clone();
            let executor = executor.clone();
            let inflight = self.inflight.clone();
            let config = self.config.clone();
            let auth_id = auth.id.clone();
            tokio::spawn(async move {
                refresh_one(registry, executor, auth, config).await;
                drop(permit);
                // Cleared last so a re-queue cannot race the inflight marker.
                inflight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&auth_id);
            });
        }
    }
}

/// The §4.5 decision: skip disabled, honor `next_refresh_after`, let the
/// provider evaluator veto, interval mode when configured, provider lead
/// otherwise.
pub fn should_refresh(auth: &Auth, lead: Duration, now: OffsetDateTime) -> bool {
    if auth.disabled || auth.status == AuthStatus::Disabled {
        return false;
    }
    if let Some(after) = auth.next_refresh_after
        && after > now
    {
        return false;
    }
    if auth.metadata.refresh_token.is_empty() {
        // API-key style auths never refresh.
        return false;
    }
    if let Some(runtime) = &auth.runtime
        && !runtime.should_refresh(auth, now)
    {
        return false;
    }

    if let Some(interval) = auth.refresh_interval() {
        let since_last = since(auth.last_refreshed_at.unwrap_or(auth.created_at), now);
        if since_last >= interval {
            return true;
        }
        return match auth.metadata.expires_in(now) {
            Some(remaining) => remaining <= interval,
            None => false,
        };
    }

    match auth.metadata.expires_in(now) {
        Some(remaining) => remaining <= lead,
        None => since(auth.last_refreshed_at.unwrap_or(auth.created_at), now) >= lead,
    }
}

fn since(earlier: OffsetDateTime, now: OffsetDateTime) -> Duration {
    Duration::from_secs((now - earlier).whole_seconds().max(0) as u64)
}

async fn refresh_one(
    registry: Arc<AuthRegistry>,
    executor: Arc<dyn ProviderExecutor>,
    auth: Auth,
    config: RefresherConfig,
) {
    let now = OffsetDateTime::now_utc();
    match executor.refresh(&auth).await {
        Ok(update) => {
            info!(auth_id = %auth.id, provider = %auth.provider, "token refreshed");
            let _ = registry
                .update(&auth.id, |entry| {
                    entry.metadata.access_token = update.access_token.clone();
                    if let Some(refresh_token) = update.refresh_token.clone() {
                        entry.metadata.refresh_token = refresh_token;
                    }
                    if update.expires_at > 0 {
                        entry.metadata.expires_at = update.expires_at;
                    }
                    entry.last_refreshed_at = Some(now);
                    entry.next_refresh_after = Some(now + config.success_backoff);
                    if entry.status == AuthStatus::Error {
                        entry.status = AuthStatus::Active;
                    }
                })
                .await;
        }
        Err(RefreshError::Revoked(message)) => {
            warn!(auth_id = %auth.id, %message, "refresh grant revoked, disabling auth");
            let _ = registry
                .update(&auth.id, |entry| {
                    entry.disabled = true;
                    entry.status = AuthStatus::Disabled;
                })
                .await;
        }
        Err(RefreshError::Transient(message)) => {
            // Old token stays; no exponential-level change for refresh 5xx.
            warn!(auth_id = %auth.id, %message, "refresh failed, backing off");
            let _ = registry
                .update(&auth.id, |entry| {
                    entry.next_refresh_after = Some(now + config.failure_backoff);
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_with_refresh_token() -> Auth {
        let mut auth = Auth::new("claude", "c1");
        auth.metadata.refresh_token = "rt".into();
        auth
    }

    #[test]
    fn lead_triggers_before_expiry() {
        let now = OffsetDateTime::now_utc();
        let mut auth = auth_with_refresh_token();
        auth.metadata.expires_at = (now + time::Duration::hours(2)).unix_timestamp();
        assert!(should_refresh(&auth, Duration::from_secs(4 * 3600), now));
        assert!(!should_refresh(&auth, Duration::from_secs(3600), now));
    }

    #[test]
    fn pending_window_suppresses() {
        let now = OffsetDateTime::now_utc();
        let mut auth = auth_with_refresh_token();
        auth.metadata.expires_at = now.unix_timestamp() + 10;
        auth.next_refresh_after = Some(now + time::Duration::seconds(30));
        assert!(!should_refresh(&auth, Duration::from_secs(3600), now));
    }

    #[test]
    fn interval_mode_overrides_lead() {
        let now = OffsetDateTime::now_utc();
        let mut auth = auth_with_refresh_token();
        auth.attributes
            .insert("refresh_interval_seconds".into(), "300".into());
        auth.last_refreshed_at = Some(now - time::Duration::seconds(400));
        // Far-future expiry, tiny lead: interval mode still fires.
        auth.metadata.expires_at = (now + time::Duration::days(30)).unix_timestamp();
        assert!(should_refresh(&auth, Duration::from_secs(1), now));

        auth.last_refreshed_at = Some(now - time::Duration::seconds(100));
        assert!(!should_refresh(&auth, Duration::from_secs(1), now));
    }

    #[test]
    fn api_key_auths_never_refresh() {
        let now = OffsetDateTime::now_utc();
        let mut auth = Auth::new("claude", "c1");
        auth.metadata.api_key = "sk-123".into();
        assert!(!should_refresh(&auth, Duration::from_secs(1), now));
    }
}
