use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use time::OffsetDateTime;
use tracing::debug;

use lmux_common::{fnv32a, provider};

use crate::auth::{Auth, AuthId};

/// Claude subscription windows reset on a five-hour cadence; that is the
/// implicit cooldown when upstream gives no `Retry-After` and nothing has
/// been learned yet.
pub const CLAUDE_DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60 * 60);
/// Exponential ladder cap for everyone else.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30 * 60);

const DEFAULT_ESTIMATED_LIMIT: i64 = 1_000_000;
const ACTIVE_REQUEST_PENALTY: i64 = 1_000;
const USAGE_SCALE: i64 = 10_000;
const EXPIRING_TOKEN_PENALTY: i64 = 50_000;

/// Every load-bearing score component is a multiple of this; the id-hash
/// dispersion stays below it. Auths whose scores land in the same bucket are
/// equally loaded and rotate round-robin.
pub const SCORE_TIE_BUCKET: i64 = 1_000;

#[derive(Debug, Clone, Copy)]
pub struct RealQuota {
    pub remaining_tokens: i64,
    pub window_reset_at: Option<OffsetDateTime>,
    pub fetched_at: OffsetDateTime,
}

#[derive(Debug, Default)]
struct CooldownWindow {
    cooldown_until: Option<OffsetDateTime>,
    learned_cooldown: Option<Duration>,
    last_exhausted_at: Option<OffsetDateTime>,
    exponential_level: u32,
    real_quota: Option<RealQuota>,
}

/// Per-auth live counters. Counters are atomics so request start/end never
/// contend; the cooldown window sits behind a small mutex.
#[derive(Debug, Default)]
pub struct AuthQuotaState {
    active_requests: AtomicI64,
    total_tokens_used: AtomicI64,
    window: Mutex<CooldownWindow>,
}

impl AuthQuotaState {
    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn total_tokens_used(&self) -> i64 {
        self.total_tokens_used.load(Ordering::Relaxed)
    }

    pub fn cooldown_until(&self) -> Option<OffsetDateTime> {
        self.window.lock().unwrap_or_else(|e| e.into_inner()).cooldown_until
    }

    pub fn learned_cooldown(&self) -> Option<Duration> {
        self.window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .learned_cooldown
    }

    pub fn exponential_level(&self) -> u32 {
        self.window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .exponential_level
    }

    pub fn last_exhausted_at(&self) -> Option<OffsetDateTime> {
        self.window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_exhausted_at
    }

    pub fn set_real_quota(&self, quota: RealQuota) {
        self.window.lock().unwrap_or_else(|e| e.into_inner()).real_quota = Some(quota);
    }

    pub fn real_quota(&self) -> Option<RealQuota> {
        self.window.lock().unwrap_or_else(|e| e.into_inner()).real_quota
    }

    fn apply_hit(&self, cooldown: Duration, explicit: bool, now: OffsetDateTime) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.cooldown_until = Some(now + cooldown);
        window.last_exhausted_at = Some(now);
        if explicit {
            window.learned_cooldown = Some(cooldown);
        } else {
            window.exponential_level = window.exponential_level.saturating_add(1);
        }
    }

    fn clear_cooldown(&self) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.cooldown_until = None;
        window.exponential_level = 0;
        // learned_cooldown survives; it seeds the next implicit hit.
    }
}

/// `2^level` seconds, capped.
pub fn backoff_for_level(level: u32) -> Duration {
    let secs = 1u64 << level.min(11);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderQuotaConfig {
    pub sticky_enabled: bool,
    pub estimated_limit: i64,
}

impl Default for ProviderQuotaConfig {
    fn default() -> Self {
        Self {
            sticky_enabled: true,
            estimated_limit: DEFAULT_ESTIMATED_LIMIT,
        }
    }
}

pub trait QuotaStrategy: Send + Sync {
    fn config(&self) -> ProviderQuotaConfig;

    /// Lower is better. Base dispersion keeps equally-idle auths from
    /// sorting identically everywhere.
    fn score(&self, auth: &Auth, state: &AuthQuotaState, now: OffsetDateTime) -> i64;

    fn on_quota_hit(&self, state: &AuthQuotaState, explicit: Option<Duration>, now: OffsetDateTime);

    fn on_success(&self, state: &AuthQuotaState);
}

/// Tagged per-provider strategy variants; the factory maps provider strings
/// and defaults explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStrategy {
    Claude,
    Copilot,
    Gemini,
    Antigravity,
    Default,
}

pub fn strategy_for(provider_name: &str) -> ProviderStrategy {
    match provider_name {
        provider::CLAUDE => ProviderStrategy::Claude,
        provider::COPILOT => ProviderStrategy::Copilot,
        provider::GEMINI => ProviderStrategy::Gemini,
        provider::ANTIGRAVITY => ProviderStrategy::Antigravity,
        _ => ProviderStrategy::Default,
    }
}

impl ProviderStrategy {
    fn base_score(auth: &Auth) -> i64 {
        i64::from(fnv32a(auth.id.as_bytes())) % SCORE_TIE_BUCKET
    }

    fn usage_score(state: &AuthQuotaState, limit: i64) -> i64 {
        if limit <= 0 {
            return 0;
        }
        state.total_tokens_used().saturating_mul(USAGE_SCALE) / limit
    }

    /// Providers that must refresh before use pay a penalty while their token
    /// is near expiry, steering traffic to credentials that will not stall.
    fn expiry_penalty(auth: &Auth, now: OffsetDateTime) -> i64 {
        match auth.metadata.expires_in(now) {
            Some(remaining) if remaining < Duration::from_secs(10 * 60) => EXPIRING_TOKEN_PENALTY,
            _ => 0,
        }
    }
}

impl QuotaStrategy for ProviderStrategy {
    fn config(&self) -> ProviderQuotaConfig {
        match self {
            // Antigravity accounts are many and cheap; rotating every request
            // spreads the load wider than affinity would.
            ProviderStrategy::Antigravity => ProviderQuotaConfig {
                sticky_enabled: false,
                estimated_limit: DEFAULT_ESTIMATED_LIMIT,
            },
            ProviderStrategy::Claude => ProviderQuotaConfig {
                sticky_enabled: true,
                estimated_limit: 2_000_000,
            },
            _ => ProviderQuotaConfig::default(),
        }
    }

    fn score(&self, auth: &Auth, state: &AuthQuotaState, now: OffsetDateTime) -> i64 {
        let config = self.config();
        let mut score = Self::base_score(auth)
            + Self::usage_score(state, config.estimated_limit)
            + state.active_requests().max(0) * ACTIVE_REQUEST_PENALTY;
        if matches!(self, ProviderStrategy::Claude | ProviderStrategy::Gemini) {
            score += Self::expiry_penalty(auth, now);
        }
        score
    }

    fn on_quota_hit(&self, state: &AuthQuotaState, explicit: Option<Duration>, now: OffsetDateTime) {
        if let Some(cooldown) = explicit.filter(|d| !d.is_zero()) {
            state.apply_hit(cooldown, true, now);
            return;
        }
        if let Some(learned) = state.learned_cooldown() {
            state.apply_hit(learned, false, now);
            return;
        }
        let fallback = match self {
            ProviderStrategy::Claude => CLAUDE_DEFAULT_COOLDOWN,
            _ => backoff_for_level(state.exponential_level()),
        };
        state.apply_hit(fallback, false, now);
    }

    fn on_success(&self, state: &AuthQuotaState) {
        state.clear_cooldown();
    }
}

/// Owns every `AuthQuotaState` and the strategy dispatch. Selection reads
/// through this; mutation happens on request boundaries and quota hits.
pub struct QuotaManager {
    states: RwLock<HashMap<AuthId, Arc<AuthQuotaState>>>,
    disable_cooling: bool,
}

impl Default for QuotaManager {
    fn default() -> Self {
        Self::new(false)
    }
}

impl QuotaManager {
    pub fn new(disable_cooling: bool) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            disable_cooling,
        }
    }

    /// Lazily created; lives for the process.
    pub fn state(&self, auth_id: &str) -> Arc<AuthQuotaState> {
        if let Some(state) = self.states.read().unwrap_or_else(|e| e.into_inner()).get(auth_id) {
            return state.clone();
        }
        let mut guard = self.states.write().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(auth_id.to_string())
            .or_insert_with(|| Arc::new(AuthQuotaState::default()))
            .clone()
    }

    pub fn cooldown_until(&self, auth_id: &str) -> Option<OffsetDateTime> {
        if self.disable_cooling {
            return None;
        }
        self.states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(auth_id)
            .and_then(|state| state.cooldown_until())
    }

    pub fn score(&self, provider_name: &str, auth: &Auth, now: OffsetDateTime) -> i64 {
        let state = self.state(&auth.id);
        strategy_for(provider_name).score(auth, &state, now)
    }

    pub fn sticky_enabled(&self, provider_name: &str) -> bool {
        strategy_for(provider_name).config().sticky_enabled
    }

    /// Start tracking one request; the ticket decrements on drop so no exit
    /// path can leak `active_requests`.
    pub fn begin(&self, auth_id: &str, provider_name: &str) -> RequestTicket {
        let state = self.state(auth_id);
        state.active_requests.fetch_add(1, Ordering::Relaxed);
        RequestTicket {
            state,
            strategy: strategy_for(provider_name),
            done: false,
        }
    }

    pub fn record_quota_hit(
        &self,
        auth_id: &str,
        provider_name: &str,
        model: &str,
        reset_after: Option<Duration>,
    ) {
        if self.disable_cooling {
            debug!(auth_id, provider = provider_name, model, "cooling disabled, quota hit ignored");
            return;
        }
        let state = self.state(auth_id);
        let now = OffsetDateTime::now_utc();
        strategy_for(provider_name).on_quota_hit(&state, reset_after, now);
        debug!(
            auth_id,
            provider = provider_name,
            model,
            cooldown_until = ?state.cooldown_until(),
            "quota hit recorded"
        );
    }

    /// Smallest remaining cooldown among the given auths; shapes the
    /// `Retry-After` surfaced when everything is cooling.
    pub fn min_remaining_cooldown(&self, auth_ids: &[AuthId], now: OffsetDateTime) -> Option<Duration> {
        let guard = self.states.read().unwrap_or_else(|e| e.into_inner());
        let mut min: Option<Duration> = None;
        for id in auth_ids {
            let Some(until) = guard.get(id).and_then(|state| state.cooldown_until()) else {
                continue;
            };
            if until <= now {
                continue;
            }
            let remaining = Duration::from_secs((until - now).whole_seconds().max(0) as u64);
            min = Some(match min {
                Some(current) => current.min(remaining),
                None => remaining,
            });
        }
        min
    }
}

pub struct RequestTicket {
    state: Arc<AuthQuotaState>,
    strategy: ProviderStrategy,
    done: bool,
}

impl RequestTicket {
    /// Close out the request. Non-failed completion clears the cooldown via
    /// the strategy (learned value retained).
    pub fn finish(mut self, tokens: u64, failed: bool) {
        self.state.active_requests.fetch_sub(1, Ordering::Relaxed);
        self.state
            .total_tokens_used
            .fetch_add(tokens as i64, Ordering::Relaxed);
        if !failed {
            self.strategy.on_success(&self.state);
        }
        self.done = true;
    }
}

impl Drop for RequestTicket {
    fn drop(&mut self) {
        if !self.done {
            self.state.active_requests.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ladder_caps_at_thirty_minutes() {
        assert_eq!(backoff_for_level(0), Duration::from_secs(1));
        assert_eq!(backoff_for_level(1), Duration::from_secs(2));
        assert_eq!(backoff_for_level(5), Duration::from_secs(32));
        assert_eq!(backoff_for_level(30), MAX_BACKOFF);
    }

    #[test]
    fn explicit_hit_learns_cooldown() {
        let state = AuthQuotaState::default();
        let now = OffsetDateTime::now_utc();
        ProviderStrategy::Default.on_quota_hit(&state, Some(Duration::from_secs(90)), now);
        assert_eq!(state.learned_cooldown(), Some(Duration::from_secs(90)));
        assert!(state.cooldown_until().unwrap() > now);

        ProviderStrategy::Default.on_success(&state);
        assert!(state.cooldown_until().is_none());
        // Learned value survives success.
        assert_eq!(state.learned_cooldown(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn implicit_hit_uses_claude_default() {
        let state = AuthQuotaState::default();
        let now = OffsetDateTime::now_utc();
        ProviderStrategy::Claude.on_quota_hit(&state, None, now);
        let until = state.cooldown_until().unwrap();
        let cooled_for = until - now;
        assert!(cooled_for >= time::Duration::seconds(5 * 3600 - 1));
    }

    #[test]
    fn implicit_hits_escalate_exponentially() {
        let state = AuthQuotaState::default();
        let now = OffsetDateTime::now_utc();
        ProviderStrategy::Default.on_quota_hit(&state, None, now);
        assert_eq!(state.exponential_level(), 1);
        ProviderStrategy::Default.on_quota_hit(&state, None, now);
        assert_eq!(state.exponential_level(), 2);
        ProviderStrategy::Default.on_success(&state);
        assert_eq!(state.exponential_level(), 0);
    }

    #[test]
    fn antigravity_disables_sticky() {
        assert!(!strategy_for("antigravity").config().sticky_enabled);
        assert!(strategy_for("claude").config().sticky_enabled);
        assert!(strategy_for("unheard-of").config().sticky_enabled);
    }

    #[test]
    fn ticket_drop_without_finish_still_decrements() {
        let manager = QuotaManager::default();
        {
            let _ticket = manager.begin("a1", "claude");
            assert_eq!(manager.state("a1").active_requests(), 1);
        }
        assert_eq!(manager.state("a1").active_requests(), 0);
    }

    #[test]
    fn disable_cooling_hides_cooldowns() {
        let manager = QuotaManager::new(true);
        manager.record_quota_hit("a1", "claude", "m", Some(Duration::from_secs(60)));
        assert!(manager.cooldown_until("a1").is_none());
    }
}
