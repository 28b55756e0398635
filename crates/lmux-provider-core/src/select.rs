use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use time::OffsetDateTime;
use tracing::debug;

use crate::auth::Auth;
use crate::quota::{self, QuotaManager};
use crate::sticky::StickyStore;

#[derive(Debug, Clone, Default)]
pub struct PickOptions {
    /// Skip sticky affinity; used on retry so a failing auth is not re-picked.
    pub force_rotate: bool,
    /// Opaque client key for sticky affinity (IP, API-key hash, session).
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PickError {
    #[error("no credentials registered for provider")]
    NotFound,
    /// Everything pickable is cooling; carries the shortest remaining wait.
    #[error("all credentials cooling, retry after {retry_after:?}")]
    Cooling { retry_after: Duration },
    /// Everything is disabled or revoked; waiting will not help.
    #[error("all credentials disabled or unavailable")]
    AllBlocked,
}

/// Pure chooser: reads quota scores and sticky state, writes only the sticky
/// commit and its own rotation counters. Quota state is never mutated here.
pub struct Selector {
    sticky: Arc<StickyStore>,
    quota: Arc<QuotaManager>,
    rotation: Mutex<HashMap<(String, String), u64>>,
}

impl Selector {
    pub fn new(sticky: Arc<StickyStore>, quota: Arc<QuotaManager>) -> Self {
        Self {
            sticky,
            quota,
            rotation: Mutex::new(HashMap::new()),
        }
    }

    pub fn pick(
        &self,
        provider_name: &str,
        model: &str,
        options: &PickOptions,
        candidates: &[Auth],
    ) -> Result<Auth, PickError> {
        if candidates.is_empty() {
            return Err(PickError::NotFound);
        }
        let now = OffsetDateTime::now_utc();

        let mut pickable = Vec::new();
        let mut nearest_recovery: Option<OffsetDateTime> = None;
        for auth in candidates {
            match auth.pickable_for(model, now, self.quota.cooldown_until(&auth.id)) {
                Ok(()) => pickable.push(auth),
                Err(reason) => {
                    if let Some(at) = reason.recover_at() {
                        nearest_recovery = Some(match nearest_recovery {
                            Some(current) => current.min(at),
                            None => at,
                        });
                    }
                    debug!(auth_id = %auth.id, model, ?reason, "candidate filtered");
                }
            }
        }

        if pickable.is_empty() {
            return Err(match nearest_recovery {
                Some(at) => PickError::Cooling {
                    retry_after: Duration::from_secs((at - now).whole_seconds().max(1) as u64),
                },
                None => PickError::AllBlocked,
            });
        }

        let sticky_enabled = self.quota.sticky_enabled(provider_name);
        let sticky_key = options
            .fingerprint
            .as_deref()
            .filter(|_| sticky_enabled)
            .map(|fingerprint| StickyStore::key(provider_name, fingerprint));

        if !options.force_rotate
            && let Some(key) = sticky_key.as_deref()
            && let Some(stuck_id) = self.sticky.get(key)
            && let Some(auth) = pickable.iter().find(|auth| auth.id == stuck_id)
        {
            return Ok((*auth).clone());
        }
        // A stale sticky value is left alone until a successful pick below
        // overwrites it.

        let mut scored: Vec<(i64, &Auth)> = pickable
            .iter()
            .map(|auth| (self.quota.score(provider_name, auth, now), *auth))
            .collect();
        // Shuffle before the stable sort so exact score collisions do not
        // keep the registry iteration order forever.
        scored.shuffle(&mut rand::rng());
        scored.sort_by_key(|(score, _)| *score);

        // Scores inside one bucket differ only by the id-hash dispersion;
        // those auths are equally loaded and rotate round-robin.
        let best_bucket = scored[0].0 / quota::SCORE_TIE_BUCKET;
        let best: Vec<&Auth> = scored
            .iter()
            .take_while(|(score, _)| score / quota::SCORE_TIE_BUCKET == best_bucket)
            .map(|(_, auth)| *auth)
            .collect();

        let counter = {
            let mut rotation = self.rotation.lock().unwrap_or_else(|e| e.into_inner());
            let slot = rotation
                .entry((provider_name.to_string(), model.to_string()))
                .or_insert(0);
            let current = *slot;
            *slot = slot.wrapping_add(1);
            current
        };
        let chosen = best[(counter as usize) % best.len()];

        if let Some(key) = sticky_key.as_deref() {
            self.sticky.set(key, &chosen.id);
        }
        Ok(chosen.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_candidates_is_not_found() {
        let selector = Selector::new(
            Arc::new(StickyStore::new()),
            Arc::new(QuotaManager::default()),
        );
        let err = selector
            .pick("claude", "m", &PickOptions::default(), &[])
            .unwrap_err();
        assert_eq!(err, PickError::NotFound);
    }

    #[test]
    fn disabled_only_is_blocked_not_cooling() {
        let selector = Selector::new(
            Arc::new(StickyStore::new()),
            Arc::new(QuotaManager::default()),
        );
        let mut auth = Auth::new("claude", "c1");
        auth.disabled = true;
        let err = selector
            .pick("claude", "m", &PickOptions::default(), &[auth])
            .unwrap_err();
        assert_eq!(err, PickError::AllBlocked);
    }
}
