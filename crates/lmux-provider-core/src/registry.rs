use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{RwLock, broadcast};
use tracing::{info, warn};

use lmux_common::fnv32a;

use crate::auth::{Auth, AuthId, AuthStatus, RefreshEvaluator};
use crate::store::AuthStore;

/// Message substrings that mean a 401/403 is terminal for the credential.
/// Checked case-insensitively.
const REVOKE_MARKERS: &[&str] = &[
    "revoked",
    "invalid_grant",
    "invalid grant",
    "account deactivated",
    "account has been disabled",
    "api key disabled",
    "token disabled",
    "credential is no longer active",
    "refresh token is invalid",
];

pub fn is_revoke_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    REVOKE_MARKERS.iter().any(|marker| lowered.contains(marker))
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone)]
pub enum AuthChange {
    Created(Auth),
    Updated(Auth),
    Deleted(AuthId),
}

/// What the manager observed for one attempt; the registry classifies and
/// applies the status transition.
#[derive(Debug, Clone)]
pub struct RequestResult {
    pub auth_id: AuthId,
    pub provider: String,
    pub model: String,
    pub success: bool,
    pub status: Option<u16>,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl RequestResult {
    pub fn ok(auth_id: impl Into<String>, provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            auth_id: auth_id.into(),
            provider: provider.into(),
            model: model.into(),
            success: true,
            status: None,
            message: String::new(),
            retry_after: None,
        }
    }
}

/// The authoritative set of auth entries. Owns persistence and the change
/// feed; everything else works on clones.
pub struct AuthRegistry {
    inner: RwLock<HashMap<AuthId, Auth>>,
    events: broadcast::Sender<AuthChange>,
    store: Option<Arc<dyn AuthStore>>,
    evaluators: HashMap<String, Arc<dyn RefreshEvaluator>>,
}

impl AuthRegistry {
    pub fn new(store: Option<Arc<dyn AuthStore>>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(HashMap::new()),
            events,
            store,
            evaluators: HashMap::new(),
        }
    }

    /// Provider-keyed refresh evaluators, attached to entries at register
    /// time so the refresher can consult them without knowing provider types.
    pub fn with_evaluators(
        mut self,
        evaluators: HashMap<String, Arc<dyn RefreshEvaluator>>,
    ) -> Self {
        self.evaluators = evaluators;
        self
    }

    pub fn watch(&self) -> broadcast::Receiver<AuthChange> {
        self.events.subscribe()
    }

    pub async fn load_from_store(&self) -> io::Result<usize> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };
        let auths = store.load_all()?;
        let count = auths.len();
        for auth in auths {
            self.register(auth).await;
        }
        info!(count, "auth entries loaded from disk");
        Ok(count)
    }

    /// Upsert by id. Returns the stored snapshot and whether it was new.
    pub async fn register(&self, mut auth: Auth) -> (Auth, bool) {
        if auth.id.is_empty() {
            auth.id = derive_id(&auth);
        }
        auth.runtime = self.evaluators.get(&auth.provider).cloned();

        let mut guard = self.inner.write().await;
        let (snapshot, created) = match guard.get_mut(&auth.id) {
            Some(existing) => {
                existing.merge_from(auth);
                (existing.clone(), false)
            }
            None => {
                guard.insert(auth.id.clone(), auth.clone());
                (auth, true)
            }
        };
        drop(guard);

        let mut snapshot = snapshot;
        self.persist(&mut snapshot).await;
        let change = if created {
            AuthChange::Created(snapshot.clone())
        } else {
            AuthChange::Updated(snapshot.clone())
        };
        let _ = self.events.send(change);
        (snapshot, created)
    }

    /// Atomic read-modify-write; returns the updated snapshot.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Option<Auth>
    where
        F: FnOnce(&mut Auth),
    {
        let mut guard = self.inner.write().await;
        let auth = guard.get_mut(id)?;
        mutate(auth);
        auth.updated_at = OffsetDateTime::now_utc();
        let mut snapshot = auth.clone();
        drop(guard);

        self.persist(&mut snapshot).await;
        let _ = self.events.send(AuthChange::Updated(snapshot.clone()));
        Some(snapshot)
    }

    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.inner.write().await.remove(id);
        let Some(auth) = removed else {
            return false;
        };
        if let Some(store) = &self.store
            && !auth.runtime_only()
            && let Err(err) = store.delete(&auth)
        {
            warn!(auth_id = %auth.id, %err, "failed to remove auth file");
        }
        let _ = self.events.send(AuthChange::Deleted(auth.id));
        true
    }

    pub async fn get(&self, id: &str) -> Option<Auth> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Auth> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn list_provider(&self, provider_name: &str) -> Vec<Auth> {
        self.inner
            .read()
            .await
            .values()
            .filter(|auth| auth.provider == provider_name)
            .cloned()
            .collect()
    }

    /// Apply the §7 status transitions for one observed result. Quota
    /// counters and cooldown windows live in the quota manager; this handles
    /// the entry itself (disable on revoke, model-level quota flags, status).
    pub async fn mark_result(&self, result: RequestResult) {
        let now = OffsetDateTime::now_utc();
        if result.success {
            let _ = self.update(&result.auth_id, |auth| {
                auth.status = AuthStatus::Active;
                auth.unavailable = false;
                auth.next_retry_after = None;
                if let Some(state) = auth.model_states.get_mut(&result.model) {
                    state.unavailable = false;
                    state.next_retry_after = None;
                    state.quota.exceeded = false;
                    state.quota.next_recover_at = None;
                    state.quota.exponential_level = 0;
                }
            })
            .await;
            return;
        }

        match result.status {
            Some(401) | Some(403) if is_revoke_message(&result.message) => {
                warn!(auth_id = %result.auth_id, status = ?result.status, "credential revoked, disabling");
                let _ = self.update(&result.auth_id, |auth| {
                    auth.disabled = true;
                    auth.status = AuthStatus::Disabled;
                })
                .await;
            }
            // Recoverable auth failure: another credential will be tried, the
            // refresher gets a chance to fix this one.
            Some(401) | Some(403) => {}
            Some(429) => {
                let retry_after = result.retry_after;
                let model = result.model.clone();
                let _ = self.update(&result.auth_id, |auth| {
                    auth.status = AuthStatus::Cooling;
                    if let Some(after) = retry_after {
                        let until = now + after;
                        if model.is_empty() {
                            auth.unavailable = true;
                            auth.next_retry_after = Some(until);
                        } else {
                            let state = auth.model_state_mut(&model);
                            state.quota.exceeded = true;
                            state.quota.next_recover_at = Some(until);
                        }
                    }
                })
                .await;
            }
            _ => {}
        }
    }

    async fn persist(&self, auth: &mut Auth) {
        let Some(store) = self.store.clone() else {
            return;
        };
        if auth.runtime_only() {
            return;
        }
        if let Err(err) = store.save(auth) {
            warn!(auth_id = %auth.id, %err, "auth persistence failed");
            // Keep serving from memory; surface the problem on the entry.
            let id = auth.id.clone();
            let mut guard = self.inner.write().await;
            if let Some(stored) = guard.get_mut(&id) {
                stored.status = AuthStatus::Error;
                auth.status = AuthStatus::Error;
            }
        }
    }
}

fn derive_id(auth: &Auth) -> String {
    let seed = format!(
        "{}:{}:{}",
        auth.provider,
        auth.label,
        auth.created_at.unix_timestamp_nanos()
    );
    format!("{}-{:08x}", auth.provider, fnv32a(seed.as_bytes()))
}
