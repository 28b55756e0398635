use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

pub type AuthId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Active,
    Disabled,
    Error,
    Cooling,
    Unavailable,
}

impl Default for AuthStatus {
    fn default() -> Self {
        AuthStatus::Active
    }
}

/// Typed credential payload. Providers use the subset that applies to them;
/// anything else rides in `extra` so unknown upstream fields survive a
/// load/save cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    /// Unix seconds; 0 means unknown.
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl AuthMetadata {
    pub fn expires_in(&self, now: OffsetDateTime) -> Option<Duration> {
        if self.expires_at <= 0 {
            return None;
        }
        let remaining = self.expires_at - now.unix_timestamp();
        Some(Duration::from_secs(remaining.max(0) as u64))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaState {
    #[serde(default)]
    pub exceeded: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_recover_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub exponential_level: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelState {
    #[serde(default)]
    pub status: AuthStatus,
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_retry_after: Option<OffsetDateTime>,
    #[serde(default)]
    pub quota: QuotaState,
}

/// Provider-supplied "should this auth refresh now?" capability, populated by
/// the registry at load time. Kept as a trait object so the auth entry never
/// holds a concrete provider type.
pub trait RefreshEvaluator: Send + Sync {
    fn should_refresh(&self, auth: &Auth, now: OffsetDateTime) -> bool;
}

/// Why a candidate was rejected during selection. Shapes the error the
/// selector returns when nothing survives filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    AuthCooling(OffsetDateTime),
    ModelCooling(OffsetDateTime),
    QuotaCooling(OffsetDateTime),
}

impl SkipReason {
    pub fn recover_at(&self) -> Option<OffsetDateTime> {
        match self {
            SkipReason::Disabled => None,
            SkipReason::AuthCooling(at)
            | SkipReason::ModelCooling(at)
            | SkipReason::QuotaCooling(at) => Some(*at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    pub id: AuthId,
    #[serde(default)]
    pub label: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    #[serde(default)]
    pub status: AuthStatus,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_retry_after: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_refreshed_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_refresh_after: Option<OffsetDateTime>,
    #[serde(default)]
    pub metadata: AuthMetadata,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_states: HashMap<String, ModelState>,
    #[serde(skip)]
    pub runtime: Option<Arc<dyn RefreshEvaluator>>,
}

impl std::fmt::Debug for dyn RefreshEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RefreshEvaluator")
    }
}

impl Auth {
    pub fn new(provider: impl Into<String>, id: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: id.into(),
            label: String::new(),
            provider: provider.into(),
            file_name: String::new(),
            status: AuthStatus::Active,
            disabled: false,
            unavailable: false,
            next_retry_after: None,
            created_at: now,
            updated_at: now,
            last_refreshed_at: None,
            next_refresh_after: None,
            metadata: AuthMetadata::default(),
            attributes: HashMap::new(),
            model_states: HashMap::new(),
            runtime: None,
        }
    }

    /// The §3 pickability predicate. `quota_cooldown` is the quota manager's
    /// auth-level cooldown, passed in because that state lives outside the
    /// entry.
    pub fn pickable_for(
        &self,
        model: &str,
        now: OffsetDateTime,
        quota_cooldown: Option<OffsetDateTime>,
    ) -> Result<(), SkipReason> {
        if self.disabled || self.status == AuthStatus::Disabled {
            return Err(SkipReason::Disabled);
        }
        if self.unavailable
            && let Some(until) = self.next_retry_after
            && until > now
        {
            return Err(SkipReason::AuthCooling(until));
        }
        if let Some(state) = self.model_states.get(model) {
            if state.unavailable
                && let Some(until) = state.next_retry_after
                && until > now
            {
                return Err(SkipReason::ModelCooling(until));
            }
            if state.quota.exceeded
                && let Some(until) = state.quota.next_recover_at
                && until > now
            {
                return Err(SkipReason::ModelCooling(until));
            }
        }
        if let Some(until) = quota_cooldown
            && until > now
        {
            return Err(SkipReason::QuotaCooling(until));
        }
        Ok(())
    }

    /// Upsert merge: non-empty fields of `incoming` win, bookkeeping fields
    /// are preserved.
    pub fn merge_from(&mut self, incoming: Auth) {
        if !incoming.label.is_empty() {
            self.label = incoming.label;
        }
        if !incoming.file_name.is_empty() {
            self.file_name = incoming.file_name;
        }
        if !incoming.metadata.access_token.is_empty() {
            self.metadata.access_token = incoming.metadata.access_token;
        }
        if !incoming.metadata.refresh_token.is_empty() {
            self.metadata.refresh_token = incoming.metadata.refresh_token;
        }
        if !incoming.metadata.api_key.is_empty() {
            self.metadata.api_key = incoming.metadata.api_key;
        }
        if incoming.metadata.expires_at > 0 {
            self.metadata.expires_at = incoming.metadata.expires_at;
        }
        if incoming.metadata.email.is_some() {
            self.metadata.email = incoming.metadata.email;
        }
        if incoming.metadata.subscription_type.is_some() {
            self.metadata.subscription_type = incoming.metadata.subscription_type;
        }
        if incoming.metadata.project_id.is_some() {
            self.metadata.project_id = incoming.metadata.project_id;
        }
        if incoming.metadata.account_id.is_some() {
            self.metadata.account_id = incoming.metadata.account_id;
        }
        for (key, value) in incoming.metadata.extra {
            self.metadata.extra.insert(key, value);
        }
        for (key, value) in incoming.attributes {
            self.attributes.insert(key, value);
        }
        self.updated_at = OffsetDateTime::now_utc();
    }

    /// Marked runtime-only auths never touch disk.
    pub fn runtime_only(&self) -> bool {
        self.attributes
            .get("runtime_only")
            .is_some_and(|value| value == "true")
    }

    /// Explicit refresh cadence, overriding the provider lead when present.
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.attributes
            .get("refresh_interval_seconds")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs)
    }

    pub fn model_state_mut(&mut self, model: &str) -> &mut ModelState {
        self.model_states.entry(model.to_string()).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_auth_is_never_pickable() {
        let now = OffsetDateTime::now_utc();
        let mut auth = Auth::new("claude", "c1");
        auth.disabled = true;
        assert_eq!(
            auth.pickable_for("m", now, None),
            Err(SkipReason::Disabled)
        );
    }

    #[test]
    fn expired_cooldowns_do_not_block() {
        let now = OffsetDateTime::now_utc();
        let mut auth = Auth::new("claude", "c1");
        auth.unavailable = true;
        auth.next_retry_after = Some(now - time::Duration::seconds(5));
        assert!(auth.pickable_for("m", now, None).is_ok());

        let state = auth.model_state_mut("m");
        state.quota.exceeded = true;
        state.quota.next_recover_at = Some(now - time::Duration::seconds(1));
        assert!(auth.pickable_for("m", now, None).is_ok());
    }

    #[test]
    fn model_cooldown_blocks_only_that_model() {
        let now = OffsetDateTime::now_utc();
        let mut auth = Auth::new("claude", "c1");
        let state = auth.model_state_mut("busy-model");
        state.unavailable = true;
        state.next_retry_after = Some(now + time::Duration::minutes(10));
        assert!(matches!(
            auth.pickable_for("busy-model", now, None),
            Err(SkipReason::ModelCooling(_))
        ));
        assert!(auth.pickable_for("other-model", now, None).is_ok());
    }

    #[test]
    fn quota_cooldown_passed_in_blocks() {
        let now = OffsetDateTime::now_utc();
        let auth = Auth::new("claude", "c1");
        let until = now + time::Duration::hours(1);
        assert_eq!(
            auth.pickable_for("m", now, Some(until)),
            Err(SkipReason::QuotaCooling(until))
        );
    }

    #[test]
    fn merge_keeps_existing_when_incoming_empty() {
        let mut auth = Auth::new("claude", "c1");
        auth.metadata.access_token = "tok".into();
        auth.label = "main".into();

        let incoming = Auth::new("claude", "c1");
        auth.merge_from(incoming);
        assert_eq!(auth.metadata.access_token, "tok");
        assert_eq!(auth.label, "main");
    }

    #[test]
    fn serde_skips_runtime_capability() {
        let auth = Auth::new("claude", "c1");
        let json = serde_json::to_string(&auth).unwrap();
        assert!(!json.contains("runtime"));
        let parsed: Auth = serde_json::from_str(&json).unwrap();
        assert!(parsed.runtime.is_none());
    }
}
