use std::sync::Arc;
use std::time::Duration;

use lmux_provider_core::{
    Auth, AuthChange, AuthRegistry, AuthStatus, FileStore, PickOptions, QuotaManager,
    RequestResult, Selector, StickyStore,
};

fn result_err(auth_id: &str, status: u16, message: &str) -> RequestResult {
    RequestResult {
        auth_id: auth_id.to_string(),
        provider: "claude".to_string(),
        model: "claude-sonnet-4-5".to_string(),
        success: false,
        status: Some(status),
        message: message.to_string(),
        retry_after: None,
    }
}

#[tokio::test]
async fn register_is_upsert_by_id() {
    let registry = AuthRegistry::new(None);

    let mut first = Auth::new("claude", "c1");
    first.metadata.access_token = "tok-a".into();
    let (_, created) = registry.register(first).await;
    assert!(created);

    let mut second = Auth::new("claude", "c1");
    second.label = "renamed".into();
    let (merged, created) = registry.register(second).await;
    assert!(!created);
    assert_eq!(merged.label, "renamed");
    // Merge keeps the token the update left empty.
    assert_eq!(merged.metadata.access_token, "tok-a");
    assert_eq!(registry.list().await.len(), 1);
}

#[tokio::test]
async fn revoked_401_disables_the_credential() {
    let registry = AuthRegistry::new(None);
    registry.register(Auth::new("claude", "c1")).await;

    registry
        .mark_result(result_err(
            "c1",
            401,
            "OAuth token has been revoked, please re-authenticate",
        ))
        .await;

    let auth = registry.get("c1").await.unwrap();
    assert!(auth.disabled);
    assert_eq!(auth.status, AuthStatus::Disabled);

    // And the selector excludes it from then on.
    let selector = Selector::new(
        Arc::new(StickyStore::new()),
        Arc::new(QuotaManager::default()),
    );
    let err = selector
        .pick(
            "claude",
            "claude-sonnet-4-5",
            &PickOptions::default(),
            &[auth],
        )
        .unwrap_err();
    assert_eq!(err, lmux_provider_core::PickError::AllBlocked);
}

#[tokio::test]
async fn plain_401_does_not_disable() {
    let registry = AuthRegistry::new(None);
    registry.register(Auth::new("claude", "c1")).await;

    registry.mark_result(result_err("c1", 401, "Unauthorized")).await;

    let auth = registry.get("c1").await.unwrap();
    assert!(!auth.disabled);
    assert_ne!(auth.status, AuthStatus::Disabled);
}

#[tokio::test]
async fn rate_limit_cools_but_never_disables() {
    let registry = AuthRegistry::new(None);
    registry.register(Auth::new("claude", "c1")).await;

    let mut result = result_err("c1", 429, "rate limit exceeded");
    result.retry_after = Some(Duration::from_secs(900));
    registry.mark_result(result).await;

    let auth = registry.get("c1").await.unwrap();
    assert!(!auth.disabled);
    assert_ne!(auth.status, AuthStatus::Disabled);
    assert_eq!(auth.status, AuthStatus::Cooling);
    let state = auth.model_states.get("claude-sonnet-4-5").unwrap();
    assert!(state.quota.exceeded);
    assert!(state.quota.next_recover_at.is_some());
}

#[tokio::test]
async fn success_resets_status_and_model_flags() {
    let registry = AuthRegistry::new(None);
    registry.register(Auth::new("claude", "c1")).await;

    let mut result = result_err("c1", 429, "rate limited");
    result.retry_after = Some(Duration::from_secs(60));
    registry.mark_result(result).await;

    registry
        .mark_result(RequestResult::ok("c1", "claude", "claude-sonnet-4-5"))
        .await;

    let auth = registry.get("c1").await.unwrap();
    assert_eq!(auth.status, AuthStatus::Active);
    let state = auth.model_states.get("claude-sonnet-4-5").unwrap();
    assert!(!state.quota.exceeded);
    assert!(state.quota.next_recover_at.is_none());
}

#[tokio::test]
async fn watch_sees_create_update_delete() {
    let registry = AuthRegistry::new(None);
    let mut watcher = registry.watch();

    registry.register(Auth::new("gemini", "g1")).await;
    registry
        .update("g1", |auth| auth.label = "work".to_string())
        .await;
    registry.delete("g1").await;

    assert!(matches!(watcher.recv().await.unwrap(), AuthChange::Created(_)));
    assert!(matches!(watcher.recv().await.unwrap(), AuthChange::Updated(_)));
    assert!(matches!(
        watcher.recv().await.unwrap(),
        AuthChange::Deleted(id) if id == "g1"
    ));
}

#[tokio::test]
async fn disk_backed_registry_persists_and_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()).unwrap());

    {
        let registry = AuthRegistry::new(Some(store.clone()));
        let mut auth = Auth::new("claude", "c1");
        auth.metadata.refresh_token = "rt".into();
        registry.register(auth).await;

        let mut transient = Auth::new("claude", "tmp");
        transient
            .attributes
            .insert("runtime_only".into(), "true".into());
        registry.register(transient).await;
    }

    let registry = AuthRegistry::new(Some(store));
    let loaded = registry.load_from_store().await.unwrap();
    assert_eq!(loaded, 1, "runtime_only entries must not persist");
    assert_eq!(
        registry.get("c1").await.unwrap().metadata.refresh_token,
        "rt"
    );
}
