use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use lmux_common::GatewayError;
use lmux_provider_core::{
    Auth, AuthRegistry, AuthStatus, ProviderExecutor, RefreshError, RefreshUpdate, RefresherConfig,
    StreamDecoder, TokenRefresher, UpstreamHttpRequest,
};
use lmux_transform::{ChatRequest, ChatResponse, StreamDelta};

struct FakeClaudeExecutor {
    refreshes: AtomicU32,
    outcome: fn() -> Result<RefreshUpdate, RefreshError>,
}

struct NoopDecoder;

impl StreamDecoder for NoopDecoder {
    fn decode(&mut self, _data: &str) -> Result<Vec<StreamDelta>, GatewayError> {
        Ok(Vec::new())
    }
    fn finish(&mut self) -> Result<Vec<StreamDelta>, GatewayError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl ProviderExecutor for FakeClaudeExecutor {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn refresh_lead(&self) -> Duration {
        Duration::from_secs(4 * 3600)
    }

    fn build_chat(
        &self,
        _auth: &Auth,
        _request: &ChatRequest,
    ) -> Result<UpstreamHttpRequest, GatewayError> {
        Err(GatewayError::user("not under test"))
    }

    fn parse_response(&self, _body: &[u8]) -> Result<ChatResponse, GatewayError> {
        Err(GatewayError::user("not under test"))
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(NoopDecoder)
    }

    async fn refresh(&self, _auth: &Auth) -> Result<RefreshUpdate, RefreshError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        (self.outcome)()
    }
}

fn refresher_with(
    registry: Arc<AuthRegistry>,
    outcome: fn() -> Result<RefreshUpdate, RefreshError>,
) -> (Arc<TokenRefresher>, Arc<FakeClaudeExecutor>) {
    let executor = Arc::new(FakeClaudeExecutor {
        refreshes: AtomicU32::new(0),
        outcome,
    });
    let mut executors: HashMap<String, Arc<dyn ProviderExecutor>> = HashMap::new();
    executors.insert("claude".to_string(), executor.clone());
    let refresher = Arc::new(TokenRefresher::new(
        registry,
        executors,
        RefresherConfig::default(),
    ));
    (refresher, executor)
}

/// Poll until the registry snapshot satisfies the predicate; panics after
/// one second of trying.
async fn wait_for_auth<F>(registry: &AuthRegistry, id: &str, predicate: F) -> Auth
where
    F: Fn(&Auth) -> bool,
{
    for _ in 0..100 {
        if let Some(auth) = registry.get(id).await
            && predicate(&auth)
        {
            return auth;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("auth {id} never reached the expected state");
}

#[tokio::test]
async fn expiring_token_refreshes_within_lead() {
    let registry = Arc::new(AuthRegistry::new(None));
    let now = OffsetDateTime::now_utc();

    let mut auth = Auth::new("claude", "c1");
    auth.metadata.refresh_token = "rt-old".into();
    auth.metadata.access_token = "at-old".into();
    // Expires in two hours; the claude lead is four.
    auth.metadata.expires_at = (now + time::Duration::hours(2)).unix_timestamp();
    registry.register(auth).await;

    let (refresher, executor) = refresher_with(registry.clone(), || {
        Ok(RefreshUpdate {
            access_token: "at-new".to_string(),
            refresh_token: Some("rt-new".to_string()),
            expires_at: (OffsetDateTime::now_utc() + time::Duration::hours(8)).unix_timestamp(),
        })
    });

    refresher.tick().await;
    let auth = wait_for_auth(&registry, "c1", |auth| {
        auth.metadata.access_token == "at-new"
    })
    .await;

    assert_eq!(executor.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(auth.metadata.refresh_token, "rt-new");
    let refreshed_at = auth.last_refreshed_at.expect("last_refreshed_at set");
    assert!((OffsetDateTime::now_utc() - refreshed_at).whole_seconds() < 5);
    assert!(auth.next_refresh_after.expect("backoff window") > OffsetDateTime::now_utc());
    let remaining = auth.metadata.expires_at - OffsetDateTime::now_utc().unix_timestamp();
    assert!(remaining > 7 * 3600);
}

#[tokio::test]
async fn fresh_token_is_left_alone() {
    let registry = Arc::new(AuthRegistry::new(None));
    let now = OffsetDateTime::now_utc();

    let mut auth = Auth::new("claude", "c1");
    auth.metadata.refresh_token = "rt".into();
    auth.metadata.expires_at = (now + time::Duration::hours(12)).unix_timestamp();
    registry.register(auth).await;

    let (refresher, executor) =
        refresher_with(registry.clone(), || Ok(RefreshUpdate::default()));
    refresher.tick().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(executor.refreshes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_grant_disables_the_auth() {
    let registry = Arc::new(AuthRegistry::new(None));
    let now = OffsetDateTime::now_utc();

    let mut auth = Auth::new("claude", "c1");
    auth.metadata.refresh_token = "rt".into();
    auth.metadata.expires_at = (now + time::Duration::minutes(5)).unix_timestamp();
    registry.register(auth).await;

    let (refresher, _) = refresher_with(registry.clone(), || {
        Err(RefreshError::Revoked("invalid_grant".to_string()))
    });
    refresher.tick().await;

    let auth = wait_for_auth(&registry, "c1", |auth| auth.disabled).await;
    assert_eq!(auth.status, AuthStatus::Disabled);
}

#[tokio::test]
async fn transient_failure_backs_off_and_keeps_token() {
    let registry = Arc::new(AuthRegistry::new(None));
    let now = OffsetDateTime::now_utc();

    let mut auth = Auth::new("claude", "c1");
    auth.metadata.refresh_token = "rt".into();
    auth.metadata.access_token = "at-old".into();
    auth.metadata.expires_at = (now + time::Duration::minutes(5)).unix_timestamp();
    registry.register(auth).await;

    let (refresher, _) = refresher_with(registry.clone(), || {
        Err(RefreshError::Transient("connection reset".to_string()))
    });
    refresher.tick().await;

    let auth = wait_for_auth(&registry, "c1", |auth| {
        auth.next_refresh_after
            .is_some_and(|after| after > OffsetDateTime::now_utc() + Duration::from_secs(120))
    })
    .await;
    assert_eq!(auth.metadata.access_token, "at-old");
    assert!(!auth.disabled);
}
