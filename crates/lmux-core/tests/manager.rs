use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use lmux_common::{ErrorCategory, GatewayError};
use lmux_core::{ChatOutcome, Manager, ManagerConfig, RequestContext, UpstreamClient};
use lmux_provider_core::{
    Auth, AuthRegistry, AuthStatus, EventHub, GatewayEvent, ProviderExecutor, QuotaManager,
    RefreshError, RefreshUpdate, Selector, StickyStore, StreamDecoder, UpstreamBody,
    UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
};
use lmux_transform::{ChatRequest, ChatResponse, Message, StreamDelta, ir::Role};

/// Scripted upstream: each send pops the next canned result and records the
/// bearer that was used.
struct ScriptedClient {
    script: Mutex<Vec<Result<(u16, &'static str), UpstreamFailure>>>,
    bearers: Mutex<Vec<String>>,
}

impl ScriptedClient {
    fn new(script: Vec<Result<(u16, &'static str), UpstreamFailure>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            bearers: Mutex::new(Vec::new()),
        })
    }

    fn bearers(&self) -> Vec<String> {
        self.bearers.lock().unwrap().clone()
    }
}

impl UpstreamClient for ScriptedClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            if let Some(bearer) = lmux_provider_core::header_get(&req.headers, "authorization") {
                self.bearers.lock().unwrap().push(bearer.to_string());
            }
            let next = self
                .script
                .lock()
                .unwrap()
                .pop()
                .expect("script exhausted");
            match next {
                Ok((status, body)) if (200..300).contains(&status) => Ok(UpstreamHttpResponse {
                    status,
                    headers: Vec::new(),
                    body: UpstreamBody::Bytes(Bytes::from_static(body.as_bytes())),
                }),
                Ok((status, body)) => {
                    let headers = if status == 429 {
                        vec![("retry-after".to_string(), "1800".to_string())]
                    } else {
                        Vec::new()
                    };
                    Err(UpstreamFailure::Http {
                        status,
                        headers,
                        body: Bytes::from_static(body.as_bytes()),
                    })
                }
                Err(failure) => Err(failure),
            }
        })
    }
}

struct JsonExecutor;

struct JsonDecoder;

impl StreamDecoder for JsonDecoder {
    fn decode(&mut self, data: &str) -> Result<Vec<StreamDelta>, GatewayError> {
        let parsed: StreamDelta = serde_json::from_str(data)
            .map_err(|err| GatewayError::new(ErrorCategory::Unknown, err.to_string()))?;
        Ok(vec![parsed])
    }
    fn finish(&mut self) -> Result<Vec<StreamDelta>, GatewayError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl ProviderExecutor for JsonExecutor {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn build_chat(
        &self,
        auth: &Auth,
        request: &ChatRequest,
    ) -> Result<UpstreamHttpRequest, GatewayError> {
        Ok(UpstreamHttpRequest {
            method: lmux_provider_core::HttpMethod::Post,
            url: "https://upstream.test/v1/messages".to_string(),
            headers: vec![(
                "authorization".to_string(),
                format!("Bearer {}", auth.id),
            )],
            body: Some(Bytes::from(serde_json::to_vec(request).unwrap())),
            is_stream: request.stream,
        })
    }

    fn parse_response(&self, body: &[u8]) -> Result<ChatResponse, GatewayError> {
        serde_json::from_slice(body)
            .map_err(|err| GatewayError::new(ErrorCategory::Unknown, err.to_string()))
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(JsonDecoder)
    }

    async fn refresh(&self, _auth: &Auth) -> Result<RefreshUpdate, RefreshError> {
        Err(RefreshError::Transient("not under test".to_string()))
    }
}

async fn manager_with(
    auth_ids: &[&str],
    client: Arc<ScriptedClient>,
) -> (Manager, Arc<AuthRegistry>, Arc<QuotaManager>) {
    let registry = Arc::new(AuthRegistry::new(None));
    for id in auth_ids {
        registry.register(Auth::new("claude", *id)).await;
    }
    let quota = Arc::new(QuotaManager::default());
    let selector = Arc::new(Selector::new(Arc::new(StickyStore::new()), quota.clone()));
    let mut executors: HashMap<String, Arc<dyn ProviderExecutor>> = HashMap::new();
    executors.insert("claude".to_string(), Arc::new(JsonExecutor));
    let manager = Manager::new(
        registry.clone(),
        selector,
        quota.clone(),
        executors,
        client,
        EventHub::new(16),
        ManagerConfig {
            max_attempts: 3,
            max_cooldown_wait: Duration::from_millis(50),
            cooldown_poll: Duration::from_millis(10),
            ..Default::default()
        },
    );
    (manager, registry, quota)
}

fn ok_body() -> &'static str {
    r#"{"model":"claude-sonnet-4-5","blocks":[{"kind":"text","text":"hello"}],"stop_reason":"end_turn","usage":{"input":3,"output":5,"cached":0,"reasoning":0}}"#
}

fn chat_request(stream: bool) -> ChatRequest {
    ChatRequest {
        model: "claude-sonnet-4-5".to_string(),
        messages: vec![Message::text(Role::User, "hi")],
        stream,
        ..Default::default()
    }
}

#[tokio::test]
async fn quota_hit_falls_over_to_second_auth() {
    // Script is popped back-to-front: first call 429, retry succeeds.
    let client = ScriptedClient::new(vec![Ok((200, ok_body())), Ok((429, "rate limited"))]);
    let (manager, _registry, quota) = manager_with(&["c1", "c2"], client.clone()).await;

    let outcome = manager
        .execute(RequestContext::default(), chat_request(false))
        .await
        .expect("fallback should succeed");
    match outcome {
        ChatOutcome::Unary(resp) => assert_eq!(resp.text(), "hello"),
        ChatOutcome::Stream(_) => panic!("expected unary"),
    }

    let bearers = client.bearers();
    assert_eq!(bearers.len(), 2);
    assert_ne!(bearers[0], bearers[1], "retry must use another credential");

    // The 429'd credential is cooling with the advertised window.
    let cooled = bearers[0].trim_start_matches("Bearer ").to_string();
    assert!(quota.cooldown_until(&cooled).is_some());
}

#[tokio::test]
async fn revoked_credential_is_disabled_and_skipped() {
    let client = ScriptedClient::new(vec![
        Ok((200, ok_body())),
        Ok((401, "OAuth token has been revoked")),
    ]);
    let (manager, registry, _) = manager_with(&["c1", "c2"], client.clone()).await;

    manager
        .execute(RequestContext::default(), chat_request(false))
        .await
        .expect("second credential should serve");

    let bearers = client.bearers();
    let dead = bearers[0].trim_start_matches("Bearer ").to_string();
    let auth = registry.get(&dead).await.unwrap();
    assert!(auth.disabled);
    assert_eq!(auth.status, AuthStatus::Disabled);
}

#[tokio::test]
async fn all_cooling_surfaces_429_with_retry_after() {
    let client = ScriptedClient::new(vec![]);
    let (manager, _, quota) = manager_with(&["c1", "c2"], client).await;
    quota.record_quota_hit("c1", "claude", "claude-sonnet-4-5", Some(Duration::from_secs(3600)));
    quota.record_quota_hit("c2", "claude", "claude-sonnet-4-5", Some(Duration::from_secs(7200)));

    let err = manager
        .execute(RequestContext::default(), chat_request(false))
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::QuotaError);
    assert_eq!(err.status, Some(429));
    let retry = err.retry_after.expect("retry-after populated").as_secs();
    assert!((3590..=3600).contains(&retry), "retry-after {retry} should be the minimum cooldown");
}

#[tokio::test]
async fn user_error_never_retries() {
    let client = ScriptedClient::new(vec![Ok((200, ok_body())), Ok((400, "bad request"))]);
    let (manager, _, _) = manager_with(&["c1", "c2"], client.clone()).await;

    let err = manager
        .execute(RequestContext::default(), chat_request(false))
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::UserError);
    assert_eq!(client.bearers().len(), 1, "400 must not burn another attempt");
}

#[tokio::test]
async fn transient_errors_retry_until_budget_spent() {
    let client = ScriptedClient::new(vec![
        Ok((503, "upstream sad")),
        Ok((503, "upstream sad")),
        Ok((503, "upstream sad")),
    ]);
    let (manager, _, _) = manager_with(&["c1", "c2", "c3"], client.clone()).await;

    let err = manager
        .execute(RequestContext::default(), chat_request(false))
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Transient);
    assert_eq!(client.bearers().len(), 3, "three attempts for max_attempts=3");
}

#[tokio::test]
async fn stream_outcome_delivers_deltas_and_usage_event() {
    let body = "data: {\"kind\":\"start\",\"model\":\"claude-sonnet-4-5\"}\n\n\
                data: {\"kind\":\"text\",\"index\":0,\"text\":\"hel\"}\n\n\
                data: {\"kind\":\"text\",\"index\":0,\"text\":\"lo\"}\n\n\
                data: {\"kind\":\"finish\",\"stop_reason\":\"end_turn\",\"usage\":{\"input\":2,\"output\":4,\"cached\":0,\"reasoning\":0}}\n\n";

    struct StreamingClient {
        body: &'static str,
    }
    impl UpstreamClient for StreamingClient {
        fn send<'a>(
            &'a self,
            _req: UpstreamHttpRequest,
        ) -> Pin<
            Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>,
        > {
            Box::pin(async move {
                let (tx, rx) = tokio::sync::mpsc::channel(4);
                let body = self.body;
                tokio::spawn(async move {
                    for chunk in body.as_bytes().chunks(17) {
                        if tx.send(Bytes::copy_from_slice(chunk)).await.is_err() {
                            return;
                        }
                    }
                });
                Ok(UpstreamHttpResponse {
                    status: 200,
                    headers: Vec::new(),
                    body: UpstreamBody::Stream(rx),
                })
            })
        }
    }

    let registry = Arc::new(AuthRegistry::new(None));
    registry.register(Auth::new("claude", "c1")).await;
    let quota = Arc::new(QuotaManager::default());
    let selector = Arc::new(Selector::new(Arc::new(StickyStore::new()), quota.clone()));
    let mut executors: HashMap<String, Arc<dyn ProviderExecutor>> = HashMap::new();
    executors.insert("claude".to_string(), Arc::new(JsonExecutor));
    let events = EventHub::new(16);
    let mut usage_feed = events.subscribe();
    let manager = Manager::new(
        registry,
        selector,
        quota.clone(),
        executors,
        Arc::new(StreamingClient { body }),
        events,
        ManagerConfig::default(),
    );

    let outcome = manager
        .execute(RequestContext::default(), chat_request(true))
        .await
        .unwrap();
    let mut stream = match outcome {
        ChatOutcome::Stream(stream) => stream,
        ChatOutcome::Unary(_) => panic!("expected stream"),
    };

    let mut text = String::new();
    let mut saw_finish = false;
    while let Some(delta) = stream.recv().await {
        match delta.unwrap() {
            StreamDelta::Text { text: chunk, .. } => text.push_str(&chunk),
            StreamDelta::Finish { usage, .. } => {
                saw_finish = true;
                assert_eq!(usage.unwrap().output, 4);
            }
            _ => {}
        }
    }
    assert_eq!(text, "hello");
    assert!(saw_finish);

    // The pump emits one usage event and leaves no active request behind.
    let event = tokio::time::timeout(Duration::from_secs(1), usage_feed.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        GatewayEvent::Usage(usage) => {
            assert!(usage.success);
            assert_eq!(usage.usage.output, 4);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(quota.state("c1").active_requests(), 0);
}
