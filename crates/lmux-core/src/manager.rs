use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lmux_common::{ErrorCategory, GatewayError};
use lmux_provider_core::{
    Auth, AuthRegistry, EventHub, GatewayEvent, OperationalEvent, PickError, PickOptions,
    ProviderExecutor, QuotaManager, RequestResult, RequestTicket, Selector, StreamDecoder,
    UpstreamBody, UpstreamFailure, UsageEvent,
};
use lmux_transform::{ChatRequest, ChatResponse, StreamDelta, TokenUsage, UsageAccumulator, alias};

use crate::stream::FrameSniffer;
use crate::upstream_client::UpstreamClient;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_attempts: u32,
    /// Upper bound for waiting out cooldowns when every auth is cooling.
    pub max_cooldown_wait: Duration,
    pub cooldown_poll: Duration,
    /// Canonical models that must never ride on these subscription accounts.
    pub oauth_excluded_models: Vec<String>,
    /// Rotate Gemini-family credentials to their backup project on quota
    /// exhaustion.
    pub switch_project: bool,
    /// Retry a quota-exhausted request once on the `-preview` model variant.
    pub switch_preview_model: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_cooldown_wait: Duration::from_secs(30),
            cooldown_poll: Duration::from_millis(500),
            oauth_excluded_models: Vec::new(),
            switch_project: false,
            switch_preview_model: false,
        }
    }
}

/// Per-request context from the router. Cancellation is by drop: abandoning
/// the `execute` future (or the returned [`DeltaStream`]) tears down the
/// upstream call.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub trace_id: String,
    pub fingerprint: Option<String>,
}

/// A live delta stream. The first event is held back so the manager could
/// still fall over to another credential when a stream dies before
/// producing anything.
#[derive(Debug)]
pub struct DeltaStream {
    first: Option<StreamDelta>,
    rx: mpsc::Receiver<Result<StreamDelta, GatewayError>>,
}

impl DeltaStream {
    pub async fn recv(&mut self) -> Option<Result<StreamDelta, GatewayError>> {
        if let Some(delta) = self.first.take() {
            return Some(Ok(delta));
        }
        self.rx.recv().await
    }
}

#[derive(Debug)]
pub enum ChatOutcome {
    Unary(ChatResponse),
    Stream(DeltaStream),
}

/// The public entry point: pick a credential, execute, observe the result,
/// then retry on another credential, wait out a cooldown, or surface.
pub struct Manager {
    registry: Arc<AuthRegistry>,
    selector: Arc<Selector>,
    quota: Arc<QuotaManager>,
    executors: HashMap<String, Arc<dyn ProviderExecutor>>,
    client: Arc<dyn UpstreamClient>,
    events: EventHub,
    config: ManagerConfig,
}

impl Manager {
    pub fn new(
        registry: Arc<AuthRegistry>,
        selector: Arc<Selector>,
        quota: Arc<QuotaManager>,
        executors: HashMap<String, Arc<dyn ProviderExecutor>>,
        client: Arc<dyn UpstreamClient>,
        events: EventHub,
        config: ManagerConfig,
    ) -> Self {
        Self {
            registry,
            selector,
            quota,
            executors,
            client,
            events,
            config,
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn registry(&self) -> &Arc<AuthRegistry> {
        &self.registry
    }

    /// Providers that can serve this canonical model, priority order. Names
    /// outside the alias table go to every provider holding credentials.
    async fn provider_targets(&self, model: &str) -> Vec<String> {
        let (base, _) = alias::split_reasoning_suffix(model);
        let routed: Vec<String> = alias::providers_for(base)
            .into_iter()
            .filter(|name| self.executors.contains_key(*name))
            .map(str::to_string)
            .collect();
        if !routed.is_empty() {
            return dedup_keep_order(routed);
        }
        let mut fallback: Vec<String> = self
            .registry
            .list()
            .await
            .into_iter()
            .map(|auth| auth.provider)
            .filter(|name| self.executors.contains_key(name))
            .collect();
        fallback.sort();
        dedup_keep_order(fallback)
    }

    pub async fn execute(
        &self,
        ctx: RequestContext,
        request: ChatRequest,
    ) -> Result<ChatOutcome, GatewayError> {
        let (base_model, _) = alias::split_reasoning_suffix(&request.model);
        if self
            .config
            .oauth_excluded_models
            .iter()
            .any(|excluded| excluded == base_model)
        {
            return Err(GatewayError::not_found(format!(
                "model {base_model} is excluded from this gateway"
            )));
        }

        let providers = self.provider_targets(&request.model).await;
        if providers.is_empty() {
            return Err(GatewayError::not_found(format!(
                "no provider can serve model {}",
                request.model
            )));
        }

        // One retry budget across the whole fan-out.
        let mut attempts_left = self.config.max_attempts.max(1);
        let mut last_err: Option<GatewayError> = None;
        let mut request = request;
        let mut tried_preview = false;

        for provider_name in &providers {
            let executor = match self.executors.get(provider_name) {
                Some(executor) => executor.clone(),
                None => continue,
            };
            let mut rotate = false;
            let mut waited_cooldown = false;

            while attempts_left > 0 {
                let candidates = self.registry.list_provider(provider_name).await;
                let options = PickOptions {
                    force_rotate: rotate,
                    fingerprint: ctx.fingerprint.clone(),
                };
                let auth = match self
                    .selector
                    .pick(provider_name, &request.model, &options, &candidates)
                {
                    Ok(auth) => auth,
                    Err(PickError::NotFound) => break,
                    Err(PickError::AllBlocked) => {
                        last_err = Some(
                            GatewayError::new(
                                ErrorCategory::AuthError,
                                format!("all {provider_name} credentials are disabled"),
                            )
                            .with_status(503),
                        );
                        break;
                    }
                    Err(PickError::Cooling { retry_after }) => {
                        if waited_cooldown {
                            last_err = Some(GatewayError::quota(
                                format!("all {provider_name} credentials cooling down"),
                                Some(retry_after),
                            ));
                            break;
                        }
                        waited_cooldown = true;
                        let wait = retry_after.min(self.config.max_cooldown_wait);
                        if !self.wait_for_available_auth(provider_name, &request.model, wait).await
                        {
                            last_err = Some(GatewayError::quota(
                                format!("all {provider_name} credentials cooling down"),
                                Some(retry_after),
                            ));
                            break;
                        }
                        continue;
                    }
                };

                attempts_left -= 1;
                rotate = true;
                debug!(
                    trace_id = %ctx.trace_id,
                    provider = %provider_name,
                    auth_id = %auth.id,
                    model = %request.model,
                    attempts_left,
                    "attempting upstream call"
                );

                match self.run_attempt(&ctx, provider_name, &executor, &auth, &request).await {
                    Ok(outcome) => return Ok(outcome),
                    Err(err) => {
                        if err.category == ErrorCategory::QuotaError
                            && self.config.switch_preview_model
                            && !tried_preview
                            && is_gemini_family(provider_name)
                            && !request.model.contains("-preview")
                        {
                            tried_preview = true;
                            request.model = format!("{}-preview", request.model);
                            info!(
                                trace_id = %ctx.trace_id,
                                model = %request.model,
                                "quota exhausted, switching to preview model"
                            );
                        }
                        // `should_fallback` governs the credential; a revoked
                        // one is dead (observe_failure disabled it) but the
                        // request itself still moves to the next candidate.
                        let request_can_fall_over =
                            err.should_fallback() || err.category == ErrorCategory::AuthRevoked;
                        if !request_can_fall_over || attempts_left == 0 {
                            return Err(err);
                        }
                        last_err = Some(err);
                    }
                }
            }
            if attempts_left == 0 {
                break;
            }
        }

        Err(last_err.unwrap_or_else(|| {
            GatewayError::not_found(format!("no credential available for {}", request.model))
        }))
    }

    /// Poll until some credential for (provider, model) becomes pickable or
    /// the wait budget runs out. Client cancellation lands here as a dropped
    /// future.
    async fn wait_for_available_auth(
        &self,
        provider_name: &str,
        model: &str,
        max_wait: Duration,
    ) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.cooldown_poll).await;
            let now = OffsetDateTime::now_utc();
            let candidates = self.registry.list_provider(provider_name).await;
            let ready = candidates.iter().any(|auth| {
                auth.pickable_for(model, now, self.quota.cooldown_until(&auth.id))
                    .is_ok()
            });
            if ready {
                return true;
            }
        }
    }

    async fn run_attempt(
        &self,
        ctx: &RequestContext,
        provider_name: &str,
        executor: &Arc<dyn ProviderExecutor>,
        auth: &Auth,
        request: &ChatRequest,
    ) -> Result<ChatOutcome, GatewayError> {
        let started = Instant::now();
        let ticket = self.quota.begin(&auth.id, provider_name);

        let upstream_request = match executor.build_chat(auth, request) {
            Ok(built) => built,
            Err(err) => {
                ticket.finish(0, true);
                return Err(err);
            }
        };

        let response = match self.client.send(upstream_request).await {
            Ok(response) => response,
            Err(failure) => {
                let err = executor.classify(&failure);
                self.observe_failure(ctx, provider_name, auth, request, &failure, &err, ticket)
                    .await;
                return Err(err);
            }
        };

        match response.body {
            UpstreamBody::Bytes(bytes) => {
                let parsed = match executor.parse_response(&bytes) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        ticket.finish(0, true);
                        self.registry
                            .mark_result(RequestResult {
                                auth_id: auth.id.clone(),
                                provider: provider_name.to_string(),
                                model: request.model.clone(),
                                success: false,
                                status: err.status,
                                message: err.message.clone(),
                                retry_after: err.retry_after,
                            })
                            .await;
                        return Err(err);
                    }
                };
                let usage = parsed.usage;
                ticket.finish(u64::from(usage.total()), false);
                self.registry
                    .mark_result(RequestResult::ok(
                        auth.id.clone(),
                        provider_name.to_string(),
                        request.model.clone(),
                    ))
                    .await;
                self.emit_usage(provider_name, auth, request, usage, true, started)
                    .await;
                info!(
                    trace_id = %ctx.trace_id,
                    provider = %provider_name,
                    auth_id = %auth.id,
                    model = %request.model,
                    input_tokens = usage.input,
                    output_tokens = usage.output,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request completed"
                );
                Ok(ChatOutcome::Unary(parsed))
            }
            UpstreamBody::Stream(body) => {
                self.start_stream(ctx, provider_name, executor, auth, request, body, ticket, started)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_stream(
        &self,
        ctx: &RequestContext,
        provider_name: &str,
        executor: &Arc<dyn ProviderExecutor>,
        auth: &Auth,
        request: &ChatRequest,
        body: lmux_provider_core::ByteStream,
        ticket: RequestTicket,
        started: Instant,
    ) -> Result<ChatOutcome, GatewayError> {
        let (tx, mut rx) = mpsc::channel::<Result<StreamDelta, GatewayError>>(32);

        let pump = StreamPump {
            registry: self.registry.clone(),
            quota: self.quota.clone(),
            events: self.events.clone(),
            decoder: executor.stream_decoder(),
            provider: provider_name.to_string(),
            auth_id: auth.id.clone(),
            auth_label: auth.label.clone(),
            model: request.model.clone(),
            trace_id: ctx.trace_id.clone(),
            started,
        };
        tokio::spawn(pump.run(body, ticket, tx));

        // Hold the stream until it proves alive: an error before the first
        // delta is an attempt failure and still eligible for fallback.
        match rx.recv().await {
            Some(Ok(first)) => Ok(ChatOutcome::Stream(DeltaStream {
                first: Some(first),
                rx,
            })),
            Some(Err(err)) => Err(err),
            None => Err(GatewayError::new(
                ErrorCategory::Transient,
                "upstream stream closed before any event",
            )),
        }
    }

    async fn observe_failure(
        &self,
        ctx: &RequestContext,
        provider_name: &str,
        auth: &Auth,
        request: &ChatRequest,
        failure: &UpstreamFailure,
        err: &GatewayError,
        ticket: RequestTicket,
    ) {
        ticket.finish(0, true);
        warn!(
            trace_id = %ctx.trace_id,
            provider = %provider_name,
            auth_id = %auth.id,
            model = %request.model,
            category = ?err.category,
            status = ?failure.status(),
            "upstream attempt failed"
        );
        if err.category == ErrorCategory::QuotaError {
            self.quota
                .record_quota_hit(&auth.id, provider_name, &request.model, err.retry_after);
            if let Some(until) = self.quota.cooldown_until(&auth.id) {
                self.events
                    .emit(GatewayEvent::Operational(OperationalEvent::CooldownStart {
                        auth_id: auth.id.clone(),
                        provider: provider_name.to_string(),
                        until,
                    }))
                    .await;
            }
        }
        if err.category == ErrorCategory::QuotaError
            && self.config.switch_project
            && is_gemini_family(provider_name)
        {
            let _ = self
                .registry
                .update(&auth.id, |entry| {
                    let backup = entry.attributes.get("backup_project_id").cloned();
                    if let Some(backup) = backup {
                        let current = entry.metadata.project_id.take().unwrap_or_default();
                        entry.metadata.project_id = Some(backup);
                        entry
                            .attributes
                            .insert("backup_project_id".to_string(), current);
                    }
                })
                .await;
        }
        if err.category == ErrorCategory::AuthRevoked {
            self.events
                .emit(GatewayEvent::Operational(OperationalEvent::AuthDisabled {
                    auth_id: auth.id.clone(),
                    reason: err.message.clone(),
                }))
                .await;
        }
        self.registry
            .mark_result(RequestResult {
                auth_id: auth.id.clone(),
                provider: provider_name.to_string(),
                model: request.model.clone(),
                success: false,
                status: err.status,
                message: err.message.clone(),
                retry_after: err.retry_after,
            })
            .await;
    }

    async fn emit_usage(
        &self,
        provider_name: &str,
        auth: &Auth,
        request: &ChatRequest,
        usage: TokenUsage,
        success: bool,
        started: Instant,
    ) {
        self.events
            .emit(GatewayEvent::Usage(UsageEvent {
                at: OffsetDateTime::now_utc(),
                auth_id: auth.id.clone(),
                provider: provider_name.to_string(),
                model: request.model.clone(),
                usage,
                success,
                duration_ms: started.elapsed().as_millis() as u64,
            }))
            .await;
    }
}

/// Owns one upstream stream end-to-end: framing, decoding, usage
/// accounting, result marking, and the ticket.
struct StreamPump {
    registry: Arc<AuthRegistry>,
    quota: Arc<QuotaManager>,
    events: EventHub,
    decoder: Box<dyn StreamDecoder>,
    provider: String,
    auth_id: String,
    auth_label: String,
    model: String,
    trace_id: String,
    started: Instant,
}

impl StreamPump {
    async fn run(
        mut self,
        mut body: lmux_provider_core::ByteStream,
        ticket: RequestTicket,
        tx: mpsc::Sender<Result<StreamDelta, GatewayError>>,
    ) {
        let mut sniffer = FrameSniffer::new();
        let mut usage = UsageAccumulator::new();
        let mut delivered = false;
        let mut failure: Option<GatewayError> = None;

        'pump: while let Some(chunk) = body.recv().await {
            for frame in sniffer.push(&chunk) {
                match self.decoder.decode(&frame) {
                    Ok(deltas) => {
                        for delta in deltas {
                            usage.push(&delta);
                            if tx.send(Ok(delta)).await.is_err() {
                                // Client went away; tear down upstream now.
                                debug!(
                                    trace_id = %self.trace_id,
                                    auth = %self.auth_label,
                                    "client disconnected mid-stream"
                                );
                                failure = Some(GatewayError::canceled());
                                break 'pump;
                            }
                            delivered = true;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err.clone())).await;
                        failure = Some(err);
                        break 'pump;
                    }
                }
            }
        }

        if failure.is_none() {
            match self.decoder.finish() {
                Ok(deltas) => {
                    for delta in deltas {
                        usage.push(&delta);
                        if tx.send(Ok(delta)).await.is_err() {
                            failure = Some(GatewayError::canceled());
                            break;
                        }
                        delivered = true;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err.clone())).await;
                    failure = Some(err);
                }
            }
        }

        let usage = usage.finalize().unwrap_or_default();
        let canceled = matches!(
            failure.as_ref().map(|err| err.category),
            Some(ErrorCategory::ClientCanceled)
        );
        // Tokens already consumed count even on failure; cancellation is not
        // held against the credential.
        ticket.finish(u64::from(usage.total()), failure.is_some() && !canceled);

        match &failure {
            None => {
                self.registry
                    .mark_result(RequestResult::ok(
                        self.auth_id.clone(),
                        self.provider.clone(),
                        self.model.clone(),
                    ))
                    .await;
            }
            Some(err) if !canceled => {
                if err.category == ErrorCategory::QuotaError {
                    self.quota.record_quota_hit(
                        &self.auth_id,
                        &self.provider,
                        &self.model,
                        err.retry_after,
                    );
                }
                self.registry
                    .mark_result(RequestResult {
                        auth_id: self.auth_id.clone(),
                        provider: self.provider.clone(),
                        model: self.model.clone(),
                        success: false,
                        status: err.status,
                        message: err.message.clone(),
                        retry_after: err.retry_after,
                    })
                    .await;
            }
            Some(_) => {}
        }

        let success = failure.is_none() && delivered;
        self.events
            .emit(GatewayEvent::Usage(UsageEvent {
                at: OffsetDateTime::now_utc(),
                auth_id: self.auth_id.clone(),
                provider: self.provider.clone(),
                model: self.model.clone(),
                usage,
                success,
                duration_ms: self.started.elapsed().as_millis() as u64,
            }))
            .await;
    }
}

fn is_gemini_family(provider_name: &str) -> bool {
    matches!(
        provider_name,
        lmux_common::provider::GEMINI | lmux_common::provider::ANTIGRAVITY
    )
}

fn dedup_keep_order(names: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    names
        .into_iter()
        .filter(|name| seen.insert(name.clone()))
        .collect()
}
