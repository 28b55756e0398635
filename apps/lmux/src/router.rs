//! Inbound HTTP surface: OpenAI, Anthropic, Gemini, and Ollama wire
//! compatibility on one listener. Handlers normalize to IR, call the
//! manager, and encode the outcome back in the caller's format.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use axum::routing::{get, post};
use bytes::Bytes;
use tracing::info;

use lmux_common::{ErrorCategory, GatewayError, fnv32a};
use lmux_core::bootstrap::CoreState;
use lmux_core::{ChatOutcome, DeltaStream, RequestContext};
use lmux_protocol::frame;
use lmux_protocol::{claude as claude_wire, gemini as gemini_wire, ollama as ollama_wire, openai as openai_wire};
use lmux_transform::{ChatRequest, StreamDelta, alias, claude, gemini, ollama, openai};

pub fn router(state: Arc<CoreState>) -> Router {
    let limit = state.config.load().max_request_size;
    Router::new()
        .route("/v1/chat/completions", post(openai_chat))
        .route("/v1/completions", post(openai_completions))
        .route("/v1/models", get(openai_models))
        .route("/v1/messages", post(claude_messages))
        .route("/v1/messages/count_tokens", post(claude_count_tokens))
        .route("/v1beta/models", get(gemini_models))
        .route("/v1beta/models/{model_action}", post(gemini_action).get(gemini_model_get))
        .route("/api/chat", post(ollama_chat))
        .route("/api/generate", post(ollama_generate))
        .route("/api/tags", get(ollama_tags))
        .route("/api/show", post(ollama_show))
        .route("/api/version", get(ollama_version))
        .layer(DefaultBodyLimit::max(limit))
        .with_state(state)
}

// ---- client auth ----

/// Validate the presented key and derive the sticky fingerprint from it.
fn authenticate(state: &CoreState, headers: &HeaderMap) -> Result<String, Response> {
    let config = state.config.load();
    let presented = bearer_token(headers)
        .or_else(|| header_str(headers, "x-api-key"))
        .or_else(|| header_str(headers, "x-goog-api-key"));

    if config.disable_auth || config.api_keys.is_empty() {
        let fingerprint = presented
            .map(|key| format!("key-{:08x}", fnv32a(key.as_bytes())))
            .unwrap_or_else(|| "anonymous".to_string());
        return Ok(fingerprint);
    }

    match presented {
        Some(key) if config.api_keys.iter().any(|candidate| candidate == &key) => {
            Ok(format!("key-{:08x}", fnv32a(key.as_bytes())))
        }
        _ => Err(plain_error(StatusCode::UNAUTHORIZED, "invalid api key")),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|value| value.strip_prefix("Bearer ").map(str::to_string))
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn request_ctx(fingerprint: String) -> RequestContext {
    RequestContext {
        trace_id: uuid::Uuid::new_v4().to_string(),
        fingerprint: Some(fingerprint),
    }
}

// ---- error encoding ----

fn plain_error(status: StatusCode, message: &str) -> Response {
    json_response(
        status,
        &serde_json::json!({"error": {"message": message, "type": "invalid_request_error"}}),
    )
}

fn status_for(err: &GatewayError) -> StatusCode {
    let code = err.status.unwrap_or(match err.category {
        ErrorCategory::UserError => 400,
        ErrorCategory::NotFound => 404,
        ErrorCategory::QuotaError => 429,
        ErrorCategory::ClientCanceled => 499,
        ErrorCategory::AuthError | ErrorCategory::AuthRevoked => 503,
        _ => 502,
    });
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn error_response(err: &GatewayError) -> Response {
    let status = status_for(err);
    let body = serde_json::json!({
        "error": {
            "message": err.message,
            "type": format!("{:?}", err.category),
        }
    });
    let mut response = json_response(status, &body);
    if let Some(retry_after) = err.retry_after
        && let Ok(value) = retry_after.as_secs().to_string().parse()
    {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

// ---- streaming plumbing ----

type EncodeFn = Box<dyn FnMut(&StreamDelta) -> Vec<Bytes> + Send>;
type EncodeErrFn = Box<dyn Fn(&GatewayError) -> Bytes + Send>;

struct StreamState {
    deltas: DeltaStream,
    encode: EncodeFn,
    encode_err: EncodeErrFn,
    terminator: Option<Bytes>,
    buffer: VecDeque<Bytes>,
    finished: bool,
}

fn stream_response(content_type: &'static str, state: StreamState) -> Response {
    let body_stream = futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.buffer.pop_front() {
                return Some((Ok::<_, Infallible>(chunk), state));
            }
            if state.finished {
                return None;
            }
            match state.deltas.recv().await {
                Some(Ok(delta)) => {
                    let frames = (state.encode)(&delta);
                    state.buffer.extend(frames);
                }
                Some(Err(err)) => {
                    // Bytes already went out; end with a synthetic error
                    // event in the client's own format.
                    state.buffer.push_back((state.encode_err)(&err));
                    if let Some(done) = state.terminator.take() {
                        state.buffer.push_back(done);
                    }
                    state.finished = true;
                }
                None => {
                    if let Some(done) = state.terminator.take() {
                        state.buffer.push_back(done);
                    }
                    state.finished = true;
                }
            }
        }
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
        .unwrap_or_default()
}

// ---- OpenAI surface ----

async fn openai_chat(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let fingerprint = match authenticate(&state, &headers) {
        Ok(fingerprint) => fingerprint,
        Err(response) => return response,
    };
    let parsed: openai_wire::ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => return plain_error(StatusCode::BAD_REQUEST, &format!("invalid json: {err}")),
    };
    let ir = openai::request_to_ir(parsed);
    let streaming = ir.stream;

    match state.manager.execute(request_ctx(fingerprint), ir).await {
        Err(err) => error_response(&err),
        Ok(ChatOutcome::Unary(resp)) => {
            let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
            json_response(
                StatusCode::OK,
                &openai::response_from_ir(&resp, &id, now_unix()),
            )
        }
        Ok(ChatOutcome::Stream(deltas)) if streaming => {
            let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
            let mut encoder = openai::ChunkEncoder::new(id, now_unix());
            stream_response(
                "text/event-stream",
                StreamState {
                    deltas,
                    encode: Box::new(move |delta| {
                        encoder
                            .encode(delta)
                            .and_then(|chunk| frame::sse_data(&chunk))
                            .into_iter()
                            .collect()
                    }),
                    encode_err: Box::new(|err| {
                        frame::sse_data(&serde_json::json!({
                            "error": {"message": err.message, "type": format!("{:?}", err.category)}
                        }))
                        .unwrap_or_default()
                    }),
                    terminator: Some(frame::sse_done()),
                    buffer: VecDeque::new(),
                    finished: false,
                },
            )
        }
        Ok(ChatOutcome::Stream(deltas)) => collect_then_json(deltas, |resp| {
            let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
            json_response(
                StatusCode::OK,
                &openai::response_from_ir(&resp, &id, now_unix()),
            )
        })
        .await,
    }
}

async fn openai_completions(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let fingerprint = match authenticate(&state, &headers) {
        Ok(fingerprint) => fingerprint,
        Err(response) => return response,
    };
    let parsed: openai_wire::CompletionRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => return plain_error(StatusCode::BAD_REQUEST, &format!("invalid json: {err}")),
    };
    let ir = openai::completion_request_to_ir(parsed);

    match state.manager.execute(request_ctx(fingerprint), ir).await {
        Err(err) => error_response(&err),
        Ok(ChatOutcome::Unary(resp)) => {
            let id = format!("cmpl-{}", uuid::Uuid::new_v4().simple());
            json_response(
                StatusCode::OK,
                &openai::completion_response_from_ir(&resp, &id, now_unix()),
            )
        }
        Ok(ChatOutcome::Stream(deltas)) => collect_then_json(deltas, |resp| {
            let id = format!("cmpl-{}", uuid::Uuid::new_v4().simple());
            json_response(
                StatusCode::OK,
                &openai::completion_response_from_ir(&resp, &id, now_unix()),
            )
        })
        .await,
    }
}

async fn openai_models(State(state): State<Arc<CoreState>>, headers: HeaderMap) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    let created = now_unix();
    let excluded = state.config.load().oauth_excluded_models.clone();
    let data = alias::canonical_models()
        .into_iter()
        .filter(|id| !excluded.iter().any(|e| e == id))
        .map(|id| openai_wire::ModelInfo {
            id: id.to_string(),
            object: "model".to_string(),
            created,
            owned_by: "lmux".to_string(),
        })
        .collect();
    json_response(
        StatusCode::OK,
        &openai_wire::ModelList {
            object: "list".to_string(),
            data,
        },
    )
}

// ---- Anthropic surface ----

async fn claude_messages(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let fingerprint = match authenticate(&state, &headers) {
        Ok(fingerprint) => fingerprint,
        Err(response) => return response,
    };
    let parsed: claude_wire::MessagesRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => return plain_error(StatusCode::BAD_REQUEST, &format!("invalid json: {err}")),
    };
    let ir = claude::request_to_ir(parsed);
    let streaming = ir.stream;

    match state.manager.execute(request_ctx(fingerprint), ir).await {
        Err(err) => claude_error_response(&err),
        Ok(ChatOutcome::Unary(resp)) => {
            let id = format!("msg_{}", uuid::Uuid::new_v4().simple());
            json_response(StatusCode::OK, &claude::response_from_ir(&resp, &id))
        }
        Ok(ChatOutcome::Stream(deltas)) if streaming => {
            let id = format!("msg_{}", uuid::Uuid::new_v4().simple());
            let mut encoder = claude::StreamEncoder::new(id);
            stream_response(
                "text/event-stream",
                StreamState {
                    deltas,
                    encode: Box::new(move |delta| {
                        encoder
                            .encode(delta)
                            .iter()
                            .filter_map(|event| frame::sse_named(event.event_name(), event))
                            .collect()
                    }),
                    encode_err: Box::new(|err| {
                        let event = claude_wire::StreamEvent::Error {
                            error: claude_wire::ErrorBody {
                                kind: "api_error".to_string(),
                                message: err.message.clone(),
                            },
                        };
                        frame::sse_named(event.event_name(), &event).unwrap_or_default()
                    }),
                    terminator: None,
                    buffer: VecDeque::new(),
                    finished: false,
                },
            )
        }
        Ok(ChatOutcome::Stream(deltas)) => collect_then_json(deltas, |resp| {
            let id = format!("msg_{}", uuid::Uuid::new_v4().simple());
            json_response(StatusCode::OK, &claude::response_from_ir(&resp, &id))
        })
        .await,
    }
}

fn claude_error_response(err: &GatewayError) -> Response {
    let status = status_for(err);
    let kind = match err.category {
        ErrorCategory::UserError => "invalid_request_error",
        ErrorCategory::QuotaError => "rate_limit_error",
        ErrorCategory::NotFound => "not_found_error",
        ErrorCategory::AuthError | ErrorCategory::AuthRevoked => "authentication_error",
        _ => "api_error",
    };
    let mut response = json_response(
        status,
        &claude_wire::ErrorResponse {
            kind: "error".to_string(),
            error: claude_wire::ErrorBody {
                kind: kind.to_string(),
                message: err.message.clone(),
            },
        },
    );
    if let Some(retry_after) = err.retry_after
        && let Ok(value) = retry_after.as_secs().to_string().parse()
    {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

async fn claude_count_tokens(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    let parsed: claude_wire::CountTokensRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => return plain_error(StatusCode::BAD_REQUEST, &format!("invalid json: {err}")),
    };
    let ir = claude::count_tokens_request_to_ir(parsed);
    json_response(
        StatusCode::OK,
        &claude_wire::CountTokensResponse {
            input_tokens: estimate_tokens(&ir),
        },
    )
}

// ---- Gemini surface ----

async fn gemini_models(State(state): State<Arc<CoreState>>, headers: HeaderMap) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    let excluded = state.config.load().oauth_excluded_models.clone();
    let models = alias::canonical_models()
        .into_iter()
        .filter(|id| !excluded.iter().any(|e| e == id))
        .map(|id| gemini_wire::Model {
            name: format!("models/{id}"),
            display_name: None,
            description: None,
            supported_generation_methods: vec![
                "generateContent".to_string(),
                "streamGenerateContent".to_string(),
                "countTokens".to_string(),
            ],
        })
        .collect();
    json_response(StatusCode::OK, &gemini_wire::ModelList { models })
}

async fn gemini_model_get(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    Path(model): Path<String>,
) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    json_response(
        StatusCode::OK,
        &gemini_wire::Model {
            name: format!("models/{model}"),
            display_name: None,
            description: None,
            supported_generation_methods: vec![
                "generateContent".to_string(),
                "streamGenerateContent".to_string(),
                "countTokens".to_string(),
            ],
        },
    )
}

async fn gemini_action(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    Path(model_action): Path<String>,
    body: Bytes,
) -> Response {
    let fingerprint = match authenticate(&state, &headers) {
        Ok(fingerprint) => fingerprint,
        Err(response) => return response,
    };
    let Some((model, action)) = model_action.split_once(':') else {
        return plain_error(StatusCode::NOT_FOUND, "expected model:action");
    };

    if action == "countTokens" {
        let parsed: gemini_wire::CountTokensRequest = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(err) => {
                return plain_error(StatusCode::BAD_REQUEST, &format!("invalid json: {err}"));
            }
        };
        let ir = gemini::request_to_ir(
            model,
            gemini_wire::GenerateContentRequest {
                contents: parsed.contents,
                ..Default::default()
            },
        );
        return json_response(
            StatusCode::OK,
            &gemini::count_tokens_response_from_ir(estimate_tokens(&ir)),
        );
    }

    let streaming = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => return plain_error(StatusCode::NOT_FOUND, "unknown action"),
    };
    let parsed: gemini_wire::GenerateContentRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => return plain_error(StatusCode::BAD_REQUEST, &format!("invalid json: {err}")),
    };
    let mut ir = gemini::request_to_ir(model, parsed);
    ir.stream = streaming;

    match state.manager.execute(request_ctx(fingerprint), ir).await {
        Err(err) => error_response(&err),
        Ok(ChatOutcome::Unary(resp)) => {
            json_response(StatusCode::OK, &gemini::response_from_ir(&resp))
        }
        Ok(ChatOutcome::Stream(deltas)) if streaming => {
            let mut encoder = gemini::StreamEncoder::new();
            stream_response(
                "text/event-stream",
                StreamState {
                    deltas,
                    encode: Box::new(move |delta| {
                        encoder
                            .encode(delta)
                            .and_then(|chunk| frame::sse_data(&chunk))
                            .into_iter()
                            .collect()
                    }),
                    encode_err: Box::new(|err| {
                        frame::sse_data(&serde_json::json!({
                            "error": {"code": 502, "message": err.message, "status": "UNAVAILABLE"}
                        }))
                        .unwrap_or_default()
                    }),
                    terminator: None,
                    buffer: VecDeque::new(),
                    finished: false,
                },
            )
        }
        Ok(ChatOutcome::Stream(deltas)) => {
            collect_then_json(deltas, |resp| {
                json_response(StatusCode::OK, &gemini::response_from_ir(&resp))
            })
            .await
        }
    }
}

// ---- Ollama surface ----

async fn ollama_chat(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let fingerprint = match authenticate(&state, &headers) {
        Ok(fingerprint) => fingerprint,
        Err(response) => return response,
    };
    let parsed: ollama_wire::ChatRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => return plain_error(StatusCode::BAD_REQUEST, &format!("invalid json: {err}")),
    };
    let ir = ollama::chat_request_to_ir(parsed);
    let streaming = ir.stream;

    match state.manager.execute(request_ctx(fingerprint), ir).await {
        Err(err) => error_response(&err),
        Ok(ChatOutcome::Unary(resp)) => {
            json_response(StatusCode::OK, &ollama::chat_response_from_ir(&resp, &now_rfc3339()))
        }
        Ok(ChatOutcome::Stream(deltas)) if streaming => {
            let mut encoder = ollama::ChatStreamEncoder::new(now_rfc3339());
            stream_response(
                "application/x-ndjson",
                StreamState {
                    deltas,
                    encode: Box::new(move |delta| {
                        encoder
                            .encode(delta)
                            .and_then(|chunk| frame::ndjson_line(&chunk))
                            .into_iter()
                            .collect()
                    }),
                    encode_err: Box::new(|err| {
                        frame::ndjson_line(&serde_json::json!({"error": err.message}))
                            .unwrap_or_default()
                    }),
                    terminator: None,
                    buffer: VecDeque::new(),
                    finished: false,
                },
            )
        }
        Ok(ChatOutcome::Stream(deltas)) => collect_then_json(deltas, |resp| {
            json_response(StatusCode::OK, &ollama::chat_response_from_ir(&resp, &now_rfc3339()))
        })
        .await,
    }
}

async fn ollama_generate(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let fingerprint = match authenticate(&state, &headers) {
        Ok(fingerprint) => fingerprint,
        Err(response) => return response,
    };
    let parsed: ollama_wire::GenerateRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => return plain_error(StatusCode::BAD_REQUEST, &format!("invalid json: {err}")),
    };
    let ir = ollama::generate_request_to_ir(parsed);
    let streaming = ir.stream;
    let model = ir.model.clone();

    match state.manager.execute(request_ctx(fingerprint), ir).await {
        Err(err) => error_response(&err),
        Ok(ChatOutcome::Unary(resp)) => json_response(
            StatusCode::OK,
            &ollama::generate_response_from_ir(&resp, &now_rfc3339()),
        ),
        Ok(ChatOutcome::Stream(deltas)) if streaming => {
            let created_at = now_rfc3339();
            stream_response(
                "application/x-ndjson",
                StreamState {
                    deltas,
                    encode: Box::new(move |delta| match delta {
                        StreamDelta::Text { text, .. } => {
                            frame::ndjson_line(&ollama_wire::GenerateResponse {
                                model: model.clone(),
                                created_at: created_at.clone(),
                                response: text.clone(),
                                done: false,
                                done_reason: None,
                                thinking: None,
                                prompt_eval_count: None,
                                eval_count: None,
                            })
                            .into_iter()
                            .collect()
                        }
                        StreamDelta::Finish { stop_reason, usage } => {
                            frame::ndjson_line(&ollama_wire::GenerateResponse {
                                model: model.clone(),
                                created_at: created_at.clone(),
                                response: String::new(),
                                done: true,
                                done_reason: Some(ollama::done_reason_from_ir(stop_reason.as_ref())),
                                thinking: None,
                                prompt_eval_count: usage.map(|u| u.input),
                                eval_count: usage.map(|u| u.output),
                            })
                            .into_iter()
                            .collect()
                        }
                        _ => Vec::new(),
                    }),
                    encode_err: Box::new(|err| {
                        frame::ndjson_line(&serde_json::json!({"error": err.message}))
                            .unwrap_or_default()
                    }),
                    terminator: None,
                    buffer: VecDeque::new(),
                    finished: false,
                },
            )
        }
        Ok(ChatOutcome::Stream(deltas)) => collect_then_json(deltas, |resp| {
            json_response(
                StatusCode::OK,
                &ollama::generate_response_from_ir(&resp, &now_rfc3339()),
            )
        })
        .await,
    }
}

async fn ollama_tags(State(state): State<Arc<CoreState>>, headers: HeaderMap) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    let modified_at = now_rfc3339();
    let excluded = state.config.load().oauth_excluded_models.clone();
    let models = alias::canonical_models()
        .into_iter()
        .filter(|id| !excluded.iter().any(|e| e == id))
        .map(|id| ollama_wire::TagModel {
            name: format!("{id}:latest"),
            model: format!("{id}:latest"),
            modified_at: modified_at.clone(),
            size: 0,
            digest: format!("{:08x}", fnv32a(id.as_bytes())),
            details: None,
        })
        .collect();
    json_response(StatusCode::OK, &ollama_wire::TagsResponse { models })
}

async fn ollama_show(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    let parsed: ollama_wire::ShowRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => return plain_error(StatusCode::BAD_REQUEST, &format!("invalid json: {err}")),
    };
    info!(model = %parsed.model, "model show requested");
    json_response(
        StatusCode::OK,
        &ollama_wire::ShowResponse {
            details: Some(ollama_wire::ModelDetails::default()),
            model_info: None,
            capabilities: vec!["completion".to_string(), "tools".to_string()],
        },
    )
}

async fn ollama_version(State(state): State<Arc<CoreState>>, headers: HeaderMap) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    json_response(
        StatusCode::OK,
        &ollama_wire::VersionResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    )
}

// ---- shared helpers ----

/// Drain a stream into a unary response for clients that did not ask for
/// streaming but got one from upstream.
async fn collect_then_json<F>(mut deltas: DeltaStream, respond: F) -> Response
where
    F: FnOnce(lmux_transform::ChatResponse) -> Response,
{
    let mut response = lmux_transform::ChatResponse::default();
    let mut text = String::new();
    let mut thinking = String::new();
    let mut tools: std::collections::BTreeMap<u32, (String, String, String)> = Default::default();
    while let Some(delta) = deltas.recv().await {
        match delta {
            Ok(StreamDelta::Start { model }) => response.model = model,
            Ok(StreamDelta::Text { text: chunk, .. }) => text.push_str(&chunk),
            Ok(StreamDelta::Thinking { text: chunk, .. }) => thinking.push_str(&chunk),
            Ok(StreamDelta::BlockStart { index, block }) => {
                if let lmux_transform::ContentBlock::ToolUse { id, name, .. } = block {
                    tools.insert(index, (id, name, String::new()));
                }
            }
            Ok(StreamDelta::ToolInput {
                index,
                partial_json,
            }) => {
                if let Some((_, _, buffer)) = tools.get_mut(&index) {
                    buffer.push_str(&partial_json);
                }
            }
            Ok(StreamDelta::Finish { stop_reason, usage }) => {
                response.stop_reason = stop_reason;
                if let Some(usage) = usage {
                    response.usage = usage;
                }
            }
            Ok(_) => {}
            Err(err) => return error_response(&err),
        }
    }
    for (_, (id, name, buffer)) in tools {
        let input = serde_json::from_str(&buffer)
            .unwrap_or(serde_json::Value::Object(Default::default()));
        response
            .blocks
            .push(lmux_transform::ContentBlock::ToolUse { id, name, input });
    }
    if !thinking.is_empty() {
        response.blocks.insert(
            0,
            lmux_transform::ContentBlock::Thinking {
                text: thinking,
                signature: None,
            },
        );
    }
    if !text.is_empty() {
        response
            .blocks
            .push(lmux_transform::ContentBlock::Text { text });
    }
    respond(response)
}

/// Local token estimate for count-tokens endpoints: no upstream charges a
/// subscription request for counting, so neither do we.
fn estimate_tokens(request: &ChatRequest) -> u32 {
    let mut chars = 0usize;
    for message in &request.messages {
        for block in &message.blocks {
            match block {
                lmux_transform::ContentBlock::Text { text }
                | lmux_transform::ContentBlock::Thinking { text, .. } => chars += text.len(),
                lmux_transform::ContentBlock::ToolUse { input, .. } => {
                    chars += input.to_string().len()
                }
                lmux_transform::ContentBlock::ToolResult { content, .. } => {
                    chars += content.to_string().len()
                }
                lmux_transform::ContentBlock::Image { data, .. } => chars += data.len() / 10,
            }
        }
    }
    for tool in &request.tools {
        chars += tool.name.len();
        if let Some(schema) = &tool.schema {
            chars += schema.to_string().len();
        }
    }
    // Rough 4-chars-per-token plus a small per-message envelope.
    (chars / 4 + request.messages.len() * 4).max(1) as u32
}
