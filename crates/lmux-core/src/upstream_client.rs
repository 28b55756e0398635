use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use wreq::{Client, Method, Proxy};

use lmux_provider_core::{
    Headers, HttpMethod, TransportErrorKind, UpstreamBody, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse,
};

/// Transport seam between the manager and the network; tests swap in fakes.
pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    /// Whole-request budget; streams run long, so this is generous.
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub max_response_size: usize,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(86_400),
            stream_idle_timeout: Duration::from_secs(300),
            max_response_size: 100 * 1024 * 1024,
        }
    }
}

pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Arc<Self>, wreq::Error> {
        let client = Self {
            config,
            clients: Mutex::new(HashMap::new()),
        };
        Ok(Arc::new(client))
    }

    fn client(&self) -> Result<Client, UpstreamFailure> {
        let proxy = self
            .config
            .proxy
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        let mut guard = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = guard.get(&proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, proxy.as_deref()).map_err(map_transport_error)?;
        guard.insert(proxy, client.clone());
        Ok(client)
    }
}

fn build_client(config: &UpstreamClientConfig, proxy: Option<&str>) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .read_timeout(config.stream_idle_timeout);
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    builder.build()
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            let client = self.client()?;
            let method = match req.method {
                HttpMethod::Get => Method::GET,
                HttpMethod::Post => Method::POST,
            };
            let mut builder = client.request(method, &req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = req.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(map_transport_error)?;
            let status = response.status().as_u16();
            let headers = headers_from_wreq(response.headers());

            let success = (200..300).contains(&status);
            if !success || !req.is_stream {
                let body = response.bytes().await.map_err(map_transport_error)?;
                if !success {
                    return Err(UpstreamFailure::Http {
                        status,
                        headers,
                        body,
                    });
                }
                if body.len() > self.config.max_response_size {
                    return Err(UpstreamFailure::Transport {
                        kind: TransportErrorKind::Other,
                        message: format!(
                            "response of {} bytes exceeds the configured cap",
                            body.len()
                        ),
                    });
                }
                return Ok(UpstreamHttpResponse {
                    status,
                    headers,
                    body: UpstreamBody::Bytes(body),
                });
            }

            let idle = self.config.stream_idle_timeout;
            let cap = self.config.max_response_size;
            let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
            tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                let mut total = 0usize;
                loop {
                    let next = tokio::time::timeout(idle, stream.next()).await;
                    let Ok(item) = next else { break };
                    let Some(item) = item else { break };
                    let Ok(chunk) = item else { break };
                    total += chunk.len();
                    if total > cap {
                        break;
                    }
                    if tx.send(chunk).await.is_err() {
                        // Consumer hung up; drop the upstream connection.
                        break;
                    }
                }
            });

            Ok(UpstreamHttpResponse {
                status,
                headers,
                body: UpstreamBody::Stream(rx),
            })
        })
    }
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(text) = value.to_str() {
            out.push((name.as_str().to_string(), text.to_string()));
        }
    }
    out
}

fn map_transport_error(err: wreq::Error) -> UpstreamFailure {
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    let kind = if err.is_timeout() {
        if lowered.contains("read") || lowered.contains("idle") {
            TransportErrorKind::ReadTimeout
        } else {
            TransportErrorKind::Timeout
        }
    } else if err.is_connect() {
        if lowered.contains("dns") || lowered.contains("resolve") {
            TransportErrorKind::Dns
        } else if lowered.contains("tls") || lowered.contains("ssl") {
            TransportErrorKind::Tls
        } else {
            TransportErrorKind::Connect
        }
    } else if lowered.contains("tls") || lowered.contains("ssl") {
        TransportErrorKind::Tls
    } else {
        TransportErrorKind::Other
    };
    UpstreamFailure::Transport { kind, message }
}
