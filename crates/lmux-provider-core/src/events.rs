use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{RwLock, broadcast};

use lmux_transform::TokenUsage;

use crate::auth::AuthId;

/// One record per completed request; the usage-persistence collaborator
/// subscribes to these and owns its own schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub auth_id: AuthId,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    pub success: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationalEvent {
    CooldownStart {
        auth_id: AuthId,
        provider: String,
        #[serde(with = "time::serde::rfc3339")]
        until: OffsetDateTime,
    },
    CooldownEnd {
        auth_id: AuthId,
    },
    AuthDisabled {
        auth_id: AuthId,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GatewayEvent {
    Usage(UsageEvent),
    Operational(OperationalEvent),
}

pub trait EventSink: Send + Sync {
    fn write<'a>(&'a self, event: &'a GatewayEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Broadcast fan-out plus registered sinks. Slow sinks run detached so they
/// can never hold up a request.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<GatewayEvent>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            inner: Arc::new(Inner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.inner.sinks.write().await.push(sink);
    }

    pub async fn emit(&self, event: GatewayEvent) {
        let _ = self.inner.tx.send(event.clone());
        let sinks = self.inner.sinks.read().await.clone();
        for sink in sinks {
            let event = event.clone();
            tokio::spawn(async move {
                sink.write(&event).await;
            });
        }
    }
}
