//! Built-in usage persistence: one JSON line per completed request. External
//! collectors can subscribe to the hub instead; this sink is what ships.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use tokio::io::AsyncWriteExt;
use tracing::warn;

use lmux_provider_core::{EventSink, GatewayEvent};

pub struct JsonlUsageSink {
    path: PathBuf,
}

impl JsonlUsageSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl EventSink for JsonlUsageSink {
    fn write<'a>(
        &'a self,
        event: &'a GatewayEvent,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let GatewayEvent::Usage(usage) = event else {
                return;
            };
            let Ok(mut line) = serde_json::to_vec(usage) else {
                return;
            };
            line.push(b'\n');
            let open = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await;
            match open {
                Ok(mut file) => {
                    if let Err(err) = file.write_all(&line).await {
                        warn!(path = %self.path.display(), %err, "usage record write failed");
                    }
                }
                Err(err) => {
                    warn!(path = %self.path.display(), %err, "cannot open usage log");
                }
            }
        })
    }
}
