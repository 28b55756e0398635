use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use lmux_provider_core::RefreshError;

/// Token-endpoint clients, shared process-wide and keyed by proxy. Refresh
/// traffic is low-volume; one pooled client per egress path is enough.
static CLIENT_CACHE: OnceLock<Mutex<HashMap<Option<String>, wreq::Client>>> = OnceLock::new();

pub(crate) fn oauth_client(proxy: Option<&str>) -> Result<wreq::Client, RefreshError> {
    let key = proxy
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);

    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(client) = guard.get(&key) {
        return Ok(client.clone());
    }

    let mut builder = wreq::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30));
    if let Some(proxy_url) = key.as_deref() {
        builder = builder.proxy(
            wreq::Proxy::all(proxy_url)
                .map_err(|err| RefreshError::Transient(err.to_string()))?,
        );
    }
    let client = builder
        .build()
        .map_err(|err| RefreshError::Transient(err.to_string()))?;
    guard.insert(key, client.clone());
    Ok(client)
}
