use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use tracing::info;

use lmux_provider_core::{
    AuthRegistry, EventHub, FileStore, QuotaManager, RefresherConfig, Selector, StickyStore,
    TokenRefresher,
};

use crate::config::Config;
use crate::manager::{Manager, ManagerConfig};
use crate::upstream_client::{UpstreamClientConfig, WreqUpstreamClient};

/// Everything a running gateway needs, wired once at boot.
pub struct CoreState {
    pub config: ArcSwap<Config>,
    pub manager: Arc<Manager>,
    pub registry: Arc<AuthRegistry>,
    pub events: EventHub,
}

pub async fn bootstrap(config: Config) -> anyhow::Result<Arc<CoreState>> {
    let store = FileStore::new(&config.auth_dir)
        .with_context(|| format!("preparing auth dir {}", config.auth_dir))?;
    let registry = Arc::new(AuthRegistry::new(Some(Arc::new(store))));
    let loaded = registry
        .load_from_store()
        .await
        .context("loading auth files")?;
    info!(loaded, auth_dir = %config.auth_dir, "registry ready");

    let quota = Arc::new(QuotaManager::new(config.disable_cooling));
    let sticky = Arc::new(StickyStore::new());
    sticky.clone().spawn_sweeper();
    let selector = Arc::new(Selector::new(sticky, quota.clone()));

    let executors = lmux_provider_impl::executors();
    let refresher = Arc::new(TokenRefresher::new(
        registry.clone(),
        executors.clone(),
        RefresherConfig::default(),
    ));
    refresher.spawn();

    let client = WreqUpstreamClient::new(UpstreamClientConfig {
        proxy: config.proxy_url.clone(),
        stream_idle_timeout: config.stream_timeout(),
        max_response_size: config.max_response_size,
        ..Default::default()
    })
    .context("building upstream client")?;

    let events = EventHub::new(128);
    let manager = Arc::new(Manager::new(
        registry.clone(),
        selector,
        quota,
        executors,
        client,
        events.clone(),
        ManagerConfig {
            max_attempts: config.request_retry.max(1),
            max_cooldown_wait: config.max_retry_interval(),
            oauth_excluded_models: config.oauth_excluded_models.clone(),
            switch_project: config.quota_exceeded.switch_project,
            switch_preview_model: config.quota_exceeded.switch_preview_model,
            ..Default::default()
        },
    ));

    Ok(Arc::new(CoreState {
        config: ArcSwap::from_pointee(config),
        manager,
        registry,
        events,
    }))
}
