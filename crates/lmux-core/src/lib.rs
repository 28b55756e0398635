//! Orchestration: configuration, the upstream HTTP client, the streaming
//! pump, and the manager that ties selection, quota, translation, and
//! execution together.

pub mod bootstrap;
pub mod config;
pub mod manager;
pub mod stream;
pub mod upstream_client;

pub use config::{Config, QuotaExceededConfig, UsageConfig};
pub use manager::{ChatOutcome, DeltaStream, Manager, ManagerConfig, RequestContext};
pub use upstream_client::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};
