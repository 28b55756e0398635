//! Credential-multiplexing core: auth entries, the registry, sticky
//! sessions, quota strategies, selection, and background token refresh.
//!
//! This crate does no HTTP IO of its own. Provider implementations build
//! [`UpstreamHttpRequest`]s and run refresh flows; a higher layer performs
//! the transport.

pub mod auth;
pub mod events;
pub mod quota;
pub mod refresh;
pub mod registry;
pub mod select;
pub mod sticky;
pub mod store;
pub mod upstream;

pub use auth::{
    Auth, AuthId, AuthMetadata, AuthStatus, ModelState, QuotaState, RefreshEvaluator, SkipReason,
};
pub use events::{EventHub, EventSink, GatewayEvent, OperationalEvent, UsageEvent};
pub use quota::{
    AuthQuotaState, CLAUDE_DEFAULT_COOLDOWN, ProviderQuotaConfig, ProviderStrategy, QuotaManager,
    QuotaStrategy, RealQuota, RequestTicket, backoff_for_level, strategy_for,
};
pub use refresh::{RefresherConfig, TokenRefresher, should_refresh};
pub use registry::{AuthChange, AuthRegistry, RequestResult, is_revoke_message};
pub use select::{PickError, PickOptions, Selector};
pub use sticky::StickyStore;
pub use store::{AuthStore, FileStore};
pub use upstream::{
    ByteStream, Headers, HttpMethod, ProviderExecutor, RefreshError, RefreshUpdate, StreamDecoder,
    TransportErrorKind, UpstreamBody, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    classify_failure, header_get, header_remove, header_set, parse_retry_after,
};
