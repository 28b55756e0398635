//! Shared vocabulary for lmux: provider names, error categories, and the
//! gateway error type every layer speaks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod provider {
    pub const CLAUDE: &str = "claude";
    pub const COPILOT: &str = "copilot";
    pub const GEMINI: &str = "gemini";
    pub const ANTIGRAVITY: &str = "antigravity";
    pub const CODEX: &str = "codex";
    pub const QWEN: &str = "qwen";
    pub const IFLOW: &str = "iflow";
    pub const KIRO: &str = "kiro";
    pub const CLINE: &str = "cline";
    pub const VERTEX: &str = "vertex";

    pub fn known() -> &'static [&'static str] {
        &[
            CLAUDE,
            COPILOT,
            GEMINI,
            ANTIGRAVITY,
            CODEX,
            QWEN,
            IFLOW,
            KIRO,
            CLINE,
            VERTEX,
        ]
    }
}

/// Closed set of failure classes. Everything the manager decides (retry on
/// another credential, wait out a cooldown, disable the credential, surface
/// to the client) keys off this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed request, invalid model. Surfaced as 400; never retried.
    UserError,
    /// Credential unauthenticated or expired but recoverable; retry elsewhere.
    AuthError,
    /// Credential permanently dead; disable the entry, retry elsewhere.
    AuthRevoked,
    /// 429 or provider quota signal; cool the auth, retry elsewhere.
    QuotaError,
    /// 5xx, timeout, connection reset; retry elsewhere or after backoff.
    Transient,
    /// 404 from upstream (unknown model). Surfaced as-is.
    NotFound,
    /// Downstream client went away. Surfaced immediately, no quota penalty.
    ClientCanceled,
    /// Conservative default: not retryable.
    Unknown,
}

impl ErrorCategory {
    /// Whether the manager may pick another credential and try again.
    pub fn should_fallback(self) -> bool {
        matches!(
            self,
            ErrorCategory::AuthError | ErrorCategory::QuotaError | ErrorCategory::Transient
        )
    }

    pub fn disables_auth(self) -> bool {
        matches!(self, ErrorCategory::AuthRevoked)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{category:?}: {message}")]
pub struct GatewayError {
    pub category: ErrorCategory,
    /// Upstream HTTP status when one exists; surfaced where meaningful.
    pub status: Option<u16>,
    /// Parsed `Retry-After` for quota errors.
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl GatewayError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            status: None,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::UserError, message).with_status(400)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, message).with_status(404)
    }

    pub fn canceled() -> Self {
        Self::new(ErrorCategory::ClientCanceled, "client canceled")
    }

    pub fn quota(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            category: ErrorCategory::QuotaError,
            status: Some(429),
            retry_after,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn should_fallback(&self) -> bool {
        self.category.should_fallback()
    }
}

/// FNV-1a, 32-bit. Used wherever a stable, seedless dispersion of an auth id
/// is needed (score bases, outgoing fingerprint presets) so the same id maps
/// to the same bucket across restarts.
pub fn fnv32a(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv32a_known_vectors() {
        assert_eq!(fnv32a(b""), 0x811c_9dc5);
        assert_eq!(fnv32a(b"a"), 0xe40c_292c);
    }

    #[test]
    fn fallback_categories() {
        assert!(ErrorCategory::AuthError.should_fallback());
        assert!(ErrorCategory::QuotaError.should_fallback());
        assert!(ErrorCategory::Transient.should_fallback());
        assert!(!ErrorCategory::UserError.should_fallback());
        assert!(!ErrorCategory::AuthRevoked.should_fallback());
        assert!(!ErrorCategory::NotFound.should_fallback());
        assert!(!ErrorCategory::ClientCanceled.should_fallback());
        assert!(!ErrorCategory::Unknown.should_fallback());
    }

    #[test]
    fn quota_error_carries_retry_after() {
        let err = GatewayError::quota("rate limited", Some(Duration::from_secs(30)));
        assert_eq!(err.status, Some(429));
        assert_eq!(err.retry_after, Some(Duration::from_secs(30)));
        assert!(err.should_fallback());
    }
}
