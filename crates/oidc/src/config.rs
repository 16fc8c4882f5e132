//! Engine configuration

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::rotation::RefreshPolicy;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Issuer URL, also the base of every endpoint URL
    pub issuer: String,
    pub id_tokens_valid_for: Duration,
    pub auth_requests_valid_for: Duration,
    pub auth_codes_valid_for: Duration,
    /// Issue the code as soon as the upstream login succeeds
    pub skip_approval: bool,
    pub refresh: RefreshPolicy,
}

impl ServerConfig {
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into().trim_end_matches('/').to_string(),
            id_tokens_valid_for: Duration::from_secs(24 * 60 * 60),
            auth_requests_valid_for: Duration::from_secs(24 * 60 * 60),
            auth_codes_valid_for: Duration::from_secs(10 * 60),
            skip_approval: false,
            refresh: RefreshPolicy::default(),
        }
    }

    /// Absolute URL of an endpoint served under the issuer.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.issuer, path)
    }

    /// Where callback connectors send the browser back to.
    pub fn callback_url(&self) -> String {
        self.endpoint("/callback")
    }

    /// Where assertion connectors POST back to.
    pub fn assertion_url(&self) -> String {
        self.endpoint("/callback/assertion")
    }
}

/// `now + ttl`, saturating at the largest representable time.
pub(crate) fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
