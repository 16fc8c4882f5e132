//! Protocol error taxonomy
//!
//! Every failure of an engine operation is one of these variants. Each maps
//! to an OAuth2 error code (RFC 6749 section 5.2) and an HTTP status so the
//! HTTP layer can render it without inspecting messages.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid client: {0}")]
    InvalidClient(String),

    #[error("unauthorized client: {0}")]
    UnauthorizedClient(String),

    #[error("invalid grant: {0}")]
    InvalidGrant(String),

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    /// Never redirected back to the client: the URI itself is untrusted.
    #[error("invalid redirect URI: {0}")]
    InvalidRedirectUri(String),

    #[error("unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("connector error: {0}")]
    Connector(#[from] connector::Error),

    #[error("storage error: {0}")]
    Storage(#[from] storage::Error),

    #[error("signing error: {0}")]
    Keys(#[from] keys::Error),

    /// The deadline passed; the outcome of the interrupted call is unknown.
    #[error("deadline exceeded")]
    Timeout,
}

impl From<common::DeadlineExceeded> for Error {
    fn from(_: common::DeadlineExceeded) -> Self {
        Error::Timeout
    }
}

impl Error {
    /// OAuth2 `error` code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) | Error::InvalidRedirectUri(_) => "invalid_request",
            Error::InvalidClient(_) => "invalid_client",
            Error::UnauthorizedClient(_) => "unauthorized_client",
            Error::InvalidGrant(_) => "invalid_grant",
            Error::InvalidScope(_) => "invalid_scope",
            Error::UnsupportedGrantType(_) => "unsupported_grant_type",
            Error::AccessDenied(_) => "access_denied",
            Error::Connector(connector::Error::InvalidCredentials) => "access_denied",
            Error::Timeout => "temporarily_unavailable",
            Error::Connector(_) | Error::Storage(_) | Error::Keys(_) => "server_error",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Error::InvalidClient(_) => 401,
            Error::AccessDenied(_) => 403,
            Error::Connector(connector::Error::InvalidCredentials) => 401,
            Error::Connector(connector::Error::Upstream(_)) => 502,
            Error::Connector(_) | Error::Storage(_) | Error::Keys(_) => 500,
            Error::Timeout => 503,
            _ => 400,
        }
    }

    /// `error_description` safe to show to the caller. Internal failures
    /// are not described beyond their kind.
    pub fn description(&self) -> String {
        match self {
            Error::Storage(_) | Error::Keys(_) => "internal server error".into(),
            other => other.to_string(),
        }
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_map_to_oauth_codes() {
        let cases = [
            (Error::InvalidRequest("x".into()), "invalid_request", 400),
            (Error::InvalidRedirectUri("x".into()), "invalid_request", 400),
            (Error::InvalidClient("x".into()), "invalid_client", 401),
            (Error::UnauthorizedClient("x".into()), "unauthorized_client", 400),
            (Error::InvalidGrant("x".into()), "invalid_grant", 400),
            (Error::InvalidScope("x".into()), "invalid_scope", 400),
            (Error::UnsupportedGrantType("x".into()), "unsupported_grant_type", 400),
            (Error::Timeout, "temporarily_unavailable", 503),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.error_code(), code, "{err:?}");
            assert_eq!(err.status(), status, "{err:?}");
        }
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = Error::Storage(storage::Error::Backend("connection refused to 10.0.0.5".into()));
        assert_eq!(err.error_code(), "server_error");
        assert_eq!(err.status(), 500);
        assert!(!err.description().contains("10.0.0.5"));
    }

    #[test]
    fn connector_errors_are_described() {
        let err = Error::from(connector::Error::Upstream("github returned 500".into()));
        assert_eq!(err.status(), 502);
        assert!(err.description().contains("github returned 500"));

        let denied = Error::from(connector::Error::InvalidCredentials);
        assert_eq!(denied.error_code(), "access_denied");
        assert_eq!(denied.status(), 401);
    }

    #[test]
    fn deadline_maps_to_timeout() {
        assert!(matches!(Error::from(common::DeadlineExceeded), Error::Timeout));
    }
}
