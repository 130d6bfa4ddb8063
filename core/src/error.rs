use thiserror::Error;

/// Errors raised by the session core.
///
/// `Unauthorized` only escapes the [`crate::refresh::RefreshCoordinator`] when a
/// caller talks to a [`crate::transport::Transport`] directly; everything routed
/// through the coordinator sees [`Error::SessionExpired`] instead once recovery
/// has failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("network error: {0}")]
    Network(String),
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("session expired, please sign in again")]
    SessionExpired,
    /// The backend answered 2xx but its envelope carried a failure code.
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("malformed stream frame: {0}")]
    StreamDecode(String),
    #[error("stream interrupted: {0}")]
    StreamTransport(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("conversation already has a request in flight")]
    ConversationBusy,
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// True for a plain 401 that the refresh machinery may still recover from.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// True when the caller has to send the user back to the login screen.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }

    pub(crate) fn network(err: impl std::fmt::Display) -> Self {
        Self::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_auth_errors() {
        let unauthorized = Error::Unauthorized {
            message: "token expired".into(),
        };
        assert!(unauthorized.is_auth_failure());
        assert!(!unauthorized.requires_reauthentication());

        assert!(Error::SessionExpired.requires_reauthentication());
        assert!(!Error::SessionExpired.is_auth_failure());

        let http = Error::Http {
            status: 500,
            message: "boom".into(),
        };
        assert!(!http.is_auth_failure());
        assert!(!http.requires_reauthentication());
    }

    #[test]
    fn formats_http_errors_with_status() {
        let err = Error::Http {
            status: 404,
            message: "not found".into(),
        };
        assert_eq!(err.to_string(), "HTTP 404: not found");
    }
}
