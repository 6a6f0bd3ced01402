//! Auth and API error types.

use reqwest::StatusCode;

/// Failure to obtain a usable credential.
///
/// `Clone` so a single refresh outcome can be handed to every queued caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No refresh token is stored; the user must log in.
    MissingRefreshToken,
    /// The refresh endpoint answered with a non-success status.
    Rejected {
        /// HTTP status code returned by the server.
        status: u16,
        /// Response body, truncated for logging.
        body: String,
    },
    /// The refresh endpoint answered 2xx with an unexpected body.
    InvalidResponse(String),
    /// The refresh request never got a response.
    Transport(String),
    /// The refresh task went away before settling.
    Aborted,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingRefreshToken => write!(f, "No refresh token stored"),
            Self::Rejected { status, body } => {
                write!(f, "Credential refresh rejected ({status}): {body}")
            }
            Self::InvalidResponse(msg) => write!(f, "Invalid refresh response: {msg}"),
            Self::Transport(msg) => write!(f, "Credential refresh failed: {msg}"),
            Self::Aborted => write!(f, "Credential refresh aborted"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Error returned by [`super::ApiClient`].
#[derive(Debug)]
pub enum ApiError {
    /// Credential refresh failed; the session has been logged out.
    Auth(AuthError),
    /// The request could not be sent or its body could not be read.
    Transport(reqwest::Error),
    /// The server answered with a non-success status.
    Status {
        /// HTTP status code.
        status: StatusCode,
        /// Response body, truncated.
        body: String,
    },
    /// The response body did not match the expected shape.
    Decode(String),
}

impl ApiError {
    /// HTTP status of the failed call, if the server answered.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(e) => e.status(),
            Self::Auth(_) | Self::Decode(_) => None,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth(e) => write!(f, "{e}"),
            Self::Transport(e) => write!(f, "HTTP request failed: {e}"),
            Self::Status { status, body } => write!(f, "Server returned {status}: {body}"),
            Self::Decode(msg) => write!(f, "Unexpected response body: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Auth(e) => Some(e),
            Self::Transport(e) => Some(e),
            Self::Status { .. } | Self::Decode(_) => None,
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        Self::Auth(e)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e)
    }
}

/// Keep error bodies short enough for a log line.
pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
