//! Typed error hierarchy for the Flamecast backend.
//!
//! Two enums cover the failure domains outside the HTTP layer:
//! - `GitHubError` — GitHub REST API failures
//! - `SealError` — Actions-secret sealing failures
//!
//! HTTP-level errors live next to the handlers as `api::ApiError`.

use thiserror::Error;

/// Errors from the GitHub REST client.
#[derive(Debug, Error)]
pub enum GitHubError {
    /// GitHub answered with a non-2xx status. The body is kept because
    /// GitHub's error messages are often the only useful diagnostic.
    #[error("GitHub API error: {status}")]
    Status { status: u16, body: String },

    #[error("No GitHub access token available")]
    MissingToken,

    #[error("Failed to parse GitHub response: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("GitHub request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl GitHubError {
    /// The HTTP status GitHub returned, if this error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for the 403/404 answers that several read endpoints treat as
    /// "nothing there yet" rather than failures.
    pub fn is_not_available(&self) -> bool {
        matches!(self.status(), Some(403) | Some(404))
    }
}

/// Errors from sealing a repository secret.
#[derive(Debug, Error)]
pub enum SealError {
    #[error("Recipient public key is not valid base64: {0}")]
    InvalidKeyEncoding(#[source] base64::DecodeError),

    #[error("Recipient public key must be {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Encryption failed")]
    Encryption,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_display() {
        let err = GitHubError::Status {
            status: 502,
            body: "bad gateway".into(),
        };
        assert_eq!(err.to_string(), "GitHub API error: 502");
        assert_eq!(err.status(), Some(502));
    }

    #[test]
    fn test_not_available_statuses() {
        for status in [403u16, 404] {
            let err = GitHubError::Status {
                status,
                body: String::new(),
            };
            assert!(err.is_not_available());
        }
        let err = GitHubError::Status {
            status: 500,
            body: String::new(),
        };
        assert!(!err.is_not_available());
    }
}
