use thiserror::Error;

use crate::models::punch::ErrorBody;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The server refused the request with a structured error body.
    #[error("{message}")]
    Rejected {
        status: u16,
        message: String,
        code: Option<String>,
    },

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Offline and nothing cached for {0}")]
    CacheMiss(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let cut = (0..=MAX_ERROR_BODY_LENGTH)
                .rev()
                .find(|i| body.is_char_boundary(*i))
                .unwrap_or(0);
            format!("{}... (truncated, {} total bytes)", &body[..cut], body.len())
        }
    }

    /// Map a non-2xx server response to an error, keeping the server's own
    /// message when the body carries one.
    pub fn from_status(status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<ErrorBody>(body).ok();
        let message = parsed
            .as_ref()
            .map(|b| b.error.clone())
            .unwrap_or_else(|| Self::truncate_body(body));

        match status {
            401 => ApiError::Unauthorized(message),
            500..=599 => ApiError::ServerError(message),
            _ => ApiError::Rejected {
                status,
                message,
                code: parsed.and_then(|b| b.code_string()),
            },
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, ApiError::Network(_) | ApiError::CacheMiss(_))
    }
}
