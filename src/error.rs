//! Error types for the offline core

use reqwest::StatusCode;
use thiserror::Error;

/// Result type alias using the offline core's error
pub type Result<T> = std::result::Result<T, OfflineError>;

/// Errors surfaced by the key manager, local store, queue and interceptor
#[derive(Error, Debug)]
pub enum OfflineError {
    /// Network unreachable, timed out or aborted
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Remote authority rejected the request (4xx other than 409)
    #[error("Validation error ({status}): {message}")]
    Validation { status: u16, message: String },

    /// Server copy diverged from what the client expected
    #[error("Conflict on {endpoint}: server state diverged")]
    Conflict {
        endpoint: String,
        server_state: serde_json::Value,
    },

    /// Remote authority failed (5xx)
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// System randomness or cipher setup is not available
    #[error("Crypto provider unavailable: {0}")]
    CryptoUnavailable(String),

    /// Stored key sentinel does not match the derived key
    #[error("Key integrity check failed: {0}")]
    Integrity(String),

    /// Ciphertext could not be opened with the active key
    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl OfflineError {
    /// Map an explicit non-2xx response onto the taxonomy
    pub fn from_status(status: StatusCode, endpoint: &str, body: &[u8]) -> Self {
        if status == StatusCode::CONFLICT {
            let server_state = serde_json::from_slice(body).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(body).into_owned())
            });
            return Self::Conflict {
                endpoint: endpoint.to_string(),
                server_state,
            };
        }

        let message = String::from_utf8_lossy(body).chars().take(200).collect::<String>();
        if status.is_client_error() {
            Self::Validation {
                status: status.as_u16(),
                message,
            }
        } else {
            Self::Server {
                status: status.as_u16(),
                message,
            }
        }
    }

    /// Whether the failure is eligible for offline fallback or queueing
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

impl From<reqwest::Error> for OfflineError {
    fn from(err: reqwest::Error) -> Self {
        // Timeouts, refused connections and body/transport failures all mean
        // the authority never answered.
        match err.status() {
            Some(status) => Self::from_status(status, err.url().map(|u| u.path()).unwrap_or(""), b""),
            None => Self::Connectivity(err.to_string()),
        }
    }
}
