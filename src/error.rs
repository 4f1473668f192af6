//! Error taxonomy for the sync core.
//!
//! `StorageError` is fatal to the operation that hit it and is surfaced to
//! the caller synchronously. `GatewayError` is classified as transient or
//! permanent so the sync engine can decide between deferring a sale and
//! dropping it from the queue.

use thiserror::Error;

/// Local persistence is unavailable or rejected a write.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage lock poisoned: {0}")]
    Lock(String),
    #[error("migration v{version} failed: {message}")]
    Migration { version: i32, message: String },
    #[error("invalid sale: {0}")]
    InvalidSale(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StorageError::Lock(err.to_string())
    }
}

/// Whether a failed submission is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// Failure returned by the remote gateway.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Network trouble, timeouts, throttling, 5xx, auth. The sale stays queued.
    #[error("{message}")]
    Transient {
        status: Option<u16>,
        message: String,
    },
    /// The backend refused the payload itself. Retrying would loop forever.
    #[error("{message}")]
    Permanent {
        status: Option<u16>,
        message: String,
    },
}

impl GatewayError {
    pub fn transient(message: impl Into<String>) -> Self {
        GatewayError::Transient {
            status: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        GatewayError::Permanent {
            status: None,
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP status.
    ///
    /// 401/403 stay transient: a revoked or expired terminal key is fixed on
    /// the terminal, not in the sale, and dropping sales over it loses data.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_status(status) {
            FailureClass::Transient => GatewayError::Transient {
                status: Some(status),
                message,
            },
            FailureClass::Permanent => GatewayError::Permanent {
                status: Some(status),
                message,
            },
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            GatewayError::Transient { .. } => FailureClass::Transient,
            GatewayError::Permanent { .. } => FailureClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Transient { status, .. } | GatewayError::Permanent { status, .. } => {
                *status
            }
        }
    }
}

/// Status-range rule used by [`GatewayError::from_status`].
pub fn classify_status(status: u16) -> FailureClass {
    match status {
        // 404 means the endpoint is missing, usually a wrong admin URL.
        401 | 403 | 404 | 408 | 425 | 429 => FailureClass::Transient,
        s if s >= 500 => FailureClass::Transient,
        _ => FailureClass::Permanent,
    }
}

/// Catalog refresh from the backend failed.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("catalog fetch failed: {0}")]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Invalid or missing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("could not determine a data directory")]
    NoDataDir,
}
