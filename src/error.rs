use thiserror::Error;
use uuid::Uuid;

/// Main error type for the orchestration core
#[derive(Error, Debug)]
pub enum OrraError {
    // Configuration errors (fatal at boot)
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Runtime state store
    #[error("Runtime state store unavailable: {0}")]
    StoreUnavailable(String),

    // Credential vault errors
    #[error("Credential not found: tenant {tenant_id}, broker {broker}")]
    CredentialNotFound { tenant_id: Uuid, broker: String },

    #[error("Credential decryption failed: tenant {tenant_id}, broker {broker}")]
    DecryptionFailure { tenant_id: Uuid, broker: String },

    #[error("Encryption error: {0}")]
    Encryption(String),

    // Billing webhook
    #[error("Webhook signature invalid: {0}")]
    SignatureInvalid(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrraError {
    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            OrraError::TransientIo(_)
            | OrraError::StoreUnavailable(_)
            | OrraError::WebSocket(_)
            | OrraError::Io(_) => true,
            OrraError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            OrraError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }

    /// Whether this error should abort process startup.
    pub fn is_fatal_at_boot(&self) -> bool {
        matches!(self, OrraError::Configuration(_) | OrraError::Config(_))
    }
}

/// Result type alias for OrraError
pub type Result<T> = std::result::Result<T, OrraError>;
