use thiserror::Error;

/// Main error type for the orchestration core
#[derive(Error, Debug)]
pub enum AgoraError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    // Ledger errors
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Insufficient balance for {entity}: balance {balance}, required {required}")]
    InsufficientBalance {
        entity: String,
        balance: i64,
        required: i64,
    },

    #[error("Supply cap reached: minted {minted}, cap {cap}")]
    SupplyCapReached { minted: i64, cap: i64 },

    // Registry errors
    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Aggregation errors
    #[error("No valid updates in cycle {cycle_id}")]
    NoValidUpdates { cycle_id: u64 },

    // Time-bounded operations
    #[error("Task expired: {0}")]
    Expired(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Persistence errors
    #[error("Journal error: {0}")]
    Journal(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for AgoraError
pub type Result<T> = std::result::Result<T, AgoraError>;

impl AgoraError {
    /// Whether the failure is a caller-side validation failure (as opposed to an
    /// infrastructure fault). Validation failures never change ledger state.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AgoraError::InvalidAmount(_)
                | AgoraError::InsufficientBalance { .. }
                | AgoraError::SupplyCapReached { .. }
                | AgoraError::DuplicateId(_)
                | AgoraError::NotFound(_)
                | AgoraError::NoValidUpdates { .. }
                | AgoraError::Validation(_)
        )
    }
}
