use thiserror::Error;

pub type Result<T, E = ForemanError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum ForemanError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Store authentication failed: {0}")]
    StoreAuth(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Approval not found: {0}")]
    ApprovalNotFound(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Session host error: {0}")]
    SessionHost(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl ForemanError {
    /// Store auth failures trip the circuit breaker immediately; other
    /// store errors count toward its failure threshold.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::StoreAuth(_))
    }

    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::StoreAuth(_) | Self::StoreUnavailable(_)
        )
    }
}

/// Session host call failures, classified so callers can decide whether a
/// retry is worthwhile (the combined patch retries without the model field
/// on a model error; transient failures go back through queue retry).
#[derive(Debug, Clone)]
pub enum HostError {
    InvalidModel(String),
    Transient(String),
    Other(String),
}

impl HostError {
    pub fn is_model_error(&self) -> bool {
        matches!(self, Self::InvalidModel(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::InvalidModel(_) | Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::InvalidModel(m) | Self::Transient(m) | Self::Other(m) => m,
        }
    }
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidModel(m) => write!(f, "Invalid model: {}", m),
            Self::Transient(m) => write!(f, "Transient host error: {}", m),
            Self::Other(m) => write!(f, "Host error: {}", m),
        }
    }
}

impl std::error::Error for HostError {}

impl From<HostError> for ForemanError {
    fn from(err: HostError) -> Self {
        ForemanError::SessionHost(err.to_string())
    }
}
