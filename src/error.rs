use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Insufficient imagery coverage: {covered:.3} covered, {required:.3} required")]
    InsufficientCoverage { covered: f64, required: f64 },

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Model version '{requested}' is not available (available: {available})")]
    ModelVersionMismatch { requested: String, available: String },

    #[error("Append-only history violation: {0}")]
    HistoryViolation(String),

    #[error("Invalid event window: {0}")]
    InvalidEventWindow(String),

    #[error("Cancelled before {0} started")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl AppError {
    /// Conditions that must stop the caller rather than be skipped or retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::InvalidGeometry(_) | AppError::HistoryViolation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
