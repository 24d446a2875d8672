use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("DB error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("Logging setup error: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Failure to obtain statuses from the data source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The data source cannot be reached; the loop reconnects.
    #[error("connection failure: {0}")]
    Connection(String),
    /// The connection is alive but the query failed; the cycle is skipped.
    #[error("query failure: {0}")]
    Query(String),
}

impl SourceError {
    pub fn is_connection(&self) -> bool {
        matches!(self, SourceError::Connection(_))
    }
}

impl From<sqlx::Error> for SourceError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => SourceError::Connection(e.to_string()),
            other => SourceError::Query(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("status file IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("status file serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport error: {0}")]
    Transport(String),
    #[error("notification rejected with status {status}")]
    Rejected { status: u16 },
}

impl From<reqwest::Error> for NotifyError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => NotifyError::Rejected {
                status: status.as_u16(),
            },
            None => NotifyError::Transport(e.to_string()),
        }
    }
}
