/// Error types for xmlscout.
///
/// Errors fall into two groups. Setup faults (bad configuration, an invalid
/// pattern, a server that never accepts a connection) fail the whole run.
/// Everything else is scoped to a single candidate file or a single date
/// directory and is recorded against it while the run carries on:
///
/// ```rust,ignore
/// match processor.scan(&mut lease, &candidate) {
///     Ok(outcome) => record(outcome),
///     Err(e) if e.is_transport_fault() => pool.invalidate(lease),
///     Err(e) => record_error(e),
/// }
/// ```
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for search operations
pub type SearchResult<T> = Result<T, SearchError>;

/// Errors that can occur while connecting, listing, reading or matching
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Transfer error on {path}: {message}")]
    Transfer { path: String, message: String },
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Remote path not found: {0}")]
    NotFound(String),
    #[error("Malformed document {path}: {message}")]
    MalformedDocument { path: String, message: String },
    #[error("Listing failed for {directory}: {message}")]
    Enumeration { directory: String, message: String },
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),
    #[error("Invalid query '{query}': {message}")]
    InvalidQuery { query: String, message: String },
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Search cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Coarse classification of an error, carried in result records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Transfer,
    Timeout,
    NotFound,
    MalformedDocument,
    Enumeration,
    InvalidPattern,
    InvalidQuery,
    Config,
    Cancelled,
    Io,
}

impl SearchError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn transfer(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transfer {
            path: path.into(),
            message: msg.into(),
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn malformed(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedDocument {
            path: path.into(),
            message: msg.into(),
        }
    }

    pub fn enumeration(directory: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Enumeration {
            directory: directory.into(),
            message: msg.into(),
        }
    }

    pub fn invalid_pattern(pattern: impl Into<String>) -> Self {
        Self::InvalidPattern(pattern.into())
    }

    pub fn invalid_query(query: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidQuery {
            query: query.into(),
            message: msg.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Maps a read error from a transfer stream, keeping timeouts distinct
    pub fn from_read(path: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::Timeout(format!("reading {}: {}", path, err))
            }
            _ => Self::transfer(path, err.to_string()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::Transfer { .. } => ErrorKind::Transfer,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::MalformedDocument { .. } => ErrorKind::MalformedDocument,
            Self::Enumeration { .. } => ErrorKind::Enumeration,
            Self::InvalidPattern(_) => ErrorKind::InvalidPattern,
            Self::InvalidQuery { .. } => ErrorKind::InvalidQuery,
            Self::ConfigError(_) => ErrorKind::Config,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::IoError(_) => ErrorKind::Io,
        }
    }

    /// True when the session that produced this error can no longer be trusted
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Transfer { .. } | Self::Timeout(_) | Self::IoError(_)
        )
    }
}

impl From<config::ConfigError> for SearchError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}
