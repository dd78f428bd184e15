//! Materialized-view error types.

use changelog::ChangelogError;
use thiserror::Error;

/// Errors that can occur while configuring or refreshing views.
#[derive(Debug, Error)]
pub enum MviewError {
    /// The view declarations can't be turned into a working configuration.
    /// Fatal at load time; the view is not served.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A changelog or checkpoint operation failed.
    #[error("Changelog error: {0}")]
    Changelog(#[from] ChangelogError),

    /// A database error occurred.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A storage failure that a later retry is expected to clear.
    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    /// A source row could not be projected into the grid. Logged and
    /// skipped; never fails a refresh.
    #[error("Materialization error in view {view_id} on {table}: {reason}")]
    Materialization {
        view_id: String,
        table: String,
        reason: String,
    },

    /// A table referenced by a view does not exist.
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Another worker holds the refresh lock of the view.
    #[error("Refresh already in progress for view {0}")]
    RefreshInProgress(String),

    /// No view with this id is configured.
    #[error("Unknown view: {0}")]
    UnknownView(String),
}

impl MviewError {
    /// Returns true when the scheduler should simply retry on its next tick.
    pub fn is_transient(&self) -> bool {
        match self {
            MviewError::Changelog(err) => err.is_transient(),
            MviewError::Storage(sqlx::Error::Database(db_err)) => {
                // Serialization failures, deadlocks, lock timeouts, shutdowns
                // and connection exceptions.
                let code = db_err.code().unwrap_or_default();
                code.starts_with("40")
                    || code.starts_with("08")
                    || code.starts_with("57P")
                    || code == "55P03"
            }
            MviewError::Storage(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Protocol(_)
            ),
            MviewError::TransientStorage(_) | MviewError::RefreshInProgress(_) => true,
            _ => false,
        }
    }
}

/// Result type for view operations.
pub type Result<T> = std::result::Result<T, MviewError>;
