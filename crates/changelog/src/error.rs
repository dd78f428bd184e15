use thiserror::Error;

use crate::SequenceId;

/// Errors that can occur when interacting with changelogs and checkpoints.
#[derive(Debug, Error)]
pub enum ChangelogError {
    /// A checkpoint was moved by someone else between read and advance.
    #[error(
        "Checkpoint conflict for {subscriber}: expected sequence {expected}, found {actual}"
    )]
    CheckpointConflict {
        subscriber: String,
        expected: SequenceId,
        actual: SequenceId,
    },

    /// An advance would move a checkpoint backwards.
    #[error("Checkpoint for {subscriber} cannot move back from {current} to {requested}")]
    CheckpointRegression {
        subscriber: String,
        current: SequenceId,
        requested: SequenceId,
    },

    /// The changelog has not been created.
    #[error("Changelog not found: {0}")]
    ChangelogNotFound(String),

    /// A table or changelog name is not a plain SQL identifier.
    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl ChangelogError {
    /// Returns true when retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ChangelogError::CheckpointConflict { .. } => true,
            ChangelogError::Database(err) => !matches!(
                err,
                sqlx::Error::RowNotFound
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::TypeNotFound { .. }
                    | sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::Decode(_)
            ),
            _ => false,
        }
    }
}

/// Result type for changelog operations.
pub type Result<T> = std::result::Result<T, ChangelogError>;

/// Checks that `name` is safe to splice into SQL as a table name.
///
/// Only `[A-Za-z_][A-Za-z0-9_]*` is accepted; changelog and table names
/// come from configuration, never from end users.
pub fn validate_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid && name.len() <= 63 {
        Ok(name)
    } else {
        Err(ChangelogError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        assert!(validate_identifier("sales_order_grid_cl").is_ok());
        assert!(validate_identifier("_private").is_ok());
    }

    #[test]
    fn rejects_injection_attempts() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1table").is_err());
        assert!(validate_identifier("orders; DROP TABLE x").is_err());
        assert!(validate_identifier("a\"b").is_err());
    }

    #[test]
    fn conflicts_are_transient() {
        let err = ChangelogError::CheckpointConflict {
            subscriber: "v".into(),
            expected: SequenceId::new(1),
            actual: SequenceId::new(2),
        };
        assert!(err.is_transient());
        assert!(!ChangelogError::ChangelogNotFound("x".into()).is_transient());
    }
}
