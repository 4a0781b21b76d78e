use std::{borrow::Cow, time::Duration};

use thiserror::Error;

use crate::statement::StatementKind;

/// Top-level error type returned by the migration engine.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A statement reached a dispatch point that cannot service it.
    #[error("invalid argument: {operation} does not accept {kind} statements")]
    InvalidArgument { operation: &'static str, kind: StatementKind },

    /// The lock could not be acquired within the configured wait budget.
    #[error(
        "could not acquire change log lock {lock_id} after waiting {waited:?}; currently held by {}",
        held_by.as_deref().unwrap_or("<unknown>")
    )]
    LockTimeout {
        lock_id: i64,
        waited: Duration,
        held_by: Option<String>,
    },

    #[error("change log lock {lock_id} is not a configured slot (slots 1..={slots})")]
    UnknownLockSlot { lock_id: i64, slots: u32 },

    /// Underlying Redis command failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The backend rejected or failed a command.
    #[error("database error: {message}")]
    Database { message: Cow<'static, str> },

    /// Documents or statements could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An executed changeset no longer matches its recorded checksum.
    #[error("checksum changed for {id}::{author}::{path} (recorded {stored}, current {current})")]
    ChecksumMismatch {
        id: String,
        author: String,
        path: String,
        stored: String,
        current: String,
    },

    /// The changelog is unreadable or inconsistent.
    #[error("invalid changelog: {message}")]
    InvalidChangeLog { message: String },

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("{message}")]
    Other { message: Cow<'static, str> },
}

impl MigrationError {
    pub fn database(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Database { message: message.into() }
    }

    /// True for contention failures; everything else is terminal.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

/// Convenience alias used throughout the crate.
pub type MigrationResult<T> = Result<T, MigrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_names_holder_and_wait() {
        let err = MigrationError::LockTimeout {
            lock_id: 1,
            waited: Duration::from_secs(5),
            held_by: Some("build-01 (4242) #abc".to_string()),
        };
        let message = err.to_string();
        assert!(message.contains("lock 1"));
        assert!(message.contains("5s"));
        assert!(message.contains("build-01 (4242) #abc"));
        assert!(err.is_lock_timeout());
    }

    #[test]
    fn lock_timeout_without_holder() {
        let err = MigrationError::LockTimeout {
            lock_id: 2,
            waited: Duration::from_millis(10),
            held_by: None,
        };
        assert!(err.to_string().ends_with("<unknown>"));
    }

    #[test]
    fn invalid_argument_names_kind() {
        let err = MigrationError::InvalidArgument {
            operation: "query_for_long",
            kind: StatementKind::Insert,
        };
        assert_eq!(
            err.to_string(),
            "invalid argument: query_for_long does not accept insert statements"
        );
        assert!(!err.is_lock_timeout());
    }
}
