//! Change log migrations for documents stored in Redis.
//!
//! Statements are applied through an [`Executor`], tracked by the
//! [`ChangeLogHistoryService`] and serialized across processes by the
//! [`LockService`]. [`MigrationRunner`] ties the three together.

pub mod backend;
pub mod changeset;
pub mod config;
pub mod document;
pub mod errors;
pub mod history;
pub mod id;
pub mod keys;
pub mod lock;
pub mod logging;
pub mod runner;
pub mod runtime;
pub mod statement;

pub use backend::{AdminCommand, DocumentBackend, MemoryBackend, RedisBackend, UpdateOutcome};
pub use changeset::{ChangeLog, ChangeSet};
pub use config::MigrateConfig;
pub use document::Document;
pub use errors::*;
pub use history::{ChangeLogHistoryService, ChangeSetRecord, ExecType, RunStatus};
pub use lock::{LockHandle, LockRecord, LockService, LockSettings};
pub use logging::Logger;
pub use runner::{ChangeSetStatus, MigrationRunner, MigrationStats};
pub use runtime::Executor;
pub use statement::{Statement, StatementKind};

// Re-export redis types so users don't need to depend on a specific redis version
pub use redis;
pub use redis::aio::ConnectionManager;
