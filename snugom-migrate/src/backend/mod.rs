//! Document store primitives.
//!
//! A backend offers exactly one primitive per statement kind. Conditional
//! updates are atomic: the filter is evaluated and the update applied as one
//! step on the store, never as a client-side read followed by a write.

mod memory;
mod redis_store;

use std::sync::Arc;

use serde_json::Value;

use crate::{
    document::Document,
    errors::{MigrationError, MigrationResult},
    statement::{AggregateStatement, CountStatement, DeleteStatement, FindStatement, InsertStatement, UpdateStatement},
};

pub use self::memory::MemoryBackend;
pub use self::redis_store::RedisBackend;

/// Result of a conditional update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted: bool,
}

impl UpdateOutcome {
    /// Documents touched, counting an upserted insert.
    pub fn affected(&self) -> u64 {
        self.modified + u64::from(self.upserted)
    }
}

#[allow(async_fn_in_trait)]
pub trait DocumentBackend {
    async fn insert(&self, statement: &InsertStatement) -> MigrationResult<u64>;

    async fn update(&self, statement: &UpdateStatement) -> MigrationResult<UpdateOutcome>;

    async fn delete(&self, statement: &DeleteStatement) -> MigrationResult<u64>;

    async fn find(&self, statement: &FindStatement) -> MigrationResult<Vec<Document>>;

    async fn count(&self, statement: &CountStatement) -> MigrationResult<u64>;

    async fn aggregate(&self, statement: &AggregateStatement) -> MigrationResult<Vec<Document>>;

    async fn run_command(&self, command: &AdminCommand) -> MigrationResult<Document>;
}

impl<B> DocumentBackend for Arc<B>
where
    B: DocumentBackend,
{
    async fn insert(&self, statement: &InsertStatement) -> MigrationResult<u64> {
        self.as_ref().insert(statement).await
    }

    async fn update(&self, statement: &UpdateStatement) -> MigrationResult<UpdateOutcome> {
        self.as_ref().update(statement).await
    }

    async fn delete(&self, statement: &DeleteStatement) -> MigrationResult<u64> {
        self.as_ref().delete(statement).await
    }

    async fn find(&self, statement: &FindStatement) -> MigrationResult<Vec<Document>> {
        self.as_ref().find(statement).await
    }

    async fn count(&self, statement: &CountStatement) -> MigrationResult<u64> {
        self.as_ref().count(statement).await
    }

    async fn aggregate(&self, statement: &AggregateStatement) -> MigrationResult<Vec<Document>> {
        self.as_ref().aggregate(statement).await
    }

    async fn run_command(&self, command: &AdminCommand) -> MigrationResult<Document> {
        self.as_ref().run_command(command).await
    }
}

const COMMAND_NAMES: [&str; 5] = ["ping", "create", "drop", "listCollections", "dropDatabase"];

/// Administrative commands understood by every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Ping,
    Create(String),
    Drop(String),
    ListCollections,
    DropDatabase,
}

impl AdminCommand {
    /// Reads the command from its name key. Any other key is an option.
    pub fn parse(command: &Document) -> MigrationResult<Self> {
        let Some((name, argument)) = COMMAND_NAMES
            .iter()
            .find_map(|name| command.get(*name).map(|argument| (*name, argument)))
        else {
            return Err(match command.keys().next() {
                Some(other) => MigrationError::database(format!("unsupported command {other}")),
                None => MigrationError::database("empty command document"),
            });
        };
        let collection = || {
            argument
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| MigrationError::database(format!("{name} expects a collection name")))
        };
        match name {
            "ping" => Ok(Self::Ping),
            "create" => Ok(Self::Create(collection()?)),
            "drop" => Ok(Self::Drop(collection()?)),
            "listCollections" => Ok(Self::ListCollections),
            "dropDatabase" => Ok(Self::DropDatabase),
            other => Err(MigrationError::database(format!("unsupported command {other}"))),
        }
    }

    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Create(_) | Self::Drop(_) | Self::DropDatabase)
    }
}

pub(crate) fn ok_reply() -> Document {
    let mut reply = Document::new();
    reply.insert("ok".to_string(), Value::from(1));
    reply
}
