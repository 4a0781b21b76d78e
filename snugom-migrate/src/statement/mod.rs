//! Database-agnostic statements.
//!
//! A [`Statement`] describes one operation against the document store. It is
//! built per operation, handed to the executor and dropped. `render()` gives
//! the shell-equivalent command line used for logging and dry runs; its
//! output is consumed by existing tooling and must stay byte-stable.

mod render;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{Document, ID_FIELD};

/// Field whose presence in an update marks a clear-checksums request.
pub const CLEAR_CHECKSUMS_SENTINEL: &str = "MD5SUM";

/// Shell command name used when rendering lock replacement.
pub const REPLACE_LOCK_COMMAND: &str = "replaceLock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Statement {
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    RunCommand(RunCommandStatement),
    FindOne(FindOneStatement),
    Find(FindStatement),
    Count(CountStatement),
    Aggregate(AggregateStatement),
    ReplaceLock(ReplaceLockStatement),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    RunCommand,
    FindOne,
    Find,
    Count,
    Aggregate,
    ReplaceLock,
    ClearChecksums,
}

impl StatementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::RunCommand => "run_command",
            Self::FindOne => "find_one",
            Self::Find => "find",
            Self::Count => "count",
            Self::Aggregate => "aggregate",
            Self::ReplaceLock => "replace_lock",
            Self::ClearChecksums => "clear_checksums",
        }
    }

    /// Kinds that write to the database.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::Insert | Self::Update | Self::Delete | Self::RunCommand | Self::ReplaceLock | Self::ClearChecksums
        )
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertStatement {
    pub collection: String,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatement {
    pub collection: String,
    #[serde(default)]
    pub filter: Document,
    pub update: Document,
    #[serde(default)]
    pub multi: bool,
    #[serde(default)]
    pub upsert: bool,
}

impl UpdateStatement {
    pub fn new(collection: impl Into<String>, filter: Document, update: Document) -> Self {
        Self {
            collection: collection.into(),
            filter,
            update,
            multi: false,
            upsert: false,
        }
    }

    pub fn multi(mut self, multi: bool) -> Self {
        self.multi = multi;
        self
    }

    pub fn upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }

    /// True when the update writes the clear-checksums sentinel field, either
    /// directly or through an operator document.
    pub fn is_clear_checksums(&self) -> bool {
        self.update.iter().any(|(key, value)| {
            key == CLEAR_CHECKSUMS_SENTINEL
                || (key.starts_with('$')
                    && value
                        .as_object()
                        .is_some_and(|fields| fields.contains_key(CLEAR_CHECKSUMS_SENTINEL)))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteStatement {
    pub collection: String,
    #[serde(default)]
    pub filter: Document,
    #[serde(default)]
    pub multi: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCommandStatement {
    pub command: Document,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindOneStatement {
    pub collection: String,
    #[serde(default)]
    pub filter: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub order: SortOrder,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindStatement {
    pub collection: String,
    #[serde(default)]
    pub filter: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountStatement {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Document>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStatement {
    pub collection: String,
    pub pipeline: Vec<Value>,
}

/// Unconditional replacement of one lock record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaceLockStatement {
    pub collection: String,
    pub lock_id: i64,
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<String>,
}

impl ReplaceLockStatement {
    /// The document this statement writes. Holder fields appear only when set.
    pub fn replacement(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(ID_FIELD.to_string(), Value::from(self.lock_id));
        doc.insert("locked".to_string(), Value::Bool(self.locked));
        if let Some(by) = &self.locked_by {
            doc.insert("lockedBy".to_string(), Value::String(by.clone()));
        }
        if let Some(at) = &self.locked_at {
            doc.insert("lockedAt".to_string(), Value::String(at.clone()));
        }
        doc
    }
}

impl Statement {
    pub fn kind(&self) -> StatementKind {
        match self {
            Self::Insert(_) => StatementKind::Insert,
            Self::Update(update) if update.is_clear_checksums() => StatementKind::ClearChecksums,
            Self::Update(_) => StatementKind::Update,
            Self::Delete(_) => StatementKind::Delete,
            Self::RunCommand(_) => StatementKind::RunCommand,
            Self::FindOne(_) => StatementKind::FindOne,
            Self::Find(_) => StatementKind::Find,
            Self::Count(_) => StatementKind::Count,
            Self::Aggregate(_) => StatementKind::Aggregate,
            Self::ReplaceLock(_) => StatementKind::ReplaceLock,
        }
    }

    /// Target collection; `None` for database-level commands.
    pub fn collection(&self) -> Option<&str> {
        match self {
            Self::Insert(s) => Some(&s.collection),
            Self::Update(s) => Some(&s.collection),
            Self::Delete(s) => Some(&s.collection),
            Self::RunCommand(_) => None,
            Self::FindOne(s) => Some(&s.collection),
            Self::Find(s) => Some(&s.collection),
            Self::Count(s) => Some(&s.collection),
            Self::Aggregate(s) => Some(&s.collection),
            Self::ReplaceLock(s) => Some(&s.collection),
        }
    }

    pub fn insert_one(collection: impl Into<String>, document: Document) -> Self {
        Self::Insert(InsertStatement {
            collection: collection.into(),
            documents: vec![document],
        })
    }

    pub fn insert_many(collection: impl Into<String>, documents: Vec<Document>) -> Self {
        Self::Insert(InsertStatement {
            collection: collection.into(),
            documents,
        })
    }

    pub fn delete_many(collection: impl Into<String>, filter: Document) -> Self {
        Self::Delete(DeleteStatement {
            collection: collection.into(),
            filter,
            multi: true,
        })
    }

    pub fn run_command(command: Document) -> Self {
        Self::RunCommand(RunCommandStatement { command })
    }

    pub fn find_one(collection: impl Into<String>, filter: Document, projection: Option<Vec<String>>) -> Self {
        Self::FindOne(FindOneStatement {
            collection: collection.into(),
            filter,
            projection,
        })
    }

    pub fn count(collection: impl Into<String>) -> Self {
        Self::Count(CountStatement {
            collection: collection.into(),
            filter: None,
        })
    }

    pub fn count_where(collection: impl Into<String>, filter: Document) -> Self {
        Self::Count(CountStatement {
            collection: collection.into(),
            filter: Some(filter),
        })
    }

    pub fn aggregate(collection: impl Into<String>, pipeline: Vec<Value>) -> Self {
        Self::Aggregate(AggregateStatement {
            collection: collection.into(),
            pipeline,
        })
    }

    /// Lock replacement carrying only the flag.
    pub fn replace_lock(collection: impl Into<String>, locked: bool) -> Self {
        Self::ReplaceLock(ReplaceLockStatement {
            collection: collection.into(),
            lock_id: 1,
            locked,
            locked_by: None,
            locked_at: None,
        })
    }

    /// Reads the first lock record, projected to `fields`.
    pub fn select_lock<I, S>(collection: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::find_one(collection, Document::new(), Some(fields.into_iter().map(Into::into).collect()))
    }

    /// Sentinel update asking the executor to clear every stored checksum.
    pub fn clear_checksums(collection: impl Into<String>) -> Self {
        let mut set = Document::new();
        set.insert(CLEAR_CHECKSUMS_SENTINEL.to_string(), Value::Null);
        let mut update = Document::new();
        update.insert("$set".to_string(), Value::Object(set));
        Self::Update(UpdateStatement::new(collection, Document::new(), update).multi(true))
    }

    pub fn render(&self) -> String {
        render::render(self)
    }
}

impl From<UpdateStatement> for Statement {
    fn from(statement: UpdateStatement) -> Self {
        Self::Update(statement)
    }
}

impl From<FindStatement> for Statement {
    fn from(statement: FindStatement) -> Self {
        Self::Find(statement)
    }
}

impl From<ReplaceLockStatement> for Statement {
    fn from(statement: ReplaceLockStatement) -> Self {
        Self::ReplaceLock(statement)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
