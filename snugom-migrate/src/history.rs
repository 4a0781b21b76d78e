//! Ledger of executed changesets.
//!
//! One document per changeset in the history collection. The document `_id`
//! is `id::author::fileName`, so the store itself enforces uniqueness of the
//! identifying triple.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    backend::DocumentBackend,
    changeset::ChangeSet,
    document::{Document, ID_FIELD, doc},
    errors::MigrationResult,
    runtime::Executor,
    statement::{FindStatement, SortKey, Statement, UpdateStatement},
};

/// Recorded checksum field. Field names are read back across runs and tool
/// versions; do not rename.
pub const CHECKSUM_FIELD: &str = "md5sum";
pub const ORDER_EXECUTED_FIELD: &str = "orderExecuted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecType {
    Executed,
    MarkRan,
    Reran,
}

impl ExecType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Executed => "EXECUTED",
            Self::MarkRan => "MARK_RAN",
            Self::Reran => "RERAN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSetRecord {
    pub id: String,
    pub author: String,
    pub file_name: String,
    #[serde(rename = "md5sum", default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub date_executed: DateTime<Utc>,
    pub order_executed: i64,
    pub exec_type: ExecType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub comments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(rename = "liquibase", default)]
    pub tool_version: String,
    #[serde(default)]
    pub contexts: String,
    #[serde(default)]
    pub labels: String,
    #[serde(default)]
    pub deployment_id: String,
}

impl ChangeSetRecord {
    pub fn new(
        changeset: &ChangeSet,
        path: &str,
        order_executed: i64,
        exec_type: ExecType,
        deployment_id: &str,
    ) -> MigrationResult<Self> {
        Ok(Self {
            id: changeset.id.clone(),
            author: changeset.author.clone(),
            file_name: path.to_string(),
            checksum: Some(changeset.checksum()?),
            date_executed: Utc::now(),
            order_executed,
            exec_type,
            description: changeset.summary(),
            comments: changeset.comments.clone(),
            tag: None,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            contexts: changeset.contexts.join(","),
            labels: changeset.labels.join(","),
            deployment_id: deployment_id.to_string(),
        })
    }

    pub fn key(&self) -> String {
        record_key(&self.id, &self.author, &self.file_name)
    }

    fn to_document(&self) -> MigrationResult<Document> {
        let mut document = doc(serde_json::to_value(self)?);
        document.insert(ID_FIELD.to_string(), Value::String(self.key()));
        Ok(document)
    }
}

pub fn record_key(id: &str, author: &str, path: &str) -> String {
    format!("{id}::{author}::{path}")
}

/// How a changeset relates to its recorded history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotRan,
    AlreadyRan,
    /// `runAlways`, or `runOnChange` with a changed checksum.
    RunAgain,
    /// Recorded checksum was cleared; repair by storing the current one.
    ChecksumCleared,
    ChecksumChanged { stored: String, current: String },
}

pub struct ChangeLogHistoryService<'e, B> {
    executor: &'e Executor<B>,
}

impl<'e, B> ChangeLogHistoryService<'e, B>
where
    B: DocumentBackend,
{
    pub fn new(executor: &'e Executor<B>) -> Self {
        Self { executor }
    }

    pub fn collection(&self) -> &str {
        self.executor.history_collection()
    }

    /// Executed changesets in execution order.
    pub async fn get_ran_changesets(&self) -> MigrationResult<Vec<ChangeSetRecord>> {
        let find = FindStatement {
            collection: self.collection().to_string(),
            filter: Document::new(),
            projection: None,
            sort: vec![SortKey::asc(ORDER_EXECUTED_FIELD)],
            limit: None,
        };
        let rows = self.executor.query_for_list(&find.into()).await?;
        rows.into_iter()
            .map(|row| serde_json::from_value(Value::Object(row)).map_err(Into::into))
            .collect()
    }

    pub async fn ran_changeset(&self, id: &str, author: &str, path: &str) -> MigrationResult<Option<ChangeSetRecord>> {
        let statement = Statement::find_one(self.collection(), key_filter(id, author, path), None);
        match self.executor.query_for_object(&statement).await? {
            Some(row) => Ok(Some(serde_json::from_value(Value::Object(row))?)),
            None => Ok(None),
        }
    }

    pub async fn has_been_run(&self, id: &str, author: &str, path: &str) -> MigrationResult<bool> {
        let statement = Statement::count_where(self.collection(), key_filter(id, author, path));
        Ok(self.executor.query_for_long(&statement).await? > 0)
    }

    pub async fn count(&self) -> MigrationResult<i64> {
        self.executor.query_for_long(&Statement::count(self.collection())).await
    }

    pub async fn next_order_executed(&self) -> MigrationResult<i64> {
        let statement = Statement::aggregate(
            self.collection(),
            vec![
                json!({"$sort": {ORDER_EXECUTED_FIELD: -1}}),
                json!({"$limit": 1}),
                json!({"$project": {ORDER_EXECUTED_FIELD: 1}}),
            ],
        );
        let last = self
            .executor
            .query_for_object(&statement)
            .await?
            .and_then(|row| row.get(ORDER_EXECUTED_FIELD).and_then(Value::as_i64))
            .unwrap_or(0);
        Ok(last + 1)
    }

    /// Inserts a new row, or replaces the existing row of a re-run changeset.
    pub async fn mark_ran(&self, record: &ChangeSetRecord) -> MigrationResult<()> {
        let document = record.to_document()?;
        let exists = record.exec_type == ExecType::Reran
            || self.has_been_run(&record.id, &record.author, &record.file_name).await?;
        if exists {
            let replace = UpdateStatement::new(
                self.collection(),
                key_filter(&record.id, &record.author, &record.file_name),
                document,
            )
            .upsert(true);
            self.executor.update(&replace.into()).await?;
        } else {
            self.executor
                .execute(&Statement::insert_one(self.collection(), document))
                .await?;
        }
        Ok(())
    }

    /// Stores `checksum` for a recorded changeset. Returns whether a row matched.
    pub async fn update_checksum(&self, id: &str, author: &str, path: &str, checksum: &str) -> MigrationResult<bool> {
        let update = UpdateStatement::new(
            self.collection(),
            key_filter(id, author, path),
            doc(json!({"$set": {CHECKSUM_FIELD: checksum}})),
        );
        Ok(self.executor.update(&update.into()).await? > 0)
    }

    pub async fn remove_ran_status(&self, id: &str, author: &str, path: &str) -> MigrationResult<bool> {
        let mut delete = Statement::delete_many(self.collection(), key_filter(id, author, path));
        if let Statement::Delete(inner) = &mut delete {
            inner.multi = false;
        }
        Ok(self.executor.update(&delete).await? > 0)
    }

    /// Tags the most recently executed changeset. False when history is empty.
    pub async fn tag(&self, tag: &str) -> MigrationResult<bool> {
        let find = FindStatement {
            collection: self.collection().to_string(),
            filter: Document::new(),
            projection: Some(vec![ID_FIELD.to_string()]),
            sort: vec![SortKey::desc(ORDER_EXECUTED_FIELD)],
            limit: Some(1),
        };
        let Some(last) = self.executor.query_for_list(&find.into()).await?.into_iter().next() else {
            return Ok(false);
        };
        let Some(id) = last.get(ID_FIELD).cloned() else {
            return Ok(false);
        };
        let mut filter = Document::new();
        filter.insert(ID_FIELD.to_string(), id);
        let update = UpdateStatement::new(self.collection(), filter, doc(json!({"$set": {"tag": tag}})));
        self.executor.update(&update.into()).await?;
        Ok(true)
    }

    /// Drops every stored checksum so the next validation recomputes them.
    ///
    /// Goes straight to the executor's update primitive: this is the target
    /// of the clear-checksums route and must not re-enter it.
    pub async fn clear_all_checksums(&self) -> MigrationResult<u64> {
        let update = UpdateStatement::new(
            self.collection(),
            Document::new(),
            doc(json!({"$unset": {CHECKSUM_FIELD: ""}})),
        )
        .multi(true);
        Ok(self.executor.apply_update(&update).await?.modified)
    }

    pub async fn run_status(&self, changeset: &ChangeSet, path: &str) -> MigrationResult<RunStatus> {
        let Some(record) = self.ran_changeset(&changeset.id, &changeset.author, path).await? else {
            return Ok(RunStatus::NotRan);
        };
        if changeset.run_always {
            return Ok(RunStatus::RunAgain);
        }
        let current = changeset.checksum()?;
        Ok(match record.checksum {
            None => RunStatus::ChecksumCleared,
            Some(stored) if stored == current => RunStatus::AlreadyRan,
            Some(_) if changeset.run_on_change => RunStatus::RunAgain,
            Some(stored) => RunStatus::ChecksumChanged { stored, current },
        })
    }
}

fn key_filter(id: &str, author: &str, path: &str) -> Document {
    let mut filter = Document::new();
    filter.insert(ID_FIELD.to_string(), Value::String(record_key(id, author, path)));
    filter
}
