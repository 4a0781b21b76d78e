use std::sync::Mutex;

use crate::{
    backend::{AdminCommand, DocumentBackend, UpdateOutcome, ok_reply},
    document::{Document, ID_FIELD},
    errors::{MigrationError, MigrationResult},
    history::ChangeLogHistoryService,
    logging::Logger,
    statement::{FindOneStatement, FindStatement, Statement, StatementKind, UpdateStatement},
};

/// Runs statements against a document backend.
///
/// Each statement kind maps to exactly one backend primitive. In dry-run
/// mode mutating statements are rendered and recorded instead of executed;
/// reads still go to the backend.
pub struct Executor<B> {
    backend: B,
    history_collection: String,
    logger: Logger,
    dry_run: Option<Mutex<Vec<String>>>,
}

impl<B> Executor<B>
where
    B: DocumentBackend,
{
    pub fn new(backend: B, history_collection: impl Into<String>, logger: Logger) -> Self {
        Self {
            backend,
            history_collection: history_collection.into(),
            logger,
            dry_run: None,
        }
    }

    /// Record mutating statements instead of running them.
    pub fn with_dry_run(mut self) -> Self {
        self.dry_run = Some(Mutex::new(Vec::new()));
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run.is_some()
    }

    /// Rendered statements recorded so far in dry-run mode.
    pub fn take_rendered(&self) -> Vec<String> {
        self.dry_run
            .as_ref()
            .and_then(|recorded| recorded.lock().ok().map(|mut r| std::mem::take(&mut *r)))
            .unwrap_or_default()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn logger(&self) -> Logger {
        self.logger
    }

    pub fn history_collection(&self) -> &str {
        &self.history_collection
    }

    /// Always true: whether anything is actually written is the caller's call.
    pub fn updates_database(&self) -> bool {
        true
    }

    /// Annotation for humans reading the log; never touches the database.
    pub fn comment(&self, message: &str) {
        self.logger.trace(format_args!("{message}"));
    }

    pub async fn execute(&self, statement: &Statement) -> MigrationResult<()> {
        if statement.kind() == StatementKind::ClearChecksums {
            self.clear_checksums_best_effort().await;
            return Ok(());
        }
        self.dispatch(statement).await.map(|_| ())
    }

    /// Runs a mutating statement and returns the number of affected documents.
    pub async fn update(&self, statement: &Statement) -> MigrationResult<u64> {
        match statement.kind() {
            StatementKind::ClearChecksums => {
                self.clear_checksums_best_effort().await;
                Ok(0)
            }
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete | StatementKind::ReplaceLock => {
                self.dispatch(statement).await
            }
            kind @ (StatementKind::RunCommand
            | StatementKind::FindOne
            | StatementKind::Find
            | StatementKind::Count
            | StatementKind::Aggregate) => Err(invalid("update", kind)),
        }
    }

    pub async fn query_for_object(&self, statement: &Statement) -> MigrationResult<Option<Document>> {
        match statement {
            Statement::FindOne(find) => self.find_one(find).await,
            Statement::Aggregate(aggregate) => {
                self.log_statement(statement);
                Ok(self.backend.aggregate(aggregate).await?.into_iter().next())
            }
            Statement::RunCommand(run) => self.run_command(statement, &run.command).await.map(Some),
            Statement::Insert(_)
            | Statement::Update(_)
            | Statement::Delete(_)
            | Statement::Find(_)
            | Statement::Count(_)
            | Statement::ReplaceLock(_) => Err(invalid("query_for_object", statement.kind())),
        }
    }

    pub async fn query_for_list(&self, statement: &Statement) -> MigrationResult<Vec<Document>> {
        match statement {
            Statement::Find(find) => {
                self.log_statement(statement);
                self.backend.find(find).await
            }
            Statement::FindOne(find) => Ok(self.find_one(find).await?.into_iter().collect()),
            Statement::Aggregate(aggregate) => {
                self.log_statement(statement);
                self.backend.aggregate(aggregate).await
            }
            Statement::Insert(_)
            | Statement::Update(_)
            | Statement::Delete(_)
            | Statement::RunCommand(_)
            | Statement::Count(_)
            | Statement::ReplaceLock(_) => Err(invalid("query_for_list", statement.kind())),
        }
    }

    pub async fn query_for_long(&self, statement: &Statement) -> MigrationResult<i64> {
        let Statement::Count(count) = statement else {
            return Err(invalid("query_for_long", statement.kind()));
        };
        self.log_statement(statement);
        let total = self.backend.count(count).await?;
        i64::try_from(total).map_err(|_| MigrationError::Other {
            message: format!("count {total} does not fit in i64").into(),
        })
    }

    pub async fn query_for_int(&self, statement: &Statement) -> MigrationResult<i32> {
        if !matches!(statement, Statement::Count(_)) {
            return Err(invalid("query_for_int", statement.kind()));
        }
        let total = self.query_for_long(statement).await?;
        i32::try_from(total).map_err(|_| MigrationError::Other {
            message: format!("count {total} does not fit in i32").into(),
        })
    }

    /// Conditional update without clear-checksums routing. The history
    /// service uses this for its own checksum reset.
    pub(crate) async fn apply_update(&self, statement: &UpdateStatement) -> MigrationResult<UpdateOutcome> {
        let rendered = Statement::Update(statement.clone()).render();
        if self.record_dry_run(&rendered) {
            return Ok(UpdateOutcome::default());
        }
        self.logger.debug(format_args!("{rendered}"));
        self.backend.update(statement).await
    }

    async fn dispatch(&self, statement: &Statement) -> MigrationResult<u64> {
        if statement.kind().is_mutating() && !matches!(statement, Statement::RunCommand(_)) {
            if self.record_dry_run(&statement.render()) {
                return Ok(0);
            }
            self.log_statement(statement);
        }

        match statement {
            Statement::Insert(insert) => self.backend.insert(insert).await,
            Statement::Update(update) => Ok(self.backend.update(update).await?.affected()),
            Statement::Delete(delete) => self.backend.delete(delete).await,
            Statement::RunCommand(run) => self.run_command(statement, &run.command).await.map(|_| 0),
            Statement::ReplaceLock(replace) => {
                let mut filter = Document::new();
                filter.insert(ID_FIELD.to_string(), replace.lock_id.into());
                let update = UpdateStatement::new(replace.collection.clone(), filter, replace.replacement()).upsert(true);
                Ok(self.backend.update(&update).await?.affected())
            }
            Statement::FindOne(find) => self.find_one(find).await.map(|_| 0),
            Statement::Find(_) | Statement::Aggregate(_) => self.query_for_list(statement).await.map(|_| 0),
            Statement::Count(_) => self.query_for_long(statement).await.map(|_| 0),
        }
    }

    async fn find_one(&self, find: &FindOneStatement) -> MigrationResult<Option<Document>> {
        self.logger.debug(format_args!("{}", Statement::FindOne(find.clone()).render()));
        let query = FindStatement {
            collection: find.collection.clone(),
            filter: find.filter.clone(),
            projection: find.projection.clone(),
            sort: Vec::new(),
            limit: Some(1),
        };
        Ok(self.backend.find(&query).await?.into_iter().next())
    }

    async fn run_command(&self, statement: &Statement, command: &Document) -> MigrationResult<Document> {
        let command = AdminCommand::parse(command)?;
        if command.is_mutating() && self.record_dry_run(&statement.render()) {
            return Ok(ok_reply());
        }
        self.log_statement(statement);
        self.backend.run_command(&command).await
    }

    /// Checksum clearing piggybacks on an update and must never fail it, so
    /// errors stop here.
    async fn clear_checksums_best_effort(&self) {
        let history = ChangeLogHistoryService::new(self);
        if let Err(err) = history.clear_all_checksums().await {
            self.logger
                .error(format_args!("failed to clear checksums in {}: {err}", self.history_collection));
        }
    }

    fn record_dry_run(&self, rendered: &str) -> bool {
        let Some(recorded) = &self.dry_run else {
            return false;
        };
        if let Ok(mut recorded) = recorded.lock() {
            recorded.push(rendered.to_string());
        }
        true
    }

    fn log_statement(&self, statement: &Statement) {
        self.logger.debug(format_args!("{statement}"));
    }
}

fn invalid(operation: &'static str, kind: StatementKind) -> MigrationError {
    MigrationError::InvalidArgument { operation, kind }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::MemoryBackend, document::doc, logging::capture::CaptureLog};
    use log::Level;
    use serde_json::json;
    use std::sync::Arc;

    const HISTORY: &str = "DATABASECHANGELOG";
    const LOCKS: &str = "DATABASECHANGELOGLOCK";

    fn executor() -> (Executor<Arc<MemoryBackend>>, Arc<MemoryBackend>, &'static CaptureLog) {
        let backend = Arc::new(MemoryBackend::new());
        let sink = CaptureLog::leaked();
        let executor = Executor::new(Arc::clone(&backend), HISTORY, Logger::with_sink("executor", sink));
        (executor, backend, sink)
    }

    #[tokio::test]
    async fn count_and_find_one_projection() {
        let (executor, _, _) = executor();
        executor
            .execute(&Statement::insert_one(
                LOCKS,
                doc(json!({"_id": 1, "locked": true, "lockedBy": "host (1)", "lockedAt": "2024-01-01T00:00:00Z"})),
            ))
            .await
            .unwrap();

        assert_eq!(executor.query_for_long(&Statement::count(LOCKS)).await.unwrap(), 1);
        assert_eq!(executor.query_for_int(&Statement::count(LOCKS)).await.unwrap(), 1);

        let record = executor
            .query_for_object(&Statement::select_lock(LOCKS, ["locked", "lockedBy"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record, doc(json!({"locked": true, "lockedBy": "host (1)"})));
    }

    #[tokio::test]
    async fn unsupported_query_kinds_fail_without_mutation() {
        let (executor, backend, _) = executor();
        let insert = Statement::insert_one("users", doc(json!({"_id": "u1"})));

        let err = executor.query_for_long(&insert).await.unwrap_err();
        assert!(matches!(
            err,
            MigrationError::InvalidArgument {
                operation: "query_for_long",
                kind: StatementKind::Insert
            }
        ));
        assert!(executor.query_for_object(&insert).await.is_err());
        assert!(executor.query_for_list(&insert).await.is_err());
        assert!(executor.query_for_int(&insert).await.is_err());
        assert!(executor.update(&Statement::count("users")).await.is_err());
        assert_eq!(backend.mutation_count(), 0);
        assert!(backend.snapshot("users").is_empty());
    }

    #[tokio::test]
    async fn update_reports_affected_count() {
        let (executor, _, _) = executor();
        executor
            .execute(&Statement::insert_many(
                "users",
                vec![doc(json!({"_id": 1, "active": false})), doc(json!({"_id": 2, "active": false}))],
            ))
            .await
            .unwrap();
        let activate = UpdateStatement::new("users", Document::new(), doc(json!({"$set": {"active": true}}))).multi(true);
        assert_eq!(executor.update(&activate.clone().into()).await.unwrap(), 2);
        assert_eq!(executor.update(&activate.into()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn replace_lock_erases_holder_fields() {
        let (executor, backend, _) = executor();
        executor
            .execute(&Statement::insert_one(
                LOCKS,
                doc(json!({"_id": 1, "locked": true, "lockedBy": "crashed", "lockedAt": "t"})),
            ))
            .await
            .unwrap();
        executor.execute(&Statement::replace_lock(LOCKS, false)).await.unwrap();
        assert_eq!(backend.snapshot(LOCKS), vec![doc(json!({"_id": 1, "locked": false}))]);
    }

    #[tokio::test]
    async fn clear_checksums_routes_to_history() {
        let (executor, backend, _) = executor();
        executor
            .execute(&Statement::insert_one(HISTORY, doc(json!({"_id": "a", "id": "a", "md5sum": "abc"}))))
            .await
            .unwrap();

        assert_eq!(executor.update(&Statement::clear_checksums(HISTORY)).await.unwrap(), 0);
        let rows = backend.snapshot(HISTORY);
        assert!(rows[0].get("md5sum").is_none());
        assert!(rows[0].get("MD5SUM").is_none());
    }

    #[tokio::test]
    async fn clear_checksums_failure_is_logged_not_raised() {
        let (executor, backend, sink) = executor();
        backend.fail_collection(HISTORY);

        executor.execute(&Statement::clear_checksums(HISTORY)).await.unwrap();
        assert_eq!(executor.update(&Statement::clear_checksums(HISTORY)).await.unwrap(), 0);

        let errors = sink.at(Level::Error);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("failed to clear checksums"));
    }

    #[tokio::test]
    async fn comment_only_logs() {
        let (executor, backend, sink) = executor();
        executor.comment("starting changeset 1");
        assert_eq!(sink.at(Level::Trace), vec!["starting changeset 1".to_string()]);
        assert_eq!(backend.mutation_count(), 0);
        assert!(executor.updates_database());
    }

    #[tokio::test]
    async fn dry_run_records_instead_of_writing() {
        let (executor, backend, _) = executor();
        let executor = executor.with_dry_run();
        executor
            .execute(&Statement::insert_one("users", doc(json!({"_id": "u1"}))))
            .await
            .unwrap();
        executor.execute(&Statement::run_command(doc(json!({"drop": "users"})))).await.unwrap();
        assert_eq!(executor.query_for_long(&Statement::count("users")).await.unwrap(), 0);

        assert_eq!(
            executor.take_rendered(),
            vec![
                r#"db.users.insertOne({"_id":"u1"});"#.to_string(),
                r#"db.runCommand({"drop":"users"});"#.to_string(),
            ]
        );
        assert!(executor.take_rendered().is_empty());
        assert_eq!(backend.mutation_count(), 0);
    }

    #[tokio::test]
    async fn run_command_returns_reply() {
        let (executor, _, _) = executor();
        let reply = executor
            .query_for_object(&Statement::run_command(doc(json!({"ping": 1}))))
            .await
            .unwrap();
        assert_eq!(reply, Some(doc(json!({"ok": 1}))));
        assert!(
            executor
                .execute(&Statement::run_command(doc(json!({"fsync": 1}))))
                .await
                .is_err()
        );
    }
}
