//! Applies changelogs under the change log lock.

use std::{future::Future, time::Instant};

use serde::Serialize;

use crate::{
    backend::DocumentBackend,
    changeset::{ChangeLog, ChangeSet},
    config::MigrateConfig,
    errors::{MigrationError, MigrationResult},
    history::{ChangeLogHistoryService, ChangeSetRecord, ExecType, RunStatus},
    id::generate_deployment_id,
    lock::{LockRecord, LockService, LockSettings},
    logging::Logger,
    runtime::Executor,
};

/// Statistics from an update run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStats {
    /// Changesets executed for the first time
    pub applied: u32,
    /// `runAlways` / `runOnChange` changesets executed again
    pub reran: u32,
    /// Already executed and unchanged
    pub skipped: u32,
    /// Excluded by the active contexts
    pub filtered: u32,
    /// Cleared checksums restored from the changelog
    pub repaired: u32,
    pub statements: u64,
    pub deployment_id: String,
    pub total_time_ms: u64,
}

/// Where one changeset stands relative to the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSetStatus {
    pub id: String,
    pub author: String,
    pub status: RunStatus,
    pub in_context: bool,
}

impl ChangeSetStatus {
    pub fn is_pending(&self) -> bool {
        self.in_context && matches!(self.status, RunStatus::NotRan | RunStatus::RunAgain)
    }
}

pub struct MigrationRunner<B> {
    backend: B,
    history_collection: String,
    lock: LockSettings,
    logger: Logger,
}

impl<B> MigrationRunner<B>
where
    B: DocumentBackend + Clone,
{
    pub fn new(backend: B, config: &MigrateConfig, logger: Logger) -> Self {
        Self::from_parts(
            backend,
            config.changelog.history_collection.clone(),
            config.lock_settings(),
            logger,
        )
    }

    pub fn from_parts(backend: B, history_collection: impl Into<String>, lock: LockSettings, logger: Logger) -> Self {
        Self {
            backend,
            history_collection: history_collection.into(),
            lock,
            logger,
        }
    }

    pub fn executor(&self) -> Executor<B> {
        Executor::new(
            self.backend.clone(),
            self.history_collection.clone(),
            self.logger.scoped("snugom_migrate::executor"),
        )
    }

    pub fn lock_service<'e>(&self, executor: &'e Executor<B>) -> LockService<'e, B> {
        LockService::new(executor, self.lock.clone(), self.logger.scoped("snugom_migrate::lock"))
    }

    /// Executes every pending changeset whose contexts match.
    ///
    /// Checksums are validated for the whole changelog before anything runs.
    pub async fn update(&self, changelog: &ChangeLog, contexts: &[String]) -> MigrationResult<MigrationStats> {
        changelog.validate()?;
        let executor = self.executor();
        self.locked(&executor, self.apply(&executor, changelog, contexts)).await
    }

    /// Renders what `update` would execute without writing anything.
    pub async fn update_sql(&self, changelog: &ChangeLog, contexts: &[String]) -> MigrationResult<Vec<String>> {
        changelog.validate()?;
        let lock_executor = self.executor();
        let dry_run = self.executor().with_dry_run();
        self.locked(&lock_executor, self.apply(&dry_run, changelog, contexts)).await?;
        Ok(dry_run.take_rendered())
    }

    pub async fn status(&self, changelog: &ChangeLog, contexts: &[String]) -> MigrationResult<Vec<ChangeSetStatus>> {
        let executor = self.executor();
        let history = ChangeLogHistoryService::new(&executor);
        let mut statuses = Vec::with_capacity(changelog.changesets.len());
        for changeset in &changelog.changesets {
            statuses.push(ChangeSetStatus {
                id: changeset.id.clone(),
                author: changeset.author.clone(),
                status: history.run_status(changeset, &changelog.path).await?,
                in_context: changeset.matches_contexts(contexts),
            });
        }
        Ok(statuses)
    }

    /// Fails with the first checksum mismatch, if any.
    pub async fn validate(&self, changelog: &ChangeLog) -> MigrationResult<()> {
        changelog.validate()?;
        let executor = self.executor();
        let history = ChangeLogHistoryService::new(&executor);
        for changeset in &changelog.changesets {
            check_checksum(&history, changeset, &changelog.path).await?;
        }
        Ok(())
    }

    /// Records the next pending changeset as ran without executing it.
    pub async fn mark_next_changeset_ran(
        &self,
        changelog: &ChangeLog,
        contexts: &[String],
    ) -> MigrationResult<Option<String>> {
        changelog.validate()?;
        let executor = self.executor();
        self.locked(&executor, async {
            let history = ChangeLogHistoryService::new(&executor);
            let deployment_id = generate_deployment_id();
            for changeset in &changelog.changesets {
                if !changeset.matches_contexts(contexts) {
                    continue;
                }
                if history.run_status(changeset, &changelog.path).await? == RunStatus::NotRan {
                    let order = history.next_order_executed().await?;
                    mark(&history, changeset, &changelog.path, order, ExecType::MarkRan, &deployment_id).await?;
                    return Ok(Some(changeset.to_string()));
                }
            }
            Ok::<_, MigrationError>(None)
        })
        .await
    }

    /// Records every pending changeset as ran. Returns how many were marked.
    pub async fn changelog_sync(&self, changelog: &ChangeLog, contexts: &[String]) -> MigrationResult<u32> {
        changelog.validate()?;
        let executor = self.executor();
        self.locked(&executor, async {
            let history = ChangeLogHistoryService::new(&executor);
            let deployment_id = generate_deployment_id();
            let mut order = history.next_order_executed().await?;
            let mut marked = 0;
            for changeset in &changelog.changesets {
                if !changeset.matches_contexts(contexts) {
                    continue;
                }
                if history.run_status(changeset, &changelog.path).await? == RunStatus::NotRan {
                    mark(&history, changeset, &changelog.path, order, ExecType::MarkRan, &deployment_id).await?;
                    order += 1;
                    marked += 1;
                }
            }
            Ok::<_, MigrationError>(marked)
        })
        .await
    }

    /// Drops every stored checksum; the next update stores fresh ones.
    pub async fn clear_checksums(&self) -> MigrationResult<u64> {
        let executor = self.executor();
        let history = ChangeLogHistoryService::new(&executor);
        self.locked(&executor, history.clear_all_checksums()).await
    }

    pub async fn tag(&self, tag: &str) -> MigrationResult<bool> {
        let executor = self.executor();
        let history = ChangeLogHistoryService::new(&executor);
        self.locked(&executor, history.tag(tag)).await
    }

    pub async fn history(&self) -> MigrationResult<Vec<ChangeSetRecord>> {
        let executor = self.executor();
        ChangeLogHistoryService::new(&executor).get_ran_changesets().await
    }

    pub async fn list_locks(&self) -> MigrationResult<Vec<LockRecord>> {
        let executor = self.executor();
        self.lock_service(&executor).list_locks().await
    }

    pub async fn release_locks(&self, slot: Option<i64>) -> MigrationResult<u64> {
        let executor = self.executor();
        self.lock_service(&executor).force_release(slot).await
    }

    /// Runs `work` while holding a lock slot. The slot is released whether or
    /// not `work` succeeds; a failure of `work` wins over a failed release.
    async fn locked<T>(
        &self,
        executor: &Executor<B>,
        work: impl Future<Output = MigrationResult<T>>,
    ) -> MigrationResult<T> {
        let locks = self.lock_service(executor);
        locks.provision().await?;
        let handle = locks.acquire().await?;
        let result = work.await;
        let released = locks.release(&handle).await;
        match (result, released) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(_)) => Err(err),
            (Err(err), Err(release_err)) => {
                self.logger
                    .error(format_args!("failed to release change log lock {}: {release_err}", handle.lock_id));
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        executor: &Executor<B>,
        changelog: &ChangeLog,
        contexts: &[String],
    ) -> MigrationResult<MigrationStats> {
        let started = Instant::now();
        let history = ChangeLogHistoryService::new(executor);
        let mut stats = MigrationStats {
            deployment_id: generate_deployment_id(),
            ..MigrationStats::default()
        };

        let mut plan = Vec::with_capacity(changelog.changesets.len());
        for changeset in &changelog.changesets {
            if !changeset.matches_contexts(contexts) {
                stats.filtered += 1;
                continue;
            }
            let status = history.run_status(changeset, &changelog.path).await?;
            if let RunStatus::ChecksumChanged { stored, current } = status {
                return Err(mismatch(changeset, &changelog.path, stored, current));
            }
            plan.push((changeset, status));
        }

        // Dry runs never write history; orders are counted locally.
        let mut order = history.next_order_executed().await?;
        for (changeset, status) in plan {
            match status {
                RunStatus::AlreadyRan => stats.skipped += 1,
                RunStatus::ChecksumCleared => {
                    history
                        .update_checksum(&changeset.id, &changeset.author, &changelog.path, &changeset.checksum()?)
                        .await?;
                    stats.skipped += 1;
                    stats.repaired += 1;
                }
                RunStatus::NotRan => {
                    stats.statements += run_changeset(executor, changeset).await?;
                    mark(&history, changeset, &changelog.path, order, ExecType::Executed, &stats.deployment_id).await?;
                    order += 1;
                    self.logger.info(format_args!("executed changeset {changeset}"));
                    stats.applied += 1;
                }
                RunStatus::RunAgain => {
                    stats.statements += run_changeset(executor, changeset).await?;
                    mark(&history, changeset, &changelog.path, order, ExecType::Reran, &stats.deployment_id).await?;
                    order += 1;
                    self.logger.info(format_args!("re-executed changeset {changeset}"));
                    stats.reran += 1;
                }
                RunStatus::ChecksumChanged { stored, current } => {
                    return Err(mismatch(changeset, &changelog.path, stored, current));
                }
            }
        }

        stats.total_time_ms = started.elapsed().as_millis() as u64;
        Ok(stats)
    }
}

async fn run_changeset<B: DocumentBackend>(executor: &Executor<B>, changeset: &ChangeSet) -> MigrationResult<u64> {
    executor.comment(&format!("changeset {changeset}"));
    for statement in &changeset.statements {
        executor.execute(statement).await?;
    }
    Ok(changeset.statements.len() as u64)
}

async fn mark<B: DocumentBackend>(
    history: &ChangeLogHistoryService<'_, B>,
    changeset: &ChangeSet,
    path: &str,
    order: i64,
    exec_type: ExecType,
    deployment_id: &str,
) -> MigrationResult<()> {
    let record = ChangeSetRecord::new(changeset, path, order, exec_type, deployment_id)?;
    history.mark_ran(&record).await
}

async fn check_checksum<B: DocumentBackend>(
    history: &ChangeLogHistoryService<'_, B>,
    changeset: &ChangeSet,
    path: &str,
) -> MigrationResult<()> {
    match history.run_status(changeset, path).await? {
        RunStatus::ChecksumChanged { stored, current } => Err(mismatch(changeset, path, stored, current)),
        _ => Ok(()),
    }
}

fn mismatch(changeset: &ChangeSet, path: &str, stored: String, current: String) -> MigrationError {
    MigrationError::ChecksumMismatch {
        id: changeset.id.clone(),
        author: changeset.author.clone(),
        path: path.to_string(),
        stored,
        current,
    }
}
