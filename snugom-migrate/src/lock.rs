//! Change log lock.
//!
//! Each slot is one record in the lock collection. Acquisition is a single
//! conditional update `{_id, locked: false} -> {locked: true, ...}` so that of
//! any number of concurrent contenders exactly one sees a modified record.

use std::{
    ops::RangeInclusive,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    backend::DocumentBackend,
    document::{Document, ID_FIELD, doc},
    errors::{MigrationError, MigrationResult},
    id::generate_holder_identity,
    logging::Logger,
    runtime::Executor,
    statement::{FindStatement, ReplaceLockStatement, SortKey, UpdateStatement},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    #[serde(rename = "_id")]
    pub id: i64,
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<String>,
}

/// Proof of a held slot. Pass it back to [`LockService::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub lock_id: i64,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSettings {
    pub collection: String,
    pub slots: u32,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            collection: "DATABASECHANGELOGLOCK".to_string(),
            slots: 1,
            wait_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
        }
    }
}

impl LockSettings {
    /// Slot ids, starting at 1.
    pub fn slot_ids(&self) -> RangeInclusive<i64> {
        1..=i64::from(self.slots.max(1))
    }
}

pub struct LockService<'e, B> {
    executor: &'e Executor<B>,
    settings: LockSettings,
    holder: String,
    logger: Logger,
}

impl<'e, B> LockService<'e, B>
where
    B: DocumentBackend,
{
    pub fn new(executor: &'e Executor<B>, settings: LockSettings, logger: Logger) -> Self {
        Self {
            executor,
            settings,
            holder: generate_holder_identity(),
            logger,
        }
    }

    /// Uses a fixed holder identity instead of a generated one.
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Creates missing slot records in the unlocked state. Existing records,
    /// held or not, are left alone.
    pub async fn provision(&self) -> MigrationResult<()> {
        for slot in self.settings.slot_ids() {
            let provision = UpdateStatement::new(
                self.settings.collection.clone(),
                slot_filter(slot),
                doc(json!({"$setOnInsert": {"locked": false}})),
            )
            .upsert(true);
            self.executor.update(&provision.into()).await?;
        }
        Ok(())
    }

    /// One pass over the slots.
    pub async fn try_acquire(&self) -> MigrationResult<Option<LockHandle>> {
        for slot in self.settings.slot_ids() {
            let acquired_at = Utc::now();
            let mut filter = slot_filter(slot);
            filter.insert("locked".to_string(), Value::Bool(false));
            let claim = UpdateStatement::new(
                self.settings.collection.clone(),
                filter,
                doc(json!({"$set": {
                    "locked": true,
                    "lockedBy": self.holder,
                    "lockedAt": acquired_at.to_rfc3339(),
                }})),
            );
            if self.executor.update(&claim.into()).await? > 0 {
                self.logger
                    .info(format_args!("acquired change log lock {slot} as {}", self.holder));
                return Ok(Some(LockHandle {
                    lock_id: slot,
                    holder: self.holder.clone(),
                    acquired_at,
                }));
            }
        }
        Ok(None)
    }

    /// Retries until a slot is won or the wait timeout elapses.
    pub async fn acquire(&self) -> MigrationResult<LockHandle> {
        let started = Instant::now();
        loop {
            if let Some(handle) = self.try_acquire().await? {
                return Ok(handle);
            }
            let waited = started.elapsed();
            if waited >= self.settings.wait_timeout {
                let slots = self.settings.slot_ids();
                let held = self
                    .list_locks()
                    .await?
                    .into_iter()
                    .find(|record| record.locked && slots.contains(&record.id));
                let (lock_id, held_by) = match held {
                    Some(record) => (record.id, record.locked_by),
                    None => (*slots.start(), None),
                };
                return Err(MigrationError::LockTimeout {
                    lock_id,
                    waited,
                    held_by,
                });
            }
            let pause = self.settings.poll_interval.min(self.settings.wait_timeout - waited);
            self.logger.debug(format_args!(
                "change log lock busy; retrying in {}ms",
                pause.as_millis()
            ));
            tokio::time::sleep(pause).await;
        }
    }

    /// Releases a slot held by `handle`. Returns false, without writing, when
    /// the slot is no longer held by that holder.
    pub async fn release(&self, handle: &LockHandle) -> MigrationResult<bool> {
        let mut filter = slot_filter(handle.lock_id);
        filter.insert("locked".to_string(), Value::Bool(true));
        filter.insert("lockedBy".to_string(), Value::String(handle.holder.clone()));
        let release = UpdateStatement::new(
            self.settings.collection.clone(),
            filter,
            doc(json!({
                "$set": {"locked": false},
                "$unset": {"lockedBy": "", "lockedAt": ""},
            })),
        );
        let released = self.executor.update(&release.into()).await? > 0;
        if released {
            self.logger
                .info(format_args!("released change log lock {}", handle.lock_id));
        } else {
            self.logger.warn(format_args!(
                "change log lock {} was not held by {}",
                handle.lock_id, handle.holder
            ));
        }
        Ok(released)
    }

    /// Unlocks regardless of holder. `None` resets every configured slot.
    /// Slots outside the configured range are rejected, never created.
    pub async fn force_release(&self, slot: Option<i64>) -> MigrationResult<u64> {
        let slots: Vec<i64> = match slot {
            Some(slot) if !self.settings.slot_ids().contains(&slot) => {
                return Err(MigrationError::UnknownLockSlot {
                    lock_id: slot,
                    slots: self.settings.slots.max(1),
                });
            }
            Some(slot) => vec![slot],
            None => self.settings.slot_ids().collect(),
        };
        let mut affected = 0;
        for lock_id in slots {
            let replace = ReplaceLockStatement {
                collection: self.settings.collection.clone(),
                lock_id,
                locked: false,
                locked_by: None,
                locked_at: None,
            };
            affected += self.executor.update(&replace.into()).await?;
            self.logger.warn(format_args!("force released change log lock {lock_id}"));
        }
        Ok(affected)
    }

    pub async fn list_locks(&self) -> MigrationResult<Vec<LockRecord>> {
        let find = FindStatement {
            collection: self.settings.collection.clone(),
            filter: Document::new(),
            projection: None,
            sort: vec![SortKey::asc(ID_FIELD)],
            limit: None,
        };
        self.executor
            .query_for_list(&find.into())
            .await?
            .into_iter()
            .map(|row| serde_json::from_value(Value::Object(row)).map_err(Into::into))
            .collect()
    }
}

fn slot_filter(slot: i64) -> Document {
    let mut filter = Document::new();
    filter.insert(ID_FIELD.to_string(), Value::from(slot));
    filter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use futures::future::join_all;
    use std::sync::Arc;

    fn settings(wait_ms: u64) -> LockSettings {
        LockSettings {
            wait_timeout: Duration::from_millis(wait_ms),
            poll_interval: Duration::from_millis(5),
            ..LockSettings::default()
        }
    }

    fn executor(backend: &Arc<MemoryBackend>) -> Executor<Arc<MemoryBackend>> {
        Executor::new(Arc::clone(backend), "DATABASECHANGELOG", Logger::new("lock"))
    }

    #[tokio::test]
    async fn provision_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let executor = executor(&backend);
        let locks = LockService::new(&executor, LockSettings { slots: 2, ..settings(10) }, Logger::new("lock"));

        locks.provision().await.unwrap();
        let handle = locks.try_acquire().await.unwrap().unwrap();
        locks.provision().await.unwrap();

        let records = locks.list_locks().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].locked);
        assert_eq!(records[0].locked_by.as_deref(), Some(handle.holder.as_str()));
        assert!(!records[1].locked);
    }

    #[tokio::test]
    async fn exactly_one_contender_wins() {
        let backend = Arc::new(MemoryBackend::new());
        let executor = executor(&backend);
        let services: Vec<_> = (0..5)
            .map(|_| LockService::new(&executor, settings(30), Logger::new("lock")))
            .collect();
        services[0].provision().await.unwrap();

        let results = join_all(services.iter().map(|s| s.acquire())).await;
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        for err in results.into_iter().filter_map(Result::err) {
            assert!(err.is_lock_timeout());
        }
    }

    #[tokio::test]
    async fn timeout_names_current_holder() {
        let backend = Arc::new(MemoryBackend::new());
        let executor = executor(&backend);
        let first = LockService::new(&executor, settings(20), Logger::new("lock")).with_holder("build-01 (7) #a");
        let second = LockService::new(&executor, settings(20), Logger::new("lock"));
        first.provision().await.unwrap();
        first.acquire().await.unwrap();

        match second.acquire().await.unwrap_err() {
            MigrationError::LockTimeout { lock_id, waited, held_by } => {
                assert_eq!(lock_id, 1);
                assert!(waited >= Duration::from_millis(20));
                assert_eq!(held_by.as_deref(), Some("build-01 (7) #a"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn waiter_wins_after_release() {
        let backend = Arc::new(MemoryBackend::new());
        let executor = executor(&backend);
        let first = LockService::new(&executor, settings(1_000), Logger::new("lock"));
        let second = LockService::new(&executor, settings(1_000), Logger::new("lock"));
        first.provision().await.unwrap();
        let handle = first.acquire().await.unwrap();

        let release_later = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            first.release(&handle).await
        };
        let (released, acquired) = futures::join!(release_later, second.acquire());
        assert!(released.unwrap());
        assert_eq!(acquired.unwrap().holder, second.holder());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let executor = executor(&backend);
        let locks = LockService::new(&executor, settings(10), Logger::new("lock"));
        locks.provision().await.unwrap();
        let handle = locks.acquire().await.unwrap();

        assert!(locks.release(&handle).await.unwrap());
        let mutations = backend.mutation_count();
        assert!(!locks.release(&handle).await.unwrap());
        assert_eq!(backend.mutation_count(), mutations);

        let record = &locks.list_locks().await.unwrap()[0];
        assert_eq!(record, &LockRecord {
            id: 1,
            locked: false,
            locked_by: None,
            locked_at: None,
        });
    }

    #[tokio::test]
    async fn release_by_other_holder_does_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        let executor = executor(&backend);
        let owner = LockService::new(&executor, settings(10), Logger::new("lock"));
        let intruder = LockService::new(&executor, settings(10), Logger::new("lock"));
        owner.provision().await.unwrap();
        let handle = owner.acquire().await.unwrap();

        let forged = LockHandle {
            holder: intruder.holder().to_string(),
            ..handle
        };
        assert!(!intruder.release(&forged).await.unwrap());
        assert!(owner.list_locks().await.unwrap()[0].locked);
    }

    #[tokio::test]
    async fn force_release_recovers_crashed_holder() {
        let backend = Arc::new(MemoryBackend::new());
        let executor = executor(&backend);
        let crashed = LockService::new(&executor, settings(10), Logger::new("lock"));
        crashed.provision().await.unwrap();
        crashed.acquire().await.unwrap();

        let operator = LockService::new(&executor, settings(10), Logger::new("lock"));
        assert!(operator.try_acquire().await.unwrap().is_none());
        operator.force_release(None).await.unwrap();

        let record = &operator.list_locks().await.unwrap()[0];
        assert!(!record.locked);
        assert!(record.locked_by.is_none() && record.locked_at.is_none());
        assert!(operator.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn timeout_reports_slot_of_named_holder() {
        let backend = Arc::new(MemoryBackend::new());
        let executor = executor(&backend);
        let two_slots = || LockSettings { slots: 2, ..settings(20) };
        let a = LockService::new(&executor, two_slots(), Logger::new("lock")).with_holder("a");
        let b = LockService::new(&executor, two_slots(), Logger::new("lock")).with_holder("b");
        let late = LockService::new(&executor, two_slots(), Logger::new("lock"));
        a.provision().await.unwrap();
        let first = a.acquire().await.unwrap();
        assert_eq!(b.acquire().await.unwrap().lock_id, 2);
        assert!(a.release(&first).await.unwrap());
        // Slot 1 goes to a new holder; slot 2 stays with b.
        let c = LockService::new(&executor, two_slots(), Logger::new("lock")).with_holder("c");
        assert_eq!(c.acquire().await.unwrap().lock_id, 1);

        let MigrationError::LockTimeout { lock_id, held_by, .. } = late.acquire().await.unwrap_err() else {
            panic!("expected a lock timeout");
        };
        let records = late.list_locks().await.unwrap();
        let record = records.iter().find(|record| record.id == lock_id).unwrap();
        assert!(record.locked);
        assert_eq!(record.locked_by, held_by);
        assert_eq!((lock_id, held_by.as_deref()), (1, Some("c")));
    }

    #[tokio::test]
    async fn force_release_rejects_unconfigured_slot() {
        let backend = Arc::new(MemoryBackend::new());
        let executor = executor(&backend);
        let locks = LockService::new(&executor, settings(10), Logger::new("lock"));
        locks.provision().await.unwrap();

        for slot in [0, 99] {
            let err = locks.force_release(Some(slot)).await.unwrap_err();
            assert!(matches!(err, MigrationError::UnknownLockSlot { lock_id, slots: 1 } if lock_id == slot));
        }
        let records = locks.list_locks().await.unwrap();
        assert_eq!(records.iter().map(|record| record.id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(locks.force_release(Some(1)).await.unwrap(), 0);
    }
}
