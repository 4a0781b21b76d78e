use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::Value;

use super::{AdminCommand, DocumentBackend, UpdateOutcome, ok_reply};
use crate::{
    document::{
        Document, ID_FIELD, apply_update, ensure_id, id_key, matches, project, run_pipeline, sort_documents,
        upsert_seed,
    },
    errors::{MigrationError, MigrationResult},
    statement::{AggregateStatement, CountStatement, DeleteStatement, FindStatement, InsertStatement, UpdateStatement},
};

type Collection = BTreeMap<String, Document>;

/// In-process document store.
///
/// Every primitive runs under one mutex, which gives conditional updates the
/// same all-or-nothing behaviour the Lua scripts give on Redis. Collections
/// can be marked as failing to exercise error paths.
#[derive(Default)]
pub struct MemoryBackend {
    collections: Mutex<BTreeMap<String, Collection>>,
    failing: Mutex<HashSet<String>>,
    mutations: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later operation on `collection` fails with a database error.
    pub fn fail_collection(&self, collection: impl Into<String>) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(collection.into());
        }
    }

    pub fn heal_collection(&self, collection: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.remove(collection);
        }
    }

    /// Number of primitive calls that changed stored data.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Copy of every document in `collection`, in id order.
    pub fn snapshot(&self, collection: &str) -> Vec<Document> {
        self.collections
            .lock()
            .map(|c| c.get(collection).map(|docs| docs.values().cloned().collect()).unwrap_or_default())
            .unwrap_or_default()
    }

    fn check(&self, collection: &str) -> MigrationResult<()> {
        let failing = self
            .failing
            .lock()
            .map_err(|_| MigrationError::database("memory backend poisoned"))?;
        if failing.contains(collection) {
            return Err(MigrationError::database(format!("injected failure on {collection}")));
        }
        Ok(())
    }

    fn store(&self) -> MigrationResult<MutexGuard<'_, BTreeMap<String, Collection>>> {
        self.collections
            .lock()
            .map_err(|_| MigrationError::database("memory backend poisoned"))
    }

    fn record_mutation(&self, changed: bool) {
        if changed {
            self.mutations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn read(&self, collection: &str, filter: &Document) -> MigrationResult<Vec<Document>> {
        self.check(collection)?;
        let store = self.store()?;
        Ok(store
            .get(collection)
            .map(|docs| docs.values().filter(|doc| matches(doc, filter)).cloned().collect())
            .unwrap_or_default())
    }
}

impl DocumentBackend for MemoryBackend {
    async fn insert(&self, statement: &InsertStatement) -> MigrationResult<u64> {
        self.check(&statement.collection)?;
        let mut prepared = Vec::with_capacity(statement.documents.len());
        let mut seen = HashSet::new();
        for document in &statement.documents {
            let mut document = document.clone();
            let id = ensure_id(&mut document);
            if !seen.insert(id.clone()) {
                return Err(MigrationError::database(format!("duplicate key: {id}")));
            }
            prepared.push((id, document));
        }

        let mut store = self.store()?;
        let docs = store.entry(statement.collection.clone()).or_default();
        if let Some((id, _)) = prepared.iter().find(|(id, _)| docs.contains_key(id)) {
            return Err(MigrationError::database(format!("duplicate key: {id}")));
        }
        let inserted = prepared.len() as u64;
        docs.extend(prepared);
        drop(store);

        self.record_mutation(inserted > 0);
        Ok(inserted)
    }

    async fn update(&self, statement: &UpdateStatement) -> MigrationResult<UpdateOutcome> {
        self.check(&statement.collection)?;
        let mut store = self.store()?;
        let docs = store.entry(statement.collection.clone()).or_default();
        let mut outcome = UpdateOutcome::default();

        for doc in docs.values_mut() {
            if !matches(doc, &statement.filter) {
                continue;
            }
            outcome.matched += 1;
            let mut updated = doc.clone();
            apply_update(&mut updated, &statement.update, false)?;
            if updated != *doc {
                *doc = updated;
                outcome.modified += 1;
            }
            if !statement.multi {
                break;
            }
        }

        if outcome.matched == 0 && statement.upsert {
            let seed = upsert_seed(&statement.filter, &statement.update)?;
            let id = seed.get(ID_FIELD).map(id_key).unwrap_or_default();
            if !docs.contains_key(&id) {
                docs.insert(id, seed);
                outcome.upserted = true;
            }
        }
        drop(store);

        self.record_mutation(outcome.affected() > 0);
        Ok(outcome)
    }

    async fn delete(&self, statement: &DeleteStatement) -> MigrationResult<u64> {
        self.check(&statement.collection)?;
        let mut store = self.store()?;
        let Some(docs) = store.get_mut(&statement.collection) else {
            return Ok(0);
        };
        let doomed: Vec<String> = docs
            .iter()
            .filter(|(_, doc)| matches(doc, &statement.filter))
            .map(|(id, _)| id.clone())
            .take(if statement.multi { usize::MAX } else { 1 })
            .collect();
        for id in &doomed {
            docs.remove(id);
        }
        drop(store);

        self.record_mutation(!doomed.is_empty());
        Ok(doomed.len() as u64)
    }

    async fn find(&self, statement: &FindStatement) -> MigrationResult<Vec<Document>> {
        let mut docs = self.read(&statement.collection, &statement.filter)?;
        sort_documents(&mut docs, &statement.sort);
        if let Some(limit) = statement.limit {
            docs.truncate(limit as usize);
        }
        if let Some(fields) = &statement.projection {
            docs = docs.iter().map(|doc| project(doc, fields)).collect();
        }
        Ok(docs)
    }

    async fn count(&self, statement: &CountStatement) -> MigrationResult<u64> {
        let filter = statement.filter.clone().unwrap_or_default();
        Ok(self.read(&statement.collection, &filter)?.len() as u64)
    }

    async fn aggregate(&self, statement: &AggregateStatement) -> MigrationResult<Vec<Document>> {
        let docs = self.read(&statement.collection, &Document::new())?;
        run_pipeline(docs, &statement.pipeline)
    }

    async fn run_command(&self, command: &AdminCommand) -> MigrationResult<Document> {
        let mut reply = ok_reply();
        match command {
            AdminCommand::Ping => {}
            AdminCommand::Create(name) => {
                self.check(name)?;
                self.store()?.entry(name.clone()).or_default();
            }
            AdminCommand::Drop(name) => {
                self.check(name)?;
                let dropped = self.store()?.remove(name).is_some();
                self.record_mutation(dropped);
                reply.insert("dropped".to_string(), Value::Bool(dropped));
            }
            AdminCommand::ListCollections => {
                let names: Vec<Value> = self.store()?.keys().cloned().map(Value::String).collect();
                reply.insert("collections".to_string(), Value::Array(names));
            }
            AdminCommand::DropDatabase => {
                let mut store = self.store()?;
                let had_data = !store.is_empty();
                store.clear();
                drop(store);
                self.record_mutation(had_data);
            }
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::doc;
    use serde_json::json;

    fn lock_filter(locked: bool) -> Document {
        doc(json!({"_id": 1, "locked": locked}))
    }

    #[tokio::test]
    async fn conditional_update_matches_once() {
        let backend = MemoryBackend::new();
        backend
            .insert(&InsertStatement {
                collection: "locks".to_string(),
                documents: vec![doc(json!({"_id": 1, "locked": false}))],
            })
            .await
            .unwrap();

        let claim = UpdateStatement::new("locks", lock_filter(false), doc(json!({"$set": {"locked": true}})));
        assert_eq!(backend.update(&claim).await.unwrap().modified, 1);
        assert_eq!(backend.update(&claim).await.unwrap().matched, 0);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected_without_partial_insert() {
        let backend = MemoryBackend::new();
        let first = InsertStatement {
            collection: "users".to_string(),
            documents: vec![doc(json!({"_id": "a"}))],
        };
        backend.insert(&first).await.unwrap();

        let batch = InsertStatement {
            collection: "users".to_string(),
            documents: vec![doc(json!({"_id": "b"})), doc(json!({"_id": "a"}))],
        };
        assert!(backend.insert(&batch).await.is_err());
        assert_eq!(backend.snapshot("users").len(), 1);
    }

    #[tokio::test]
    async fn upsert_inserts_seed_once() {
        let backend = MemoryBackend::new();
        let provision = UpdateStatement::new(
            "locks",
            doc(json!({"_id": 1})),
            doc(json!({"$setOnInsert": {"locked": false}})),
        )
        .upsert(true);
        assert!(backend.update(&provision).await.unwrap().upserted);
        let again = backend.update(&provision).await.unwrap();
        assert!(!again.upserted);
        assert_eq!(again.modified, 0);
        assert_eq!(backend.snapshot("locks"), vec![doc(json!({"_id": 1, "locked": false}))]);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_database_errors() {
        let backend = MemoryBackend::new();
        backend.fail_collection("history");
        let err = backend
            .count(&CountStatement {
                collection: "history".to_string(),
                filter: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Database { .. }));

        backend.heal_collection("history");
        assert!(
            backend
                .count(&CountStatement {
                    collection: "history".to_string(),
                    filter: None,
                })
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn no_op_updates_are_not_mutations() {
        let backend = MemoryBackend::new();
        let unmatched = UpdateStatement::new("locks", lock_filter(true), doc(json!({"$set": {"locked": false}})));
        backend.update(&unmatched).await.unwrap();
        assert_eq!(backend.mutation_count(), 0);
    }

    #[tokio::test]
    async fn admin_commands() {
        let backend = MemoryBackend::new();
        backend.run_command(&AdminCommand::Create("users".to_string())).await.unwrap();
        let listed = backend.run_command(&AdminCommand::ListCollections).await.unwrap();
        assert_eq!(listed["collections"], json!(["users"]));
        let dropped = backend.run_command(&AdminCommand::Drop("users".to_string())).await.unwrap();
        assert_eq!(dropped["dropped"], json!(true));
    }
}
