use std::collections::BTreeMap;

use redis::aio::ConnectionManager;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{AdminCommand, DocumentBackend, UpdateOutcome, ok_reply};
use crate::{
    document::{
        Document, ID_FIELD, ensure_id, id_key, matches, project, run_pipeline, sort_documents, upsert_seed,
    },
    errors::{MigrationError, MigrationResult},
    keys::KeyContext,
    runtime::scripts::{DELETE_DOCUMENTS_SCRIPT, INSERT_DOCUMENTS_SCRIPT, UPDATE_DOCUMENTS_SCRIPT},
    statement::{AggregateStatement, CountStatement, DeleteStatement, FindStatement, InsertStatement, UpdateStatement},
};

const SCAN_COUNT: usize = 1000;

/// Redis-backed document store.
///
/// Each collection is a hash at `{prefix}:{collection}` mapping document ids
/// to JSON. Writes run as Lua scripts so filter evaluation and mutation are a
/// single atomic step on the server.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    prefix: String,
}

#[derive(Deserialize)]
struct ScriptOutcome {
    matched: u64,
    modified: u64,
    upserted: bool,
}

impl RedisBackend {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    pub async fn connect(url: &str, prefix: impl Into<String>) -> MigrationResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, prefix))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, collection: &str) -> String {
        KeyContext::new(&self.prefix).collection(collection)
    }

    /// Documents matching `filter`, in id order.
    async fn read(&self, collection: &str, filter: &Document) -> MigrationResult<Vec<Document>> {
        let mut conn = self.conn.clone();
        let key = self.key(collection);

        let raw: BTreeMap<String, String> = match filter.get(ID_FIELD) {
            Some(id) if !id.is_object() && !id.is_array() => {
                let field = id_key(id);
                let found: Option<String> = redis::cmd("HGET").arg(&key).arg(&field).query_async(&mut conn).await?;
                found.into_iter().map(|json| (field.clone(), json)).collect()
            }
            _ => redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await?,
        };

        let mut docs = Vec::with_capacity(raw.len());
        for json in raw.into_values() {
            let doc: Document = serde_json::from_str(&json)?;
            if matches(&doc, filter) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    async fn collection_keys(&self) -> MigrationResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = KeyContext::new(&self.prefix).collection_pattern();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            found.extend(keys);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        found.sort();
        found.dedup();
        Ok(found)
    }
}

impl DocumentBackend for RedisBackend {
    async fn insert(&self, statement: &InsertStatement) -> MigrationResult<u64> {
        if statement.documents.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut invocation = INSERT_DOCUMENTS_SCRIPT.prepare_invoke();
        invocation.key(self.key(&statement.collection));
        for document in &statement.documents {
            let mut document = document.clone();
            let id = ensure_id(&mut document);
            invocation.arg(id);
            invocation.arg(serde_json::to_string(&document)?);
        }
        let inserted: u64 = invocation.invoke_async(&mut conn).await?;
        Ok(inserted)
    }

    async fn update(&self, statement: &UpdateStatement) -> MigrationResult<UpdateOutcome> {
        let (seed_id, seed) = if statement.upsert {
            let seed = upsert_seed(&statement.filter, &statement.update)?;
            let id = seed.get(ID_FIELD).map(id_key);
            (id, Some(serde_json::to_string(&seed)?))
        } else {
            (None, None)
        };
        let request = json!({
            "filter": statement.filter,
            "update": statement.update,
            "multi": statement.multi,
            "seed_id": seed_id,
            "seed": seed,
        });

        let mut conn = self.conn.clone();
        let mut invocation = UPDATE_DOCUMENTS_SCRIPT.prepare_invoke();
        invocation.key(self.key(&statement.collection));
        invocation.arg(request.to_string());
        let raw: String = invocation.invoke_async(&mut conn).await?;

        let outcome: ScriptOutcome = serde_json::from_str(&raw).map_err(|err| MigrationError::Other {
            message: format!("failed to parse lua response: {err}").into(),
        })?;
        Ok(UpdateOutcome {
            matched: outcome.matched,
            modified: outcome.modified,
            upserted: outcome.upserted,
        })
    }

    async fn delete(&self, statement: &DeleteStatement) -> MigrationResult<u64> {
        let request = json!({"filter": statement.filter, "multi": statement.multi});
        let mut conn = self.conn.clone();
        let mut invocation = DELETE_DOCUMENTS_SCRIPT.prepare_invoke();
        invocation.key(self.key(&statement.collection));
        invocation.arg(request.to_string());
        let deleted: u64 = invocation.invoke_async(&mut conn).await?;
        Ok(deleted)
    }

    async fn find(&self, statement: &FindStatement) -> MigrationResult<Vec<Document>> {
        let mut docs = self.read(&statement.collection, &statement.filter).await?;
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
        match &statement.filter {
            Some(filter) if !filter.is_empty() => Ok(self.read(&statement.collection, filter).await?.len() as u64),
            _ => {
                let mut conn = self.conn.clone();
                let len: u64 = redis::cmd("HLEN")
                    .arg(self.key(&statement.collection))
                    .query_async(&mut conn)
                    .await?;
                Ok(len)
            }
        }
    }

    async fn aggregate(&self, statement: &AggregateStatement) -> MigrationResult<Vec<Document>> {
        let docs = self.read(&statement.collection, &Document::new()).await?;
        run_pipeline(docs, &statement.pipeline)
    }

    async fn run_command(&self, command: &AdminCommand) -> MigrationResult<Document> {
        let mut conn = self.conn.clone();
        let mut reply = ok_reply();
        match command {
            AdminCommand::Ping => {
                let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            }
            // Hashes exist only while they hold a field; nothing to create.
            AdminCommand::Create(_) => {}
            AdminCommand::Drop(name) => {
                let removed: u64 = redis::cmd("DEL").arg(self.key(name)).query_async(&mut conn).await?;
                reply.insert("dropped".to_string(), Value::Bool(removed > 0));
            }
            AdminCommand::ListCollections => {
                let context = KeyContext::new(&self.prefix);
                let names: Vec<Value> = self
                    .collection_keys()
                    .await?
                    .iter()
                    .filter_map(|key| context.collection_name(key))
                    .map(|name| Value::String(name.to_string()))
                    .collect();
                reply.insert("collections".to_string(), Value::Array(names));
            }
            AdminCommand::DropDatabase => {
                let keys = self.collection_keys().await?;
                if !keys.is_empty() {
                    let _: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                }
            }
        }
        Ok(reply)
    }
}
