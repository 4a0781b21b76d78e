use serde_json::Value;

use super::{SortKey, SortOrder, Statement, REPLACE_LOCK_COMMAND};
use crate::document::{is_operator_update, Document};

pub(super) fn render(statement: &Statement) -> String {
    match statement {
        Statement::Insert(s) => {
            if let [single] = s.documents.as_slice() {
                call(&s.collection, "insertOne", &[json_doc(single)])
            } else {
                let docs: Vec<String> = s.documents.iter().map(json_doc).collect();
                call(&s.collection, "insertMany", &[format!("[{}]", docs.join(","))])
            }
        }
        Statement::Update(s) => {
            let operation = match (is_operator_update(&s.update), s.multi) {
                (false, _) => "replaceOne",
                (true, true) => "updateMany",
                (true, false) => "updateOne",
            };
            let mut args = vec![json_doc(&s.filter), json_doc(&s.update)];
            if s.upsert {
                args.push(r#"{"upsert":true}"#.to_string());
            }
            call(&s.collection, operation, &args)
        }
        Statement::Delete(s) => {
            let operation = if s.multi { "deleteMany" } else { "deleteOne" };
            call(&s.collection, operation, &[json_doc(&s.filter)])
        }
        Statement::RunCommand(s) => format!("db.runCommand({});", json_doc(&s.command)),
        Statement::FindOne(s) => {
            let mut args = vec![json_doc(&s.filter)];
            if let Some(fields) = &s.projection {
                args.push(field_spec(fields.iter().map(|f| (f.as_str(), 1))));
            }
            call(&s.collection, "findOne", &args)
        }
        Statement::Find(s) => {
            let mut args = vec![json_doc(&s.filter)];
            if let Some(fields) = &s.projection {
                args.push(field_spec(fields.iter().map(|f| (f.as_str(), 1))));
            }
            let mut out = format!("db.{}.find({})", s.collection, args.join(", "));
            if !s.sort.is_empty() {
                out.push_str(&format!(".sort({})", sort_spec(&s.sort)));
            }
            if let Some(limit) = s.limit {
                out.push_str(&format!(".limit({limit})"));
            }
            out.push(';');
            out
        }
        Statement::Count(s) => {
            let filter = s.filter.as_ref().map_or_else(|| "null".to_string(), json_doc);
            call(&s.collection, "countDocuments", &[filter])
        }
        Statement::Aggregate(s) => {
            let pipeline = Value::Array(s.pipeline.clone()).to_string();
            call(&s.collection, "aggregate", &[pipeline])
        }
        Statement::ReplaceLock(s) => call(&s.collection, REPLACE_LOCK_COMMAND, &[s.locked.to_string()]),
    }
}

fn call(collection: &str, operation: &str, args: &[String]) -> String {
    format!("db.{collection}.{operation}({});", args.join(", "))
}

fn json_doc(doc: &Document) -> String {
    Value::Object(doc.clone()).to_string()
}

/// `{"a":1,"b":-1}` in the caller's order, which a map would not keep.
fn field_spec<'a>(fields: impl Iterator<Item = (&'a str, i8)>) -> String {
    let parts: Vec<String> = fields
        .map(|(field, dir)| format!("{}:{dir}", Value::String(field.to_string())))
        .collect();
    format!("{{{}}}", parts.join(","))
}

fn sort_spec(keys: &[SortKey]) -> String {
    field_spec(keys.iter().map(|k| {
        (
            k.field.as_str(),
            match k.order {
                SortOrder::Asc => 1,
                SortOrder::Desc => -1,
            },
        )
    }))
}
