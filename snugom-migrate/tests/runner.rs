//! End-to-end changelog runs against the in-memory backend.

use serde_json::json;
use snugom_migrate::{
    ChangeLog, ChangeSet, ExecType, Logger, MemoryBackend, MigrationError, MigrationRunner, RunStatus, Statement,
    document::doc,
    lock::LockSettings,
    statement::UpdateStatement,
};
use std::{sync::Arc, time::Duration};

const PATH: &str = "db/changelog.json";

fn runner(backend: &Arc<MemoryBackend>) -> MigrationRunner<Arc<MemoryBackend>> {
    let lock = LockSettings {
        wait_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_millis(5),
        ..LockSettings::default()
    };
    MigrationRunner::from_parts(Arc::clone(backend), "DATABASECHANGELOG", lock, Logger::new("runner_test"))
}

fn seed_users() -> ChangeSet {
    ChangeSet::new(
        "1",
        "alice",
        vec![Statement::insert_many(
            "users",
            vec![
                doc(json!({"_id": "u1", "name": "Ada", "active": false})),
                doc(json!({"_id": "u2", "name": "Brian", "active": false})),
            ],
        )],
    )
}

fn activate_users() -> ChangeSet {
    ChangeSet::new(
        "2",
        "bob",
        vec![Statement::from(
            UpdateStatement::new("users", doc(json!({})), doc(json!({"$set": {"active": true}}))).multi(true),
        )],
    )
}

fn changelog(changesets: Vec<ChangeSet>) -> ChangeLog {
    ChangeLog::new(PATH, changesets)
}

fn no_locks_held(backend: &MemoryBackend) -> bool {
    backend
        .snapshot("DATABASECHANGELOGLOCK")
        .iter()
        .all(|record| record["locked"] == json!(false))
}

#[tokio::test]
async fn update_applies_pending_changesets_once() {
    let backend = Arc::new(MemoryBackend::new());
    let runner = runner(&backend);
    let changelog = changelog(vec![seed_users(), activate_users()]);

    let stats = runner.update(&changelog, &[]).await.unwrap();
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.statements, 2);

    let users = backend.snapshot("users");
    assert!(users.iter().all(|user| user["active"] == json!(true)));

    let history = runner.history().await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].order_executed, 1);
    assert_eq!(history[1].order_executed, 2);
    assert_eq!(history[0].deployment_id, stats.deployment_id);
    assert!(history.iter().all(|row| row.exec_type == ExecType::Executed));

    let again = runner.update(&changelog, &[]).await.unwrap();
    assert_eq!(again.applied, 0);
    assert_eq!(again.skipped, 2);
    assert_eq!(backend.snapshot("users").len(), 2);
    assert!(no_locks_held(&backend));
}

#[tokio::test]
async fn concurrent_runners_execute_each_changeset_once() {
    let backend = Arc::new(MemoryBackend::new());
    let first = runner(&backend);
    let second = runner(&backend);
    let changelog = changelog(vec![seed_users(), activate_users()]);

    let (a, b) = futures::join!(first.update(&changelog, &[]), second.update(&changelog, &[]));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.applied + b.applied, 2);
    assert_eq!(a.skipped + b.skipped, 2);
    assert_eq!(first.history().await.unwrap().len(), 2);
}

#[tokio::test]
async fn edited_changeset_blocks_the_whole_update() {
    let backend = Arc::new(MemoryBackend::new());
    let runner = runner(&backend);
    runner.update(&changelog(vec![seed_users()]), &[]).await.unwrap();

    let mut edited = seed_users();
    edited
        .statements
        .push(Statement::insert_one("users", doc(json!({"_id": "u3", "name": "Cleo"}))));
    let err = runner
        .update(&changelog(vec![edited.clone(), activate_users()]), &[])
        .await
        .unwrap_err();

    match err {
        MigrationError::ChecksumMismatch { id, author, path, .. } => {
            assert_eq!((id.as_str(), author.as_str(), path.as_str()), ("1", "alice", PATH));
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(backend.snapshot("users").iter().all(|user| user["active"] == json!(false)));
    assert_eq!(backend.snapshot("users").len(), 2);
    assert!(no_locks_held(&backend));
    assert!(runner.validate(&changelog(vec![edited])).await.is_err());
}

#[tokio::test]
async fn cleared_checksums_are_repaired_on_update() {
    let backend = Arc::new(MemoryBackend::new());
    let runner = runner(&backend);
    let changelog = changelog(vec![seed_users(), activate_users()]);
    runner.update(&changelog, &[]).await.unwrap();

    assert_eq!(runner.clear_checksums().await.unwrap(), 2);
    assert!(runner.history().await.unwrap().iter().all(|row| row.checksum.is_none()));

    let stats = runner.update(&changelog, &[]).await.unwrap();
    assert_eq!(stats.repaired, 2);
    assert_eq!(stats.applied, 0);

    let history = runner.history().await.unwrap();
    assert_eq!(history[0].checksum, Some(seed_users().checksum().unwrap()));
    runner.validate(&changelog).await.unwrap();
}

#[tokio::test]
async fn run_always_and_run_on_change_rerun() {
    let backend = Arc::new(MemoryBackend::new());
    let runner = runner(&backend);

    let mut touch = ChangeSet::new(
        "touch",
        "ops",
        vec![Statement::from(
            UpdateStatement::new("stats", doc(json!({"_id": "runs"})), doc(json!({"$inc": {"count": 1}}))).upsert(true),
        )],
    );
    touch.run_always = true;
    let log = changelog(vec![touch]);

    runner.update(&log, &[]).await.unwrap();
    let stats = runner.update(&log, &[]).await.unwrap();
    assert_eq!(stats.reran, 1);
    assert_eq!(backend.snapshot("stats")[0]["count"], json!(2));

    let history = runner.history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].exec_type, ExecType::Reran);

    let mut evolving = activate_users();
    evolving.run_on_change = true;
    runner.update(&changelog(vec![evolving.clone()]), &[]).await.unwrap();
    evolving
        .statements
        .push(Statement::delete_many("users", doc(json!({"active": true}))));
    let stats = runner.update(&changelog(vec![evolving]), &[]).await.unwrap();
    assert_eq!(stats.reran, 1);
}

#[tokio::test]
async fn contexts_filter_changesets() {
    let backend = Arc::new(MemoryBackend::new());
    let runner = runner(&backend);
    let mut test_data = seed_users();
    test_data.contexts = vec!["test".to_string()];
    let log = changelog(vec![test_data, activate_users()]);
    let prod = vec!["prod".to_string()];

    let statuses = runner.status(&log, &prod).await.unwrap();
    assert!(!statuses[0].in_context);
    assert!(!statuses[0].is_pending());
    assert!(statuses[1].is_pending());

    let stats = runner.update(&log, &prod).await.unwrap();
    assert_eq!(stats.filtered, 1);
    assert_eq!(stats.applied, 1);
    assert!(backend.snapshot("users").is_empty());
}

#[tokio::test]
async fn update_sql_renders_without_writing() {
    let backend = Arc::new(MemoryBackend::new());
    let runner = runner(&backend);

    let rendered = runner
        .update_sql(&changelog(vec![seed_users()]), &[])
        .await
        .unwrap();
    assert_eq!(
        rendered[0],
        r#"db.users.insertMany([{"_id":"u1","active":false,"name":"Ada"},{"_id":"u2","active":false,"name":"Brian"}]);"#
    );
    assert!(rendered[1].starts_with("db.DATABASECHANGELOG.insertOne("));
    assert!(backend.snapshot("users").is_empty());
    assert!(backend.snapshot("DATABASECHANGELOG").is_empty());
    assert!(no_locks_held(&backend));
}

#[tokio::test]
async fn update_sql_numbers_history_rows_in_sequence() {
    let backend = Arc::new(MemoryBackend::new());
    let runner = runner(&backend);
    runner.update(&changelog(vec![seed_users()]), &[]).await.unwrap();

    let more = ChangeSet::new(
        "3",
        "carol",
        vec![Statement::insert_one("users", doc(json!({"_id": "u3", "name": "Cleo"})))],
    );
    let rendered = runner
        .update_sql(&changelog(vec![seed_users(), activate_users(), more]), &[])
        .await
        .unwrap();

    let history_rows: Vec<&String> = rendered
        .iter()
        .filter(|line| line.starts_with("db.DATABASECHANGELOG.insertOne("))
        .collect();
    assert_eq!(history_rows.len(), 2);
    assert!(history_rows[0].contains(r#""orderExecuted":2"#));
    assert!(history_rows[1].contains(r#""orderExecuted":3"#));
    assert_eq!(runner.history().await.unwrap().len(), 1);
}

#[tokio::test]
async fn sync_and_mark_next_record_without_executing() {
    let backend = Arc::new(MemoryBackend::new());
    let runner = runner(&backend);
    let log = changelog(vec![seed_users(), activate_users()]);

    assert_eq!(
        runner.mark_next_changeset_ran(&log, &[]).await.unwrap().as_deref(),
        Some("1::alice")
    );
    assert_eq!(runner.changelog_sync(&log, &[]).await.unwrap(), 1);
    assert_eq!(runner.mark_next_changeset_ran(&log, &[]).await.unwrap(), None);

    let history = runner.history().await.unwrap();
    assert!(history.iter().all(|row| row.exec_type == ExecType::MarkRan));
    assert!(backend.snapshot("users").is_empty());

    let statuses = runner.status(&log, &[]).await.unwrap();
    assert!(statuses.iter().all(|s| s.status == RunStatus::AlreadyRan));
}

#[tokio::test]
async fn tag_marks_latest_changeset() {
    let backend = Arc::new(MemoryBackend::new());
    let runner = runner(&backend);
    assert!(!runner.tag("v0").await.unwrap());

    runner
        .update(&changelog(vec![seed_users(), activate_users()]), &[])
        .await
        .unwrap();
    assert!(runner.tag("v1").await.unwrap());

    let history = runner.history().await.unwrap();
    assert_eq!(history[0].tag, None);
    assert_eq!(history[1].tag.as_deref(), Some("v1"));
}

#[tokio::test]
async fn stale_lock_times_out_until_force_released() {
    let backend = Arc::new(MemoryBackend::new());
    let quick = MigrationRunner::from_parts(
        Arc::clone(&backend),
        "DATABASECHANGELOG",
        LockSettings {
            wait_timeout: Duration::from_millis(20),
            poll_interval: Duration::from_millis(5),
            ..LockSettings::default()
        },
        Logger::new("runner_test"),
    );

    let executor = quick.executor();
    let crashed = quick.lock_service(&executor).with_holder("deploy-7 (99) #dead");
    crashed.provision().await.unwrap();
    crashed.acquire().await.unwrap();

    let err = quick.update(&changelog(vec![seed_users()]), &[]).await.unwrap_err();
    assert!(err.is_lock_timeout());
    assert!(err.to_string().contains("deploy-7 (99) #dead"));

    let locks = quick.list_locks().await.unwrap();
    assert_eq!(locks[0].locked_by.as_deref(), Some("deploy-7 (99) #dead"));

    quick.release_locks(None).await.unwrap();
    assert_eq!(quick.update(&changelog(vec![seed_users()]), &[]).await.unwrap().applied, 1);
}
