//! Migration and seed runs end to end on the memory drivers.

use std::sync::Arc;

use dbkit_core::config::DbkitConfig;
use dbkit_core::driver::{AppliedMigration, Connection, Database, Lock};
use dbkit_core::error::DbkitError;
use dbkit_core::Store;
use dbkit_core::registry::{DatabaseRegistry, SourceRegistry};
use dbkit_runtime::db::MemoryServer;
use dbkit_runtime::source::MemorySourceStore;
use dbkit_runtime::{Direction, MigrationRunner, SeedRunner};
use tokio_util::sync::CancellationToken;

const CONFIG: &str = r#"
[active]
database = "main"

[active.source]
seeds = "seeds"

[active.source.migrations]
up = "up"
down = "down"

[databases.main]
driver = "memory"

[sources.up]
driver = "memory-up"

[sources.down]
driver = "memory-down"

[sources.seeds]
driver = "memory-seeds"
"#;

struct Harness {
    server: Arc<MemoryServer>,
    up: Arc<MemorySourceStore>,
    down: Arc<MemorySourceStore>,
    seeds: Arc<MemorySourceStore>,
    migrations: MigrationRunner,
    seed_runner: SeedRunner,
}

impl Harness {
    fn new(ids: &[&str]) -> Self {
        let server = MemoryServer::new();
        let up = MemorySourceStore::with_sources(ids.iter().map(|id| (*id, format!("up {};", id))));
        let down =
            MemorySourceStore::with_sources(ids.iter().map(|id| (*id, format!("down {};", id))));
        let seeds = MemorySourceStore::new();

        let mut databases = DatabaseRegistry::databases();
        server.register(&mut databases, "memory").unwrap();
        let mut sources = SourceRegistry::sources();
        up.register(&mut sources, "memory-up").unwrap();
        down.register(&mut sources, "memory-down").unwrap();
        seeds.register(&mut sources, "memory-seeds").unwrap();

        let config = Arc::new(DbkitConfig::parse_toml(CONFIG).unwrap());
        let databases = Arc::new(databases);
        let sources = Arc::new(sources);
        Self {
            migrations: MigrationRunner::new(
                Arc::clone(&config),
                Arc::clone(&databases),
                Arc::clone(&sources),
            ),
            seed_runner: SeedRunner::new(config, databases, sources),
            server,
            up,
            down,
            seeds,
        }
    }

    async fn run(&self, direction: Direction, steps: Option<usize>) -> Result<Vec<String>, DbkitError> {
        self.migrations
            .run(&CancellationToken::new(), direction, steps)
            .await
            .map(|report| report.applied)
    }

    async fn history_ids(&self) -> Vec<String> {
        self.server
            .history()
            .rows()
            .await
            .into_iter()
            .map(|row| row.id)
            .collect()
    }
}

#[tokio::test]
async fn test_up_applies_everything_in_order() {
    let h = Harness::new(&["0001_a", "0002_b", "0003_c"]);

    assert_eq!(
        h.run(Direction::Up, None).await.unwrap(),
        vec!["0001_a", "0002_b", "0003_c"]
    );
    assert_eq!(
        h.server.executed().await,
        vec!["up 0001_a;", "up 0002_b;", "up 0003_c;"]
    );
    let rows = h.server.history().rows().await;
    assert!(rows.iter().all(AppliedMigration::is_clean));
    assert!(h.server.history().schema_ready());

    // Nothing left to do.
    assert!(h.run(Direction::Up, None).await.unwrap().is_empty());
    assert_eq!(h.server.lock_owner().await, None);
}

#[tokio::test]
async fn test_up_then_down_empties_history() {
    let h = Harness::new(&["0001_a", "0002_b", "0003_c"]);
    h.run(Direction::Up, None).await.unwrap();

    assert_eq!(
        h.run(Direction::Down, None).await.unwrap(),
        vec!["0003_c", "0002_b", "0001_a"]
    );
    assert!(h.history_ids().await.is_empty());
    assert_eq!(
        h.server.executed().await[3..],
        ["down 0003_c;", "down 0002_b;", "down 0001_a;"]
    );
    assert!(h.run(Direction::Down, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_steps_limit_the_run() {
    let h = Harness::new(&["0001_a", "0002_b", "0003_c"]);

    assert_eq!(h.run(Direction::Up, Some(2)).await.unwrap(), vec!["0001_a", "0002_b"]);
    assert_eq!(h.history_ids().await, vec!["0001_a", "0002_b"]);

    assert_eq!(h.run(Direction::Down, Some(1)).await.unwrap(), vec!["0002_b"]);
    assert_eq!(h.history_ids().await, vec!["0001_a"]);

    assert_eq!(h.run(Direction::Up, Some(5)).await.unwrap(), vec!["0002_b", "0003_c"]);
}

#[tokio::test]
async fn test_altered_sources_are_refused() {
    for tamper_up in [true, false] {
        let h = Harness::new(&["0001_a", "0002_b"]);
        h.run(Direction::Up, Some(1)).await.unwrap();

        let store = if tamper_up { &h.up } else { &h.down };
        store.overwrite("0001_a", "something else").await.unwrap();

        let err = h.run(Direction::Up, None).await.unwrap_err();
        assert!(err.is_integrity(), "{:?}", err);
        assert!(err.root().to_string().contains("0001_a has been altered"));
        assert_eq!(h.history_ids().await, vec!["0001_a"]);
    }
}

#[tokio::test]
async fn test_unbalanced_sources_fail_before_touching_the_database() {
    let h = Harness::new(&["0001_a"]);
    h.down.remove(&CancellationToken::new(), "0001_a").await.unwrap();

    let err = h.run(Direction::Up, None).await.unwrap_err();
    assert!(err.is_integrity());
    assert!(!h.server.history().schema_ready());
}

#[tokio::test]
async fn test_crashed_up_migration_is_refused() {
    let h = Harness::new(&["0001_a"]);
    h.server
        .history()
        .insert(AppliedMigration::started("0001_a", "x"))
        .await;

    let err = h.run(Direction::Up, None).await.unwrap_err();
    assert!(matches!(err.root(), DbkitError::CorruptedState(_)));
    assert!(h.server.executed().await.is_empty());
}

#[tokio::test]
async fn test_crashed_rollback_is_refused() {
    let h = Harness::new(&["0001_a"]);
    let mut row = AppliedMigration::finished("0001_a", "x");
    row.rollback_started_at = Some(chrono::Utc::now());
    h.server.history().insert(row).await;

    let err = h.run(Direction::Down, None).await.unwrap_err();
    assert!(matches!(err.root(), DbkitError::CorruptedState(_)));
    assert!(err.root().to_string().contains("rollback was started"));
    assert_eq!(h.history_ids().await, vec!["0001_a"]);
}

#[tokio::test]
async fn test_failed_migration_leaves_a_dirty_row() {
    let h = Harness::new(&["0001_a", "0002_b", "0003_c"]);
    h.server.reject_statements_containing("0002_b").await;

    let err = h.run(Direction::Up, None).await.unwrap_err();
    assert!(matches!(err.root(), DbkitError::Database(_)));
    assert!(err.to_string().contains("failed to execute up migration 0002_b"));

    let rows = h.server.history().rows().await;
    assert_eq!(rows.len(), 2);
    assert!(rows[0].is_clean());
    assert!(rows[1].finished_at.is_none());
    assert_eq!(h.server.lock_owner().await, None);

    // The next run refuses to build on the crashed migration.
    let err = h.run(Direction::Up, None).await.unwrap_err();
    assert!(matches!(err.root(), DbkitError::CorruptedState(_)));
}

#[tokio::test]
async fn test_contention_is_reported_not_retried() {
    let h = Harness::new(&["0001_a"]);
    let holder_db = h.server.open();
    let holder = holder_db
        .acquire_connection(&CancellationToken::new())
        .await
        .unwrap();
    let lock = holder
        .try_acquire_lock(&CancellationToken::new())
        .await
        .unwrap();

    let err = h.run(Direction::Up, None).await.unwrap_err();
    assert!(matches!(err.root(), DbkitError::LockHeld));
    assert!(err.is_contention());
    assert!(h.server.executed().await.is_empty());

    // Status takes no lock.
    let status = h
        .migrations
        .status(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(status.pending, vec!["0001_a"]);

    lock.release(&CancellationToken::new()).await.unwrap();
    holder.close().await.unwrap();
    holder_db.close().await.unwrap();
    assert_eq!(h.run(Direction::Up, None).await.unwrap(), vec!["0001_a"]);
}

#[tokio::test]
async fn test_cancelled_run_changes_nothing() {
    let h = Harness::new(&["0001_a"]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .migrations
        .run(&cancel, Direction::Up, None)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(h.history_ids().await.is_empty());
    assert_eq!(h.server.lock_owner().await, None);
}

#[tokio::test]
async fn test_create_and_status() {
    let h = Harness::new(&[]);
    let cancel = CancellationToken::new();

    let id = h.migrations.create(&cancel, "add_users").await.unwrap();
    assert!(id.ends_with("_add_users"));
    // <YYYY-MM-DD_HH-MM-SS>_add_users
    assert_eq!(id.len(), "2024-01-02_03-04-05_add_users".len());
    assert_eq!(h.up.ids().await, vec![id.clone()]);
    assert_eq!(h.down.ids().await, vec![id.clone()]);

    let status = h.migrations.status(&cancel).await.unwrap();
    assert!(status.applied.is_empty());
    assert_eq!(status.pending, vec![id.clone()]);

    h.run(Direction::Up, None).await.unwrap();
    let status = h.migrations.status(&cancel).await.unwrap();
    assert_eq!(status.applied.len(), 1);
    assert!(status.pending.is_empty());
}

#[tokio::test]
async fn test_create_rejects_invalid_names() {
    let h = Harness::new(&[]);
    let err = h
        .migrations
        .create(&CancellationToken::new(), "Add Users")
        .await
        .unwrap_err();
    assert!(matches!(err.root(), DbkitError::InvalidArgument(_)));
    assert!(h.up.ids().await.is_empty());
    assert!(h.down.ids().await.is_empty());
}

#[tokio::test]
async fn test_seeds_run_in_transactions() {
    let h = Harness::new(&[]);
    let cancel = CancellationToken::new();
    for (id, sql) in [("0001_a", "seed a;"), ("0002_b", "seed b FAIL;"), ("0003_c", "seed c;")] {
        h.seeds.create(&cancel, id, sql).await.unwrap();
    }
    h.server.reject_statements_containing("FAIL").await;

    let err = h.seed_runner.run(&cancel).await.unwrap_err();
    assert!(err.to_string().contains("failed to execute seed 0002_b"));
    assert_eq!(h.server.executed().await, vec!["seed a;"]);
    assert_eq!(h.server.lock_owner().await, None);
    // Seeds leave no history behind.
    assert!(h.history_ids().await.is_empty());

    h.seeds.overwrite("0002_b", "seed b;").await.unwrap();
    let ran = h.seed_runner.run(&cancel).await.unwrap();
    assert_eq!(ran, vec!["0001_a", "0002_b", "0003_c"]);
}

#[tokio::test]
async fn test_seed_create() {
    let h = Harness::new(&[]);
    let id = h
        .seed_runner
        .create(&CancellationToken::new(), "demo_data")
        .await
        .unwrap();
    assert!(id.ends_with("_demo_data"));
    assert_eq!(h.seeds.ids().await, vec![id]);
}
