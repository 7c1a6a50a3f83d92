use std::sync::Arc;
use std::time::Duration;

use dbkit_core::cancel;
use dbkit_core::driver::AppliedMigration;
use dbkit_core::error::{DbkitError, Result};
use dbkit_core::source::{validate_id, Store};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::jobs::CreateMigrationJob;
use super::source::MigrationSource;
use super::Direction;
use crate::jobs::run_jobs_atomically;

const DEFAULT_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Applied history next to what is still waiting to run.
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub applied: Vec<AppliedMigration>,
    /// Ids not yet applied, in the order they would run.
    pub pending: Vec<String>,
}

/// Up and down stores viewed as one list of migration pairs.
pub struct MigrationSourceStore {
    up: Arc<dyn Store>,
    down: Arc<dyn Store>,
    rollback_timeout: Duration,
}

impl MigrationSourceStore {
    /// Wrap two stores, failing if they do not pair up.
    pub async fn new(
        cancel: &CancellationToken,
        up: Arc<dyn Store>,
        down: Arc<dyn Store>,
    ) -> Result<Self> {
        let store = Self {
            up,
            down,
            rollback_timeout: DEFAULT_ROLLBACK_TIMEOUT,
        };
        store.list(cancel).await?;
        Ok(store)
    }

    /// Deadline for removing half-created pairs after a failed create.
    pub fn with_rollback_timeout(mut self, timeout: Duration) -> Self {
        self.rollback_timeout = timeout;
        self
    }

    /// All pairs in id order.
    pub async fn list(&self, cancel: &CancellationToken) -> Result<Vec<MigrationSource>> {
        let up = self.up.list(cancel).await?;
        let down = self.down.list(cancel).await?;

        if up.len() != down.len() {
            return Err(DbkitError::Integrity(format!(
                "migration stores corrupted: up store contains {} source(s) and down store contains {} source(s)",
                up.len(),
                down.len()
            )));
        }

        up.into_iter()
            .zip(down)
            .enumerate()
            .map(|(index, (up, down))| {
                MigrationSource::new(up, down).map_err(|e| {
                    DbkitError::Integrity(format!(
                        "migration source at index {} is corrupted: {}",
                        index, e
                    ))
                })
            })
            .collect()
    }

    /// Migrations to run in `direction` given the applied history.
    ///
    /// Applied rows must match the leading sources one for one. Up returns
    /// the sources after that prefix; down returns the prefix, newest first.
    pub async fn pending(
        &self,
        cancel: &CancellationToken,
        applied: &[AppliedMigration],
        direction: Direction,
    ) -> Result<Vec<MigrationSource>> {
        let sources = self.list(cancel).await?;
        validate_prefix(cancel, &sources, applied).await?;

        let pending = match direction {
            Direction::Up => sources.into_iter().skip(applied.len()).collect(),
            Direction::Down => {
                let mut rollbacks: Vec<_> = sources.into_iter().take(applied.len()).collect();
                rollbacks.reverse();
                rollbacks
            }
        };
        Ok(pending)
    }

    /// Applied rows and the ids still waiting to go up.
    pub async fn status(
        &self,
        cancel: &CancellationToken,
        applied: Vec<AppliedMigration>,
    ) -> Result<MigrationStatus> {
        let pending = self
            .pending(cancel, &applied, Direction::Up)
            .await?
            .iter()
            .map(|source| source.id().to_string())
            .collect();
        Ok(MigrationStatus { applied, pending })
    }

    /// Create both sides of a migration, or neither.
    ///
    /// Cleanup after a partial failure runs under its own deadline, so it
    /// still happens when `cancel` is what caused the failure.
    pub async fn create(&self, cancel: &CancellationToken, id: &str, contents: &str) -> Result<()> {
        cancel::check(cancel)?;
        validate_id(id)?;
        let jobs = [
            Arc::new(CreateMigrationJob::new(Arc::clone(&self.up), "up", id, contents)),
            Arc::new(CreateMigrationJob::new(Arc::clone(&self.down), "down", id, contents)),
        ];

        let rollback_cancel = cancel::detached_deadline(self.rollback_timeout);
        let result = run_jobs_atomically(cancel, &rollback_cancel, &jobs, jobs.len()).await;
        rollback_cancel.cancel();

        result?;
        debug!(id, "Migration pair created");
        Ok(())
    }
}

async fn validate_prefix(
    cancel: &CancellationToken,
    sources: &[MigrationSource],
    applied: &[AppliedMigration],
) -> Result<()> {
    if let Some(orphan) = applied.get(sources.len()) {
        return Err(DbkitError::Integrity(format!(
            "applied migration {} has no matching source ({} applied, {} source(s))",
            orphan.id,
            applied.len(),
            sources.len()
        )));
    }
    for (source, row) in sources.iter().zip(applied) {
        source.validate_application(cancel, row).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySourceStore;

    fn pair(ids: &[&str]) -> (Arc<MemorySourceStore>, Arc<MemorySourceStore>) {
        let up = MemorySourceStore::with_sources(ids.iter().map(|id| (*id, format!("up {}", id))));
        let down =
            MemorySourceStore::with_sources(ids.iter().map(|id| (*id, format!("down {}", id))));
        (up, down)
    }

    async fn applied_rows(store: &MigrationSourceStore, count: usize) -> Vec<AppliedMigration> {
        let cancel = CancellationToken::new();
        let mut rows = Vec::new();
        for source in store.list(&cancel).await.unwrap().into_iter().take(count) {
            let contents = source.contents(&cancel).await.unwrap();
            rows.push(AppliedMigration::finished(source.id(), contents.checksum));
        }
        rows
    }

    fn ids(sources: &[MigrationSource]) -> Vec<&str> {
        sources.iter().map(|s| s.id()).collect()
    }

    #[tokio::test]
    async fn test_construction_rejects_unbalanced_stores() {
        let up = MemorySourceStore::with_sources([("0001_a", ""), ("0002_b", "")]);
        let down = MemorySourceStore::with_sources([("0001_a", "")]);
        let err = MigrationSourceStore::new(&CancellationToken::new(), up, down)
            .await
            .err()
            .unwrap();
        assert!(err.is_integrity());
        assert!(err.to_string().contains("2 source(s)"));
    }

    #[tokio::test]
    async fn test_construction_rejects_mismatched_ids() {
        let up = MemorySourceStore::with_sources([("0001_a", "")]);
        let down = MemorySourceStore::with_sources([("0001_b", "")]);
        let err = MigrationSourceStore::new(&CancellationToken::new(), up, down)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("index 0"));
    }

    #[tokio::test]
    async fn test_pending_up_and_down() {
        let cancel = CancellationToken::new();
        let (up, down) = pair(&["0001_a", "0002_b", "0003_c"]);
        let store = MigrationSourceStore::new(&cancel, up, down).await.unwrap();

        let pending = store.pending(&cancel, &[], Direction::Up).await.unwrap();
        assert_eq!(ids(&pending), vec!["0001_a", "0002_b", "0003_c"]);
        assert!(store
            .pending(&cancel, &[], Direction::Down)
            .await
            .unwrap()
            .is_empty());

        let applied = applied_rows(&store, 2).await;
        let pending = store.pending(&cancel, &applied, Direction::Up).await.unwrap();
        assert_eq!(ids(&pending), vec!["0003_c"]);
        let pending = store
            .pending(&cancel, &applied, Direction::Down)
            .await
            .unwrap();
        assert_eq!(ids(&pending), vec!["0002_b", "0001_a"]);
    }

    #[tokio::test]
    async fn test_pending_detects_tampering() {
        let cancel = CancellationToken::new();
        let (up, down) = pair(&["0001_a", "0002_b"]);
        let store = MigrationSourceStore::new(&cancel, up.clone(), down.clone())
            .await
            .unwrap();
        let applied = applied_rows(&store, 1).await;

        down.overwrite("0001_a", "DROP EVERYTHING").await.unwrap();
        let err = store
            .pending(&cancel, &applied, Direction::Up)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("0001_a has been altered"));
    }

    #[tokio::test]
    async fn test_pending_detects_deleted_sources() {
        let cancel = CancellationToken::new();
        let (up, down) = pair(&["0001_a", "0002_b"]);
        let store = MigrationSourceStore::new(&cancel, up.clone(), down.clone())
            .await
            .unwrap();
        let applied = applied_rows(&store, 2).await;

        up.remove(&cancel, "0002_b").await.unwrap();
        down.remove(&cancel, "0002_b").await.unwrap();
        let err = store
            .pending(&cancel, &applied, Direction::Down)
            .await
            .unwrap_err();
        assert!(err.is_integrity());
        assert!(err.to_string().contains("0002_b"));
    }

    #[tokio::test]
    async fn test_status() {
        let cancel = CancellationToken::new();
        let (up, down) = pair(&["0001_a", "0002_b"]);
        let store = MigrationSourceStore::new(&cancel, up, down).await.unwrap();
        let applied = applied_rows(&store, 1).await;

        let status = store.status(&cancel, applied).await.unwrap();
        assert_eq!(status.applied.len(), 1);
        assert_eq!(status.pending, vec!["0002_b"]);
    }

    #[tokio::test]
    async fn test_create_writes_both_sides() {
        let cancel = CancellationToken::new();
        let (up, down) = pair(&[]);
        let store = MigrationSourceStore::new(&cancel, up.clone(), down.clone())
            .await
            .unwrap();

        store.create(&cancel, "0001_a", "").await.unwrap();
        assert_eq!(up.ids().await, vec!["0001_a"]);
        assert_eq!(down.ids().await, vec!["0001_a"]);
    }

    #[tokio::test]
    async fn test_create_is_atomic() {
        let cancel = CancellationToken::new();
        let (up, down) = pair(&[]);
        down.fail_create_of("0001_a").await;
        let store = MigrationSourceStore::new(&cancel, up.clone(), down.clone())
            .await
            .unwrap();

        let err = store.create(&cancel, "0001_a", "").await.unwrap_err();
        assert!(matches!(err, DbkitError::Job(_)));
        assert!(up.ids().await.is_empty());
        assert!(down.ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_id_before_writing() {
        let cancel = CancellationToken::new();
        let (up, down) = pair(&[]);
        let store = MigrationSourceStore::new(&cancel, up.clone(), down.clone())
            .await
            .unwrap();

        let err = store.create(&cancel, "Add Users", "").await.unwrap_err();
        assert!(matches!(err, DbkitError::InvalidArgument(_)), "{:?}", err);
        assert!(up.ids().await.is_empty());
        assert!(down.ids().await.is_empty());
    }
}
