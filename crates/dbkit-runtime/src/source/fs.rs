use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dbkit_core::cancel;
use dbkit_core::config::{DriverConfig, GlobalConfig};
use dbkit_core::error::{DbkitError, Result, ResultExt};
use dbkit_core::registry::SourceRegistry;
use dbkit_core::source::{validate_id, Source, SourceContents, Store};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Driver name the filesystem store registers under.
pub const DRIVER_NAME: &str = "fs";

const EXTENSION: &str = "sql";

/// A directory of `<id>.sql` files.
#[derive(Debug, Clone)]
pub struct FsStore {
    dir: PathBuf,
}

impl FsStore {
    /// Use `dir`, which must be an existing directory.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let metadata = tokio::fs::metadata(&dir).await.map_err(|e| {
            DbkitError::Config(format!(
                "source directory {} is not accessible: {}",
                dir.display(),
                e
            ))
        })?;
        if !metadata.is_dir() {
            return Err(DbkitError::Config(format!(
                "source path {} is not a directory",
                dir.display()
            )));
        }
        Ok(Self { dir })
    }

    /// Factory used by the driver registry. `dir` resolves against the
    /// configuration file's directory.
    pub async fn open(
        driver: DriverConfig,
        global: GlobalConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn Store>> {
        cancel::check(&cancel)?;
        let dir = global.base_dir.join(driver.string("dir")?);
        Ok(Arc::new(Self::new(dir).await?))
    }

    pub fn register(registry: &mut SourceRegistry) -> Result<()> {
        registry.register(DRIVER_NAME, Self::open)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, EXTENSION))
    }

    async fn write_temp(&self, path: &Path, contents: &str) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl Store for FsStore {
    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<Source>> {
        cancel::check(cancel)?;
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to read {}", self.dir.display()))?;

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            cancel::check(cancel)?;
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        ids.dedup();

        Ok(ids
            .into_iter()
            .map(|id| {
                let contents = Arc::new(FileContents {
                    path: self.path_of(&id),
                });
                Source::new(id, contents)
            })
            .collect())
    }

    async fn create(&self, cancel: &CancellationToken, id: &str, contents: &str) -> Result<()> {
        validate_id(id)?;
        cancel::check(cancel)?;

        let target = self.path_of(id);
        if tokio::fs::try_exists(&target).await? {
            return Err(DbkitError::AlreadyExists(format!("source '{}'", id)));
        }

        // Hidden and without the .sql extension, so listings never pick it up.
        let temp = self
            .dir
            .join(format!(".{}.{}.tmp", id, uuid::Uuid::new_v4().simple()));
        let published = match self.write_temp(&temp, contents).await {
            Ok(()) => tokio::fs::hard_link(&temp, &target).await.map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    DbkitError::AlreadyExists(format!("source '{}'", id))
                } else {
                    DbkitError::Io(e)
                }
            }),
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_file(&temp).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %temp.display(), error = %e, "Failed to remove temporary file");
            }
        }

        published?;
        debug!(path = %target.display(), "Source created");
        Ok(())
    }

    async fn remove(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        validate_id(id)?;
        cancel::check(cancel)?;
        match tokio::fs::remove_file(self.path_of(id)).await {
            Ok(()) => {
                debug!(id, "Source removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(DbkitError::NotFound(format!("source '{}'", id)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct FileContents {
    path: PathBuf,
}

#[async_trait]
impl SourceContents for FileContents {
    async fn load(&self, cancel: &CancellationToken) -> Result<String> {
        cancel::run_until_cancelled(cancel, async {
            tokio::fs::read_to_string(&self.path)
                .await
                .with_context(|| format!("failed to read {}", self.path.display()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, FsStore) {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_requires_existing_directory() {
        let dir = TempDir::new().unwrap();
        let err = FsStore::new(dir.path().join("missing")).await.unwrap_err();
        assert!(matches!(err, DbkitError::Config(_)));

        std::fs::write(dir.path().join("file.sql"), "").unwrap();
        let err = FsStore::new(dir.path().join("file.sql")).await.unwrap_err();
        assert!(matches!(err, DbkitError::Config(_)));
    }

    #[tokio::test]
    async fn test_list_only_sql_files_sorted() {
        let (dir, store) = store().await;
        std::fs::write(dir.path().join("0002_b.sql"), "B").unwrap();
        std::fs::write(dir.path().join("0001_a.sql"), "A").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::create_dir(dir.path().join("0003_dir.sql")).unwrap();

        let cancel = CancellationToken::new();
        let sources = store.list(&cancel).await.unwrap();
        let ids: Vec<_> = sources.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["0001_a", "0002_b"]);
        assert_eq!(sources[1].contents(&cancel).await.unwrap(), "B");
    }

    #[tokio::test]
    async fn test_contents_are_read_lazily() {
        let (dir, store) = store().await;
        let cancel = CancellationToken::new();
        store.create(&cancel, "0001_a", "before").await.unwrap();

        let sources = store.list(&cancel).await.unwrap();
        std::fs::write(dir.path().join("0001_a.sql"), "after").unwrap();
        assert_eq!(sources[0].contents(&cancel).await.unwrap(), "after");
    }

    #[tokio::test]
    async fn test_create_and_remove() {
        let (dir, store) = store().await;
        let cancel = CancellationToken::new();

        store.create(&cancel, "0001_a", "SELECT 1;").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("0001_a.sql")).unwrap(),
            "SELECT 1;"
        );

        let err = store.create(&cancel, "0001_a", "again").await.unwrap_err();
        assert!(matches!(err, DbkitError::AlreadyExists(_)));

        store.remove(&cancel, "0001_a").await.unwrap();
        assert!(store.list(&cancel).await.unwrap().is_empty());

        let err = store.remove(&cancel, "0001_a").await.unwrap_err();
        assert!(matches!(err, DbkitError::NotFound(_)));

        // No temporary files are left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_ids() {
        let (_dir, store) = store().await;
        let cancel = CancellationToken::new();
        for id in ["", "Upper", "../escape", "semi;colon"] {
            let err = store.create(&cancel, id, "").await.unwrap_err();
            assert!(matches!(err, DbkitError::InvalidArgument(_)), "{}", id);
        }
    }

    #[tokio::test]
    async fn test_open_resolves_against_base_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("up")).unwrap();
        let global = GlobalConfig {
            base_dir: dir.path().to_path_buf(),
        };

        let mut registry = SourceRegistry::sources();
        FsStore::register(&mut registry).unwrap();
        let store = registry
            .open(
                &CancellationToken::new(),
                &DriverConfig::new("fs").with("dir", "up"),
                &global,
            )
            .await
            .unwrap();
        store
            .create(&CancellationToken::new(), "0001_a", "")
            .await
            .unwrap();
        assert!(dir.path().join("up/0001_a.sql").exists());
    }
}
