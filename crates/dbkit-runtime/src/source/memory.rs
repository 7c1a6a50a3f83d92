use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dbkit_core::cancel;
use dbkit_core::error::{DbkitError, Result};
use dbkit_core::registry::SourceRegistry;
use dbkit_core::source::{validate_id, Source, SourceContents, Store};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Driver name the in-memory store registers under.
pub const DRIVER_NAME: &str = "memory";

/// An in-process source store.
///
/// Listed sources keep a handle to their entry, so [`overwrite`] is visible
/// to sources that were listed earlier.
///
/// [`overwrite`]: MemorySourceStore::overwrite
#[derive(Default)]
pub struct MemorySourceStore {
    entries: Mutex<BTreeMap<String, Arc<MemoryContents>>>,
    failing_creates: Mutex<HashSet<String>>,
}

impl MemorySourceStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A store pre-populated with `(id, contents)` pairs.
    pub fn with_sources<I, K, V>(sources: I) -> Arc<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entries = sources
            .into_iter()
            .map(|(id, contents)| (id.into(), Arc::new(MemoryContents::new(contents.into()))))
            .collect();
        Arc::new(Self {
            entries: Mutex::new(entries),
            failing_creates: Mutex::new(HashSet::new()),
        })
    }

    /// Replace the contents of an existing source.
    pub async fn overwrite(&self, id: &str, contents: impl Into<String>) -> Result<()> {
        let entries = self.entries.lock().await;
        let entry = entries
            .get(id)
            .ok_or_else(|| DbkitError::NotFound(format!("source '{}'", id)))?;
        *entry.text.write().await = contents.into();
        Ok(())
    }

    /// Make every later `create` of `id` fail.
    pub async fn fail_create_of(&self, id: impl Into<String>) {
        self.failing_creates.lock().await.insert(id.into());
    }

    /// Sorted ids currently stored.
    pub async fn ids(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    /// Register this store as driver `name`; every open returns this store.
    pub fn register(self: &Arc<Self>, registry: &mut SourceRegistry, name: &str) -> Result<()> {
        let store = Arc::clone(self);
        registry.register(name, move |_driver, _global, cancel: CancellationToken| {
            let store = Arc::clone(&store);
            async move {
                cancel::check(&cancel)?;
                Ok::<_, DbkitError>(store as Arc<dyn Store>)
            }
        })
    }
}

#[async_trait]
impl Store for MemorySourceStore {
    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<Source>> {
        cancel::check(cancel)?;
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .map(|(id, contents)| {
                Source::new(id.clone(), Arc::clone(contents) as Arc<dyn SourceContents>)
            })
            .collect())
    }

    async fn create(&self, cancel: &CancellationToken, id: &str, contents: &str) -> Result<()> {
        validate_id(id)?;
        cancel::check(cancel)?;
        if self.failing_creates.lock().await.contains(id) {
            return Err(DbkitError::Source(format!("injected failure creating '{}'", id)));
        }

        let mut entries = self.entries.lock().await;
        if entries.contains_key(id) {
            return Err(DbkitError::AlreadyExists(format!("source '{}'", id)));
        }
        entries.insert(
            id.to_string(),
            Arc::new(MemoryContents::new(contents.to_string())),
        );
        Ok(())
    }

    async fn remove(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        cancel::check(cancel)?;
        self.entries
            .lock()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DbkitError::NotFound(format!("source '{}'", id)))
    }
}

struct MemoryContents {
    text: RwLock<String>,
}

impl MemoryContents {
    fn new(text: String) -> Self {
        Self {
            text: RwLock::new(text),
        }
    }
}

#[async_trait]
impl SourceContents for MemoryContents {
    async fn load(&self, cancel: &CancellationToken) -> Result<String> {
        cancel::check(cancel)?;
        Ok(self.text.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_is_sorted() {
        let store = MemorySourceStore::with_sources([("0002_b", "B"), ("0001_a", "A")]);
        let cancel = CancellationToken::new();
        let sources = store.list(&cancel).await.unwrap();
        let ids: Vec<_> = sources.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["0001_a", "0002_b"]);
    }

    #[tokio::test]
    async fn test_overwrite_is_visible_to_listed_sources() {
        let store = MemorySourceStore::with_sources([("0001_a", "before")]);
        let cancel = CancellationToken::new();
        let sources = store.list(&cancel).await.unwrap();

        store.overwrite("0001_a", "after").await.unwrap();
        assert_eq!(sources[0].contents(&cancel).await.unwrap(), "after");
        assert!(store.overwrite("0002_missing", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_create_remove_and_injected_failure() {
        let store = MemorySourceStore::new();
        let cancel = CancellationToken::new();

        store.create(&cancel, "0001_a", "").await.unwrap();
        assert!(matches!(
            store.create(&cancel, "0001_a", "").await.unwrap_err(),
            DbkitError::AlreadyExists(_)
        ));

        store.fail_create_of("0002_b").await;
        assert!(matches!(
            store.create(&cancel, "0002_b", "").await.unwrap_err(),
            DbkitError::Source(_)
        ));
        assert_eq!(store.ids().await, vec!["0001_a"]);

        store.remove(&cancel, "0001_a").await.unwrap();
        assert!(matches!(
            store.remove(&cancel, "0001_a").await.unwrap_err(),
            DbkitError::NotFound(_)
        ));
    }
}
